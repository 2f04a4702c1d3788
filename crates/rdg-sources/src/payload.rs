//! Exported CSV payloads: byte decoding, parsing into a [`Table`], total-row stripping.

use encoding_rs::{Encoding, UTF_16BE, UTF_16LE, WINDOWS_1252};
use rdg_core::normalize::simplify;
use rdg_core::{Cell, SourceError, Table};
use tracing::debug;

const SNIFF_LEN: usize = 512;
const DESCRIPTION_HINTS: [&str; 2] = ["description", "aciklama"];
const TOTAL_PREFIXES: [&str; 2] = ["total", "toplam"];

/// Decodes an export body: UTF-16 (BOM or byte-pattern sniff), then UTF-8,
/// Windows-1252 and finally ISO-8859-1.
pub fn decode_payload(bytes: &[u8]) -> Result<String, SourceError> {
    if bytes.is_empty() {
        return Ok(String::new());
    }

    let mut attempts: Vec<&'static Encoding> = Vec::with_capacity(4);
    match bytes {
        [0xFF, 0xFE, ..] => attempts.push(UTF_16LE),
        [0xFE, 0xFF, ..] => attempts.push(UTF_16BE),
        [0xEF, 0xBB, 0xBF, ..] => {}
        _ => {
            if let Some(encoding) = sniff_utf16(bytes) {
                attempts.push(encoding);
            }
        }
    }

    for encoding in attempts {
        let (body, _) = strip_bom(bytes);
        if let Some(text) = encoding.decode_without_bom_handling_and_without_replacement(body) {
            debug!(encoding = encoding.name(), "decoded export payload");
            return Ok(text.trim_start_matches('\u{feff}').to_string());
        }
    }

    let (body, _) = strip_bom(bytes);
    if let Ok(text) = std::str::from_utf8(body) {
        return Ok(text.to_string());
    }
    if let Some(text) = WINDOWS_1252.decode_without_bom_handling_and_without_replacement(body) {
        debug!("decoded export payload as windows-1252");
        return Ok(text.into_owned());
    }
    // latin-1 maps every byte straight onto the first 256 code points
    Ok(body.iter().map(|&b| char::from(b)).collect())
}

fn strip_bom(bytes: &[u8]) -> (&[u8], bool) {
    match bytes {
        [0xFF, 0xFE, rest @ ..] | [0xFE, 0xFF, rest @ ..] => (rest, true),
        [0xEF, 0xBB, 0xBF, rest @ ..] => (rest, true),
        _ => (bytes, false),
    }
}

/// BOM-less UTF-16 shows up as a zero byte in every other position for ASCII text.
fn sniff_utf16(bytes: &[u8]) -> Option<&'static Encoding> {
    let sample = &bytes[..bytes.len().min(SNIFF_LEN)];
    if sample.len() < 2 || bytes.len() % 2 != 0 {
        return None;
    }
    let pairs = sample.len() / 2;
    let zeros_even = sample.iter().step_by(2).filter(|&&b| b == 0).count();
    let zeros_odd = sample.iter().skip(1).step_by(2).filter(|&&b| b == 0).count();
    if zeros_odd * 2 > pairs && zeros_even * 4 < pairs {
        Some(UTF_16LE)
    } else if zeros_even * 2 > pairs && zeros_odd * 4 < pairs {
        Some(UTF_16BE)
    } else {
        None
    }
}

/// Parses CSV text with a header row; cell types are inferred per value.
pub fn parse_csv(text: &str) -> Result<Table, SourceError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());
    let columns: Vec<String> = reader
        .headers()
        .map_err(|err| SourceError::Decode(err.to_string()))?
        .iter()
        .map(|header| header.trim().to_string())
        .collect();

    let mut table = Table::new(columns);
    let width = table.columns.len();
    for record in reader.records() {
        let record = record.map_err(|err| SourceError::Decode(err.to_string()))?;
        let mut row: Vec<Cell> = record.iter().take(width).map(Cell::infer).collect();
        row.resize(width, Cell::Null);
        table.rows.push(row);
    }
    Ok(table)
}

/// Drops subtotal and grand-total rows: a null first column, or a description
/// that starts with "Total". Returns how many rows were removed.
pub fn strip_total_rows(table: &mut Table) -> usize {
    if table.columns.is_empty() {
        return 0;
    }
    let description = table
        .columns
        .iter()
        .position(|column| {
            let simplified = simplify(column);
            DESCRIPTION_HINTS.iter().any(|hint| simplified.contains(hint))
        })
        .unwrap_or(0);

    let before = table.len();
    table.retain_rows(|row| {
        let key_missing = row.first().map_or(true, Cell::is_null);
        let labelled_total = match row.get(description) {
            Some(Cell::Text(text)) => {
                let lowered = text.trim_start().to_lowercase();
                TOTAL_PREFIXES.iter().any(|prefix| lowered.starts_with(prefix))
            }
            _ => false,
        };
        !key_missing && !labelled_total
    });
    before - table.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf16le(text: &str, bom: bool) -> Vec<u8> {
        let mut out = if bom { vec![0xFF, 0xFE] } else { Vec::new() };
        for unit in text.encode_utf16() {
            out.extend_from_slice(&unit.to_le_bytes());
        }
        out
    }

    #[test]
    fn utf16_with_and_without_bom() {
        let text = "Acente,Tutar\nİstanbul,12\n";
        assert_eq!(decode_payload(&utf16le(text, true)).unwrap(), text);
        assert_eq!(decode_payload(&utf16le(text, false)).unwrap(), text);
    }

    #[test]
    fn falls_back_through_single_byte_encodings() {
        assert_eq!(decode_payload("a,b\n1,2\n".as_bytes()).unwrap(), "a,b\n1,2\n");
        assert_eq!(decode_payload(&[0xEF, 0xBB, 0xBF, b'x']).unwrap(), "x");
        // 0x80 is the euro sign in windows-1252 and invalid as utf-8
        assert_eq!(decode_payload(&[b'p', 0x80]).unwrap(), "p\u{20ac}");
        assert_eq!(decode_payload(&[]).unwrap(), "");
    }

    #[test]
    fn csv_rows_are_padded_and_typed() {
        let table = parse_csv("code,name,amount\n7,\"Ankara, TR\",1.5\n8,Izmir\n").unwrap();
        assert_eq!(table.columns, vec!["code", "name", "amount"]);
        assert_eq!(table.rows[0], vec![Cell::Int(7), Cell::text("Ankara, TR"), Cell::Float(1.5)]);
        assert_eq!(table.rows[1][2], Cell::Null);
    }

    #[test]
    fn total_rows_are_removed() {
        let mut table = parse_csv(
            "Agency,Description,Amount\n1,Sales,10\n2,Total Sales,30\n,,40\n3,Returns,5\n",
        )
        .unwrap();
        assert_eq!(strip_total_rows(&mut table), 2);
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows[1][1], Cell::text("Returns"));
    }
}
