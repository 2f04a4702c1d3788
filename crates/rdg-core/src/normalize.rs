//! Column naming and value normalization applied to every fetched table.

use unicode_normalization::UnicodeNormalization;

use crate::table::{Cell, Table, NULL_MARKER};

const TURKISH_REPLACEMENTS: [(char, &str); 12] = [
    ('ç', "c"),
    ('Ç', "C"),
    ('ğ', "g"),
    ('Ğ', "G"),
    ('ı', "i"),
    ('İ', "I"),
    ('ö', "o"),
    ('Ö', "O"),
    ('ş', "s"),
    ('Ş', "S"),
    ('ü', "u"),
    ('Ü', "U"),
];

/// Substrings of a simplified column name that mark an agency/entity code column.
const AGENCY_COLUMN_HINTS: [&str; 2] = ["agency", "acente"];

/// Simplified names of columns that hold the code itself, preferred over other agency columns.
const AGENCY_CODE_COLUMNS: [&str; 4] = ["agencycode", "acentekodu", "agencyid", "acenteid"];

const REFRESH_TIME_COLUMN: &str = "datarefreshtime";

pub fn replace_turkish_characters(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match TURKISH_REPLACEMENTS.iter().find(|(src, _)| *src == ch) {
            Some((_, dst)) => out.push_str(dst),
            None => out.push(ch),
        }
    }
    out
}

/// ASCII alphanumeric, not starting with an uppercase letter, with at least one uppercase letter.
pub fn is_lower_camel_case(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() && !first.is_ascii_uppercase() => {}
        _ => return false,
    }
    value.chars().all(|c| c.is_ascii_alphanumeric()) && chars.any(|c| c.is_ascii_uppercase())
}

/// Transliterates to ASCII and joins the alphanumeric runs as lowerCamelCase.
///
/// Names without any alphanumeric run are returned unchanged.
pub fn to_ascii_camel(value: &str) -> String {
    let ascii: String = replace_turkish_characters(value)
        .nfkd()
        .filter(char::is_ascii)
        .collect();
    let parts: Vec<&str> = ascii
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect();

    let Some((head, tail)) = parts.split_first() else {
        return value.to_string();
    };

    let mut out = head.to_ascii_lowercase();
    for fragment in tail {
        out.push_str(&title_case(fragment));
    }
    out
}

// Uppercases the first letter of every letter run, lowercases the rest.
fn title_case(fragment: &str) -> String {
    let mut out = String::with_capacity(fragment.len());
    let mut previous_is_letter = false;
    for ch in fragment.chars() {
        if ch.is_ascii_alphabetic() {
            if previous_is_letter {
                out.push(ch.to_ascii_lowercase());
            } else {
                out.push(ch.to_ascii_uppercase());
            }
            previous_is_letter = true;
        } else {
            out.push(ch);
            previous_is_letter = false;
        }
    }
    out
}

pub fn normalize_column_name(name: &str) -> String {
    if is_lower_camel_case(name) {
        name.to_string()
    } else {
        to_ascii_camel(name)
    }
}

/// Lowercased letters only, the form column-name hints are matched against.
pub fn simplify(name: &str) -> String {
    name.chars()
        .filter(char::is_ascii_alphabetic)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

pub fn is_agency_column(name: &str) -> bool {
    let simplified = simplify(name);
    AGENCY_COLUMN_HINTS
        .iter()
        .any(|hint| simplified.contains(hint))
}

/// Index of the column holding the agency code: an exact code/id column when
/// there is one, otherwise the first agency-like column.
pub fn agency_column_position<S: AsRef<str>>(names: &[S]) -> Option<usize> {
    names
        .iter()
        .position(|name| AGENCY_CODE_COLUMNS.contains(&simplify(name.as_ref()).as_str()))
        .or_else(|| names.iter().position(|name| is_agency_column(name.as_ref())))
}

pub fn agency_column(table: &Table) -> Option<usize> {
    agency_column_position(&table.columns)
}

/// Canonical string form of an entity code: integral numbers lose their `.0`.
pub fn canonical_code(cell: &Cell) -> Option<String> {
    match cell {
        Cell::Null => None,
        Cell::Float(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => Some(format!("{}", *f as i64)),
        Cell::Text(s) => Some(s.clone()),
        other => Some(other.display_string()),
    }
}

fn normalize_agency_columns(table: &mut Table) {
    let agency_columns: Vec<usize> = table
        .columns
        .iter()
        .enumerate()
        .filter(|(_, name)| is_agency_column(name))
        .map(|(idx, _)| idx)
        .collect();

    for row in &mut table.rows {
        for &idx in &agency_columns {
            if let Some(cell) = row.get_mut(idx) {
                if let Some(code) = canonical_code(cell) {
                    *cell = Cell::Text(code);
                }
            }
        }
    }
}

/// Drops every refresh-time pseudo column and returns the first value found.
fn extract_refresh_time(table: &mut Table) -> Option<String> {
    let mut refresh_time = None;
    while let Some(idx) = table
        .columns
        .iter()
        .position(|c| simplify(c) == REFRESH_TIME_COLUMN)
    {
        let values = table.drop_column(idx);
        if refresh_time.is_none() {
            refresh_time = values
                .first()
                .filter(|cell| !cell.is_null())
                .map(Cell::display_string)
                .filter(|s| !s.trim().is_empty() && s != NULL_MARKER);
        }
    }
    refresh_time
}

/// Renames columns, canonicalizes agency codes and pulls out the refresh time.
///
/// Applying it to its own output changes nothing.
pub fn normalize(mut table: Table) -> (Table, Option<String>) {
    table.columns = table
        .columns
        .iter()
        .map(|c| normalize_column_name(c))
        .collect();
    normalize_agency_columns(&mut table);
    let refresh_time = extract_refresh_time(&mut table);
    (table, refresh_time)
}
