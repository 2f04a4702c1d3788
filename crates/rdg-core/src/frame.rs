//! In-memory scoping, filtering and pagination over a full cached table.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::Serialize;
use tracing::warn;

use crate::normalize::{agency_column, canonical_code};
use crate::table::{Cell, Table};

/// Columns that accept `<column>_beg_date` / `<column>_end_date` range filters.
pub const DATE_RANGE_COLUMNS: [&str; 24] = [
    "policeOnayTarih",
    "policeBaslangicTarihi",
    "policeBitisTarihi",
    "teklifGecerlilikBitisTarih",
    "policeVadeBaslangic",
    "policeVadeBitis",
    "ihbarTarihi",
    "hasarTarihi",
    "acenteKurulusTarihi",
    "confirmDate",
    "polBegDate",
    "polEndDate",
    "begDate",
    "endDate",
    "propValidBegDate",
    "propValidEndDate",
    "policeTanzimTarihi",
    "girisTarihi",
    "sonKullanmaTarihi",
    "vadeTarihi",
    "kapanisTarihi",
    "enSonMuallakTarihi",
    "policeBaslangic",
    "policeBitis",
];

const BEG_SUFFIX: &str = "_beg_date";
const END_SUFFIX: &str = "_end_date";

const DATETIME_FALLBACKS: [&str; 7] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %I:%M:%S %p",
    "%d.%m.%Y %H:%M:%S",
];

const DATE_FALLBACKS: [&str; 4] = ["%Y-%m-%d", "%d.%m.%Y", "%Y/%m/%d", "%d/%m/%Y"];

/// `MM/DD/YYYY` first, then a handful of common layouts. `None` when nothing fits.
pub fn parse_date_permissive(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%m/%d/%Y") {
        return date.and_hms_opt(0, 0, 0);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    for format in DATETIME_FALLBACKS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(dt);
        }
    }
    DATE_FALLBACKS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(raw, format).ok())
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

fn cell_datetime(cell: &Cell) -> Option<NaiveDateTime> {
    match cell {
        Cell::DateTime(dt) => Some(*dt),
        Cell::Text(s) => parse_date_permissive(s),
        _ => None,
    }
}

/// Keeps rows whose agency column equals `code`. Tables without one are left as is.
pub fn scope_by_entity(table: &mut Table, code: &str) -> bool {
    let Some(idx) = agency_column(table) else {
        return false;
    };
    let target = code.trim();
    table.retain_rows(|row| {
        row.get(idx)
            .and_then(canonical_code)
            .is_some_and(|value| value == target)
    });
    true
}

fn cell_matches(cell: &Cell, wanted: &str) -> bool {
    if let (Some(actual), Ok(expected)) = (
        match cell {
            Cell::Int(_) | Cell::Float(_) => cell.as_f64(),
            _ => None,
        },
        wanted.trim().parse::<f64>(),
    ) {
        return actual == expected;
    }
    cell.display_string().eq_ignore_ascii_case(wanted.trim())
}

/// Applies request filters to a full table.
///
/// Keys match columns case-insensitively. `<date column>_beg_date` and
/// `_end_date` pairs filter inclusively on parsed dates, dropping bounds that
/// do not parse. Keys without a matching column are logged and ignored.
/// Returns the keys that were ignored.
pub fn apply_filters(
    table: &mut Table,
    filters: &BTreeMap<String, String>,
    extra_date_columns: &[String],
) -> Vec<String> {
    let filters: BTreeMap<String, &str> = filters
        .iter()
        .filter(|(_, value)| !value.trim().is_empty())
        .map(|(key, value)| (key.to_ascii_lowercase(), value.as_str()))
        .collect();
    let mut ignored = Vec::new();
    let mut consumed = Vec::new();

    let date_columns = DATE_RANGE_COLUMNS
        .iter()
        .map(|c| c.to_string())
        .chain(extra_date_columns.iter().cloned());

    for column in date_columns {
        let lower = column.to_ascii_lowercase();
        let beg_key = format!("{lower}{BEG_SUFFIX}");
        let end_key = format!("{lower}{END_SUFFIX}");
        let beg = filters.get(&beg_key).copied();
        let end = filters.get(&end_key).copied();
        if beg.is_none() && end.is_none() {
            continue;
        }
        consumed.extend([beg_key.clone(), end_key.clone()]);

        let Some(idx) = table.column_index_ci(&column) else {
            ignored.extend(beg.map(|_| beg_key).into_iter().chain(end.map(|_| end_key)));
            continue;
        };
        let start = beg.and_then(parse_date_permissive);
        let stop = end.and_then(parse_date_permissive);
        if start.is_none() && stop.is_none() {
            continue;
        }
        table.retain_rows(|row| {
            let Some(value) = row.get(idx).and_then(cell_datetime) else {
                return false;
            };
            start.map_or(true, |s| value >= s) && stop.map_or(true, |e| value <= e)
        });
    }

    for (key, wanted) in &filters {
        if consumed.contains(key) {
            continue;
        }
        match table.column_index_ci(key) {
            Some(idx) => table.retain_rows(|row| row.get(idx).is_some_and(|c| cell_matches(c, wanted))),
            None => ignored.push(key.clone()),
        }
    }

    if !ignored.is_empty() {
        warn!(keys = ?ignored, "ignoring filters that match no column");
    }
    ignored
}

/// Paging numbers reported back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageInfo {
    pub page: usize,
    pub page_size: usize,
    pub total_rows: usize,
    pub total_pages: usize,
}

impl PageInfo {
    /// Clamps `page < 1` to 1 and treats `page_size <= 0` as a single page holding everything.
    pub fn new(page: i64, page_size: i64, total_rows: usize) -> Self {
        let page = usize::try_from(page.max(1)).unwrap_or(1);
        let page_size = if page_size <= 0 {
            total_rows.max(1)
        } else {
            usize::try_from(page_size).unwrap_or(usize::MAX)
        };
        Self {
            page,
            page_size,
            total_rows,
            total_pages: total_rows.div_ceil(page_size),
        }
    }

    pub fn offset(&self) -> usize {
        (self.page - 1).saturating_mul(self.page_size)
    }
}

/// Slices one page out of a full table. Pages past the end are empty.
pub fn paginate(table: &Table, page: i64, page_size: i64) -> (Table, PageInfo) {
    let info = PageInfo::new(page, page_size, table.len());
    (table.slice(info.offset(), info.page_size), info)
}
