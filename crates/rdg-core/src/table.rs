//! Column-ordered tabular data shared by connectors, the cache and the read path.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Rendering used for null and NaN cells in JSON output.
pub const NULL_MARKER: &str = "NULL";

pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Text a CSV reader treats as a missing value.
const NA_TOKENS: [&str; 10] = [
    "", "NULL", "null", "NaN", "nan", "NA", "N/A", "n/a", "#N/A", "None",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    DateTime(NaiveDateTime),
}

impl Cell {
    /// Builds a float cell, folding NaN and infinities into `Null`.
    pub fn float(value: f64) -> Self {
        if value.is_finite() {
            Self::Float(value)
        } else {
            Self::Null
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// Infers a cell from raw CSV text the way a dataframe reader would.
    pub fn infer(raw: &str) -> Self {
        let trimmed = raw.trim();
        if NA_TOKENS.contains(&trimmed) {
            return Self::Null;
        }
        if let Ok(int) = trimmed.parse::<i64>() {
            return Self::Int(int);
        }
        let numeric_shape = trimmed
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
            && trimmed.chars().any(|c| c.is_ascii_digit());
        if numeric_shape {
            if let Ok(float) = trimmed.parse::<f64>() {
                if float.is_finite() {
                    return Self::Float(float);
                }
            }
        }
        Self::Text(raw.to_string())
    }

    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(int) => Self::Int(int),
                None => n.as_f64().map(Self::float).unwrap_or(Self::Null),
            },
            Value::String(s) => Self::Text(s.clone()),
            other => Self::Text(other.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Text(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
            _ => None,
        }
    }

    /// String form used for JSON output and string comparisons.
    pub fn display_string(&self) -> String {
        match self {
            Self::Null => NULL_MARKER.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => format!("{f:?}"),
            Self::Text(s) => s.clone(),
            Self::DateTime(dt) => dt.format(DATETIME_FORMAT).to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn with_rows(columns: Vec<String>, rows: Vec<Vec<Cell>>) -> Self {
        Self { columns, rows }
    }

    /// Builds a table from JSON objects, reading cells in `columns` order.
    pub fn from_json_rows(columns: Vec<String>, rows: &[Value]) -> Self {
        let rows = rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .map(|col| row.get(col).map(Cell::from_json).unwrap_or(Cell::Null))
                    .collect()
            })
            .collect();
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn column_index_ci(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Removes a column and returns its values.
    pub fn drop_column(&mut self, index: usize) -> Vec<Cell> {
        self.columns.remove(index);
        self.rows
            .iter_mut()
            .map(|row| {
                if index < row.len() {
                    row.remove(index)
                } else {
                    Cell::Null
                }
            })
            .collect()
    }

    /// Appends a column with the same value in every row.
    pub fn push_constant_column(&mut self, name: impl Into<String>, value: Cell) {
        self.columns.push(name.into());
        for row in &mut self.rows {
            row.push(value.clone());
        }
    }

    pub fn retain_rows<F>(&mut self, mut keep: F)
    where
        F: FnMut(&[Cell]) -> bool,
    {
        self.rows.retain(|row| keep(row));
    }

    pub fn slice(&self, start: usize, len: usize) -> Table {
        let rows = self.rows.iter().skip(start).take(len).cloned().collect();
        Table {
            columns: self.columns.clone(),
            rows,
        }
    }

    /// Rows as JSON objects in column order, every value stringified.
    pub fn records(&self) -> Vec<Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                let mut record = Map::with_capacity(self.columns.len());
                for (col, cell) in self.columns.iter().zip(row.iter()) {
                    record.insert(col.clone(), Value::String(cell.display_string()));
                }
                record
            })
            .collect()
    }
}

/// A full, unfiltered copy of one report's info type as written to the cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub table: Table,
    pub data_refresh_time: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn csv_inference_follows_dataframe_rules() {
        assert_eq!(Cell::infer(""), Cell::Null);
        assert_eq!(Cell::infer("NaN"), Cell::Null);
        assert_eq!(Cell::infer("42"), Cell::Int(42));
        assert_eq!(Cell::infer("100100.0"), Cell::Float(100100.0));
        assert_eq!(Cell::infer("inf"), Cell::text("inf"));
        assert_eq!(Cell::infer("Istanbul"), Cell::text("Istanbul"));
        assert_eq!(Cell::infer("2024-01-01"), Cell::text("2024-01-01"));
    }

    #[test]
    fn stringification_is_uniform() {
        let dt = NaiveDateTime::parse_from_str("2024-03-01 08:30:00", DATETIME_FORMAT).unwrap();
        assert_eq!(Cell::Null.display_string(), "NULL");
        assert_eq!(Cell::float(f64::NAN).display_string(), "NULL");
        assert_eq!(Cell::Float(2.0).display_string(), "2.0");
        assert_eq!(Cell::Int(7).display_string(), "7");
        assert_eq!(Cell::DateTime(dt).display_string(), "2024-03-01 08:30:00");
    }

    #[test]
    fn records_preserve_column_order() {
        let table = Table::with_rows(
            vec!["b".into(), "a".into()],
            vec![vec![Cell::Int(1), Cell::Null]],
        );
        let records = table.records();
        let keys: Vec<_> = records[0].keys().cloned().collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(records[0]["a"], json!("NULL"));
    }

    #[test]
    fn json_rows_fill_missing_columns_with_null() {
        let table = Table::from_json_rows(
            vec!["id".into(), "name".into()],
            &[json!({"id": 1, "name": "x"}), json!({"id": 2.5})],
        );
        assert_eq!(table.rows[0], vec![Cell::Int(1), Cell::text("x")]);
        assert_eq!(table.rows[1], vec![Cell::Float(2.5), Cell::Null]);
    }

    #[test]
    fn snapshot_survives_json_round_trip() {
        let snapshot = Snapshot {
            table: Table::with_rows(vec!["x".into()], vec![vec![Cell::float(1.5)]]),
            data_refresh_time: Some("2024-01-01 06:00:00".into()),
        };
        let bytes = serde_json::to_vec(&snapshot).unwrap();
        let back: Snapshot = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, snapshot);
    }
}
