//! Parameterised WHERE clauses built from request filters.
//!
//! Filter keys name a column plus an optional operator suffix. Columns are
//! checked case-sensitively against the table catalog; unknown ones are
//! dropped with a warning so a typo never reaches the database.

use std::collections::BTreeMap;

use rdg_core::is_reserved_query_key;
use rdg_core::normalize::agency_column_position;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    /// Catalog type name (`udt_name` on PostgreSQL, `DATA_TYPE` on SQL Server).
    pub data_type: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// The column the entity (agency) code is matched against.
pub fn agency_column(columns: &[ColumnInfo]) -> Option<&ColumnInfo> {
    let names: Vec<&str> = columns.iter().map(|column| column.name.as_str()).collect();
    agency_column_position(&names).and_then(|idx| columns.get(idx))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    MsSql,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    In,
}

impl FilterOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Like | Self::In => "",
        }
    }
}

// longest suffixes first so `_gte` is never read as `_gt`
const SUFFIXES: [(&str, FilterOp); 7] = [
    ("_gte", FilterOp::Gte),
    ("_lte", FilterOp::Lte),
    ("_gt", FilterOp::Gt),
    ("_lt", FilterOp::Lt),
    ("_ne", FilterOp::Ne),
    ("_like", FilterOp::Like),
    ("_in", FilterOp::In),
];

/// Splits `amount_gte` into `("amount", Gte)`; keys without a suffix are equality.
pub fn split_filter_key(key: &str) -> (&str, FilterOp) {
    for (suffix, op) in SUFFIXES {
        if let Some(column) = key.strip_suffix(suffix) {
            if !column.is_empty() {
                return (column, op);
            }
        }
    }
    (key, FilterOp::Eq)
}

// PostgreSQL types a text parameter can be cast to without surprises.
const PG_CASTABLE: [&str; 16] = [
    "int2", "int4", "int8", "numeric", "float4", "float8", "bool", "date", "timestamp",
    "timestamptz", "time", "uuid", "text", "varchar", "bpchar", "money",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WhereClause {
    pub sql: String,
    /// Bound as text, in placeholder order.
    pub params: Vec<String>,
    /// Filter keys that became (or were folded into) a condition.
    pub applied: Vec<String>,
    /// Filter keys that did not name a catalog column.
    pub dropped: Vec<String>,
}

pub fn quote_ident(dialect: Dialect, name: &str) -> String {
    match dialect {
        Dialect::Postgres => format!("\"{}\"", name.replace('"', "\"\"")),
        Dialect::MsSql => format!("[{}]", name.replace(']', "]]")),
    }
}

struct Builder<'a> {
    dialect: Dialect,
    params: &'a mut Vec<String>,
}

impl Builder<'_> {
    fn placeholder(&mut self, value: String, column: &ColumnInfo) -> String {
        self.params.push(value);
        match self.dialect {
            Dialect::Postgres => {
                let cast = column.data_type.to_ascii_lowercase();
                if PG_CASTABLE.contains(&cast.as_str()) {
                    format!("${}::{}", self.params.len(), cast)
                } else {
                    format!("${}", self.params.len())
                }
            }
            Dialect::MsSql => "?".to_string(),
        }
    }

    fn column_expr(&self, column: &ColumnInfo) -> String {
        let quoted = quote_ident(self.dialect, &column.name);
        match self.dialect {
            Dialect::Postgres
                if !PG_CASTABLE.contains(&column.data_type.to_ascii_lowercase().as_str()) =>
            {
                format!("{quoted}::text")
            }
            _ => quoted,
        }
    }

    fn condition(&mut self, column: &ColumnInfo, op: FilterOp, value: &str) -> Option<String> {
        let lhs = self.column_expr(column);
        match op {
            FilterOp::Like => {
                let pattern = format!("%{value}%");
                self.params.push(pattern);
                Some(match self.dialect {
                    Dialect::Postgres => format!(
                        "{}::text ILIKE ${}",
                        quote_ident(self.dialect, &column.name),
                        self.params.len()
                    ),
                    Dialect::MsSql => format!("{lhs} LIKE ?"),
                })
            }
            FilterOp::In => {
                let items: Vec<String> = value
                    .split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(|item| self.placeholder(item.to_string(), column))
                    .collect();
                if items.is_empty() {
                    return None;
                }
                Some(format!("{lhs} IN ({})", items.join(", ")))
            }
            _ => {
                let placeholder = self.placeholder(value.to_string(), column);
                Some(format!("{lhs} {} {placeholder}", op.symbol()))
            }
        }
    }
}

/// Builds the WHERE body (without the keyword) for `filters` against `columns`.
pub fn build_where(
    filters: &BTreeMap<String, String>,
    columns: &[ColumnInfo],
    dialect: Dialect,
) -> WhereClause {
    let mut params = Vec::new();
    let mut applied = Vec::new();
    let mut dropped = Vec::new();
    let mut conditions = Vec::new();
    let mut builder = Builder {
        dialect,
        params: &mut params,
    };

    for (key, value) in filters {
        if is_reserved_query_key(key) || value.trim().is_empty() {
            continue;
        }
        let (name, op) = split_filter_key(key);
        // an exact column name wins over a suffix reading of the same key
        let resolved = columns
            .iter()
            .find(|c| c.name == *key)
            .map(|c| (c, FilterOp::Eq))
            .or_else(|| columns.iter().find(|c| c.name == name).map(|c| (c, op)));
        match resolved {
            Some((column, op)) => {
                if let Some(condition) = builder.condition(column, op, value.trim()) {
                    conditions.push(condition);
                }
                applied.push(key.clone());
            }
            None => {
                warn!(filter = %key, "unknown column in filter, ignoring");
                dropped.push(key.clone());
            }
        }
    }

    let sql = if conditions.is_empty() {
        match dialect {
            Dialect::Postgres => "TRUE".to_string(),
            Dialect::MsSql => "1=1".to_string(),
        }
    } else {
        conditions.join(" AND ")
    };
    WhereClause {
        sql,
        params,
        applied,
        dropped,
    }
}
