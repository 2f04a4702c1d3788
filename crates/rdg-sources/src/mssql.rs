//! SQL Server tables over ODBC.
//!
//! ODBC calls block, so every session step runs on the blocking pool with a
//! fresh environment and connection. Builds without the `mssql` feature keep
//! the type but report the policy as not configured.

use std::sync::Arc;

use async_trait::async_trait;
use rdg_core::report::SourceLocator;
use rdg_core::{DataPolicy, ReportDefinition, SourceError, TableRef};
#[cfg(feature = "mssql")]
use rdg_core::{Cell, Table};

#[cfg(feature = "mssql")]
use crate::sql::{build_where, quote_ident, ColumnInfo, Dialect};
use crate::{FetchRequest, FetchedTable, SourceConnection, SourceConnector};

#[cfg(feature = "mssql")]
const SOURCE_KIND: &str = "mssql";

#[derive(Clone)]
pub struct MssqlConnector {
    connection_string: String,
}

impl std::fmt::Debug for MssqlConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MssqlConnector")
            .field("connection_string", &"<redacted>")
            .finish()
    }
}

impl MssqlConnector {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
        }
    }
}

fn table_ref(report: &ReportDefinition) -> Result<&TableRef, SourceError> {
    match &report.source {
        SourceLocator::MsSql(table) => Ok(table),
        other => Err(SourceError::InvalidLocator(format!(
            "report '{}' is a {} report",
            report.name,
            other.data_policy()
        ))),
    }
}

/// Catalog types whose text form should be read back as numbers.
#[cfg_attr(not(feature = "mssql"), allow(dead_code))]
const NUMERIC_TYPES: [&str; 11] = [
    "int", "bigint", "smallint", "tinyint", "decimal", "numeric", "float", "real", "money",
    "smallmoney", "bit",
];

const TEMPORAL_TYPES: [&str; 6] = [
    "datetime", "datetime2", "smalldatetime", "date", "datetimeoffset", "time",
];

pub(crate) fn select_list(columns: &[(String, String)]) -> String {
    columns
        .iter()
        .map(|(name, data_type)| {
            let quoted = format!("[{}]", name.replace(']', "]]"));
            if TEMPORAL_TYPES.contains(&data_type.to_ascii_lowercase().as_str()) {
                // ISO-8601 text, independent of the server's language settings
                format!("CONVERT(nvarchar(33), {quoted}, 126) AS {quoted}")
            } else {
                quoted
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn page_clause(paging: Option<(usize, usize)>) -> String {
    match paging {
        Some((limit, offset)) => {
            format!(" ORDER BY (SELECT NULL) OFFSET {offset} ROWS FETCH NEXT {limit} ROWS ONLY")
        }
        None => String::new(),
    }
}

#[async_trait]
impl SourceConnector for MssqlConnector {
    fn data_policy(&self) -> DataPolicy {
        DataPolicy::MsSql
    }

    #[cfg(feature = "mssql")]
    async fn connect(&self) -> Result<Arc<dyn SourceConnection>, SourceError> {
        let connection_string = self.connection_string.clone();
        tokio::task::spawn_blocking(move || blocking::probe(&connection_string))
            .await
            .map_err(|err| SourceError::connection(SOURCE_KIND, err.to_string()))??;
        Ok(Arc::new(MssqlConnection {
            connection_string: self.connection_string.clone(),
        }))
    }

    #[cfg(not(feature = "mssql"))]
    async fn connect(&self) -> Result<Arc<dyn SourceConnection>, SourceError> {
        let _ = &self.connection_string;
        Err(SourceError::NotConfigured(DataPolicy::MsSql))
    }
}

#[cfg_attr(not(feature = "mssql"), allow(dead_code))]
pub struct MssqlConnection {
    connection_string: String,
}

#[async_trait]
impl SourceConnection for MssqlConnection {
    fn data_policy(&self) -> DataPolicy {
        DataPolicy::MsSql
    }

    #[cfg(feature = "mssql")]
    async fn fetch(
        &self,
        report: &ReportDefinition,
        _info_type: &str,
        request: &FetchRequest,
    ) -> Result<FetchedTable, SourceError> {
        let table = table_ref(report)?.clone();
        let request = request.clone();
        let connection_string = self.connection_string.clone();
        let report_name = report.name.clone();
        tokio::task::spawn_blocking(move || {
            let _span = tracing::info_span!("mssql_fetch", report = %report_name, table = %table).entered();
            blocking::fetch(&connection_string, &table, &request)
        })
        .await
        .map_err(|err| SourceError::Query(err.to_string()))?
    }

    #[cfg(not(feature = "mssql"))]
    async fn fetch(
        &self,
        report: &ReportDefinition,
        _info_type: &str,
        _request: &FetchRequest,
    ) -> Result<FetchedTable, SourceError> {
        table_ref(report)?;
        Err(SourceError::NotConfigured(DataPolicy::MsSql))
    }

    async fn close(&self) {}
}

#[cfg(feature = "mssql")]
mod blocking {
    use odbc_api::{ConnectionOptions, Cursor, Environment, IntoParameter};
    use odbc_api::buffers::TextRowSet;
    use tracing::debug;

    use super::*;
    use crate::postgres::scoped_filters;

    const FETCH_BATCH: usize = 5_000;
    const MAX_TEXT_LEN: usize = 4_096;

    fn odbc_connection_error(err: odbc_api::Error) -> SourceError {
        SourceError::connection(SOURCE_KIND, err.to_string())
    }

    fn odbc_query_error(err: odbc_api::Error) -> SourceError {
        SourceError::Query(err.to_string())
    }

    pub(super) fn probe(connection_string: &str) -> Result<(), SourceError> {
        let environment = Environment::new().map_err(odbc_connection_error)?;
        let connection = environment
            .connect_with_connection_string(connection_string, ConnectionOptions::default())
            .map_err(odbc_connection_error)?;
        query_text_rows(&connection, "SELECT 1", &[]).map_err(odbc_connection_error)?;
        Ok(())
    }

    fn query_text_rows(
        connection: &odbc_api::Connection<'_>,
        sql: &str,
        params: &[String],
    ) -> Result<Vec<Vec<Option<String>>>, odbc_api::Error> {
        let mut prepared = connection.prepare(sql)?;
        let parameters: Vec<_> = params.iter().map(|p| p.as_str().into_parameter()).collect();
        let mut rows = Vec::new();
        if let Some(mut cursor) = prepared.execute(parameters.as_slice())? {
            let buffers = TextRowSet::for_cursor(FETCH_BATCH, &mut cursor, Some(MAX_TEXT_LEN))?;
            let mut row_set_cursor = cursor.bind_buffer(buffers)?;
            while let Some(batch) = row_set_cursor.fetch()? {
                for row in 0..batch.num_rows() {
                    rows.push(
                        (0..batch.num_cols())
                            .map(|col| {
                                batch
                                    .at(col, row)
                                    .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                            })
                            .collect(),
                    );
                }
            }
        }
        Ok(rows)
    }

    fn cell(raw: Option<String>, numeric: bool) -> Cell {
        match raw {
            None => Cell::Null,
            Some(text) if numeric => Cell::infer(&text),
            Some(text) => Cell::Text(text),
        }
    }

    pub(super) fn fetch(
        connection_string: &str,
        table: &TableRef,
        request: &FetchRequest,
    ) -> Result<FetchedTable, SourceError> {
        let environment = Environment::new().map_err(odbc_connection_error)?;
        let connection = environment
            .connect_with_connection_string(connection_string, ConnectionOptions::default())
            .map_err(odbc_connection_error)?;

        let catalog = query_text_rows(
            &connection,
            "SELECT COLUMN_NAME, DATA_TYPE FROM INFORMATION_SCHEMA.COLUMNS \
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? ORDER BY ORDINAL_POSITION",
            &[table.schema.clone(), table.table.clone()],
        )
        .map_err(odbc_query_error)?;
        let columns: Vec<ColumnInfo> = catalog
            .into_iter()
            .filter_map(|mut row| {
                let data_type = row.pop().flatten()?;
                let name = row.pop().flatten()?;
                Some(ColumnInfo::new(name, data_type))
            })
            .collect();
        if columns.is_empty() {
            return Err(SourceError::Query(format!("table {table} not found or has no columns")));
        }

        let (filters, entity_scoped) = scoped_filters(request, &columns);
        let clause = build_where(&filters, &columns, Dialect::MsSql);
        let unapplied = request.unapplied_filters(|key| clause.applied.iter().any(|a| a == key));
        let paging = request.source_paging(&unapplied, entity_scoped);
        let from = format!(
            "{}.{}",
            quote_ident(Dialect::MsSql, &table.schema),
            quote_ident(Dialect::MsSql, &table.table)
        );

        let count_rows = query_text_rows(
            &connection,
            &format!("SELECT COUNT(*) FROM {from} WHERE {}", clause.sql),
            &clause.params,
        )
        .map_err(odbc_query_error)?;
        let total = count_rows
            .first()
            .and_then(|row| row.first().cloned().flatten())
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .unwrap_or(0);

        let pairs: Vec<(String, String)> = columns
            .iter()
            .map(|c| (c.name.clone(), c.data_type.clone()))
            .collect();
        let select = format!(
            "SELECT {} FROM {from} WHERE {}{}",
            select_list(&pairs),
            clause.sql,
            page_clause(paging)
        );
        let raw_rows = query_text_rows(&connection, &select, &clause.params).map_err(odbc_query_error)?;
        debug!(rows = raw_rows.len(), total, "mssql rows fetched");

        let numeric: Vec<bool> = columns
            .iter()
            .map(|c| NUMERIC_TYPES.contains(&c.data_type.to_ascii_lowercase().as_str()))
            .collect();
        let rows = raw_rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .zip(numeric.iter())
                    .map(|(raw, &is_numeric)| cell(raw, is_numeric))
                    .collect()
            })
            .collect();

        Ok(FetchedTable {
            table: Table::with_rows(columns.into_iter().map(|c| c.name).collect(), rows),
            total_records: total,
            paged: paging.is_some(),
            entity_scoped,
            unapplied_filters: unapplied,
            query_text: Some(select),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporal_columns_are_converted_to_iso_text() {
        let list = select_list(&[
            ("id".to_string(), "int".to_string()),
            ("created".to_string(), "datetime2".to_string()),
        ]);
        assert_eq!(list, "[id], CONVERT(nvarchar(33), [created], 126) AS [created]");
    }

    #[test]
    fn paging_uses_offset_fetch() {
        assert_eq!(
            page_clause(Some((10, 20))),
            " ORDER BY (SELECT NULL) OFFSET 20 ROWS FETCH NEXT 10 ROWS ONLY"
        );
        assert_eq!(page_clause(None), "");
    }

    #[cfg(not(feature = "mssql"))]
    #[tokio::test]
    async fn without_the_feature_the_policy_is_not_configured() {
        let connector = MssqlConnector::new("Driver=x");
        assert!(matches!(
            connector.connect().await.err(),
            Some(SourceError::NotConfigured(DataPolicy::MsSql))
        ));
    }
}
