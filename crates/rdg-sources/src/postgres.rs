//! PostgreSQL tables read through a shared sqlx pool.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdg_core::env::env_parse;
use rdg_core::report::SourceLocator;
use rdg_core::{DataPolicy, ReportDefinition, SourceError, Table, TableRef};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{debug, info_span, Instrument};

use crate::sql::{agency_column, build_where, quote_ident, ColumnInfo, Dialect};
use crate::{FetchRequest, FetchedTable, SourceConnection, SourceConnector};

const SOURCE_KIND: &str = "postgresql";

pub(crate) fn map_sqlx_error(err: sqlx::Error) -> SourceError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => SourceError::connection(SOURCE_KIND, err.to_string()),
        other => SourceError::Query(other.to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct PostgresConnector {
    pool: PgPool,
}

impl PostgresConnector {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Builds the pool without dialing; the first `connect` proves reachability.
    pub fn connect_lazy(database_url: &str) -> Result<Self, SourceError> {
        let pool = PgPoolOptions::new()
            .max_connections(env_parse("RDG_PG_MAX_CONNECTIONS", 10))
            .acquire_timeout(Duration::from_secs(env_parse("RDG_PG_ACQUIRE_TIMEOUT_SECS", 10)))
            .connect_lazy(database_url)
            .map_err(|err| SourceError::connection(SOURCE_KIND, err.to_string()))?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl SourceConnector for PostgresConnector {
    fn data_policy(&self) -> DataPolicy {
        DataPolicy::PostgreSql
    }

    async fn connect(&self) -> Result<Arc<dyn SourceConnection>, SourceError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(Arc::new(PostgresConnection {
            pool: self.pool.clone(),
        }))
    }
}

pub struct PostgresConnection {
    pool: PgPool,
}

fn table_ref(report: &ReportDefinition) -> Result<&TableRef, SourceError> {
    match &report.source {
        SourceLocator::PostgreSql(table) => Ok(table),
        other => Err(SourceError::InvalidLocator(format!(
            "report '{}' is a {} report",
            report.name,
            other.data_policy()
        ))),
    }
}

/// Request filters with the entity code pushed onto the first agency-like column.
///
/// Returns whether the entity was applied.
pub(crate) fn scoped_filters(
    request: &FetchRequest,
    columns: &[ColumnInfo],
) -> (BTreeMap<String, String>, bool) {
    let mut filters = request.filters.clone();
    if !columns.iter().any(|c| c.name == rdg_core::ENTITY_FILTER_PARAM) {
        filters.remove(rdg_core::ENTITY_FILTER_PARAM);
    }
    let Some(code) = &request.entity_code else {
        return (filters, false);
    };
    match agency_column(columns) {
        Some(column) => {
            filters.insert(column.name.clone(), code.clone());
            (filters, true)
        }
        None => (filters, false),
    }
}

fn qualified(dialect: Dialect, table: &TableRef) -> String {
    format!(
        "{}.{}",
        quote_ident(dialect, &table.schema),
        quote_ident(dialect, &table.table)
    )
}

pub(crate) fn count_sql(table: &TableRef, where_sql: &str) -> String {
    format!(
        "SELECT COUNT(*) FROM {} WHERE {where_sql}",
        qualified(Dialect::Postgres, table)
    )
}

pub(crate) fn select_sql(table: &TableRef, where_sql: &str, paging: Option<(usize, usize)>) -> String {
    let page = paging
        .map(|(limit, offset)| format!(" LIMIT {limit} OFFSET {offset}"))
        .unwrap_or_default();
    format!(
        "SELECT row_to_json(t) AS row FROM (SELECT * FROM {} WHERE {where_sql} ORDER BY 1{page}) t",
        qualified(Dialect::Postgres, table)
    )
}

impl PostgresConnection {
    async fn columns(&self, table: &TableRef) -> Result<Vec<ColumnInfo>, SourceError> {
        let rows = sqlx::query(
            r#"
            SELECT column_name::text AS name, udt_name::text AS data_type
              FROM information_schema.columns
             WHERE table_schema = $1 AND table_name = $2
             ORDER BY ordinal_position
            "#,
        )
        .bind(&table.schema)
        .bind(&table.table)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            columns.push(ColumnInfo {
                name: row.try_get("name").map_err(map_sqlx_error)?,
                data_type: row.try_get("data_type").map_err(map_sqlx_error)?,
            });
        }
        if columns.is_empty() {
            return Err(SourceError::Query(format!("table {table} not found or has no columns")));
        }
        Ok(columns)
    }
}

#[async_trait]
impl SourceConnection for PostgresConnection {
    fn data_policy(&self) -> DataPolicy {
        DataPolicy::PostgreSql
    }

    async fn fetch(
        &self,
        report: &ReportDefinition,
        _info_type: &str,
        request: &FetchRequest,
    ) -> Result<FetchedTable, SourceError> {
        let table = table_ref(report)?;
        let span = info_span!("pg_fetch", report = %report.name, table = %table);
        async {
            let columns = self.columns(table).await?;
            let (filters, entity_scoped) = scoped_filters(request, &columns);
            let clause = build_where(&filters, &columns, Dialect::Postgres);
            let unapplied = request.unapplied_filters(|key| clause.applied.iter().any(|a| a == key));
            let paging = request.source_paging(&unapplied, entity_scoped);

            let count_query = count_sql(table, &clause.sql);
            let mut count = sqlx::query_scalar::<_, i64>(&count_query);
            for param in &clause.params {
                count = count.bind(param);
            }
            let total = count.fetch_one(&self.pool).await.map_err(map_sqlx_error)?;

            let select_query = select_sql(table, &clause.sql, paging);
            let mut select = sqlx::query_scalar::<_, Value>(&select_query);
            for param in &clause.params {
                select = select.bind(param);
            }
            let rows = select.fetch_all(&self.pool).await.map_err(map_sqlx_error)?;
            debug!(rows = rows.len(), total, "postgres rows fetched");

            let names = columns.into_iter().map(|c| c.name).collect();
            Ok(FetchedTable {
                table: Table::from_json_rows(names, &rows),
                total_records: usize::try_from(total).unwrap_or(0),
                paged: paging.is_some(),
                entity_scoped,
                unapplied_filters: unapplied,
                query_text: Some(select_query),
            })
        }
        .instrument(span)
        .await
    }

    async fn close(&self) {
        // the pool outlives sessions; nothing to release per session
    }
}
