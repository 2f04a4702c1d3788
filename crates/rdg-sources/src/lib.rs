//! Source connectors: every backend answers the same `fetch` contract with a [`Table`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rdg_core::env::env_opt;
use rdg_core::{
    is_reserved_query_key, DataPolicy, ReportDefinition, SourceError, Table, ENTITY_FILTER_PARAM,
};
use tracing::{info, warn};

pub mod fixture;
pub mod mssql;
pub mod mstr;
pub mod payload;
pub mod postgres;
pub mod sql;

pub use fixture::FixtureConnector;
pub use mssql::MssqlConnector;
pub use mstr::{MstrConfig, MstrConnector};
pub use postgres::PostgresConnector;

pub const CRATE_NAME: &str = "rdg-sources";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Pagination {
    /// The whole dataset, as the refresher and cached reads need it.
    #[default]
    All,
    Page { page: usize, page_size: usize },
}

impl Pagination {
    /// `page_size <= 0` means everything; `page < 1` means the first page.
    pub fn page(page: i64, page_size: i64) -> Self {
        if page_size <= 0 {
            return Self::All;
        }
        Self::Page {
            page: usize::try_from(page.max(1)).unwrap_or(1),
            page_size: usize::try_from(page_size).unwrap_or(usize::MAX),
        }
    }

    /// `(limit, offset)` for paged requests.
    pub fn limit_offset(&self) -> Option<(usize, usize)> {
        match *self {
            Self::All => None,
            Self::Page { page, page_size } => {
                Some((page_size, (page - 1).saturating_mul(page_size)))
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchRequest {
    pub filters: BTreeMap<String, String>,
    pub entity_code: Option<String>,
    pub pagination: Pagination,
}

impl FetchRequest {
    /// No filters, no paging: the full dataset.
    pub fn full() -> Self {
        Self::default()
    }

    /// Filters that carry a value. The entity key is left to scoping.
    pub fn active_filters(&self) -> impl Iterator<Item = (&String, &String)> + '_ {
        self.filters.iter().filter(|(key, value)| {
            !value.trim().is_empty()
                && !is_reserved_query_key(key)
                && !key.eq_ignore_ascii_case(ENTITY_FILTER_PARAM)
        })
    }

    /// Active filters the source did not apply, for the caller to apply in memory.
    pub fn unapplied_filters<F>(&self, applied: F) -> BTreeMap<String, String>
    where
        F: Fn(&str) -> bool,
    {
        self.active_filters()
            .filter(|(key, _)| !applied(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// `(limit, offset)` to send to the source, or `None` when rows still have
    /// to be filtered or scoped locally and paging must wait until after that.
    pub fn source_paging(
        &self,
        unapplied: &BTreeMap<String, String>,
        entity_scoped: bool,
    ) -> Option<(usize, usize)> {
        if !unapplied.is_empty() || (self.entity_code.is_some() && !entity_scoped) {
            return None;
        }
        self.pagination.limit_offset()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedTable {
    pub table: Table,
    /// Rows matching the request before paging.
    pub total_records: usize,
    /// Whether `table` already is the requested page.
    pub paged: bool,
    /// Whether the entity code was applied by the source.
    pub entity_scoped: bool,
    /// Request filters the source could not apply. Never set together with `paged`.
    pub unapplied_filters: BTreeMap<String, String>,
    pub query_text: Option<String>,
}

impl FetchedTable {
    /// A full table on which none of the request's filters or scoping ran.
    pub fn unfiltered(table: Table, request: &FetchRequest) -> Self {
        Self {
            total_records: table.len(),
            table,
            paged: false,
            entity_scoped: false,
            unapplied_filters: request.unapplied_filters(|_| false),
            query_text: None,
        }
    }
}

/// An open session against one backend, reusable for any number of fetches.
#[async_trait]
pub trait SourceConnection: Send + Sync {
    fn data_policy(&self) -> DataPolicy;

    async fn fetch(
        &self,
        report: &ReportDefinition,
        info_type: &str,
        request: &FetchRequest,
    ) -> Result<FetchedTable, SourceError>;

    /// Source-side "last refreshed" marker for a report, when the backend exposes one.
    async fn refresh_marker(&self, _report: &ReportDefinition) -> Result<Option<String>, SourceError> {
        Ok(None)
    }

    /// Releases the session. Never fails; problems are only logged.
    async fn close(&self);
}

#[async_trait]
pub trait SourceConnector: Send + Sync + fmt::Debug {
    fn data_policy(&self) -> DataPolicy;

    async fn connect(&self) -> Result<Arc<dyn SourceConnection>, SourceError>;
}

/// The connectors this process was configured with, one per data policy.
#[derive(Debug, Clone, Default)]
pub struct Sources {
    connectors: BTreeMap<DataPolicy, Arc<dyn SourceConnector>>,
}

impl Sources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, connector: Arc<dyn SourceConnector>) -> Self {
        self.register(connector);
        self
    }

    pub fn register(&mut self, connector: Arc<dyn SourceConnector>) {
        self.connectors.insert(connector.data_policy(), connector);
    }

    pub fn get(&self, policy: DataPolicy) -> Result<Arc<dyn SourceConnector>, SourceError> {
        self.connectors
            .get(&policy)
            .cloned()
            .ok_or(SourceError::NotConfigured(policy))
    }

    pub fn configured(&self) -> Vec<DataPolicy> {
        self.connectors.keys().copied().collect()
    }

    /// Builds every connector whose settings are present in the environment.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut sources = Self::new();

        if let Some(config) = MstrConfig::from_env() {
            info!(base_url = %config.base_url, "microstrategy connector enabled");
            sources.register(Arc::new(MstrConnector::new(config)));
        }

        if let Some(url) = env_opt("DATABASE_URL") {
            sources.register(Arc::new(PostgresConnector::connect_lazy(&url)?));
            info!("postgresql connector enabled");
        }

        if let Some(connection_string) = env_opt("MSSQL_CONNECTION_STRING") {
            if cfg!(feature = "mssql") {
                sources.register(Arc::new(MssqlConnector::new(connection_string)));
                info!("mssql connector enabled");
            } else {
                warn!("MSSQL_CONNECTION_STRING is set but this build lacks the `mssql` feature");
            }
        }

        if sources.connectors.is_empty() {
            warn!("no source connectors configured; only cached reports can be served");
        }
        Ok(sources)
    }
}
