//! Report read path: cached snapshot or live fetch, then filter, scope and page.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rdg_core::{
    apply_filters, normalize, paginate, scope_by_entity, CachePolicy, ConfigError, DataPolicy,
    GatewayError, PageInfo, ReportDefinition, Table, ENTITY_FILTER_PARAM, SUMMARY_INFO_TYPE,
};
use rdg_sources::{FetchRequest, Pagination, Sources};
use rdg_storage::{ConfigStore, SnapshotStore};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "rdg-reports";

/// One read request, as parsed from the query string and route.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportQuery {
    pub info_type: Option<String>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    /// Everything that is not a reserved key.
    pub filters: BTreeMap<String, String>,
    pub entity_code: Option<String>,
}

impl ReportQuery {
    /// Splits raw query parameters into paging controls and filters.
    /// Numbers that do not parse fall back to the defaults.
    pub fn from_params<I>(params: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut query = Self::default();
        let mut per_page = None;
        for (key, value) in params {
            match key.to_ascii_lowercase().as_str() {
                "info_type" => query.info_type = Some(value),
                "page" => query.page = value.trim().parse().ok(),
                "page_size" => query.page_size = value.trim().parse().ok(),
                "per_page" => per_page = value.trim().parse().ok(),
                _ if key.trim().is_empty() => {}
                _ => {
                    query.filters.insert(key, value);
                }
            }
        }
        if query.page_size.is_none() {
            query.page_size = per_page;
        }
        query
    }

    /// Scopes the request to one entity; the code also becomes the entity filter.
    pub fn with_entity(mut self, code: &str) -> Self {
        let code = code.trim().to_string();
        self.filters
            .insert(ENTITY_FILTER_PARAM.to_string(), code.clone());
        self.entity_code = Some(code);
        self
    }

    fn effective_info_type(&self) -> String {
        self.info_type
            .as_deref()
            .map(|raw| raw.trim().to_lowercase())
            .filter(|raw| !raw.is_empty())
            .unwrap_or_else(|| SUMMARY_INFO_TYPE.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportResponse {
    pub data: Vec<Map<String, Value>>,
    pub report: String,
    pub info_type: String,
    pub page: usize,
    pub page_size: usize,
    pub total_rows: usize,
    pub total_pages: usize,
    pub data_refresh_time: Option<String>,
    pub cache_policy: CachePolicy,
    pub data_policy: DataPolicy,
    pub is_cached: bool,
    pub cache_hit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agency: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportSummary {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub cache_policy: CachePolicy,
    pub data_policy: DataPolicy,
    pub is_cached: bool,
    pub requires_agency: bool,
    pub available_filters: Vec<String>,
    pub info_types: Vec<String>,
    pub refreshed_at: Option<DateTime<Utc>>,
    /// Set when the report's cache metadata could not be read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidReport {
    pub name: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportListing {
    pub reports: Vec<ReportSummary>,
    pub total_count: usize,
    pub cached_count: usize,
    pub non_cached_count: usize,
    pub invalid: Vec<InvalidReport>,
}

/// The orchestrator. Cheap to clone; every piece is shared.
#[derive(Debug, Clone)]
pub struct ReportService {
    config: Arc<ConfigStore>,
    cache: SnapshotStore,
    sources: Sources,
}

impl ReportService {
    pub fn new(config: Arc<ConfigStore>, cache: SnapshotStore, sources: Sources) -> Self {
        Self {
            config,
            cache,
            sources,
        }
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn cache(&self) -> &SnapshotStore {
        &self.cache
    }

    pub fn sources(&self) -> &Sources {
        &self.sources
    }

    async fn definition(&self, name: &str) -> Result<ReportDefinition, GatewayError> {
        self.config.get(name).await.map_err(|err| match err {
            ConfigError::NotFound(_) => GatewayError::ReportNotFound(name.to_string()),
            other => GatewayError::Config(other),
        })
    }

    pub async fn get_report(&self, name: &str, query: &ReportQuery) -> Result<ReportResponse, GatewayError> {
        let report = self.definition(name).await?;
        let info_type = query.effective_info_type();
        if !report.supports_info_type(&info_type) {
            return Err(GatewayError::UnsupportedInfoType {
                report: report.name.clone(),
                info_type,
            });
        }

        let page = query.page.unwrap_or(1);
        let page_size = query
            .page_size
            .unwrap_or_else(|| i64::try_from(report.per_page).unwrap_or(i64::MAX));

        let span = info_span!("get_report", report = %report.name, info_type = %info_type);
        async {
            if report.cache_policy.is_cached() {
                if let Some(response) = self.from_cache(&report, &info_type, query, page, page_size).await {
                    return Ok(response);
                }
            }
            self.from_source(&report, &info_type, query, page, page_size).await
        }
        .instrument(span)
        .await
    }

    async fn from_cache(
        &self,
        report: &ReportDefinition,
        info_type: &str,
        query: &ReportQuery,
        page: i64,
        page_size: i64,
    ) -> Option<ReportResponse> {
        let snapshot = match self.cache.get_snapshot(&report.name, info_type).await {
            Ok(Some(snapshot)) if snapshot.table.is_empty() => {
                info!("cached snapshot is empty, falling back to live fetch");
                return None;
            }
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                info!("cache miss");
                return None;
            }
            Err(err) => {
                warn!(error = %err, "cache read failed, treating as miss");
                return None;
            }
        };
        info!(rows = snapshot.table.len(), "cache hit");

        let mut table = snapshot.table;
        let mut filters = query.filters.clone();
        if let Some(code) = &query.entity_code {
            filters.remove(ENTITY_FILTER_PARAM);
            if !scope_by_entity(&mut table, code) {
                warn!(entity = %code, "no agency column in snapshot, entity scope not applied");
            }
        }
        apply_filters(&mut table, &filters, &report.date_columns);
        let (page_table, info) = paginate(&table, page, page_size);
        Some(envelope(
            report,
            info_type,
            page_table,
            info,
            snapshot.data_refresh_time,
            true,
            query.entity_code.clone(),
        ))
    }

    async fn from_source(
        &self,
        report: &ReportDefinition,
        info_type: &str,
        query: &ReportQuery,
        page: i64,
        page_size: i64,
    ) -> Result<ReportResponse, GatewayError> {
        let connector = self.sources.get(report.data_policy())?;
        let connection = connector.connect().await?;
        let request = FetchRequest {
            filters: query.filters.clone(),
            entity_code: query.entity_code.clone(),
            pagination: Pagination::page(page, page_size),
        };
        let fetched = connection.fetch(report, info_type, &request).await;
        connection.close().await;
        let fetched = fetched?;

        let (mut table, refresh_time) = normalize(fetched.table);
        let needs_scope = query.entity_code.is_some() && !fetched.entity_scoped;
        let local_pass = needs_scope || !fetched.unapplied_filters.is_empty();
        let (table, info) = if fetched.paged && !local_pass {
            (table, PageInfo::new(page, page_size, fetched.total_records))
        } else {
            if fetched.paged {
                warn!("source paged a result that still needs local filtering");
            }
            if let Some(code) = query.entity_code.as_deref().filter(|_| needs_scope) {
                if !scope_by_entity(&mut table, code) {
                    warn!(entity = %code, "no agency column in live result, entity scope not applied");
                }
            }
            apply_filters(&mut table, &fetched.unapplied_filters, &report.date_columns);
            paginate(&table, page, page_size)
        };
        info!(rows = table.len(), total = info.total_rows, "served live");
        Ok(envelope(
            report,
            info_type,
            table,
            info,
            refresh_time,
            false,
            query.entity_code.clone(),
        ))
    }

    /// Every definition with its policy flags; broken entries are listed, never fatal.
    pub async fn list_reports(&self) -> Result<ReportListing, GatewayError> {
        let catalog = self.config.load().await?;
        let mut reports = Vec::with_capacity(catalog.len());
        for report in catalog.reports.values() {
            let (refreshed_at, error) = match self.cache.get_meta(&report.name).await {
                Ok(meta) => (meta.map(|m| m.refreshed_at), None),
                Err(err) => {
                    warn!(report = %report.name, error = %err, "cache metadata unavailable");
                    (None, Some(err.to_string()))
                }
            };
            reports.push(ReportSummary {
                name: report.name.clone(),
                description: report.description.clone(),
                cache_policy: report.cache_policy,
                data_policy: report.data_policy(),
                is_cached: report.cache_policy.is_cached(),
                requires_agency: report.requires_agency(),
                available_filters: report.available_filters(),
                info_types: report.info_types(),
                refreshed_at,
                error,
            });
        }
        let cached_count = reports.iter().filter(|r| r.is_cached).count();
        let invalid = catalog
            .rejected
            .iter()
            .map(|(name, error)| InvalidReport {
                name: name.clone(),
                error: error.clone(),
            })
            .collect();
        Ok(ReportListing {
            total_count: reports.len(),
            cached_count,
            non_cached_count: reports.len() - cached_count,
            reports,
            invalid,
        })
    }
}

fn envelope(
    report: &ReportDefinition,
    info_type: &str,
    table: Table,
    info: PageInfo,
    data_refresh_time: Option<String>,
    cache_hit: bool,
    agency: Option<String>,
) -> ReportResponse {
    ReportResponse {
        data: table.records(),
        report: report.name.clone(),
        info_type: info_type.to_string(),
        page: info.page,
        page_size: info.page_size,
        total_rows: info.total_rows,
        total_pages: info.total_pages,
        data_refresh_time,
        cache_policy: report.cache_policy,
        data_policy: report.data_policy(),
        is_cached: report.cache_policy.is_cached(),
        cache_hit,
        agency,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdg_core::{Cell, Snapshot};
    use rdg_sources::FixtureConnector;
    use tempfile::TempDir;

    const CONFIG: &str = r#"
endpoints:
  agency_sales:
    data_policy: microstrategy
    cache_policy: daily
    dossier_id: D1
    viz_keys: {summary: K1, detail: K2}
    filters: {agency_name: F_AGENCY}
  live_pg:
    source: postgresql
    postgres_table: public.sales
    per_page: 2
  broken:
    source: postgresql
    postgres_table: "bad;name"
"#;

    fn agency_table() -> Table {
        Table::with_rows(
            vec!["agencyCode".into(), "region".into(), "amount".into()],
            vec![
                vec![Cell::text("100100"), Cell::text("north"), Cell::Int(5)],
                vec![Cell::text("200200"), Cell::text("south"), Cell::Int(7)],
                vec![Cell::text("100100"), Cell::text("south"), Cell::Int(9)],
            ],
        )
    }

    struct Harness {
        _dir: TempDir,
        service: ReportService,
        mstr: Arc<FixtureConnector>,
        pg: Arc<FixtureConnector>,
    }

    fn harness() -> Harness {
        harness_with(CONFIG)
    }

    fn harness_with(config: &str) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("endpoints.yaml");
        std::fs::write(&path, config).unwrap();
        let mstr = Arc::new(FixtureConnector::new(DataPolicy::MicroStrategy));
        let pg = Arc::new(FixtureConnector::new(DataPolicy::PostgreSql));
        let sources = Sources::new().with(mstr.clone()).with(pg.clone());
        let service = ReportService::new(
            Arc::new(ConfigStore::new(path)),
            SnapshotStore::in_memory(),
            sources,
        );
        Harness {
            _dir: dir,
            service,
            mstr,
            pg,
        }
    }

    fn params(pairs: &[(&str, &str)]) -> ReportQuery {
        ReportQuery::from_params(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())))
    }

    #[test]
    fn query_parsing_separates_reserved_keys() {
        let query = params(&[
            ("page", "x"),
            ("per_page", "5"),
            ("info_type", "Detail"),
            ("region", "north"),
        ]);
        assert_eq!(query.page, None);
        assert_eq!(query.page_size, Some(5));
        assert_eq!(query.effective_info_type(), "detail");
        assert_eq!(query.filters.len(), 1);

        let scoped = query.with_entity(" 42 ");
        assert_eq!(scoped.entity_code.as_deref(), Some("42"));
        assert_eq!(scoped.filters.get("agency_name").map(String::as_str), Some("42"));
    }

    #[tokio::test]
    async fn unknown_report_and_info_type_are_typed_errors() {
        let h = harness();
        assert!(matches!(
            h.service.get_report("nope", &ReportQuery::default()).await,
            Err(GatewayError::ReportNotFound(_))
        ));
        assert!(matches!(
            h.service.get_report("live_pg", &params(&[("info_type", "detail")])).await,
            Err(GatewayError::UnsupportedInfoType { .. })
        ));
    }

    #[tokio::test]
    async fn cached_reads_scope_filter_and_page_in_memory() {
        let h = harness();
        h.service
            .cache()
            .put_snapshot(
                "agency_sales",
                "summary",
                &Snapshot {
                    table: agency_table(),
                    data_refresh_time: Some("2024-01-02 03:04:05".into()),
                },
            )
            .await
            .unwrap();

        let query = params(&[("region", "SOUTH"), ("doesnotexist", "foo"), ("page_size", "1")])
            .with_entity("100100");
        let response = h.service.get_report("agency_sales", &query).await.unwrap();

        assert!(response.cache_hit);
        assert!(response.is_cached);
        assert_eq!(response.total_rows, 1);
        assert_eq!(response.total_pages, 1);
        assert_eq!(response.data[0]["amount"], "9");
        assert_eq!(response.agency.as_deref(), Some("100100"));
        assert_eq!(response.data_refresh_time.as_deref(), Some("2024-01-02 03:04:05"));
        assert_eq!(h.mstr.fetches(), 0);
    }

    #[tokio::test]
    async fn empty_snapshot_falls_back_to_live() {
        let h = harness();
        h.service
            .cache()
            .put_snapshot("agency_sales", "summary", &Snapshot::default())
            .await
            .unwrap();
        h.mstr.insert_table("agency_sales", "summary", agency_table());

        let response = h
            .service
            .get_report("agency_sales", &ReportQuery::default())
            .await
            .unwrap();
        assert!(!response.cache_hit);
        assert_eq!(response.total_rows, 3);
        assert_eq!(h.mstr.fetches(), 1);
        assert_eq!(h.mstr.closes(), 1);
    }

    #[tokio::test]
    async fn live_reads_normalize_and_page_locally_when_the_source_cannot() {
        let h = harness();
        h.pg.insert_table(
            "live_pg",
            "summary",
            Table::with_rows(
                vec!["Acente Kodu".into(), "Şube Adı".into(), "Data Refresh Time".into()],
                vec![
                    vec![Cell::Float(100100.0), Cell::text("a"), Cell::text("2024-05-06 07:00:00")],
                    vec![Cell::Float(100200.0), Cell::text("b"), Cell::text("2024-05-06 07:00:00")],
                    vec![Cell::Float(100100.0), Cell::text("c"), Cell::text("2024-05-06 07:00:00")],
                ],
            ),
        );

        let response = h
            .service
            .get_report("live_pg", &ReportQuery::default().with_entity("100100"))
            .await
            .unwrap();
        assert!(!response.cache_hit);
        assert!(!response.is_cached);
        assert_eq!(response.page_size, 2);
        assert_eq!(response.total_rows, 2);
        assert_eq!(response.data[0]["acenteKodu"], "100100");
        assert_eq!(response.data[1]["subeAdi"], "c");
        assert_eq!(response.data_refresh_time.as_deref(), Some("2024-05-06 07:00:00"));
        assert!(!response.data[0].contains_key("dataRefreshTime"));
    }

    const TWIN_CONFIG: &str = r#"
endpoints:
  claims_daily:
    data_policy: microstrategy
    cache_policy: daily
    dossier_id: D9
    viz_keys: {summary: K9}
  claims_live:
    data_policy: microstrategy
    cache_policy: none
    dossier_id: D9
    viz_keys: {summary: K9}
"#;

    fn claims_table() -> Table {
        Table::with_rows(
            vec!["Hasar Tarihi".into(), "Region".into(), "Amount".into()],
            vec![
                vec![Cell::text("2024-01-15"), Cell::text("south"), Cell::Int(1)],
                vec![Cell::text("2024-02-10"), Cell::text("south"), Cell::Int(2)],
                vec![Cell::text("2024-03-01"), Cell::text("north"), Cell::Int(3)],
                vec![Cell::text("2024-03-05"), Cell::text("south"), Cell::Int(4)],
            ],
        )
    }

    #[tokio::test]
    async fn live_and_cached_reads_filter_the_same_way() {
        let h = harness_with(TWIN_CONFIG);
        h.mstr.insert_table("claims_live", "summary", claims_table());
        let (normalized, _) = normalize(claims_table());
        h.service
            .cache()
            .put_snapshot(
                "claims_daily",
                "summary",
                &Snapshot {
                    table: normalized,
                    data_refresh_time: None,
                },
            )
            .await
            .unwrap();

        for page in ["1", "2"] {
            let query = params(&[
                ("hasarTarihi_beg_date", "02/01/2024"),
                ("region", "south"),
                ("page", page),
                ("page_size", "1"),
            ]);
            let cached = h.service.get_report("claims_daily", &query).await.unwrap();
            let live = h.service.get_report("claims_live", &query).await.unwrap();

            assert!(cached.cache_hit);
            assert!(!live.cache_hit);
            assert_eq!(cached.total_rows, 2);
            assert_eq!(live.total_rows, cached.total_rows);
            assert_eq!(live.total_pages, cached.total_pages);
            assert_eq!(live.data, cached.data);
        }

        let query = params(&[("hasarTarihi_beg_date", "02/01/2024"), ("region", "south")]);
        let live = h.service.get_report("claims_live", &query).await.unwrap();
        let amounts: Vec<Option<&str>> = live.data.iter().map(|row| row["amount"].as_str()).collect();
        assert_eq!(amounts, vec![Some("2"), Some("4")]);
        assert_eq!(h.mstr.fetches(), 3);
    }

    #[tokio::test]
    async fn live_source_failures_fail_the_request() {
        let h = harness();
        h.pg.set_fail_connect(true);
        let err = h
            .service
            .get_report("live_pg", &ReportQuery::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Source(_)));
    }

    #[tokio::test]
    async fn listing_counts_policies_and_embeds_invalid_entries() {
        let h = harness();
        let listing = h.service.list_reports().await.unwrap();
        assert_eq!(listing.total_count, 2);
        assert_eq!(listing.cached_count, 1);
        assert_eq!(listing.non_cached_count, 1);
        assert_eq!(listing.invalid.len(), 1);
        assert_eq!(listing.invalid[0].name, "broken");

        let sales = &listing.reports[0];
        assert_eq!(sales.name, "agency_sales");
        assert!(sales.requires_agency);
        assert_eq!(sales.available_filters, vec!["agency_name"]);
        assert_eq!(sales.info_types, vec!["detail", "summary"]);
    }
}
