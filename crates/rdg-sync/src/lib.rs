//! Batch refresh of daily-cached reports, plus the triggers that drive it.
//!
//! Every trigger (cron job, change watcher, admin HTTP call, CLI) ends up in
//! [`Refresher::refresh`]. A run opens one connection per source system,
//! shares it across all reports of that source and closes it before returning.

pub mod watch;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use rdg_core::env::{env_flag, env_opt, env_or, env_parse, parse_hour_list};
use rdg_core::{
    normalize, CachePolicy, ConfigError, DataPolicy, ReportDefinition, Snapshot, SourceError,
};
use rdg_sources::{FetchRequest, FetchedTable, SourceConnection, Sources};
use rdg_storage::{
    retry_transient, BackoffPolicy, CacheMeta, ConfigStore, ConnectionLimiter, InfoTypeMeta,
    SnapshotStore,
};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use watch::{maybe_spawn_watcher, ChangeWatcher, WatchTick};

pub const CRATE_NAME: &str = "rdg-sync";

pub const UNKNOWN_REPORT: &str = "Report not defined in configuration.";
pub const NO_INFO_TYPES: &str = "no visualizations/types configured";

const DEFAULT_QUIET_HOURS: &str = "0,1,2,3,4,5,18,20,21,22,23";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshMode {
    #[default]
    Sequential,
    Concurrent,
}

impl RefreshMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sequential" | "serial" => Some(Self::Sequential),
            "concurrent" | "parallel" => Some(Self::Concurrent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub mode: RefreshMode,
    /// Cap on simultaneous outbound fetches across the whole run.
    pub global_connections: usize,
    /// Cap on info types of one report fetched at the same time.
    pub per_report_connections: usize,
    pub concurrent_reports: usize,
    pub acquire_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub scheduler_enabled: bool,
    pub refresh_cron: String,
    pub watch_enabled: bool,
    pub watch_interval: Duration,
    pub quiet_hours: Vec<u32>,
    pub stale_after: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            mode: RefreshMode::Sequential,
            global_connections: 8,
            per_report_connections: 2,
            concurrent_reports: 4,
            acquire_timeout: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
            scheduler_enabled: false,
            refresh_cron: "0 0 6 * * *".to_string(),
            watch_enabled: false,
            watch_interval: Duration::from_secs(120),
            quiet_hours: parse_hour_list(DEFAULT_QUIET_HOURS),
            stale_after: Duration::from_secs(86_400),
        }
    }
}

impl RefreshConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mode = match env_opt("RDG_REFRESH_MODE") {
            Some(raw) => RefreshMode::parse(&raw).unwrap_or_else(|| {
                warn!(value = %raw, "unknown RDG_REFRESH_MODE, using sequential");
                RefreshMode::Sequential
            }),
            None => defaults.mode,
        };
        Self {
            mode,
            global_connections: env_parse("RDG_REFRESH_GLOBAL_CONNECTIONS", defaults.global_connections),
            per_report_connections: env_parse(
                "RDG_REFRESH_PER_REPORT_CONNECTIONS",
                defaults.per_report_connections,
            ),
            concurrent_reports: env_parse("RDG_REFRESH_CONCURRENT_REPORTS", defaults.concurrent_reports),
            acquire_timeout: Duration::from_secs(env_parse(
                "RDG_REFRESH_ACQUIRE_TIMEOUT_SECS",
                defaults.acquire_timeout.as_secs(),
            )),
            backoff: BackoffPolicy {
                max_attempts: env_parse("RDG_REFRESH_RETRY_ATTEMPTS", defaults.backoff.max_attempts),
                base_delay: Duration::from_millis(env_parse("RDG_REFRESH_RETRY_BASE_MS", 200)),
                max_delay: Duration::from_millis(env_parse("RDG_REFRESH_RETRY_MAX_MS", 10_000)),
            },
            scheduler_enabled: env_flag("RDG_SCHEDULER_ENABLED", false),
            refresh_cron: env_or("RDG_REFRESH_CRON", &defaults.refresh_cron),
            watch_enabled: env_flag("RDG_WATCH_ENABLED", false),
            watch_interval: Duration::from_secs(env_parse(
                "RDG_WATCH_INTERVAL_SECS",
                defaults.watch_interval.as_secs(),
            )),
            quiet_hours: parse_hour_list(&env_or("RDG_QUIET_HOURS", DEFAULT_QUIET_HOURS)),
            stale_after: Duration::from_secs(env_parse(
                "RDG_STALE_AFTER_SECS",
                defaults.stale_after.as_secs(),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub requested: Vec<String>,
    pub refreshed: BTreeMap<String, CacheMeta>,
    /// report -> reason it was not attempted.
    pub skipped: BTreeMap<String, String>,
    pub errors: BTreeMap<String, Vec<String>>,
}

impl RefreshRunSummary {
    fn new(run_id: Uuid, started_at: DateTime<Utc>, requested: Vec<String>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            requested,
            refreshed: BTreeMap::new(),
            skipped: BTreeMap::new(),
            errors: BTreeMap::new(),
        }
    }

    pub fn refreshed_any(&self) -> bool {
        !self.refreshed.is_empty()
    }

    fn push_error(&mut self, report: &str, message: String) {
        self.errors.entry(report.to_string()).or_default().push(message);
    }
}

struct ReportOutcome {
    name: String,
    meta: Option<CacheMeta>,
    errors: Vec<String>,
}

#[derive(Clone)]
pub struct Refresher {
    config: Arc<ConfigStore>,
    cache: SnapshotStore,
    sources: Sources,
    settings: Arc<RefreshConfig>,
    limiter: ConnectionLimiter,
}

impl Refresher {
    pub fn new(
        config: Arc<ConfigStore>,
        cache: SnapshotStore,
        sources: Sources,
        settings: RefreshConfig,
    ) -> Self {
        let limiter = ConnectionLimiter::new(settings.global_connections, settings.acquire_timeout);
        Self {
            config,
            cache,
            sources,
            settings: Arc::new(settings),
            limiter,
        }
    }

    pub fn settings(&self) -> &RefreshConfig {
        &self.settings
    }

    pub fn cache(&self) -> &SnapshotStore {
        &self.cache
    }

    pub fn sources(&self) -> &Sources {
        &self.sources
    }

    pub fn config_store(&self) -> &ConfigStore {
        &self.config
    }

    /// Refreshes the named reports, or every daily report when `names` is `None`.
    ///
    /// Per-report problems end up in the summary; only an unreadable endpoint
    /// file fails the run.
    pub async fn refresh(&self, names: Option<&[String]>) -> Result<RefreshRunSummary, ConfigError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("refresh_run", %run_id, mode = ?self.settings.mode);
        async move {
            let catalog = self.config.load().await?;
            let requested: Vec<String> = match names {
                Some(names) => {
                    let mut seen = BTreeSet::new();
                    names
                        .iter()
                        .map(|name| name.trim().to_string())
                        .filter(|name| !name.is_empty() && seen.insert(name.clone()))
                        .collect()
                }
                None => catalog.daily_reports().map(|r| r.name.clone()).collect(),
            };
            let mut summary = RefreshRunSummary::new(run_id, started_at, requested.clone());
            info!(requested = requested.len(), "refresh run started");

            let mut by_policy: BTreeMap<DataPolicy, Vec<ReportDefinition>> = BTreeMap::new();
            for name in &requested {
                let Some(report) = catalog.get(name) else {
                    let message = match catalog.rejected.get(name) {
                        Some(reason) => format!("invalid definition: {reason}"),
                        None => UNKNOWN_REPORT.to_string(),
                    };
                    summary.push_error(name, message);
                    continue;
                };
                if report.cache_policy != CachePolicy::Daily {
                    summary.skipped.insert(
                        name.clone(),
                        format!("cache_policy is '{}', refresh ignored.", report.cache_policy.as_str()),
                    );
                    continue;
                }
                if report.info_types().is_empty() {
                    summary.skipped.insert(name.clone(), NO_INFO_TYPES.to_string());
                    continue;
                }
                by_policy.entry(report.data_policy()).or_default().push(report.clone());
            }

            let mut connections: Vec<Arc<dyn SourceConnection>> = Vec::new();
            let mut work: Vec<(Arc<dyn SourceConnection>, ReportDefinition)> = Vec::new();
            for (policy, reports) in by_policy {
                match self.open(policy).await {
                    Ok(connection) => {
                        for report in reports {
                            work.push((Arc::clone(&connection), report));
                        }
                        connections.push(connection);
                    }
                    Err(err) => {
                        error!(%policy, error = %err, "source connection unavailable");
                        for report in reports {
                            summary.push_error(
                                &report.name,
                                format!("{policy} connection unavailable: {err}"),
                            );
                        }
                    }
                }
            }

            let outcomes: Vec<ReportOutcome> = match self.settings.mode {
                RefreshMode::Sequential => {
                    let mut outcomes = Vec::with_capacity(work.len());
                    for (connection, report) in work {
                        outcomes.push(self.refresh_report(connection, report).await);
                    }
                    outcomes
                }
                RefreshMode::Concurrent => {
                    let pending: Vec<_> = work
                        .into_iter()
                        .map(|(connection, report)| self.refresh_report(connection, report))
                        .collect();
                    stream::iter(pending)
                        .buffer_unordered(self.settings.concurrent_reports.max(1))
                        .collect()
                        .await
                }
            };

            for connection in connections {
                connection.close().await;
            }

            for outcome in outcomes {
                if let Some(meta) = outcome.meta {
                    summary.refreshed.insert(outcome.name.clone(), meta);
                }
                if !outcome.errors.is_empty() {
                    summary
                        .errors
                        .entry(outcome.name)
                        .or_default()
                        .extend(outcome.errors);
                }
            }
            summary.finished_at = Utc::now();
            info!(
                refreshed = summary.refreshed.len(),
                skipped = summary.skipped.len(),
                failed = summary.errors.len(),
                "refresh run finished"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    async fn open(&self, policy: DataPolicy) -> Result<Arc<dyn SourceConnection>, SourceError> {
        let connector = self.sources.get(policy)?;
        match self.settings.mode {
            RefreshMode::Sequential => connector.connect().await,
            RefreshMode::Concurrent => {
                retry_transient(&self.settings.backoff, SourceError::is_transient, |_| {
                    connector.connect()
                })
                .await
            }
        }
    }

    async fn refresh_report(
        &self,
        connection: Arc<dyn SourceConnection>,
        report: ReportDefinition,
    ) -> ReportOutcome {
        let span = info_span!("refresh_report", report = %report.name);
        async move {
            let info_types = report.info_types();
            let connection = connection.as_ref();
            let report_ref = &report;
            let mut results: Vec<(String, Result<(InfoTypeMeta, Option<String>), String>)> =
                match self.settings.mode {
                    RefreshMode::Sequential => {
                        let mut results = Vec::with_capacity(info_types.len());
                        for info_type in info_types {
                            let result = self.refresh_info_type(connection, report_ref, &info_type).await;
                            results.push((info_type, result));
                        }
                        results
                    }
                    RefreshMode::Concurrent => {
                        stream::iter(info_types)
                            .map(move |info_type| async move {
                                let result =
                                    self.refresh_info_type(connection, report_ref, &info_type).await;
                                (info_type, result)
                            })
                            .buffer_unordered(self.settings.per_report_connections.max(1))
                            .collect()
                            .await
                    }
                };
            results.sort_by(|a, b| a.0.cmp(&b.0));

            let mut info_metas = BTreeMap::new();
            let mut errors = Vec::new();
            let mut data_refresh_time: Option<String> = None;
            for (info_type, result) in results {
                match result {
                    Ok((meta, refresh_time)) => {
                        if data_refresh_time.is_none() || info_type == rdg_core::SUMMARY_INFO_TYPE {
                            data_refresh_time = refresh_time.or(data_refresh_time);
                        }
                        info_metas.insert(info_type, meta);
                    }
                    Err(message) => {
                        warn!(info_type = %info_type, error = %message, "info type refresh failed");
                        errors.push(format!("{info_type}: {message}"));
                    }
                }
            }

            if info_metas.is_empty() {
                return ReportOutcome {
                    name: report.name,
                    meta: None,
                    errors,
                };
            }

            let meta = CacheMeta {
                report: report.name.clone(),
                refreshed_at: Utc::now(),
                info_types: info_metas,
                cache_policy: report.cache_policy,
                partial: !errors.is_empty(),
                data_refresh_time,
            };
            if let Err(err) = self.cache.put_meta(&meta).await {
                error!(error = %err, "writing refresh metadata failed");
                errors.push(format!("meta: {err}"));
            }
            info!(info_types = meta.info_types.len(), partial = meta.partial, "report refreshed");
            ReportOutcome {
                name: report.name,
                meta: Some(meta),
                errors,
            }
        }
        .instrument(span)
        .await
    }

    async fn refresh_info_type(
        &self,
        connection: &dyn SourceConnection,
        report: &ReportDefinition,
        info_type: &str,
    ) -> Result<(InfoTypeMeta, Option<String>), String> {
        let fetched = self.fetch_full(connection, report, info_type).await?;
        let (table, data_refresh_time) = normalize(fetched.table);
        let rows = table.len();
        let columns = table.columns.clone();
        let snapshot = Snapshot {
            table,
            data_refresh_time: data_refresh_time.clone(),
        };
        let cache_key = self
            .cache
            .put_snapshot(&report.name, info_type, &snapshot)
            .await
            .map_err(|err| err.to_string())?;
        info!(info_type, rows, cache_key = %cache_key, "snapshot written");
        Ok((
            InfoTypeMeta {
                rows,
                columns,
                cache_key,
            },
            data_refresh_time,
        ))
    }

    async fn fetch_full(
        &self,
        connection: &dyn SourceConnection,
        report: &ReportDefinition,
        info_type: &str,
    ) -> Result<FetchedTable, String> {
        let request = FetchRequest::full();
        match self.settings.mode {
            RefreshMode::Sequential => connection
                .fetch(report, info_type, &request)
                .await
                .map_err(|err| err.to_string()),
            RefreshMode::Concurrent => {
                let _permit = self.limiter.acquire().await.map_err(|err| err.to_string())?;
                retry_transient(&self.settings.backoff, SourceError::is_transient, |_| {
                    connection.fetch(report, info_type, &request)
                })
                .await
                .map_err(|err| err.to_string())
            }
        }
    }
}

/// Builds the cron job that refreshes every daily report, when enabled.
pub async fn maybe_build_scheduler(refresher: Refresher) -> Result<Option<JobScheduler>> {
    if !refresher.settings().scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = refresher.settings().refresh_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let refresher = refresher.clone();
        Box::pin(async move {
            match refresher.refresh(None).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    refreshed = summary.refreshed.len(),
                    failed = summary.errors.len(),
                    "scheduled refresh finished"
                ),
                Err(err) => error!(error = %err, "scheduled refresh failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
