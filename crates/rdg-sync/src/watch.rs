//! Interval watcher that refreshes daily reports whose source data changed.
//!
//! A report is due when it has never been refreshed, when the source's refresh
//! marker differs from the one stored with the last snapshot, or (for sources
//! without a marker) when the last refresh is older than the stale threshold.
//! Configured quiet hours are skipped entirely.

use std::collections::BTreeMap;

use chrono::{DateTime, Local, Timelike, Utc};
use rdg_core::{ConfigError, DataPolicy, ReportDefinition};
use rdg_sources::SourceConnection;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{RefreshRunSummary, Refresher};

#[derive(Debug, Clone, Serialize)]
pub struct WatchTick {
    pub checked_at: DateTime<Local>,
    pub quiet: bool,
    pub due: Vec<String>,
    pub summary: Option<RefreshRunSummary>,
}

#[derive(Clone)]
pub struct ChangeWatcher {
    refresher: Refresher,
}

impl ChangeWatcher {
    pub fn new(refresher: Refresher) -> Self {
        Self { refresher }
    }

    pub fn is_quiet_hour(&self, now: DateTime<Local>) -> bool {
        self.refresher.settings().quiet_hours.contains(&now.hour())
    }

    /// Daily reports that need a refresh as of `now`.
    pub async fn due_reports(&self, now: DateTime<Utc>) -> Result<Vec<String>, ConfigError> {
        let catalog = self.refresher.config_store().load().await?;
        let mut by_policy: BTreeMap<DataPolicy, Vec<&ReportDefinition>> = BTreeMap::new();
        for report in catalog.daily_reports() {
            by_policy.entry(report.data_policy()).or_default().push(report);
        }

        let mut due = Vec::new();
        for (policy, reports) in by_policy {
            let connection = match self.refresher.sources().get(policy) {
                Ok(connector) => connector.connect().await,
                Err(err) => Err(err),
            };
            let connection = match connection {
                Ok(connection) => connection,
                Err(err) => {
                    warn!(%policy, error = %err, "cannot check refresh markers");
                    continue;
                }
            };
            for report in reports {
                if self.is_due(connection.as_ref(), report, now).await {
                    due.push(report.name.clone());
                }
            }
            connection.close().await;
        }
        Ok(due)
    }

    async fn is_due(
        &self,
        connection: &dyn SourceConnection,
        report: &ReportDefinition,
        now: DateTime<Utc>,
    ) -> bool {
        let meta = match self.refresher.cache().get_meta(&report.name).await {
            Ok(Some(meta)) => meta,
            Ok(None) => {
                debug!(report = %report.name, "never refreshed");
                return true;
            }
            Err(err) => {
                warn!(report = %report.name, error = %err, "cannot read refresh metadata");
                return false;
            }
        };

        let marker = connection.refresh_marker(report).await.unwrap_or_else(|err| {
            warn!(report = %report.name, error = %err, "refresh marker unavailable");
            None
        });
        match marker {
            Some(marker) => {
                let changed = meta.data_refresh_time.as_deref() != Some(marker.as_str());
                if changed {
                    debug!(
                        report = %report.name,
                        previous = ?meta.data_refresh_time,
                        current = %marker,
                        "source data changed"
                    );
                }
                changed
            }
            None => {
                let age = now.signed_duration_since(meta.refreshed_at);
                age.to_std()
                    .map(|age| age >= self.refresher.settings().stale_after)
                    .unwrap_or(false)
            }
        }
    }

    pub async fn tick(&self, now: DateTime<Local>) -> Result<WatchTick, ConfigError> {
        if self.is_quiet_hour(now) {
            debug!(hour = now.hour(), "quiet hour, skipping refresh check");
            return Ok(WatchTick {
                checked_at: now,
                quiet: true,
                due: Vec::new(),
                summary: None,
            });
        }

        let due = self.due_reports(now.with_timezone(&Utc)).await?;
        let summary = if due.is_empty() {
            None
        } else {
            info!(due = ?due, "source data changed, refreshing");
            Some(self.refresher.refresh(Some(&due)).await?)
        };
        Ok(WatchTick {
            checked_at: now,
            quiet: false,
            due,
            summary,
        })
    }

    /// Ticks forever on the configured interval.
    pub async fn run(self) {
        let interval = self.refresher.settings().watch_interval;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(?interval, "change watcher started");
        loop {
            ticker.tick().await;
            let span = info_span!("watch_tick");
            match self.tick(Local::now()).instrument(span).await {
                Ok(tick) => debug!(quiet = tick.quiet, due = tick.due.len(), "watch tick done"),
                Err(err) => error!(error = %err, "watch tick failed"),
            }
        }
    }
}

/// Spawns the watcher loop when it is enabled.
pub fn maybe_spawn_watcher(refresher: &Refresher) -> Option<JoinHandle<()>> {
    if !refresher.settings().watch_enabled {
        return None;
    }
    let watcher = ChangeWatcher::new(refresher.clone());
    Some(tokio::spawn(watcher.run()))
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use rdg_core::{Cell, Table};
    use rdg_sources::FixtureConnector;

    use super::*;
    use crate::tests::{harness, harness_with, table};
    use crate::RefreshConfig;

    const MARKER: &str = "2026-01-05 10:00:00";

    fn at_hour(base: DateTime<Local>, hour: u32) -> DateTime<Local> {
        base.with_hour(hour).unwrap()
    }

    fn stamped_table() -> Table {
        let mut table = table(2);
        table.push_constant_column("dataRefreshTime", Cell::text(MARKER));
        table
    }

    #[tokio::test]
    async fn quiet_hours_skip_every_check() {
        let h = harness();
        let watcher = ChangeWatcher::new(h.refresher.clone());
        let tick = watcher.tick(at_hour(Local::now(), 3)).await.unwrap();
        assert!(tick.quiet);
        assert_eq!(h.mstr.connects() + h.pg.connects(), 0);
    }

    #[tokio::test]
    async fn refreshes_only_when_the_marker_moves() {
        let h = harness();
        h.mstr.insert_table("agency_sales", "summary", stamped_table());
        h.mstr.insert_table("agency_sales", "detail", stamped_table());
        h.mstr.set_marker("agency_sales", MARKER);
        let watcher = ChangeWatcher::new(h.refresher.clone());
        let now = at_hour(Local::now(), 10);

        let first = watcher.tick(now).await.unwrap();
        assert_eq!(first.due, vec!["agency_sales", "agency_targets", "pg_daily"]);
        let stored = h.refresher.cache().get_meta("agency_sales").await.unwrap().unwrap();
        assert_eq!(stored.data_refresh_time.as_deref(), Some(MARKER));

        let second = watcher.tick(now).await.unwrap();
        assert!(second.due.is_empty());
        assert!(second.summary.is_none());

        h.mstr.set_marker("agency_sales", "2026-01-06 10:00:00");
        let third = watcher.tick(now).await.unwrap();
        assert_eq!(third.due, vec!["agency_sales"]);
        assert!(third.summary.unwrap().refreshed.contains_key("agency_sales"));
    }

    #[tokio::test]
    async fn reports_without_a_marker_refresh_once_stale() {
        let h = harness_with(
            RefreshConfig {
                stale_after: std::time::Duration::from_secs(3_600),
                ..RefreshConfig::default()
            },
            FixtureConnector::new(DataPolicy::MicroStrategy),
        );
        let watcher = ChangeWatcher::new(h.refresher.clone());
        h.refresher.refresh(None).await.unwrap();

        assert!(watcher.due_reports(Utc::now()).await.unwrap().is_empty());
        let later = Utc::now() + ChronoDuration::hours(2);
        assert_eq!(
            watcher.due_reports(later).await.unwrap(),
            vec!["agency_sales", "agency_targets", "pg_daily"]
        );
    }

    #[tokio::test]
    async fn watcher_is_only_spawned_when_enabled() {
        let h = harness();
        assert!(maybe_spawn_watcher(&h.refresher).is_none());
    }
}
