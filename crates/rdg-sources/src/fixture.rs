//! In-process connector serving canned tables, with failure injection.
//!
//! Used by the test suites of the crates above this one and for running the
//! gateway without any real backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rdg_core::{DataPolicy, ReportDefinition, SourceError, Table};
use tracing::debug;

use crate::{FetchRequest, FetchedTable, SourceConnection, SourceConnector};

const SOURCE_KIND: &str = "fixture";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Every fetch fails with a query error.
    Permanent,
    /// The next `remaining` fetches fail with a connection error.
    Transient { remaining: usize },
}

#[derive(Debug, Default)]
struct FixtureState {
    tables: HashMap<(String, String), Table>,
    markers: HashMap<String, String>,
    // (report, None) fails every info type of the report
    failures: HashMap<(String, Option<String>), Failure>,
    fail_connect: bool,
}

#[derive(Debug, Default)]
struct FixtureStats {
    connects: AtomicUsize,
    closes: AtomicUsize,
    fetches: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[derive(Debug)]
pub struct FixtureConnector {
    policy: DataPolicy,
    state: Arc<Mutex<FixtureState>>,
    stats: Arc<FixtureStats>,
    fetch_delay: Duration,
}

fn lock(state: &Mutex<FixtureState>) -> MutexGuard<'_, FixtureState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FixtureConnector {
    pub fn new(policy: DataPolicy) -> Self {
        Self {
            policy,
            state: Arc::default(),
            stats: Arc::default(),
            fetch_delay: Duration::ZERO,
        }
    }

    /// Every fetch sleeps this long first, to make overlap observable.
    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    pub fn insert_table(&self, report: &str, info_type: &str, table: Table) {
        lock(&self.state)
            .tables
            .insert((report.to_string(), info_type.to_string()), table);
    }

    pub fn set_marker(&self, report: &str, marker: &str) {
        lock(&self.state)
            .markers
            .insert(report.to_string(), marker.to_string());
    }

    pub fn fail(&self, report: &str, info_type: Option<&str>, failure: Failure) {
        lock(&self.state)
            .failures
            .insert((report.to_string(), info_type.map(str::to_string)), failure);
    }

    pub fn clear_failures(&self) {
        lock(&self.state).failures.clear();
    }

    pub fn set_fail_connect(&self, fail: bool) {
        lock(&self.state).fail_connect = fail;
    }

    pub fn connects(&self) -> usize {
        self.stats.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.stats.closes.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.stats.fetches.load(Ordering::SeqCst)
    }

    /// Highest number of fetches that were running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.stats.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceConnector for FixtureConnector {
    fn data_policy(&self) -> DataPolicy {
        self.policy
    }

    async fn connect(&self) -> Result<Arc<dyn SourceConnection>, SourceError> {
        if lock(&self.state).fail_connect {
            return Err(SourceError::connection(SOURCE_KIND, "connection refused"));
        }
        self.stats.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FixtureSession {
            policy: self.policy,
            state: Arc::clone(&self.state),
            stats: Arc::clone(&self.stats),
            fetch_delay: self.fetch_delay,
        }))
    }
}

struct FixtureSession {
    policy: DataPolicy,
    state: Arc<Mutex<FixtureState>>,
    stats: Arc<FixtureStats>,
    fetch_delay: Duration,
}

struct InFlight<'a>(&'a FixtureStats);

impl<'a> InFlight<'a> {
    fn enter(stats: &'a FixtureStats) -> Self {
        let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(stats)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FixtureSession {
    fn injected_failure(&self, report: &str, info_type: &str) -> Option<SourceError> {
        let mut state = lock(&self.state);
        let key = [
            (report.to_string(), Some(info_type.to_string())),
            (report.to_string(), None),
        ]
        .into_iter()
        .find(|key| state.failures.contains_key(key))?;
        let failure = state.failures.get_mut(&key)?;
        match failure {
            Failure::Permanent => Some(SourceError::Query(format!(
                "injected failure for {report}/{info_type}"
            ))),
            Failure::Transient { remaining } if *remaining > 0 => {
                *remaining -= 1;
                Some(SourceError::connection(SOURCE_KIND, "injected transient failure"))
            }
            Failure::Transient { .. } => None,
        }
    }
}

#[async_trait]
impl SourceConnection for FixtureSession {
    fn data_policy(&self) -> DataPolicy {
        self.policy
    }

    async fn fetch(
        &self,
        report: &ReportDefinition,
        info_type: &str,
        request: &FetchRequest,
    ) -> Result<FetchedTable, SourceError> {
        self.stats.fetches.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(&self.stats);
        if !self.fetch_delay.is_zero() {
            tokio::time::sleep(self.fetch_delay).await;
        }

        if let Some(err) = self.injected_failure(&report.name, info_type) {
            return Err(err);
        }
        let table = lock(&self.state)
            .tables
            .get(&(report.name.clone(), info_type.to_string()))
            .cloned()
            .ok_or_else(|| {
                SourceError::Query(format!("no fixture table for {}/{info_type}", report.name))
            })?;

        // like a source that can push nothing down: every filter comes back unapplied
        debug!(report = %report.name, info_type, rows = table.len(), "fixture fetch");
        Ok(FetchedTable::unfiltered(table, request))
    }

    async fn refresh_marker(&self, report: &ReportDefinition) -> Result<Option<String>, SourceError> {
        Ok(lock(&self.state).markers.get(&report.name).cloned())
    }

    async fn close(&self) {
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
    }
}
