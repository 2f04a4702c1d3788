//! MicroStrategy REST connector: login, dossier instance, polled CSV export.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime};
use rdg_core::env::{env_opt, env_parse};
use rdg_core::report::SourceLocator;
use rdg_core::table::DATETIME_FORMAT;
use rdg_core::{is_reserved_query_key, Cell, DataPolicy, MstrLocator, ReportDefinition, SourceError};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::payload::{decode_payload, parse_csv, strip_total_rows};
use crate::{FetchRequest, FetchedTable, SourceConnection, SourceConnector};

const SOURCE_KIND: &str = "microstrategy";
const AUTH_HEADER: &str = "X-MSTR-AuthToken";
const PROJECT_HEADER: &str = "X-MSTR-ProjectID";
/// Column carrying the cube's last update time on fetched tables.
pub const REFRESH_TIME_COLUMN: &str = "dataRefreshTime";

#[derive(Clone)]
pub struct MstrConfig {
    /// REST root, e.g. `https://host/MicroStrategyLibrary/api`.
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub project_id: Option<String>,
    pub login_mode: u32,
    pub http_timeout: Duration,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
}

impl fmt::Debug for MstrConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MstrConfig")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("project_id", &self.project_id)
            .field("login_mode", &self.login_mode)
            .field("http_timeout", &self.http_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("poll_timeout", &self.poll_timeout)
            .finish()
    }
}

impl MstrConfig {
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
            project_id: None,
            login_mode: 1,
            http_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(500),
            poll_timeout: Duration::from_secs(90),
        }
    }

    /// Reads `MSTR_*` variables; `None` unless URL and credentials are all set.
    pub fn from_env() -> Option<Self> {
        let base_url = env_opt("MSTR_BASE_URL")?;
        let (Some(username), Some(password)) = (env_opt("MSTR_USERNAME"), env_opt("MSTR_PASSWORD"))
        else {
            warn!("MSTR_BASE_URL is set without MSTR_USERNAME/MSTR_PASSWORD; connector disabled");
            return None;
        };
        let mut config = Self::new(base_url, username, password);
        config.project_id = env_opt("MSTR_PROJECT_ID");
        config.login_mode = env_parse("MSTR_LOGIN_MODE", 1);
        config.http_timeout = Duration::from_secs(env_parse("MSTR_HTTP_TIMEOUT_SECS", 300));
        config.poll_interval = Duration::from_millis(env_parse("MSTR_POLL_INTERVAL_MS", 500));
        config.poll_timeout = Duration::from_secs(env_parse("MSTR_POLL_TIMEOUT_SECS", 90));
        Some(config)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn transport(err: reqwest::Error) -> SourceError {
    SourceError::connection(SOURCE_KIND, err.to_string())
}

fn http_error(status: StatusCode, url: &str) -> SourceError {
    SourceError::Http {
        status: status.as_u16(),
        url: url.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct MstrConnector {
    config: MstrConfig,
}

impl MstrConnector {
    pub fn new(config: MstrConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MstrConfig {
        &self.config
    }
}

#[async_trait]
impl SourceConnector for MstrConnector {
    fn data_policy(&self) -> DataPolicy {
        DataPolicy::MicroStrategy
    }

    async fn connect(&self) -> Result<Arc<dyn SourceConnection>, SourceError> {
        // one cookie jar per session; the export endpoints are sticky to it
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .cookie_store(true)
            .timeout(self.config.http_timeout)
            .build()
            .map_err(transport)?;

        let url = self.config.url("/auth/login");
        let response = client
            .post(&url)
            .json(&json!({
                "username": self.config.username,
                "password": self.config.password,
                "loginMode": self.config.login_mode,
            }))
            .send()
            .await
            .map_err(transport)?;

        if !response.status().is_success() {
            return Err(SourceError::connection(
                SOURCE_KIND,
                format!("login rejected with status {}", response.status()),
            ));
        }
        let token = response
            .headers()
            .get(AUTH_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| SourceError::connection(SOURCE_KIND, "login response carried no auth token"))?;

        info!(base_url = %self.config.base_url, "microstrategy session opened");
        Ok(Arc::new(MstrSession {
            client,
            config: self.config.clone(),
            token,
        }))
    }
}

pub struct MstrSession {
    client: reqwest::Client,
    config: MstrConfig,
    token: String,
}

impl MstrSession {
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut builder = self
            .client
            .request(method, self.config.url(path))
            .header(AUTH_HEADER, &self.token);
        if let Some(project_id) = &self.config.project_id {
            builder = builder.header(PROJECT_HEADER, project_id);
        }
        builder
    }

    async fn create_instance(&self, dossier_id: &str, view_filter: Option<&Value>) -> Result<String, SourceError> {
        let path = format!("/dossiers/{dossier_id}/instances");
        let mut body = json!({});
        if let Some(filter) = view_filter {
            body["viewFilter"] = filter.clone();
        }
        let response = self
            .request(Method::POST, &path)
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        if !response.status().is_success() {
            return Err(http_error(response.status(), &self.config.url(&path)));
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|err| SourceError::Decode(err.to_string()))?;
        payload
            .get("mid")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SourceError::Decode(format!("instance for dossier {dossier_id} has no mid")))
    }

    /// Polls the CSV export until the backend reports success.
    async fn export_csv(&self, path: &str, body: &Value) -> Result<Vec<u8>, SourceError> {
        let started = Instant::now();
        loop {
            match self.request(Method::POST, path).json(body).send().await {
                Ok(response) if response.status().is_success() => {
                    let bytes = response.bytes().await.map_err(transport)?;
                    debug!(bytes = bytes.len(), elapsed = ?started.elapsed(), "export ready");
                    return Ok(bytes.to_vec());
                }
                Ok(response)
                    if matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) =>
                {
                    return Err(http_error(response.status(), &self.config.url(path)));
                }
                Ok(response) => debug!(status = %response.status(), "export not ready"),
                Err(err) => debug!(error = %err, "export poll failed"),
            }
            if started.elapsed() >= self.config.poll_timeout {
                return Err(SourceError::PollTimeout {
                    after: self.config.poll_timeout,
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn cube_update_time(&self, cube_id: &str) -> Result<Option<String>, SourceError> {
        let path = format!("/cubes/{cube_id}");
        let response = self
            .request(Method::GET, &path)
            .send()
            .await
            .map_err(transport)?;
        if !response.status().is_success() {
            return Err(http_error(response.status(), &self.config.url(&path)));
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|err| SourceError::Decode(err.to_string()))?;
        let raw = payload
            .get("lastUpdateTime")
            .or_else(|| payload.pointer("/information/dateModified"))
            .and_then(Value::as_str);
        Ok(raw.map(format_update_time))
    }
}

fn locator(report: &ReportDefinition) -> Result<&MstrLocator, SourceError> {
    match &report.source {
        SourceLocator::MicroStrategy(mstr) => Ok(mstr),
        other => Err(SourceError::InvalidLocator(format!(
            "report '{}' is a {} report",
            report.name,
            other.data_policy()
        ))),
    }
}

/// Cube timestamps arrive as ISO-8601; they are shown as `%Y-%m-%d %H:%M:%S`.
pub fn format_update_time(raw: &str) -> String {
    let with_offset = DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z"));
    if let Ok(parsed) = with_offset {
        return parsed.naive_local().format(DATETIME_FORMAT).to_string();
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|parsed| parsed.format(DATETIME_FORMAT).to_string())
        .unwrap_or_else(|| raw.to_string())
}

/// Builds the dossier `viewFilter` from request parameters.
///
/// Parameters are grouped by the attribute they map to. A group holding a
/// `*_start` and a `*_end` parameter becomes a date `Between`; anything else
/// becomes `Equals` (one value) or `In` (comma-separated values).
pub fn build_view_filter(
    mappings: &BTreeMap<String, String>,
    params: &BTreeMap<String, String>,
) -> Option<Value> {
    let mut groups: Vec<(&str, Vec<(&str, &str)>)> = Vec::new();
    for (name, value) in params {
        if is_reserved_query_key(name) || value.trim().is_empty() {
            continue;
        }
        let Some(filter_id) = mappings.get(name) else {
            debug!(param = %name, "no microstrategy filter mapping, left for in-memory filtering");
            continue;
        };
        match groups.iter_mut().find(|(id, _)| *id == filter_id.as_str()) {
            Some((_, members)) => members.push((name.as_str(), value.as_str())),
            None => groups.push((filter_id.as_str(), vec![(name.as_str(), value.as_str())])),
        }
    }
    if groups.is_empty() {
        return None;
    }

    let mut operands = Vec::new();
    for (filter_id, members) in groups {
        let start = members.iter().find(|(name, _)| name.ends_with("_start"));
        let end = members.iter().find(|(name, _)| name.ends_with("_end"));
        if let (Some((_, start)), Some((_, end))) = (start, end) {
            operands.push(json!({
                "operator": "Between",
                "operands": [
                    {"type": "filter", "id": filter_id},
                    {"type": "constants", "dataType": "Date", "values": [start.trim(), end.trim()]},
                ],
            }));
            continue;
        }
        for (_, value) in members {
            let values: Vec<&str> = value
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .collect();
            if values.is_empty() {
                continue;
            }
            let operator = if values.len() == 1 { "Equals" } else { "In" };
            let elements: Vec<Value> = values.iter().map(|v| json!({"id": format!("h{v}")})).collect();
            operands.push(json!({
                "operator": operator,
                "operands": [
                    {"type": "filter", "id": filter_id},
                    {"type": "elements", "elements": elements},
                ],
            }));
        }
    }
    Some(json!({"operator": "And", "operands": operands}))
}

#[async_trait]
impl SourceConnection for MstrSession {
    fn data_policy(&self) -> DataPolicy {
        DataPolicy::MicroStrategy
    }

    async fn fetch(
        &self,
        report: &ReportDefinition,
        info_type: &str,
        request: &FetchRequest,
    ) -> Result<FetchedTable, SourceError> {
        let mstr = locator(report)?;
        let viz_key = mstr.viz_keys.get(info_type).ok_or_else(|| {
            SourceError::InvalidLocator(format!(
                "report '{}' has no visualization for info type '{info_type}'",
                report.name
            ))
        })?;

        let mut params = request.filters.clone();
        if let Some(code) = &request.entity_code {
            params.insert(rdg_core::ENTITY_FILTER_PARAM.to_string(), code.clone());
        }
        let entity_scoped = request.entity_code.is_some()
            && mstr.filter_mappings.contains_key(rdg_core::ENTITY_FILTER_PARAM);
        let view_filter = build_view_filter(&mstr.filter_mappings, &params);
        let unapplied = request.unapplied_filters(|key| mstr.filter_mappings.contains_key(key));

        let span = info_span!("mstr_fetch", report = %report.name, info_type, dossier = %mstr.dossier_id);
        async {
            let mid = self.create_instance(&mstr.dossier_id, view_filter.as_ref()).await?;

            let mut body = json!({"requestedObjects": {"visualizations": [{"id": viz_key}]}});
            if let Some(filter) = &view_filter {
                body["viewFilter"] = filter.clone();
            }
            // paging before local filtering or scoping would drop the wrong rows
            let paging = request.source_paging(&unapplied, entity_scoped);
            if let Some((limit, offset)) = paging {
                body["limit"] = json!(limit);
                if offset > 0 {
                    body["offset"] = json!(offset);
                }
            }

            let path = format!(
                "/documents/{}/instances/{mid}/visualizations/{viz_key}/csv",
                mstr.dossier_id
            );
            let bytes = self.export_csv(&path, &body).await?;
            let text = decode_payload(&bytes)?;
            let mut table = parse_csv(&text)?;
            let stripped = strip_total_rows(&mut table);
            if stripped > 0 {
                debug!(stripped, "removed total rows");
            }

            if let Some(cube_id) = &mstr.cube_id {
                match self.cube_update_time(cube_id).await {
                    Ok(Some(refreshed)) => table.push_constant_column(REFRESH_TIME_COLUMN, Cell::Text(refreshed)),
                    Ok(None) => {}
                    Err(err) => warn!(error = %err, cube_id = %cube_id, "cube update time unavailable"),
                }
            }

            let query_text = view_filter.as_ref().map(Value::to_string);
            let fetched = match paging {
                // the export honoured limit/offset; a page never exceeds its limit
                Some((limit, offset)) if table.len() <= limit => FetchedTable {
                    total_records: offset + table.len(),
                    table,
                    paged: true,
                    entity_scoped,
                    unapplied_filters: BTreeMap::new(),
                    query_text,
                },
                _ => FetchedTable {
                    total_records: table.len(),
                    table,
                    paged: false,
                    entity_scoped,
                    unapplied_filters: unapplied.clone(),
                    query_text,
                },
            };
            info!(rows = fetched.table.len(), paged = fetched.paged, "microstrategy export fetched");
            Ok(fetched)
        }
        .instrument(span)
        .await
    }

    async fn refresh_marker(&self, report: &ReportDefinition) -> Result<Option<String>, SourceError> {
        match &locator(report)?.cube_id {
            Some(cube_id) => self.cube_update_time(cube_id).await,
            None => Ok(None),
        }
    }

    async fn close(&self) {
        match self.request(Method::POST, "/auth/logout").send().await {
            Ok(response) if response.status().is_success() => debug!("microstrategy session closed"),
            Ok(response) => warn!(status = %response.status(), "microstrategy logout rejected"),
            Err(err) => warn!(error = %err, "microstrategy logout failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn view_filter_groups_dates_and_splits_lists() {
        let mappings = map(&[
            ("agency_name", "F_AGENCY"),
            ("date_start", "F_DATE"),
            ("date_end", "F_DATE"),
        ]);
        let params = map(&[
            ("agency_name", "A1, B2"),
            ("date_end", "2024-01-31"),
            ("date_start", "2024-01-01"),
            ("page", "3"),
            ("unmapped", "x"),
        ]);
        let filter = build_view_filter(&mappings, &params).unwrap();
        assert_eq!(
            filter,
            json!({
                "operator": "And",
                "operands": [
                    {
                        "operator": "In",
                        "operands": [
                            {"type": "filter", "id": "F_AGENCY"},
                            {"type": "elements", "elements": [{"id": "hA1"}, {"id": "hB2"}]},
                        ],
                    },
                    {
                        "operator": "Between",
                        "operands": [
                            {"type": "filter", "id": "F_DATE"},
                            {"type": "constants", "dataType": "Date", "values": ["2024-01-01", "2024-01-31"]},
                        ],
                    },
                ],
            })
        );
    }

    #[test]
    fn no_mapped_parameters_means_no_filter() {
        let mappings = map(&[("agency_name", "F_AGENCY")]);
        assert!(build_view_filter(&mappings, &map(&[("other", "1")])).is_none());
        let single = build_view_filter(&mappings, &map(&[("agency_name", "42")])).unwrap();
        assert_eq!(single["operands"][0]["operator"], "Equals");
    }

    #[test]
    fn cube_timestamps_are_reformatted() {
        assert_eq!(format_update_time("2024-03-05T06:07:08.000+0000"), "2024-03-05 06:07:08");
        assert_eq!(format_update_time("2024-03-05T06:07:08Z"), "2024-03-05 06:07:08");
        assert_eq!(format_update_time("yesterday"), "yesterday");
    }
}
