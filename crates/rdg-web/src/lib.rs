//! Axum HTTP surface for the report gateway: reads, listing, refresh triggers,
//! cache admin and endpoint-definition admin, all as JSON.

pub mod error;

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rdg_core::env::{env_or, env_parse};
use rdg_core::{ReportCatalog, ReportDefinition};
use rdg_reports::{ReportQuery, ReportService};
use rdg_sources::Sources;
use rdg_storage::{CacheConfig, ConfigStore, SnapshotStore};
use rdg_sync::{maybe_build_scheduler, maybe_spawn_watcher, RefreshConfig, Refresher, UNKNOWN_REPORT};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub use error::ApiError;

pub const CRATE_NAME: &str = "rdg-web";

#[derive(Clone)]
pub struct AppState {
    pub reports: ReportService,
    pub refresher: Refresher,
}

impl AppState {
    pub fn new(reports: ReportService, refresher: Refresher) -> Self {
        Self { reports, refresher }
    }

    /// Wires config store, cache and connectors from the environment.
    pub async fn from_env() -> anyhow::Result<Self> {
        let config = Arc::new(ConfigStore::from_env());
        let cache_config = CacheConfig::from_env().context("reading cache settings")?;
        let cache = SnapshotStore::from_config(&cache_config)
            .await
            .context("opening snapshot cache")?;
        let sources = Sources::from_env().context("configuring source connectors")?;
        info!(
            config = %config.path().display(),
            cache = cache.backend_name(),
            sources = ?sources.configured(),
            "gateway state ready"
        );
        let reports = ReportService::new(Arc::clone(&config), cache.clone(), sources.clone());
        let refresher = Refresher::new(config, cache, sources, RefreshConfig::from_env());
        Ok(Self::new(reports, refresher))
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            host: env_or("RDG_HOST", "0.0.0.0"),
            port: env_parse("RDG_PORT", 8000),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/report/{name}", get(report_handler))
        .route("/report/{name}/agency/{code}", get(agency_report_handler))
        .route("/reports", get(reports_handler))
        .route("/refresh", post(refresh_all_handler))
        .route("/refresh/{name}", post(refresh_one_handler))
        .route("/refresh/meta/{name}", get(refresh_meta_handler))
        .route("/cache/{name}", axum::routing::delete(purge_cache_handler))
        .route("/health", get(health_handler))
        .route("/admin/endpoints", get(list_endpoints_handler))
        .route(
            "/admin/endpoints/{name}",
            get(get_endpoint_handler)
                .post(create_endpoint_handler)
                .put(put_endpoint_handler)
                .delete(delete_endpoint_handler),
        )
        .layer(CatchPanicLayer::custom(error::panic_response))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Serves until ctrl-c, with the cron scheduler and change watcher when enabled.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let server = ServerConfig::from_env();
    let state = AppState::from_env().await?;

    let scheduler = maybe_build_scheduler(state.refresher.clone()).await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await.context("starting scheduler")?;
        info!(cron = %state.refresher.settings().refresh_cron, "refresh scheduler started");
    }
    let watcher = maybe_spawn_watcher(&state.refresher);

    let listener = TcpListener::bind((server.host.as_str(), server.port))
        .await
        .with_context(|| format!("binding {}:{}", server.host, server.port))?;
    info!(host = %server.host, port = server.port, "listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "ctrl-c handler failed");
            }
        })
        .await
        .context("serving http")?;

    if let Some(watcher) = watcher {
        watcher.abort();
    }
    if let Some(mut scheduler) = scheduler {
        scheduler.shutdown().await.context("stopping scheduler")?;
    }
    Ok(())
}

type AppStateRef = State<Arc<AppState>>;
type Params = Query<Vec<(String, String)>>;

async fn report_handler(
    State(state): AppStateRef,
    Path(name): Path<String>,
    Query(params): Params,
) -> Result<Response, ApiError> {
    let query = ReportQuery::from_params(params);
    let response = state.reports.get_report(&name, &query).await?;
    Ok(Json(response).into_response())
}

async fn agency_report_handler(
    State(state): AppStateRef,
    Path((name, code)): Path<(String, String)>,
    Query(params): Params,
) -> Result<Response, ApiError> {
    let query = ReportQuery::from_params(params).with_entity(&code);
    let response = state.reports.get_report(&name, &query).await?;
    Ok(Json(response).into_response())
}

async fn reports_handler(State(state): AppStateRef) -> Result<Response, ApiError> {
    Ok(Json(state.reports.list_reports().await?).into_response())
}

async fn refresh_all_handler(State(state): AppStateRef) -> Result<Response, ApiError> {
    let summary = state.refresher.refresh(None).await?;
    let status = if summary.refreshed_any() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(summary)).into_response())
}

async fn refresh_one_handler(
    State(state): AppStateRef,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::BadRequest("Report name is required.".to_string()));
    }

    let mut summary = state.refresher.refresh(Some(&[name.clone()])).await?;
    if let Some(meta) = summary.refreshed.remove(&name) {
        let errors = summary.errors.remove(&name).unwrap_or_default();
        return Ok(Json(json!({
            "status": "refreshed",
            "report": name,
            "meta": meta,
            "errors": errors,
        }))
        .into_response());
    }

    let previous = state.refresher.cache().get_meta(&name).await?;
    if let Some(reason) = summary.skipped.remove(&name) {
        let body = json!({ "status": "skipped", "report": name, "reason": reason, "meta": previous });
        return Ok((StatusCode::CONFLICT, Json(body)).into_response());
    }
    let errors = summary.errors.remove(&name).unwrap_or_default();
    let unknown = errors.iter().any(|e| e == UNKNOWN_REPORT);
    let status = if unknown && previous.is_none() {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::BAD_REQUEST
    };
    let body = json!({ "status": "error", "report": name, "errors": errors, "meta": previous });
    Ok((status, Json(body)).into_response())
}

async fn refresh_meta_handler(
    State(state): AppStateRef,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let meta = state.refresher.cache().get_meta(&name).await?;
    let status = if meta.is_some() {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    Ok((status, Json(json!({ "report": name, "meta": meta }))).into_response())
}

async fn purge_cache_handler(
    State(state): AppStateRef,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let purged = state.reports.cache().purge(&name).await?;
    info!(report = %name, purged, "cache purged");
    Ok(Json(json!({ "report": name, "purged": purged })).into_response())
}

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    config: ComponentHealth,
    cache: ComponentHealth,
    sources: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ComponentHealth {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn health_handler(State(state): AppStateRef) -> Response {
    let config = match state.reports.config().load().await {
        Ok(catalog) => ComponentHealth {
            ok: true,
            detail: Some(json!({ "reports": catalog.len(), "invalid": catalog.rejected.len() })),
            error: None,
        },
        Err(err) => ComponentHealth {
            ok: false,
            detail: None,
            error: Some(err.to_string()),
        },
    };
    let cache_store = state.reports.cache();
    let cache = match cache_store.ping().await {
        Ok(()) => ComponentHealth {
            ok: true,
            detail: Some(json!({ "backend": cache_store.backend_name() })),
            error: None,
        },
        Err(err) => ComponentHealth {
            ok: false,
            detail: Some(json!({ "backend": cache_store.backend_name() })),
            error: Some(err.to_string()),
        },
    };
    let healthy = config.ok && cache.ok;
    let report = HealthReport {
        status: if healthy { "ok" } else { "degraded" },
        config,
        cache,
        sources: state
            .reports
            .sources()
            .configured()
            .into_iter()
            .map(|policy| policy.to_string())
            .collect(),
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, ApiError> {
    serde_json::to_value(value).map_err(|err| ApiError::Internal(err.to_string()))
}

fn definition_body(body: Value) -> Result<serde_yaml::Value, ApiError> {
    if !body.is_object() {
        return Err(ApiError::BadRequest(
            "endpoint definition must be a JSON object".to_string(),
        ));
    }
    serde_yaml::to_value(&body).map_err(|err| ApiError::BadRequest(err.to_string()))
}

fn saved(definition: &ReportDefinition) -> Value {
    json!({
        "report": definition.name,
        "data_policy": definition.data_policy(),
        "cache_policy": definition.cache_policy,
        "info_types": definition.info_types(),
    })
}

async fn list_endpoints_handler(State(state): AppStateRef) -> Result<Response, ApiError> {
    let entries = state.reports.config().load_entries().await?;
    let catalog = ReportCatalog::from_entries(&entries);
    Ok(Json(json!({
        "path": state.reports.config().path().display().to_string(),
        "endpoints": to_json(&entries)?,
        "invalid": catalog.rejected,
    }))
    .into_response())
}

async fn get_endpoint_handler(
    State(state): AppStateRef,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let raw = state.reports.config().get_raw(&name).await?;
    Ok(Json(json!({ "report": name, "definition": to_json(&raw)? })).into_response())
}

async fn create_endpoint_handler(
    State(state): AppStateRef,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let definition = state.reports.config().create(&name, definition_body(body)?).await?;
    Ok((StatusCode::CREATED, Json(saved(&definition))).into_response())
}

async fn put_endpoint_handler(
    State(state): AppStateRef,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let definition = state.reports.config().upsert(&name, definition_body(body)?).await?;
    Ok(Json(saved(&definition)).into_response())
}

async fn delete_endpoint_handler(
    State(state): AppStateRef,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    state.reports.config().remove(&name).await?;
    Ok(Json(json!({ "report": name, "deleted": true })).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use rdg_core::{Cell, DataPolicy, Table};
    use rdg_sources::FixtureConnector;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const CONFIG: &str = r#"
endpoints:
  agency_sales:
    data_policy: microstrategy
    cache_policy: daily
    dossier_id: D1
    viz_keys: {summary: K1}
    filters: {agency_name: F_AGENCY}
  live_pg:
    source: postgresql
    postgres_table: public.sales
"#;

    struct Harness {
        dir: TempDir,
        app: Router,
        mstr: Arc<FixtureConnector>,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("endpoints.yaml");
        std::fs::write(&path, CONFIG).unwrap();
        let config = Arc::new(ConfigStore::new(path));
        let cache = SnapshotStore::in_memory();
        let mstr = Arc::new(FixtureConnector::new(DataPolicy::MicroStrategy));
        let pg = Arc::new(FixtureConnector::new(DataPolicy::PostgreSql));
        mstr.insert_table(
            "agency_sales",
            "summary",
            Table::with_rows(
                vec!["Agency Code".into(), "Amount".into()],
                vec![
                    vec![Cell::Float(100100.0), Cell::Int(1)],
                    vec![Cell::Float(200200.0), Cell::Int(2)],
                ],
            ),
        );
        pg.insert_table(
            "live_pg",
            "summary",
            Table::with_rows(vec!["region".into()], vec![vec![Cell::text("north")]]),
        );
        let sources = Sources::new().with(mstr.clone()).with(pg);
        let reports = ReportService::new(Arc::clone(&config), cache.clone(), sources.clone());
        let refresher = Refresher::new(config, cache, sources, RefreshConfig::default());
        Harness {
            dir,
            app: app(AppState::new(reports, refresher)),
            mstr,
        }
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(body) => request.body(Body::from(body.to_string())).unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn unknown_report_is_404_and_bad_info_type_is_400() {
        let h = harness();
        let (status, body) = call(&h.app, "GET", "/report/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Report 'nope' not found in configuration.");

        let (status, _) = call(&h.app, "GET", "/report/agency_sales?info_type=detail", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn live_report_ignores_unknown_filters() {
        let h = harness();
        let (status, plain) = call(&h.app, "GET", "/report/live_pg", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, noisy) = call(&h.app, "GET", "/report/live_pg?doesnotexist=foo", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(plain["data"], noisy["data"]);
        assert_eq!(plain["cache_hit"], false);
    }

    #[tokio::test]
    async fn refresh_then_agency_read_hits_the_cache() {
        let h = harness();
        let (status, body) = call(&h.app, "POST", "/refresh/agency_sales", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "refreshed");

        let (status, body) = call(&h.app, "GET", "/report/agency_sales/agency/100100", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cache_hit"], true);
        assert_eq!(body["agency"], "100100");
        assert_eq!(body["total_rows"], 1);
        assert_eq!(body["data"][0]["agencyCode"], "100100");

        let (status, body) = call(&h.app, "GET", "/refresh/meta/agency_sales", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["meta"]["info_types"]["summary"]["rows"], 2);
    }

    #[tokio::test]
    async fn single_refresh_statuses() {
        let h = harness();
        let (status, body) = call(&h.app, "POST", "/refresh/live_pg", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["status"], "skipped");

        let (status, _) = call(&h.app, "POST", "/refresh/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        h.mstr.fail("agency_sales", None, rdg_sources::fixture::Failure::Permanent);
        let (status, body) = call(&h.app, "POST", "/refresh/agency_sales", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errors"].as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn refresh_all_is_202_when_nothing_refreshed() {
        let h = harness();
        h.mstr.set_fail_connect(true);
        let (status, body) = call(&h.app, "POST", "/refresh", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body["errors"]["agency_sales"].is_array());

        h.mstr.set_fail_connect(false);
        let (status, _) = call(&h.app, "POST", "/refresh", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn meta_for_unrefreshed_report_is_404_with_null() {
        let h = harness();
        let (status, body) = call(&h.app, "GET", "/refresh/meta/agency_sales", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["meta"].is_null());
    }

    #[tokio::test]
    async fn purge_drops_snapshots_and_meta() {
        let h = harness();
        call(&h.app, "POST", "/refresh/agency_sales", None).await;
        let (status, body) = call(&h.app, "DELETE", "/cache/agency_sales", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["purged"], 2);
        let (status, _) = call(&h.app, "GET", "/refresh/meta/agency_sales", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_reports_components() {
        let h = harness();
        let (status, body) = call(&h.app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["config"]["detail"]["reports"], 2);
        assert_eq!(body["cache"]["detail"]["backend"], "memory");

        std::fs::write(h.dir.path().join("endpoints.yaml"), "- just\n- a list\n").unwrap();
        let (status, body) = call(&h.app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["config"]["ok"], false);
    }

    #[tokio::test]
    async fn admin_endpoint_lifecycle() {
        let h = harness();
        let definition = json!({
            "source": "postgresql",
            "postgres_table": "public.orders",
            "cache_policy": "daily",
        });

        let (status, body) = call(&h.app, "POST", "/admin/endpoints/orders", Some(definition.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data_policy"], "postgresql");
        assert_eq!(body["cache_policy"], "daily");

        let (status, _) = call(&h.app, "POST", "/admin/endpoints/orders", Some(definition)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(
            &h.app,
            "PUT",
            "/admin/endpoints/orders",
            Some(json!({ "source": "postgresql", "postgres_table": "bad;name" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&h.app, "GET", "/admin/endpoints/orders", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["definition"]["postgres_table"], "public.orders");

        let (_, listing) = call(&h.app, "GET", "/reports", None).await;
        assert_eq!(listing["total_count"], 3);

        let (status, _) = call(&h.app, "DELETE", "/admin/endpoints/orders", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&h.app, "GET", "/admin/endpoints/orders", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
