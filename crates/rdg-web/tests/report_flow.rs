use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use rdg_core::{Cell, DataPolicy, Table};
use rdg_reports::ReportService;
use rdg_sources::{FixtureConnector, Sources};
use rdg_storage::{ConfigStore, SnapshotStore};
use rdg_sync::{RefreshConfig, Refresher};
use rdg_web::{app, AppState};
use serde_json::Value;
use tower::ServiceExt;

const CONFIG: &str = r#"
endpoints:
  agency_master_list:
    data_policy: microstrategy
    cache_policy: daily
    dossier_id: 7F3A
    viz_keys:
      summary: K52
"#;

fn master_list(rows: usize) -> Table {
    Table::with_rows(
        vec![
            "Acente Kodu".into(),
            "Acente Adı".into(),
            "Bölge Müdürlüğü".into(),
        ],
        (0..rows)
            .map(|i| {
                vec![
                    Cell::Float(100100.0 + i as f64),
                    Cell::text(format!("Acente {i}")),
                    Cell::text(if i % 2 == 0 { "İstanbul" } else { "İzmir" }),
                ]
            })
            .collect(),
    )
}

async fn get_json(app: &axum::Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn refreshed_report_is_served_from_cache_with_camel_case_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("endpoints.yaml");
    std::fs::write(&path, CONFIG).unwrap();

    let mstr = Arc::new(FixtureConnector::new(DataPolicy::MicroStrategy));
    mstr.insert_table("agency_master_list", "summary", master_list(25));
    let config = Arc::new(ConfigStore::new(path));
    let cache = SnapshotStore::in_memory();
    let sources = Sources::new().with(mstr.clone());
    let refresher = Refresher::new(
        Arc::clone(&config),
        cache.clone(),
        sources.clone(),
        RefreshConfig::default(),
    );

    let summary = refresher
        .refresh(Some(&["agency_master_list".to_string()]))
        .await
        .unwrap();
    assert!(summary.refreshed.contains_key("agency_master_list"));
    assert!(summary.errors.is_empty());

    let app = app(AppState::new(ReportService::new(config, cache, sources), refresher));
    let (status, body) = get_json(
        &app,
        "/report/agency_master_list?info_type=summary&page=1&page_size=10",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cache_hit"], true);
    assert_eq!(body["is_cached"], true);
    assert_eq!(body["total_rows"], 25);
    assert_eq!(body["total_pages"], 3);
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 10);
    let first = data[0].as_object().unwrap();
    let keys: Vec<&str> = first.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["acenteKodu", "acenteAdi", "bolgeMudurlugu"]);
    assert_eq!(first["acenteKodu"], "100100");

    // the read path never touched the source again
    assert_eq!(mstr.fetches(), 1);

    let (status, last_page) = get_json(
        &app,
        "/report/agency_master_list?info_type=summary&page=3&page_size=10",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(last_page["data"].as_array().map(Vec::len), Some(5));
}
