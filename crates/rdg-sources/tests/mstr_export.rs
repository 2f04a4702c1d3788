use std::collections::BTreeMap;
use std::time::Duration;

use rdg_core::report::SourceLocator;
use rdg_core::{CachePolicy, Cell, MstrLocator, ReportDefinition, SourceError};
use rdg_sources::{FetchRequest, MstrConfig, MstrConnector, Pagination, SourceConnector};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn report() -> ReportDefinition {
    ReportDefinition {
        name: "sales".to_string(),
        description: None,
        cache_policy: CachePolicy::Daily,
        per_page: 100,
        date_columns: Vec::new(),
        source: SourceLocator::MicroStrategy(MstrLocator {
            dossier_id: "D1".to_string(),
            cube_id: Some("C1".to_string()),
            viz_keys: BTreeMap::from([("summary".to_string(), "K1".to_string())]),
            filter_mappings: BTreeMap::from([("agency_name".to_string(), "F_AGENCY".to_string())]),
        }),
    }
}

fn utf16le_with_bom(text: &str) -> Vec<u8> {
    let mut out = vec![0xFF, 0xFE];
    for unit in text.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

fn config(server: &MockServer) -> MstrConfig {
    let mut config = MstrConfig::new(format!("{}/api", server.uri()), "svc", "secret");
    config.poll_interval = Duration::from_millis(10);
    config.poll_timeout = Duration::from_millis(300);
    config
}

async fn mount_login(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .and(body_partial_json(serde_json::json!({"username": "svc", "loginMode": 1})))
        .respond_with(ResponseTemplate::new(204).insert_header("X-MSTR-AuthToken", "tok-1"))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/dossiers/D1/instances"))
        .and(header("X-MSTR-AuthToken", "tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"mid": "M1"})))
        .mount(server)
        .await;
}

#[tokio::test]
async fn export_is_polled_decoded_and_stamped() {
    let server = MockServer::start().await;
    mount_login(&server).await;

    let csv_path = "/api/documents/D1/instances/M1/visualizations/K1/csv";
    Mock::given(method("POST"))
        .and(path(csv_path))
        .respond_with(ResponseTemplate::new(202))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(csv_path))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(utf16le_with_bom(
            "Agency Code,Description,Amount\n101,Kasko,10.5\n102,Trafik,3\n,Total,13.5\n",
        )))
        .with_priority(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/cubes/C1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"lastUpdateTime": "2024-03-05T06:07:08Z"})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/logout"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let connector = MstrConnector::new(config(&server));
    let session = connector.connect().await.expect("login");
    let fetched = session
        .fetch(&report(), "summary", &FetchRequest::full())
        .await
        .expect("fetch");

    assert!(!fetched.paged);
    assert!(!fetched.entity_scoped);
    assert_eq!(fetched.total_records, 2);
    assert_eq!(
        fetched.table.columns,
        vec!["Agency Code", "Description", "Amount", "dataRefreshTime"]
    );
    assert_eq!(fetched.table.rows[0][2], Cell::Float(10.5));
    assert_eq!(fetched.table.rows[1][3], Cell::text("2024-03-05 06:07:08"));

    let marker = session.refresh_marker(&report()).await.expect("marker");
    assert_eq!(marker.as_deref(), Some("2024-03-05 06:07:08"));
    session.close().await;
}

#[tokio::test]
async fn mapped_entity_is_pushed_into_the_view_filter() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/documents/D1/instances/M1/visualizations/K1/csv"))
        .and(body_partial_json(serde_json::json!({"limit": 1, "offset": 1})))
        .respond_with(ResponseTemplate::new(200).set_body_string("Agency Code,Amount\n101,4\n"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/cubes/C1"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let session = MstrConnector::new(config(&server)).connect().await.expect("login");
    let request = FetchRequest {
        filters: BTreeMap::new(),
        entity_code: Some("101".to_string()),
        pagination: Pagination::page(2, 1),
    };
    let fetched = session.fetch(&report(), "summary", &request).await.expect("fetch");

    assert!(fetched.paged);
    assert!(fetched.entity_scoped);
    assert!(fetched.unapplied_filters.is_empty());
    assert_eq!(fetched.total_records, 2);
    // an unavailable cube time is not fatal, the column is simply absent
    assert_eq!(fetched.table.columns, vec!["Agency Code", "Amount"]);
    assert!(fetched.query_text.unwrap_or_default().contains("h101"));
}

#[tokio::test]
async fn unmapped_parameters_come_back_unapplied_and_unpaged() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    let csv_path = "/api/documents/D1/instances/M1/visualizations/K1/csv";
    Mock::given(method("POST"))
        .and(path(csv_path))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("Region,Amount
north,1
south,2
south,3
"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/cubes/C1"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let session = MstrConnector::new(config(&server)).connect().await.expect("login");
    let request = FetchRequest {
        filters: BTreeMap::from([("region".to_string(), "south".to_string())]),
        entity_code: None,
        pagination: Pagination::page(1, 1),
    };
    let fetched = session.fetch(&report(), "summary", &request).await.expect("fetch");

    assert!(!fetched.paged);
    assert_eq!(fetched.total_records, 3);
    assert_eq!(
        fetched.unapplied_filters.get("region").map(String::as_str),
        Some("south")
    );
    let requests = server.received_requests().await.expect("recording is on");
    let export = requests
        .iter()
        .find(|r| r.url.path() == csv_path)
        .expect("export request");
    let body: serde_json::Value = serde_json::from_slice(&export.body).expect("json body");
    assert!(body.get("limit").is_none());
    assert!(body.get("viewFilter").is_none());
}

#[tokio::test]
async fn export_that_never_finishes_times_out() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/documents/D1/instances/M1/visualizations/K1/csv"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    let session = MstrConnector::new(config(&server)).connect().await.expect("login");
    let err = session
        .fetch(&report(), "summary", &FetchRequest::full())
        .await
        .unwrap_err();
    assert!(matches!(err, SourceError::PollTimeout { .. }));
    assert!(err.is_transient());
}

#[tokio::test]
async fn rejected_login_is_a_connection_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let err = MstrConnector::new(config(&server))
        .connect()
        .await
        .err()
        .expect("login must fail");
    assert!(matches!(err, SourceError::Connection { .. }));
}
