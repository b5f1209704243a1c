//! End-to-end tests for the gateway router
//!
//! Every test builds an isolated pipeline over the in-memory warehouse and
//! drives it through the real axum router with `tower::ServiceExt::oneshot`.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::Response,
    Router,
};
use dataproduct_gateway_api::{
    api_keys::{KeyStore, KeyStoreConfig},
    audit::{AuditLogger, AuditRecord},
    circuit_breaker::CircuitState,
    pipeline::{DataRequest, RequestContext},
    registry::{DatasetRegistry, ALIASES},
    router, AppState, GatewayConfig, Pipeline,
};
use dataproduct_gateway_core::{ErrorCode, Row};
use dataproduct_gateway_warehouse::{
    memory::{row, InMemoryConnector, StaticCredentialProvider},
    ConnectorError,
};
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower::ServiceExt;

const TEST_KEY: &str = "test-key-123";
const ADMIN_SECRET: &str = "admin-secret";

// =============================================================================
// Test Helpers
// =============================================================================

struct Gateway {
    app: Router,
    state: AppState,
    connector: Arc<InMemoryConnector>,
    credentials: Arc<StaticCredentialProvider>,
    audit: mpsc::Receiver<AuditRecord>,
}

impl Gateway {
    async fn send(&self, request: Request<Body>) -> Response {
        self.app.clone().oneshot(request).await.unwrap()
    }

    async fn get(&self, uri: &str) -> Response {
        self.send(data_request(uri, Some(TEST_KEY))).await
    }

    fn audit_records(&mut self) -> Vec<AuditRecord> {
        let mut records = Vec::new();
        while let Ok(record) = self.audit.try_recv() {
            records.push(record);
        }
        records
    }
}

/// Twenty companies, alternating between Tech and Retail.
fn companies() -> Vec<Row> {
    (0..20)
        .map(|i| {
            let industry = if i % 2 == 0 { "Tech" } else { "Retail" };
            row(&[
                ("id", json!(i)),
                ("name", json!(format!("Company {}", i))),
                ("industry", json!(industry)),
            ])
        })
        .collect()
}

fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.keys = KeyStoreConfig::default()
        .with_bootstrap_key(TEST_KEY)
        .with_admin_secret(ADMIN_SECRET);
    config
}

fn gateway() -> Gateway {
    gateway_with(test_config(), InMemoryConnector::new())
}

fn gateway_with(config: GatewayConfig, connector: InMemoryConnector) -> Gateway {
    let connector = Arc::new(connector.with_table("COMPANY_INDEX", companies()));
    let credentials = Arc::new(StaticCredentialProvider::new());
    let registry = DatasetRegistry::from_sources(
        ALIASES.iter().copied(),
        vec!["CLIMATE_WATCH_TIMESERIES".to_string()],
    );
    let keys = KeyStore::new(config.keys.clone(), credentials.clone());
    let (audit_logger, audit) = AuditLogger::new(&config.audit);

    let pipeline = Pipeline::new(registry, keys, connector.clone(), audit_logger, &config);
    let state = AppState::new(pipeline);

    Gateway {
        app: router(state.clone()),
        state,
        connector,
        credentials,
        audit,
    }
}

fn data_request(uri: &str, api_key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(key) = api_key {
        builder = builder.header("x-api-key", key);
    }
    builder.body(Body::empty()).unwrap()
}

fn admin_request(uri: &str, secret: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("POST").uri(uri);
    if let Some(secret) = secret {
        builder = builder.header("x-admin-secret", secret);
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_bytes(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read response body")
        .to_vec()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).expect("Failed to parse JSON")
}

fn header<'a>(response: &'a Response, name: &str) -> &'a str {
    response
        .headers()
        .get(name)
        .unwrap_or_else(|| panic!("missing header {}", name))
        .to_str()
        .unwrap()
}

// =============================================================================
// Buffered reads and caching
// =============================================================================

#[tokio::test]
async fn test_filtered_page_returns_matching_rows() {
    let gw = gateway();

    let response = gw.get("/v1/data/companies?industry=Tech&limit=5").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-cache"), "MISS");
    assert_eq!(header(&response, "x-result-count"), "5");
    assert_eq!(header(&response, "x-ratelimit-limit"), "50");
    assert_eq!(header(&response, "x-ratelimit-remaining"), "49");
    assert!(response.headers().contains_key("x-request-id"));

    let body = body_json(response).await;
    assert_eq!(body["status"], "success");
    assert_eq!(body["meta"]["total"], 5);
    assert_eq!(body["meta"]["limit"], 5);
    assert_eq!(body["meta"]["offset"], 0);

    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 5);
    assert!(data.iter().all(|r| r["industry"] == "Tech"));
}

#[tokio::test]
async fn test_repeat_request_served_from_cache() {
    let gw = gateway();

    let first = gw.get("/v1/data/companies?industry=Tech&limit=5").await;
    assert_eq!(header(&first, "x-cache"), "MISS");
    let first_body = body_json(first).await;
    assert_eq!(gw.connector.calls(), 1);

    let second = gw.get("/v1/data/companies?industry=Tech&limit=5").await;
    assert_eq!(header(&second, "x-cache"), "HIT");
    assert_eq!(body_json(second).await, first_body);
    assert_eq!(gw.connector.calls(), 1);

    // A different page is a different fingerprint
    let other = gw.get("/v1/data/companies?industry=Tech&limit=5&offset=5").await;
    assert_eq!(header(&other, "x-cache"), "MISS");
    assert_eq!(gw.connector.calls(), 2);
}

#[tokio::test]
async fn test_slug_resolution_accepts_backing_identifier() {
    let gw = gateway();

    let response = gw.get("/v1/data/COMPANY_INDEX?limit=3").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["meta"]["total"], 3);
}

#[tokio::test]
async fn test_test_filter_pair_applies_filter() {
    let gw = gateway();

    let response = gw
        .get("/v1/data/companies?test_filter_col=industry&test_filter_val=Retail&limit=100")
        .await;
    let body = body_json(response).await;
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 10);
    assert!(data.iter().all(|r| r["industry"] == "Retail"));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_identical_requests_share_one_fetch() {
    let gw = gateway_with(
        test_config(),
        InMemoryConnector::new().with_latency(Duration::from_millis(200)),
    );

    let mut handles = Vec::new();
    for _ in 0..20 {
        let app = gw.app.clone();
        handles.push(tokio::spawn(async move {
            app.oneshot(data_request("/v1/data/companies?industry=Tech", Some(TEST_KEY)))
                .await
                .unwrap()
        }));
    }

    let mut bodies = Vec::new();
    for handle in handles {
        let response = handle.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        bodies.push(body_json(response).await);
    }

    assert_eq!(gw.connector.calls(), 1);
    assert!(bodies.iter().all(|b| b == &bodies[0]));
}

#[tokio::test(start_paused = true)]
async fn test_expired_entry_is_recomputed() {
    let gw = gateway();

    gw.get("/v1/data/companies").await;
    tokio::time::advance(Duration::from_secs(299)).await;
    let fresh = gw.get("/v1/data/companies").await;
    assert_eq!(header(&fresh, "x-cache"), "HIT");
    assert_eq!(gw.connector.calls(), 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    let expired = gw.get("/v1/data/companies").await;
    assert_eq!(header(&expired, "x-cache"), "MISS");
    assert_eq!(gw.connector.calls(), 2);
}

#[tokio::test]
async fn test_failures_are_not_cached() {
    let gw = gateway();
    gw.connector
        .fail_with(ConnectorError::Transport("connection refused".to_string()));

    let failed = gw.get("/v1/data/companies").await;
    assert_eq!(failed.status(), StatusCode::SERVICE_UNAVAILABLE);

    gw.connector.clear_failure();
    let recovered = gw.get("/v1/data/companies").await;
    assert_eq!(recovered.status(), StatusCode::OK);
    assert_eq!(header(&recovered, "x-cache"), "MISS");
    assert_eq!(gw.connector.calls(), 2);
}

// =============================================================================
// Streaming
// =============================================================================

#[tokio::test]
async fn test_stream_returns_ndjson_lines() {
    let gw = gateway();

    let response = gw
        .get("/v1/data/companies?industry=Tech&stream=true&limit=2")
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "content-type"), "application/x-ndjson");
    assert!(response.headers().get("x-cache").is_none());

    let text = String::from_utf8(body_bytes(response).await).unwrap();
    let lines: Vec<Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    // Streams are not paginated
    assert_eq!(lines.len(), 10);
    assert!(lines.iter().all(|r| r["industry"] == "Tech"));
}

#[tokio::test]
async fn test_stream_bypasses_cache() {
    let gw = gateway();

    for _ in 0..2 {
        let response = gw.get("/v1/data/companies?stream=true").await;
        body_bytes(response).await;
    }
    assert_eq!(gw.connector.calls(), 2);
    assert!(gw.state.pipeline.cache().is_empty());
}

#[tokio::test]
async fn test_stream_failure_keeps_delivered_rows() {
    let gw = gateway();
    gw.connector.fail_stream_after(3);

    let response = gw.get("/v1/data/companies?stream=true").await;
    assert_eq!(response.status(), StatusCode::OK);

    let text = String::from_utf8(body_bytes(response).await).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    for line in lines {
        let record: Value = serde_json::from_str(line).unwrap();
        assert!(record["id"].is_number());
    }
}

#[tokio::test]
async fn test_stream_client_disconnect_is_audited() {
    let mut gw = gateway();

    let response = gw.get("/v1/data/companies?stream=true").await;
    let mut frames = response.into_body().into_data_stream();
    let first = frames.next().await.unwrap().unwrap();
    assert!(first.ends_with(b"\n"));

    // Client goes away mid-stream
    drop(frames);

    let records = gw.audit_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status_code, 499);
    assert_eq!(records[0].path, "/v1/data/companies");

    // An abandoned stream says nothing about warehouse health
    assert_eq!(gw.state.pipeline.breaker().state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_completed_stream_is_audited_as_success() {
    let mut gw = gateway();

    let response = gw.get("/v1/data/companies?stream=true").await;
    assert!(gw.audit_records().is_empty());
    body_bytes(response).await;

    let records = gw.audit_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status_code, 200);
}

#[tokio::test]
async fn test_mid_stream_failures_open_breaker() {
    let mut config = test_config();
    config.circuit_breaker = config.circuit_breaker.with_failure_threshold(2);
    let gw = gateway_with(config, InMemoryConnector::new());
    gw.connector.fail_stream_after(1);

    for _ in 0..2 {
        let response = gw.get("/v1/data/companies?stream=true").await;
        assert_eq!(response.status(), StatusCode::OK);
        let text = String::from_utf8(body_bytes(response).await).unwrap();
        assert_eq!(text.lines().count(), 1);
    }
    assert_eq!(gw.state.pipeline.breaker().state(), CircuitState::Open);

    let rejected = gw.get("/v1/data/companies?stream=true").await;
    assert_eq!(rejected.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(gw.connector.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_stream_settles_at_end_of_stream() {
    let mut config = test_config();
    config.circuit_breaker = config.circuit_breaker.with_failure_threshold(1);
    let gw = gateway_with(config, InMemoryConnector::new());
    gw.connector.fail_stream_after(1);

    body_bytes(gw.get("/v1/data/companies?stream=true").await).await;
    assert_eq!(gw.state.pipeline.breaker().state(), CircuitState::Open);

    // The half-open trial opens fine but fails after its first row
    tokio::time::advance(Duration::from_secs(31)).await;
    let trial = gw.get("/v1/data/companies?stream=true").await;
    assert_eq!(trial.status(), StatusCode::OK);
    assert_eq!(gw.state.pipeline.breaker().state(), CircuitState::HalfOpen);
    body_bytes(trial).await;
    assert_eq!(gw.state.pipeline.breaker().state(), CircuitState::Open);
}

#[tokio::test]
async fn test_stream_still_validates_pagination() {
    let gw = gateway();

    let response = gw.get("/v1/data/companies?stream=true&limit=0").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(gw.connector.calls(), 0);
}

// =============================================================================
// Rate limiting
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_rate_limit_budget_per_window() {
    let gw = gateway();

    for i in 0..50 {
        let response = gw.get("/v1/data/companies").await;
        assert_eq!(response.status(), StatusCode::OK, "request {}", i + 1);
    }

    let denied = gw.get("/v1/data/companies").await;
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = header(&denied, "retry-after").parse().unwrap();
    assert!(retry_after > 0 && retry_after <= 60);
    assert_eq!(header(&denied, "x-ratelimit-remaining"), "0");
    assert_eq!(body_json(denied).await["code"], "RATE_LIMIT_EXCEEDED");

    tokio::time::advance(Duration::from_secs(61)).await;
    let response = gw.get("/v1/data/companies").await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_is_per_key() {
    let mut config = test_config();
    config.rate_limit = config.rate_limit.with_budget(1);
    config.keys = config.keys.with_bootstrap_key("other-key-456");
    let gw = gateway_with(config, InMemoryConnector::new());

    assert_eq!(gw.get("/v1/data/companies").await.status(), StatusCode::OK);
    assert_eq!(
        gw.get("/v1/data/companies").await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );

    let other = gw
        .send(data_request("/v1/data/companies", Some("other-key-456")))
        .await;
    assert_eq!(other.status(), StatusCode::OK);
}

// =============================================================================
// Circuit breaker
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_and_recovers() {
    let gw = gateway();
    gw.connector
        .fail_with(ConnectorError::Transport("connection reset".to_string()));

    for _ in 0..5 {
        let response = gw.get("/v1/data/companies").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
    assert_eq!(gw.connector.calls(), 5);
    assert_eq!(gw.state.pipeline.breaker().state(), CircuitState::Open);

    let rejected = gw.get("/v1/data/companies").await;
    assert_eq!(rejected.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(rejected).await["code"], "SERVICE_UNAVAILABLE");
    assert_eq!(gw.connector.calls(), 5);

    tokio::time::advance(Duration::from_secs(31)).await;
    gw.connector.clear_failure();

    let probe = gw.get("/v1/data/companies").await;
    assert_eq!(probe.status(), StatusCode::OK);
    assert_eq!(gw.connector.calls(), 6);
    assert_eq!(gw.state.pipeline.breaker().state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_slow_warehouse_times_out() {
    let mut config = test_config();
    config.warehouse_timeout = Duration::from_secs(5);
    let gw = gateway_with(
        config,
        InMemoryConnector::new().with_latency(Duration::from_secs(30)),
    );

    let response = gw.get("/v1/data/companies").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        body_json(response).await["message"],
        "Warehouse request timed out."
    );
}

#[tokio::test]
async fn test_unknown_warehouse_object_does_not_trip_breaker() {
    let gw = gateway();

    // Allowed slug whose view is missing from the warehouse
    for _ in 0..6 {
        let response = gw.get("/v1/data/climate").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
    assert_eq!(gw.state.pipeline.breaker().state(), CircuitState::Closed);
    assert_eq!(gw.connector.calls(), 6);
}

#[tokio::test]
async fn test_repeated_auth_failures_refresh_credential() {
    let gw = gateway();
    gw.connector
        .fail_with(ConnectorError::Auth("JWT token is invalid".to_string()));

    let first = gw.get("/v1/data/companies").await;
    assert_eq!(first.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(gw.credentials.invalidations(), 0);

    gw.get("/v1/data/companies").await;
    assert_eq!(gw.credentials.invalidations(), 1);
}

#[tokio::test]
async fn test_credential_failure_is_unavailable() {
    let gw = gateway();
    gw.credentials.set_failing(true);

    let response = gw.get("/v1/data/companies").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(gw.connector.calls(), 0);
}

// =============================================================================
// Error envelope
// =============================================================================

#[tokio::test]
async fn test_missing_key_is_unauthorized() {
    let gw = gateway();

    let response = gw.send(data_request("/v1/data/companies", None)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().get("x-ratelimit-limit").is_none());

    let body = body_json(response).await;
    assert_eq!(body["status"], "error");
    assert_eq!(body["code"], "UNAUTHORIZED");
    assert_eq!(
        body["message"],
        "Missing API Key. Provide it in the X-API-KEY header."
    );
}

#[tokio::test]
async fn test_invalid_key_is_unauthorized() {
    let gw = gateway();

    let response = gw
        .send(data_request("/v1/data/companies", Some("not-a-key")))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        body_json(response).await["message"],
        "Invalid API Key provided. Please check your credentials."
    );
    assert_eq!(gw.connector.calls(), 0);
}

#[tokio::test]
async fn test_unknown_slug_is_not_found() {
    let gw = gateway();

    let response = gw.get("/v1/data/secret-table").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(response.headers().contains_key("x-ratelimit-remaining"));

    let body = body_json(response).await;
    assert_eq!(body["code"], "NOT_FOUND");
    assert_eq!(
        body["message"],
        "View 'secret-table' not found or not allowed."
    );
    assert_eq!(gw.connector.calls(), 0);
}

#[tokio::test]
async fn test_invalid_inputs_are_rejected() {
    let gw = gateway();

    for uri in [
        "/v1/data/companies?limit=0",
        "/v1/data/companies?limit=5000",
        "/v1/data/companies?offset=-3",
        "/v1/data/companies?stream=perhaps",
        "/v1/data/companies?bad%20column=1",
    ] {
        let response = gw.get(uri).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", uri);
        let body = body_json(response).await;
        assert_eq!(body["code"], "VALIDATION_ERROR", "{}", uri);
    }
    assert_eq!(gw.connector.calls(), 0);
}

// =============================================================================
// Admin
// =============================================================================

#[tokio::test]
async fn test_generate_key_requires_admin_secret() {
    let gw = gateway();

    let missing = gw.send(admin_request("/v1/admin/generate-key", None)).await;
    assert_eq!(missing.status(), StatusCode::FORBIDDEN);

    let wrong = gw
        .send(admin_request("/v1/admin/generate-key", Some("guess")))
        .await;
    assert_eq!(wrong.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(wrong).await["message"], "Invalid Admin Secret");

    // A client key is not an admin credential
    let client = gw
        .send(admin_request("/v1/admin/generate-key", Some(TEST_KEY)))
        .await;
    assert_eq!(client.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_generated_key_works_until_revoked() {
    let gw = gateway();

    let response = gw
        .send(admin_request("/v1/admin/generate-key", Some(ADMIN_SECRET)))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "success");
    let key = body["generated_key"].as_str().unwrap().to_string();
    let key_id = body["key_id"].as_str().unwrap().to_string();
    assert!(key.starts_with("sk_"));

    let allowed = gw.send(data_request("/v1/data/companies", Some(&key))).await;
    assert_eq!(allowed.status(), StatusCode::OK);

    let revoked = gw
        .send(admin_request(
            &format!("/v1/admin/keys/{}/revoke", key_id),
            Some(ADMIN_SECRET),
        ))
        .await;
    assert_eq!(revoked.status(), StatusCode::OK);
    assert_eq!(body_json(revoked).await["revoked"], true);

    let denied = gw.send(data_request("/v1/data/companies", Some(&key))).await;
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_generated_keys_are_unique() {
    let gw = gateway();

    let mut keys = Vec::new();
    for _ in 0..2 {
        let response = gw
            .send(admin_request("/v1/admin/generate-key", Some(ADMIN_SECRET)))
            .await;
        keys.push(body_json(response).await["generated_key"].clone());
    }
    assert_ne!(keys[0], keys[1]);
}

#[tokio::test]
async fn test_revoke_unknown_key_is_not_found() {
    let gw = gateway();

    let response = gw
        .send(admin_request(
            "/v1/admin/keys/000000000000/revoke",
            Some(ADMIN_SECRET),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_unconfigured_is_unavailable() {
    let mut config = test_config();
    config.keys = KeyStoreConfig::default().with_bootstrap_key(TEST_KEY);
    let gw = gateway_with(config, InMemoryConnector::new());

    let response = gw
        .send(admin_request("/v1/admin/generate-key", Some("anything")))
        .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

// =============================================================================
// Health and audit
// =============================================================================

#[tokio::test]
async fn test_health_reports_warehouse_connectivity() {
    let gw = gateway();

    let healthy = gw
        .send(Request::get("/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(healthy.status(), StatusCode::OK);
    assert_eq!(
        body_json(healthy).await,
        json!({
            "status": "healthy",
            "service": "up",
            "warehouse": "connected",
            "circuit": "closed"
        })
    );

    gw.connector.set_ping_ok(false);
    let degraded = gw
        .send(Request::get("/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(degraded.status(), StatusCode::OK);
    let body = body_json(degraded).await;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["warehouse"], "disconnected");

    // Health never reaches the data path
    assert_eq!(gw.connector.calls(), 0);
}

#[tokio::test]
async fn test_every_request_is_audited() {
    let mut gw = gateway();

    gw.get("/v1/data/companies").await;
    gw.send(data_request("/v1/data/companies", None)).await;
    gw.send(data_request("/v1/data/companies", Some("wrong"))).await;
    gw.get("/v1/data/nope").await;

    let records = gw.audit_records();
    let statuses: Vec<u16> = records.iter().map(|r| r.status_code).collect();
    assert_eq!(statuses, vec![200, 401, 401, 404]);

    assert_eq!(records[1].masked_key_id, "anonymous");
    assert_eq!(records[2].masked_key_id, "rejected");
    assert!(records[0].masked_key_id.contains("..."));
    assert!(!records[0].masked_key_id.contains(TEST_KEY));
}

#[tokio::test]
async fn test_operational_and_unmatched_routes_are_audited() {
    let mut gw = gateway();

    let health = gw
        .send(Request::get("/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(health.status(), StatusCode::OK);

    let unmatched = gw.get("/v1/data/").await;
    assert_eq!(unmatched.status(), StatusCode::NOT_FOUND);
    let body = body_json(unmatched).await;
    assert_eq!(body["status"], "error");
    assert_eq!(body["code"], "NOT_FOUND");
    assert_eq!(body["message"], "Route '/v1/data/' not found.");

    let records = gw.audit_records();
    let seen: Vec<(&str, u16)> = records
        .iter()
        .map(|r| (r.path.as_str(), r.status_code))
        .collect();
    assert_eq!(seen, vec![("/health", 200), ("/v1/data/", 404)]);
    assert!(records.iter().all(|r| r.masked_key_id == "anonymous"));
}

#[tokio::test]
async fn test_malformed_query_is_rejected_and_audited() {
    let mut gw = gateway();

    let request = DataRequest {
        context: RequestContext {
            request_id: "req-bad-query".to_string(),
            path: "/v1/data/companies".to_string(),
            client_ip: "127.0.0.1".to_string(),
        },
        api_key: Some(TEST_KEY.to_string()),
        slug: "companies".to_string(),
        params: Vec::new(),
        malformed_query: Some("invalid percent-encoding".to_string()),
    };
    let err = gw.state.pipeline.handle(request).await.err().unwrap();
    assert_eq!(err.error.code(), ErrorCode::ValidationError);
    assert!(err.rate_limit.is_some());
    assert_eq!(gw.connector.calls(), 0);

    let records = gw.audit_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].request_id, "req-bad-query");
    assert_eq!(records[0].status_code, 400);
    assert!(records[0].masked_key_id.contains("..."));
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let mut gw = gateway();

    let response = gw
        .send(
            Request::get("/v1/data/companies")
                .header("x-api-key", TEST_KEY)
                .header("x-request-id", "req-abc-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(header(&response, "x-request-id"), "req-abc-123");

    let records = gw.audit_records();
    assert_eq!(records[0].request_id, "req-abc-123");
}
