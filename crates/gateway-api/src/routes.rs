//! HTTP surface
//!
//! | Method | Path | Auth |
//! |--------|------|------|
//! | GET | `/health` | none |
//! | GET | `/v1/data/{slug}` | `X-API-KEY` |
//! | POST | `/v1/admin/generate-key` | `X-ADMIN-SECRET` |
//! | POST | `/v1/admin/keys/{id}/revoke` | `X-ADMIN-SECRET` |
//! | GET | `/metrics` | none (feature `metrics`) |
//!
//! Data and admin requests are audited by the pipeline. Everything else,
//! unmatched paths included, is audited by the `audit_request` layer.

use crate::audit::AuditDraft;
use crate::error::ApiError;
use crate::pipeline::{DataBody, DataError, DataRequest, Pipeline, RequestContext};
use crate::rate_limiting::RateLimitMetadata;
use axum::{
    body::Body,
    extract::{rejection::QueryRejection, ConnectInfo, Path, Query, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use dataproduct_gateway_core::{GatewayError, Row};
use futures::StreamExt;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const ADMIN_SECRET_HEADER: &str = "x-admin-secret";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Longest inbound request id that is echoed instead of replaced
const MAX_REQUEST_ID_LEN: usize = 128;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let operational = Router::new().route("/health", get(health_check));

    #[cfg(feature = "metrics")]
    let operational = operational.route("/metrics", get(crate::metrics::metrics_handler));

    let operational = operational
        .fallback(route_not_found)
        .layer(middleware::from_fn_with_state(state.clone(), audit_request));

    let router = Router::new()
        .route("/v1/data/{slug}", get(get_data))
        .route("/v1/admin/generate-key", post(generate_key))
        .route("/v1/admin/keys/{id}/revoke", post(revoke_key))
        .merge(operational);

    #[cfg(feature = "metrics")]
    let router = router.layer(middleware::from_fn(crate::metrics::track_metrics));

    router
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_context))
        .with_state(state)
}

/// Assign a request id, resolve the client address and run the rest of the
/// request inside a `request` span.
async fn request_context(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty() && id.len() <= MAX_REQUEST_ID_LEN)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let context = RequestContext {
        request_id: request_id.clone(),
        path: req.uri().path().to_string(),
        client_ip: client_ip(&req),
    };
    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %req.method(),
        uri = %req.uri().path(),
    );
    req.extensions_mut().insert(context);

    let mut response = next.run(req).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

/// Audit routes that never reach the pipeline.
async fn audit_request(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let context = req
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .unwrap_or_default();
    let mut audit = AuditDraft::new(state.pipeline.audit_logger().clone(), context, "anonymous");

    let response = next.run(req).await;
    audit.status = response.status().as_u16();
    response
}

async fn route_not_found(uri: Uri) -> ApiError {
    ApiError(GatewayError::NotFound(format!(
        "Route '{}' not found.",
        uri.path()
    )))
}

/// First `x-forwarded-for` hop, else the peer address.
fn client_ip(req: &Request) -> String {
    req.headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn apply_rate_limit_headers(headers: &mut HeaderMap, metadata: &RateLimitMetadata) {
    headers.insert(
        HeaderName::from_static("x-ratelimit-limit"),
        HeaderValue::from(metadata.limit),
    );
    headers.insert(
        HeaderName::from_static("x-ratelimit-remaining"),
        HeaderValue::from(metadata.remaining),
    );
    headers.insert(
        HeaderName::from_static("x-ratelimit-reset"),
        HeaderValue::from(metadata.reset),
    );
}

#[derive(Serialize)]
struct PageMeta {
    total: usize,
    limit: u32,
    offset: u64,
}

#[derive(Serialize)]
struct DataResponse<'a> {
    status: &'static str,
    data: &'a [Row],
    meta: PageMeta,
}

async fn get_data(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    Path(slug): Path<String>,
    headers: HeaderMap,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
) -> Response {
    let (params, malformed_query) = match query {
        Ok(Query(params)) => (params, None),
        Err(rejection) => (Vec::new(), Some(rejection.body_text())),
    };

    let request = DataRequest {
        context,
        api_key: header_str(&headers, API_KEY_HEADER).map(str::to_string),
        slug,
        params,
        malformed_query,
    };

    match state.pipeline.handle(request).await {
        Ok(outcome) => {
            let mut response = match outcome.body {
                DataBody::Buffered {
                    rows,
                    pagination,
                    cache,
                } => {
                    let body = DataResponse {
                        status: "success",
                        data: rows.as_slice(),
                        meta: PageMeta {
                            total: rows.len(),
                            limit: pagination.limit,
                            offset: pagination.offset,
                        },
                    };
                    let mut response = Json(body).into_response();
                    let headers = response.headers_mut();
                    headers.insert(
                        HeaderName::from_static("x-cache"),
                        HeaderValue::from_static(cache.header_value()),
                    );
                    headers.insert(
                        HeaderName::from_static("x-result-count"),
                        HeaderValue::from(rows.len()),
                    );
                    response
                }
                DataBody::Stream(lines) => {
                    let body = Body::from_stream(lines.map(Ok::<_, Infallible>));
                    (
                        [(header::CONTENT_TYPE, "application/x-ndjson")],
                        body,
                    )
                        .into_response()
                }
            };
            apply_rate_limit_headers(response.headers_mut(), &outcome.rate_limit);
            response
        }
        Err(DataError { error, rate_limit }) => {
            let mut response = ApiError(error).into_response();
            if let Some(metadata) = rate_limit {
                apply_rate_limit_headers(response.headers_mut(), &metadata);
            }
            response
        }
    }
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.pipeline.health().await)
}

#[derive(Serialize)]
struct GeneratedKeyResponse {
    status: &'static str,
    generated_key: String,
    key_id: String,
    message: &'static str,
}

async fn generate_key(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    headers: HeaderMap,
) -> Result<Json<GeneratedKeyResponse>, ApiError> {
    let issued = state
        .pipeline
        .issue_key(context, header_str(&headers, ADMIN_SECRET_HEADER))
        .await?;

    Ok(Json(GeneratedKeyResponse {
        status: "success",
        key_id: issued.record.id.clone(),
        generated_key: issued.raw_key,
        message: "Key generated and activated successfully. It is ready to use immediately.",
    }))
}

#[derive(Serialize)]
struct RevokedKeyResponse {
    status: &'static str,
    key_id: String,
    revoked: bool,
}

async fn revoke_key(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<RevokedKeyResponse>, ApiError> {
    let record = state
        .pipeline
        .revoke_key(context, header_str(&headers, ADMIN_SECRET_HEADER), &id)
        .await?;

    Ok(Json(RevokedKeyResponse {
        status: "success",
        key_id: record.id,
        revoked: record.revoked,
    }))
}
