//! Uniform error envelope for HTTP responses
//!
//! Every client-visible failure renders as
//! `{"status": "error", "code": "...", "message": "...", "details": ...}`
//! with the status code taken from the error taxonomy.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use dataproduct_gateway_core::{ErrorCode, GatewayError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

/// Wire form of an error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub status: String,
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorEnvelope {
    pub fn from_error(err: &GatewayError) -> Self {
        Self {
            status: "error".to_string(),
            code: err.code(),
            message: err.client_message(),
            details: err.details(),
        }
    }
}

/// Axum-facing wrapper so handlers can return `Result<_, ApiError>`.
#[derive(Debug)]
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let GatewayError::Internal(detail) = &self.0 {
            error!(detail = %detail, "Internal error");
        }

        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, Json(ErrorEnvelope::from_error(&self.0))).into_response();

        if let GatewayError::RateLimited { retry_after_secs } = self.0 {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
        }
        response
    }
}
