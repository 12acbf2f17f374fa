//! Gateway-wide error taxonomy (spec §7).
//!
//! Mirrors the shape of `quota::QuotaError` in the teacher repo: a
//! `thiserror` enum matched to an HTTP status in one place, `{error:
//! <message>}` JSON unless an SSE socket is already open.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("queue full")]
    QueueFull,

    #[error("request timed out waiting in queue")]
    QueueTimeout,

    #[error("capacity exceeded")]
    CapacityExceeded,

    #[error("context length exceeds protection limit")]
    ContextTooLarge,

    #[error("infinite loop detected: {0} consecutive identical tool calls")]
    InfiniteLoopDetected(usize),

    #[error("bad gateway: {0}")]
    BadGateway(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        use GatewayError::*;
        match self {
            BadRequest(_) => StatusCode::BAD_REQUEST,
            Unauthorized => StatusCode::UNAUTHORIZED,
            Forbidden(_) => StatusCode::FORBIDDEN,
            RateLimited(_) | QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            QueueTimeout => StatusCode::SERVICE_UNAVAILABLE,
            CapacityExceeded => StatusCode::TOO_MANY_REQUESTS,
            ContextTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            InfiniteLoopDetected(_) => StatusCode::BAD_REQUEST,
            BadGateway(_) => StatusCode::BAD_GATEWAY,
            ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable kind tag, e.g. for metrics labels.
    pub fn kind(&self) -> &'static str {
        use GatewayError::*;
        match self {
            BadRequest(_) => "bad-request",
            Unauthorized => "unauthorized",
            Forbidden(_) => "forbidden",
            RateLimited(_) => "rate-limited",
            QuotaExceeded(_) => "quota-exceeded",
            QueueFull => "queue-full",
            QueueTimeout => "queue-timeout",
            CapacityExceeded => "capacity-exceeded",
            ContextTooLarge => "context-too-large",
            InfiniteLoopDetected(_) => "infinite-loop-detected",
            BadGateway(_) => "bad-gateway",
            ServiceUnavailable(_) => "service-unavailable",
            Internal(_) => "internal",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        metrics::counter!("gateway_errors_total", "kind" => self.kind()).increment(1);
        if !matches!(status, StatusCode::INTERNAL_SERVER_ERROR) {
            tracing::warn!(kind = self.kind(), "request rejected: {}", self);
        } else {
            tracing::error!(kind = self.kind(), "request failed: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
