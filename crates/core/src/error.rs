use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Unified error type for all gateway operations.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Route not found")]
    RouteNotFound,

    #[error("authentication failed: {0}")]
    Unauthorized(String),

    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("expression rejected: {0}")]
    ExpressionRejected(String),

    #[error("expression failed: {0}")]
    ExpressionFailed(String),

    #[error("upstream returned retryable status {status}")]
    UpstreamTransient { status: u16, body: String },

    #[error("Request timeout: {ms}ms exceeded")]
    Timeout { ms: u64 },

    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("all upstream attempts failed")]
    AllUpstreamsFailed,

    #[error("All upstreams are unhealthy and within recovery interval")]
    AllUpstreamsIneligible,

    #[error("plugin {name} failed: {message}")]
    Plugin { name: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RouteNotFound => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UpstreamTransient { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            Self::AllUpstreamsFailed | Self::AllUpstreamsIneligible => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::ExpressionRejected(_)
            | Self::ExpressionFailed(_)
            | Self::Plugin { .. }
            | Self::Config(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a failed attempt with this error should trip the breaker
    /// counters. Expression and plugin errors are contained locally and
    /// never count against an upstream.
    pub fn counts_as_upstream_failure(&self) -> bool {
        matches!(
            self,
            Self::UpstreamTransient { .. } | Self::Timeout { .. } | Self::UpstreamUnreachable(_)
        )
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Retryable upstream statuses that exhausted failover are returned
        // as-is when the upstream body was JSON.
        if let Self::UpstreamTransient { body, .. } = &self
            && serde_json::from_str::<serde_json::Value>(body).is_ok()
        {
            return (status, [(header::CONTENT_TYPE, "application/json")], body.clone())
                .into_response();
        }

        let body = match &self {
            Self::AllUpstreamsIneligible => json!({
                "error": "Service Unavailable",
                "reason": "All upstreams are unhealthy and within recovery interval",
            }),
            Self::AllUpstreamsFailed => json!({
                "error": "Service Unavailable",
                "reason": "all upstream attempts failed",
            }),
            other => json!({ "error": other.to_string() }),
        };

        let mut resp = (
            status,
            [(header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response();

        if matches!(self, Self::Unauthorized(_)) {
            resp.headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }

        resp
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            Self::UpstreamUnreachable(format!("connection failed: {e}"))
        } else {
            Self::UpstreamUnreachable(e.to_string())
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(GatewayError::RouteNotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            GatewayError::Unauthorized("bad token".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::AllUpstreamsIneligible.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::PayloadTooLarge { limit: 10 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[test]
    fn timeout_message_format() {
        let e = GatewayError::Timeout { ms: 3000 };
        assert_eq!(e.to_string(), "Request timeout: 3000ms exceeded");
    }

    #[test]
    fn breaker_relevance() {
        assert!(GatewayError::Timeout { ms: 1 }.counts_as_upstream_failure());
        assert!(GatewayError::UpstreamUnreachable("x".into()).counts_as_upstream_failure());
        assert!(!GatewayError::ExpressionFailed("x".into()).counts_as_upstream_failure());
        assert!(
            !GatewayError::Plugin { name: "p".into(), message: "m".into() }
                .counts_as_upstream_failure()
        );
    }
}
