//! Gateway error types.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No endpoint is registered under this service name.
    #[error("service not registered: {0}")]
    ServiceNotRegistered(String),

    /// The service is known but currently marked unhealthy.
    #[error("service unavailable: {0} is unhealthy")]
    UpstreamUnhealthy(String),

    /// Connection failure or timeout talking to the upstream.
    #[error("upstream transport error for {service}: {message}")]
    Transport { service: String, message: String },

    /// The upstream answered with a 5xx status.
    #[error("upstream {service} returned {status}")]
    UpstreamServer { service: String, status: StatusCode },

    /// Request body exceeded the configured limit.
    #[error("request body too large")]
    PayloadTooLarge,

    /// Request body could not be read.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Malformed WebSocket frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The message bus could not be reached.
    #[error("message bus unavailable: {0}")]
    BridgeUnavailable(String),

    /// Invalid or unparsable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Outbound queue of a connection is full or closed.
    #[error("Channel send error")]
    ChannelSend,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status a caller sees for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::ServiceNotRegistered(_) | GatewayError::UpstreamUnhealthy(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Transport { .. } | GatewayError::UpstreamServer { .. } => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn service(&self) -> Option<&str> {
        match self {
            GatewayError::ServiceNotRegistered(service) | GatewayError::UpstreamUnhealthy(service) => {
                Some(service.as_str())
            }
            GatewayError::Transport { service, .. } | GatewayError::UpstreamServer { service, .. } => {
                Some(service.as_str())
            }
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    service: Option<&'a str>,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            error: self.to_string(),
            service: self.service(),
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::ServiceNotRegistered("nope".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::UpstreamUnhealthy("auth".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::Transport {
                service: "auth".into(),
                message: "timed out".into()
            }
            .status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::UpstreamServer {
                service: "auth".into(),
                status: StatusCode::INTERNAL_SERVER_ERROR
            }
            .status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::PayloadTooLarge.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            GatewayError::BadRequest("aborted".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_not_registered_message() {
        let err = GatewayError::ServiceNotRegistered("billing".into());
        assert_eq!(err.to_string(), "service not registered: billing");
    }
}
