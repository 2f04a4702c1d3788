use std::any::Any;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use rdg_core::{CacheError, ConfigError, GatewayError, SourceError};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

fn source_status(err: &SourceError) -> StatusCode {
    match err {
        SourceError::Connection { .. } | SourceError::NotConfigured(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        SourceError::PollTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    }
}

fn config_status(err: &ConfigError) -> StatusCode {
    match err {
        ConfigError::NotFound(_) => StatusCode::NOT_FOUND,
        ConfigError::Invalid { .. } => StatusCode::BAD_REQUEST,
        ConfigError::Duplicate(_) => StatusCode::CONFLICT,
        ConfigError::Io { .. } | ConfigError::Parse(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Gateway(GatewayError::ReportNotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Gateway(GatewayError::UnsupportedInfoType { .. }) => StatusCode::BAD_REQUEST,
            ApiError::Gateway(GatewayError::Source(err)) => source_status(err),
            ApiError::Gateway(GatewayError::Config(err)) | ApiError::Config(err) => config_status(err),
            ApiError::Gateway(GatewayError::Cache(_)) | ApiError::Cache(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "request failed");
        } else {
            tracing::warn!(status = status.as_u16(), error = %self, "request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Renders a handler panic as the usual JSON error body.
pub(crate) fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!(panic = %detail, "handler panicked");
    ApiError::Internal("Internal server error.".to_string()).into_response()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rdg_core::DataPolicy;

    use super::*;

    #[test]
    fn gateway_errors_map_to_distinct_statuses() {
        let cases = [
            (GatewayError::ReportNotFound("x".into()), StatusCode::NOT_FOUND),
            (
                GatewayError::UnsupportedInfoType {
                    report: "x".into(),
                    info_type: "detail".into(),
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                GatewayError::Source(SourceError::connection("mssql", "refused")),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                GatewayError::Source(SourceError::NotConfigured(DataPolicy::MsSql)),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                GatewayError::Source(SourceError::PollTimeout {
                    after: Duration::from_secs(90),
                }),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                GatewayError::Source(SourceError::Decode("bytes".into())),
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
        assert_eq!(
            ApiError::from(ConfigError::Duplicate("x".into())).status(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn panics_become_json_500() {
        let response = panic_response(Box::new("boom"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
