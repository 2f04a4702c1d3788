//! Error taxonomy shared by the fetch, cache, refresh and read paths.

use std::time::Duration;

use thiserror::Error;

use crate::report::DataPolicy;

/// Failures raised by source connectors.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("could not reach {source_kind}: {message}")]
    Connection {
        source_kind: &'static str,
        message: String,
    },
    #[error("http status {status} for {url}")]
    Http { status: u16, url: String },
    #[error("export did not become ready within {after:?}")]
    PollTimeout { after: Duration },
    #[error("tabular payload could not be decoded: {0}")]
    Decode(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("invalid source locator: {0}")]
    InvalidLocator(String),
    #[error("no connector configured for data policy '{0}'")]
    NotConfigured(DataPolicy),
}

impl SourceError {
    pub fn connection(source_kind: &'static str, message: impl Into<String>) -> Self {
        Self::Connection {
            source_kind,
            message: message.into(),
        }
    }

    /// Whether a retry has a reasonable chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::PollTimeout { .. } => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            Self::Decode(_) | Self::Query(_) | Self::InvalidLocator(_) | Self::NotConfigured(_) => {
                false
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
    #[error("cache entry serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading endpoint config {path}: {message}")]
    Io { path: String, message: String },
    #[error("parsing endpoint config: {0}")]
    Parse(String),
    #[error("endpoint '{report}' is invalid: {reason}")]
    Invalid { report: String, reason: String },
    #[error("endpoint '{0}' is defined more than once")]
    Duplicate(String),
    #[error("endpoint '{0}' not found")]
    NotFound(String),
}

/// Errors surfaced by the report read path.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Report '{0}' not found in configuration.")]
    ReportNotFound(String),
    #[error("Visualization type '{info_type}' is not configured for report '{report}'.")]
    UnsupportedInfoType { report: String, info_type: String },
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
