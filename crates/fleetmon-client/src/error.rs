//! Error types for fleetmon-client

use thiserror::Error;

/// Result alias using [`ClientError`]
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors from the Grafana and InfluxDB clients
#[derive(Error, Debug)]
pub enum ClientError {
    /// Invalid URL
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status from the service
    #[error("API error {status}: {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Response body
        message: String,
    },

    /// Dashboard payload violates its structural invariants
    #[error("dashboard [{name}] is invalid: {reason}")]
    InvalidDashboard {
        /// Intended dashboard title
        name: String,
        /// Violated invariant
        reason: String,
    },

    /// Query response does not have the expected shape
    #[error("unexpected query response: {0}")]
    UnexpectedShape(String),
}
