//! Error types for the REST layer.

use reqwest::StatusCode;

use crate::limiter::SubmitError;

/// Errors surfaced by the REST client.
///
/// Throttling never appears here: 429 responses are retried inside the
/// dispatcher and the caller only ever sees the eventual result.
#[derive(Debug, thiserror::Error)]
pub enum RestError {
    /// Network or protocol failure in the HTTP transport.
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// The API answered with a non-2xx, non-429 status.
    #[error("API returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    /// The endpoint path or query did not form a valid URL.
    #[error("invalid request URL: {0}")]
    Url(#[from] url::ParseError),

    /// The configured token or user agent cannot be carried in a header.
    #[error("invalid header value in configuration: {0}")]
    Config(String),

    /// The dispatcher dropped the request during shutdown.
    #[error("request abandoned: {0}")]
    Abandoned(#[from] SubmitError),
}

pub type Result<T> = std::result::Result<T, RestError>;
