//! Centralized error type. Every component returns `crate::Result<T>`; the
//! HTTP layer (`http::errors`) is the only place that turns a variant into a
//! status code and response body.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Unknown platform, malformed version string, invalid snapshot JSON.
    #[error("bad input: {0}")]
    BadInput(String),

    /// Unknown analysis id, vulnerability id, device id, scan id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Missing/invalid admin shared secret on a mutating endpoint.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Per-IP/category sliding window exceeded.
    #[error("rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// LM call or SSH session exceeded its wall-clock budget.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Model call failed, SSH auth/transport error, ISE call failed.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// DB lock retries exhausted.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Offline-update manifest missing, hash mismatch, schema invalid.
    #[error("corrupt package: {0}")]
    Corrupt(String),

    /// Anything else. Never rendered verbatim to an HTTP client.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Internal(format!("database error: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::BadInput(format!("invalid json: {err}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(format!("io error: {err}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Upstream(format!("http client error: {err}"))
    }
}

impl From<ssh2::Error> for Error {
    fn from(err: ssh2::Error) -> Self {
        Error::Upstream(format!("ssh error: {err}"))
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(err: zip::result::ZipError) -> Self {
        Error::Corrupt(format!("archive error: {err}"))
    }
}
