//! Error types for the browser signing service.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignerError {
    #[error("Chrome launch error: {0}")]
    Launch(String),

    #[error("DevTools connection to {url} failed: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("DevTools command failed with code {code}: {message}")]
    Cdp { code: i64, message: String },

    #[error("DevTools command {method} timed out after {timeout:?}")]
    CommandTimeout { method: String, timeout: Duration },

    #[error("DevTools protocol error: {0}")]
    Protocol(String),

    #[error("Page load did not finish in time")]
    PageLoadTimeout,

    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("Signing function never appeared on the page; the cookie may be expired")]
    EntryPointMissing,

    #[error("Page exception: {0}")]
    JsException(String),

    #[error("No rolling token captured yet; cannot build a signable request")]
    TokenMissing,

    #[error("Signing call returned no usable signature: {0}")]
    BadSignature(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<SignerError> for doubao_core::Error {
    fn from(err: SignerError) -> Self {
        doubao_core::Error::SigningUnavailable(err.to_string())
    }
}
