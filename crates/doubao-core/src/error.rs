//! Error types for the relay pipeline.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("No user message found in the request")]
    MissingUserMessage,

    #[error("Signing unavailable: {0}")]
    SigningUnavailable(String),

    #[error("Upstream rejected the request with status {status}: {body}")]
    UpstreamRejected { status: u16, body: String },

    #[error("Upstream closed the stream without sending any data")]
    UpstreamSilent,

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True for failures caused by the caller's request rather than by
    /// the relay or the upstream service.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::UnknownModel(_))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_classification() {
        assert!(Error::UnknownModel("gpt-5".into()).is_client_error());
        assert!(!Error::MissingUserMessage.is_client_error());
        assert!(!Error::UpstreamSilent.is_client_error());
        assert!(!Error::SigningUnavailable("browser gone".into()).is_client_error());
    }

    #[test]
    fn test_upstream_rejected_display() {
        let err = Error::UpstreamRejected {
            status: 403,
            body: "blocked".into(),
        };
        let text = err.to_string();
        assert!(text.contains("403"));
        assert!(text.contains("blocked"));
    }
}
