//! Error taxonomy shared by the parser, the stores and the reconciliation engine.

use thiserror::Error;

/// Errors raised by corpus operations.
///
/// The variants split along how a caller should react: parse and validation
/// failures never touch persisted state, `StoresDiverged` means a commit was
/// interrupted between the two local writes, and `ExternalService` only ever
/// describes derived artifacts (embeddings, index, frames).
#[derive(Error, Debug)]
pub enum CorpusError {
    #[error("EAF parse error: {0}")]
    Parse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("consistency error: {0}")]
    Consistency(String),

    #[error("stores diverged for video {video_id}: {reason}")]
    StoresDiverged { video_id: String, reason: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("external service error ({service}): {message}")]
    ExternalService {
        service: &'static str,
        message: String,
    },

    #[error("XML error: {0}")]
    Xml(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CorpusError>;

impl CorpusError {
    pub(crate) fn parse(message: impl Into<String>) -> Self {
        Self::Parse(message.into())
    }

    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub(crate) fn consistency(message: impl Into<String>) -> Self {
        Self::Consistency(message.into())
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub(crate) fn external(service: &'static str, message: impl Into<String>) -> Self {
        Self::ExternalService {
            service,
            message: message.into(),
        }
    }

    /// `true` for failures that left persisted state untouched.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Parse(_) | Self::NotFound(_) | Self::Consistency(_) | Self::InvalidRequest(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divergence_is_not_a_rejection() {
        let err = CorpusError::StoresDiverged {
            video_id: "9".to_string(),
            reason: "disk full".to_string(),
        };
        assert!(!err.is_rejection());
        assert!(err.to_string().contains("video 9"));
    }

    #[test]
    fn validation_errors_are_rejections() {
        assert!(CorpusError::invalid("start after end").is_rejection());
        assert!(CorpusError::not_found("tier X").is_rejection());
        assert!(!CorpusError::external("opensearch", "timeout").is_rejection());
    }
}
