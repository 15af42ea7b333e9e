use std::time::Duration;

use thiserror::Error;

/// Top-level error type for configuration, corpus loading and I/O.
///
/// Collaborator failures during a turn use [`CollaboratorError`] instead and
/// never escape the orchestrator.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MedragError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Corpus error: {0}")]
    Corpus(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<toml::de::Error> for MedragError {
    fn from(err: toml::de::Error) -> Self {
        MedragError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for MedragError {
    fn from(err: toml::ser::Error) -> Self {
        MedragError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for MedragError {
    fn from(err: serde_json::Error) -> Self {
        MedragError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for medrag setup operations.
pub type Result<T> = std::result::Result<T, MedragError>;

/// Failures raised by external collaborators (retriever, language model).
///
/// `ClassificationAmbiguous` is not a failure: the orchestrator treats it as
/// an off-topic verdict.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CollaboratorError {
    #[error("retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    #[error("inference timed out after {0:?}")]
    InferenceTimeout(Duration),

    #[error("inference unavailable: {0}")]
    InferenceUnavailable(String),

    #[error("classification ambiguous: {0}")]
    ClassificationAmbiguous(String),
}

impl CollaboratorError {
    /// Whether retrying the same call could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CollaboratorError::InferenceTimeout(_) | CollaboratorError::InferenceUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MedragError::Config("missing field".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing field");

        let err = MedragError::Corpus("empty corpus".to_string());
        assert_eq!(err.to_string(), "Corpus error: empty corpus");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: MedragError = io_err.into();
        assert!(matches!(err, MedragError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_toml_error_conversion() {
        let toml_err = toml::from_str::<toml::Value>("not = [valid").unwrap_err();
        let err: MedragError = toml_err.into();
        assert!(matches!(err, MedragError::Config(_)));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: MedragError = json_err.into();
        assert!(matches!(err, MedragError::Serialization(_)));
    }

    #[test]
    fn test_collaborator_error_display() {
        let err = CollaboratorError::RetrievalUnavailable("index offline".into());
        assert_eq!(err.to_string(), "retrieval unavailable: index offline");

        let err = CollaboratorError::InferenceTimeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "inference timed out after 1.5s");

        let err = CollaboratorError::InferenceUnavailable("connection refused".into());
        assert_eq!(err.to_string(), "inference unavailable: connection refused");

        let err = CollaboratorError::ClassificationAmbiguous("maybe".into());
        assert_eq!(err.to_string(), "classification ambiguous: maybe");
    }

    #[test]
    fn test_transient_errors() {
        assert!(CollaboratorError::InferenceTimeout(Duration::from_secs(1)).is_transient());
        assert!(CollaboratorError::InferenceUnavailable("503".into()).is_transient());
        assert!(!CollaboratorError::RetrievalUnavailable("down".into()).is_transient());
        assert!(!CollaboratorError::ClassificationAmbiguous("?".into()).is_transient());
    }
}
