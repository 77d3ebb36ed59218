use thiserror::Error;

/// Top-level error type for the Visage system.
///
/// Store, index, and query failures are typed variants so callers can tell a
/// bad request apart from a backend that is not ready. Ambient failures
/// (configuration, I/O, serialization) wrap the underlying error message.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VisageError {
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Duplicate record id: {0}")]
    DuplicateId(u64),

    #[error("Record not found: {0}")]
    NotFound(u64),

    #[error("Corrupt store: {0}")]
    CorruptStore(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Feature extraction failed: {0}")]
    Extraction(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VisageError {
    /// True for errors caused by the caller's input rather than system state.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            VisageError::DimensionMismatch { .. }
                | VisageError::DuplicateId(_)
                | VisageError::NotFound(_)
                | VisageError::InvalidInput(_)
        )
    }
}

impl From<toml::de::Error> for VisageError {
    fn from(err: toml::de::Error) -> Self {
        VisageError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for VisageError {
    fn from(err: toml::ser::Error) -> Self {
        VisageError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for VisageError {
    fn from(err: serde_json::Error) -> Self {
        VisageError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Visage operations.
pub type Result<T> = std::result::Result<T, VisageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VisageError::DimensionMismatch {
            expected: 512,
            actual: 3,
        };
        assert_eq!(err.to_string(), "Dimension mismatch: expected 512, got 3");
    }

    #[test]
    fn test_error_display_all_variants() {
        let cases: Vec<(VisageError, &str)> = vec![
            (VisageError::DuplicateId(7), "Duplicate record id: 7"),
            (VisageError::NotFound(9), "Record not found: 9"),
            (
                VisageError::CorruptStore("bad version".to_string()),
                "Corrupt store: bad version",
            ),
            (
                VisageError::InvalidInput("not an image".to_string()),
                "Invalid input: not an image",
            ),
            (
                VisageError::Extraction("session failed".to_string()),
                "Feature extraction failed: session failed",
            ),
            (
                VisageError::ServiceUnavailable("no collection".to_string()),
                "Service unavailable: no collection",
            ),
            (
                VisageError::Config("bad key".to_string()),
                "Configuration error: bad key",
            ),
            (
                VisageError::Storage("lock poisoned".to_string()),
                "Storage error: lock poisoned",
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.to_string(), expected);
        }
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: VisageError = io_err.into();
        assert!(matches!(err, VisageError::Io(_)));
        assert!(err.to_string().starts_with("I/O error:"));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_error_from_toml_de() {
        let err: std::result::Result<toml::Value, _> = toml::from_str("invalid = [[[");
        let err: VisageError = err.unwrap_err().into();
        assert!(matches!(err, VisageError::Config(_)));
    }

    #[test]
    fn test_error_from_serde_json() {
        let err: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let err: VisageError = err.unwrap_err().into();
        assert!(matches!(err, VisageError::Serialization(_)));
    }

    #[test]
    fn test_client_error_classification() {
        assert!(VisageError::InvalidInput("x".into()).is_client_error());
        assert!(VisageError::DuplicateId(1).is_client_error());
        assert!(!VisageError::ServiceUnavailable("x".into()).is_client_error());
        assert!(!VisageError::CorruptStore("x".into()).is_client_error());
        assert!(!VisageError::Extraction("x".into()).is_client_error());
    }

    #[test]
    fn test_result_type_with_question_mark() {
        fn inner() -> Result<String> {
            let io_result: std::result::Result<i32, std::io::Error> = Ok(42);
            let _value = io_result?;
            Ok("success".to_string())
        }

        assert_eq!(inner().unwrap(), "success");
    }
}
