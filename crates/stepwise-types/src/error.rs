use thiserror::Error;

/// Errors from repository operations (used by trait definitions in stepwise-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors raised while building policies or loading configuration.
///
/// Malformed input is rejected here, at construction time, so that a bad
/// duration string never reaches a running workflow.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid duration '{input}': {reason}")]
    InvalidDuration { input: String, reason: String },

    #[error("invalid retry policy: {0}")]
    InvalidPolicy(String),

    #[error("failed to read config: {0}")]
    Io(String),

    #[error("failed to parse config: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidDuration {
            input: "five seconds".to_string(),
            reason: "missing magnitude".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid duration 'five seconds': missing magnitude"
        );
    }
}
