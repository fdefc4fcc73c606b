use thiserror::Error;

/// Errors from repository operations (used by trait definitions in conductor-core).
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

    /// The row was modified since it was read; the caller must re-read.
    #[error("version mismatch: expected row version {expected}")]
    VersionMismatch { expected: i64 },
}

impl RepositoryError {
    pub fn is_version_mismatch(&self) -> bool {
        matches!(self, Self::VersionMismatch { .. })
    }
}

/// Errors related to workflow definitions and their versions.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("definition '{0}' not found")]
    NotFound(String),

    #[error("version {version} of '{code}' not found")]
    VersionNotFound { code: String, version: u32 },

    #[error("definition code '{0}' already exists")]
    CodeConflict(String),

    #[error("invalid definition code: {0}")]
    InvalidCode(String),

    #[error("version {version} of '{code}' is {status} and cannot be modified")]
    Immutable {
        code: String,
        version: u32,
        status: String,
    },

    #[error("version {version} of '{code}' has {runs} pinned run(s)")]
    InUse { code: String, version: u32, runs: u64 },

    #[error("DSL parse error: {0}")]
    Parse(String),

    #[error("DSL validation failed: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(#[from] RepositoryError),
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
    fn test_version_mismatch_detection() {
        let err = RepositoryError::VersionMismatch { expected: 4 };
        assert!(err.is_version_mismatch());
        assert!(err.to_string().contains('4'));
        assert!(!RepositoryError::NotFound.is_version_mismatch());
    }

    #[test]
    fn test_definition_error_display() {
        let err = DefinitionError::Immutable {
            code: "OrderFulfillment".to_string(),
            version: 2,
            status: "published".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "version 2 of 'OrderFulfillment' is published and cannot be modified"
        );
    }
}
