//! Error types for the test runner

use thiserror::Error;

use crate::schema_version::SchemaVersion;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Invalid schema version: '{0}'")]
    InvalidSchemaVersion(String),

    #[error("Unsupported schema version {version} (supported: {min} to {max})")]
    UnsupportedSchemaVersion {
        version: SchemaVersion,
        min: SchemaVersion,
        max: SchemaVersion,
    },

    #[error("Unrecognized operation: '{0}'")]
    UnrecognizedOperation(String),

    #[error("Unrecognized argument '{argument}' for operation '{operation}'")]
    UnrecognizedArgument { operation: String, argument: String },

    #[error("Invalid test file: {0}")]
    InvalidTestFile(String),

    #[error("Entity already exists: {0}")]
    EntityAlreadyExists(String),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Entity '{id}' is a {actual}, expected a {expected}")]
    EntityTypeMismatch {
        id: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Mismatch: {0}")]
    Mismatch(String),

    #[error("Assertion failed: {0}")]
    AssertionFailed(String),

    #[error("Unsupported special operator: {0}")]
    UnsupportedOperator(String),

    #[error("Unknown $$type alias: '{0}'")]
    UnknownTypeAlias(String),

    #[error("Unsupported event type: {0}")]
    UnsupportedEventType(String),

    #[error("Driver error: {0}")]
    Driver(#[from] unified_common::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config write error: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

impl RunnerError {
    /// Errors raised while loading a test file
    pub fn is_spec_load(&self) -> bool {
        matches!(
            self,
            RunnerError::InvalidSchemaVersion(_)
                | RunnerError::UnsupportedSchemaVersion { .. }
                | RunnerError::UnrecognizedOperation(_)
                | RunnerError::UnrecognizedArgument { .. }
                | RunnerError::InvalidTestFile(_)
                | RunnerError::Json(_)
        )
    }

    /// Errors after which no further test in the same file is run: load
    /// failures and features the interpreter itself does not support.
    pub fn is_fatal(&self) -> bool {
        self.is_spec_load()
            || matches!(
                self,
                RunnerError::UnsupportedOperator(_)
                    | RunnerError::UnknownTypeAlias(_)
                    | RunnerError::UnsupportedEventType(_)
                    | RunnerError::Io(_)
            )
    }
}

pub type RunnerResult<T> = Result<T, RunnerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(RunnerError::UnrecognizedOperation("foo".into()).is_fatal());
        assert!(RunnerError::UnknownTypeAlias("number".into()).is_fatal());
        assert!(!RunnerError::UnknownTypeAlias("number".into()).is_spec_load());
        assert!(!RunnerError::Mismatch("x".into()).is_fatal());
        assert!(!RunnerError::AssertionFailed("x".into()).is_fatal());
    }

    #[test]
    fn test_unrecognized_argument_names_operation_and_key() {
        let err = RunnerError::UnrecognizedArgument {
            operation: "insertOne".into(),
            argument: "documnet".into(),
        };
        assert_eq!(
            err.to_string(),
            "Unrecognized argument 'documnet' for operation 'insertOne'"
        );
    }
}
