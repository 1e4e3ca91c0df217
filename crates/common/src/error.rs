//! Error types raised by driver implementations

use bson::Document;
use std::collections::BTreeSet;
use thiserror::Error;

/// Result type alias using the driver Error
pub type Result<T> = std::result::Result<T, Error>;

/// Label attached to errors after which the whole transaction may be retried
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";

/// Label attached to commit errors whose outcome is unknown
pub const UNKNOWN_TRANSACTION_COMMIT_RESULT: &str = "UnknownTransactionCommitResult";

/// A failure raised by a driver call.
///
/// Carries the failure category plus the set of error labels the server (or
/// the driver itself) attached to it.
#[derive(Error, Debug, Clone)]
#[error("{kind}")]
pub struct Error {
    pub kind: Box<ErrorKind>,
    labels: BTreeSet<String>,
}

/// Server-reported command failure
#[derive(Debug, Clone, PartialEq)]
pub struct CommandError {
    pub code: i32,
    pub code_name: String,
    pub message: String,
}

/// A single write failure inside a bulk operation
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedWriteError {
    pub index: usize,
    pub code: i32,
    pub code_name: String,
    pub message: String,
}

/// Failure of an insertMany/bulkWrite, with what was applied before it stopped
#[derive(Debug, Clone)]
pub struct BulkWriteFailure {
    pub write_errors: Vec<IndexedWriteError>,
    pub write_concern_error: Option<CommandError>,
    /// Result document describing the writes that did succeed
    pub partial_result: Option<Document>,
}

#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ErrorKind {
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Command failed: {} ({}, code {})", .0.message, .0.code_name, .0.code)]
    Command(CommandError),

    #[error("Write error: {} ({}, code {})", .0.message, .0.code_name, .0.code)]
    Write(CommandError),

    #[error("Bulk write failed: {}", bulk_write_message(.0))]
    BulkWrite(BulkWriteFailure),

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Transaction error: {message}")]
    Transaction { message: String },

    #[error("Session error: {message}")]
    Session { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

fn bulk_write_message(failure: &BulkWriteFailure) -> String {
    let mut parts: Vec<String> = failure
        .write_errors
        .iter()
        .map(|e| format!("index {}: {} ({})", e.index, e.message, e.code_name))
        .collect();
    if let Some(wc) = &failure.write_concern_error {
        parts.push(format!("write concern: {}", wc.message));
    }
    parts.join("; ")
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Box::new(kind),
            labels: BTreeSet::new(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument { message: message.into() })
    }

    pub fn command(code: i32, code_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Command(CommandError {
            code,
            code_name: code_name.into(),
            message: message.into(),
        }))
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network { message: message.into() })
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transaction { message: message.into() })
    }

    pub fn session(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Session { message: message.into() })
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal { message: message.into() })
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.insert(label.into());
        self
    }

    pub fn add_label(&mut self, label: impl Into<String>) {
        self.labels.insert(label.into());
    }

    pub fn labels(&self) -> &BTreeSet<String> {
        &self.labels
    }

    pub fn contains_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    /// The structured server code, if the failure carries one
    pub fn code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Command(e) | ErrorKind::Write(e) => Some(e.code),
            ErrorKind::BulkWrite(failure) => failure
                .write_errors
                .first()
                .map(|e| e.code)
                .or_else(|| failure.write_concern_error.as_ref().map(|e| e.code)),
            _ => None,
        }
    }

    pub fn code_name(&self) -> Option<&str> {
        match self.kind.as_ref() {
            ErrorKind::Command(e) | ErrorKind::Write(e) => Some(e.code_name.as_str()),
            ErrorKind::BulkWrite(failure) => failure
                .write_errors
                .first()
                .map(|e| e.code_name.as_str())
                .or_else(|| failure.write_concern_error.as_ref().map(|e| e.code_name.as_str())),
            _ => None,
        }
    }

    /// Human-readable message without the category prefix
    pub fn message(&self) -> String {
        match self.kind.as_ref() {
            ErrorKind::InvalidArgument { message }
            | ErrorKind::Network { message }
            | ErrorKind::Transaction { message }
            | ErrorKind::Session { message }
            | ErrorKind::Internal { message } => message.clone(),
            ErrorKind::Command(e) | ErrorKind::Write(e) => e.message.clone(),
            ErrorKind::BulkWrite(failure) => bulk_write_message(failure),
        }
    }

    /// True when the failure was produced by client-side logic rather than
    /// reported by a server.
    pub fn is_client_error(&self) -> bool {
        self.code().is_none()
    }

    pub fn is_network_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Network { .. })
    }

    /// The partially-applied result carried by bulk write failures
    pub fn partial_result(&self) -> Option<&Document> {
        match self.kind.as_ref() {
            ErrorKind::BulkWrite(failure) => failure.partial_result.as_ref(),
            _ => None,
        }
    }

    /// Error rendered as a server-style document
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("errmsg", self.message());
        if let Some(code) = self.code() {
            doc.insert("code", code);
        }
        if let Some(name) = self.code_name() {
            doc.insert("codeName", name);
        }
        if !self.labels.is_empty() {
            let labels: Vec<String> = self.labels.iter().cloned().collect();
            doc.insert("errorLabels", labels);
        }
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_client_errors_have_no_code() {
        let err = Error::invalid_argument("bad option");
        assert!(err.is_client_error());
        assert_eq!(err.code(), None);
        assert_eq!(err.message(), "bad option");
        assert_eq!(err.to_string(), "Invalid argument: bad option");
    }

    #[test]
    fn test_command_error_fields() {
        let err = Error::command(11000, "DuplicateKey", "E11000 duplicate key error")
            .with_label(TRANSIENT_TRANSACTION_ERROR);
        assert!(!err.is_client_error());
        assert_eq!(err.code(), Some(11000));
        assert_eq!(err.code_name(), Some("DuplicateKey"));
        assert!(err.contains_label(TRANSIENT_TRANSACTION_ERROR));
        assert_eq!(
            err.to_document().get_array("errorLabels").unwrap().len(),
            1
        );
    }

    #[test]
    fn test_bulk_write_exposes_first_write_error() {
        let err = Error::new(ErrorKind::BulkWrite(BulkWriteFailure {
            write_errors: vec![IndexedWriteError {
                index: 1,
                code: 11000,
                code_name: "DuplicateKey".to_string(),
                message: "dup".to_string(),
            }],
            write_concern_error: None,
            partial_result: Some(doc! { "insertedCount": 1 }),
        }));
        assert_eq!(err.code(), Some(11000));
        assert_eq!(err.partial_result().unwrap().get_i32("insertedCount").unwrap(), 1);
        assert!(err.message().contains("index 1"));
    }
}
