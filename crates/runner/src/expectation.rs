//! Expected-error assertions

use bson::Bson;
use serde::Deserialize;
use tracing::debug;

use unified_common::Error;

use crate::entity::EntityMap;
use crate::error::RunnerResult;
use crate::matcher;
use crate::test_file::present_bson;

/// An `expectError` block. Every populated field narrows the match on its own;
/// an empty block matches any failure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExpectedError {
    #[serde(default)]
    pub is_error: Option<bool>,
    #[serde(default)]
    pub is_client_error: Option<bool>,
    #[serde(default)]
    pub error_contains: Option<String>,
    #[serde(default)]
    pub error_code: Option<i32>,
    #[serde(default)]
    pub error_code_name: Option<String>,
    #[serde(default)]
    pub error_labels_contain: Option<Vec<String>>,
    #[serde(default)]
    pub error_labels_omit: Option<Vec<String>>,
    #[serde(default, deserialize_with = "present_bson")]
    pub expect_result: Option<Bson>,
}

impl ExpectedError {
    pub fn matches(&self, actual: &Error, entities: &EntityMap) -> RunnerResult<bool> {
        if let Some(expected) = self.is_client_error {
            if actual.is_client_error() != expected {
                debug!("isClientError: expected {}, error was {}", expected, actual);
                return Ok(false);
            }
        }

        if let Some(needle) = &self.error_contains {
            let message = actual.message().to_lowercase();
            if !message.contains(&needle.to_lowercase()) {
                debug!("errorContains: '{}' not in '{}'", needle, actual.message());
                return Ok(false);
            }
        }

        if let Some(code) = self.error_code {
            if actual.code() != Some(code) {
                debug!("errorCode: expected {}, got {:?}", code, actual.code());
                return Ok(false);
            }
        }

        if let Some(name) = &self.error_code_name {
            match actual.code_name() {
                Some("") => {}
                Some(actual_name) if actual_name == name => {}
                other => {
                    debug!("errorCodeName: expected {}, got {:?}", name, other);
                    return Ok(false);
                }
            }
        }

        if let Some(labels) = &self.error_labels_contain {
            if let Some(missing) = labels.iter().find(|label| !actual.contains_label(label)) {
                debug!("errorLabelsContain: '{}' missing from {:?}", missing, actual.labels());
                return Ok(false);
            }
        }

        if let Some(labels) = &self.error_labels_omit {
            if let Some(present) = labels.iter().find(|label| actual.contains_label(label)) {
                debug!("errorLabelsOmit: '{}' present", present);
                return Ok(false);
            }
        }

        if let Some(expected) = &self.expect_result {
            let partial = match actual.partial_result() {
                Some(partial) => Bson::Document(partial.clone()),
                None => {
                    debug!("expectResult: error carries no partial result");
                    return Ok(false);
                }
            };
            if !matcher::matches_root(expected, Some(&partial), entities)? {
                return Ok(false);
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{bson, doc};
    use unified_common::error::{BulkWriteFailure, IndexedWriteError, TRANSIENT_TRANSACTION_ERROR};
    use unified_common::ErrorKind;

    fn parse(value: Bson) -> ExpectedError {
        bson::from_bson(value).unwrap()
    }

    fn check(expected: Bson, actual: &Error) -> bool {
        parse(expected).matches(actual, &EntityMap::new()).unwrap()
    }

    fn duplicate_key() -> Error {
        Error::command(11000, "DuplicateKey", "E11000 duplicate key error collection: db.coll")
            .with_label(TRANSIENT_TRANSACTION_ERROR)
    }

    #[test]
    fn test_empty_expectation_matches_anything() {
        assert!(check(bson!({}), &duplicate_key()));
        assert!(check(bson!({ "isError": true }), &Error::network("reset")));
    }

    #[test]
    fn test_client_error() {
        assert!(check(bson!({ "isClientError": true }), &Error::invalid_argument("bad")));
        assert!(!check(bson!({ "isClientError": true }), &duplicate_key()));
        assert!(check(bson!({ "isClientError": false }), &duplicate_key()));
    }

    #[test]
    fn test_error_contains_ignores_case() {
        assert!(check(bson!({ "errorContains": "DUPLICATE KEY" }), &duplicate_key()));
        assert!(!check(bson!({ "errorContains": "timeout" }), &duplicate_key()));
    }

    #[test]
    fn test_code_and_name() {
        assert!(check(bson!({ "errorCode": 11000, "errorCodeName": "DuplicateKey" }), &duplicate_key()));
        assert!(!check(bson!({ "errorCode": 11001 }), &duplicate_key()));
        assert!(!check(bson!({ "errorCodeName": "Other" }), &duplicate_key()));
        // a client error carries neither
        assert!(!check(bson!({ "errorCode": 11000 }), &Error::invalid_argument("bad")));
        assert!(!check(bson!({ "errorCodeName": "DuplicateKey" }), &Error::invalid_argument("bad")));
    }

    #[test]
    fn test_empty_code_name_passes() {
        let error = Error::command(8, "", "unknown");
        assert!(check(bson!({ "errorCodeName": "UnknownError" }), &error));
    }

    #[test]
    fn test_labels() {
        let error = duplicate_key();
        assert!(check(bson!({ "errorLabelsContain": [TRANSIENT_TRANSACTION_ERROR] }), &error));
        assert!(!check(bson!({ "errorLabelsOmit": [TRANSIENT_TRANSACTION_ERROR] }), &error));
        assert!(check(bson!({ "errorLabelsOmit": ["RetryableWriteError"] }), &error));
        assert!(!check(
            bson!({ "errorLabelsContain": ["RetryableWriteError"] }),
            &Error::invalid_argument("bad")
        ));
    }

    #[test]
    fn test_expect_result_needs_partial_result() {
        assert!(!check(bson!({ "expectResult": { "insertedCount": 1 } }), &duplicate_key()));

        let bulk = Error::new(ErrorKind::BulkWrite(BulkWriteFailure {
            write_errors: vec![IndexedWriteError {
                index: 1,
                code: 11000,
                code_name: "DuplicateKey".to_string(),
                message: "E11000".to_string(),
            }],
            write_concern_error: None,
            partial_result: Some(doc! { "insertedCount": 1_i64, "insertedIds": { "0": 1 } }),
        }));
        assert!(check(bson!({ "expectResult": { "insertedCount": 1 } }), &bulk));
        assert!(!check(bson!({ "expectResult": { "insertedCount": 2 } }), &bulk));
        assert!(check(bson!({ "errorCode": 11000 }), &bulk));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let result: Result<ExpectedError, _> = bson::from_bson(bson!({ "errorCodeNames": "x" }));
        assert!(result.is_err());
    }
}
