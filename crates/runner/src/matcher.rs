//! Structural matching of actual values against test expectations
//!
//! ```text
//! expected ──┬─ {"$$op": arg}  ──▶ special operator
//!            ├─ document       ──▶ every expected key matches; extra actual
//!            │                     keys allowed only on root documents
//!            ├─ array          ──▶ same length, element-wise, in order
//!            ├─ int/long/double ─▶ numeric, |e - a| <= 0.0001
//!            └─ other scalar   ──▶ equal value and type
//! ```
//!
//! Special operators: `$$exists`, `$$type`, `$$matchesEntity`,
//! `$$unsetOrMatches` and `$$sessionLsid`. Any other `$$` operator is a fatal
//! [`RunnerError::UnsupportedOperator`].

use bson::spec::ElementType;
use bson::{Bson, Document};
use tracing::debug;

use unified_common::CommandEvent;

use crate::entity::EntityMap;
use crate::error::{RunnerError, RunnerResult};
use crate::test_file::ExpectedEvent;

const NUMERIC_TOLERANCE: f64 = 0.0001;

/// The actual side of a comparison, tagged with how it may be matched
#[derive(Debug, Clone, Copy)]
pub enum Actual<'a> {
    /// Top-level document; extra keys are tolerated
    RootDocument(&'a Document),
    /// Top-level array; documents directly inside it are root documents
    RootArray(&'a [Bson]),
    /// Nested document; its key set must match exactly
    Document(&'a Document),
    Array(&'a [Bson]),
    Scalar(&'a Bson),
    Absent,
}

impl<'a> Actual<'a> {
    pub fn root(value: Option<&'a Bson>) -> Self {
        match value {
            Some(Bson::Document(doc)) => Actual::RootDocument(doc),
            Some(Bson::Array(items)) => Actual::RootArray(items),
            Some(other) => Actual::Scalar(other),
            None => Actual::Absent,
        }
    }

    pub fn nested(value: Option<&'a Bson>) -> Self {
        match value {
            Some(Bson::Document(doc)) => Actual::Document(doc),
            Some(Bson::Array(items)) => Actual::Array(items),
            Some(other) => Actual::Scalar(other),
            None => Actual::Absent,
        }
    }

    /// Element of an array at this level
    fn element(&self, value: &'a Bson) -> Actual<'a> {
        match (self, value) {
            (Actual::RootArray(_), Bson::Document(doc)) => Actual::RootDocument(doc),
            _ => Actual::nested(Some(value)),
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Actual::Absent)
    }

    fn element_type(&self) -> Option<ElementType> {
        match self {
            Actual::RootDocument(_) | Actual::Document(_) => Some(ElementType::EmbeddedDocument),
            Actual::RootArray(_) | Actual::Array(_) => Some(ElementType::Array),
            Actual::Scalar(value) => Some(value.element_type()),
            Actual::Absent => None,
        }
    }

    fn to_bson(self) -> Option<Bson> {
        match self {
            Actual::RootDocument(doc) | Actual::Document(doc) => Some(Bson::Document(doc.clone())),
            Actual::RootArray(items) | Actual::Array(items) => Some(Bson::Array(items.to_vec())),
            Actual::Scalar(value) => Some(value.clone()),
            Actual::Absent => None,
        }
    }
}

/// Match `actual` as a top-level value
pub fn matches_root(expected: &Bson, actual: Option<&Bson>, entities: &EntityMap) -> RunnerResult<bool> {
    matches(expected, Actual::root(actual), entities)
}

pub fn matches(expected: &Bson, actual: Actual<'_>, entities: &EntityMap) -> RunnerResult<bool> {
    match_at(expected, actual, entities, "")
}

fn match_at(expected: &Bson, actual: Actual<'_>, entities: &EntityMap, path: &str) -> RunnerResult<bool> {
    let matched = match expected {
        Bson::Document(expected_doc) => {
            if let Some((operator, argument)) = special_operator(expected_doc) {
                special(operator, argument, actual, entities, path)?
            } else {
                match_document(expected_doc, actual, entities, path)?
            }
        }
        Bson::Array(expected_items) => {
            let items = match actual {
                Actual::RootArray(items) | Actual::Array(items) => items,
                _ => return Ok(mismatch(path, "expected an array")),
            };
            if items.len() != expected_items.len() {
                return Ok(mismatch(path, "array lengths differ"));
            }
            for (index, (expected_item, item)) in expected_items.iter().zip(items).enumerate() {
                let item_path = format!("{}.{}", path, index);
                if !match_at(expected_item, actual.element(item), entities, &item_path)? {
                    return Ok(false);
                }
            }
            true
        }
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => {
            let expected = as_f64(expected);
            match (expected, actual) {
                (Some(e), Actual::Scalar(value)) => {
                    as_f64(value).map(|a| (e - a).abs() <= NUMERIC_TOLERANCE).unwrap_or(false)
                }
                _ => false,
            }
        }
        scalar => matches!(actual, Actual::Scalar(value) if value == scalar),
    };
    if !matched {
        debug!(
            "No match at '{}': expected {}, actual {:?}",
            display_path(path),
            expected,
            actual.to_bson()
        );
    }
    Ok(matched)
}

fn match_document(
    expected: &Document,
    actual: Actual<'_>,
    entities: &EntityMap,
    path: &str,
) -> RunnerResult<bool> {
    let (doc, is_root) = match actual {
        Actual::RootDocument(doc) => (doc, true),
        Actual::Document(doc) => (doc, false),
        _ => return Ok(false),
    };
    for (key, expected_value) in expected {
        let key_path = format!("{}.{}", path, key);
        if !match_at(expected_value, Actual::nested(doc.get(key)), entities, &key_path)? {
            return Ok(false);
        }
    }
    if !is_root {
        if let Some(extra) = doc.keys().find(|key| !expected.contains_key(key.as_str())) {
            return Ok(mismatch(path, &format!("unexpected key '{}'", extra)));
        }
    }
    Ok(true)
}

/// `{"$$name": argument}` with exactly one key
fn special_operator(doc: &Document) -> Option<(&str, &Bson)> {
    if doc.len() != 1 {
        return None;
    }
    doc.iter()
        .next()
        .filter(|(key, _)| key.starts_with("$$"))
        .map(|(key, value)| (key.as_str(), value))
}

fn special(
    operator: &str,
    argument: &Bson,
    actual: Actual<'_>,
    entities: &EntityMap,
    path: &str,
) -> RunnerResult<bool> {
    match operator {
        "$$exists" => {
            let should_exist = argument.as_bool().ok_or_else(|| {
                RunnerError::InvalidTestFile(format!("$$exists expects a boolean, got {}", argument))
            })?;
            Ok(actual.is_absent() != should_exist)
        }
        "$$type" => {
            let aliases: Vec<&str> = match argument {
                Bson::String(alias) => vec![alias.as_str()],
                Bson::Array(items) => items
                    .iter()
                    .map(|item| {
                        item.as_str().ok_or_else(|| {
                            RunnerError::InvalidTestFile(format!("$$type alias must be a string, got {}", item))
                        })
                    })
                    .collect::<RunnerResult<_>>()?,
                other => {
                    return Err(RunnerError::InvalidTestFile(format!(
                        "$$type expects a string or an array of strings, got {}",
                        other
                    )))
                }
            };
            let mut types = Vec::with_capacity(aliases.len());
            for alias in aliases {
                types.push(type_alias(alias)?);
            }
            Ok(actual.element_type().map(|t| types.contains(&t)).unwrap_or(false))
        }
        "$$unsetOrMatches" => {
            if actual.is_absent() {
                return Ok(true);
            }
            match_at(argument, actual, entities, path)
        }
        "$$matchesEntity" => {
            let id = entity_id(operator, argument)?;
            let value = entities.comparable_value(id)?;
            match_at(&value, actual, entities, path)
        }
        "$$sessionLsid" => {
            let id = entity_id(operator, argument)?;
            let lsid = &entities.session(id)?.lsid;
            Ok(match actual {
                Actual::RootDocument(doc) | Actual::Document(doc) => doc == lsid,
                _ => false,
            })
        }
        other => Err(RunnerError::UnsupportedOperator(other.to_string())),
    }
}

fn entity_id<'a>(operator: &str, argument: &'a Bson) -> RunnerResult<&'a str> {
    argument.as_str().ok_or_else(|| {
        RunnerError::InvalidTestFile(format!("{} expects an entity id, got {}", operator, argument))
    })
}

/// BSON type for a `$$type` alias
pub fn type_alias(alias: &str) -> RunnerResult<ElementType> {
    Ok(match alias {
        "double" => ElementType::Double,
        "string" => ElementType::String,
        "object" => ElementType::EmbeddedDocument,
        "array" => ElementType::Array,
        "binData" => ElementType::Binary,
        "undefined" => ElementType::Undefined,
        "objectId" => ElementType::ObjectId,
        "bool" => ElementType::Boolean,
        "date" => ElementType::DateTime,
        "null" => ElementType::Null,
        "regex" => ElementType::RegularExpression,
        "dbPointer" => ElementType::DbPointer,
        "javascript" => ElementType::JavaScriptCode,
        "symbol" => ElementType::Symbol,
        "javascriptWithScope" => ElementType::JavaScriptCodeWithScope,
        "int" => ElementType::Int32,
        "timestamp" => ElementType::Timestamp,
        "long" => ElementType::Int64,
        "decimal" => ElementType::Decimal128,
        "minKey" => ElementType::MinKey,
        "maxKey" => ElementType::MaxKey,
        other => return Err(RunnerError::UnknownTypeAlias(other.to_string())),
    })
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(i) => Some(f64::from(*i)),
        Bson::Int64(i) => Some(*i as f64),
        Bson::Double(d) => Some(*d),
        _ => None,
    }
}

fn display_path(path: &str) -> &str {
    if path.is_empty() {
        "<root>"
    } else {
        path.trim_start_matches('.')
    }
}

fn mismatch(path: &str, reason: &str) -> bool {
    debug!("No match at '{}': {}", display_path(path), reason);
    false
}

/// Match a client's captured events against the expected list. With
/// `ignore_extra`, actual events past the expected ones are allowed.
pub fn matches_events(
    expected: &[ExpectedEvent],
    actual: &[CommandEvent],
    entities: &EntityMap,
    ignore_extra: bool,
) -> RunnerResult<bool> {
    let length_ok = if ignore_extra {
        actual.len() >= expected.len()
    } else {
        actual.len() == expected.len()
    };
    if !length_ok {
        debug!("Expected {} event(s), captured {}", expected.len(), actual.len());
        return Ok(false);
    }
    for (index, (expected, actual)) in expected.iter().zip(actual).enumerate() {
        if !matches_event(expected, actual, entities)? {
            debug!(
                "Event {} differs: expected {}, captured {} ({})",
                index,
                expected.type_name(),
                actual.type_name(),
                actual.command_name()
            );
            return Ok(false);
        }
    }
    Ok(true)
}

fn matches_event(expected: &ExpectedEvent, actual: &CommandEvent, entities: &EntityMap) -> RunnerResult<bool> {
    let name_ok = |name: &Option<String>| name.as_deref().map(|n| n == actual.command_name()).unwrap_or(true);
    match (expected, actual) {
        (
            ExpectedEvent::CommandStarted {
                command_name,
                database_name,
                command,
            },
            CommandEvent::Started(started),
        ) => {
            if !name_ok(command_name) {
                return Ok(false);
            }
            if database_name.as_deref().map(|db| db != started.database_name).unwrap_or(false) {
                return Ok(false);
            }
            match command {
                Some(command) => matches(
                    &Bson::Document(command.clone()),
                    Actual::RootDocument(&started.command),
                    entities,
                ),
                None => Ok(true),
            }
        }
        (ExpectedEvent::CommandSucceeded { command_name, reply }, CommandEvent::Succeeded(succeeded)) => {
            if !name_ok(command_name) {
                return Ok(false);
            }
            match reply {
                Some(reply) => matches(
                    &Bson::Document(reply.clone()),
                    Actual::RootDocument(&succeeded.reply),
                    entities,
                ),
                None => Ok(true),
            }
        }
        (ExpectedEvent::CommandFailed { command_name }, CommandEvent::Failed(_)) => Ok(name_ok(command_name)),
        _ => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{bson, doc, Decimal128};
    use std::time::Duration;
    use test_case::test_case;
    use unified_common::event::{CommandFailedEvent, CommandStartedEvent, CommandSucceededEvent};
    use unified_common::ServerAddress;

    use crate::entity::{Entity, SessionEntity};

    fn root(expected: Bson, actual: Bson) -> bool {
        matches_root(&expected, Some(&actual), &EntityMap::new()).unwrap()
    }

    fn nested(expected: Bson, actual: Bson) -> bool {
        matches(&expected, Actual::nested(Some(&actual)), &EntityMap::new()).unwrap()
    }

    #[test]
    fn test_root_tolerates_extra_keys_nested_does_not() {
        let expected = bson!({ "a": 1 });
        let actual = bson!({ "a": 1, "b": 2 });
        assert!(root(expected.clone(), actual.clone()));
        assert!(!nested(expected, actual));
    }

    #[test]
    fn test_root_document_matches_itself_with_extra_keys() {
        let doc = bson!({ "x": { "y": [1, "two", { "z": null }] }, "w": true });
        let mut extended = doc.as_document().unwrap().clone();
        extended.insert("extra", "value");
        assert!(root(doc.clone(), doc.clone()));
        assert!(root(doc, Bson::Document(extended)));
    }

    #[test]
    fn test_nested_documents_reject_extra_keys() {
        assert!(!root(bson!({ "a": { "b": 1 } }), bson!({ "a": { "b": 1, "c": 2 } })));
        assert!(root(bson!({ "a": { "b": 1 } }), bson!({ "a": { "b": 1 }, "c": 2 })));
    }

    #[test_case(bson!(1), bson!(1.0), true ; "int matches double")]
    #[test_case(bson!(1), Bson::Int64(1), true ; "int matches long")]
    #[test_case(Bson::Int64(1), bson!(1), true ; "long matches int")]
    #[test_case(bson!(1), bson!(1.0001), false ; "outside tolerance")]
    #[test_case(bson!(1.5), bson!(1.50001), true ; "inside tolerance")]
    #[test_case(bson!(1), bson!("1"), false ; "string is not a number")]
    #[test_case(bson!(1), Bson::Decimal128(Decimal128::from_bytes([0; 16])), false ; "decimal is not lenient")]
    fn test_numeric_equivalence(expected: Bson, actual: Bson, result: bool) {
        assert_eq!(root(expected, actual), result);
    }

    #[test]
    fn test_decimal_matches_exactly() {
        let value = Bson::Decimal128(Decimal128::from_bytes([1; 16]));
        assert!(root(value.clone(), value));
    }

    #[test]
    fn test_exists() {
        assert!(root(bson!({ "a": { "$$exists": true } }), bson!({ "a": null })));
        assert!(root(bson!({ "a": { "$$exists": true } }), bson!({ "a": 5 })));
        assert!(!root(bson!({ "a": { "$$exists": true } }), bson!({})));
        assert!(root(bson!({ "a": { "$$exists": false } }), bson!({})));
        assert!(!root(bson!({ "a": { "$$exists": false } }), bson!({ "a": null })));
    }

    #[test]
    fn test_type() {
        assert!(root(bson!({ "a": { "$$type": "int" } }), bson!({ "a": 1 })));
        assert!(!root(bson!({ "a": { "$$type": "int" } }), bson!({ "a": "1" })));
        assert!(!root(bson!({ "a": { "$$type": "int" } }), bson!({ "a": Bson::Int64(1) })));
        assert!(root(bson!({ "a": { "$$type": ["int", "long"] } }), bson!({ "a": Bson::Int64(1) })));
        assert!(root(bson!({ "a": { "$$type": "object" } }), bson!({ "a": { "b": 1 } })));
        assert!(!root(bson!({ "a": { "$$type": "int" } }), bson!({})));
    }

    #[test]
    fn test_unknown_type_alias_is_fatal() {
        let result = matches_root(
            &bson!({ "$$type": "number" }),
            Some(&bson!(1)),
            &EntityMap::new(),
        );
        assert!(matches!(result, Err(RunnerError::UnknownTypeAlias(alias)) if alias == "number"));
    }

    #[test]
    fn test_unsupported_operator_is_fatal() {
        let result = matches_root(
            &bson!({ "$$matchesHexBytes": "0a" }),
            Some(&bson!("x")),
            &EntityMap::new(),
        );
        assert!(matches!(result, Err(RunnerError::UnsupportedOperator(_))));
    }

    #[test]
    fn test_unset_or_matches() {
        let expected = bson!({ "a": { "$$unsetOrMatches": 1 } });
        assert!(root(expected.clone(), bson!({})));
        assert!(root(expected.clone(), bson!({ "a": 1 })));
        assert!(!root(expected, bson!({ "a": 2 })));
        // an unset root value also matches
        assert!(matches_root(&bson!({ "$$unsetOrMatches": { "insertedId": 1 } }), None, &EntityMap::new()).unwrap());
    }

    #[test_case(bson!([1, 2]), bson!([2, 1]), false ; "order matters")]
    #[test_case(bson!([1, 2]), bson!([1, 2, 3]), false ; "length matters")]
    #[test_case(bson!([1, 2]), bson!([1, 2]), true ; "identical")]
    #[test_case(bson!([]), bson!({}), false ; "document is not an array")]
    fn test_arrays(expected: Bson, actual: Bson, result: bool) {
        assert_eq!(root(expected, actual), result);
    }

    #[test]
    fn test_documents_in_root_array_are_root_level() {
        let expected = bson!([{ "_id": 1 }]);
        assert!(root(expected.clone(), bson!([{ "_id": 1, "x": 1 }])));
        assert!(!nested(expected, bson!([{ "_id": 1, "x": 1 }])));
    }

    #[test]
    fn test_scalars_compare_by_type_and_value() {
        assert!(root(bson!("a"), bson!("a")));
        assert!(!root(bson!("a"), bson!("b")));
        assert!(!root(Bson::Null, bson!({})));
        assert!(!matches_root(&Bson::Null, None, &EntityMap::new()).unwrap());
        assert!(!root(bson!(true), bson!(1)));
    }

    #[tokio::test]
    async fn test_entity_operators() {
        use unified_common::{Client, Deployment, MemoryDeployment, Session};

        let deployment = MemoryDeployment::default();
        let client = deployment.connect(Default::default()).await.unwrap();
        let session = client.start_session(Default::default()).await.unwrap();
        let lsid = session.id();

        let mut entities = EntityMap::new();
        entities.insert("id", Entity::Bson(bson!({ "a": 1 }))).unwrap();
        entities
            .insert(
                "session0",
                Entity::Session(SessionEntity {
                    session,
                    client: "client0".to_string(),
                    lsid: lsid.clone(),
                }),
            )
            .unwrap();

        let command = Bson::Document(doc! { "find": "coll", "lsid": lsid.clone(), "x": { "a": 1 } });
        let expected = bson!({ "lsid": { "$$sessionLsid": "session0" }, "x": { "$$matchesEntity": "id" } });
        assert!(matches_root(&expected, Some(&command), &entities).unwrap());

        let other = bson!({ "lsid": { "id": 5 } });
        assert!(!matches_root(&bson!({ "lsid": { "$$sessionLsid": "session0" } }), Some(&other), &entities).unwrap());
        assert!(matches!(
            matches_root(&bson!({ "$$matchesEntity": "missing" }), Some(&other), &entities),
            Err(RunnerError::EntityNotFound(_))
        ));
        client.shutdown().await;
    }

    fn address() -> ServerAddress {
        ServerAddress::new("localhost", 27017)
    }

    fn started(command: Document) -> CommandEvent {
        CommandEvent::Started(CommandStartedEvent {
            command_name: command.keys().next().cloned().unwrap(),
            command,
            database_name: "db".to_string(),
            request_id: 1,
            connection: address(),
        })
    }

    #[test]
    fn test_events() {
        let actual = vec![
            started(doc! { "insert": "coll", "documents": [{ "_id": 1 }], "lsid": { "id": 1 } }),
            CommandEvent::Succeeded(CommandSucceededEvent {
                reply: doc! { "n": 1, "ok": 1.0 },
                command_name: "insert".to_string(),
                duration: Duration::ZERO,
                request_id: 1,
                connection: address(),
            }),
            CommandEvent::Failed(CommandFailedEvent {
                failure: unified_common::Error::network("closed"),
                command_name: "find".to_string(),
                duration: Duration::ZERO,
                request_id: 2,
                connection: address(),
            }),
        ];
        let expected = vec![
            ExpectedEvent::CommandStarted {
                command_name: Some("insert".to_string()),
                database_name: Some("db".to_string()),
                command: Some(doc! { "insert": "coll", "documents": [{ "_id": 1 }] }),
            },
            ExpectedEvent::CommandSucceeded {
                command_name: None,
                reply: Some(doc! { "n": 1 }),
            },
            ExpectedEvent::CommandFailed {
                command_name: Some("find".to_string()),
            },
        ];
        let entities = EntityMap::new();
        assert!(matches_events(&expected, &actual, &entities, false).unwrap());
        assert!(!matches_events(&expected[..2], &actual, &entities, false).unwrap());
        assert!(matches_events(&expected[..2], &actual, &entities, true).unwrap());

        let wrong_kind = vec![ExpectedEvent::CommandSucceeded {
            command_name: None,
            reply: None,
        }];
        assert!(!matches_events(&wrong_kind, &actual[..1], &entities, false).unwrap());

        let wrong_db = vec![ExpectedEvent::CommandStarted {
            command_name: None,
            database_name: Some("other".to_string()),
            command: None,
        }];
        assert!(!matches_events(&wrong_db, &actual[..1], &entities, false).unwrap());
    }
}
