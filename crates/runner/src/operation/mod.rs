//! Operation decoding and dispatch
//!
//! ```text
//! {name, object, arguments, expect*}
//!        │
//!        ▼  Operation::decode (file load)
//! ┌──────────────────────────────────────────────┐
//! │ Operation                                    │
//! │   target: testRunner | entity id             │
//! │   action: Action::<Kind>(<Kind> arguments)   │
//! │   expectation: none | result | error         │
//! └──────────────────────────────────────────────┘
//!        │
//!        ▼  Operation::execute(&mut ExecutionContext)
//!   OperationResult ──▶ Operation::check ──▶ Ok | Mismatch
//! ```
//!
//! Every operation kind is a struct holding its decoded arguments. It names
//! itself and its accepted argument keys through [`Arguments`] and runs
//! through [`Execute`]. The closed [`Action`] enum is generated from the
//! registry at the bottom of this module.

mod change_stream;
mod client;
mod collection;
mod database;
mod placeholder;
mod session;
mod test_runner;

use async_trait::async_trait;
use bson::{Bson, Document};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use unified_common::options::RunCommandOptions;
use unified_common::{ChangeStream, Client, ServerAddress};

use crate::entity::{Entity, EntityMap};
use crate::error::{RunnerError, RunnerResult};
use crate::expectation::ExpectedError;
use crate::matcher;
use crate::test_file::present_bson;

pub use change_stream::{CreateChangeStream, IterateUntilDocumentOrError};
pub use client::{ListDatabaseNames, ListDatabases};
pub use collection::{
    Aggregate, BulkWrite, CountDocuments, CreateIndex, DeleteMany, DeleteOne, Distinct, DropIndex,
    EstimatedDocumentCount, Find, FindOneAndDelete, FindOneAndReplace, FindOneAndUpdate,
    InsertMany, InsertOne, ListIndexes, ReplaceOne, UpdateMany, UpdateOne,
};
pub use database::{CreateCollection, DropCollection, ListCollectionNames, ListCollections, RunCommand};
pub use placeholder::{
    BucketDelete, BucketDrop, BucketRename, Download, DownloadByName, Upload, WithTransaction,
};
pub use session::{AbortTransaction, CommitTransaction, EndSession, StartTransaction};
pub use test_runner::{
    AssertCollectionExists, AssertCollectionNotExists, AssertDifferentLsidOnLastTwoCommands,
    AssertIndexExists, AssertIndexNotExists, AssertSameLsidOnLastTwoCommands,
    AssertSessionDirty, AssertSessionNotDirty, AssertSessionPinned,
    AssertSessionTransactionState, AssertSessionUnpinned, FailPoint, TargetedFailPoint,
};

/// Object name addressing the runner itself
pub const TEST_RUNNER: &str = "testRunner";

/// An operation exactly as written in a test file
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawOperation {
    pub name: String,
    pub object: String,
    #[serde(default)]
    pub arguments: Option<Document>,
    #[serde(default)]
    pub expect_error: Option<ExpectedError>,
    #[serde(default, deserialize_with = "present_bson")]
    pub expect_result: Option<Bson>,
    #[serde(default)]
    pub save_result_as_entity: Option<String>,
    #[serde(default)]
    pub ignore_result_and_error: Option<bool>,
}

/// What an operation runs against
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationTarget {
    TestRunner,
    Entity(String),
}

impl OperationTarget {
    /// The entity id, or a load error for operations that need one
    pub fn entity_id(&self, operation: &str) -> RunnerResult<&str> {
        match self {
            OperationTarget::Entity(id) => Ok(id),
            OperationTarget::TestRunner => Err(RunnerError::InvalidTestFile(format!(
                "{} must target an entity, not {}",
                operation, TEST_RUNNER
            ))),
        }
    }
}

impl fmt::Display for OperationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationTarget::TestRunner => write!(f, "{}", TEST_RUNNER),
            OperationTarget::Entity(id) => write!(f, "{}", id),
        }
    }
}

/// What the test asserts about an operation's outcome
#[derive(Debug, Clone)]
pub enum Expectation {
    None,
    Result {
        expected: Option<Bson>,
        save_as: Option<String>,
    },
    Error(ExpectedError),
}

impl Expectation {
    /// No error, no value and no entity to save
    pub fn is_empty(&self) -> bool {
        matches!(
            self,
            Expectation::None
                | Expectation::Result {
                    expected: None,
                    save_as: None
                }
        )
    }

    fn save_as(&self) -> Option<&str> {
        match self {
            Expectation::Result { save_as, .. } => save_as.as_deref(),
            _ => None,
        }
    }
}

/// A decoded operation, ready to run
#[derive(Debug)]
pub struct Operation {
    pub name: String,
    pub target: OperationTarget,
    pub action: Action,
    pub expectation: Expectation,
    pub ignore_result_and_error: bool,
}

impl Operation {
    /// Decode and validate a raw operation
    pub fn decode(raw: RawOperation) -> RunnerResult<Self> {
        let target = if raw.object == TEST_RUNNER {
            OperationTarget::TestRunner
        } else {
            OperationTarget::Entity(raw.object)
        };
        let action = Action::decode(&raw.name, raw.arguments.unwrap_or_default())?;

        let expectation = match (raw.expect_error, raw.expect_result, raw.save_result_as_entity) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
                return Err(RunnerError::InvalidTestFile(format!(
                    "{}: expectError cannot be combined with expectResult or saveResultAsEntity",
                    raw.name
                )))
            }
            (Some(error), None, None) => Expectation::Error(error),
            (None, None, None) => Expectation::None,
            (None, expected, save_as) => Expectation::Result { expected, save_as },
        };

        Ok(Self {
            name: raw.name,
            target,
            action,
            expectation,
            ignore_result_and_error: raw.ignore_result_and_error.unwrap_or(false),
        })
    }

    pub async fn execute(&self, ctx: &mut ExecutionContext<'_>) -> RunnerResult<OperationResult> {
        debug!("Executing {} on {}", self.name, self.target);
        self.action.execute(&self.target, ctx).await
    }

    /// Compare the outcome with the expectation and save the result if asked to
    pub fn check(&self, result: OperationResult, entities: &mut EntityMap) -> RunnerResult<()> {
        if self.ignore_result_and_error {
            if let Some(id) = self.expectation.save_as() {
                entities.insert(id, saved_entity(&self.name, result))?;
            }
            return Ok(());
        }

        match (&self.expectation, result) {
            (Expectation::Error(expected), OperationResult::Error(error)) => {
                if expected.matches(&error, entities)? {
                    Ok(())
                } else {
                    Err(RunnerError::Mismatch(format!(
                        "{} raised an error that does not match expectError: {}",
                        self.name, error
                    )))
                }
            }
            (Expectation::Error(_), result) => Err(RunnerError::Mismatch(format!(
                "{} was expected to fail but succeeded with {:?}",
                self.name, result
            ))),
            (_, OperationResult::Error(error)) => Err(RunnerError::Mismatch(format!(
                "{} failed unexpectedly: {}",
                self.name, error
            ))),
            (Expectation::None, _) => Ok(()),
            (Expectation::Result { expected, save_as }, result) => {
                if let Some(expected) = expected {
                    let matched = match &result {
                        OperationResult::Value(actual) => {
                            matcher::matches_root(expected, Some(actual), entities)?
                        }
                        OperationResult::None => matcher::matches_root(expected, None, entities)?,
                        OperationResult::ChangeStream(_) => {
                            return Err(RunnerError::InvalidTestFile(format!(
                                "{} returns a change stream, which cannot be compared",
                                self.name
                            )))
                        }
                        OperationResult::Error(_) => false,
                    };
                    if !matched {
                        return Err(RunnerError::Mismatch(format!(
                            "{} result {:?} does not match {}",
                            self.name, result, expected
                        )));
                    }
                }
                if let Some(id) = save_as {
                    entities.insert(id.as_str(), saved_entity(&self.name, result))?;
                }
                Ok(())
            }
        }
    }
}

fn saved_entity(operation: &str, result: OperationResult) -> Entity {
    match result {
        OperationResult::Value(value) => Entity::Bson(value),
        OperationResult::ChangeStream(stream) => Entity::ChangeStream(stream),
        OperationResult::Error(error) => Entity::Failure(error),
        OperationResult::None => {
            debug!("{} produced no value; saving null", operation);
            Entity::Bson(Bson::Null)
        }
    }
}

/// Outcome of executing one operation. Driver failures are values here so
/// they can be checked against `expectError`.
pub enum OperationResult {
    None,
    Value(Bson),
    Error(unified_common::Error),
    ChangeStream(Box<dyn ChangeStream>),
}

impl OperationResult {
    fn from_driver<T>(result: unified_common::Result<T>, to_bson: impl FnOnce(T) -> Bson) -> Self {
        match result {
            Ok(value) => OperationResult::Value(to_bson(value)),
            Err(error) => OperationResult::Error(error),
        }
    }

    fn from_unit(result: unified_common::Result<()>) -> Self {
        match result {
            Ok(()) => OperationResult::None,
            Err(error) => OperationResult::Error(error),
        }
    }

    fn from_documents(result: unified_common::Result<Vec<Document>>) -> Self {
        Self::from_driver(result, |documents| {
            Bson::Array(documents.into_iter().map(Bson::Document).collect())
        })
    }
}

impl fmt::Debug for OperationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationResult::None => write!(f, "None"),
            OperationResult::Value(value) => write!(f, "Value({})", value),
            OperationResult::Error(error) => write!(f, "Error({})", error),
            OperationResult::ChangeStream(_) => write!(f, "ChangeStream"),
        }
    }
}

/// A fail point turned on during a test, turned off at teardown
pub struct EnabledFailPoint {
    pub client: Arc<dyn Client>,
    pub name: String,
    pub server: Option<ServerAddress>,
}

impl EnabledFailPoint {
    pub async fn disable(&self) -> unified_common::Result<()> {
        let mut command = Document::new();
        command.insert("configureFailPoint", self.name.clone());
        command.insert("mode", "off");
        let options = RunCommandOptions {
            read_preference: None,
            target: self.server.clone(),
        };
        self.client
            .database("admin", Default::default())
            .run_command(command, options, None)
            .await?;
        Ok(())
    }
}

impl fmt::Debug for EnabledFailPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnabledFailPoint")
            .field("name", &self.name)
            .field("server", &self.server)
            .finish()
    }
}

/// Runner state an operation may read or change
pub struct ExecutionContext<'a> {
    pub entities: &'a mut EntityMap,
    /// Client the runner uses for setup and inspection; never observed
    pub internal_client: &'a Arc<dyn Client>,
    pub fail_points: &'a mut Vec<EnabledFailPoint>,
    /// Budget for `iterateUntilDocumentOrError`
    pub change_stream_wait: Duration,
}

/// Name and accepted argument keys of an operation kind
pub trait Arguments: DeserializeOwned {
    const NAME: &'static str;
    const KNOWN_ARGUMENTS: &'static [&'static str];

    fn decode(arguments: Document) -> RunnerResult<Self> {
        check_arguments(Self::NAME, Self::KNOWN_ARGUMENTS, &arguments)?;
        bson::from_document(arguments)
            .map_err(|e| RunnerError::InvalidTestFile(format!("{}: {}", Self::NAME, e)))
    }
}

#[async_trait]
pub trait Execute {
    async fn execute(
        &self,
        target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult>;
}

/// Reject any argument key the operation does not know
pub fn check_arguments(operation: &str, known: &[&str], arguments: &Document) -> RunnerResult<()> {
    match arguments.keys().find(|key| !known.contains(&key.as_str())) {
        Some(argument) => Err(RunnerError::UnrecognizedArgument {
            operation: operation.to_string(),
            argument: argument.clone(),
        }),
        None => Ok(()),
    }
}

/// Placeholder operations are accepted but do nothing
fn inert(operation: &str) -> RunnerResult<OperationResult> {
    warn!("{} is not implemented; skipping", operation);
    Ok(OperationResult::None)
}

macro_rules! operations {
    ($($variant:ident),* $(,)?) => {
        /// Every operation the runner understands
        #[derive(Debug)]
        pub enum Action {
            $($variant($variant),)*
        }

        impl Action {
            fn decode(name: &str, arguments: Document) -> RunnerResult<Self> {
                $(
                    if name == <$variant as Arguments>::NAME {
                        return Ok(Action::$variant(<$variant as Arguments>::decode(arguments)?));
                    }
                )*
                Err(RunnerError::UnrecognizedOperation(name.to_string()))
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $(Action::$variant(_) => <$variant as Arguments>::NAME,)*
                }
            }

            async fn execute(
                &self,
                target: &OperationTarget,
                ctx: &mut ExecutionContext<'_>,
            ) -> RunnerResult<OperationResult> {
                match self {
                    $(Action::$variant(operation) => operation.execute(target, ctx).await,)*
                }
            }
        }
    };
}

operations! {
    // collection
    InsertOne,
    InsertMany,
    UpdateOne,
    UpdateMany,
    ReplaceOne,
    DeleteOne,
    DeleteMany,
    Find,
    Aggregate,
    Distinct,
    CountDocuments,
    EstimatedDocumentCount,
    FindOneAndUpdate,
    FindOneAndReplace,
    FindOneAndDelete,
    BulkWrite,
    CreateIndex,
    DropIndex,
    ListIndexes,
    // database
    RunCommand,
    CreateCollection,
    DropCollection,
    ListCollections,
    ListCollectionNames,
    // client
    ListDatabases,
    ListDatabaseNames,
    // change streams
    CreateChangeStream,
    IterateUntilDocumentOrError,
    // session
    StartTransaction,
    CommitTransaction,
    AbortTransaction,
    EndSession,
    // test runner
    FailPoint,
    TargetedFailPoint,
    AssertSessionTransactionState,
    AssertSessionPinned,
    AssertSessionUnpinned,
    AssertSessionDirty,
    AssertSessionNotDirty,
    AssertSameLsidOnLastTwoCommands,
    AssertDifferentLsidOnLastTwoCommands,
    AssertCollectionExists,
    AssertCollectionNotExists,
    AssertIndexExists,
    AssertIndexNotExists,
    // placeholders
    WithTransaction,
    Download,
    DownloadByName,
    Upload,
    BucketDelete,
    BucketRename,
    BucketDrop,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{bson, doc};

    fn raw(value: Bson) -> RawOperation {
        bson::from_bson(value).unwrap()
    }

    #[test]
    fn test_decode_targets_and_expectations() {
        let op = Operation::decode(raw(bson!({
            "name": "insertOne",
            "object": "collection0",
            "arguments": { "document": { "_id": 1 } },
            "expectResult": { "insertedId": 1 },
        })))
        .unwrap();
        assert_eq!(op.target, OperationTarget::Entity("collection0".to_string()));
        assert_eq!(op.action.name(), "insertOne");
        assert!(matches!(op.expectation, Expectation::Result { expected: Some(_), save_as: None }));

        let op = Operation::decode(raw(bson!({
            "name": "failPoint",
            "object": "testRunner",
            "arguments": { "client": "client0", "failPoint": { "configureFailPoint": "failCommand" } },
        })))
        .unwrap();
        assert_eq!(op.target, OperationTarget::TestRunner);
        assert!(op.expectation.is_empty());
    }

    #[test]
    fn test_explicit_null_result_is_an_expectation() {
        let op = Operation::decode(raw(bson!({
            "name": "findOneAndDelete",
            "object": "collection0",
            "arguments": { "filter": { "_id": 9 } },
            "expectResult": null,
        })))
        .unwrap();
        assert!(matches!(op.expectation, Expectation::Result { expected: Some(Bson::Null), .. }));
        assert!(!op.expectation.is_empty());
    }

    #[test]
    fn test_unknown_operation_and_argument() {
        let err = Operation::decode(raw(bson!({ "name": "explode", "object": "collection0" }))).unwrap_err();
        assert!(matches!(err, RunnerError::UnrecognizedOperation(name) if name == "explode"));

        let err = Operation::decode(raw(bson!({
            "name": "deleteOne",
            "object": "collection0",
            "arguments": { "filter": {}, "colation": {} },
        })))
        .unwrap_err();
        assert!(matches!(
            err,
            RunnerError::UnrecognizedArgument { operation, argument }
                if operation == "deleteOne" && argument == "colation"
        ));
    }

    #[test]
    fn test_expect_error_excludes_result() {
        let err = Operation::decode(raw(bson!({
            "name": "insertOne",
            "object": "collection0",
            "arguments": { "document": {} },
            "expectError": { "isError": true },
            "expectResult": {},
        })))
        .unwrap_err();
        assert!(err.is_spec_load());
    }

    #[test]
    fn test_check_outcomes() {
        let mut entities = EntityMap::new();
        let op = Operation::decode(raw(bson!({
            "name": "insertOne",
            "object": "collection0",
            "arguments": { "document": { "_id": 1 } },
            "expectResult": { "insertedId": { "$$unsetOrMatches": 1 } },
            "saveResultAsEntity": "result",
        })))
        .unwrap();
        op.check(OperationResult::Value(bson!({ "insertedId": 1 })), &mut entities)
            .unwrap();
        assert_eq!(entities.bson("result").unwrap(), &bson!({ "insertedId": 1 }));

        let err = op
            .check(OperationResult::Error(unified_common::Error::network("reset")), &mut entities)
            .unwrap_err();
        assert!(matches!(err, RunnerError::Mismatch(_)));

        let expect_error = Operation::decode(raw(bson!({
            "name": "insertOne",
            "object": "collection0",
            "arguments": { "document": { "_id": 1 } },
            "expectError": { "isClientError": true },
        })))
        .unwrap();
        let err = expect_error
            .check(OperationResult::Value(bson!({ "insertedId": 1 })), &mut entities)
            .unwrap_err();
        assert!(matches!(err, RunnerError::Mismatch(_)));
        expect_error
            .check(
                OperationResult::Error(unified_common::Error::invalid_argument("bad")),
                &mut entities,
            )
            .unwrap();
    }

    #[test]
    fn test_ignored_error_saved_as_failure() {
        let mut entities = EntityMap::new();
        let op = Operation::decode(raw(bson!({
            "name": "insertOne",
            "object": "collection0",
            "arguments": { "document": { "_id": 1 } },
            "ignoreResultAndError": true,
            "saveResultAsEntity": "error0",
        })))
        .unwrap();
        let error = unified_common::Error::command(11000, "DuplicateKey", "dup");
        op.check(OperationResult::Error(error), &mut entities).unwrap();
        assert_eq!(
            entities.comparable_value("error0").unwrap(),
            Bson::Document(doc! { "errmsg": "dup", "code": 11000, "codeName": "DuplicateKey" })
        );
    }
}
