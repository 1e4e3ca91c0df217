//! Unified-format test files
//!
//! Files are JSON with extended-JSON values (`{"$numberLong": "1"}`,
//! `{"$oid": ...}`). They are converted to BSON once and then decoded with
//! serde, so every document a test carries keeps its exact BSON types.

use bson::{Bson, Document};
use serde::{Deserialize, Deserializer};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use tracing::debug;

use unified_common::options::{NamespaceOptions, SessionOptions, TransactionOptions};
use unified_common::{DeploymentInfo, ReadConcern, ReadPreference, TopologyType, WriteConcern};

use crate::entity::EntityMap;
use crate::error::{RunnerError, RunnerResult};
use crate::matcher;
use crate::operation::{Operation, RawOperation};
use crate::schema_version::SchemaVersion;

/// A parsed test file
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestFile {
    /// Where the file was loaded from
    #[serde(skip)]
    pub path: Option<PathBuf>,

    pub description: String,

    pub schema_version: SchemaVersion,

    #[serde(default)]
    pub run_on_requirements: Option<Vec<RunOnRequirement>>,

    #[serde(default)]
    pub create_entities: Vec<EntityDescription>,

    #[serde(default)]
    pub initial_data: Vec<CollectionData>,

    pub tests: Vec<TestCase>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TestCase {
    pub description: String,

    #[serde(default)]
    pub skip_reason: Option<String>,

    #[serde(default)]
    pub run_on_requirements: Option<Vec<RunOnRequirement>>,

    #[serde(rename = "operations")]
    raw_operations: Vec<RawOperation>,

    /// Decoded operations, in execution order
    #[serde(skip)]
    pub operations: Vec<Operation>,

    #[serde(default)]
    pub expect_events: Option<Vec<ExpectedEventsForClient>>,

    #[serde(default)]
    pub outcome: Option<Vec<CollectionData>>,
}

/// Contents of one collection, before (`initialData`) or after (`outcome`) a test
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CollectionData {
    pub collection_name: String,
    pub database_name: String,
    #[serde(default)]
    pub documents: Vec<Document>,
    #[serde(default)]
    pub create_options: Option<Document>,
}

impl TestFile {
    /// Parse a test file from its JSON text. Files outside `supported` are
    /// rejected before any operation is decoded.
    pub fn parse(json: &str, supported: &RangeInclusive<SchemaVersion>) -> RunnerResult<Self> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        let document = match Bson::try_from(value) {
            Ok(Bson::Document(document)) => document,
            Ok(other) => {
                return Err(RunnerError::InvalidTestFile(format!(
                    "expected a document at the top level, found {:?}",
                    other.element_type()
                )))
            }
            Err(e) => return Err(RunnerError::InvalidTestFile(e.to_string())),
        };

        // checked first so a file from a newer schema fails on its version
        // rather than on whatever it introduced
        let version = document
            .get_str("schemaVersion")
            .map_err(|_| RunnerError::InvalidTestFile("missing schemaVersion".to_string()))?
            .parse::<SchemaVersion>()?;
        if !supported.contains(&version) {
            return Err(RunnerError::UnsupportedSchemaVersion {
                version,
                min: *supported.start(),
                max: *supported.end(),
            });
        }

        let mut file: TestFile = bson::from_document(document)
            .map_err(|e| RunnerError::InvalidTestFile(e.to_string()))?;
        for test in &mut file.tests {
            test.operations = test
                .raw_operations
                .drain(..)
                .map(Operation::decode)
                .collect::<RunnerResult<_>>()?;
            for expected in test.expect_events.iter_mut().flatten() {
                expected.decode_events()?;
            }
        }
        Ok(file)
    }

    /// Parse a test file from disk
    pub fn from_file(path: &Path, supported: &RangeInclusive<SchemaVersion>) -> RunnerResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut file = Self::parse(&content, supported)?;
        file.path = Some(path.to_path_buf());
        Ok(file)
    }

    /// All `*.json` files below `dir`, sorted by path
    pub fn discover(dir: &Path) -> RunnerResult<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in walkdir::WalkDir::new(dir) {
            let entry = entry?;
            let is_json = entry
                .path()
                .extension()
                .map(|ext| ext == "json")
                .unwrap_or(false);
            if entry.file_type().is_file() && is_json {
                paths.push(entry.into_path());
            }
        }
        paths.sort();
        debug!("Found {} test file(s) under {}", paths.len(), dir.display());
        Ok(paths)
    }
}

/// Topology names accepted by `runOnRequirements`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Topology {
    #[serde(rename = "single")]
    Single,
    #[serde(rename = "replicaset")]
    ReplicaSet,
    #[serde(rename = "sharded")]
    Sharded,
    #[serde(rename = "sharded-replicaset")]
    ShardedReplicaSet,
    #[serde(rename = "load-balanced")]
    LoadBalanced,
}

impl Topology {
    fn matches(&self, info: &DeploymentInfo) -> bool {
        match self {
            Topology::Single => info.topology == TopologyType::Single,
            Topology::ReplicaSet => info.topology == TopologyType::ReplicaSet,
            Topology::Sharded => info.topology == TopologyType::Sharded,
            Topology::ShardedReplicaSet => {
                info.topology == TopologyType::Sharded && info.sharded_replica_set
            }
            Topology::LoadBalanced => info.topology == TopologyType::LoadBalanced,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerlessRequirement {
    Require,
    Forbid,
    Allow,
}

/// One alternative deployment a file or test can run against
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RunOnRequirement {
    #[serde(default)]
    pub min_server_version: Option<SchemaVersion>,
    #[serde(default)]
    pub max_server_version: Option<SchemaVersion>,
    #[serde(default)]
    pub topologies: Option<Vec<Topology>>,
    #[serde(default)]
    pub serverless: Option<ServerlessRequirement>,
    #[serde(default)]
    pub server_parameters: Option<Document>,
    #[serde(default)]
    pub auth: Option<bool>,
    #[serde(default)]
    pub csfle: Option<bool>,
}

impl RunOnRequirement {
    pub fn is_satisfied(&self, info: &DeploymentInfo) -> RunnerResult<bool> {
        let version = SchemaVersion::parse_server_version(&info.version)?;
        if self.min_server_version.map(|min| version < min).unwrap_or(false) {
            return Ok(false);
        }
        if self.max_server_version.map(|max| version > max).unwrap_or(false) {
            return Ok(false);
        }
        if let Some(topologies) = &self.topologies {
            if !topologies.iter().any(|t| t.matches(info)) {
                return Ok(false);
            }
        }
        let serverless_ok = match self.serverless {
            Some(ServerlessRequirement::Require) => info.serverless,
            Some(ServerlessRequirement::Forbid) => !info.serverless,
            Some(ServerlessRequirement::Allow) | None => true,
        };
        if !serverless_ok {
            return Ok(false);
        }
        if self.auth.map(|auth| auth != info.auth_enabled).unwrap_or(false) {
            return Ok(false);
        }
        // client-side encryption is never available
        if self.csfle == Some(true) {
            return Ok(false);
        }
        if let Some(expected) = &self.server_parameters {
            let actual = Bson::Document(info.server_parameters.clone());
            return matcher::matches_root(
                &Bson::Document(expected.clone()),
                Some(&actual),
                &EntityMap::new(),
            );
        }
        Ok(true)
    }
}

/// True when `requirements` is absent or empty, or any alternative holds
pub fn requirements_satisfied(
    requirements: Option<&[RunOnRequirement]>,
    info: &DeploymentInfo,
) -> RunnerResult<bool> {
    match requirements {
        None => Ok(true),
        Some([]) => Ok(true),
        Some(requirements) => {
            for requirement in requirements {
                if requirement.is_satisfied(info)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

/// An entry of `createEntities`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityDescription {
    Client(ClientDescription),
    Database(DatabaseDescription),
    Collection(CollectionDescription),
    Session(SessionDescription),
    Bucket(BucketDescription),
}

impl EntityDescription {
    pub fn id(&self) -> &str {
        match self {
            EntityDescription::Client(d) => &d.id,
            EntityDescription::Database(d) => &d.id,
            EntityDescription::Collection(d) => &d.id,
            EntityDescription::Session(d) => &d.id,
            EntityDescription::Bucket(d) => &d.id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClientDescription {
    pub id: String,
    #[serde(default)]
    pub uri_options: Option<Document>,
    #[serde(default)]
    pub use_multiple_mongoses: Option<bool>,
    #[serde(default)]
    pub observe_events: Option<Vec<String>>,
    #[serde(default)]
    pub ignore_command_monitoring_events: Option<Vec<String>>,
    #[serde(default)]
    pub observe_sensitive_commands: Option<bool>,
}

/// Read/write concern and read preference for a database or collection
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NamespaceOptionsDescription {
    #[serde(default)]
    pub read_concern: Option<ReadConcern>,
    #[serde(default)]
    pub write_concern: Option<WriteConcern>,
    #[serde(default)]
    pub read_preference: Option<ReadPreference>,
}

impl From<NamespaceOptionsDescription> for NamespaceOptions {
    fn from(description: NamespaceOptionsDescription) -> Self {
        NamespaceOptions {
            read_concern: description.read_concern,
            write_concern: description.write_concern,
            read_preference: description.read_preference,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DatabaseDescription {
    pub id: String,
    pub client: String,
    pub database_name: String,
    #[serde(default)]
    pub database_options: Option<NamespaceOptionsDescription>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CollectionDescription {
    pub id: String,
    pub database: String,
    pub collection_name: String,
    #[serde(default)]
    pub collection_options: Option<NamespaceOptionsDescription>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TransactionOptionsDescription {
    #[serde(default)]
    pub read_concern: Option<ReadConcern>,
    #[serde(default)]
    pub write_concern: Option<WriteConcern>,
    #[serde(default)]
    pub read_preference: Option<ReadPreference>,
    #[serde(default, rename = "maxCommitTimeMS")]
    pub max_commit_time_ms: Option<i64>,
}

impl From<TransactionOptionsDescription> for TransactionOptions {
    fn from(description: TransactionOptionsDescription) -> Self {
        TransactionOptions {
            read_concern: description.read_concern,
            write_concern: description.write_concern,
            read_preference: description.read_preference,
            max_commit_time_ms: description.max_commit_time_ms,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SessionOptionsDescription {
    #[serde(default)]
    pub causal_consistency: Option<bool>,
    #[serde(default)]
    pub default_transaction_options: Option<TransactionOptionsDescription>,
}

impl From<SessionOptionsDescription> for SessionOptions {
    fn from(description: SessionOptionsDescription) -> Self {
        SessionOptions {
            causal_consistency: description.causal_consistency,
            default_transaction_options: description.default_transaction_options.map(Into::into),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SessionDescription {
    pub id: String,
    pub client: String,
    #[serde(default)]
    pub session_options: Option<SessionOptionsDescription>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BucketDescription {
    pub id: String,
    pub database: String,
    #[serde(default)]
    pub bucket_options: Option<Document>,
}

/// Events one client is expected to have published
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExpectedEventsForClient {
    pub client: String,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(rename = "events")]
    raw_events: Vec<Document>,
    #[serde(skip)]
    pub events: Vec<ExpectedEvent>,
    #[serde(default)]
    pub ignore_extra_events: Option<bool>,
}

impl ExpectedEventsForClient {
    fn decode_events(&mut self) -> RunnerResult<()> {
        match self.event_type.as_deref() {
            None | Some("command") => {}
            Some(other) => return Err(RunnerError::UnsupportedEventType(other.to_string())),
        }
        self.events = self
            .raw_events
            .drain(..)
            .map(ExpectedEvent::from_document)
            .collect::<RunnerResult<_>>()?;
        Ok(())
    }
}

/// An expected command monitoring event; unset fields are not checked
#[derive(Debug, Clone, PartialEq)]
pub enum ExpectedEvent {
    CommandStarted {
        command_name: Option<String>,
        database_name: Option<String>,
        command: Option<Document>,
    },
    CommandSucceeded {
        command_name: Option<String>,
        reply: Option<Document>,
    },
    CommandFailed {
        command_name: Option<String>,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct StartedFields {
    #[serde(default)]
    command_name: Option<String>,
    #[serde(default)]
    database_name: Option<String>,
    #[serde(default)]
    command: Option<Document>,
    #[serde(default, rename = "hasServiceId")]
    _has_service_id: Option<bool>,
    #[serde(default, rename = "hasServerConnectionId")]
    _has_server_connection_id: Option<bool>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SucceededFields {
    #[serde(default)]
    command_name: Option<String>,
    #[serde(default)]
    reply: Option<Document>,
    #[serde(default, rename = "hasServiceId")]
    _has_service_id: Option<bool>,
    #[serde(default, rename = "hasServerConnectionId")]
    _has_server_connection_id: Option<bool>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct FailedFields {
    #[serde(default)]
    command_name: Option<String>,
    #[serde(default, rename = "hasServiceId")]
    _has_service_id: Option<bool>,
    #[serde(default, rename = "hasServerConnectionId")]
    _has_server_connection_id: Option<bool>,
}

fn decode_fields<T: for<'de> Deserialize<'de>>(kind: &str, value: &Bson) -> RunnerResult<T> {
    let document = value
        .as_document()
        .ok_or_else(|| RunnerError::InvalidTestFile(format!("{} must be a document", kind)))?;
    bson::from_document(document.clone())
        .map_err(|e| RunnerError::InvalidTestFile(format!("{}: {}", kind, e)))
}

impl ExpectedEvent {
    pub fn from_document(document: Document) -> RunnerResult<Self> {
        let mut entries = document.iter();
        let (kind, value) = match (entries.next(), entries.next()) {
            (Some(entry), None) => entry,
            _ => {
                return Err(RunnerError::InvalidTestFile(
                    "an expected event must have exactly one key".to_string(),
                ))
            }
        };
        match kind.as_str() {
            "commandStartedEvent" => {
                let fields: StartedFields = decode_fields(kind, value)?;
                Ok(ExpectedEvent::CommandStarted {
                    command_name: fields.command_name,
                    database_name: fields.database_name,
                    command: fields.command,
                })
            }
            "commandSucceededEvent" => {
                let fields: SucceededFields = decode_fields(kind, value)?;
                Ok(ExpectedEvent::CommandSucceeded {
                    command_name: fields.command_name,
                    reply: fields.reply,
                })
            }
            "commandFailedEvent" => {
                let fields: FailedFields = decode_fields(kind, value)?;
                Ok(ExpectedEvent::CommandFailed {
                    command_name: fields.command_name,
                })
            }
            other => Err(RunnerError::UnsupportedEventType(other.to_string())),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ExpectedEvent::CommandStarted { .. } => "commandStartedEvent",
            ExpectedEvent::CommandSucceeded { .. } => "commandSucceededEvent",
            ExpectedEvent::CommandFailed { .. } => "commandFailedEvent",
        }
    }
}

/// Deserializes a field that may be explicitly `null`, keeping the null
pub(crate) fn present_bson<'de, D>(deserializer: D) -> Result<Option<Bson>, D::Error>
where
    D: Deserializer<'de>,
{
    Bson::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use unified_common::ServerAddress;

    const SUPPORTED: RangeInclusive<SchemaVersion> =
        SchemaVersion::new(1, 0, 0)..=SchemaVersion::new(1, 13, 0);

    fn parse(json: &str) -> RunnerResult<TestFile> {
        TestFile::parse(json, &SUPPORTED)
    }

    fn info(topology: TopologyType, version: &str) -> DeploymentInfo {
        DeploymentInfo {
            version: version.to_string(),
            topology,
            sharded_replica_set: true,
            serverless: false,
            auth_enabled: false,
            hosts: vec![ServerAddress::new("localhost", 27017)],
            server_parameters: doc! { "enableTestCommands": true },
        }
    }

    const MINIMAL: &str = r#"{
        "description": "minimal",
        "schemaVersion": "1.0",
        "createEntities": [
            { "client": { "id": "client0", "observeEvents": ["commandStartedEvent"] } },
            { "database": { "id": "database0", "client": "client0", "databaseName": "db" } },
            { "collection": { "id": "collection0", "database": "database0", "collectionName": "coll" } }
        ],
        "initialData": [
            { "collectionName": "coll", "databaseName": "db", "documents": [ { "_id": 1, "n": { "$numberLong": "5" } } ] }
        ],
        "tests": [
            {
                "description": "insert",
                "operations": [
                    {
                        "name": "insertOne",
                        "object": "collection0",
                        "arguments": { "document": { "_id": 2 } },
                        "expectResult": { "$$unsetOrMatches": { "insertedId": { "$$unsetOrMatches": 2 } } }
                    }
                ],
                "expectEvents": [
                    { "client": "client0", "events": [ { "commandStartedEvent": { "commandName": "insert", "databaseName": "db" } } ] }
                ]
            }
        ]
    }"#;

    #[test]
    fn test_parse_minimal_file() {
        let file = parse(MINIMAL).unwrap();
        assert_eq!(file.schema_version, SchemaVersion::new(1, 0, 0));
        assert_eq!(file.create_entities.len(), 3);
        assert_eq!(file.create_entities[1].id(), "database0");
        // extended JSON keeps its BSON type
        assert_eq!(
            file.initial_data[0].documents[0].get("n"),
            Some(&Bson::Int64(5))
        );

        let test = &file.tests[0];
        assert_eq!(test.operations.len(), 1);
        assert_eq!(test.operations[0].name, "insertOne");
        let events = &test.expect_events.as_ref().unwrap()[0].events;
        assert_eq!(events[0].type_name(), "commandStartedEvent");
    }

    #[test]
    fn test_unknown_operation_fails_the_load() {
        let json = MINIMAL.replace("\"insertOne\"", "\"insertOneAndDance\"");
        assert!(matches!(
            parse(&json),
            Err(RunnerError::UnrecognizedOperation(name)) if name == "insertOneAndDance"
        ));
    }

    #[test]
    fn test_unknown_argument_fails_the_load() {
        let json = MINIMAL.replace("\"document\"", "\"documnet\"");
        match parse(&json) {
            Err(RunnerError::UnrecognizedArgument { operation, argument }) => {
                assert_eq!(operation, "insertOne");
                assert_eq!(argument, "documnet");
            }
            other => panic!("unexpected: {:?}", other.map(|f| f.description)),
        }
    }

    #[test]
    fn test_invalid_schema_version() {
        let json = MINIMAL.replace("\"1.0\"", "\"1.0.0.1\"");
        assert!(matches!(
            parse(&json),
            Err(RunnerError::InvalidSchemaVersion(_))
        ));
    }

    #[test]
    fn test_newer_schema_rejected_before_operations_decode() {
        let json = r#"{
            "description": "future",
            "schemaVersion": "1.99",
            "tests": [
                { "description": "t", "operations": [ { "name": "newOp2030", "object": "testRunner" } ] }
            ]
        }"#;
        match parse(json) {
            Err(RunnerError::UnsupportedSchemaVersion { version, min, max }) => {
                assert_eq!(version, SchemaVersion::new(1, 99, 0));
                assert_eq!(min, SchemaVersion::new(1, 0, 0));
                assert_eq!(max, SchemaVersion::new(1, 13, 0));
            }
            other => panic!("unexpected: {:?}", other.map(|f| f.description)),
        }
        // the same file within range fails on the operation instead
        let current = json.replace("1.99", "1.13");
        assert!(matches!(
            parse(&current),
            Err(RunnerError::UnrecognizedOperation(name)) if name == "newOp2030"
        ));
    }

    #[test]
    fn test_unsupported_event_type() {
        let json = MINIMAL.replace("commandStartedEvent\": { \"commandName", "poolClearedEvent\": { \"commandName");
        assert!(matches!(
            parse(&json),
            Err(RunnerError::UnsupportedEventType(kind)) if kind == "poolClearedEvent"
        ));
    }

    #[test]
    fn test_unknown_entity_option_rejected() {
        let json = MINIMAL.replace("\"observeEvents\"", "\"observeEverything\"");
        assert!(matches!(parse(&json), Err(RunnerError::InvalidTestFile(_))));
    }

    #[test]
    fn test_requirements() {
        let replica_set = info(TopologyType::ReplicaSet, "7.0.2");
        let requirement = RunOnRequirement {
            min_server_version: Some(SchemaVersion::new(4, 0, 0)),
            topologies: Some(vec![Topology::ReplicaSet, Topology::Sharded]),
            ..Default::default()
        };
        assert!(requirement.is_satisfied(&replica_set).unwrap());
        assert!(!requirement.is_satisfied(&info(TopologyType::Single, "7.0.2")).unwrap());

        let too_new = RunOnRequirement {
            max_server_version: Some(SchemaVersion::new(4, 4, 99)),
            ..Default::default()
        };
        assert!(!too_new.is_satisfied(&replica_set).unwrap());

        let sharded_rs = RunOnRequirement {
            topologies: Some(vec![Topology::ShardedReplicaSet]),
            ..Default::default()
        };
        assert!(sharded_rs.is_satisfied(&info(TopologyType::Sharded, "7.0.0")).unwrap());

        let parameters = RunOnRequirement {
            server_parameters: Some(doc! { "enableTestCommands": true }),
            ..Default::default()
        };
        assert!(parameters.is_satisfied(&replica_set).unwrap());
    }

    #[test]
    fn test_any_requirement_suffices() {
        let replica_set = info(TopologyType::ReplicaSet, "7.0.0");
        let single_only = RunOnRequirement {
            topologies: Some(vec![Topology::Single]),
            ..Default::default()
        };
        assert!(!requirements_satisfied(Some(&[single_only.clone()][..]), &replica_set).unwrap());
        assert!(requirements_satisfied(
            Some(&[single_only, RunOnRequirement::default()][..]),
            &replica_set
        )
        .unwrap());
        assert!(requirements_satisfied(None, &replica_set).unwrap());
    }

    #[test]
    fn test_discover_finds_json_files() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("crud")).unwrap();
        std::fs::write(dir.path().join("crud").join("b.json"), "{}").unwrap();
        std::fs::write(dir.path().join("a.json"), "{}").unwrap();
        std::fs::write(dir.path().join("notes.md"), "").unwrap();

        let paths = TestFile::discover(dir.path()).unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths[0].ends_with("a.json"));
    }
}
