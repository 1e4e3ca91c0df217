//! Entity map: the named handles a test operates on
//!
//! Entities are created from `createEntities` when a test starts and live
//! until it ends. Every lookup is checked: an unknown id is
//! [`RunnerError::EntityNotFound`], an id of the wrong kind is
//! [`RunnerError::EntityTypeMismatch`].

use bson::{Bson, Document};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use unified_common::options::{ClientOptions, NamespaceOptions, SessionOptions};
use unified_common::{
    ChangeStream, Client, Collection, Database, Deployment, DeploymentInfo, ReadConcern,
    ReadPreference, TopologyType, WriteConcern,
};

use crate::error::{RunnerError, RunnerResult};
use crate::events::EventRecorder;
use crate::test_file::{ClientDescription, EntityDescription};

/// A client entity and the recorder observing its commands
#[derive(Clone)]
pub struct ClientEntity {
    pub client: Arc<dyn Client>,
    pub events: Arc<EventRecorder>,
}

/// A session entity; the lsid is kept so it can still be compared after
/// the session has ended.
#[derive(Clone)]
pub struct SessionEntity {
    pub session: Arc<dyn unified_common::Session>,
    pub client: String,
    pub lsid: Document,
}

/// A grid file bucket; bucket operations are placeholders
#[derive(Debug, Clone)]
pub struct BucketEntity {
    pub database: String,
}

pub enum Entity {
    Client(ClientEntity),
    Database(Arc<dyn Database>),
    Collection(Arc<dyn Collection>),
    Session(SessionEntity),
    ChangeStream(Box<dyn ChangeStream>),
    Bucket(BucketEntity),
    Bson(Bson),
    /// A failure saved with `saveResultAsEntity` under `ignoreResultAndError`
    Failure(unified_common::Error),
}

impl Entity {
    pub fn kind(&self) -> &'static str {
        match self {
            Entity::Client(_) => "client",
            Entity::Database(_) => "database",
            Entity::Collection(_) => "collection",
            Entity::Session(_) => "session",
            Entity::ChangeStream(_) => "change stream",
            Entity::Bucket(_) => "bucket",
            Entity::Bson(_) => "bson value",
            Entity::Failure(_) => "failure",
        }
    }
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Entity::Bson(value) => write!(f, "Bson({})", value),
            Entity::Failure(error) => write!(f, "Failure({})", error),
            other => write!(f, "{}", other.kind()),
        }
    }
}

#[derive(Debug, Default)]
pub struct EntityMap {
    entities: HashMap<String, Entity>,
}

impl EntityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    /// Register an entity; ids are unique for the life of the map
    pub fn insert(&mut self, id: impl Into<String>, entity: Entity) -> RunnerResult<()> {
        let id = id.into();
        if self.entities.contains_key(&id) {
            return Err(RunnerError::EntityAlreadyExists(id));
        }
        debug!("Registered {} entity '{}'", entity.kind(), id);
        self.entities.insert(id, entity);
        Ok(())
    }

    pub fn get(&self, id: &str) -> RunnerResult<&Entity> {
        self.entities
            .get(id)
            .ok_or_else(|| RunnerError::EntityNotFound(id.to_string()))
    }

    fn get_mut(&mut self, id: &str) -> RunnerResult<&mut Entity> {
        self.entities
            .get_mut(id)
            .ok_or_else(|| RunnerError::EntityNotFound(id.to_string()))
    }

    pub fn client(&self, id: &str) -> RunnerResult<&ClientEntity> {
        match self.get(id)? {
            Entity::Client(client) => Ok(client),
            other => Err(mismatch(id, "client", other)),
        }
    }

    pub fn database(&self, id: &str) -> RunnerResult<Arc<dyn Database>> {
        match self.get(id)? {
            Entity::Database(database) => Ok(database.clone()),
            other => Err(mismatch(id, "database", other)),
        }
    }

    pub fn collection(&self, id: &str) -> RunnerResult<Arc<dyn Collection>> {
        match self.get(id)? {
            Entity::Collection(collection) => Ok(collection.clone()),
            other => Err(mismatch(id, "collection", other)),
        }
    }

    pub fn session(&self, id: &str) -> RunnerResult<&SessionEntity> {
        match self.get(id)? {
            Entity::Session(session) => Ok(session),
            other => Err(mismatch(id, "session", other)),
        }
    }

    pub fn change_stream_mut(&mut self, id: &str) -> RunnerResult<&mut Box<dyn ChangeStream>> {
        match self.get_mut(id)? {
            Entity::ChangeStream(stream) => Ok(stream),
            other => {
                let actual = other.kind();
                Err(RunnerError::EntityTypeMismatch {
                    id: id.to_string(),
                    expected: "change stream",
                    actual,
                })
            }
        }
    }

    pub fn bson(&self, id: &str) -> RunnerResult<&Bson> {
        match self.get(id)? {
            Entity::Bson(value) => Ok(value),
            other => Err(mismatch(id, "bson value", other)),
        }
    }

    pub fn bucket(&self, id: &str) -> RunnerResult<&BucketEntity> {
        match self.get(id)? {
            Entity::Bucket(bucket) => Ok(bucket),
            other => Err(mismatch(id, "bucket", other)),
        }
    }

    /// `None` means the operation runs without an explicit session
    pub fn resolve_session(
        &self,
        id: Option<&str>,
    ) -> RunnerResult<Option<Arc<dyn unified_common::Session>>> {
        match id {
            None => Ok(None),
            Some(id) => Ok(Some(self.session(id)?.session.clone())),
        }
    }

    /// The value an entity stands for inside `$$matchesEntity`
    pub fn comparable_value(&self, id: &str) -> RunnerResult<Bson> {
        match self.get(id)? {
            Entity::Bson(value) => Ok(value.clone()),
            Entity::Session(session) => Ok(Bson::Document(session.lsid.clone())),
            Entity::Failure(error) => Ok(Bson::Document(error.to_document())),
            other => Err(mismatch(id, "bson value", other)),
        }
    }

    pub fn clients(&self) -> impl Iterator<Item = (&str, &ClientEntity)> {
        self.entities.iter().filter_map(|(id, entity)| match entity {
            Entity::Client(client) => Some((id.as_str(), client)),
            _ => None,
        })
    }

    pub fn collections(&self) -> impl Iterator<Item = (&str, &Arc<dyn Collection>)> {
        self.entities.iter().filter_map(|(id, entity)| match entity {
            Entity::Collection(collection) => Some((id.as_str(), collection)),
            _ => None,
        })
    }

    /// Materialise `descriptions` in order; later entries may refer to
    /// earlier ones.
    pub async fn create_entities(
        &mut self,
        descriptions: &[EntityDescription],
        deployment: &dyn Deployment,
        info: &DeploymentInfo,
    ) -> RunnerResult<()> {
        for description in descriptions {
            if self.contains(description.id()) {
                return Err(RunnerError::EntityAlreadyExists(description.id().to_string()));
            }
            let entity = match description {
                EntityDescription::Client(client) => {
                    Entity::Client(connect_client(client, deployment, info).await?)
                }
                EntityDescription::Database(database) => {
                    let client = &self.client(&database.client)?.client;
                    let options: NamespaceOptions =
                        database.database_options.clone().unwrap_or_default().into();
                    Entity::Database(client.database(&database.database_name, options))
                }
                EntityDescription::Collection(collection) => {
                    let database = self.database(&collection.database)?;
                    let options: NamespaceOptions =
                        collection.collection_options.clone().unwrap_or_default().into();
                    Entity::Collection(database.collection(&collection.collection_name, options))
                }
                EntityDescription::Session(session) => {
                    let client = &self.client(&session.client)?.client;
                    let options: SessionOptions =
                        session.session_options.clone().unwrap_or_default().into();
                    let handle = client.start_session(options).await?;
                    Entity::Session(SessionEntity {
                        lsid: handle.id(),
                        session: handle,
                        client: session.client.clone(),
                    })
                }
                EntityDescription::Bucket(bucket) => {
                    self.database(&bucket.database)?;
                    Entity::Bucket(BucketEntity {
                        database: bucket.database.clone(),
                    })
                }
            };
            self.insert(description.id(), entity)?;
        }
        Ok(())
    }

    /// End every session and shut every client down, emptying the map
    pub async fn close(&mut self) {
        let entities: Vec<(String, Entity)> = self.entities.drain().collect();
        let mut clients = Vec::new();
        for (id, entity) in entities {
            match entity {
                Entity::Session(session) => {
                    debug!("Ending session '{}'", id);
                    session.session.end().await;
                }
                Entity::Client(client) => clients.push((id, client)),
                _ => {}
            }
        }
        for (id, client) in clients {
            debug!("Closing client '{}'", id);
            client.events.stop();
            client.client.shutdown().await;
        }
    }
}

fn mismatch(id: &str, expected: &'static str, actual: &Entity) -> RunnerError {
    RunnerError::EntityTypeMismatch {
        id: id.to_string(),
        expected,
        actual: actual.kind(),
    }
}

/// Client options from a description's `uriOptions`; options the runner does
/// not interpret are passed through untouched.
fn client_options(
    description: &ClientDescription,
    info: &DeploymentInfo,
) -> RunnerResult<ClientOptions> {
    let mut options = ClientOptions::default();
    let multiple = description.use_multiple_mongoses.unwrap_or(false);
    if info.topology == TopologyType::Sharded && !multiple {
        options.hosts = info.hosts.iter().take(1).cloned().collect();
    }

    let invalid = |key: &str| {
        RunnerError::InvalidTestFile(format!(
            "client '{}': invalid value for uriOptions.{}",
            description.id, key
        ))
    };
    for (key, value) in description.uri_options.iter().flatten() {
        match key.as_str() {
            "appname" => {
                options.app_name = Some(value.as_str().ok_or_else(|| invalid(key))?.to_string());
            }
            "retryWrites" => {
                options.retry_writes = Some(value.as_bool().ok_or_else(|| invalid(key))?);
            }
            "readConcernLevel" => {
                let level = value.as_str().ok_or_else(|| invalid(key))?;
                options.read_concern = Some(ReadConcern {
                    level: level.to_string(),
                });
            }
            "w" => {
                let write_concern = options.write_concern.get_or_insert_with(WriteConcern::default);
                write_concern.w = Some(value.clone());
            }
            "journal" => {
                let write_concern = options.write_concern.get_or_insert_with(WriteConcern::default);
                write_concern.journal = Some(value.as_bool().ok_or_else(|| invalid(key))?);
            }
            "readPreference" => {
                let mode = value.as_str().ok_or_else(|| invalid(key))?;
                options.read_preference = Some(ReadPreference {
                    mode: mode.to_string(),
                });
            }
            _ => {
                options.uri_options.insert(key.clone(), value.clone());
            }
        }
    }
    Ok(options)
}

async fn connect_client(
    description: &ClientDescription,
    deployment: &dyn Deployment,
    info: &DeploymentInfo,
) -> RunnerResult<ClientEntity> {
    let events = Arc::new(EventRecorder::new(
        description.observe_events.as_deref().unwrap_or_default(),
        description
            .ignore_command_monitoring_events
            .as_deref()
            .unwrap_or_default(),
        description.observe_sensitive_commands.unwrap_or(false),
    )?);
    let mut options = client_options(description, info)?;
    options.command_event_handler = Some(events.clone());
    let client = deployment.connect(options).await?;
    debug!("Connected client '{}' to {:?}", description.id, client.hosts());
    Ok(ClientEntity { client, events })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use unified_common::{MemoryDeployment, MemoryDeploymentConfig};

    use crate::test_file::{CollectionDescription, DatabaseDescription, SessionDescription};

    fn descriptions() -> Vec<EntityDescription> {
        vec![
            EntityDescription::Client(ClientDescription {
                id: "client0".to_string(),
                uri_options: Some(doc! { "appname": "app", "w": "majority", "heartbeatFrequencyMS": 500 }),
                use_multiple_mongoses: None,
                observe_events: Some(vec!["commandStartedEvent".to_string()]),
                ignore_command_monitoring_events: None,
                observe_sensitive_commands: None,
            }),
            EntityDescription::Database(DatabaseDescription {
                id: "database0".to_string(),
                client: "client0".to_string(),
                database_name: "db".to_string(),
                database_options: None,
            }),
            EntityDescription::Collection(CollectionDescription {
                id: "collection0".to_string(),
                database: "database0".to_string(),
                collection_name: "coll".to_string(),
                collection_options: None,
            }),
            EntityDescription::Session(SessionDescription {
                id: "session0".to_string(),
                client: "client0".to_string(),
                session_options: None,
            }),
        ]
    }

    async fn create(config: MemoryDeploymentConfig) -> EntityMap {
        let deployment = MemoryDeployment::new(config);
        let mut entities = EntityMap::new();
        entities
            .create_entities(&descriptions(), &deployment, &deployment.info())
            .await
            .unwrap();
        entities
    }

    #[tokio::test]
    async fn test_create_entities_and_typed_access() {
        let mut entities = create(MemoryDeploymentConfig::default()).await;
        assert_eq!(entities.len(), 4);
        assert_eq!(entities.collection("collection0").unwrap().namespace().coll, "coll");
        assert_eq!(entities.database("database0").unwrap().name(), "db");
        assert_eq!(entities.clients().count(), 1);
        assert_eq!(entities.collections().count(), 1);

        match entities.database("collection0") {
            Err(RunnerError::EntityTypeMismatch { expected, actual, .. }) => {
                assert_eq!((expected, actual), ("database", "collection"));
            }
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
        assert!(matches!(entities.session("missing"), Err(RunnerError::EntityNotFound(_))));
        assert!(entities.change_stream_mut("session0").is_err());

        entities.close().await;
        assert!(entities.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_ids_rejected() {
        let mut entities = EntityMap::new();
        entities.insert("x", Entity::Bson(Bson::Int32(1))).unwrap();
        assert!(matches!(
            entities.insert("x", Entity::Bson(Bson::Int32(2))),
            Err(RunnerError::EntityAlreadyExists(_))
        ));
        assert_eq!(entities.bson("x").unwrap(), &Bson::Int32(1));
    }

    #[tokio::test]
    async fn test_resolve_session() {
        let entities = create(MemoryDeploymentConfig::default()).await;
        assert!(entities.resolve_session(None).unwrap().is_none());
        let session = entities.resolve_session(Some("session0")).unwrap().unwrap();
        assert_eq!(session.id(), entities.session("session0").unwrap().lsid);
        assert!(entities.resolve_session(Some("client0")).is_err());
        assert_eq!(
            entities.comparable_value("session0").unwrap(),
            Bson::Document(session.id())
        );
    }

    #[tokio::test]
    async fn test_sharded_client_uses_single_mongos_by_default() {
        let entities = create(MemoryDeploymentConfig {
            topology: TopologyType::Sharded,
            mongoses: 3,
            ..Default::default()
        })
        .await;
        assert_eq!(entities.client("client0").unwrap().client.hosts().len(), 1);
    }

    #[test]
    fn test_uri_options_mapping() {
        let description = match &descriptions()[0] {
            EntityDescription::Client(client) => client.clone(),
            _ => unreachable!(),
        };
        let info = MemoryDeployment::default().info();
        let options = client_options(&description, &info).unwrap();
        assert_eq!(options.app_name.as_deref(), Some("app"));
        assert_eq!(options.write_concern, Some(WriteConcern::majority()));
        assert_eq!(options.uri_options, doc! { "heartbeatFrequencyMS": 500 });
    }
}
