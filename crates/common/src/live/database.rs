//! Databases wrapping `mongodb::Database`

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use std::sync::Arc;
use tracing::warn;

use super::collection::{LiveChangeStream, LiveCollection};
use super::convert;
use super::session::{ended, LiveSession};
use crate::driver::{ChangeStream, Collection, Database, Session};
use crate::options::{
    ChangeStreamOptions, CollectionOptions, CreateCollectionOptions, DatabaseOptions,
    DropCollectionOptions, RunCommandOptions,
};
use crate::{Error, Result};

pub struct LiveDatabase {
    inner: mongodb::Database,
    /// Handle without the namespace concerns, for raw commands
    plain: mongodb::Database,
    options: DatabaseOptions,
}

impl LiveDatabase {
    pub(crate) fn new(client: &mongodb::Client, name: &str, options: DatabaseOptions) -> Self {
        let inner = match convert::database_options(&options) {
            Ok(driver_options) => client.database_with_options(name, driver_options),
            Err(e) => {
                warn!("Ignoring invalid options for database '{}': {}", name, e);
                client.database(name)
            }
        };
        Self {
            inner,
            plain: client.database(name),
            options,
        }
    }
}

/// Every document of the cursor a command reply opens, following `getMore`
/// until the server closes it
pub(crate) async fn drain_command_cursor(
    database: &mongodb::Database,
    command: Document,
    session: Option<&dyn Session>,
) -> Result<Vec<Document>> {
    let reply = with_session!(
        session,
        s => database.run_command_with_session(command, None, s),
        database.run_command(command, None)
    )?;
    let malformed = || Error::internal(format!("malformed cursor reply: {}", reply));
    let cursor = reply.get_document("cursor").map_err(|_| malformed())?;
    let mut documents = batch(cursor, "firstBatch");
    let mut id = cursor.get_i64("id").unwrap_or(0);
    let collection = cursor
        .get_str("ns")
        .ok()
        .and_then(|ns| ns.split_once('.'))
        .map(|(_, coll)| coll.to_string())
        .unwrap_or_default();

    while id != 0 {
        let get_more = doc! { "getMore": id, "collection": collection.clone() };
        let reply = with_session!(
            session,
            s => database.run_command_with_session(get_more, None, s),
            database.run_command(get_more, None)
        )?;
        let cursor = reply
            .get_document("cursor")
            .map_err(|_| Error::internal(format!("malformed getMore reply: {}", reply)))?;
        documents.extend(batch(cursor, "nextBatch"));
        id = cursor.get_i64("id").unwrap_or(0);
    }
    Ok(documents)
}

fn batch(cursor: &Document, key: &str) -> Vec<Document> {
    cursor
        .get_array(key)
        .map(|batch| batch.iter().filter_map(Bson::as_document).cloned().collect())
        .unwrap_or_default()
}

#[async_trait]
impl Database for LiveDatabase {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn collection(&self, name: &str, options: CollectionOptions) -> Arc<dyn Collection> {
        let options = CollectionOptions {
            read_concern: options.read_concern.or_else(|| self.options.read_concern.clone()),
            write_concern: options.write_concern.or_else(|| self.options.write_concern.clone()),
            read_preference: options
                .read_preference
                .or_else(|| self.options.read_preference.clone()),
        };
        Arc::new(LiveCollection::new(&self.inner, name, options))
    }

    async fn run_command(
        &self,
        command: Document,
        options: RunCommandOptions,
        session: Option<&dyn Session>,
    ) -> Result<Document> {
        let criteria = match (&options.target, &options.read_preference) {
            (Some(target), _) => Some(convert::target(target)),
            (None, Some(read_preference)) => Some(convert::selection_criteria(read_preference)?),
            (None, None) => None,
        };
        with_session!(
            session,
            s => self.plain.run_command_with_session(command, criteria, s),
            self.plain.run_command(command, criteria)
        )
    }

    async fn create_collection(
        &self,
        name: &str,
        options: CreateCollectionOptions,
        session: Option<&dyn Session>,
    ) -> Result<()> {
        let mut driver_options = mongodb::options::CreateCollectionOptions::default();
        driver_options.write_concern = options
            .write_concern
            .as_ref()
            .map(convert::write_concern)
            .transpose()?;
        with_session!(
            session,
            s => self.inner.create_collection_with_session(name, driver_options, s),
            self.inner.create_collection(name, driver_options)
        )
    }

    async fn drop_collection(
        &self,
        name: &str,
        options: DropCollectionOptions,
        session: Option<&dyn Session>,
    ) -> Result<()> {
        let mut driver_options = mongodb::options::DropCollectionOptions::default();
        driver_options.write_concern = options
            .write_concern
            .as_ref()
            .map(convert::write_concern)
            .transpose()?;
        let collection = self.inner.collection::<Document>(name);
        with_session!(
            session,
            s => collection.drop_with_session(driver_options, s),
            collection.drop(driver_options)
        )
    }

    async fn list_collections(
        &self,
        filter: Option<Document>,
        session: Option<&dyn Session>,
    ) -> Result<Vec<Document>> {
        let mut command = doc! { "listCollections": 1, "cursor": {} };
        if let Some(filter) = filter {
            command.insert("filter", filter);
        }
        drain_command_cursor(&self.plain, command, session).await
    }

    async fn watch(
        &self,
        pipeline: Vec<Document>,
        options: ChangeStreamOptions,
        session: Option<&dyn Session>,
    ) -> Result<Box<dyn ChangeStream>> {
        let options = LiveChangeStream::driver_options(&options)?;
        let stream = match session {
            Some(session) => {
                let live = LiveSession::from_dyn(session)?;
                let mut slot = live.slot.lock().await;
                let driver_session = slot.as_mut().ok_or_else(ended)?;
                let stream = live.record(
                    self.inner
                        .watch_with_session(pipeline, options, driver_session)
                        .await,
                )?;
                LiveChangeStream::with_session(stream.with_type::<Document>(), live.slot.clone())
            }
            None => {
                let stream = self.inner.watch(pipeline, options).await.map_err(convert::error)?;
                LiveChangeStream::new(stream.with_type::<Document>())
            }
        };
        Ok(Box::new(stream))
    }
}
