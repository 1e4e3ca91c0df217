//! Change stream creation and iteration

use async_trait::async_trait;
use bson::{Bson, Document};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use unified_common::options::ChangeStreamOptions;
use unified_common::{Client, Collection, Database};

use super::{Arguments, Execute, ExecutionContext, OperationResult, OperationTarget};
use crate::entity::Entity;
use crate::error::{RunnerError, RunnerResult};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Anything a change stream can be opened on
enum Watchable {
    Client(Arc<dyn Client>),
    Database(Arc<dyn Database>),
    Collection(Arc<dyn Collection>),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChangeStream {
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    pipeline: Vec<Document>,
    #[serde(default)]
    full_document: Option<String>,
    #[serde(default)]
    batch_size: Option<u32>,
}

impl Arguments for CreateChangeStream {
    const NAME: &'static str = "createChangeStream";
    const KNOWN_ARGUMENTS: &'static [&'static str] =
        &["session", "pipeline", "fullDocument", "batchSize"];
}

#[async_trait]
impl Execute for CreateChangeStream {
    async fn execute(
        &self,
        target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let id = target.entity_id(Self::NAME)?;
        let watchable = match ctx.entities.get(id)? {
            Entity::Client(client) => Watchable::Client(client.client.clone()),
            Entity::Database(database) => Watchable::Database(database.clone()),
            Entity::Collection(collection) => Watchable::Collection(collection.clone()),
            other => {
                return Err(RunnerError::EntityTypeMismatch {
                    id: id.to_string(),
                    expected: "client, database or collection",
                    actual: other.kind(),
                })
            }
        };
        let session = ctx.entities.resolve_session(self.session.as_deref())?;
        let session = session.as_deref();
        let pipeline = self.pipeline.clone();
        let options = ChangeStreamOptions {
            full_document: self.full_document.clone(),
            batch_size: self.batch_size,
        };

        let result = match watchable {
            Watchable::Client(client) => client.watch(pipeline, options, session).await,
            Watchable::Database(database) => database.watch(pipeline, options, session).await,
            Watchable::Collection(collection) => collection.watch(pipeline, options, session).await,
        };
        Ok(match result {
            Ok(stream) => OperationResult::ChangeStream(stream),
            Err(error) => OperationResult::Error(error),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct IterateUntilDocumentOrError {}

impl Arguments for IterateUntilDocumentOrError {
    const NAME: &'static str = "iterateUntilDocumentOrError";
    const KNOWN_ARGUMENTS: &'static [&'static str] = &[];
}

#[async_trait]
impl Execute for IterateUntilDocumentOrError {
    async fn execute(
        &self,
        target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let id = target.entity_id(Self::NAME)?;
        let wait = ctx.change_stream_wait;
        let deadline = Instant::now() + wait;
        let stream = ctx.entities.change_stream_mut(id)?;
        loop {
            match stream.try_next().await {
                Ok(Some(event)) => return Ok(OperationResult::Value(Bson::Document(event))),
                Ok(None) if Instant::now() >= deadline => {
                    return Err(RunnerError::AssertionFailed(format!(
                        "change stream '{}' produced no event within {:?}",
                        id, wait
                    )))
                }
                Ok(None) => tokio::time::sleep(POLL_INTERVAL).await,
                Err(error) => return Ok(OperationResult::Error(error)),
            }
        }
    }
}
