//! Operations addressed to the runner itself: fail points and assertions
//! about ambient state

use async_trait::async_trait;
use bson::{Bson, Document};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use unified_common::options::RunCommandOptions;
use unified_common::{ServerAddress, Session, TransactionState};

use super::{
    Arguments, EnabledFailPoint, Execute, ExecutionContext, OperationResult, OperationTarget,
};
use crate::error::{RunnerError, RunnerResult};

fn assert_that(condition: bool, message: impl FnOnce() -> String) -> RunnerResult<OperationResult> {
    if condition {
        Ok(OperationResult::None)
    } else {
        Err(RunnerError::AssertionFailed(message()))
    }
}

/// Enable `fail_point` on `server` and remember it for teardown. Sent through
/// the internal client so no entity observes it.
async fn enable_fail_point(
    ctx: &mut ExecutionContext<'_>,
    fail_point: &Document,
    server: ServerAddress,
) -> RunnerResult<OperationResult> {
    let client = ctx.internal_client.clone();
    let name = fail_point
        .get_str("configureFailPoint")
        .map_err(|_| {
            RunnerError::InvalidTestFile("failPoint must name the fail point in configureFailPoint".to_string())
        })?
        .to_string();
    let options = RunCommandOptions {
        read_preference: None,
        target: Some(server.clone()),
    };
    client
        .database("admin", Default::default())
        .run_command(fail_point.clone(), options, None)
        .await?;
    info!("Enabled fail point '{}' on {}", name, server);
    ctx.fail_points.push(EnabledFailPoint {
        client,
        name,
        server: Some(server),
    });
    Ok(OperationResult::None)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailPoint {
    client: String,
    fail_point: Document,
}

impl Arguments for FailPoint {
    const NAME: &'static str = "failPoint";
    const KNOWN_ARGUMENTS: &'static [&'static str] = &["client", "failPoint"];
}

#[async_trait]
impl Execute for FailPoint {
    async fn execute(
        &self,
        _target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let client = &ctx.entities.client(&self.client)?.client;
        let server = client.hosts().into_iter().next().ok_or_else(|| {
            RunnerError::AssertionFailed(format!("client '{}' has no servers", self.client))
        })?;
        enable_fail_point(ctx, &self.fail_point, server).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetedFailPoint {
    session: String,
    fail_point: Document,
}

impl Arguments for TargetedFailPoint {
    const NAME: &'static str = "targetedFailPoint";
    const KNOWN_ARGUMENTS: &'static [&'static str] = &["session", "failPoint"];
}

#[async_trait]
impl Execute for TargetedFailPoint {
    async fn execute(
        &self,
        _target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let session = ctx.entities.session(&self.session)?;
        let server = session.session.pinned_server().ok_or_else(|| {
            RunnerError::AssertionFailed(format!(
                "session '{}' is not pinned to a server",
                self.session
            ))
        })?;
        enable_fail_point(ctx, &self.fail_point, server).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertSessionTransactionState {
    session: String,
    state: String,
}

impl Arguments for AssertSessionTransactionState {
    const NAME: &'static str = "assertSessionTransactionState";
    const KNOWN_ARGUMENTS: &'static [&'static str] = &["session", "state"];
}

#[async_trait]
impl Execute for AssertSessionTransactionState {
    async fn execute(
        &self,
        _target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let expected: TransactionState = self
            .state
            .parse()
            .map_err(|e: unified_common::Error| RunnerError::InvalidTestFile(e.to_string()))?;
        let actual = ctx.entities.session(&self.session)?.session.transaction_state();
        assert_that(actual == expected, || {
            format!(
                "session '{}' is in state {}, expected {}",
                self.session, actual, expected
            )
        })
    }
}

/// Arguments of the assertions that only name a session
#[derive(Debug, Deserialize)]
pub struct SessionArgument {
    session: String,
}

const SESSION_ARGUMENT: &[&str] = &["session"];

fn session_handle(ctx: &ExecutionContext<'_>, id: &str) -> RunnerResult<Arc<dyn Session>> {
    Ok(ctx.entities.session(id)?.session.clone())
}

#[derive(Debug, Deserialize)]
#[serde(transparent)]
pub struct AssertSessionPinned(SessionArgument);

impl Arguments for AssertSessionPinned {
    const NAME: &'static str = "assertSessionPinned";
    const KNOWN_ARGUMENTS: &'static [&'static str] = SESSION_ARGUMENT;
}

#[async_trait]
impl Execute for AssertSessionPinned {
    async fn execute(
        &self,
        _target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let id = &self.0.session;
        let pinned = session_handle(ctx, id)?.pinned_server();
        assert_that(pinned.is_some(), || format!("session '{}' is not pinned", id))
    }
}

#[derive(Debug, Deserialize)]
#[serde(transparent)]
pub struct AssertSessionUnpinned(SessionArgument);

impl Arguments for AssertSessionUnpinned {
    const NAME: &'static str = "assertSessionUnpinned";
    const KNOWN_ARGUMENTS: &'static [&'static str] = SESSION_ARGUMENT;
}

#[async_trait]
impl Execute for AssertSessionUnpinned {
    async fn execute(
        &self,
        _target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let id = &self.0.session;
        let pinned = session_handle(ctx, id)?.pinned_server();
        assert_that(pinned.is_none(), || {
            format!("session '{}' is pinned to {:?}", id, pinned)
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(transparent)]
pub struct AssertSessionDirty(SessionArgument);

impl Arguments for AssertSessionDirty {
    const NAME: &'static str = "assertSessionDirty";
    const KNOWN_ARGUMENTS: &'static [&'static str] = SESSION_ARGUMENT;
}

#[async_trait]
impl Execute for AssertSessionDirty {
    async fn execute(
        &self,
        _target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let id = &self.0.session;
        let dirty = session_handle(ctx, id)?.is_dirty();
        assert_that(dirty, || format!("session '{}' is not dirty", id))
    }
}

#[derive(Debug, Deserialize)]
#[serde(transparent)]
pub struct AssertSessionNotDirty(SessionArgument);

impl Arguments for AssertSessionNotDirty {
    const NAME: &'static str = "assertSessionNotDirty";
    const KNOWN_ARGUMENTS: &'static [&'static str] = SESSION_ARGUMENT;
}

#[async_trait]
impl Execute for AssertSessionNotDirty {
    async fn execute(
        &self,
        _target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let id = &self.0.session;
        let dirty = session_handle(ctx, id)?.is_dirty();
        assert_that(!dirty, || format!("session '{}' is dirty", id))
    }
}

/// Arguments of the assertions that only name a client
#[derive(Debug, Deserialize)]
pub struct ClientArgument {
    client: String,
}

const CLIENT_ARGUMENT: &[&str] = &["client"];

/// lsids of the last two commands the client was observed sending
fn last_two_lsids(ctx: &ExecutionContext<'_>, client: &str) -> RunnerResult<(Bson, Bson)> {
    let commands = ctx.entities.client(client)?.events.started_commands();
    let lsid = |command: &Document| -> RunnerResult<Bson> {
        command.get("lsid").cloned().ok_or_else(|| {
            RunnerError::AssertionFailed(format!("command {} carries no lsid", command))
        })
    };
    match commands.as_slice() {
        [.., second_last, last] => Ok((lsid(second_last)?, lsid(last)?)),
        _ => Err(RunnerError::AssertionFailed(format!(
            "client '{}' observed {} command(s), need at least two",
            client,
            commands.len()
        ))),
    }
}

#[derive(Debug, Deserialize)]
#[serde(transparent)]
pub struct AssertSameLsidOnLastTwoCommands(ClientArgument);

impl Arguments for AssertSameLsidOnLastTwoCommands {
    const NAME: &'static str = "assertSameLsidOnLastTwoCommands";
    const KNOWN_ARGUMENTS: &'static [&'static str] = CLIENT_ARGUMENT;
}

#[async_trait]
impl Execute for AssertSameLsidOnLastTwoCommands {
    async fn execute(
        &self,
        _target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let (first, second) = last_two_lsids(ctx, &self.0.client)?;
        assert_that(first == second, || {
            format!("lsids differ: {} vs {}", first, second)
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(transparent)]
pub struct AssertDifferentLsidOnLastTwoCommands(ClientArgument);

impl Arguments for AssertDifferentLsidOnLastTwoCommands {
    const NAME: &'static str = "assertDifferentLsidOnLastTwoCommands";
    const KNOWN_ARGUMENTS: &'static [&'static str] = CLIENT_ARGUMENT;
}

#[async_trait]
impl Execute for AssertDifferentLsidOnLastTwoCommands {
    async fn execute(
        &self,
        _target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let (first, second) = last_two_lsids(ctx, &self.0.client)?;
        assert_that(first != second, || format!("both commands used lsid {}", first))
    }
}

/// Namespace named by the collection assertions
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionArgument {
    database_name: String,
    collection_name: String,
}

const COLLECTION_ARGUMENTS: &[&str] = &["databaseName", "collectionName"];

async fn collection_exists(ctx: &ExecutionContext<'_>, args: &CollectionArgument) -> RunnerResult<bool> {
    let names = ctx
        .internal_client
        .database(&args.database_name, Default::default())
        .list_collection_names(None, None)
        .await?;
    Ok(names.contains(&args.collection_name))
}

#[derive(Debug, Deserialize)]
#[serde(transparent)]
pub struct AssertCollectionExists(CollectionArgument);

impl Arguments for AssertCollectionExists {
    const NAME: &'static str = "assertCollectionExists";
    const KNOWN_ARGUMENTS: &'static [&'static str] = COLLECTION_ARGUMENTS;
}

#[async_trait]
impl Execute for AssertCollectionExists {
    async fn execute(
        &self,
        _target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let exists = collection_exists(ctx, &self.0).await?;
        assert_that(exists, || {
            format!("collection {}.{} does not exist", self.0.database_name, self.0.collection_name)
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(transparent)]
pub struct AssertCollectionNotExists(CollectionArgument);

impl Arguments for AssertCollectionNotExists {
    const NAME: &'static str = "assertCollectionNotExists";
    const KNOWN_ARGUMENTS: &'static [&'static str] = COLLECTION_ARGUMENTS;
}

#[async_trait]
impl Execute for AssertCollectionNotExists {
    async fn execute(
        &self,
        _target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let exists = collection_exists(ctx, &self.0).await?;
        assert_that(!exists, || {
            format!("collection {}.{} exists", self.0.database_name, self.0.collection_name)
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexArgument {
    database_name: String,
    collection_name: String,
    index_name: String,
}

const INDEX_ARGUMENTS: &[&str] = &["databaseName", "collectionName", "indexName"];

async fn index_exists(ctx: &ExecutionContext<'_>, args: &IndexArgument) -> RunnerResult<bool> {
    let indexes = ctx
        .internal_client
        .database(&args.database_name, Default::default())
        .collection(&args.collection_name, Default::default())
        .list_indexes(None)
        .await?;
    Ok(indexes
        .iter()
        .any(|index| index.get_str("name").map(|name| name == args.index_name).unwrap_or(false)))
}

#[derive(Debug, Deserialize)]
#[serde(transparent)]
pub struct AssertIndexExists(IndexArgument);

impl Arguments for AssertIndexExists {
    const NAME: &'static str = "assertIndexExists";
    const KNOWN_ARGUMENTS: &'static [&'static str] = INDEX_ARGUMENTS;
}

#[async_trait]
impl Execute for AssertIndexExists {
    async fn execute(
        &self,
        _target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let exists = index_exists(ctx, &self.0).await?;
        assert_that(exists, || {
            format!(
                "index '{}' does not exist on {}.{}",
                self.0.index_name, self.0.database_name, self.0.collection_name
            )
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(transparent)]
pub struct AssertIndexNotExists(IndexArgument);

impl Arguments for AssertIndexNotExists {
    const NAME: &'static str = "assertIndexNotExists";
    const KNOWN_ARGUMENTS: &'static [&'static str] = INDEX_ARGUMENTS;
}

#[async_trait]
impl Execute for AssertIndexNotExists {
    async fn execute(
        &self,
        _target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let exists = index_exists(ctx, &self.0).await?;
        assert_that(!exists, || {
            format!(
                "index '{}' exists on {}.{}",
                self.0.index_name, self.0.database_name, self.0.collection_name
            )
        })
    }
}
