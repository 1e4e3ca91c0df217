//! Database operations

use async_trait::async_trait;
use bson::{Bson, Document};
use serde::Deserialize;
use std::sync::Arc;

use unified_common::options::{CreateCollectionOptions, DropCollectionOptions, RunCommandOptions};
use unified_common::{Database, ReadPreference, Session, WriteConcern};

use super::{Arguments, Execute, ExecutionContext, OperationResult, OperationTarget};
use crate::error::{RunnerError, RunnerResult};

fn resolve(
    operation: &str,
    target: &OperationTarget,
    session: Option<&str>,
    ctx: &ExecutionContext<'_>,
) -> RunnerResult<(Arc<dyn Database>, Option<Arc<dyn Session>>)> {
    Ok((
        ctx.entities.database(target.entity_id(operation)?)?,
        ctx.entities.resolve_session(session)?,
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCommand {
    #[serde(default)]
    session: Option<String>,
    command: Document,
    command_name: String,
    #[serde(default)]
    read_preference: Option<ReadPreference>,
}

impl Arguments for RunCommand {
    const NAME: &'static str = "runCommand";
    const KNOWN_ARGUMENTS: &'static [&'static str] =
        &["session", "command", "commandName", "readPreference"];
}

#[async_trait]
impl Execute for RunCommand {
    async fn execute(
        &self,
        target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let first_key = self.command.keys().next();
        if first_key.map(String::as_str) != Some(self.command_name.as_str()) {
            return Err(RunnerError::InvalidTestFile(format!(
                "runCommand: commandName '{}' is not the first key of the command",
                self.command_name
            )));
        }
        let (database, session) = resolve(Self::NAME, target, self.session.as_deref(), ctx)?;
        let options = RunCommandOptions {
            read_preference: self.read_preference.clone(),
            target: None,
        };
        let result = database
            .run_command(self.command.clone(), options, session.as_deref())
            .await;
        Ok(OperationResult::from_driver(result, Bson::Document))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCollection {
    #[serde(default)]
    session: Option<String>,
    collection: String,
    #[serde(default)]
    write_concern: Option<WriteConcern>,
}

impl Arguments for CreateCollection {
    const NAME: &'static str = "createCollection";
    const KNOWN_ARGUMENTS: &'static [&'static str] = &["session", "collection", "writeConcern"];
}

#[async_trait]
impl Execute for CreateCollection {
    async fn execute(
        &self,
        target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let (database, session) = resolve(Self::NAME, target, self.session.as_deref(), ctx)?;
        let options = CreateCollectionOptions {
            write_concern: self.write_concern.clone(),
        };
        let result = database
            .create_collection(&self.collection, options, session.as_deref())
            .await;
        Ok(OperationResult::from_unit(result))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropCollection {
    #[serde(default)]
    session: Option<String>,
    collection: String,
    #[serde(default)]
    write_concern: Option<WriteConcern>,
}

impl Arguments for DropCollection {
    const NAME: &'static str = "dropCollection";
    const KNOWN_ARGUMENTS: &'static [&'static str] = &["session", "collection", "writeConcern"];
}

#[async_trait]
impl Execute for DropCollection {
    async fn execute(
        &self,
        target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let (database, session) = resolve(Self::NAME, target, self.session.as_deref(), ctx)?;
        let options = DropCollectionOptions {
            write_concern: self.write_concern.clone(),
        };
        let result = database
            .drop_collection(&self.collection, options, session.as_deref())
            .await;
        Ok(OperationResult::from_unit(result))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListCollections {
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    filter: Option<Document>,
}

impl Arguments for ListCollections {
    const NAME: &'static str = "listCollections";
    const KNOWN_ARGUMENTS: &'static [&'static str] = &["session", "filter"];
}

#[async_trait]
impl Execute for ListCollections {
    async fn execute(
        &self,
        target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let (database, session) = resolve(Self::NAME, target, self.session.as_deref(), ctx)?;
        let result = database
            .list_collections(self.filter.clone(), session.as_deref())
            .await;
        Ok(OperationResult::from_documents(result))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListCollectionNames {
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    filter: Option<Document>,
}

impl Arguments for ListCollectionNames {
    const NAME: &'static str = "listCollectionNames";
    const KNOWN_ARGUMENTS: &'static [&'static str] = &["session", "filter"];
}

#[async_trait]
impl Execute for ListCollectionNames {
    async fn execute(
        &self,
        target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let (database, session) = resolve(Self::NAME, target, self.session.as_deref(), ctx)?;
        let result = database
            .list_collection_names(self.filter.clone(), session.as_deref())
            .await;
        Ok(OperationResult::from_driver(result, |names| {
            Bson::Array(names.into_iter().map(Bson::String).collect())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_run_command_arguments() {
        let args = RunCommand::decode(doc! {
            "command": { "ping": 1 },
            "commandName": "ping",
            "readPreference": { "mode": "secondaryPreferred" },
        })
        .unwrap();
        assert_eq!(args.command_name, "ping");
        assert_eq!(args.read_preference.unwrap().mode, "secondaryPreferred");
        assert!(RunCommand::decode(doc! { "command": { "ping": 1 } }).is_err());
    }

    #[test]
    fn test_create_collection_rejects_unknown_option() {
        let err = CreateCollection::decode(doc! { "collection": "coll", "capped": true }).unwrap_err();
        assert!(matches!(err, RunnerError::UnrecognizedArgument { argument, .. } if argument == "capped"));
    }
}
