//! Client operations

use async_trait::async_trait;
use bson::{Bson, Document};
use serde::Deserialize;

use super::{Arguments, Execute, ExecutionContext, OperationResult, OperationTarget};
use crate::error::RunnerResult;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListDatabases {
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    filter: Option<Document>,
}

impl Arguments for ListDatabases {
    const NAME: &'static str = "listDatabases";
    const KNOWN_ARGUMENTS: &'static [&'static str] = &["session", "filter"];
}

#[async_trait]
impl Execute for ListDatabases {
    async fn execute(
        &self,
        target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let client = ctx.entities.client(target.entity_id(Self::NAME)?)?.client.clone();
        let session = ctx.entities.resolve_session(self.session.as_deref())?;
        let result = client
            .list_databases(self.filter.clone(), session.as_deref())
            .await;
        Ok(OperationResult::from_documents(result))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListDatabaseNames {
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    filter: Option<Document>,
}

impl Arguments for ListDatabaseNames {
    const NAME: &'static str = "listDatabaseNames";
    const KNOWN_ARGUMENTS: &'static [&'static str] = &["session", "filter"];
}

#[async_trait]
impl Execute for ListDatabaseNames {
    async fn execute(
        &self,
        target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let client = ctx.entities.client(target.entity_id(Self::NAME)?)?.client.clone();
        let session = ctx.entities.resolve_session(self.session.as_deref())?;
        let result = client
            .list_database_names(self.filter.clone(), session.as_deref())
            .await;
        Ok(OperationResult::from_driver(result, |names| {
            Bson::Array(names.into_iter().map(Bson::String).collect())
        }))
    }
}
