//! Session and transaction operations

use async_trait::async_trait;
use serde::Deserialize;

use unified_common::options::TransactionOptions;

use super::{Arguments, Execute, ExecutionContext, OperationResult, OperationTarget};
use crate::error::RunnerResult;
use crate::test_file::TransactionOptionsDescription;

#[derive(Debug, Deserialize)]
#[serde(transparent)]
pub struct StartTransaction(TransactionOptionsDescription);

impl Arguments for StartTransaction {
    const NAME: &'static str = "startTransaction";
    const KNOWN_ARGUMENTS: &'static [&'static str] =
        &["readConcern", "writeConcern", "readPreference", "maxCommitTimeMS"];
}

#[async_trait]
impl Execute for StartTransaction {
    async fn execute(
        &self,
        target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let session = ctx.entities.session(target.entity_id(Self::NAME)?)?.session.clone();
        let description = &self.0;
        let is_empty = description.read_concern.is_none()
            && description.write_concern.is_none()
            && description.read_preference.is_none()
            && description.max_commit_time_ms.is_none();
        // no options means the session defaults apply
        let options: Option<TransactionOptions> =
            (!is_empty).then(|| description.clone().into());
        Ok(OperationResult::from_unit(session.start_transaction(options).await))
    }
}

#[derive(Debug, Deserialize)]
pub struct CommitTransaction {}

impl Arguments for CommitTransaction {
    const NAME: &'static str = "commitTransaction";
    const KNOWN_ARGUMENTS: &'static [&'static str] = &[];
}

#[async_trait]
impl Execute for CommitTransaction {
    async fn execute(
        &self,
        target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let session = ctx.entities.session(target.entity_id(Self::NAME)?)?.session.clone();
        Ok(OperationResult::from_unit(session.commit_transaction().await))
    }
}

#[derive(Debug, Deserialize)]
pub struct AbortTransaction {}

impl Arguments for AbortTransaction {
    const NAME: &'static str = "abortTransaction";
    const KNOWN_ARGUMENTS: &'static [&'static str] = &[];
}

#[async_trait]
impl Execute for AbortTransaction {
    async fn execute(
        &self,
        target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let session = ctx.entities.session(target.entity_id(Self::NAME)?)?.session.clone();
        Ok(OperationResult::from_unit(session.abort_transaction().await))
    }
}

/// Ends the session; the entity stays so its lsid can still be matched
#[derive(Debug, Deserialize)]
pub struct EndSession {}

impl Arguments for EndSession {
    const NAME: &'static str = "endSession";
    const KNOWN_ARGUMENTS: &'static [&'static str] = &[];
}

#[async_trait]
impl Execute for EndSession {
    async fn execute(
        &self,
        target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let session = ctx.entities.session(target.entity_id(Self::NAME)?)?.session.clone();
        session.end().await;
        Ok(OperationResult::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_start_transaction_options() {
        let args = StartTransaction::decode(doc! {
            "readConcern": { "level": "snapshot" },
            "writeConcern": { "w": "majority" },
            "maxCommitTimeMS": 60,
        })
        .unwrap();
        assert_eq!(args.0.read_concern.as_ref().unwrap().level, "snapshot");
        assert_eq!(args.0.max_commit_time_ms, Some(60));
        assert!(StartTransaction::decode(doc! { "session": "session0" }).is_err());
    }
}
