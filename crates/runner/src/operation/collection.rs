//! Collection operations

use async_trait::async_trait;
use bson::{Bson, Document};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use std::sync::Arc;

use unified_common::options::{
    AggregateOptions, BulkWriteOptions, CountOptions, DeleteOptions, FindOneAndModifyOptions,
    FindOptions, IndexOptions, InsertManyOptions, ReturnDocument, UpdateModifications,
    UpdateOptions, WriteModel,
};
use unified_common::{Collection, Session};

use super::{Arguments, Execute, ExecutionContext, OperationResult, OperationTarget};
use crate::error::RunnerResult;

struct Resolved {
    collection: Arc<dyn Collection>,
    session: Option<Arc<dyn Session>>,
}

fn resolve(
    operation: &str,
    target: &OperationTarget,
    session: Option<&str>,
    ctx: &ExecutionContext<'_>,
) -> RunnerResult<Resolved> {
    Ok(Resolved {
        collection: ctx.entities.collection(target.entity_id(operation)?)?,
        session: ctx.entities.resolve_session(session)?,
    })
}

fn count(n: u64) -> Bson {
    Bson::Int64(n as i64)
}

fn optional_document(document: Option<Document>) -> Bson {
    document.map(Bson::Document).unwrap_or(Bson::Null)
}

/// An update document or an aggregation pipeline
fn deserialize_update<'de, D>(deserializer: D) -> Result<UpdateModifications, D::Error>
where
    D: Deserializer<'de>,
{
    match Bson::deserialize(deserializer)? {
        Bson::Document(document) => Ok(UpdateModifications::Document(document)),
        Bson::Array(stages) => stages
            .into_iter()
            .map(|stage| match stage {
                Bson::Document(stage) => Ok(stage),
                other => Err(D::Error::custom(format!(
                    "pipeline stage must be a document, got {}",
                    other
                ))),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(UpdateModifications::Pipeline),
        other => Err(D::Error::custom(format!(
            "update must be a document or a pipeline, got {}",
            other
        ))),
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
enum ReturnDocumentArgument {
    Before,
    After,
}

impl From<ReturnDocumentArgument> for ReturnDocument {
    fn from(argument: ReturnDocumentArgument) -> Self {
        match argument {
            ReturnDocumentArgument::Before => ReturnDocument::Before,
            ReturnDocumentArgument::After => ReturnDocument::After,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertOne {
    #[serde(default)]
    session: Option<String>,
    document: Document,
}

impl Arguments for InsertOne {
    const NAME: &'static str = "insertOne";
    const KNOWN_ARGUMENTS: &'static [&'static str] = &["session", "document"];
}

#[async_trait]
impl Execute for InsertOne {
    async fn execute(
        &self,
        target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let r = resolve(Self::NAME, target, self.session.as_deref(), ctx)?;
        let result = r
            .collection
            .insert_one(self.document.clone(), r.session.as_deref())
            .await;
        Ok(OperationResult::from_driver(result, |r| Bson::Document(r.to_document())))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertMany {
    #[serde(default)]
    session: Option<String>,
    documents: Vec<Document>,
    #[serde(default)]
    ordered: Option<bool>,
}

impl Arguments for InsertMany {
    const NAME: &'static str = "insertMany";
    const KNOWN_ARGUMENTS: &'static [&'static str] = &["session", "documents", "ordered"];
}

#[async_trait]
impl Execute for InsertMany {
    async fn execute(
        &self,
        target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let r = resolve(Self::NAME, target, self.session.as_deref(), ctx)?;
        let options = InsertManyOptions {
            ordered: self.ordered,
        };
        let result = r
            .collection
            .insert_many(self.documents.clone(), options, r.session.as_deref())
            .await;
        Ok(OperationResult::from_driver(result, |r| Bson::Document(r.to_document())))
    }
}

/// Arguments shared by `updateOne` and `updateMany`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateArguments {
    #[serde(default)]
    session: Option<String>,
    filter: Document,
    #[serde(deserialize_with = "deserialize_update")]
    update: UpdateModifications,
    #[serde(default)]
    upsert: Option<bool>,
    #[serde(default)]
    array_filters: Option<Vec<Document>>,
    #[serde(default)]
    hint: Option<Bson>,
}

const UPDATE_ARGUMENTS: &[&str] = &["session", "filter", "update", "upsert", "arrayFilters", "hint"];

impl UpdateArguments {
    fn options(&self) -> UpdateOptions {
        UpdateOptions {
            upsert: self.upsert,
            array_filters: self.array_filters.clone(),
            hint: self.hint.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(transparent)]
pub struct UpdateOne(UpdateArguments);

impl Arguments for UpdateOne {
    const NAME: &'static str = "updateOne";
    const KNOWN_ARGUMENTS: &'static [&'static str] = UPDATE_ARGUMENTS;
}

#[async_trait]
impl Execute for UpdateOne {
    async fn execute(
        &self,
        target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let args = &self.0;
        let r = resolve(Self::NAME, target, args.session.as_deref(), ctx)?;
        let result = r
            .collection
            .update_one(
                args.filter.clone(),
                args.update.clone(),
                args.options(),
                r.session.as_deref(),
            )
            .await;
        Ok(OperationResult::from_driver(result, |r| Bson::Document(r.to_document())))
    }
}

#[derive(Debug, Deserialize)]
#[serde(transparent)]
pub struct UpdateMany(UpdateArguments);

impl Arguments for UpdateMany {
    const NAME: &'static str = "updateMany";
    const KNOWN_ARGUMENTS: &'static [&'static str] = UPDATE_ARGUMENTS;
}

#[async_trait]
impl Execute for UpdateMany {
    async fn execute(
        &self,
        target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let args = &self.0;
        let r = resolve(Self::NAME, target, args.session.as_deref(), ctx)?;
        let result = r
            .collection
            .update_many(
                args.filter.clone(),
                args.update.clone(),
                args.options(),
                r.session.as_deref(),
            )
            .await;
        Ok(OperationResult::from_driver(result, |r| Bson::Document(r.to_document())))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceOne {
    #[serde(default)]
    session: Option<String>,
    filter: Document,
    replacement: Document,
    #[serde(default)]
    upsert: Option<bool>,
    #[serde(default)]
    hint: Option<Bson>,
}

impl Arguments for ReplaceOne {
    const NAME: &'static str = "replaceOne";
    const KNOWN_ARGUMENTS: &'static [&'static str] =
        &["session", "filter", "replacement", "upsert", "hint"];
}

#[async_trait]
impl Execute for ReplaceOne {
    async fn execute(
        &self,
        target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let r = resolve(Self::NAME, target, self.session.as_deref(), ctx)?;
        let options = UpdateOptions {
            upsert: self.upsert,
            array_filters: None,
            hint: self.hint.clone(),
        };
        let result = r
            .collection
            .replace_one(
                self.filter.clone(),
                self.replacement.clone(),
                options,
                r.session.as_deref(),
            )
            .await;
        Ok(OperationResult::from_driver(result, |r| Bson::Document(r.to_document())))
    }
}

/// Arguments shared by `deleteOne` and `deleteMany`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteArguments {
    #[serde(default)]
    session: Option<String>,
    filter: Document,
    #[serde(default)]
    hint: Option<Bson>,
}

const DELETE_ARGUMENTS: &[&str] = &["session", "filter", "hint"];

#[derive(Debug, Deserialize)]
#[serde(transparent)]
pub struct DeleteOne(DeleteArguments);

impl Arguments for DeleteOne {
    const NAME: &'static str = "deleteOne";
    const KNOWN_ARGUMENTS: &'static [&'static str] = DELETE_ARGUMENTS;
}

#[async_trait]
impl Execute for DeleteOne {
    async fn execute(
        &self,
        target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let args = &self.0;
        let r = resolve(Self::NAME, target, args.session.as_deref(), ctx)?;
        let options = DeleteOptions {
            hint: args.hint.clone(),
        };
        let result = r
            .collection
            .delete_one(args.filter.clone(), options, r.session.as_deref())
            .await;
        Ok(OperationResult::from_driver(result, |r| Bson::Document(r.to_document())))
    }
}

#[derive(Debug, Deserialize)]
#[serde(transparent)]
pub struct DeleteMany(DeleteArguments);

impl Arguments for DeleteMany {
    const NAME: &'static str = "deleteMany";
    const KNOWN_ARGUMENTS: &'static [&'static str] = DELETE_ARGUMENTS;
}

#[async_trait]
impl Execute for DeleteMany {
    async fn execute(
        &self,
        target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let args = &self.0;
        let r = resolve(Self::NAME, target, args.session.as_deref(), ctx)?;
        let options = DeleteOptions {
            hint: args.hint.clone(),
        };
        let result = r
            .collection
            .delete_many(args.filter.clone(), options, r.session.as_deref())
            .await;
        Ok(OperationResult::from_driver(result, |r| Bson::Document(r.to_document())))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Find {
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    filter: Document,
    #[serde(default)]
    sort: Option<Document>,
    #[serde(default)]
    projection: Option<Document>,
    #[serde(default)]
    skip: Option<u64>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    batch_size: Option<u32>,
}

impl Arguments for Find {
    const NAME: &'static str = "find";
    const KNOWN_ARGUMENTS: &'static [&'static str] = &[
        "session",
        "filter",
        "sort",
        "projection",
        "skip",
        "limit",
        "batchSize",
    ];
}

#[async_trait]
impl Execute for Find {
    async fn execute(
        &self,
        target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let r = resolve(Self::NAME, target, self.session.as_deref(), ctx)?;
        let options = FindOptions {
            sort: self.sort.clone(),
            projection: self.projection.clone(),
            skip: self.skip,
            limit: self.limit,
            batch_size: self.batch_size,
        };
        let result = r
            .collection
            .find(self.filter.clone(), options, r.session.as_deref())
            .await;
        Ok(OperationResult::from_documents(result))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregate {
    #[serde(default)]
    session: Option<String>,
    pipeline: Vec<Document>,
    #[serde(default)]
    batch_size: Option<u32>,
    #[serde(default)]
    allow_disk_use: Option<bool>,
}

impl Arguments for Aggregate {
    const NAME: &'static str = "aggregate";
    const KNOWN_ARGUMENTS: &'static [&'static str] =
        &["session", "pipeline", "batchSize", "allowDiskUse"];
}

#[async_trait]
impl Execute for Aggregate {
    async fn execute(
        &self,
        target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let r = resolve(Self::NAME, target, self.session.as_deref(), ctx)?;
        let options = AggregateOptions {
            batch_size: self.batch_size,
            allow_disk_use: self.allow_disk_use,
        };
        let result = r
            .collection
            .aggregate(self.pipeline.clone(), options, r.session.as_deref())
            .await;
        Ok(OperationResult::from_documents(result))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Distinct {
    #[serde(default)]
    session: Option<String>,
    field_name: String,
    #[serde(default)]
    filter: Document,
}

impl Arguments for Distinct {
    const NAME: &'static str = "distinct";
    const KNOWN_ARGUMENTS: &'static [&'static str] = &["session", "fieldName", "filter"];
}

#[async_trait]
impl Execute for Distinct {
    async fn execute(
        &self,
        target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let r = resolve(Self::NAME, target, self.session.as_deref(), ctx)?;
        let result = r
            .collection
            .distinct(&self.field_name, self.filter.clone(), r.session.as_deref())
            .await;
        Ok(OperationResult::from_driver(result, Bson::Array))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountDocuments {
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    filter: Document,
    #[serde(default)]
    skip: Option<u64>,
    #[serde(default)]
    limit: Option<u64>,
}

impl Arguments for CountDocuments {
    const NAME: &'static str = "countDocuments";
    const KNOWN_ARGUMENTS: &'static [&'static str] = &["session", "filter", "skip", "limit"];
}

#[async_trait]
impl Execute for CountDocuments {
    async fn execute(
        &self,
        target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let r = resolve(Self::NAME, target, self.session.as_deref(), ctx)?;
        let options = CountOptions {
            skip: self.skip,
            limit: self.limit,
        };
        let result = r
            .collection
            .count_documents(self.filter.clone(), options, r.session.as_deref())
            .await;
        Ok(OperationResult::from_driver(result, count))
    }
}

#[derive(Debug, Deserialize)]
pub struct EstimatedDocumentCount {}

impl Arguments for EstimatedDocumentCount {
    const NAME: &'static str = "estimatedDocumentCount";
    const KNOWN_ARGUMENTS: &'static [&'static str] = &[];
}

#[async_trait]
impl Execute for EstimatedDocumentCount {
    async fn execute(
        &self,
        target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let r = resolve(Self::NAME, target, None, ctx)?;
        let result = r.collection.estimated_document_count().await;
        Ok(OperationResult::from_driver(result, count))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindOneAndUpdate {
    #[serde(default)]
    session: Option<String>,
    filter: Document,
    #[serde(deserialize_with = "deserialize_update")]
    update: UpdateModifications,
    #[serde(default)]
    sort: Option<Document>,
    #[serde(default)]
    projection: Option<Document>,
    #[serde(default)]
    upsert: Option<bool>,
    #[serde(default)]
    return_document: Option<ReturnDocumentArgument>,
}

impl Arguments for FindOneAndUpdate {
    const NAME: &'static str = "findOneAndUpdate";
    const KNOWN_ARGUMENTS: &'static [&'static str] = &[
        "session",
        "filter",
        "update",
        "sort",
        "projection",
        "upsert",
        "returnDocument",
    ];
}

#[async_trait]
impl Execute for FindOneAndUpdate {
    async fn execute(
        &self,
        target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let r = resolve(Self::NAME, target, self.session.as_deref(), ctx)?;
        let options = FindOneAndModifyOptions {
            sort: self.sort.clone(),
            projection: self.projection.clone(),
            upsert: self.upsert,
            return_document: self.return_document.map(Into::into).unwrap_or_default(),
        };
        let result = r
            .collection
            .find_one_and_update(
                self.filter.clone(),
                self.update.clone(),
                options,
                r.session.as_deref(),
            )
            .await;
        Ok(OperationResult::from_driver(result, optional_document))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindOneAndReplace {
    #[serde(default)]
    session: Option<String>,
    filter: Document,
    replacement: Document,
    #[serde(default)]
    sort: Option<Document>,
    #[serde(default)]
    projection: Option<Document>,
    #[serde(default)]
    upsert: Option<bool>,
    #[serde(default)]
    return_document: Option<ReturnDocumentArgument>,
}

impl Arguments for FindOneAndReplace {
    const NAME: &'static str = "findOneAndReplace";
    const KNOWN_ARGUMENTS: &'static [&'static str] = &[
        "session",
        "filter",
        "replacement",
        "sort",
        "projection",
        "upsert",
        "returnDocument",
    ];
}

#[async_trait]
impl Execute for FindOneAndReplace {
    async fn execute(
        &self,
        target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let r = resolve(Self::NAME, target, self.session.as_deref(), ctx)?;
        let options = FindOneAndModifyOptions {
            sort: self.sort.clone(),
            projection: self.projection.clone(),
            upsert: self.upsert,
            return_document: self.return_document.map(Into::into).unwrap_or_default(),
        };
        let result = r
            .collection
            .find_one_and_replace(
                self.filter.clone(),
                self.replacement.clone(),
                options,
                r.session.as_deref(),
            )
            .await;
        Ok(OperationResult::from_driver(result, optional_document))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindOneAndDelete {
    #[serde(default)]
    session: Option<String>,
    filter: Document,
    #[serde(default)]
    sort: Option<Document>,
    #[serde(default)]
    projection: Option<Document>,
}

impl Arguments for FindOneAndDelete {
    const NAME: &'static str = "findOneAndDelete";
    const KNOWN_ARGUMENTS: &'static [&'static str] = &["session", "filter", "sort", "projection"];
}

#[async_trait]
impl Execute for FindOneAndDelete {
    async fn execute(
        &self,
        target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let r = resolve(Self::NAME, target, self.session.as_deref(), ctx)?;
        let options = FindOneAndModifyOptions {
            sort: self.sort.clone(),
            projection: self.projection.clone(),
            ..Default::default()
        };
        let result = r
            .collection
            .find_one_and_delete(self.filter.clone(), options, r.session.as_deref())
            .await;
        Ok(OperationResult::from_driver(result, optional_document))
    }
}

/// One entry of `bulkWrite.requests`, keyed by model name
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
enum WriteModelArgument {
    InsertOne {
        document: Document,
    },
    UpdateOne {
        filter: Document,
        #[serde(deserialize_with = "deserialize_update")]
        update: UpdateModifications,
        #[serde(default)]
        upsert: Option<bool>,
    },
    UpdateMany {
        filter: Document,
        #[serde(deserialize_with = "deserialize_update")]
        update: UpdateModifications,
        #[serde(default)]
        upsert: Option<bool>,
    },
    ReplaceOne {
        filter: Document,
        replacement: Document,
        #[serde(default)]
        upsert: Option<bool>,
    },
    DeleteOne {
        filter: Document,
    },
    DeleteMany {
        filter: Document,
    },
}

impl WriteModelArgument {
    fn to_model(&self) -> WriteModel {
        match self {
            WriteModelArgument::InsertOne { document } => WriteModel::InsertOne {
                document: document.clone(),
            },
            WriteModelArgument::UpdateOne {
                filter,
                update,
                upsert,
            } => WriteModel::UpdateOne {
                filter: filter.clone(),
                update: update.clone(),
                upsert: *upsert,
            },
            WriteModelArgument::UpdateMany {
                filter,
                update,
                upsert,
            } => WriteModel::UpdateMany {
                filter: filter.clone(),
                update: update.clone(),
                upsert: *upsert,
            },
            WriteModelArgument::ReplaceOne {
                filter,
                replacement,
                upsert,
            } => WriteModel::ReplaceOne {
                filter: filter.clone(),
                replacement: replacement.clone(),
                upsert: *upsert,
            },
            WriteModelArgument::DeleteOne { filter } => WriteModel::DeleteOne {
                filter: filter.clone(),
            },
            WriteModelArgument::DeleteMany { filter } => WriteModel::DeleteMany {
                filter: filter.clone(),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkWrite {
    #[serde(default)]
    session: Option<String>,
    requests: Vec<WriteModelArgument>,
    #[serde(default)]
    ordered: Option<bool>,
}

impl Arguments for BulkWrite {
    const NAME: &'static str = "bulkWrite";
    const KNOWN_ARGUMENTS: &'static [&'static str] = &["session", "requests", "ordered"];
}

#[async_trait]
impl Execute for BulkWrite {
    async fn execute(
        &self,
        target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let r = resolve(Self::NAME, target, self.session.as_deref(), ctx)?;
        let requests = self.requests.iter().map(WriteModelArgument::to_model).collect();
        let options = BulkWriteOptions {
            ordered: self.ordered,
        };
        let result = r
            .collection
            .bulk_write(requests, options, r.session.as_deref())
            .await;
        Ok(OperationResult::from_driver(result, |r| Bson::Document(r.to_document())))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateIndex {
    #[serde(default)]
    session: Option<String>,
    keys: Document,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    unique: Option<bool>,
}

impl Arguments for CreateIndex {
    const NAME: &'static str = "createIndex";
    const KNOWN_ARGUMENTS: &'static [&'static str] = &["session", "keys", "name", "unique"];
}

#[async_trait]
impl Execute for CreateIndex {
    async fn execute(
        &self,
        target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let r = resolve(Self::NAME, target, self.session.as_deref(), ctx)?;
        let options = IndexOptions {
            name: self.name.clone(),
            unique: self.unique,
        };
        let result = r
            .collection
            .create_index(self.keys.clone(), options, r.session.as_deref())
            .await;
        Ok(OperationResult::from_driver(result, Bson::String))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropIndex {
    #[serde(default)]
    session: Option<String>,
    name: String,
}

impl Arguments for DropIndex {
    const NAME: &'static str = "dropIndex";
    const KNOWN_ARGUMENTS: &'static [&'static str] = &["session", "name"];
}

#[async_trait]
impl Execute for DropIndex {
    async fn execute(
        &self,
        target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let r = resolve(Self::NAME, target, self.session.as_deref(), ctx)?;
        let result = r.collection.drop_index(&self.name, r.session.as_deref()).await;
        Ok(OperationResult::from_unit(result))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListIndexes {
    #[serde(default)]
    session: Option<String>,
}

impl Arguments for ListIndexes {
    const NAME: &'static str = "listIndexes";
    const KNOWN_ARGUMENTS: &'static [&'static str] = &["session"];
}

#[async_trait]
impl Execute for ListIndexes {
    async fn execute(
        &self,
        target: &OperationTarget,
        ctx: &mut ExecutionContext<'_>,
    ) -> RunnerResult<OperationResult> {
        let r = resolve(Self::NAME, target, self.session.as_deref(), ctx)?;
        let result = r.collection.list_indexes(r.session.as_deref()).await;
        Ok(OperationResult::from_documents(result))
    }
}
