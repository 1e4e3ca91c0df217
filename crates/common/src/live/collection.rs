//! Collections and change streams wrapping the `mongodb` driver's

use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{doc, Bson, Document};
use futures::TryStreamExt;
use mongodb::change_stream::session::SessionChangeStream;
use mongodb::change_stream::ChangeStream as DriverChangeStream;
use mongodb::options::{FullDocumentType, Hint, ReturnDocument as DriverReturnDocument};
use mongodb::SessionCursor;
use tracing::warn;

use super::convert;
use super::database::drain_command_cursor;
use super::session::{ended, LiveSession, SessionSlot};
use crate::driver::{ChangeStream, Collection, Session};
use crate::error::{BulkWriteFailure, CommandError, ErrorKind, IndexedWriteError};
use crate::options::*;
use crate::results::*;
use crate::types::Namespace;
use crate::{Error, Result};

pub struct LiveCollection {
    inner: mongodb::Collection<Document>,
    database: mongodb::Database,
    options: CollectionOptions,
}

impl LiveCollection {
    pub(crate) fn new(database: &mongodb::Database, name: &str, options: CollectionOptions) -> Self {
        let inner = match convert::collection_options(&options) {
            Ok(driver_options) => database.collection_with_options(name, driver_options),
            Err(e) => {
                warn!("Ignoring invalid options for collection '{}': {}", name, e);
                database.collection(name)
            }
        };
        Self {
            inner,
            database: database.clone(),
            options,
        }
    }

    /// Runs one write command of a bulk write and folds its reply into
    /// `outcome`; `offset` is the index of the batch's first request
    async fn write_batch(
        &self,
        models: &[WriteModel],
        offset: usize,
        ordered: bool,
        session: Option<&dyn Session>,
        outcome: &mut BulkOutcome,
    ) -> Result<()> {
        let kind = models[0].command_name();
        let statements: Vec<Document> = models.iter().map(statement).collect();
        let key = match kind {
            "insert" => "documents",
            "update" => "updates",
            _ => "deletes",
        };
        let mut command = Document::new();
        command.insert(kind, self.inner.name());
        command.insert(key, statements);
        command.insert("ordered", ordered);
        if let Some(write_concern) = &self.options.write_concern {
            if !in_transaction(session) {
                command.insert("writeConcern", write_concern.to_document());
            }
        }

        let reply = with_session!(
            session,
            s => self.database.run_command_with_session(command, None, s),
            self.database.run_command(command, None)
        )?;

        let failed: Vec<usize> = reply
            .get_array("writeErrors")
            .map(|errors| {
                errors
                    .iter()
                    .filter_map(Bson::as_document)
                    .filter_map(|e| e.get_i32("index").ok())
                    .map(|index| index as usize)
                    .collect()
            })
            .unwrap_or_default();
        for error in reply.get_array("writeErrors").into_iter().flatten() {
            if let Some(error) = error.as_document() {
                outcome.errors.push(IndexedWriteError {
                    index: offset + error.get_i32("index").unwrap_or(0) as usize,
                    code: error.get_i32("code").unwrap_or(8),
                    code_name: error.get_str("codeName").unwrap_or_default().to_string(),
                    message: error.get_str("errmsg").unwrap_or_default().to_string(),
                });
            }
        }
        if let Ok(wc) = reply.get_document("writeConcernError") {
            outcome.write_concern_error = Some(CommandError {
                code: wc.get_i32("code").unwrap_or(8),
                code_name: wc.get_str("codeName").unwrap_or_default().to_string(),
                message: wc.get_str("errmsg").unwrap_or_default().to_string(),
            });
        }

        let n = convert::count(&reply, "n");
        let result = &mut outcome.result;
        match kind {
            "insert" => {
                let first_failure = failed.iter().min().copied();
                for (index, model) in models.iter().enumerate() {
                    let applied = if ordered {
                        first_failure.map(|first| index < first).unwrap_or(true)
                    } else {
                        !failed.contains(&index)
                    };
                    if let (true, WriteModel::InsertOne { document }) = (applied, model) {
                        if let Some(id) = document.get("_id") {
                            result.inserted_ids.insert(offset + index, id.clone());
                        }
                    }
                }
                result.inserted_count += n;
            }
            "update" => {
                let upserted: Vec<(usize, Bson)> = reply
                    .get_array("upserted")
                    .map(|upserted| {
                        upserted
                            .iter()
                            .filter_map(Bson::as_document)
                            .filter_map(|u| {
                                let index = u.get_i32("index").ok()? as usize;
                                Some((offset + index, u.get("_id")?.clone()))
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                result.matched_count += n.saturating_sub(upserted.len() as u64);
                result.modified_count += convert::count(&reply, "nModified");
                result.upserted_count += upserted.len() as u64;
                result.upserted_ids.extend(upserted);
            }
            _ => result.deleted_count += n,
        }
        Ok(())
    }

    /// Sends `models` grouped into consecutive runs of the same command
    async fn write(
        &self,
        models: Vec<WriteModel>,
        ordered: bool,
        session: Option<&dyn Session>,
    ) -> Result<BulkOutcome> {
        let mut outcome = BulkOutcome::default();
        let mut start = 0;
        while start < models.len() {
            let kind = models[start].command_name();
            let end = models[start..]
                .iter()
                .position(|model| model.command_name() != kind)
                .map(|len| start + len)
                .unwrap_or(models.len());
            self.write_batch(&models[start..end], start, ordered, session, &mut outcome)
                .await?;
            if ordered && !outcome.errors.is_empty() {
                break;
            }
            start = end;
        }
        Ok(outcome)
    }
}

#[derive(Default)]
struct BulkOutcome {
    result: BulkWriteResult,
    errors: Vec<IndexedWriteError>,
    write_concern_error: Option<CommandError>,
}

impl BulkOutcome {
    fn failed(&self) -> bool {
        !self.errors.is_empty() || self.write_concern_error.is_some()
    }

    fn into_error(self, partial_result: Document) -> Error {
        Error::new(ErrorKind::BulkWrite(BulkWriteFailure {
            write_errors: self.errors,
            write_concern_error: self.write_concern_error,
            partial_result: Some(partial_result),
        }))
    }
}

fn in_transaction(session: Option<&dyn Session>) -> bool {
    session
        .map(|s| s.transaction_state().is_active())
        .unwrap_or(false)
}

/// The write command statement for one request
fn statement(model: &WriteModel) -> Document {
    match model {
        WriteModel::InsertOne { document } => document.clone(),
        WriteModel::UpdateOne { filter, update, upsert }
        | WriteModel::UpdateMany { filter, update, upsert } => doc! {
            "q": filter.clone(),
            "u": update.to_bson(),
            "multi": matches!(model, WriteModel::UpdateMany { .. }),
            "upsert": upsert.unwrap_or(false),
        },
        WriteModel::ReplaceOne { filter, replacement, upsert } => doc! {
            "q": filter.clone(),
            "u": replacement.clone(),
            "upsert": upsert.unwrap_or(false),
        },
        WriteModel::DeleteOne { filter } => doc! { "q": filter.clone(), "limit": 1 },
        WriteModel::DeleteMany { filter } => doc! { "q": filter.clone(), "limit": 0 },
    }
}

fn ensure_id(document: Document) -> Document {
    if document.contains_key("_id") {
        return document;
    }
    let mut with_id = doc! { "_id": ObjectId::new() };
    for (key, value) in document {
        with_id.insert(key, value);
    }
    with_id
}

fn hint(hint: &Option<Bson>) -> Option<Hint> {
    match hint {
        Some(Bson::String(name)) => Some(Hint::Name(name.clone())),
        Some(Bson::Document(keys)) => Some(Hint::Keys(keys.clone())),
        _ => None,
    }
}

fn modifications(update: UpdateModifications) -> mongodb::options::UpdateModifications {
    match update {
        UpdateModifications::Document(document) => {
            mongodb::options::UpdateModifications::Document(document)
        }
        UpdateModifications::Pipeline(stages) => {
            mongodb::options::UpdateModifications::Pipeline(stages)
        }
    }
}

fn update_options(options: &UpdateOptions) -> mongodb::options::UpdateOptions {
    let mut converted = mongodb::options::UpdateOptions::default();
    converted.upsert = options.upsert;
    converted.array_filters = options.array_filters.clone();
    converted.hint = hint(&options.hint);
    converted
}

fn update_result(result: mongodb::results::UpdateResult) -> UpdateResult {
    UpdateResult {
        matched_count: result.matched_count,
        modified_count: result.modified_count,
        upserted_id: result.upserted_id,
    }
}

fn return_document(options: &FindOneAndModifyOptions) -> DriverReturnDocument {
    match options.return_document {
        ReturnDocument::Before => DriverReturnDocument::Before,
        ReturnDocument::After => DriverReturnDocument::After,
    }
}

async fn drain_session_cursor(
    mut cursor: SessionCursor<Document>,
    session: &mut mongodb::ClientSession,
) -> mongodb::error::Result<Vec<Document>> {
    let mut documents = Vec::new();
    while let Some(document) = cursor.next(session).await {
        documents.push(document?);
    }
    Ok(documents)
}

#[async_trait]
impl Collection for LiveCollection {
    fn namespace(&self) -> Namespace {
        Namespace::new(self.database.name(), self.inner.name())
    }

    async fn insert_one(
        &self,
        document: Document,
        session: Option<&dyn Session>,
    ) -> Result<InsertOneResult> {
        let result = with_session!(
            session,
            s => self.inner.insert_one_with_session(document, None, s),
            self.inner.insert_one(document, None)
        )?;
        Ok(InsertOneResult {
            inserted_id: result.inserted_id,
        })
    }

    async fn insert_many(
        &self,
        documents: Vec<Document>,
        options: InsertManyOptions,
        session: Option<&dyn Session>,
    ) -> Result<InsertManyResult> {
        if documents.is_empty() {
            return Err(Error::invalid_argument("documents must not be empty"));
        }
        let models = documents
            .into_iter()
            .map(|document| WriteModel::InsertOne {
                document: ensure_id(document),
            })
            .collect();
        let outcome = self
            .write(models, options.ordered.unwrap_or(true), session)
            .await?;
        let result = InsertManyResult {
            inserted_ids: outcome.result.inserted_ids.clone(),
        };
        if outcome.failed() {
            return Err(outcome.into_error(result.to_document()));
        }
        Ok(result)
    }

    async fn update_one(
        &self,
        filter: Document,
        update: UpdateModifications,
        options: UpdateOptions,
        session: Option<&dyn Session>,
    ) -> Result<UpdateResult> {
        let update = modifications(update);
        let options = update_options(&options);
        let result = with_session!(
            session,
            s => self.inner.update_one_with_session(filter, update, options, s),
            self.inner.update_one(filter, update, options)
        )?;
        Ok(update_result(result))
    }

    async fn update_many(
        &self,
        filter: Document,
        update: UpdateModifications,
        options: UpdateOptions,
        session: Option<&dyn Session>,
    ) -> Result<UpdateResult> {
        let update = modifications(update);
        let options = update_options(&options);
        let result = with_session!(
            session,
            s => self.inner.update_many_with_session(filter, update, options, s),
            self.inner.update_many(filter, update, options)
        )?;
        Ok(update_result(result))
    }

    async fn replace_one(
        &self,
        filter: Document,
        replacement: Document,
        options: UpdateOptions,
        session: Option<&dyn Session>,
    ) -> Result<UpdateResult> {
        let mut driver_options = mongodb::options::ReplaceOptions::default();
        driver_options.upsert = options.upsert;
        driver_options.hint = hint(&options.hint);
        let result = with_session!(
            session,
            s => self.inner.replace_one_with_session(filter, replacement, driver_options, s),
            self.inner.replace_one(filter, replacement, driver_options)
        )?;
        Ok(update_result(result))
    }

    async fn delete_one(
        &self,
        filter: Document,
        options: DeleteOptions,
        session: Option<&dyn Session>,
    ) -> Result<DeleteResult> {
        let mut driver_options = mongodb::options::DeleteOptions::default();
        driver_options.hint = hint(&options.hint);
        let result = with_session!(
            session,
            s => self.inner.delete_one_with_session(filter, driver_options, s),
            self.inner.delete_one(filter, driver_options)
        )?;
        Ok(DeleteResult {
            deleted_count: result.deleted_count,
        })
    }

    async fn delete_many(
        &self,
        filter: Document,
        options: DeleteOptions,
        session: Option<&dyn Session>,
    ) -> Result<DeleteResult> {
        let mut driver_options = mongodb::options::DeleteOptions::default();
        driver_options.hint = hint(&options.hint);
        let result = with_session!(
            session,
            s => self.inner.delete_many_with_session(filter, driver_options, s),
            self.inner.delete_many(filter, driver_options)
        )?;
        Ok(DeleteResult {
            deleted_count: result.deleted_count,
        })
    }

    async fn find(
        &self,
        filter: Document,
        options: FindOptions,
        session: Option<&dyn Session>,
    ) -> Result<Vec<Document>> {
        let mut driver_options = mongodb::options::FindOptions::default();
        driver_options.sort = options.sort;
        driver_options.projection = options.projection;
        driver_options.skip = options.skip;
        driver_options.limit = options.limit;
        driver_options.batch_size = options.batch_size;
        match session {
            Some(session) => {
                let live = LiveSession::from_dyn(session)?;
                let mut slot = live.slot.lock().await;
                let s = slot.as_mut().ok_or_else(ended)?;
                let documents = match self.inner.find_with_session(filter, driver_options, s).await {
                    Ok(cursor) => drain_session_cursor(cursor, s).await,
                    Err(e) => Err(e),
                };
                live.record(documents)
            }
            None => {
                let cursor = self
                    .inner
                    .find(filter, driver_options)
                    .await
                    .map_err(convert::error)?;
                cursor.try_collect().await.map_err(convert::error)
            }
        }
    }

    async fn aggregate(
        &self,
        pipeline: Vec<Document>,
        options: AggregateOptions,
        session: Option<&dyn Session>,
    ) -> Result<Vec<Document>> {
        let mut driver_options = mongodb::options::AggregateOptions::default();
        driver_options.batch_size = options.batch_size;
        driver_options.allow_disk_use = options.allow_disk_use;
        match session {
            Some(session) => {
                let live = LiveSession::from_dyn(session)?;
                let mut slot = live.slot.lock().await;
                let s = slot.as_mut().ok_or_else(ended)?;
                let documents =
                    match self.inner.aggregate_with_session(pipeline, driver_options, s).await {
                        Ok(cursor) => drain_session_cursor(cursor, s).await,
                        Err(e) => Err(e),
                    };
                live.record(documents)
            }
            None => {
                let cursor = self
                    .inner
                    .aggregate(pipeline, driver_options)
                    .await
                    .map_err(convert::error)?;
                cursor.try_collect().await.map_err(convert::error)
            }
        }
    }

    async fn distinct(
        &self,
        field: &str,
        filter: Document,
        session: Option<&dyn Session>,
    ) -> Result<Vec<Bson>> {
        with_session!(
            session,
            s => self.inner.distinct_with_session(field, filter, None, s),
            self.inner.distinct(field, filter, None)
        )
    }

    async fn count_documents(
        &self,
        filter: Document,
        options: CountOptions,
        session: Option<&dyn Session>,
    ) -> Result<u64> {
        let mut driver_options = mongodb::options::CountOptions::default();
        driver_options.skip = options.skip;
        driver_options.limit = options.limit;
        with_session!(
            session,
            s => self.inner.count_documents_with_session(filter, driver_options, s),
            self.inner.count_documents(filter, driver_options)
        )
    }

    async fn estimated_document_count(&self) -> Result<u64> {
        self.inner
            .estimated_document_count(None)
            .await
            .map_err(convert::error)
    }

    async fn find_one_and_update(
        &self,
        filter: Document,
        update: UpdateModifications,
        options: FindOneAndModifyOptions,
        session: Option<&dyn Session>,
    ) -> Result<Option<Document>> {
        let mut driver_options = mongodb::options::FindOneAndUpdateOptions::default();
        driver_options.sort = options.sort.clone();
        driver_options.projection = options.projection.clone();
        driver_options.upsert = options.upsert;
        driver_options.return_document = Some(return_document(&options));
        let update = modifications(update);
        with_session!(
            session,
            s => self.inner.find_one_and_update_with_session(filter, update, driver_options, s),
            self.inner.find_one_and_update(filter, update, driver_options)
        )
    }

    async fn find_one_and_replace(
        &self,
        filter: Document,
        replacement: Document,
        options: FindOneAndModifyOptions,
        session: Option<&dyn Session>,
    ) -> Result<Option<Document>> {
        let mut driver_options = mongodb::options::FindOneAndReplaceOptions::default();
        driver_options.sort = options.sort.clone();
        driver_options.projection = options.projection.clone();
        driver_options.upsert = options.upsert;
        driver_options.return_document = Some(return_document(&options));
        with_session!(
            session,
            s => self.inner.find_one_and_replace_with_session(filter, replacement, driver_options, s),
            self.inner.find_one_and_replace(filter, replacement, driver_options)
        )
    }

    async fn find_one_and_delete(
        &self,
        filter: Document,
        options: FindOneAndModifyOptions,
        session: Option<&dyn Session>,
    ) -> Result<Option<Document>> {
        let mut driver_options = mongodb::options::FindOneAndDeleteOptions::default();
        driver_options.sort = options.sort;
        driver_options.projection = options.projection;
        with_session!(
            session,
            s => self.inner.find_one_and_delete_with_session(filter, driver_options, s),
            self.inner.find_one_and_delete(filter, driver_options)
        )
    }

    async fn bulk_write(
        &self,
        requests: Vec<WriteModel>,
        options: BulkWriteOptions,
        session: Option<&dyn Session>,
    ) -> Result<BulkWriteResult> {
        if requests.is_empty() {
            return Err(Error::invalid_argument("requests must not be empty"));
        }
        let models = requests
            .into_iter()
            .map(|request| match request {
                WriteModel::InsertOne { document } => WriteModel::InsertOne {
                    document: ensure_id(document),
                },
                other => other,
            })
            .collect();
        let outcome = self
            .write(models, options.ordered.unwrap_or(true), session)
            .await?;
        if outcome.failed() {
            let partial = outcome.result.to_document();
            return Err(outcome.into_error(partial));
        }
        Ok(outcome.result)
    }

    async fn create_index(
        &self,
        keys: Document,
        options: IndexOptions,
        session: Option<&dyn Session>,
    ) -> Result<String> {
        let mut index_options = mongodb::options::IndexOptions::default();
        index_options.name = options.name;
        index_options.unique = options.unique;
        let mut model = mongodb::IndexModel::default();
        model.keys = keys;
        model.options = Some(index_options);
        let result = with_session!(
            session,
            s => self.inner.create_index_with_session(model, None, s),
            self.inner.create_index(model, None)
        )?;
        Ok(result.index_name)
    }

    async fn drop_index(&self, name: &str, session: Option<&dyn Session>) -> Result<()> {
        with_session!(
            session,
            s => self.inner.drop_index_with_session(name, None, s),
            self.inner.drop_index(name, None)
        )
    }

    async fn list_indexes(&self, session: Option<&dyn Session>) -> Result<Vec<Document>> {
        let command = doc! { "listIndexes": self.inner.name(), "cursor": {} };
        drain_command_cursor(&self.database, command, session).await
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

enum StreamInner {
    Implicit(DriverChangeStream<Document>),
    Explicit {
        stream: SessionChangeStream<Document>,
        session: SessionSlot,
    },
}

/// A change stream yielding raw event documents
pub struct LiveChangeStream {
    inner: tokio::sync::Mutex<StreamInner>,
}

impl LiveChangeStream {
    pub(crate) fn new(stream: DriverChangeStream<Document>) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(StreamInner::Implicit(stream)),
        }
    }

    pub(crate) fn with_session(stream: SessionChangeStream<Document>, session: SessionSlot) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(StreamInner::Explicit { stream, session }),
        }
    }

    pub(crate) fn driver_options(
        options: &ChangeStreamOptions,
    ) -> Result<mongodb::options::ChangeStreamOptions> {
        let mut converted = mongodb::options::ChangeStreamOptions::default();
        converted.batch_size = options.batch_size;
        converted.full_document = options
            .full_document
            .as_ref()
            .map(|mode| {
                bson::from_bson::<FullDocumentType>(Bson::String(mode.clone()))
                    .map_err(|e| Error::invalid_argument(format!("fullDocument '{}': {}", mode, e)))
            })
            .transpose()?;
        Ok(converted)
    }
}

#[async_trait]
impl ChangeStream for LiveChangeStream {
    async fn try_next(&mut self) -> Result<Option<Document>> {
        match self.inner.get_mut() {
            StreamInner::Implicit(stream) => stream.next_if_any().await.map_err(convert::error),
            StreamInner::Explicit { stream, session } => {
                let mut slot = session.lock().await;
                let session = slot.as_mut().ok_or_else(ended)?;
                stream.next_if_any(session).await.map_err(convert::error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statements_follow_the_write_command_format() {
        let update = statement(&WriteModel::UpdateMany {
            filter: doc! { "x": 1 },
            update: UpdateModifications::Document(doc! { "$inc": { "x": 1 } }),
            upsert: None,
        });
        assert_eq!(
            update,
            doc! { "q": { "x": 1 }, "u": { "$inc": { "x": 1 } }, "multi": true, "upsert": false }
        );
        let delete = statement(&WriteModel::DeleteOne { filter: doc! {} });
        assert_eq!(delete, doc! { "q": {}, "limit": 1 });
    }

    #[test]
    fn test_generated_ids_come_first() {
        let document = ensure_id(doc! { "x": 1 });
        assert_eq!(document.keys().next().map(String::as_str), Some("_id"));
        let kept = ensure_id(doc! { "x": 1, "_id": 5 });
        assert_eq!(kept.get_i32("_id").unwrap(), 5);
    }

    #[test]
    fn test_full_document_modes() {
        let options = ChangeStreamOptions {
            full_document: Some("updateLookup".to_string()),
            ..Default::default()
        };
        let converted = LiveChangeStream::driver_options(&options).unwrap();
        assert!(matches!(converted.full_document, Some(FullDocumentType::UpdateLookup)));
    }
}
