//! Collection handle: CRUD, bulk writes, indexes and change streams

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use std::sync::Arc;

use super::change_stream::{ChangeEvent, StreamScope};
use super::client::{ClientInner, CommandKind, CommandRequest};
use super::store::{IndexSpec, ServerState, TxnKey};
use super::{query, server_error, update};
use crate::driver::{ChangeStream, Collection, Session};
use crate::error::{BulkWriteFailure, CommandError, ErrorKind, IndexedWriteError};
use crate::options::*;
use crate::results::*;
use crate::types::Namespace;
use crate::{Error, Result};

/// What a single write statement did
#[derive(Debug, Default)]
struct WriteOutcome {
    inserted_id: Option<Bson>,
    matched: u64,
    modified: u64,
    deleted: u64,
    upserted_id: Option<Bson>,
}

/// Totals of a run of write commands, plus the statement-level failures
#[derive(Debug, Default)]
struct BulkOutcome {
    result: BulkWriteResult,
    errors: Vec<IndexedWriteError>,
}

impl BulkOutcome {
    fn absorb(&mut self, index: usize, outcome: WriteOutcome) {
        if let Some(id) = outcome.inserted_id {
            self.result.inserted_count += 1;
            self.result.inserted_ids.insert(index, id);
        }
        self.result.matched_count += outcome.matched;
        self.result.modified_count += outcome.modified;
        self.result.deleted_count += outcome.deleted;
        if let Some(id) = outcome.upserted_id {
            self.result.upserted_count += 1;
            self.result.upserted_ids.insert(index, id);
        }
    }

    fn into_error(self, partial_result: Document) -> Error {
        Error::new(ErrorKind::BulkWrite(BulkWriteFailure {
            write_errors: self.errors,
            write_concern_error: None,
            partial_result: Some(partial_result),
        }))
    }
}

fn indexed_error(index: usize, error: &Error) -> IndexedWriteError {
    IndexedWriteError {
        index,
        code: error.code().unwrap_or(8),
        code_name: error.code_name().unwrap_or_default().to_string(),
        message: error.message(),
    }
}

/// Turns the first write error of a single-statement write into an error
fn single_write_error(outcome: BulkOutcome) -> Error {
    match outcome.errors.into_iter().next() {
        Some(e) => Error::new(ErrorKind::Write(CommandError {
            code: e.code,
            code_name: e.code_name,
            message: e.message,
        })),
        None => Error::internal("write failed without a write error"),
    }
}

/// Statement document sent inside an `update` or `delete` command
fn statement(model: &WriteModel) -> Document {
    match model {
        WriteModel::InsertOne { document } => document.clone(),
        WriteModel::UpdateOne { filter, update, upsert }
        | WriteModel::UpdateMany { filter, update, upsert } => {
            let mut stmt = doc! { "q": filter.clone(), "u": update.to_bson() };
            if matches!(model, WriteModel::UpdateMany { .. }) {
                stmt.insert("multi", true);
            }
            if let Some(upsert) = upsert {
                stmt.insert("upsert", *upsert);
            }
            stmt
        }
        WriteModel::ReplaceOne { filter, replacement, upsert } => {
            let mut stmt = doc! { "q": filter.clone(), "u": replacement.clone() };
            if let Some(upsert) = upsert {
                stmt.insert("upsert", *upsert);
            }
            stmt
        }
        WriteModel::DeleteOne { filter } => doc! { "q": filter.clone(), "limit": 1 },
        WriteModel::DeleteMany { filter } => doc! { "q": filter.clone(), "limit": 0 },
    }
}

/// Applies one write statement to the collection as seen by `txn`
fn apply_write(state: &mut ServerState, ns: &Namespace, txn: Option<TxnKey>, model: &WriteModel) -> Result<WriteOutcome> {
    let mut outcome = WriteOutcome::default();
    let mut events = Vec::new();
    let creates = match model {
        WriteModel::InsertOne { .. } => true,
        WriteModel::UpdateOne { upsert, .. }
        | WriteModel::UpdateMany { upsert, .. }
        | WriteModel::ReplaceOne { upsert, .. } => upsert.unwrap_or(false),
        WriteModel::DeleteOne { .. } | WriteModel::DeleteMany { .. } => false,
    };
    if !creates && state.view(ns, txn).is_none() {
        return Ok(outcome);
    }
    let data = state.collection_mut(ns, txn)?;

    match model {
        WriteModel::InsertOne { document } => {
            data.insert(ns, document.clone())?;
            outcome.inserted_id = document.get("_id").cloned();
            events.push(ChangeEvent::insert(ns, document));
        }
        WriteModel::UpdateOne { filter, upsert, .. }
        | WriteModel::UpdateMany { filter, upsert, .. }
        | WriteModel::ReplaceOne { filter, upsert, .. } => {
            let positions = match model {
                WriteModel::UpdateMany { .. } => data.positions_matching(filter)?,
                _ => data.position_of(filter, None)?.into_iter().collect(),
            };
            outcome.matched = positions.len() as u64;
            for pos in positions {
                let before = data.documents[pos].clone();
                let after = match model {
                    WriteModel::ReplaceOne { replacement, .. } => update::apply_replacement(&before, replacement)?,
                    WriteModel::UpdateOne { update, .. } | WriteModel::UpdateMany { update, .. } => {
                        update::apply_update(&before, update, false)?
                    }
                    _ => before.clone(),
                };
                if after != before {
                    data.check_unique(ns, &after, Some(pos))?;
                    data.documents[pos] = after.clone();
                    outcome.modified += 1;
                    events.push(match model {
                        WriteModel::ReplaceOne { .. } => ChangeEvent::replace(ns, &after),
                        _ => ChangeEvent::update(ns, &before, &after),
                    });
                }
            }
            if outcome.matched == 0 && upsert.unwrap_or(false) {
                let seed = update::upsert_seed(filter)?;
                let inserted = match model {
                    WriteModel::ReplaceOne { replacement, .. } => {
                        let mut base = Document::new();
                        if let Some(id) = seed.get("_id") {
                            base.insert("_id", id.clone());
                        }
                        update::apply_replacement(&base, replacement)?
                    }
                    WriteModel::UpdateOne { update, .. } | WriteModel::UpdateMany { update, .. } => {
                        update::apply_update(&seed, update, true)?
                    }
                    _ => seed,
                };
                let inserted = update::ensure_id(inserted);
                data.insert(ns, inserted.clone())?;
                outcome.upserted_id = inserted.get("_id").cloned();
                events.push(ChangeEvent::insert(ns, &inserted));
            }
        }
        WriteModel::DeleteOne { filter } | WriteModel::DeleteMany { filter } => {
            let positions = match model {
                WriteModel::DeleteMany { .. } => data.positions_matching(filter)?,
                _ => data.position_of(filter, None)?.into_iter().collect(),
            };
            for pos in positions.into_iter().rev() {
                let removed = data.documents.remove(pos);
                outcome.deleted += 1;
                events.push(ChangeEvent::delete(ns, &removed));
            }
        }
    }

    for event in events {
        state.record_change(txn, event);
    }
    Ok(outcome)
}

fn write_reply(command_name: &str, outcome: &BulkOutcome, n: u64, upserted: &[(usize, Bson)]) -> Document {
    let mut reply = doc! { "n": n as i32 };
    if command_name == "update" {
        reply.insert("nModified", outcome.result.modified_count as i32);
        if !upserted.is_empty() {
            let upserted: Vec<Document> = upserted
                .iter()
                .map(|(index, id)| doc! { "index": *index as i32, "_id": id.clone() })
                .collect();
            reply.insert("upserted", upserted);
        }
    }
    if !outcome.errors.is_empty() {
        let errors: Vec<Document> = outcome
            .errors
            .iter()
            .map(|e| doc! { "index": e.index as i32, "code": e.code, "errmsg": e.message.clone() })
            .collect();
        reply.insert("writeErrors", errors);
    }
    reply.insert("ok", 1.0);
    reply
}

fn find_matching(state: &ServerState, ns: &Namespace, txn: Option<TxnKey>, filter: &Document) -> Result<Vec<Document>> {
    let mut found = Vec::new();
    if let Some(data) = state.view(ns, txn) {
        for document in &data.documents {
            if query::matches(document, filter)? {
                found.push(document.clone());
            }
        }
    }
    Ok(found)
}

pub(crate) struct MemoryCollection {
    client: Arc<ClientInner>,
    ns: Namespace,
    options: NamespaceOptions,
}

impl MemoryCollection {
    pub fn new(client: Arc<ClientInner>, ns: Namespace, options: NamespaceOptions) -> Self {
        Self { client, ns, options }
    }

    fn request<'a>(
        &'a self,
        command: Document,
        kind: CommandKind,
        session: Option<&'a dyn Session>,
    ) -> CommandRequest<'a> {
        CommandRequest {
            db: &self.ns.db,
            command,
            kind,
            options: &self.options,
            session,
            target: None,
        }
    }

    /// Sends `models` as a sequence of insert/update/delete commands, one per
    /// run of statements of the same kind. Ordered writes stop at the first
    /// batch reporting a write error.
    fn write_batches(
        &self,
        models: Vec<WriteModel>,
        ordered: bool,
        session: Option<&dyn Session>,
    ) -> Result<BulkOutcome> {
        let mut total = BulkOutcome::default();
        let mut start = 0;
        while start < models.len() {
            let command_name = models[start].command_name();
            let end = models[start..]
                .iter()
                .position(|m| m.command_name() != command_name)
                .map(|p| start + p)
                .unwrap_or(models.len());
            let batch: Vec<(usize, WriteModel)> = (start..end).zip(models[start..end].iter().cloned()).collect();
            let failed = self.write_batch(command_name, batch, ordered, session, &mut total)?;
            if failed && ordered {
                break;
            }
            start = end;
        }
        Ok(total)
    }

    fn write_batch(
        &self,
        command_name: &'static str,
        batch: Vec<(usize, WriteModel)>,
        ordered: bool,
        session: Option<&dyn Session>,
        total: &mut BulkOutcome,
    ) -> Result<bool> {
        let statements: Vec<Document> = batch.iter().map(|(_, m)| statement(m)).collect();
        let field = match command_name {
            "insert" => "documents",
            "update" => "updates",
            _ => "deletes",
        };
        let mut command = Document::new();
        command.insert(command_name, self.ns.coll.clone());
        command.insert(field, statements);
        command.insert("ordered", ordered);

        let ns = self.ns.clone();
        let outcome = self.client.execute(
            self.request(command, CommandKind::Write, session),
            |state, route| {
                let mut outcome = BulkOutcome::default();
                let mut n = 0;
                let mut upserted = Vec::new();
                for (index, model) in &batch {
                    match apply_write(state, &ns, route.txn, model) {
                        Ok(done) => {
                            n += match command_name {
                                "insert" => 1,
                                "update" => done.matched + u64::from(done.upserted_id.is_some()),
                                _ => done.deleted,
                            };
                            if let Some(id) = &done.upserted_id {
                                upserted.push((*index, id.clone()));
                            }
                            outcome.absorb(*index, done);
                        }
                        Err(error) if error.is_client_error() => return Err(error),
                        Err(error) => {
                            outcome.errors.push(indexed_error(*index, &error));
                            if ordered {
                                break;
                            }
                        }
                    }
                }
                let reply = write_reply(command_name, &outcome, n, &upserted);
                Ok((outcome, reply))
            },
        )?;

        let failed = !outcome.errors.is_empty();
        let BulkOutcome { result, errors } = outcome;
        total.result.inserted_count += result.inserted_count;
        total.result.matched_count += result.matched_count;
        total.result.modified_count += result.modified_count;
        total.result.deleted_count += result.deleted_count;
        total.result.upserted_count += result.upserted_count;
        total.result.inserted_ids.extend(result.inserted_ids);
        total.result.upserted_ids.extend(result.upserted_ids);
        total.errors.extend(errors);
        Ok(failed)
    }

    fn update_with(
        &self,
        model: WriteModel,
        session: Option<&dyn Session>,
    ) -> Result<UpdateResult> {
        let outcome = self.write_batches(vec![model], true, session)?;
        if !outcome.errors.is_empty() {
            return Err(single_write_error(outcome));
        }
        Ok(UpdateResult {
            matched_count: outcome.result.matched_count,
            modified_count: outcome.result.modified_count,
            upserted_id: outcome.result.upserted_ids.get(&0).cloned(),
        })
    }

    fn delete_with(&self, model: WriteModel, session: Option<&dyn Session>) -> Result<DeleteResult> {
        let outcome = self.write_batches(vec![model], true, session)?;
        if !outcome.errors.is_empty() {
            return Err(single_write_error(outcome));
        }
        Ok(DeleteResult {
            deleted_count: outcome.result.deleted_count,
        })
    }

    /// Shared implementation of the findAndModify family
    fn find_and_modify(
        &self,
        filter: Document,
        action: FindAndModifyAction,
        options: FindOneAndModifyOptions,
        session: Option<&dyn Session>,
    ) -> Result<Option<Document>> {
        let mut command = doc! { "findAndModify": self.ns.coll.clone(), "query": filter.clone() };
        if let Some(sort) = &options.sort {
            command.insert("sort", sort.clone());
        }
        if let Some(projection) = &options.projection {
            command.insert("fields", projection.clone());
        }
        let return_after = options.return_document == ReturnDocument::After;
        let upsert = options.upsert.unwrap_or(false);
        match &action {
            FindAndModifyAction::Remove => {
                command.insert("remove", true);
            }
            FindAndModifyAction::Update(update) => {
                command.insert("update", update.to_bson());
            }
            FindAndModifyAction::Replace(replacement) => {
                command.insert("update", replacement.clone());
            }
        }
        if !matches!(action, FindAndModifyAction::Remove) {
            command.insert("new", return_after);
            if options.upsert.is_some() {
                command.insert("upsert", upsert);
            }
        }

        let ns = self.ns.clone();
        self.client
            .execute(self.request(command, CommandKind::Write, session), |state, route| {
                let position = match state.view(&ns, route.txn) {
                    Some(data) => data.position_of(&filter, options.sort.as_ref())?,
                    None => None,
                };
                let mut last_error = doc! { "n": 0 };
                let value = match (&action, position) {
                    (FindAndModifyAction::Remove, Some(pos)) => {
                        let data = state.collection_mut(&ns, route.txn)?;
                        let removed = data.documents.remove(pos);
                        state.record_change(route.txn, ChangeEvent::delete(&ns, &removed));
                        last_error = doc! { "n": 1 };
                        Some(removed)
                    }
                    (FindAndModifyAction::Remove, None) => None,
                    (_, Some(pos)) => {
                        let data = state.collection_mut(&ns, route.txn)?;
                        let before = data.documents[pos].clone();
                        let after = match &action {
                            FindAndModifyAction::Update(update) => update::apply_update(&before, update, false)?,
                            FindAndModifyAction::Replace(replacement) => update::apply_replacement(&before, replacement)?,
                            FindAndModifyAction::Remove => before.clone(),
                        };
                        data.check_unique(&ns, &after, Some(pos))?;
                        data.documents[pos] = after.clone();
                        let event = match &action {
                            FindAndModifyAction::Replace(_) => ChangeEvent::replace(&ns, &after),
                            _ => ChangeEvent::update(&ns, &before, &after),
                        };
                        if after != before {
                            state.record_change(route.txn, event);
                        }
                        last_error = doc! { "n": 1, "updatedExisting": true };
                        Some(if return_after { after } else { before })
                    }
                    (_, None) if upsert => {
                        let seed = update::upsert_seed(&filter)?;
                        let inserted = match &action {
                            FindAndModifyAction::Update(update) => update::apply_update(&seed, update, true)?,
                            FindAndModifyAction::Replace(replacement) => {
                                let mut base = Document::new();
                                if let Some(id) = seed.get("_id") {
                                    base.insert("_id", id.clone());
                                }
                                update::apply_replacement(&base, replacement)?
                            }
                            FindAndModifyAction::Remove => seed,
                        };
                        let inserted = update::ensure_id(inserted);
                        state.collection_mut(&ns, route.txn)?.insert(&ns, inserted.clone())?;
                        state.record_change(route.txn, ChangeEvent::insert(&ns, &inserted));
                        last_error = doc! {
                            "n": 1,
                            "updatedExisting": false,
                            "upserted": inserted.get("_id").cloned().unwrap_or(Bson::Null),
                        };
                        return_after.then_some(inserted)
                    }
                    (_, None) => None,
                };
                let value = match (value, &options.projection) {
                    (Some(document), Some(projection)) => Some(query::project(&document, projection)?),
                    (value, _) => value,
                };
                let reply = doc! {
                    "lastErrorObject": last_error,
                    "value": value.clone().map(Bson::Document).unwrap_or(Bson::Null),
                    "ok": 1.0,
                };
                Ok((value, reply))
            })
    }
}

enum FindAndModifyAction {
    Update(UpdateModifications),
    Replace(Document),
    Remove,
}

#[async_trait]
impl Collection for MemoryCollection {
    fn namespace(&self) -> Namespace {
        self.ns.clone()
    }

    async fn insert_one(&self, document: Document, session: Option<&dyn Session>) -> Result<InsertOneResult> {
        let document = update::ensure_id(document);
        let inserted_id = document.get("_id").cloned().unwrap_or(Bson::Null);
        let outcome = self.write_batches(vec![WriteModel::InsertOne { document }], true, session)?;
        if !outcome.errors.is_empty() {
            return Err(single_write_error(outcome));
        }
        Ok(InsertOneResult { inserted_id })
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
        let models: Vec<WriteModel> = documents
            .into_iter()
            .map(|document| WriteModel::InsertOne {
                document: update::ensure_id(document),
            })
            .collect();
        let outcome = self.write_batches(models, options.ordered.unwrap_or(true), session)?;
        let result = InsertManyResult {
            inserted_ids: outcome.result.inserted_ids.clone(),
        };
        if !outcome.errors.is_empty() {
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
        update::validate_update(&update)?;
        self.update_with(
            WriteModel::UpdateOne {
                filter,
                update,
                upsert: options.upsert,
            },
            session,
        )
    }

    async fn update_many(
        &self,
        filter: Document,
        update: UpdateModifications,
        options: UpdateOptions,
        session: Option<&dyn Session>,
    ) -> Result<UpdateResult> {
        update::validate_update(&update)?;
        self.update_with(
            WriteModel::UpdateMany {
                filter,
                update,
                upsert: options.upsert,
            },
            session,
        )
    }

    async fn replace_one(
        &self,
        filter: Document,
        replacement: Document,
        options: UpdateOptions,
        session: Option<&dyn Session>,
    ) -> Result<UpdateResult> {
        update::validate_replacement(&replacement)?;
        self.update_with(
            WriteModel::ReplaceOne {
                filter,
                replacement,
                upsert: options.upsert,
            },
            session,
        )
    }

    async fn delete_one(
        &self,
        filter: Document,
        _options: DeleteOptions,
        session: Option<&dyn Session>,
    ) -> Result<DeleteResult> {
        self.delete_with(WriteModel::DeleteOne { filter }, session)
    }

    async fn delete_many(
        &self,
        filter: Document,
        _options: DeleteOptions,
        session: Option<&dyn Session>,
    ) -> Result<DeleteResult> {
        self.delete_with(WriteModel::DeleteMany { filter }, session)
    }

    async fn find(
        &self,
        filter: Document,
        options: FindOptions,
        session: Option<&dyn Session>,
    ) -> Result<Vec<Document>> {
        let mut command = doc! { "find": self.ns.coll.clone(), "filter": filter.clone() };
        if let Some(sort) = &options.sort {
            command.insert("sort", sort.clone());
        }
        if let Some(projection) = &options.projection {
            command.insert("projection", projection.clone());
        }
        if let Some(skip) = options.skip {
            command.insert("skip", skip as i64);
        }
        if let Some(limit) = options.limit {
            command.insert("limit", limit);
        }
        if let Some(batch_size) = options.batch_size {
            command.insert("batchSize", batch_size as i32);
        }

        let ns = self.ns.clone();
        self.client.execute_cursor(
            self.request(command, CommandKind::Read, session),
            &self.ns.coll,
            options.batch_size,
            |state, route| {
                let mut found = find_matching(state, &ns, route.txn, &filter)?;
                if let Some(sort) = &options.sort {
                    query::sort_documents(&mut found, sort);
                }
                let skip = options.skip.unwrap_or(0) as usize;
                let mut found: Vec<Document> = found.into_iter().skip(skip).collect();
                if let Some(limit) = options.limit.filter(|l| *l != 0) {
                    found.truncate(limit.unsigned_abs() as usize);
                }
                match &options.projection {
                    Some(projection) => found.iter().map(|d| query::project(d, projection)).collect(),
                    None => Ok(found),
                }
            },
        )
    }

    async fn aggregate(
        &self,
        pipeline: Vec<Document>,
        options: AggregateOptions,
        session: Option<&dyn Session>,
    ) -> Result<Vec<Document>> {
        let mut cursor = Document::new();
        if let Some(batch_size) = options.batch_size {
            cursor.insert("batchSize", batch_size as i32);
        }
        let mut command = doc! {
            "aggregate": self.ns.coll.clone(),
            "pipeline": pipeline.clone(),
            "cursor": cursor,
        };
        if let Some(allow) = options.allow_disk_use {
            command.insert("allowDiskUse", allow);
        }

        let ns = self.ns.clone();
        self.client.execute_cursor(
            self.request(command, CommandKind::Read, session),
            &self.ns.coll,
            options.batch_size,
            |state, route| {
                let documents = state
                    .view(&ns, route.txn)
                    .map(|data| data.documents.clone())
                    .unwrap_or_default();
                query::run_pipeline(documents, &pipeline)
            },
        )
    }

    async fn distinct(
        &self,
        field: &str,
        filter: Document,
        session: Option<&dyn Session>,
    ) -> Result<Vec<Bson>> {
        let command = doc! { "distinct": self.ns.coll.clone(), "key": field, "query": filter.clone() };
        let ns = self.ns.clone();
        self.client
            .execute(self.request(command, CommandKind::Read, session), |state, route| {
                let found = find_matching(state, &ns, route.txn, &filter)?;
                let values = query::distinct_values(found.iter(), field);
                let reply = doc! { "values": values.clone(), "ok": 1.0 };
                Ok((values, reply))
            })
    }

    async fn count_documents(
        &self,
        filter: Document,
        options: CountOptions,
        session: Option<&dyn Session>,
    ) -> Result<u64> {
        let mut pipeline = vec![doc! { "$match": filter.clone() }];
        if let Some(skip) = options.skip {
            pipeline.push(doc! { "$skip": skip as i64 });
        }
        if let Some(limit) = options.limit {
            pipeline.push(doc! { "$limit": limit as i64 });
        }
        pipeline.push(doc! { "$group": { "_id": 1, "n": { "$sum": 1 } } });
        let command = doc! { "aggregate": self.ns.coll.clone(), "pipeline": pipeline, "cursor": {} };

        let ns = self.ns.clone();
        let cursor_ns = self.ns.to_string();
        self.client
            .execute(self.request(command, CommandKind::Read, session), |state, route| {
                let found = find_matching(state, &ns, route.txn, &filter)?;
                let skipped = found.len().saturating_sub(options.skip.unwrap_or(0) as usize);
                let n = match options.limit {
                    Some(limit) if limit > 0 => skipped.min(limit as usize),
                    _ => skipped,
                } as u64;
                let batch = if n == 0 { Vec::new() } else { vec![doc! { "_id": 1, "n": n as i32 }] };
                let reply = super::client::cursor_reply(&cursor_ns, 0, "firstBatch", &batch);
                Ok((n, reply))
            })
    }

    async fn estimated_document_count(&self) -> Result<u64> {
        let command = doc! { "count": self.ns.coll.clone() };
        let ns = self.ns.clone();
        self.client
            .execute(self.request(command, CommandKind::Read, None), |state, _| {
                let n = state.store.get(&ns).map(|data| data.documents.len()).unwrap_or(0) as u64;
                Ok((n, doc! { "n": n as i32, "ok": 1.0 }))
            })
    }

    async fn find_one_and_update(
        &self,
        filter: Document,
        update: UpdateModifications,
        options: FindOneAndModifyOptions,
        session: Option<&dyn Session>,
    ) -> Result<Option<Document>> {
        update::validate_update(&update)?;
        self.find_and_modify(filter, FindAndModifyAction::Update(update), options, session)
    }

    async fn find_one_and_replace(
        &self,
        filter: Document,
        replacement: Document,
        options: FindOneAndModifyOptions,
        session: Option<&dyn Session>,
    ) -> Result<Option<Document>> {
        update::validate_replacement(&replacement)?;
        self.find_and_modify(filter, FindAndModifyAction::Replace(replacement), options, session)
    }

    async fn find_one_and_delete(
        &self,
        filter: Document,
        options: FindOneAndModifyOptions,
        session: Option<&dyn Session>,
    ) -> Result<Option<Document>> {
        self.find_and_modify(filter, FindAndModifyAction::Remove, options, session)
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
        for request in &requests {
            match request {
                WriteModel::UpdateOne { update, .. } | WriteModel::UpdateMany { update, .. } => {
                    update::validate_update(update)?
                }
                WriteModel::ReplaceOne { replacement, .. } => update::validate_replacement(replacement)?,
                _ => {}
            }
        }
        let models: Vec<WriteModel> = requests
            .into_iter()
            .map(|request| match request {
                WriteModel::InsertOne { document } => WriteModel::InsertOne {
                    document: update::ensure_id(document),
                },
                other => other,
            })
            .collect();
        let outcome = self.write_batches(models, options.ordered.unwrap_or(true), session)?;
        if !outcome.errors.is_empty() {
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
        if keys.is_empty() {
            return Err(Error::invalid_argument("index keys must not be empty"));
        }
        let spec = IndexSpec {
            name: options.name.clone().unwrap_or_else(|| IndexSpec::default_name(&keys)),
            keys,
            unique: options.unique.unwrap_or(false),
        };
        let mut index = doc! { "key": spec.keys.clone(), "name": spec.name.clone() };
        if spec.unique {
            index.insert("unique", true);
        }
        let command = doc! { "createIndexes": self.ns.coll.clone(), "indexes": [index] };

        let ns = self.ns.clone();
        self.client
            .execute(self.request(command, CommandKind::Write, session), |state, route| {
                let created_collection = state.view(&ns, route.txn).is_none();
                let data = state.collection_mut(&ns, route.txn)?;
                let before = data.indexes.len() as i32;
                let same_spec = data
                    .indexes
                    .iter()
                    .find(|i| i.name == spec.name)
                    .map(|existing| existing.keys == spec.keys && existing.unique == spec.unique);
                match same_spec {
                    Some(true) => {}
                    Some(false) => {
                        return Err(server_error(
                            86,
                            format!("An existing index has the same name as the requested index: {}", spec.name),
                        ))
                    }
                    None => {
                        if spec.unique {
                            let mut scratch = super::store::CollectionData {
                                documents: Vec::new(),
                                indexes: vec![spec.clone()],
                            };
                            for document in &data.documents {
                                scratch.insert(&ns, document.clone())?;
                            }
                        }
                        data.indexes.push(spec.clone());
                    }
                }
                let reply = doc! {
                    "createdCollectionAutomatically": created_collection,
                    "numIndexesBefore": before,
                    "numIndexesAfter": data.indexes.len() as i32,
                    "ok": 1.0,
                };
                Ok((spec.name.clone(), reply))
            })
    }

    async fn drop_index(&self, name: &str, session: Option<&dyn Session>) -> Result<()> {
        let command = doc! { "dropIndexes": self.ns.coll.clone(), "index": name };
        let ns = self.ns.clone();
        self.client
            .execute(self.request(command, CommandKind::Write, session), |state, route| {
                if state.view(&ns, route.txn).is_none() {
                    return Err(server_error(26, format!("ns not found {}", ns)));
                }
                if name == "_id_" {
                    return Err(server_error(72, "cannot drop _id index"));
                }
                let data = state.collection_mut(&ns, route.txn)?;
                let before = data.indexes.len();
                data.indexes.retain(|i| i.name != name);
                if data.indexes.len() == before {
                    return Err(server_error(27, format!("index not found with name [{}]", name)));
                }
                Ok(((), doc! { "nIndexesWas": before as i32, "ok": 1.0 }))
            })
    }

    async fn list_indexes(&self, session: Option<&dyn Session>) -> Result<Vec<Document>> {
        let command = doc! { "listIndexes": self.ns.coll.clone(), "cursor": {} };
        let ns = self.ns.clone();
        self.client.execute_cursor(
            self.request(command, CommandKind::Read, session),
            &self.ns.coll,
            None,
            |state, route| match state.view(&ns, route.txn) {
                Some(data) => Ok(data.indexes.iter().map(IndexSpec::to_document).collect()),
                None => Err(server_error(26, format!("ns does not exist: {}", ns))),
            },
        )
    }

    async fn watch(
        &self,
        pipeline: Vec<Document>,
        options: ChangeStreamOptions,
        session: Option<&dyn Session>,
    ) -> Result<Box<dyn ChangeStream>> {
        self.client.open_change_stream(
            &self.ns.db,
            Bson::String(self.ns.coll.clone()),
            StreamScope::Collection(self.ns.clone()),
            pipeline,
            options,
            session,
        )
    }
}
