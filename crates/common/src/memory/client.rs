//! Client handle: server selection, session bookkeeping and command dispatch

use async_trait::async_trait;
use bson::{doc, spec::BinarySubtype, Binary, Bson, Document};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::change_stream::{MemoryChangeStream, StreamScope};
use super::database::MemoryDatabase;
use super::session::MemorySession;
use super::store::{ServerState, TxnKey, TxnWorkspace};
use super::{query, server_error, Shared};
use crate::driver::{ChangeStream, Client, Database, Session};
use crate::error::TRANSIENT_TRANSACTION_ERROR;
use crate::event::{CommandEvent, CommandFailedEvent, CommandStartedEvent, CommandSucceededEvent};
use crate::options::{ChangeStreamOptions, ClientOptions, DatabaseOptions, NamespaceOptions, SessionOptions};
use crate::types::{DeploymentInfo, ServerAddress, TopologyType, TransactionState};
use crate::{Error, Result};

/// Server-side half of a logical session, pooled by the client
#[derive(Debug, Clone)]
pub(crate) struct ServerSession {
    pub key: Uuid,
    pub lsid: Document,
    pub txn_number: i64,
}

impl ServerSession {
    fn new() -> Self {
        let key = Uuid::new_v4();
        let lsid = doc! {
            "id": Binary { subtype: BinarySubtype::Uuid, bytes: key.as_bytes().to_vec() },
        };
        Self {
            key,
            lsid,
            txn_number: 0,
        }
    }
}

/// How a command interacts with read and write concerns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommandKind {
    Read,
    Write,
    Command,
}

pub(crate) struct CommandRequest<'a> {
    pub db: &'a str,
    pub command: Document,
    pub kind: CommandKind,
    pub options: &'a NamespaceOptions,
    pub session: Option<&'a dyn Session>,
    /// Bypasses server selection
    pub target: Option<ServerAddress>,
}

/// Where a command ended up and which transaction it runs in
#[derive(Debug, Clone)]
pub(crate) struct Route {
    pub server: ServerAddress,
    pub txn: Option<TxnKey>,
}

pub(crate) struct ClientInner {
    pub shared: Arc<Shared>,
    pub options: ClientOptions,
    hosts: Vec<ServerAddress>,
    next_host: AtomicUsize,
    pool: Mutex<Vec<ServerSession>>,
    closed: AtomicBool,
}

impl ClientInner {
    pub fn select_server(&self, target: Option<ServerAddress>) -> ServerAddress {
        if let Some(target) = target {
            return target;
        }
        let index = match self.shared.topology() {
            TopologyType::Sharded => self.next_host.fetch_add(1, Ordering::SeqCst) % self.hosts.len(),
            _ => 0,
        };
        self.hosts[index].clone()
    }

    pub fn checkout_session(&self) -> ServerSession {
        self.pool.lock().pop().unwrap_or_else(ServerSession::new)
    }

    pub fn checkin_session(&self, session: ServerSession) {
        self.pool.lock().push(session);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::internal("client has been shut down"));
        }
        Ok(())
    }

    fn resolve_session<'a>(self: &Arc<Self>, session: &'a dyn Session) -> Result<&'a MemorySession> {
        let memory = session
            .as_any()
            .downcast_ref::<MemorySession>()
            .ok_or_else(|| Error::invalid_argument("session was not created by an in-memory client"))?;
        if !Arc::ptr_eq(&memory.client, self) {
            return Err(Error::invalid_argument(
                "the session provided to an operation must be created from the same client",
            ));
        }
        if memory.has_ended() {
            return Err(Error::invalid_argument("Attempted to use an ended session"));
        }
        Ok(memory)
    }

    fn emit(&self, event: CommandEvent) {
        if let Some(handler) = &self.options.command_event_handler {
            handler.handle_command_event(event);
        }
    }

    /// Sends an already-decorated command to `server`, publishing command
    /// monitoring events around it.
    pub fn dispatch<T>(
        &self,
        server: &ServerAddress,
        db: &str,
        command: Document,
        op: impl FnOnce(&mut ServerState) -> Result<(T, Document)>,
    ) -> Result<T> {
        let command_name = command.keys().next().cloned().unwrap_or_default();
        let request_id = self.shared.next_request_id();
        debug!("Sending {} (request {}) to {}", command_name, request_id, server);

        self.emit(CommandEvent::Started(CommandStartedEvent {
            command,
            database_name: db.to_string(),
            command_name: command_name.clone(),
            request_id,
            connection: server.clone(),
        }));

        let started = Instant::now();
        let outcome = {
            let mut state = self.shared.state.lock();
            match state
                .fail_points
                .trigger(server, &command_name, self.options.app_name.as_deref())
            {
                Some(failure) => Err(failure),
                None => op(&mut state),
            }
        };
        let duration = started.elapsed();

        match outcome {
            Ok((value, reply)) => {
                self.emit(CommandEvent::Succeeded(CommandSucceededEvent {
                    reply,
                    command_name,
                    duration,
                    request_id,
                    connection: server.clone(),
                }));
                Ok(value)
            }
            Err(error) => {
                debug!("{} (request {}) failed: {}", command_name, request_id, error);
                self.emit(CommandEvent::Failed(CommandFailedEvent {
                    failure: error.clone(),
                    command_name,
                    duration,
                    request_id,
                    connection: server.clone(),
                }));
                Err(error)
            }
        }
    }

    /// Runs a command on behalf of an operation: attaches the session and
    /// transaction fields, selects (or reuses the pinned) server and keeps the
    /// session state in step with the outcome.
    pub fn execute<T>(
        self: &Arc<Self>,
        request: CommandRequest<'_>,
        op: impl FnOnce(&mut ServerState, &Route) -> Result<(T, Document)>,
    ) -> Result<T> {
        self.ensure_open()?;
        let explicit = match request.session {
            Some(session) => Some(self.resolve_session(session)?),
            None => None,
        };

        let mut command = request.command;
        let mut implicit = None;
        let mut txn: Option<(TxnKey, bool)> = None;
        let server = match explicit {
            Some(session) => {
                let mut core = session.core.lock();
                command.insert("lsid", core.server_session.lsid.clone());
                if core.state.is_active() {
                    let starting = core.state == TransactionState::Starting;
                    let txn_number = core.server_session.txn_number;
                    command.insert("txnNumber", Bson::Int64(txn_number));
                    if starting {
                        command.insert("startTransaction", true);
                        if let Some(read_concern) =
                            core.txn_options.as_ref().and_then(|o| o.read_concern.as_ref())
                        {
                            command.insert("readConcern", read_concern.to_document());
                        }
                    }
                    command.insert("autocommit", false);

                    let server = match &core.pinned {
                        Some(pinned) => pinned.clone(),
                        None => self.select_server(request.target.clone()),
                    };
                    if starting && self.shared.topology() == TopologyType::Sharded {
                        core.pinned = Some(server.clone());
                    }
                    core.state = TransactionState::InProgress;
                    txn = Some((
                        TxnKey {
                            session: core.server_session.key,
                            txn_number,
                        },
                        starting,
                    ));
                    server
                } else {
                    if matches!(core.state, TransactionState::Committed | TransactionState::Aborted) {
                        core.state = TransactionState::None;
                    }
                    core.pinned = None;
                    apply_concerns(&mut command, request.kind, request.options);
                    self.select_server(request.target.clone())
                }
            }
            None => {
                let server_session = self.checkout_session();
                command.insert("lsid", server_session.lsid.clone());
                implicit = Some(server_session);
                apply_concerns(&mut command, request.kind, request.options);
                self.select_server(request.target.clone())
            }
        };

        let route = Route {
            server: server.clone(),
            txn: txn.map(|(key, _)| key),
        };
        let topology = self.shared.topology();
        let mut result = self.dispatch(&server, request.db, command, |state| {
            if let Some((key, starting)) = txn {
                if topology == TopologyType::Single {
                    return Err(server_error(
                        20,
                        "Transaction numbers are only allowed on a replica set member or mongos",
                    ));
                }
                if starting {
                    state.transactions.insert(key.session, TxnWorkspace::new(key.txn_number));
                } else {
                    state.require_transaction(key)?;
                }
            }
            let outcome = op(state, &route);
            if let Some((key, _)) = txn {
                let failed = match &outcome {
                    Err(_) => true,
                    Ok((_, reply)) => reply.contains_key("writeErrors"),
                };
                let open = state.transactions.get(&key.session).map(|ws| ws.txn_number);
                if failed && open == Some(key.txn_number) {
                    state.transactions.remove(&key.session);
                }
            }
            outcome
        });

        let mut dirty = false;
        if let Err(error) = &mut result {
            dirty = error.is_network_error();
            if txn.is_some() && dirty {
                error.add_label(TRANSIENT_TRANSACTION_ERROR);
            }
            if let Some(session) = explicit {
                let mut core = session.core.lock();
                core.dirty |= dirty;
                if txn.is_some() && error.contains_label(TRANSIENT_TRANSACTION_ERROR) {
                    core.pinned = None;
                }
            }
        }
        if let Some(server_session) = implicit {
            if !dirty {
                self.checkin_session(server_session);
            }
        }
        result
    }

    /// Runs a cursor-returning command, fetching any further batches with
    /// `getMore` so the caller sees the fully drained cursor.
    pub fn execute_cursor(
        self: &Arc<Self>,
        request: CommandRequest<'_>,
        collection: &str,
        batch_size: Option<u32>,
        op: impl FnOnce(&mut ServerState, &Route) -> Result<Vec<Document>>,
    ) -> Result<Vec<Document>> {
        let db = request.db.to_string();
        let session = request.session;
        let options = request.options;
        let target = request.target.clone();
        let ns = format!("{}.{}", db, collection);
        let batch = batch_size.filter(|n| *n > 0).map(|n| n as usize);
        let cursor_id = self.shared.next_cursor_id();

        let (mut documents, mut rest) = self.execute(request, |state, route| {
            let mut all = op(state, route)?;
            let rest = match batch {
                Some(n) if all.len() > n => all.split_off(n),
                _ => Vec::new(),
            };
            let id = if rest.is_empty() { 0 } else { cursor_id };
            let reply = cursor_reply(&ns, id, "firstBatch", &all);
            Ok(((all, rest), reply))
        })?;

        while !rest.is_empty() {
            let size = batch.unwrap_or(rest.len());
            let remaining = if rest.len() > size { rest.split_off(size) } else { Vec::new() };
            let chunk = std::mem::replace(&mut rest, remaining);
            let id = if rest.is_empty() { 0 } else { cursor_id };
            let mut command = doc! { "getMore": cursor_id, "collection": collection };
            if let Some(n) = batch {
                command.insert("batchSize", n as i32);
            }
            let reply = cursor_reply(&ns, id, "nextBatch", &chunk);
            let fetched = self.execute(
                CommandRequest {
                    db: &db,
                    command,
                    kind: CommandKind::Command,
                    options,
                    session,
                    target: target.clone(),
                },
                |_, _| Ok((chunk, reply)),
            )?;
            documents.extend(fetched);
        }
        Ok(documents)
    }

    /// Opens a change stream with an `aggregate` command
    pub fn open_change_stream(
        self: &Arc<Self>,
        db: &str,
        aggregate_target: Bson,
        scope: StreamScope,
        pipeline: Vec<Document>,
        options: ChangeStreamOptions,
        session: Option<&dyn Session>,
    ) -> Result<Box<dyn ChangeStream>> {
        let mut stage = Document::new();
        if matches!(scope, StreamScope::Cluster) {
            stage.insert("allChangesForCluster", true);
        }
        if let Some(full_document) = &options.full_document {
            stage.insert("fullDocument", full_document.clone());
        }
        let mut full_pipeline = vec![Bson::Document(doc! { "$changeStream": stage })];
        full_pipeline.extend(pipeline.iter().cloned().map(Bson::Document));
        let mut cursor = Document::new();
        if let Some(n) = options.batch_size {
            cursor.insert("batchSize", n as i32);
        }
        let command = doc! { "aggregate": aggregate_target, "pipeline": full_pipeline, "cursor": cursor };
        let ns = match &scope {
            StreamScope::Collection(ns) => ns.to_string(),
            _ => format!("{}.$cmd.aggregate", db),
        };
        let cursor_id = self.shared.next_cursor_id();

        let position = self.execute(
            CommandRequest {
                db,
                command,
                kind: CommandKind::Read,
                options: &NamespaceOptions::default(),
                session,
                target: None,
            },
            |state, _| {
                query::run_pipeline(Vec::new(), &pipeline)?;
                Ok((state.oplog.len(), cursor_reply(&ns, cursor_id, "firstBatch", &[])))
            },
        )?;
        Ok(Box::new(MemoryChangeStream::new(
            self.shared.clone(),
            scope,
            position,
            pipeline,
            options.full_document.as_deref(),
        )))
    }
}

pub(crate) fn cursor_reply(ns: &str, id: i64, batch_key: &str, documents: &[Document]) -> Document {
    let mut cursor = doc! { "id": id, "ns": ns };
    cursor.insert(batch_key, documents.to_vec());
    doc! { "cursor": cursor, "ok": 1.0 }
}

fn apply_concerns(command: &mut Document, kind: CommandKind, options: &NamespaceOptions) {
    match kind {
        CommandKind::Read => {
            if let Some(read_concern) = &options.read_concern {
                if !command.contains_key("readConcern") {
                    command.insert("readConcern", read_concern.to_document());
                }
            }
        }
        CommandKind::Write => {
            if let Some(write_concern) = &options.write_concern {
                if !command.contains_key("writeConcern") {
                    command.insert("writeConcern", write_concern.to_document());
                }
            }
        }
        CommandKind::Command => {}
    }
}

/// Child handles inherit any concern they do not set themselves
pub(crate) fn inherit(options: NamespaceOptions, parent: &NamespaceOptions) -> NamespaceOptions {
    NamespaceOptions {
        read_concern: options.read_concern.or_else(|| parent.read_concern.clone()),
        write_concern: options.write_concern.or_else(|| parent.write_concern.clone()),
        read_preference: options.read_preference.or_else(|| parent.read_preference.clone()),
    }
}

/// A connection to the in-memory deployment
pub struct MemoryClient {
    inner: Arc<ClientInner>,
}

impl MemoryClient {
    pub(crate) fn new(shared: Arc<Shared>, options: ClientOptions) -> Self {
        let hosts = if options.hosts.is_empty() {
            shared.hosts.clone()
        } else {
            options.hosts.clone()
        };
        Self {
            inner: Arc::new(ClientInner {
                shared,
                options,
                hosts,
                next_host: AtomicUsize::new(0),
                pool: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn namespace_options(&self) -> NamespaceOptions {
        NamespaceOptions {
            read_concern: self.inner.options.read_concern.clone(),
            write_concern: self.inner.options.write_concern.clone(),
            read_preference: self.inner.options.read_preference.clone(),
        }
    }
}

#[async_trait]
impl Client for MemoryClient {
    fn database(&self, name: &str, options: DatabaseOptions) -> Arc<dyn Database> {
        let options = inherit(options, &self.namespace_options());
        Arc::new(MemoryDatabase::new(self.inner.clone(), name, options))
    }

    fn hosts(&self) -> Vec<ServerAddress> {
        self.inner.hosts.clone()
    }

    async fn deployment_info(&self) -> Result<DeploymentInfo> {
        Ok(self.inner.shared.info())
    }

    async fn start_session(&self, options: SessionOptions) -> Result<Arc<dyn Session>> {
        self.inner.ensure_open()?;
        Ok(Arc::new(MemorySession::new(self.inner.clone(), options)))
    }

    async fn list_databases(
        &self,
        filter: Option<Document>,
        session: Option<&dyn Session>,
    ) -> Result<Vec<Document>> {
        let mut command = doc! { "listDatabases": 1 };
        if let Some(filter) = &filter {
            command.insert("filter", filter.clone());
        }
        self.inner.execute(
            CommandRequest {
                db: "admin",
                command,
                kind: CommandKind::Command,
                options: &NamespaceOptions::default(),
                session,
                target: None,
            },
            |state, _| {
                let mut databases = Vec::new();
                for name in state.store.database_names() {
                    let size = state.store.database_size(&name);
                    let entry = doc! { "name": name, "sizeOnDisk": size, "empty": false };
                    if filter.as_ref().map(|f| query::matches(&entry, f)).transpose()?.unwrap_or(true) {
                        databases.push(entry);
                    }
                }
                let total: i64 = databases.iter().filter_map(|d| d.get_i64("sizeOnDisk").ok()).sum();
                let reply = doc! { "databases": databases.clone(), "totalSize": total, "ok": 1.0 };
                Ok((databases, reply))
            },
        )
    }

    async fn watch(
        &self,
        pipeline: Vec<Document>,
        options: ChangeStreamOptions,
        session: Option<&dyn Session>,
    ) -> Result<Box<dyn ChangeStream>> {
        self.inner
            .open_change_stream("admin", Bson::Int32(1), StreamScope::Cluster, pipeline, options, session)
    }

    async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.pool.lock().clear();
    }
}
