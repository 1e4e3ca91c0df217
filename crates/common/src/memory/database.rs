//! Database handle and the generic command interpreter behind `runCommand`

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use std::sync::Arc;

use super::change_stream::{ChangeEvent, StreamScope};
use super::client::{inherit, ClientInner, CommandKind, CommandRequest, Route};
use super::collection::MemoryCollection;
use super::store::ServerState;
use super::{query, server_error, Shared};
use crate::driver::{ChangeStream, Collection, Database, Session};
use crate::options::*;
use crate::types::{Namespace, TopologyType};
use crate::Result;

pub(crate) struct MemoryDatabase {
    client: Arc<ClientInner>,
    name: String,
    options: NamespaceOptions,
}

impl MemoryDatabase {
    pub fn new(client: Arc<ClientInner>, name: &str, options: NamespaceOptions) -> Self {
        Self {
            client,
            name: name.to_string(),
            options,
        }
    }

    fn request<'a>(
        &'a self,
        command: Document,
        kind: CommandKind,
        session: Option<&'a dyn Session>,
    ) -> CommandRequest<'a> {
        CommandRequest {
            db: &self.name,
            command,
            kind,
            options: &self.options,
            session,
            target: None,
        }
    }
}

/// Collection descriptor as returned by `listCollections`
fn collection_info(name: &str) -> Document {
    doc! {
        "name": name,
        "type": "collection",
        "options": {},
        "info": { "readOnly": false },
        "idIndex": { "v": 2, "key": { "_id": 1 }, "name": "_id_" },
    }
}

fn list_collections(state: &ServerState, db: &str, filter: Option<&Document>) -> Result<Vec<Document>> {
    let mut collections = Vec::new();
    for name in state.store.collection_names(db) {
        let info = collection_info(&name);
        if filter.map(|f| query::matches(&info, f)).transpose()?.unwrap_or(true) {
            collections.push(info);
        }
    }
    Ok(collections)
}

fn create_collection(state: &mut ServerState, ns: &Namespace, route: &Route) -> Result<()> {
    if state.view(ns, route.txn).is_some() {
        return Err(server_error(48, format!("Collection {} already exists.", ns)));
    }
    match route.txn {
        Some(_) => {
            state.collection_mut(ns, route.txn)?;
        }
        None => state.store.create(ns)?,
    }
    Ok(())
}

fn drop_collection(state: &mut ServerState, ns: &Namespace) -> Result<()> {
    if !state.store.drop_collection(ns) {
        return Err(server_error(26, "ns not found"));
    }
    state.record_change(None, ChangeEvent::dropped(ns));
    Ok(())
}

/// Interprets a command sent through `runCommand`
fn run_server_command(
    shared: &Shared,
    state: &mut ServerState,
    db: &str,
    command: &Document,
    route: &Route,
) -> Result<Document> {
    let Some((name, argument)) = command.iter().next() else {
        return Err(server_error(9, "empty command"));
    };
    let ok = doc! { "ok": 1.0 };
    match name.as_str() {
        "ping" => Ok(ok),
        "hello" | "isMaster" | "ismaster" => {
            let mut reply = doc! {
                "isWritablePrimary": true,
                "ismaster": true,
                "maxWireVersion": 21,
                "minWireVersion": 0,
                "logicalSessionTimeoutMinutes": 30,
            };
            match shared.topology() {
                TopologyType::Sharded => {
                    reply.insert("msg", "isdbgrid");
                }
                TopologyType::ReplicaSet => {
                    reply.insert("setName", "rs0");
                    reply.insert(
                        "hosts",
                        shared.hosts.iter().map(|h| h.to_string()).collect::<Vec<_>>(),
                    );
                }
                _ => {}
            }
            reply.insert("me", route.server.to_string());
            reply.insert("ok", 1.0);
            Ok(reply)
        }
        "buildInfo" | "buildinfo" => {
            let version = shared.config.version.clone();
            let version_array: Vec<i32> = version
                .split('.')
                .filter_map(|part| part.parse().ok())
                .collect();
            Ok(doc! { "version": version, "versionArray": version_array, "ok": 1.0 })
        }
        "getParameter" => {
            let mut reply = Document::new();
            if argument.as_str() == Some("*") {
                reply = shared.config.server_parameters.clone();
            } else {
                for key in command.keys().skip(1) {
                    if let Some(value) = shared.config.server_parameters.get(key) {
                        reply.insert(key.clone(), value.clone());
                    }
                }
            }
            reply.insert("ok", 1.0);
            Ok(reply)
        }
        "configureFailPoint" => {
            state.fail_points.configure(&route.server, command)?;
            Ok(ok)
        }
        "killAllSessions" => {
            let killed = state.kill_all_sessions();
            tracing::debug!("killAllSessions aborted {} open transactions", killed);
            Ok(ok)
        }
        "create" => {
            let coll = argument
                .as_str()
                .ok_or_else(|| server_error(2, "collection name must be a string"))?;
            create_collection(state, &Namespace::new(db, coll), route)?;
            Ok(ok)
        }
        "drop" => {
            let coll = argument
                .as_str()
                .ok_or_else(|| server_error(2, "collection name must be a string"))?;
            drop_collection(state, &Namespace::new(db, coll))?;
            Ok(ok)
        }
        "listCollections" => {
            let filter = command.get_document("filter").ok();
            let collections = list_collections(state, db, filter)?;
            Ok(super::client::cursor_reply(
                &format!("{}.$cmd.listCollections", db),
                0,
                "firstBatch",
                &collections,
            ))
        }
        "count" => {
            let coll = argument
                .as_str()
                .ok_or_else(|| server_error(2, "collection name must be a string"))?;
            let filter = command.get_document("query").cloned().unwrap_or_default();
            let ns = Namespace::new(db, coll);
            let mut n = 0i64;
            if let Some(data) = state.view(&ns, route.txn) {
                n = data.positions_matching(&filter)?.len() as i64;
            }
            Ok(doc! { "n": n, "ok": 1.0 })
        }
        other => Err(server_error(59, format!("no such command: '{}'", other))),
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn collection(&self, name: &str, options: CollectionOptions) -> Arc<dyn Collection> {
        let options = inherit(options, &self.options);
        Arc::new(MemoryCollection::new(
            self.client.clone(),
            Namespace::new(self.name.clone(), name),
            options,
        ))
    }

    async fn run_command(
        &self,
        command: Document,
        options: RunCommandOptions,
        session: Option<&dyn Session>,
    ) -> Result<Document> {
        let shared = self.client.shared.clone();
        let db = self.name.clone();
        let body = command.clone();
        let mut request = self.request(command, CommandKind::Command, session);
        request.target = options.target;
        self.client.execute(request, |state, route| {
            let reply = run_server_command(&shared, state, &db, &body, route)?;
            Ok((reply.clone(), reply))
        })
    }

    async fn create_collection(
        &self,
        name: &str,
        options: CreateCollectionOptions,
        session: Option<&dyn Session>,
    ) -> Result<()> {
        let mut command = doc! { "create": name };
        if let Some(write_concern) = &options.write_concern {
            command.insert("writeConcern", write_concern.to_document());
        }
        let ns = Namespace::new(self.name.clone(), name);
        self.client
            .execute(self.request(command, CommandKind::Write, session), |state, route| {
                create_collection(state, &ns, route)?;
                Ok(((), doc! { "ok": 1.0 }))
            })
    }

    async fn drop_collection(
        &self,
        name: &str,
        options: DropCollectionOptions,
        session: Option<&dyn Session>,
    ) -> Result<()> {
        let mut command = doc! { "drop": name };
        if let Some(write_concern) = &options.write_concern {
            command.insert("writeConcern", write_concern.to_document());
        }
        let ns = Namespace::new(self.name.clone(), name);
        let result = self
            .client
            .execute(self.request(command, CommandKind::Write, session), |state, _| {
                drop_collection(state, &ns)?;
                Ok(((), doc! { "ns": ns.to_string(), "nIndexesWas": 1, "ok": 1.0 }))
            });
        match result {
            // dropping a missing collection is not an error for applications
            Err(error) if error.code() == Some(26) => Ok(()),
            other => other,
        }
    }

    async fn list_collections(
        &self,
        filter: Option<Document>,
        session: Option<&dyn Session>,
    ) -> Result<Vec<Document>> {
        let mut command = doc! { "listCollections": 1, "cursor": {} };
        if let Some(filter) = &filter {
            command.insert("filter", filter.clone());
        }
        let db = self.name.clone();
        self.client.execute_cursor(
            self.request(command, CommandKind::Command, session),
            "$cmd.listCollections",
            None,
            |state, _| list_collections(state, &db, filter.as_ref()),
        )
    }

    async fn watch(
        &self,
        pipeline: Vec<Document>,
        options: ChangeStreamOptions,
        session: Option<&dyn Session>,
    ) -> Result<Box<dyn ChangeStream>> {
        self.client.open_change_stream(
            &self.name,
            Bson::Int32(1),
            StreamScope::Database(self.name.clone()),
            pipeline,
            options,
            session,
        )
    }
}
