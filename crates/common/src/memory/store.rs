//! Server-side state of the in-memory deployment

use bson::{doc, Bson, Document};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use super::change_stream::ChangeEvent;
use super::fail_point::FailPoints;
use super::{query, server_error};
use crate::types::Namespace;
use crate::Result;

/// A secondary (or `_id`) index definition
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct IndexSpec {
    pub name: String,
    pub keys: Document,
    pub unique: bool,
}

impl IndexSpec {
    pub fn id_index() -> Self {
        Self {
            name: "_id_".to_string(),
            keys: doc! { "_id": 1 },
            unique: true,
        }
    }

    /// Default name for an index over `keys` (`a_1_b_-1`)
    pub fn default_name(keys: &Document) -> String {
        keys.iter()
            .map(|(field, direction)| {
                let direction = match direction {
                    Bson::Int32(n) => n.to_string(),
                    Bson::Int64(n) => n.to_string(),
                    Bson::Double(n) => (*n as i64).to_string(),
                    Bson::String(s) => s.clone(),
                    other => other.to_string(),
                };
                format!("{}_{}", field, direction)
            })
            .collect::<Vec<_>>()
            .join("_")
    }

    pub fn to_document(&self) -> Document {
        let mut doc = doc! { "v": 2, "key": self.keys.clone(), "name": self.name.clone() };
        if self.unique && self.name != "_id_" {
            doc.insert("unique", true);
        }
        doc
    }

    fn key_values(&self, document: &Document) -> Vec<Bson> {
        self.keys
            .keys()
            .map(|field| query::get_path(document, field).cloned().unwrap_or(Bson::Null))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CollectionData {
    pub documents: Vec<Document>,
    pub indexes: Vec<IndexSpec>,
}

impl Default for CollectionData {
    fn default() -> Self {
        Self {
            documents: Vec::new(),
            indexes: vec![IndexSpec::id_index()],
        }
    }
}

impl CollectionData {
    /// Fails with DuplicateKey if `document` collides with another document
    /// on any unique index. `skip` is the position of the document being
    /// replaced, if any.
    pub fn check_unique(&self, ns: &Namespace, document: &Document, skip: Option<usize>) -> Result<()> {
        for index in self.indexes.iter().filter(|i| i.unique) {
            let values = index.key_values(document);
            let collision = self.documents.iter().enumerate().any(|(pos, other)| {
                Some(pos) != skip
                    && index
                        .key_values(other)
                        .iter()
                        .zip(values.iter())
                        .all(|(a, b)| query::values_equal(a, b))
            });
            if collision {
                let dup_key: Document = index
                    .keys
                    .keys()
                    .cloned()
                    .zip(values.into_iter())
                    .collect();
                return Err(server_error(
                    11000,
                    format!(
                        "E11000 duplicate key error collection: {} index: {} dup key: {}",
                        ns, index.name, dup_key
                    ),
                ));
            }
        }
        Ok(())
    }

    pub fn insert(&mut self, ns: &Namespace, document: Document) -> Result<()> {
        self.check_unique(ns, &document, None)?;
        self.documents.push(document);
        Ok(())
    }

    pub fn position_of(&self, filter: &Document, sort: Option<&Document>) -> Result<Option<usize>> {
        let mut positions = Vec::new();
        for (pos, document) in self.documents.iter().enumerate() {
            if query::matches(document, filter)? {
                positions.push(pos);
            }
        }
        if let Some(sort) = sort {
            positions.sort_by(|a, b| query::compare_by_sort(&self.documents[*a], &self.documents[*b], sort));
        }
        Ok(positions.first().copied())
    }

    pub fn positions_matching(&self, filter: &Document) -> Result<Vec<usize>> {
        let mut positions = Vec::new();
        for (pos, document) in self.documents.iter().enumerate() {
            if query::matches(document, filter)? {
                positions.push(pos);
            }
        }
        Ok(positions)
    }
}

/// Every database and collection the deployment holds
#[derive(Debug, Clone, Default)]
pub(crate) struct Store {
    databases: BTreeMap<String, BTreeMap<String, CollectionData>>,
}

impl Store {
    pub fn get(&self, ns: &Namespace) -> Option<&CollectionData> {
        self.databases.get(&ns.db).and_then(|db| db.get(&ns.coll))
    }

    /// Collection for writing, created implicitly if missing
    pub fn entry(&mut self, ns: &Namespace) -> &mut CollectionData {
        self.databases
            .entry(ns.db.clone())
            .or_default()
            .entry(ns.coll.clone())
            .or_default()
    }

    pub fn put(&mut self, ns: &Namespace, data: CollectionData) {
        self.databases
            .entry(ns.db.clone())
            .or_default()
            .insert(ns.coll.clone(), data);
    }

    pub fn create(&mut self, ns: &Namespace) -> Result<()> {
        if self.get(ns).is_some() {
            return Err(server_error(48, format!("Collection {} already exists.", ns)));
        }
        self.put(ns, CollectionData::default());
        Ok(())
    }

    /// Returns true if the collection existed
    pub fn drop_collection(&mut self, ns: &Namespace) -> bool {
        let Some(db) = self.databases.get_mut(&ns.db) else {
            return false;
        };
        let existed = db.remove(&ns.coll).is_some();
        if db.is_empty() {
            self.databases.remove(&ns.db);
        }
        existed
    }

    pub fn collection_names(&self, db: &str) -> Vec<String> {
        self.databases
            .get(db)
            .map(|colls| colls.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn database_names(&self) -> Vec<String> {
        self.databases.keys().cloned().collect()
    }

    /// Rough size in bytes, reported by listDatabases
    pub fn database_size(&self, db: &str) -> i64 {
        self.databases
            .get(db)
            .map(|colls| {
                colls
                    .values()
                    .flat_map(|c| c.documents.iter())
                    .map(|d| {
                        let mut buf = Vec::new();
                        d.to_writer(&mut buf).map(|_| buf.len() as i64).unwrap_or(0)
                    })
                    .sum()
            })
            .unwrap_or(0)
    }
}

/// Writes buffered by an open transaction
#[derive(Debug, Clone)]
pub(crate) struct TxnWorkspace {
    pub txn_number: i64,
    pub collections: BTreeMap<Namespace, CollectionData>,
    pub pending_events: Vec<ChangeEvent>,
}

impl TxnWorkspace {
    pub fn new(txn_number: i64) -> Self {
        Self {
            txn_number,
            collections: BTreeMap::new(),
            pending_events: Vec::new(),
        }
    }
}

/// Identifies the transaction a command runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TxnKey {
    pub session: Uuid,
    pub txn_number: i64,
}

#[derive(Debug, Default)]
pub(crate) struct ServerState {
    pub store: Store,
    pub fail_points: FailPoints,
    pub oplog: Vec<ChangeEvent>,
    pub transactions: HashMap<Uuid, TxnWorkspace>,
    /// Last committed transaction per session, so commits can be retried
    pub committed: HashMap<Uuid, i64>,
}

impl ServerState {
    /// Collection as seen by a command, including uncommitted transaction writes
    pub fn view(&self, ns: &Namespace, txn: Option<TxnKey>) -> Option<&CollectionData> {
        if let Some(key) = txn {
            if let Some(data) = self
                .transactions
                .get(&key.session)
                .and_then(|ws| ws.collections.get(ns))
            {
                return Some(data);
            }
        }
        self.store.get(ns)
    }

    pub fn collection_mut(&mut self, ns: &Namespace, txn: Option<TxnKey>) -> Result<&mut CollectionData> {
        match txn {
            Some(key) => {
                let ServerState {
                    store,
                    transactions,
                    ..
                } = self;
                let workspace = transactions
                    .get_mut(&key.session)
                    .filter(|ws| ws.txn_number == key.txn_number)
                    .ok_or_else(|| no_such_transaction(key.txn_number))?;
                Ok(workspace
                    .collections
                    .entry(ns.clone())
                    .or_insert_with(|| store.get(ns).cloned().unwrap_or_default()))
            }
            None => Ok(self.store.entry(ns)),
        }
    }

    /// Fails if the transaction a command claims to run in is gone
    pub fn require_transaction(&self, key: TxnKey) -> Result<()> {
        match self.transactions.get(&key.session) {
            Some(ws) if ws.txn_number == key.txn_number => Ok(()),
            _ => Err(no_such_transaction(key.txn_number)),
        }
    }

    pub fn record_change(&mut self, txn: Option<TxnKey>, event: ChangeEvent) {
        match txn.and_then(|key| self.transactions.get_mut(&key.session)) {
            Some(ws) => ws.pending_events.push(event),
            None => self.oplog.push(event),
        }
    }

    /// Applies a transaction's buffered writes
    pub fn commit(&mut self, key: TxnKey) -> Result<()> {
        match self.transactions.remove(&key.session) {
            Some(ws) if ws.txn_number == key.txn_number => {
                for (ns, data) in ws.collections {
                    self.store.put(&ns, data);
                }
                self.oplog.extend(ws.pending_events);
                self.committed.insert(key.session, key.txn_number);
                Ok(())
            }
            Some(ws) => {
                let txn_number = ws.txn_number;
                self.transactions.insert(key.session, ws);
                Err(no_such_transaction(txn_number))
            }
            None if self.committed.get(&key.session) == Some(&key.txn_number) => Ok(()),
            None => Err(no_such_transaction(key.txn_number)),
        }
    }

    pub fn abort(&mut self, key: TxnKey) -> Result<()> {
        match self.transactions.get(&key.session) {
            Some(ws) if ws.txn_number == key.txn_number => {
                self.transactions.remove(&key.session);
                Ok(())
            }
            _ => Err(no_such_transaction(key.txn_number)),
        }
    }

    /// Drops every open transaction (killAllSessions)
    pub fn kill_all_sessions(&mut self) -> usize {
        let killed = self.transactions.len();
        self.transactions.clear();
        killed
    }
}

fn no_such_transaction(txn_number: i64) -> crate::Error {
    server_error(
        251,
        format!("Transaction with txnNumber {} has been aborted.", txn_number),
    )
    .with_label(crate::error::TRANSIENT_TRANSACTION_ERROR)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns() -> Namespace {
        Namespace::new("db", "coll")
    }

    #[test]
    fn test_default_index_name() {
        assert_eq!(IndexSpec::default_name(&doc! { "a": 1, "b": -1 }), "a_1_b_-1");
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut data = CollectionData::default();
        data.insert(&ns(), doc! { "_id": 1 }).unwrap();
        let err = data.insert(&ns(), doc! { "_id": 1, "x": 2 }).unwrap_err();
        assert_eq!(err.code(), Some(11000));
        assert_eq!(err.code_name(), Some("DuplicateKey"));
        // numerically equal ids collide as well
        assert!(data.insert(&ns(), doc! { "_id": 1.0 }).is_err());
    }

    #[test]
    fn test_transaction_writes_invisible_until_commit() {
        let mut state = ServerState::default();
        let session = Uuid::new_v4();
        let key = TxnKey { session, txn_number: 1 };
        state.transactions.insert(session, TxnWorkspace::new(1));

        state
            .collection_mut(&ns(), Some(key))
            .unwrap()
            .insert(&ns(), doc! { "_id": 1 })
            .unwrap();
        assert!(state.view(&ns(), None).is_none());
        assert_eq!(state.view(&ns(), Some(key)).unwrap().documents.len(), 1);

        state.commit(key).unwrap();
        assert_eq!(state.view(&ns(), None).unwrap().documents.len(), 1);
        // retrying the same commit succeeds
        state.commit(key).unwrap();
    }

    #[test]
    fn test_killed_transaction_reports_no_such_transaction() {
        let mut state = ServerState::default();
        let session = Uuid::new_v4();
        state.transactions.insert(session, TxnWorkspace::new(3));
        assert_eq!(state.kill_all_sessions(), 1);

        let err = state
            .collection_mut(&ns(), Some(TxnKey { session, txn_number: 3 }))
            .unwrap_err();
        assert_eq!(err.code(), Some(251));
        assert!(err.contains_label(crate::error::TRANSIENT_TRANSACTION_ERROR));
    }
}
