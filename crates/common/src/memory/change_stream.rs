//! Change streams over the deployment's oplog

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use std::sync::Arc;

use super::{query, Shared};
use crate::driver::ChangeStream;
use crate::types::Namespace;
use crate::Result;

/// A single entry in the oplog
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ChangeEvent {
    pub ns: Namespace,
    pub operation_type: &'static str,
    pub document_key: Option<Document>,
    /// Post-image for inserts, replaces and updates
    pub full_document: Option<Document>,
    pub update_description: Option<Document>,
}

impl ChangeEvent {
    pub fn insert(ns: &Namespace, document: &Document) -> Self {
        Self {
            ns: ns.clone(),
            operation_type: "insert",
            document_key: Some(document_key(document)),
            full_document: Some(document.clone()),
            update_description: None,
        }
    }

    pub fn update(ns: &Namespace, before: &Document, after: &Document) -> Self {
        Self {
            ns: ns.clone(),
            operation_type: "update",
            document_key: Some(document_key(after)),
            full_document: Some(after.clone()),
            update_description: Some(describe_update(before, after)),
        }
    }

    pub fn replace(ns: &Namespace, document: &Document) -> Self {
        Self {
            operation_type: "replace",
            ..Self::insert(ns, document)
        }
    }

    pub fn delete(ns: &Namespace, document: &Document) -> Self {
        Self {
            ns: ns.clone(),
            operation_type: "delete",
            document_key: Some(document_key(document)),
            full_document: None,
            update_description: None,
        }
    }

    pub fn dropped(ns: &Namespace) -> Self {
        Self {
            ns: ns.clone(),
            operation_type: "drop",
            document_key: None,
            full_document: None,
            update_description: None,
        }
    }

    /// Renders the event as delivered to a stream
    pub fn to_document(&self, position: usize, lookup_full_document: bool) -> Document {
        let mut event = doc! {
            "_id": { "_data": format!("{:016X}", position) },
            "operationType": self.operation_type,
            "ns": { "db": self.ns.db.clone(), "coll": self.ns.coll.clone() },
        };
        if let Some(key) = &self.document_key {
            event.insert("documentKey", key.clone());
        }
        let include_full_document = match self.operation_type {
            "insert" | "replace" => true,
            "update" => lookup_full_document,
            _ => false,
        };
        if include_full_document {
            if let Some(full) = &self.full_document {
                event.insert("fullDocument", full.clone());
            }
        }
        if let Some(description) = &self.update_description {
            event.insert("updateDescription", description.clone());
        }
        event
    }
}

fn document_key(document: &Document) -> Document {
    let mut key = Document::new();
    if let Some(id) = document.get("_id") {
        key.insert("_id", id.clone());
    }
    key
}

fn describe_update(before: &Document, after: &Document) -> Document {
    let updated: Document = after
        .iter()
        .filter(|(k, v)| before.get(k.as_str()) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let removed: Vec<Bson> = before
        .keys()
        .filter(|k| !after.contains_key(k.as_str()))
        .map(|k| Bson::String(k.clone()))
        .collect();
    doc! { "updatedFields": updated, "removedFields": removed, "truncatedArrays": [] }
}

/// Which namespaces a stream observes
#[derive(Debug, Clone)]
pub(crate) enum StreamScope {
    Cluster,
    Database(String),
    Collection(Namespace),
}

impl StreamScope {
    fn includes(&self, ns: &Namespace) -> bool {
        match self {
            StreamScope::Cluster => !matches!(ns.db.as_str(), "admin" | "config" | "local"),
            StreamScope::Database(db) => &ns.db == db,
            StreamScope::Collection(target) => target == ns,
        }
    }
}

pub(crate) struct MemoryChangeStream {
    shared: Arc<Shared>,
    scope: StreamScope,
    position: usize,
    pipeline: Vec<Document>,
    lookup_full_document: bool,
}

impl MemoryChangeStream {
    pub fn new(
        shared: Arc<Shared>,
        scope: StreamScope,
        position: usize,
        pipeline: Vec<Document>,
        full_document: Option<&str>,
    ) -> Self {
        Self {
            shared,
            scope,
            position,
            pipeline,
            lookup_full_document: full_document == Some("updateLookup"),
        }
    }
}

#[async_trait]
impl ChangeStream for MemoryChangeStream {
    async fn try_next(&mut self) -> Result<Option<Document>> {
        let state = self.shared.state.lock();
        while self.position < state.oplog.len() {
            let position = self.position;
            self.position += 1;
            let event = &state.oplog[position];
            if !self.scope.includes(&event.ns) {
                continue;
            }
            let rendered = event.to_document(position, self.lookup_full_document);
            if let Some(delivered) = query::run_pipeline(vec![rendered], &self.pipeline)?
                .into_iter()
                .next()
            {
                return Ok(Some(delivered));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_description_lists_changed_and_removed_fields() {
        let ns = Namespace::new("db", "coll");
        let event = ChangeEvent::update(&ns, &doc! { "_id": 1, "a": 1, "b": 2 }, &doc! { "_id": 1, "a": 5 });
        let rendered = event.to_document(0, false);
        assert_eq!(
            rendered.get_document("updateDescription").unwrap(),
            &doc! { "updatedFields": { "a": 5 }, "removedFields": ["b"], "truncatedArrays": [] }
        );
        assert!(!rendered.contains_key("fullDocument"));
        assert!(event.to_document(0, true).contains_key("fullDocument"));
    }

    #[test]
    fn test_cluster_scope_skips_internal_databases() {
        assert!(!StreamScope::Cluster.includes(&Namespace::new("admin", "x")));
        assert!(StreamScope::Database("db".into()).includes(&Namespace::new("db", "x")));
        assert!(!StreamScope::Collection(Namespace::new("db", "y")).includes(&Namespace::new("db", "x")));
    }
}
