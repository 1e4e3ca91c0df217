//! Option structs accepted by driver calls

use bson::{Bson, Document};
use std::fmt;
use std::sync::Arc;

use crate::event::CommandEventHandler;
use crate::types::{ReadConcern, ReadPreference, ServerAddress, WriteConcern};

/// Options used to connect a client
#[derive(Clone, Default)]
pub struct ClientOptions {
    /// Servers the client may route to; empty means every server the
    /// deployment exposes
    pub hosts: Vec<ServerAddress>,
    pub app_name: Option<String>,
    pub retry_writes: Option<bool>,
    pub read_concern: Option<ReadConcern>,
    pub write_concern: Option<WriteConcern>,
    pub read_preference: Option<ReadPreference>,
    /// Connection-string options the runner does not interpret itself
    pub uri_options: Document,
    pub command_event_handler: Option<Arc<dyn CommandEventHandler>>,
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("hosts", &self.hosts)
            .field("app_name", &self.app_name)
            .field("retry_writes", &self.retry_writes)
            .field("read_concern", &self.read_concern)
            .field("write_concern", &self.write_concern)
            .field("read_preference", &self.read_preference)
            .field("uri_options", &self.uri_options)
            .field("command_event_handler", &self.command_event_handler.is_some())
            .finish()
    }
}

/// Concerns applied to a database or collection handle
#[derive(Debug, Clone, Default)]
pub struct NamespaceOptions {
    pub read_concern: Option<ReadConcern>,
    pub write_concern: Option<WriteConcern>,
    pub read_preference: Option<ReadPreference>,
}

pub type DatabaseOptions = NamespaceOptions;
pub type CollectionOptions = NamespaceOptions;

#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    pub read_concern: Option<ReadConcern>,
    pub write_concern: Option<WriteConcern>,
    pub read_preference: Option<ReadPreference>,
    pub max_commit_time_ms: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub causal_consistency: Option<bool>,
    pub default_transaction_options: Option<TransactionOptions>,
}

#[derive(Debug, Clone, Default)]
pub struct InsertManyOptions {
    pub ordered: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub upsert: Option<bool>,
    pub array_filters: Option<Vec<Document>>,
    pub hint: Option<Bson>,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    pub hint: Option<Bson>,
}

#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub sort: Option<Document>,
    pub projection: Option<Document>,
    pub skip: Option<u64>,
    pub limit: Option<i64>,
    pub batch_size: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct AggregateOptions {
    pub batch_size: Option<u32>,
    pub allow_disk_use: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct CountOptions {
    pub skip: Option<u64>,
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnDocument {
    #[default]
    Before,
    After,
}

#[derive(Debug, Clone, Default)]
pub struct FindOneAndModifyOptions {
    pub sort: Option<Document>,
    pub projection: Option<Document>,
    pub upsert: Option<bool>,
    pub return_document: ReturnDocument,
}

#[derive(Debug, Clone, Default)]
pub struct BulkWriteOptions {
    pub ordered: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    pub name: Option<String>,
    pub unique: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateCollectionOptions {
    pub write_concern: Option<WriteConcern>,
}

#[derive(Debug, Clone, Default)]
pub struct DropCollectionOptions {
    pub write_concern: Option<WriteConcern>,
}

#[derive(Debug, Clone, Default)]
pub struct ChangeStreamOptions {
    pub full_document: Option<String>,
    pub batch_size: Option<u32>,
}

/// Options for a raw database command
#[derive(Debug, Clone, Default)]
pub struct RunCommandOptions {
    pub read_preference: Option<ReadPreference>,
    /// Send the command to this server instead of using server selection
    pub target: Option<ServerAddress>,
}

/// Either an update document (`{$set: ...}`) or an aggregation pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateModifications {
    Document(Document),
    Pipeline(Vec<Document>),
}

impl UpdateModifications {
    pub fn to_bson(&self) -> Bson {
        match self {
            UpdateModifications::Document(doc) => Bson::Document(doc.clone()),
            UpdateModifications::Pipeline(stages) => {
                Bson::Array(stages.iter().cloned().map(Bson::Document).collect())
            }
        }
    }
}

/// A single request inside a bulk write
#[derive(Debug, Clone, PartialEq)]
pub enum WriteModel {
    InsertOne {
        document: Document,
    },
    UpdateOne {
        filter: Document,
        update: UpdateModifications,
        upsert: Option<bool>,
    },
    UpdateMany {
        filter: Document,
        update: UpdateModifications,
        upsert: Option<bool>,
    },
    ReplaceOne {
        filter: Document,
        replacement: Document,
        upsert: Option<bool>,
    },
    DeleteOne {
        filter: Document,
    },
    DeleteMany {
        filter: Document,
    },
}

impl WriteModel {
    /// Name of the write command this request is sent with
    pub fn command_name(&self) -> &'static str {
        match self {
            WriteModel::InsertOne { .. } => "insert",
            WriteModel::UpdateOne { .. }
            | WriteModel::UpdateMany { .. }
            | WriteModel::ReplaceOne { .. } => "update",
            WriteModel::DeleteOne { .. } | WriteModel::DeleteMany { .. } => "delete",
        }
    }
}
