//! The driver interface the runner executes operations against.
//!
//! Every handle is a trait object so that the runner never depends on a
//! concrete driver. Sessions are passed to operations as `&dyn Session`; an
//! implementation is free to reject sessions it did not create.

use async_trait::async_trait;
use bson::{Bson, Document};
use std::any::Any;
use std::sync::Arc;

use crate::options::*;
use crate::results::*;
use crate::types::{DeploymentInfo, Namespace, ServerAddress, TransactionState};
use crate::Result;

/// Entry point: something clients can be connected to
#[async_trait]
pub trait Deployment: Send + Sync {
    async fn connect(&self, options: ClientOptions) -> Result<Arc<dyn Client>>;
}

#[async_trait]
pub trait Client: Send + Sync {
    fn database(&self, name: &str, options: DatabaseOptions) -> Arc<dyn Database>;

    /// Servers this client may route operations to
    fn hosts(&self) -> Vec<ServerAddress>;

    async fn deployment_info(&self) -> Result<DeploymentInfo>;

    async fn start_session(&self, options: SessionOptions) -> Result<Arc<dyn Session>>;

    async fn list_databases(
        &self,
        filter: Option<Document>,
        session: Option<&dyn Session>,
    ) -> Result<Vec<Document>>;

    async fn list_database_names(
        &self,
        filter: Option<Document>,
        session: Option<&dyn Session>,
    ) -> Result<Vec<String>> {
        let databases = self.list_databases(filter, session).await?;
        Ok(databases
            .iter()
            .filter_map(|db| db.get_str("name").ok().map(str::to_string))
            .collect())
    }

    async fn watch(
        &self,
        pipeline: Vec<Document>,
        options: ChangeStreamOptions,
        session: Option<&dyn Session>,
    ) -> Result<Box<dyn ChangeStream>>;

    /// Release every resource held by the client
    async fn shutdown(&self);
}

#[async_trait]
pub trait Database: Send + Sync {
    fn name(&self) -> &str;

    fn collection(&self, name: &str, options: CollectionOptions) -> Arc<dyn Collection>;

    async fn run_command(
        &self,
        command: Document,
        options: RunCommandOptions,
        session: Option<&dyn Session>,
    ) -> Result<Document>;

    async fn create_collection(
        &self,
        name: &str,
        options: CreateCollectionOptions,
        session: Option<&dyn Session>,
    ) -> Result<()>;

    async fn drop_collection(
        &self,
        name: &str,
        options: DropCollectionOptions,
        session: Option<&dyn Session>,
    ) -> Result<()>;

    async fn list_collections(
        &self,
        filter: Option<Document>,
        session: Option<&dyn Session>,
    ) -> Result<Vec<Document>>;

    async fn list_collection_names(
        &self,
        filter: Option<Document>,
        session: Option<&dyn Session>,
    ) -> Result<Vec<String>> {
        let collections = self.list_collections(filter, session).await?;
        Ok(collections
            .iter()
            .filter_map(|c| c.get_str("name").ok().map(str::to_string))
            .collect())
    }

    async fn watch(
        &self,
        pipeline: Vec<Document>,
        options: ChangeStreamOptions,
        session: Option<&dyn Session>,
    ) -> Result<Box<dyn ChangeStream>>;
}

#[async_trait]
pub trait Collection: Send + Sync {
    fn namespace(&self) -> Namespace;

    async fn insert_one(
        &self,
        document: Document,
        session: Option<&dyn Session>,
    ) -> Result<InsertOneResult>;

    async fn insert_many(
        &self,
        documents: Vec<Document>,
        options: InsertManyOptions,
        session: Option<&dyn Session>,
    ) -> Result<InsertManyResult>;

    async fn update_one(
        &self,
        filter: Document,
        update: UpdateModifications,
        options: UpdateOptions,
        session: Option<&dyn Session>,
    ) -> Result<UpdateResult>;

    async fn update_many(
        &self,
        filter: Document,
        update: UpdateModifications,
        options: UpdateOptions,
        session: Option<&dyn Session>,
    ) -> Result<UpdateResult>;

    async fn replace_one(
        &self,
        filter: Document,
        replacement: Document,
        options: UpdateOptions,
        session: Option<&dyn Session>,
    ) -> Result<UpdateResult>;

    async fn delete_one(
        &self,
        filter: Document,
        options: DeleteOptions,
        session: Option<&dyn Session>,
    ) -> Result<DeleteResult>;

    async fn delete_many(
        &self,
        filter: Document,
        options: DeleteOptions,
        session: Option<&dyn Session>,
    ) -> Result<DeleteResult>;

    /// Runs the query and drains the cursor
    async fn find(
        &self,
        filter: Document,
        options: FindOptions,
        session: Option<&dyn Session>,
    ) -> Result<Vec<Document>>;

    async fn aggregate(
        &self,
        pipeline: Vec<Document>,
        options: AggregateOptions,
        session: Option<&dyn Session>,
    ) -> Result<Vec<Document>>;

    async fn distinct(
        &self,
        field: &str,
        filter: Document,
        session: Option<&dyn Session>,
    ) -> Result<Vec<Bson>>;

    async fn count_documents(
        &self,
        filter: Document,
        options: CountOptions,
        session: Option<&dyn Session>,
    ) -> Result<u64>;

    async fn estimated_document_count(&self) -> Result<u64>;

    async fn find_one_and_update(
        &self,
        filter: Document,
        update: UpdateModifications,
        options: FindOneAndModifyOptions,
        session: Option<&dyn Session>,
    ) -> Result<Option<Document>>;

    async fn find_one_and_replace(
        &self,
        filter: Document,
        replacement: Document,
        options: FindOneAndModifyOptions,
        session: Option<&dyn Session>,
    ) -> Result<Option<Document>>;

    async fn find_one_and_delete(
        &self,
        filter: Document,
        options: FindOneAndModifyOptions,
        session: Option<&dyn Session>,
    ) -> Result<Option<Document>>;

    async fn bulk_write(
        &self,
        requests: Vec<WriteModel>,
        options: BulkWriteOptions,
        session: Option<&dyn Session>,
    ) -> Result<BulkWriteResult>;

    /// Returns the name of the created index
    async fn create_index(
        &self,
        keys: Document,
        options: IndexOptions,
        session: Option<&dyn Session>,
    ) -> Result<String>;

    async fn drop_index(&self, name: &str, session: Option<&dyn Session>) -> Result<()>;

    async fn list_indexes(&self, session: Option<&dyn Session>) -> Result<Vec<Document>>;

    async fn watch(
        &self,
        pipeline: Vec<Document>,
        options: ChangeStreamOptions,
        session: Option<&dyn Session>,
    ) -> Result<Box<dyn ChangeStream>>;
}

/// A logical session, optionally carrying a transaction
#[async_trait]
pub trait Session: Send + Sync {
    /// The logical session id document (`{id: <uuid>}`)
    fn id(&self) -> Document;

    fn transaction_state(&self) -> TransactionState;

    /// The mongos a sharded transaction is bound to
    fn pinned_server(&self) -> Option<ServerAddress>;

    /// Set after a network error; a dirty session is never reused
    fn is_dirty(&self) -> bool;

    fn has_ended(&self) -> bool;

    async fn start_transaction(&self, options: Option<TransactionOptions>) -> Result<()>;

    async fn commit_transaction(&self) -> Result<()>;

    async fn abort_transaction(&self) -> Result<()>;

    async fn end(&self);

    fn as_any(&self) -> &dyn Any;
}

#[async_trait]
pub trait ChangeStream: Send + Sync {
    /// Next change event if one is already available
    async fn try_next(&mut self) -> Result<Option<Document>>;
}
