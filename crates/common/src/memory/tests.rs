use bson::{doc, Bson};
use parking_lot::Mutex;
use std::sync::Arc;

use super::*;
use crate::driver::Session;
use crate::event::{CommandEvent, CommandEventHandler};
use crate::options::*;
use crate::types::TransactionState;

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<CommandEvent>>,
}

impl CommandEventHandler for Recorder {
    fn handle_command_event(&self, event: CommandEvent) {
        self.events.lock().push(event);
    }
}

impl Recorder {
    fn started(&self) -> Vec<Document> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                CommandEvent::Started(s) => Some(s.command.clone()),
                _ => None,
            })
            .collect()
    }
}

async fn connect(deployment: &MemoryDeployment) -> (Arc<dyn Client>, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let client = deployment
        .connect(ClientOptions {
            command_event_handler: Some(recorder.clone()),
            ..Default::default()
        })
        .await
        .unwrap();
    (client, recorder)
}

#[tokio::test]
async fn test_crud_round_trip() {
    let deployment = MemoryDeployment::default();
    let (client, _) = connect(&deployment).await;
    let coll = client.database("db", Default::default()).collection("coll", Default::default());

    coll.insert_many(
        vec![doc! { "_id": 1, "x": 1 }, doc! { "_id": 2, "x": 2 }, doc! { "_id": 3, "x": 3 }],
        Default::default(),
        None,
    )
    .await
    .unwrap();

    let updated = coll
        .update_many(
            doc! { "x": { "$gte": 2 } },
            UpdateModifications::Document(doc! { "$inc": { "x": 10 } }),
            Default::default(),
            None,
        )
        .await
        .unwrap();
    assert_eq!((updated.matched_count, updated.modified_count), (2, 2));

    let deleted = coll.delete_one(doc! { "_id": 1 }, Default::default(), None).await.unwrap();
    assert_eq!(deleted.deleted_count, 1);

    let found = coll
        .find(doc! {}, FindOptions { sort: Some(doc! { "_id": -1 }), ..Default::default() }, None)
        .await
        .unwrap();
    assert_eq!(found, vec![doc! { "_id": 3, "x": 13 }, doc! { "_id": 2, "x": 12 }]);
    assert_eq!(coll.estimated_document_count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_duplicate_key_in_insert_many_reports_partial_result() {
    let deployment = MemoryDeployment::default();
    let (client, recorder) = connect(&deployment).await;
    let coll = client.database("db", Default::default()).collection("coll", Default::default());

    let err = coll
        .insert_many(vec![doc! { "_id": 1 }, doc! { "_id": 1 }, doc! { "_id": 2 }], Default::default(), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(11000));
    let partial = err.partial_result().unwrap();
    assert_eq!(partial.get_document("insertedIds").unwrap().len(), 1);

    // the insert command itself succeeded and carried the write error
    let events = recorder.events.lock();
    assert!(matches!(events.last(), Some(CommandEvent::Succeeded(e)) if e.reply.contains_key("writeErrors")));
}

#[tokio::test]
async fn test_find_with_batch_size_issues_get_more() {
    let deployment = MemoryDeployment::default();
    let (client, recorder) = connect(&deployment).await;
    let coll = client.database("db", Default::default()).collection("coll", Default::default());
    let docs = (1..=5).map(|i| doc! { "_id": i }).collect();
    coll.insert_many(docs, Default::default(), None).await.unwrap();

    let found = coll
        .find(doc! {}, FindOptions { batch_size: Some(2), ..Default::default() }, None)
        .await
        .unwrap();
    assert_eq!(found.len(), 5);
    let names: Vec<String> = recorder
        .started()
        .iter()
        .map(|c| c.keys().next().cloned().unwrap())
        .collect();
    assert_eq!(names, vec!["insert", "find", "getMore", "getMore"]);
}

#[tokio::test]
async fn test_implicit_sessions_are_reused() {
    let deployment = MemoryDeployment::default();
    let (client, recorder) = connect(&deployment).await;
    let coll = client.database("db", Default::default()).collection("coll", Default::default());
    coll.insert_one(doc! { "_id": 1 }, None).await.unwrap();
    coll.insert_one(doc! { "_id": 2 }, None).await.unwrap();

    let started = recorder.started();
    assert_eq!(started[0].get("lsid"), started[1].get("lsid"));
}

#[tokio::test]
async fn test_transaction_isolation_and_commit() {
    let deployment = MemoryDeployment::default();
    let (client, recorder) = connect(&deployment).await;
    let coll = client.database("db", Default::default()).collection("coll", Default::default());
    let session = client.start_session(Default::default()).await.unwrap();

    session.start_transaction(None).await.unwrap();
    assert_eq!(session.transaction_state(), TransactionState::Starting);
    coll.insert_one(doc! { "_id": 1 }, Some(session.as_ref())).await.unwrap();
    assert_eq!(session.transaction_state(), TransactionState::InProgress);

    // outside the transaction the write is invisible
    assert!(coll.find(doc! {}, Default::default(), None).await.unwrap().is_empty());
    session.commit_transaction().await.unwrap();
    assert_eq!(coll.find(doc! {}, Default::default(), None).await.unwrap().len(), 1);

    let insert = &recorder.started()[0];
    assert_eq!(insert.get("txnNumber"), Some(&Bson::Int64(1)));
    assert!(insert.get_bool("startTransaction").unwrap());
    assert!(!insert.get_bool("autocommit").unwrap());
    let commit = recorder.started().pop().unwrap();
    assert!(commit.contains_key("commitTransaction"));
}

#[tokio::test]
async fn test_abort_discards_writes_and_kill_all_sessions_ends_transactions() {
    let deployment = MemoryDeployment::default();
    let (client, _) = connect(&deployment).await;
    let db = client.database("db", Default::default());
    let coll = db.collection("coll", Default::default());
    let session = client.start_session(Default::default()).await.unwrap();

    session.start_transaction(None).await.unwrap();
    coll.insert_one(doc! { "_id": 1 }, Some(session.as_ref())).await.unwrap();
    session.abort_transaction().await.unwrap();
    assert_eq!(session.transaction_state(), TransactionState::Aborted);
    assert!(coll.find(doc! {}, Default::default(), None).await.unwrap().is_empty());

    session.start_transaction(None).await.unwrap();
    coll.insert_one(doc! { "_id": 2 }, Some(session.as_ref())).await.unwrap();
    client
        .database("admin", Default::default())
        .run_command(doc! { "killAllSessions": [] }, Default::default(), None)
        .await
        .unwrap();
    let err = coll.insert_one(doc! { "_id": 3 }, Some(session.as_ref())).await.unwrap_err();
    assert_eq!(err.code(), Some(251));
    assert!(err.contains_label("TransientTransactionError"));
}

#[tokio::test]
async fn test_session_from_other_client_rejected() {
    let deployment = MemoryDeployment::default();
    let (client, _) = connect(&deployment).await;
    let (other, _) = connect(&deployment).await;
    let session = other.start_session(Default::default()).await.unwrap();
    let coll = client.database("db", Default::default()).collection("coll", Default::default());

    let err = coll.insert_one(doc! {}, Some(session.as_ref())).await.unwrap_err();
    assert!(err.is_client_error());
}

#[tokio::test]
async fn test_sharded_transaction_pins_and_unpins() {
    let deployment = MemoryDeployment::new(MemoryDeploymentConfig {
        topology: TopologyType::Sharded,
        ..Default::default()
    });
    let (client, _) = connect(&deployment).await;
    let coll = client.database("db", Default::default()).collection("coll", Default::default());
    let session = client.start_session(Default::default()).await.unwrap();

    session.start_transaction(None).await.unwrap();
    coll.insert_one(doc! { "_id": 1 }, Some(session.as_ref())).await.unwrap();
    let pinned = session.pinned_server().expect("pinned after first operation");
    session.commit_transaction().await.unwrap();
    assert_eq!(session.pinned_server(), Some(pinned));

    // a non-transactional operation releases the pin
    coll.find(doc! {}, Default::default(), Some(session.as_ref())).await.unwrap();
    assert!(session.pinned_server().is_none());
}

#[tokio::test]
async fn test_fail_point_and_network_error_dirty_session() {
    let deployment = MemoryDeployment::default();
    let (client, recorder) = connect(&deployment).await;
    let admin = client.database("admin", Default::default());
    admin
        .run_command(
            doc! {
                "configureFailPoint": "failCommand",
                "mode": { "times": 1 },
                "data": { "failCommands": ["insert"], "closeConnection": true },
            },
            Default::default(),
            None,
        )
        .await
        .unwrap();

    let coll = client.database("db", Default::default()).collection("coll", Default::default());
    let session = client.start_session(Default::default()).await.unwrap();
    let err = coll.insert_one(doc! { "_id": 1 }, Some(session.as_ref())).await.unwrap_err();
    assert!(err.is_network_error());
    assert!(session.is_dirty());
    assert!(matches!(recorder.events.lock().last(), Some(CommandEvent::Failed(_))));

    // a dirty session is discarded rather than returned to the pool
    let lsid = session.id();
    session.end().await;
    coll.insert_one(doc! { "_id": 2 }, None).await.unwrap();
    let last = recorder.started().pop().unwrap();
    assert_ne!(last.get_document("lsid").unwrap(), &lsid);
}

#[tokio::test]
async fn test_change_stream_sees_later_writes() {
    let deployment = MemoryDeployment::default();
    let (client, _) = connect(&deployment).await;
    let coll = client.database("db", Default::default()).collection("coll", Default::default());
    coll.insert_one(doc! { "_id": 0 }, None).await.unwrap();

    let mut stream = coll
        .watch(vec![doc! { "$match": { "operationType": "insert" } }], Default::default(), None)
        .await
        .unwrap();
    assert!(stream.try_next().await.unwrap().is_none());

    coll.delete_one(doc! { "_id": 0 }, Default::default(), None).await.unwrap();
    coll.insert_one(doc! { "_id": 1, "a": 1 }, None).await.unwrap();
    let event = stream.try_next().await.unwrap().unwrap();
    assert_eq!(event.get_str("operationType").unwrap(), "insert");
    assert_eq!(event.get_document("fullDocument").unwrap(), &doc! { "_id": 1, "a": 1 });
}

#[tokio::test]
async fn test_drop_missing_collection_is_not_an_error() {
    let deployment = MemoryDeployment::default();
    let (client, recorder) = connect(&deployment).await;
    let db = client.database("db", Default::default());
    db.drop_collection("missing", Default::default(), None).await.unwrap();
    assert!(matches!(recorder.events.lock().last(), Some(CommandEvent::Failed(_))));

    db.create_collection("coll", Default::default(), None).await.unwrap();
    let err = db.create_collection("coll", Default::default(), None).await.unwrap_err();
    assert_eq!(err.code_name(), Some("NamespaceExists"));
    assert_eq!(db.list_collection_names(None, None).await.unwrap(), vec!["coll".to_string()]);
}
