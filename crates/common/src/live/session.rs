//! Sessions wrapping `mongodb::ClientSession`

use async_trait::async_trait;
use bson::Document;
use mongodb::ClientSession;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use super::convert;
use crate::driver::Session;
use crate::error::TRANSIENT_TRANSACTION_ERROR;
use crate::options::TransactionOptions;
use crate::types::{ServerAddress, TransactionState};
use crate::{Error, Result};

/// The driver session, taken out when the session ends
pub(crate) type SessionSlot = Arc<AsyncMutex<Option<ClientSession>>>;

/// Mongos each session's sharded transaction went to, keyed by lsid.
///
/// Filled from the commands the client sends: the first command of a
/// transaction pins, a command outside any transaction unpins, and so does a
/// failure labelled `TransientTransactionError`.
#[derive(Debug, Default)]
pub(crate) struct Pins {
    by_session: Mutex<HashMap<String, ServerAddress>>,
}

impl Pins {
    fn key(lsid: &Document) -> String {
        lsid.to_string()
    }

    pub fn observe_command(&self, command: &Document, server: ServerAddress) {
        let lsid = match command.get_document("lsid") {
            Ok(lsid) => lsid,
            Err(_) => return,
        };
        let mut pins = self.by_session.lock();
        if command.get_bool("startTransaction").unwrap_or(false) {
            pins.insert(Self::key(lsid), server);
        } else if !command.contains_key("autocommit") {
            pins.remove(&Self::key(lsid));
        }
    }

    pub fn observe_failure(&self, lsid: Option<&Document>, failure: &Error) {
        if let Some(lsid) = lsid {
            if failure.contains_label(TRANSIENT_TRANSACTION_ERROR) {
                self.by_session.lock().remove(&Self::key(lsid));
            }
        }
    }

    fn get(&self, lsid: &Document) -> Option<ServerAddress> {
        self.by_session.lock().get(&Self::key(lsid)).cloned()
    }

    fn release(&self, lsid: &Document) {
        self.by_session.lock().remove(&Self::key(lsid));
    }
}

pub struct LiveSession {
    id: Document,
    pub(crate) slot: SessionSlot,
    state: Mutex<TransactionState>,
    dirty: AtomicBool,
    ended: AtomicBool,
    pins: Arc<Pins>,
}

impl LiveSession {
    pub(crate) fn new(session: ClientSession, pins: Arc<Pins>) -> Self {
        Self {
            id: session.id().clone(),
            slot: Arc::new(AsyncMutex::new(Some(session))),
            state: Mutex::new(TransactionState::None),
            dirty: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            pins,
        }
    }

    /// The live session behind `session`; sessions of other deployments are
    /// rejected
    pub(crate) fn from_dyn(session: &dyn Session) -> Result<&LiveSession> {
        session
            .as_any()
            .downcast_ref::<LiveSession>()
            .ok_or_else(|| Error::session("session was not created by this deployment"))
    }

    /// Bookkeeping after an operation ran on this session
    pub(crate) fn record<T>(&self, outcome: mongodb::error::Result<T>) -> Result<T> {
        {
            let mut state = self.state.lock();
            if *state == TransactionState::Starting {
                *state = TransactionState::InProgress;
            }
        }
        outcome.map_err(|e| {
            let e = convert::error(e);
            if e.is_network_error() {
                self.dirty.store(true, Ordering::SeqCst);
            }
            e
        })
    }
}

pub(crate) fn ended() -> Error {
    Error::session("session has ended")
}

#[async_trait]
impl Session for LiveSession {
    fn id(&self) -> Document {
        self.id.clone()
    }

    fn transaction_state(&self) -> TransactionState {
        *self.state.lock()
    }

    fn pinned_server(&self) -> Option<ServerAddress> {
        self.pins.get(&self.id)
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn has_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    async fn start_transaction(&self, options: Option<TransactionOptions>) -> Result<()> {
        let next = self.state.lock().start()?;
        let options = options.as_ref().map(convert::transaction_options).transpose()?;
        let mut slot = self.slot.lock().await;
        let session = slot.as_mut().ok_or_else(ended)?;
        session.start_transaction(options).await.map_err(convert::error)?;
        *self.state.lock() = next;
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<()> {
        let next = self.state.lock().commit()?;
        let mut slot = self.slot.lock().await;
        let session = slot.as_mut().ok_or_else(ended)?;
        *self.state.lock() = next;
        session.commit_transaction().await.map_err(convert::error)
    }

    async fn abort_transaction(&self) -> Result<()> {
        let next = self.state.lock().abort()?;
        let mut slot = self.slot.lock().await;
        let session = slot.as_mut().ok_or_else(ended)?;
        *self.state.lock() = next;
        let result = session.abort_transaction().await.map_err(convert::error);
        self.pins.release(&self.id);
        result
    }

    async fn end(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        // dropping the driver session aborts an open transaction and returns
        // the server session to the pool
        let session = self.slot.lock().await.take();
        drop(session);
        self.pins.release(&self.id);
        debug!("Ended session {}", self.id);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn server(port: u16) -> ServerAddress {
        ServerAddress::new("localhost", port)
    }

    #[test]
    fn test_pins_follow_the_transaction() {
        let pins = Pins::default();
        let lsid = doc! { "id": 1 };
        pins.observe_command(
            &doc! { "insert": "c", "lsid": lsid.clone(), "txnNumber": 1_i64, "startTransaction": true, "autocommit": false },
            server(27017),
        );
        // later statements and the commit keep the pin
        pins.observe_command(
            &doc! { "find": "c", "lsid": lsid.clone(), "txnNumber": 1_i64, "autocommit": false },
            server(27018),
        );
        assert_eq!(pins.get(&lsid), Some(server(27017)));

        pins.observe_command(&doc! { "find": "c", "lsid": lsid.clone() }, server(27018));
        assert_eq!(pins.get(&lsid), None);
    }

    #[test]
    fn test_transient_errors_unpin() {
        let pins = Pins::default();
        let lsid = doc! { "id": 2 };
        pins.observe_command(
            &doc! { "insert": "c", "lsid": lsid.clone(), "startTransaction": true, "autocommit": false },
            server(27017),
        );
        pins.observe_failure(Some(&lsid), &Error::command(112, "WriteConflict", "conflict"));
        assert!(pins.get(&lsid).is_some());

        let transient = Error::command(112, "WriteConflict", "conflict").with_label(TRANSIENT_TRANSACTION_ERROR);
        pins.observe_failure(Some(&lsid), &transient);
        assert!(pins.get(&lsid).is_none());
    }
}
