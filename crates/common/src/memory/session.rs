//! Explicit sessions and the client side of transactions

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use tracing::debug;

use super::client::{ClientInner, ServerSession};
use super::is_unknown_commit_code;
use super::store::TxnKey;
use crate::driver::Session;
use crate::error::UNKNOWN_TRANSACTION_COMMIT_RESULT;
use crate::options::{SessionOptions, TransactionOptions};
use crate::types::{ServerAddress, TransactionState};
use crate::{Error, Result};

pub(crate) struct SessionCore {
    pub server_session: ServerSession,
    pub state: TransactionState,
    pub txn_options: Option<TransactionOptions>,
    pub pinned: Option<ServerAddress>,
    pub dirty: bool,
    pub ended: bool,
}

/// A session started on a [`MemoryClient`](super::MemoryClient)
pub struct MemorySession {
    pub(crate) client: Arc<ClientInner>,
    defaults: SessionOptions,
    pub(crate) core: Mutex<SessionCore>,
}

impl MemorySession {
    pub(crate) fn new(client: Arc<ClientInner>, defaults: SessionOptions) -> Self {
        let server_session = client.checkout_session();
        Self {
            client,
            defaults,
            core: Mutex::new(SessionCore {
                server_session,
                state: TransactionState::None,
                txn_options: None,
                pinned: None,
                dirty: false,
                ended: false,
            }),
        }
    }

    /// Explicit options win over session defaults, which win over the client's
    fn resolve_options(&self, explicit: Option<TransactionOptions>) -> TransactionOptions {
        let explicit = explicit.unwrap_or_default();
        let defaults = self.defaults.default_transaction_options.clone().unwrap_or_default();
        let client = &self.client.options;
        TransactionOptions {
            read_concern: explicit
                .read_concern
                .or(defaults.read_concern)
                .or_else(|| client.read_concern.clone()),
            write_concern: explicit
                .write_concern
                .or(defaults.write_concern)
                .or_else(|| client.write_concern.clone()),
            read_preference: explicit
                .read_preference
                .or(defaults.read_preference)
                .or_else(|| client.read_preference.clone()),
            max_commit_time_ms: explicit.max_commit_time_ms.or(defaults.max_commit_time_ms),
        }
    }

    /// Builds `commitTransaction`/`abortTransaction` for the current
    /// transaction and picks the server it goes to.
    fn finish_command(&self, core: &SessionCore, name: &str) -> (Document, ServerAddress, TxnKey) {
        let txn_number = core.server_session.txn_number;
        let mut command = Document::new();
        command.insert(name, 1);
        command.insert("lsid", core.server_session.lsid.clone());
        command.insert("txnNumber", Bson::Int64(txn_number));
        command.insert("autocommit", false);
        if let Some(options) = &core.txn_options {
            if let Some(write_concern) = &options.write_concern {
                command.insert("writeConcern", write_concern.to_document());
            }
            if let (Some(ms), "commitTransaction") = (options.max_commit_time_ms, name) {
                command.insert("maxTimeMS", ms);
            }
        }
        let server = core
            .pinned
            .clone()
            .unwrap_or_else(|| self.client.select_server(None));
        let key = TxnKey {
            session: core.server_session.key,
            txn_number,
        };
        (command, server, key)
    }
}

#[async_trait]
impl Session for MemorySession {
    fn id(&self) -> Document {
        self.core.lock().server_session.lsid.clone()
    }

    fn transaction_state(&self) -> TransactionState {
        self.core.lock().state
    }

    fn pinned_server(&self) -> Option<ServerAddress> {
        self.core.lock().pinned.clone()
    }

    fn is_dirty(&self) -> bool {
        self.core.lock().dirty
    }

    fn has_ended(&self) -> bool {
        self.core.lock().ended
    }

    async fn start_transaction(&self, options: Option<TransactionOptions>) -> Result<()> {
        let options = self.resolve_options(options);
        if options
            .write_concern
            .as_ref()
            .map(|wc| wc.is_unacknowledged())
            .unwrap_or(false)
        {
            return Err(Error::invalid_argument(
                "transactions do not support unacknowledged write concern",
            ));
        }

        let mut core = self.core.lock();
        if core.ended {
            return Err(Error::session("Cannot start a transaction on an ended session"));
        }
        core.state = core.state.start()?;
        core.server_session.txn_number += 1;
        core.txn_options = Some(options);
        core.pinned = None;
        debug!(
            "Started transaction {} on session {}",
            core.server_session.txn_number, core.server_session.key
        );
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<()> {
        let (command, server, key) = {
            let mut core = self.core.lock();
            let previous = core.state;
            core.state = previous.commit()?;
            if previous == TransactionState::Starting {
                // nothing was sent, so there is nothing to commit server-side
                return Ok(());
            }
            self.finish_command(&core, "commitTransaction")
        };

        let result = self.client.dispatch(&server, "admin", command, |state| {
            state.commit(key)?;
            Ok(((), doc! { "ok": 1.0 }))
        });
        result.map_err(|mut error| {
            let unknown = error.is_network_error()
                || error.code().map(is_unknown_commit_code).unwrap_or(false);
            if unknown {
                error.add_label(UNKNOWN_TRANSACTION_COMMIT_RESULT);
            }
            if error.is_network_error() {
                self.core.lock().dirty = true;
            }
            error
        })
    }

    async fn abort_transaction(&self) -> Result<()> {
        let (command, server, key) = {
            let mut core = self.core.lock();
            let previous = core.state;
            core.state = previous.abort()?;
            if previous == TransactionState::Starting {
                core.pinned = None;
                return Ok(());
            }
            let finish = self.finish_command(&core, "abortTransaction");
            core.pinned = None;
            finish
        };

        let result = self.client.dispatch(&server, "admin", command, |state| {
            state.abort(key)?;
            Ok(((), doc! { "ok": 1.0 }))
        });
        if let Err(error) = result {
            // abort errors are never reported to the application
            debug!("Ignoring abortTransaction failure: {}", error);
            if error.is_network_error() {
                self.core.lock().dirty = true;
            }
        }
        Ok(())
    }

    async fn end(&self) {
        if self.has_ended() {
            return;
        }
        if self.transaction_state().is_active() {
            let _ = self.abort_transaction().await;
        }
        let (server_session, dirty) = {
            let mut core = self.core.lock();
            core.ended = true;
            core.pinned = None;
            (core.server_session.clone(), core.dirty)
        };
        if !dirty {
            self.client.checkin_session(server_session);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
