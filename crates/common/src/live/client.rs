//! Clients wrapping `mongodb::Client`

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use mongodb::event::command as driver_event;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::collection::LiveChangeStream;
use super::convert;
use super::database::LiveDatabase;
use super::session::{ended, LiveSession, Pins};
use crate::driver::{ChangeStream, Client, Database, Session};
use crate::event::{
    CommandEvent, CommandEventHandler, CommandFailedEvent, CommandStartedEvent,
    CommandSucceededEvent,
};
use crate::options::{ChangeStreamOptions, ClientOptions, DatabaseOptions, SessionOptions};
use crate::types::{DeploymentInfo, ServerAddress, TopologyType};
use crate::Result;

/// Translates the driver's command events and forwards them to the handler
/// the client was created with, tracking sharded transaction pins on the way
struct EventTap {
    handler: Option<Arc<dyn CommandEventHandler>>,
    pins: Option<Arc<Pins>>,
    /// lsid of each in-flight command, for unpinning on failure
    in_flight: Mutex<HashMap<i32, Document>>,
}

impl EventTap {
    fn forward(&self, event: CommandEvent) {
        if let Some(handler) = &self.handler {
            handler.handle_command_event(event);
        }
    }
}

impl driver_event::CommandEventHandler for EventTap {
    fn handle_command_started_event(&self, event: driver_event::CommandStartedEvent) {
        let connection = convert::from_driver_address(&event.connection.address);
        if let Some(pins) = &self.pins {
            pins.observe_command(&event.command, connection.clone());
            if let Ok(lsid) = event.command.get_document("lsid") {
                self.in_flight.lock().insert(event.request_id, lsid.clone());
            }
        }
        self.forward(CommandEvent::Started(CommandStartedEvent {
            command: event.command,
            database_name: event.db,
            command_name: event.command_name,
            request_id: event.request_id,
            connection,
        }));
    }

    fn handle_command_succeeded_event(&self, event: driver_event::CommandSucceededEvent) {
        self.in_flight.lock().remove(&event.request_id);
        self.forward(CommandEvent::Succeeded(CommandSucceededEvent {
            reply: event.reply,
            command_name: event.command_name,
            duration: event.duration,
            request_id: event.request_id,
            connection: convert::from_driver_address(&event.connection.address),
        }));
    }

    fn handle_command_failed_event(&self, event: driver_event::CommandFailedEvent) {
        let failure = convert::error(event.failure);
        let lsid = self.in_flight.lock().remove(&event.request_id);
        if let Some(pins) = &self.pins {
            pins.observe_failure(lsid.as_ref(), &failure);
        }
        self.forward(CommandEvent::Failed(CommandFailedEvent {
            failure,
            command_name: event.command_name,
            duration: event.duration,
            request_id: event.request_id,
            connection: convert::from_driver_address(&event.connection.address),
        }));
    }
}

pub struct LiveClient {
    inner: mongodb::Client,
    hosts: Vec<ServerAddress>,
    info: DeploymentInfo,
    pins: Arc<Pins>,
}

impl LiveClient {
    /// Connect to the cluster at `uri` with the runner's `options` layered on
    /// top of the connection string
    pub async fn connect(uri: &str, info: DeploymentInfo, options: ClientOptions) -> Result<Self> {
        let uri = convert::uri_with_options(uri, &options.uri_options)?;
        let mut driver_options = mongodb::options::ClientOptions::parse(&uri)
            .await
            .map_err(convert::error)?;
        if !options.hosts.is_empty() {
            driver_options.hosts = options.hosts.iter().map(convert::to_driver_address).collect();
        }
        if options.app_name.is_some() {
            driver_options.app_name = options.app_name.clone();
        }
        if options.retry_writes.is_some() {
            driver_options.retry_writes = options.retry_writes;
        }
        if let Some(read_concern) = &options.read_concern {
            driver_options.read_concern = Some(convert::read_concern(read_concern));
        }
        if let Some(write_concern) = &options.write_concern {
            driver_options.write_concern = Some(convert::write_concern(write_concern)?);
        }
        if let Some(read_preference) = &options.read_preference {
            driver_options.selection_criteria = Some(convert::selection_criteria(read_preference)?);
        }

        let pins = Arc::new(Pins::default());
        let tap = EventTap {
            handler: options.command_event_handler.clone(),
            pins: (info.topology == TopologyType::Sharded).then(|| pins.clone()),
            in_flight: Mutex::new(HashMap::new()),
        };
        driver_options.command_event_handler = Some(Arc::new(tap));

        let hosts: Vec<ServerAddress> = driver_options
            .hosts
            .iter()
            .map(convert::from_driver_address)
            .collect();
        let inner = mongodb::Client::with_options(driver_options).map_err(convert::error)?;
        debug!("Connected live client to {:?}", hosts);
        Ok(Self {
            inner,
            hosts,
            info,
            pins,
        })
    }
}

#[async_trait]
impl Client for LiveClient {
    fn database(&self, name: &str, options: DatabaseOptions) -> Arc<dyn Database> {
        Arc::new(LiveDatabase::new(&self.inner, name, options))
    }

    fn hosts(&self) -> Vec<ServerAddress> {
        self.hosts.clone()
    }

    async fn deployment_info(&self) -> Result<DeploymentInfo> {
        Ok(self.info.clone())
    }

    async fn start_session(&self, options: SessionOptions) -> Result<Arc<dyn Session>> {
        let options = convert::session_options(&options)?;
        let session = self
            .inner
            .start_session(Some(options))
            .await
            .map_err(convert::error)?;
        Ok(Arc::new(LiveSession::new(session, self.pins.clone())))
    }

    async fn list_databases(
        &self,
        filter: Option<Document>,
        session: Option<&dyn Session>,
    ) -> Result<Vec<Document>> {
        let mut command = doc! { "listDatabases": 1 };
        if let Some(filter) = filter {
            command.insert("filter", filter);
        }
        let admin = self.inner.database("admin");
        let reply = with_session!(
            session,
            s => admin.run_command_with_session(command, None, s),
            admin.run_command(command, None)
        )?;
        Ok(reply
            .get_array("databases")
            .map(|databases| {
                databases
                    .iter()
                    .filter_map(Bson::as_document)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn watch(
        &self,
        pipeline: Vec<Document>,
        options: ChangeStreamOptions,
        session: Option<&dyn Session>,
    ) -> Result<Box<dyn ChangeStream>> {
        let options = LiveChangeStream::driver_options(&options)?;
        let stream = match session {
            Some(session) => {
                let live = LiveSession::from_dyn(session)?;
                let mut slot = live.slot.lock().await;
                let driver_session = slot.as_mut().ok_or_else(ended)?;
                let stream = live.record(
                    self.inner
                        .watch_with_session(pipeline, options, driver_session)
                        .await,
                )?;
                LiveChangeStream::with_session(stream.with_type::<Document>(), live.slot.clone())
            }
            None => {
                let stream = self.inner.watch(pipeline, options).await.map_err(convert::error)?;
                LiveChangeStream::new(stream.with_type::<Document>())
            }
        };
        Ok(Box::new(stream))
    }

    async fn shutdown(&self) {
        self.inner.clone().shutdown_immediate().await;
        debug!("Shut down live client for {:?}", self.hosts);
    }
}
