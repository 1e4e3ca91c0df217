//! Deployment backed by a running cluster
//!
//! Every handle wraps its counterpart from the `mongodb` driver. Command
//! monitoring events from the driver are translated and handed to the
//! handler in [`ClientOptions`]; sessions keep the transaction state the
//! runner asserts on.
//!
//! ```text
//! LiveDeployment ──connect(uri + options)──▶ LiveClient ──▶ LiveDatabase ──▶ LiveCollection
//!        │                                       │
//!        └── DeploymentInfo (discovered once)    └── EventTap ──▶ CommandEventHandler
//! ```

/// Runs a driver call on the `ClientSession` behind `$session` when there is
/// one, and the session-less call otherwise
macro_rules! with_session {
    ($session:expr, $driver_session:ident => $with:expr, $without:expr) => {
        match $session {
            Some(session) => {
                let live = $crate::live::session::LiveSession::from_dyn(session)?;
                let mut slot = live.slot.lock().await;
                let $driver_session = slot.as_mut().ok_or_else($crate::live::session::ended)?;
                live.record($with.await)
            }
            None => $without.await.map_err($crate::live::convert::error),
        }
    };
}

mod client;
mod collection;
mod convert;
mod database;
mod session;

use async_trait::async_trait;
use bson::{doc, Document};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::driver::{Client, Deployment};
use crate::options::ClientOptions;
use crate::types::{DeploymentInfo, TopologyType};
use crate::Result;

pub use client::LiveClient;
pub use session::LiveSession;

/// Connection string used when none is configured
pub const DEFAULT_URI: &str = "mongodb://localhost:27017";

/// A cluster reached through a connection string
pub struct LiveDeployment {
    uri: String,
    info: OnceCell<DeploymentInfo>,
}

impl LiveDeployment {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            info: OnceCell::new(),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Facts about the cluster, read on first use
    pub async fn info(&self) -> Result<&DeploymentInfo> {
        self.info.get_or_try_init(|| discover(&self.uri)).await
    }
}

impl Default for LiveDeployment {
    fn default() -> Self {
        Self::new(DEFAULT_URI)
    }
}

#[async_trait]
impl Deployment for LiveDeployment {
    async fn connect(&self, options: ClientOptions) -> Result<Arc<dyn Client>> {
        let info = self.info().await?.clone();
        let client = LiveClient::connect(&self.uri, info, options).await?;
        Ok(Arc::new(client))
    }
}

/// Reads topology, version and server parameters with an unmonitored client
async fn discover(uri: &str) -> Result<DeploymentInfo> {
    let parsed = mongodb::options::ClientOptions::parse(uri)
        .await
        .map_err(convert::error)?;
    let client = mongodb::Client::with_uri_str(uri).await.map_err(convert::error)?;
    let admin = client.database("admin");

    let hello = match admin.run_command(doc! { "hello": 1 }, None).await {
        Ok(reply) => reply,
        Err(e) => {
            debug!("hello failed ({}), falling back to isMaster", e);
            admin
                .run_command(doc! { "isMaster": 1 }, None)
                .await
                .map_err(convert::error)?
        }
    };
    let build_info = admin
        .run_command(doc! { "buildInfo": 1 }, None)
        .await
        .map_err(convert::error)?;
    let server_parameters = match admin.run_command(doc! { "getParameter": "*" }, None).await {
        Ok(parameters) => parameters,
        Err(e) => {
            debug!("getParameter failed: {}", e);
            Document::new()
        }
    };

    let topology = if hello.get_str("msg").map(|msg| msg == "isdbgrid").unwrap_or(false) {
        TopologyType::Sharded
    } else if parsed.load_balanced == Some(true) {
        TopologyType::LoadBalanced
    } else if hello.contains_key("setName") {
        TopologyType::ReplicaSet
    } else {
        TopologyType::Single
    };

    let sharded_replica_set = if topology == TopologyType::Sharded {
        let shards = admin
            .run_command(doc! { "listShards": 1 }, None)
            .await
            .map_err(convert::error)?;
        shards
            .get_array("shards")
            .map(|shards| {
                shards.iter().all(|shard| {
                    shard
                        .as_document()
                        .and_then(|shard| shard.get_str("host").ok())
                        .map(|host| host.contains('/'))
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    } else {
        false
    };

    let info = DeploymentInfo {
        version: build_info.get_str("version").unwrap_or("0.0.0").to_string(),
        topology,
        sharded_replica_set,
        serverless: false,
        auth_enabled: parsed.credential.is_some(),
        hosts: parsed.hosts.iter().map(convert::from_driver_address).collect(),
        server_parameters,
    };
    info!(
        "Discovered {} deployment at {} (version {}, hosts {:?})",
        info.topology, uri, info.version, info.hosts
    );
    Ok(info)
}
