//! In-memory reference deployment
//!
//! Implements the driver interface against a simulated cluster held in
//! process memory. The deployment models the parts of a real cluster the
//! runner observes: command monitoring, logical sessions, transactions with
//! snapshot isolation, sharded pinning, `failCommand` fail points and change
//! streams.
//!
//! ```text
//! MemoryDeployment ──connect──▶ MemoryClient ──▶ MemoryDatabase ──▶ MemoryCollection
//!        │                          │
//!        └────── Arc<Shared> ◀──────┘  (ServerState behind a mutex)
//! ```

mod change_stream;
mod client;
mod collection;
mod database;
mod fail_point;
mod query;
mod session;
mod store;
mod update;

use async_trait::async_trait;
use bson::Document;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::driver::{Client, Deployment};
use crate::options::ClientOptions;
use crate::types::{DeploymentInfo, ServerAddress, TopologyType};
use crate::{Error, Result};

pub use client::MemoryClient;
pub use session::MemorySession;

use store::ServerState;

/// Shape of the simulated cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryDeploymentConfig {
    pub topology: TopologyType,
    /// Number of mongos routers for sharded topologies
    pub mongoses: usize,
    pub version: String,
    pub sharded_replica_set: bool,
    pub serverless: bool,
    pub auth_enabled: bool,
    pub server_parameters: Document,
}

impl Default for MemoryDeploymentConfig {
    fn default() -> Self {
        Self {
            topology: TopologyType::ReplicaSet,
            mongoses: 2,
            version: "7.0.0".to_string(),
            sharded_replica_set: true,
            serverless: false,
            auth_enabled: false,
            server_parameters: Document::new(),
        }
    }
}

/// State shared by every client connected to one deployment
pub(crate) struct Shared {
    pub config: MemoryDeploymentConfig,
    pub hosts: Vec<ServerAddress>,
    pub state: Mutex<ServerState>,
    request_ids: AtomicI32,
    cursor_ids: AtomicI64,
}

impl Shared {
    pub fn next_request_id(&self) -> i32 {
        self.request_ids.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_cursor_id(&self) -> i64 {
        self.cursor_ids.fetch_add(1, Ordering::SeqCst)
    }

    pub fn topology(&self) -> TopologyType {
        self.config.topology
    }

    pub fn info(&self) -> DeploymentInfo {
        let config = &self.config;
        DeploymentInfo {
            version: config.version.clone(),
            topology: config.topology,
            sharded_replica_set: config.topology == TopologyType::Sharded && config.sharded_replica_set,
            serverless: config.serverless,
            auth_enabled: config.auth_enabled,
            hosts: self.hosts.clone(),
            server_parameters: config.server_parameters.clone(),
        }
    }
}

/// A simulated cluster clients can connect to
#[derive(Clone)]
pub struct MemoryDeployment {
    shared: Arc<Shared>,
}

impl MemoryDeployment {
    pub fn new(config: MemoryDeploymentConfig) -> Self {
        let hosts = match config.topology {
            TopologyType::Sharded => (0..config.mongoses.max(1))
                .map(|i| ServerAddress::new("localhost", 27017 + i as u16))
                .collect(),
            _ => vec![ServerAddress::new("localhost", 27017)],
        };
        info!(
            "Starting in-memory {} deployment (version {}, hosts {:?})",
            config.topology, config.version, hosts
        );
        Self {
            shared: Arc::new(Shared {
                config,
                hosts,
                state: Mutex::new(ServerState::default()),
                request_ids: AtomicI32::new(1),
                cursor_ids: AtomicI64::new(1000),
            }),
        }
    }

    pub fn hosts(&self) -> &[ServerAddress] {
        &self.shared.hosts
    }

    pub fn info(&self) -> DeploymentInfo {
        self.shared.info()
    }
}

impl Default for MemoryDeployment {
    fn default() -> Self {
        Self::new(MemoryDeploymentConfig::default())
    }
}

#[async_trait]
impl Deployment for MemoryDeployment {
    async fn connect(&self, options: ClientOptions) -> Result<Arc<dyn Client>> {
        if let Some(unknown) = options
            .hosts
            .iter()
            .find(|host| !self.shared.hosts.contains(host))
        {
            return Err(Error::network(format!("no server available at {}", unknown)));
        }
        Ok(Arc::new(MemoryClient::new(self.shared.clone(), options)))
    }
}

/// Error as reported by a server for `code`
pub(crate) fn server_error(code: i32, message: impl Into<String>) -> Error {
    Error::command(code, code_name(code), message)
}

pub(crate) fn code_name(code: i32) -> &'static str {
    match code {
        2 => "BadValue",
        8 => "UnknownError",
        9 => "FailedToParse",
        13 => "Unauthorized",
        14 => "TypeMismatch",
        20 => "IllegalOperation",
        24 => "LockTimeout",
        26 => "NamespaceNotFound",
        27 => "IndexNotFound",
        28 => "PathNotViable",
        48 => "NamespaceExists",
        50 => "MaxTimeMSExpired",
        59 => "CommandNotFound",
        66 => "ImmutableField",
        72 => "InvalidOptions",
        86 => "IndexKeySpecsConflict",
        91 => "ShutdownInProgress",
        112 => "WriteConflict",
        189 => "PrimarySteppedDown",
        251 => "NoSuchTransaction",
        256 => "TransactionCommitted",
        262 => "ExceededTimeLimit",
        10107 => "NotWritablePrimary",
        11000 => "DuplicateKey",
        11600 => "InterruptedAtShutdown",
        11601 => "Interrupted",
        11602 => "InterruptedDueToReplStateChange",
        13435 => "NotPrimaryNoSecondaryOk",
        13436 => "NotPrimaryOrSecondary",
        40323 => "Location40323",
        40324 => "Location40324",
        _ => "",
    }
}

/// Codes after which a commit's outcome is unknown to the client
pub(crate) fn is_unknown_commit_code(code: i32) -> bool {
    matches!(
        code,
        6 | 7 | 50 | 89 | 91 | 189 | 262 | 9001 | 10107 | 11600 | 11602 | 13435 | 13436
    )
}

#[cfg(test)]
mod tests;
