//! Core types shared between driver implementations and the runner

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

/// Address of a single server in a deployment
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Deployment topology as reported by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TopologyType {
    Single,
    ReplicaSet,
    Sharded,
    LoadBalanced,
}

impl Default for TopologyType {
    fn default() -> Self {
        Self::ReplicaSet
    }
}

impl fmt::Display for TopologyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyType::Single => write!(f, "single"),
            TopologyType::ReplicaSet => write!(f, "replicaset"),
            TopologyType::Sharded => write!(f, "sharded"),
            TopologyType::LoadBalanced => write!(f, "load-balanced"),
        }
    }
}

/// Facts about the deployment used to evaluate run-on requirements
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentInfo {
    pub version: String,
    pub topology: TopologyType,
    /// Shards are replica sets (only meaningful for sharded topologies)
    #[serde(default)]
    pub sharded_replica_set: bool,
    #[serde(default)]
    pub serverless: bool,
    #[serde(default)]
    pub auth_enabled: bool,
    /// Every server a client may be routed to (mongoses for sharded clusters)
    pub hosts: Vec<ServerAddress>,
    #[serde(default)]
    pub server_parameters: Document,
}

/// Fully-qualified collection name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

/// Client-side transaction state of a session.
///
/// ```text
/// none ──start──▶ starting ──first op──▶ in_progress ──commit──▶ committed
///                    │                        │
///                    └────────abort───────────┴──abort──▶ aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    None,
    Starting,
    InProgress,
    Committed,
    Aborted,
}

impl Default for TransactionState {
    fn default() -> Self {
        Self::None
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::None => write!(f, "none"),
            TransactionState::Starting => write!(f, "starting"),
            TransactionState::InProgress => write!(f, "in_progress"),
            TransactionState::Committed => write!(f, "committed"),
            TransactionState::Aborted => write!(f, "aborted"),
        }
    }
}

impl std::str::FromStr for TransactionState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "starting" => Ok(Self::Starting),
            "in_progress" => Ok(Self::InProgress),
            "committed" => Ok(Self::Committed),
            "aborted" => Ok(Self::Aborted),
            other => Err(Error::invalid_argument(format!(
                "unknown transaction state '{}'",
                other
            ))),
        }
    }
}

impl TransactionState {
    /// True while operations on the session run inside the transaction
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::InProgress)
    }

    /// Transition for `startTransaction`
    pub fn start(self) -> Result<Self> {
        if self.is_active() {
            return Err(Error::transaction("Transaction already in progress"));
        }
        Ok(Self::Starting)
    }

    /// Transition for `commitTransaction`
    pub fn commit(self) -> Result<Self> {
        match self {
            Self::None => Err(Error::transaction("No transaction started")),
            Self::Aborted => Err(Error::transaction(
                "Cannot call commitTransaction after calling abortTransaction",
            )),
            Self::Starting | Self::InProgress | Self::Committed => Ok(Self::Committed),
        }
    }

    /// Transition for `abortTransaction`
    pub fn abort(self) -> Result<Self> {
        match self {
            Self::None => Err(Error::transaction("No transaction started")),
            Self::Committed => Err(Error::transaction(
                "Cannot call abortTransaction after calling commitTransaction",
            )),
            Self::Aborted => Err(Error::transaction("Cannot call abortTransaction twice")),
            Self::Starting | Self::InProgress => Ok(Self::Aborted),
        }
    }
}

/// Read concern (`{level: ...}`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadConcern {
    pub level: String,
}

impl ReadConcern {
    pub fn local() -> Self {
        Self {
            level: "local".to_string(),
        }
    }

    pub fn majority() -> Self {
        Self {
            level: "majority".to_string(),
        }
    }

    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("level", self.level.clone());
        doc
    }
}

/// Write concern (`{w, j, wtimeout}`)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WriteConcern {
    #[serde(default)]
    pub w: Option<Bson>,
    #[serde(default, rename = "j")]
    pub journal: Option<bool>,
    #[serde(default, rename = "wtimeout")]
    pub w_timeout_ms: Option<i64>,
}

impl WriteConcern {
    pub fn majority() -> Self {
        Self {
            w: Some(Bson::String("majority".to_string())),
            ..Default::default()
        }
    }

    /// `w: 0` requests no acknowledgement
    pub fn is_unacknowledged(&self) -> bool {
        matches!(
            self.w,
            Some(Bson::Int32(0)) | Some(Bson::Int64(0))
        ) && self.journal != Some(true)
    }

    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        if let Some(w) = &self.w {
            doc.insert("w", w.clone());
        }
        if let Some(j) = self.journal {
            doc.insert("j", j);
        }
        if let Some(t) = self.w_timeout_ms {
            doc.insert("wtimeout", t);
        }
        doc
    }
}

/// Read preference (`{mode: ...}`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadPreference {
    pub mode: String,
}

impl ReadPreference {
    pub fn primary() -> Self {
        Self {
            mode: "primary".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_state_machine() {
        let state = TransactionState::None.start().unwrap();
        assert_eq!(state, TransactionState::Starting);
        assert!(state.start().is_err());
        let committed = TransactionState::InProgress.commit().unwrap();
        assert_eq!(committed, TransactionState::Committed);
        // committing twice retries the commit
        assert_eq!(committed.commit().unwrap(), TransactionState::Committed);
        assert!(committed.abort().is_err());
        assert!(TransactionState::Aborted.abort().is_err());
        assert!(TransactionState::None.commit().is_err());
        assert_eq!(
            TransactionState::Committed.start().unwrap(),
            TransactionState::Starting
        );
    }

    #[test]
    fn test_transaction_state_round_trips_through_strings() {
        for state in [
            TransactionState::None,
            TransactionState::Starting,
            TransactionState::InProgress,
            TransactionState::Committed,
            TransactionState::Aborted,
        ] {
            assert_eq!(state.to_string().parse::<TransactionState>().unwrap(), state);
        }
        assert!("pending".parse::<TransactionState>().is_err());
    }

    #[test]
    fn test_write_concern_acknowledgement() {
        let wc = WriteConcern {
            w: Some(Bson::Int32(0)),
            ..Default::default()
        };
        assert!(wc.is_unacknowledged());
        assert!(!WriteConcern::majority().is_unacknowledged());
        assert_eq!(WriteConcern::majority().to_document().get_str("w").unwrap(), "majority");
    }
}
