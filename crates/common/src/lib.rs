//! Unified Runner Common Library
//!
//! The driver interface the test runner executes operations against, the
//! types shared across that interface, and its implementations: a deployment
//! backed by the `mongodb` driver and, with the `memory` feature, an
//! in-process test double.

pub mod driver;
pub mod error;
pub mod event;
pub mod live;
#[cfg(feature = "memory")]
pub mod memory;
pub mod options;
pub mod results;
pub mod types;

// Re-export commonly used types
pub use driver::{ChangeStream, Client, Collection, Database, Deployment, Session};
pub use error::{Error, ErrorKind, Result};
pub use event::{CommandEvent, CommandEventHandler};
pub use live::LiveDeployment;
#[cfg(feature = "memory")]
pub use memory::{MemoryDeployment, MemoryDeploymentConfig};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
