//! Unified Test Format Runner
//!
//! Interprets declarative JSON conformance tests against a driver
//! deployment:
//! - Loads and validates test files, checking the schema version
//! - Evaluates run-on requirements against the deployment
//! - Seeds collections, creates entities and runs each operation
//! - Matches results, errors, command events and collection outcomes
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TestRunner                              │
//! │    ├── run_file(path) -> FileResult                         │
//! │    ├── run_test(file, test) -> TestResult                   │
//! │    └── write_results(suite)                                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  TestFile (JSON)                                            │
//! │    ├── schemaVersion, runOnRequirements                     │
//! │    ├── createEntities -> EntityMap                          │
//! │    ├── initialData                                          │
//! │    └── tests: [TestCase]                                    │
//! │          ├── operations: [Operation] -> OperationResult     │
//! │          ├── expectEvents -> EventRecorder + matcher        │
//! │          └── outcome                                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  unified-common                                             │
//! │    └── Deployment / Client / Database / Collection / Session│
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod entity;
pub mod error;
pub mod events;
pub mod expectation;
pub mod matcher;
pub mod operation;
pub mod runner;
pub mod schema_version;
pub mod test_file;

pub use config::RunnerConfig;
pub use entity::{Entity, EntityMap};
pub use error::{RunnerError, RunnerResult};
pub use runner::{FileResult, TestOutcome, TestResult, TestRunner, TestSuiteResult};
pub use schema_version::SchemaVersion;
pub use test_file::{TestCase, TestFile};
