//! Test runner: loads files, prepares the deployment, runs every test and
//! collects results

use bson::{doc, Bson};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use unified_common::options::{
    ClientOptions, CreateCollectionOptions, DropCollectionOptions, FindOptions, InsertManyOptions,
    NamespaceOptions,
};
use unified_common::{
    Client, Deployment, DeploymentInfo, LiveDeployment, ReadConcern, ReadPreference, TopologyType,
    WriteConcern,
};

use crate::config::RunnerConfig;
use crate::entity::EntityMap;
use crate::error::{RunnerError, RunnerResult};
use crate::matcher::{self, Actual};
use crate::operation::{EnabledFailPoint, ExecutionContext};
use crate::test_file::{requirements_satisfied, CollectionData, TestCase, TestFile};

/// Server code for an interrupted operation, expected from `killAllSessions`
const INTERRUPTED: i32 = 11601;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    Passed,
    Failed,
    Skipped,
}

/// Result of running a single test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub description: String,
    pub outcome: TestOutcome,
    pub duration_ms: u64,
    /// Failure message, or why the test was skipped
    pub message: Option<String>,
}

impl TestResult {
    fn skipped(test: &TestCase, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        info!("- {} (skipped: {})", test.description, reason);
        Self {
            description: test.description.clone(),
            outcome: TestOutcome::Skipped,
            duration_ms: 0,
            message: Some(reason),
        }
    }

    fn finished(test: &TestCase, start: Instant, failure: Option<&RunnerError>) -> Self {
        let duration_ms = start.elapsed().as_millis() as u64;
        match failure {
            None => {
                info!("✓ {} ({} ms)", test.description, duration_ms);
                Self {
                    description: test.description.clone(),
                    outcome: TestOutcome::Passed,
                    duration_ms,
                    message: None,
                }
            }
            Some(e) => {
                error!("✗ {} - {}", test.description, e);
                Self {
                    description: test.description.clone(),
                    outcome: TestOutcome::Failed,
                    duration_ms,
                    message: Some(e.to_string()),
                }
            }
        }
    }
}

/// Result of running one test file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileResult {
    pub path: Option<PathBuf>,
    pub description: Option<String>,
    pub duration_ms: u64,
    pub results: Vec<TestResult>,
    /// Set when the file could not be loaded or a test hit an error that
    /// stops the rest of the file
    pub error: Option<String>,
}

impl FileResult {
    fn failed_to_load(path: &Path, e: &RunnerError) -> Self {
        error!("✗ {} - {}", path.display(), e);
        Self {
            path: Some(path.to_path_buf()),
            description: None,
            duration_ms: 0,
            results: Vec::new(),
            error: Some(e.to_string()),
        }
    }

    fn count(&self, outcome: TestOutcome) -> usize {
        self.results.iter().filter(|r| r.outcome == outcome).count()
    }
}

/// Result of running all files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSuiteResult {
    pub timestamp: DateTime<Utc>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Files that failed to load or were aborted
    pub errors: usize,
    pub duration_ms: u64,
    pub files: Vec<FileResult>,
}

impl TestSuiteResult {
    pub fn from_files(files: Vec<FileResult>, duration_ms: u64) -> Self {
        let passed = files.iter().map(|f| f.count(TestOutcome::Passed)).sum();
        let failed = files.iter().map(|f| f.count(TestOutcome::Failed)).sum();
        let skipped = files.iter().map(|f| f.count(TestOutcome::Skipped)).sum();
        let errors = files.iter().filter(|f| f.error.is_some()).count();
        Self {
            timestamp: Utc::now(),
            total: passed + failed + skipped,
            passed,
            failed,
            skipped,
            errors,
            duration_ms,
            files,
        }
    }

    pub fn success(&self) -> bool {
        self.failed == 0 && self.errors == 0
    }
}

/// Connections the runner holds for setup and teardown
struct Connection {
    internal_client: Arc<dyn Client>,
    /// One client per mongos on sharded deployments
    router_clients: Vec<Arc<dyn Client>>,
    info: DeploymentInfo,
}

/// Main unified test runner
pub struct TestRunner {
    config: RunnerConfig,
    deployment: Arc<dyn Deployment>,
    connection: Option<Connection>,
    /// Only tests with this description run
    test_filter: Option<String>,
}

impl Default for TestRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl TestRunner {
    /// Create a new test runner with default configuration
    pub fn new() -> Self {
        Self::with_config(RunnerConfig::default())
    }

    /// Create a test runner against the deployment at `config.uri`
    pub fn with_config(config: RunnerConfig) -> Self {
        let deployment = Arc::new(LiveDeployment::new(config.uri.clone()));
        Self::with_deployment(config, deployment)
    }

    /// Create a test runner against any deployment
    pub fn with_deployment(config: RunnerConfig, deployment: Arc<dyn Deployment>) -> Self {
        Self {
            config,
            deployment,
            connection: None,
            test_filter: None,
        }
    }

    /// Run only the test with this description
    pub fn filter_test(&mut self, description: impl Into<String>) {
        self.test_filter = Some(description.into());
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Connect the internal clients and read the deployment's facts
    pub async fn connect(&mut self) -> RunnerResult<()> {
        if self.connection.is_some() {
            return Ok(()); // Already connected
        }

        let internal_client = self.deployment.connect(ClientOptions::default()).await?;
        let info = internal_client.deployment_info().await?;
        let mut router_clients = Vec::new();
        if info.topology == TopologyType::Sharded {
            for host in &info.hosts {
                let options = ClientOptions {
                    hosts: vec![host.clone()],
                    ..Default::default()
                };
                router_clients.push(self.deployment.connect(options).await?);
            }
        }
        info!(
            "Connected to {} deployment, server version {} ({} host(s))",
            info.topology,
            info.version,
            info.hosts.len()
        );

        self.connection = Some(Connection {
            internal_client,
            router_clients,
            info,
        });
        Ok(())
    }

    /// Shut down the internal clients
    pub async fn shutdown(&mut self) {
        if let Some(connection) = self.connection.take() {
            for client in connection.router_clients {
                client.shutdown().await;
            }
            connection.internal_client.shutdown().await;
        }
    }

    fn connection(&self) -> RunnerResult<&Connection> {
        self.connection
            .as_ref()
            .ok_or_else(|| RunnerError::AssertionFailed("runner is not connected".to_string()))
    }

    /// Run all test files in the specs directory
    pub async fn run_all(&mut self) -> RunnerResult<TestSuiteResult> {
        let paths = TestFile::discover(&self.config.specs_dir)?;
        self.run_paths(&paths).await
    }

    /// Run a list of test files
    pub async fn run_paths(&mut self, paths: &[PathBuf]) -> RunnerResult<TestSuiteResult> {
        let start = Instant::now();
        self.connect().await?;

        info!("Running {} test file(s)...", paths.len());
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            files.push(self.run_file(path).await?);
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        let suite = TestSuiteResult::from_files(files, duration_ms);

        info!("");
        info!(
            "Test Results: {} passed, {} failed, {} skipped, {} file error(s) ({} ms)",
            suite.passed, suite.failed, suite.skipped, suite.errors, duration_ms
        );
        Ok(suite)
    }

    /// Load and run a single file. Load failures are reported in the result.
    pub async fn run_file(&mut self, path: &Path) -> RunnerResult<FileResult> {
        let file = match TestFile::from_file(path, &self.config.schema_versions()) {
            Ok(file) => file,
            Err(e) if e.is_spec_load() => return Ok(FileResult::failed_to_load(path, &e)),
            Err(e) => return Err(e),
        };
        self.run_test_file(&file).await
    }

    /// Run every test of a parsed file
    pub async fn run_test_file(&mut self, file: &TestFile) -> RunnerResult<FileResult> {
        let start = Instant::now();
        self.connect().await?;
        info!("Running '{}'", file.description);

        let mut result = FileResult {
            path: file.path.clone(),
            description: Some(file.description.clone()),
            duration_ms: 0,
            results: Vec::new(),
            error: None,
        };

        if !self.config.supports(file.schema_version) {
            let e = RunnerError::UnsupportedSchemaVersion {
                version: file.schema_version,
                min: self.config.min_schema_version,
                max: self.config.max_schema_version,
            };
            error!("✗ {} - {}", file.description, e);
            result.error = Some(e.to_string());
            return Ok(result);
        }

        let tests = file.tests.iter().filter(|test| {
            self.test_filter
                .as_deref()
                .map(|name| name == test.description)
                .unwrap_or(true)
        });

        let info = self.connection()?.info.clone();
        if !requirements_satisfied(file.run_on_requirements.as_deref(), &info)? {
            info!("Skipping '{}': no runOnRequirements entry is satisfied", file.description);
            result.results = tests
                .map(|test| TestResult::skipped(test, "file runOnRequirements not satisfied"))
                .collect();
            return Ok(result);
        }

        for test in tests {
            let test_start = Instant::now();
            match self.run_test(file, test, &info).await {
                Ok(test_result) => result.results.push(test_result),
                Err(e) => {
                    result.results.push(TestResult::finished(test, test_start, Some(&e)));
                    error!("Aborting '{}': {}", file.description, e);
                    result.error = Some(e.to_string());
                    break;
                }
            }
        }

        result.duration_ms = start.elapsed().as_millis() as u64;
        Ok(result)
    }

    /// Run one test. `Err` is reserved for failures that stop the file.
    async fn run_test(
        &self,
        file: &TestFile,
        test: &TestCase,
        info: &DeploymentInfo,
    ) -> RunnerResult<TestResult> {
        if let Some(reason) = &test.skip_reason {
            return Ok(TestResult::skipped(test, reason.clone()));
        }
        if self.config.is_skipped(&file.description, &test.description) {
            return Ok(TestResult::skipped(test, "listed in the skip list"));
        }
        if !requirements_satisfied(test.run_on_requirements.as_deref(), info)? {
            return Ok(TestResult::skipped(test, "runOnRequirements not satisfied"));
        }

        let start = Instant::now();
        debug!("Running test: {}", test.description);

        let mut entities = EntityMap::new();
        let mut fail_points = Vec::new();
        let mut result = self
            .execute_test(file, test, info, &mut entities, &mut fail_points)
            .await;

        self.disable_fail_points(fail_points).await;
        for (_, client) in entities.clients() {
            client.events.stop();
        }
        if result.is_ok() {
            result = self.check_events(test, &entities);
        }
        if result.is_ok() {
            result = self.check_outcome(test, &entities).await;
        }
        self.terminate_sessions().await;
        entities.close().await;

        match result {
            Err(e) if e.is_fatal() => Err(e),
            result => Ok(TestResult::finished(test, start, result.err().as_ref())),
        }
    }

    async fn execute_test(
        &self,
        file: &TestFile,
        test: &TestCase,
        info: &DeploymentInfo,
        entities: &mut EntityMap,
        fail_points: &mut Vec<EnabledFailPoint>,
    ) -> RunnerResult<()> {
        let connection = self.connection()?;
        self.load_initial_data(&file.initial_data).await?;
        entities
            .create_entities(&file.create_entities, self.deployment.as_ref(), info)
            .await?;
        if info.topology == TopologyType::Sharded {
            self.prime_routers(entities).await;
        }

        let mut ctx = ExecutionContext {
            entities,
            internal_client: &connection.internal_client,
            fail_points,
            change_stream_wait: self.config.change_stream_wait(),
        };
        for (index, operation) in test.operations.iter().enumerate() {
            let result = operation.execute(&mut ctx).await?;
            operation.check(result, ctx.entities).map_err(|e| match e {
                RunnerError::Mismatch(message) => {
                    RunnerError::Mismatch(format!("operation {} ({}): {}", index, operation.name, message))
                }
                other => other,
            })?;
        }
        Ok(())
    }

    /// Reset each collection to its initial documents
    async fn load_initial_data(&self, initial_data: &[CollectionData]) -> RunnerResult<()> {
        let client = &self.connection()?.internal_client;
        let options = NamespaceOptions {
            write_concern: Some(WriteConcern::majority()),
            ..Default::default()
        };
        for data in initial_data {
            debug!(
                "Loading {} document(s) into {}.{}",
                data.documents.len(),
                data.database_name,
                data.collection_name
            );
            let database = client.database(&data.database_name, options.clone());
            let drop_options = DropCollectionOptions {
                write_concern: Some(WriteConcern::majority()),
            };
            database
                .drop_collection(&data.collection_name, drop_options, None)
                .await?;
            if data.documents.is_empty() {
                let create_options = CreateCollectionOptions {
                    write_concern: Some(WriteConcern::majority()),
                };
                database
                    .create_collection(&data.collection_name, create_options, None)
                    .await?;
            } else {
                database
                    .collection(&data.collection_name, options.clone())
                    .insert_many(data.documents.clone(), InsertManyOptions::default(), None)
                    .await?;
            }
        }
        Ok(())
    }

    /// Send a `distinct` through every mongos so each one has seen every
    /// collection before the test runs
    async fn prime_routers(&self, entities: &EntityMap) {
        let Ok(connection) = self.connection() else {
            return;
        };
        for (id, collection) in entities.collections() {
            let ns = collection.namespace();
            for router in &connection.router_clients {
                let result = router
                    .database(&ns.db, Default::default())
                    .collection(&ns.coll, Default::default())
                    .distinct("_id", doc! {}, None)
                    .await;
                if let Err(e) = result {
                    warn!("distinct on '{}' ({}) failed: {}", id, ns, e);
                }
            }
        }
    }

    async fn disable_fail_points(&self, fail_points: Vec<EnabledFailPoint>) {
        for fail_point in fail_points {
            match fail_point.disable().await {
                Ok(()) => debug!("Disabled fail point '{}'", fail_point.name),
                Err(e) => warn!("Failed to disable fail point '{}': {}", fail_point.name, e),
            }
        }
    }

    fn check_events(&self, test: &TestCase, entities: &EntityMap) -> RunnerResult<()> {
        for expected in test.expect_events.iter().flatten() {
            let client = entities.client(&expected.client)?;
            let actual = client.events.events();
            let ignore_extra = expected.ignore_extra_events.unwrap_or(false);
            if !matcher::matches_events(&expected.events, &actual, entities, ignore_extra)? {
                let captured: Vec<String> = actual
                    .iter()
                    .map(|e| format!("{}:{}", e.type_name(), e.command_name()))
                    .collect();
                return Err(RunnerError::Mismatch(format!(
                    "events of client '{}' do not match: expected {:?}, captured {:?}",
                    expected.client, expected.events, captured
                )));
            }
        }
        Ok(())
    }

    async fn check_outcome(&self, test: &TestCase, entities: &EntityMap) -> RunnerResult<()> {
        let client = &self.connection()?.internal_client;
        let options = NamespaceOptions {
            read_concern: Some(ReadConcern::local()),
            read_preference: Some(ReadPreference::primary()),
            ..Default::default()
        };
        for data in test.outcome.iter().flatten() {
            let find_options = FindOptions {
                sort: Some(doc! { "_id": 1 }),
                ..Default::default()
            };
            let actual: Vec<Bson> = client
                .database(&data.database_name, options.clone())
                .collection(&data.collection_name, options.clone())
                .find(doc! {}, find_options, None)
                .await?
                .into_iter()
                .map(Bson::Document)
                .collect();
            let expected = Bson::Array(data.documents.iter().cloned().map(Bson::Document).collect());
            if !matcher::matches(&expected, Actual::Array(&actual), entities)? {
                return Err(RunnerError::Mismatch(format!(
                    "outcome of {}.{}: expected {}, found {}",
                    data.database_name,
                    data.collection_name,
                    expected,
                    Bson::Array(actual)
                )));
            }
        }
        Ok(())
    }

    /// Abort any transaction a test left open
    async fn terminate_sessions(&self) {
        let Ok(connection) = self.connection() else {
            return;
        };
        let clients: Vec<&Arc<dyn Client>> = if connection.router_clients.is_empty() {
            vec![&connection.internal_client]
        } else {
            connection.router_clients.iter().collect()
        };
        for client in clients {
            let result = client
                .database("admin", Default::default())
                .run_command(doc! { "killAllSessions": [] }, Default::default(), None)
                .await;
            match result {
                Ok(_) => {}
                Err(e) if e.code() == Some(INTERRUPTED) => {}
                Err(e) => warn!("killAllSessions failed: {}", e),
            }
        }
    }

    /// Write test results to JSON file
    pub fn write_results(&self, results: &TestSuiteResult) -> RunnerResult<PathBuf> {
        std::fs::create_dir_all(&self.config.output_dir)?;

        let path = self.config.output_dir.join("test-results.json");
        let json = serde_json::to_string_pretty(results)?;
        std::fs::write(&path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path)
    }
}
