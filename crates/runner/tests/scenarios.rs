use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use unified_common::{MemoryDeployment, MemoryDeploymentConfig, TopologyType};
use unified_runner::config::SKIP_ALL;
use unified_runner::{RunnerConfig, TestFile, TestOutcome, TestRunner};

fn bundled_specs() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests").join("spec")
}

fn memory_runner(config: RunnerConfig, deployment: MemoryDeploymentConfig) -> TestRunner {
    TestRunner::with_deployment(config, Arc::new(MemoryDeployment::new(deployment)))
}

fn runner_in(dir: &TempDir) -> TestRunner {
    let config = RunnerConfig {
        specs_dir: dir.path().to_path_buf(),
        output_dir: dir.path().join("results"),
        change_stream_wait_ms: 200,
        ..Default::default()
    };
    memory_runner(config, MemoryDeploymentConfig::default())
}

fn write_spec(dir: &TempDir, name: &str, json: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, json).unwrap();
    path
}

const INSERT_AND_CHECK: &str = r#"{
  "description": "insert-and-check",
  "schemaVersion": "1.0",
  "createEntities": [
    { "client": { "id": "client0" } },
    { "database": { "id": "db0", "client": "client0", "databaseName": "scenario" } },
    { "collection": { "id": "coll0", "database": "db0", "collectionName": "c" } }
  ],
  "initialData": [
    { "collectionName": "c", "databaseName": "scenario", "documents": [ { "_id": 1 } ] }
  ],
  "tests": [
    {
      "description": "passes",
      "operations": [
        { "name": "insertOne", "object": "coll0", "arguments": { "document": { "_id": 2 } } }
      ],
      "outcome": [
        { "collectionName": "c", "databaseName": "scenario", "documents": [ { "_id": 1 }, { "_id": 2 } ] }
      ]
    },
    {
      "description": "expects an error that never comes",
      "operations": [
        {
          "name": "insertOne",
          "object": "coll0",
          "arguments": { "document": { "_id": 3 } },
          "expectError": { "isClientError": true }
        }
      ]
    },
    {
      "description": "outcome does not match",
      "operations": [],
      "outcome": [
        { "collectionName": "c", "databaseName": "scenario", "documents": [ { "_id": 1, "extra": true } ] }
      ]
    }
  ]
}"#;

#[tokio::test]
async fn passing_and_failing_tests_are_reported_separately() {
    let dir = TempDir::new().unwrap();
    let path = write_spec(&dir, "insert.json", INSERT_AND_CHECK);
    let mut runner = runner_in(&dir);

    let suite = runner.run_paths(&[path]).await.unwrap();
    assert_eq!(suite.total, 3);
    assert_eq!(suite.passed, 1);
    assert_eq!(suite.failed, 2);
    assert_eq!(suite.errors, 0);
    assert!(!suite.success());

    let results = &suite.files[0].results;
    assert_eq!(results[0].outcome, TestOutcome::Passed);
    assert_eq!(results[1].outcome, TestOutcome::Failed);
    assert!(results[1].message.as_deref().unwrap().contains("succeeded"));
    assert_eq!(results[2].outcome, TestOutcome::Failed);

    let written = runner.write_results(&suite).unwrap();
    let json = std::fs::read_to_string(written).unwrap();
    assert!(json.contains("\"passed\": 1"));
    runner.shutdown().await;
}

#[tokio::test]
async fn skip_list_wildcard_skips_the_whole_file() {
    let dir = TempDir::new().unwrap();
    let path = write_spec(&dir, "insert.json", INSERT_AND_CHECK);
    let mut config = RunnerConfig::default();
    config
        .skip
        .insert("insert-and-check".to_string(), vec![SKIP_ALL.to_string()]);
    let mut runner = memory_runner(config, MemoryDeploymentConfig::default());

    let suite = runner.run_paths(&[path]).await.unwrap();
    assert_eq!(suite.skipped, 3);
    assert!(suite.success());
}

#[tokio::test]
async fn test_filter_runs_a_single_test() {
    let dir = TempDir::new().unwrap();
    let path = write_spec(&dir, "insert.json", INSERT_AND_CHECK);
    let mut runner = runner_in(&dir);
    runner.filter_test("passes");

    let suite = runner.run_paths(&[path]).await.unwrap();
    assert_eq!(suite.total, 1);
    assert_eq!(suite.passed, 1);
}

#[tokio::test]
async fn newer_schema_versions_are_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_spec(
        &dir,
        "future.json",
        r#"{
          "description": "future",
          "schemaVersion": "1.99",
          "tests": [
            { "description": "t", "operations": [ { "name": "newOp2030", "object": "testRunner" } ] }
          ]
        }"#,
    );
    let mut runner = runner_in(&dir);

    let suite = runner.run_paths(&[path]).await.unwrap();
    assert_eq!(suite.errors, 1);
    assert_eq!(suite.total, 0);
    let error = suite.files[0].error.as_deref().unwrap();
    assert!(error.contains("1.99"), "{}", error);
    assert!(!error.contains("newOp2030"), "{}", error);
    assert!(!suite.success());
}

#[tokio::test]
async fn unknown_operations_fail_the_file_at_load() {
    let dir = TempDir::new().unwrap();
    let path = write_spec(
        &dir,
        "unknown.json",
        r#"{
          "description": "unknown",
          "schemaVersion": "1.0",
          "tests": [
            { "description": "t", "operations": [ { "name": "frobnicate", "object": "testRunner" } ] }
          ]
        }"#,
    );
    assert!(TestFile::from_file(&path, &RunnerConfig::default().schema_versions()).is_err());

    let mut runner = runner_in(&dir);
    let suite = runner.run_paths(&[path]).await.unwrap();
    assert_eq!(suite.errors, 1);
    assert_eq!(suite.total, 0);
    assert!(suite.files[0].error.as_deref().unwrap().contains("frobnicate"));
}

#[tokio::test]
async fn unsupported_operator_stops_the_rest_of_the_file() {
    let dir = TempDir::new().unwrap();
    let path = write_spec(
        &dir,
        "operator.json",
        r#"{
          "description": "operator",
          "schemaVersion": "1.0",
          "createEntities": [
            { "client": { "id": "client0" } },
            { "database": { "id": "db0", "client": "client0", "databaseName": "scenario" } },
            { "collection": { "id": "coll0", "database": "db0", "collectionName": "c" } }
          ],
          "tests": [
            {
              "description": "uses an operator the matcher lacks",
              "operations": [
                {
                  "name": "countDocuments",
                  "object": "coll0",
                  "arguments": { "filter": {} },
                  "expectResult": { "$$lte": 5 }
                }
              ]
            },
            { "description": "never runs", "operations": [] }
          ]
        }"#,
    );
    let mut runner = runner_in(&dir);

    let suite = runner.run_paths(&[path]).await.unwrap();
    let file = &suite.files[0];
    assert_eq!(file.results.len(), 1);
    assert_eq!(file.results[0].outcome, TestOutcome::Failed);
    assert!(file.error.as_deref().unwrap().contains("$$lte"));
}

#[tokio::test]
async fn bundled_specs_pass_on_a_replica_set() {
    let mut config = RunnerConfig {
        specs_dir: bundled_specs(),
        ..Default::default()
    };
    config.change_stream_wait_ms = 500;
    let mut runner = memory_runner(config, MemoryDeploymentConfig::default());

    let suite = runner.run_all().await.unwrap();
    for file in &suite.files {
        for result in &file.results {
            assert_ne!(
                result.outcome,
                TestOutcome::Failed,
                "{:?}: {}: {:?}",
                file.description,
                result.description,
                result.message
            );
        }
    }
    assert!(suite.success(), "file errors: {:?}", suite.files.iter().filter_map(|f| f.error.as_ref()).collect::<Vec<_>>());
    assert!(suite.passed > 0);
    // the pinning file only runs against sharded clusters
    assert!(suite.skipped > 0);
    runner.shutdown().await;
}

#[tokio::test]
async fn sharded_pinning_runs_on_a_sharded_cluster() {
    let deployment = MemoryDeploymentConfig {
        topology: TopologyType::Sharded,
        mongoses: 2,
        ..Default::default()
    };
    let mut runner = memory_runner(RunnerConfig::default(), deployment);

    let suite = runner
        .run_paths(&[bundled_specs().join("sharded-pinning.json")])
        .await
        .unwrap();
    assert_eq!(suite.passed, 1, "{:?}", suite.files[0].results);
}

const FAIL_POINT_THEN_INSERT: &str = r#"{
  "description": "fail-point-then-insert",
  "schemaVersion": "1.0",
  "createEntities": [
    { "client": { "id": "client0" } },
    { "database": { "id": "db0", "client": "client0", "databaseName": "scenario" } },
    { "collection": { "id": "coll0", "database": "db0", "collectionName": "c" } }
  ],
  "initialData": [
    { "collectionName": "c", "databaseName": "scenario", "documents": [] }
  ],
  "tests": [
    {
      "description": "fails while the fail point is on",
      "operations": [
        {
          "name": "failPoint",
          "object": "testRunner",
          "arguments": {
            "client": "client0",
            "failPoint": {
              "configureFailPoint": "failCommand",
              "mode": "alwaysOn",
              "data": { "failCommands": [ "insert" ], "errorCode": 91 }
            }
          }
        },
        {
          "name": "insertOne",
          "object": "coll0",
          "arguments": { "document": { "_id": 1 } },
          "expectError": { "errorCode": 11000 }
        }
      ]
    },
    {
      "description": "inserts after the fail point is gone",
      "operations": [
        { "name": "insertOne", "object": "coll0", "arguments": { "document": { "_id": 2 } } }
      ],
      "outcome": [
        { "collectionName": "c", "databaseName": "scenario", "documents": [ { "_id": 2 } ] }
      ]
    }
  ]
}"#;

#[tokio::test]
async fn fail_points_are_disabled_after_a_failed_test() {
    let dir = TempDir::new().unwrap();
    let path = write_spec(&dir, "fail-point.json", FAIL_POINT_THEN_INSERT);
    let mut runner = runner_in(&dir);

    let suite = runner.run_paths(&[path]).await.unwrap();
    let results = &suite.files[0].results;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].outcome, TestOutcome::Failed);
    assert_eq!(results[1].outcome, TestOutcome::Passed, "{:?}", results[1].message);
    assert_eq!(suite.errors, 0);
    runner.shutdown().await;
}

#[tokio::test]
async fn fail_points_configured_by_the_test_are_observed() {
    let dir = TempDir::new().unwrap();
    let path = write_spec(
        &dir,
        "configure.json",
        r#"{
          "description": "configure",
          "schemaVersion": "1.0",
          "createEntities": [
            { "client": { "id": "client0", "observeEvents": [ "commandStartedEvent" ] } },
            { "database": { "id": "admin", "client": "client0", "databaseName": "admin" } }
          ],
          "tests": [
            {
              "description": "only the test's own command is recorded",
              "operations": [
                {
                  "name": "failPoint",
                  "object": "testRunner",
                  "arguments": {
                    "client": "client0",
                    "failPoint": {
                      "configureFailPoint": "failCommand",
                      "mode": "alwaysOn",
                      "data": { "failCommands": [ "find" ], "errorCode": 91 }
                    }
                  }
                },
                {
                  "name": "runCommand",
                  "object": "admin",
                  "arguments": {
                    "commandName": "configureFailPoint",
                    "command": { "configureFailPoint": "failCommand", "mode": "off" }
                  }
                }
              ],
              "expectEvents": [
                {
                  "client": "client0",
                  "events": [
                    {
                      "commandStartedEvent": {
                        "commandName": "configureFailPoint",
                        "databaseName": "admin",
                        "command": { "configureFailPoint": "failCommand", "mode": "off" }
                      }
                    }
                  ]
                }
              ]
            }
          ]
        }"#,
    );
    let mut runner = runner_in(&dir);

    let suite = runner.run_paths(&[path]).await.unwrap();
    let results = &suite.files[0].results;
    assert_eq!(results[0].outcome, TestOutcome::Passed, "{:?}", results[0].message);
    runner.shutdown().await;
}
