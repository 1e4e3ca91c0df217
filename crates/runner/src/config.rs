//! Runner configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use unified_common::live::DEFAULT_URI;

use crate::error::RunnerResult;
use crate::schema_version::SchemaVersion;

/// Skip-list entry that skips every test in a file
pub const SKIP_ALL: &str = "*";

/// Runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Directory searched for `*.json` test files
    pub specs_dir: PathBuf,

    /// Output directory for results
    pub output_dir: PathBuf,

    /// Oldest schema version the runner accepts
    pub min_schema_version: SchemaVersion,

    /// Newest schema version the runner accepts
    pub max_schema_version: SchemaVersion,

    /// How long `iterateUntilDocumentOrError` waits for a change event
    pub change_stream_wait_ms: u64,

    /// Connection string of the deployment tests run against
    pub uri: String,

    /// Tests to skip, keyed by file description. A `"*"` entry skips the
    /// whole file.
    pub skip: BTreeMap<String, Vec<String>>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            specs_dir: PathBuf::from("tests/spec"),
            output_dir: PathBuf::from("test-results"),
            min_schema_version: SchemaVersion::new(1, 0, 0),
            max_schema_version: SchemaVersion::new(1, 13, 0),
            change_stream_wait_ms: 1000,
            skip: BTreeMap::new(),
            uri: DEFAULT_URI.to_string(),
        }
    }
}

impl RunnerConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> RunnerResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> RunnerResult<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Schema versions this runner can interpret
    pub fn schema_versions(&self) -> RangeInclusive<SchemaVersion> {
        self.min_schema_version..=self.max_schema_version
    }

    pub fn supports(&self, version: SchemaVersion) -> bool {
        self.schema_versions().contains(&version)
    }

    /// Whether the skip list excludes `test` from the file described by `file`
    pub fn is_skipped(&self, file: &str, test: &str) -> bool {
        self.skip
            .get(file)
            .map(|tests| tests.iter().any(|t| t == SKIP_ALL || t == test))
            .unwrap_or(false)
    }

    pub fn change_stream_wait(&self) -> Duration {
        Duration::from_millis(self.change_stream_wait_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = RunnerConfig::load(&dir.path().join("runner.toml")).unwrap();
        assert_eq!(config.max_schema_version, SchemaVersion::new(1, 13, 0));
        assert!(config.skip.is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("runner.toml");
        let mut config = RunnerConfig::default();
        config.skip.insert("File X".to_string(), vec![SKIP_ALL.to_string()]);
        config.uri = "mongodb://router1:27017,router2:27017/".to_string();
        config.save(&path).unwrap();

        let loaded = RunnerConfig::load(&path).unwrap();
        assert_eq!(loaded.skip, config.skip);
        assert_eq!(loaded.uri, config.uri);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runner.toml");
        std::fs::write(&path, "change_stream_wait_ms = 50\n\n[skip]\n\"File X\" = [\"a test\"]\n").unwrap();

        let config = RunnerConfig::load(&path).unwrap();
        assert_eq!(config.change_stream_wait(), Duration::from_millis(50));
        assert!(config.is_skipped("File X", "a test"));
        assert!(!config.is_skipped("File X", "another test"));
        assert_eq!(config.specs_dir, PathBuf::from("tests/spec"));
        assert_eq!(config.uri, "mongodb://localhost:27017");
    }

    #[test]
    fn test_wildcard_skips_every_test() {
        let mut config = RunnerConfig::default();
        config.skip.insert("File X".to_string(), vec![SKIP_ALL.to_string()]);
        assert!(config.is_skipped("File X", "anything"));
        assert!(!config.is_skipped("File Y", "anything"));
    }

    #[test]
    fn test_supported_range_is_inclusive() {
        let config = RunnerConfig::default();
        assert!(config.supports(SchemaVersion::new(1, 0, 0)));
        assert!(config.supports(SchemaVersion::new(1, 13, 0)));
        assert!(!config.supports(SchemaVersion::new(1, 14, 0)));
        assert!(!config.supports(SchemaVersion::new(0, 9, 0)));
    }
}
