//! Client configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use offsync_common::{Error, Result};
use offsync_storage::{SharedStore, StoreRegistry};

use crate::conflict::{ConflictPolicies, StrategyKind};

/// Settings for a [`SyncClient`](crate::SyncClient).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Directory holding links, cached resources and pending writes.
    pub root: PathBuf,
    /// Store backend name (e.g., "local", "memory").
    pub store: String,
    /// Strategy applied to replace conflicts of every kind.
    pub default_conflict_strategy: StrategyKind,
    /// Start a sync when the network becomes reachable.
    pub sync_on_reachable: bool,
    /// Re-run sync this often while reachable and writes are pending.
    pub retry_interval_secs: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            store: "local".to_string(),
            default_conflict_strategy: StrategyKind::None,
            sync_on_reachable: true,
            retry_interval_secs: None,
        }
    }
}

fn default_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("offsync")
}

impl SyncConfig {
    /// Read a configuration file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(|e| {
            Error::Serialization(format!("Invalid config {}: {}", path.display(), e))
        })
    }

    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_store(mut self, store: impl Into<String>) -> Self {
        self.store = store.into();
        self
    }

    pub fn with_conflict_strategy(mut self, strategy: StrategyKind) -> Self {
        self.default_conflict_strategy = strategy;
        self
    }

    pub fn with_sync_on_reachable(mut self, enabled: bool) -> Self {
        self.sync_on_reachable = enabled;
        self
    }

    pub fn with_retry_interval(mut self, interval: Option<Duration>) -> Self {
        self.retry_interval_secs = interval.map(|d| d.as_secs().max(1));
        self
    }

    pub fn retry_interval(&self) -> Option<Duration> {
        self.retry_interval_secs.map(Duration::from_secs)
    }

    /// Options handed to the store factory.
    pub fn store_options(&self) -> serde_json::Value {
        serde_json::json!({ "root": self.root.to_string_lossy() })
    }

    /// Build the configured store backend.
    pub fn open_store(&self, registry: &StoreRegistry) -> Result<SharedStore> {
        registry.resolve(&self.store, self.store_options())
    }

    /// Conflict policies applying the configured default to every kind.
    pub fn policies(&self) -> ConflictPolicies {
        ConflictPolicies::new(self.default_conflict_strategy.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictStrategy;
    use offsync_common::ResourceKind;
    use offsync_storage::create_default_registry;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.store, "local");
        assert!(config.sync_on_reachable);
        assert!(config.root.ends_with("offsync"));
        assert_eq!(config.retry_interval(), None);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("offsync.json");
        std::fs::write(
            &path,
            r#"{ "store": "memory", "default_conflict_strategy": "overwrite", "retry_interval_secs": 30 }"#,
        )
        .unwrap();

        let config = SyncConfig::from_json_file(&path).unwrap();
        assert_eq!(config.store, "memory");
        assert_eq!(config.default_conflict_strategy, StrategyKind::Overwrite);
        assert_eq!(config.retry_interval(), Some(Duration::from_secs(30)));
        assert!(config.sync_on_reachable);
        assert!(matches!(
            config.policies().strategy_for(ResourceKind::Document),
            ConflictStrategy::Overwrite
        ));
    }

    #[test]
    fn test_invalid_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("offsync.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            SyncConfig::from_json_file(&path),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_json_roundtrip() {
        let config = SyncConfig::default()
            .with_root("/tmp/offsync-test")
            .with_retry_interval(Some(Duration::from_secs(5)));
        let restored: SyncConfig = serde_json::from_str(&config.to_json().unwrap()).unwrap();
        assert_eq!(restored, config);
    }

    #[tokio::test]
    async fn test_open_store() {
        let temp = TempDir::new().unwrap();
        let registry = create_default_registry();

        let local = SyncConfig::default().with_root(temp.path());
        assert_eq!(local.open_store(&registry).unwrap().name(), "local");

        let memory = SyncConfig::default().with_store("memory");
        assert_eq!(memory.open_store(&registry).unwrap().name(), "memory");

        let unknown = SyncConfig::default().with_store("s3");
        assert!(matches!(unknown.open_store(&registry), Err(Error::NotFound(_))));
    }
}
