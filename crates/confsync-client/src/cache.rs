//! Local snapshot persistence.
//!
//! Each repository writes its latest successful snapshot to a JSON file so
//! the next process start can serve stale-but-available data when the config
//! service is unreachable. Files are replaced atomically: the snapshot is
//! written to a temp file in the same directory and renamed over the target.

use std::fs;
use std::path::{Path, PathBuf};

use confsync_common::protocol::Result;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::snapshot::ConfigSnapshot;

/// On-disk store for the latest snapshot per namespace.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, app_id: &str, cluster: &str, namespace: &str) -> PathBuf {
        self.dir
            .join(format!("{}+{}+{}.json", app_id, cluster, namespace))
    }

    /// Persists `snapshot`, atomically replacing any previous file.
    pub fn save(&self, snapshot: &ConfigSnapshot) -> Result<()> {
        fs::create_dir_all(&self.dir)?;

        let target = self.path_for(&snapshot.app_id, &snapshot.cluster, &snapshot.namespace);
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer_pretty(tmp.as_file_mut(), snapshot)?;
        tmp.persist(&target).map_err(|e| e.error)?;

        debug!(path = %target.display(), "persisted snapshot");
        Ok(())
    }

    /// Loads the stored snapshot for a namespace, `None` if absent.
    pub fn load(&self, app_id: &str, cluster: &str, namespace: &str) -> Result<Option<ConfigSnapshot>> {
        let path = self.path_for(app_id, cluster, namespace);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn snapshot(release_key: &str, value: &str) -> ConfigSnapshot {
        ConfigSnapshot {
            app_id: "demo".to_string(),
            cluster: "default".to_string(),
            namespace: "application".to_string(),
            release_key: release_key.to_string(),
            configurations: HashMap::from([("k".to_string(), value.to_string())]),
            notification_messages: None,
        }
    }

    #[test]
    fn test_load_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        assert!(store
            .load("demo", "default", "application")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());

        store.save(&snapshot("r1", "v1")).unwrap();
        let loaded = store.load("demo", "default", "application").unwrap().unwrap();
        assert_eq!(loaded.release_key, "r1");
        assert_eq!(loaded.get("k"), Some("v1"));
    }

    #[test]
    fn test_save_replaces_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());

        store.save(&snapshot("r1", "v1")).unwrap();
        store.save(&snapshot("r2", "v2")).unwrap();

        let loaded = store.load("demo", "default", "application").unwrap().unwrap();
        assert_eq!(loaded.release_key, "r2");

        // exactly one snapshot file remains, no temp leftovers
        let files: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_namespaces_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());

        let mut other = snapshot("r9", "other");
        other.namespace = "db".to_string();

        store.save(&snapshot("r1", "v1")).unwrap();
        store.save(&other).unwrap();

        assert_eq!(
            store
                .load("demo", "default", "application")
                .unwrap()
                .unwrap()
                .release_key,
            "r1"
        );
        assert_eq!(
            store.load("demo", "default", "db").unwrap().unwrap().release_key,
            "r9"
        );
    }
}
