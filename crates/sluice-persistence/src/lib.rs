//! Persistor backends for Sluice stores.
//!
//! - [`MemoryPersistor`]: process-local map, for tests and hosts without
//!   durable storage.
//! - [`JsonFilePersistor`]: one `<store id>.json` file per store inside a
//!   directory. Writes go to a temporary file first and are renamed into
//!   place, so a crash mid-write leaves the previous state intact.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sluice_core::Persistor;
use tokio::sync::RwLock;
use tracing::debug;

/// Keeps state in memory.
#[derive(Debug, Default)]
pub struct MemoryPersistor {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryPersistor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populated with `entries`, as if a previous run had saved them.
    pub fn with_entries(entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self {
            entries: RwLock::new(entries.into_iter().collect()),
        }
    }

    pub async fn snapshot(&self) -> HashMap<String, Value> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl Persistor for MemoryPersistor {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, state: Value) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), state);
        Ok(())
    }
}

/// Stores each key as a JSON file in `dir`.
#[derive(Debug, Clone)]
pub struct JsonFilePersistor {
    dir: PathBuf,
}

impl JsonFilePersistor {
    /// The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// One file per key. ASCII letters, digits and `-` are kept; every other
    /// byte, `_` included, becomes `_` plus two hex digits, so distinct keys
    /// never share a file.
    fn path_for(&self, key: &str) -> PathBuf {
        let mut file = String::with_capacity(key.len() + 5);
        for byte in key.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' {
                file.push(char::from(byte));
            } else {
                file.push_str(&format!("_{byte:02x}"));
            }
        }
        file.push_str(".json");
        self.dir.join(file)
    }
}

#[async_trait]
impl Persistor for JsonFilePersistor {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };

        let value = serde_json::from_slice(&bytes)
            .with_context(|| format!("corrupt state file {}", path.display()))?;
        Ok(Some(value))
    }

    async fn set(&self, key: &str, state: Value) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        let path = self.path_for(key);
        let staging = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(&state)?;

        tokio::fs::write(&staging, bytes)
            .await
            .with_context(|| format!("failed to write {}", staging.display()))?;
        tokio::fs::rename(&staging, &path)
            .await
            .with_context(|| format!("failed to replace {}", path.display()))?;

        debug!(store_id = %key, path = %path.display(), "state saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_map_to_safe_file_names() {
        let persistor = JsonFilePersistor::new("/tmp/state");
        assert_eq!(
            persistor.path_for("key-settings"),
            PathBuf::from("/tmp/state/key-settings.json")
        );
        assert_eq!(
            persistor.path_for("../etc/passwd"),
            PathBuf::from("/tmp/state/_2e_2e_2fetc_2fpasswd.json")
        );
    }

    #[test]
    fn distinct_keys_never_share_a_file() {
        let persistor = JsonFilePersistor::new("/tmp/state");
        let keys = ["a.b", "a_b", "a/b", "a_2eb", "a b"];
        let paths: std::collections::HashSet<_> =
            keys.iter().map(|key| persistor.path_for(key)).collect();
        assert_eq!(paths.len(), keys.len());
        assert_eq!(
            persistor.path_for("a_b"),
            PathBuf::from("/tmp/state/a_5fb.json")
        );
    }
}
