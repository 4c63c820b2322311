//! Key/value property stores.

use super::{Result, StoreError};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, warn};

/// Opaque string properties, persisted by the implementation.
///
/// Structured values (string arrays, booleans) are stored JSON encoded.
pub trait PropertyStore: Send + Sync {
    /// Read a property.
    fn get(&self, key: &str) -> Option<String>;

    /// Write a property; `None` removes it.
    ///
    /// # Errors
    ///
    /// Returns error if the change cannot be persisted.
    fn put(&self, key: &str, value: Option<&str>) -> Result<()>;

    /// Read a string array, falling back to `default` when absent or malformed.
    fn get_strings(&self, key: &str, default: &[String]) -> Vec<String> {
        match self.get(key) {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("Ignoring malformed string array under {}: {}", key, e);
                default.to_vec()
            }),
            None => default.to_vec(),
        }
    }

    /// Write a string array; an empty array removes the property.
    ///
    /// # Errors
    ///
    /// Returns error if the change cannot be persisted.
    fn put_strings(&self, key: &str, values: &[String]) -> Result<()> {
        if values.is_empty() {
            return self.put(key, None);
        }
        let raw = serde_json::to_string(values)?;
        self.put(key, Some(&raw))
    }

    /// Read a boolean, falling back to `default` when absent or malformed.
    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(default)
    }

    /// Write a boolean.
    ///
    /// # Errors
    ///
    /// Returns error if the change cannot be persisted.
    fn put_bool(&self, key: &str, value: bool) -> Result<()> {
        self.put(key, Some(if value { "true" } else { "false" }))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Volatile property store.
#[derive(Debug, Default)]
pub struct MemoryPropertyStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryPropertyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every property.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        lock(&self.values).clone()
    }
}

impl PropertyStore for MemoryPropertyStore {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.values).get(key).cloned()
    }

    fn put(&self, key: &str, value: Option<&str>) -> Result<()> {
        let mut values = lock(&self.values);
        match value {
            Some(value) => values.insert(key.to_string(), value.to_string()),
            None => values.remove(key),
        };
        Ok(())
    }
}

/// Property store backed by a JSON object file.
///
/// Every write replaces the file atomically (temp file in the same directory,
/// then rename), so a crash never leaves a truncated document behind.
#[derive(Debug)]
pub struct FilePropertyStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl FilePropertyStore {
    /// Open the store at `path`, creating parent directories as needed.
    ///
    /// A missing file yields an empty store. An unreadable document is logged
    /// and also yields an empty store; it is overwritten on the next write.
    ///
    /// # Errors
    ///
    /// Returns error if the parent directory cannot be created or the file
    /// exists but cannot be read.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let values = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<BTreeMap<String, String>>(&content) {
                Ok(values) => {
                    debug!("Loaded {} properties from {:?}", values.len(), path);
                    values
                }
                Err(e) => {
                    error!("Discarding unreadable property file {:?}: {}", path, e);
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, values: &BTreeMap<String, String>) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let content = serde_json::to_vec_pretty(values)?;

        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        temp.write_all(&content)?;
        temp.flush()?;
        temp.persist(&self.path).map_err(|e| StoreError::Persist {
            path: self.path.clone(),
            message: e.error.to_string(),
        })?;
        Ok(())
    }
}

impl PropertyStore for FilePropertyStore {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.values).get(key).cloned()
    }

    fn put(&self, key: &str, value: Option<&str>) -> Result<()> {
        let mut values = lock(&self.values);
        let changed = match value {
            Some(value) => values.insert(key.to_string(), value.to_string()).as_deref() != Some(value),
            None => values.remove(key).is_some(),
        };
        if changed {
            self.write(&values)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_typed_helpers() {
        let store = MemoryPropertyStore::new();
        assert!(store.get_strings("ids", &[]).is_empty());

        store
            .put_strings("ids", &["a".to_string(), "b".to_string()])
            .unwrap();
        assert_eq!(store.get_strings("ids", &[]), vec!["a", "b"]);

        store.put_strings("ids", &[]).unwrap();
        assert_eq!(store.get("ids"), None);

        assert!(store.get_bool("flag", true));
        store.put_bool("flag", false).unwrap();
        assert!(!store.get_bool("flag", true));
    }

    #[test]
    fn test_malformed_array_falls_back_to_default() {
        let store = MemoryPropertyStore::new();
        store.put("ids", Some("not json")).unwrap();
        assert_eq!(store.get_strings("ids", &["x".to_string()]), vec!["x"]);
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("properties.json");

        let store = FilePropertyStore::open(&path).unwrap();
        store.put("greeting", Some("hello")).unwrap();
        store.put("gone", Some("soon")).unwrap();
        store.put("gone", None).unwrap();

        let reopened = FilePropertyStore::open(&path).unwrap();
        assert_eq!(reopened.get("greeting").as_deref(), Some("hello"));
        assert_eq!(reopened.get("gone"), None);
    }

    #[test]
    fn test_file_store_discards_corrupt_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("properties.json");
        std::fs::write(&path, "{ broken").unwrap();

        let store = FilePropertyStore::open(&path).unwrap();
        assert_eq!(store.get("anything"), None);
        store.put("k", Some("v")).unwrap();
        assert_eq!(FilePropertyStore::open(&path).unwrap().get("k").as_deref(), Some("v"));
    }
}
