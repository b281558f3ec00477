use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use serde_json::Value;
use tracing::{debug, warn};

use crate::ports::{KeyValueStore, StoreError};

/// Key-value store persisted as a single JSON object on disk.
///
/// Every mutation rewrites the file through a temporary sibling and a
/// rename, so a crash leaves either the old or the new map.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    inner: Mutex<BTreeMap<String, Value>>,
}

impl JsonFileStore {
    /// Open (or lazily create) the store at `path`. An unreadable or corrupt
    /// file is treated as empty; absent keys fall back to defaults anyway.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let map = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<BTreeMap<String, Value>>(&bytes) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Corrupt store file, starting empty");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), keys = map.len(), "Store opened");
        Ok(Self {
            path,
            inner: Mutex::new(map),
        })
    }

    fn persist(&self, map: &BTreeMap<String, Value>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(map)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let g = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(g.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut g = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        g.insert(key.to_string(), value);
        self.persist(&g)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut g = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        if g.remove(key).is_some() {
            self.persist(&g)?;
        }
        Ok(())
    }
}
