//! Persisted engine state.
//!
//! A single JSON key/value document at an OS-dependent path. Subordinate
//! managers record what they changed on the host (firewall rules in effect,
//! captured DNS config, route journal) so a restart after a crash can restore
//! host invariants. The engine itself treats values as opaque.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Default state path under the OS data directory.
pub fn default_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("meshwire")
        .join("state.json")
}

pub struct StateFile {
    path: PathBuf,
    entries: Mutex<HashMap<String, Value>>,
}

impl StateFile {
    /// Load the document, starting empty if the file is missing or corrupt.
    /// A corrupt file is renamed aside rather than silently overwritten.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(map) => map,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "corrupt state file, starting fresh: {e}");
                    let _ = std::fs::rename(&path, path.with_extension("json.corrupt"));
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entries = self.entries.lock();
        let value = entries.get(key)?;
        match serde_json::from_value(value.clone()) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(key, "state entry has unexpected shape: {e}");
                None
            }
        }
    }

    /// Store a value and persist the whole document.
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> std::io::Result<()> {
        let json = serde_json::to_value(value).map_err(std::io::Error::other)?;
        let mut entries = self.entries.lock();
        entries.insert(key.to_string(), json);
        self.flush_locked(&entries)
    }

    pub fn remove(&self, key: &str) -> std::io::Result<()> {
        let mut entries = self.entries.lock();
        if entries.remove(key).is_none() {
            return Ok(());
        }
        self.flush_locked(&entries)
    }

    /// Atomic replace: write a sibling temp file, then rename over the
    /// document so readers never observe a half-written file.
    fn flush_locked(&self, entries: &HashMap<String, Value>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_vec_pretty(entries).map_err(std::io::Error::other)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &self.path)
    }
}
