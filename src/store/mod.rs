use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

use crate::error::Result;

pub const KEY_DEVICE_ID: &str = "device_id";
pub const KEY_CLIENT_ID: &str = "client_id";
pub const KEY_SERIAL: &str = "serial";
pub const KEY_HMAC_KEY: &str = "hmac_key";
pub const KEY_ACTIVATED: &str = "activated";
pub const KEY_WS_URL: &str = "websocket_url";
pub const KEY_WS_TOKEN: &str = "websocket_token";

/// Process-wide key-value store persisted to a single JSON file.
///
/// Writes go through a temp file and an atomic rename, so the identity tuple
/// is never observable half-written. Cross-process concurrent use is out of
/// scope; the file has exactly one writer.
pub struct SecureStore {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl SecureStore {
    /// Opens the store, loading any existing file. A missing or unreadable
    /// file yields an empty store; a failure to read is never fatal.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let values = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<HashMap<String, String>>(&bytes) {
                Ok(map) => map,
                Err(e) => {
                    warn!("store file {} is corrupt, starting empty: {}", path.display(), e);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            values: Mutex::new(values),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.lock().unwrap().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.set_many(&[(key, value)])
    }

    /// Writes a batch of keys in one durable file replacement. Used for the
    /// identity tuple, whose fields must land together or not at all.
    pub fn set_many(&self, entries: &[(&str, &str)]) -> Result<()> {
        let mut values = self.values.lock().unwrap();
        for (k, v) in entries {
            values.insert((*k).to_string(), (*v).to_string());
        }
        self.persist(&values)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap();
        values.remove(key);
        self.persist(&values)
    }

    pub fn clear_all(&self) -> Result<()> {
        let mut values = self.values.lock().unwrap();
        values.clear();
        self.persist(&values)
    }

    fn persist(&self, values: &HashMap<String, String>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(values)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
