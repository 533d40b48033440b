//! Persisted port choices
//!
//! The port and baud rate a user picks for a transport survive restarts. They
//! are stored as plain strings under `<app>_<transport id>_comPort` and
//! `<app>_<transport id>_baudRate`.

use crate::config;
use crate::error::{LinkError, Result, ResultExt};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Preferences file name inside the app data directory
pub const PREFERENCES_FILE: &str = "preferences.json";

/// String key/value storage
pub trait PreferenceStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Store that forgets everything on drop
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferences {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().ok().and_then(|v| v.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        if let Ok(mut values) = self.values.lock() {
            values.remove(key);
        }
        Ok(())
    }
}

/// Store backed by a JSON object on disk, rewritten on every change
#[derive(Debug)]
pub struct JsonFilePreferences {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl JsonFilePreferences {
    /// Open `path`, starting empty if it does not exist yet
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str::<BTreeMap<String, String>>(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    /// Open the file in the app data directory
    pub fn open_default() -> Result<Self> {
        let dir = config::ensure_app_data_dir()?;
        Self::open(dir.join(PREFERENCES_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(values).context("Failed to serialize preferences")?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }

    fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut BTreeMap<String, String>),
    {
        let mut values = self
            .values
            .lock()
            .map_err(|_| LinkError::Settings("preference store lock poisoned".into()))?;
        f(&mut values);
        self.persist(&values)
    }
}

impl PreferenceStore for JsonFilePreferences {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().ok().and_then(|v| v.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.update(|values| {
            values.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.update(|values| {
            values.remove(key);
        })
    }
}

/// Typed access to the port keys of one application
#[derive(Clone)]
pub struct PortPreferences {
    store: Arc<dyn PreferenceStore>,
    app_name: String,
}

impl PortPreferences {
    pub fn new(store: Arc<dyn PreferenceStore>, app_name: impl Into<String>) -> Self {
        Self {
            store,
            app_name: app_name.into(),
        }
    }

    /// In-memory preferences, for tests and throwaway sessions
    pub fn in_memory(app_name: impl Into<String>) -> Self {
        Self::new(Arc::new(MemoryPreferences::new()), app_name)
    }

    fn key(&self, transport_id: &str, name: &str) -> String {
        format!("{}_{}_{}", self.app_name, transport_id, name)
    }

    pub fn port_name(&self, transport_id: &str) -> Option<String> {
        self.store
            .get(&self.key(transport_id, "comPort"))
            .filter(|name| !name.is_empty())
    }

    pub fn set_port_name(&self, transport_id: &str, port_name: Option<&str>) -> Result<()> {
        let key = self.key(transport_id, "comPort");
        match port_name.filter(|name| !name.is_empty()) {
            Some(name) => self.store.set(&key, name),
            None => self.store.remove(&key),
        }
    }

    /// Stored baud rate; unparsable values read as unset
    pub fn baud_rate(&self, transport_id: &str) -> Option<u32> {
        self.store
            .get(&self.key(transport_id, "baudRate"))
            .and_then(|rate| rate.parse().ok())
            .filter(|rate| *rate > 0)
    }

    pub fn set_baud_rate(&self, transport_id: &str, baud_rate: Option<u32>) -> Result<()> {
        let key = self.key(transport_id, "baudRate");
        match baud_rate.filter(|rate| *rate > 0) {
            Some(rate) => self.store.set(&key, &rate.to_string()),
            None => self.store.remove(&key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_port_keys() {
        let store = Arc::new(MemoryPreferences::new());
        let prefs = PortPreferences::new(store.clone(), "scope");

        prefs.set_port_name("usb", Some("COM3")).unwrap();
        prefs.set_baud_rate("usb", Some(115200)).unwrap();

        assert_eq!(store.get("scope_usb_comPort").as_deref(), Some("COM3"));
        assert_eq!(store.get("scope_usb_baudRate").as_deref(), Some("115200"));
        assert_eq!(prefs.port_name("usb").as_deref(), Some("COM3"));
        assert_eq!(prefs.baud_rate("usb"), Some(115200));
    }

    #[test]
    fn test_clearing_removes_keys() {
        let store = Arc::new(MemoryPreferences::new());
        let prefs = PortPreferences::new(store.clone(), "scope");
        prefs.set_port_name("usb", Some("COM3")).unwrap();
        prefs.set_port_name("usb", None).unwrap();
        prefs.set_baud_rate("usb", Some(0)).unwrap();

        assert!(store.get("scope_usb_comPort").is_none());
        assert!(prefs.baud_rate("usb").is_none());
    }

    #[test]
    fn test_garbage_baud_rate_reads_as_unset() {
        let store = Arc::new(MemoryPreferences::new());
        store.set("scope_usb_baudRate", "fast").unwrap();
        let prefs = PortPreferences::new(store, "scope");
        assert!(prefs.baud_rate("usb").is_none());
    }

    #[test]
    fn test_json_file_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(PREFERENCES_FILE);

        let store = JsonFilePreferences::open(&path).unwrap();
        store.set("scope_usb_comPort", "/dev/ttyACM0").unwrap();
        store.set("scope_usb_baudRate", "9600").unwrap();
        store.remove("scope_usb_baudRate").unwrap();

        let reopened = JsonFilePreferences::open(&path).unwrap();
        assert_eq!(reopened.get("scope_usb_comPort").as_deref(), Some("/dev/ttyACM0"));
        assert!(reopened.get("scope_usb_baudRate").is_none());
    }

    #[test]
    fn test_json_file_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(PREFERENCES_FILE);
        std::fs::write(&path, "not json").unwrap();

        let err = JsonFilePreferences::open(&path).unwrap_err();
        assert!(err.to_string().starts_with("Failed to parse"));
    }
}
