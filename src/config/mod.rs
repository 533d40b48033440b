//! Settings for target-link
//!
//! Settings are read from a TOML file. Every field has a default, so an empty
//! file (or no file at all) gives a working setup.
//!
//! # App Data Location
//!
//! Application data is stored in the platform-appropriate location:
//! - **Linux**: `~/.local/share/dev.target-link/`
//! - **macOS**: `~/Library/Application Support/dev.target-link/`
//! - **Windows**: `%APPDATA%\dev.target-link\`
//!
//! # Files
//!
//! - `config.toml` - default settings file
//! - `preferences.json` - user port selections
//!
//! # Example
//!
//! ```toml
//! app_name = "scope"
//! connect_timeout_ms = 500
//!
//! [configurations]
//! default = "usb+u2a(power,gpio)"
//!
//! [[usb]]
//! id = "usb"
//! hid = true
//!
//! [[usb2any]]
//! id = "u2a"
//!
//! [[nodes]]
//! id = "power"
//! kind = "model"
//! decoder = ["void", "u2aPacket"]
//! ```

use crate::codec::{NodeKind, Usb2anyParams};
use crate::error::{LinkError, Result};
use crate::usb::{UsbTransportParams, DEFAULT_BAUD_RATE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Application identifier for data directories
pub const APP_ID: &str = "dev.target-link";

/// Default settings filename
pub const CONFIG_FILE: &str = "config.toml";

/// Default application name used in preference keys
pub const DEFAULT_APP_NAME: &str = "target-link";

/// Default time allowed for a controller handshake in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 250;

/// Default time allowed for a ping reply in milliseconds
pub const DEFAULT_PING_TIMEOUT_MS: u64 = 250;

/// Default number of commands allowed in flight
pub const DEFAULT_MAX_OUTSTANDING_COMMANDS: u32 = 30;

// ==================== App Data Directory ====================

/// Get the application data directory path
pub fn app_data_dir() -> Option<PathBuf> {
    dirs_next::data_dir().map(|p| p.join(APP_ID))
}

/// Ensure the app data directory exists
pub fn ensure_app_data_dir() -> Result<PathBuf> {
    let dir = app_data_dir().ok_or_else(|| {
        LinkError::Settings("Could not determine app data directory".to_string())
    })?;

    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| {
            LinkError::Settings(format!("Failed to create app data directory: {}", e))
        })?;
    }

    Ok(dir)
}

/// Get the path to the default settings file
pub fn default_config_path() -> Option<PathBuf> {
    app_data_dir().map(|p| p.join(CONFIG_FILE))
}

// ==================== Node Catalog ====================

/// A node declared in settings rather than in code
///
/// Port types are `[input, output]` pairs of type names, e.g.
/// `["string|buffer", "buffer"]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    pub kind: NodeKind,

    #[serde(default)]
    pub optional: bool,

    #[serde(default)]
    pub device_id: Option<String>,

    #[serde(default)]
    pub encoder: Option<[String; 2]>,

    #[serde(default)]
    pub decoder: Option<[String; 2]>,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            optional: false,
            device_id: None,
            encoder: None,
            decoder: None,
        }
    }

    pub fn with_encoder(mut self, input: &str, output: &str) -> Self {
        self.encoder = Some([input.to_string(), output.to_string()]);
        self
    }

    pub fn with_decoder(mut self, input: &str, output: &str) -> Self {
        self.decoder = Some([input.to_string(), output.to_string()]);
        self
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

// ==================== Settings ====================

/// Settings of one target-link application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Prefix of persisted preference keys
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Time allowed for a controller handshake on connect
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Time allowed for a ping reply
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,

    /// Commands allowed in flight before outbound packets are held back
    #[serde(default = "default_max_outstanding_commands")]
    pub max_outstanding_commands: u32,

    /// Baud rate for USB transports that do not set one
    #[serde(default = "default_baud_rate")]
    pub default_baud_rate: u32,

    /// Connect automatically when a device is plugged in
    #[serde(default = "default_true")]
    pub allow_auto_connect: bool,

    /// Directory for rolling log files; no file logging when unset
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Named configuration strings
    #[serde(default)]
    pub configurations: BTreeMap<String, String>,

    #[serde(default)]
    pub usb: Vec<UsbTransportParams>,

    #[serde(default)]
    pub usb2any: Vec<Usb2anyParams>,

    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
}

fn default_app_name() -> String {
    DEFAULT_APP_NAME.to_string()
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_ping_timeout_ms() -> u64 {
    DEFAULT_PING_TIMEOUT_MS
}

fn default_max_outstanding_commands() -> u32 {
    DEFAULT_MAX_OUTSTANDING_COMMANDS
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_true() -> bool {
    true
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            ping_timeout_ms: DEFAULT_PING_TIMEOUT_MS,
            max_outstanding_commands: DEFAULT_MAX_OUTSTANDING_COMMANDS,
            default_baud_rate: DEFAULT_BAUD_RATE,
            allow_auto_connect: true,
            log_dir: None,
            configurations: BTreeMap::new(),
            usb: Vec::new(),
            usb2any: Vec::new(),
            nodes: Vec::new(),
        }
    }
}

impl LinkConfig {
    /// Load settings from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            LinkError::Settings(format!("Failed to read settings file {:?}: {}", path, e))
        })?;

        toml::from_str(&content).map_err(|e| {
            LinkError::Settings(format!("Failed to parse settings file {:?}: {}", path, e))
        })
    }

    /// Load settings, returning defaults on any error
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save settings to a TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LinkError::Settings(format!("Failed to create settings directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| LinkError::Settings(format!("Failed to serialize settings: {}", e)))?;

        std::fs::write(path, content).map_err(|e| {
            LinkError::Settings(format!("Failed to write settings file {:?}: {}", path, e))
        })
    }

    /// USB2ANY parameters with unset timeouts taken from these settings
    ///
    /// Entries in `[[usb2any]]` that keep the built-in defaults inherit the
    /// top-level values.
    pub fn usb2any_params(&self, params: &Usb2anyParams) -> Usb2anyParams {
        let builtin = Usb2anyParams::default();
        let mut params = params.clone();
        if params.connect_timeout_ms == builtin.connect_timeout_ms {
            params.connect_timeout_ms = self.connect_timeout_ms;
        }
        if params.ping_timeout_ms == builtin.ping_timeout_ms {
            params.ping_timeout_ms = self.ping_timeout_ms;
        }
        if params.max_outstanding_commands == builtin.max_outstanding_commands {
            params.max_outstanding_commands = self.max_outstanding_commands;
        }
        params
    }

    /// USB parameters with the default baud rate filled in
    pub fn usb_params(&self, params: &UsbTransportParams) -> UsbTransportParams {
        let mut params = params.clone();
        params.default_baud_rate = params.default_baud_rate.or(Some(self.default_baud_rate));
        params
    }

    /// Every node id the settings declare
    pub fn node_ids(&self) -> Vec<&str> {
        self.usb
            .iter()
            .map(|p| p.id.as_str())
            .chain(self.usb2any.iter().map(|p| p.id.as_str()))
            .chain(self.nodes.iter().map(|n| n.id.as_str()))
            .collect()
    }

    /// Device ids referenced by any declared node, first-seen order
    pub fn device_ids(&self) -> Vec<String> {
        let mut devices: Vec<String> = Vec::new();
        let declared = self
            .usb
            .iter()
            .filter_map(|p| p.device_id.as_deref())
            .chain(self.usb2any.iter().filter_map(|p| p.device_id.as_deref()))
            .chain(self.nodes.iter().filter_map(|n| n.device_id.as_deref()));
        for device in declared {
            if !device.is_empty() && !devices.iter().any(|d| d == device) {
                devices.push(device.to_string());
            }
        }
        devices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_from_empty_file() {
        let config: LinkConfig = toml::from_str("").unwrap();
        assert_eq!(config, LinkConfig::default());
        assert_eq!(config.app_name, "target-link");
        assert_eq!(config.default_baud_rate, 9600);
        assert!(config.allow_auto_connect);
    }

    #[test]
    fn test_parse_catalog() {
        let config: LinkConfig = toml::from_str(
            r#"
            app_name = "scope"
            ping_timeout_ms = 1000

            [configurations]
            default = "usb+u2a(power)"

            [[usb]]
            id = "usb"
            hid = true
            device_id = "msp"

            [[usb2any]]
            id = "u2a"

            [[nodes]]
            id = "power"
            kind = "model"
            optional = true
            decoder = ["void", "u2aPacket"]
            device_id = "msp"
            "#,
        )
        .unwrap();

        assert_eq!(config.app_name, "scope");
        assert_eq!(config.configurations["default"], "usb+u2a(power)");
        assert_eq!(config.node_ids(), vec!["usb", "u2a", "power"]);
        assert_eq!(config.device_ids(), vec!["msp".to_string()]);
        assert_eq!(config.nodes[0].kind, NodeKind::Model);
        assert!(config.nodes[0].optional);

        let u2a = config.usb2any_params(&config.usb2any[0]);
        assert_eq!(u2a.ping_timeout_ms, 1000);
        assert_eq!(u2a.connect_timeout_ms, 250);
    }

    #[test]
    fn test_usb_params_inherit_baud_rate() {
        let config = LinkConfig {
            default_baud_rate: 115200,
            ..LinkConfig::default()
        };
        let params = config.usb_params(&UsbTransportParams::default());
        assert_eq!(params.default_baud_rate, Some(115200));

        let explicit = UsbTransportParams {
            default_baud_rate: Some(57600),
            ..UsbTransportParams::default()
        };
        assert_eq!(config.usb_params(&explicit).default_baud_rate, Some(57600));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings").join(CONFIG_FILE);

        let mut config = LinkConfig::default();
        config.app_name = "bench".to_string();
        config.nodes.push(NodeSpec::new("gpio", NodeKind::Model).with_decoder("buffer", "buffer"));
        config
            .configurations
            .insert("default".to_string(), "usb(gpio)".to_string());
        config.save(&path).unwrap();

        let loaded = LinkConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_or_default_on_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "app_name = [").unwrap();

        assert!(LinkConfig::load(&path).is_err());
        assert_eq!(LinkConfig::load_or_default(&path), LinkConfig::default());
        assert_eq!(LinkConfig::load_or_default(dir.path().join("missing.toml")), LinkConfig::default());
    }

    #[test]
    #[serial_test::serial]
    fn test_app_data_dir() {
        if let Some(dir) = app_data_dir() {
            assert!(dir.ends_with(APP_ID));
        }
        if let Some(path) = default_config_path() {
            assert!(path.ends_with(CONFIG_FILE));
        }
    }
}
