//! Integration tests for settings files and persisted port preferences

mod common;

use common::builders::Rig;
use mockall::mock;
use serial_test::serial;
use std::sync::Arc;
use target_link::catalog::{active_tree, device_requirements};
use target_link::config::CONFIG_FILE;
use target_link::usb::{
    JsonFilePreferences, PortPreferences, PreferenceStore, UsbPort, PREFERENCES_FILE,
};
use target_link::{DeviceRequirement, LinkConfig, Result, TransportState};
use tempfile::TempDir;

mock! {
    pub Store {}

    impl PreferenceStore for Store {
        fn get(&self, key: &str) -> Option<String>;
        fn set(&self, key: &str, value: &str) -> Result<()>;
        fn remove(&self, key: &str) -> Result<()>;
    }
}

const SETTINGS: &str = r#"
app_name = "bench"
default_baud_rate = 57600

[configurations]
default = "usb+u2a(power,gpio)"
plain = "uart+sensor"

[[usb]]
id = "usb"
hid = true

[[usb]]
id = "uart"
usb = true
optional = true

[[usb2any]]
id = "u2a"

[[nodes]]
id = "power"
kind = "model"
decoder = ["void", "u2aPacket"]
device_id = "msp"

[[nodes]]
id = "gpio"
kind = "model"
optional = true
decoder = ["void", "u2aPacket"]
device_id = "cc"

[[nodes]]
id = "sensor"
kind = "model"
decoder = ["buffer", "buffer"]
"#;

fn write_settings(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join(CONFIG_FILE);
    std::fs::write(&path, SETTINGS).unwrap();
    path
}

#[test]
fn test_settings_file_builds_configuration_tree() {
    let dir = TempDir::new().unwrap();
    let settings = LinkConfig::load(write_settings(&dir)).unwrap();
    let rig = Rig::new(&settings, vec![]);

    rig.manager.set_active_configuration("default").unwrap();
    assert_eq!(
        active_tree(rig.registry()),
        "usb [4]\n  u2a [3]\n    power [1]\n    gpio [2] optional\n"
    );

    let report = device_requirements(rig.registry(), &settings.device_ids()).unwrap();
    assert_eq!(
        report,
        vec![
            ("msp".to_string(), DeviceRequirement::Yes),
            ("cc".to_string(), DeviceRequirement::Maybe),
        ]
    );

    rig.manager.set_active_configuration("plain").unwrap();
    assert_eq!(active_tree(rig.registry()), "uart [2] optional\n  sensor [1]\n");
}

#[tokio::test]
async fn test_settings_reach_the_port() {
    let dir = TempDir::new().unwrap();
    let settings = LinkConfig::load(write_settings(&dir)).unwrap();
    let rig = Rig::new(&settings, vec![UsbPort::serial("COM4"), UsbPort::hid("HID1")]);

    rig.manager.set_active_configuration("plain").unwrap();
    common::within_timeout(rig.manager.connect()).await.unwrap();

    // uart only takes serial ports and inherits the top-level baud rate
    assert_eq!(rig.service.opened(), vec![("COM4".to_string(), Some(57600))]);
    assert_eq!(rig.manager.state(), TransportState::Connected);
}

#[test]
fn test_user_selection_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(PREFERENCES_FILE);

    {
        let store = JsonFilePreferences::open(&path).unwrap();
        let prefs = PortPreferences::new(Arc::new(store), "bench");
        prefs.set_port_name("usb", Some("COM9")).unwrap();
        prefs.set_baud_rate("usb", Some(115200)).unwrap();
    }

    let content = std::fs::read_to_string(&path).unwrap();
    assert!(content.contains("\"bench_usb_comPort\": \"COM9\""), "{}", content);

    let prefs = PortPreferences::new(Arc::new(JsonFilePreferences::open(&path).unwrap()), "bench");
    assert_eq!(prefs.port_name("usb").as_deref(), Some("COM9"));
    assert_eq!(prefs.baud_rate("usb"), Some(115200));

    prefs.set_port_name("usb", None).unwrap();
    let reopened = PortPreferences::new(Arc::new(JsonFilePreferences::open(&path).unwrap()), "bench");
    assert!(reopened.port_name("usb").is_none());
}

#[test]
fn test_corrupt_preferences_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(PREFERENCES_FILE);
    std::fs::write(&path, "{ not json").unwrap();

    let err = JsonFilePreferences::open(&path).unwrap_err();
    assert!(err.to_string().starts_with("Failed to parse"), "{}", err);
}

#[test]
fn test_transport_writes_expected_keys() {
    let mut store = MockStore::new();
    store
        .expect_set()
        .withf(|key: &str, value: &str| key == "scope_uart_comPort" && value == "COM2")
        .times(1)
        .returning(|_, _| Ok(()));
    store
        .expect_remove()
        .withf(|key: &str| key == "scope_uart_baudRate")
        .times(1)
        .returning(|_| Ok(()));
    store
        .expect_get()
        .withf(|key: &str| key == "scope_uart_comPort")
        .returning(|_| Some("COM2".to_string()));

    let prefs = PortPreferences::new(Arc::new(store), "scope");
    prefs.set_port_name("uart", Some("COM2")).unwrap();
    prefs.set_baud_rate("uart", None).unwrap();
    assert_eq!(prefs.port_name("uart").as_deref(), Some("COM2"));
}

#[test]
#[serial]
#[cfg(target_os = "linux")]
fn test_default_preferences_live_in_app_data_dir() {
    let dir = TempDir::new().unwrap();
    let previous = std::env::var_os("XDG_DATA_HOME");
    std::env::set_var("XDG_DATA_HOME", dir.path());

    let store = JsonFilePreferences::open_default().unwrap();
    store.set("bench_usb_comPort", "COM1").unwrap();
    assert!(store.path().starts_with(dir.path()));
    assert!(store.path().ends_with(PREFERENCES_FILE));
    assert!(store.path().exists());

    match previous {
        Some(value) => std::env::set_var("XDG_DATA_HOME", value),
        None => std::env::remove_var("XDG_DATA_HOME"),
    }
}
