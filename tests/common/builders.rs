//! Test data builders for creating test objects

use super::mock_helpers::MockUsbService;
use std::sync::Arc;
use target_link::codec::NodeKind;
use target_link::config::NodeSpec;
use target_link::usb::{PortPreferences, UsbPort, UsbTransport, UsbTransportParams};
use target_link::{Catalog, ConnectionManager, LinkConfig, PortHub, Registry};

/// Builder for settings with USB transports and pass-through nodes
pub struct SettingsBuilder {
    config: LinkConfig,
}

impl SettingsBuilder {
    pub fn new() -> Self {
        Self {
            config: LinkConfig {
                app_name: "test".to_string(),
                ..LinkConfig::default()
            },
        }
    }

    pub fn usb(mut self, id: &str) -> Self {
        self.config.usb.push(UsbTransportParams {
            id: id.to_string(),
            ..UsbTransportParams::default()
        });
        self
    }

    pub fn optional_usb(mut self, id: &str) -> Self {
        self.config.usb.push(UsbTransportParams {
            id: id.to_string(),
            optional: true,
            ..UsbTransportParams::default()
        });
        self
    }

    /// Model that accepts raw buffers from a USB transport
    pub fn model(mut self, id: &str) -> Self {
        self.config
            .nodes
            .push(NodeSpec::new(id, NodeKind::Model).with_decoder("buffer", "buffer"));
        self
    }

    pub fn device_model(mut self, id: &str, device_id: &str, optional: bool) -> Self {
        let mut spec = NodeSpec::new(id, NodeKind::Model)
            .with_decoder("buffer", "buffer")
            .with_device_id(device_id);
        if optional {
            spec = spec.optional();
        }
        self.config.nodes.push(spec);
        self
    }

    pub fn configuration(mut self, id: &str, configuration: &str) -> Self {
        self.config
            .configurations
            .insert(id.to_string(), configuration.to_string());
        self
    }

    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.config.default_baud_rate = baud_rate;
        self
    }

    pub fn auto_connect(mut self, allow: bool) -> Self {
        self.config.allow_auto_connect = allow;
        self
    }

    pub fn build(self) -> LinkConfig {
        self.config
    }
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything an application wires together, over a mock USB service
pub struct Rig {
    pub service: Arc<MockUsbService>,
    pub hub: Arc<PortHub>,
    pub catalog: Catalog,
    pub manager: Arc<ConnectionManager>,
}

impl Rig {
    pub fn new(settings: &LinkConfig, ports: Vec<UsbPort>) -> Self {
        let service = MockUsbService::new(ports);
        let registry = Arc::new(Registry::default());
        let hub = PortHub::new(service.clone(), registry.clone());
        let catalog = Catalog::install(settings, &hub, PortPreferences::in_memory(&settings.app_name))
            .expect("settings should install");

        let manager = ConnectionManager::new(registry);
        manager.set_allow_auto_connect_on_device_detection(settings.allow_auto_connect);
        catalog.register_transports(&manager);
        for (id, configuration) in &settings.configurations {
            manager.register_configuration(id.clone(), configuration.clone());
        }

        Self {
            service,
            hub,
            catalog,
            manager,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.hub.registry()
    }

    pub fn usb(&self, id: &str) -> Arc<UsbTransport> {
        self.catalog
            .usb_transports()
            .iter()
            .find(|t| t.transport_id() == id)
            .cloned()
            .unwrap_or_else(|| panic!("no USB transport {}", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_builder() {
        let settings = SettingsBuilder::new()
            .usb("usb")
            .device_model("sensor", "msp", true)
            .configuration("bench", "usb+sensor")
            .build();

        assert_eq!(settings.usb.len(), 1);
        assert!(settings.nodes[0].optional);
        assert_eq!(settings.device_ids(), vec!["msp".to_string()]);
        assert_eq!(settings.configurations["bench"], "usb+sensor");
    }
}
