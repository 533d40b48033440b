//! Nodes declared in settings
//!
//! [`Catalog::install`] turns the `[[usb]]`, `[[usb2any]]` and `[[nodes]]`
//! sections of a [`LinkConfig`] into registered nodes. Nodes from `[[nodes]]`
//! become [`GenericNode`]s: they carry identity and port types, connect
//! trivially, and pass data through unchanged.

use crate::codec::data_type::parse_type_name;
use crate::codec::{Codec, CodecCore, TypeRole, Usb2anyCodec};
use crate::config::{LinkConfig, NodeSpec};
use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::registry::{NodeSnapshot, Registry};
use crate::transport::Transport;
use crate::types::DeviceRequirement;
use crate::usb::{PortHub, PortPreferences, UsbTransport};
use std::fmt::Write;
use std::sync::Arc;

/// Pass-through node built from a [`NodeSpec`]
pub struct GenericNode {
    core: CodecCore,
}

impl GenericNode {
    pub fn from_spec(spec: &NodeSpec) -> Self {
        let mut core = CodecCore::new(spec.id.clone(), spec.kind).with_optional(spec.optional);
        if let Some([input, output]) = &spec.encoder {
            core = core.with_encoder(
                parse_type_name(input, TypeRole::Encoder),
                parse_type_name(output, TypeRole::Decoder),
            );
        }
        if let Some([input, output]) = &spec.decoder {
            core = core.with_decoder(
                parse_type_name(input, TypeRole::Decoder),
                parse_type_name(output, TypeRole::Encoder),
            );
        }
        if let Some(device_id) = spec.device_id.as_deref().filter(|d| !d.is_empty()) {
            core = core.with_device_id(device_id);
        }
        Self { core }
    }
}

impl Codec for GenericNode {
    fn core(&self) -> &CodecCore {
        &self.core
    }
}

/// Everything a [`LinkConfig`] registered
pub struct Catalog {
    hub: Arc<PortHub>,
    usb: Vec<Arc<UsbTransport>>,
    nodes: Vec<Arc<dyn Codec>>,
}

impl Catalog {
    /// Register every declared node with the hub's registry
    pub fn install(config: &LinkConfig, hub: &Arc<PortHub>, preferences: PortPreferences) -> Result<Self> {
        let registry = hub.registry();
        let mut catalog = Self {
            hub: Arc::clone(hub),
            usb: Vec::new(),
            nodes: Vec::new(),
        };

        for params in &config.usb {
            let transport = UsbTransport::new(config.usb_params(params), hub, preferences.clone())?;
            catalog.usb.push(transport);
        }
        for params in &config.usb2any {
            let codec: Arc<dyn Codec> = Arc::new(Usb2anyCodec::new(config.usb2any_params(params)));
            registry.register(codec.clone())?;
            catalog.nodes.push(codec);
        }
        for spec in &config.nodes {
            let node: Arc<dyn Codec> = Arc::new(GenericNode::from_spec(spec));
            registry.register(node.clone())?;
            catalog.nodes.push(node);
        }

        tracing::debug!(
            usb = catalog.usb.len(),
            nodes = catalog.nodes.len(),
            "catalog installed"
        );
        Ok(catalog)
    }

    pub fn usb_transports(&self) -> &[Arc<UsbTransport>] {
        &self.usb
    }

    pub fn nodes(&self) -> &[Arc<dyn Codec>] {
        &self.nodes
    }

    /// Hand the USB transports to a connection manager
    pub fn register_transports(&self, manager: &ConnectionManager) {
        for transport in &self.usb {
            manager.register_transport(transport.clone());
        }
    }

    /// Unregister everything this catalog registered
    pub fn dispose(&self, manager: Option<&ConnectionManager>) {
        for transport in &self.usb {
            if let Some(manager) = manager {
                let as_transport: Arc<dyn Transport> = transport.clone();
                manager.unregister_transport(&as_transport);
            }
            transport.dispose();
        }
        for node in &self.nodes {
            self.hub.registry().unregister(node);
        }
    }
}

/// Ids of the active tree roots
pub fn active_roots(registry: &Registry) -> Vec<String> {
    let nodes = registry.snapshot();
    nodes
        .iter()
        .filter(|node| !nodes.iter().any(|parent| parent.children.contains(&node.id)))
        .map(|node| node.id.clone())
        .collect()
}

/// The active configuration as an indented tree
///
/// ```text
/// usb [3]
///   u2a [2]
///     gpio [1] optional
/// ```
pub fn active_tree(registry: &Registry) -> String {
    fn render(out: &mut String, nodes: &[NodeSnapshot], id: &str, depth: usize) {
        let Some(node) = nodes.iter().find(|n| n.id == id) else {
            return;
        };
        let _ = write!(out, "{:indent$}{} [{}]", "", node.id, node.order, indent = depth * 2);
        if node.optional {
            out.push_str(" optional");
        }
        out.push('\n');
        for child in &node.children {
            render(out, nodes, child, depth + 1);
        }
    }

    let nodes = registry.snapshot();
    let mut out = String::new();
    for root in active_roots(registry) {
        render(&mut out, &nodes, &root, 0);
    }
    out
}

/// How strongly the active configuration needs each device
pub fn device_requirements(registry: &Registry, devices: &[String]) -> Result<Vec<(String, DeviceRequirement)>> {
    let roots = active_roots(registry);
    devices
        .iter()
        .map(|device| {
            let requirement = registry.is_device_required_any(&roots, device, true)?;
            Ok((device.clone(), requirement))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{data_type, NodeKind};
    use crate::registry::{Registry, RegistryOptions};
    use crate::usb::{InboundSink, PortKind, PortWriter, UsbPort, UsbService};
    use async_trait::async_trait;

    struct NoPorts;

    #[async_trait]
    impl UsbService for NoPorts {
        async fn list_ports(&self, _kind: PortKind, _vendor_id: Option<u16>) -> Result<Vec<UsbPort>> {
            Ok(Vec::new())
        }

        async fn open(&self, port: &UsbPort, _baud: Option<u32>, _inbound: InboundSink) -> Result<Box<dyn PortWriter>> {
            Err(crate::error::LinkError::Failure(format!("cannot open {}", port.name)))
        }
    }

    fn hub() -> Arc<PortHub> {
        PortHub::new(Arc::new(NoPorts), Arc::new(Registry::new(RegistryOptions::default())))
    }

    #[test]
    fn test_generic_node_types() {
        let spec = NodeSpec::new("power", NodeKind::Model)
            .with_decoder("void", "u2aPacket")
            .with_device_id("msp");
        let node = GenericNode::from_spec(&spec);
        let decoder = node.core().decoder_types().unwrap();
        assert_eq!(decoder.input, data_type::NOOP_DECODER);
        assert_eq!(decoder.output, data_type::U2A_PACKET_ENCODER);
        assert!(node.core().encoder_types().is_none());
        assert_eq!(node.core().device_id(), Some("msp"));
    }

    #[test]
    fn test_install_and_configure() {
        let config: LinkConfig = toml::from_str(
            r#"
            [[usb]]
            id = "usb"

            [[usb2any]]
            id = "u2a"

            [[nodes]]
            id = "power"
            kind = "model"
            decoder = ["void", "u2aPacket"]

            [[nodes]]
            id = "gpio"
            kind = "model"
            optional = true
            decoder = ["void", "u2aPacket"]
            "#,
        )
        .unwrap();
        let hub = hub();
        let catalog = Catalog::install(&config, &hub, PortPreferences::in_memory("test")).unwrap();
        assert_eq!(catalog.usb_transports().len(), 1);
        assert_eq!(catalog.nodes().len(), 3);

        let registry = hub.registry();
        registry.configure("usb+u2a(power,gpio)").unwrap();
        assert!(registry.is_active("power"));
        assert!(registry.is_optional("gpio").unwrap());
        assert!(!registry.is_optional("usb").unwrap());

        assert_eq!(active_roots(registry), vec!["usb".to_string()]);
        assert_eq!(
            active_tree(registry),
            "usb [4]\n  u2a [3]\n    power [1]\n    gpio [2] optional\n"
        );

        catalog.dispose(None);
        assert!(!registry.is_registered("usb"));
        assert!(!registry.is_registered("gpio"));
    }

    #[test]
    fn test_type_mismatch_from_settings() {
        let config = LinkConfig {
            nodes: vec![
                NodeSpec::new("json", NodeKind::Codec)
                    .with_decoder("string", "string")
                    .with_encoder("string", "string"),
            ],
            usb2any: vec![Default::default()],
            ..LinkConfig::default()
        };
        let hub = hub();
        let _catalog = Catalog::install(&config, &hub, PortPreferences::in_memory("test")).unwrap();

        let err = hub.registry().configure("u2a+json").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid configuration specified: Type Mismatch: u2a output type \"void\" is incompatible with json input type \"string\" in \"u2a+json\"."
        );
    }

    #[test]
    fn test_device_requirements() {
        let config = LinkConfig {
            nodes: vec![
                NodeSpec::new("bus", NodeKind::Transport).with_encoder("buffer", "buffer"),
                NodeSpec::new("a", NodeKind::Model)
                    .with_decoder("buffer", "buffer")
                    .with_device_id("cc"),
                NodeSpec::new("b", NodeKind::Model)
                    .with_decoder("buffer", "buffer")
                    .with_device_id("msp")
                    .optional(),
            ],
            ..LinkConfig::default()
        };
        let hub = hub();
        let _catalog = Catalog::install(&config, &hub, PortPreferences::in_memory("test")).unwrap();
        hub.registry().configure("bus(a,b)").unwrap();

        let devices = vec!["cc".to_string(), "msp".to_string(), "xds".to_string()];
        let report = device_requirements(hub.registry(), &devices).unwrap();
        assert_eq!(
            report,
            vec![
                ("cc".to_string(), DeviceRequirement::Yes),
                ("msp".to_string(), DeviceRequirement::Maybe),
                ("xds".to_string(), DeviceRequirement::No),
            ]
        );
    }
}
