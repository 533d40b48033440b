//! Codec chain contracts
//!
//! A configuration string such as `usb+u2a(power,gpio)` wires nodes into a
//! tree. Every node implements [`Codec`]; the shared bookkeeping (identity,
//! port types, chain links) lives in a [`CodecCore`] that concrete nodes embed
//! by value.
//!
//! # Architecture
//!
//! - [`NodeKind`] - transport (tree root), codec (middle), or model (leaf)
//! - [`PortTypes`] - input/output [`DataType`] pair of one side of a node
//! - [`CodecCore`] - identity, port types, parent/children links
//! - [`Codec`] - lifecycle hooks (`configure`, `on_connect`, `on_disconnect`,
//!   `ping`, `deconfigure`) and the data path (`encode` toward the transport,
//!   `decode` toward the models)
//!
//! Connect runs the hooks top-down and disconnect bottom-up; the ordering is
//! driven by [`crate::registry::Registry`].
//!
//! # Submodules
//!
//! - [`data_type`] - nominal payload types and compatibility
//! - [`queue`] - FIFO command/response reconciliation by sequence number
//! - [`message`] - pause/resume of outbound packets over a command queue
//! - [`usb2any`] - the USB2ANY packet codec

pub mod data_type;
pub mod message;
pub mod queue;
pub mod usb2any;

pub use data_type::{DataType, TypeRole};
pub use message::MessageCodecCore;
pub use queue::CommandResponseQueue;
pub use usb2any::{Usb2anyCodec, Usb2anyParams};

use crate::error::Result;
use crate::transport::ConnectionLog;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, Weak};

/// Position a node can take in a configuration tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Transport,
    Codec,
    Model,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::Transport => write!(f, "transport"),
            NodeKind::Codec => write!(f, "codec"),
            NodeKind::Model => write!(f, "model"),
        }
    }
}

/// Data moving through the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Bytes(Vec<u8>),
    Text(String),
}

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Bytes(bytes) => bytes,
            Payload::Text(text) => text.as_bytes(),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Payload::Bytes(bytes) => bytes,
            Payload::Text(text) => text.into_bytes(),
        }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

/// Input and output types of one side of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortTypes {
    pub input: DataType,
    pub output: DataType,
}

impl PortTypes {
    pub fn new(input: DataType, output: DataType) -> Self {
        Self { input, output }
    }
}

#[derive(Default)]
struct ChainLinks {
    parent: Option<Weak<dyn Codec>>,
    children: Vec<Arc<dyn Codec>>,
}

/// State shared by every node implementation
pub struct CodecCore {
    id: String,
    kind: NodeKind,
    device_id: Option<String>,
    optional: bool,
    encoder: Option<PortTypes>,
    decoder: Option<PortTypes>,
    links: Mutex<ChainLinks>,
}

impl CodecCore {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            device_id: None,
            optional: false,
            encoder: None,
            decoder: None,
            links: Mutex::new(ChainLinks::default()),
        }
    }

    /// Give the node an encoder side (it can parent other nodes)
    pub fn with_encoder(mut self, input: DataType, output: DataType) -> Self {
        self.encoder = Some(PortTypes::new(input, output));
        self
    }

    /// Give the node a decoder side (it can be attached below a parent)
    pub fn with_decoder(mut self, input: DataType, output: DataType) -> Self {
        self.decoder = Some(PortTypes::new(input, output));
        self
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }

    pub fn encoder_types(&self) -> Option<&PortTypes> {
        self.encoder.as_ref()
    }

    pub fn decoder_types(&self) -> Option<&PortTypes> {
        self.decoder.as_ref()
    }

    /// `<kind> id="<id>"`, as used in user facing messages
    pub fn describe(&self) -> String {
        format!("{} id=\"{}\"", self.kind, self.id)
    }

    pub fn parent(&self) -> Option<Arc<dyn Codec>> {
        self.links
            .lock()
            .ok()
            .and_then(|links| links.parent.as_ref().and_then(Weak::upgrade))
    }

    pub fn children(&self) -> Vec<Arc<dyn Codec>> {
        self.links
            .lock()
            .map(|links| links.children.clone())
            .unwrap_or_default()
    }

    pub(crate) fn set_parent_encoder(&self, parent: &Arc<dyn Codec>) {
        if let Ok(mut links) = self.links.lock() {
            links.parent = Some(Arc::downgrade(parent));
        }
    }

    pub(crate) fn add_child_decoder(&self, child: Arc<dyn Codec>) {
        if let Ok(mut links) = self.links.lock() {
            links.children.push(child);
        }
    }

    pub(crate) fn clear_links(&self) {
        if let Ok(mut links) = self.links.lock() {
            links.parent = None;
            links.children.clear();
        }
    }

    /// Hand outbound data to the parent encoder
    ///
    /// A node that is not attached drops the data.
    pub fn send_to_parent(&self, data: Payload) -> Result<()> {
        match self.parent() {
            Some(parent) => parent.encode(data),
            None => {
                tracing::trace!(node = %self.id, "no parent encoder, dropping outbound data");
                Ok(())
            }
        }
    }

    /// Hand inbound data to every child decoder
    pub fn deliver_to_children(&self, data: Payload) -> Result<()> {
        for child in self.children() {
            child.decode(data.clone())?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for CodecCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecCore")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("device_id", &self.device_id)
            .field("optional", &self.optional)
            .finish()
    }
}

/// A node of the codec chain
#[async_trait]
pub trait Codec: Send + Sync {
    fn core(&self) -> &CodecCore;

    /// Called when the node is attached by a configuration
    fn configure(&self) {}

    /// Called when the node is detached
    fn deconfigure(&self) {}

    async fn on_connect(&self, _log: &dyn ConnectionLog) -> Result<()> {
        Ok(())
    }

    async fn on_disconnect(&self, _log: &dyn ConnectionLog) -> Result<()> {
        Ok(())
    }

    /// Liveness probe
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// Data travelling from a child toward the transport
    fn encode(&self, data: Payload) -> Result<()> {
        self.core().send_to_parent(data)
    }

    /// Data travelling from the parent toward the models
    fn decode(&self, data: Payload) -> Result<()> {
        self.core().deliver_to_children(data)
    }
}

/// Compare two nodes by instance rather than by id
pub fn same_node(a: &Arc<dyn Codec>, b: &Arc<dyn Codec>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct Recorder {
        core: CodecCore,
        seen: StdMutex<Vec<Payload>>,
    }

    impl Codec for Recorder {
        fn core(&self) -> &CodecCore {
            &self.core
        }

        fn encode(&self, data: Payload) -> Result<()> {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(data);
            }
            Ok(())
        }

        fn decode(&self, data: Payload) -> Result<()> {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(data);
            }
            Ok(())
        }
    }

    fn recorder(id: &str, kind: NodeKind) -> Arc<Recorder> {
        Arc::new(Recorder {
            core: CodecCore::new(id, kind)
                .with_encoder(data_type::BUFFER, data_type::BUFFER)
                .with_decoder(data_type::BUFFER, data_type::BUFFER),
            seen: StdMutex::new(Vec::new()),
        })
    }

    #[test]
    fn test_describe() {
        let core = CodecCore::new("uart", NodeKind::Model);
        assert_eq!(core.describe(), "model id=\"uart\"");
    }

    #[test]
    fn test_links_route_data_both_ways() {
        let parent = recorder("usb", NodeKind::Transport);
        let child = recorder("cr", NodeKind::Codec);
        let parent_dyn: Arc<dyn Codec> = parent.clone();
        let child_dyn: Arc<dyn Codec> = child.clone();

        parent.core.add_child_decoder(child_dyn.clone());
        child.core.set_parent_encoder(&parent_dyn);

        child.core.send_to_parent(Payload::Bytes(vec![1])).unwrap();
        parent.core.deliver_to_children(Payload::Text("hi".into())).unwrap();

        assert_eq!(parent.seen.lock().unwrap().as_slice(), &[Payload::Bytes(vec![1])]);
        assert_eq!(child.seen.lock().unwrap().as_slice(), &[Payload::Text("hi".into())]);
    }

    #[test]
    fn test_unattached_send_is_dropped() {
        let node = recorder("lonely", NodeKind::Codec);
        assert!(node.core.send_to_parent(Payload::Bytes(vec![0])).is_ok());
    }

    #[test]
    fn test_clear_links() {
        let parent = recorder("usb", NodeKind::Transport);
        let child: Arc<dyn Codec> = recorder("cr", NodeKind::Codec);
        parent.core.add_child_decoder(child);
        parent.core.clear_links();
        assert!(parent.core.children().is_empty());
    }

    #[test]
    fn test_same_node() {
        let a: Arc<dyn Codec> = recorder("a", NodeKind::Model);
        let b: Arc<dyn Codec> = recorder("a", NodeKind::Model);
        assert!(same_node(&a, &a.clone()));
        assert!(!same_node(&a, &b));
    }
}
