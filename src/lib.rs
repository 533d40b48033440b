//! # target-link: codec chains and connection orchestration for embedded targets
//!
//! A configuration string such as `usb+u2a(power,gpio)` describes how a
//! physical transport, protocol codecs and data models are wired into a tree.
//! target-link parses such strings, attaches registered nodes accordingly, and
//! connects and disconnects the resulting trees across several transports.
//!
//! ## Architecture
//!
//! - **Codecs**: nodes with typed encoder/decoder sides ([`codec`])
//! - **Registry**: node lookup, configuration parsing and attach ([`registry`])
//! - **Transports**: connectable tree roots with a state machine ([`transport`])
//! - **Connection manager**: multi-transport connect/disconnect and program
//!   loading ([`connection`])
//! - **USB**: port allocation, preferences and hot-plug ([`usb`])
//! - **Events**: listener and crossbeam subscriber fan-out ([`events`])
//!
//! ## Configuration
//!
//! Settings are TOML ([`config::LinkConfig`]); application data lives in the
//! platform data directory under `dev.target-link`.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use target_link::{ConnectionManager, Registry};
//!
//! let registry = Arc::new(Registry::default());
//! let manager = ConnectionManager::new(registry.clone());
//! manager.register_configuration("default", "usb+u2a(power)");
//! manager.set_active_configuration("default")?;
//! manager.connect().await?;
//! ```

pub mod catalog;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod registry;
pub mod transport;
pub mod types;
pub mod usb;

// Re-export commonly used types
pub use catalog::{Catalog, GenericNode};
pub use codec::{Codec, CodecCore, DataType, NodeKind, Payload};
pub use config::LinkConfig;
pub use connection::{ConnectionManager, ManagerEvent, ProgramLoader};
pub use error::{LinkError, Result};
pub use events::EventHub;
pub use registry::{Registry, RegistryOptions};
pub use transport::{ConnectionLog, ConnectionLogger, Transport, TransportCore};
pub use types::{DeviceRequirement, TransportEvent, TransportState};
pub use usb::{PortHub, UsbPort, UsbService, UsbTransport};
