//! USB port model and allocation
//!
//! Serial and HID ports are enumerated by a [`UsbService`] supplied by the
//! application. [`PortHub`] tracks every [`UsbTransport`], hands out ports
//! when they connect, and is what hot-plug handling works through.
//!
//! # Main Types
//!
//! - [`UsbPort`] / [`PortKind`] - an enumerated port
//! - [`UsbService`] / [`PortWriter`] - the OS side: list, open, write, close
//! - [`PortHub`] - shared port allocation across USB transports
//! - [`UsbTransport`] - transport that owns one port while connected
//! - [`HotplugHandler`] - reacts to attach/detach notifications
//!
//! # Submodules
//!
//! - [`allocation`] - scoring and greedy assignment of ports to transports
//! - [`preferences`] - persisted user port and baud rate choices
//! - [`transport`] - the USB transport
//! - [`hotplug`] - device attach/detach reactions

pub mod allocation;
pub mod hotplug;
pub mod preferences;
pub mod transport;

pub use allocation::{allocate_ports, PortRequest, PortSelection};
pub use hotplug::{DeviceEvent, HotplugHandler, UserPortSelection};
pub use preferences::{
    JsonFilePreferences, MemoryPreferences, PortPreferences, PreferenceStore, PREFERENCES_FILE,
};
pub use transport::{FilterPorts, UsbTransport, UsbTransportParams};

use crate::error::Result;
use crate::events::EventHub;
use crate::registry::Registry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::{Arc, Mutex, Weak};

/// Baud rate used when nothing else picks one
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Vendor id HID enumeration falls back to
pub const DEFAULT_HID_VENDOR_ID: u16 = 8263;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortKind {
    Serial,
    Hid,
}

impl std::fmt::Display for PortKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortKind::Serial => write!(f, "serial"),
            PortKind::Hid => write!(f, "hid"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbPort {
    /// OS name of the port, e.g. `COM3` or `/dev/ttyACM0`
    pub name: String,
    pub kind: PortKind,
    #[serde(default)]
    pub vendor_id: Option<u16>,
    #[serde(default)]
    pub product_id: Option<u16>,
    #[serde(default)]
    pub interface_number: Option<u8>,
    /// Held open by another transport or application
    #[serde(default)]
    pub is_opened: bool,
}

impl UsbPort {
    pub fn serial(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: PortKind::Serial,
            vendor_id: None,
            product_id: None,
            interface_number: None,
            is_opened: false,
        }
    }

    pub fn hid(name: impl Into<String>) -> Self {
        Self {
            kind: PortKind::Hid,
            ..Self::serial(name)
        }
    }

    pub fn with_ids(mut self, vendor_id: u16, product_id: u16) -> Self {
        self.vendor_id = Some(vendor_id);
        self.product_id = Some(product_id);
        self
    }

    /// Same physical port (kind and name)
    pub fn same_port(&self, other: &UsbPort) -> bool {
        compare_ports_by_com_name(Some(self), Some(other)) == Ordering::Equal
    }
}

/// Order ports for display and lookup: missing first, HID before serial,
/// then by name
pub fn compare_ports_by_com_name(a: Option<&UsbPort>, b: Option<&UsbPort>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) if a.kind != b.kind => {
            if a.kind == PortKind::Hid {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
        (Some(a), Some(b)) => a.name.cmp(&b.name),
    }
}

/// A port the service suggests for a device name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultPort {
    pub port: UsbPort,
    pub baud_rate: Option<u32>,
}

/// Callback receiving bytes read from an open port
pub type InboundSink = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Write half of an open port
pub trait PortWriter: Send + Sync {
    fn write(&self, data: &[u8]) -> Result<()>;
    fn close(&self) -> Result<()>;
}

/// OS level port enumeration and I/O
#[async_trait]
pub trait UsbService: Send + Sync {
    /// Enumerate ports of one kind; HID listing may be limited to a vendor
    async fn list_ports(&self, kind: PortKind, vendor_id: Option<u16>) -> Result<Vec<UsbPort>>;

    /// Best guess among `ports` for a named device
    async fn default_port(&self, _ports: &[UsbPort], _device_name: Option<&str>) -> Option<DefaultPort> {
        None
    }

    /// Open `port`; inbound bytes are pushed to `inbound` until closed
    async fn open(
        &self,
        port: &UsbPort,
        baud_rate: Option<u32>,
        inbound: InboundSink,
    ) -> Result<Box<dyn PortWriter>>;
}

/// Emitted whenever a USB transport picks its port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSelected {
    pub transport_id: String,
    pub port: UsbPort,
    pub baud_rate: Option<u32>,
    pub available_ports: Vec<UsbPort>,
}

/// Port allocation shared by all USB transports of an application
pub struct PortHub {
    service: Arc<dyn UsbService>,
    registry: Arc<Registry>,
    transports: Mutex<Vec<Weak<UsbTransport>>>,
    last_allocation: Mutex<Vec<PortSelection>>,
    events: EventHub<PortSelected>,
}

/// One transport's outcome of an allocation pass
#[derive(Clone)]
pub struct AcquiredPort {
    pub transport: Arc<UsbTransport>,
    pub port: Option<UsbPort>,
    pub baud_rate: Option<u32>,
    pub available_ports: Vec<UsbPort>,
}

impl PortHub {
    pub fn new(service: Arc<dyn UsbService>, registry: Arc<Registry>) -> Arc<Self> {
        Arc::new(Self {
            service,
            registry,
            transports: Mutex::new(Vec::new()),
            last_allocation: Mutex::new(Vec::new()),
            events: EventHub::new(),
        })
    }

    pub fn service(&self) -> &Arc<dyn UsbService> {
        &self.service
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn events(&self) -> &EventHub<PortSelected> {
        &self.events
    }

    pub(crate) fn add_transport(&self, transport: &Arc<UsbTransport>) {
        if let Ok(mut transports) = self.transports.lock() {
            transports.retain(|t| t.strong_count() > 0);
            if !transports.iter().any(|t| std::ptr::eq(t.as_ptr(), Arc::as_ptr(transport))) {
                transports.push(Arc::downgrade(transport));
            }
        }
    }

    pub(crate) fn remove_transport(&self, transport: &UsbTransport) {
        if let Ok(mut transports) = self.transports.lock() {
            transports.retain(|t| t.strong_count() > 0 && !std::ptr::eq(t.as_ptr(), transport));
        }
    }

    /// Every live USB transport, in registration order
    pub fn transports(&self) -> Vec<Arc<UsbTransport>> {
        self.transports
            .lock()
            .map(|t| t.iter().filter_map(Weak::upgrade).collect())
            .unwrap_or_default()
    }

    /// USB transports of the active configuration
    pub fn active_transports(&self) -> Vec<Arc<UsbTransport>> {
        self.transports()
            .into_iter()
            .filter(|t| self.registry.is_active(t.transport_id()))
            .collect()
    }

    /// Most recent allocation result
    pub fn last_allocation(&self) -> Vec<PortSelection> {
        self.last_allocation
            .lock()
            .map(|a| a.clone())
            .unwrap_or_default()
    }

    /// Enumerate the port kinds the active transports can use
    pub async fn list_ports(&self) -> Result<Vec<UsbPort>> {
        let active = self.active_transports();
        let usb_only = active.iter().all(|t| t.params().usb);
        let hid_only = active.iter().all(|t| t.params().hid);

        let hid_vendors: Vec<u16> = active
            .iter()
            .filter(|t| t.params().hid)
            .map(|t| t.params().vendor_id.unwrap_or(DEFAULT_HID_VENDOR_ID))
            .collect();
        let vendor_id = hid_vendors.first().copied();
        if hid_vendors.iter().any(|v| Some(*v) != vendor_id) {
            tracing::error!("multiple HID transports request different vendor ids; only the first is listed");
        }

        let ports = if usb_only {
            self.service.list_ports(PortKind::Serial, None).await?
        } else if hid_only {
            self.service.list_ports(PortKind::Hid, vendor_id).await?
        } else {
            let mut ports = self.service.list_ports(PortKind::Serial, None).await?;
            ports.extend(self.service.list_ports(PortKind::Hid, vendor_id).await?);
            ports
        };

        for transport in self.transports() {
            transport.forget_vanished_port(&ports);
        }
        Ok(ports)
    }

    /// Run one allocation pass over all active USB transports
    pub async fn acquire_all_ports(&self) -> Result<Vec<AcquiredPort>> {
        let ports = self.list_ports().await?;
        let active = self.active_transports();

        let mut requests = Vec::with_capacity(active.len());
        for transport in &active {
            let request = transport.port_request(&ports).await;
            transport.set_available_ports(request.ports.clone());
            requests.push(request);
        }
        let picks = allocate_ports(&requests);
        tracing::debug!(picks = picks.len(), transports = active.len(), "ports allocated");
        if let Ok(mut last) = self.last_allocation.lock() {
            *last = picks.clone();
        }

        Ok(active
            .into_iter()
            .zip(requests)
            .map(|(transport, request)| {
                let pick = picks.iter().find(|p| p.transport_id == request.transport_id);
                AcquiredPort {
                    port: pick.map(|p| p.port.clone()),
                    baud_rate: pick.map(|p| p.baud_rate),
                    available_ports: request.ports,
                    transport,
                }
            })
            .collect())
    }

    /// Port assigned to `transport_id` by a fresh allocation pass
    pub async fn acquire_port(&self, transport_id: &str) -> Result<Option<AcquiredPort>> {
        Ok(self
            .acquire_all_ports()
            .await?
            .into_iter()
            .find(|a| a.transport.transport_id() == transport_id && a.port.is_some()))
    }
}
