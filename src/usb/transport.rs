//! USB serial/HID transport
//!
//! A [`UsbTransport`] is both the root node of a codec tree and a
//! [`Transport`] the connection manager drives. While connecting it asks the
//! [`PortHub`] for a port, opens it through the [`UsbService`], and from then
//! on writes outbound packets to the port and feeds inbound bytes to its
//! children.
//!
//! [`UsbService`]: super::UsbService

use super::allocation::PortRequest;
use super::preferences::PortPreferences;
use super::{PortHub, PortKind, PortSelected, PortWriter, UsbPort};
use crate::codec::{data_type, Codec, CodecCore, NodeKind, Payload};
use crate::error::{LinkError, Result};
use crate::registry::Registry;
use crate::transport::{ConnectionLog, Transport, TransportCore};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, Weak};

const NO_PORT_FOUND: &str = "No port found.  Please plug your target device into your computer's USB port, and click the connect icon on the left.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbTransportParams {
    pub id: String,
    /// Only serial ports
    pub usb: bool,
    /// Only HID ports (ignored when `usb` is set)
    pub hid: bool,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub interface_number: Option<u8>,
    pub default_baud_rate: Option<u32>,
    /// Passed to the service to pick a default port
    pub device_name: Option<String>,
    pub optional: bool,
    pub device_id: Option<String>,
    /// Ignore attach/detach notifications
    pub disable_device_detection: bool,
}

impl Default for UsbTransportParams {
    fn default() -> Self {
        Self {
            id: "usb".to_string(),
            usb: false,
            hid: false,
            vendor_id: None,
            product_id: None,
            interface_number: None,
            default_baud_rate: None,
            device_name: None,
            optional: false,
            device_id: None,
            disable_device_detection: false,
        }
    }
}

/// Ports a transport may use, handed to the application's port filter
///
/// The filter edits `ports` in place and may recommend one of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterPorts {
    pub ports: Vec<UsbPort>,
    pub recommended_port: Option<UsbPort>,
    pub recommended_baud_rate: Option<u32>,
}

pub type PortFilter = Arc<dyn Fn(&mut FilterPorts) + Send + Sync>;

#[derive(Default)]
struct PortSession {
    writer: Option<Box<dyn PortWriter>>,
    port: Option<UsbPort>,
    baud_rate: Option<u32>,
    recently_acquired: Option<UsbPort>,
    preferred_port: Option<String>,
    available_ports: Vec<UsbPort>,
}

pub struct UsbTransport {
    codec: CodecCore,
    transport: TransportCore,
    params: UsbTransportParams,
    hub: Arc<PortHub>,
    preferences: PortPreferences,
    port_filter: Mutex<Option<PortFilter>>,
    session: Mutex<PortSession>,
    self_ref: Weak<UsbTransport>,
}

impl UsbTransport {
    /// Create the transport and register it with the hub and its registry
    pub fn new(
        params: UsbTransportParams,
        hub: &Arc<PortHub>,
        preferences: PortPreferences,
    ) -> Result<Arc<Self>> {
        let transport = Arc::new_cyclic(|self_ref| {
            let mut codec = CodecCore::new(params.id.clone(), NodeKind::Transport)
                .with_encoder(data_type::buffer_or_string(), data_type::BUFFER)
                .with_optional(params.optional);
            if let Some(device_id) = &params.device_id {
                codec = codec.with_device_id(device_id.clone());
            }
            Self {
                codec,
                transport: TransportCore::new(params.id.clone()),
                params,
                hub: Arc::clone(hub),
                preferences,
                port_filter: Mutex::new(None),
                session: Mutex::new(PortSession::default()),
                self_ref: self_ref.clone(),
            }
        });

        hub.registry().register(transport.clone())?;
        hub.add_transport(&transport);
        Ok(transport)
    }

    /// Remove the transport from the hub and the registry
    pub fn dispose(self: &Arc<Self>) {
        self.hub.remove_transport(self);
        let node: Arc<dyn Codec> = self.clone();
        self.hub.registry().unregister(&node);
    }

    pub fn transport_id(&self) -> &str {
        self.transport.id()
    }

    pub fn params(&self) -> &UsbTransportParams {
        &self.params
    }

    fn registry(&self) -> &Registry {
        self.hub.registry()
    }

    fn with_session<R>(&self, f: impl FnOnce(&mut PortSession) -> R) -> Option<R> {
        self.session.lock().ok().map(|mut s| f(&mut s))
    }

    /// Install the application's port filter
    pub fn set_port_filter<F>(&self, filter: F)
    where
        F: Fn(&mut FilterPorts) + Send + Sync + 'static,
    {
        if let Ok(mut current) = self.port_filter.lock() {
            *current = Some(Arc::new(filter));
        }
    }

    /// Port the transport is connected on
    pub fn current_port(&self) -> Option<UsbPort> {
        self.with_session(|s| s.port.clone()).flatten()
    }

    pub fn current_baud_rate(&self) -> Option<u32> {
        self.with_session(|s| s.baud_rate).flatten()
    }

    /// Port acquired by the last connect attempt, successful or not
    pub fn recently_acquired_port(&self) -> Option<UsbPort> {
        self.with_session(|s| s.recently_acquired.clone()).flatten()
    }

    /// Current port, else the port of the last attempt
    pub fn selected_port(&self) -> Option<UsbPort> {
        self.current_port().or_else(|| self.recently_acquired_port())
    }

    /// Ports that passed the filters in the last allocation pass
    pub fn available_ports(&self) -> Vec<UsbPort> {
        self.with_session(|s| s.available_ports.clone()).unwrap_or_default()
    }

    pub(crate) fn set_available_ports(&self, ports: Vec<UsbPort>) {
        self.with_session(|s| s.available_ports = ports);
    }

    /// Last port the transport connected on successfully
    pub fn preferred_port(&self) -> Option<String> {
        self.with_session(|s| s.preferred_port.clone()).flatten()
    }

    pub fn user_selected_port_name(&self) -> Option<String> {
        self.preferences.port_name(&self.params.id)
    }

    pub fn user_selected_baud_rate(&self) -> Option<u32> {
        self.preferences.baud_rate(&self.params.id)
    }

    /// Store the user's choice; `None` clears it
    pub fn set_user_selection(&self, port_name: Option<&str>, baud_rate: Option<u32>) -> Result<()> {
        self.preferences.set_port_name(&self.params.id, port_name)?;
        self.preferences.set_baud_rate(&self.params.id, baud_rate)
    }

    pub(crate) fn forget_vanished_port(&self, ports: &[UsbPort]) {
        self.with_session(|s| {
            if s
                .recently_acquired
                .as_ref()
                .is_some_and(|recent| !ports.iter().any(|port| port.same_port(recent)))
            {
                s.recently_acquired = None;
            }
        });
    }

    /// Whether the port in use is missing from `ports`
    pub fn lost_port(&self, ports: &[UsbPort]) -> bool {
        match self.current_port() {
            Some(in_use) => !ports.iter().any(|port| port.same_port(&in_use)),
            None => false,
        }
    }

    fn filter_ports(&self, ports: &[UsbPort]) -> FilterPorts {
        let params = &self.params;
        let kind = if params.usb {
            Some(PortKind::Serial)
        } else if params.hid {
            Some(PortKind::Hid)
        } else {
            None
        };
        let matches = |wanted: Option<u16>, actual: Option<u16>| wanted.is_none() || wanted == actual;

        let mut details = FilterPorts {
            ports: ports
                .iter()
                .filter(|port| kind.map_or(true, |k| port.kind == k))
                .filter(|port| matches(params.vendor_id, port.vendor_id))
                .filter(|port| matches(params.product_id, port.product_id))
                .filter(|port| {
                    params.interface_number.is_none() || params.interface_number == port.interface_number
                })
                .cloned()
                .collect(),
            ..FilterPorts::default()
        };

        let filter = self.port_filter.lock().ok().and_then(|f| f.clone());
        if let Some(filter) = filter {
            filter(&mut details);
        }
        details
    }

    /// What this transport brings to an allocation pass
    pub(crate) async fn port_request(&self, ports: &[UsbPort]) -> PortRequest {
        let mut details = self.filter_ports(ports);
        if details.recommended_port.is_none() {
            let default = self
                .hub
                .service()
                .default_port(&details.ports, self.params.device_name.as_deref())
                .await;
            if let Some(default) = default {
                details.recommended_port = Some(default.port);
                details.recommended_baud_rate = self.params.default_baud_rate.or(default.baud_rate);
            }
        }

        let (current, preferred_port) = self
            .with_session(|s| {
                (
                    s.port.clone().map(|port| (port, s.baud_rate)),
                    s.preferred_port.clone(),
                )
            })
            .unwrap_or_default();

        PortRequest {
            transport_id: self.params.id.clone(),
            optional: self.registry().is_optional(&self.params.id).unwrap_or(self.params.optional),
            ports: details.ports,
            current,
            user_selected_port: self.user_selected_port_name(),
            user_selected_baud_rate: self.user_selected_baud_rate(),
            preferred_port,
            recommended_port: details.recommended_port.map(|p| p.name),
            recommended_baud_rate: details.recommended_baud_rate,
            default_baud_rate: self.params.default_baud_rate,
        }
    }

    fn inbound_sink(&self) -> super::InboundSink {
        let this = self.self_ref.clone();
        Arc::new(move |bytes: Vec<u8>| {
            if let Some(this) = this.upgrade() {
                if let Err(e) = this.codec.deliver_to_children(Payload::Bytes(bytes)) {
                    tracing::warn!(transport = %this.params.id, error = %e, "inbound data rejected");
                }
            }
        })
    }
}

#[async_trait]
impl Codec for UsbTransport {
    fn core(&self) -> &CodecCore {
        &self.codec
    }

    async fn on_connect(&self, log: &dyn ConnectionLog) -> Result<()> {
        let acquired = self.hub.acquire_port(&self.params.id).await?;
        let selected = acquired.and_then(|a| a.port.map(|port| (port, a.baud_rate, a.available_ports)));
        self.with_session(|s| s.recently_acquired = selected.as_ref().map(|(port, _, _)| port.clone()));

        self.transport.assert_still_connecting()?;

        let Some((port, baud_rate, available_ports)) = selected else {
            return Err(LinkError::Failure(NO_PORT_FOUND.to_string()));
        };

        let description = match (port.kind, baud_rate) {
            (PortKind::Serial, Some(baud)) => format!("{}:{}", port.name, baud),
            _ => port.name.clone(),
        };
        self.transport.set_connection_description(Some(description));

        self.hub.events().emit(PortSelected {
            transport_id: self.params.id.clone(),
            port: port.clone(),
            baud_rate,
            available_ports,
        });

        log.add_debug_message(&format!("Opening {} port {}", port.kind, port.name));
        let writer = self
            .hub
            .service()
            .open(&port, baud_rate, self.inbound_sink())
            .await?;
        self.with_session(|s| {
            s.writer = Some(writer);
            s.port = Some(port);
            s.baud_rate = baud_rate;
        });
        Ok(())
    }

    async fn on_disconnect(&self, _log: &dyn ConnectionLog) -> Result<()> {
        let writer = self
            .with_session(|s| {
                s.port = None;
                s.baud_rate = None;
                s.writer.take()
            })
            .flatten();
        match writer {
            Some(writer) => writer.close(),
            None => Ok(()),
        }
    }

    fn encode(&self, data: Payload) -> Result<()> {
        let session = self
            .session
            .lock()
            .map_err(|_| LinkError::Failure(format!("{} is unavailable", self.codec.describe())))?;
        match &session.writer {
            Some(writer) => writer.write(data.as_bytes()),
            None => Err(LinkError::Failure(format!("{} is not open", self.codec.describe()))),
        }
    }
}

#[async_trait]
impl Transport for UsbTransport {
    fn core(&self) -> &TransportCore {
        &self.transport
    }

    async fn connect(&self, failed_devices: &[String]) -> Result<()> {
        self.transport.connect_chain(self.registry(), failed_devices).await?;
        if let Some(port) = self.current_port() {
            self.with_session(|s| s.preferred_port = Some(port.name));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.transport.disconnect_chain(self.registry()).await
    }
}

impl std::fmt::Display for UsbTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.codec.describe())
    }
}
