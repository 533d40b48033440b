//! Device attach/detach handling
//!
//! The application forwards OS hot-plug notifications as [`DeviceEvent`]s.
//! A detach disconnects every transport whose port vanished; an attach may
//! connect transports that were waiting for a device.

use super::{AcquiredPort, PortHub, UsbPort, UsbTransport};
use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::transport::Transport;
use crate::types::TransportState;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    Attached,
    Detached,
}

/// A port (or no port) the user picked for a transport
#[derive(Clone)]
pub struct UserPortSelection {
    pub transport: Arc<UsbTransport>,
    pub port: Option<UsbPort>,
    pub baud_rate: Option<u32>,
}

pub struct HotplugHandler {
    hub: Arc<PortHub>,
    manager: Arc<ConnectionManager>,
    paused: AtomicBool,
}

fn port_changed(acquired: &AcquiredPort) -> bool {
    match (&acquired.port, acquired.transport.recently_acquired_port()) {
        (Some(port), Some(recent)) => !port.same_port(&recent),
        (None, None) => false,
        _ => true,
    }
}

impl HotplugHandler {
    pub fn new(hub: Arc<PortHub>, manager: Arc<ConnectionManager>) -> Self {
        Self {
            hub,
            manager,
            paused: AtomicBool::new(false),
        }
    }

    /// Ignore attach events, e.g. while the user is picking ports
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn watches(&self, transport: &UsbTransport) -> bool {
        !transport.params().disable_device_detection
            && self.manager.registry().is_active(transport.transport_id())
    }

    /// Disconnect transports whose port is gone
    pub async fn on_device_detached(&self) -> Result<()> {
        let ports = self.hub.list_ports().await?;
        let lost: Vec<_> = self
            .hub
            .transports()
            .into_iter()
            .filter(|t| self.watches(t) && t.state().can_disconnect() && t.lost_port(&ports))
            .collect();

        for transport in &lost {
            tracing::info!(transport = %transport.transport_id(), "port removed, disconnecting");
        }
        for (transport, result) in lost.iter().zip(join_all(lost.iter().map(|t| t.disconnect())).await) {
            if let Err(e) = result {
                tracing::warn!(transport = %transport.transport_id(), error = %e, "disconnect after detach failed");
            }
        }
        Ok(())
    }

    /// Connect whatever a new device makes connectable
    ///
    /// While connected with some transports down, each idle transport that
    /// now gets a different port is connected on its own. While
    /// disconnected, and if allowed, a full connect runs once every required
    /// transport has a port and at least one of them changed.
    pub async fn on_device_attached(&self) -> Result<()> {
        if self.is_paused() {
            return Ok(());
        }

        let state = self.manager.state();
        if state == TransportState::Connected {
            if !self.manager.is_partially_connected() {
                return Ok(());
            }
            let acquired = self.hub.acquire_all_ports().await?;
            let idle: Vec<_> = acquired
                .iter()
                .filter(|a| {
                    let transport_state = a.transport.state();
                    self.watches(&a.transport)
                        && matches!(
                            transport_state,
                            TransportState::Disconnected | TransportState::Disconnecting
                        )
                        && a.port.is_some()
                        && port_changed(a)
                })
                .map(|a| a.transport.clone())
                .collect();

            let results = join_all(idle.iter().map(|t| t.connect(&[]))).await;
            for (transport, result) in idle.iter().zip(results) {
                if let Err(e) = result {
                    tracing::debug!(transport = %transport.transport_id(), error = %e, "connect after attach failed");
                }
            }
        } else if state == TransportState::Disconnected
            && self.manager.allow_auto_connect_on_device_detection()
        {
            let acquired = self.hub.acquire_all_ports().await?;
            let registry = self.manager.registry();
            let required: Vec<_> = acquired
                .iter()
                .filter(|a| !registry.is_optional(a.transport.transport_id()).unwrap_or(false))
                .collect();
            let missing = required
                .iter()
                .any(|a| a.port.is_none() || a.transport.params().disable_device_detection);
            let changed = required.iter().any(|a| port_changed(a));

            if changed && !missing {
                tracing::info!("device attached, connecting");
                self.manager.connect().await?;
            }
        }
        Ok(())
    }

    pub async fn handle(&self, event: DeviceEvent) -> Result<()> {
        match event {
            DeviceEvent::Attached => self.on_device_attached().await,
            DeviceEvent::Detached => self.on_device_detached().await,
        }
    }

    /// Process events until every sender is dropped
    pub async fn run(&self, mut events: mpsc::Receiver<DeviceEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle(event).await {
                tracing::warn!(?event, error = %e, "device event handling failed");
            }
        }
        tracing::debug!("device event channel closed");
    }

    /// Store user port choices and reconnect what they affect
    ///
    /// Connect failures are reported through the transports' logs, not
    /// returned.
    pub async fn apply_user_port_selections(
        &self,
        selections: &[UserPortSelection],
        auto_connect: bool,
    ) -> Result<()> {
        for selection in selections {
            let port_name = selection.port.as_ref().map(|p| p.name.as_str());
            selection
                .transport
                .set_user_selection(port_name, selection.baud_rate)?;
        }
        let all_optional = selections.iter().all(|s| s.transport.params().optional);

        let manager_state = self.manager.state();
        if manager_state.can_connect() && auto_connect {
            if let Err(e) = self.manager.connect().await {
                tracing::debug!(error = %e, "connect after port selection failed");
            }
        } else if !all_optional {
            if manager_state.can_disconnect() {
                self.manager.disconnect().await;
                if let Err(e) = self.manager.connect().await {
                    tracing::debug!(error = %e, "reconnect after port selection failed");
                }
            } else if auto_connect && self.manager.state().can_connect() {
                if let Err(e) = self.manager.connect().await {
                    tracing::debug!(error = %e, "connect after port selection failed");
                }
            }
        } else {
            join_all(selections.iter().map(|s| reconnect(&s.transport, auto_connect))).await;
        }
        Ok(())
    }
}

async fn reconnect(transport: &UsbTransport, auto_connect: bool) {
    let state = transport.state();
    let result = if state.can_disconnect() {
        match transport.disconnect().await {
            Ok(()) => transport.connect(&[]).await,
            Err(e) => Err(e),
        }
    } else if auto_connect && state.can_connect() {
        transport.connect(&[]).await
    } else {
        Ok(())
    };
    if let Err(e) = result {
        tracing::debug!(transport = %transport.transport_id(), error = %e, "reconnect after port selection failed");
    }
}
