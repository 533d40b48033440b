//! Connection manager
//!
//! Drives every transport of the active configuration through connect and
//! disconnect, runs program loaders first, and folds the individual transport
//! states into one overall state.
//!
//! # Main Types
//!
//! - [`ConnectionManager`] - owns the configuration ids, the registered
//!   transports and program loaders, and the overall state
//! - [`ManagerEvent`] - busy state and configuration changes
//! - [`ProgramLoader`] - loads firmware before the transports connect
//! - [`compute_status`] - the pure state fold, see [`status`]
//!
//! # Connect sequence
//!
//! 1. Apply the pending configuration; a bad one fails the connect.
//! 2. Run required program loaders in order; any failure aborts.
//! 3. Run optional program loaders; failures become warnings and mark their
//!    device as failed.
//! 4. Connect all active transports concurrently; a failing required
//!    transport takes every other transport down with it.
//! 5. Fold the transport states into the manager state.

pub mod loader;
pub mod status;

pub use loader::{ProgramLoader, ProgressCallback};
pub use status::{compute_status, ConnectionStatus, TransportStatus};

use crate::error::{LinkError, Result};
use crate::events::{EventHub, ListenerId};
use crate::registry::Registry;
use crate::transport::{ConnectContext, ConnectionLog, ConnectionLogger, Transport, TransportCore};
use crate::types::{DeviceRequirement, TransportEvent, TransportState};
use futures::future::{join_all, BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use loader::{device_of, LoaderBuckets};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::oneshot;

/// Id the manager uses for its own log and abort messages
pub const MANAGER_ID: &str = "connection manager";

/// Configuration id used when a raw configuration string is made active
pub const DEFAULT_CONFIGURATION_ID: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    /// The manager started or finished a connect or disconnect
    BusyStateChanged { is_busy: bool },
    /// A new configuration was applied to the registry
    ActiveConfigurationChanged { configuration_id: String },
    PartiallyConnectedChanged { partially_connected: bool },
}

#[derive(Debug, Clone)]
enum ConfigurationError {
    NotConfigured,
    Invalid(String),
}

impl ConfigurationError {
    fn to_error(&self) -> LinkError {
        match self {
            ConfigurationError::NotConfigured => LinkError::NoActiveConfiguration,
            ConfigurationError::Invalid(message) => LinkError::Configuration(message.clone()),
        }
    }
}

struct RegisteredTransport {
    transport: Arc<dyn Transport>,
    listener: ListenerId,
}

struct ManagerState {
    transports: Vec<RegisteredTransport>,
    loaders: Vec<Arc<dyn ProgramLoader>>,
    configurations: HashMap<String, String>,
    configuration_waiters: HashMap<String, Vec<oneshot::Sender<String>>>,
    configuration_error: Option<ConfigurationError>,
    next_configuration: String,
    active_configuration_id: String,
    partially_connected: bool,
}

impl Default for ManagerState {
    fn default() -> Self {
        Self {
            transports: Vec::new(),
            loaders: Vec::new(),
            configurations: HashMap::new(),
            configuration_waiters: HashMap::new(),
            configuration_error: Some(ConfigurationError::NotConfigured),
            next_configuration: String::new(),
            active_configuration_id: DEFAULT_CONFIGURATION_ID.to_string(),
            partially_connected: false,
        }
    }
}

fn same_transport(a: &Arc<dyn Transport>, b: &Arc<dyn Transport>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

fn same_loader(a: &Arc<dyn ProgramLoader>, b: &Arc<dyn ProgramLoader>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Decrements the busy count when dropped
struct BusyGuard<'a> {
    manager: &'a ConnectionManager,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        if self.manager.busy.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.manager
                .events
                .emit(ManagerEvent::BusyStateChanged { is_busy: false });
        }
    }
}

enum Step {
    Connected { required: bool, result: Result<()> },
    Disconnected,
}

pub struct ConnectionManager {
    core: TransportCore,
    registry: Arc<Registry>,
    state: Mutex<ManagerState>,
    busy: AtomicUsize,
    allow_auto_connect: AtomicBool,
    events: EventHub<ManagerEvent>,
    self_ref: Weak<ConnectionManager>,
}

impl ConnectionManager {
    pub fn new(registry: Arc<Registry>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            core: TransportCore::new(MANAGER_ID),
            registry,
            state: Mutex::new(ManagerState::default()),
            busy: AtomicUsize::new(0),
            allow_auto_connect: AtomicBool::new(false),
            events: EventHub::new(),
            self_ref: self_ref.clone(),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, ManagerState>> {
        self.state
            .lock()
            .map_err(|_| LinkError::Failure("connection manager state poisoned".to_string()))
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Overall state of the active transports
    pub fn state(&self) -> TransportState {
        self.core.state()
    }

    pub fn events(&self) -> &EventHub<ManagerEvent> {
        &self.events
    }

    /// Manager state changes plus the log events of every transport
    pub fn transport_events(&self) -> &EventHub<TransportEvent> {
        self.core.events()
    }

    pub fn log(&self) -> &ConnectionLogger {
        self.core.logger()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst) > 0
    }

    fn busy_guard(&self) -> BusyGuard<'_> {
        if self.busy.fetch_add(1, Ordering::SeqCst) == 0 {
            self.events
                .emit(ManagerEvent::BusyStateChanged { is_busy: true });
        }
        BusyGuard { manager: self }
    }

    pub fn allow_auto_connect_on_device_detection(&self) -> bool {
        self.allow_auto_connect.load(Ordering::SeqCst)
    }

    pub fn set_allow_auto_connect_on_device_detection(&self, allow: bool) {
        self.allow_auto_connect.store(allow, Ordering::SeqCst);
    }

    pub fn is_partially_connected(&self) -> bool {
        self.lock().map(|s| s.partially_connected).unwrap_or(false)
    }

    pub fn active_configuration_id(&self) -> String {
        self.lock()
            .map(|s| s.active_configuration_id.clone())
            .unwrap_or_else(|_| DEFAULT_CONFIGURATION_ID.to_string())
    }

    /// Track a transport; only transports of the active configuration connect
    pub fn register_transport(&self, transport: Arc<dyn Transport>) {
        let Ok(mut state) = self.lock() else {
            return;
        };
        if state
            .transports
            .iter()
            .any(|t| same_transport(&t.transport, &transport))
        {
            return;
        }
        let manager = self.self_ref.clone();
        let listener = transport.events().add_listener(move |event| {
            if let Some(manager) = manager.upgrade() {
                manager.on_transport_event(event);
            }
        });
        tracing::debug!(transport = %transport.id(), "transport registered");
        state.transports.push(RegisteredTransport {
            transport,
            listener,
        });
    }

    pub fn unregister_transport(&self, transport: &Arc<dyn Transport>) {
        let Ok(mut state) = self.lock() else {
            return;
        };
        state.transports.retain(|t| {
            if same_transport(&t.transport, transport) {
                t.transport.events().remove_listener(t.listener);
                false
            } else {
                true
            }
        });
    }

    fn on_transport_event(&self, event: &TransportEvent) {
        match event {
            TransportEvent::StateChanged { .. } => {
                if !self.is_busy() {
                    self.compute_status();
                }
            }
            TransportEvent::Log(entry) => {
                self.core.events().emit(TransportEvent::Log(entry.clone()));
            }
        }
    }

    /// Every registered transport, active or not
    pub fn transports(&self) -> Vec<Arc<dyn Transport>> {
        self.lock()
            .map(|s| s.transports.iter().map(|t| t.transport.clone()).collect())
            .unwrap_or_default()
    }

    /// Registered transports that are part of the active configuration,
    /// in configuration order
    pub fn active_transports(&self) -> Vec<Arc<dyn Transport>> {
        let mut active: Vec<_> = self
            .transports()
            .into_iter()
            .filter(|t| self.registry.is_active(t.id()))
            .collect();
        active.sort_by(|a, b| self.registry.cmp_order(a.id(), b.id()));
        active
    }

    pub fn register_program_loader(&self, loader: Arc<dyn ProgramLoader>) {
        if let Ok(mut state) = self.lock() {
            if !state.loaders.iter().any(|l| same_loader(l, &loader)) {
                state.loaders.push(loader);
            }
        }
    }

    pub fn unregister_program_loader(&self, loader: &Arc<dyn ProgramLoader>) {
        if let Ok(mut state) = self.lock() {
            state.loaders.retain(|l| !same_loader(l, loader));
        }
    }

    fn program_loaders(&self) -> Vec<Arc<dyn ProgramLoader>> {
        self.lock().map(|s| s.loaders.clone()).unwrap_or_default()
    }

    /// Make a configuration string available under `id`
    pub fn register_configuration(&self, id: impl Into<String>, configuration: impl Into<String>) {
        let id = id.into();
        let configuration = configuration.into();
        let waiters = match self.lock() {
            Ok(mut state) => {
                state.configurations.insert(id.clone(), configuration.clone());
                state.configuration_waiters.remove(&id).unwrap_or_default()
            }
            Err(_) => return,
        };
        for waiter in waiters {
            let _ = waiter.send(configuration.clone());
        }
    }

    pub fn unregister_configuration(&self, id: &str) {
        if let Ok(mut state) = self.lock() {
            state.configurations.remove(id);
            state.configuration_waiters.remove(id);
        }
    }

    /// Whether `id` names a registered (or future) configuration rather than
    /// being a configuration string or a node id
    pub fn is_target_configuration_id(&self, id: &str) -> bool {
        if id.contains(['+', ',', '(', ')']) {
            return false;
        }
        let known = self
            .lock()
            .map(|s| s.configurations.contains_key(id))
            .unwrap_or(false);
        if known {
            return true;
        }
        self.registry.get_instance(id).is_err()
    }

    fn configuration_error(&self) -> Option<LinkError> {
        self.lock()
            .ok()
            .and_then(|s| s.configuration_error.as_ref().map(ConfigurationError::to_error))
    }

    /// Choose the configuration used by the next connect
    ///
    /// `active` is either the id of a registered configuration or a
    /// configuration string. While disconnected it is applied right away.
    pub fn set_active_configuration(&self, active: &str) -> Result<()> {
        let id = active.trim();
        let is_id = self.is_target_configuration_id(id);
        {
            let mut state = self.lock()?;
            if is_id {
                state.active_configuration_id = id.to_string();
                let configuration = state.configurations.get(id).cloned().unwrap_or_default();
                state.next_configuration = configuration;
                if state.next_configuration.is_empty() {
                    let message = format!(
                        "Invalid configuration specified: Missing <gc-target-configuration id=\"{}\">.  This must exist somewhere in your index.gui.",
                        id
                    );
                    state.configuration_error = Some(ConfigurationError::Invalid(message.clone()));
                    return Err(LinkError::Configuration(message));
                }
            } else {
                state.active_configuration_id = DEFAULT_CONFIGURATION_ID.to_string();
                state.next_configuration = id.to_string();
            }
        }

        if self.core.state().is_disconnected() {
            self.ensure_configuration();
            if let Some(error) = self.configuration_error() {
                return Err(error);
            }
        }
        Ok(())
    }

    /// Wait until the configuration `id` and all its nodes are registered
    pub async fn when_configuration_ready(&self, id: &str) -> Result<()> {
        let is_id = self.is_target_configuration_id(id);
        let pending = {
            let mut state = self.lock()?;
            match state.configurations.get(id) {
                Some(configuration) => Ok(configuration.clone()),
                None if is_id => {
                    let (tx, rx) = oneshot::channel();
                    state
                        .configuration_waiters
                        .entry(id.to_string())
                        .or_default()
                        .push(tx);
                    Err(rx)
                }
                None => Ok(id.to_string()),
            }
        };
        let configuration = match pending {
            Ok(configuration) => configuration,
            Err(rx) => rx
                .await
                .map_err(|_| LinkError::Disposed("Connection manager".to_string()))?,
        };
        self.registry.when_configuration_ready(&configuration).await
    }

    /// Apply the pending configuration to the registry, if there is one
    fn ensure_configuration(&self) {
        let next = match self.lock() {
            Ok(mut state) => std::mem::take(&mut state.next_configuration),
            Err(_) => return,
        };
        if next.is_empty() {
            return;
        }

        let result = self.registry.configure(&next);
        if let Err(e) = &result {
            tracing::warn!(configuration = %next, error = %e, "configuration rejected");
        }
        let configuration_id = match self.lock() {
            Ok(mut state) => {
                state.configuration_error = result
                    .err()
                    .map(|e| ConfigurationError::Invalid(e.to_string()));
                state.active_configuration_id.clone()
            }
            Err(_) => return,
        };
        self.events
            .emit(ManagerEvent::ActiveConfigurationChanged { configuration_id });
    }

    /// Fold the active transport states into the manager state
    pub fn compute_status(&self) {
        let statuses: Vec<TransportStatus> = self
            .active_transports()
            .iter()
            .map(|t| TransportStatus {
                state: t.state(),
                optional: self.registry.is_optional(t.id()).unwrap_or(false),
                partially_connected: self.registry.is_partially_connected(t.id()),
            })
            .collect();
        let status = status::compute_status(&statuses);

        let changed = match self.lock() {
            Ok(mut state) => {
                let was = state.partially_connected;
                state.partially_connected = status.partially_connected;
                was != status.partially_connected
            }
            Err(_) => false,
        };
        self.core.set_state(status.state);
        if changed {
            self.events.emit(ManagerEvent::PartiallyConnectedChanged {
                partially_connected: status.partially_connected,
            });
        }
        if status.state == TransportState::Disconnected {
            self.ensure_configuration();
        }
    }

    /// Connect the active configuration
    pub async fn connect(&self) -> Result<()> {
        let token = loop {
            if let Some(token) = self.core.begin_connect() {
                break token;
            }
            match self.core.wait_until_settled().await {
                TransportState::Connected => return Ok(()),
                TransportState::Disconnected => continue,
                _ => {}
            }
        };

        tracing::info!("starting to connect");
        let result = {
            let _busy = self.busy_guard();
            let result = self.do_connect(ConnectContext::new(MANAGER_ID, self.core.logger(), token)).await;
            if let Err(e) = &result {
                let message = e.to_string();
                if e.is_abort() {
                    self.core.logger().add_progress_message(&message, None);
                } else {
                    self.core.logger().add_error_message(&message, None);
                }
                self.shutdown().await;
            }
            result
        };
        tracing::info!(state = %self.core.state(), "finished connecting");

        result?;
        if self.core.state().is_disconnected() {
            return Err(LinkError::TransportsFailedToConnect);
        }
        Ok(())
    }

    async fn do_connect(&self, ctx: ConnectContext<'_>) -> Result<()> {
        self.ensure_configuration();
        if let Some(error) = self.configuration_error() {
            return Err(error);
        }

        let active = self.active_transports();
        if active.is_empty() {
            return Err(LinkError::NoActiveTransports);
        }
        let active_ids: Vec<&str> = active.iter().map(|t| t.id()).collect();

        let mut required = LoaderBuckets::new();
        let mut optional = LoaderBuckets::new();
        for loader in self.program_loaders() {
            match device_of(loader.as_ref()).map(str::to_string) {
                Some(device) => {
                    let requirement = self
                        .registry
                        .is_device_required_any(&active_ids, &device, true)
                        .unwrap_or(DeviceRequirement::No);
                    match requirement {
                        DeviceRequirement::Yes if !loader.is_optional() => required.push(&device, loader),
                        DeviceRequirement::Yes | DeviceRequirement::Maybe => optional.push(&device, loader),
                        DeviceRequirement::No => {}
                    }
                }
                None if loader.is_optional() => optional.push("", loader),
                None => required.push("", loader),
            }
        }

        for (device, loader) in required.in_order() {
            ctx.assert_still_connecting()?;
            if let Err(e) = loader.load_program(self.core.logger(), None, false).await {
                let owner = active
                    .iter()
                    .find(|t| {
                        self.registry.is_device_required(t.id(), &device, true).ok()
                            == Some(DeviceRequirement::Yes)
                    })
                    .or_else(|| active.first());
                if let Some(owner) = owner {
                    owner.log().add_error_message(&e.to_string(), None);
                }
                return Err(LinkError::RequiredProgramsFailed);
            }
        }

        let mut failed_devices = Vec::new();
        for (device, loader) in optional.in_order() {
            ctx.assert_still_connecting()?;
            if let Err(e) = loader.load_program(self.core.logger(), None, false).await {
                if !loader.is_optional() && !device.is_empty() {
                    failed_devices.push(device);
                }
                self.core.logger().add_warning_message(&e.to_string(), None);
            }
        }

        ctx.assert_still_connecting()?;

        let failed_devices = Arc::new(failed_devices);
        let mut pending: FuturesUnordered<BoxFuture<'_, Step>> = FuturesUnordered::new();
        for transport in &active {
            let required = !self.registry.is_optional(transport.id()).unwrap_or(false);
            let transport = transport.clone();
            let failed_devices = failed_devices.clone();
            pending.push(
                async move {
                    let result = transport.connect(&failed_devices).await;
                    Step::Connected { required, result }
                }
                .boxed(),
            );
        }

        let mut required_failure = None;
        while let Some(step) = pending.next().await {
            let Step::Connected {
                required: true,
                result: Err(e),
            } = step
            else {
                continue;
            };
            if required_failure.is_some() {
                continue;
            }
            if self.core.state() == TransportState::Connecting {
                tracing::warn!(error = %e, "required transport failed, disconnecting");
                self.core.begin_disconnect();
                for transport in &active {
                    let transport = transport.clone();
                    pending.push(
                        async move {
                            let _ = transport.disconnect().await;
                            Step::Disconnected
                        }
                        .boxed(),
                    );
                }
                required_failure = Some(LinkError::TransportsFailedToConnect);
            } else {
                required_failure = Some(e);
            }
        }
        if let Some(error) = required_failure {
            return Err(error);
        }

        ctx.assert_still_connecting()?;
        self.compute_status();

        if self.core.state() == TransportState::Disconnecting {
            self.do_disconnect().await;
        }
        Ok(())
    }

    /// Disconnect every active transport
    pub async fn disconnect(&self) {
        if self.core.begin_disconnect() {
            self.do_disconnect().await;
        } else {
            self.core.wait_until_settled().await;
        }
    }

    /// Finish tearing down after a failed connect
    async fn shutdown(&self) {
        if self.core.begin_disconnect() || self.core.state() == TransportState::Disconnecting {
            self.do_disconnect().await;
        }
    }

    async fn do_disconnect(&self) {
        let _busy = self.busy_guard();
        let active = self.active_transports();
        join_all(active.iter().map(|t| t.disconnect())).await;
        if self.core.state() == TransportState::Disconnecting {
            self.compute_status();
        }
    }

    /// Load a program, taking down only the transports that depend on it
    ///
    /// Transports that were disconnected for the load are reconnected
    /// afterwards if the manager was connected.
    pub async fn load_program(
        &self,
        loader: &dyn ProgramLoader,
        log: Option<&dyn ConnectionLog>,
        progress: Option<&ProgressCallback>,
    ) -> Result<()> {
        let was_connected = self.core.state().can_disconnect();
        let mut affected = self.active_transports();
        let mut all_required = affected
            .iter()
            .filter(|t| t.is_xds_transport())
            .any(|t| !self.registry.is_optional(t.id()).unwrap_or(false));

        if let Some(device) = device_of(loader) {
            if !all_required {
                let requirement = |t: &Arc<dyn Transport>| {
                    self.registry
                        .is_device_required(t.id(), device, true)
                        .unwrap_or(DeviceRequirement::No)
                };
                all_required = affected
                    .iter()
                    .any(|t| requirement(t) == DeviceRequirement::Yes);
                if !all_required {
                    affected.retain(|t| {
                        t.is_xds_transport() || requirement(t) == DeviceRequirement::Maybe
                    });
                }
            }
        }

        if all_required {
            self.disconnect().await;
        } else {
            join_all(affected.iter().map(|t| t.disconnect())).await;
        }

        let log = log.unwrap_or(self.core.logger());
        loader.load_program(log, progress, true).await?;

        if was_connected {
            if all_required {
                if let Err(e) = self.connect().await {
                    tracing::warn!(error = %e, "reconnect after program load failed");
                }
            } else {
                let no_failed_devices: Vec<String> = Vec::new();
                for result in join_all(affected.iter().map(|t| t.connect(&no_failed_devices))).await {
                    if let Err(e) = result {
                        tracing::debug!(error = %e, "transport reconnect after program load failed");
                    }
                }
            }
        }
        Ok(())
    }

    /// First line of the most relevant progress message
    pub fn progress_message(&self) -> String {
        let active = self.active_transports();
        if self.core.state() == TransportState::Connecting {
            let connecting = active.iter().filter(|t| t.state().can_disconnect()).count();
            let connected = active.iter().filter(|t| t.is_connected()).count();
            if connecting > 0 {
                if let [only] = active.as_slice() {
                    return only.log().progress_message();
                }
                return format!("connecting to {} of {} targets", connected + 1, active.len());
            }
        }
        if let [only] = active.as_slice() {
            if only.log().has_errors() {
                return only.log().progress_message();
            }
        }
        self.core.logger().progress_message()
    }

    pub fn tooltip_message(&self) -> Option<String> {
        let active = self.active_transports();
        if self.core.state() == TransportState::Connecting
            && active.iter().any(|t| t.state().can_disconnect())
        {
            return match active.as_slice() {
                [only] => only.log().tooltip_message(),
                _ => None,
            };
        }
        if let [only] = active.as_slice() {
            if only.log().has_errors() {
                return only.log().tooltip_message();
            }
        }
        self.core.logger().tooltip_message()
    }

    /// Connection descriptions of the active transports
    pub fn connection_description(&self) -> String {
        self.active_transports()
            .iter()
            .filter_map(|t| t.connection_description())
            .filter(|d| !d.is_empty())
            .collect::<Vec<_>>()
            .join(" ,")
    }

    /// Forget every transport, loader and configuration
    pub fn dispose(&self) {
        if let Ok(mut state) = self.lock() {
            for registered in &state.transports {
                registered.transport.events().remove_listener(registered.listener);
            }
            *state = ManagerState::default();
        }
    }
}

impl std::fmt::Display for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", MANAGER_ID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{data_type, Codec, CodecCore, NodeKind};

    struct Plain {
        core: CodecCore,
    }

    impl Codec for Plain {
        fn core(&self) -> &CodecCore {
            &self.core
        }
    }

    fn manager_with_nodes() -> Arc<ConnectionManager> {
        let registry = Arc::new(Registry::default());
        for id in ["usb", "u2a"] {
            registry
                .register(Arc::new(Plain {
                    core: CodecCore::new(id, NodeKind::Codec)
                        .with_encoder(data_type::BUFFER, data_type::BUFFER)
                        .with_decoder(data_type::BUFFER, data_type::BUFFER),
                }))
                .unwrap();
        }
        ConnectionManager::new(registry)
    }

    #[test]
    fn test_configuration_id_detection() {
        let manager = manager_with_nodes();
        assert!(!manager.is_target_configuration_id("usb+u2a"));
        assert!(!manager.is_target_configuration_id("usb"));
        assert!(manager.is_target_configuration_id("bench"));

        manager.register_configuration("usb", "usb+u2a");
        assert!(manager.is_target_configuration_id("usb"));
    }

    #[test]
    fn test_missing_configuration_id() {
        let manager = manager_with_nodes();
        let err = manager.set_active_configuration("bench").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid configuration specified: Missing <gc-target-configuration id=\"bench\">.  This must exist somewhere in your index.gui."
        );
        assert_eq!(manager.active_configuration_id(), "bench");
    }

    #[test]
    fn test_configuration_applied_while_disconnected() {
        let manager = manager_with_nodes();
        let rx = manager.events().subscribe();

        manager.register_configuration("bench", "usb+u2a");
        manager.set_active_configuration("bench").unwrap();
        assert!(manager.registry().is_active("u2a"));
        assert_eq!(manager.active_configuration_id(), "bench");
        assert_eq!(
            rx.try_recv().unwrap(),
            ManagerEvent::ActiveConfigurationChanged {
                configuration_id: "bench".to_string()
            }
        );

        let err = manager.set_active_configuration("usb+nope").unwrap_err();
        assert!(err.to_string().starts_with("Invalid configuration specified: Missing a model"));
        assert_eq!(manager.active_configuration_id(), DEFAULT_CONFIGURATION_ID);
    }

    #[tokio::test]
    async fn test_connect_without_configuration() {
        let manager = manager_with_nodes();
        let rx = manager.events().subscribe();

        let err = manager.connect().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to connect: There is no active configuration to connect with."
        );
        assert_eq!(manager.state(), TransportState::Disconnected);
        assert!(manager.log().has_errors());

        let busy: Vec<_> = rx.try_iter().collect();
        assert_eq!(busy.first(), Some(&ManagerEvent::BusyStateChanged { is_busy: true }));
        assert_eq!(busy.last(), Some(&ManagerEvent::BusyStateChanged { is_busy: false }));
    }

    #[tokio::test]
    async fn test_connect_without_transports() {
        let manager = manager_with_nodes();
        manager.set_active_configuration("usb+u2a").unwrap();
        let err = manager.connect().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to connect: There are no active transports to connect with."
        );
        assert_eq!(manager.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn test_when_configuration_ready() {
        let manager = manager_with_nodes();
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.when_configuration_ready("bench").await })
        };
        tokio::task::yield_now().await;
        manager.register_configuration("bench", "usb+u2a");
        waiter.await.unwrap().unwrap();
    }
}
