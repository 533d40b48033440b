//! Codec registry
//!
//! The registry knows every node by id, applies configuration strings to wire
//! nodes into a forest, and walks that forest to connect, disconnect and ping
//! it.
//!
//! # Main Types
//!
//! - [`Registry`] - node table, active configuration and waiters
//! - [`RegistryOptions`] / [`IdMatching`] - how ids are looked up
//! - [`NodeSnapshot`] - read-only view of one active node
//!
//! # Configuring
//!
//! [`Registry::configure`] parses and resolves the whole string into a staged
//! tree before touching anything. Only when staging succeeds is the previous
//! tree detached and the new one attached, so a bad string leaves the active
//! configuration as it was.

pub mod grammar;

use crate::codec::{same_node, Codec};
use crate::error::{capitalize, LinkError, Result};
use crate::transport::{ConnectContext, ConnectionLog};
use crate::types::DeviceRequirement;
use futures::future::{BoxFuture, FutureExt};
use grammar::Term;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;

/// How node ids are compared
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdMatching {
    /// `USB` and `usb` name the same node
    #[default]
    IgnoreCase,
    Exact,
}

#[derive(Debug, Clone, Default)]
pub struct RegistryOptions {
    pub id_matching: IdMatching,
}

struct NodeInfo {
    node: Arc<dyn Codec>,
    in_use: bool,
    connected: bool,
    children: Vec<String>,
    order: i32,
}

impl NodeInfo {
    fn new(node: Arc<dyn Codec>) -> Self {
        Self {
            node,
            in_use: false,
            connected: false,
            children: Vec::new(),
            order: -1,
        }
    }

    fn detach(&mut self) {
        self.in_use = false;
        self.connected = false;
        self.children.clear();
        self.order = -1;
    }
}

#[derive(Default)]
struct RegistryState {
    nodes: HashMap<String, NodeInfo>,
    waiters: HashMap<String, Vec<oneshot::Sender<()>>>,
}

/// One node of the active configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub id: String,
    pub description: String,
    pub order: i32,
    pub optional: bool,
    pub connected: bool,
    pub children: Vec<String>,
}

struct StagedNode {
    key: String,
    node: Arc<dyn Codec>,
    children: Vec<String>,
    order: i32,
}

pub struct Registry {
    options: RegistryOptions,
    state: Mutex<RegistryState>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(RegistryOptions::default())
    }
}

impl Registry {
    pub fn new(options: RegistryOptions) -> Self {
        Self {
            options,
            state: Mutex::new(RegistryState::default()),
        }
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    fn lock(&self) -> Result<MutexGuard<'_, RegistryState>> {
        self.state
            .lock()
            .map_err(|_| LinkError::Failure("codec registry state poisoned".to_string()))
    }

    fn key_of(&self, id: &str) -> String {
        match self.options.id_matching {
            IdMatching::IgnoreCase => id.to_lowercase(),
            IdMatching::Exact => id.to_string(),
        }
    }

    /// Validated lookup key for `id`
    fn resolve_key(&self, id: &str) -> Result<String> {
        grammar::validate_identifier(id)?;
        Ok(self.key_of(id))
    }

    fn read<R>(&self, id: &str, f: impl FnOnce(&RegistryState, &str) -> R) -> Result<R> {
        let key = self.resolve_key(id)?;
        let state = self.lock()?;
        if !state.nodes.contains_key(&key) {
            return Err(LinkError::MissingNode(id.to_string()));
        }
        Ok(f(&state, &key))
    }

    fn update<R>(&self, key: &str, f: impl FnOnce(&mut NodeInfo) -> R) -> Result<R> {
        let mut state = self.lock()?;
        state
            .nodes
            .get_mut(key)
            .map(f)
            .ok_or_else(|| LinkError::MissingNode(key.to_string()))
    }

    /// Make a node available to configurations
    ///
    /// A node with an empty id is ignored. Registering an id twice replaces
    /// the earlier node.
    pub fn register(&self, node: Arc<dyn Codec>) -> Result<()> {
        let id = node.core().id().to_string();
        if id.is_empty() {
            return Ok(());
        }
        let key = self.resolve_key(&id)?;
        let waiters = {
            let mut state = self.lock()?;
            state.nodes.insert(key, NodeInfo::new(node));
            state.waiters.remove(&id.to_lowercase()).unwrap_or_default()
        };
        tracing::debug!(node = %id, "registered");
        for waiter in waiters {
            let _ = waiter.send(());
        }
        Ok(())
    }

    /// Remove `node`, but only if it is the instance registered under its id
    pub fn unregister(&self, node: &Arc<dyn Codec>) {
        let id = node.core().id();
        let key = self.key_of(id);
        let Ok(mut state) = self.lock() else {
            return;
        };
        let registered = state
            .nodes
            .get(&key)
            .is_some_and(|info| same_node(&info.node, node));
        if registered {
            state.nodes.remove(&key);
            state.waiters.remove(&id.to_lowercase());
            tracing::debug!(node = %id, "unregistered");
        }
    }

    pub fn get_instance(&self, id: &str) -> Result<Arc<dyn Codec>> {
        self.read(id, |state, key| state.nodes[key].node.clone())
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.read(id, |_, _| ()).is_ok()
    }

    /// Whether the node is part of the active configuration
    pub fn is_active(&self, id: &str) -> bool {
        self.read(id, |state, key| state.nodes[key].in_use)
            .unwrap_or(false)
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.read(id, |state, key| state.nodes[key].connected)
            .unwrap_or(false)
    }

    /// Connected, but some node below it is not (fully) connected
    pub fn is_partially_connected(&self, id: &str) -> bool {
        self.read(id, partially_connected).unwrap_or(false)
    }

    pub fn is_optional(&self, id: &str) -> Result<bool> {
        self.read(id, optional)
    }

    pub fn is_device_required(
        &self,
        id: &str,
        device_id: &str,
        recursive: bool,
    ) -> Result<DeviceRequirement> {
        self.read(id, |state, key| {
            device_required(state, key, device_id, recursive)
        })
    }

    /// Strongest requirement any of `ids` places on `device_id`
    pub fn is_device_required_any<S: AsRef<str>>(
        &self,
        ids: &[S],
        device_id: &str,
        recursive: bool,
    ) -> Result<DeviceRequirement> {
        let mut result = DeviceRequirement::No;
        for id in ids {
            result = result.or(self.is_device_required(id.as_ref(), device_id, recursive)?);
        }
        Ok(result)
    }

    fn order_of(&self, id: &str) -> Result<i32> {
        self.read(id, |state, key| state.nodes[key].order)
    }

    /// Order(a) minus order(b)
    pub fn compare_order(&self, a: &str, b: &str) -> Result<i32> {
        Ok(self.order_of(a)? - self.order_of(b)?)
    }

    /// [`Registry::compare_order`] as an [`Ordering`], for sorting ids
    pub fn cmp_order(&self, a: &str, b: &str) -> Ordering {
        self.compare_order(a, b).unwrap_or(0).cmp(&0)
    }

    /// Connect the subtree rooted at `id`, top-down
    pub async fn connect(
        &self,
        id: &str,
        ctx: &ConnectContext<'_>,
        failed_devices: &[String],
    ) -> Result<()> {
        let key = self.read(id, |_, key| key.to_string())?;
        self.connect_node(key, ctx, failed_devices).await
    }

    fn connect_node<'a>(
        &'a self,
        key: String,
        ctx: &'a ConnectContext<'_>,
        failed_devices: &'a [String],
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let (node, children) = self.update(&key, |info| {
                info.connected = false;
                (info.node.clone(), info.children.clone())
            })?;

            for device in failed_devices {
                let (recursive, direct) = {
                    let state = self.lock()?;
                    (
                        device_required(&state, &key, device, true),
                        device_required(&state, &key, device, false),
                    )
                };
                if recursive == DeviceRequirement::Yes || direct != DeviceRequirement::No {
                    return Err(LinkError::ProgramNotLoaded(device.clone()));
                }
            }

            ctx.assert_still_connecting()?;
            let description = node.core().describe();
            ctx.log().add_debug_message(&format!("Connecting {}", description));
            if let Err(e) = node.on_connect(ctx.log()).await {
                ctx.log()
                    .add_debug_message(&format!("{} failed to connect: {}", description, e));
                return Err(e);
            }
            self.update(&key, |info| info.connected = true)?;

            let mut connected = 0usize;
            for child in &children {
                ctx.assert_still_connecting()?;
                match self.connect_node(child.clone(), ctx, failed_devices).await {
                    Ok(()) => connected += 1,
                    Err(e) => {
                        ctx.assert_still_connecting()?;
                        let tolerated = {
                            let state = self.lock()?;
                            optional(&state, child)
                        };
                        if !tolerated {
                            return Err(e);
                        }
                        tracing::debug!(node = %child, error = %e, "optional node failed to connect");
                    }
                }
            }

            if connected == 0 && children.len() > 1 {
                return Err(LinkError::CodecsFailedToConnect);
            }
            Ok(())
        }
        .boxed()
    }

    /// Disconnect the subtree rooted at `id`, bottom-up
    ///
    /// Failures are reported as warnings; disconnect always completes.
    pub async fn disconnect(&self, id: &str, log: &dyn ConnectionLog) {
        if let Ok(key) = self.read(id, |_, key| key.to_string()) {
            self.disconnect_node(key, log).await;
        }
    }

    fn disconnect_node<'a>(&'a self, key: String, log: &'a dyn ConnectionLog) -> BoxFuture<'a, ()> {
        async move {
            let Ok((node, children)) =
                self.update(&key, |info| (info.node.clone(), info.children.clone()))
            else {
                return;
            };
            for child in children {
                self.disconnect_node(child, log).await;
            }

            let connected = self.update(&key, |info| info.connected).unwrap_or(false);
            if connected {
                let description = node.core().describe();
                log.add_debug_message(&format!("Disconnecting {}", description));
                if let Err(e) = node.on_disconnect(log).await {
                    log.add_warning_message(
                        &format!("{} failed to disconnect: {}", description, e),
                        None,
                    );
                }
            }
            let _ = self.update(&key, |info| info.connected = false);
        }
        .boxed()
    }

    /// Ping every connected node of the subtree rooted at `id`
    pub async fn ping(&self, id: &str) -> Result<()> {
        let key = self.read(id, |_, key| key.to_string())?;
        self.ping_node(key).await
    }

    fn ping_node(&self, key: String) -> BoxFuture<'_, Result<()>> {
        async move {
            let (node, children, connected) = self.update(&key, |info| {
                (info.node.clone(), info.children.clone(), info.connected)
            })?;
            if connected {
                node.ping().await?;
                for child in children {
                    self.ping_node(child).await?;
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// Replace the active configuration
    pub fn configure(&self, config: &str) -> Result<()> {
        let config = config.trim();
        if config.is_empty() {
            return Err(LinkError::EmptyConfiguration);
        }
        let wrap = |e: LinkError| {
            LinkError::Configuration(format!(
                "Invalid configuration specified: {} in \"{}\".",
                capitalize(&e.to_string()),
                config
            ))
        };

        let terms = grammar::parse_configuration(config).map_err(wrap)?;
        let (detached, staged) = {
            let mut state = self.lock()?;
            let staged = {
                let mut staging = Staging::new(self, &state);
                staging.stage_list(&terms).map_err(wrap)?;
                staging.staged
            };
            let detached = detach_all(&mut state);
            for entry in &staged {
                if let Some(info) = state.nodes.get_mut(&entry.key) {
                    info.in_use = true;
                    info.children = entry.children.clone();
                    info.order = entry.order;
                }
            }
            (detached, staged)
        };

        for node in &detached {
            node.deconfigure();
            node.core().clear_links();
        }
        let nodes: HashMap<&str, &Arc<dyn Codec>> = staged
            .iter()
            .map(|entry| (entry.key.as_str(), &entry.node))
            .collect();
        for entry in &staged {
            for child_key in &entry.children {
                if let Some(child) = nodes.get(child_key.as_str()) {
                    entry.node.core().add_child_decoder(Arc::clone(child));
                    child.core().set_parent_encoder(&entry.node);
                }
            }
        }
        for entry in &staged {
            entry.node.configure();
        }
        tracing::info!(config = %config, nodes = staged.len(), "configuration applied");
        Ok(())
    }

    /// Detach every node of the active configuration
    pub fn deconfigure(&self) {
        let detached = match self.lock() {
            Ok(mut state) => detach_all(&mut state),
            Err(_) => return,
        };
        for node in detached {
            node.deconfigure();
            node.core().clear_links();
        }
    }

    /// Wait until every id named in `config` has been registered
    pub async fn when_configuration_ready(&self, config: &str) -> Result<()> {
        for id in grammar::identifiers(config) {
            let receiver = {
                let mut state = self.lock()?;
                let registered = state.nodes.keys().any(|key| key.to_lowercase() == id);
                if registered {
                    None
                } else {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.entry(id.clone()).or_default().push(tx);
                    Some(rx)
                }
            };
            if let Some(rx) = receiver {
                tracing::debug!(node = %id, "waiting for registration");
                rx.await
                    .map_err(|_| LinkError::Disposed("Codec registry".to_string()))?;
            }
        }
        Ok(())
    }

    /// Drop every node and release all waiters
    pub fn dispose(&self) {
        self.deconfigure();
        if let Ok(mut state) = self.lock() {
            state.nodes.clear();
            state.waiters.clear();
        }
    }

    /// Registered ids in no particular order
    pub fn ids(&self) -> Vec<String> {
        self.lock()
            .map(|state| {
                state
                    .nodes
                    .values()
                    .map(|info| info.node.core().id().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Active nodes sorted by attach order
    pub fn snapshot(&self) -> Vec<NodeSnapshot> {
        let Ok(state) = self.lock() else {
            return Vec::new();
        };
        let mut nodes: Vec<NodeSnapshot> = state
            .nodes
            .iter()
            .filter(|(_, info)| info.in_use)
            .map(|(key, info)| NodeSnapshot {
                id: info.node.core().id().to_string(),
                description: info.node.core().describe(),
                order: info.order,
                optional: optional(&state, key),
                connected: info.connected,
                children: info
                    .children
                    .iter()
                    .filter_map(|child| state.nodes.get(child))
                    .map(|child| child.node.core().id().to_string())
                    .collect(),
            })
            .collect();
        nodes.sort_by_key(|node| node.order);
        nodes
    }
}

fn detach_all(state: &mut RegistryState) -> Vec<Arc<dyn Codec>> {
    let mut detached = Vec::new();
    for info in state.nodes.values_mut() {
        if info.in_use {
            detached.push(info.node.clone());
        }
        info.detach();
    }
    detached
}

fn optional(state: &RegistryState, key: &str) -> bool {
    let Some(info) = state.nodes.get(key) else {
        return false;
    };
    if info.node.core().is_optional() {
        return true;
    }
    if info.children.is_empty() {
        return false;
    }
    info.children.iter().all(|child| optional(state, child))
}

fn partially_connected(state: &RegistryState, key: &str) -> bool {
    let Some(info) = state.nodes.get(key) else {
        return false;
    };
    info.connected
        && info.children.iter().any(|child| {
            let connected = state.nodes.get(child).is_some_and(|c| c.connected);
            !connected || partially_connected(state, child)
        })
}

fn device_required(
    state: &RegistryState,
    key: &str,
    device_id: &str,
    recursive: bool,
) -> DeviceRequirement {
    let Some(info) = state.nodes.get(key) else {
        return DeviceRequirement::No;
    };
    let mut result = if info.node.core().device_id() == Some(device_id) {
        DeviceRequirement::Yes
    } else if recursive {
        info.children
            .iter()
            .map(|child| device_required(state, child, device_id, true))
            .fold(DeviceRequirement::No, DeviceRequirement::or)
    } else {
        DeviceRequirement::No
    };
    if info.node.core().is_optional() && result == DeviceRequirement::Yes {
        result = DeviceRequirement::Maybe;
    }
    result
}

/// Resolves parsed terms against the node table without mutating it
struct Staging<'r> {
    registry: &'r Registry,
    state: &'r RegistryState,
    used: HashSet<String>,
    staged: Vec<StagedNode>,
    next_order: i32,
}

impl<'r> Staging<'r> {
    fn new(registry: &'r Registry, state: &'r RegistryState) -> Self {
        Self {
            registry,
            state,
            used: HashSet::new(),
            staged: Vec::new(),
            next_order: 1,
        }
    }

    fn stage_list(&mut self, terms: &[Term]) -> Result<Vec<String>> {
        terms.iter().map(|term| self.stage_term(term)).collect()
    }

    /// Stage one term and return the key of its root
    fn stage_term(&mut self, term: &Term) -> Result<String> {
        let mut children = self.stage_list(&term.children)?;
        for name in term.chain.iter().rev() {
            let key = self.registry.key_of(name);
            let info = self
                .state
                .nodes
                .get(&key)
                .ok_or_else(|| LinkError::MissingNode(name.clone()))?;
            if self.used.contains(&key) {
                return Err(LinkError::DuplicateUse(info.node.core().describe()));
            }
            if !children.is_empty() {
                self.check_attach(&info.node, &children)?;
            }

            self.used.insert(key.clone());
            self.staged.push(StagedNode {
                key: key.clone(),
                node: info.node.clone(),
                children,
                order: self.next_order,
            });
            self.next_order += 1;
            children = vec![key];
        }
        children
            .pop()
            .ok_or_else(|| LinkError::Syntax("empty chain".to_string()))
    }

    fn check_attach(&self, parent: &Arc<dyn Codec>, children: &[String]) -> Result<()> {
        let parent_core = parent.core();
        let encoder = parent_core
            .encoder_types()
            .ok_or_else(|| LinkError::NotAnEncoder(parent_core.id().to_string()))?;
        for child_key in children {
            let Some(child) = self.state.nodes.get(child_key) else {
                continue;
            };
            let child_core = child.node.core();
            let decoder = child_core
                .decoder_types()
                .ok_or_else(|| LinkError::NotADecoder(child_core.id().to_string()))?;
            if !decoder.input.is_compatible(&encoder.output) {
                return Err(LinkError::OutputTypeMismatch {
                    parent: parent_core.id().to_string(),
                    parent_type: encoder.output.name(),
                    child: child_core.id().to_string(),
                    child_type: decoder.input.name(),
                });
            }
            if !encoder.input.is_compatible(&decoder.output) {
                return Err(LinkError::InputTypeMismatch {
                    parent: parent_core.id().to_string(),
                    parent_type: encoder.input.name(),
                    child: child_core.id().to_string(),
                    child_type: decoder.output.name(),
                });
            }
        }
        Ok(())
    }
}
