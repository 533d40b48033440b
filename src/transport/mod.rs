//! Transport contracts
//!
//! A transport is the root of a codec tree and the unit the connection
//! manager connects and disconnects.
//!
//! # Main Types
//!
//! - [`Transport`] - the trait the manager drives
//! - [`TransportCore`] - state machine, cancellation and logger shared by all
//!   transports
//! - [`ConnectContext`] - what a connect attempt hands down the codec tree
//! - [`CancellationToken`] - flips when a disconnect supersedes a connect
//!
//! # State machine
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected
//!                     |                           ^
//!                     +---- failure / abort ------+
//! ```

pub mod logger;

pub use logger::{ConnectionLog, ConnectionLogger};

use crate::error::{LinkError, Result};
use crate::events::EventHub;
use crate::registry::Registry;
use crate::types::{TransportEvent, TransportState};
use async_trait::async_trait;
use crossbeam_channel::Receiver;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Shared flag set when a connect attempt is superseded
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a codec tree needs while it is being connected
pub struct ConnectContext<'a> {
    transport_id: &'a str,
    log: &'a dyn ConnectionLog,
    token: CancellationToken,
}

impl<'a> ConnectContext<'a> {
    pub fn new(transport_id: &'a str, log: &'a dyn ConnectionLog, token: CancellationToken) -> Self {
        Self {
            transport_id,
            log,
            token,
        }
    }

    pub fn transport_id(&self) -> &str {
        self.transport_id
    }

    pub fn log(&self) -> &'a dyn ConnectionLog {
        self.log
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Fails once a disconnect has been requested
    pub fn assert_still_connecting(&self) -> Result<()> {
        if self.token.is_cancelled() {
            Err(LinkError::Aborted(self.transport_id.to_string()))
        } else {
            Ok(())
        }
    }
}

/// State, cancellation and logging shared by every transport
pub struct TransportCore {
    id: String,
    state: watch::Sender<TransportState>,
    token: Mutex<CancellationToken>,
    description: Mutex<Option<String>>,
    events: EventHub<TransportEvent>,
    logger: ConnectionLogger,
}

impl TransportCore {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let events = EventHub::new();
        let (state, _) = watch::channel(TransportState::Disconnected);
        Self {
            logger: ConnectionLogger::new(id.clone(), events.clone()),
            id,
            state,
            token: Mutex::new(CancellationToken::new()),
            description: Mutex::new(None),
            events,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    pub fn events(&self) -> &EventHub<TransportEvent> {
        &self.events
    }

    pub fn logger(&self) -> &ConnectionLogger {
        &self.logger
    }

    pub fn connection_description(&self) -> Option<String> {
        self.description.lock().ok().and_then(|d| d.clone())
    }

    pub fn set_connection_description(&self, description: Option<String>) {
        if let Ok(mut current) = self.description.lock() {
            *current = description;
        }
    }

    /// Move to `state`, publishing the change
    pub fn set_state(&self, state: TransportState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(transport = %self.id, from = %previous, to = %state, "state changed");
            self.events.emit(TransportEvent::StateChanged {
                transport_id: self.id.clone(),
                state,
            });
        }
    }

    /// Start a connect attempt if the transport is disconnected
    ///
    /// Returns the token of the new attempt.
    pub fn begin_connect(&self) -> Option<CancellationToken> {
        if !self.state().can_connect() {
            return None;
        }
        self.logger.clear();
        let token = CancellationToken::new();
        if let Ok(mut current) = self.token.lock() {
            *current = token.clone();
        }
        self.set_state(TransportState::Connecting);
        Some(token)
    }

    /// Start a disconnect, cancelling any connect in flight
    pub fn begin_disconnect(&self) -> bool {
        if !self.state().can_disconnect() {
            return false;
        }
        if let Ok(token) = self.token.lock() {
            token.cancel();
        }
        self.set_state(TransportState::Disconnecting);
        true
    }

    /// Fails once the current connect attempt has been superseded
    pub fn assert_still_connecting(&self) -> Result<()> {
        let cancelled = self.token.lock().map(|t| t.is_cancelled()).unwrap_or(true);
        if cancelled {
            Err(LinkError::Aborted(self.id.clone()))
        } else {
            Ok(())
        }
    }

    /// Wait until the transport is neither connecting nor disconnecting
    pub async fn wait_until_settled(&self) -> TransportState {
        let mut rx = self.state.subscribe();
        let settled = match rx.wait_for(|state| state.is_settled()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        settled
    }

    /// Connect the codec tree rooted at this transport
    ///
    /// On failure the tree is disconnected again and the error is reported
    /// through the logger before it is returned.
    pub async fn connect_chain(&self, registry: &Registry, failed_devices: &[String]) -> Result<()> {
        let token = loop {
            if let Some(token) = self.begin_connect() {
                break token;
            }
            match self.wait_until_settled().await {
                TransportState::Connected => return Ok(()),
                TransportState::Disconnected => continue,
                _ => {}
            }
        };

        let ctx = ConnectContext::new(&self.id, &self.logger, token.clone());
        let result = match registry.connect(&self.id, &ctx, failed_devices).await {
            Ok(()) => ctx.assert_still_connecting(),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.set_state(TransportState::Connected);
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                if e.is_abort() {
                    self.logger.add_progress_message(&message, None);
                } else {
                    self.logger.add_error_message(&message, None);
                }
                registry.disconnect(&self.id, &self.logger).await;
                if self.state() == TransportState::Connecting {
                    self.set_state(TransportState::Disconnected);
                } else {
                    self.wait_until_settled().await;
                }
                Err(e)
            }
        }
    }

    /// Disconnect the codec tree rooted at this transport
    pub async fn disconnect_chain(&self, registry: &Registry) -> Result<()> {
        if !self.begin_disconnect() {
            self.wait_until_settled().await;
            return Ok(());
        }
        registry.disconnect(&self.id, &self.logger).await;
        self.set_connection_description(None);
        self.set_state(TransportState::Disconnected);
        Ok(())
    }
}

/// A connectable root of a codec tree
#[async_trait]
pub trait Transport: Send + Sync {
    fn core(&self) -> &TransportCore;

    async fn connect(&self, failed_devices: &[String]) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    fn id(&self) -> &str {
        self.core().id()
    }

    fn state(&self) -> TransportState {
        self.core().state()
    }

    fn log(&self) -> &ConnectionLogger {
        self.core().logger()
    }

    fn events(&self) -> &EventHub<TransportEvent> {
        self.core().events()
    }

    fn subscribe(&self) -> Receiver<TransportEvent> {
        self.core().events().subscribe()
    }

    /// Debug probe transports are treated specially by program loading
    fn is_xds_transport(&self) -> bool {
        false
    }

    fn connection_description(&self) -> Option<String> {
        self.core().connection_description()
    }

    fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    fn is_disconnected(&self) -> bool {
        self.state().is_disconnected()
    }

    async fn wait_until_settled(&self) -> TransportState {
        self.core().wait_until_settled().await
    }
}
