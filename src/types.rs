//! Core shared types for target-link
//!
//! # Main Types
//!
//! - [`TransportState`] - Connection state of a transport or of the manager
//! - [`DeviceRequirement`] - Tri-state answer to "does this branch need device X"
//! - [`LogLevel`] - Severity of a connection log message
//! - [`ConnectionLogEvent`] - A message published by a transport's logger
//! - [`TransportEvent`] - Everything a transport publishes to subscribers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connection state of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    /// Not connected
    #[default]
    Disconnected,
    /// Connected and ready
    Connected,
    /// Connect sequence in progress
    Connecting,
    /// Disconnect sequence in progress
    Disconnecting,
}

impl TransportState {
    pub fn is_connected(self) -> bool {
        self == TransportState::Connected
    }

    pub fn is_disconnected(self) -> bool {
        self == TransportState::Disconnected
    }

    /// A connect may be started from this state
    pub fn can_connect(self) -> bool {
        self == TransportState::Disconnected
    }

    /// A disconnect has something to tear down in this state
    pub fn can_disconnect(self) -> bool {
        matches!(self, TransportState::Connected | TransportState::Connecting)
    }

    /// Neither connecting nor disconnecting
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            TransportState::Connected | TransportState::Disconnected
        )
    }
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportState::Disconnected => write!(f, "disconnected"),
            TransportState::Connected => write!(f, "connected"),
            TransportState::Connecting => write!(f, "connecting"),
            TransportState::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

/// Whether a device is needed by a branch of the configuration
///
/// Ordered so that `Yes > Maybe > No`; [`DeviceRequirement::or`] keeps the
/// strongest answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRequirement {
    No,
    Maybe,
    Yes,
}

impl DeviceRequirement {
    pub fn or(self, other: DeviceRequirement) -> DeviceRequirement {
        self.max(other)
    }
}

impl std::fmt::Display for DeviceRequirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceRequirement::No => write!(f, "no"),
            DeviceRequirement::Maybe => write!(f, "maybe"),
            DeviceRequirement::Yes => write!(f, "yes"),
        }
    }
}

/// Severity of a connection log message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Debug,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warning => write!(f, "warning"),
            LogLevel::Error => write!(f, "error"),
            LogLevel::Debug => write!(f, "debug"),
        }
    }
}

/// A message published by a transport's connection logger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionLogEvent {
    pub level: LogLevel,
    /// Message with its first letter capitalised
    pub message: String,
    pub transport_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Event published by a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The transport moved to a new state
    StateChanged {
        transport_id: String,
        state: TransportState,
    },
    /// The transport logged a message
    Log(ConnectionLogEvent),
}
