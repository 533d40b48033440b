//! Aggregate connection state
//!
//! Folds the state of every active transport into one manager state. Required
//! and optional transports are folded separately and then combined:
//!
//! ```text
//!  optional fold  | CONNECTED   CONNECTING   DISCONNECTED   DISCONNECTING
//!  ---------------+----------------------------------------------------------
//!  DISCONNECTED   | CONNECTED   CONNECTING   DISCONNECTED   DISCONNECTING
//!  DISCONNECTING  | CONNECTED   CONNECTING   DISCONNECTING  DISCONNECTING
//!  CONNECTING     | CONNECTED   CONNECTING   CONNECTING     CONNECTING
//!  CONNECTED      | CONNECTED   CONNECTING   CONNECTED      CONNECTED
//!
//!  required fold  | CONNECTED   CONNECTING   DISCONNECTED   DISCONNECTING
//!  ---------------+----------------------------------------------------------
//!  CONNECTED      | CONNECTED   CONNECTING   DISCONNECTED   DISCONNECTING
//!  CONNECTING     | CONNECTING  CONNECTING   DISCONNECTED   DISCONNECTING
//!  DISCONNECTED   | DISCONNECTED DISCONNECTED DISCONNECTED  DISCONNECTING
//!  DISCONNECTING  | DISCONNECTING (always)
//! ```
//!
//! The optional fold starts DISCONNECTED, the required fold CONNECTED.

use crate::types::TransportState;

/// What the fold needs to know about one active transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportStatus {
    pub state: TransportState,
    pub optional: bool,
    pub partially_connected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: TransportState,
    pub partially_connected: bool,
    pub connected_count: usize,
}

fn fold_optional(aggregate: TransportState, transport: TransportState) -> TransportState {
    use TransportState::*;
    if transport == Connected {
        Connected
    } else if transport == Connecting || aggregate == Connecting {
        Connecting
    } else if transport == Disconnecting || aggregate == Disconnecting {
        Disconnecting
    } else {
        aggregate
    }
}

fn fold_required(aggregate: TransportState, transport: TransportState) -> TransportState {
    use TransportState::*;
    if transport == Connected
        || aggregate == Disconnecting
        || (aggregate == Disconnected && transport == Connecting)
    {
        aggregate
    } else {
        transport
    }
}

pub fn compute_status(transports: &[TransportStatus]) -> ConnectionStatus {
    let mut required = TransportState::Connected;
    let mut optional = TransportState::Disconnected;
    let mut connected_count = 0;

    for transport in transports {
        if transport.state == TransportState::Connected {
            connected_count += 1;
        }
        if transport.optional {
            optional = fold_optional(optional, transport.state);
        } else {
            required = fold_required(required, transport.state);
        }
    }

    let mut state = required;
    if state == TransportState::Connected && optional != TransportState::Connected {
        if connected_count == 0 {
            state = optional;
        }
    } else if state == TransportState::Disconnected && optional == TransportState::Disconnecting {
        state = TransportState::Disconnecting;
    }
    if state == TransportState::Connected && connected_count == 0 {
        state = TransportState::Disconnected;
    }

    let partially_connected = if state == TransportState::Connected && connected_count < transports.len() {
        true
    } else {
        transports.iter().any(|t| t.partially_connected)
    };

    ConnectionStatus {
        state,
        partially_connected,
        connected_count,
    }
}
