//! Connection lifecycle shared by client connections and listeners.
//!
//! ```text
//! Created -> Connecting -> [Handshaking] -> Ready -> Closing -> Closed
//! ```
//!
//! `Handshaking` only happens when a credential is configured. Any live state
//! may move to `Closing` or straight to `Closed`; nothing leaves `Closed`.

use std::fmt;

use tokio::sync::watch;
use tracing::trace;

/// Lifecycle state of a connection or listener.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Created,
    Connecting,
    Handshaking,
    Ready,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Closing, _) => false,
            (_, Closing) => true,
            (Created, Connecting) => true,
            (Connecting, Handshaking) | (Connecting, Ready) => true,
            (Handshaking, Ready) => true,
            _ => false,
        }
    }

    pub fn is_closing_or_closed(self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Observable state holder enforcing the lifecycle transitions.
#[derive(Debug)]
pub(crate) struct StateCell {
    state: watch::Sender<ConnectionState>,
}

impl StateCell {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Created);
        Self { state }
    }

    pub fn get(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Moves to `next` if the lifecycle allows it. Returns whether the state changed.
    pub fn advance(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                trace!("Connection state {} -> {}", current, next);
                *current = next;
                true
            } else {
                false
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}
