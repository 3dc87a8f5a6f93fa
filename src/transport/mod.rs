//! Persistent streaming connections
//!
//! A `Connection` is opened, written to and closed by its owner; everything
//! it receives (open, frames, close) is reported through `ConnectionEvents`,
//! tagged with the slot it serves and the generation of the handle that
//! created it so stale events from replaced connections can be ignored.

mod handle;
mod websocket;

pub use handle::ConnectionHandle;
pub use websocket::{WebSocketConnection, WebSocketFactory};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::Result;

/// Identity of a connection slot, allocated in creation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(pub u64);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// Connection state as seen by the owner of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Open and usable.
    Connected,
    /// Dropped unexpectedly, waiting for a retry.
    Reconnecting,
    /// Closed on purpose.
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Reconnecting => write!(f, "Reconnecting"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Something that happened on a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opened,
    Message(String),
    Closed { reason: Option<String> },
}

/// Event tagged with the slot and handle generation it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotEvent {
    pub slot: SlotId,
    pub generation: u64,
    pub event: ConnectionEvent,
}

/// Reporting side handed to a connection when it is created
#[derive(Debug, Clone)]
pub struct ConnectionEvents {
    slot: SlotId,
    generation: u64,
    tx: mpsc::UnboundedSender<SlotEvent>,
}

impl ConnectionEvents {
    pub fn new(slot: SlotId, generation: u64, tx: mpsc::UnboundedSender<SlotEvent>) -> Self {
        Self {
            slot,
            generation,
            tx,
        }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn opened(&self) {
        self.emit(ConnectionEvent::Opened);
    }

    pub fn message(&self, text: String) {
        self.emit(ConnectionEvent::Message(text));
    }

    pub fn closed(&self, reason: Option<String>) {
        self.emit(ConnectionEvent::Closed { reason });
    }

    fn emit(&self, event: ConnectionEvent) {
        // Receiver is gone only after the owning manager was disposed
        let _ = self.tx.send(SlotEvent {
            slot: self.slot,
            generation: self.generation,
            event,
        });
    }
}

/// One persistent bidirectional streaming connection
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open the connection; resolves once the handshake completed
    async fn open(&self, endpoint: &str) -> Result<()>;

    /// Send one text frame
    async fn send(&self, frame: String) -> Result<()>;

    /// Close the connection without reporting a drop
    async fn close(&self);

    fn is_open(&self) -> bool;
}

/// Creates connections bound to an event sink
pub trait ConnectionFactory: Send + Sync {
    fn create(&self, events: ConnectionEvents) -> Arc<dyn Connection>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_checks() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Reconnecting.is_connected());
        assert!(ConnectionState::Connecting.is_transitioning());
        assert!(ConnectionState::Reconnecting.is_transitioning());
        assert!(!ConnectionState::Closed.is_transitioning());
        assert_eq!(ConnectionState::Reconnecting.to_string(), "Reconnecting");
    }

    #[tokio::test]
    async fn test_events_are_tagged() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = ConnectionEvents::new(SlotId(3), 7, tx);

        events.opened();
        events.message("{}".to_string());
        events.closed(Some("reset".to_string()));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.slot, SlotId(3));
        assert_eq!(first.generation, 7);
        assert_eq!(first.event, ConnectionEvent::Opened);
        assert_eq!(
            rx.recv().await.unwrap().event,
            ConnectionEvent::Message("{}".to_string())
        );
        assert_eq!(
            rx.recv().await.unwrap().event,
            ConnectionEvent::Closed {
                reason: Some("reset".to_string())
            }
        );
    }
}
