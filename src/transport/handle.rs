//! Connection handle owned by a subscription slot

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::{
    Connection, ConnectionEvents, ConnectionFactory, ConnectionState, SlotEvent, SlotId,
};
use crate::error::{MarketDataError, Result};

/// Lifecycle wrapper around one `Connection` generation
///
/// Reconnects and rotations never reuse a handle: they build the next
/// generation, so events still in flight from the previous connection are
/// recognizable and dropped.
pub struct ConnectionHandle {
    slot: SlotId,
    generation: u64,
    connection: Arc<dyn Connection>,
    state: ConnectionState,
    opened_at: Option<Instant>,
}

impl ConnectionHandle {
    pub fn new(
        slot: SlotId,
        generation: u64,
        factory: &dyn ConnectionFactory,
        tx: mpsc::UnboundedSender<SlotEvent>,
    ) -> Self {
        let connection = factory.create(ConnectionEvents::new(slot, generation, tx));
        Self {
            slot,
            generation,
            connection,
            state: ConnectionState::Disconnected,
            opened_at: None,
        }
    }

    /// Build the replacement for this handle
    pub fn next_generation(
        &self,
        factory: &dyn ConnectionFactory,
        tx: mpsc::UnboundedSender<SlotEvent>,
    ) -> Self {
        Self::new(self.slot, self.generation + 1, factory, tx)
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected() && self.connection.is_open()
    }

    /// Time since the handshake completed
    pub fn age(&self) -> Option<Duration> {
        self.opened_at.map(|at| at.elapsed())
    }

    /// Open the connection, bounded by `connect_timeout`
    pub async fn open(&mut self, endpoint: &str, connect_timeout: Duration) -> Result<()> {
        self.state = ConnectionState::Connecting;
        debug!(slot = %self.slot, generation = self.generation, "Opening connection");

        match timeout(connect_timeout, self.connection.open(endpoint)).await {
            Ok(Ok(())) => {
                self.state = ConnectionState::Connected;
                self.opened_at = Some(Instant::now());
                info!(slot = %self.slot, generation = self.generation, "Connection open");
                Ok(())
            }
            Ok(Err(e)) => {
                self.state = ConnectionState::Disconnected;
                warn!(slot = %self.slot, error = %e, "Connection failed to open");
                Err(e)
            }
            Err(_) => {
                self.state = ConnectionState::Disconnected;
                self.connection.close().await;
                warn!(slot = %self.slot, "Connection handshake timed out");
                Err(MarketDataError::ConnectionTimeout)
            }
        }
    }

    /// Send a frame; fails without touching the wire when not connected
    pub async fn send(&self, frame: String) -> Result<()> {
        if !self.is_connected() {
            return Err(MarketDataError::TransientConnectionFailure(format!(
                "{} is {}",
                self.slot, self.state
            )));
        }
        self.connection.send(frame).await
    }

    /// Record an unexpected drop
    pub fn mark_dropped(&mut self) {
        self.state = ConnectionState::Reconnecting;
        self.opened_at = None;
    }

    pub async fn close(&mut self) {
        self.state = ConnectionState::Closed;
        self.opened_at = None;
        self.connection.close().await;
        debug!(slot = %self.slot, generation = self.generation, "Connection closed");
    }
}
