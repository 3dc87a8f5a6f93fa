//! Fan-out of one underlying data stream

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::warn;

use super::SubscriptionConfig;
use crate::events::MarketEvent;

/// Producer side of a data stream; cloning shares the same stream
#[derive(Debug, Clone)]
pub struct DataFeed {
    tx: broadcast::Sender<MarketEvent>,
}

impl DataFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Deliver an event to every consumer; returns how many received it
    pub fn publish(&self, event: MarketEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Independent consumer seeing every event published from now on
    pub fn consumer(&self, config: SubscriptionConfig) -> ConsumerHandle {
        ConsumerHandle {
            config,
            receiver: self.tx.subscribe(),
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Caller's end of a subscription
#[derive(Debug)]
pub struct ConsumerHandle {
    config: SubscriptionConfig,
    receiver: broadcast::Receiver<MarketEvent>,
}

impl ConsumerHandle {
    pub fn config(&self) -> &SubscriptionConfig {
        &self.config
    }

    /// Next event, `None` once the feed is gone
    ///
    /// A consumer that falls behind skips the overwritten events.
    pub async fn recv(&mut self) -> Option<MarketEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(subscription = %self.config, skipped, "Consumer lagged behind feed");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<MarketEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(subscription = %self.config, skipped, "Consumer lagged behind feed");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}
