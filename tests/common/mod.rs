//! Shared fakes for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use orp_flow_connectivity::error::{MarketDataError, Result};
use orp_flow_connectivity::subscription::{
    EmptySlotPolicy, ReconnectPolicy, SubscriptionManagerConfig, SubscriptionProtocol,
};
use orp_flow_connectivity::transport::{Connection, ConnectionEvents, ConnectionFactory, SlotId};
use orp_flow_connectivity::{DataFeed, DataSource, SubscriptionConfig, Symbol};

/// Frame written to a fake connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    pub slot: SlotId,
    pub generation: u64,
    pub text: String,
}

/// In-memory connection driven by the test
pub struct FakeConnection {
    events: ConnectionEvents,
    open: AtomicBool,
    refuse: bool,
    failing_sends: AtomicBool,
    frames: Arc<Mutex<Vec<SentFrame>>>,
}

impl FakeConnection {
    pub fn slot(&self) -> SlotId {
        self.events.slot()
    }

    pub fn generation(&self) -> u64 {
        self.events.generation()
    }

    /// Simulate the remote end going away
    pub fn drop_connection(&self, reason: &str) {
        self.open.store(false, Ordering::SeqCst);
        self.events.closed(Some(reason.to_string()));
    }

    /// Further writes fail while the connection still looks open
    pub fn fail_sends(&self) {
        self.failing_sends.store(true, Ordering::SeqCst);
    }

    /// Simulate an inbound frame
    pub fn push_message(&self, text: &str) {
        self.events.message(text.to_string());
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn open(&self, _endpoint: &str) -> Result<()> {
        if self.refuse {
            return Err(MarketDataError::TransientConnectionFailure(
                "connection refused".into(),
            ));
        }
        self.open.store(true, Ordering::SeqCst);
        self.events.opened();
        Ok(())
    }

    async fn send(&self, frame: String) -> Result<()> {
        if !self.is_open() {
            return Err(MarketDataError::TransientConnectionFailure(
                "connection closed".into(),
            ));
        }
        if self.failing_sends.load(Ordering::SeqCst) {
            return Err(MarketDataError::WebSocketMessage("broken pipe".into()));
        }
        self.frames.lock().push(SentFrame {
            slot: self.slot(),
            generation: self.generation(),
            text: frame,
        });
        Ok(())
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Factory recording every connection and frame
#[derive(Default)]
pub struct FakeNetwork {
    connections: Mutex<Vec<Arc<FakeConnection>>>,
    frames: Arc<Mutex<Vec<SentFrame>>>,
    refused_opens: AtomicUsize,
}

impl FakeNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `count` connections refuse to open
    pub fn refuse_opens(&self, count: usize) {
        self.refused_opens.store(count, Ordering::SeqCst);
    }

    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.connections.lock().clone()
    }

    /// Newest connection created for `slot`
    pub fn latest(&self, slot: SlotId) -> Option<Arc<FakeConnection>> {
        self.connections
            .lock()
            .iter()
            .filter(|connection| connection.slot() == slot)
            .max_by_key(|connection| connection.generation())
            .cloned()
    }

    pub fn connection(&self, slot: SlotId, generation: u64) -> Option<Arc<FakeConnection>> {
        self.connections
            .lock()
            .iter()
            .find(|connection| connection.slot() == slot && connection.generation() == generation)
            .cloned()
    }

    pub fn open_connections(&self) -> usize {
        self.connections
            .lock()
            .iter()
            .filter(|connection| connection.is_open())
            .count()
    }

    pub fn frames(&self) -> Vec<SentFrame> {
        self.frames.lock().clone()
    }

    /// Frame texts written to one connection generation
    pub fn texts(&self, slot: SlotId, generation: u64) -> Vec<String> {
        self.frames
            .lock()
            .iter()
            .filter(|frame| frame.slot == slot && frame.generation == generation)
            .map(|frame| frame.text.clone())
            .collect()
    }
}

impl ConnectionFactory for FakeNetwork {
    fn create(&self, events: ConnectionEvents) -> Arc<dyn Connection> {
        let refuse = self
            .refused_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        let connection = Arc::new(FakeConnection {
            events,
            open: AtomicBool::new(false),
            refuse,
            failing_sends: AtomicBool::new(false),
            frames: Arc::clone(&self.frames),
        });
        self.connections.lock().push(Arc::clone(&connection));
        connection
    }
}

/// Plain-text frames: `SUB <ticker>` / `UNSUB <ticker>`
pub struct TestProtocol;

impl SubscriptionProtocol for TestProtocol {
    fn subscribe_frame(&self, symbol: &Symbol, _request_id: u64) -> String {
        format!("SUB {}", symbol.ticker)
    }

    fn unsubscribe_frame(&self, symbol: &Symbol, _request_id: u64) -> String {
        format!("UNSUB {}", symbol.ticker)
    }
}

pub fn crypto(ticker: &str) -> Symbol {
    Symbol::crypto(ticker, "binance")
}

/// Pool config with fast retries
pub fn manager_config(max_symbols_per_connection: usize, max_connections: usize) -> SubscriptionManagerConfig {
    SubscriptionManagerConfig {
        endpoint: "wss://venue.test/ws".to_string(),
        max_symbols_per_connection,
        max_connections,
        connection_capacity: None,
        connection_lifetime: Duration::from_secs(3600),
        connect_timeout: Duration::from_secs(1),
        reconnect: ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_attempts: 3,
        },
        empty_slot_policy: EmptySlotPolicy::Close,
    }
}

/// Let spawned tasks and due timers run; needs paused time
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Source counting underlying calls per request
#[derive(Default)]
pub struct CountingSource {
    subscribes: Mutex<HashMap<SubscriptionConfig, usize>>,
    unsubscribes: Mutex<HashMap<SubscriptionConfig, usize>>,
    feeds: Mutex<HashMap<SubscriptionConfig, DataFeed>>,
    /// Market served; `None` serves any
    market: Option<String>,
}

impl CountingSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn for_market(market: &str) -> Arc<Self> {
        Arc::new(Self {
            market: Some(market.to_string()),
            ..Self::default()
        })
    }

    pub fn subscribe_calls(&self, config: &SubscriptionConfig) -> usize {
        self.subscribes.lock().get(config).copied().unwrap_or(0)
    }

    pub fn unsubscribe_calls(&self, config: &SubscriptionConfig) -> usize {
        self.unsubscribes.lock().get(config).copied().unwrap_or(0)
    }

    pub fn total_subscribes(&self) -> usize {
        self.subscribes.lock().values().sum()
    }

    pub fn total_unsubscribes(&self) -> usize {
        self.unsubscribes.lock().values().sum()
    }

    /// Feed handed out for an underlying request, to publish test events
    pub fn feed(&self, config: &SubscriptionConfig) -> Option<DataFeed> {
        self.feeds.lock().get(config).cloned()
    }
}

#[async_trait]
impl DataSource for CountingSource {
    async fn subscribe(&self, config: &SubscriptionConfig) -> Result<Option<DataFeed>> {
        if let Some(market) = &self.market {
            if &config.symbol.market != market {
                return Ok(None);
            }
        }
        tokio::task::yield_now().await;
        *self.subscribes.lock().entry(config.clone()).or_default() += 1;
        let feed = DataFeed::new(64);
        self.feeds.lock().insert(config.clone(), feed.clone());
        Ok(Some(feed))
    }

    async fn unsubscribe(&self, config: &SubscriptionConfig) -> Result<()> {
        tokio::task::yield_now().await;
        *self.unsubscribes.lock().entry(config.clone()).or_default() += 1;
        self.feeds.lock().remove(config);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }
}
