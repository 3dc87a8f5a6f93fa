//! Pool of persistent connections serving an unbounded symbol set
//!
//! Every subscribe/unsubscribe, reconnect and rotation runs under one state
//! lock. Timers never touch the state: they post a `Control` message that a
//! task picks up and processes under that lock. Inbound frames bypass the
//! lock and are handed to the message sink in per-connection arrival order.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::plan::{self, PlanLimits, SlotLoad};
use crate::error::{MarketDataError, Result};
use crate::events::BrokerageMessage;
use crate::metrics::{FRAMES_SENT, OPEN_CONNECTIONS, RECONNECTS, SUBSCRIBED_SYMBOLS};
use crate::rate_limiter::RateLimiter;
use crate::scheduler::Scheduler;
use crate::symbol::Symbol;
use crate::transport::{
    ConnectionEvent, ConnectionFactory, ConnectionHandle, ConnectionState, SlotEvent, SlotId,
};

/// Default forced rotation period, under the venue's 24h session limit
const DEFAULT_CONNECTION_LIFETIME: Duration = Duration::from_secs(23 * 3600 + 45 * 60);

/// Builds the wire frames that add or remove a symbol on a connection
pub trait SubscriptionProtocol: Send + Sync {
    fn subscribe_frame(&self, symbol: &Symbol, request_id: u64) -> String;
    fn unsubscribe_frame(&self, symbol: &Symbol, request_id: u64) -> String;
}

/// Receives every inbound frame with the slot it arrived on
pub type MessageSink = Arc<dyn Fn(SlotId, String) + Send + Sync>;

/// What happens to a connection once its last symbol is removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EmptySlotPolicy {
    /// Close the connection and drop the slot immediately.
    #[default]
    Close,
    /// Keep the connection open; later subscriptions may reuse it.
    KeepWarm,
}

impl FromStr for EmptySlotPolicy {
    type Err = MarketDataError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "close" => Ok(Self::Close),
            "keep-warm" | "keep_warm" | "keepwarm" => Ok(Self::KeepWarm),
            other => Err(MarketDataError::ConfigError(format!(
                "Unknown empty slot policy: {}",
                other
            ))),
        }
    }
}

/// Exponential backoff between reconnect attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Attempts before a fatal operator event, 0 for unlimited
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(6);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt <= self.max_attempts
    }
}

/// Pool configuration
#[derive(Debug, Clone)]
pub struct SubscriptionManagerConfig {
    pub endpoint: String,
    pub max_symbols_per_connection: usize,
    /// 0 for unlimited
    pub max_connections: usize,
    /// Weight capacity per connection; `None` caps by symbol count only
    pub connection_capacity: Option<u64>,
    /// Forced rotation period, zero disables rotation
    pub connection_lifetime: Duration,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub empty_slot_policy: EmptySlotPolicy,
}

impl Default for SubscriptionManagerConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            max_symbols_per_connection: 512,
            max_connections: 0,
            connection_capacity: None,
            connection_lifetime: DEFAULT_CONNECTION_LIFETIME,
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
            empty_slot_policy: EmptySlotPolicy::Close,
        }
    }
}

impl SubscriptionManagerConfig {
    pub fn limits(&self) -> PlanLimits {
        PlanLimits {
            capacity: self.connection_capacity,
            max_symbols_per_connection: self.max_symbols_per_connection,
            max_connections: self.max_connections,
        }
    }
}

/// Point-in-time view of one slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub id: SlotId,
    pub generation: u64,
    pub state: ConnectionState,
    pub symbols: Vec<Symbol>,
    pub load: SlotLoad,
}

struct ConnectionSlot {
    id: SlotId,
    handle: ConnectionHandle,
    /// Assigned symbols with the weight they were placed with
    symbols: BTreeMap<Symbol, u64>,
    load: SlotLoad,
}

#[derive(Default)]
struct ManagerState {
    /// In creation order
    slots: Vec<ConnectionSlot>,
    index: HashMap<Symbol, SlotId>,
    next_slot_id: u64,
    disposed: bool,
}

impl ManagerState {
    fn slot_mut(&mut self, id: SlotId) -> Option<&mut ConnectionSlot> {
        self.slots.iter_mut().find(|slot| slot.id == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SlotTask {
    Rotate(SlotId),
    Reconnect(SlotId),
}

#[derive(Debug)]
enum Control {
    Rotate { slot: SlotId, generation: u64 },
    Reconnect { slot: SlotId, attempt: u32 },
}

/// Builder for [`MultiConnectionSubscriptionManager`]
pub struct SubscriptionManagerBuilder {
    config: SubscriptionManagerConfig,
    factory: Option<Arc<dyn ConnectionFactory>>,
    protocol: Option<Arc<dyn SubscriptionProtocol>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    weights: HashMap<Symbol, u64>,
    messages: Option<broadcast::Sender<BrokerageMessage>>,
    on_message: Option<MessageSink>,
}

impl SubscriptionManagerBuilder {
    pub fn new(config: SubscriptionManagerConfig) -> Self {
        Self {
            config,
            factory: None,
            protocol: None,
            rate_limiter: None,
            weights: HashMap::new(),
            messages: None,
            on_message: None,
        }
    }

    pub fn factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn protocol(mut self, protocol: Arc<dyn SubscriptionProtocol>) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn rate_limiter(mut self, rate_limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    /// Per-symbol weights; symbols not listed weigh 1
    pub fn weights(mut self, weights: HashMap<Symbol, u64>) -> Self {
        self.weights = weights;
        self
    }

    /// Operator channel for reconnect and retry events
    pub fn messages(mut self, messages: broadcast::Sender<BrokerageMessage>) -> Self {
        self.messages = Some(messages);
        self
    }

    pub fn on_message(mut self, sink: MessageSink) -> Self {
        self.on_message = Some(sink);
        self
    }

    /// Build the manager and start its event loop; needs a tokio runtime
    pub fn build(self) -> Result<MultiConnectionSubscriptionManager> {
        let factory = self.factory.ok_or_else(|| {
            MarketDataError::ConfigError("subscription manager needs a connection factory".into())
        })?;
        let protocol = self.protocol.ok_or_else(|| {
            MarketDataError::ConfigError("subscription manager needs a protocol".into())
        })?;
        if self.config.max_symbols_per_connection == 0 {
            return Err(MarketDataError::ConfigError(
                "max_symbols_per_connection must be positive".into(),
            ));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            limits: self.config.limits(),
            config: self.config,
            factory,
            protocol,
            rate_limiter: self
                .rate_limiter
                .unwrap_or_else(|| Arc::new(RateLimiter::per_second(5))),
            weights: self
                .weights
                .into_iter()
                .map(|(symbol, weight)| (symbol, weight.max(1)))
                .collect(),
            messages: self
                .messages
                .unwrap_or_else(|| broadcast::channel(256).0),
            on_message: self.on_message.unwrap_or_else(discard_messages),
            state: Mutex::new(ManagerState::default()),
            live: RwLock::new(HashMap::new()),
            scheduler: Scheduler::new(),
            events_tx,
            control_tx,
            request_id: AtomicU64::new(1),
            slot_count: AtomicUsize::new(0),
            connected_count: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(run_event_loop(Arc::clone(&inner), events_rx, control_rx));

        Ok(MultiConnectionSubscriptionManager { inner })
    }
}

/// Packs symbols onto a bounded pool of connections
pub struct MultiConnectionSubscriptionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: SubscriptionManagerConfig,
    limits: PlanLimits,
    factory: Arc<dyn ConnectionFactory>,
    protocol: Arc<dyn SubscriptionProtocol>,
    rate_limiter: Arc<RateLimiter>,
    weights: HashMap<Symbol, u64>,
    messages: broadcast::Sender<BrokerageMessage>,
    on_message: MessageSink,
    state: Mutex<ManagerState>,
    /// Current handle generation per slot, readable without the state lock
    live: RwLock<HashMap<SlotId, u64>>,
    scheduler: Scheduler<SlotTask>,
    events_tx: mpsc::UnboundedSender<SlotEvent>,
    control_tx: mpsc::UnboundedSender<Control>,
    request_id: AtomicU64,
    slot_count: AtomicUsize,
    connected_count: AtomicUsize,
    shutdown: CancellationToken,
}

impl MultiConnectionSubscriptionManager {
    pub fn builder(config: SubscriptionManagerConfig) -> SubscriptionManagerBuilder {
        SubscriptionManagerBuilder::new(config)
    }

    /// Assign `symbol` to a slot and send its subscribe frame
    ///
    /// Subscribing an already assigned symbol returns its slot without
    /// sending anything.
    pub async fn subscribe(&self, symbol: &Symbol) -> Result<SlotId> {
        let slots = self.subscribe_many(std::slice::from_ref(symbol)).await?;
        slots.into_iter().next().ok_or_else(|| MarketDataError::CapacityExceeded {
            symbol: symbol.to_string(),
        })
    }

    /// Assign a batch of symbols; either all of them are placed or none
    ///
    /// Returns the slot of every requested symbol, in request order.
    pub async fn subscribe_many(&self, symbols: &[Symbol]) -> Result<Vec<SlotId>> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        if state.disposed {
            return Err(MarketDataError::Disposed);
        }

        let mut requests: Vec<(Symbol, u64)> = Vec::new();
        for symbol in symbols {
            if !state.index.contains_key(symbol) && !requests.iter().any(|(s, _)| s == symbol) {
                requests.push((symbol.clone(), self.inner.weight(symbol)));
            }
        }

        if !requests.is_empty() {
            let current: Vec<SlotLoad> = state.slots.iter().map(|slot| slot.load).collect();
            let assignment = plan::plan(&current, &requests, &self.inner.limits)?;

            for _ in 0..assignment.new_slots {
                self.inner.open_slot(state).await;
            }

            for (symbol, index) in assignment.placements {
                let weight = self.inner.weight(&symbol);
                let slot = &mut state.slots[index];
                slot.symbols.insert(symbol.clone(), weight);
                slot.load.add(weight);
                state.index.insert(symbol.clone(), slot.id);
                info!(symbol = %symbol, slot = %slot.id, weight, load = slot.load.weight, "Symbol assigned");

                if slot.handle.is_connected() {
                    let frame = self
                        .inner
                        .protocol
                        .subscribe_frame(&symbol, self.inner.next_request_id());
                    if let Err(e) = self.inner.send_frame(&slot.handle, frame).await {
                        warn!(symbol = %symbol, slot = %slot.id, error = %e, "Subscribe frame failed, reconnecting slot");
                        slot.handle.mark_dropped();
                        self.inner.schedule_reconnect(slot.id, 1);
                    }
                } else if !self.inner.scheduler.is_scheduled(&SlotTask::Reconnect(slot.id)) {
                    // Retries exhausted earlier, start a fresh round
                    info!(symbol = %symbol, slot = %slot.id, "Symbol placed on idle disconnected slot, reconnecting");
                    self.inner.schedule_reconnect(slot.id, 1);
                }
            }
        }

        self.inner.refresh_counts(state);

        symbols
            .iter()
            .map(|symbol| {
                state.index.get(symbol).copied().ok_or_else(|| {
                    MarketDataError::CapacityExceeded {
                        symbol: symbol.to_string(),
                    }
                })
            })
            .collect()
    }

    /// Remove `symbol` from its slot; returns false when it was not assigned
    pub async fn unsubscribe(&self, symbol: &Symbol) -> Result<bool> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        if state.disposed {
            return Ok(false);
        }

        let Some(slot_id) = state.index.remove(symbol) else {
            debug!(symbol = %symbol, "Unsubscribe for unassigned symbol ignored");
            return Ok(false);
        };
        let Some(position) = state.slots.iter().position(|slot| slot.id == slot_id) else {
            return Ok(false);
        };

        let slot = &mut state.slots[position];
        if let Some(weight) = slot.symbols.remove(symbol) {
            slot.load.remove(weight);
        }
        info!(symbol = %symbol, slot = %slot_id, remaining = slot.symbols.len(), "Symbol removed");
        let retiring =
            slot.symbols.is_empty() && self.inner.config.empty_slot_policy == EmptySlotPolicy::Close;

        if slot.handle.is_connected() {
            let frame = self
                .inner
                .protocol
                .unsubscribe_frame(symbol, self.inner.next_request_id());
            if let Err(e) = self.inner.send_frame(&slot.handle, frame).await {
                if retiring {
                    debug!(symbol = %symbol, slot = %slot_id, error = %e, "Unsubscribe frame failed on retiring slot");
                } else {
                    warn!(symbol = %symbol, slot = %slot_id, error = %e, "Unsubscribe frame failed, reconnecting slot");
                    slot.handle.mark_dropped();
                    self.inner.scheduler.cancel(&SlotTask::Rotate(slot_id));
                    self.inner.schedule_reconnect(slot_id, 1);
                }
            }
        }

        if retiring {
            let mut slot = state.slots.remove(position);
            self.inner.retire_slot(&mut slot).await;
        }

        self.inner.refresh_counts(state);
        Ok(true)
    }

    pub async fn is_subscribed(&self, symbol: &Symbol) -> bool {
        self.inner.state.lock().await.index.contains_key(symbol)
    }

    /// Slot currently serving `symbol`
    pub async fn slot_of(&self, symbol: &Symbol) -> Option<SlotId> {
        self.inner.state.lock().await.index.get(symbol).copied()
    }

    pub async fn snapshot(&self) -> Vec<SlotSnapshot> {
        let state = self.inner.state.lock().await;
        state
            .slots
            .iter()
            .map(|slot| SlotSnapshot {
                id: slot.id,
                generation: slot.handle.generation(),
                state: slot.handle.state(),
                symbols: slot.symbols.keys().cloned().collect(),
                load: slot.load,
            })
            .collect()
    }

    pub fn weight(&self, symbol: &Symbol) -> u64 {
        self.inner.weight(symbol)
    }

    /// Operator events: reconnects, rotations, exhausted retries
    pub fn messages(&self) -> broadcast::Receiver<BrokerageMessage> {
        self.inner.messages.subscribe()
    }

    pub fn slot_count(&self) -> usize {
        self.inner.slot_count.load(Ordering::SeqCst)
    }

    pub fn connected_count(&self) -> usize {
        self.inner.connected_count.load(Ordering::SeqCst)
    }

    /// True when every slot is connected (vacuously so with no slots)
    pub fn is_connected(&self) -> bool {
        self.connected_count() == self.slot_count()
    }

    /// Close every connection, cancel timers and clear all assignments
    pub async fn dispose(&self) {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        if state.disposed {
            return;
        }
        state.disposed = true;
        self.inner.scheduler.shutdown();

        for mut slot in state.slots.drain(..) {
            slot.handle.close().await;
        }
        state.index.clear();
        self.inner.live.write().clear();
        self.inner.refresh_counts(state);
        self.inner.shutdown.cancel();
        info!("Subscription manager disposed");
    }
}

impl Drop for MultiConnectionSubscriptionManager {
    fn drop(&mut self) {
        self.inner.scheduler.shutdown();
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    fn weight(&self, symbol: &Symbol) -> u64 {
        self.weights.get(symbol).copied().unwrap_or(1)
    }

    fn next_request_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    fn emit(&self, message: BrokerageMessage) {
        message.log();
        let _ = self.messages.send(message);
    }

    fn is_live(&self, slot: SlotId, generation: u64) -> bool {
        self.live.read().get(&slot) == Some(&generation)
    }

    /// Rate-limited send of one frame
    async fn send_frame(&self, handle: &ConnectionHandle, frame: String) -> Result<()> {
        self.rate_limiter.wait_to_proceed().await;
        trace!(slot = %handle.slot(), frame = %frame, "Sending frame");
        handle.send(frame).await?;
        FRAMES_SENT.inc();
        Ok(())
    }

    /// Create a slot and try to open its connection
    ///
    /// A slot whose first open fails is kept and reconnected, so symbols
    /// placed on it are subscribed once the connection comes up.
    async fn open_slot(&self, state: &mut ManagerState) -> SlotId {
        state.next_slot_id += 1;
        let id = SlotId(state.next_slot_id);
        let mut handle = ConnectionHandle::new(id, 1, self.factory.as_ref(), self.events_tx.clone());
        self.live.write().insert(id, handle.generation());

        match handle.open(&self.config.endpoint, self.config.connect_timeout).await {
            Ok(()) => {
                info!(slot = %id, "Connection slot opened");
                self.schedule_rotation(id, handle.generation());
            }
            Err(e) => {
                warn!(slot = %id, error = %e, "New connection slot failed to open");
                handle.mark_dropped();
                self.schedule_reconnect(id, 1);
            }
        }

        state.slots.push(ConnectionSlot {
            id,
            handle,
            symbols: BTreeMap::new(),
            load: SlotLoad::default(),
        });
        id
    }

    async fn retire_slot(&self, slot: &mut ConnectionSlot) {
        self.scheduler.cancel(&SlotTask::Rotate(slot.id));
        self.scheduler.cancel(&SlotTask::Reconnect(slot.id));
        self.live.write().remove(&slot.id);
        slot.handle.close().await;
        info!(slot = %slot.id, "Empty connection slot closed");
    }

    /// Replace the slot's connection with a new generation and resubscribe
    /// every symbol assigned to it
    async fn reestablish(&self, slot: &mut ConnectionSlot) -> Result<()> {
        let handle = slot
            .handle
            .next_generation(self.factory.as_ref(), self.events_tx.clone());
        self.live.write().insert(slot.id, handle.generation());

        let mut previous = std::mem::replace(&mut slot.handle, handle);
        previous.close().await;

        slot.handle
            .open(&self.config.endpoint, self.config.connect_timeout)
            .await?;

        for symbol in slot.symbols.keys() {
            let frame = self.protocol.subscribe_frame(symbol, self.next_request_id());
            self.send_frame(&slot.handle, frame).await?;
        }

        self.schedule_rotation(slot.id, slot.handle.generation());
        Ok(())
    }

    fn schedule_reconnect(&self, slot: SlotId, attempt: u32) {
        let delay = self.config.reconnect.delay_for(attempt);
        let control = self.control_tx.clone();
        debug!(slot = %slot, attempt, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
        self.scheduler.schedule(SlotTask::Reconnect(slot), delay, async move {
            let _ = control.send(Control::Reconnect { slot, attempt });
        });
    }

    fn schedule_rotation(&self, slot: SlotId, generation: u64) {
        let lifetime = self.config.connection_lifetime;
        if lifetime.is_zero() {
            return;
        }
        let control = self.control_tx.clone();
        self.scheduler.schedule(SlotTask::Rotate(slot), lifetime, async move {
            let _ = control.send(Control::Rotate { slot, generation });
        });
    }

    fn refresh_counts(&self, state: &ManagerState) {
        let connected = state
            .slots
            .iter()
            .filter(|slot| slot.handle.is_connected())
            .count();
        self.slot_count.store(state.slots.len(), Ordering::SeqCst);
        self.connected_count.store(connected, Ordering::SeqCst);
        OPEN_CONNECTIONS.set(connected as i64);
        SUBSCRIBED_SYMBOLS.set(state.index.len() as i64);
    }

    /// The connection of `slot` went away without being asked to
    async fn on_dropped(&self, slot_id: SlotId, generation: u64, reason: Option<String>) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.disposed {
            return;
        }
        let Some(slot) = state.slot_mut(slot_id) else {
            return;
        };
        if slot.handle.generation() != generation
            || matches!(
                slot.handle.state(),
                ConnectionState::Closed | ConnectionState::Reconnecting
            )
        {
            return;
        }

        slot.handle.mark_dropped();
        self.scheduler.cancel(&SlotTask::Rotate(slot_id));
        self.emit(BrokerageMessage::information(
            "ConnectionDropped",
            format!(
                "{} dropped ({}), reconnecting {} symbols",
                slot_id,
                reason.as_deref().unwrap_or("no reason"),
                slot.symbols.len()
            ),
        ));
        self.schedule_reconnect(slot_id, 1);
        self.refresh_counts(state);
    }

    async fn on_reconnect(&self, slot_id: SlotId, attempt: u32) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.disposed {
            return;
        }
        let Some(slot) = state.slot_mut(slot_id) else {
            return;
        };
        if slot.handle.is_connected() {
            return;
        }

        RECONNECTS.inc();
        info!(slot = %slot_id, attempt, symbols = slot.symbols.len(), "Reconnecting slot");

        match self.reestablish(slot).await {
            Ok(()) => {
                self.emit(BrokerageMessage::information(
                    "Reconnected",
                    format!(
                        "{} reconnected after {} attempt(s), {} symbols resubscribed",
                        slot_id,
                        attempt,
                        slot.symbols.len()
                    ),
                ));
            }
            Err(e) => {
                slot.handle.mark_dropped();
                let next = attempt + 1;
                if self.config.reconnect.should_retry(next) {
                    self.emit(BrokerageMessage::information(
                        "ReconnectFailed",
                        format!("{} reconnect attempt {} failed: {}", slot_id, attempt, e),
                    ));
                    self.schedule_reconnect(slot_id, next);
                } else {
                    self.emit(BrokerageMessage::error(
                        "ReconnectExhausted",
                        format!(
                            "{} gave up after {} attempts ({}), {} symbols without data",
                            slot_id,
                            attempt,
                            MarketDataError::MaxReconnectAttemptsExceeded,
                            slot.symbols.len()
                        ),
                    ));
                }
            }
        }
        self.refresh_counts(state);
    }

    async fn on_rotate(&self, slot_id: SlotId, generation: u64) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.disposed {
            return;
        }
        let Some(slot) = state.slot_mut(slot_id) else {
            return;
        };
        if slot.handle.generation() != generation || !slot.handle.is_connected() {
            return;
        }

        info!(
            slot = %slot_id,
            symbols = slot.symbols.len(),
            age_secs = slot.handle.age().map_or(0, |age| age.as_secs()),
            "Rotating connection"
        );
        if let Err(e) = self.reestablish(slot).await {
            warn!(slot = %slot_id, error = %e, "Rotation failed, reconnecting");
            slot.handle.mark_dropped();
            self.schedule_reconnect(slot_id, 1);
        }
        self.refresh_counts(state);
    }

    async fn on_control(&self, control: Control) {
        match control {
            Control::Rotate { slot, generation } => self.on_rotate(slot, generation).await,
            Control::Reconnect { slot, attempt } => self.on_reconnect(slot, attempt).await,
        }
    }
}

fn discard_messages() -> MessageSink {
    Arc::new(|_: SlotId, _: String| {})
}

async fn run_event_loop(
    inner: Arc<Inner>,
    mut events: mpsc::UnboundedReceiver<SlotEvent>,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    let shutdown = inner.shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(SlotEvent { slot, generation, event }) = events.recv() => {
                if !inner.is_live(slot, generation) {
                    trace!(slot = %slot, generation, "Stale connection event ignored");
                    continue;
                }
                match event {
                    ConnectionEvent::Opened => {
                        debug!(slot = %slot, generation, "Connection opened");
                    }
                    ConnectionEvent::Message(text) => (inner.on_message)(slot, text),
                    ConnectionEvent::Closed { reason } => {
                        let inner = Arc::clone(&inner);
                        tokio::spawn(async move {
                            inner.on_dropped(slot, generation, reason).await;
                        });
                    }
                }
            }
            Some(command) = control.recv() => {
                let inner = Arc::clone(&inner);
                tokio::spawn(async move { inner.on_control(command).await });
            }
            else => break,
        }
    }
    debug!("Subscription manager event loop stopped");
}
