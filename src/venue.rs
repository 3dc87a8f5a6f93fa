//! Streaming venue: pooled market data plus ordered order acknowledgements
//!
//! Inbound frames from every connection go through one
//! [`OrderedMessageHandler`]; order placement and cancellation run in its
//! exclusive section, so an acknowledgement racing a placement is decoded
//! only after the broker id has been cached.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, trace, warn};

use crate::error::{MarketDataError, Result};
use crate::events::{BrokerageMessage, MarketEvent};
use crate::lifecycle::{GatewayLifecycle, LifecycleState};
use crate::metrics::INBOUND_MESSAGES;
use crate::multiplexer::DataSource;
use crate::ordered_handler::OrderedMessageHandler;
use crate::orders::{CachedOrderIds, Order, OrderEvent, OrderGateway, OrderStatus, OrderType, OrderUpdate};
use crate::parser::{ExecutionReport, ParsedMessage};
use crate::rate_limiter::RateLimiter;
use crate::scheduler::Scheduler;
use crate::subscription::{
    DataFeed, MultiConnectionSubscriptionManager, SubscriptionConfig, SubscriptionManagerConfig,
    SubscriptionProtocol, TickType,
};
use crate::symbol::{SecurityType, Symbol};
use crate::transport::{ConnectionFactory, SlotId};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// SUBSCRIBE/UNSUBSCRIBE frames for the trade and book ticker streams
#[derive(Debug, Clone, Copy, Default)]
pub struct BinanceProtocol;

impl BinanceProtocol {
    fn frame(method: &str, symbol: &Symbol, request_id: u64) -> String {
        let stream = symbol.ticker.to_lowercase();
        json!({
            "method": method,
            "params": [format!("{}@trade", stream), format!("{}@bookTicker", stream)],
            "id": request_id,
        })
        .to_string()
    }
}

impl SubscriptionProtocol for BinanceProtocol {
    fn subscribe_frame(&self, symbol: &Symbol, request_id: u64) -> String {
        Self::frame("SUBSCRIBE", symbol, request_id)
    }

    fn unsubscribe_frame(&self, symbol: &Symbol, request_id: u64) -> String {
        Self::frame("UNSUBSCRIBE", symbol, request_id)
    }
}

/// Raw frame tagged with the slot it arrived on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub slot: SlotId,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct VenueConfig {
    /// Market served, e.g. `binance`
    pub market: String,
    pub feed_capacity: usize,
    /// Period of the order gateway keep-alive
    pub keep_alive_interval: Duration,
    pub manager: SubscriptionManagerConfig,
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            market: "binance".to_string(),
            feed_capacity: EVENT_CHANNEL_CAPACITY,
            keep_alive_interval: Duration::from_secs(30 * 60),
            manager: SubscriptionManagerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum VenueTask {
    KeepAlive,
}

/// State touched by the inbound consumer
struct VenueCore {
    market: String,
    feeds: RwLock<HashMap<Symbol, Vec<(SubscriptionConfig, DataFeed)>>>,
    orders: CachedOrderIds,
    order_events: broadcast::Sender<OrderEvent>,
    messages: broadcast::Sender<BrokerageMessage>,
}

impl VenueCore {
    fn emit(&self, message: BrokerageMessage) {
        message.log();
        let _ = self.messages.send(message);
    }

    fn on_frame(&self, frame: InboundFrame) {
        INBOUND_MESSAGES.inc();
        match ParsedMessage::parse(&frame.text) {
            Ok(ParsedMessage::Trade(trade)) => {
                self.publish(TickType::Trade, MarketEvent::Trade(trade.to_tick(&self.market)));
            }
            Ok(ParsedMessage::BookTicker(ticker)) => {
                self.publish(TickType::Quote, MarketEvent::Quote(ticker.to_quote(&self.market)));
            }
            Ok(ParsedMessage::SubscriptionResult(result)) => match result.error {
                Some(error) => self.emit(BrokerageMessage::warning(
                    "SubscriptionFailed",
                    format!(
                        "Request {} on {} rejected: {} ({})",
                        result.id, frame.slot, error.msg, error.code
                    ),
                )),
                None => trace!(slot = %frame.slot, id = result.id, "Subscription acknowledged"),
            },
            Ok(ParsedMessage::ExecutionReport(report)) => self.on_execution_report(report),
            Ok(ParsedMessage::Unknown(raw)) => {
                let error = MarketDataError::FatalProtocolError(format!("unexpected frame: {}", raw));
                self.emit(BrokerageMessage::warning("UnknownMessage", error.to_string()));
            }
            Err(e) => {
                let error = MarketDataError::FatalProtocolError(format!(
                    "undecodable frame on {}: {}",
                    frame.slot, e
                ));
                self.emit(BrokerageMessage::warning("ParseError", error.to_string()));
            }
        }
    }

    fn publish(&self, tick_type: TickType, event: MarketEvent) {
        let feeds = self.feeds.read();
        let Some(subscribers) = feeds.get(event.symbol()) else {
            trace!(symbol = %event.symbol(), "Event for unsubscribed symbol dropped");
            return;
        };
        for (config, feed) in subscribers {
            if config.tick_type == tick_type {
                feed.publish(event.clone());
            }
        }
    }

    fn on_execution_report(&self, report: ExecutionReport) {
        let broker_id = report.broker_id();

        if let Err(e) = OrderType::from_wire(&report.order_type, report.price, report.stop_price) {
            warn!(broker_id = %broker_id, error = %e, "Execution report for unsupported order type");
            let _ = self.order_events.send(OrderEvent::UnsupportedOrderType {
                broker_id,
                tag: report.order_type,
            });
            return;
        }

        let Some(order) = self.orders.find_by_broker_id(&broker_id) else {
            self.emit(BrokerageMessage::warning(
                "OrderNotFound",
                format!(
                    "Execution report for unknown broker id {} ({} {})",
                    broker_id, report.symbol, report.order_status
                ),
            ));
            return;
        };

        let Some(status) = OrderStatus::from_wire(&report.order_status) else {
            warn!(order_id = order.id, status = %report.order_status, "Unknown order status");
            return;
        };

        let (fill_quantity, fill_price) = if report.execution_type == "TRADE" {
            (report.last_quantity, report.last_price)
        } else {
            Default::default()
        };

        self.orders.update_status(order.id, status);
        debug!(order_id = order.id, broker_id = %broker_id, status = ?status, "Order updated");

        let _ = self.order_events.send(OrderEvent::Update(OrderUpdate {
            order_id: order.id,
            broker_id,
            symbol: order.symbol,
            status,
            fill_quantity,
            fill_price,
            time: report.time(),
        }));
    }
}

/// A [`DataSource`] backed by a pool of venue connections
pub struct StreamingVenue {
    core: Arc<VenueCore>,
    feed_capacity: usize,
    keep_alive_interval: Duration,
    manager: MultiConnectionSubscriptionManager,
    handler: Arc<OrderedMessageHandler<InboundFrame>>,
    /// Serializes feed registry changes with the pool subscribe they trigger
    subscriptions: Mutex<()>,
    gateway: GatewayLifecycle<dyn OrderGateway>,
    scheduler: Scheduler<VenueTask>,
}

impl StreamingVenue {
    pub fn new(
        config: VenueConfig,
        factory: Arc<dyn ConnectionFactory>,
        rate_limiter: Arc<RateLimiter>,
        weights: HashMap<Symbol, u64>,
    ) -> Result<Self> {
        Self::with_protocol(config, factory, Arc::new(BinanceProtocol), rate_limiter, weights)
    }

    pub fn with_protocol(
        config: VenueConfig,
        factory: Arc<dyn ConnectionFactory>,
        protocol: Arc<dyn SubscriptionProtocol>,
        rate_limiter: Arc<RateLimiter>,
        weights: HashMap<Symbol, u64>,
    ) -> Result<Self> {
        let (order_events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (messages, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let core = Arc::new(VenueCore {
            market: config.market.to_lowercase(),
            feeds: RwLock::new(HashMap::new()),
            orders: CachedOrderIds::new(),
            order_events,
            messages: messages.clone(),
        });

        let consumer_core = Arc::clone(&core);
        let handler = Arc::new(OrderedMessageHandler::new(Arc::new(
            move |frame: InboundFrame| consumer_core.on_frame(frame),
        )));

        let inbound = Arc::clone(&handler);
        let manager = MultiConnectionSubscriptionManager::builder(config.manager)
            .factory(factory)
            .protocol(protocol)
            .rate_limiter(rate_limiter)
            .weights(weights)
            .messages(messages)
            .on_message(Arc::new(move |slot: SlotId, text: String| {
                inbound.handle_inbound(InboundFrame { slot, text })
            }))
            .build()?;

        info!(market = %core.market, "Streaming venue created");

        Ok(Self {
            core,
            feed_capacity: config.feed_capacity,
            keep_alive_interval: config.keep_alive_interval,
            manager,
            handler,
            subscriptions: Mutex::new(()),
            gateway: GatewayLifecycle::new(),
            scheduler: Scheduler::new(),
        })
    }

    pub fn market(&self) -> &str {
        &self.core.market
    }

    /// Only non-universe crypto symbols of this venue's market stream here
    pub fn can_subscribe(&self, symbol: &Symbol) -> bool {
        symbol.security_type == SecurityType::Crypto
            && symbol.market == self.core.market
            && !symbol.is_universe()
    }

    pub fn manager(&self) -> &MultiConnectionSubscriptionManager {
        &self.manager
    }

    pub fn cached_orders(&self) -> &CachedOrderIds {
        &self.core.orders
    }

    pub fn order_events(&self) -> broadcast::Receiver<OrderEvent> {
        self.core.order_events.subscribe()
    }

    /// Operator events from the venue and its connection pool
    pub fn messages(&self) -> broadcast::Receiver<BrokerageMessage> {
        self.core.messages.subscribe()
    }

    /// Feed an inbound frame through the ordered handler
    pub fn on_inbound(&self, slot: SlotId, text: String) {
        self.handler.handle_inbound(InboundFrame { slot, text });
    }

    /// Inbound frames held back by an in-flight order command
    pub fn pending_inbound(&self) -> usize {
        self.handler.pending_len()
    }

    pub fn gateway_state(&self) -> LifecycleState {
        self.gateway.state()
    }

    /// Bring the order gateway to `Ready` and start its keep-alive
    pub async fn initialize_gateway<F, Fut>(&self, build: F) -> Result<Arc<dyn OrderGateway>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn OrderGateway>>>,
    {
        let (gateway, transitioned) = self.gateway.initialize(build).await?;
        if transitioned {
            self.schedule_keep_alive(Arc::clone(&gateway));
        }
        Ok(gateway)
    }

    fn schedule_keep_alive(&self, gateway: Arc<dyn OrderGateway>) {
        let core = Arc::clone(&self.core);
        self.scheduler
            .schedule_repeating(VenueTask::KeepAlive, self.keep_alive_interval, move || {
                let gateway = Arc::clone(&gateway);
                let core = Arc::clone(&core);
                async move {
                    match gateway.keep_alive().await {
                        Ok(()) => debug!("Order gateway session kept alive"),
                        Err(e) => core.emit(BrokerageMessage::warning(
                            "KeepAliveFailed",
                            format!("Session keep-alive failed: {}", e),
                        )),
                    }
                }
            });
    }

    /// Place `order`; returns whether the venue accepted it
    pub async fn place_order(&self, order: &Order) -> Result<bool> {
        let gateway = self.gateway.get()?;
        let core = &self.core;

        self.handler
            .run_locked(|| async move {
                let submission = gateway.place_order(order).await?;
                match (&submission.broker_id, submission.accepted) {
                    (Some(broker_id), true) => {
                        core.orders.record_submission(order, broker_id);
                        info!(order_id = order.id, broker_id = %broker_id, "Order placed");
                    }
                    (None, true) => {
                        warn!(order_id = order.id, "Order accepted without broker id");
                    }
                    (_, false) => {
                        core.emit(BrokerageMessage::warning(
                            "OrderRejected",
                            format!("Order {} for {} rejected", order.id, order.symbol),
                        ));
                    }
                }
                Ok::<bool, MarketDataError>(submission.accepted)
            })
            .await?
    }

    /// Cancel `order`; the resulting status arrives as an order event
    pub async fn cancel_order(&self, order: &Order) -> Result<bool> {
        let gateway = self.gateway.get()?;

        self.handler
            .run_locked(|| async move {
                let accepted = gateway.cancel_order(order).await?;
                info!(order_id = order.id, accepted, "Cancel requested");
                Ok::<bool, MarketDataError>(accepted)
            })
            .await?
    }

    /// Let in-flight order commands finish, stop timers, close every connection
    pub async fn dispose(&self) {
        self.handler.quiesce().await;
        self.scheduler.shutdown();
        self.manager.dispose().await;
        self.core.feeds.write().clear();
        info!(market = %self.core.market, "Streaming venue disposed");
    }
}

#[async_trait]
impl DataSource for StreamingVenue {
    async fn subscribe(&self, config: &SubscriptionConfig) -> Result<Option<DataFeed>> {
        if !self.can_subscribe(&config.symbol)
            || !matches!(config.tick_type, TickType::Trade | TickType::Quote)
        {
            return Ok(None);
        }

        let _registry = self.subscriptions.lock().await;
        let first_for_symbol = !self.core.feeds.read().contains_key(&config.symbol);
        if first_for_symbol {
            self.manager.subscribe(&config.symbol).await?;
        }

        let feed = DataFeed::new(self.feed_capacity);
        self.core
            .feeds
            .write()
            .entry(config.symbol.clone())
            .or_default()
            .push((config.clone(), feed.clone()));
        debug!(subscription = %config, "Venue feed registered");
        Ok(Some(feed))
    }

    async fn unsubscribe(&self, config: &SubscriptionConfig) -> Result<()> {
        let _registry = self.subscriptions.lock().await;

        let last_for_symbol = {
            let mut feeds = self.core.feeds.write();
            let Some(subscribers) = feeds.get_mut(&config.symbol) else {
                return Ok(());
            };
            subscribers.retain(|(registered, _)| registered != config);
            if subscribers.is_empty() {
                feeds.remove(&config.symbol);
                true
            } else {
                false
            }
        };

        if last_for_symbol {
            self.manager.unsubscribe(&config.symbol).await?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orders::{MockOrderGateway, Submission};
    use crate::subscription::Resolution;
    use crate::transport::WebSocketFactory;
    use rust_decimal_macros::dec;
    use serde_json::Value;

    fn venue(keep_alive_interval: Duration) -> StreamingVenue {
        let config = VenueConfig {
            keep_alive_interval,
            ..VenueConfig::default()
        };
        StreamingVenue::new(
            config,
            Arc::new(WebSocketFactory::new()),
            Arc::new(RateLimiter::per_second(10)),
            HashMap::new(),
        )
        .unwrap()
    }

    fn market_order() -> Order {
        Order::new(
            5,
            Symbol::crypto("ETHUSDT", "binance"),
            dec!(2),
            OrderType::Market,
        )
    }

    #[tokio::test]
    async fn test_rejected_order_is_not_cached() {
        let venue = venue(Duration::from_secs(60));
        let mut messages = venue.messages();

        let mut gateway = MockOrderGateway::new();
        gateway.expect_place_order().times(1).returning(|_| {
            Ok(Submission {
                accepted: false,
                broker_id: None,
            })
        });
        venue
            .initialize_gateway(|| async move { Ok(Arc::new(gateway) as Arc<dyn OrderGateway>) })
            .await
            .unwrap();

        assert!(!venue.place_order(&market_order()).await.unwrap());
        assert!(venue.cached_orders().is_empty());
        assert_eq!(messages.try_recv().unwrap().code, "OrderRejected");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_keep_alive_is_reported() {
        let venue = venue(Duration::from_secs(10));
        let mut messages = venue.messages();

        let mut gateway = MockOrderGateway::new();
        gateway
            .expect_keep_alive()
            .returning(|| Err(MarketDataError::RestApiError("listenKey expired".into())));
        venue
            .initialize_gateway(|| async move { Ok(Arc::new(gateway) as Arc<dyn OrderGateway>) })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(messages.try_recv().unwrap().code, "KeepAliveFailed");

        venue.dispose().await;
    }

    #[tokio::test]
    async fn test_eligibility() {
        let venue = venue(Duration::from_secs(60));
        assert!(venue.can_subscribe(&Symbol::crypto("BTCUSDT", "binance")));
        assert!(!venue.can_subscribe(&Symbol::crypto("BTCUSDT", "kraken")));
        assert!(!venue.can_subscribe(&Symbol::new("SPY", SecurityType::Equity, "binance")));
        assert!(!venue.can_subscribe(&Symbol::crypto("BINANCE-UNIVERSE", "binance")));
    }

    #[tokio::test]
    async fn test_open_interest_is_not_streamed() {
        let venue = venue(Duration::from_secs(60));
        let config = SubscriptionConfig::new(
            Symbol::crypto("BTCUSDT", "binance"),
            TickType::OpenInterest,
            Resolution::Tick,
        );

        assert!(venue.subscribe(&config).await.unwrap().is_none());
        assert!(!venue.manager().is_subscribed(&config.symbol).await);
    }

    #[test]
    fn test_frames_request_trade_and_book_ticker() {
        let symbol = Symbol::crypto("BTCUSDT", "binance");
        let frame: Value = serde_json::from_str(&BinanceProtocol.subscribe_frame(&symbol, 7)).unwrap();

        assert_eq!(frame["method"], "SUBSCRIBE");
        assert_eq!(frame["params"][0], "btcusdt@trade");
        assert_eq!(frame["params"][1], "btcusdt@bookTicker");
        assert_eq!(frame["id"], 7);

        let frame: Value =
            serde_json::from_str(&BinanceProtocol.unsubscribe_frame(&symbol, 8)).unwrap();
        assert_eq!(frame["method"], "UNSUBSCRIBE");
    }
}
