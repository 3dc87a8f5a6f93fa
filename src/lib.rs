//! ORPflow HFT - Venue Connectivity Library
//!
//! Live-market connectivity: streamed symbols packed across a bounded pool
//! of venue connections, order commands ordered against their asynchronous
//! acknowledgements, and a reference-counting front over several data
//! sources that understands symbol mapping.

use std::sync::Arc;

pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod metrics;
pub mod multiplexer;
pub mod ordered_handler;
pub mod orders;
pub mod parser;
pub mod publisher;
pub mod rate_limiter;
pub mod scheduler;
pub mod subscription;
pub mod symbol;
pub mod transport;
pub mod venue;
pub mod weights;

pub use config::Config;
pub use error::{MarketDataError, Result};
pub use events::{BrokerageMessage, MarketEvent, MessageKind, QuoteTick, TradeTick};
pub use lifecycle::{GatewayLifecycle, LifecycleState};
pub use multiplexer::{DataSource, SubscriptionMultiplexer};
pub use ordered_handler::OrderedMessageHandler;
pub use orders::{CachedOrderIds, Order, OrderEvent, OrderGateway, OrderStatus, OrderType};
pub use parser::ParsedMessage;
pub use publisher::Publisher;
pub use rate_limiter::RateLimiter;
pub use subscription::{
    ConsumerHandle, DataFeed, MultiConnectionSubscriptionManager, Resolution, SubscriptionConfig,
    SubscriptionKey, SubscriptionManagerConfig, TickType,
};
pub use symbol::{IdentityResolver, SecurityType, Symbol, SymbolMap, SymbolResolver};
pub use transport::{ConnectionFactory, SlotId, WebSocketFactory};
pub use venue::{BinanceProtocol, StreamingVenue, VenueConfig};

/// Application state shared across components
pub struct AppState {
    pub multiplexer: Arc<SubscriptionMultiplexer>,
    pub venue: Arc<StreamingVenue>,
    pub publisher: Arc<Publisher>,
    pub config: Arc<Config>,
}
