//! Subscription requests, the connection pool that serves them, and feeds
//!
//! - `plan`: pure bin-packing of symbols onto connection slots
//! - `manager`: pool of persistent connections applying the plan
//! - `feed`: fan-out of one data stream to independent consumers

pub mod feed;
pub mod manager;
pub mod plan;

pub use feed::{ConsumerHandle, DataFeed};
pub use manager::{
    EmptySlotPolicy, MessageSink, MultiConnectionSubscriptionManager, ReconnectPolicy,
    SlotSnapshot, SubscriptionManagerBuilder, SubscriptionManagerConfig, SubscriptionProtocol,
};
pub use plan::{Assignment, PlanLimits, SlotLoad};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::symbol::{Symbol, SymbolResolver};

/// Kind of data requested for a symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TickType {
    Trade,
    Quote,
    OpenInterest,
}

/// Bar resolution requested by the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Resolution {
    Tick,
    Second,
    Minute,
    Hour,
    Daily,
}

/// Caller-visible subscription request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    pub symbol: Symbol,
    pub tick_type: TickType,
    pub resolution: Resolution,
}

impl SubscriptionConfig {
    pub fn new(symbol: Symbol, tick_type: TickType, resolution: Resolution) -> Self {
        Self {
            symbol,
            tick_type,
            resolution,
        }
    }

    pub fn trades(symbol: Symbol) -> Self {
        Self::new(symbol, TickType::Trade, Resolution::Tick)
    }

    pub fn quotes(symbol: Symbol) -> Self {
        Self::new(symbol, TickType::Quote, Resolution::Tick)
    }
}

impl fmt::Display for SubscriptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}:{:?}", self.symbol, self.tick_type, self.resolution)
    }
}

/// Identity used for reference counting: the request after symbol mapping
///
/// An alias and the concrete contract it maps to produce the same key and
/// therefore share one underlying subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub symbol: Symbol,
    pub tick_type: TickType,
    pub resolution: Resolution,
}

impl SubscriptionKey {
    pub fn resolve(
        config: &SubscriptionConfig,
        resolver: &dyn SymbolResolver,
        as_of: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: resolver.resolve(&config.symbol, as_of),
            tick_type: config.tick_type,
            resolution: config.resolution,
        }
    }

    /// The request issued to the underlying source
    pub fn to_config(&self) -> SubscriptionConfig {
        SubscriptionConfig::new(self.symbol.clone(), self.tick_type, self.resolution)
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}:{:?}", self.symbol, self.tick_type, self.resolution)
    }
}
