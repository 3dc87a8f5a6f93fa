//! Orders, broker id cache and the execution gateway seam

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{MarketDataError, Result};
use crate::symbol::Symbol;

/// Closed set of order shapes the venue accepts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit { limit_price: Decimal },
    StopMarket { stop_price: Decimal },
    StopLimit { stop_price: Decimal, limit_price: Decimal },
}

impl OrderType {
    /// Decode the venue's order type tag
    pub fn from_wire(tag: &str, price: Decimal, stop_price: Decimal) -> Result<Self> {
        match tag {
            "MARKET" => Ok(OrderType::Market),
            "LIMIT" | "LIMIT_MAKER" => Ok(OrderType::Limit { limit_price: price }),
            "STOP_LOSS" | "TAKE_PROFIT" => Ok(OrderType::StopMarket { stop_price }),
            "STOP_LOSS_LIMIT" | "TAKE_PROFIT_LIMIT" => Ok(OrderType::StopLimit {
                stop_price,
                limit_price: price,
            }),
            other => Err(MarketDataError::UnsupportedOrderType(other.to_string())),
        }
    }

    pub fn wire_tag(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit { .. } => "LIMIT",
            OrderType::StopMarket { .. } => "STOP_LOSS",
            OrderType::StopLimit { .. } => "STOP_LOSS_LIMIT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    Submitted,
    PartiallyFilled,
    Filled,
    Canceled,
    Invalid,
}

impl OrderStatus {
    /// Decode the venue's execution status tag
    pub fn from_wire(tag: &str) -> Option<Self> {
        match tag {
            "NEW" => Some(OrderStatus::Submitted),
            "PARTIALLY_FILLED" => Some(OrderStatus::PartiallyFilled),
            "FILLED" => Some(OrderStatus::Filled),
            "CANCELED" | "EXPIRED" | "PENDING_CANCEL" => Some(OrderStatus::Canceled),
            "REJECTED" => Some(OrderStatus::Invalid),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Invalid
        )
    }
}

/// Order as tracked by the platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub symbol: Symbol,
    /// Signed: positive buys, negative sells
    pub quantity: Decimal,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub broker_ids: Vec<String>,
    pub time: DateTime<Utc>,
}

impl Order {
    pub fn new(id: u64, symbol: Symbol, quantity: Decimal, order_type: OrderType) -> Self {
        Self {
            id,
            symbol,
            quantity,
            order_type,
            status: OrderStatus::New,
            broker_ids: Vec::new(),
            time: Utc::now(),
        }
    }

    pub fn side(&self) -> &'static str {
        if self.quantity.is_sign_negative() {
            "SELL"
        } else {
            "BUY"
        }
    }
}

/// Outcome of a placement request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub accepted: bool,
    pub broker_id: Option<String>,
}

/// Change of an order reported by the venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub order_id: u64,
    pub broker_id: String,
    pub symbol: Symbol,
    pub status: OrderStatus,
    pub fill_quantity: Decimal,
    pub fill_price: Decimal,
    pub time: DateTime<Utc>,
}

/// Order event delivered to consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderEvent {
    Update(OrderUpdate),
    UnsupportedOrderType { broker_id: String, tag: String },
}

/// Internal order id to last known broker ids
///
/// Written by the placement path and read by the acknowledgement path; both
/// go through the ordered handler's exclusive section, so an acknowledgement
/// never observes a placement half-recorded.
#[derive(Debug, Default)]
pub struct CachedOrderIds {
    orders: Mutex<HashMap<u64, Order>>,
}

impl CachedOrderIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted placement: replace the broker ids of a known order,
    /// insert an unknown one with the given id
    pub fn record_submission(&self, order: &Order, broker_id: &str) {
        let mut orders = self.orders.lock();
        let entry = orders.entry(order.id).or_insert_with(|| order.clone());
        entry.broker_ids.clear();
        entry.broker_ids.push(broker_id.to_string());
        entry.status = OrderStatus::Submitted;
    }

    pub fn find_by_broker_id(&self, broker_id: &str) -> Option<Order> {
        self.orders
            .lock()
            .values()
            .find(|order| order.broker_ids.iter().any(|id| id == broker_id))
            .cloned()
    }

    /// Apply a status change; terminal orders leave the cache
    pub fn update_status(&self, order_id: u64, status: OrderStatus) -> Option<Order> {
        let mut orders = self.orders.lock();
        let order = orders.get_mut(&order_id)?;
        order.status = status;
        let updated = order.clone();
        if status.is_terminal() {
            orders.remove(&order_id);
        }
        Some(updated)
    }

    pub fn remove(&self, order_id: u64) -> Option<Order> {
        self.orders.lock().remove(&order_id)
    }

    pub fn get(&self, order_id: u64) -> Option<Order> {
        self.orders.lock().get(&order_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.orders.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.lock().is_empty()
    }
}

/// Request/response order execution channel of a venue
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn place_order(&self, order: &Order) -> Result<Submission>;

    async fn cancel_order(&self, order: &Order) -> Result<bool>;

    /// Extend the venue session; called periodically once ready
    async fn keep_alive(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order(id: u64) -> Order {
        Order::new(
            id,
            Symbol::crypto("BTCUSDT", "binance"),
            dec!(0.5),
            OrderType::Limit {
                limit_price: dec!(42000),
            },
        )
    }

    #[test]
    fn test_order_type_tags() {
        let price = dec!(100);
        let stop = dec!(95);
        assert_eq!(OrderType::from_wire("MARKET", price, stop).unwrap(), OrderType::Market);
        assert_eq!(
            OrderType::from_wire("LIMIT_MAKER", price, stop).unwrap(),
            OrderType::Limit { limit_price: price }
        );
        assert_eq!(
            OrderType::from_wire("TAKE_PROFIT", price, stop).unwrap(),
            OrderType::StopMarket { stop_price: stop }
        );
        assert_eq!(
            OrderType::from_wire("STOP_LOSS_LIMIT", price, stop).unwrap(),
            OrderType::StopLimit {
                stop_price: stop,
                limit_price: price
            }
        );

        for order_type in [
            OrderType::Market,
            OrderType::Limit { limit_price: price },
            OrderType::StopMarket { stop_price: stop },
            OrderType::StopLimit {
                stop_price: stop,
                limit_price: price,
            },
        ] {
            assert_eq!(
                OrderType::from_wire(order_type.wire_tag(), price, stop).unwrap(),
                order_type
            );
        }

        let err = OrderType::from_wire("TRAILING_STOP", price, stop).unwrap_err();
        assert!(matches!(err, MarketDataError::UnsupportedOrderType(tag) if tag == "TRAILING_STOP"));
    }

    #[test]
    fn test_submission_replaces_broker_ids() {
        let cache = CachedOrderIds::new();
        let order = order(7);

        cache.record_submission(&order, "b-1");
        cache.record_submission(&order, "b-2");

        let cached = cache.get(7).unwrap();
        assert_eq!(cached.broker_ids, vec!["b-2".to_string()]);
        assert_eq!(cached.status, OrderStatus::Submitted);
        assert!(cache.find_by_broker_id("b-1").is_none());
        assert_eq!(cache.find_by_broker_id("b-2").unwrap().id, 7);
    }

    #[test]
    fn test_terminal_status_evicts() {
        let cache = CachedOrderIds::new();
        cache.record_submission(&order(1), "b-1");

        let partial = cache.update_status(1, OrderStatus::PartiallyFilled).unwrap();
        assert_eq!(partial.status, OrderStatus::PartiallyFilled);
        assert_eq!(cache.len(), 1);

        let filled = cache.update_status(1, OrderStatus::Filled).unwrap();
        assert_eq!(filled.status, OrderStatus::Filled);
        assert!(cache.is_empty());
        assert!(cache.update_status(1, OrderStatus::Canceled).is_none());
    }

    #[test]
    fn test_status_tags() {
        assert_eq!(OrderStatus::from_wire("NEW"), Some(OrderStatus::Submitted));
        assert_eq!(OrderStatus::from_wire("EXPIRED"), Some(OrderStatus::Canceled));
        assert_eq!(OrderStatus::from_wire("TRADE"), None);
        assert!(OrderStatus::Invalid.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn test_side_follows_quantity_sign() {
        let mut sell = order(3);
        sell.quantity = dec!(-1);
        assert_eq!(sell.side(), "SELL");
        assert_eq!(order(4).side(), "BUY");
    }
}
