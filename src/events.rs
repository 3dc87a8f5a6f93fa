//! Decoded events delivered to consumers

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::symbol::Symbol;

/// Executed trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeTick {
    pub symbol: Symbol,
    pub trade_id: u64,
    pub price: Decimal,
    pub quantity: Decimal,
    pub time: DateTime<Utc>,
}

/// Best bid/ask update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteTick {
    pub symbol: Symbol,
    pub update_id: u64,
    pub bid_price: Decimal,
    pub bid_size: Decimal,
    pub ask_price: Decimal,
    pub ask_size: Decimal,
}

/// Market data event carried by a feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MarketEvent {
    Trade(TradeTick),
    Quote(QuoteTick),
}

impl MarketEvent {
    pub fn symbol(&self) -> &Symbol {
        match self {
            MarketEvent::Trade(trade) => &trade.symbol,
            MarketEvent::Quote(quote) => &quote.symbol,
        }
    }
}

/// Severity of an operator-facing message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Information,
    Warning,
    Error,
}

/// Operator-facing notification (reconnects, protocol warnings, exhausted retries)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerageMessage {
    pub kind: MessageKind,
    pub code: String,
    pub message: String,
}

impl BrokerageMessage {
    pub fn information(code: &str, message: impl Into<String>) -> Self {
        Self::new(MessageKind::Information, code, message)
    }

    pub fn warning(code: &str, message: impl Into<String>) -> Self {
        Self::new(MessageKind::Warning, code, message)
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::new(MessageKind::Error, code, message)
    }

    fn new(kind: MessageKind, code: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Write the message to the log at the level matching its kind
    pub fn log(&self) {
        match self.kind {
            MessageKind::Information => info!(code = %self.code, "{}", self.message),
            MessageKind::Warning => warn!(code = %self.code, "{}", self.message),
            MessageKind::Error => error!(code = %self.code, "{}", self.message),
        }
    }
}
