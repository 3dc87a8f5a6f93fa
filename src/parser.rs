//! Parser module for Binance WebSocket messages
//!
//! Handles deserialization of trades, book tickers, subscription results and
//! user data execution reports.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::str::FromStr;

use crate::events::{QuoteTick, TradeTick};
use crate::symbol::Symbol;

/// Binance trade message
#[derive(Debug, Clone, Deserialize)]
pub struct TradeMessage {
    /// Event time (milliseconds)
    #[serde(rename = "E")]
    pub event_time: u64,

    #[serde(rename = "s")]
    pub symbol: String,

    #[serde(rename = "t")]
    pub trade_id: u64,

    #[serde(rename = "p", deserialize_with = "deserialize_decimal")]
    pub price: Decimal,

    #[serde(rename = "q", deserialize_with = "deserialize_decimal")]
    pub quantity: Decimal,

    /// Trade time (milliseconds)
    #[serde(rename = "T")]
    pub trade_time: u64,

    #[serde(rename = "m", default)]
    pub is_buyer_maker: bool,
}

impl TradeMessage {
    pub fn to_tick(&self, market: &str) -> TradeTick {
        TradeTick {
            symbol: Symbol::crypto(&self.symbol, market),
            trade_id: self.trade_id,
            price: self.price,
            quantity: self.quantity,
            time: millis_to_utc(self.trade_time),
        }
    }
}

/// Binance best bid/ask message (no event type field)
#[derive(Debug, Clone, Deserialize)]
pub struct BookTickerMessage {
    #[serde(rename = "u")]
    pub update_id: u64,

    #[serde(rename = "s")]
    pub symbol: String,

    #[serde(rename = "b", deserialize_with = "deserialize_decimal")]
    pub bid_price: Decimal,

    #[serde(rename = "B", deserialize_with = "deserialize_decimal")]
    pub bid_size: Decimal,

    #[serde(rename = "a", deserialize_with = "deserialize_decimal")]
    pub ask_price: Decimal,

    #[serde(rename = "A", deserialize_with = "deserialize_decimal")]
    pub ask_size: Decimal,
}

impl BookTickerMessage {
    pub fn to_quote(&self, market: &str) -> QuoteTick {
        QuoteTick {
            symbol: Symbol::crypto(&self.symbol, market),
            update_id: self.update_id,
            bid_price: self.bid_price,
            bid_size: self.bid_size,
            ask_price: self.ask_price,
            ask_size: self.ask_size,
        }
    }
}

/// Binance user data stream order update
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionReport {
    #[serde(rename = "E")]
    pub event_time: u64,

    #[serde(rename = "s")]
    pub symbol: String,

    #[serde(rename = "c")]
    pub client_order_id: String,

    /// BUY or SELL
    #[serde(rename = "S")]
    pub side: String,

    /// Order type tag, e.g. LIMIT or STOP_LOSS_LIMIT
    #[serde(rename = "o")]
    pub order_type: String,

    #[serde(rename = "q", deserialize_with = "deserialize_decimal")]
    pub quantity: Decimal,

    #[serde(rename = "p", deserialize_with = "deserialize_decimal")]
    pub price: Decimal,

    #[serde(rename = "P", deserialize_with = "deserialize_decimal")]
    pub stop_price: Decimal,

    /// Execution type, e.g. NEW, TRADE, CANCELED
    #[serde(rename = "x")]
    pub execution_type: String,

    /// Order status, e.g. PARTIALLY_FILLED
    #[serde(rename = "X")]
    pub order_status: String,

    /// Broker-assigned order id
    #[serde(rename = "i")]
    pub order_id: u64,

    /// Last executed quantity
    #[serde(rename = "l", deserialize_with = "deserialize_decimal")]
    pub last_quantity: Decimal,

    /// Last executed price
    #[serde(rename = "L", deserialize_with = "deserialize_decimal")]
    pub last_price: Decimal,

    /// Transaction time
    #[serde(rename = "T")]
    pub transaction_time: u64,
}

impl ExecutionReport {
    pub fn broker_id(&self) -> String {
        self.order_id.to_string()
    }

    pub fn time(&self) -> DateTime<Utc> {
        millis_to_utc(self.transaction_time)
    }
}

/// Error body of a rejected subscription request
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RequestError {
    pub code: i64,
    pub msg: String,
}

/// Reply to a SUBSCRIBE/UNSUBSCRIBE request
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionResult {
    pub id: u64,

    #[serde(default)]
    pub result: Option<Value>,

    #[serde(default)]
    pub error: Option<RequestError>,
}

/// Combined stream message wrapper
#[derive(Debug, Clone, Deserialize)]
pub struct StreamMessage {
    /// Stream name
    pub stream: String,

    /// Data payload
    pub data: Value,
}

/// Parsed WebSocket message
#[derive(Debug, Clone)]
pub enum ParsedMessage {
    Trade(TradeMessage),
    BookTicker(BookTickerMessage),
    ExecutionReport(ExecutionReport),
    SubscriptionResult(SubscriptionResult),
    Unknown(String),
}

impl ParsedMessage {
    /// Parse a raw WebSocket message
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(raw)?;

        // Combined streams wrap the payload
        if value.get("stream").is_some() && value.get("data").is_some() {
            let stream_msg: StreamMessage = serde_json::from_value(value)?;
            return Self::parse_value(stream_msg.data);
        }

        Self::parse_value(value)
    }

    fn parse_value(value: Value) -> Result<Self, serde_json::Error> {
        if let Some(event_type) = value.get("e").and_then(Value::as_str) {
            return match event_type {
                "trade" => Ok(ParsedMessage::Trade(serde_json::from_value(value)?)),
                "executionReport" => {
                    Ok(ParsedMessage::ExecutionReport(serde_json::from_value(value)?))
                }
                _ => Ok(ParsedMessage::Unknown(value.to_string())),
            };
        }

        if value.get("id").is_some()
            && (value.get("result").is_some() || value.get("error").is_some())
        {
            return Ok(ParsedMessage::SubscriptionResult(serde_json::from_value(
                value,
            )?));
        }

        if ["u", "s", "b", "a"].iter().all(|field| value.get(field).is_some()) {
            return Ok(ParsedMessage::BookTicker(serde_json::from_value(value)?));
        }

        Ok(ParsedMessage::Unknown(value.to_string()))
    }
}

fn millis_to_utc(millis: u64) -> DateTime<Utc> {
    i64::try_from(millis)
        .ok()
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
        .unwrap_or_else(Utc::now)
}

/// Custom deserializer for Decimal from string
fn deserialize_decimal<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Decimal::from_str(&s).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trade() {
        let raw = r#"{
            "e": "trade",
            "E": 1672531200000,
            "s": "BTCUSDT",
            "t": 12345,
            "p": "50000.50",
            "q": "0.5",
            "T": 1672531200000,
            "m": false
        }"#;

        let msg = ParsedMessage::parse(raw).unwrap();
        if let ParsedMessage::Trade(trade) = msg {
            assert_eq!(trade.symbol, "BTCUSDT");
            assert_eq!(trade.price, Decimal::from_str("50000.50").unwrap());
            assert!(!trade.is_buyer_maker);

            let tick = trade.to_tick("binance");
            assert_eq!(tick.symbol, Symbol::crypto("BTCUSDT", "binance"));
            assert_eq!(tick.time.timestamp_millis(), 1672531200000);
        } else {
            panic!("Expected Trade");
        }
    }

    #[test]
    fn test_parse_book_ticker() {
        let raw = r#"{"u":400900217,"s":"BNBUSDT","b":"25.35190000","B":"31.21000000","a":"25.36520000","A":"40.66000000"}"#;

        match ParsedMessage::parse(raw).unwrap() {
            ParsedMessage::BookTicker(ticker) => {
                let quote = ticker.to_quote("binance");
                assert_eq!(quote.update_id, 400900217);
                assert_eq!(quote.bid_price, Decimal::from_str("25.3519").unwrap());
                assert_eq!(quote.ask_size, Decimal::from_str("40.66").unwrap());
            }
            other => panic!("Expected BookTicker, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_combined_stream() {
        let raw = r#"{"stream":"btcusdt@bookTicker","data":{"u":1,"s":"BTCUSDT","b":"1.0","B":"2.0","a":"1.1","A":"3.0"}}"#;
        assert!(matches!(
            ParsedMessage::parse(raw).unwrap(),
            ParsedMessage::BookTicker(_)
        ));
    }

    #[test]
    fn test_parse_subscription_results() {
        match ParsedMessage::parse(r#"{"result":null,"id":3}"#).unwrap() {
            ParsedMessage::SubscriptionResult(result) => {
                assert_eq!(result.id, 3);
                assert!(result.error.is_none());
            }
            other => panic!("Expected SubscriptionResult, got {:?}", other),
        }

        match ParsedMessage::parse(r#"{"error":{"code":2,"msg":"Invalid request"},"id":4}"#).unwrap() {
            ParsedMessage::SubscriptionResult(result) => {
                assert_eq!(
                    result.error,
                    Some(RequestError {
                        code: 2,
                        msg: "Invalid request".to_string()
                    })
                );
            }
            other => panic!("Expected SubscriptionResult, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_execution_report() {
        let raw = r#"{
            "e": "executionReport", "E": 1499405658658, "s": "ETHBTC",
            "c": "mUvoqJxFIILMdfAW5iGSOW", "S": "BUY", "o": "LIMIT", "f": "GTC",
            "q": "1.00000000", "p": "0.10264410", "P": "0.00000000",
            "x": "TRADE", "X": "PARTIALLY_FILLED", "r": "NONE", "i": 4293153,
            "l": "0.25000000", "L": "0.10264410", "T": 1499405658657
        }"#;

        match ParsedMessage::parse(raw).unwrap() {
            ParsedMessage::ExecutionReport(report) => {
                assert_eq!(report.broker_id(), "4293153");
                assert_eq!(report.order_type, "LIMIT");
                assert_eq!(report.order_status, "PARTIALLY_FILLED");
                assert_eq!(report.last_quantity, Decimal::from_str("0.25").unwrap());
            }
            other => panic!("Expected ExecutionReport, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_and_malformed() {
        assert!(matches!(
            ParsedMessage::parse(r#"{"e":"outboundAccountPosition","E":1}"#).unwrap(),
            ParsedMessage::Unknown(_)
        ));
        assert!(ParsedMessage::parse("not json").is_err());
        // Known event type with a broken field
        assert!(ParsedMessage::parse(r#"{"e":"trade","s":"BTCUSDT"}"#).is_err());
    }
}
