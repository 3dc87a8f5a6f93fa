//! Prometheus metrics for the connectivity layer

use prometheus::{register_int_counter, register_int_gauge, Encoder, IntCounter, IntGauge, TextEncoder};
use std::sync::LazyLock;

use crate::error::{MarketDataError, Result};

pub static OPEN_CONNECTIONS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("connectivity_open_connections", "Connections currently open")
        .expect("open connections gauge registers once")
});

pub static SUBSCRIBED_SYMBOLS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!(
        "connectivity_subscribed_symbols",
        "Symbols assigned to a connection slot"
    )
    .expect("subscribed symbols gauge registers once")
});

pub static RECONNECTS: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("connectivity_reconnects_total", "Reconnect attempts")
        .expect("reconnect counter registers once")
});

pub static FRAMES_SENT: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "connectivity_frames_sent_total",
        "Subscribe and unsubscribe frames sent"
    )
    .expect("frames sent counter registers once")
});

pub static INBOUND_MESSAGES: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "connectivity_inbound_messages_total",
        "Inbound frames dispatched to the venue"
    )
    .expect("inbound messages counter registers once")
});

/// Encode the default registry in the text exposition format
pub fn render() -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| MarketDataError::SerializationError(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| MarketDataError::SerializationError(e.to_string()))
}
