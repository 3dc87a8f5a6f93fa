//! Per-symbol weights from the venue's 24h ticker statistics
//!
//! The weight of a symbol is its trade count over the last 24 hours, so
//! busy symbols spread across connections instead of piling onto one.

use serde::Deserialize;
use std::collections::HashMap;
use tracing::info;

use crate::error::{MarketDataError, Result};
use crate::symbol::Symbol;

#[derive(Debug, Deserialize)]
struct TickerStats {
    symbol: String,
    #[serde(default)]
    count: i64,
}

/// Parse a 24h ticker statistics payload into weights (at least 1 each)
pub fn parse_symbol_weights(raw: &str, market: &str) -> Result<HashMap<Symbol, u64>> {
    let rows: Vec<TickerStats> = serde_json::from_str(raw)?;
    Ok(rows
        .into_iter()
        .map(|row| {
            let weight = u64::try_from(row.count).unwrap_or(0).max(1);
            (Symbol::crypto(&row.symbol, market), weight)
        })
        .collect())
}

/// Fetch weights for every symbol listed by the venue
pub async fn fetch_symbol_weights(
    client: &reqwest::Client,
    rest_endpoint: &str,
    market: &str,
) -> Result<HashMap<Symbol, u64>> {
    let url = format!("{}/ticker/24hr", rest_endpoint.trim_end_matches('/'));
    info!(url = %url, "Fetching symbol weights");

    let response = client.get(&url).send().await?;
    if !response.status().is_success() {
        return Err(MarketDataError::RestApiError(format!(
            "{} returned {}",
            url,
            response.status()
        )));
    }

    let body = response.text().await?;
    let weights = parse_symbol_weights(&body, market)?;
    info!(symbols = weights.len(), "Symbol weights loaded");
    Ok(weights)
}
