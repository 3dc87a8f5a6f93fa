//! Configuration for the connectivity layer
//!
//! Read from environment variables, optionally seeded from a `.env` file.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{MarketDataError, Result};
use crate::subscription::{EmptySlotPolicy, ReconnectPolicy, SubscriptionManagerConfig};
use crate::symbol::Symbol;
use crate::venue::VenueConfig;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Symbols the binary subscribes to (trades and quotes)
    pub symbols: Vec<String>,

    /// Market identifier of the streaming venue
    pub market: String,

    pub ws_endpoint: String,

    /// REST endpoint, used for symbol weights
    pub rest_endpoint: String,

    /// IPC socket path for publishing data
    pub ipc_socket_path: String,

    /// Connection pool limits
    pub max_symbols_per_connection: usize,
    pub max_connections: usize,
    pub connection_capacity: Option<u64>,
    pub connection_lifetime_secs: u64,

    /// Outbound frame rate
    pub rate_limit_permits: u32,
    pub rate_limit_window_ms: u64,

    pub connect_timeout_ms: u64,

    /// Reconnection settings
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,

    pub empty_slot_policy: EmptySlotPolicy,
    pub keep_alive_interval_secs: u64,
    pub feed_capacity: usize,
    pub fetch_symbol_weights: bool,
    pub health_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            market: "binance".to_string(),
            ws_endpoint: "wss://stream.binance.com:9443/ws".to_string(),
            rest_endpoint: "https://api.binance.com/api/v3".to_string(),
            ipc_socket_path: "/tmp/orpflow-connectivity.sock".to_string(),
            max_symbols_per_connection: 512,
            max_connections: 0,
            connection_capacity: None,
            connection_lifetime_secs: 23 * 3600 + 45 * 60,
            rate_limit_permits: 1,
            rate_limit_window_ms: 330,
            connect_timeout_ms: 10_000,
            reconnect_delay_ms: 1000,
            max_reconnect_delay_ms: 60_000,
            max_reconnect_attempts: 10,
            empty_slot_policy: EmptySlotPolicy::Close,
            keep_alive_interval_secs: 30 * 60,
            feed_capacity: 1024,
            fetch_symbol_weights: false,
            health_port: 9090,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup, falling back to defaults for missing keys
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let symbols = match lookup("SYMBOLS") {
            Some(raw) => raw
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect(),
            None => defaults.symbols,
        };

        let config = Self {
            symbols,
            market: lookup("MARKET")
                .map(|m| m.trim().to_lowercase())
                .unwrap_or(defaults.market),
            ws_endpoint: lookup("WS_ENDPOINT").unwrap_or(defaults.ws_endpoint),
            rest_endpoint: lookup("REST_ENDPOINT").unwrap_or(defaults.rest_endpoint),
            ipc_socket_path: lookup("IPC_SOCKET_PATH").unwrap_or(defaults.ipc_socket_path),
            max_symbols_per_connection: parse_or(
                &lookup,
                "MAX_SYMBOLS_PER_CONNECTION",
                defaults.max_symbols_per_connection,
            )?,
            max_connections: parse_or(&lookup, "MAX_CONNECTIONS", defaults.max_connections)?,
            connection_capacity: match lookup("CONNECTION_CAPACITY") {
                Some(raw) => Some(parse_value("CONNECTION_CAPACITY", &raw)?),
                None => None,
            },
            connection_lifetime_secs: parse_or(
                &lookup,
                "CONNECTION_LIFETIME_SECS",
                defaults.connection_lifetime_secs,
            )?,
            rate_limit_permits: parse_or(&lookup, "RATE_LIMIT_PERMITS", defaults.rate_limit_permits)?,
            rate_limit_window_ms: parse_or(
                &lookup,
                "RATE_LIMIT_WINDOW_MS",
                defaults.rate_limit_window_ms,
            )?,
            connect_timeout_ms: parse_or(&lookup, "CONNECT_TIMEOUT_MS", defaults.connect_timeout_ms)?,
            reconnect_delay_ms: parse_or(&lookup, "RECONNECT_DELAY_MS", defaults.reconnect_delay_ms)?,
            max_reconnect_delay_ms: parse_or(
                &lookup,
                "MAX_RECONNECT_DELAY_MS",
                defaults.max_reconnect_delay_ms,
            )?,
            max_reconnect_attempts: parse_or(
                &lookup,
                "MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            )?,
            empty_slot_policy: match lookup("EMPTY_SLOT_POLICY") {
                Some(raw) => raw.parse()?,
                None => defaults.empty_slot_policy,
            },
            keep_alive_interval_secs: parse_or(
                &lookup,
                "KEEP_ALIVE_INTERVAL_SECS",
                defaults.keep_alive_interval_secs,
            )?,
            feed_capacity: parse_or(&lookup, "FEED_CAPACITY", defaults.feed_capacity)?,
            fetch_symbol_weights: parse_or(
                &lookup,
                "FETCH_SYMBOL_WEIGHTS",
                defaults.fetch_symbol_weights,
            )?,
            health_port: parse_or(&lookup, "HEALTH_PORT", defaults.health_port)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            return Err(MarketDataError::ConfigError("SYMBOLS is empty".into()));
        }
        if self.max_symbols_per_connection == 0 {
            return Err(MarketDataError::ConfigError(
                "MAX_SYMBOLS_PER_CONNECTION must be positive".into(),
            ));
        }
        if self.rate_limit_permits == 0 {
            return Err(MarketDataError::ConfigError(
                "RATE_LIMIT_PERMITS must be positive".into(),
            ));
        }
        if self.connection_capacity == Some(0) {
            return Err(MarketDataError::ConfigError(
                "CONNECTION_CAPACITY must be positive when set".into(),
            ));
        }
        Ok(())
    }

    /// Configured symbols as crypto symbols of the configured market
    pub fn symbols(&self) -> Vec<Symbol> {
        self.symbols
            .iter()
            .map(|ticker| Symbol::crypto(ticker, &self.market))
            .collect()
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }

    pub fn manager_config(&self) -> SubscriptionManagerConfig {
        SubscriptionManagerConfig {
            endpoint: self.ws_endpoint.clone(),
            max_symbols_per_connection: self.max_symbols_per_connection,
            max_connections: self.max_connections,
            connection_capacity: self.connection_capacity,
            connection_lifetime: Duration::from_secs(self.connection_lifetime_secs),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            reconnect: ReconnectPolicy {
                initial_delay: Duration::from_millis(self.reconnect_delay_ms),
                max_delay: Duration::from_millis(self.max_reconnect_delay_ms),
                max_attempts: self.max_reconnect_attempts,
            },
            empty_slot_policy: self.empty_slot_policy,
        }
    }

    pub fn venue_config(&self) -> VenueConfig {
        VenueConfig {
            market: self.market.clone(),
            feed_capacity: self.feed_capacity,
            keep_alive_interval: Duration::from_secs(self.keep_alive_interval_secs),
            manager: self.manager_config(),
        }
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| MarketDataError::ConfigError(format!("Invalid value for {}: {}", key, raw)))
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}
