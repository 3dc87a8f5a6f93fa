//! Composite front for several underlying data sources
//!
//! A caller subscription is resolved through the active symbol mapping to a
//! [`SubscriptionKey`]. Callers sharing a key share one underlying
//! subscription; the table tracks how many and which caller configs hold it,
//! and the underlying unsubscribe is issued when the last one leaves.
//!
//! The key is fixed at subscribe time. A remapping that happens later does
//! not migrate live subscriptions; unsubscribe uses the key recorded for the
//! caller config.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{MarketDataError, Result};
use crate::subscription::{ConsumerHandle, DataFeed, SubscriptionConfig, SubscriptionKey};
use crate::symbol::{IdentityResolver, SecurityType, Symbol, SymbolResolver};

/// Underlying subscription-capable source
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Start streaming `config`; `None` when the source cannot serve it
    async fn subscribe(&self, config: &SubscriptionConfig) -> Result<Option<DataFeed>>;

    async fn unsubscribe(&self, config: &SubscriptionConfig) -> Result<()>;

    fn is_connected(&self) -> bool;

    fn has_universe_provider(&self) -> bool {
        false
    }

    fn lookup_symbols(&self, symbol: &Symbol, include_expired: bool) -> Result<Vec<Symbol>> {
        let _ = include_expired;
        Err(MarketDataError::NotSupported(format!(
            "symbol lookup for {}",
            symbol
        )))
    }

    fn can_perform_selection(&self) -> Result<bool> {
        Err(MarketDataError::NotSupported("universe selection".into()))
    }
}

struct Route {
    security_type: SecurityType,
    market: Option<String>,
    source: Arc<dyn DataSource>,
}

struct Entry {
    count: usize,
    owners: HashSet<SubscriptionConfig>,
    source: Arc<dyn DataSource>,
    /// Request issued to the source, carrying the resolved symbol
    underlying: SubscriptionConfig,
    feed: DataFeed,
}

#[derive(Default)]
struct ReferenceTable {
    entries: HashMap<SubscriptionKey, Entry>,
    /// Key each live caller config was registered under
    owners: HashMap<SubscriptionConfig, SubscriptionKey>,
}

#[derive(Default)]
pub struct SubscriptionMultiplexerBuilder {
    routes: Vec<Route>,
    default_source: Option<Arc<dyn DataSource>>,
    resolver: Option<Arc<dyn SymbolResolver>>,
}

impl SubscriptionMultiplexerBuilder {
    /// Serve `security_type` (optionally only on `market`) from `source`
    pub fn route(
        mut self,
        security_type: SecurityType,
        market: Option<&str>,
        source: Arc<dyn DataSource>,
    ) -> Self {
        self.routes.push(Route {
            security_type,
            market: market.map(str::to_lowercase),
            source,
        });
        self
    }

    /// Source used when no route applies more specifically
    pub fn default_source(mut self, source: Arc<dyn DataSource>) -> Self {
        self.default_source = Some(source);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn SymbolResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn build(self) -> SubscriptionMultiplexer {
        SubscriptionMultiplexer {
            routes: self.routes,
            default_source: self.default_source,
            resolver: self
                .resolver
                .unwrap_or_else(|| Arc::new(IdentityResolver)),
            table: Mutex::new(ReferenceTable::default()),
        }
    }
}

/// Reference-counting fan-out over the configured sources
pub struct SubscriptionMultiplexer {
    routes: Vec<Route>,
    default_source: Option<Arc<dyn DataSource>>,
    resolver: Arc<dyn SymbolResolver>,
    table: Mutex<ReferenceTable>,
}

impl SubscriptionMultiplexer {
    pub fn builder() -> SubscriptionMultiplexerBuilder {
        SubscriptionMultiplexerBuilder::default()
    }

    /// Subscribe a caller config
    ///
    /// Returns a consumer of the shared stream, or `None` when no source can
    /// serve the symbol. Registering the same config twice fails with
    /// `DuplicateSubscription`.
    pub async fn subscribe(&self, config: &SubscriptionConfig) -> Result<Option<ConsumerHandle>> {
        let mut guard = self.table.lock().await;
        let table = &mut *guard;

        if table.owners.contains_key(config) {
            return Err(MarketDataError::DuplicateSubscription(config.to_string()));
        }

        let key = SubscriptionKey::resolve(config, self.resolver.as_ref(), Utc::now());

        if let Some(entry) = table.entries.get_mut(&key) {
            entry.count += 1;
            entry.owners.insert(config.clone());
            table.owners.insert(config.clone(), key.clone());
            debug!(subscription = %config, key = %key, count = entry.count, "Joined existing subscription");
            return Ok(Some(entry.feed.consumer(config.clone())));
        }

        let underlying = key.to_config();
        for source in self.candidates(&config.symbol) {
            let Some(feed) = source.subscribe(&underlying).await? else {
                continue;
            };

            let consumer = feed.consumer(config.clone());
            table.entries.insert(
                key.clone(),
                Entry {
                    count: 1,
                    owners: HashSet::from([config.clone()]),
                    source,
                    underlying,
                    feed,
                },
            );
            table.owners.insert(config.clone(), key.clone());
            info!(subscription = %config, key = %key, "Underlying subscription added");
            return Ok(Some(consumer));
        }

        debug!(subscription = %config, "No source serves symbol");
        Ok(None)
    }

    /// Drop a caller config; returns false when it was not registered
    pub async fn unsubscribe(&self, config: &SubscriptionConfig) -> Result<bool> {
        let mut guard = self.table.lock().await;
        let table = &mut *guard;

        let Some(key) = table.owners.remove(config) else {
            return Ok(false);
        };
        let Some(entry) = table.entries.get_mut(&key) else {
            return Ok(false);
        };

        entry.owners.remove(config);
        entry.count = entry.count.saturating_sub(1);
        debug_assert_eq!(entry.count, entry.owners.len());

        if entry.count > 0 {
            debug!(subscription = %config, key = %key, count = entry.count, "Reference released");
            return Ok(true);
        }

        if let Some(entry) = table.entries.remove(&key) {
            if let Err(e) = entry.source.unsubscribe(&entry.underlying).await {
                warn!(key = %key, error = %e, "Underlying unsubscribe failed");
                return Err(e);
            }
            info!(key = %key, "Underlying subscription removed");
        }
        Ok(true)
    }

    /// Live caller subscriptions sharing `key`
    pub async fn reference_count(&self, key: &SubscriptionKey) -> usize {
        self.table
            .lock()
            .await
            .entries
            .get(key)
            .map_or(0, |entry| entry.count)
    }

    /// Caller configs currently holding `key`
    pub async fn owners(&self, key: &SubscriptionKey) -> Vec<SubscriptionConfig> {
        self.table
            .lock()
            .await
            .entries
            .get(key)
            .map(|entry| entry.owners.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn subscription_count(&self) -> usize {
        self.table.lock().await.entries.len()
    }

    /// True only when every configured source is connected
    pub fn is_connected(&self) -> bool {
        self.sources().iter().all(|source| source.is_connected())
    }

    pub fn has_universe_provider(&self) -> bool {
        self.sources()
            .iter()
            .any(|source| source.has_universe_provider())
    }

    pub fn lookup_symbols(&self, symbol: &Symbol, include_expired: bool) -> Result<Vec<Symbol>> {
        match self.universe_provider() {
            Some(source) => source.lookup_symbols(symbol, include_expired),
            None => Err(MarketDataError::NotSupported(
                "no configured source provides symbol lookup".into(),
            )),
        }
    }

    pub fn can_perform_selection(&self) -> Result<bool> {
        match self.universe_provider() {
            Some(source) => source.can_perform_selection(),
            None => Err(MarketDataError::NotSupported(
                "no configured source provides universe selection".into(),
            )),
        }
    }

    /// Release every underlying subscription
    pub async fn dispose(&self) {
        let mut table = self.table.lock().await;
        table.owners.clear();
        for (key, entry) in table.entries.drain() {
            if let Err(e) = entry.source.unsubscribe(&entry.underlying).await {
                warn!(key = %key, error = %e, "Underlying unsubscribe failed during dispose");
            }
        }
        info!("Subscription multiplexer disposed");
    }

    /// Sources able to serve `symbol`, most specific first
    fn candidates(&self, symbol: &Symbol) -> Vec<Arc<dyn DataSource>> {
        let exact = self.routes.iter().filter(|route| {
            route.security_type == symbol.security_type
                && route.market.as_deref() == Some(symbol.market.as_str())
        });
        let any_market = self
            .routes
            .iter()
            .filter(|route| route.security_type == symbol.security_type && route.market.is_none());

        exact
            .chain(any_market)
            .map(|route| Arc::clone(&route.source))
            .chain(self.default_source.iter().cloned())
            .collect()
    }

    /// Every distinct configured source
    fn sources(&self) -> Vec<Arc<dyn DataSource>> {
        let mut sources: Vec<Arc<dyn DataSource>> = Vec::new();
        let all = self
            .routes
            .iter()
            .map(|route| &route.source)
            .chain(self.default_source.iter());
        for source in all {
            if !sources.iter().any(|known| Arc::ptr_eq(known, source)) {
                sources.push(Arc::clone(source));
            }
        }
        sources
    }

    fn universe_provider(&self) -> Option<Arc<dyn DataSource>> {
        self.sources()
            .into_iter()
            .find(|source| source.has_universe_provider())
    }
}
