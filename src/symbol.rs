//! Instrument identity and symbol mapping
//!
//! A `Symbol` is compared by value. Continuous/canonical aliases (e.g. `/ES`)
//! are resolved to the concrete contract they currently track through a
//! `SymbolResolver`; the mapping itself is owned by an external party.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Type of tradable instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SecurityType {
    Base,
    Equity,
    Option,
    Commodity,
    Forex,
    Future,
    Cfd,
    Crypto,
    FutureOption,
    Index,
    IndexOption,
    CryptoFuture,
}

/// Identity of a tradable instrument
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol {
    pub ticker: String,
    pub security_type: SecurityType,
    pub market: String,
}

impl Symbol {
    pub fn new(ticker: &str, security_type: SecurityType, market: &str) -> Self {
        Self {
            ticker: ticker.to_uppercase(),
            security_type,
            market: market.to_lowercase(),
        }
    }

    pub fn crypto(ticker: &str, market: &str) -> Self {
        Self::new(ticker, SecurityType::Crypto, market)
    }

    /// Canonical (continuous) symbols carry a leading `/`, e.g. `/ES`
    pub fn is_canonical(&self) -> bool {
        self.ticker.starts_with('/')
    }

    /// Universe selection pseudo-symbols never stream market data
    pub fn is_universe(&self) -> bool {
        self.ticker.contains("UNIVERSE")
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.ticker, self.market)
    }
}

/// Resolves a caller-visible symbol to the symbol actually streamed
pub trait SymbolResolver: Send + Sync {
    fn resolve(&self, symbol: &Symbol, as_of: DateTime<Utc>) -> Symbol;
}

/// Resolver for venues without continuous contracts
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityResolver;

impl SymbolResolver for IdentityResolver {
    fn resolve(&self, symbol: &Symbol, _as_of: DateTime<Utc>) -> Symbol {
        symbol.clone()
    }
}

/// Alias → concrete mapping that can be updated while subscriptions are live
///
/// Existing subscriptions keep the key they resolved to when they were
/// created; only later subscribe calls observe a remap.
#[derive(Debug, Default)]
pub struct SymbolMap {
    mappings: RwLock<HashMap<Symbol, Symbol>>,
}

impl SymbolMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point `alias` at `concrete`, returning the previous mapping
    pub fn map(&self, alias: Symbol, concrete: Symbol) -> Option<Symbol> {
        self.mappings.write().insert(alias, concrete)
    }

    pub fn unmap(&self, alias: &Symbol) -> Option<Symbol> {
        self.mappings.write().remove(alias)
    }

    pub fn mapped(&self, alias: &Symbol) -> Option<Symbol> {
        self.mappings.read().get(alias).cloned()
    }
}

impl SymbolResolver for SymbolMap {
    fn resolve(&self, symbol: &Symbol, _as_of: DateTime<Utc>) -> Symbol {
        self.mapped(symbol).unwrap_or_else(|| symbol.clone())
    }
}
