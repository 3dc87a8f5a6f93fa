//! Reference counting and symbol mapping across data sources

mod common;

use chrono::Utc;
use rust_decimal_macros::dec;
use std::sync::Arc;

use common::{crypto, CountingSource};
use orp_flow_connectivity::error::MarketDataError;
use orp_flow_connectivity::events::{MarketEvent, TradeTick};
use orp_flow_connectivity::{
    IdentityResolver, SecurityType, SubscriptionConfig, SubscriptionKey, SubscriptionMultiplexer,
    Symbol, SymbolMap,
};

fn es_canonical() -> Symbol {
    Symbol::new("/ES", SecurityType::Future, "cme")
}

fn es_dec18() -> Symbol {
    Symbol::new("ESZ18", SecurityType::Future, "cme")
}

fn es_mar19() -> Symbol {
    Symbol::new("ESH19", SecurityType::Future, "cme")
}

fn key_for(config: &SubscriptionConfig) -> SubscriptionKey {
    SubscriptionKey::resolve(config, &IdentityResolver, Utc::now())
}

fn futures_multiplexer(source: &Arc<CountingSource>, map: &Arc<SymbolMap>) -> SubscriptionMultiplexer {
    SubscriptionMultiplexer::builder()
        .route(SecurityType::Future, Some("CME"), source.clone())
        .resolver(map.clone())
        .build()
}

fn trade(symbol: Symbol) -> MarketEvent {
    MarketEvent::Trade(TradeTick {
        symbol,
        trade_id: 1,
        price: dec!(2650.25),
        quantity: dec!(3),
        time: Utc::now(),
    })
}

#[tokio::test]
async fn test_alias_and_contract_share_one_subscription() {
    let source = CountingSource::new();
    let map = Arc::new(SymbolMap::new());
    map.map(es_canonical(), es_dec18());
    let multiplexer = futures_multiplexer(&source, &map);

    let alias = SubscriptionConfig::trades(es_canonical());
    let contract = SubscriptionConfig::trades(es_dec18());

    let mut alias_consumer = multiplexer.subscribe(&alias).await.unwrap().unwrap();
    let mut contract_consumer = multiplexer.subscribe(&contract).await.unwrap().unwrap();

    assert_eq!(source.subscribe_calls(&contract), 1);
    assert_eq!(source.total_subscribes(), 1);

    let key = key_for(&contract);
    assert_eq!(multiplexer.reference_count(&key).await, 2);
    let owners = multiplexer.owners(&key).await;
    assert!(owners.contains(&alias) && owners.contains(&contract));

    // Both consumers see the shared stream
    let event = trade(es_dec18());
    assert_eq!(source.feed(&contract).unwrap().publish(event.clone()), 2);
    assert_eq!(alias_consumer.recv().await, Some(event.clone()));
    assert_eq!(contract_consumer.try_recv(), Some(event));

    assert!(multiplexer.unsubscribe(&alias).await.unwrap());
    assert_eq!(source.total_unsubscribes(), 0);
    assert_eq!(multiplexer.reference_count(&key).await, 1);

    assert!(multiplexer.unsubscribe(&contract).await.unwrap());
    assert_eq!(source.unsubscribe_calls(&contract), 1);
    assert_eq!(multiplexer.reference_count(&key).await, 0);
    assert_eq!(multiplexer.subscription_count().await, 0);
}

#[tokio::test]
async fn test_release_order_does_not_matter() {
    let source = CountingSource::new();
    let map = Arc::new(SymbolMap::new());
    map.map(es_canonical(), es_dec18());
    let multiplexer = futures_multiplexer(&source, &map);

    let alias = SubscriptionConfig::trades(es_canonical());
    let contract = SubscriptionConfig::trades(es_dec18());

    multiplexer.subscribe(&contract).await.unwrap();
    multiplexer.subscribe(&alias).await.unwrap();

    assert!(multiplexer.unsubscribe(&contract).await.unwrap());
    assert_eq!(source.total_unsubscribes(), 0);

    assert!(multiplexer.unsubscribe(&alias).await.unwrap());
    assert_eq!(source.unsubscribe_calls(&contract), 1);
    assert_eq!(source.total_subscribes(), 1);
}

#[tokio::test]
async fn test_duplicate_subscription_is_rejected() {
    let source = CountingSource::new();
    let multiplexer = SubscriptionMultiplexer::builder()
        .default_source(source.clone())
        .build();
    let config = SubscriptionConfig::quotes(crypto("BTCUSDT"));

    multiplexer.subscribe(&config).await.unwrap();
    assert!(matches!(
        multiplexer.subscribe(&config).await,
        Err(MarketDataError::DuplicateSubscription(_))
    ));

    assert_eq!(source.total_subscribes(), 1);
    assert_eq!(multiplexer.reference_count(&key_for(&config)).await, 1);
}

#[tokio::test]
async fn test_unknown_unsubscribe_is_a_no_op() {
    let source = CountingSource::new();
    let multiplexer = SubscriptionMultiplexer::builder()
        .default_source(source.clone())
        .build();

    assert!(!multiplexer
        .unsubscribe(&SubscriptionConfig::trades(crypto("ETHUSDT")))
        .await
        .unwrap());
    assert_eq!(source.total_unsubscribes(), 0);
}

#[tokio::test]
async fn test_remap_does_not_move_live_subscriptions() {
    let source = CountingSource::new();
    let map = Arc::new(SymbolMap::new());
    map.map(es_canonical(), es_dec18());
    let multiplexer = futures_multiplexer(&source, &map);

    let alias = SubscriptionConfig::trades(es_canonical());
    multiplexer.subscribe(&alias).await.unwrap();

    map.map(es_canonical(), es_mar19());

    // Released under the key recorded at subscribe time
    assert!(multiplexer.unsubscribe(&alias).await.unwrap());
    assert_eq!(
        source.unsubscribe_calls(&SubscriptionConfig::trades(es_dec18())),
        1
    );
    assert_eq!(
        source.unsubscribe_calls(&SubscriptionConfig::trades(es_mar19())),
        0
    );

    // New subscriptions observe the new mapping
    multiplexer.subscribe(&alias).await.unwrap();
    assert_eq!(
        source.subscribe_calls(&SubscriptionConfig::trades(es_mar19())),
        1
    );
}

#[tokio::test]
async fn test_most_specific_source_serves_first() {
    let binance = CountingSource::for_market("binance");
    let any_crypto = CountingSource::new();
    let fallback = CountingSource::new();
    let multiplexer = SubscriptionMultiplexer::builder()
        .route(SecurityType::Crypto, None, any_crypto.clone())
        .route(SecurityType::Crypto, Some("binance"), binance.clone())
        .default_source(fallback.clone())
        .build();

    let on_binance = SubscriptionConfig::trades(crypto("BTCUSDT"));
    let elsewhere = SubscriptionConfig::trades(Symbol::crypto("BTCUSD", "kraken"));
    let equity = SubscriptionConfig::trades(Symbol::new("SPY", SecurityType::Equity, "usa"));

    multiplexer.subscribe(&on_binance).await.unwrap().unwrap();
    multiplexer.subscribe(&elsewhere).await.unwrap().unwrap();
    multiplexer.subscribe(&equity).await.unwrap().unwrap();

    assert_eq!(binance.subscribe_calls(&on_binance), 1);
    assert_eq!(any_crypto.subscribe_calls(&on_binance), 0);
    assert_eq!(any_crypto.subscribe_calls(&elsewhere), 1);
    assert_eq!(fallback.subscribe_calls(&equity), 1);
    assert_eq!(fallback.total_subscribes(), 1);
}

#[tokio::test]
async fn test_declining_source_falls_through() {
    let binance_only = CountingSource::for_market("binance");
    let fallback = CountingSource::new();
    let multiplexer = SubscriptionMultiplexer::builder()
        .route(SecurityType::Crypto, None, binance_only.clone())
        .default_source(fallback.clone())
        .build();

    let config = SubscriptionConfig::quotes(Symbol::crypto("XBTUSD", "bitmex"));
    assert!(multiplexer.subscribe(&config).await.unwrap().is_some());

    assert_eq!(binance_only.total_subscribes(), 0);
    assert_eq!(fallback.subscribe_calls(&config), 1);
}

#[tokio::test]
async fn test_unserved_symbol_yields_none() {
    let source = CountingSource::new();
    let multiplexer = SubscriptionMultiplexer::builder()
        .route(SecurityType::Crypto, Some("binance"), source.clone())
        .build();

    let config = SubscriptionConfig::trades(Symbol::new("SPY", SecurityType::Equity, "usa"));
    assert!(multiplexer.subscribe(&config).await.unwrap().is_none());
    assert_eq!(multiplexer.subscription_count().await, 0);

    // Nothing registered, so subscribing again is not a duplicate
    assert!(multiplexer.subscribe(&config).await.unwrap().is_none());
}

#[tokio::test]
async fn test_universe_queries_need_a_provider() {
    let multiplexer = SubscriptionMultiplexer::builder()
        .default_source(CountingSource::new())
        .build();

    assert!(!multiplexer.has_universe_provider());
    assert!(matches!(
        multiplexer.lookup_symbols(&es_canonical(), false),
        Err(MarketDataError::NotSupported(_))
    ));
    assert!(matches!(
        multiplexer.can_perform_selection(),
        Err(MarketDataError::NotSupported(_))
    ));
    assert!(multiplexer.is_connected());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_churn_balances_underlying_calls() {
    let source = CountingSource::new();
    let map = Arc::new(SymbolMap::new());
    let aliases: Vec<Symbol> = (0..8)
        .map(|i| Symbol::new(&format!("/ES{}", i), SecurityType::Future, "cme"))
        .collect();
    for alias in &aliases {
        map.map(alias.clone(), es_dec18());
    }
    let multiplexer = Arc::new(futures_multiplexer(&source, &map));

    let tasks: Vec<_> = aliases
        .into_iter()
        .map(|alias| {
            let multiplexer = Arc::clone(&multiplexer);
            tokio::spawn(async move {
                let config = SubscriptionConfig::trades(alias);
                for _ in 0..25 {
                    multiplexer.subscribe(&config).await.unwrap();
                    tokio::task::yield_now().await;
                    assert!(multiplexer.unsubscribe(&config).await.unwrap());
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let contract = SubscriptionConfig::trades(es_dec18());
    assert_eq!(multiplexer.reference_count(&key_for(&contract)).await, 0);
    assert_eq!(multiplexer.subscription_count().await, 0);
    assert!(source.subscribe_calls(&contract) >= 1);
    assert_eq!(
        source.subscribe_calls(&contract),
        source.unsubscribe_calls(&contract)
    );
}

#[tokio::test]
async fn test_dispose_releases_every_underlying_subscription() {
    let source = CountingSource::new();
    let multiplexer = SubscriptionMultiplexer::builder()
        .default_source(source.clone())
        .build();

    for ticker in ["BTCUSDT", "ETHUSDT"] {
        multiplexer
            .subscribe(&SubscriptionConfig::trades(crypto(ticker)))
            .await
            .unwrap();
    }
    multiplexer.dispose().await;

    assert_eq!(source.total_unsubscribes(), 2);
    assert_eq!(multiplexer.subscription_count().await, 0);
}
