//! ORPflow HFT - Venue Connectivity
//!
//! Subscribes the configured symbols through the composite multiplexer,
//! publishes every consumed market event over IPC, and serves health and
//! metrics endpoints.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use tokio::sync::broadcast::error::RecvError;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use orp_flow_connectivity::{
    metrics, weights, AppState, Config, ConsumerHandle, DataSource, Publisher, RateLimiter,
    SecurityType, StreamingVenue, SubscriptionConfig, SubscriptionMultiplexer, SymbolMap,
    WebSocketFactory,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting ORPflow venue connectivity");

    let config = Arc::new(Config::load()?);
    info!(symbols = ?config.symbols, market = %config.market, "Configuration loaded");

    let weights = if config.fetch_symbol_weights {
        let client = reqwest::Client::new();
        match weights::fetch_symbol_weights(&client, &config.rest_endpoint, &config.market).await {
            Ok(weights) => weights,
            Err(e) => {
                warn!(error = %e, "Symbol weights unavailable, using uniform weights");
                HashMap::new()
            }
        }
    } else {
        HashMap::new()
    };

    let rate_limiter = Arc::new(RateLimiter::new(
        config.rate_limit_permits,
        config.rate_limit_window(),
    ));
    let venue = Arc::new(StreamingVenue::new(
        config.venue_config(),
        Arc::new(WebSocketFactory::new()),
        rate_limiter,
        weights,
    )?);

    let multiplexer = Arc::new(
        SubscriptionMultiplexer::builder()
            .route(
                SecurityType::Crypto,
                Some(&config.market),
                Arc::clone(&venue) as Arc<dyn DataSource>,
            )
            .resolver(Arc::new(SymbolMap::new()))
            .build(),
    );

    let publisher = Arc::new(Publisher::new(&config.ipc_socket_path).await?);

    let state = Arc::new(AppState {
        multiplexer: Arc::clone(&multiplexer),
        venue: Arc::clone(&venue),
        publisher: Arc::clone(&publisher),
        config: Arc::clone(&config),
    });

    spawn_operator_log(&venue);

    let health_state = Arc::clone(&state);
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state).await {
            warn!(error = %e, "Health server error");
        }
    });

    for symbol in config.symbols() {
        for request in [
            SubscriptionConfig::trades(symbol.clone()),
            SubscriptionConfig::quotes(symbol.clone()),
        ] {
            match multiplexer.subscribe(&request).await {
                Ok(Some(consumer)) => spawn_forwarder(consumer, Arc::clone(&publisher)),
                Ok(None) => warn!(subscription = %request, "No source serves subscription"),
                Err(e) => error!(subscription = %request, error = %e, "Subscription failed"),
            }
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    multiplexer.dispose().await;
    venue.dispose().await;

    info!("Venue connectivity stopped");
    Ok(())
}

/// Forward one consumer's events to the IPC publisher
fn spawn_forwarder(mut consumer: ConsumerHandle, publisher: Arc<Publisher>) {
    tokio::spawn(async move {
        while let Some(event) = consumer.recv().await {
            if let Err(e) = publisher.publish(&event).await {
                warn!(subscription = %consumer.config(), error = %e, "Failed to publish event");
            }
        }
    });
}

/// Operator messages are already logged where they are raised; this keeps
/// the channel drained and reports drops
fn spawn_operator_log(venue: &StreamingVenue) {
    let mut messages = venue.messages();
    tokio::spawn(async move {
        loop {
            match messages.recv().await {
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Operator messages dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Start HTTP server for health checks and metrics
async fn start_health_server(state: Arc<AppState>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_text))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::clone(&state));

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.health_port));
    info!(addr = %addr, "Starting health check server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let manager = state.venue.manager();
    let connected = state.multiplexer.is_connected();
    Json(serde_json::json!({
        "status": if connected { "healthy" } else { "degraded" },
        "component": "connectivity",
        "market": state.venue.market(),
        "connections": manager.slot_count(),
        "connected": manager.connected_count(),
        "subscriptions": state.multiplexer.subscription_count().await,
        "ipc_connected": state.publisher.is_connected().await,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn metrics_text() -> Result<String, StatusCode> {
    metrics::render().map_err(|e| {
        warn!(error = %e, "Failed to render metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}
