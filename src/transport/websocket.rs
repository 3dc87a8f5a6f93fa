//! WebSocket transport over tokio-tungstenite
//!
//! Handles connection, frame reception and keepalive for one slot.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use super::{Connection, ConnectionEvents, ConnectionFactory};
use crate::error::{MarketDataError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Default silence after which a keepalive ping is sent
const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(45);

/// WebSocket connection serving one slot
pub struct WebSocketConnection {
    events: ConnectionEvents,
    sink: Arc<Mutex<Option<WsSink>>>,
    open: Arc<AtomicBool>,
    reader: SyncMutex<Option<JoinHandle<()>>>,
    recv_timeout: Duration,
}

impl WebSocketConnection {
    pub fn new(events: ConnectionEvents, recv_timeout: Duration) -> Self {
        Self {
            events,
            sink: Arc::new(Mutex::new(None)),
            open: Arc::new(AtomicBool::new(false)),
            reader: SyncMutex::new(None),
            recv_timeout,
        }
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn open(&self, endpoint: &str) -> Result<()> {
        info!(slot = %self.events.slot(), url = %endpoint, "Connecting to venue WebSocket");

        let (ws_stream, response) = connect_async(endpoint).await.map_err(|e| {
            MarketDataError::WebSocketConnection(format!("Failed to connect: {}", e))
        })?;

        info!(slot = %self.events.slot(), status = ?response.status(), "WebSocket connected");

        let (sink, source) = ws_stream.split();
        *self.sink.lock().await = Some(sink);
        self.open.store(true, Ordering::SeqCst);
        self.events.opened();

        let reader = tokio::spawn(read_frames(
            source,
            Arc::clone(&self.sink),
            Arc::clone(&self.open),
            self.events.clone(),
            self.recv_timeout,
        ));
        if let Some(previous) = self.reader.lock().replace(reader) {
            previous.abort();
        }

        Ok(())
    }

    async fn send(&self, frame: String) -> Result<()> {
        let mut guard = self.sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| MarketDataError::WebSocketConnection("Not connected".to_string()))?;

        sink.send(Message::Text(frame))
            .await
            .map_err(|e| MarketDataError::WebSocketMessage(e.to_string()))
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Pump inbound frames into the event sink until the stream ends
async fn read_frames(
    mut source: WsSource,
    sink: Arc<Mutex<Option<WsSink>>>,
    open: Arc<AtomicBool>,
    events: ConnectionEvents,
    recv_timeout: Duration,
) {
    let slot = events.slot();

    let reason = loop {
        match timeout(recv_timeout, source.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                debug!(slot = %slot, len = text.len(), "Received text message");
                events.message(text);
            }
            Ok(Some(Ok(Message::Binary(data)))) => {
                events.message(String::from_utf8_lossy(&data).to_string());
            }
            Ok(Some(Ok(Message::Ping(data)))) => {
                debug!(slot = %slot, "Received ping, sending pong");
                if let Some(sink) = sink.lock().await.as_mut() {
                    let _ = sink.send(Message::Pong(data)).await;
                }
            }
            Ok(Some(Ok(Message::Pong(_)))) => {
                debug!(slot = %slot, "Received pong");
            }
            Ok(Some(Ok(Message::Close(frame)))) => {
                warn!(slot = %slot, frame = ?frame, "Received close frame");
                break format!("close frame: {:?}", frame);
            }
            Ok(Some(Ok(Message::Frame(_)))) => {}
            Ok(Some(Err(e))) => {
                error!(slot = %slot, error = %e, "WebSocket error");
                break e.to_string();
            }
            Ok(None) => {
                warn!(slot = %slot, "WebSocket stream ended");
                break "stream ended".to_string();
            }
            Err(_) => {
                warn!(slot = %slot, "No message received within timeout, sending keepalive");
                let ping = match sink.lock().await.as_mut() {
                    Some(sink) => sink.send(Message::Ping(Vec::new())).await,
                    None => break "sink closed".to_string(),
                };
                if let Err(e) = ping {
                    warn!(slot = %slot, error = %e, "Failed to send keepalive ping");
                    break format!("keepalive failed: {}", e);
                }
            }
        }
    };

    open.store(false, Ordering::SeqCst);
    sink.lock().await.take();
    events.closed(Some(reason));
}

/// Factory for tungstenite-backed connections
#[derive(Debug, Clone)]
pub struct WebSocketFactory {
    recv_timeout: Duration,
}

impl WebSocketFactory {
    pub fn new() -> Self {
        Self {
            recv_timeout: DEFAULT_RECV_TIMEOUT,
        }
    }
}

impl Default for WebSocketFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionFactory for WebSocketFactory {
    fn create(&self, events: ConnectionEvents) -> Arc<dyn Connection> {
        Arc::new(WebSocketConnection::new(events, self.recv_timeout))
    }
}
