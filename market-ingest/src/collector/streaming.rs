//! Streaming collector
//!
//! Holds one persistent stream connection. Every session walks
//! `Disconnected -> Connecting -> Authenticating -> Subscribed -> Streaming`;
//! any error or disconnect returns to `Disconnected` and a reconnect is
//! attempted after a fixed delay, forever.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use market_common::{DataSource, PricePoint};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::provider::types::{decode_frame, StreamBar, StreamMessage, StreamRequest, StreamTrade};
use crate::provider::{UpstreamError, UpstreamResult};
use crate::storage::MarketStore;

/// Connection state of the streaming collector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Disconnected,
    Connecting,
    Authenticating,
    Subscribed,
    Streaming,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StreamState::Disconnected => "disconnected",
            StreamState::Connecting => "connecting",
            StreamState::Authenticating => "authenticating",
            StreamState::Subscribed => "subscribed",
            StreamState::Streaming => "streaming",
        };
        f.write_str(s)
    }
}

/// Streaming collector configuration
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    pub url: String,
    pub api_key: String,
    pub api_secret: String,
    pub symbols: Vec<String>,
    pub reconnect_delay: Duration,
}

impl StreamingConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            url: settings.upstream.stream_url.clone(),
            api_key: settings.upstream.api_key.clone(),
            api_secret: settings.upstream.api_secret.clone(),
            symbols: settings.symbols.tracked.clone(),
            reconnect_delay: Duration::from_secs(settings.streaming.reconnect_delay_secs),
        }
    }
}

/// Point-in-time copy of the collector counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamingStats {
    pub messages_received: u64,
    pub trades_written: u64,
    pub bars_written: u64,
    pub unknown_symbols: u64,
    pub malformed: u64,
    pub write_errors: u64,
    pub reconnects: u64,
}

#[derive(Debug, Default)]
struct Counters {
    messages_received: AtomicU64,
    trades_written: AtomicU64,
    bars_written: AtomicU64,
    unknown_symbols: AtomicU64,
    malformed: AtomicU64,
    write_errors: AtomicU64,
    reconnects: AtomicU64,
}

enum SessionEnd {
    Shutdown,
    Closed,
}

pub struct StreamingCollector {
    store: Arc<dyn MarketStore>,
    config: StreamingConfig,
    state_tx: watch::Sender<StreamState>,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Symbol to instrument id. Instruments are never deleted, so hits stay valid.
    instrument_ids: RwLock<HashMap<String, i64>>,
    counters: Counters,
}

impl StreamingCollector {
    pub fn new(store: Arc<dyn MarketStore>, config: StreamingConfig) -> Self {
        let (state_tx, _) = watch::channel(StreamState::Disconnected);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            store,
            config,
            state_tx,
            shutdown_tx,
            task: Mutex::new(None),
            instrument_ids: RwLock::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn state(&self) -> StreamState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<StreamState> {
        self.state_tx.subscribe()
    }

    pub fn stats(&self) -> StreamingStats {
        let c = &self.counters;
        StreamingStats {
            messages_received: c.messages_received.load(Ordering::Relaxed),
            trades_written: c.trades_written.load(Ordering::Relaxed),
            bars_written: c.bars_written.load(Ordering::Relaxed),
            unknown_symbols: c.unknown_symbols.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            write_errors: c.write_errors.load(Ordering::Relaxed),
            reconnects: c.reconnects.load(Ordering::Relaxed),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Spawn the connection loop. A second call while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            debug!("Streaming collector already running");
            return;
        }

        info!(
            url = %self.config.url,
            symbols = self.config.symbols.len(),
            "Starting streaming collector"
        );
        let collector = Arc::clone(self);
        let shutdown_rx = self.shutdown_tx.subscribe();
        *task = Some(tokio::spawn(async move {
            collector.run(shutdown_rx).await;
        }));
    }

    /// Signal shutdown and wait for the connection loop to exit
    pub async fn stop(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = self.shutdown_tx.send(());
            if let Err(e) = handle.await {
                warn!("Streaming task ended abnormally: {}", e);
            }
            info!(stats = ?self.stats(), "Streaming collector stopped");
        }
    }

    fn set_state(&self, state: StreamState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Stream state changed");
        }
    }

    async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }

            self.set_state(StreamState::Connecting);
            match self.run_session(shutdown_rx.resubscribe()).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Closed) => info!("Stream closed by server"),
                Err(e) => error!(error = %e, "Stream session failed"),
            }

            self.set_state(StreamState::Disconnected);
            self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
            warn!("Reconnecting stream in {:?}", self.config.reconnect_delay);

            tokio::select! {
                _ = sleep(self.config.reconnect_delay) => {}
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received during reconnect delay");
                    break;
                }
            }
        }

        self.set_state(StreamState::Disconnected);
    }

    async fn run_session(
        &self,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> UpstreamResult<SessionEnd> {
        let (ws_stream, _) = connect_async(self.config.url.as_str())
            .await
            .map_err(|e| {
                UpstreamError::Connection(format!("Failed to connect to {}: {}", self.config.url, e))
            })?;
        debug!("Stream connected to {}", self.config.url);

        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            for request in self.handle_frame(&text).await? {
                                write
                                    .send(Message::Text(request.to_json()))
                                    .await
                                    .map_err(|e| UpstreamError::Connection(e.to_string()))?;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if let Err(e) = write.send(Message::Pong(payload)).await {
                                warn!("Failed to send pong: {}", e);
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Closed),
                        Some(Err(e)) => return Err(UpstreamError::Connection(e.to_string())),
                        Some(Ok(_)) => {}
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, closing stream");
                    if let Err(e) = write.send(Message::Close(None)).await {
                        warn!("Failed to send close frame: {}", e);
                    }
                    return Ok(SessionEnd::Shutdown);
                }
            }
        }
    }

    /// Process one text frame and return the requests to send back.
    ///
    /// Only an error reply to authentication ends the session.
    pub async fn handle_frame(&self, text: &str) -> UpstreamResult<Vec<StreamRequest>> {
        let messages = match decode_frame(text) {
            Ok(messages) => messages,
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Skipping malformed stream frame");
                return Ok(Vec::new());
            }
        };

        let mut replies = Vec::new();
        for message in messages {
            self.counters.messages_received.fetch_add(1, Ordering::Relaxed);
            match message {
                StreamMessage::Success { msg } if msg == "connected" => {
                    self.set_state(StreamState::Authenticating);
                    replies.push(StreamRequest::auth(
                        self.config.api_key.as_str(),
                        self.config.api_secret.as_str(),
                    ));
                }
                StreamMessage::Success { msg } if msg == "authenticated" => {
                    replies.push(StreamRequest::subscribe_trades(&self.config.symbols));
                    replies.push(StreamRequest::subscribe_bars(&self.config.symbols));
                    self.set_state(StreamState::Subscribed);
                }
                StreamMessage::Success { msg } => debug!(msg = %msg, "Stream status"),
                StreamMessage::Subscription { trades, bars } => {
                    info!(trades = trades.len(), bars = bars.len(), "Stream subscription confirmed");
                    self.set_state(StreamState::Streaming);
                }
                StreamMessage::Error { code, msg } => {
                    if self.state() == StreamState::Authenticating {
                        return Err(UpstreamError::Authentication(format!(
                            "stream rejected credentials ({:?}): {}",
                            code, msg
                        )));
                    }
                    warn!(?code, msg = %msg, "Stream error message");
                }
                StreamMessage::Trade(trade) => {
                    self.mark_streaming();
                    self.dispatch_trade(&trade).await;
                }
                StreamMessage::Bar(bar) => {
                    self.mark_streaming();
                    self.dispatch_bar(&bar).await;
                }
                StreamMessage::Unknown => debug!("Ignoring unhandled stream message type"),
                StreamMessage::Malformed(reason) => {
                    self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                    warn!(reason = %reason, "Skipping malformed stream message");
                }
            }
        }
        Ok(replies)
    }

    /// Data before the subscription ack still means the stream is live
    fn mark_streaming(&self) {
        if self.state() == StreamState::Subscribed {
            self.set_state(StreamState::Streaming);
        }
    }

    /// Resolve an instrument id without ever creating the instrument
    async fn resolve_instrument(&self, symbol: &str) -> Option<i64> {
        if let Some(id) = self.instrument_ids.read().get(symbol) {
            return Some(*id);
        }

        match self.store.find_instrument(symbol).await {
            Ok(Some(instrument)) => {
                self.instrument_ids
                    .write()
                    .insert(symbol.to_string(), instrument.id);
                Some(instrument.id)
            }
            Ok(None) => {
                self.counters.unknown_symbols.fetch_add(1, Ordering::Relaxed);
                warn!(symbol, "Dropping stream event for unknown instrument");
                None
            }
            Err(e) => {
                self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
                warn!(symbol, error = %e, "Instrument lookup failed");
                None
            }
        }
    }

    async fn dispatch_trade(&self, trade: &StreamTrade) {
        let Some(instrument_id) = self.resolve_instrument(&trade.symbol).await else {
            return;
        };

        let point = PricePoint::new(
            instrument_id,
            trade.price,
            trade.size,
            trade.timestamp,
            DataSource::Streaming,
        );
        match self.store.insert_price_point(&point).await {
            Ok(()) => {
                self.counters.trades_written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
                warn!(symbol = %trade.symbol, error = %e, "Failed to store trade");
            }
        }
    }

    async fn dispatch_bar(&self, bar: &StreamBar) {
        let Some(instrument_id) = self.resolve_instrument(&bar.symbol).await else {
            return;
        };

        let aggregate = bar
            .to_historical()
            .to_aggregate_bar(instrument_id, DataSource::Streaming);
        match self.store.insert_aggregate_bar(&aggregate).await {
            Ok(()) => {
                self.counters.bars_written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
                warn!(symbol = %bar.symbol, error = %e, "Failed to store bar");
            }
        }
    }
}
