//! Live crypto feed: the streaming path and its hot cache.
//!
//! One manager instance owns the single streaming connection to the crypto
//! venue: the tracked-symbol set, the in-process hot cache, the throttled
//! write-through to the persisted cache, and the reconnect state machine
//! (`Disconnected -> Connecting -> Connected`, re-entering `Connecting`
//! after a fixed delay on close or error).
//!
//! On (re)connect the entire tracked set is subscribed in one batch, so a
//! dropped connection can never lose or duplicate subscriptions. Inbound
//! ticker messages update the hot cache immediately; the persisted cache is
//! written at most once per symbol per throttle window, which decouples the
//! message rate from storage write volume at the cost of the persisted copy
//! lagging the hot one by up to that window after a restart.
//!
//! The transport is a trait so tests drive the state machine with scripted
//! connections instead of a real websocket.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::cache::{cache_key, ttl, CacheStore};
use crate::provider::{MarketDataSource, ProviderError, QuoteRequest};
use crate::{AssetType, ProviderId, Quote, Symbol};

/// Streaming transport failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedError(String);

impl FeedError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl Display for FeedError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for FeedError {}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Disconnected,
    Connecting,
    Connected,
}

type FeedFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One live streaming connection.
pub trait StreamConn: Send {
    /// Send one text frame.
    fn send<'a>(&'a mut self, text: String) -> FeedFuture<'a, Result<(), FeedError>>;

    /// Receive the next text frame. `None` means the peer closed the
    /// connection.
    fn next<'a>(&'a mut self) -> FeedFuture<'a, Option<Result<String, FeedError>>>;
}

/// Factory for streaming connections.
pub trait StreamTransport: Send + Sync {
    fn connect<'a>(&'a self) -> FeedFuture<'a, Result<Box<dyn StreamConn>, FeedError>>;
}

/// Reconnect and persistence timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedConfig {
    /// Fixed delay before re-entering `Connecting` after a drop.
    pub reconnect_delay: Duration,
    /// Minimum spacing between persisted writes per symbol.
    pub persist_interval: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            persist_interval: Duration::from_secs(5),
        }
    }
}

struct HotEntry {
    quote: Quote,
    persisted_at: Option<Instant>,
}

struct FeedInner {
    transport: Arc<dyn StreamTransport>,
    rest: Arc<dyn MarketDataSource>,
    cache: CacheStore,
    config: FeedConfig,
    state: Mutex<FeedState>,
    tracked: Mutex<BTreeSet<Symbol>>,
    hot: Mutex<HashMap<String, HotEntry>>,
    subscribe_tx: Mutex<Option<mpsc::UnboundedSender<Vec<Symbol>>>>,
    subscribe_seq: AtomicU64,
    stopped: AtomicBool,
}

/// Owner of the streaming connection and the crypto quote path.
#[derive(Clone)]
pub struct LiveFeedManager {
    inner: Arc<FeedInner>,
}

impl LiveFeedManager {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        rest: Arc<dyn MarketDataSource>,
        cache: CacheStore,
        config: FeedConfig,
    ) -> Self {
        Self {
            inner: Arc::new(FeedInner {
                transport,
                rest,
                cache,
                config,
                state: Mutex::new(FeedState::Disconnected),
                tracked: Mutex::new(BTreeSet::new()),
                hot: Mutex::new(HashMap::new()),
                subscribe_tx: Mutex::new(None),
                subscribe_seq: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Launch the connection driver. Idempotent; later calls are no-ops
    /// while a driver is running.
    pub fn start(&self) {
        let mut guard = self
            .inner
            .subscribe_tx
            .lock()
            .expect("feed subscribe lock poisoned");
        if guard.is_some() {
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *guard = Some(tx);
        drop(guard);

        self.inner.stopped.store(false, Ordering::Release);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(run_driver(inner, rx));
    }

    /// Stop the driver after its current cycle and mark the feed down.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        let mut guard = self
            .inner
            .subscribe_tx
            .lock()
            .expect("feed subscribe lock poisoned");
        *guard = None;
    }

    pub fn state(&self) -> FeedState {
        *self.inner.state.lock().expect("feed state lock poisoned")
    }

    pub fn tracked_symbols(&self) -> Vec<Symbol> {
        self.inner
            .tracked
            .lock()
            .expect("feed tracked lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Add a symbol to the tracked set.
    ///
    /// Idempotent: re-tracking a symbol is a no-op. While connected the new
    /// symbol is subscribed incrementally; while disconnected this triggers
    /// a connection attempt (the batch subscribe on connect covers it).
    pub fn track_symbol(&self, symbol: &Symbol) {
        {
            let mut tracked = self
                .inner
                .tracked
                .lock()
                .expect("feed tracked lock poisoned");
            if !tracked.insert(symbol.clone()) {
                return;
            }
        }

        match self.state() {
            FeedState::Connected => {
                let guard = self
                    .inner
                    .subscribe_tx
                    .lock()
                    .expect("feed subscribe lock poisoned");
                if let Some(tx) = guard.as_ref() {
                    let _ = tx.send(vec![symbol.clone()]);
                }
            }
            FeedState::Disconnected => self.start(),
            FeedState::Connecting => {}
        }
    }

    /// Resolve a crypto quote: hot cache, then the REST adapter (which is
    /// itself persisted-cache-first), then a stale persisted entry marked
    /// stale. Only total absence of data surfaces an error.
    pub async fn quote(&self, symbol: &Symbol) -> Result<Quote, ProviderError> {
        if let Some(entry) = self
            .inner
            .hot
            .lock()
            .expect("feed hot cache lock poisoned")
            .get(symbol.as_str())
        {
            return Ok(entry.quote.clone());
        }

        match self.inner.rest.quote(QuoteRequest::new(symbol.clone())).await {
            Ok(quote) => Ok(quote),
            Err(error) => {
                let key = cache_key(
                    "quote",
                    ProviderId::Binance.cache_tag(),
                    symbol.as_str(),
                    None,
                );
                match self.inner.cache.lookup::<Quote>(&key) {
                    crate::cache::CacheLookup::Fresh(quote) => Ok(quote),
                    crate::cache::CacheLookup::Stale(quote) => {
                        warn!(symbol = %symbol, %error, "serving stale crypto quote after REST failure");
                        Ok(quote.into_stale())
                    }
                    crate::cache::CacheLookup::Miss => Err(error),
                }
            }
        }
    }
}

async fn run_driver(inner: Arc<FeedInner>, mut subscribe_rx: mpsc::UnboundedReceiver<Vec<Symbol>>) {
    loop {
        if inner.stopped.load(Ordering::Acquire) {
            break;
        }

        inner.set_state(FeedState::Connecting);
        let mut conn = match inner.transport.connect().await {
            Ok(conn) => conn,
            Err(error) => {
                warn!(%error, "live feed connect failed");
                inner.set_state(FeedState::Disconnected);
                sleep(inner.config.reconnect_delay).await;
                continue;
            }
        };

        inner.set_state(FeedState::Connected);
        let snapshot: Vec<Symbol> = {
            let tracked = inner.tracked.lock().expect("feed tracked lock poisoned");
            tracked.iter().cloned().collect()
        };
        if !snapshot.is_empty() {
            if let Err(error) = send_subscribe(conn.as_mut(), &inner, &snapshot).await {
                warn!(%error, "live feed batch subscribe failed");
                inner.set_state(FeedState::Disconnected);
                sleep(inner.config.reconnect_delay).await;
                continue;
            }
        }
        info!(symbols = snapshot.len(), "live feed connected");

        loop {
            tokio::select! {
                message = conn.next() => match message {
                    Some(Ok(text)) => inner.handle_message(&text),
                    Some(Err(error)) => {
                        warn!(%error, "live feed read error");
                        break;
                    }
                    None => {
                        info!("live feed closed by peer");
                        break;
                    }
                },
                request = subscribe_rx.recv() => match request {
                    Some(symbols) => {
                        if let Err(error) = send_subscribe(conn.as_mut(), &inner, &symbols).await {
                            warn!(%error, "live feed incremental subscribe failed");
                            break;
                        }
                    }
                    None => {
                        inner.set_state(FeedState::Disconnected);
                        return;
                    }
                },
            }
        }

        inner.set_state(FeedState::Disconnected);
        sleep(inner.config.reconnect_delay).await;
    }

    inner.set_state(FeedState::Disconnected);
}

async fn send_subscribe(
    conn: &mut dyn StreamConn,
    inner: &FeedInner,
    symbols: &[Symbol],
) -> Result<(), FeedError> {
    let params: Vec<String> = symbols
        .iter()
        .map(|symbol| format!("{}@ticker", symbol.as_str().to_ascii_lowercase()))
        .collect();
    let id = inner.subscribe_seq.fetch_add(1, Ordering::Relaxed) + 1;
    let frame = serde_json::json!({
        "method": "SUBSCRIBE",
        "params": params,
        "id": id,
    });
    conn.send(frame.to_string()).await
}

impl FeedInner {
    fn set_state(&self, state: FeedState) {
        *self.state.lock().expect("feed state lock poisoned") = state;
    }

    /// Apply one inbound frame. Runs synchronously between suspension
    /// points, so hot-cache updates need no ordering beyond the mutex.
    fn handle_message(&self, text: &str) {
        let Some(ticker) = parse_ticker_frame(text) else {
            return;
        };

        let Some(quote) = ticker.into_quote() else {
            debug!("dropping ticker frame with missing fields");
            return;
        };

        let mut hot = self.hot.lock().expect("feed hot cache lock poisoned");
        let entry = hot
            .entry(quote.symbol.as_str().to_owned())
            .or_insert_with(|| HotEntry {
                quote: quote.clone(),
                persisted_at: None,
            });
        entry.quote = quote.clone();

        let due = entry
            .persisted_at
            .map(|at| at.elapsed() >= self.config.persist_interval)
            .unwrap_or(true);
        if due {
            entry.persisted_at = Some(Instant::now());
            drop(hot);

            let key = cache_key(
                "quote",
                ProviderId::Binance.cache_tag(),
                quote.symbol.as_str(),
                None,
            );
            self.cache
                .write(&key, &quote, ttl::CRYPTO_QUOTE, ProviderId::Binance.as_str());
        }
    }
}

/// Combined-stream frame wrapper (`{stream, data}`); raw frames are the
/// payload shape directly.
#[derive(Debug, Deserialize)]
struct CombinedFrame {
    data: TickerFrame,
}

#[derive(Debug, Deserialize)]
struct TickerFrame {
    #[serde(rename = "e")]
    event: Option<String>,
    /// Event time, epoch milliseconds.
    #[serde(rename = "E")]
    event_time: Option<i64>,
    #[serde(rename = "s")]
    symbol: Option<String>,
    #[serde(rename = "c")]
    last_price: Option<String>,
    #[serde(rename = "p")]
    price_change: Option<String>,
    #[serde(rename = "P")]
    price_change_percent: Option<String>,
}

impl TickerFrame {
    fn into_quote(self) -> Option<Quote> {
        let symbol = Symbol::parse(self.symbol.as_deref()?).ok()?;
        let price = self.last_price.as_deref()?.parse::<f64>().ok()?;
        let change_abs = self
            .price_change
            .as_deref()
            .and_then(|raw| raw.parse::<f64>().ok())
            .unwrap_or(0.0);
        let change_pct = self
            .price_change_percent
            .as_deref()
            .and_then(|raw| raw.parse::<f64>().ok())
            .unwrap_or(0.0);

        Quote::new(
            symbol,
            AssetType::Crypto,
            price,
            change_abs,
            change_pct,
            self.event_time.unwrap_or(0),
            ProviderId::Binance,
        )
        .ok()
    }
}

fn parse_ticker_frame(text: &str) -> Option<TickerFrame> {
    if let Ok(combined) = serde_json::from_str::<CombinedFrame>(text) {
        return Some(combined.data);
    }

    if let Ok(frame) = serde_json::from_str::<TickerFrame>(text) {
        if frame.event.as_deref() == Some("24hrTicker") {
            return Some(frame);
        }
    }

    // Subscription acks ({"result": null, "id": n}) and other control
    // frames are expected noise.
    debug!("ignoring non-ticker frame");
    None
}

/// Production transport: one tokio-tungstenite connection to the venue's
/// combined-stream endpoint.
pub struct BinanceWsTransport {
    url: String,
}

impl BinanceWsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl StreamTransport for BinanceWsTransport {
    fn connect<'a>(&'a self) -> FeedFuture<'a, Result<Box<dyn StreamConn>, FeedError>> {
        Box::pin(async move {
            let (stream, _) = connect_async(&self.url)
                .await
                .map_err(|error| FeedError::new(format!("websocket connect failed: {error}")))?;
            Ok(Box::new(WsConn { stream }) as Box<dyn StreamConn>)
        })
    }
}

struct WsConn {
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
}

impl StreamConn for WsConn {
    fn send<'a>(&'a mut self, text: String) -> FeedFuture<'a, Result<(), FeedError>> {
        Box::pin(async move {
            self.stream
                .send(Message::Text(text.into()))
                .await
                .map_err(|error| FeedError::new(format!("websocket send failed: {error}")))
        })
    }

    fn next<'a>(&'a mut self) -> FeedFuture<'a, Option<Result<String, FeedError>>> {
        Box::pin(async move {
            loop {
                match self.stream.next().await {
                    Some(Ok(Message::Text(text))) => return Some(Ok(text.to_string())),
                    // Ping/pong is handled by tungstenite while polling.
                    Some(Ok(Message::Close(_))) | None => return None,
                    Some(Ok(_)) => continue,
                    Some(Err(error)) => {
                        return Some(Err(FeedError::new(format!(
                            "websocket read failed: {error}"
                        ))))
                    }
                }
            }
        })
    }
}

/// Deterministic transport for tests: a queue of scripted connections, with
/// every outbound frame recorded.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    inner: Arc<Mutex<ScriptedTransportInner>>,
}

#[derive(Default)]
struct ScriptedTransportInner {
    connections: VecDeque<ScriptedScript>,
    sent: Vec<String>,
    connects: usize,
}

struct ScriptedScript {
    messages: VecDeque<String>,
    stay_open: bool,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one connection. Its messages are delivered in order; afterwards
    /// the connection either stays open (pending forever) or closes.
    pub fn push_connection(&self, messages: Vec<String>, stay_open: bool) {
        self.inner
            .lock()
            .expect("scripted transport lock poisoned")
            .connections
            .push_back(ScriptedScript {
                messages: messages.into(),
                stay_open,
            });
    }

    /// Every frame sent by the manager, in order, across all connections.
    pub fn sent_frames(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("scripted transport lock poisoned")
            .sent
            .clone()
    }

    pub fn connect_count(&self) -> usize {
        self.inner
            .lock()
            .expect("scripted transport lock poisoned")
            .connects
    }
}

impl StreamTransport for ScriptedTransport {
    fn connect<'a>(&'a self) -> FeedFuture<'a, Result<Box<dyn StreamConn>, FeedError>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let script = {
                let mut guard = inner.lock().expect("scripted transport lock poisoned");
                guard.connects += 1;
                guard.connections.pop_front()
            };

            match script {
                Some(script) => Ok(Box::new(ScriptedConn {
                    transport: inner,
                    messages: script.messages,
                    stay_open: script.stay_open,
                }) as Box<dyn StreamConn>),
                None => Err(FeedError::new("no scripted connection available")),
            }
        })
    }
}

struct ScriptedConn {
    transport: Arc<Mutex<ScriptedTransportInner>>,
    messages: VecDeque<String>,
    stay_open: bool,
}

impl StreamConn for ScriptedConn {
    fn send<'a>(&'a mut self, text: String) -> FeedFuture<'a, Result<(), FeedError>> {
        Box::pin(async move {
            self.transport
                .lock()
                .expect("scripted transport lock poisoned")
                .sent
                .push(text);
            Ok(())
        })
    }

    fn next<'a>(&'a mut self) -> FeedFuture<'a, Option<Result<String, FeedError>>> {
        Box::pin(async move {
            match self.messages.pop_front() {
                Some(message) => Some(Ok(message)),
                None if self.stay_open => futures_util::future::pending().await,
                None => None,
            }
        })
    }
}
