// =============================================================================
// Stream Manager — resilient combined kline WebSocket stream
// =============================================================================
//
// One connection carries every (symbol, interval) pair as a Binance combined
// stream. Connection lifecycle is a four-state machine:
//
//   DISCONNECTED -> CONNECTING   backoff delay elapsed, dialing
//   CONNECTING   -> CONNECTED    handshake ok; attempts reset; rotation armed
//   CONNECTING   -> DISCONNECTED handshake error; attempts incremented
//   CONNECTED    -> CLOSING      rotation timer, shutdown, or read/write error
//   CLOSING      -> DISCONNECTED close handshake done or 2 s timeout
//
// Backoff: base 1 s, doubling, ceiling 60 s, jitter ±15%. Close codes 1008
// and 429 impose a 2-minute minimum cool-down and widen the jitter band for
// the next attempt. A rotation timer fires 23 h 50 m after each successful
// handshake so the venue's forced-24 h disconnect never hits us mid-session.
//
// Consumers receive `MarketTick`s on a bounded broadcast channel; a consumer
// that lags simply loses the oldest ticks and can never block the reader.
// =============================================================================

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::jitter::fuzz_duration;
use crate::market_data::CandleBuffer;
use crate::types::MarketTick;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Reconnect backoff parameters.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CEILING: Duration = Duration::from_secs(60);
const BACKOFF_JITTER_FRACTION: f64 = 0.15;
/// Minimum cool-down after a policy (1008) or rate-limit (429) close.
const POLICY_COOLDOWN: Duration = Duration::from_secs(120);

/// Proactive rotation: 10 minutes before the venue's forced 24 h disconnect.
const ROTATION_AFTER: Duration = Duration::from_secs(23 * 3600 + 50 * 60);

/// Outgoing ping after this much read-silence.
const PING_IDLE: Duration = Duration::from_secs(180);
/// Deadline for the matching pong.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for the close handshake.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection lifecycle state (exported for operational snapshots).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Closing = 3,
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Closing => write!(f, "CLOSING"),
        }
    }
}

/// Why a connected session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
    Rotation,
    ReadError,
    PolicyCooldown,
}

/// Stream configuration.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub symbols: Vec<String>,
    pub intervals: Vec<String>,
    pub base_url: String,
    pub channel_capacity: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            intervals: Vec::new(),
            base_url: "wss://fstream.binance.com".to_string(),
            channel_capacity: 1024,
        }
    }
}

/// Owner of the combined stream connection and its fan-out channel.
pub struct StreamManager {
    settings: StreamSettings,
    tx: broadcast::Sender<MarketTick>,
    buffer: Arc<CandleBuffer>,
    state: AtomicU8,
    attempts: AtomicU32,
}

impl StreamManager {
    pub fn new(settings: StreamSettings, buffer: Arc<CandleBuffer>) -> Self {
        let (tx, _) = broadcast::channel(settings.channel_capacity.max(16));
        Self {
            settings,
            tx,
            buffer,
            state: AtomicU8::new(ConnState::Disconnected as u8),
            attempts: AtomicU32::new(0),
        }
    }

    /// A new bounded receiver of market ticks. Lagging receivers drop the
    /// oldest ticks rather than exerting back-pressure on the stream reader.
    pub fn subscribe(&self) -> broadcast::Receiver<MarketTick> {
        self.tx.subscribe()
    }

    pub fn state(&self) -> ConnState {
        match self.state.load(Ordering::Relaxed) {
            0 => ConnState::Disconnected,
            1 => ConnState::Connecting,
            2 => ConnState::Connected,
            _ => ConnState::Closing,
        }
    }

    /// Consecutive failed connection attempts (resets on handshake success).
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Combined stream URL over every (symbol, interval) pair.
    pub fn combined_stream_url(&self) -> String {
        build_combined_url(
            &self.settings.base_url,
            &self.settings.symbols,
            &self.settings.intervals,
        )
    }

    fn set_state(&self, s: ConnState) {
        self.state.store(s as u8, Ordering::Relaxed);
    }

    // -------------------------------------------------------------------------
    // Connection driver
    // -------------------------------------------------------------------------

    /// Run the connect/read/rotate loop until shutdown. Spawned once at
    /// engine startup.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let url = self.combined_stream_url();
        info!(url = %url, "stream manager started");

        let mut jitter_widen: f64 = 1.0;
        let mut pending_cooldown: Option<Duration> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }

            // DISCONNECTED: wait out the backoff (and any policy cool-down).
            let failures = self.attempts.load(Ordering::Relaxed);
            let mut delay = backoff_delay(failures, jitter_widen);
            if let Some(cd) = pending_cooldown.take() {
                delay = delay.max(cd);
            }
            if !delay.is_zero() {
                self.set_state(ConnState::Disconnected);
                debug!(delay_ms = delay.as_millis() as u64, failures, "reconnect backoff");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            // CONNECTING
            self.set_state(ConnState::Connecting);
            let ws = match connect_async(&url).await {
                Ok((ws, _resp)) => ws,
                Err(e) => {
                    self.attempts.fetch_add(1, Ordering::Relaxed);
                    self.set_state(ConnState::Disconnected);
                    error!(error = %e, "stream handshake failed");
                    continue;
                }
            };

            // CONNECTED: attempts reset, rotation timer armed.
            self.attempts.store(0, Ordering::Relaxed);
            jitter_widen = 1.0;
            self.set_state(ConnState::Connected);
            info!("stream connected, rotation armed for 23h50m");

            let end = self.session(ws, &mut shutdown).await;
            self.set_state(ConnState::Disconnected);

            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Rotation => {
                    // Immediate reconnect: attempts stayed at zero.
                    info!("stream rotated, reconnecting");
                }
                SessionEnd::PolicyCooldown => {
                    self.attempts.fetch_add(1, Ordering::Relaxed);
                    jitter_widen = (jitter_widen * 2.0).min(3.0);
                    pending_cooldown = Some(POLICY_COOLDOWN);
                    warn!(
                        cooldown_secs = POLICY_COOLDOWN.as_secs(),
                        "policy/rate-limit close, cooling down"
                    );
                }
                SessionEnd::ReadError => {
                    self.attempts.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.set_state(ConnState::Disconnected);
        info!("stream manager stopped");
    }

    /// Drive one connected session until something ends it.
    async fn session(&self, ws: WsStream, shutdown: &mut watch::Receiver<bool>) -> SessionEnd {
        let (mut write, mut read) = ws.split();

        let rotation = tokio::time::sleep(ROTATION_AFTER);
        tokio::pin!(rotation);

        let mut heartbeat = tokio::time::interval(Duration::from_secs(5));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut last_read = Instant::now();
        let mut awaiting_pong: Option<Instant> = None;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            last_read = Instant::now();
                            match parse_combined_kline(&text) {
                                Ok(tick) => {
                                    self.buffer.apply_tick(&tick);
                                    // No receivers is fine; the buffer is the
                                    // durable view.
                                    let _ = self.tx.send(tick);
                                }
                                Err(e) => {
                                    debug!(error = %e, "unparseable stream message skipped");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            last_read = Instant::now();
                            // Pong must echo the identical payload.
                            if let Err(e) = write.send(Message::Pong(payload)).await {
                                warn!(error = %e, "pong write failed");
                                return SessionEnd::ReadError;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_read = Instant::now();
                            awaiting_pong = None;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            self.set_state(ConnState::Closing);
                            if close_requires_cooldown(frame.as_ref()) {
                                return SessionEnd::PolicyCooldown;
                            }
                            return SessionEnd::ReadError;
                        }
                        Some(Ok(_)) => {
                            last_read = Instant::now();
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "stream read error");
                            return SessionEnd::ReadError;
                        }
                        None => {
                            warn!("stream ended by peer");
                            return SessionEnd::ReadError;
                        }
                    }
                }

                _ = &mut rotation => {
                    self.set_state(ConnState::Closing);
                    info!("rotation timer fired, closing gracefully");
                    graceful_close(&mut write, &mut read).await;
                    return SessionEnd::Rotation;
                }

                _ = heartbeat.tick() => {
                    if let Some(sent) = awaiting_pong {
                        if sent.elapsed() >= PONG_TIMEOUT {
                            warn!("pong deadline missed, recycling connection");
                            return SessionEnd::ReadError;
                        }
                    } else if last_read.elapsed() >= PING_IDLE {
                        debug!("read-silence ping");
                        if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                            warn!(error = %e, "ping write failed");
                            return SessionEnd::ReadError;
                        }
                        awaiting_pong = Some(Instant::now());
                    }
                }

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.set_state(ConnState::Closing);
                        graceful_close(&mut write, &mut read).await;
                        return SessionEnd::Shutdown;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamManager")
            .field("symbols", &self.settings.symbols)
            .field("intervals", &self.settings.intervals)
            .field("state", &self.state())
            .field("attempts", &self.attempts())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Free helpers (pure, unit-tested)
// ---------------------------------------------------------------------------

/// `wss://<host>/stream?streams=btcusdt@kline_1m/btcusdt@kline_5m/...`
fn build_combined_url(base_url: &str, symbols: &[String], intervals: &[String]) -> String {
    let mut streams: Vec<String> = Vec::with_capacity(symbols.len() * intervals.len());
    for sym in symbols {
        let lower = sym.to_lowercase();
        for iv in intervals {
            streams.push(format!("{lower}@kline_{iv}"));
        }
    }
    format!("{}/stream?streams={}", base_url, streams.join("/"))
}

/// Backoff for the n-th consecutive failure: 0 for the first dial, then
/// 1 s × 2^(n−1) capped at 60 s, with ±15% jitter (widened after policy
/// closes) and a hard 60 s ceiling after jitter.
fn backoff_delay(failures: u32, jitter_widen: f64) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let exp = failures.saturating_sub(1).min(10);
    let base = BACKOFF_BASE
        .saturating_mul(1u32 << exp)
        .min(BACKOFF_CEILING);
    let fraction = (BACKOFF_JITTER_FRACTION * jitter_widen).min(0.45);
    fuzz_duration(base, fraction).min(BACKOFF_CEILING)
}

/// Close codes that demand a cool-down: 1008 (policy violation) and the
/// venue's rate-limit close (429).
fn close_requires_cooldown(frame: Option<&CloseFrame<'_>>) -> bool {
    match frame {
        Some(f) => {
            let code: u16 = f.code.into();
            code == 1008 || code == 429
        }
        None => false,
    }
}

/// Parse one combined-stream kline envelope into a `MarketTick`.
///
/// Expected shape:
/// ```json
/// { "stream": "btcusdt@kline_1m",
///   "data": { "e": "kline", "E": 1700000000100, "s": "BTCUSDT", "k": { ... } } }
/// ```
fn parse_combined_kline(text: &str) -> Result<MarketTick> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse stream JSON")?;

    // Tolerate both the combined envelope and a bare payload.
    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    let event_type = data["e"].as_str().unwrap_or_default();
    if event_type != "kline" {
        anyhow::bail!("not a kline event: {event_type}");
    }

    let symbol = data["s"]
        .as_str()
        .context("missing field s")?
        .to_uppercase();
    let event_time_ms = data["E"].as_i64().context("missing field E")?;

    let k = &data["k"];
    let interval = k["i"].as_str().context("missing field k.i")?.to_string();

    Ok(MarketTick {
        symbol,
        interval,
        open: parse_string_decimal(&k["o"], "k.o")?,
        high: parse_string_decimal(&k["h"], "k.h")?,
        low: parse_string_decimal(&k["l"], "k.l")?,
        close: parse_string_decimal(&k["c"], "k.c")?,
        volume: parse_string_decimal(&k["v"], "k.v")?,
        event_time_ms,
        open_time_ms: k["t"].as_i64().context("missing field k.t")?,
        close_time_ms: k["T"].as_i64().context("missing field k.T")?,
        is_closed: k["x"].as_bool().context("missing field k.x")?,
    })
}

/// Helper: Binance sends numeric values as JSON strings inside kline objects.
fn parse_string_decimal(
    val: &serde_json::Value,
    name: &str,
) -> Result<rust_decimal::Decimal> {
    match val {
        serde_json::Value::String(s) => s
            .parse()
            .with_context(|| format!("failed to parse {name} as decimal: {s}")),
        serde_json::Value::Number(n) => n
            .to_string()
            .parse()
            .with_context(|| format!("field {name} is not a valid decimal")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

/// Send a close frame, then drain until the peer acknowledges or the timeout
/// expires.
async fn graceful_close(
    write: &mut (impl SinkExt<Message> + Unpin),
    read: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
) {
    let _ = write.send(Message::Close(None)).await;
    let drain = async {
        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
    };
    if tokio::time::timeout(CLOSE_TIMEOUT, drain).await.is_err() {
        debug!("close handshake timed out");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
