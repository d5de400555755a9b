// =============================================================================
// Central Application State — Vela Futures Engine
// =============================================================================
//
// The single source of truth tying the subsystems together. Components never
// reference each other directly; everything flows through `Arc<AppState>`,
// which keeps the reconciler/striker/position-manager triangle acyclic.
//
// Thread safety:
//   - parking_lot locks for mutable shared collections.
//   - The safe-stop flag is a single atomic inside its own handle.
//   - Subsystem engines (WAL, venue client) manage their own interior
//     mutability and are shared as Arcs.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::Notify;
use tracing::debug;

use crate::binance::{SymbolFilters, VenueClient};
use crate::config::CoreConfig;
use crate::error::{FatalKind, VenueError};
use crate::limiter::RateLimiter;
use crate::market_data::CandleBuffer;
use crate::notifier::NotifyHandle;
use crate::positions::PositionBook;
use crate::safestop::SafeStop;
use crate::wal::Wal;

// =============================================================================
// Win-rate statistics
// =============================================================================

/// Closed-trade outcomes feeding the optional Kelly sizing fraction.
#[derive(Debug, Default, Clone)]
pub struct WinStats {
    pub trades: u32,
    pub wins: u32,
    pub gross_win: Decimal,
    pub gross_loss: Decimal,
}

/// Trades required before the Kelly fraction is trusted.
const KELLY_MIN_TRADES: u32 = 20;

impl WinStats {
    pub fn record(&mut self, pnl: Decimal) {
        self.trades += 1;
        if pnl >= Decimal::ZERO {
            self.wins += 1;
            self.gross_win += pnl;
        } else {
            self.gross_loss += -pnl;
        }
    }

    pub fn win_rate(&self) -> Option<f64> {
        if self.trades == 0 {
            return None;
        }
        Some(self.wins as f64 / self.trades as f64)
    }

    /// Average win over average loss.
    pub fn payoff_ratio(&self) -> Option<f64> {
        let losses = self.trades - self.wins;
        if self.wins == 0 || losses == 0 {
            return None;
        }
        let avg_win = (self.gross_win / Decimal::from(self.wins)).to_f64()?;
        let avg_loss = (self.gross_loss / Decimal::from(losses)).to_f64()?;
        if avg_loss <= 0.0 {
            return None;
        }
        Some(avg_win / avg_loss)
    }

    /// Kelly fraction `w − (1 − w) / r`, clamped to [0, 1]. `None` until
    /// enough trades have closed to make the estimate meaningful.
    pub fn kelly_fraction(&self) -> Option<f64> {
        if self.trades < KELLY_MIN_TRADES {
            return None;
        }
        let w = self.win_rate()?;
        let r = self.payoff_ratio()?;
        Some((w - (1.0 - w) / r).clamp(0.0, 1.0))
    }
}

// =============================================================================
// AppState
// =============================================================================

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    // ── Configuration (immutable after startup) ─────────────────────────
    pub config: CoreConfig,

    // ── Durability ──────────────────────────────────────────────────────
    pub wal: Arc<Wal>,

    // ── Venue access ────────────────────────────────────────────────────
    pub client: Arc<VenueClient>,
    pub limiter: Arc<RateLimiter>,

    // ── Market data ─────────────────────────────────────────────────────
    pub candles: Arc<CandleBuffer>,

    // ── Positions ───────────────────────────────────────────────────────
    pub book: PositionBook,

    // ── Safe-Stop ───────────────────────────────────────────────────────
    pub safestop: SafeStop,

    // ── Operator channel ────────────────────────────────────────────────
    pub notifier: NotifyHandle,

    // ── Trade statistics ────────────────────────────────────────────────
    pub win_stats: RwLock<WinStats>,

    // ── Striker bookkeeping ─────────────────────────────────────────────
    /// Symbols cooling down after a failed entry (symbol → eligible-at).
    symbol_cooldowns: Mutex<HashMap<String, Instant>>,

    /// Lot-size filter cache, fetched lazily per symbol.
    filters: RwLock<HashMap<String, SymbolFilters>>,

    // ── Reconciliation ──────────────────────────────────────────────────
    /// Poked by the striker after a network-ambiguous submission so the
    /// reconciler runs promptly instead of waiting for its next cycle.
    pub reconcile_nudge: Notify,

    // ── Fatal latch ─────────────────────────────────────────────────────
    /// First fatal condition seen by any task; `main` waits on the notify
    /// and maps the kind to an exit code.
    fatal: Mutex<Option<(FatalKind, String)>>,
    fatal_notify: Notify,

    // ── Timing ──────────────────────────────────────────────────────────
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        config: CoreConfig,
        wal: Arc<Wal>,
        client: Arc<VenueClient>,
        limiter: Arc<RateLimiter>,
        candles: Arc<CandleBuffer>,
        notifier: NotifyHandle,
    ) -> Self {
        Self {
            config,
            wal,
            client,
            limiter,
            candles,
            book: PositionBook::new(),
            safestop: SafeStop::new(),
            notifier,
            win_stats: RwLock::new(WinStats::default()),
            symbol_cooldowns: Mutex::new(HashMap::new()),
            filters: RwLock::new(HashMap::new()),
            reconcile_nudge: Notify::new(),
            fatal: Mutex::new(None),
            fatal_notify: Notify::new(),
            start_time: Instant::now(),
        }
    }

    // ── Fatal latch ─────────────────────────────────────────────────────

    /// Record the first fatal condition and wake `main`. Later reports are
    /// ignored; the first cause wins.
    pub fn report_fatal(&self, kind: FatalKind, reason: impl Into<String>) {
        let mut slot = self.fatal.lock();
        if slot.is_none() {
            *slot = Some((kind, reason.into()));
            self.fatal_notify.notify_waiters();
            self.fatal_notify.notify_one();
        }
    }

    pub fn fatal_condition(&self) -> Option<(FatalKind, String)> {
        self.fatal.lock().clone()
    }

    /// Resolve once any task reports a fatal condition.
    pub async fn fatal_signalled(&self) -> (FatalKind, String) {
        loop {
            if let Some(f) = self.fatal_condition() {
                return f;
            }
            self.fatal_notify.notified().await;
        }
    }

    // ── Symbol cool-downs ───────────────────────────────────────────────

    /// Start the configured cool-down for a symbol after a failed entry.
    pub fn start_symbol_cooldown(&self, symbol: &str) {
        let until = Instant::now() + Duration::from_secs(self.config.symbol_cooldown_secs);
        self.symbol_cooldowns
            .lock()
            .insert(symbol.to_string(), until);
        debug!(
            symbol,
            secs = self.config.symbol_cooldown_secs,
            "symbol cool-down started"
        );
    }

    /// Remaining cool-down for a symbol, if any. Expired entries are pruned.
    pub fn symbol_cooldown_remaining(&self, symbol: &str) -> Option<Duration> {
        let mut map = self.symbol_cooldowns.lock();
        match map.get(symbol) {
            Some(until) if *until > Instant::now() => Some(*until - Instant::now()),
            Some(_) => {
                map.remove(symbol);
                None
            }
            None => None,
        }
    }

    // ── Lot-size filters ────────────────────────────────────────────────

    /// Lot-size filters for a symbol, fetched once and cached.
    pub async fn filters_for(&self, symbol: &str) -> Result<SymbolFilters, VenueError> {
        if let Some(f) = self.filters.read().get(symbol) {
            return Ok(f.clone());
        }
        let fetched = self.client.get_exchange_filters(symbol).await?;
        self.filters
            .write()
            .insert(symbol.to_string(), fetched.clone());
        Ok(fetched)
    }

    /// Seed the filter cache (tests, warm boot).
    pub fn seed_filters(&self, symbol: &str, filters: SymbolFilters) {
        self.filters.write().insert(symbol.to_string(), filters);
    }

    // ── Trade statistics ────────────────────────────────────────────────

    pub fn record_trade_result(&self, pnl: Decimal) {
        let mut stats = self.win_stats.write();
        stats.record(pnl);
        debug!(
            pnl = %pnl,
            trades = stats.trades,
            wins = stats.wins,
            "trade result recorded"
        );
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("symbols", &self.config.symbols)
            .field("safestop", &self.safestop)
            .field("uptime_secs", &self.start_time.elapsed().as_secs())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn offline_app() -> (tempfile::TempDir, Arc<AppState>) {
        let dir = tempfile::tempdir().unwrap();
        let config = CoreConfig::default();
        let wal = Arc::new(Wal::open(dir.path().join("intents.log"), u64::MAX).unwrap());
        let limiter = Arc::new(RateLimiter::new(2400, 0.8));
        let client = Arc::new(VenueClient::new(
            "key",
            "secret",
            limiter.clone(),
            config.clock_drift_limit_ms,
            config.recv_window_ms,
        ));
        let candles = Arc::new(CandleBuffer::new(100));
        let (notifier, _rx) = NotifyHandle::channel();
        let app = Arc::new(AppState::new(
            config, wal, client, limiter, candles, notifier,
        ));
        (dir, app)
    }

    #[test]
    fn symbol_cooldown_expires() {
        let (_dir, app) = offline_app();
        assert!(app.symbol_cooldown_remaining("BTCUSDT").is_none());
        app.start_symbol_cooldown("BTCUSDT");
        let remaining = app
            .symbol_cooldown_remaining("BTCUSDT")
            .expect("cool-down just started");
        assert!(remaining.as_secs() <= app.config.symbol_cooldown_secs);
        assert!(app.symbol_cooldown_remaining("ETHUSDT").is_none());
    }

    #[tokio::test]
    async fn filter_cache_is_seedable() {
        let (_dir, app) = offline_app();
        app.seed_filters(
            "BTCUSDT",
            SymbolFilters {
                step_size: dec!(0.001),
                min_qty: dec!(0.001),
                min_notional: dec!(100),
            },
        );
        // A seeded symbol never goes to the venue.
        let f = app.filters_for("BTCUSDT").await.unwrap();
        assert_eq!(f.step_size, dec!(0.001));
    }

    #[test]
    fn fatal_latch_keeps_first_cause() {
        let (_dir, app) = offline_app();
        assert!(app.fatal_condition().is_none());
        app.report_fatal(FatalKind::Credentials, "bad signature");
        app.report_fatal(FatalKind::Journal, "disk full");
        let (kind, reason) = app.fatal_condition().unwrap();
        assert_eq!(kind, FatalKind::Credentials);
        assert_eq!(reason, "bad signature");
    }

    #[test]
    fn win_stats_rates() {
        let mut s = WinStats::default();
        for _ in 0..12 {
            s.record(dec!(30));
        }
        for _ in 0..8 {
            s.record(dec!(-20));
        }
        assert_eq!(s.trades, 20);
        assert!((s.win_rate().unwrap() - 0.6).abs() < 1e-9);
        assert!((s.payoff_ratio().unwrap() - 1.5).abs() < 1e-9);
        // f = 0.6 - 0.4/1.5 = 0.3333...
        let f = s.kelly_fraction().unwrap();
        assert!((f - (0.6 - 0.4 / 1.5)).abs() < 1e-9);
    }

    #[test]
    fn kelly_needs_sample_size() {
        let mut s = WinStats::default();
        for _ in 0..10 {
            s.record(dec!(10));
            // Interleave losses so both sides are populated.
        }
        for _ in 0..9 {
            s.record(dec!(-5));
        }
        assert_eq!(s.trades, 19);
        assert!(s.kelly_fraction().is_none(), "19 trades is below the floor");
        s.record(dec!(-5));
        assert!(s.kelly_fraction().is_some());
    }

    #[test]
    fn kelly_clamps_negative_edge_to_zero() {
        let mut s = WinStats::default();
        // Poor win rate with weak payoff: raw Kelly is negative.
        for _ in 0..5 {
            s.record(dec!(10));
        }
        for _ in 0..15 {
            s.record(dec!(-10));
        }
        assert_eq!(s.kelly_fraction(), Some(0.0));
    }
}
