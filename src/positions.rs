// =============================================================================
// Position Manager — live position map and health monitoring
// =============================================================================
//
// Owns the local view of open positions. The local set is always a subset of
// the venue's; each poll refreshes quantities and marks from the venue and
// detects positions that vanished through manual or external action.
//
// Each open position gets a health score on [0, 100] built from three terms:
// signed percent P&L (linear, so deeper losses always score lower), the
// short-window 5-minute trend aligned with the position side, and an optional
// oracle adjustment. Bands:
//
//   P&L <= -stop_pct   force close (stop enforcement backstop)
//   P&L >=  tp_pct     force close (profit capture backstop)
//   health < 45        close, thesis invalidated
//   health in [45,60)  warn
//   otherwise          hold
//
// Closures are reduce-only market orders on the safety path: no jitter.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::binance::NewOrderRequest;
use crate::error::VenueError;
use crate::market_data::{Candle, CandleKey};
use crate::notifier::Severity;
use crate::types::{Position, Side};
use crate::wal::{WalEntry, WriteMode};

/// Candles considered by the trend term.
const TREND_LOOKBACK: usize = 6;
/// Interval driving the trend term.
const TREND_INTERVAL: &str = "5m";

/// Health bands.
const HEALTH_CLOSE: f64 = 45.0;
const HEALTH_WARN: f64 = 60.0;

// =============================================================================
// Position book
// =============================================================================

/// Result of folding a venue snapshot into the local book.
#[derive(Debug, Default)]
pub struct VenueDiff {
    /// Local positions that no longer exist on the venue.
    pub externally_closed: Vec<Position>,
    /// Local positions refreshed from venue rows.
    pub refreshed: usize,
}

/// Thread-safe symbol → position map. Readers proceed concurrently; writers
/// (reconciler adoption, closure recording) take the write lock briefly.
pub struct PositionBook {
    positions: RwLock<HashMap<String, Position>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
        }
    }

    pub fn snapshot(&self) -> Vec<Position> {
        self.positions.read().values().cloned().collect()
    }

    pub fn get(&self, symbol: &str) -> Option<Position> {
        self.positions.read().get(symbol).cloned()
    }

    pub fn upsert(&self, position: Position) {
        self.positions
            .write()
            .insert(position.symbol.clone(), position);
    }

    pub fn remove(&self, symbol: &str) -> Option<Position> {
        self.positions.write().remove(symbol)
    }

    pub fn len(&self) -> usize {
        self.positions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.read().is_empty()
    }

    /// Sum of |quantity| × mark across the book, in quote currency.
    pub fn total_notional(&self) -> Decimal {
        self.positions
            .read()
            .values()
            .map(|p| p.notional())
            .sum()
    }

    /// Fold a venue snapshot into the book:
    ///
    /// * Known symbols are refreshed (quantity, mark, PnL) in place, keeping
    ///   local metadata (intent id, ghost flag).
    /// * Local symbols absent from the venue were closed externally and are
    ///   removed.
    /// * Venue symbols unknown locally are NOT added here; adoption is the
    ///   reconciler's decision.
    pub fn apply_venue_snapshot(&self, venue: &[Position]) -> VenueDiff {
        let mut diff = VenueDiff::default();
        let by_symbol: HashMap<&str, &Position> =
            venue.iter().map(|p| (p.symbol.as_str(), p)).collect();

        let mut map = self.positions.write();

        let known: Vec<String> = map.keys().cloned().collect();
        for symbol in known {
            match by_symbol.get(symbol.as_str()) {
                Some(remote) => {
                    let local = map.get_mut(&symbol).expect("key just listed");
                    local.quantity = remote.quantity;
                    local.side = remote.side;
                    local.entry_price = remote.entry_price;
                    local.mark_price = remote.mark_price;
                    local.unrealized_pnl = remote.unrealized_pnl;
                    local.leverage = remote.leverage;
                    diff.refreshed += 1;
                }
                None => {
                    if let Some(gone) = map.remove(&symbol) {
                        diff.externally_closed.push(gone);
                    }
                }
            }
        }

        diff
    }
}

impl Default for PositionBook {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionBook")
            .field("open", &self.len())
            .finish()
    }
}

// =============================================================================
// Health scoring
// =============================================================================

/// What to do with a position this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionAction {
    Hold,
    Warn,
    CloseUnhealthy,
    ForceCloseStop,
    ForceCloseTp,
}

/// Health on [0, 100]: baseline 50, plus a linear P&L term (percent units),
/// a trend term, and an optional oracle adjustment. The P&L term is linear,
/// which makes the score strictly monotone in adverse P&L for fixed trend
/// and oracle inputs.
pub fn health_score(pnl_pct: f64, trend: i32, oracle_adj: Option<f64>) -> f64 {
    let adj = oracle_adj.unwrap_or(0.0).clamp(-10.0, 10.0);
    (50.0 + pnl_pct * 6.0 + trend as f64 * 5.0 + adj).clamp(0.0, 100.0)
}

/// Net sign-sum of the last closed candles, aligned with the position side
/// and clamped to ±3. Positive means the short-window trend supports the
/// position.
pub fn trend_alignment(candles: &[Candle], side: Side) -> i32 {
    let window = &candles[candles.len().saturating_sub(TREND_LOOKBACK)..];
    let mut net = 0i32;
    for c in window {
        if c.close > c.open {
            net += 1;
        } else if c.close < c.open {
            net -= 1;
        }
    }
    let aligned = match side {
        Side::Long => net,
        Side::Short => -net,
        Side::Hold => 0,
    };
    aligned.clamp(-3, 3)
}

/// Apply the action bands. `pnl_frac` is the signed fractional P&L
/// (e.g. -0.02 for a 2% loss); band edges are inclusive on the force-close
/// side.
pub fn classify(
    pnl_frac: Decimal,
    stop_pct: Decimal,
    tp_pct: Decimal,
    health: f64,
) -> PositionAction {
    if pnl_frac <= -stop_pct {
        PositionAction::ForceCloseStop
    } else if pnl_frac >= tp_pct {
        PositionAction::ForceCloseTp
    } else if health < HEALTH_CLOSE {
        PositionAction::CloseUnhealthy
    } else if health < HEALTH_WARN {
        PositionAction::Warn
    } else {
        PositionAction::Hold
    }
}

// =============================================================================
// Monitor loop
// =============================================================================

/// Poll venue positions, refresh the book, and evaluate health until
/// shutdown. Spawned once at engine startup.
pub async fn run_position_monitor(app: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker =
        tokio::time::interval(Duration::from_secs(app.config.position_poll_secs.max(1)));
    info!(
        interval_secs = app.config.position_poll_secs,
        "position monitor started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("position monitor stopped");
                    return;
                }
            }
        }

        // 1. Refresh the book from the venue and record external closures.
        match app.client.get_positions().await {
            Ok(rows) => {
                let venue: Vec<Position> =
                    rows.iter().filter_map(|r| r.to_position()).collect();
                let diff = app.book.apply_venue_snapshot(&venue);
                for gone in diff.externally_closed {
                    info!(
                        symbol = %gone.symbol,
                        "position closed externally (manual or venue action)"
                    );
                    record_closed(&app, &gone, "EXTERNAL_CLOSE");
                }
            }
            Err(e) => {
                if let Some(kind) = e.fatal_kind() {
                    app.report_fatal(kind, format!("position poll: {e}"));
                    return;
                }
                warn!(error = %e, "position poll failed");
                continue;
            }
        }

        // 2. Evaluate each open position.
        let open = app.book.snapshot();
        if open.is_empty() {
            debug!("position monitor: book empty");
            continue;
        }

        for pos in open {
            let candles = app.candles.get_closed(
                &CandleKey {
                    symbol: pos.symbol.clone(),
                    interval: TREND_INTERVAL.to_string(),
                },
                TREND_LOOKBACK,
            );
            let trend = trend_alignment(&candles, pos.side);
            let pnl_frac = pos.pnl_pct();
            let pnl_pct = (pnl_frac * Decimal::ONE_HUNDRED).to_f64().unwrap_or(0.0);
            let health = health_score(pnl_pct, trend, None);

            let action = classify(
                pnl_frac,
                app.config.stop_loss_pct,
                app.config.take_profit_pct,
                health,
            );

            debug!(
                symbol = %pos.symbol,
                side = %pos.side,
                pnl_pct = format!("{pnl_pct:.3}"),
                trend,
                health = format!("{health:.1}"),
                action = ?action,
                "position evaluated"
            );

            match action {
                PositionAction::Hold => {}
                PositionAction::Warn => {
                    warn!(
                        symbol = %pos.symbol,
                        health = format!("{health:.1}"),
                        "position health degrading"
                    );
                }
                PositionAction::ForceCloseStop
                | PositionAction::ForceCloseTp
                | PositionAction::CloseUnhealthy => {
                    let reason = match action {
                        PositionAction::ForceCloseStop => "STOP_BAND",
                        PositionAction::ForceCloseTp => "TAKE_PROFIT_BAND",
                        _ => "HEALTH_INVALIDATED",
                    };
                    if let Err(e) = close_position(&app, &pos, reason).await {
                        warn!(
                            symbol = %pos.symbol,
                            reason,
                            error = %e,
                            "position close failed, retrying next cycle"
                        );
                    }
                }
            }
        }
    }
}

/// Submit a reduce-only market order opposite the position side, then record
/// CLOSED in the journal. Safety path: no jitter.
pub async fn close_position(
    app: &AppState,
    pos: &Position,
    reason: &str,
) -> Result<(), VenueError> {
    let req =
        NewOrderRequest::reduce_only_market(&pos.symbol, pos.side.closing_side(), pos.quantity);

    let ack = app.client.place_order(&req).await?;

    info!(
        symbol = %pos.symbol,
        side = %pos.side,
        qty = %pos.quantity,
        order_id = ack.order_id,
        reason,
        "position closed"
    );

    record_closed(app, pos, reason);
    app.book.remove(&pos.symbol);
    app.record_trade_result(pos.unrealized_pnl);
    app.notifier.notify(
        Severity::Info,
        format!(
            "closed {} {} {} ({reason}), pnl {}",
            pos.side, pos.quantity, pos.symbol, pos.unrealized_pnl
        ),
        &["position"],
    );

    Ok(())
}

/// Append the CLOSED transition for a position's covering intent.
fn record_closed(app: &AppState, pos: &Position, reason: &str) {
    let Some(intent_id) = pos.intent_id else {
        warn!(
            symbol = %pos.symbol,
            "position has no journal id, closure not recorded"
        );
        return;
    };

    let entry = WalEntry {
        seq: 0,
        id: intent_id,
        symbol: pos.symbol.clone(),
        side: pos.side,
        qty: pos.quantity,
        status: crate::types::IntentStatus::Closed,
        timestamp: chrono::Utc::now(),
        entry: None,
        stop: None,
        take_profit: None,
        leverage: None,
        error_code: None,
        error_msg: None,
        reason: Some(reason.to_string()),
    };

    if let Err(e) = app.wal.append(entry, WriteMode::Critical) {
        warn!(error = %e, "failed to journal position closure");
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn pos(symbol: &str, side: Side, qty: Decimal, entry: Decimal, mark: Decimal) -> Position {
        Position {
            symbol: symbol.into(),
            side,
            quantity: qty,
            entry_price: entry,
            mark_price: mark,
            unrealized_pnl: Decimal::ZERO,
            leverage: 5,
            is_ghost: false,
            intent_id: Some(Uuid::new_v4()),
        }
    }

    fn candle(open: Decimal, close: Decimal) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open,
            high: open.max(close),
            low: open.min(close),
            close,
            volume: dec!(1),
            is_closed: true,
        }
    }

    #[test]
    fn book_refreshes_and_detects_external_close() {
        let book = PositionBook::new();
        let mut local = pos("BTCUSDT", Side::Long, dec!(0.1), dec!(95000), dec!(95000));
        local.is_ghost = true;
        let id = local.intent_id;
        book.upsert(local);
        book.upsert(pos("ETHUSDT", Side::Short, dec!(1), dec!(3000), dec!(3000)));

        // Venue: BTC still open with a new mark; ETH gone.
        let venue = vec![pos(
            "BTCUSDT",
            Side::Long,
            dec!(0.1),
            dec!(95000),
            dec!(96000),
        )];
        let diff = book.apply_venue_snapshot(&venue);

        assert_eq!(diff.refreshed, 1);
        assert_eq!(diff.externally_closed.len(), 1);
        assert_eq!(diff.externally_closed[0].symbol, "ETHUSDT");

        let btc = book.get("BTCUSDT").unwrap();
        assert_eq!(btc.mark_price, dec!(96000));
        // Local metadata survives the refresh.
        assert!(btc.is_ghost);
        assert_eq!(btc.intent_id, id);
        assert!(book.get("ETHUSDT").is_none());
    }

    #[test]
    fn book_does_not_adopt_unknown_venue_positions() {
        let book = PositionBook::new();
        let venue = vec![pos(
            "SOLUSDT",
            Side::Long,
            dec!(10),
            dec!(150),
            dec!(150),
        )];
        let diff = book.apply_venue_snapshot(&venue);
        assert_eq!(diff.refreshed, 0);
        assert!(book.is_empty(), "adoption belongs to the reconciler");
    }

    #[test]
    fn total_notional_sums_at_mark() {
        let book = PositionBook::new();
        book.upsert(pos("BTCUSDT", Side::Long, dec!(0.1), dec!(90000), dec!(95000)));
        book.upsert(pos("ETHUSDT", Side::Short, dec!(2), dec!(3100), dec!(3000)));
        assert_eq!(book.total_notional(), dec!(15500));
    }

    #[test]
    fn health_is_monotone_in_adverse_pnl() {
        // Fixed trend and oracle inputs: deeper loss can never score higher.
        for trend in -3..=3 {
            let mut prev = f64::INFINITY;
            for loss in [0.0, -0.5, -1.0, -1.5, -2.0, -3.0, -5.0] {
                let h = health_score(loss, trend, None);
                assert!(
                    h <= prev,
                    "health rose from {prev} to {h} as loss deepened to {loss}"
                );
                prev = h;
            }
        }
    }

    #[test]
    fn health_stays_within_bounds() {
        assert_eq!(health_score(-100.0, -3, Some(-10.0)), 0.0);
        assert_eq!(health_score(100.0, 3, Some(10.0)), 100.0);
        assert_eq!(health_score(0.0, 0, None), 50.0);
    }

    #[test]
    fn classify_band_edges() {
        let stop = dec!(0.02);
        let tp = dec!(0.04);

        // Loss exactly at the stop band closes.
        assert_eq!(
            classify(dec!(-0.02), stop, tp, 80.0),
            PositionAction::ForceCloseStop
        );
        // Profit exactly at the take-profit band closes.
        assert_eq!(
            classify(dec!(0.04), stop, tp, 80.0),
            PositionAction::ForceCloseTp
        );
        // Health below 45 closes.
        assert_eq!(
            classify(dec!(0.0), stop, tp, 44.9),
            PositionAction::CloseUnhealthy
        );
        // Health in [45, 60) warns.
        assert_eq!(classify(dec!(0.0), stop, tp, 45.0), PositionAction::Warn);
        assert_eq!(classify(dec!(0.0), stop, tp, 59.9), PositionAction::Warn);
        // Otherwise hold.
        assert_eq!(classify(dec!(0.0), stop, tp, 60.0), PositionAction::Hold);
    }

    #[test]
    fn trend_aligns_with_side() {
        let up: Vec<Candle> = (0..6)
            .map(|i| candle(Decimal::from(100 + i), Decimal::from(101 + i)))
            .collect();
        assert_eq!(trend_alignment(&up, Side::Long), 3);
        assert_eq!(trend_alignment(&up, Side::Short), -3);
        assert_eq!(trend_alignment(&[], Side::Long), 0);

        let mixed = vec![
            candle(dec!(100), dec!(101)),
            candle(dec!(101), dec!(100)),
            candle(dec!(100), dec!(102)),
            candle(dec!(102), dec!(103)),
        ];
        assert_eq!(trend_alignment(&mixed, Side::Long), 2);
        assert_eq!(trend_alignment(&mixed, Side::Short), -2);
    }
}
