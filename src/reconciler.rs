// =============================================================================
// Reconciler — resolve journal ↔ local state ↔ venue divergence
// =============================================================================
//
// SAFETY POLICY: the reconciler never cancels or closes a venue position. It
// only adds protection (brackets) and corrects the journal. When in doubt it
// adopts: a venue position with no local record becomes a GHOST_ADOPTED
// intent with safety brackets computed from the current mark price.
//
// Runs at startup, on a period, and whenever the striker nudges it after a
// network-ambiguous submission. Every step failure is logged and non-fatal;
// the next cycle retries.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::notifier::Severity;
use crate::striker::{bracket_prices, place_protective_brackets, submit_with_retry};
use crate::binance::models::NewOrderRequest;
use crate::types::{Intent, IntentStatus, Position};
use crate::wal::{WalEntry, WriteMode};

/// Quantity tolerance when matching an open intent to a venue position.
const MATCH_QTY_TOLERANCE: Decimal = dec!(0.01);

/// Summary of a single reconciliation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// Venue positions matched to an open journal intent.
    pub matched: u32,
    /// Ghost positions adopted this pass.
    pub adopted: u32,
    /// Bracket orders submitted (missing legs plus adoption pairs).
    pub brackets_placed: u32,
    /// Committed intents closed because the venue has no position.
    pub closed_no_position: u32,
    /// Pre-commit intents failed because the venue has no position.
    pub failed_no_position: u32,
    /// Non-fatal step failures, retried next cycle.
    pub errors: u32,
    /// ISO-8601 timestamp of this pass.
    pub timestamp: String,
}

// =============================================================================
// Public entry point
// =============================================================================

/// Run one reconciliation cycle.
///
/// 1. Snapshot venue positions.
/// 2. Reduce the journal to logical per-intent state.
/// 3. Match each venue position to an open intent (adopting ghosts) and make
///    sure brackets exist.
/// 4. Resolve open intents with no venue position.
/// 5. Emit a structured report.
pub async fn reconcile(app: &Arc<AppState>) -> Result<ReconcileReport> {
    let mut report = ReconcileReport {
        timestamp: Utc::now().to_rfc3339(),
        ..Default::default()
    };
    info!("reconciliation cycle started");

    // -----------------------------------------------------------------
    // 1. Venue snapshot
    // -----------------------------------------------------------------
    let rows = app
        .client
        .get_positions()
        .await
        .context("reconcile: failed to fetch venue positions")?;
    let venue_positions: Vec<Position> = rows.iter().filter_map(|r| r.to_position()).collect();

    debug!(count = venue_positions.len(), "venue positions fetched");

    // -----------------------------------------------------------------
    // 2. Journal reduction
    // -----------------------------------------------------------------
    let state = app
        .wal
        .replay_state()
        .context("reconcile: journal replay failed")?;

    let mut consumed: Vec<Uuid> = Vec::new();

    // -----------------------------------------------------------------
    // 3. Venue positions: match or adopt, then protect
    // -----------------------------------------------------------------
    for pos in &venue_positions {
        let candidates: Vec<&WalEntry> = state
            .open_for_symbol(&pos.symbol)
            .into_iter()
            .filter(|e| !consumed.contains(&e.id))
            .collect();

        match best_matching_intent(&candidates, pos) {
            Some(entry) => {
                consumed.push(entry.id);
                report.matched += 1;
                debug!(
                    symbol = %pos.symbol,
                    intent_id = %entry.id,
                    status = %entry.status,
                    "venue position matched to journal intent"
                );

                let intent = intent_from_entry(app, entry, pos);

                match ensure_brackets(app, &intent).await {
                    Ok(placed) => report.brackets_placed += placed,
                    Err(e) => {
                        warn!(symbol = %pos.symbol, error = %e, "bracket enforcement failed");
                        report.errors += 1;
                    }
                }

                // Crash window: INTENT journaled, venue filled, COMMITTED
                // never written. Promote now.
                if entry.status == IntentStatus::Intent {
                    info!(
                        intent_id = %entry.id,
                        symbol = %pos.symbol,
                        "promoting filled pre-commit intent to COMMITTED"
                    );
                    if let Err(e) = app.wal.append(
                        WalEntry::transition(&intent, IntentStatus::Committed),
                        WriteMode::Buffered,
                    ) {
                        warn!(error = %e, "failed to journal promotion");
                        report.errors += 1;
                    }
                }

                let mut local = pos.clone();
                local.intent_id = Some(entry.id);
                local.is_ghost = entry.status == IntentStatus::GhostAdopted;
                app.book.upsert(local);
            }
            None => {
                // Ghost: always adopt rather than ignore.
                match adopt_ghost(app, pos).await {
                    Ok(placed) => {
                        report.adopted += 1;
                        report.brackets_placed += placed;
                    }
                    Err(e) => {
                        warn!(symbol = %pos.symbol, error = %e, "ghost adoption failed");
                        report.errors += 1;
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // 4. Open intents with no venue position
    // -----------------------------------------------------------------
    let open_symbols: Vec<&str> = venue_positions.iter().map(|p| p.symbol.as_str()).collect();
    for entry in state.open_intents() {
        if consumed.contains(&entry.id) || open_symbols.contains(&entry.symbol.as_str()) {
            continue;
        }

        // A pre-commit intent whose order never reached the venue fails; a
        // committed one whose position is gone closes.
        let resolution = if entry.status == IntentStatus::Intent {
            report.failed_no_position += 1;
            IntentStatus::Failed
        } else {
            report.closed_no_position += 1;
            IntentStatus::Closed
        };

        info!(
            intent_id = %entry.id,
            symbol = %entry.symbol,
            from = %entry.status,
            to = %resolution,
            "resolving intent with no venue position"
        );

        let record = WalEntry {
            seq: 0,
            id: entry.id,
            symbol: entry.symbol.clone(),
            side: entry.side,
            qty: entry.qty,
            status: resolution,
            timestamp: Utc::now(),
            entry: None,
            stop: None,
            take_profit: None,
            leverage: None,
            error_code: None,
            error_msg: None,
            reason: Some("NO_EXCHANGE_POSITION".to_string()),
        };
        if let Err(e) = app.wal.append(record, WriteMode::Buffered) {
            warn!(error = %e, "failed to journal resolution");
            report.errors += 1;
        }
        app.book.remove(&entry.symbol);
    }

    // -----------------------------------------------------------------
    // 5. Report
    // -----------------------------------------------------------------
    info!(
        matched = report.matched,
        adopted = report.adopted,
        brackets_placed = report.brackets_placed,
        closed_no_position = report.closed_no_position,
        failed_no_position = report.failed_no_position,
        errors = report.errors,
        "reconciliation cycle completed"
    );

    if report.adopted > 0 {
        app.notifier.notify(
            Severity::Warning,
            format!(
                "reconciler adopted {} ghost position(s) and attached brackets",
                report.adopted
            ),
            &["reconciler", "ghost"],
        );
    }

    Ok(report)
}

/// Periodic driver: runs at startup, then on the configured interval, and
/// immediately whenever the striker nudges after an ambiguous submission.
pub async fn run_reconciler_loop(app: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_secs(app.config.reconcile_interval_secs.max(30));
    info!(interval_secs = period.as_secs(), "reconciler started");

    // Startup pass before anything trades.
    if let Err(e) = reconcile(&app).await {
        warn!(error = %e, "startup reconciliation failed");
    }

    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = app.reconcile_nudge.notified() => {
                debug!("reconciler nudged");
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("reconciler stopped");
                    return;
                }
            }
        }

        if let Err(e) = reconcile(&app).await {
            warn!(error = %e, "reconciliation failed, retrying next cycle");
        }
    }
}

// =============================================================================
// Matching and adoption
// =============================================================================

/// Pick the open intent covering a venue position: same side, quantity
/// within 1%, closest entry price wins ties.
fn best_matching_intent<'a>(
    candidates: &[&'a WalEntry],
    pos: &Position,
) -> Option<&'a WalEntry> {
    let tolerance = pos.quantity * MATCH_QTY_TOLERANCE;
    candidates
        .iter()
        .filter(|e| e.side == pos.side && (e.qty - pos.quantity).abs() <= tolerance)
        .min_by_key(|e| match e.entry {
            Some(entry) => (entry - pos.entry_price).abs(),
            None => Decimal::MAX,
        })
        .copied()
}

/// Rebuild a full intent from a journal entry, filling gaps from the venue
/// position and configured bracket percentages.
fn intent_from_entry(app: &AppState, entry: &WalEntry, pos: &Position) -> Intent {
    let entry_price = entry.entry.unwrap_or(pos.entry_price);
    let (default_stop, default_tp) = bracket_prices(
        entry_price,
        entry.side,
        app.config.stop_loss_pct,
        app.config.take_profit_pct,
    );
    Intent {
        id: entry.id,
        symbol: entry.symbol.clone(),
        side: entry.side,
        quantity: pos.quantity,
        entry_price,
        stop_loss: entry.stop.unwrap_or(default_stop),
        take_profit: entry.take_profit.unwrap_or(default_tp),
        leverage: entry.leverage.unwrap_or(app.config.leverage_default),
        timestamp: entry.timestamp,
        status: entry.status,
    }
}

/// Query open orders for the intent's symbol and submit whichever protective
/// legs are missing. Critical path: no jitter. Returns the number of legs
/// placed.
async fn ensure_brackets(app: &AppState, intent: &Intent) -> Result<u32> {
    let open = app
        .client
        .get_open_orders(Some(&intent.symbol))
        .await
        .context("failed to query open orders")?;

    let has_stop = open.iter().any(|o| o.order_type == "STOP_MARKET");
    let has_tp = open.iter().any(|o| o.order_type == "TAKE_PROFIT_MARKET");

    if has_stop && has_tp {
        return Ok(0);
    }

    let closing = intent.side.closing_side();
    let mut placed = 0;

    if !has_stop {
        warn!(symbol = %intent.symbol, "position missing stop-loss, placing");
        let order = NewOrderRequest::stop_market(
            &intent.symbol,
            closing,
            intent.quantity,
            intent.stop_loss,
        );
        submit_with_retry(app, &order, "stop-loss")
            .await
            .context("stop-loss placement failed")?;
        placed += 1;
    }

    if !has_tp {
        warn!(symbol = %intent.symbol, "position missing take-profit, placing");
        let order = NewOrderRequest::take_profit_market(
            &intent.symbol,
            closing,
            intent.quantity,
            intent.take_profit,
        );
        submit_with_retry(app, &order, "take-profit")
            .await
            .context("take-profit placement failed")?;
        placed += 1;
    }

    Ok(placed)
}

/// Adopt a venue position with no journal record: write a GHOST_ADOPTED
/// intent, attach safety brackets computed from the current mark, commit.
/// Returns the number of bracket legs placed.
async fn adopt_ghost(app: &Arc<AppState>, pos: &Position) -> Result<u32> {
    // Brackets anchor on the live mark, falling back to the snapshot's mark.
    let mark = match app.client.get_mark_price(&pos.symbol).await {
        Ok(m) => m,
        Err(e) => {
            debug!(symbol = %pos.symbol, error = %e, "mark fetch failed, using snapshot mark");
            pos.mark_price
        }
    };

    let (stop_loss, take_profit) = bracket_prices(
        mark,
        pos.side,
        app.config.stop_loss_pct,
        app.config.take_profit_pct,
    );

    let intent = Intent {
        id: Uuid::new_v4(),
        symbol: pos.symbol.clone(),
        side: pos.side,
        quantity: pos.quantity,
        entry_price: mark,
        stop_loss,
        take_profit,
        leverage: pos.leverage,
        timestamp: Utc::now(),
        status: IntentStatus::GhostAdopted,
    };

    info!(
        intent_id = %intent.id,
        symbol = %pos.symbol,
        side = %pos.side,
        qty = %pos.quantity,
        mark = %mark,
        stop = %stop_loss,
        take_profit = %take_profit,
        "adopting ghost position"
    );

    app.wal
        .append(WalEntry::snapshot(&intent), WriteMode::Critical)
        .context("failed to journal ghost adoption")?;

    match place_protective_brackets(app, &intent).await {
        Ok(_) => {}
        Err(e) => {
            app.notifier.notify(
                Severity::Critical,
                format!(
                    "ghost {} adopted but brackets failed after retries: {e}",
                    pos.symbol
                ),
                &["reconciler", "brackets"],
            );
            return Err(e).context("ghost bracket placement failed");
        }
    }

    app.wal
        .append(
            WalEntry::transition(&intent, IntentStatus::Committed),
            WriteMode::Buffered,
        )
        .context("failed to journal ghost commit")?;

    let mut local = pos.clone();
    local.is_ghost = true;
    local.intent_id = Some(intent.id);
    app.book.upsert(local);

    Ok(2)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;
    use rust_decimal_macros::dec;

    fn entry(
        symbol: &str,
        side: Side,
        qty: Decimal,
        price: Option<Decimal>,
        status: IntentStatus,
    ) -> WalEntry {
        WalEntry {
            seq: 0,
            id: Uuid::new_v4(),
            symbol: symbol.into(),
            side,
            qty,
            status,
            timestamp: Utc::now(),
            entry: price,
            stop: None,
            take_profit: None,
            leverage: Some(5),
            error_code: None,
            error_msg: None,
            reason: None,
        }
    }

    fn venue_pos(symbol: &str, side: Side, qty: Decimal, entry_price: Decimal) -> Position {
        Position {
            symbol: symbol.into(),
            side,
            quantity: qty,
            entry_price,
            mark_price: entry_price,
            unrealized_pnl: Decimal::ZERO,
            leverage: 5,
            is_ghost: false,
            intent_id: None,
        }
    }

    #[test]
    fn matching_requires_side_and_quantity_tolerance() {
        let pos = venue_pos("BTCUSDT", Side::Long, dec!(0.100), dec!(95000));

        let good = entry(
            "BTCUSDT",
            Side::Long,
            dec!(0.1005),
            Some(dec!(95010)),
            IntentStatus::Committed,
        );
        let wrong_side = entry(
            "BTCUSDT",
            Side::Short,
            dec!(0.100),
            Some(dec!(95000)),
            IntentStatus::Committed,
        );
        let too_big = entry(
            "BTCUSDT",
            Side::Long,
            dec!(0.102),
            Some(dec!(95000)),
            IntentStatus::Committed,
        );

        let candidates = vec![&wrong_side, &too_big, &good];
        let m = best_matching_intent(&candidates, &pos).expect("good candidate matches");
        assert_eq!(m.id, good.id);
    }

    #[test]
    fn matching_breaks_ties_by_closest_entry_price() {
        let pos = venue_pos("BTCUSDT", Side::Long, dec!(0.100), dec!(95000));

        let near = entry(
            "BTCUSDT",
            Side::Long,
            dec!(0.100),
            Some(dec!(95020)),
            IntentStatus::Committed,
        );
        let far = entry(
            "BTCUSDT",
            Side::Long,
            dec!(0.100),
            Some(dec!(96000)),
            IntentStatus::Committed,
        );
        let no_price = entry("BTCUSDT", Side::Long, dec!(0.100), None, IntentStatus::Intent);

        let candidates = vec![&far, &no_price, &near];
        let m = best_matching_intent(&candidates, &pos).unwrap();
        assert_eq!(m.id, near.id);
    }

    #[test]
    fn matching_none_when_nothing_fits() {
        let pos = venue_pos("BTCUSDT", Side::Long, dec!(0.100), dec!(95000));
        let other_symbol_only = entry(
            "BTCUSDT",
            Side::Short,
            dec!(0.5),
            Some(dec!(95000)),
            IntentStatus::Committed,
        );
        let candidates = vec![&other_symbol_only];
        assert!(best_matching_intent(&candidates, &pos).is_none());
    }

    #[test]
    fn ghost_bracket_arithmetic_matches_contract() {
        // Short 0.01 BTC adopted at mark 94500 with 2%/4%:
        // stop 96390 (above), take-profit 90720 (below).
        let (stop, tp) = bracket_prices(dec!(94500), Side::Short, dec!(0.02), dec!(0.04));
        assert_eq!(stop, dec!(96390));
        assert_eq!(tp, dec!(90720));
    }
}
