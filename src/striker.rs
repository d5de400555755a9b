// =============================================================================
// Striker — approved signals become bracketed venue orders
// =============================================================================
//
// Contract, in order:
//   1. Gates: HOLD, confidence (>= accepts the boundary), safe-stop, symbol
//      cool-down, notional caps.
//   2. Sizing: risk_per_trade × balance / stop_distance, optionally scaled by
//      the Kelly fraction, clamped by max_position and rounded to the venue's
//      lot step. Sizes below min_order are rejected, never silently zeroed.
//   3. Journal INTENT in critical mode — the record is fsynced before the
//      venue ever sees the order.
//   4. Leverage set when it differs from the last value sent for the symbol.
//   5. Jitter sleep (entries are a non-urgent path), then one market order
//      with client_order_id = intent id. The market order is never retried;
//      the venue's 5 s client-order-id dedupe window covers the ambiguity,
//      and a client-side window refuses accidental resubmission too.
//   6. On fill: reduce-only STOP_MARKET and TAKE_PROFIT_MARKET brackets
//      (urgent path, no jitter, retried on the 50/200/1000 ms ladder), then
//      COMMITTED is journaled. On failure: FAILED with the venue code, and
//      the symbol cools down.
//
// A network-ambiguous market order is journaled FAILED but also nudges the
// reconciler, which will promote the intent if the order actually reached
// the venue.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::binance::models::NewOrderRequest;
use crate::binance::SymbolFilters;
use crate::error::{ExecError, VenueError};
use crate::jitter;
use crate::notifier::Severity;
use crate::types::{Intent, IntentStatus, Position, Side, Signal};
use crate::wal::{WalEntry, WriteMode};

/// Client-side resubmission guard, mirroring the venue's dedupe window.
const DUPLICATE_WINDOW: Duration = Duration::from_secs(5);

/// Bracket retry ladder (after the initial attempt).
const BRACKET_RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(50),
    Duration::from_millis(200),
    Duration::from_millis(1000),
];

/// Outcome of a successful execution.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub intent_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub fill_price: Option<Decimal>,
    pub filled_qty: Option<Decimal>,
    pub stop_order_id: Option<u64>,
    pub take_profit_order_id: Option<u64>,
    pub warnings: Vec<String>,
}

/// The execution unit. Holds the coordinator plus its own submission
/// bookkeeping.
pub struct Striker {
    app: Arc<AppState>,
    /// intent id → submission instant, for the duplicate window.
    recent_submissions: Mutex<HashMap<Uuid, Instant>>,
    /// Last leverage sent to the venue per symbol.
    leverage_sent: Mutex<HashMap<String, u32>>,
}

impl Striker {
    pub fn new(app: Arc<AppState>) -> Self {
        Self {
            app,
            recent_submissions: Mutex::new(HashMap::new()),
            leverage_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Execute one approved signal end to end.
    pub async fn execute(&self, signal: &Signal) -> Result<ExecutionReport, ExecError> {
        let cfg = &self.app.config;

        // -----------------------------------------------------------------
        // 1. Gates
        // -----------------------------------------------------------------
        check_entry_gates(
            signal,
            cfg.min_confidence,
            self.app.safestop.is_stopped(),
            self.app.safestop.stop_reason(),
            self.app.symbol_cooldown_remaining(&signal.symbol),
        )?;

        // -----------------------------------------------------------------
        // 2. Market context and sizing
        // -----------------------------------------------------------------
        let mark = self.app.client.get_mark_price(&signal.symbol).await?;
        let balance = self
            .app
            .client
            .get_account_balance(&cfg.quote_asset)
            .await?;
        let filters = self.app.filters_for(&signal.symbol).await?;

        let kelly = self.app.win_stats.read().kelly_fraction();
        let quantity = compute_position_size(
            balance,
            cfg.risk_per_trade,
            mark,
            cfg.stop_loss_pct,
            &filters,
            cfg.min_order,
            cfg.max_position,
            kelly,
        )?;

        let notional = quantity * mark;
        let symbol_notional = self
            .app
            .book
            .get(&signal.symbol)
            .map(|p| p.notional())
            .unwrap_or(Decimal::ZERO);
        if symbol_notional + notional > cfg.max_position {
            return Err(ExecError::NotionalCapExceeded {
                scope: "symbol",
                requested: symbol_notional + notional,
                cap: cfg.max_position,
            });
        }
        let global_notional = self.app.book.total_notional();
        if global_notional + notional > cfg.max_total_notional {
            return Err(ExecError::NotionalCapExceeded {
                scope: "global",
                requested: global_notional + notional,
                cap: cfg.max_total_notional,
            });
        }

        // -----------------------------------------------------------------
        // 3. Compose the intent and journal it (critical mode)
        // -----------------------------------------------------------------
        let leverage = signal
            .recommended_leverage
            .unwrap_or(cfg.leverage_default)
            .max(1);
        let (stop_loss, take_profit) =
            bracket_prices(mark, signal.side, cfg.stop_loss_pct, cfg.take_profit_pct);

        let intent = Intent {
            id: Uuid::new_v4(),
            symbol: signal.symbol.clone(),
            side: signal.side,
            quantity,
            entry_price: mark,
            stop_loss,
            take_profit,
            leverage,
            timestamp: chrono::Utc::now(),
            status: IntentStatus::Intent,
        };

        self.app
            .wal
            .append(WalEntry::snapshot(&intent), WriteMode::Critical)?;

        info!(
            intent_id = %intent.id,
            symbol = %intent.symbol,
            side = %intent.side,
            qty = %quantity,
            entry = %mark,
            stop = %stop_loss,
            take_profit = %take_profit,
            confidence = signal.confidence,
            "intent journaled, submitting"
        );

        // -----------------------------------------------------------------
        // 4. Leverage, jitter, market order
        // -----------------------------------------------------------------
        let mut warnings = Vec::new();

        if self.leverage_needs_update(&intent.symbol, leverage) {
            match self.app.client.set_leverage(&intent.symbol, leverage).await {
                Ok(()) => {
                    self.leverage_sent
                        .lock()
                        .insert(intent.symbol.clone(), leverage);
                }
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    warn!(symbol = %intent.symbol, error = %e, "leverage update failed");
                    warnings.push(format!("leverage update failed: {e}"));
                }
            }
        }

        jitter::apply().await;

        let order = NewOrderRequest::market(
            &intent.symbol,
            intent.side.order_side(),
            quantity,
            intent.id.to_string(),
        );
        let ack = match self.submit_market(intent.id, &order).await {
            Ok(ack) => ack,
            Err(e) => return self.handle_market_failure(&intent, e),
        };

        // -----------------------------------------------------------------
        // 5. Brackets (urgent path, no jitter), then COMMITTED
        // -----------------------------------------------------------------
        let (stop_order_id, take_profit_order_id) =
            match place_protective_brackets(&self.app, &intent).await {
                Ok(ids) => ids,
                Err(e) => {
                    // The position exists but is naked; the reconciler's
                    // bracket enforcement is the backstop.
                    warn!(
                        intent_id = %intent.id,
                        error = %e,
                        "bracket placement exhausted retries"
                    );
                    self.app.notifier.notify(
                        Severity::Critical,
                        format!("brackets missing for {} ({e}), reconciler will retry", intent.symbol),
                        &["striker", "brackets"],
                    );
                    warnings.push(format!("brackets missing: {e}"));
                    self.app.reconcile_nudge.notify_one();
                    (None, None)
                }
            };

        self.app.wal.append(
            WalEntry::transition(&intent, IntentStatus::Committed),
            WriteMode::Buffered,
        )?;

        self.app.book.upsert(Position {
            symbol: intent.symbol.clone(),
            side: intent.side,
            quantity: ack.executed_qty.unwrap_or(quantity),
            entry_price: ack.avg_price.filter(|p| !p.is_zero()).unwrap_or(mark),
            mark_price: mark,
            unrealized_pnl: Decimal::ZERO,
            leverage,
            is_ghost: false,
            intent_id: Some(intent.id),
        });

        info!(
            intent_id = %intent.id,
            symbol = %intent.symbol,
            order_id = ack.order_id,
            "execution committed"
        );

        Ok(ExecutionReport {
            intent_id: intent.id,
            symbol: intent.symbol.clone(),
            side: intent.side,
            quantity,
            fill_price: ack.avg_price,
            filled_qty: ack.executed_qty,
            stop_order_id,
            take_profit_order_id,
            warnings,
        })
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// One market submission, guarded by the client-side duplicate window.
    /// Never retried.
    async fn submit_market(
        &self,
        intent_id: Uuid,
        order: &NewOrderRequest,
    ) -> Result<crate::binance::OrderAck, ExecError> {
        note_submission(&mut self.recent_submissions.lock(), intent_id)?;
        self.app.client.place_order(order).await.map_err(Into::into)
    }

    /// Journal the terminal FAILED state and translate the error.
    fn handle_market_failure(
        &self,
        intent: &Intent,
        err: ExecError,
    ) -> Result<ExecutionReport, ExecError> {
        let (code, msg, ambiguous) = match &err {
            ExecError::Venue(VenueError::Rejected { code, message }) => {
                (*code, message.clone(), false)
            }
            ExecError::Venue(VenueError::Network(m)) => (0, m.clone(), true),
            other => (0, other.to_string(), false),
        };

        let entry = WalEntry::transition(intent, IntentStatus::Failed)
            .with_error(code, &msg)
            .with_reason(if ambiguous {
                "NETWORK_AMBIGUOUS"
            } else {
                "VENUE_REJECTED"
            });
        if let Err(e) = self.app.wal.append(entry, WriteMode::Buffered) {
            return Err(e.into());
        }

        self.app.start_symbol_cooldown(&intent.symbol);

        if ambiguous {
            // The order may have reached the venue; reconcile promptly
            // instead of waiting for the next cycle.
            debug!(intent_id = %intent.id, "network-ambiguous submission, nudging reconciler");
            self.app.reconcile_nudge.notify_one();
        }

        warn!(
            intent_id = %intent.id,
            symbol = %intent.symbol,
            code,
            error = %msg,
            "market order failed"
        );

        Err(err)
    }

    fn leverage_needs_update(&self, symbol: &str, leverage: u32) -> bool {
        self.leverage_sent.lock().get(symbol) != Some(&leverage)
    }
}

impl std::fmt::Debug for Striker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Striker")
            .field("recent_submissions", &self.recent_submissions.lock().len())
            .finish()
    }
}

// =============================================================================
// Free helpers (shared with the reconciler)
// =============================================================================

/// Record a submission instant for the duplicate window; refuse a resubmit
/// of the same intent id inside it.
fn note_submission(
    recent: &mut HashMap<Uuid, Instant>,
    intent_id: Uuid,
) -> Result<(), ExecError> {
    recent.retain(|_, at| at.elapsed() < DUPLICATE_WINDOW);
    if let Some(at) = recent.get(&intent_id) {
        return Err(ExecError::DuplicateSubmission {
            id: intent_id,
            elapsed_ms: at.elapsed().as_millis() as u64,
        });
    }
    recent.insert(intent_id, Instant::now());
    Ok(())
}

/// Entry gates, cheapest first. Confidence exactly at the minimum accepts.
fn check_entry_gates(
    signal: &Signal,
    min_confidence: f64,
    stopped: bool,
    stop_reason: Option<String>,
    cooldown: Option<Duration>,
) -> Result<(), ExecError> {
    if signal.side == Side::Hold {
        return Err(ExecError::Hold);
    }
    if signal.confidence < min_confidence {
        return Err(ExecError::BelowConfidence {
            confidence: signal.confidence,
            minimum: min_confidence,
        });
    }
    if stopped {
        return Err(ExecError::SafeStopActive {
            reason: stop_reason.unwrap_or_else(|| "safe-stop engaged".to_string()),
        });
    }
    if let Some(remaining) = cooldown {
        return Err(ExecError::SymbolCoolDown {
            symbol: signal.symbol.clone(),
            remaining_secs: remaining.as_secs(),
        });
    }
    Ok(())
}

/// Stop-loss / take-profit prices around an entry.
pub(crate) fn bracket_prices(
    entry: Decimal,
    side: Side,
    stop_pct: Decimal,
    tp_pct: Decimal,
) -> (Decimal, Decimal) {
    match side {
        Side::Short => (
            entry * (Decimal::ONE + stop_pct),
            entry * (Decimal::ONE - tp_pct),
        ),
        _ => (
            entry * (Decimal::ONE - stop_pct),
            entry * (Decimal::ONE + tp_pct),
        ),
    }
}

/// Size a position: `risk_per_trade × balance / stop_distance`, optionally
/// scaled by Kelly, clamped to `max_position` notional, rounded down to the
/// lot step. A result below `min_order` (or the venue's minimum quantity) is
/// an error, not zero.
#[allow(clippy::too_many_arguments)]
pub(crate) fn compute_position_size(
    balance: Decimal,
    risk_per_trade: Decimal,
    entry: Decimal,
    stop_pct: Decimal,
    filters: &SymbolFilters,
    min_order: Decimal,
    max_position: Decimal,
    kelly: Option<f64>,
) -> Result<Decimal, ExecError> {
    let stop_distance = entry * stop_pct;
    if stop_distance <= Decimal::ZERO || entry <= Decimal::ZERO {
        return Err(ExecError::SizeBelowMinimum {
            notional: Decimal::ZERO,
            min_order,
        });
    }

    let mut risk_amount = balance * risk_per_trade;
    if let Some(f) = kelly {
        let scale = Decimal::try_from(f.clamp(0.1, 1.0)).unwrap_or(Decimal::ONE);
        risk_amount *= scale;
    }

    let mut qty = risk_amount / stop_distance;

    let max_qty = max_position / entry;
    if qty > max_qty {
        qty = max_qty;
    }

    let qty = filters.round_qty(qty);
    let notional = qty * entry;

    if qty < filters.min_qty || qty <= Decimal::ZERO || notional < min_order {
        return Err(ExecError::SizeBelowMinimum { notional, min_order });
    }

    Ok(qty)
}

/// Place the reduce-only stop-loss and take-profit pair for an intent.
/// Urgent path: no jitter. Each leg retries on the 50/200/1000 ms ladder.
/// Used by the striker after a fill and by the reconciler when it finds a
/// naked position.
pub(crate) async fn place_protective_brackets(
    app: &AppState,
    intent: &Intent,
) -> Result<(Option<u64>, Option<u64>), VenueError> {
    let closing = intent.side.closing_side();

    let stop = NewOrderRequest::stop_market(
        &intent.symbol,
        closing,
        intent.quantity,
        intent.stop_loss,
    );
    let tp = NewOrderRequest::take_profit_market(
        &intent.symbol,
        closing,
        intent.quantity,
        intent.take_profit,
    );

    let stop_id = submit_with_retry(app, &stop, "stop-loss").await?;
    let tp_id = submit_with_retry(app, &tp, "take-profit").await?;

    debug!(
        intent_id = %intent.id,
        stop_order_id = stop_id,
        take_profit_order_id = tp_id,
        "brackets placed"
    );
    Ok((Some(stop_id), Some(tp_id)))
}

/// Submit one order with the bracket retry ladder. Fatal venue errors abort
/// immediately.
pub(crate) async fn submit_with_retry(
    app: &AppState,
    order: &NewOrderRequest,
    label: &str,
) -> Result<u64, VenueError> {
    let mut last_err = None;
    for (attempt, delay) in std::iter::once(Duration::ZERO)
        .chain(BRACKET_RETRY_DELAYS)
        .enumerate()
    {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match app.client.place_order(order).await {
            Ok(ack) => return Ok(ack.order_id),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(label, attempt, error = %e, "bracket submission failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| VenueError::Unknown("bracket retry exhausted".into())))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn signal(side: Side, confidence: f64) -> Signal {
        Signal {
            symbol: "BTCUSDT".into(),
            side,
            confidence,
            reasoning: "test".into(),
            recommended_leverage: None,
            decision_time: Utc::now(),
        }
    }

    fn btc_filters() -> SymbolFilters {
        SymbolFilters {
            step_size: dec!(0.001),
            min_qty: dec!(0.001),
            min_notional: dec!(100),
        }
    }

    #[test]
    fn gates_accept_confidence_exactly_at_minimum() {
        let s = signal(Side::Long, 0.75);
        assert!(check_entry_gates(&s, 0.75, false, None, None).is_ok());
    }

    #[test]
    fn gates_reject_in_order() {
        // HOLD dominates even with high confidence.
        let s = signal(Side::Hold, 0.99);
        assert!(matches!(
            check_entry_gates(&s, 0.75, false, None, None),
            Err(ExecError::Hold)
        ));

        let s = signal(Side::Long, 0.74);
        assert!(matches!(
            check_entry_gates(&s, 0.75, false, None, None),
            Err(ExecError::BelowConfidence { .. })
        ));

        let s = signal(Side::Long, 0.9);
        assert!(matches!(
            check_entry_gates(&s, 0.75, true, Some("drawdown".into()), None),
            Err(ExecError::SafeStopActive { .. })
        ));

        assert!(matches!(
            check_entry_gates(&s, 0.75, false, None, Some(Duration::from_secs(120))),
            Err(ExecError::SymbolCoolDown { .. })
        ));
    }

    #[test]
    fn bracket_prices_long_and_short() {
        // Long at 95000 with 2%/4%: stop 93100, take-profit 98800.
        let (stop, tp) = bracket_prices(dec!(95000), Side::Long, dec!(0.02), dec!(0.04));
        assert_eq!(stop, dec!(93100.00));
        assert_eq!(tp, dec!(98800.00));

        // Short at 94500 with 2%/4%: stop 96390, take-profit 90720.
        let (stop, tp) = bracket_prices(dec!(94500), Side::Short, dec!(0.02), dec!(0.04));
        assert_eq!(stop, dec!(96390.00));
        assert_eq!(tp, dec!(90720.00));
    }

    #[test]
    fn position_size_happy_path() {
        // 10000 × 0.02 / (95000 × 0.02) ≈ 0.10526, lot-rounded to 0.105.
        let qty = compute_position_size(
            dec!(10000),
            dec!(0.02),
            dec!(95000),
            dec!(0.02),
            &btc_filters(),
            dec!(10),
            dec!(1_000_000),
            None,
        )
        .unwrap();
        assert_eq!(qty, dec!(0.105));
    }

    #[test]
    fn position_size_clamped_by_max_position() {
        let qty = compute_position_size(
            dec!(1_000_000),
            dec!(0.02),
            dec!(95000),
            dec!(0.02),
            &btc_filters(),
            dec!(10),
            dec!(9500), // cap at 0.1 BTC notional
            None,
        )
        .unwrap();
        assert_eq!(qty, dec!(0.1));
    }

    #[test]
    fn position_size_below_minimum_is_rejected_not_zeroed() {
        let err = compute_position_size(
            dec!(50), // tiny balance: 50 × 0.02 / 1900 ≈ 0.0005 BTC
            dec!(0.02),
            dec!(95000),
            dec!(0.02),
            &btc_filters(),
            dec!(10),
            dec!(1_000_000),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ExecError::SizeBelowMinimum { .. }));
    }

    #[test]
    fn position_size_kelly_scales_down() {
        let full = compute_position_size(
            dec!(10000),
            dec!(0.02),
            dec!(95000),
            dec!(0.02),
            &btc_filters(),
            dec!(10),
            dec!(1_000_000),
            None,
        )
        .unwrap();
        let scaled = compute_position_size(
            dec!(10000),
            dec!(0.02),
            dec!(95000),
            dec!(0.02),
            &btc_filters(),
            dec!(10),
            dec!(1_000_000),
            Some(0.5),
        )
        .unwrap();
        assert!(scaled < full);
        assert_eq!(scaled, dec!(0.052));
    }

    #[test]
    fn duplicate_window_refuses_resubmission() {
        let mut recent = HashMap::new();
        let id = Uuid::new_v4();
        assert!(note_submission(&mut recent, id).is_ok());
        // Same id inside the 5 s window: refused.
        assert!(matches!(
            note_submission(&mut recent, id),
            Err(ExecError::DuplicateSubmission { .. })
        ));
        // A different id passes.
        assert!(note_submission(&mut recent, Uuid::new_v4()).is_ok());
    }

    #[test]
    fn position_size_kelly_floor_keeps_trading() {
        // A zero-edge Kelly still sizes at the 10% floor rather than zero.
        let qty = compute_position_size(
            dec!(100_000),
            dec!(0.02),
            dec!(95000),
            dec!(0.02),
            &btc_filters(),
            dec!(10),
            dec!(1_000_000),
            Some(0.0),
        )
        .unwrap();
        assert_eq!(qty, dec!(0.105));
    }
}
