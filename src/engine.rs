// =============================================================================
// Engine Loop — scan → decide → execute
// =============================================================================
//
// On every scan tick: build one oracle context per tracked symbol from the
// candle buffer, ask the oracle with bounded concurrency and a per-call
// timeout (errors and timeouts degrade to HOLD), then dispatch non-HOLD
// signals to the striker one at a time so the rate limiter sees an ordered
// stream of order submissions.
//
// The loop returns an error only for fatal conditions (signature, journal,
// clock); `main` treats that as an engine halt. Everything else is logged
// and retried on the next tick.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use rust_decimal::Decimal;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::error::ExecError;
use crate::market_data::CandleKey;
use crate::notifier::Severity;
use crate::oracle::{DecisionOracle, OracleContext};
use crate::striker::Striker;
use crate::types::{Side, Signal};

/// Closed candles per interval handed to the oracle.
const CONTEXT_KLINES: usize = 50;

/// Drive scan cycles until shutdown. Returns `Err` only on fatal conditions.
pub async fn run_engine_loop(
    app: Arc<AppState>,
    oracle: Arc<dyn DecisionOracle>,
    striker: Arc<Striker>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let cfg = &app.config;
    let mut ticker = tokio::time::interval(Duration::from_secs(cfg.scan_interval_secs.max(1)));
    let oracle_timeout = Duration::from_secs(cfg.oracle_timeout_secs.max(1));
    let semaphore = Arc::new(Semaphore::new(cfg.oracle_concurrency.max(1)));

    info!(
        scan_interval_secs = cfg.scan_interval_secs,
        oracle_concurrency = cfg.oracle_concurrency,
        "engine loop started"
    );

    backfill_history(&app).await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("engine loop stopped, no new work admitted");
                    return Ok(());
                }
            }
        }

        debug!(
            used_weight = app.limiter.used_weight(),
            open_positions = app.book.len(),
            "scan tick"
        );

        // Balance for oracle context: prefer the safe-stop monitor's fresh
        // sample over an extra venue round-trip.
        let balance = match app.safestop.last_balance() {
            Some(b) => b,
            None => match app.client.get_account_balance(&cfg.quote_asset).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "balance unavailable, skipping scan tick");
                    continue;
                }
            },
        };

        // ── Decide: bounded-concurrency oracle calls ────────────────────
        let mut handles = Vec::with_capacity(cfg.symbols.len());
        for symbol in &cfg.symbols {
            let ctx = build_context(&app, symbol, balance);
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let oracle = oracle.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                decide_or_hold(oracle.as_ref(), &ctx, oracle_timeout).await
            }));
        }

        let mut signals: Vec<Signal> = Vec::with_capacity(handles.len());
        for h in handles {
            match h.await {
                Ok(signal) => signals.push(signal),
                Err(e) => warn!(error = %e, "oracle task panicked"),
            }
        }

        // ── Execute: sequential dispatch through the striker ────────────
        for signal in signals.iter().filter(|s| s.side != Side::Hold) {
            if *shutdown.borrow() {
                info!("shutdown during dispatch, remaining signals dropped");
                return Ok(());
            }

            match striker.execute(signal).await {
                Ok(report) => {
                    info!(
                        intent_id = %report.intent_id,
                        symbol = %report.symbol,
                        side = %report.side,
                        qty = %report.quantity,
                        warnings = report.warnings.len(),
                        "signal executed"
                    );
                    app.notifier.notify(
                        Severity::Info,
                        format!(
                            "entered {} {} {} @ {}",
                            report.side,
                            report.quantity,
                            report.symbol,
                            report
                                .fill_price
                                .map(|p| p.to_string())
                                .unwrap_or_else(|| "?".to_string())
                        ),
                        &["striker"],
                    );
                }
                Err(e) if e.is_fatal() => {
                    app.notifier.notify(
                        Severity::Critical,
                        format!("fatal execution error, engine halting: {e}"),
                        &["engine", "fatal"],
                    );
                    if let Some(kind) = e.fatal_kind() {
                        app.report_fatal(kind, format!("striker: {e}"));
                    }
                    return Err(anyhow!("fatal execution error: {e}"));
                }
                Err(
                    e @ (ExecError::Hold
                    | ExecError::BelowConfidence { .. }
                    | ExecError::SafeStopActive { .. }
                    | ExecError::SymbolCoolDown { .. }
                    | ExecError::NotionalCapExceeded { .. }
                    | ExecError::SizeBelowMinimum { .. }),
                ) => {
                    debug!(symbol = %signal.symbol, reason = %e, "signal gated");
                }
                Err(e) => {
                    warn!(symbol = %signal.symbol, error = %e, "execution failed");
                }
            }
        }
    }
}

/// One oracle call with a hard timeout; anything but a clean answer is HOLD.
async fn decide_or_hold(
    oracle: &dyn DecisionOracle,
    ctx: &OracleContext,
    timeout: Duration,
) -> Signal {
    match tokio::time::timeout(timeout, oracle.decide(ctx)).await {
        Ok(Ok(signal)) => signal,
        Ok(Err(e)) => {
            warn!(symbol = %ctx.symbol, error = %e, "oracle error, holding");
            Signal::hold(&ctx.symbol, format!("oracle error: {e}"))
        }
        Err(_) => {
            warn!(symbol = %ctx.symbol, timeout_secs = timeout.as_secs(), "oracle timeout, holding");
            Signal::hold(&ctx.symbol, "oracle timeout")
        }
    }
}

/// Assemble the per-symbol oracle context from shared state.
fn build_context(app: &AppState, symbol: &str, balance: Decimal) -> OracleContext {
    let mut klines = HashMap::new();
    for interval in &app.config.kline_intervals {
        let key = CandleKey {
            symbol: symbol.to_string(),
            interval: interval.clone(),
        };
        klines.insert(
            interval.clone(),
            app.candles.get_closed(&key, CONTEXT_KLINES),
        );
    }
    OracleContext {
        symbol: symbol.to_string(),
        klines,
        position: app.book.get(symbol),
        balance,
    }
}

/// Seed the candle buffer over REST so the first scan ticks have history
/// before the stream has produced enough closed candles.
async fn backfill_history(app: &Arc<AppState>) {
    for symbol in &app.config.symbols {
        for interval in &app.config.kline_intervals {
            match app
                .client
                .get_klines(symbol, interval, CONTEXT_KLINES as u32)
                .await
            {
                Ok(candles) => {
                    let key = CandleKey {
                        symbol: symbol.clone(),
                        interval: interval.clone(),
                    };
                    let count = candles.len();
                    for c in candles {
                        app.candles.update(key.clone(), c);
                    }
                    debug!(symbol, interval, count, "history backfilled");
                }
                Err(e) => {
                    warn!(symbol, interval, error = %e, "history backfill failed");
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::MockOracle;
    use async_trait::async_trait;
    use chrono::Utc;

    struct SlowOracle;

    #[async_trait]
    impl DecisionOracle for SlowOracle {
        fn name(&self) -> &str {
            "slow"
        }
        async fn decide(&self, ctx: &OracleContext) -> anyhow::Result<Signal> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Signal::hold(&ctx.symbol, "never reached"))
        }
    }

    fn empty_ctx() -> OracleContext {
        OracleContext {
            symbol: "BTCUSDT".into(),
            klines: HashMap::new(),
            position: None,
            balance: Decimal::ZERO,
        }
    }

    #[tokio::test]
    async fn oracle_timeout_degrades_to_hold() {
        let oracle = SlowOracle;
        let signal = decide_or_hold(&oracle, &empty_ctx(), Duration::from_millis(50)).await;
        assert_eq!(signal.side, Side::Hold);
        assert!(signal.reasoning.contains("timeout"));
    }

    #[tokio::test]
    async fn oracle_error_degrades_to_hold() {
        let oracle = MockOracle::failing();
        let signal = decide_or_hold(&oracle, &empty_ctx(), Duration::from_secs(5)).await;
        assert_eq!(signal.side, Side::Hold);
        assert!(signal.reasoning.contains("oracle error"));
    }

    #[tokio::test]
    async fn clean_answer_passes_through() {
        let scripted = Signal {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            confidence: 0.9,
            reasoning: "scripted".into(),
            recommended_leverage: Some(3),
            decision_time: Utc::now(),
        };
        let oracle = MockOracle::scripted([scripted]);
        let signal = decide_or_hold(&oracle, &empty_ctx(), Duration::from_secs(5)).await;
        assert_eq!(signal.side, Side::Long);
        assert_eq!(signal.recommended_leverage, Some(3));
    }
}
