// =============================================================================
// Decision Oracle — capability seam for entry decisions
// =============================================================================
//
// The engine treats the oracle as a black box: `decide(context) -> Signal`.
// Providers are composed behind `OracleRouter`, a priority list with
// automatic fallback — if the first provider errors, the next one is asked,
// and when every provider fails the router degrades to HOLD. Timeouts are
// enforced by the caller (engine loop), not here.
//
// Two providers ship in-repo: `LocalOracle` (a simple momentum rule, enough
// to run the engine offline) and `MockOracle` (scripted, for tests). Hosted
// LLM providers plug in through the same trait.
// =============================================================================

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::market_data::Candle;
use crate::types::{Position, Side, Signal};

/// Everything a provider may consider for one symbol.
#[derive(Debug, Clone)]
pub struct OracleContext {
    pub symbol: String,
    /// Recent closed candles per interval, oldest first.
    pub klines: HashMap<String, Vec<Candle>>,
    pub position: Option<Position>,
    pub balance: Decimal,
}

/// The decision capability. Errors are non-fatal; callers degrade to HOLD.
#[async_trait]
pub trait DecisionOracle: Send + Sync {
    fn name(&self) -> &str;

    async fn decide(&self, ctx: &OracleContext) -> Result<Signal>;

    async fn healthcheck(&self) -> bool {
        true
    }
}

// =============================================================================
// Router — priority list with automatic fallback
// =============================================================================

/// Ask providers in priority order; the first success wins. When every
/// provider fails the router answers HOLD rather than propagating an error.
pub struct OracleRouter {
    providers: Vec<Arc<dyn DecisionOracle>>,
}

impl OracleRouter {
    pub fn new(providers: Vec<Arc<dyn DecisionOracle>>) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl DecisionOracle for OracleRouter {
    fn name(&self) -> &str {
        "router"
    }

    async fn decide(&self, ctx: &OracleContext) -> Result<Signal> {
        for provider in &self.providers {
            match provider.decide(ctx).await {
                Ok(signal) => {
                    debug!(
                        provider = provider.name(),
                        symbol = %ctx.symbol,
                        side = %signal.side,
                        confidence = signal.confidence,
                        "oracle decision"
                    );
                    return Ok(signal);
                }
                Err(e) => {
                    warn!(
                        provider = provider.name(),
                        symbol = %ctx.symbol,
                        error = %e,
                        "oracle provider failed, falling back"
                    );
                }
            }
        }
        Ok(Signal::hold(&ctx.symbol, "all oracle providers failed"))
    }

    async fn healthcheck(&self) -> bool {
        for provider in &self.providers {
            if provider.healthcheck().await {
                return true;
            }
        }
        false
    }
}

// =============================================================================
// LocalOracle — momentum rule over closed candles
// =============================================================================

/// Rule-based provider: counts up- versus down-closes over a lookback window
/// of the preferred interval and signals in the direction of a strong
/// imbalance.
pub struct LocalOracle {
    interval: String,
    lookback: usize,
    /// Minimum |up − down| / lookback before a direction is signalled.
    min_imbalance: f64,
}

impl LocalOracle {
    pub fn new(interval: impl Into<String>, lookback: usize, min_imbalance: f64) -> Self {
        Self {
            interval: interval.into(),
            lookback: lookback.max(2),
            min_imbalance,
        }
    }
}

impl Default for LocalOracle {
    fn default() -> Self {
        Self::new("5m", 12, 0.5)
    }
}

#[async_trait]
impl DecisionOracle for LocalOracle {
    fn name(&self) -> &str {
        "local"
    }

    async fn decide(&self, ctx: &OracleContext) -> Result<Signal> {
        let candles = ctx
            .klines
            .get(&self.interval)
            .map(|v| v.as_slice())
            .unwrap_or_default();

        if candles.len() < self.lookback {
            return Ok(Signal::hold(
                &ctx.symbol,
                format!(
                    "insufficient history: {} of {} candles",
                    candles.len(),
                    self.lookback
                ),
            ));
        }

        let window = &candles[candles.len() - self.lookback..];
        let mut up = 0i32;
        let mut down = 0i32;
        for c in window {
            if c.close > c.open {
                up += 1;
            } else if c.close < c.open {
                down += 1;
            }
        }

        let imbalance = (up - down).abs() as f64 / self.lookback as f64;
        if imbalance < self.min_imbalance {
            return Ok(Signal::hold(
                &ctx.symbol,
                format!("momentum imbalance {imbalance:.2} below threshold"),
            ));
        }

        let side = if up > down { Side::Long } else { Side::Short };
        let confidence = (0.5 + imbalance / 2.0).min(0.95);
        Ok(Signal {
            symbol: ctx.symbol.clone(),
            side,
            confidence,
            reasoning: format!(
                "{up} up vs {down} down closes over {} {} candles",
                self.lookback, self.interval
            ),
            recommended_leverage: None,
            decision_time: Utc::now(),
        })
    }
}

// =============================================================================
// MockOracle — scripted provider for tests
// =============================================================================

/// Deterministic provider: pops scripted signals in order, HOLDs when the
/// script runs dry. `failing()` builds a provider that always errors, for
/// exercising router fallback.
pub struct MockOracle {
    script: Mutex<VecDeque<Signal>>,
    always_fail: bool,
}

impl MockOracle {
    pub fn scripted(signals: impl IntoIterator<Item = Signal>) -> Self {
        Self {
            script: Mutex::new(signals.into_iter().collect()),
            always_fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            always_fail: true,
        }
    }
}

#[async_trait]
impl DecisionOracle for MockOracle {
    fn name(&self) -> &str {
        "mock"
    }

    async fn decide(&self, ctx: &OracleContext) -> Result<Signal> {
        if self.always_fail {
            anyhow::bail!("mock oracle configured to fail");
        }
        Ok(self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Signal::hold(&ctx.symbol, "mock script exhausted")))
    }

    async fn healthcheck(&self) -> bool {
        !self.always_fail
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

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

    fn ctx_with_candles(candles: Vec<Candle>) -> OracleContext {
        let mut klines = HashMap::new();
        klines.insert("5m".to_string(), candles);
        OracleContext {
            symbol: "BTCUSDT".into(),
            klines,
            position: None,
            balance: dec!(10000),
        }
    }

    fn long_signal(confidence: f64) -> Signal {
        Signal {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            confidence,
            reasoning: "scripted".into(),
            recommended_leverage: None,
            decision_time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn local_oracle_signals_on_trend() {
        let oracle = LocalOracle::new("5m", 6, 0.5);
        // Six straight up-closes.
        let candles: Vec<Candle> = (0..6)
            .map(|i| candle(Decimal::from(100 + i), Decimal::from(101 + i)))
            .collect();
        let signal = oracle.decide(&ctx_with_candles(candles)).await.unwrap();
        assert_eq!(signal.side, Side::Long);
        assert!(signal.confidence >= 0.75);
    }

    #[tokio::test]
    async fn local_oracle_holds_on_chop() {
        let oracle = LocalOracle::new("5m", 6, 0.5);
        // Alternating closes: no imbalance.
        let candles: Vec<Candle> = (0..6)
            .map(|i| {
                if i % 2 == 0 {
                    candle(dec!(100), dec!(101))
                } else {
                    candle(dec!(101), dec!(100))
                }
            })
            .collect();
        let signal = oracle.decide(&ctx_with_candles(candles)).await.unwrap();
        assert_eq!(signal.side, Side::Hold);
    }

    #[tokio::test]
    async fn local_oracle_holds_without_history() {
        let oracle = LocalOracle::default();
        let signal = oracle.decide(&ctx_with_candles(Vec::new())).await.unwrap();
        assert_eq!(signal.side, Side::Hold);
    }

    #[tokio::test]
    async fn router_falls_back_past_failing_provider() {
        let router = OracleRouter::new(vec![
            Arc::new(MockOracle::failing()),
            Arc::new(MockOracle::scripted([long_signal(0.9)])),
        ]);
        let signal = router
            .decide(&ctx_with_candles(Vec::new()))
            .await
            .unwrap();
        assert_eq!(signal.side, Side::Long);
        assert!((signal.confidence - 0.9).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn router_degrades_to_hold_when_all_fail() {
        let router = OracleRouter::new(vec![
            Arc::new(MockOracle::failing()),
            Arc::new(MockOracle::failing()),
        ]);
        let signal = router
            .decide(&ctx_with_candles(Vec::new()))
            .await
            .unwrap();
        assert_eq!(signal.side, Side::Hold);
        assert!(!router.healthcheck().await);
    }

    #[tokio::test]
    async fn mock_script_pops_in_order_then_holds() {
        let mock = MockOracle::scripted([long_signal(0.8), long_signal(0.7)]);
        let ctx = ctx_with_candles(Vec::new());
        assert!((mock.decide(&ctx).await.unwrap().confidence - 0.8).abs() < f64::EPSILON);
        assert!((mock.decide(&ctx).await.unwrap().confidence - 0.7).abs() < f64::EPSILON);
        assert_eq!(mock.decide(&ctx).await.unwrap().side, Side::Hold);
    }
}
