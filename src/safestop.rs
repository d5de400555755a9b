// =============================================================================
// Safe-Stop Monitor — equity floor and drawdown halt
// =============================================================================
//
// Polls the venue balance on a fixed cadence and flips the engine-wide state
// to STOPPED when the balance breaches an absolute floor or falls below
// `initial_balance × (1 − drawdown_limit)`. A configured kill-switch file
// forces STOPPED on sight.
//
// While STOPPED: the striker refuses every new entry, the position manager
// may still close positions, and the reconciler keeps enforcing brackets.
// Returning to RUNNING requires an explicit operator call — never automatic.
// =============================================================================

use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::notifier::Severity;

/// Engine-wide trading state, one atomic word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    Running = 0,
    Stopped = 1,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Shared Safe-Stop handle. Readers are lock-free; the balance bookkeeping
/// behind the trigger decision sits under a small mutex.
pub struct SafeStop {
    state: AtomicU8,
    initial_balance: Mutex<Option<Decimal>>,
    last_balance: Mutex<Option<Decimal>>,
    reason: Mutex<Option<String>>,
}

impl SafeStop {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(EngineState::Running as u8),
            initial_balance: Mutex::new(None),
            last_balance: Mutex::new(None),
            reason: Mutex::new(None),
        }
    }

    pub fn state(&self) -> EngineState {
        if self.state.load(Ordering::Relaxed) == EngineState::Stopped as u8 {
            EngineState::Stopped
        } else {
            EngineState::Running
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == EngineState::Stopped
    }

    pub fn stop_reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Most recent balance observation, if any.
    pub fn last_balance(&self) -> Option<Decimal> {
        *self.last_balance.lock()
    }

    /// Flip to STOPPED. Returns true when this call performed the transition.
    pub fn trip(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let was = self
            .state
            .swap(EngineState::Stopped as u8, Ordering::SeqCst);
        if was == EngineState::Running as u8 {
            warn!(reason = %reason, "SAFE-STOP TRIPPED, new entries blocked");
            *self.reason.lock() = Some(reason);
            true
        } else {
            false
        }
    }

    /// Explicit operator action. The monitor never calls this.
    pub fn resume(&self) {
        self.state
            .store(EngineState::Running as u8, Ordering::SeqCst);
        *self.reason.lock() = None;
        info!("safe-stop cleared by operator, trading resumed");
    }

    /// Record one balance sample and evaluate the triggers. The first sample
    /// becomes the drawdown baseline. Returns the breach description when a
    /// trigger fires.
    pub fn observe_balance(
        &self,
        balance: Decimal,
        min_balance: Decimal,
        drawdown_limit: Decimal,
    ) -> Option<String> {
        *self.last_balance.lock() = Some(balance);

        let initial = {
            let mut guard = self.initial_balance.lock();
            *guard.get_or_insert(balance)
        };

        if min_balance > Decimal::ZERO && balance < min_balance {
            return Some(format!(
                "balance {balance} below configured floor {min_balance}"
            ));
        }

        let cutoff = initial * (Decimal::ONE - drawdown_limit);
        if balance < cutoff {
            return Some(format!(
                "balance {balance} breached drawdown cutoff {cutoff} (initial {initial})"
            ));
        }

        None
    }
}

impl Default for SafeStop {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SafeStop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeStop")
            .field("state", &self.state())
            .field("initial_balance", &*self.initial_balance.lock())
            .field("reason", &*self.reason.lock())
            .finish()
    }
}

// =============================================================================
// Monitor loop
// =============================================================================

/// Poll balance and the kill-switch file until shutdown. Spawned once at
/// engine startup.
pub async fn run_safe_stop_monitor(app: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let cfg = &app.config;
    let mut ticker = tokio::time::interval(Duration::from_secs(
        cfg.safe_stop_check_interval_secs.max(1),
    ));
    info!(
        interval_secs = cfg.safe_stop_check_interval_secs,
        kill_switch = %cfg.kill_switch_path,
        "safe-stop monitor started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("safe-stop monitor stopped");
                    return;
                }
            }
        }

        // Kill-switch file forces STOPPED regardless of balance.
        if Path::new(&cfg.kill_switch_path).exists() {
            if app.safestop.trip("kill switch file present") {
                app.notifier.notify(
                    Severity::Critical,
                    format!("kill switch {} present, trading stopped", cfg.kill_switch_path),
                    &["safestop", "kill-switch"],
                );
            }
            continue;
        }

        let balance = match app.client.get_account_balance(&cfg.quote_asset).await {
            Ok(b) => b,
            Err(e) => {
                if let Some(kind) = e.fatal_kind() {
                    app.report_fatal(kind, format!("safe-stop balance poll: {e}"));
                    return;
                }
                warn!(error = %e, "safe-stop balance poll failed");
                continue;
            }
        };

        debug!(balance = %balance, "safe-stop balance sample");

        if let Some(breach) = app.safestop.observe_balance(
            balance,
            cfg.safe_stop_min_balance,
            cfg.safe_stop_threshold_pct,
        ) {
            if app.safestop.trip(&breach) {
                app.notifier.notify(
                    Severity::Critical,
                    format!("safe-stop triggered: {breach}"),
                    &["safestop"],
                );
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
    use rust_decimal_macros::dec;

    #[test]
    fn drawdown_breach_trips_below_cutoff() {
        let ss = SafeStop::new();
        // Baseline 100, 10% drawdown limit: cutoff is 90.
        assert!(ss
            .observe_balance(dec!(100), Decimal::ZERO, dec!(0.10))
            .is_none());
        assert!(ss
            .observe_balance(dec!(95), Decimal::ZERO, dec!(0.10))
            .is_none());
        // Exactly at the cutoff is not a breach.
        assert!(ss
            .observe_balance(dec!(90), Decimal::ZERO, dec!(0.10))
            .is_none());
        // 89.99 breaches.
        let breach = ss
            .observe_balance(dec!(89.99), Decimal::ZERO, dec!(0.10))
            .expect("89.99 must breach the 90 cutoff");
        assert!(breach.contains("89.99"));
    }

    #[test]
    fn absolute_floor_trips_independently_of_baseline() {
        let ss = SafeStop::new();
        assert!(ss
            .observe_balance(dec!(1000), dec!(500), dec!(0.90))
            .is_none());
        let breach = ss
            .observe_balance(dec!(499), dec!(500), dec!(0.90))
            .expect("floor breach");
        assert!(breach.contains("floor"));
    }

    #[test]
    fn baseline_is_first_sample_only() {
        let ss = SafeStop::new();
        assert!(ss
            .observe_balance(dec!(200), Decimal::ZERO, dec!(0.10))
            .is_none());
        // A later, higher balance does not move the baseline.
        assert!(ss
            .observe_balance(dec!(300), Decimal::ZERO, dec!(0.10))
            .is_none());
        // Cutoff remains 180 (from the 200 baseline).
        assert!(ss
            .observe_balance(dec!(181), Decimal::ZERO, dec!(0.10))
            .is_none());
        assert!(ss
            .observe_balance(dec!(179), Decimal::ZERO, dec!(0.10))
            .is_some());
    }

    #[test]
    fn trip_is_latched_until_operator_resume() {
        let ss = SafeStop::new();
        assert_eq!(ss.state(), EngineState::Running);

        assert!(ss.trip("drawdown breached"));
        assert!(ss.is_stopped());
        assert_eq!(ss.stop_reason().as_deref(), Some("drawdown breached"));

        // A second trip reports already-stopped.
        assert!(!ss.trip("again"));

        // Healthy balances never clear the latch.
        let _ = ss.observe_balance(dec!(10_000), Decimal::ZERO, dec!(0.10));
        assert!(ss.is_stopped());

        ss.resume();
        assert_eq!(ss.state(), EngineState::Running);
        assert!(ss.stop_reason().is_none());
    }
}
