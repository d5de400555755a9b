// =============================================================================
// Circuit Breaker — fail-fast wrapper per endpoint class
// =============================================================================
//
// States: Closed (normal), Open (reject immediately), HalfOpen (admit a few
// probes). Trip criterion: 5 consecutive failures, or a 50% failure rate over
// the last 20 calls within 60 seconds. Recovery window starts at 300 s and
// doubles on every re-trip, capped at 30 minutes; three probe successes in
// HalfOpen close the circuit and reset the window.
//
// Rate-limit responses are back-pressure, not faults: callers must not record
// them here.
// =============================================================================

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::VenueError;

/// Consecutive failures that trip the breaker.
const TRIP_CONSECUTIVE: u32 = 5;
/// Rolling-window size for the failure-rate criterion.
const WINDOW_CALLS: usize = 20;
/// Only outcomes younger than this participate in the rate criterion.
const WINDOW_AGE: Duration = Duration::from_secs(60);
/// Minimum recent calls before the rate criterion can trip.
const WINDOW_MIN_CALLS: usize = 10;
/// Probe budget while half-open.
const HALF_OPEN_PROBES: u32 = 3;
/// Initial recovery window.
const RECOVERY_BASE: Duration = Duration::from_secs(300);
/// Recovery window ceiling.
const RECOVERY_CAP: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    /// (when, failed) for the last `WINDOW_CALLS` outcomes.
    outcomes: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    recovery: Duration,
    probes_in_flight: u32,
    probe_successes: u32,
}

/// One breaker per endpoint class.
pub struct CircuitBreaker {
    name: &'static str,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str) -> Self {
        Self::with_recovery(name, RECOVERY_BASE)
    }

    /// Constructor with an explicit base recovery window (tests use a short
    /// one).
    pub fn with_recovery(name: &'static str, recovery: Duration) -> Self {
        Self {
            name,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                outcomes: VecDeque::with_capacity(WINDOW_CALLS),
                opened_at: None,
                recovery,
                probes_in_flight: 0,
                probe_successes: 0,
            }),
        }
    }

    /// Gate a call. `Ok` admits it (and, in HalfOpen, reserves a probe slot);
    /// `Err(CircuitOpen)` rejects it without touching the network.
    pub fn check(&self) -> Result<(), VenueError> {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let opened_at = inner.opened_at.unwrap_or_else(Instant::now);
                if opened_at.elapsed() >= inner.recovery {
                    info!(breaker = self.name, "circuit half-open, admitting probes");
                    inner.state = CircuitState::HalfOpen;
                    inner.probes_in_flight = 1;
                    inner.probe_successes = 0;
                    Ok(())
                } else {
                    let retry_in = inner.recovery - opened_at.elapsed();
                    Err(VenueError::CircuitOpen {
                        class: self.name,
                        retry_in_secs: retry_in.as_secs().max(1),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probes_in_flight < HALF_OPEN_PROBES {
                    inner.probes_in_flight += 1;
                    Ok(())
                } else {
                    Err(VenueError::CircuitOpen {
                        class: self.name,
                        retry_in_secs: 1,
                    })
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        Self::push_outcome(&mut inner, false);

        if inner.state == CircuitState::HalfOpen {
            inner.probe_successes += 1;
            if inner.probe_successes >= HALF_OPEN_PROBES {
                info!(breaker = self.name, "circuit closed after successful probes");
                inner.state = CircuitState::Closed;
                inner.opened_at = None;
                inner.recovery = RECOVERY_BASE;
                inner.probes_in_flight = 0;
                inner.probe_successes = 0;
                inner.outcomes.clear();
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        Self::push_outcome(&mut inner, true);

        match inner.state {
            CircuitState::HalfOpen => {
                // Any probe failure reopens with a doubled window.
                let doubled = (inner.recovery * 2).min(RECOVERY_CAP);
                warn!(
                    breaker = self.name,
                    recovery_secs = doubled.as_secs(),
                    "probe failed, circuit re-opened with doubled recovery"
                );
                Self::open(&mut inner, doubled);
            }
            CircuitState::Closed => {
                let tripped = inner.consecutive_failures >= TRIP_CONSECUTIVE
                    || Self::window_rate_tripped(&inner);
                if tripped {
                    let recovery = inner.recovery;
                    warn!(
                        breaker = self.name,
                        consecutive = inner.consecutive_failures,
                        recovery_secs = recovery.as_secs(),
                        "circuit tripped open"
                    );
                    Self::open(&mut inner, recovery);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn open(inner: &mut BreakerInner, recovery: Duration) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.recovery = recovery;
        inner.probes_in_flight = 0;
        inner.probe_successes = 0;
    }

    fn push_outcome(inner: &mut BreakerInner, failed: bool) {
        if inner.outcomes.len() == WINDOW_CALLS {
            inner.outcomes.pop_front();
        }
        inner.outcomes.push_back((Instant::now(), failed));
    }

    /// 50% failure rate over the recent window (at least `WINDOW_MIN_CALLS`
    /// calls within the last 60 s).
    fn window_rate_tripped(inner: &BreakerInner) -> bool {
        let now = Instant::now();
        let recent: Vec<bool> = inner
            .outcomes
            .iter()
            .filter(|(t, _)| now.duration_since(*t) <= WINDOW_AGE)
            .map(|(_, failed)| *failed)
            .collect();
        if recent.len() < WINDOW_MIN_CALLS {
            return false;
        }
        let failures = recent.iter().filter(|f| **f).count();
        failures * 2 >= recent.len()
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("consecutive_failures", &inner.consecutive_failures)
            .field("recovery_secs", &inner.recovery.as_secs())
            .finish()
    }
}
