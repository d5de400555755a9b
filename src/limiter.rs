// =============================================================================
// Rate Limiter — venue request budget enforcement
// =============================================================================
//
// Two layers, both synchronized behind one monitor:
//
//   1. A token bucket per endpoint class caps request frequency.
//   2. A global weight accumulator tracks the venue's per-minute weight
//      budget. Every response's used-weight header re-syncs the accumulator
//      to the venue's ground truth; once the soft threshold (a configured
//      fraction of the documented cap) is reached, callers block until the
//      minute window rolls over.
//
// On HTTP 429/418 the limiter enters cool-down for Retry-After (120 s when
// the header is absent). Rate-limit responses never count as circuit-breaker
// failures; back-pressure and breaking are separate concerns.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Venue-documented request-weight cap per minute for USDⓈ-M futures.
pub const WEIGHT_CAP_PER_MIN: u32 = 2400;

/// Cool-down applied when a 429/418 response carries no Retry-After header.
const DEFAULT_COOLDOWN_SECS: u64 = 120;

/// Endpoint classes with independent frequency budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    /// Order placement, cancellation, leverage changes.
    Order,
    /// Account, balance, position queries.
    Account,
    /// Public market data (klines, mark price, server time).
    MarketData,
}

impl EndpointClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Order => "order",
            Self::Account => "account",
            Self::MarketData => "market_data",
        }
    }

    /// (refill per second, burst capacity) for the class token bucket.
    fn bucket_params(&self) -> (f64, f64) {
        match self {
            Self::Order => (4.0, 8.0),
            Self::Account => (4.0, 8.0),
            Self::MarketData => (10.0, 20.0),
        }
    }
}

impl std::fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

struct ClassBucket {
    tokens: f64,
    last_refill: Instant,
}

struct LimiterInner {
    used_weight: u32,
    window_start: Instant,
    cooldown_until: Option<Instant>,
    buckets: HashMap<EndpointClass, ClassBucket>,
}

/// Shared monitor every venue-bound call synchronizes through.
pub struct RateLimiter {
    weight_cap_per_min: u32,
    soft_ratio: f64,
    inner: Mutex<LimiterInner>,
}

impl RateLimiter {
    pub fn new(weight_cap_per_min: u32, soft_ratio: f64) -> Self {
        Self {
            weight_cap_per_min,
            soft_ratio,
            inner: Mutex::new(LimiterInner {
                used_weight: 0,
                window_start: Instant::now(),
                cooldown_until: None,
                buckets: HashMap::new(),
            }),
        }
    }

    /// Block until the call is admissible, then account for it.
    pub async fn acquire(&self, class: EndpointClass, weight: u32) {
        loop {
            match self.try_admit(class, weight) {
                None => return,
                Some(wait) => {
                    debug!(class = %class, wait_ms = wait.as_millis() as u64, "rate limiter backing off");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Re-sync the weight accumulator to the venue's reported ground truth.
    pub fn record_used_weight(&self, venue_used: u32) {
        let mut inner = self.inner.lock();
        Self::roll_window(&mut inner);
        if venue_used > inner.used_weight {
            inner.used_weight = venue_used;
        }
    }

    /// Enter cool-down after a 429/418 response.
    pub fn on_rate_limited(&self, retry_after_secs: Option<u64>) {
        let secs = retry_after_secs.unwrap_or(DEFAULT_COOLDOWN_SECS);
        let mut inner = self.inner.lock();
        let until = Instant::now() + Duration::from_secs(secs);
        inner.cooldown_until = Some(until);
        warn!(cooldown_secs = secs, "rate limiter entering cool-down");
    }

    /// Whether the limiter is currently in a 429-induced cool-down.
    pub fn in_cooldown(&self) -> bool {
        let inner = self.inner.lock();
        matches!(inner.cooldown_until, Some(t) if t > Instant::now())
    }

    /// Current accumulator value (for reporting).
    pub fn used_weight(&self) -> u32 {
        let mut inner = self.inner.lock();
        Self::roll_window(&mut inner);
        inner.used_weight
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Admit the call now (None) or report how long to wait (Some).
    fn try_admit(&self, class: EndpointClass, weight: u32) -> Option<Duration> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        // 1. Cool-down dominates everything.
        if let Some(until) = inner.cooldown_until {
            if until > now {
                return Some(until - now);
            }
            inner.cooldown_until = None;
        }

        Self::roll_window(&mut inner);

        // 2. Soft weight threshold: block until the minute window rolls.
        let soft_cap = (self.weight_cap_per_min as f64 * self.soft_ratio) as u32;
        if inner.used_weight.saturating_add(weight) > soft_cap {
            let window_end = inner.window_start + Duration::from_secs(60);
            let wait = window_end.saturating_duration_since(now);
            return Some(wait.max(Duration::from_millis(50)));
        }

        // 3. Class token bucket.
        let (rate, burst) = class.bucket_params();
        let bucket = inner.buckets.entry(class).or_insert(ClassBucket {
            tokens: burst,
            last_refill: now,
        });
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(burst);
        bucket.last_refill = now;

        if bucket.tokens < 1.0 {
            let deficit = 1.0 - bucket.tokens;
            return Some(Duration::from_secs_f64(deficit / rate));
        }

        bucket.tokens -= 1.0;
        inner.used_weight = inner.used_weight.saturating_add(weight);
        None
    }

    fn roll_window(inner: &mut LimiterInner) {
        if inner.window_start.elapsed() >= Duration::from_secs(60) {
            inner.used_weight = 0;
            inner.window_start = Instant::now();
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("RateLimiter")
            .field("weight_cap_per_min", &self.weight_cap_per_min)
            .field("soft_ratio", &self.soft_ratio)
            .field("used_weight", &inner.used_weight)
            .field("in_cooldown", &inner.cooldown_until.is_some())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_when_budget_is_clear() {
        let limiter = RateLimiter::new(2400, 0.8);
        assert!(limiter.try_admit(EndpointClass::Account, 5).is_none());
        assert_eq!(limiter.used_weight(), 5);
    }

    #[test]
    fn soft_threshold_blocks_until_window_rolls() {
        let limiter = RateLimiter::new(100, 0.8);
        // Ground truth says 79 weight used; 5 more would cross the 80 soft cap.
        limiter.record_used_weight(79);
        let wait = limiter.try_admit(EndpointClass::Account, 5);
        assert!(wait.is_some(), "call crossing the soft cap must block");
        assert!(wait.unwrap() <= Duration::from_secs(60));

        // A 1-weight call still fits under the cap.
        assert!(limiter.try_admit(EndpointClass::Account, 1).is_none());
    }

    #[test]
    fn venue_header_is_ground_truth_upwards_only() {
        let limiter = RateLimiter::new(2400, 0.8);
        assert!(limiter.try_admit(EndpointClass::Account, 10).is_none());
        // Venue reports more than we counted locally.
        limiter.record_used_weight(500);
        assert_eq!(limiter.used_weight(), 500);
        // Venue reporting less must not erase local accounting.
        limiter.record_used_weight(100);
        assert_eq!(limiter.used_weight(), 500);
    }

    #[test]
    fn cooldown_blocks_all_classes() {
        let limiter = RateLimiter::new(2400, 0.8);
        limiter.on_rate_limited(Some(30));
        assert!(limiter.in_cooldown());

        for class in [
            EndpointClass::Order,
            EndpointClass::Account,
            EndpointClass::MarketData,
        ] {
            let wait = limiter.try_admit(class, 1).expect("cool-down must block");
            assert!(wait > Duration::from_secs(28) && wait <= Duration::from_secs(30));
        }
    }

    #[test]
    fn cooldown_defaults_to_120s_without_retry_after() {
        let limiter = RateLimiter::new(2400, 0.8);
        limiter.on_rate_limited(None);
        let wait = limiter
            .try_admit(EndpointClass::MarketData, 1)
            .expect("cool-down must block");
        assert!(wait > Duration::from_secs(118) && wait <= Duration::from_secs(120));
    }

    #[test]
    fn class_bucket_exhausts_and_reports_wait() {
        let limiter = RateLimiter::new(2400, 0.8);
        // Drain the burst capacity.
        let (_, burst) = EndpointClass::Order.bucket_params();
        for _ in 0..burst as usize {
            assert!(limiter.try_admit(EndpointClass::Order, 1).is_none());
        }
        let wait = limiter
            .try_admit(EndpointClass::Order, 1)
            .expect("exhausted bucket must block");
        assert!(wait > Duration::ZERO && wait <= Duration::from_secs(1));

        // Another class is unaffected.
        assert!(limiter.try_admit(EndpointClass::MarketData, 1).is_none());
    }
}
