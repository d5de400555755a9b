// =============================================================================
// Jitter — randomized pre-order delay
// =============================================================================
//
// Non-urgent submissions (entries, ordinary cancellations) sleep for a small
// random delay before hitting the venue so that order timing does not form a
// machine-recognisable pattern. Urgent paths (stop-loss, safety close,
// adoption brackets) never pass through here; latency there is minimized.
// =============================================================================

use std::time::Duration;

use rand::Rng;

/// Mean of the jitter distribution in milliseconds.
const JITTER_MEAN_MS: f64 = 15.0;
/// Standard deviation in milliseconds.
const JITTER_SD_MS: f64 = 5.0;
/// Hard clamp bounds.
const JITTER_MIN_MS: f64 = 1.0;
const JITTER_MAX_MS: f64 = 30.0;

/// Draw one delay from a truncated normal distribution
/// (mean 15 ms, sd 5 ms, clamped to [1 ms, 30 ms]).
pub fn sample_delay() -> Duration {
    let mut rng = rand::thread_rng();
    let ms = (JITTER_MEAN_MS + JITTER_SD_MS * standard_normal(&mut rng))
        .clamp(JITTER_MIN_MS, JITTER_MAX_MS);
    Duration::from_micros((ms * 1000.0) as u64)
}

/// Sleep for one sampled jitter delay.
pub async fn apply() {
    tokio::time::sleep(sample_delay()).await;
}

/// One standard-normal sample via the Box–Muller transform.
fn standard_normal<R: Rng>(rng: &mut R) -> f64 {
    // u1 in (0, 1] so the log is finite.
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

/// Apply a symmetric random fraction to `base`, e.g. `fraction = 0.15` yields
/// a value in `[base × 0.85, base × 1.15]`. Used by the stream manager's
/// reconnect backoff.
pub fn fuzz_duration(base: Duration, fraction: f64) -> Duration {
    let mut rng = rand::thread_rng();
    let f: f64 = rng.gen_range(-fraction..=fraction);
    let ms = base.as_millis() as f64 * (1.0 + f);
    Duration::from_millis(ms.max(0.0) as u64)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_stay_within_clamp() {
        for _ in 0..5_000 {
            let d = sample_delay();
            let ms = d.as_secs_f64() * 1000.0;
            assert!(
                (JITTER_MIN_MS..=JITTER_MAX_MS).contains(&ms),
                "jitter {ms}ms out of bounds"
            );
        }
    }

    #[test]
    fn sample_mean_is_near_fifteen_ms() {
        let n = 20_000;
        let total: f64 = (0..n)
            .map(|_| sample_delay().as_secs_f64() * 1000.0)
            .sum();
        let mean = total / n as f64;
        // Truncation pulls the mean slightly, so the window is generous.
        assert!(
            (13.0..=17.0).contains(&mean),
            "sample mean {mean}ms too far from 15ms"
        );
    }

    #[test]
    fn fuzz_stays_within_fraction() {
        let base = Duration::from_secs(10);
        for _ in 0..1_000 {
            let d = fuzz_duration(base, 0.15);
            let ms = d.as_millis();
            assert!(
                (8_500..=11_500).contains(&ms),
                "fuzzed duration {ms}ms outside ±15% of 10s"
            );
        }
    }

    #[test]
    fn standard_normal_is_roughly_centred() {
        let mut rng = rand::thread_rng();
        let n = 50_000;
        let sum: f64 = (0..n).map(|_| standard_normal(&mut rng)).sum();
        let mean = sum / n as f64;
        assert!(mean.abs() < 0.05, "normal sample mean {mean} off centre");
    }
}
