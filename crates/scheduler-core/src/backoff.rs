//! Retry backoff math for [`crate::runner`].
//!
//! `min(maxBackoff, base * 2^(attempts-1)) + jitter`, jitter bounded to 30%
//! of the computed interval. Split into a deterministic part and a jitter
//! step so the deterministic part can be unit-tested without a `Rng`.

use std::time::Duration;

use rand::Rng;

/// Default base interval before the first retry: 5 minutes.
pub const DEFAULT_BASE: Duration = Duration::from_secs(5 * 60);

/// Upper bound on the jitter added to the deterministic backoff, as a
/// fraction of the computed interval.
const MAX_JITTER_FRACTION: f64 = 0.30;

/// The deterministic component: `min(max_backoff, base * 2^(attempts-1))`.
///
/// `attempts` is the 1-based count of consecutive failures; `attempts = 0`
/// is treated the same as `attempts = 1` (no doubling yet).
pub fn deterministic_backoff(attempts: u32, base: Duration, max_backoff: Duration) -> Duration {
    let exponent = attempts.saturating_sub(1).min(32);
    let multiplier = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    let scaled = base.checked_mul(multiplier as u32).unwrap_or(max_backoff);
    scaled.min(max_backoff)
}

/// Add bounded random jitter (`0..=30%`) to `interval`.
pub fn jitter(interval: Duration, rng: &mut impl Rng) -> Duration {
    let fraction = rng.random_range(0.0..=MAX_JITTER_FRACTION);
    let extra = interval.mul_f64(fraction);
    interval + extra
}

/// Full backoff computation: deterministic interval plus jitter.
pub fn compute_backoff(attempts: u32, base: Duration, max_backoff: Duration) -> Duration {
    let mut rng = rand::rng();
    jitter(deterministic_backoff(attempts, base, max_backoff), &mut rng)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_is_base() {
        let d = deterministic_backoff(1, DEFAULT_BASE, Duration::from_secs(3600));
        assert_eq!(d, DEFAULT_BASE);
    }

    #[test]
    fn doubles_per_attempt() {
        let max = Duration::from_secs(3600);
        assert_eq!(deterministic_backoff(2, DEFAULT_BASE, max), DEFAULT_BASE * 2);
        assert_eq!(deterministic_backoff(3, DEFAULT_BASE, max), DEFAULT_BASE * 4);
    }

    #[test]
    fn caps_at_max_backoff() {
        let max = Duration::from_secs(600);
        assert_eq!(deterministic_backoff(10, DEFAULT_BASE, max), max);
    }

    #[test]
    fn zero_attempts_behaves_like_one() {
        let max = Duration::from_secs(3600);
        assert_eq!(
            deterministic_backoff(0, DEFAULT_BASE, max),
            deterministic_backoff(1, DEFAULT_BASE, max)
        );
    }

    #[test]
    fn jitter_never_shrinks_and_stays_bounded() {
        let base = Duration::from_secs(100);
        let mut rng = rand::rng();
        for _ in 0..100 {
            let jittered = jitter(base, &mut rng);
            assert!(jittered >= base);
            assert!(jittered <= base + base.mul_f64(MAX_JITTER_FRACTION));
        }
    }
}
