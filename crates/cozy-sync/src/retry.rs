// SPDX-License-Identifier: MIT OR Apache-2.0
//! Exponential backoff for transient executor errors.

use cozy_config::RetryConfig;
use std::time::{Duration, SystemTime};

/// Compute the backoff delay for a given zero-indexed attempt number.
///
/// Jitter is derived from the system clock's sub-second nanoseconds mixed
/// with the attempt index rather than a dedicated RNG crate — cheap, and
/// plenty unpredictable for spreading out retries after an outage.
#[must_use]
pub fn compute_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exp = 2u64.saturating_pow(attempt);
    let base_ms = config.base_delay().as_millis() as u64;
    let capped_ms = base_ms
        .saturating_mul(exp)
        .min(config.max_delay().as_millis() as u64);

    let jitter_factor = config.jitter_factor.clamp(0.0, 1.0);
    if jitter_factor <= 0.0 || capped_ms == 0 {
        return Duration::from_millis(capped_ms);
    }

    let jitter_range = (capped_ms as f64 * jitter_factor) as u64;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let pseudo = nanos.wrapping_mul(attempt as u64 + 1);
    let jitter = if jitter_range > 0 {
        pseudo % jitter_range
    } else {
        0
    };
    Duration::from_millis(capped_ms.saturating_sub(jitter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially_until_capped() {
        let config = RetryConfig {
            max_attempts: 16,
            base_delay_secs: 1,
            max_delay_secs: 300,
            jitter_factor: 0.0,
        };
        assert_eq!(compute_delay(&config, 0), Duration::from_secs(1));
        assert_eq!(compute_delay(&config, 1), Duration::from_secs(2));
        assert_eq!(compute_delay(&config, 2), Duration::from_secs(4));
        assert_eq!(compute_delay(&config, 10), Duration::from_secs(300));
    }

    #[test]
    fn jitter_never_exceeds_the_nominal_delay() {
        let config = RetryConfig {
            max_attempts: 16,
            base_delay_secs: 10,
            max_delay_secs: 300,
            jitter_factor: 1.0,
        };
        for attempt in 0..8 {
            let delay = compute_delay(&config, attempt);
            assert!(delay <= Duration::from_secs(300));
        }
    }

    #[test]
    fn zero_jitter_factor_is_deterministic() {
        let config = RetryConfig {
            max_attempts: 16,
            base_delay_secs: 1,
            max_delay_secs: 300,
            jitter_factor: 0.0,
        };
        let a = compute_delay(&config, 3);
        let b = compute_delay(&config, 3);
        assert_eq!(a, b);
    }
}
