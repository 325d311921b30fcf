//! Exponential backoff between connect attempts

use std::time::Duration;

/// Delay before `attempt` (zero-based): `min(base * 2^attempt, cap)`.
///
/// Saturates rather than overflowing for large attempt numbers.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_until_capped() {
        let base = Duration::from_millis(500);
        let cap = Duration::from_secs(8);

        let delays: Vec<_> = (0..7).map(|a| backoff_delay(base, cap, a)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(8),
                Duration::from_secs(8),
            ]
        );
    }

    #[test]
    fn test_never_decreases() {
        let base = Duration::from_millis(300);
        let cap = Duration::from_secs(5);
        let mut previous = Duration::ZERO;
        for attempt in 0..64 {
            let delay = backoff_delay(base, cap, attempt);
            assert!(delay >= previous);
            assert!(delay <= cap);
            previous = delay;
        }
    }

    #[test]
    fn test_huge_attempt_saturates() {
        let cap = Duration::from_secs(8);
        assert_eq!(backoff_delay(Duration::from_secs(1), cap, u32::MAX), cap);
    }
}
