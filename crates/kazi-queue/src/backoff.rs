//! Retry backoff policy.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Delay applied before a failed job becomes eligible again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RetryBackoff {
    /// Re-queue immediately.
    None,
    /// Constant delay between attempts.
    Fixed {
        /// Delay in seconds.
        secs: u64,
    },
    /// Doubling delay with jitter, capped at a maximum.
    Exponential {
        /// Delay before the first retry, in seconds.
        base_secs: u64,
        /// Upper bound in seconds.
        max_secs: u64,
    },
}

impl Default for RetryBackoff {
    fn default() -> Self {
        RetryBackoff::Exponential {
            base_secs: 60,
            max_secs: 3600,
        }
    }
}

impl RetryBackoff {
    /// Delay before the next attempt, given how many attempts have already
    /// run. Returns `None` when the job should be eligible immediately.
    ///
    /// The exponential variant jitters the delay into `[d/2, d]` so that a
    /// burst of failures against one dependency does not retry in lockstep.
    pub fn delay(&self, attempts: u32) -> Option<Duration> {
        match *self {
            RetryBackoff::None => None,
            RetryBackoff::Fixed { secs } => Some(Duration::from_secs(secs)),
            RetryBackoff::Exponential { base_secs, max_secs } => {
                let exponent = attempts.saturating_sub(1).min(32);
                let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
                let full = base_secs.saturating_mul(factor).min(max_secs);
                let jittered = if full > 1 {
                    rand::thread_rng().gen_range(full / 2..=full)
                } else {
                    full
                };
                Some(Duration::from_secs(jittered))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_is_immediate() {
        assert_eq!(RetryBackoff::None.delay(1), None);
        assert_eq!(RetryBackoff::None.delay(10), None);
    }

    #[test]
    fn test_fixed_delay() {
        let backoff = RetryBackoff::Fixed { secs: 30 };
        assert_eq!(backoff.delay(1), Some(Duration::from_secs(30)));
        assert_eq!(backoff.delay(5), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_exponential_doubles_within_jitter_bounds() {
        let backoff = RetryBackoff::Exponential {
            base_secs: 60,
            max_secs: 3600,
        };

        for (attempts, full) in [(1u32, 60u64), (2, 120), (3, 240), (4, 480)] {
            let delay = backoff.delay(attempts).unwrap().as_secs();
            assert!(
                delay >= full / 2 && delay <= full,
                "attempt {attempts}: delay {delay} outside [{}, {full}]",
                full / 2
            );
        }
    }

    #[test]
    fn test_exponential_caps_at_max() {
        let backoff = RetryBackoff::Exponential {
            base_secs: 60,
            max_secs: 300,
        };

        let delay = backoff.delay(30).unwrap().as_secs();
        assert!(delay <= 300);
    }

    #[test]
    fn test_exponential_does_not_overflow() {
        let backoff = RetryBackoff::Exponential {
            base_secs: u64::MAX / 2,
            max_secs: u64::MAX,
        };

        assert!(backoff.delay(u32::MAX).is_some());
    }
}
