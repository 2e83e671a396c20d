//! Redelivery policy: given an attempt number, compute the next delivery
//! instant.
//!
//! Jitter is computed deterministically from the attempt number rather than
//! via an RNG, so `delay()` stays a pure function callers can assert exact
//! values against.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A redelivery backoff strategy. All three variants share the common
/// fields named in the design (`initial_delay`/`followup_delay`/
/// `multiplier`/`max_delay`/`max_redeliveries`); each variant only uses the
/// subset its formula needs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RedeliveryPolicy {
    /// `delay(n) = base`
    Fixed {
        base: Duration,
        max_redeliveries: u32,
    },
    /// `delay(n) = base + step * n`, clamped to `max`
    Linear {
        base: Duration,
        step: Duration,
        max: Duration,
        max_redeliveries: u32,
    },
    /// `delay(n) = min(max, base * multiplier^n) + jitter`
    Exponential {
        base: Duration,
        multiplier: f64,
        max: Duration,
        max_redeliveries: u32,
        /// Deterministic jitter amplitude added to the computed delay, as a
        /// fraction of the un-jittered delay (e.g. `0.1` = up to +10%).
        /// Driven by the attempt number itself rather than an RNG, so the
        /// same attempt always produces the same delay.
        jitter_fraction: f64,
    },
}

impl RedeliveryPolicy {
    pub fn fixed(base: Duration, max_redeliveries: u32) -> Self {
        RedeliveryPolicy::Fixed {
            base,
            max_redeliveries,
        }
    }

    pub fn linear(base: Duration, step: Duration, max: Duration, max_redeliveries: u32) -> Self {
        RedeliveryPolicy::Linear {
            base,
            step,
            max,
            max_redeliveries,
        }
    }

    pub fn exponential(
        base: Duration,
        multiplier: f64,
        max: Duration,
        max_redeliveries: u32,
        jitter_fraction: f64,
    ) -> Self {
        RedeliveryPolicy::Exponential {
            base,
            multiplier,
            max,
            max_redeliveries,
            jitter_fraction,
        }
    }

    pub fn max_redeliveries(&self) -> u32 {
        match self {
            RedeliveryPolicy::Fixed {
                max_redeliveries, ..
            }
            | RedeliveryPolicy::Linear {
                max_redeliveries, ..
            }
            | RedeliveryPolicy::Exponential {
                max_redeliveries, ..
            } => *max_redeliveries,
        }
    }

    /// `delay(n)` for the `n`th redelivery attempt (1-based: `n = 1` is the
    /// first redelivery after the initial failed attempt).
    pub fn delay(&self, redelivery_attempt: u32) -> Duration {
        match *self {
            RedeliveryPolicy::Fixed { base, .. } => base,
            RedeliveryPolicy::Linear {
                base, step, max, ..
            } => {
                let scaled = step.saturating_mul(redelivery_attempt);
                std::cmp::min(base + scaled, max)
            }
            RedeliveryPolicy::Exponential {
                base,
                multiplier,
                max,
                jitter_fraction,
                ..
            } => {
                let factor = multiplier.powi(redelivery_attempt as i32);
                let scaled_millis = (base.as_millis() as f64 * factor).min(max.as_millis() as f64);
                let jitter_millis = scaled_millis * jitter_fraction * jitter_seed(redelivery_attempt);
                Duration::from_millis((scaled_millis + jitter_millis).round() as u64)
            }
        }
    }

    /// Whether the given redelivery-attempt count has exhausted this policy.
    pub fn is_exhausted(&self, redelivery_attempts: u32) -> bool {
        redelivery_attempts >= self.max_redeliveries()
    }
}

/// A deterministic, attempt-indexed pseudo-jitter in `[0, 1)`. Not
/// cryptographically meaningful — only used to spread otherwise-identical
/// exponential delays across concurrent failures without pulling in a
/// dedicated RNG dependency.
fn jitter_seed(attempt: u32) -> f64 {
    let n = attempt.wrapping_mul(2_654_435_761).wrapping_add(1);
    (n % 1000) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_delay_is_constant() {
        let policy = RedeliveryPolicy::fixed(Duration::from_millis(200), 5);
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(4), Duration::from_millis(200));
    }

    #[test]
    fn linear_delay_grows_and_clamps() {
        let policy = RedeliveryPolicy::linear(
            Duration::from_millis(100),
            Duration::from_millis(50),
            Duration::from_millis(300),
            10,
        );
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(10), Duration::from_millis(300));
    }

    #[test]
    fn exponential_delay_grows_and_clamps_to_max() {
        let policy = RedeliveryPolicy::exponential(
            Duration::from_millis(100),
            2.0,
            Duration::from_millis(1_000),
            10,
            0.0,
        );
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(10), Duration::from_millis(1_000));
    }

    #[test]
    fn exhaustion_boundary_matches_spec_formula() {
        let policy = RedeliveryPolicy::fixed(Duration::from_millis(200), 5);
        assert!(!policy.is_exhausted(4));
        assert!(policy.is_exhausted(5));
    }
}
