// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batch sizing bounds and the adaptive sizing controller.
//!
//! A [`BatchPolicy`] always satisfies `1 <= min_size <= target_size <= max_size`.
//! Updates arrive as a [`BatchPolicyPatch`] and are applied as a whole or not
//! at all.
//!
//! # Adaptive Sizing
//!
//! After every flush the controller looks at how many records were sent and
//! how long the dispatch took:
//!
//! ```text
//!   rate = records / duration_ms
//!
//!   records >= target and duration < fast_flush
//!                         and rate > high_throughput_rate  → grow
//!   duration > latency_ceiling                             → shrink
//!   otherwise                                              → keep
//! ```
//!
//! Growth multiplies the target by `growth_factor` (rounded up), shrinking
//! multiplies it by `shrink_factor` (rounded down). Both are clamped to the
//! policy bounds, so repeated adjustments converge on the largest batch that
//! still flushes under the latency ceiling.

use std::time::Duration;

use tracing::{debug, warn};

use crate::constants;
use crate::error::ConfigurationError;

/// Bounds and triggers for the batch aggregator.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BatchPolicy {
    /// Current flush size. Adjusted by the adaptive controller.
    pub target_size: usize,
    pub min_size: usize,
    pub max_size: usize,
    /// Longest time the oldest buffered record may wait.
    pub max_wait: Duration,
    /// Pressure fraction in `(0, 1]` that triggers an immediate flush.
    pub memory_pressure_threshold: f64,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            target_size: constants::DEFAULT_TARGET_SIZE,
            min_size: constants::DEFAULT_MIN_SIZE,
            max_size: constants::DEFAULT_MAX_SIZE,
            max_wait: constants::DEFAULT_MAX_WAIT,
            memory_pressure_threshold: constants::DEFAULT_MEMORY_PRESSURE_THRESHOLD,
        }
    }
}

/// Partial update for a [`BatchPolicy`].
///
/// ```
/// use log_batcher::policy::{BatchPolicy, BatchPolicyPatch};
///
/// let policy = BatchPolicy::default()
///     .apply(&BatchPolicyPatch {
///         min_size: Some(1_000),
///         max_size: Some(10_000),
///         target_size: Some(5_000),
///         ..Default::default()
///     })
///     .unwrap();
/// assert_eq!(policy.target_size, 5_000);
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BatchPolicyPatch {
    pub target_size: Option<usize>,
    pub min_size: Option<usize>,
    pub max_size: Option<usize>,
    pub max_wait: Option<Duration>,
    pub memory_pressure_threshold: Option<f64>,
}

impl BatchPolicy {
    /// Checks the bounds invariant and the trigger values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidPolicy`] naming the first violation.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.min_size == 0 {
            return Err(invalid("min_size must be at least 1"));
        }
        if self.min_size > self.max_size {
            return Err(invalid(format!(
                "min_size ({}) must not exceed max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.target_size < self.min_size || self.target_size > self.max_size {
            return Err(invalid(format!(
                "target_size ({}) must be within [{}, {}]",
                self.target_size, self.min_size, self.max_size
            )));
        }
        if self.max_wait.is_zero() {
            return Err(invalid("max_wait must be greater than zero"));
        }
        let threshold = self.memory_pressure_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(invalid(format!(
                "memory_pressure_threshold ({threshold}) must be within (0, 1]"
            )));
        }
        Ok(())
    }

    /// Returns a new policy with `patch` applied, or an error leaving `self`
    /// untouched.
    ///
    /// When only the bounds change, a target that falls outside them is
    /// clamped. An explicit target outside the bounds is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidPolicy`] if the result is invalid.
    pub fn apply(&self, patch: &BatchPolicyPatch) -> Result<BatchPolicy, ConfigurationError> {
        let mut next = *self;
        if let Some(min_size) = patch.min_size {
            next.min_size = min_size;
        }
        if let Some(max_size) = patch.max_size {
            next.max_size = max_size;
        }
        if let Some(max_wait) = patch.max_wait {
            next.max_wait = max_wait;
        }
        if let Some(threshold) = patch.memory_pressure_threshold {
            next.memory_pressure_threshold = threshold;
        }
        match patch.target_size {
            Some(target_size) => next.target_size = target_size,
            None if next.min_size <= next.max_size => {
                let clamped = next.target_size.clamp(next.min_size, next.max_size);
                if clamped != next.target_size {
                    warn!(
                        "LOGS | Batch target size {} outside new bounds, clamped to {}",
                        next.target_size, clamped
                    );
                    next.target_size = clamped;
                }
            }
            None => {}
        }
        next.validate()?;
        Ok(next)
    }
}

fn invalid(reason: impl Into<String>) -> ConfigurationError {
    ConfigurationError::InvalidPolicy(reason.into())
}

/// Tuning of the closed-loop batch size controller.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AdaptiveSizing {
    /// A dispatch shorter than this counts as fast.
    pub fast_flush: Duration,
    /// Records per millisecond a fast dispatch must exceed to grow.
    pub high_throughput_rate: f64,
    /// Multiplier (> 1) applied when growing.
    pub growth_factor: f64,
    /// A dispatch longer than this shrinks the target.
    pub latency_ceiling: Duration,
    /// Multiplier in `(0, 1)` applied when shrinking.
    pub shrink_factor: f64,
}

impl Default for AdaptiveSizing {
    fn default() -> Self {
        Self {
            fast_flush: constants::DEFAULT_FAST_FLUSH,
            high_throughput_rate: constants::DEFAULT_HIGH_THROUGHPUT_RATE,
            growth_factor: constants::DEFAULT_GROWTH_FACTOR,
            latency_ceiling: constants::DEFAULT_LATENCY_CEILING,
            shrink_factor: constants::DEFAULT_SHRINK_FACTOR,
        }
    }
}

impl AdaptiveSizing {
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidConfig`] for factors that would
    /// not move the target in the intended direction.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !(self.growth_factor > 1.0 && self.growth_factor.is_finite()) {
            return Err(ConfigurationError::InvalidConfig(format!(
                "growth_factor ({}) must be greater than 1",
                self.growth_factor
            )));
        }
        if !(self.shrink_factor > 0.0 && self.shrink_factor < 1.0) {
            return Err(ConfigurationError::InvalidConfig(format!(
                "shrink_factor ({}) must be within (0, 1)",
                self.shrink_factor
            )));
        }
        if self.high_throughput_rate.is_nan() || self.high_throughput_rate < 0.0 {
            return Err(ConfigurationError::InvalidConfig(format!(
                "high_throughput_rate ({}) must be a non-negative number",
                self.high_throughput_rate
            )));
        }
        if self.fast_flush >= self.latency_ceiling {
            return Err(ConfigurationError::InvalidConfig(
                "fast_flush must be shorter than latency_ceiling".to_string(),
            ));
        }
        Ok(())
    }

    /// Target size for the next batch given the outcome of the last flush.
    ///
    /// The result is always within `[policy.min_size, policy.max_size]`.
    #[must_use]
    pub fn next_target(&self, policy: &BatchPolicy, records: usize, duration: Duration) -> usize {
        let current = policy.target_size.clamp(policy.min_size, policy.max_size);
        let duration_ms = duration.as_secs_f64() * 1_000.0;
        #[allow(clippy::cast_precision_loss)]
        let rate = records as f64 / duration_ms.max(0.001);

        // Only a batch that reached the target can grow it.
        let next = if records >= current
            && duration < self.fast_flush
            && rate > self.high_throughput_rate
            && current < policy.max_size
        {
            #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let grown = (current as f64 * self.growth_factor).ceil() as usize;
            grown.max(current + 1).min(policy.max_size)
        } else if duration > self.latency_ceiling && current > policy.min_size {
            #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let shrunk = (current as f64 * self.shrink_factor).floor() as usize;
            shrunk.min(current - 1).max(policy.min_size)
        } else {
            current
        };

        if next != current {
            debug!(
                "LOGS | Adaptive sizing: {records} records in {duration_ms:.1}ms, target {current} -> {next}"
            );
        }
        next
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy(min_size: usize, target_size: usize, max_size: usize) -> BatchPolicy {
        BatchPolicy {
            min_size,
            target_size,
            max_size,
            ..BatchPolicy::default()
        }
    }

    #[test]
    fn test_default_policy_is_valid() {
        BatchPolicy::default().validate().unwrap();
        AdaptiveSizing::default().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_bounds() {
        assert!(policy(0, 1, 10).validate().is_err());
        assert!(policy(20, 20, 10).validate().is_err());
        assert!(policy(10, 5, 100).validate().is_err());
        assert!(policy(10, 500, 100).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_triggers() {
        let zero_wait = BatchPolicy {
            max_wait: Duration::ZERO,
            ..BatchPolicy::default()
        };
        assert!(zero_wait.validate().is_err());

        for threshold in [0.0, -0.5, 1.5, f64::NAN] {
            let bad = BatchPolicy {
                memory_pressure_threshold: threshold,
                ..BatchPolicy::default()
            };
            assert!(bad.validate().is_err(), "threshold {threshold} accepted");
        }
    }

    #[test]
    fn test_apply_full_patch() {
        let patched = BatchPolicy::default()
            .apply(&BatchPolicyPatch {
                min_size: Some(1_000),
                max_size: Some(10_000),
                target_size: Some(5_000),
                max_wait: Some(Duration::from_millis(200)),
                memory_pressure_threshold: Some(0.5),
            })
            .unwrap();

        assert_eq!(patched, BatchPolicy {
            target_size: 5_000,
            min_size: 1_000,
            max_size: 10_000,
            max_wait: Duration::from_millis(200),
            memory_pressure_threshold: 0.5,
        });
    }

    #[test]
    fn test_apply_clamps_unpatched_target() {
        let patched = policy(10, 100, 1_000)
            .apply(&BatchPolicyPatch {
                min_size: Some(200),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(patched.target_size, 200);

        let patched = policy(10, 100, 1_000)
            .apply(&BatchPolicyPatch {
                max_size: Some(50),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(patched.target_size, 50);
    }

    #[test]
    fn test_apply_rejects_explicit_target_out_of_bounds() {
        let original = policy(10, 100, 1_000);

        let result = original.apply(&BatchPolicyPatch {
            target_size: Some(5_000),
            ..Default::default()
        });

        assert!(matches!(result, Err(ConfigurationError::InvalidPolicy(_))));
        assert_eq!(original.target_size, 100);
    }

    #[test]
    fn test_apply_rejects_inverted_bounds() {
        let result = policy(10, 100, 1_000).apply(&BatchPolicyPatch {
            min_size: Some(500),
            max_size: Some(400),
            ..Default::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_grow_on_fast_high_throughput_flush() {
        let sizing = AdaptiveSizing::default();
        let next = sizing.next_target(&policy(10, 100, 1_000), 100, Duration::from_millis(2));
        assert_eq!(next, 150);
    }

    #[test]
    fn test_grow_is_bounded_by_max() {
        let sizing = AdaptiveSizing::default();
        let next = sizing.next_target(&policy(10, 900, 1_000), 900, Duration::from_millis(1));
        assert_eq!(next, 1_000);
    }

    #[test]
    fn test_zero_duration_counts_as_fast() {
        let sizing = AdaptiveSizing::default();
        let next = sizing.next_target(&policy(10, 100, 1_000), 100, Duration::ZERO);
        assert_eq!(next, 150);
    }

    #[test]
    fn test_no_growth_on_low_throughput() {
        let sizing = AdaptiveSizing::default();
        // 100 records in 40ms is 2.5 records/ms.
        let next = sizing.next_target(&policy(10, 100, 1_000), 100, Duration::from_millis(40));
        assert_eq!(next, 100);
    }

    #[test]
    fn test_shrink_on_slow_flush() {
        let sizing = AdaptiveSizing::default();
        let next = sizing.next_target(&policy(10, 100, 1_000), 100, Duration::from_secs(2));
        assert_eq!(next, 50);

        let next = sizing.next_target(&policy(10, 15, 1_000), 15, Duration::from_secs(2));
        assert_eq!(next, 10);
    }

    #[test]
    fn test_steady_flush_keeps_target() {
        let sizing = AdaptiveSizing::default();
        let next = sizing.next_target(&policy(10, 100, 1_000), 100, Duration::from_millis(300));
        assert_eq!(next, 100);
    }

    #[test]
    fn test_partial_batch_never_grows_target() {
        let sizing = AdaptiveSizing::default();
        let low_volume = policy(10, 100, 1_000);

        // Two records flushed on a deadline in well under a millisecond.
        let next = sizing.next_target(&low_volume, 2, Duration::from_micros(1));
        assert_eq!(next, 100);

        let mut trickle = low_volume;
        for _ in 0..20 {
            trickle.target_size = sizing.next_target(&trickle, 2, Duration::ZERO);
        }
        assert_eq!(trickle.target_size, 100);
    }

    #[test]
    fn test_small_growth_factor_still_progresses() {
        let sizing = AdaptiveSizing {
            growth_factor: 1.001,
            ..AdaptiveSizing::default()
        };
        let next = sizing.next_target(&policy(1, 2, 10), 2, Duration::ZERO);
        assert_eq!(next, 3);
    }

    #[test]
    fn test_sizing_validate() {
        let bad_growth = AdaptiveSizing {
            growth_factor: 1.0,
            ..AdaptiveSizing::default()
        };
        assert!(bad_growth.validate().is_err());

        let bad_shrink = AdaptiveSizing {
            shrink_factor: 1.0,
            ..AdaptiveSizing::default()
        };
        assert!(bad_shrink.validate().is_err());
    }

    proptest! {
        #[test]
        fn target_stays_within_bounds(
            min_size in 1usize..500,
            span in 0usize..5_000,
            outcomes in prop::collection::vec((0usize..20_000, 0u64..3_000), 1..64),
        ) {
            let sizing = AdaptiveSizing::default();
            let mut policy = policy(min_size, min_size, min_size + span);
            for (records, millis) in outcomes {
                policy.target_size = sizing.next_target(&policy, records, Duration::from_millis(millis));
                prop_assert!(policy.target_size >= policy.min_size);
                prop_assert!(policy.target_size <= policy.max_size);
            }
        }
    }
}
