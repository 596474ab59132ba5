// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Default limits for batching and adaptive sizing.
//!
//! These values are used by [`crate::policy::BatchPolicy::default`],
//! [`crate::policy::AdaptiveSizing::default`] and [`crate::config::LoggerConfig`]
//! when no override is configured.

use std::time::Duration;

/// Initial number of records per batch before the controller adjusts it.
pub const DEFAULT_TARGET_SIZE: usize = 100;

/// Smallest batch the adaptive controller may shrink to.
pub const DEFAULT_MIN_SIZE: usize = 10;

/// Largest batch the adaptive controller may grow to.
pub const DEFAULT_MAX_SIZE: usize = 1_000;

/// Longest time the first record of a batch may wait before a flush.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(1);

/// Fraction of the memory budget at which the aggregator flushes eagerly.
pub const DEFAULT_MEMORY_PRESSURE_THRESHOLD: f64 = 0.8;

/// Bytes of buffered records the budget probe treats as full.
///
/// # Value: 8MB
pub const DEFAULT_MEMORY_BUDGET_BYTES: usize = 8 * 1_024 * 1_024;

/// Minimum time between two reads of `/proc/meminfo`.
pub const DEFAULT_MEMORY_SAMPLE_INTERVAL: Duration = Duration::from_millis(250);

/// A flush finishing under this duration counts as fast.
pub const DEFAULT_FAST_FLUSH: Duration = Duration::from_millis(50);

/// Records per millisecond above which a fast flush lets the batch grow.
pub const DEFAULT_HIGH_THROUGHPUT_RATE: f64 = 10.0;

/// Multiplier applied to the target size when growing.
pub const DEFAULT_GROWTH_FACTOR: f64 = 1.5;

/// A flush taking longer than this shrinks the target size.
pub const DEFAULT_LATENCY_CEILING: Duration = Duration::from_secs(1);

/// Multiplier applied to the target size when shrinking.
pub const DEFAULT_SHRINK_FACTOR: f64 = 0.5;

/// Default timeout for a single HTTP transport request.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Marker emitted in place of a back-reference to an ancestor.
pub const CYCLE_MARKER: &str = "[Circular]";

/// Marker emitted for a composite value that could not be read.
pub const UNREADABLE_MARKER: &str = "[Unreadable]";
