// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Memory pressure probes consulted on every append.
//!
//! A probe returns a pressure fraction, where `0.0` means no pressure and
//! `1.0` means the budget is exhausted. The aggregator compares it against
//! the policy's `memory_pressure_threshold` and flushes immediately when the
//! threshold is reached.
//!
//! Probes are called while the aggregator holds its buffer lock, so they must
//! be cheap and must never block on I/O for long:
//! - [`BufferBudgetProbe`] divides the estimated size of buffered records by a
//!   fixed byte budget. Pure arithmetic, portable, the default.
//! - [`ProcMeminfoProbe`] reads `/proc/meminfo` on Linux hosts, at most once
//!   per sample interval, and reuses the last value in between.

use std::fmt::Debug;
use std::fs::File;
use std::io::{self, BufRead};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::constants;

const PROC_MEMINFO_PATH: &str = "/proc/meminfo";

/// Source of the memory pressure reading.
pub trait MemoryProbe: Debug + Send + Sync {
    /// Current pressure in `[0.0, 1.0]`.
    ///
    /// `buffered_bytes` is the estimated size of the records currently held
    /// by the aggregator, including the record just appended.
    fn pressure(&self, buffered_bytes: usize) -> f64;
}

/// Pressure as the share of a fixed byte budget used by buffered records.
#[derive(Debug, Clone, Copy)]
pub struct BufferBudgetProbe {
    budget_bytes: usize,
}

impl BufferBudgetProbe {
    #[must_use]
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            budget_bytes: budget_bytes.max(1),
        }
    }
}

impl Default for BufferBudgetProbe {
    fn default() -> Self {
        Self::new(constants::DEFAULT_MEMORY_BUDGET_BYTES)
    }
}

impl MemoryProbe for BufferBudgetProbe {
    #[allow(clippy::cast_precision_loss)]
    fn pressure(&self, buffered_bytes: usize) -> f64 {
        (buffered_bytes as f64 / self.budget_bytes as f64).min(1.0)
    }
}

/// Host-wide pressure from `/proc/meminfo`: `1 - MemAvailable / MemTotal`.
///
/// Reads are sampled; a failed read logs once at debug and reports `0.0` so
/// that a missing procfs never forces flushes.
#[derive(Debug)]
pub struct ProcMeminfoProbe {
    path: String,
    sample_interval: Duration,
    last: Mutex<Option<(Instant, f64)>>,
}

impl ProcMeminfoProbe {
    #[must_use]
    pub fn new() -> Self {
        Self::with_path(PROC_MEMINFO_PATH, constants::DEFAULT_MEMORY_SAMPLE_INTERVAL)
    }

    #[must_use]
    pub fn with_path(path: impl Into<String>, sample_interval: Duration) -> Self {
        Self {
            path: path.into(),
            sample_interval,
            last: Mutex::new(None),
        }
    }
}

impl Default for ProcMeminfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcMeminfoProbe {
    fn pressure(&self, _buffered_bytes: usize) -> f64 {
        let Ok(mut last) = self.last.lock() else {
            return 0.0;
        };
        let now = Instant::now();
        if let Some((sampled_at, value)) = *last {
            if now.duration_since(sampled_at) < self.sample_interval {
                return value;
            }
        }
        let value = match get_memory_pressure_from_path(&self.path) {
            Ok(value) => value,
            Err(e) => {
                if last.is_none() {
                    debug!("LOGS | Unable to read {}: {e}, memory pressure disabled", self.path);
                }
                0.0
            }
        };
        *last = Some((now, value));
        value
    }
}

/// Parses a meminfo file of the form:
///
/// ```text
/// MemTotal:       16333828 kB
/// MemFree:         1207772 kB
/// MemAvailable:    9286104 kB
/// ```
pub(crate) fn get_memory_pressure_from_path(path: &str) -> Result<f64, io::Error> {
    let file = File::open(path)?;
    let reader = io::BufReader::new(file);

    let mut total: Option<u64> = None;
    let mut available: Option<u64> = None;
    for line in reader.lines() {
        let line = line?;
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("MemTotal:") => total = fields.next().and_then(|v| v.parse().ok()),
            Some("MemAvailable:") => available = fields.next().and_then(|v| v.parse().ok()),
            _ => continue,
        }
        if total.is_some() && available.is_some() {
            break;
        }
    }

    match (total, available) {
        (Some(total), Some(available)) if total > 0 => {
            #[allow(clippy::cast_precision_loss)]
            let used = 1.0 - (available as f64 / total as f64);
            Ok(used.clamp(0.0, 1.0))
        }
        (Some(0), _) => {
            warn!("LOGS | {path} reports MemTotal of 0");
            Err(io::Error::new(io::ErrorKind::InvalidData, "MemTotal is zero"))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "MemTotal or MemAvailable not found",
        )),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::NamedTempFile;

    fn path_from_root(file: &str) -> String {
        let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        path.push(file);
        path.to_string_lossy().into_owned()
    }

    fn meminfo(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_budget_probe() {
        let probe = BufferBudgetProbe::new(1_000);
        assert!((probe.pressure(0) - 0.0).abs() < f64::EPSILON);
        assert!((probe.pressure(250) - 0.25).abs() < f64::EPSILON);
        assert!((probe.pressure(5_000) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_budget_probe_zero_budget() {
        let probe = BufferBudgetProbe::new(0);
        assert!((probe.pressure(1) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_get_memory_pressure_from_fixture() {
        let pressure =
            get_memory_pressure_from_path(&path_from_root("tests/proc/meminfo/valid_meminfo")).unwrap();
        assert!((pressure - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_get_memory_pressure_missing_fields() {
        let file = meminfo("MemTotal:       1000 kB\nMemFree:         10 kB\n");
        let result = get_memory_pressure_from_path(file.path().to_str().unwrap());
        assert!(result.is_err());
    }

    #[test]
    fn test_get_memory_pressure_zero_total() {
        let file = meminfo("MemTotal: 0 kB\nMemAvailable: 0 kB\n");
        assert!(get_memory_pressure_from_path(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn test_get_memory_pressure_nonexistent_file() {
        let result = get_memory_pressure_from_path(&path_from_root("tests/proc/meminfo/missing"));
        assert!(result.is_err());
    }

    #[test]
    fn test_proc_probe_samples() {
        let mut file = meminfo("MemTotal: 1000 kB\nMemAvailable: 900 kB\n");
        let probe = ProcMeminfoProbe::with_path(
            file.path().to_str().unwrap(),
            Duration::from_secs(3_600),
        );
        assert!((probe.pressure(0) - 0.1).abs() < 1e-9);

        // Within the sample interval the cached value is reused.
        file.as_file_mut().set_len(0).unwrap();
        file.write_all(b"MemTotal: 1000 kB\nMemAvailable: 100 kB\n").unwrap();
        assert!((probe.pressure(0) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_proc_probe_resamples_after_interval() {
        let file = meminfo("MemTotal: 1000 kB\nMemAvailable: 500 kB\n");
        let probe = ProcMeminfoProbe::with_path(file.path().to_str().unwrap(), Duration::ZERO);
        assert!((probe.pressure(0) - 0.5).abs() < 1e-9);

        std::fs::write(file.path(), "MemTotal: 1000 kB\nMemAvailable: 200 kB\n").unwrap();
        assert!((probe.pressure(0) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_proc_probe_unreadable_reports_no_pressure() {
        let probe = ProcMeminfoProbe::with_path("/nonexistent/meminfo", Duration::ZERO);
        assert!((probe.pressure(usize::MAX) - 0.0).abs() < f64::EPSILON);
    }
}
