// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Record severities and the admission gate.
//!
//! Severities are ordered from least to most severe:
//! - **DEBUG**: diagnostic detail (the default minimum, everything is admitted)
//! - **INFO**: normal operation
//! - **WARN**: recoverable problems
//! - **ERROR**: failed operations
//! - **SYSTEM**: lifecycle messages emitted by the host application
//!
//! The [`LevelGate`] holds the current minimum severity. Changing it only
//! affects records admitted afterwards; records already buffered by the
//! aggregator are never dropped retroactively.

use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigurationError;

/// Severity of a log record.
///
/// # Parsing
///
/// ```
/// use log_batcher::level::LogLevel;
/// use std::str::FromStr;
///
/// assert_eq!(LogLevel::from_str("warn").unwrap(), LogLevel::Warn);
/// assert_eq!(LogLevel::from_str("SYSTEM").unwrap(), LogLevel::System);
/// assert!(LogLevel::from_str("loud").is_err());
/// ```
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum LogLevel {
    #[default]
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
    System = 4,
}

impl LogLevel {
    /// All levels, lowest ordinal first.
    pub const ALL: [LogLevel; 5] = [
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warn,
        LogLevel::Error,
        LogLevel::System,
    ];

    #[must_use]
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        Self::ALL.get(usize::from(ordinal)).copied()
    }
}

impl AsRef<str> for LogLevel {
    fn as_ref(&self) -> &str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::System => "SYSTEM",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// Case-insensitive parsing. `warning` is accepted as an alias of `warn`.
impl FromStr for LogLevel {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "system" => Ok(LogLevel::System),
            _ => Err(ConfigurationError::InvalidLevel(s.to_string())),
        }
    }
}

impl TryFrom<u8> for LogLevel {
    type Error = ConfigurationError;

    fn try_from(ordinal: u8) -> Result<Self, ConfigurationError> {
        Self::from_ordinal(ordinal).ok_or_else(|| ConfigurationError::InvalidLevel(ordinal.to_string()))
    }
}

/// Decides whether a record is admitted based on the minimum severity.
///
/// The threshold is a single atomic, so [`LevelGate::admit`] and
/// [`LevelGate::set_minimum_level`] can be called concurrently from any
/// thread without locking.
#[derive(Debug)]
pub struct LevelGate {
    minimum: AtomicU8,
}

impl Default for LevelGate {
    fn default() -> Self {
        Self::new(LogLevel::default())
    }
}

impl LevelGate {
    #[must_use]
    pub fn new(minimum: LogLevel) -> Self {
        Self {
            minimum: AtomicU8::new(minimum.ordinal()),
        }
    }

    /// Returns `true` if a record of `level` passes the current threshold.
    pub fn admit(&self, level: LogLevel) -> bool {
        level.ordinal() >= self.minimum.load(Ordering::Acquire)
    }

    pub fn minimum_level(&self) -> LogLevel {
        LogLevel::from_ordinal(self.minimum.load(Ordering::Acquire)).unwrap_or_default()
    }

    pub fn set_minimum_level(&self, level: LogLevel) {
        let previous = self.minimum.swap(level.ordinal(), Ordering::AcqRel);
        if previous != level.ordinal() {
            debug!("LOGS | Minimum log level set to {level}");
        }
    }

    /// Parses `level` and installs it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidLevel`] for an unrecognized name;
    /// the previous threshold stays in effect.
    pub fn set_minimum_level_str(&self, level: &str) -> Result<LogLevel, ConfigurationError> {
        let parsed = LogLevel::from_str(level)?;
        self.set_minimum_level(parsed);
        Ok(parsed)
    }
}
