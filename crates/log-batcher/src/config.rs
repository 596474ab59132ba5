// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::constants;
use crate::error::ConfigurationError;
use crate::level::LogLevel;
use crate::memory::{BufferBudgetProbe, MemoryProbe, ProcMeminfoProbe};
use crate::policy::{AdaptiveSizing, BatchPolicy};
use crate::transport::{ConsoleConfig, ConsoleFormat, HttpConfig, TransportDescriptor};

const ENV_PREFIX: &str = "LOG_BATCHER_";

/// Where memory pressure readings come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryProbeKind {
    /// Share of a byte budget used by buffered records
    Budget,
    /// Host memory from `/proc/meminfo`
    ProcMeminfo,
}

/// Logger configuration
#[derive(Debug, Clone, PartialEq)]
pub struct LoggerConfig {
    /// Minimum level admitted at startup
    pub min_level: LogLevel,
    /// Batch bounds and flush triggers
    pub policy: BatchPolicy,
    /// Adaptive sizing tuning
    pub sizing: AdaptiveSizing,
    /// Memory probe used for the pressure trigger
    pub memory_probe: MemoryProbeKind,
    /// Budget for [`MemoryProbeKind::Budget`]
    pub memory_budget_bytes: usize,
    /// Console output format; `None` disables the console transport
    pub console: Option<ConsoleFormat>,
    /// Remote endpoint; `None` disables the HTTP transport
    pub http: Option<HttpConfig>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::default(),
            policy: BatchPolicy::default(),
            sizing: AdaptiveSizing::default(),
            memory_probe: MemoryProbeKind::Budget,
            memory_budget_bytes: constants::DEFAULT_MEMORY_BUDGET_BYTES,
            console: Some(ConsoleFormat::Text),
            http: None,
        }
    }
}

impl LoggerConfig {
    /// Create configuration from `LOG_BATCHER_*` environment variables
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] naming the first variable that does
    /// not parse or a combination that does not validate.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create configuration from any key lookup, e.g. a map in tests
    ///
    /// # Errors
    ///
    /// See [`LoggerConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let mut config = Self::default();

        if let Some(level) = var("MIN_LEVEL") {
            config.min_level = LogLevel::from_str(&level)?;
        }
        if let Some(value) = var("TARGET_SIZE") {
            config.policy.target_size = parse("TARGET_SIZE", &value)?;
        }
        if let Some(value) = var("MIN_SIZE") {
            config.policy.min_size = parse("MIN_SIZE", &value)?;
        }
        if let Some(value) = var("MAX_SIZE") {
            config.policy.max_size = parse("MAX_SIZE", &value)?;
        }
        // A target left at its default follows the configured bounds.
        if var("TARGET_SIZE").is_none() && config.policy.min_size <= config.policy.max_size {
            config.policy.target_size = config
                .policy
                .target_size
                .clamp(config.policy.min_size, config.policy.max_size);
        }
        if let Some(value) = var("MAX_WAIT_MS") {
            config.policy.max_wait = Duration::from_millis(parse("MAX_WAIT_MS", &value)?);
        }
        if let Some(value) = var("MEMORY_PRESSURE_THRESHOLD") {
            config.policy.memory_pressure_threshold = parse("MEMORY_PRESSURE_THRESHOLD", &value)?;
        }
        if let Some(value) = var("MEMORY_BUDGET_BYTES") {
            config.memory_budget_bytes = parse("MEMORY_BUDGET_BYTES", &value)?;
        }
        if let Some(value) = var("MEMORY_PROBE") {
            config.memory_probe = match value.to_lowercase().as_str() {
                "budget" => MemoryProbeKind::Budget,
                "proc" | "meminfo" => MemoryProbeKind::ProcMeminfo,
                _ => return Err(invalid("MEMORY_PROBE", &value, "expected 'budget' or 'proc'")),
            };
        }
        if let Some(value) = var("CONSOLE") {
            config.console = match value.to_lowercase().as_str() {
                "text" => Some(ConsoleFormat::Text),
                "json" => Some(ConsoleFormat::Json),
                "off" | "false" | "none" => None,
                _ => return Err(invalid("CONSOLE", &value, "expected 'text', 'json' or 'off'")),
            };
        }
        if let Some(endpoint) = var("HTTP_URL") {
            let mut http = HttpConfig {
                endpoint,
                ..HttpConfig::default()
            };
            if let Some(value) = var("HTTP_TIMEOUT_SECS") {
                http.timeout = Duration::from_secs(parse("HTTP_TIMEOUT_SECS", &value)?);
            }
            if let Some(value) = var("HTTP_COMPRESSION_LEVEL") {
                http.compression_level = parse("HTTP_COMPRESSION_LEVEL", &value)?;
            }
            if let Some(value) = var("HTTP_HEADERS") {
                http.headers = parse_headers(&value)?;
            }
            config.http = Some(http);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns the policy, sizing or HTTP error, whichever comes first.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.policy.validate()?;
        self.sizing.validate()?;
        if self.memory_budget_bytes == 0 {
            return Err(ConfigurationError::InvalidConfig(
                "memory budget must be greater than 0".to_string(),
            ));
        }
        if let Some(http) = &self.http {
            http.validate()?;
        }
        Ok(())
    }

    pub fn build_probe(&self) -> Arc<dyn MemoryProbe> {
        match self.memory_probe {
            MemoryProbeKind::Budget => Arc::new(BufferBudgetProbe::new(self.memory_budget_bytes)),
            MemoryProbeKind::ProcMeminfo => Arc::new(ProcMeminfoProbe::new()),
        }
    }

    /// Transports to attach at startup, console first.
    pub fn transports(&self) -> Vec<TransportDescriptor> {
        let mut transports = Vec::new();
        if let Some(format) = self.console {
            transports.push(TransportDescriptor::Console(ConsoleConfig {
                format,
                ..ConsoleConfig::default()
            }));
        }
        if let Some(http) = &self.http {
            transports.push(TransportDescriptor::Http(http.clone()));
        }
        transports
    }
}

fn parse<T: FromStr>(name: &str, value: &str) -> Result<T, ConfigurationError>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| invalid(name, value, &e.to_string()))
}

fn invalid(name: &str, value: &str, reason: &str) -> ConfigurationError {
    ConfigurationError::InvalidConfig(format!("{ENV_PREFIX}{name}='{value}': {reason}"))
}

/// `Name=value,Other=value`
fn parse_headers(value: &str) -> Result<Vec<(String, String)>, ConfigurationError> {
    value
        .split(',')
        .filter(|pair| !pair.trim().is_empty())
        .map(|pair| {
            pair.split_once('=')
                .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
                .ok_or_else(|| invalid("HTTP_HEADERS", pair, "expected Name=value"))
        })
        .collect()
}
