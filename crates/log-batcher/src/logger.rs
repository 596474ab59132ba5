// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The record-producing facade.
//!
//! A [`Logger`] ties the pipeline together:
//!
//! ```text
//!   info("msg", payload)
//!     → LevelGate::admit          drop below the minimum level
//!     → BatchAggregator::append   format, buffer, cut on trigger
//!     → FlushService              dispatch in order
//!     → TransportRegistry         fan out to every transport
//! ```
//!
//! It also exposes the configuration surface used by settings code:
//! minimum level, batch policy, attach/detach and explicit flushes.
//!
//! # Example
//!
//! ```no_run
//! use log_batcher::{Logger, LoggerConfig, Value};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let logger = Logger::start(&LoggerConfig::from_env()?).await?;
//! let request = Value::object();
//! request.insert("path", "/checkout");
//! request.insert("self", request.clone());
//!
//! logger.info("request served", vec![request]);
//! logger.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use crate::aggregator::{BatchAggregator, FlushState};
use crate::aggregator_service::FlushService;
use crate::config::LoggerConfig;
use crate::error::{AttachError, ConfigurationError};
use crate::level::{LevelGate, LogLevel};
use crate::policy::{BatchPolicy, BatchPolicyPatch};
use crate::record::{LogRecord, RecordKind};
use crate::registry::{Attachment, TransportHandle, TransportRegistry};
use crate::transport::{AttachOptions, TransportDescriptor};
use crate::value::Value;

/// Cheap to clone; clones share the same pipeline.
#[derive(Clone, Debug)]
pub struct Logger {
    gate: Arc<LevelGate>,
    aggregator: Arc<BatchAggregator>,
    registry: Arc<TransportRegistry>,
}

impl Logger {
    /// Builds a logger and the flush service that must be spawned for
    /// batches to be delivered. No transport is attached.
    ///
    /// # Errors
    ///
    /// Returns the first validation error in `config`.
    pub fn new(config: &LoggerConfig) -> Result<(Self, FlushService), ConfigurationError> {
        config.validate()?;
        let registry = Arc::new(TransportRegistry::new());
        let (service, aggregator) = FlushService::new(
            config.policy,
            config.sizing,
            config.build_probe(),
            Arc::clone(&registry),
        );
        let logger = Self {
            gate: Arc::new(LevelGate::new(config.min_level)),
            aggregator,
            registry,
        };
        Ok((logger, service))
    }

    /// [`Logger::new`], spawns the flush service on the current runtime and
    /// attaches the transports named in `config`.
    ///
    /// Transports are attached without waiting for materialization; records
    /// logged right away are delivered once it completes.
    ///
    /// # Errors
    ///
    /// Fails on an invalid configuration or transport descriptor.
    pub async fn start(config: &LoggerConfig) -> Result<Self, AttachError> {
        let (logger, service) = Self::new(config)?;
        tokio::spawn(service.run());
        for descriptor in config.transports() {
            logger.attach(descriptor, AttachOptions::default()).await?;
        }
        Ok(logger)
    }

    /// Submits one record. Returns `false` if the level gate dropped it.
    pub fn log_with(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        payload: Vec<Value>,
        kind: RecordKind,
    ) -> bool {
        if !self.gate.admit(level) {
            return false;
        }
        let record = LogRecord::new(level, message, payload).with_kind(kind);
        self.aggregator.append(record);
        true
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>, payload: Vec<Value>) -> bool {
        self.log_with(level, message, payload, RecordKind::Plain)
    }

    pub fn debug(&self, message: impl Into<String>, payload: Vec<Value>) -> bool {
        self.log(LogLevel::Debug, message, payload)
    }

    pub fn info(&self, message: impl Into<String>, payload: Vec<Value>) -> bool {
        self.log(LogLevel::Info, message, payload)
    }

    pub fn warn(&self, message: impl Into<String>, payload: Vec<Value>) -> bool {
        self.log(LogLevel::Warn, message, payload)
    }

    pub fn error(&self, message: impl Into<String>, payload: Vec<Value>) -> bool {
        self.log(LogLevel::Error, message, payload)
    }

    pub fn system(&self, message: impl Into<String>, payload: Vec<Value>) -> bool {
        self.log(LogLevel::System, message, payload)
    }

    /// Opens a group; console transports indent until [`Logger::group_end`].
    pub fn group(&self, label: impl Into<String>) -> bool {
        self.log_with(LogLevel::Info, label, Vec::new(), RecordKind::Group)
    }

    pub fn group_end(&self) -> bool {
        self.log_with(LogLevel::Info, String::new(), Vec::new(), RecordKind::GroupEnd)
    }

    /// Logs tabular data. `rows` is usually an array of objects.
    pub fn table(&self, message: impl Into<String>, rows: Value) -> bool {
        self.log_with(LogLevel::Info, message, vec![rows], RecordKind::Table)
    }

    pub fn minimum_level(&self) -> LogLevel {
        self.gate.minimum_level()
    }

    /// Applies to records logged after the call; buffered records are kept.
    pub fn set_minimum_level(&self, level: LogLevel) {
        self.gate.set_minimum_level(level);
    }

    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidLevel`] and keeps the current level.
    pub fn set_minimum_level_str(&self, level: &str) -> Result<LogLevel, ConfigurationError> {
        self.gate.set_minimum_level_str(level)
    }

    pub fn batch_policy(&self) -> BatchPolicy {
        self.aggregator.policy()
    }

    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidPolicy`] and keeps the current policy.
    pub fn set_batch_policy(&self, patch: &BatchPolicyPatch) -> Result<BatchPolicy, ConfigurationError> {
        self.aggregator.set_policy(patch)
    }

    /// See [`TransportRegistry::attach`].
    ///
    /// # Errors
    ///
    /// See [`TransportRegistry::attach`].
    pub async fn attach(
        &self,
        descriptor: TransportDescriptor,
        options: AttachOptions,
    ) -> Result<Attachment, AttachError> {
        self.registry.attach(descriptor, options).await
    }

    pub fn detach(&self, handle: &TransportHandle) -> bool {
        self.registry.detach(handle)
    }

    /// Queues whatever is buffered for dispatch without waiting.
    pub fn flush_now(&self) -> Option<u64> {
        self.aggregator.flush_now()
    }

    /// Queues whatever is buffered and waits until it has been dispatched.
    pub async fn flush(&self) {
        self.aggregator.flush().await;
    }

    /// Final flush, then stops the flush service and the registry. Records
    /// logged afterwards are dropped.
    pub async fn shutdown(&self) {
        self.aggregator.shutdown().await;
        self.registry.shutdown();
    }

    pub fn state(&self) -> FlushState {
        self.aggregator.state()
    }

    /// Records buffered and not yet cut into a batch.
    pub fn buffered(&self) -> usize {
        self.aggregator.len()
    }

    pub fn registry(&self) -> &Arc<TransportRegistry> {
        &self.registry
    }
}
