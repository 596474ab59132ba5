// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Rejected configuration change. The previous state is always retained.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Invalid log level: '{0}'. Valid levels are: debug, info, warn, error, system")]
    InvalidLevel(String),

    #[error("Invalid batch policy: {0}")]
    InvalidPolicy(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// A single transport failed to send a batch.
///
/// Reported through the registry's error hook; never propagated out of
/// [`crate::registry::TransportRegistry::dispatch`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("transport '{transport}' failed to send batch: {cause}")]
pub struct TransportError {
    pub transport: String,
    pub cause: String,
}

impl TransportError {
    pub fn new(transport: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            transport: transport.into(),
            cause: cause.into(),
        }
    }
}

/// Errors returned when attaching a transport.
#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Transport subsystem failed to materialize: {0}")]
    Materialization(String),

    #[error("Transport registry has shut down")]
    ShutDown,
}
