// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Output transports.
//!
//! A transport receives whole batches through [`Transport::send`]. The
//! registry guarantees that a single transport never sees two concurrent
//! sends, so implementations can keep per-destination state without extra
//! locking around the send itself.
//!
//! Built-in transports are described with a [`TransportDescriptor`] and
//! constructed by the registry once the shared [`TransportEnvironment`] has
//! been materialized. Externally supplied transports use
//! [`TransportDescriptor::Custom`].

pub mod console;
pub mod http;
pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{ConfigurationError, TransportError};
use crate::record::Batch;

pub use console::{ConsoleConfig, ConsoleFormat, ConsoleStream, ConsoleTransport};
pub use http::{HttpConfig, HttpTransport};
pub use memory::MemoryTransport;

/// A sink for batches of formatted records.
///
/// Implementations must not mutate the batch and should report failures as
/// a [`TransportError`] rather than panicking. A panic is contained by the
/// registry and reported like an error.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name used in diagnostics and [`TransportError`]s.
    fn name(&self) -> &str;

    /// Delivers one batch.
    async fn send(&self, batch: &Batch) -> Result<(), TransportError>;
}

/// What to attach.
#[derive(Clone)]
pub enum TransportDescriptor {
    Console(ConsoleConfig),
    Http(HttpConfig),
    /// Attaching the same `Arc` twice creates two handles over one transport.
    Memory(Arc<MemoryTransport>),
    Custom(Arc<dyn Transport>),
}

impl fmt::Debug for TransportDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportDescriptor::Console(config) => f.debug_tuple("Console").field(config).finish(),
            TransportDescriptor::Http(config) => f.debug_tuple("Http").field(config).finish(),
            TransportDescriptor::Memory(transport) => {
                f.debug_tuple("Memory").field(&transport.name()).finish()
            }
            TransportDescriptor::Custom(transport) => {
                f.debug_tuple("Custom").field(&transport.name()).finish()
            }
        }
    }
}

impl TransportDescriptor {
    /// Checks the descriptor before it is queued, so configuration mistakes
    /// surface from `attach` rather than from materialization.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidConfig`] for an unusable HTTP
    /// endpoint or header.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match self {
            TransportDescriptor::Http(config) => config.validate(),
            _ => Ok(()),
        }
    }

    /// Name the transport will report under.
    #[must_use]
    pub fn default_name(&self) -> String {
        match self {
            TransportDescriptor::Console(_) => console::NAME.to_string(),
            TransportDescriptor::Http(_) => http::NAME.to_string(),
            TransportDescriptor::Memory(transport) => transport.name().to_string(),
            TransportDescriptor::Custom(transport) => transport.name().to_string(),
        }
    }

    pub(crate) fn build(
        &self,
        environment: &TransportEnvironment,
    ) -> Result<Arc<dyn Transport>, ConfigurationError> {
        Ok(match self {
            TransportDescriptor::Console(config) => Arc::new(ConsoleTransport::new(*config)),
            TransportDescriptor::Http(config) => Arc::new(HttpTransport::new(
                environment.http_client.clone(),
                config.clone(),
            )?),
            TransportDescriptor::Memory(transport) => Arc::clone(transport) as Arc<dyn Transport>,
            TransportDescriptor::Custom(transport) => Arc::clone(transport),
        })
    }
}

/// Per-attach options.
#[derive(Clone, Debug, Default)]
pub struct AttachOptions {
    /// Wait for materialization and return a ready handle instead of a
    /// pending token.
    pub wait_for_ready: bool,
    /// Overrides the transport's own name in diagnostics.
    pub name: Option<String>,
}

impl AttachOptions {
    #[must_use]
    pub fn wait_for_ready() -> Self {
        Self {
            wait_for_ready: true,
            name: None,
        }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Shared resources built once, when the registry materializes.
#[derive(Debug, Clone)]
pub struct TransportEnvironment {
    pub(crate) http_client: reqwest::Client,
}

impl TransportEnvironment {
    pub(crate) fn build() -> Result<Self, String> {
        let http_client = reqwest::Client::builder()
            .pool_idle_timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;
        Ok(Self { http_client })
    }
}
