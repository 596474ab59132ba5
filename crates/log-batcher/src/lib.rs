// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client-side log batching with adaptive flush sizing.
//!
//! Records produced by the [`logger::Logger`] facade flow through a fixed
//! pipeline:
//!
//! ```text
//!   Logger ──> LevelGate ──> CycleSafeFormatter ──> BatchAggregator
//!                                                        │ swap on trigger
//!                                                        v
//!                                                  FlushService task
//!                                                        │ dispatch(batch)
//!                                                        v
//!                                                 TransportRegistry
//!                                           ┌────────────┼────────────┐
//!                                        console        http        memory
//! ```
//!
//! - **[`level`]**: severity ordinals and the admission gate
//! - **[`value`]** / **[`formatter`]**: shared payload graphs and their
//!   cycle-safe conversion to JSON
//! - **[`aggregator`]** / **[`aggregator_service`]**: the current batch, the
//!   flush triggers (size, deadline, memory pressure) and the task that
//!   dispatches swapped batches in order
//! - **[`policy`]**: batch bounds and the adaptive sizing controller
//! - **[`registry`]** / **[`transport`]**: lazily materialized transports and
//!   fan-out delivery
//! - **[`config`]**: environment driven configuration

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod aggregator;
pub mod aggregator_service;
pub mod config;
pub mod constants;
pub mod error;
pub mod formatter;
pub mod level;
pub mod logger;
pub mod memory;
pub mod policy;
pub mod record;
pub mod registry;
pub mod transport;
pub mod value;

pub use aggregator::{BatchAggregator, FlushState};
pub use aggregator_service::FlushService;
pub use config::{LoggerConfig, MemoryProbeKind};
pub use error::{AttachError, ConfigurationError, TransportError};
pub use formatter::CycleSafeFormatter;
pub use level::{LevelGate, LogLevel};
pub use logger::Logger;
pub use memory::MemoryProbe;
pub use policy::{AdaptiveSizing, BatchPolicy, BatchPolicyPatch};
pub use record::{Batch, FlushReason, FormattedRecord, LogRecord, RecordKind};
pub use registry::{Attachment, DispatchReport, PendingAttach, TransportHandle, TransportRegistry};
pub use transport::{
    AttachOptions, ConsoleConfig, ConsoleFormat, HttpConfig, MemoryTransport, Transport,
    TransportDescriptor,
};
pub use value::{ErrorValue, Value};
