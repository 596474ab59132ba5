// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The task that dispatches cut batches.
//!
//! The aggregator cuts batches synchronously and queues them here. The
//! service dispatches them one at a time, in order, so a transport never
//! receives batch N+1 before it finished batch N. Between commands it sleeps
//! until the current batch's deadline and then asks the aggregator to
//! re-evaluate its triggers.
//!
//! ```text
//!   ┌───────────────┐  Dispatch(batch)   ┌──────────────┐  dispatch   ┌──────────┐
//!   │BatchAggregator│ ─────────────────► │ FlushService │ ──────────► │ Registry │
//!   └───────────────┘  Barrier/Shutdown  └──────────────┘             └──────────┘
//!           ▲                                   │
//!           └─────── complete_flush(n, took) ───┘
//! ```
//!
//! The service holds only a weak reference to the aggregator. Once every
//! [`crate::logger::Logger`] is dropped the command channel closes, queued
//! batches are still dispatched, and [`FlushService::run`] returns.

use std::future::pending;
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error};

use crate::aggregator::BatchAggregator;
use crate::memory::MemoryProbe;
use crate::policy::{AdaptiveSizing, BatchPolicy};
use crate::record::Batch;
use crate::registry::TransportRegistry;

#[derive(Debug)]
pub enum FlushCommand {
    Dispatch(Batch),
    /// Answered once every command queued before it was handled.
    Barrier(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

pub struct FlushService {
    aggregator: Weak<BatchAggregator>,
    registry: Arc<TransportRegistry>,
    rx: mpsc::UnboundedReceiver<FlushCommand>,
    wake: Arc<Notify>,
}

impl FlushService {
    /// Creates the aggregator and the service that drains it.
    ///
    /// The caller spawns [`FlushService::run`] on its runtime.
    #[must_use]
    pub fn new(
        policy: BatchPolicy,
        sizing: AdaptiveSizing,
        probe: Arc<dyn MemoryProbe>,
        registry: Arc<TransportRegistry>,
    ) -> (Self, Arc<BatchAggregator>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let wake = Arc::new(Notify::new());
        let aggregator = Arc::new(BatchAggregator::new(
            policy,
            sizing,
            probe,
            tx,
            Arc::clone(&wake),
        ));
        let service = Self {
            aggregator: Arc::downgrade(&aggregator),
            registry,
            rx,
            wake,
        };
        (service, aggregator)
    }

    pub async fn run(mut self) {
        debug!("LOGS | Flush service started");

        loop {
            let deadline = self.aggregator.upgrade().and_then(|a| a.next_deadline());
            let timer = async move {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                command = self.rx.recv() => match command {
                    Some(FlushCommand::Dispatch(batch)) => self.dispatch(batch).await,
                    Some(FlushCommand::Barrier(done)) => {
                        if done.send(()).is_err() {
                            debug!("LOGS | Flush barrier dropped before completion");
                        }
                    }
                    Some(FlushCommand::Shutdown(done)) => {
                        debug!("LOGS | Flush service shutting down");
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        debug!("LOGS | Aggregator dropped, flush service stopping");
                        break;
                    }
                },
                () = self.wake.notified() => {}
                () = timer => {
                    if let Some(aggregator) = self.aggregator.upgrade() {
                        aggregator.poll_deadline();
                    }
                }
            }
        }
    }

    async fn dispatch(&self, batch: Batch) {
        let records = batch.len();
        let batch_id = batch.id;
        let start = Instant::now();
        let report = self.registry.dispatch(Arc::new(batch)).await;
        let took = start.elapsed();

        if report.is_success() {
            debug!(
                "LOGS | Batch {batch_id} ({records} records) delivered to {} transport(s) in {}ms",
                report.delivered.len(),
                took.as_millis()
            );
        } else {
            error!(
                "LOGS | Batch {batch_id} ({records} records) failed on {} of {} transport(s)",
                report.failed.len(),
                report.failed.len() + report.delivered.len()
            );
        }

        if let Some(aggregator) = self.aggregator.upgrade() {
            aggregator.complete_flush(records, took);
        }
    }
}
