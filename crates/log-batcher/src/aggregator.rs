// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Record buffering and flush decisions.
//!
//! The aggregator owns the current batch. Every admitted record is formatted,
//! pushed under the buffer lock and followed by one flush decision:
//!
//! ```text
//!   len >= target_size                    → FlushReason::Size
//!   now - first_record >= max_wait        → FlushReason::Deadline
//!   memory pressure >= threshold          → FlushReason::MemoryPressure
//! ```
//!
//! The same decision runs when the flush service's deadline timer fires, so
//! all three triggers go through [`flush_trigger`].
//!
//! # Batch Swap
//!
//! On a trigger the current records are moved out and an empty batch takes
//! their place while the lock is still held. The swapped batch is queued to
//! the flush service in the same critical section, so batches reach the
//! service in the order they were cut. Producers never wait on transport I/O;
//! the cost of `append` is formatting plus the swap.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::aggregator_service::FlushCommand;
use crate::error::ConfigurationError;
use crate::formatter::CycleSafeFormatter;
use crate::memory::MemoryProbe;
use crate::policy::{AdaptiveSizing, BatchPolicy, BatchPolicyPatch};
use crate::record::{Batch, FlushReason, FormattedRecord, LogRecord};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushState {
    Accumulating,
    /// At least one cut batch has not finished dispatch.
    Flushing,
}

#[derive(Debug)]
struct BufferState {
    records: Vec<FormattedRecord>,
    first_record_at: Option<Instant>,
    buffered_bytes: usize,
    next_sequence: u64,
    next_batch_id: u64,
    policy: BatchPolicy,
    closed: bool,
}

/// Decides whether the current batch must be cut.
///
/// Size wins over the deadline, the deadline over memory pressure. An empty
/// batch never flushes.
pub(crate) fn flush_trigger(
    len: usize,
    first_record_at: Option<Instant>,
    policy: &BatchPolicy,
    now: Instant,
    pressure: f64,
) -> Option<FlushReason> {
    let first_record_at = first_record_at?;
    if len == 0 {
        return None;
    }
    if len >= policy.target_size {
        return Some(FlushReason::Size);
    }
    if now.saturating_duration_since(first_record_at) >= policy.max_wait {
        return Some(FlushReason::Deadline);
    }
    if pressure >= policy.memory_pressure_threshold {
        return Some(FlushReason::MemoryPressure);
    }
    None
}

pub struct BatchAggregator {
    buffer: Mutex<BufferState>,
    formatter: CycleSafeFormatter,
    probe: Arc<dyn MemoryProbe>,
    sizing: AdaptiveSizing,
    flush_tx: mpsc::UnboundedSender<FlushCommand>,
    wake: Arc<Notify>,
    in_flight: AtomicUsize,
}

impl std::fmt::Debug for BatchAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchAggregator")
            .field("probe", &self.probe)
            .field("sizing", &self.sizing)
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl BatchAggregator {
    pub(crate) fn new(
        policy: BatchPolicy,
        sizing: AdaptiveSizing,
        probe: Arc<dyn MemoryProbe>,
        flush_tx: mpsc::UnboundedSender<FlushCommand>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            buffer: Mutex::new(BufferState {
                records: Vec::new(),
                first_record_at: None,
                buffered_bytes: 0,
                next_sequence: 0,
                next_batch_id: 1,
                policy,
                closed: false,
            }),
            formatter: CycleSafeFormatter,
            probe,
            sizing,
            flush_tx,
            wake,
            in_flight: AtomicUsize::new(0),
        }
    }

    fn buffer(&self) -> MutexGuard<'_, BufferState> {
        self.buffer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Formats and buffers one record, cutting a batch if a trigger fires.
    ///
    /// Returns the reason when this append caused a flush. Records appended
    /// after [`BatchAggregator::shutdown`] are dropped.
    pub fn append(&self, record: LogRecord) -> Option<FlushReason> {
        // Formatting walks caller data; keep it outside the lock.
        let mut formatted = FormattedRecord::from_record(0, &record, &self.formatter);
        let size = formatted.estimated_size();

        let mut state = self.buffer();
        if state.closed {
            debug!("LOGS | Aggregator shut down, dropping record");
            return None;
        }
        formatted.sequence = state.next_sequence;
        state.next_sequence += 1;

        let now = Instant::now();
        let started_batch = state.first_record_at.is_none();
        if started_batch {
            state.first_record_at = Some(now);
        }
        state.buffered_bytes += size;
        state.records.push(formatted);

        let pressure = self.probe.pressure(state.buffered_bytes);
        let reason = flush_trigger(
            state.records.len(),
            state.first_record_at,
            &state.policy,
            now,
            pressure,
        );
        if let Some(reason) = reason {
            self.cut_batch(&mut state, reason);
        }
        drop(state);

        if started_batch && reason.is_none() {
            // The flush service learns about the new deadline.
            self.wake.notify_one();
        }
        reason
    }

    /// Re-evaluates the triggers without a new record.
    pub fn poll_deadline(&self) -> Option<FlushReason> {
        let mut state = self.buffer();
        if state.records.is_empty() {
            return None;
        }
        let pressure = self.probe.pressure(state.buffered_bytes);
        let reason = flush_trigger(
            state.records.len(),
            state.first_record_at,
            &state.policy,
            Instant::now(),
            pressure,
        );
        if let Some(reason) = reason {
            self.cut_batch(&mut state, reason);
        }
        reason
    }

    /// When the current batch reaches `max_wait`, if it holds records.
    pub fn next_deadline(&self) -> Option<Instant> {
        let state = self.buffer();
        state
            .first_record_at
            .map(|first| first + state.policy.max_wait)
    }

    /// Cuts the current batch regardless of triggers.
    ///
    /// Returns the id of the queued batch, or `None` if nothing was buffered.
    pub fn flush_now(&self) -> Option<u64> {
        let mut state = self.buffer();
        self.cut_batch(&mut state, FlushReason::Manual)
    }

    /// [`BatchAggregator::flush_now`], then waits until every batch cut so
    /// far has been dispatched.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.buffer();
            self.cut_batch(&mut state, FlushReason::Manual);
            if self.flush_tx.send(FlushCommand::Barrier(tx)).is_err() {
                return;
            }
        }
        let _ = rx.await;
    }

    /// Flushes what is buffered, stops accepting records and waits for the
    /// flush service to finish.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.buffer();
            if state.closed {
                return;
            }
            state.closed = true;
            self.cut_batch(&mut state, FlushReason::Manual);
            if self.flush_tx.send(FlushCommand::Shutdown(tx)).is_err() {
                return;
            }
        }
        let _ = rx.await;
        debug!("LOGS | Aggregator shut down");
    }

    pub fn policy(&self) -> BatchPolicy {
        self.buffer().policy
    }

    /// Applies a policy update atomically.
    ///
    /// A tighter policy takes effect on the current batch immediately.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidPolicy`]; the previous policy is
    /// kept.
    pub fn set_policy(&self, patch: &BatchPolicyPatch) -> Result<BatchPolicy, ConfigurationError> {
        let mut state = self.buffer();
        let policy = state.policy.apply(patch)?;
        state.policy = policy;
        debug!("LOGS | Batch policy updated: {policy:?}");

        let pressure = if state.records.is_empty() {
            0.0
        } else {
            self.probe.pressure(state.buffered_bytes)
        };
        if let Some(reason) = flush_trigger(
            state.records.len(),
            state.first_record_at,
            &state.policy,
            Instant::now(),
            pressure,
        ) {
            self.cut_batch(&mut state, reason);
        }
        drop(state);
        self.wake.notify_one();
        Ok(policy)
    }

    pub fn state(&self) -> FlushState {
        if self.in_flight.load(Ordering::Acquire) > 0 {
            FlushState::Flushing
        } else {
            FlushState::Accumulating
        }
    }

    /// Records currently buffered.
    pub fn len(&self) -> usize {
        self.buffer().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Called by the flush service after a batch was dispatched.
    pub(crate) fn complete_flush(&self, records: usize, duration: Duration) {
        {
            let mut state = self.buffer();
            let target = self.sizing.next_target(&state.policy, records, duration);
            state.policy.target_size = target;
        }
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Moves the buffered records into a batch and queues it. Must be called
    /// with the buffer lock held.
    fn cut_batch(&self, state: &mut BufferState, reason: FlushReason) -> Option<u64> {
        if state.records.is_empty() {
            return None;
        }
        let records = std::mem::take(&mut state.records);
        state.first_record_at = None;
        state.buffered_bytes = 0;
        let id = state.next_batch_id;
        state.next_batch_id += 1;

        debug!("LOGS | Cutting batch {id}: {} records ({reason})", records.len());
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let batch = Batch {
            id,
            reason,
            records,
        };
        if let Err(mpsc::error::SendError(command)) = self.flush_tx.send(FlushCommand::Dispatch(batch)) {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            if let FlushCommand::Dispatch(batch) = command {
                warn!(
                    "LOGS | Flush service stopped, dropping batch {} ({} records)",
                    batch.id,
                    batch.len()
                );
            }
            return None;
        }
        Some(id)
    }
}
