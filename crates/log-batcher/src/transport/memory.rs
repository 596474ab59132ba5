// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::record::{Batch, FormattedRecord};
use crate::transport::Transport;

/// Keeps every batch it receives.
///
/// Useful as an in-process sink and in tests. It can be told to fail, either
/// for the next `n` sends or until switched back, and to take a fixed time per
/// send.
#[derive(Debug)]
pub struct MemoryTransport {
    name: String,
    batches: Mutex<Vec<Batch>>,
    attempts: AtomicUsize,
    fail_next: AtomicUsize,
    failing: AtomicBool,
    delay: Option<Duration>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::named("memory")
    }
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            batches: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            fail_next: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            delay: None,
        }
    }

    /// Each send sleeps for `delay` before completing.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// The next `count` sends fail.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::Release);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    /// Successfully received batches, in order.
    pub fn batches(&self) -> Vec<Batch> {
        self.batches.lock().map(|b| b.clone()).unwrap_or_default()
    }

    pub fn records(&self) -> Vec<FormattedRecord> {
        self.batches()
            .into_iter()
            .flat_map(|batch| batch.records)
            .collect()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches
            .lock()
            .map(|b| b.iter().map(Batch::len).collect())
            .unwrap_or_default()
    }

    pub fn record_count(&self) -> usize {
        self.batch_sizes().iter().sum()
    }

    /// Sends attempted, including failed ones.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        if let Ok(mut batches) = self.batches.lock() {
            batches.clear();
        }
    }

    fn should_fail(&self) -> bool {
        if self.failing.load(Ordering::Acquire) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, batch: &Batch) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::AcqRel);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.should_fail() {
            return Err(TransportError::new(
                &self.name,
                format!("rejected batch {}", batch.id),
            ));
        }
        self.batches
            .lock()
            .map_err(|_| TransportError::new(&self.name, "storage lock poisoned"))?
            .push(batch.clone());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::record::FlushReason;

    fn empty_batch(id: u64) -> Batch {
        Batch {
            id,
            reason: FlushReason::Manual,
            records: vec![],
        }
    }

    #[tokio::test]
    async fn test_stores_batches_in_order() {
        let sink = MemoryTransport::new();
        sink.send(&empty_batch(1)).await.unwrap();
        sink.send(&empty_batch(2)).await.unwrap();

        let ids: Vec<u64> = sink.batches().iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(sink.attempts(), 2);
    }

    #[tokio::test]
    async fn test_fail_next() {
        let sink = MemoryTransport::named("flaky");
        sink.fail_next(1);

        let err = sink.send(&empty_batch(1)).await.unwrap_err();
        assert_eq!(err.transport, "flaky");
        sink.send(&empty_batch(2)).await.unwrap();

        assert_eq!(sink.batches().len(), 1);
        assert_eq!(sink.attempts(), 2);
    }

    #[tokio::test]
    async fn test_set_failing() {
        let sink = MemoryTransport::new();
        sink.set_failing(true);
        assert!(sink.send(&empty_batch(1)).await.is_err());
        assert!(sink.send(&empty_batch(2)).await.is_err());
        sink.set_failing(false);
        assert!(sink.send(&empty_batch(3)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay() {
        let sink = MemoryTransport::new().with_delay(Duration::from_secs(2));
        let start = tokio::time::Instant::now();
        sink.send(&empty_batch(1)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
