// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use log_batcher::{Batch, MemoryProbe, Transport, TransportError};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Reports full pressure from the `n`th reading onwards.
#[derive(Debug)]
pub struct PressureAfter {
    readings: AtomicUsize,
    n: usize,
}

impl PressureAfter {
    pub fn new(n: usize) -> Self {
        Self {
            readings: AtomicUsize::new(0),
            n,
        }
    }
}

impl MemoryProbe for PressureAfter {
    fn pressure(&self, _buffered_bytes: usize) -> f64 {
        let reading = self.readings.fetch_add(1, Ordering::AcqRel) + 1;
        if reading >= self.n {
            1.0
        } else {
            0.0
        }
    }
}

/// Never reports pressure.
#[derive(Debug)]
pub struct NoPressure;

impl MemoryProbe for NoPressure {
    fn pressure(&self, _buffered_bytes: usize) -> f64 {
        0.0
    }
}

/// Panics on every send.
pub struct PanickingTransport;

#[async_trait]
impl Transport for PanickingTransport {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn send(&self, _batch: &Batch) -> Result<(), TransportError> {
        panic!("transport exploded");
    }
}
