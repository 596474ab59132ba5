// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use log_batcher::{
    AdaptiveSizing, AttachOptions, BatchAggregator, BatchPolicy, FlushService, Logger,
    LoggerConfig, MemoryProbe, MemoryTransport, TransportDescriptor, TransportRegistry,
};
use std::sync::Arc;
use std::time::Duration;

pub fn policy(target_size: usize, max_size: usize) -> BatchPolicy {
    BatchPolicy {
        target_size,
        min_size: 1,
        max_size,
        max_wait: Duration::from_secs(60),
        memory_pressure_threshold: 0.9,
    }
}

/// Config with no console output and the given policy.
pub fn quiet_config(policy: BatchPolicy) -> LoggerConfig {
    LoggerConfig {
        policy,
        console: None,
        ..Default::default()
    }
}

/// Spawns a logger with one memory sink attached and ready.
pub async fn logger_with_sink(config: &LoggerConfig) -> (Logger, Arc<MemoryTransport>) {
    let (logger, service) = Logger::new(config).expect("valid config");
    tokio::spawn(service.run());
    let sink = Arc::new(MemoryTransport::new());
    logger
        .attach(
            TransportDescriptor::Memory(Arc::clone(&sink)),
            AttachOptions::wait_for_ready(),
        )
        .await
        .expect("attach memory sink");
    (logger, sink)
}

/// Spawns an aggregator and flush service around a caller-provided probe.
pub async fn pipeline_with_probe(
    policy: BatchPolicy,
    probe: Arc<dyn MemoryProbe>,
    sink: Arc<MemoryTransport>,
) -> (Arc<BatchAggregator>, Arc<TransportRegistry>) {
    let registry = Arc::new(TransportRegistry::new());
    registry
        .attach(TransportDescriptor::Memory(sink), AttachOptions::wait_for_ready())
        .await
        .expect("attach memory sink");
    let (service, aggregator) = FlushService::new(
        policy,
        AdaptiveSizing::default(),
        probe,
        Arc::clone(&registry),
    );
    tokio::spawn(service.run());
    (aggregator, registry)
}
