// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Attached transports, lazy materialization and batch fan-out.
//!
//! # Lifecycle
//!
//! ```text
//!   attach ──► materialized? ──yes──► build handle ──► Attachment::Ready
//!                   │
//!                   no
//!                   ▼
//!             pending queue (FIFO) ──► Attachment::Pending
//!                   │
//!   materialize() ──┘  (once per registry, shared by concurrent callers)
//!        │
//!        └──► drain pending queue in order, resolve each PendingAttach
//! ```
//!
//! The shared [`TransportEnvironment`] is built at most once, guarded by a
//! `tokio::sync::OnceCell`. Any number of concurrent attaches and dispatches
//! may wait on it; only the first runs the build.
//!
//! Pending entries are queued under the same lock that drains them, and the
//! environment is published before the drain takes the lock. An attach that
//! misses the drain therefore always observes the environment and takes the
//! ready path, so no entry is stranded and none is applied twice. The ready
//! path drains whatever is still queued before adding its own handle, so
//! handles keep the order in which `attach` was called.
//!
//! # Dispatch
//!
//! [`TransportRegistry::dispatch`] sends one batch to every attached transport
//! concurrently. Failures and panics are contained per transport, reported
//! through the error hook and summarized in the returned [`DispatchReport`].
//! A failing transport stays attached.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use futures::future::join_all;
use futures::FutureExt;
use tokio::sync::{oneshot, OnceCell};
use tracing::{debug, error};

use crate::error::{AttachError, TransportError};
use crate::record::Batch;
use crate::transport::{AttachOptions, Transport, TransportDescriptor, TransportEnvironment};

/// Receives every [`TransportError`] raised during dispatch.
pub type ErrorHook = Arc<dyn Fn(&TransportError) + Send + Sync>;

/// An attached transport.
///
/// Clones share the transport, its send lock and its counters.
#[derive(Clone)]
pub struct TransportHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    id: u64,
    name: String,
    transport: Arc<dyn Transport>,
    // Held across a send so one transport never has two sends in flight.
    send_lock: tokio::sync::Mutex<()>,
    delivered: AtomicU64,
    failures: AtomicU64,
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("delivered", &self.delivered())
            .field("failures", &self.failures())
            .finish()
    }
}

impl TransportHandle {
    fn new(id: u64, name: String, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                name,
                transport,
                send_lock: tokio::sync::Mutex::new(()),
                delivered: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Batches this transport accepted.
    pub fn delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::Acquire)
    }

    /// Batches this transport failed, including panics.
    pub fn failures(&self) -> u64 {
        self.inner.failures.load(Ordering::Acquire)
    }

    async fn send(&self, batch: &Batch) -> Result<(), TransportError> {
        let _guard = self.inner.send_lock.lock().await;
        let result = AssertUnwindSafe(self.inner.transport.send(batch))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let cause = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(TransportError::new(
                    self.name(),
                    format!("send panicked: {cause}"),
                ))
            });
        match &result {
            Ok(()) => self.inner.delivered.fetch_add(1, Ordering::AcqRel),
            Err(_) => self.inner.failures.fetch_add(1, Ordering::AcqRel),
        };
        result.map_err(|mut e| {
            // Report under the attach name, which may override the transport's.
            e.transport = self.name().to_string();
            e
        })
    }
}

/// Token for an attach queued before materialization.
#[derive(Debug)]
pub struct PendingAttach {
    id: u64,
    name: String,
    receiver: oneshot::Receiver<Result<TransportHandle, AttachError>>,
}

impl PendingAttach {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolves once the entry has been applied.
    ///
    /// # Errors
    ///
    /// Fails if materialization failed or the registry shut down first.
    pub async fn ready(self) -> Result<TransportHandle, AttachError> {
        self.receiver.await.unwrap_or(Err(AttachError::ShutDown))
    }
}

/// Outcome of [`TransportRegistry::attach`].
#[derive(Debug)]
pub enum Attachment {
    Ready(TransportHandle),
    Pending(PendingAttach),
}

impl Attachment {
    /// The handle, waiting for materialization if needed.
    ///
    /// # Errors
    ///
    /// See [`PendingAttach::ready`].
    pub async fn into_handle(self) -> Result<TransportHandle, AttachError> {
        match self {
            Attachment::Ready(handle) => Ok(handle),
            Attachment::Pending(pending) => pending.ready().await,
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Attachment::Ready(_))
    }
}

/// Result of one fan-out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    pub batch_id: u64,
    /// Names of transports that accepted the batch.
    pub delivered: Vec<String>,
    pub failed: Vec<TransportError>,
}

impl DispatchReport {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

struct PendingEntry {
    id: u64,
    descriptor: TransportDescriptor,
    options: AttachOptions,
    reply: oneshot::Sender<Result<TransportHandle, AttachError>>,
}

#[derive(Default)]
struct RegistryState {
    handles: Vec<TransportHandle>,
    pending: VecDeque<PendingEntry>,
    closed: bool,
}

pub struct TransportRegistry {
    environment: OnceCell<Result<TransportEnvironment, String>>,
    state: Mutex<RegistryState>,
    next_id: AtomicU64,
    materialize_spawned: AtomicBool,
    materializations: AtomicUsize,
    error_hook: RwLock<ErrorHook>,
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("materialized", &self.is_materialized())
            .field("handles", &self.len())
            .field("pending", &self.pending_len())
            .field(
                "materializations",
                &self.materializations.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn default_error_hook() -> ErrorHook {
    Arc::new(|e: &TransportError| error!("LOGS | {e}"))
}

impl TransportRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            environment: OnceCell::new(),
            state: Mutex::new(RegistryState::default()),
            next_id: AtomicU64::new(1),
            materialize_spawned: AtomicBool::new(false),
            materializations: AtomicUsize::new(0),
            error_hook: RwLock::new(default_error_hook()),
        }
    }

    /// Replaces the hook that receives transport failures.
    pub fn set_error_hook(&self, hook: ErrorHook) {
        match self.error_hook.write() {
            Ok(mut current) => *current = hook,
            Err(poisoned) => *poisoned.into_inner() = hook,
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        // Nothing panics while holding the lock; recover rather than lose
        // every attached transport.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Attaches a transport.
    ///
    /// Returns a ready handle when the registry is materialized or
    /// `options.wait_for_ready` is set. Otherwise queues the request, starts
    /// materialization in the background and returns a pending token.
    ///
    /// # Errors
    ///
    /// - [`AttachError::Configuration`] for an invalid descriptor
    /// - [`AttachError::Materialization`] if the environment could not be built
    /// - [`AttachError::ShutDown`] after [`TransportRegistry::shutdown`]
    pub async fn attach(
        self: &Arc<Self>,
        descriptor: TransportDescriptor,
        options: AttachOptions,
    ) -> Result<Attachment, AttachError> {
        descriptor.validate()?;
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| descriptor.default_name());
        let wait_for_ready = options.wait_for_ready;

        let receiver = {
            let mut state = self.state();
            if state.closed {
                return Err(AttachError::ShutDown);
            }
            if let Some(environment) = self.environment.get() {
                // Entries queued before the environment was published go first.
                Self::drain_pending(&mut state, environment);
                let environment = environment
                    .as_ref()
                    .map_err(|e| AttachError::Materialization(e.clone()))?;
                let handle = TransportHandle::new(id, name, descriptor.build(environment)?);
                state.handles.push(handle.clone());
                debug!("LOGS | Attached transport '{}' ({id})", handle.name());
                return Ok(Attachment::Ready(handle));
            }
            let (reply, receiver) = oneshot::channel();
            state.pending.push_back(PendingEntry {
                id,
                descriptor,
                options,
                reply,
            });
            debug!("LOGS | Queued transport '{name}' ({id}) until materialization");
            receiver
        };

        let pending = PendingAttach { id, name, receiver };
        if wait_for_ready {
            self.materialize().await?;
            return pending.ready().await.map(Attachment::Ready);
        }
        if !self.materialize_spawned.swap(true, Ordering::AcqRel) {
            let registry = Arc::clone(self);
            tokio::spawn(async move {
                let _ = registry.materialize().await;
            });
        }
        Ok(Attachment::Pending(pending))
    }

    /// Builds the transport environment once and applies queued attaches in
    /// the order they were issued. Safe to call any number of times.
    ///
    /// # Errors
    ///
    /// Returns [`AttachError::Materialization`] if the environment build
    /// failed. The failure is permanent for this registry.
    pub async fn materialize(&self) -> Result<(), AttachError> {
        let environment = self
            .environment
            .get_or_init(|| async {
                self.materializations.fetch_add(1, Ordering::AcqRel);
                let environment = TransportEnvironment::build();
                match &environment {
                    Ok(_) => debug!("LOGS | Transport subsystem materialized"),
                    Err(e) => error!("LOGS | Transport subsystem failed to materialize: {e}"),
                }
                environment
            })
            .await;
        Self::drain_pending(&mut self.state(), environment);
        environment
            .as_ref()
            .map(|_| ())
            .map_err(|e| AttachError::Materialization(e.clone()))
    }

    /// Applies queued entries in order. Callers hold the state lock.
    fn drain_pending(
        state: &mut RegistryState,
        environment: &Result<TransportEnvironment, String>,
    ) {
        while let Some(entry) = state.pending.pop_front() {
            let PendingEntry {
                id,
                descriptor,
                options,
                reply,
            } = entry;
            let name = options.name.unwrap_or_else(|| descriptor.default_name());
            let result = match environment {
                Ok(environment) => descriptor
                    .build(environment)
                    .map(|transport| TransportHandle::new(id, name, transport))
                    .map_err(AttachError::from),
                Err(e) => Err(AttachError::Materialization(e.clone())),
            };
            if let Ok(handle) = &result {
                state.handles.push(handle.clone());
                debug!("LOGS | Attached queued transport '{}' ({id})", handle.name());
            }
            // The caller may have dropped its token; the handle stays attached.
            let _ = reply.send(result);
        }
    }

    #[must_use]
    pub fn is_materialized(&self) -> bool {
        self.environment.initialized()
    }

    #[cfg(test)]
    pub(crate) fn materialization_count(&self) -> usize {
        self.materializations.load(Ordering::Acquire)
    }

    fn pending_len(&self) -> usize {
        self.state().pending.len()
    }

    /// Removes a transport. A send already in flight completes.
    pub fn detach(&self, handle: &TransportHandle) -> bool {
        let mut state = self.state();
        let before = state.handles.len();
        state.handles.retain(|h| h.id() != handle.id());
        let removed = state.handles.len() != before;
        if removed {
            debug!("LOGS | Detached transport '{}' ({})", handle.name(), handle.id());
        }
        removed
    }

    /// Snapshot of the attached transports, in attach order.
    pub fn handles(&self) -> Vec<TransportHandle> {
        self.state().handles.clone()
    }

    pub fn len(&self) -> usize {
        self.state().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rejects later attaches and fails every queued one. Attached transports
    /// remain so a final flush can still be delivered.
    pub fn shutdown(&self) {
        let pending: Vec<PendingEntry> = {
            let mut state = self.state();
            state.closed = true;
            state.pending.drain(..).collect()
        };
        for entry in pending {
            let _ = entry.reply.send(Err(AttachError::ShutDown));
        }
        debug!("LOGS | Transport registry shut down");
    }

    /// Sends `batch` to every attached transport concurrently.
    ///
    /// Never fails. Transports still queued for attachment are materialized
    /// first so that they receive this batch.
    pub async fn dispatch(&self, batch: Arc<Batch>) -> DispatchReport {
        if self.pending_len() > 0 {
            let _ = self.materialize().await;
        }
        let handles = self.handles();
        let mut report = DispatchReport {
            batch_id: batch.id,
            ..DispatchReport::default()
        };
        if handles.is_empty() {
            debug!("LOGS | No transports attached, dropping batch {}", batch.id);
            return report;
        }

        let sends = handles.iter().map(|handle| {
            let batch = Arc::clone(&batch);
            async move { (handle.name().to_string(), handle.send(&batch).await) }
        });
        let results = join_all(sends).await;

        let hook = self
            .error_hook
            .read()
            .map(|hook| Arc::clone(&*hook))
            .unwrap_or_else(|_| default_error_hook());
        for (name, result) in results {
            match result {
                Ok(()) => report.delivered.push(name),
                Err(e) => {
                    hook(&e);
                    report.failed.push(e);
                }
            }
        }
        report
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::level::LogLevel;
    use crate::record::{FlushReason, FormattedRecord, RecordKind};
    use crate::transport::MemoryTransport;
    use async_trait::async_trait;
    use std::time::Duration;
    use tracing_test::traced_test;

    struct PanickingTransport;

    #[async_trait]
    impl Transport for PanickingTransport {
        fn name(&self) -> &str {
            "panicky"
        }

        async fn send(&self, _batch: &Batch) -> Result<(), TransportError> {
            panic!("transport exploded");
        }
    }

    fn batch(id: u64, size: usize) -> Arc<Batch> {
        let records = (0..size as u64)
            .map(|sequence| FormattedRecord {
                sequence,
                timestamp_ms: 0,
                level: LogLevel::Info,
                message: format!("record {sequence}"),
                payload: vec![],
                kind: RecordKind::Plain,
            })
            .collect();
        Arc::new(Batch {
            id,
            reason: FlushReason::Manual,
            records,
        })
    }

    fn memory(name: &str) -> (Arc<MemoryTransport>, TransportDescriptor) {
        let sink = Arc::new(MemoryTransport::named(name));
        (Arc::clone(&sink), TransportDescriptor::Memory(sink))
    }

    #[tokio::test]
    async fn test_attach_before_materialization_is_pending() {
        let registry = Arc::new(TransportRegistry::new());
        let (_sink, descriptor) = memory("sink");

        let attachment = registry
            .attach(descriptor, AttachOptions::default())
            .await
            .unwrap();

        assert!(!attachment.is_ready());
        let handle = attachment.into_handle().await.unwrap();
        assert_eq!(handle.name(), "sink");
        assert!(registry.is_materialized());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_attach_after_materialization_is_ready() {
        let registry = Arc::new(TransportRegistry::new());
        registry.materialize().await.unwrap();
        let (_sink, descriptor) = memory("sink");

        let attachment = registry
            .attach(descriptor, AttachOptions::default())
            .await
            .unwrap();

        assert!(attachment.is_ready());
    }

    #[tokio::test]
    async fn test_wait_for_ready_returns_handle() {
        let registry = Arc::new(TransportRegistry::new());
        let (_sink, descriptor) = memory("sink");

        let attachment = registry
            .attach(descriptor, AttachOptions::wait_for_ready())
            .await
            .unwrap();

        assert!(attachment.is_ready());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_pending_attaches_applied_in_order_exactly_once() {
        let registry = Arc::new(TransportRegistry::new());
        let mut tokens = Vec::new();
        for name in ["a", "b", "c", "d"] {
            let (_sink, descriptor) = memory(name);
            let attachment = registry
                .attach(descriptor, AttachOptions::default())
                .await
                .unwrap();
            tokens.push(attachment);
        }

        let (first, second) = tokio::join!(registry.materialize(), registry.materialize());
        first.unwrap();
        second.unwrap();
        registry.materialize().await.unwrap();

        let names: Vec<String> = registry
            .handles()
            .iter()
            .map(|h| h.name().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
        assert_eq!(registry.materialization_count(), 1);

        let ids: Vec<u64> = futures::future::join_all(tokens.into_iter().map(Attachment::into_handle))
            .await
            .into_iter()
            .map(|h| h.unwrap().id())
            .collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_attach_between_publish_and_drain_keeps_order() {
        let registry = Arc::new(TransportRegistry::new());
        let (_a, first) = memory("a");
        let queued = registry
            .attach(first, AttachOptions::default())
            .await
            .unwrap();
        assert!(!queued.is_ready());

        // Environment published, queue not drained yet.
        registry
            .environment
            .get_or_init(|| async { TransportEnvironment::build() })
            .await;
        let (_b, second) = memory("b");
        let attached = registry
            .attach(second, AttachOptions::default())
            .await
            .unwrap();
        assert!(attached.is_ready());
        registry.materialize().await.unwrap();

        let names: Vec<String> = registry
            .handles()
            .iter()
            .map(|h| h.name().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(queued.into_handle().await.unwrap().name(), "a");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_attaches_materialize_once() {
        let registry = Arc::new(TransportRegistry::new());
        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    let (_sink, descriptor) = memory(&format!("t{i}"));
                    registry
                        .attach(descriptor, AttachOptions::wait_for_ready())
                        .await
                        .unwrap()
                })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().is_ready());
        }

        assert_eq!(registry.materialization_count(), 1);
        assert_eq!(registry.len(), 16);
    }

    #[tokio::test]
    async fn test_invalid_descriptor_rejected_synchronously() {
        let registry = Arc::new(TransportRegistry::new());
        let descriptor = TransportDescriptor::Http(crate::transport::HttpConfig {
            endpoint: "nowhere".to_string(),
            ..Default::default()
        });

        let result = registry.attach(descriptor, AttachOptions::default()).await;

        assert!(matches!(result, Err(AttachError::Configuration(_))));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_materializes_pending_first() {
        let registry = Arc::new(TransportRegistry::new());
        let (sink, descriptor) = memory("late");
        let _pending = registry
            .attach(descriptor, AttachOptions::default())
            .await
            .unwrap();

        let report = registry.dispatch(batch(1, 3)).await;

        assert_eq!(report.delivered, vec!["late".to_string()]);
        assert_eq!(sink.record_count(), 3);
    }

    #[tokio::test]
    async fn test_failing_transport_does_not_block_others() {
        let registry = Arc::new(TransportRegistry::new());
        let (healthy, descriptor) = memory("healthy");
        registry
            .attach(descriptor, AttachOptions::wait_for_ready())
            .await
            .unwrap();
        let (broken, descriptor) = memory("broken");
        broken.set_failing(true);
        registry
            .attach(descriptor, AttachOptions::wait_for_ready())
            .await
            .unwrap();

        let report = registry.dispatch(batch(1, 5)).await;

        assert_eq!(report.delivered, vec!["healthy".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].transport, "broken");
        assert_eq!(healthy.record_count(), 5);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_transport_receives_next_batch() {
        let registry = Arc::new(TransportRegistry::new());
        let (sink, descriptor) = memory("flaky");
        sink.fail_next(1);
        let handle = registry
            .attach(descriptor, AttachOptions::wait_for_ready())
            .await
            .unwrap()
            .into_handle()
            .await
            .unwrap();

        let first = registry.dispatch(batch(1, 2)).await;
        let second = registry.dispatch(batch(2, 2)).await;

        assert!(!first.is_success());
        assert!(second.is_success());
        assert_eq!(sink.attempts(), 2);
        assert_eq!(sink.batches()[0].id, 2);
        assert_eq!(handle.failures(), 1);
        assert_eq!(handle.delivered(), 1);
    }

    #[tokio::test]
    async fn test_panicking_transport_is_contained() {
        let registry = Arc::new(TransportRegistry::new());
        registry
            .attach(
                TransportDescriptor::Custom(Arc::new(PanickingTransport)),
                AttachOptions::wait_for_ready(),
            )
            .await
            .unwrap();
        let (sink, descriptor) = memory("steady");
        registry
            .attach(descriptor, AttachOptions::wait_for_ready())
            .await
            .unwrap();

        let report = registry.dispatch(batch(1, 1)).await;

        assert_eq!(report.delivered, vec!["steady".to_string()]);
        assert_eq!(report.failed[0].transport, "panicky");
        assert!(report.failed[0].cause.contains("transport exploded"));
        assert_eq!(sink.record_count(), 1);

        let report = registry.dispatch(batch(2, 1)).await;
        assert_eq!(report.failed.len(), 1);
    }

    #[tokio::test]
    async fn test_error_hook_receives_failures() {
        let registry = Arc::new(TransportRegistry::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hook_seen = Arc::clone(&seen);
        registry.set_error_hook(Arc::new(move |e: &TransportError| {
            hook_seen.lock().unwrap().push(e.transport.clone());
        }));
        let (sink, descriptor) = memory("sink");
        sink.set_failing(true);
        registry
            .attach(descriptor, AttachOptions::wait_for_ready().named("primary"))
            .await
            .unwrap();

        registry.dispatch(batch(1, 1)).await;

        assert_eq!(*seen.lock().unwrap(), vec!["primary".to_string()]);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_default_hook_logs_error() {
        let registry = Arc::new(TransportRegistry::new());
        let (sink, descriptor) = memory("sink");
        sink.set_failing(true);
        registry
            .attach(descriptor, AttachOptions::wait_for_ready())
            .await
            .unwrap();

        registry.dispatch(batch(7, 1)).await;

        assert!(logs_contain("transport 'sink' failed to send batch"));
    }

    #[tokio::test]
    async fn test_detach_stops_delivery() {
        let registry = Arc::new(TransportRegistry::new());
        let (sink, descriptor) = memory("sink");
        let handle = registry
            .attach(descriptor, AttachOptions::wait_for_ready())
            .await
            .unwrap()
            .into_handle()
            .await
            .unwrap();

        registry.dispatch(batch(1, 1)).await;
        assert!(registry.detach(&handle));
        assert!(!registry.detach(&handle));
        registry.dispatch(batch(2, 1)).await;

        assert_eq!(sink.batches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detach_lets_in_flight_send_complete() {
        let registry = Arc::new(TransportRegistry::new());
        let sink = Arc::new(MemoryTransport::named("slow").with_delay(Duration::from_secs(1)));
        let handle = registry
            .attach(
                TransportDescriptor::Memory(Arc::clone(&sink)),
                AttachOptions::wait_for_ready(),
            )
            .await
            .unwrap()
            .into_handle()
            .await
            .unwrap();

        let dispatching = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.dispatch(batch(1, 4)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        registry.detach(&handle);
        let report = dispatching.await.unwrap();

        assert!(report.is_success());
        assert_eq!(sink.record_count(), 4);
    }

    #[tokio::test]
    async fn test_same_transport_sends_are_serialized() {
        let registry = Arc::new(TransportRegistry::new());
        let sink = Arc::new(MemoryTransport::named("ordered").with_delay(Duration::from_millis(5)));
        registry
            .attach(
                TransportDescriptor::Memory(Arc::clone(&sink)),
                AttachOptions::wait_for_ready(),
            )
            .await
            .unwrap();

        let first = registry.dispatch(batch(1, 1));
        let second = registry.dispatch(batch(2, 1));
        let (a, b) = tokio::join!(first, second);

        assert!(a.is_success() && b.is_success());
        let ids: Vec<u64> = sink.batches().iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_and_rejects_new() {
        let registry = Arc::new(TransportRegistry::new());
        // Keep materialization from running before shutdown.
        registry.materialize_spawned.store(true, Ordering::Release);
        let (_sink, descriptor) = memory("queued");
        let pending = registry
            .attach(descriptor, AttachOptions::default())
            .await
            .unwrap();

        registry.shutdown();

        assert!(matches!(
            pending.into_handle().await,
            Err(AttachError::ShutDown)
        ));
        let (_sink, descriptor) = memory("late");
        assert!(matches!(
            registry.attach(descriptor, AttachOptions::default()).await,
            Err(AttachError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn test_dispatch_without_transports() {
        let registry = TransportRegistry::new();
        let report = registry.dispatch(batch(9, 2)).await;
        assert_eq!(report.batch_id, 9);
        assert!(report.delivered.is_empty());
        assert!(report.is_success());
    }
}
