// Copyright Distributed Cache Project Authors
// SPDX-License-Identifier: Apache-2.0

//! The public streamer API: submission, flush/close state machine, the
//! future registry, and the glue between the router, node buffers, the
//! remap controller, and the auto-flush scheduler.

use crate::autoflush::{AutoFlushScheduler, AutoFlushable};
use crate::collaborators::{
    AffinityResolver, AuthOp, Discovery, Receiver, Security, Serializer, Transport, TopologyEvent,
    TopologyEventHandler,
};
use crate::config::StreamerConfig;
use crate::entry::{Batch, Entry, RemapHint};
use crate::error::StreamerError;
use crate::future::{AggregateFuture, Completer, CompletionFuture, new_completion};
use crate::metrics::{MetricsSnapshot, StreamerMetrics};
use crate::node_buffer::{NodeBuffer, NodeBufferDeps};
use crate::remap::{RemapController, RemapJob, RemapSink};
use crate::router::Router;
use crate::thread_buffer::ThreadBuffer;
use crate::topology::{AffinityView, NodeId, TopologyVersion};
use crate::wire::LoadResponse;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use tracing::debug;

/// The collaborators an embedder wires a [`Streamer`] up to. See
/// `src/collaborators.rs` for the contracts each one honors.
pub struct StreamerDeps {
    /// Resolves keys to partitions and exposes assignment snapshots.
    pub affinity: Arc<dyn AffinityResolver>,
    /// Cluster membership and discovery.
    pub discovery: Arc<dyn Discovery>,
    /// Message transport.
    pub transport: Arc<dyn Transport>,
    /// Server-side batch receiver.
    pub receiver: Arc<dyn Receiver>,
    /// Opaque blob (de)serialization.
    pub serializer: Arc<dyn Serializer>,
    /// Optional authorization check; `None` skips authorization entirely.
    pub security: Option<Arc<dyn Security>>,
    /// Pre-serialized reply topic the server should respond on for this
    /// streamer's requests.
    pub response_topic: Bytes,
}

/// Public contract of the bulk data-ingestion engine: thread-local
/// buffering, partition-aware routing, striped per-node batching with
/// bounded parallelism, remap-on-topology-change, and a flush/close state
/// machine.
///
/// A `Streamer` is always held behind an `Arc` — its async methods take
/// `self: &Arc<Self>` so they can spawn tasks (submission dispatch, remap
/// resubmission, the node-left reaction) that outlive the call that
/// triggered them, matching the contract that every returned future
/// resolves independently of the caller continuing to hold the streamer.
pub struct Streamer {
    cache_id: Arc<str>,
    deps: Arc<NodeBufferDeps>,
    security: Option<Arc<dyn Security>>,
    router: Router,
    node_buffers: parking_lot::RwLock<HashMap<NodeId, Arc<NodeBuffer>>>,
    thread_buffers: parking_lot::Mutex<HashMap<std::thread::ThreadId, Arc<ThreadBuffer>>>,
    busy_lock: tokio::sync::RwLock<()>,
    closed: AtomicBool,
    cancelled: AtomicBool,
    cancel_reason: parking_lot::Mutex<Option<String>>,
    fail_count: AtomicU64,
    remap: Arc<RemapController>,
    auto_flush_scheduler: Arc<AutoFlushScheduler>,
    lifetime_completer: parking_lot::Mutex<Option<Completer>>,
    lifetime_future: CompletionFuture,
    self_weak: OnceLock<Weak<Streamer>>,
    span: tracing::Span,
}

impl Streamer {
    /// Builds a `Streamer` targeting `cache_name`, wired to `deps`, and
    /// registers it with cluster discovery and the process-wide
    /// auto-flush scheduler.
    #[must_use]
    pub fn new(
        cache_id: impl Into<Arc<str>>,
        cache_name: impl Into<Arc<str>>,
        config: StreamerConfig,
        deps: StreamerDeps,
        auto_flush_scheduler: Arc<AutoFlushScheduler>,
    ) -> Arc<Self> {
        let cache_id = cache_id.into();
        let metrics = Arc::new(StreamerMetrics::new());
        let config = Arc::new(config);
        let remap = Arc::new(RemapController::new(
            config.max_remap_count,
            config.timeout,
            Arc::clone(&metrics),
        ));

        let node_deps = Arc::new(NodeBufferDeps {
            receiver: deps.receiver,
            transport: deps.transport,
            serializer: deps.serializer,
            affinity: Arc::clone(&deps.affinity),
            discovery: Arc::clone(&deps.discovery),
            cache_name: cache_name.into(),
            response_topic: deps.response_topic,
            config: Arc::clone(&config),
            metrics: Arc::clone(&metrics),
            remap: Arc::clone(&remap),
        });

        let (lifetime_completer, lifetime_future) = new_completion();
        let span = tracing::info_span!("streamer", cache_id = %cache_id);

        let streamer = Arc::new(Self {
            cache_id,
            router: Router::new(Arc::clone(&deps.affinity)),
            deps: node_deps,
            security: deps.security,
            node_buffers: parking_lot::RwLock::new(HashMap::new()),
            thread_buffers: parking_lot::Mutex::new(HashMap::new()),
            busy_lock: tokio::sync::RwLock::new(()),
            closed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            cancel_reason: parking_lot::Mutex::new(None),
            fail_count: AtomicU64::new(0),
            remap: Arc::clone(&remap),
            auto_flush_scheduler: Arc::clone(&auto_flush_scheduler),
            lifetime_completer: parking_lot::Mutex::new(Some(lifetime_completer)),
            lifetime_future,
            self_weak: OnceLock::new(),
            span,
        });

        let _ = streamer.self_weak.set(Arc::downgrade(&streamer));
        remap.bind_sink(Arc::downgrade(&streamer) as Weak<dyn RemapSink>);
        deps.discovery
            .subscribe(Arc::clone(&streamer) as Arc<dyn TopologyEventHandler>);

        if let Some(period) = streamer.deps.config.auto_flush_period.filter(|d| !d.is_zero()) {
            auto_flush_scheduler.schedule(
                Arc::downgrade(&streamer) as Weak<dyn AutoFlushable>,
                Instant::now(),
                period,
            );
        }

        streamer
    }

    /// This streamer's cache identifier, used to tag its log span.
    #[must_use]
    pub fn cache_id(&self) -> &str {
        &self.cache_id
    }

    /// A snapshot of this streamer's counters.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.deps.metrics.snapshot()
    }

    /// `true` once `close` has been called (with or without cancellation).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Submits `entries`, appending each to the calling thread's
    /// `ThreadBuffer` and dispatching once `per_thread_buffer_size` is
    /// crossed. Returns a future that resolves once every entry submitted
    /// in this call has been acknowledged or failed.
    ///
    /// # Errors
    /// Returns [`StreamerError::Closed`] or [`StreamerError::Cancelled`] if
    /// the streamer is no longer accepting submissions, or a
    /// [`StreamerError`] from the configured [`Security`] check.
    pub async fn add(self: &Arc<Self>, entries: Vec<Entry>) -> Result<CompletionFuture, StreamerError> {
        let _span = self.span.enter();
        self.ensure_open()?;
        let _read = self.busy_lock.read().await;
        self.ensure_open()?;
        self.remap.admit().await?;

        if let Some(security) = &self.security {
            for entry in &entries {
                let op = if entry.is_remove() { AuthOp::Remove } else { AuthOp::Put };
                security.authorize(&self.deps.cache_name, op)?;
            }
        }

        self.deps.metrics.record_entries_submitted(entries.len() as u64);

        let buf = self.thread_buffer_for_current_thread();
        let mut aggregate = AggregateFuture::new();
        let mut need_add = true;
        let mut handoffs = Vec::new();

        for entry in entries {
            let (future, handoff) = buf.append(entry, self.deps.config.per_thread_buffer_size);
            if need_add {
                aggregate.add(future);
                need_add = false;
            }
            if let Some(handoff) = handoff {
                handoffs.push(handoff);
                need_add = true;
            }
        }

        for handoff in handoffs {
            self.spawn_dispatch(handoff.entries, handoff.completer);
        }

        Ok(aggregate.into_future())
    }

    /// Drains every `ThreadBuffer` and forces every `NodeBuffer` stripe to
    /// hand off, then waits for all of it to resolve. Bounded by the
    /// configured `timeout`; fails with [`StreamerError::Timeout`] if the
    /// deadline passes first.
    ///
    /// # Errors
    /// Returns [`StreamerError::Timeout`] if `timeout` elapses before every
    /// collected future resolves.
    pub async fn flush(self: &Arc<Self>) -> Result<(), StreamerError> {
        let _span = self.span.enter();
        let _write = self.busy_lock.write().await;
        match self.deps.config.timeout {
            Some(duration) => tokio::time::timeout(duration, self.flush_body())
                .await
                .map_err(|_| StreamerError::Timeout(duration))?,
            None => self.flush_body().await,
        }
    }

    /// Non-blocking flush attempt used by the auto-flush worker: returns
    /// immediately if the busy lock can't be taken without blocking;
    /// otherwise performs the same work as [`Streamer::flush`] but
    /// swallows any error (the per-submission futures already carry their
    /// own outcome to their original callers).
    pub fn try_flush(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let _ = tokio::spawn(async move {
            this.attempt_try_flush().await;
        });
    }

    async fn attempt_try_flush(self: &Arc<Self>) {
        if let Ok(_guard) = self.busy_lock.try_write() {
            let _ = self.flush_body().await;
        }
    }

    async fn flush_body(self: &Arc<Self>) -> Result<(), StreamerError> {
        let handoffs: Vec<_> = {
            let bufs = self.thread_buffers.lock();
            bufs.values().filter_map(|buf| buf.force_handoff()).collect()
        };

        // Dispatched inline, not via `spawn_dispatch`, so every NodeBuffer a
        // thread-buffer's entries land in is created and registered in
        // `node_buffers` before the snapshot below is taken — otherwise a
        // stripe that only ever existed in a ThreadBuffer has nothing to
        // hand its completion off to and `flush` hangs.
        let mut waiters = Vec::with_capacity(handoffs.len());
        for handoff in handoffs {
            let future = self.dispatch(handoff.entries, None, 0, false).await;
            waiters.push(future.clone());
            let completer = handoff.completer;
            let _ = tokio::spawn(async move {
                completer.complete(future.await);
            });
        }

        let node_buffers: Vec<_> = self.node_buffers.read().values().cloned().collect();
        for node_buffer in &node_buffers {
            waiters.extend(node_buffer.flush_all().await);
        }

        for waiter in waiters {
            if waiter.await.is_err() {
                self.fail_count.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Idempotently closes the streamer. If `cancel` is `true`, every
    /// outstanding future completes with [`StreamerError::Cancelled`] and
    /// `cause` is recorded (first writer wins); otherwise a final flush is
    /// performed. Returns the streamer's lifetime future, which resolves
    /// with an aggregate failure if any submission ever failed.
    pub async fn close(self: &Arc<Self>, cancel: bool, cause: Option<String>) -> CompletionFuture {
        let _span = self.span.enter();
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return self.lifetime_future.clone();
        }

        let _write = self.busy_lock.write().await;
        if cancel {
            self.cancelled.store(true, Ordering::Release);
            self.set_cancel_reason_if_absent(cause.unwrap_or_else(|| "streamer closed with cancel=true".to_string()));
            self.fail_everything_outstanding();
        } else {
            let _ = self.flush_body().await;
        }

        let fail_count = self.fail_count.load(Ordering::Acquire);
        if let Some(completer) = self.lifetime_completer.lock().take() {
            let result = if fail_count > 0 {
                Err(StreamerError::AggregateFailure { fail_count })
            } else {
                Ok(())
            };
            completer.complete(result);
        }
        self.lifetime_future.clone()
    }

    /// Demultiplexes an incoming `LoadResponse` to the `NodeBuffer` that
    /// dispatched the matching `request_id`. A no-op if `node` has no
    /// live buffer (e.g. it already left the cluster).
    pub fn handle_response(&self, node: &NodeId, response: LoadResponse) {
        if let Some(node_buffer) = self.node_buffers.read().get(node) {
            node_buffer.on_response(response.request_id, response.error);
        }
    }

    fn ensure_open(&self) -> Result<(), StreamerError> {
        if self.cancelled.load(Ordering::Acquire) {
            let cause = self.cancel_reason.lock().clone().unwrap_or_default();
            return Err(StreamerError::Cancelled { cause });
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(StreamerError::Closed);
        }
        Ok(())
    }

    fn set_cancel_reason_if_absent(&self, cause: String) {
        let mut guard = self.cancel_reason.lock();
        if guard.is_none() {
            *guard = Some(cause);
        }
    }

    fn fail_everything_outstanding(&self) {
        let cause = self.cancel_reason.lock().clone().unwrap_or_default();
        let mut failed = 0u64;
        for buf in self.thread_buffers.lock().values() {
            if let Some(handoff) = buf.force_handoff() {
                handoff
                    .completer
                    .complete(Err(StreamerError::Cancelled { cause: cause.clone() }));
                failed += 1;
            }
        }
        for node_buffer in self.node_buffers.read().values() {
            failed += node_buffer.cancel_all(&cause);
        }
        if failed > 0 {
            self.fail_count.fetch_add(failed, Ordering::Relaxed);
        }
    }

    fn thread_buffer_for_current_thread(&self) -> Arc<ThreadBuffer> {
        let thread_id = std::thread::current().id();
        let mut buffers = self.thread_buffers.lock();
        Arc::clone(
            buffers
                .entry(thread_id)
                .or_insert_with(|| Arc::new(ThreadBuffer::new(thread_id))),
        )
    }

    fn get_or_create_node_buffer(&self, node: &NodeId) -> Arc<NodeBuffer> {
        if let Some(existing) = self.node_buffers.read().get(node) {
            return Arc::clone(existing);
        }
        let mut buffers = self.node_buffers.write();
        if let Some(existing) = buffers.get(node) {
            return Arc::clone(existing);
        }
        let is_local = *node == self.deps.discovery.local_node();
        let pool_size = self.deps.discovery.worker_pool_size(node);
        let buffer = Arc::new(NodeBuffer::new(node.clone(), is_local, pool_size, Arc::clone(&self.deps)));
        let _ = buffers.insert(node.clone(), Arc::clone(&buffer));
        buffer
    }

    /// Resolves `entries` against the current affinity assignment and
    /// folds each per-node sub-batch into its `NodeBuffer`, returning a
    /// future that resolves once every resulting child has resolved
    /// (each child may itself be remapped transparently before this
    /// future ever sees it complete).
    async fn dispatch(
        self: &Arc<Self>,
        entries: Vec<Entry>,
        hint: Option<RemapHint>,
        remap_count: u32,
        is_remap: bool,
    ) -> CompletionFuture {
        let topology = self.deps.discovery.topology_version();
        let assignment = self.deps.affinity.assignment(topology);
        let view = AffinityView::new(topology, assignment);
        let routed = match self
            .router
            .route(entries, hint.as_ref(), &view, self.deps.config.allow_overwrite)
        {
            Ok(routed) => routed,
            Err(e) => {
                self.deps.metrics.record_batch_failed();
                return crate::future::ready(Err(e));
            }
        };

        let mut aggregate = AggregateFuture::new();
        for (node, node_entries) in routed {
            let node_buffer = self.get_or_create_node_buffer(&node);
            let batch = Batch {
                entries: node_entries,
                view: view.clone(),
                remap_count,
            };
            node_buffer.update(batch, &mut aggregate, is_remap).await;
        }
        aggregate.into_future()
    }

    fn spawn_dispatch(self: &Arc<Self>, entries: Vec<Entry>, completer: Completer) {
        let this = Arc::clone(self);
        let _ = tokio::spawn(async move {
            let future = this.dispatch(entries, None, 0, false).await;
            completer.complete(future.await);
        });
    }
}

impl TopologyEventHandler for Streamer {
    fn on_event(&self, event: TopologyEvent, topology: TopologyVersion) {
        let node = match event {
            TopologyEvent::NodeLeft(n) | TopologyEvent::NodeFailed(n) => n,
        };
        let Some(node_buffer) = self.node_buffers.write().remove(&node) else {
            return;
        };
        debug!(%node, "node buffer removed from map; scheduling on_node_left");
        let discovery = Arc::clone(&self.deps.discovery);
        let _ = tokio::spawn(async move {
            discovery.topology_ready(topology).await;
            node_buffer.on_node_left();
        });
    }
}

#[async_trait]
impl RemapSink for Streamer {
    async fn resubmit(&self, job: RemapJob) {
        let Some(strong) = self.self_weak.get().and_then(Weak::upgrade) else {
            job.completer.complete(Err(StreamerError::ClientDisconnected));
            return;
        };
        let RemapJob {
            hint,
            entries,
            remap_count,
            completer,
            ..
        } = job;
        debug!(remap_count, entries = entries.len(), "resubmitting remapped batch");
        let future = strong.dispatch(entries, hint, remap_count, true).await;
        let _ = tokio::spawn(async move {
            completer.complete(future.await);
        });
    }
}

impl AutoFlushable for Streamer {
    fn try_flush(&self) {
        let Some(strong) = self.self_weak.get().and_then(Weak::upgrade) else {
            return;
        };
        strong.deps.metrics.record_auto_flush_trigger();
        let _ = tokio::spawn(async move {
            strong.attempt_try_flush().await;
        });
    }

    fn auto_flush_period(&self) -> Option<Duration> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        self.deps.config.auto_flush_period.filter(|d| !d.is_zero())
    }
}
