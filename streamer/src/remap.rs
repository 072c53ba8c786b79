// Copyright Distributed Cache Project Authors
// SPDX-License-Identifier: Apache-2.0

//! Drain barrier ensuring a batch that failed remappably is re-routed
//! before later submissions on the same streamer can complete.
//!
//! Mechanism: a counting semaphore with a large fixed number of permits.
//! New submissions call [`RemapController::admit`], which acquires and
//! immediately releases *every* permit — proving no remap is currently
//! in flight before proceeding. A remappable failure acquires exactly one
//! permit, enqueues the failed batch, and (if no drainer is already
//! running) spawns one; the drainer processes the queue serially,
//! releasing each job's permit once it has re-routed it. Per-batch remap
//! counts are tracked on the job itself, the same track-by-id-with-a-
//! bounded-counter shape used for acknowledgment accounting elsewhere in
//! this kind of pipeline.

use crate::entry::{Entry, RemapHint};
use crate::error::StreamerError;
use crate::future::Completer;
use crate::metrics::StreamerMetrics;
use crate::topology::NodeId;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

const MAX_PERMITS: u32 = 1 << 16;

/// One previously-dispatched batch being re-routed after a remappable
/// failure.
pub struct RemapJob {
    /// Pins this job to a specific node, valid only if the topology has not
    /// moved on again. `None` lets the router re-resolve ownership from
    /// scratch against whatever the current assignment is at resubmit
    /// time — the common case, since a topology-changed failure usually
    /// means the node that used to own the partition no longer does.
    pub hint: Option<RemapHint>,
    /// Entries to re-route, in their original order.
    pub entries: Vec<Entry>,
    /// Number of times this batch has been remapped so far, including this
    /// one.
    pub remap_count: u32,
    /// Resolves the original caller-visible future once this job (and any
    /// further remap it triggers) ultimately completes.
    pub completer: Completer,
    permit: OwnedSemaphorePermit,
}

/// Callback the owning [`crate::streamer::Streamer`] implements to
/// actually re-route and re-submit a drained [`RemapJob`] (re-resolve via
/// [`crate::router::Router`], re-enter [`crate::node_buffer::NodeBuffer::update`]).
#[async_trait]
pub trait RemapSink: Send + Sync {
    /// Re-routes and re-submits `job`. The controller's permit for this
    /// job is released once this call returns.
    async fn resubmit(&self, job: RemapJob);
}

/// Per-streamer remap drain barrier.
pub struct RemapController {
    semaphore: Arc<Semaphore>,
    queue: parking_lot::Mutex<VecDeque<RemapJob>>,
    draining: AtomicBool,
    sink: OnceLock<Weak<dyn RemapSink>>,
    max_remap_count: u32,
    timeout: Option<Duration>,
    metrics: Arc<StreamerMetrics>,
}

impl RemapController {
    /// Builds a controller bounding remaps at `max_remap_count` and every
    /// blocking wait at `timeout`.
    #[must_use]
    pub fn new(max_remap_count: u32, timeout: Option<Duration>, metrics: Arc<StreamerMetrics>) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(MAX_PERMITS as usize)),
            queue: parking_lot::Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            sink: OnceLock::new(),
            max_remap_count,
            timeout,
            metrics,
        }
    }

    /// Wires the callback used to re-route drained jobs. Called exactly
    /// once by the owning streamer right after it is first wrapped in an
    /// `Arc`, since the sink is the streamer itself.
    pub fn bind_sink(&self, sink: Weak<dyn RemapSink>) {
        let _ = self.sink.set(sink);
    }

    /// Blocks until no remap is in flight, then returns immediately —
    /// callers proceed with a fresh submission only after this resolves.
    pub async fn admit(&self) -> Result<(), StreamerError> {
        let acquire = Arc::clone(&self.semaphore).acquire_many_owned(MAX_PERMITS);
        let permit = match self.timeout {
            Some(d) => tokio::time::timeout(d, acquire)
                .await
                .map_err(|_| StreamerError::Timeout(d))?
                .map_err(|_| StreamerError::ClientDisconnected)?,
            None => acquire.await.map_err(|_| StreamerError::ClientDisconnected)?,
        };
        drop(permit);
        Ok(())
    }

    /// Enqueues a remappable failure for re-routing. If `remap_count`
    /// (the number of prior attempts) has already reached
    /// `max_remap_count`, fails `completer` with `RemapExhausted` instead
    /// of enqueuing.
    pub async fn enqueue(
        self: &Arc<Self>,
        node: NodeId,
        hint: Option<RemapHint>,
        entries: Vec<Entry>,
        remap_count: u32,
        completer: Completer,
    ) {
        if remap_count >= self.max_remap_count {
            warn!(%node, remap_count, "remap count exhausted");
            completer.complete(Err(StreamerError::RemapExhausted {
                node,
                max_remap_count: self.max_remap_count,
            }));
            return;
        }

        let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                completer.complete(Err(StreamerError::ClientDisconnected));
                return;
            }
        };

        self.metrics.record_remap();
        debug!(%node, remap_count, "enqueuing remap job");
        self.queue.lock().push_back(RemapJob {
            hint,
            entries,
            remap_count: remap_count + 1,
            completer,
            permit,
        });
        self.spawn_drainer_if_needed();
    }

    fn spawn_drainer_if_needed(self: &Arc<Self>) {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let job = this.queue.lock().pop_front();
                let Some(job) = job else {
                    this.draining.store(false, Ordering::Release);
                    if this.queue.lock().is_empty() {
                        break;
                    }
                    if this
                        .draining
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        break;
                    }
                    continue;
                };
                this.process(job).await;
            }
        });
    }

    async fn process(&self, job: RemapJob) {
        match self.sink.get().and_then(Weak::upgrade) {
            Some(sink) => sink.resubmit(job).await,
            None => job.completer.complete(Err(StreamerError::ClientDisconnected)),
        }
    }
}
