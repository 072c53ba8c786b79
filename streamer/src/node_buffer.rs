// Copyright Distributed Cache Project Authors
// SPDX-License-Identifier: Apache-2.0

//! Per-destination-node accumulator: owns the stripes, the parallelism
//! semaphore, and the in-flight request table.

use crate::collaborators::{AffinityResolver, Discovery, Receiver, Serializer, Transport};
use crate::config::StreamerConfig;
use crate::entry::{Batch, Entry};
use crate::error::StreamerError;
use crate::future::{AggregateFuture, Completer};
use crate::metrics::StreamerMetrics;
use crate::remap::RemapController;
use crate::stripe_buffer::{PerStripeBuffer, StripeHandoff};
use crate::topology::{NodeId, TopologyVersion};
use crate::wire::{LoadRequest, STRIPE_DISABLED};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{Instrument, debug, error, warn};

/// Shared, read-only collaborators a `NodeBuffer` needs to carry out
/// local invocation or wire dispatch. Held behind an `Arc` and shared by
/// every `NodeBuffer` a [`crate::streamer::Streamer`] owns.
pub struct NodeBufferDeps {
    /// The pluggable server-side batch receiver.
    pub receiver: Arc<dyn Receiver>,
    /// The message transport.
    pub transport: Arc<dyn Transport>,
    /// Opaque blob (de)serialization.
    pub serializer: Arc<dyn Serializer>,
    /// Affinity resolver, used on the local fast path to check whether the
    /// topology has advanced past a submission's version.
    pub affinity: Arc<dyn AffinityResolver>,
    /// Cluster discovery/membership.
    pub discovery: Arc<dyn Discovery>,
    /// Name of the cache this streamer targets.
    pub cache_name: Arc<str>,
    /// Pre-serialized reply topic the server should respond on.
    pub response_topic: Bytes,
    /// Effective streamer configuration.
    pub config: Arc<StreamerConfig>,
    /// Shared metrics counters.
    pub metrics: Arc<StreamerMetrics>,
    /// Drain barrier re-routing batches that fail remappably.
    pub remap: Arc<RemapController>,
}

struct InFlightRequest {
    completer: Completer,
    permit: Option<OwnedSemaphorePermit>,
    entries: Vec<Entry>,
    remap_count: u32,
}

/// Per-destination-node accumulator with bounded parallelism and an
/// in-flight request table.
pub struct NodeBuffer {
    node_id: NodeId,
    is_local: bool,
    stripes: Vec<PerStripeBuffer>,
    parallelism: Arc<Semaphore>,
    next_request_id: AtomicU64,
    in_flight: parking_lot::Mutex<HashMap<u64, InFlightRequest>>,
    local_futures: parking_lot::Mutex<HashMap<u64, Option<OwnedSemaphorePermit>>>,
    deps: Arc<NodeBufferDeps>,
}

impl NodeBuffer {
    /// Creates a `NodeBuffer` for `node_id`, whose declared worker-pool
    /// size is `pool_size` (used to derive the default stripe count and
    /// parallelism width).
    #[must_use]
    pub fn new(node_id: NodeId, is_local: bool, pool_size: usize, deps: Arc<NodeBufferDeps>) -> Self {
        let stripe_count = deps.config.stripe_count_for(pool_size).max(1);
        let stripes = (0..stripe_count).map(PerStripeBuffer::new).collect();
        let permits = deps.config.parallel_ops_for(pool_size).max(1);
        Self {
            node_id,
            is_local,
            stripes,
            parallelism: Arc::new(Semaphore::new(permits)),
            next_request_id: AtomicU64::new(1),
            in_flight: parking_lot::Mutex::new(HashMap::new()),
            local_futures: parking_lot::Mutex::new(HashMap::new()),
            deps,
        }
    }

    /// The node this buffer accumulates batches for.
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Number of stripes this node buffer maintains.
    #[must_use]
    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    /// Current in-flight + locally-executing count, for tests asserting
    /// the parallelism bound is respected.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.in_flight.lock().len() + self.local_futures.lock().len()
    }

    fn stripe_for(&self, partition: i32) -> usize {
        let stripe_count = self.stripes.len() as i64;
        (i64::from(partition).rem_euclid(stripe_count)) as usize
    }

    /// Completes `completer` with `error` if it is not remappable;
    /// otherwise hands `entries` off to the `RemapController` so a fresh
    /// routing attempt re-resolves their destination once any ahead-of-it
    /// remap work has drained. `completer` resolves once that attempt (and
    /// any further remap it triggers) ultimately completes.
    fn fail_or_remap(&self, entries: Vec<Entry>, remap_count: u32, completer: Completer, error: StreamerError) {
        if !error.is_remappable() {
            completer.complete(Err(error));
            return;
        }
        warn!(node = %self.node_id, remap_count, %error, "remapping batch after remappable failure");
        let remap = Arc::clone(&self.deps.remap);
        let node = self.node_id.clone();
        let _ = tokio::spawn(async move {
            remap.enqueue(node, None, entries, remap_count, completer).await;
        });
    }

    /// Folds `batch` into this node's stripes, handing off any stripe that
    /// crosses `per_node_buffer_size` for submission, and registering the
    /// future tracking each newly-touched generation of a stripe's batch
    /// into `aggregate`.
    ///
    /// `remap` indicates this batch is being re-submitted after a
    /// remappable failure — it bypasses the parallelism semaphore, since
    /// admission for remapped data is gated by the `RemapController`
    /// instead.
    pub async fn update(self: &Arc<Self>, batch: Batch, aggregate: &mut AggregateFuture, remap: bool) {
        let topology = batch.view.version;
        let view = batch.view;
        let remap_count = batch.remap_count;
        let mut added_this_call: std::collections::HashSet<usize> = std::collections::HashSet::new();
        let mut handoffs: Vec<(usize, StripeHandoff)> = Vec::new();

        for entry in batch.entries {
            let stripe_id = self.stripe_for(entry.partition);
            let per_node_buffer_size = self.deps.config.per_node_buffer_size;
            let (future, handoff) = self.stripes[stripe_id].append(
                entry,
                &view,
                per_node_buffer_size,
                remap_count,
            );

            if added_this_call.insert(stripe_id) {
                aggregate.add(future);
            }
            if let Some(handoff) = handoff {
                handoffs.push((stripe_id, handoff));
                added_this_call.remove(&stripe_id);
            }
        }

        if !self.deps.config.allow_overwrite {
            for stripe in &self.stripes {
                if let Some(stale) = stripe.take_if_stale(topology) {
                    self.deps.metrics.record_batch_failed();
                    warn!(
                        node = %self.node_id,
                        stripe = stripe.stripe_id(),
                        at_submit = %stale.view.version,
                        current = %topology,
                        "rotating stale stripe batch"
                    );
                    let error = StreamerError::TopologyChanged {
                        node: self.node_id.clone(),
                        at_submit: stale.view.version,
                        current: topology,
                    };
                    self.fail_or_remap(stale.entries, stale.remap_count, stale.completer, error);
                }
            }
        }

        for (stripe_id, handoff) in handoffs {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.submit(handoff, stripe_id, remap).await;
            });
        }
    }

    /// Forces every non-empty stripe to hand off, submitting the captured
    /// batches. Returns the future tracking each hand-off so
    /// `Streamer::flush` can wait for every one to actually resolve, not
    /// merely be dispatched.
    pub async fn flush_all(self: &Arc<Self>) -> Vec<crate::future::CompletionFuture> {
        let mut futures = Vec::new();
        for (stripe_id, stripe) in self.stripes.iter().enumerate() {
            if let Some(handoff) = stripe.force_handoff() {
                futures.push(handoff.future.clone());
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    this.submit(handoff, stripe_id, false).await;
                });
            }
        }
        futures
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit, StreamerError> {
        let acquire = Arc::clone(&self.parallelism).acquire_owned();
        match self.deps.config.timeout {
            Some(duration) => match tokio::time::timeout(duration, acquire).await {
                Ok(Ok(permit)) => Ok(permit),
                Ok(Err(_)) => Err(StreamerError::ClientDisconnected),
                Err(_) => Err(StreamerError::Timeout(duration)),
            },
            None => acquire.await.map_err(|_| StreamerError::ClientDisconnected),
        }
    }

    async fn submit(self: &Arc<Self>, handoff: StripeHandoff, stripe_id: usize, remap: bool) {
        let span = tracing::debug_span!("submit", node = %self.node_id, stripe = stripe_id, remap);
        async {
            let permit = if remap {
                None
            } else {
                match self.acquire_permit().await {
                    Ok(permit) => Some(permit),
                    Err(e) => {
                        handoff.completer.complete(Err(e));
                        return;
                    }
                }
            };

            self.deps.metrics.record_batch_sent();
            if self.is_local {
                self.submit_local(handoff, permit).await;
            } else {
                self.submit_remote(handoff, stripe_id, permit).await;
            }
        }
        .instrument(span)
        .await;
    }

    async fn submit_local(&self, handoff: StripeHandoff, permit: Option<OwnedSemaphorePermit>) {
        let local_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.local_futures.lock().insert(local_id, permit);

        self.deps.affinity.ready(handoff.view.version).await;
        let current = self.deps.discovery.topology_version();
        let result = if current > handoff.view.version && !self.deps.config.allow_overwrite {
            Err(StreamerError::TopologyChanged {
                node: self.node_id.clone(),
                at_submit: handoff.view.version,
                current,
            })
        } else {
            self.deps
                .receiver
                .receive(&self.deps.cache_name, &handoff.entries)
                .await
        };

        self.local_futures.lock().remove(&local_id);
        debug!(node = %self.node_id, local_id, entries = handoff.entries.len(), ok = result.is_ok(), "local receive complete");
        match result {
            Ok(()) => {
                self.deps.metrics.record_batch_acked();
                handoff.completer.complete(Ok(()));
            }
            Err(e) => {
                self.deps.metrics.record_batch_failed();
                self.fail_or_remap(handoff.entries, handoff.remap_count, handoff.completer, e);
            }
        }
    }

    async fn submit_remote(
        &self,
        handoff: StripeHandoff,
        stripe_id: usize,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let receiver_bytes = match self.deps.serializer.encode_receiver(self.deps.receiver.name()) {
            Ok(bytes) => bytes,
            Err(e) => {
                drop(permit);
                handoff.completer.complete(Err(e));
                return;
            }
        };

        let stripe_hint = if self.deps.config.allow_overwrite {
            STRIPE_DISABLED
        } else {
            stripe_id as i32
        };

        let request = LoadRequest::new(
            request_id,
            self.deps.response_topic.clone(),
            self.deps.cache_name.to_string(),
            receiver_bytes,
            &handoff.entries,
            self.deps.config.skip_store,
            self.deps.config.keep_binary,
            handoff.view.version,
            stripe_hint,
        );

        debug!(node = %self.node_id, request_id, entries = request.entries.len(), "dispatching load request");

        self.in_flight.lock().insert(
            request_id,
            InFlightRequest {
                completer: handoff.completer,
                permit,
                entries: handoff.entries,
                remap_count: handoff.remap_count,
            },
        );

        if let Err(e) = self.deps.transport.send(&self.node_id, request).await {
            if let Some(in_flight) = self.in_flight.lock().remove(&request_id) {
                self.deps.metrics.record_batch_failed();
                self.fail_or_remap(in_flight.entries, in_flight.remap_count, in_flight.completer, e);
            }
        }
    }

    /// Handles an incoming `LoadResponse` for a previously-sent remote
    /// request.
    pub fn on_response(&self, request_id: u64, error_blob: Option<Bytes>) {
        let removed = self.in_flight.lock().remove(&request_id);
        let Some(in_flight) = removed else {
            warn!(node = %self.node_id, request_id, "response for unknown request id");
            return;
        };
        match error_blob {
            None => {
                self.deps.metrics.record_batch_acked();
                in_flight.completer.complete(Ok(()));
            }
            Some(bytes) => {
                let error = self.deps.serializer.decode_cause(&bytes);
                self.deps.metrics.record_batch_failed();
                self.fail_or_remap(in_flight.entries, in_flight.remap_count, in_flight.completer, error);
            }
        }
    }

    /// Completes every in-flight future and every stripe's
    /// currently-accumulating future with `TopologyChanged`, routing each
    /// through the `RemapController` like any other remappable failure.
    /// Called once this buffer has been removed from the streamer's node
    /// map, so no new work can be admitted to it.
    pub fn on_node_left(&self) {
        error!(node = %self.node_id, "node left; failing all pending work");
        let current = self.deps.discovery.topology_version();
        let make_error = |at_submit: TopologyVersion| StreamerError::TopologyChanged {
            node: self.node_id.clone(),
            at_submit,
            current,
        };
        for (_, in_flight) in self.in_flight.lock().drain() {
            let error = make_error(current);
            self.fail_or_remap(in_flight.entries, in_flight.remap_count, in_flight.completer, error);
        }
        // Local submissions complete their own completer from within the
        // running task; this buffer only owns their permits for
        // accounting, so there is nothing further to fail here.
        self.local_futures.lock().clear();
        for stripe in &self.stripes {
            if let Some(handoff) = stripe.force_handoff() {
                let error = make_error(handoff.view.version);
                self.fail_or_remap(handoff.entries, handoff.remap_count, handoff.completer, error);
            }
        }
    }

    /// Completes every in-flight and currently-accumulating future with
    /// [`StreamerError::Cancelled`] directly, bypassing the
    /// `RemapController` entirely — cancellation is terminal, unlike a
    /// remappable failure that still has somewhere else to go. Called by
    /// `Streamer::close` when closing with `cancel = true`. Returns the
    /// number of futures it force-completed, so the caller can fold it into
    /// the streamer's aggregate `fail_count`.
    pub fn cancel_all(&self, cause: &str) -> u64 {
        warn!(node = %self.node_id, cause, "cancelling all pending work");
        let mut completed = 0u64;
        for (_, in_flight) in self.in_flight.lock().drain() {
            in_flight
                .completer
                .complete(Err(StreamerError::Cancelled { cause: cause.to_string() }));
            completed += 1;
        }
        self.local_futures.lock().clear();
        for stripe in &self.stripes {
            if let Some(handoff) = stripe.force_handoff() {
                handoff
                    .completer
                    .complete(Err(StreamerError::Cancelled { cause: cause.to_string() }));
                completed += 1;
            }
        }
        completed
    }
}
