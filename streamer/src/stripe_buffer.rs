// Copyright Distributed Cache Project Authors
// SPDX-License-Identifier: Apache-2.0

//! Per-(node, stripe) accumulator.
//!
//! Every operation on a stripe happens under its own short-held mutex;
//! the lock is never held across `submit` or any I/O — the caller
//! captures the handed-off entries and drops the guard before doing
//! anything that can block or cross a network boundary.

use crate::entry::Entry;
use crate::future::{Completer, CompletionFuture, new_completion};
use crate::topology::{AffinityView, TopologyVersion};
use parking_lot::Mutex;

/// A captured batch handed off by a stripe once it crosses the size
/// threshold or is force-flushed, paired with the completer for the
/// future that was tracking it.
pub struct StripeHandoff {
    /// Entries captured from the stripe at hand-off time.
    pub entries: Vec<Entry>,
    /// Affinity view the captured batch was composed against.
    pub view: AffinityView,
    /// Highest remap count carried by any entry folded into this batch.
    pub remap_count: u32,
    /// The future callers were given for this batch — already handed out
    /// by `append`, but needed again here so a forced flush can wait on
    /// it.
    pub future: CompletionFuture,
    /// Resolves `future`.
    pub completer: Completer,
}

struct StripeState {
    entries: Vec<Entry>,
    current_future: Option<CompletionFuture>,
    current_completer: Option<Completer>,
    batch_view: Option<AffinityView>,
    remap_count: u32,
}

impl StripeState {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            current_future: None,
            current_completer: None,
            batch_view: None,
            remap_count: 0,
        }
    }

    fn ensure_future(&mut self) -> CompletionFuture {
        if self.current_future.is_none() {
            let (completer, fut) = new_completion();
            self.current_completer = Some(completer);
            self.current_future = Some(fut);
        }
        self.current_future.clone().expect("just ensured")
    }

    /// Captures the current batch and resets to a fresh empty one.
    /// Returns `None` if there is nothing to capture.
    fn rotate(&mut self) -> Option<StripeHandoff> {
        if self.entries.is_empty() {
            return None;
        }
        let entries = std::mem::take(&mut self.entries);
        let view = self.batch_view.take();
        let completer = self.current_completer.take();
        let future = self.current_future.take();
        let remap_count = std::mem::take(&mut self.remap_count);
        match (view, completer, future) {
            (Some(view), Some(completer), Some(future)) => Some(StripeHandoff {
                entries,
                view,
                remap_count,
                future,
                completer,
            }),
            _ => None,
        }
    }
}

/// Guarded accumulator for one `(node, stripe)` pair.
pub struct PerStripeBuffer {
    stripe_id: usize,
    state: Mutex<StripeState>,
}

impl PerStripeBuffer {
    /// Creates an empty stripe buffer.
    #[must_use]
    pub fn new(stripe_id: usize) -> Self {
        Self {
            stripe_id,
            state: Mutex::new(StripeState::new()),
        }
    }

    /// This stripe's index within its owning `NodeBuffer`.
    #[must_use]
    pub fn stripe_id(&self) -> usize {
        self.stripe_id
    }

    /// Appends `entry`, composed against `view`. Returns the future
    /// tracking the stripe's currently-accumulating batch (the caller adds
    /// it to an `AggregateFuture` only the first time a given call touches
    /// this stripe, re-adding if the stripe rotates mid-call), and, if the
    /// append crossed `per_node_buffer_size`, the captured hand-off to
    /// submit.
    pub fn append(
        &self,
        entry: Entry,
        view: &AffinityView,
        per_node_buffer_size: usize,
        remap_count: u32,
    ) -> (CompletionFuture, Option<StripeHandoff>) {
        let mut state = self.state.lock();
        let future = state.ensure_future();
        state.remap_count = state.remap_count.max(remap_count);

        match &state.batch_view {
            None => {
                state.batch_view = Some(view.clone());
            }
            Some(existing) if view.version > existing.version => {
                // Topology advanced but ownership is unchanged: fold the
                // newer version in without forcing a remap.
                if existing.same_ownership_as(view) {
                    state.batch_view = Some(view.clone());
                }
            }
            _ => {}
        }

        state.entries.push(entry);

        let handoff = if state.entries.len() >= per_node_buffer_size {
            state.rotate()
        } else {
            None
        };

        (future, handoff)
    }

    /// Force-captures whatever is currently buffered, regardless of size
    /// (used by `flush`). Returns `None` if the stripe is empty.
    pub fn force_handoff(&self) -> Option<StripeHandoff> {
        let mut state = self.state.lock();
        state.rotate()
    }

    /// If the stripe's recorded batch view's version is strictly behind
    /// `call_topology`, captures and rotates the stripe so it can be
    /// failed with `TopologyChanged`. Returns the hand-off (with its
    /// completer still unresolved) so the caller can fail it with full
    /// context outside this lock.
    pub fn take_if_stale(&self, call_topology: TopologyVersion) -> Option<StripeHandoff> {
        let mut state = self.state.lock();
        match &state.batch_view {
            Some(existing) if call_topology > existing.version => state.rotate(),
            _ => None,
        }
    }
}
