// Copyright Distributed Cache Project Authors
// SPDX-License-Identifier: Apache-2.0

//! Lightweight, dependency-free counters surfaced by a [`crate::streamer::Streamer`].
//!
//! This crate does not assume an embedder has wired up a metrics exporter,
//! so counters are plain atomics rather than a registry-backed type; the
//! counter state here is kept separate from whatever pipeline eventually
//! exports it.

use std::sync::atomic::{AtomicU64, Ordering};

/// A point-in-time snapshot of [`StreamerMetrics`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MetricsSnapshot {
    /// Total entries submitted via `add`.
    pub entries_submitted: u64,
    /// Total batches dispatched (local invocation or wire send).
    pub batches_sent: u64,
    /// Total batches acknowledged successfully.
    pub batches_acked: u64,
    /// Total batches that failed terminally (after remap exhaustion or a
    /// non-remappable error).
    pub batches_failed: u64,
    /// Total remap attempts performed across all node buffers.
    pub remaps_performed: u64,
    /// Total times the auto-flush timer fired `try_flush`.
    pub auto_flush_triggers: u64,
}

/// Atomic counters backing [`MetricsSnapshot`].
#[derive(Default)]
pub struct StreamerMetrics {
    entries_submitted: AtomicU64,
    batches_sent: AtomicU64,
    batches_acked: AtomicU64,
    batches_failed: AtomicU64,
    remaps_performed: AtomicU64,
    auto_flush_triggers: AtomicU64,
}

impl StreamerMetrics {
    /// Creates a zeroed counter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_entries_submitted(&self, count: u64) {
        let _ = self.entries_submitted.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_batch_sent(&self) {
        let _ = self.batches_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_batch_acked(&self) {
        let _ = self.batches_acked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_batch_failed(&self) {
        let _ = self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_remap(&self) {
        let _ = self.remaps_performed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_auto_flush_trigger(&self) {
        let _ = self.auto_flush_triggers.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads a consistent-enough snapshot of all counters (each counter is
    /// read independently; this is a monitoring surface, not a
    /// transactional one).
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            entries_submitted: self.entries_submitted.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            batches_acked: self.batches_acked.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            remaps_performed: self.remaps_performed.load(Ordering::Relaxed),
            auto_flush_triggers: self.auto_flush_triggers.load(Ordering::Relaxed),
        }
    }
}
