// Copyright Distributed Cache Project Authors
// SPDX-License-Identifier: Apache-2.0

//! Error types for the streamer.
//!
//! Important: these errors must stay `Send + Sync` so they can cross the
//! thread boundary between producer threads, the tokio runtime, and the
//! transport's callback pool without restriction.

use crate::topology::{NodeId, TopologyVersion};

/// All errors that can be surfaced to a streamer caller, or recorded
/// internally while routing and dispatching a batch.
#[derive(thiserror::Error, Debug, Clone)]
pub enum StreamerError {
    /// The streamer has been closed; no further `add` calls are accepted.
    #[error("streamer is closed")]
    Closed,

    /// `close(cancel = true)` was called; every outstanding future resolves
    /// with the recorded cancellation cause.
    #[error("streamer was cancelled: {cause}")]
    Cancelled {
        /// The first-writer-wins cancellation cause.
        cause: String,
    },

    /// A blocking wait exceeded the configured `timeout`.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The affinity resolver produced an empty node list for an entry's
    /// partition.
    #[error("no server owns the partition for this key")]
    NoServerForKey,

    /// The topology advanced past the version a batch was composed
    /// against. Remappable: `RemapController` will re-route the batch.
    #[error("topology changed from {at_submit:?}, last known {current:?} (node {node})")]
    TopologyChanged {
        /// The node the batch was previously addressed to.
        node: NodeId,
        /// The topology version the batch was composed against.
        at_submit: TopologyVersion,
        /// The topology version observed when the failure was detected.
        current: TopologyVersion,
    },

    /// A batch was remapped more than `max_remap_count` times.
    #[error("exceeded max remap count ({max_remap_count}) for batch destined to {node}")]
    RemapExhausted {
        /// The node the batch was last addressed to.
        node: NodeId,
        /// The configured remap ceiling that was exceeded.
        max_remap_count: u32,
    },

    /// The cluster (or the specific cache) is read-only. Non-remappable,
    /// surfaced directly to the caller.
    #[error("cluster is read-only")]
    ReadOnlyCluster,

    /// The client has disconnected from the cluster. Terminal: every
    /// present and future submission fails with this error once raised.
    #[error("client disconnected from cluster")]
    ClientDisconnected,

    /// The key, value, receiver, or error cause could not be (de)serialized.
    #[error("serialization error: {reason}")]
    Serialization {
        /// Human-readable description of the failure.
        reason: String,
    },

    /// A transport-level failure that is not classified as a topology
    /// change (e.g. a malformed response, a permanently unreachable node).
    #[error("wire error talking to {node}: {reason}")]
    Wire {
        /// The node the request was addressed to.
        node: NodeId,
        /// Human-readable description of the failure.
        reason: String,
    },

    /// The receiver rejected the batch (e.g. security check, business rule).
    #[error("receiver rejected batch: {reason}")]
    ReceiverError {
        /// Human-readable description of the failure.
        reason: String,
    },

    /// A blocking wait was interrupted. The interrupted-state flag is the
    /// caller's responsibility to restore; this variant only signals that
    /// the wait did not complete normally.
    #[error("operation interrupted")]
    Interrupted,

    /// One or more entries in a `close()` failed; the lifetime future
    /// resolves with this aggregate.
    #[error("streamer closed with {fail_count} failed submissions")]
    AggregateFailure {
        /// Total failures observed over the streamer's lifetime.
        fail_count: u64,
    },
}

impl StreamerError {
    /// Returns `true` if this error is recovered locally by
    /// [`crate::remap::RemapController`] rather than surfaced to the
    /// submission future immediately.
    #[must_use]
    pub fn is_remappable(&self) -> bool {
        matches!(self, StreamerError::TopologyChanged { .. })
    }

    /// Returns `true` if this error is sticky and terminal for the whole
    /// streamer, meaning every present and future submission must fail
    /// with it once raised.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamerError::ClientDisconnected)
    }

    /// Returns the name of this error variant, used for metrics labels and
    /// log fields.
    #[must_use]
    pub fn variant_name(&self) -> &'static str {
        match self {
            StreamerError::Closed => "Closed",
            StreamerError::Cancelled { .. } => "Cancelled",
            StreamerError::Timeout(_) => "Timeout",
            StreamerError::NoServerForKey => "NoServerForKey",
            StreamerError::TopologyChanged { .. } => "TopologyChanged",
            StreamerError::RemapExhausted { .. } => "RemapExhausted",
            StreamerError::ReadOnlyCluster => "ReadOnlyCluster",
            StreamerError::ClientDisconnected => "ClientDisconnected",
            StreamerError::Serialization { .. } => "Serialization",
            StreamerError::Wire { .. } => "Wire",
            StreamerError::ReceiverError { .. } => "ReceiverError",
            StreamerError::Interrupted => "Interrupted",
            StreamerError::AggregateFailure { .. } => "AggregateFailure",
        }
    }
}
