// Copyright Distributed Cache Project Authors
// SPDX-License-Identifier: Apache-2.0

//! The entry data model: the unit of work a caller submits, and the
//! batches the router and node buffers assemble from them.

use crate::topology::{AffinityView, NodeId, TopologyVersion};
use bytes::Bytes;

/// Sentinel partition value meaning "not yet resolved by the affinity
/// resolver".
pub const UNRESOLVED_PARTITION: i32 = -1;

/// A single key/value submission. A missing `value` denotes deletion.
/// Keys are opaque to the streamer; `partition` is derived lazily by the
/// [`crate::collaborators::AffinityResolver`].
#[derive(Clone, Debug)]
pub struct Entry {
    /// Opaque key bytes.
    pub key: Bytes,
    /// Partition index, or [`UNRESOLVED_PARTITION`] until resolved.
    pub partition: i32,
    /// Value bytes, or `None` to denote a deletion.
    pub value: Option<Bytes>,
}

impl Entry {
    /// Builds an unresolved put/delete entry.
    #[must_use]
    pub fn new(key: impl Into<Bytes>, value: Option<impl Into<Bytes>>) -> Self {
        Self {
            key: key.into(),
            partition: UNRESOLVED_PARTITION,
            value: value.map(Into::into),
        }
    }

    /// `true` if this entry denotes a deletion (no value).
    #[must_use]
    pub fn is_remove(&self) -> bool {
        self.value.is_none()
    }
}

/// A remap hint carried alongside an entry when it is being re-routed
/// after a remappable failure: the node it should be pinned to, valid
/// only while the topology remains at `topology`.
#[derive(Clone, Debug)]
pub struct RemapHint {
    /// The node a remapped entry must be delivered to.
    pub remap_node: NodeId,
    /// The topology version this hint is valid for.
    pub remap_topology: TopologyVersion,
}

/// Ordered list of entries destined for one node, tagged with the
/// affinity view (topology version + assignment snapshot) it was composed
/// against.
#[derive(Clone, Debug)]
pub struct Batch {
    /// The entries, in submission order.
    pub entries: Vec<Entry>,
    /// Topology version and assignment snapshot this batch was composed
    /// against.
    pub view: AffinityView,
    /// Number of times the entries behind this call have already been
    /// remapped (0 for an organically-accumulated batch). A stripe that
    /// mixes entries from calls with different counts keeps the highest
    /// one it has seen, so a batch never remaps fewer times than its
    /// most-remapped constituent.
    pub remap_count: u32,
}

impl Batch {
    /// Number of entries in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if the batch carries no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
