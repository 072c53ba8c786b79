// Copyright Distributed Cache Project Authors
// SPDX-License-Identifier: Apache-2.0

//! Cluster topology types: node identity, topology versioning, and the
//! per-partition assignment snapshot produced by the affinity resolver.

use std::fmt;
use std::sync::Arc;

/// Opaque, stable identifier for a cluster member.
///
/// Cheap to clone (an `Arc<str>` clone) so it can be stashed in batches,
/// error variants, and map keys without extra allocation.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct NodeId(Arc<str>);

impl NodeId {
    /// Builds a `NodeId` from any string-like value.
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Borrows the underlying identifier string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Monotonically non-decreasing cluster topology identifier.
///
/// Comparisons are lexicographic on `(major, minor)`, matching the source
/// system's definition of "topology advanced".
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Debug, Default)]
pub struct TopologyVersion {
    /// Major component: bumped on membership changes.
    pub major: i64,
    /// Minor component: bumped on assignment changes within a membership.
    pub minor: i32,
}

impl TopologyVersion {
    /// Constructs a topology version.
    #[must_use]
    pub const fn new(major: i64, minor: i32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for TopologyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Ordered list, indexed by partition, of node lists (primary first, then
/// backups). Immutable once published for a given topology version — the
/// router and node buffers only ever see it behind an `Arc`.
#[derive(Clone, Debug, Default)]
pub struct AffinityAssignment {
    /// `by_partition[p]` is the ordered owner list for partition `p`.
    by_partition: Vec<Vec<NodeId>>,
}

impl AffinityAssignment {
    /// Builds an assignment from a partition-indexed vector of owner lists.
    #[must_use]
    pub fn new(by_partition: Vec<Vec<NodeId>>) -> Self {
        Self { by_partition }
    }

    /// Number of partitions this assignment covers.
    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.by_partition.len()
    }

    /// Full owner list (primary + backups) for a partition, or an empty
    /// slice if the partition index is out of range.
    #[must_use]
    pub fn owners(&self, partition: i32) -> &[NodeId] {
        if partition < 0 {
            return &[];
        }
        self.by_partition
            .get(partition as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Primary owner only, or `None` if the partition has no owners.
    #[must_use]
    pub fn primary(&self, partition: i32) -> Option<&NodeId> {
        self.owners(partition).first()
    }

    /// Structural equality against another assignment: same partition
    /// count, same owner lists in the same order. Used by `NodeBuffer` to
    /// decide whether an advancing topology actually changed *ownership*.
    /// Equality is strict, including per-partition owner order, since a
    /// reordering of backups still changes which node primary-only
    /// recipients would hit under `allow_overwrite = true`.
    #[must_use]
    pub fn same_ownership_as(&self, other: &AffinityAssignment) -> bool {
        self.by_partition == other.by_partition
    }
}

/// Snapshot of the affinity state at a point in time: the topology version
/// it was read at, and the assignment published for that version. Threaded
/// through the router and node buffers as a single unit so a batch's
/// routing decision and its staleness checks are always compared against
/// the same version/assignment pairing.
#[derive(Clone, Debug)]
pub struct AffinityView {
    /// Topology version this snapshot was read at.
    pub version: TopologyVersion,
    /// Assignment published for `version`.
    pub assignment: Arc<AffinityAssignment>,
}

impl AffinityView {
    /// Pairs a topology version with the assignment published for it.
    #[must_use]
    pub fn new(version: TopologyVersion, assignment: Arc<AffinityAssignment>) -> Self {
        Self { version, assignment }
    }

    /// Structural ownership equality against another view's assignment,
    /// regardless of the versions the two views were read at. See
    /// [`AffinityAssignment::same_ownership_as`].
    #[must_use]
    pub fn same_ownership_as(&self, other: &AffinityView) -> bool {
        self.assignment.same_ownership_as(&other.assignment)
    }
}
