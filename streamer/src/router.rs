// Copyright Distributed Cache Project Authors
// SPDX-License-Identifier: Apache-2.0

//! Partition resolution and fan-out: maps a batch of entries to their
//! destination nodes via the current affinity assignment.

use crate::collaborators::AffinityResolver;
use crate::entry::{Entry, RemapHint, UNRESOLVED_PARTITION};
use crate::error::StreamerError;
use crate::topology::{AffinityView, NodeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Resolves entries to destination nodes and groups them into
/// per-node sub-batches.
pub struct Router {
    affinity: Arc<dyn AffinityResolver>,
}

impl Router {
    /// Builds a router over the given affinity resolver.
    #[must_use]
    pub fn new(affinity: Arc<dyn AffinityResolver>) -> Self {
        Self { affinity }
    }

    /// Resolves `entries` against `view`'s assignment, grouping them by
    /// destination node.
    ///
    /// `hint`, when present, pins every entry to `hint.remap_node` as long
    /// as `view.version` still equals `hint.remap_topology` — this is how a
    /// failed batch is re-submitted to its remap target without
    /// re-consulting the full assignment. If the topology has since moved
    /// on, the hint is stale and normal resolution applies instead.
    ///
    /// Fails the whole call with `NoServerForKey` if any entry resolves to
    /// an empty target list.
    pub fn route(
        &self,
        entries: Vec<Entry>,
        hint: Option<&RemapHint>,
        view: &AffinityView,
        allow_overwrite: bool,
    ) -> Result<HashMap<NodeId, Vec<Entry>>, StreamerError> {
        let pinned = hint.filter(|h| h.remap_topology == view.version);

        let mut by_node: HashMap<NodeId, Vec<Entry>> = HashMap::new();
        for mut entry in entries {
            if entry.partition == UNRESOLVED_PARTITION {
                entry.partition = self.affinity.partition_for_key(&entry.key);
            }

            let targets: Vec<NodeId> = if let Some(hint) = pinned {
                vec![hint.remap_node.clone()]
            } else {
                let owners = view.assignment.owners(entry.partition);
                if allow_overwrite {
                    owners.first().into_iter().cloned().collect()
                } else {
                    owners.to_vec()
                }
            };

            if targets.is_empty() {
                return Err(StreamerError::NoServerForKey);
            }

            for node in targets {
                by_node.entry(node).or_default().push(entry.clone());
            }
        }

        Ok(by_node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{AffinityAssignment, TopologyVersion};
    use bytes::Bytes;

    struct FixedResolver;

    #[async_trait::async_trait]
    impl AffinityResolver for FixedResolver {
        fn partition_for_key(&self, key: &[u8]) -> i32 {
            i32::from(key[0])
        }
        fn assignment(&self, _topology: TopologyVersion) -> Arc<AffinityAssignment> {
            unimplemented!("not exercised in these tests")
        }
        async fn ready(&self, _topology: TopologyVersion) {}
    }

    fn view(topology: TopologyVersion, owners: Vec<Vec<&str>>) -> AffinityView {
        let assignment = Arc::new(AffinityAssignment::new(
            owners
                .into_iter()
                .map(|nodes| nodes.into_iter().map(NodeId::new).collect())
                .collect(),
        ));
        AffinityView::new(topology, assignment)
    }

    #[test]
    fn backup_fan_out_duplicates_entry_per_owner() {
        let router = Router::new(Arc::new(FixedResolver));
        let view = view(TopologyVersion::new(1, 0), vec![vec!["a", "b", "c"]]);
        let entries = vec![Entry::new(Bytes::from_static(&[0u8]), Some(Bytes::from_static(b"v")))];
        let routed = router.route(entries, None, &view, false).expect("route succeeds");
        assert_eq!(routed.len(), 3);
        for entries in routed.values() {
            assert_eq!(entries.len(), 1);
        }
    }

    #[test]
    fn overwrite_true_targets_primary_only() {
        let router = Router::new(Arc::new(FixedResolver));
        let view = view(TopologyVersion::new(1, 0), vec![vec!["a", "b", "c"]]);
        let entries = vec![Entry::new(Bytes::from_static(&[0u8]), Some(Bytes::from_static(b"v")))];
        let routed = router.route(entries, None, &view, true).expect("route succeeds");
        assert_eq!(routed.len(), 1);
        assert!(routed.contains_key(&NodeId::new("a")));
    }

    #[test]
    fn empty_owner_list_fails_with_no_server_for_key() {
        let router = Router::new(Arc::new(FixedResolver));
        let view = view(TopologyVersion::new(1, 0), vec![vec![]]);
        let entries = vec![Entry::new(Bytes::from_static(&[0u8]), Some(Bytes::from_static(b"v")))];
        let err = router.route(entries, None, &view, false).unwrap_err();
        assert!(matches!(err, StreamerError::NoServerForKey));
    }

    #[test]
    fn fresh_remap_hint_pins_to_remap_node() {
        let router = Router::new(Arc::new(FixedResolver));
        let view = view(TopologyVersion::new(2, 0), vec![vec!["a", "b"]]);
        let hint = RemapHint {
            remap_node: NodeId::new("z"),
            remap_topology: TopologyVersion::new(2, 0),
        };
        let entries = vec![Entry::new(Bytes::from_static(&[0u8]), Some(Bytes::from_static(b"v")))];
        let routed = router
            .route(entries, Some(&hint), &view, false)
            .expect("route succeeds");
        assert_eq!(routed.len(), 1);
        assert!(routed.contains_key(&NodeId::new("z")));
    }

    #[test]
    fn stale_remap_hint_falls_back_to_normal_resolution() {
        let router = Router::new(Arc::new(FixedResolver));
        let view = view(TopologyVersion::new(3, 0), vec![vec!["a", "b"]]);
        let hint = RemapHint {
            remap_node: NodeId::new("z"),
            remap_topology: TopologyVersion::new(2, 0),
        };
        let entries = vec![Entry::new(Bytes::from_static(&[0u8]), Some(Bytes::from_static(b"v")))];
        let routed = router
            .route(entries, Some(&hint), &view, false)
            .expect("route succeeds");
        assert_eq!(routed.len(), 2);
        assert!(!routed.contains_key(&NodeId::new("z")));
    }
}
