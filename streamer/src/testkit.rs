// Copyright Distributed Cache Project Authors
// SPDX-License-Identifier: Apache-2.0

//! In-memory test doubles for every collaborator trait in
//! [`crate::collaborators`]. Used by this crate's own `tests/` suite;
//! also usable by an embedder writing integration tests against a
//! [`crate::streamer::Streamer`] without a real cluster.

use crate::collaborators::{
    AffinityResolver, AuthOp, Discovery, Security, Serializer, Transport, TopologyEvent,
    TopologyEventHandler,
};
use crate::error::StreamerError;
use crate::streamer::Streamer;
use crate::topology::{AffinityAssignment, NodeId, TopologyVersion};
use crate::wire::LoadRequest;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

struct ClusterState {
    local_node: NodeId,
    version: TopologyVersion,
    assignment: Arc<AffinityAssignment>,
    alive: std::collections::HashSet<NodeId>,
    pool_sizes: HashMap<NodeId, usize>,
    handlers: Vec<Arc<dyn TopologyEventHandler>>,
}

/// A mutable, in-process stand-in for cluster discovery and the affinity
/// resolver. Tests drive topology changes by calling
/// [`TestCluster::publish_assignment`] or [`TestCluster::fail_node`];
/// subscribed handlers (the streamer itself, once constructed) are
/// notified synchronously.
pub struct TestCluster {
    state: parking_lot::RwLock<ClusterState>,
}

impl TestCluster {
    /// Builds a cluster whose local node is `local_node`, starting at
    /// topology `1.0` with every partition owned by `local_node` alone.
    #[must_use]
    pub fn new(local_node: impl Into<NodeId>) -> Arc<Self> {
        let local_node = local_node.into();
        let mut alive = std::collections::HashSet::new();
        alive.insert(local_node.clone());
        Arc::new(Self {
            state: parking_lot::RwLock::new(ClusterState {
                local_node,
                version: TopologyVersion::new(1, 0),
                assignment: Arc::new(AffinityAssignment::new(Vec::new())),
                alive,
                pool_sizes: HashMap::new(),
                handlers: Vec::new(),
            }),
        })
    }

    /// Registers `node` as alive with the given declared worker-pool size.
    pub fn add_node(&self, node: impl Into<NodeId>, pool_size: usize) {
        let node = node.into();
        let mut state = self.state.write();
        state.alive.insert(node.clone());
        state.pool_sizes.insert(node, pool_size);
    }

    /// Publishes a new assignment at the next minor version, keeping the
    /// major version unchanged (an assignment-only change).
    pub fn publish_assignment(&self, by_partition: Vec<Vec<NodeId>>) {
        let mut state = self.state.write();
        state.version.minor += 1;
        state.assignment = Arc::new(AffinityAssignment::new(by_partition));
    }

    /// Simulates `node` leaving the cluster: bumps the major topology
    /// version, removes it from the alive set, and synchronously notifies
    /// every subscribed handler.
    pub fn fail_node(&self, node: &NodeId) {
        let (handlers, new_version) = {
            let mut state = self.state.write();
            state.alive.remove(node);
            state.version.major += 1;
            state.version.minor = 0;
            (state.handlers.clone(), state.version)
        };
        for handler in handlers {
            handler.on_event(TopologyEvent::NodeFailed(node.clone()), new_version);
        }
    }

    /// Current topology version.
    #[must_use]
    pub fn version(&self) -> TopologyVersion {
        self.state.read().version
    }
}

#[async_trait]
impl AffinityResolver for TestCluster {
    fn partition_for_key(&self, key: &[u8]) -> i32 {
        if key.is_empty() {
            return 0;
        }
        i32::from(key[0]) % self.state.read().assignment.partition_count().max(1) as i32
    }

    fn assignment(&self, _topology: TopologyVersion) -> Arc<AffinityAssignment> {
        Arc::clone(&self.state.read().assignment)
    }

    async fn ready(&self, _topology: TopologyVersion) {}
}

impl Discovery for TestCluster {
    fn local_node(&self) -> NodeId {
        self.state.read().local_node.clone()
    }

    fn alive(&self, id: &NodeId) -> bool {
        self.state.read().alive.contains(id)
    }

    fn topology_version(&self) -> TopologyVersion {
        self.state.read().version
    }

    fn worker_pool_size(&self, node: &NodeId) -> usize {
        self.state.read().pool_sizes.get(node).copied().unwrap_or(1)
    }

    fn subscribe(&self, handler: Arc<dyn TopologyEventHandler>) {
        self.state.write().handlers.push(handler);
    }

    fn topology_ready(&self, _topology: TopologyVersion) -> BoxFuture<'static, ()> {
        async {}.boxed()
    }
}

/// What a [`RecordingTransport`] should do with the next `send` call.
#[derive(Clone)]
pub enum TransportAction {
    /// Accept the send, then asynchronously loop back a success
    /// `LoadResponse` to the bound streamer.
    AckSuccess,
    /// Accept the send, then loop back a failure `LoadResponse` carrying
    /// `error`.
    AckFailure(StreamerError),
    /// Reject the send itself with `error` (no response ever arrives).
    RejectSend(StreamerError),
}

struct TransportState {
    sent: Vec<LoadRequest>,
    default_action: TransportAction,
    queued_actions: HashMap<NodeId, std::collections::VecDeque<TransportAction>>,
}

/// In-memory [`Transport`] double that records every `LoadRequest` and,
/// once bound to a streamer via [`RecordingTransport::bind`], loops
/// responses back to it exactly as a real transport's demux would.
pub struct RecordingTransport {
    streamer: OnceLock<Weak<Streamer>>,
    state: parking_lot::Mutex<TransportState>,
}

impl RecordingTransport {
    /// Builds a transport that acks every send with success until told
    /// otherwise.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            streamer: OnceLock::new(),
            state: parking_lot::Mutex::new(TransportState {
                sent: Vec::new(),
                default_action: TransportAction::AckSuccess,
                queued_actions: HashMap::new(),
            }),
        })
    }

    /// Binds the streamer this transport loops responses back into. Call
    /// once, right after constructing the streamer.
    pub fn bind(&self, streamer: &Arc<Streamer>) {
        let _ = self.streamer.set(Arc::downgrade(streamer));
    }

    /// Queues a one-shot action for the next `send` addressed to `node`,
    /// ahead of whatever the default action is.
    pub fn queue_action(&self, node: NodeId, action: TransportAction) {
        self.state.lock().queued_actions.entry(node).or_default().push_back(action);
    }

    /// Sets the action applied to every `send` with no queued override.
    pub fn set_default_action(&self, action: TransportAction) {
        self.state.lock().default_action = action;
    }

    /// Every request sent so far, in send order.
    #[must_use]
    pub fn sent(&self) -> Vec<LoadRequest> {
        self.state.lock().sent.clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, node: &NodeId, request: LoadRequest) -> Result<(), StreamerError> {
        let action = {
            let mut state = self.state.lock();
            state.sent.push(request.clone());
            state
                .queued_actions
                .get_mut(node)
                .and_then(std::collections::VecDeque::pop_front)
                .unwrap_or_else(|| state.default_action.clone())
        };

        match action {
            TransportAction::RejectSend(error) => Err(error),
            TransportAction::AckSuccess => {
                self.loop_back(node.clone(), request.request_id, None);
                Ok(())
            }
            TransportAction::AckFailure(error) => {
                let cause = StubSerializer.encode_cause(&error);
                self.loop_back(node.clone(), request.request_id, Some(cause));
                Ok(())
            }
        }
    }
}

impl RecordingTransport {
    fn loop_back(&self, node: NodeId, request_id: u64, error: Option<Bytes>) {
        let Some(streamer) = self.streamer.get().and_then(Weak::upgrade) else {
            return;
        };
        let _ = tokio::spawn(async move {
            let response = crate::wire::LoadResponse { request_id, error };
            streamer.handle_response(&node, response);
        });
    }
}

/// Wire cause representation used by [`StubSerializer`]. Covers the
/// subset of [`StreamerError`] variants this crate's own tests need to
/// round-trip through a simulated wire response; anything else collapses
/// to `Other`.
#[derive(Serialize, Deserialize)]
enum WireCause {
    TopologyChanged { node: String, at_submit: (i64, i32), current: (i64, i32) },
    ReadOnlyCluster,
    ClientDisconnected,
    ReceiverError { reason: String },
    Other { reason: String },
}

/// [`Serializer`] double using `serde_json` over [`WireCause`]. Not a
/// general-purpose wire format — intended for this crate's own test
/// doubles only.
pub struct StubSerializer;

impl Serializer for StubSerializer {
    fn encode_receiver(&self, receiver_name: &str) -> Result<Bytes, StreamerError> {
        Ok(Bytes::copy_from_slice(receiver_name.as_bytes()))
    }

    fn encode_cause(&self, error: &StreamerError) -> Bytes {
        let wire = match error {
            StreamerError::TopologyChanged { node, at_submit, current } => WireCause::TopologyChanged {
                node: node.as_str().to_string(),
                at_submit: (at_submit.major, at_submit.minor),
                current: (current.major, current.minor),
            },
            StreamerError::ReadOnlyCluster => WireCause::ReadOnlyCluster,
            StreamerError::ClientDisconnected => WireCause::ClientDisconnected,
            StreamerError::ReceiverError { reason } => WireCause::ReceiverError { reason: reason.clone() },
            other => WireCause::Other { reason: other.to_string() },
        };
        Bytes::from(serde_json::to_vec(&wire).expect("WireCause always serializes"))
    }

    fn decode_cause(&self, bytes: &[u8]) -> StreamerError {
        match serde_json::from_slice::<WireCause>(bytes) {
            Ok(WireCause::TopologyChanged { node, at_submit, current }) => StreamerError::TopologyChanged {
                node: NodeId::new(node),
                at_submit: TopologyVersion::new(at_submit.0, at_submit.1),
                current: TopologyVersion::new(current.0, current.1),
            },
            Ok(WireCause::ReadOnlyCluster) => StreamerError::ReadOnlyCluster,
            Ok(WireCause::ClientDisconnected) => StreamerError::ClientDisconnected,
            Ok(WireCause::ReceiverError { reason }) => StreamerError::ReceiverError { reason },
            Ok(WireCause::Other { reason }) => StreamerError::Wire { node: NodeId::new("unknown"), reason },
            Err(e) => StreamerError::Serialization { reason: e.to_string() },
        }
    }
}

/// [`Security`] double that authorizes everything.
pub struct AllowAllSecurity;

impl Security for AllowAllSecurity {
    fn authorize(&self, _cache: &str, _op: AuthOp) -> Result<(), StreamerError> {
        Ok(())
    }
}
