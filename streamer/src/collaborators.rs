// Copyright Distributed Cache Project Authors
// SPDX-License-Identifier: Apache-2.0

//! Contracts for the components this crate treats as external
//! collaborators: the affinity resolver, the cluster discovery/membership
//! service, the message transport, the pluggable server-side receiver,
//! the security authorizer, and the serializer.
//!
//! Production embedders implement these traits against their real store,
//! membership service, and network stack. [`crate::testkit`] provides
//! in-memory doubles used by this crate's own test suite.

use crate::entry::Entry;
use crate::error::StreamerError;
use crate::topology::{AffinityAssignment, NodeId, TopologyVersion};
use crate::wire::LoadRequest;
use async_trait::async_trait;
use std::sync::Arc;

/// Resolves keys to partitions and exposes the assignment snapshot for a
/// given topology version.
#[async_trait]
pub trait AffinityResolver: Send + Sync {
    /// Computes the partition a key belongs to.
    fn partition_for_key(&self, key: &[u8]) -> i32;

    /// Returns the assignment published for `topology`. Callers treat the
    /// returned snapshot as immutable.
    fn assignment(&self, topology: TopologyVersion) -> Arc<AffinityAssignment>;

    /// Resolves once the resolver is ready to serve `topology` (i.e. the
    /// assignment for that version has been published and partitions are
    /// reserved against eviction for the duration of a local call).
    async fn ready(&self, topology: TopologyVersion);
}

/// A single cluster membership change notification.
#[derive(Clone, Debug)]
pub enum TopologyEvent {
    /// A node left the cluster gracefully.
    NodeLeft(NodeId),
    /// A node was declared failed by the membership service.
    NodeFailed(NodeId),
}

/// Receives topology-change notifications. Implemented by
/// [`crate::streamer::Streamer`] and registered with [`Discovery`].
pub trait TopologyEventHandler: Send + Sync {
    /// Called on the discovery thread; implementations must not block —
    /// the reaction is scheduled asynchronously, never run inline here.
    fn on_event(&self, event: TopologyEvent, topology: TopologyVersion);
}

/// Cluster membership and discovery.
pub trait Discovery: Send + Sync {
    /// This process's own node id.
    fn local_node(&self) -> NodeId;

    /// `true` if `id` is currently considered alive.
    fn alive(&self, id: &NodeId) -> bool;

    /// The discovery service's current view of the topology version.
    fn topology_version(&self) -> TopologyVersion;

    /// `node`'s declared worker-pool size, used to size its `NodeBuffer`'s
    /// stripe count and parallelism width absent a config override.
    fn worker_pool_size(&self, node: &NodeId) -> usize;

    /// Registers a handler for `NodeLeft`/`NodeFailed` events.
    fn subscribe(&self, handler: Arc<dyn TopologyEventHandler>);

    /// A future that resolves once `topology` is the service's current (or
    /// a past) version — used to schedule `on_node_left` asynchronously
    /// relative to a specific topology version.
    fn topology_ready(&self, topology: TopologyVersion) -> futures::future::BoxFuture<'static, ()>;
}

/// Message transport between the client-side streamer and the server-side
/// updater.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a `LoadRequest` to `node`. A successful return means the
    /// transport accepted the send; the eventual `LoadResponse` arrives
    /// out of band via whatever demux mechanism the embedder wires into
    /// the owning [`crate::node_buffer::NodeBuffer`].
    async fn send(&self, node: &NodeId, request: LoadRequest) -> Result<(), StreamerError>;
}

/// Authorization check invoked before entries containing non-null /
/// null values are admitted (PUT / REMOVE respectively).
pub trait Security: Send + Sync {
    /// Authorizes `op` against `cache`.
    fn authorize(&self, cache: &str, op: AuthOp) -> Result<(), StreamerError>;
}

/// The operation a [`Security`] check authorizes.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum AuthOp {
    /// Authorizes writing a non-null value.
    Put,
    /// Authorizes writing a null value (deletion).
    Remove,
}

/// Server-side batch receiver plug-in contract. Two built-in variants are
/// provided by [`crate::receiver`]: *isolated* (initial-value-only put,
/// skips already-present keys) and *individual* (full put semantics).
#[async_trait]
pub trait Receiver: Send + Sync {
    /// Applies `entries` to `cache`.
    async fn receive(&self, cache: &str, entries: &[Entry]) -> Result<(), StreamerError>;

    /// A stable name identifying this receiver variant on the wire.
    fn name(&self) -> &'static str;
}

/// Opaque blob encode/decode for keys, values, receiver descriptors, and
/// error causes carried over the wire.
pub trait Serializer: Send + Sync {
    /// Serializes the active receiver descriptor for inclusion in a
    /// [`LoadRequest`].
    fn encode_receiver(&self, receiver_name: &str) -> Result<bytes::Bytes, StreamerError>;

    /// Serializes an error cause for inclusion in a `LoadResponse`.
    fn encode_cause(&self, error: &StreamerError) -> bytes::Bytes;

    /// Deserializes an error cause received in a `LoadResponse`.
    fn decode_cause(&self, bytes: &[u8]) -> StreamerError;
}
