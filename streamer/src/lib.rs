// Copyright Distributed Cache Project Authors
// SPDX-License-Identifier: Apache-2.0

//! Bulk data-ingestion engine for a distributed, partitioned in-memory
//! key-value store.
//!
//! A [`streamer::Streamer`](crate::streamer::Streamer) batches caller
//! submissions by producer thread, routes them to the node(s) that own
//! each key's partition, and accumulates per-destination-node batches
//! striped by partition to preserve intra-partition ordering. Batches
//! that fail because the topology moved out from under them are
//! transparently re-routed by the [`remap`] drain barrier rather than
//! surfaced to the caller.
//!
//! Embedders wire a [`Streamer`](crate::streamer::Streamer) up to their
//! own cluster membership, transport, and store by implementing the
//! traits in [`collaborators`]; [`testkit`] provides in-memory doubles
//! of each one for this crate's own test suite and for embedders writing
//! their own integration tests.

pub mod autoflush;
pub mod collaborators;
pub mod config;
pub mod entry;
pub mod error;
pub mod future;
pub mod metrics;
pub mod node_buffer;
pub mod receiver;
pub mod remap;
pub mod router;
pub mod streamer;
pub mod stripe_buffer;
pub mod thread_buffer;
pub mod topology;
pub mod wire;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use config::{StreamerConfig, StreamerConfigBuilder};
pub use entry::{Batch, Entry, RemapHint};
pub use error::StreamerError;
pub use streamer::{Streamer, StreamerDeps};
pub use topology::{AffinityAssignment, NodeId, TopologyVersion};
