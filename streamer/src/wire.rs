// Copyright Distributed Cache Project Authors
// SPDX-License-Identifier: Apache-2.0

//! Request/response wire protocol between the client-side streamer and
//! the server-side updater.

use crate::entry::Entry;
use crate::topology::TopologyVersion;
use bytes::Bytes;

/// Sentinel `stripe_hint` meaning "no stripe pinning" — used when
/// `allow_overwrite` is `true`, since a primary-only write cannot rely on
/// the remote stripe assignment to preserve per-partition order across
/// backups that no longer exist for this request.
pub const STRIPE_DISABLED: i32 = -1;

/// Deployment metadata placeholder.
///
/// Peers running on a managed runtime ship class-loader identity with
/// every request so that side can resolve the right receiver class. That
/// is a platform artifact with no native equivalent here; this crate
/// keeps the field in the wire struct for protocol-shape parity but never
/// populates it — the receiver is always carried explicitly as a
/// serialized descriptor.
#[derive(Clone, Debug, Default)]
pub struct DeploymentInfo {
    /// Deployment mode identifier (unused, always empty).
    pub mode: String,
    /// Fully-qualified receiver class name (unused, always empty).
    pub class_name: String,
    /// User-assigned deployment version (unused, always zero).
    pub user_version: i64,
    /// Number of participants in the deployment (unused, always zero).
    pub participants: i32,
    /// Class-loader identifier (unused, always zero).
    pub class_loader_id: i64,
}

/// A batch-load request sent from a `NodeBuffer` to the node that owns the
/// destination partition(s).
#[derive(Clone, Debug)]
pub struct LoadRequest {
    /// Monotonically increasing id, unique per `NodeBuffer`, used to demux
    /// the eventual `LoadResponse`.
    pub request_id: u64,
    /// Opaque, pre-serialized reply topic the server should respond on.
    pub response_topic: Bytes,
    /// Name of the cache this batch targets.
    pub cache_name: String,
    /// Serialized receiver descriptor.
    pub receiver: Bytes,
    /// The entries, as wire-ready `(key, value)` pairs.
    pub entries: Vec<(Bytes, Option<Bytes>)>,
    /// Always `true` for this engine: the client always wants an ack.
    pub need_ack: bool,
    /// Forwarded `skip_store` configuration flag.
    pub skip_store: bool,
    /// Forwarded `keep_binary` configuration flag.
    pub keep_binary: bool,
    /// Always `None` — see [`DeploymentInfo`].
    pub deployment: Option<DeploymentInfo>,
    /// Topology version the batch was composed against.
    pub topology_version: TopologyVersion,
    /// Stripe the server should dispatch this batch to, or
    /// [`STRIPE_DISABLED`].
    pub stripe_hint: i32,
}

impl LoadRequest {
    /// Builds a `LoadRequest` from a resolved batch of entries.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        request_id: u64,
        response_topic: Bytes,
        cache_name: String,
        receiver: Bytes,
        entries: &[Entry],
        skip_store: bool,
        keep_binary: bool,
        topology_version: TopologyVersion,
        stripe_hint: i32,
    ) -> Self {
        Self {
            request_id,
            response_topic,
            cache_name,
            receiver,
            entries: entries
                .iter()
                .map(|e| (e.key.clone(), e.value.clone()))
                .collect(),
            need_ack: true,
            skip_store,
            keep_binary,
            deployment: None,
            topology_version,
            stripe_hint,
        }
    }
}

/// The server's reply to a [`LoadRequest`].
#[derive(Clone, Debug)]
pub struct LoadResponse {
    /// Echoes the request id this responds to.
    pub request_id: u64,
    /// Serialized cause, absent on success.
    pub error: Option<Bytes>,
}

impl LoadResponse {
    /// Builds a success response.
    #[must_use]
    pub fn ok(request_id: u64) -> Self {
        Self {
            request_id,
            error: None,
        }
    }

    /// Builds a failure response carrying a serialized cause.
    #[must_use]
    pub fn failed(request_id: u64, cause: Bytes) -> Self {
        Self {
            request_id,
            error: Some(cause),
        }
    }
}
