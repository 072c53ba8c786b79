// Copyright Distributed Cache Project Authors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios exercising a [`streamer::Streamer`] against the
//! in-memory [`streamer::testkit`] doubles.

use bytes::Bytes;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use streamer::autoflush::AutoFlushScheduler;
use streamer::config::StreamerConfigBuilder;
use streamer::entry::Entry;
use streamer::error::StreamerError;
use streamer::receiver::{IndividualReceiver, InMemoryStore, IsolatedReceiver};
use streamer::streamer::{Streamer, StreamerDeps};
use streamer::testkit::{AllowAllSecurity, RecordingTransport, StubSerializer, TestCluster, TransportAction};
use streamer::topology::NodeId;

fn scheduler() -> Arc<AutoFlushScheduler> {
    Arc::new(AutoFlushScheduler::new())
}

#[tokio::test]
async fn single_node_single_key_put_is_applied_locally() {
    let cluster = TestCluster::new("n1");
    cluster.publish_assignment(vec![vec![NodeId::new("n1")]]);
    let store = Arc::new(InMemoryStore::new());
    let deps = StreamerDeps {
        affinity: Arc::clone(&cluster),
        discovery: Arc::clone(&cluster),
        transport: RecordingTransport::new(),
        receiver: Arc::new(IsolatedReceiver::new(store.clone())),
        serializer: Arc::new(StubSerializer),
        security: Some(Arc::new(AllowAllSecurity)),
        response_topic: Bytes::from_static(b"reply"),
    };
    let config = StreamerConfigBuilder::new().build().unwrap();
    let streamer = Streamer::new("cache-1", "my-cache", config, deps, scheduler());

    let fut = streamer
        .add(vec![Entry::new(Bytes::from_static(b"k"), Some(Bytes::from_static(b"v")))])
        .await
        .unwrap();
    streamer.flush().await.unwrap();
    fut.await.unwrap();

    assert_eq!(
        store.snapshot("my-cache").get(&Bytes::from_static(b"k")).unwrap(),
        &Bytes::from_static(b"v")
    );
}

#[tokio::test]
async fn batch_crossing_per_thread_threshold_dispatches_without_explicit_flush() {
    let cluster = TestCluster::new("n1");
    cluster.publish_assignment(vec![vec![NodeId::new("n1")]]);
    let store = Arc::new(InMemoryStore::new());
    let deps = StreamerDeps {
        affinity: Arc::clone(&cluster),
        discovery: Arc::clone(&cluster),
        transport: RecordingTransport::new(),
        receiver: Arc::new(IsolatedReceiver::new(store.clone())),
        serializer: Arc::new(StubSerializer),
        security: None,
        response_topic: Bytes::from_static(b"reply"),
    };
    let config = StreamerConfigBuilder::new()
        .per_thread_buffer_size(2)
        .per_node_buffer_size(2)
        .build()
        .unwrap();
    let streamer = Streamer::new("cache-2", "my-cache", config, deps, scheduler());

    let fut = streamer
        .add(vec![
            Entry::new(Bytes::from_static(b"a"), Some(Bytes::from_static(b"1"))),
            Entry::new(Bytes::from_static(b"b"), Some(Bytes::from_static(b"2"))),
        ])
        .await
        .unwrap();

    // No explicit flush: the second entry crosses per_thread_buffer_size
    // and per_node_buffer_size, so the batch is already in flight.
    fut.await.unwrap();

    assert_eq!(store.snapshot("my-cache").len(), 2);
}

#[tokio::test]
async fn overwrite_false_fans_batch_out_to_primary_and_backup() {
    let cluster = TestCluster::new("n1");
    cluster.add_node("n2", 1);
    cluster.publish_assignment(vec![vec![NodeId::new("n1"), NodeId::new("n2")]]);
    let store = Arc::new(InMemoryStore::new());
    let transport = RecordingTransport::new();
    let deps = StreamerDeps {
        affinity: Arc::clone(&cluster),
        discovery: Arc::clone(&cluster),
        transport: Arc::clone(&transport),
        receiver: Arc::new(IsolatedReceiver::new(store.clone())),
        serializer: Arc::new(StubSerializer),
        security: None,
        response_topic: Bytes::from_static(b"reply"),
    };
    let config = StreamerConfigBuilder::new().allow_overwrite(false).build().unwrap();
    let streamer = Streamer::new("cache-3", "my-cache", config, deps, scheduler());
    transport.bind(&streamer);

    let fut = streamer
        .add(vec![Entry::new(Bytes::from_static(b"k"), Some(Bytes::from_static(b"v")))])
        .await
        .unwrap();
    streamer.flush().await.unwrap();
    fut.await.unwrap();

    // Primary (n1, local) applied directly; backup (n2, remote) received
    // exactly one wire request.
    assert_eq!(store.snapshot("my-cache").get(&Bytes::from_static(b"k")).unwrap(), &Bytes::from_static(b"v"));
    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].entries.len(), 1);
}

#[tokio::test]
async fn topology_change_triggers_remap_and_final_future_resolves_success() {
    let cluster = TestCluster::new("n1");
    cluster.add_node("n2", 1);
    cluster.publish_assignment(vec![vec![NodeId::new("n2")]]);
    let store = Arc::new(InMemoryStore::new());
    let transport = RecordingTransport::new();
    transport.queue_action(
        NodeId::new("n2"),
        TransportAction::AckFailure(StreamerError::TopologyChanged {
            node: NodeId::new("n2"),
            at_submit: cluster.version(),
            current: cluster.version(),
        }),
    );
    let deps = StreamerDeps {
        affinity: Arc::clone(&cluster),
        discovery: Arc::clone(&cluster),
        transport: Arc::clone(&transport),
        receiver: Arc::new(IndividualReceiver::new(store.clone())),
        serializer: Arc::new(StubSerializer),
        security: None,
        response_topic: Bytes::from_static(b"reply"),
    };
    let config = StreamerConfigBuilder::new().allow_overwrite(true).build().unwrap();
    let streamer = Streamer::new("cache-4", "my-cache", config, deps, scheduler());
    transport.bind(&streamer);

    let fut = streamer
        .add(vec![Entry::new(Bytes::from_static(b"k"), Some(Bytes::from_static(b"v")))])
        .await
        .unwrap();
    streamer.flush().await.unwrap();

    // First attempt fails remappably; the controller re-routes it and the
    // second attempt (default action: ack success) resolves the original
    // caller's future without it ever observing the intermediate failure.
    fut.await.unwrap();
    assert_eq!(transport.sent().len(), 2);
    let metrics = streamer.metrics();
    assert_eq!(metrics.remaps_performed, 1);
}

#[tokio::test]
async fn remap_exhaustion_fails_the_submission() {
    let cluster = TestCluster::new("n1");
    cluster.add_node("n2", 1);
    cluster.publish_assignment(vec![vec![NodeId::new("n2")]]);
    let store = Arc::new(InMemoryStore::new());
    let transport = RecordingTransport::new();
    transport.set_default_action(TransportAction::AckFailure(StreamerError::TopologyChanged {
        node: NodeId::new("n2"),
        at_submit: cluster.version(),
        current: cluster.version(),
    }));
    let deps = StreamerDeps {
        affinity: Arc::clone(&cluster),
        discovery: Arc::clone(&cluster),
        transport: Arc::clone(&transport),
        receiver: Arc::new(IndividualReceiver::new(store.clone())),
        serializer: Arc::new(StubSerializer),
        security: None,
        response_topic: Bytes::from_static(b"reply"),
    };
    let config = StreamerConfigBuilder::new()
        .allow_overwrite(true)
        .max_remap_count(2)
        .build()
        .unwrap();
    let streamer = Streamer::new("cache-5", "my-cache", config, deps, scheduler());
    transport.bind(&streamer);

    let fut = streamer
        .add(vec![Entry::new(Bytes::from_static(b"k"), Some(Bytes::from_static(b"v")))])
        .await
        .unwrap();
    streamer.flush().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), fut).await.expect("resolves");
    assert!(matches!(result, Err(StreamerError::RemapExhausted { max_remap_count: 2, .. })));
}

struct HangingReceiver;

#[async_trait::async_trait]
impl streamer::collaborators::Receiver for HangingReceiver {
    async fn receive(&self, _cache: &str, _entries: &[Entry]) -> Result<(), StreamerError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "hanging"
    }
}

#[tokio::test]
async fn submission_times_out_waiting_for_a_permit_held_by_a_hanging_receive() {
    let cluster = TestCluster::new("n1");
    cluster.publish_assignment(vec![vec![NodeId::new("n1")]]);
    let deps = StreamerDeps {
        affinity: Arc::clone(&cluster),
        discovery: Arc::clone(&cluster),
        transport: RecordingTransport::new(),
        receiver: Arc::new(HangingReceiver),
        serializer: Arc::new(StubSerializer),
        security: None,
        response_topic: Bytes::from_static(b"reply"),
    };
    let config = StreamerConfigBuilder::new()
        .per_thread_buffer_size(1)
        .per_node_buffer_size(1)
        .per_node_parallel_ops(1)
        .timeout(Some(Duration::from_millis(50)))
        .build()
        .unwrap();
    let streamer = Streamer::new("cache-6", "my-cache", config, deps, scheduler());

    // First entry's dispatch is spawned immediately (threshold of 1) and
    // takes the node buffer's sole parallelism permit, hanging in
    // `receive` forever. This future is intentionally never awaited.
    let _hung = streamer
        .add(vec![Entry::new(Bytes::from_static(b"k1"), Some(Bytes::from_static(b"v")))])
        .await
        .unwrap();
    // Give the first dispatch's background task real wall-clock time to
    // actually acquire the permit before the second one is submitted.
    tokio::time::sleep(Duration::from_millis(10)).await;

    let second = streamer
        .add(vec![Entry::new(Bytes::from_static(b"k2"), Some(Bytes::from_static(b"v")))])
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), second)
        .await
        .expect("second submission's future resolves");
    assert!(matches!(result, Err(StreamerError::Timeout(_))));
}

/// A [`streamer::collaborators::Transport`] double that accepts every send
/// (recording nothing) and never loops a response back — modeling a remote
/// peer that has gone silent rather than one that actively rejects.
struct BlackHoleTransport;

#[async_trait::async_trait]
impl streamer::collaborators::Transport for BlackHoleTransport {
    async fn send(
        &self,
        _node: &NodeId,
        _request: streamer::wire::LoadRequest,
    ) -> Result<(), StreamerError> {
        Ok(())
    }
}

#[tokio::test]
async fn flush_times_out_on_a_hanging_entry_then_close_cancel_completes_it() {
    let cluster = TestCluster::new("n1");
    cluster.add_node("n2", 1);
    cluster.publish_assignment(vec![vec![NodeId::new("n2")]]);
    let store = Arc::new(InMemoryStore::new());
    let deps = StreamerDeps {
        affinity: Arc::clone(&cluster),
        discovery: Arc::clone(&cluster),
        transport: Arc::new(BlackHoleTransport),
        receiver: Arc::new(IndividualReceiver::new(store)),
        serializer: Arc::new(StubSerializer),
        security: None,
        response_topic: Bytes::from_static(b"reply"),
    };
    let config = StreamerConfigBuilder::new()
        .per_thread_buffer_size(1)
        .timeout(Some(Duration::from_millis(100)))
        .build()
        .unwrap();
    let streamer = Streamer::new("cache-7", "my-cache", config, deps, scheduler());

    // per_node_buffer_size stays at its default (512), so this single entry
    // sits buffered in its stripe rather than being submitted immediately;
    // flush() is what forces the hand-off and then waits on it, never
    // getting a response back from the black-hole transport.
    let fut = streamer
        .add(vec![Entry::new(Bytes::from_static(b"k"), Some(Bytes::from_static(b"v")))])
        .await
        .unwrap();

    let flush_result = tokio::time::timeout(Duration::from_secs(2), streamer.flush())
        .await
        .expect("flush itself returns within the test's own timeout");
    assert!(matches!(flush_result, Err(StreamerError::Timeout(_))));
    assert!(fut.clone().now_or_never().is_none(), "entry future still pending after flush times out");

    let lifetime = streamer.close(true, Some("shedding hung work".to_string())).await;
    lifetime.await.expect_err("non-zero fail count makes close's lifetime future fail");
    let result = fut.await;
    assert!(matches!(result, Err(StreamerError::Cancelled { .. })));
}
