// Copyright Distributed Cache Project Authors
// SPDX-License-Identifier: Apache-2.0

//! Property-style tests for the streamer's two core concurrency
//! invariants: bounded per-node parallelism, and intra-partition
//! ordering.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use streamer::autoflush::AutoFlushScheduler;
use streamer::collaborators::Receiver;
use streamer::config::StreamerConfigBuilder;
use streamer::entry::Entry;
use streamer::error::StreamerError;
use streamer::streamer::{Streamer, StreamerDeps};
use streamer::testkit::{RecordingTransport, StubSerializer, TestCluster};
use streamer::topology::NodeId;

fn scheduler() -> Arc<AutoFlushScheduler> {
    Arc::new(AutoFlushScheduler::new())
}

/// Records the high-water mark of concurrently-executing `receive` calls,
/// holding each one open for a short sleep to widen the overlap window.
struct ConcurrencyTrackingReceiver {
    current: AtomicUsize,
    peak: AtomicUsize,
    hold: Duration,
}

impl ConcurrencyTrackingReceiver {
    fn new(hold: Duration) -> Self {
        Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            hold,
        }
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Receiver for ConcurrencyTrackingReceiver {
    async fn receive(&self, _cache: &str, _entries: &[Entry]) -> Result<(), StreamerError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "concurrency-tracking"
    }
}

#[tokio::test]
async fn per_node_parallelism_never_exceeds_configured_width() {
    let cluster = TestCluster::new("n1");
    // Eight stripes so eight independent batches can be in flight at once;
    // the semaphore, not the stripe count, must be the limiting factor.
    cluster.publish_assignment(vec![
        vec![NodeId::new("n1")],
        vec![NodeId::new("n1")],
        vec![NodeId::new("n1")],
        vec![NodeId::new("n1")],
        vec![NodeId::new("n1")],
        vec![NodeId::new("n1")],
        vec![NodeId::new("n1")],
        vec![NodeId::new("n1")],
    ]);
    let receiver = Arc::new(ConcurrencyTrackingReceiver::new(Duration::from_millis(30)));
    let deps = StreamerDeps {
        affinity: Arc::clone(&cluster),
        discovery: Arc::clone(&cluster),
        transport: RecordingTransport::new(),
        receiver: Arc::clone(&receiver),
        serializer: Arc::new(StubSerializer),
        security: None,
        response_topic: Bytes::from_static(b"reply"),
    };
    let config = StreamerConfigBuilder::new()
        .per_thread_buffer_size(1)
        .per_node_buffer_size(1)
        .per_node_parallel_ops(2)
        .stripe_count(8)
        .build()
        .unwrap();
    let streamer = Streamer::new("cache-p2", "my-cache", config, deps, scheduler());

    let mut futures = Vec::new();
    for partition in 0..8i32 {
        let mut entry = Entry::new(Bytes::copy_from_slice(&partition.to_be_bytes()), Some(Bytes::from_static(b"v")));
        entry.partition = partition;
        futures.push(streamer.add(vec![entry]).await.unwrap());
    }
    for fut in futures {
        fut.await.unwrap();
    }

    assert!(receiver.peak() <= 2, "observed peak concurrency {} exceeds configured width 2", receiver.peak());
}

/// [`Receiver`] double recording every batch it is handed, in the order
/// `receive` is called, so order-preservation can be asserted precisely.
struct OrderRecordingReceiver {
    seen: parking_lot::Mutex<Vec<Bytes>>,
}

impl OrderRecordingReceiver {
    fn new() -> Self {
        Self { seen: parking_lot::Mutex::new(Vec::new()) }
    }

    fn seen(&self) -> Vec<Bytes> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Receiver for OrderRecordingReceiver {
    async fn receive(&self, _cache: &str, entries: &[Entry]) -> Result<(), StreamerError> {
        let mut seen = self.seen.lock();
        for entry in entries {
            seen.push(entry.key.clone());
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "order-recording"
    }
}

#[tokio::test]
async fn entries_to_the_same_partition_are_applied_in_submission_order_within_a_batch() {
    let cluster = TestCluster::new("n1");
    cluster.publish_assignment(vec![vec![NodeId::new("n1")]]);
    let receiver = Arc::new(OrderRecordingReceiver::new());
    let deps = StreamerDeps {
        affinity: Arc::clone(&cluster),
        discovery: Arc::clone(&cluster),
        transport: RecordingTransport::new(),
        receiver: Arc::clone(&receiver),
        serializer: Arc::new(StubSerializer),
        security: None,
        response_topic: Bytes::from_static(b"reply"),
    };
    let config = StreamerConfigBuilder::new().build().unwrap();
    let streamer = Streamer::new("cache-p3a", "my-cache", config, deps, scheduler());

    let keys: Vec<Bytes> = (0u8..20).map(|i| Bytes::copy_from_slice(&[i])).collect();
    let entries = keys
        .iter()
        .map(|k| {
            let mut e = Entry::new(k.clone(), Some(Bytes::from_static(b"v")));
            e.partition = 0;
            e
        })
        .collect();

    let fut = streamer.add(entries).await.unwrap();
    streamer.flush().await.unwrap();
    fut.await.unwrap();

    assert_eq!(receiver.seen(), keys);
}

#[tokio::test]
async fn entries_to_the_same_partition_stay_ordered_across_sequential_flushes() {
    let cluster = TestCluster::new("n1");
    cluster.publish_assignment(vec![vec![NodeId::new("n1")]]);
    let receiver = Arc::new(OrderRecordingReceiver::new());
    let deps = StreamerDeps {
        affinity: Arc::clone(&cluster),
        discovery: Arc::clone(&cluster),
        transport: RecordingTransport::new(),
        receiver: Arc::clone(&receiver),
        serializer: Arc::new(StubSerializer),
        security: None,
        response_topic: Bytes::from_static(b"reply"),
    };
    let config = StreamerConfigBuilder::new().build().unwrap();
    let streamer = Streamer::new("cache-p3b", "my-cache", config, deps, scheduler());

    let mut expected = Vec::new();
    for batch in 0u8..5 {
        let mut entry = Entry::new(Bytes::copy_from_slice(&[batch]), Some(Bytes::from_static(b"v")));
        entry.partition = 0;
        expected.push(entry.key.clone());
        let fut = streamer.add(vec![entry]).await.unwrap();
        streamer.flush().await.unwrap();
        fut.await.unwrap();
    }

    assert_eq!(receiver.seen(), expected);
}
