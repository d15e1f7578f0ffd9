//! Pipeline backpressure and accounting
//!
//! Run with: cargo test --test integration_pipeline

use async_trait::async_trait;
use betanet_core::mixnode::{Delivery, DeliveryRegistry, Mixnode, MixnodeSettings};
use betanet_core::packet::{encode_with, Circuit, HopDescriptor, NextHop, Packet, Role};
use betanet_core::pipeline::{BufferPool, Pipeline, PipelineConfig};
use betanet_core::{DropReason, NodeKeys, NodeMetrics, PacketSink, TransportError, PACKET_SIZE};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct SlowSink {
    forwarded: AtomicU64,
}

#[async_trait]
impl PacketSink for SlowSink {
    async fn forward(&self, _next_hop: &NextHop, _packet: Packet) -> Result<(), TransportError> {
        tokio::time::sleep(Duration::from_millis(1)).await;
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Refuses every packet, like a next hop that stays down.
struct FailingSink;

#[async_trait]
impl PacketSink for FailingSink {
    async fn forward(&self, _next_hop: &NextHop, _packet: Packet) -> Result<(), TransportError> {
        Err(TransportError::Closed)
    }
}

struct Setup<S> {
    pipeline: Pipeline,
    sink: Arc<S>,
    circuit: Circuit,
    metrics: Arc<NodeMetrics>,
}

fn setup(config: PipelineConfig) -> Setup<SlowSink> {
    setup_with(config, Arc::new(SlowSink::default()))
}

fn setup_with<S: PacketSink + 'static>(config: PipelineConfig, sink: Arc<S>) -> Setup<S> {
    let keys: Vec<_> = (0..3).map(|_| NodeKeys::generate()).collect();
    let hops = keys
        .iter()
        .enumerate()
        .map(|(i, k)| HopDescriptor::from_keys(k, Role::for_position(i, 3), format!("127.0.0.1:{}", 9001 + i).parse().unwrap()))
        .collect();
    let metrics = Arc::new(NodeMetrics::new());
    let node = Mixnode::new(
        &keys[0],
        MixnodeSettings::for_role(Role::Entry),
        Arc::clone(&metrics),
        DeliveryRegistry::new(),
    )
    .unwrap();
    let pipeline = Pipeline::new(config, Arc::new(node), BufferPool::new(128, PACKET_SIZE), sink.clone());
    Setup {
        pipeline,
        sink,
        circuit: Circuit::new(hops).unwrap(),
        metrics,
    }
}

fn packets(circuit: &Circuit, n: usize) -> Vec<Packet> {
    let body = Delivery {
        destination: "sink".into(),
        data: vec![0xAB; 64],
    }
    .encode()
    .unwrap();
    (0..n).map(|_| encode_with(circuit, &body, false).unwrap()).collect()
}

async fn settle(pipeline: &Pipeline) {
    for _ in 0..500 {
        if pipeline.stats().queued == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("pipeline never drained: {:?}", pipeline.stats());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_conservation_under_overload() {
    let s = setup(PipelineConfig {
        workers: 2,
        batch_size: 16,
        max_queue_depth: 32,
        ..Default::default()
    });
    s.pipeline.start();

    let burst = packets(&s.circuit, 2_000);
    let mut accepted = 0u64;
    for packet in burst {
        if s.pipeline.submit(packet).is_ok() {
            accepted += 1;
        }
        // Snapshot stays balanced mid-flight as well
        let stats = s.pipeline.stats();
        assert_eq!(stats.submitted, stats.rejected + stats.processed + stats.queued);
    }
    settle(&s.pipeline).await;

    let stats = s.pipeline.stats();
    assert_eq!(stats.submitted, 2_000);
    assert_eq!(stats.processed, accepted);
    assert_eq!(stats.processed + stats.rejected, stats.submitted);
    assert!(stats.rejected > 0, "queue of 32 should overflow on a 2000 packet burst");
    assert_eq!(s.metrics.dropped_for(DropReason::QueueFull), stats.rejected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_everything_accepted_is_forwarded() {
    let s = setup(PipelineConfig {
        max_queue_depth: 1024,
        ..Default::default()
    });
    s.pipeline.start();

    for packet in packets(&s.circuit, 500) {
        s.pipeline.submit(packet).unwrap();
    }
    settle(&s.pipeline).await;

    for _ in 0..500 {
        if s.metrics.forwarded() == 500 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(s.metrics.forwarded(), 500);
    assert_eq!(s.sink.forwarded.load(Ordering::Relaxed), 500);
    assert_eq!(s.metrics.dropped(), 0);
}

#[tokio::test]
async fn test_replayed_packets_counted_once() {
    let s = setup(PipelineConfig::default());
    s.pipeline.start();

    let packet = packets(&s.circuit, 1).remove(0);
    for _ in 0..5 {
        s.pipeline.submit(packet.clone()).unwrap();
    }
    settle(&s.pipeline).await;

    for _ in 0..200 {
        if s.metrics.forwarded() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(s.metrics.forwarded(), 1);
    assert_eq!(s.metrics.dropped_for(DropReason::Replay), 4);
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_latency_budget_expires_backlog() {
    let s = setup(PipelineConfig {
        workers: 1,
        batch_size: 8,
        max_queue_depth: 1024,
        max_processing_latency: Duration::from_millis(1),
        ..Default::default()
    });
    s.pipeline.start();

    for packet in packets(&s.circuit, 500) {
        s.pipeline.submit(packet).unwrap();
    }
    settle(&s.pipeline).await;

    let stats = s.pipeline.stats();
    assert_eq!(stats.submitted, 500);
    assert_eq!(stats.processed + stats.rejected, stats.submitted);
    assert!(s.metrics.dropped_for(DropReason::Expired) > 0, "one worker cannot peel 500 packets in 1ms");

    // Every processed packet ends up either forwarded or expired
    eventually(|| s.metrics.forwarded() + s.metrics.dropped_for(DropReason::Expired) == stats.processed).await;
    assert_eq!(s.sink.forwarded.load(Ordering::Relaxed), s.metrics.forwarded());
    assert_eq!(s.metrics.dropped(), s.metrics.dropped_for(DropReason::Expired));
}

#[tokio::test]
async fn test_failed_forwards_counted_unreachable() {
    let s = setup_with(PipelineConfig::default(), Arc::new(FailingSink));
    s.pipeline.start();

    for packet in packets(&s.circuit, 50) {
        s.pipeline.submit(packet).unwrap();
    }
    settle(&s.pipeline).await;

    eventually(|| s.metrics.dropped_for(DropReason::Unreachable) == 50).await;
    eventually(|| s.pipeline.stats().forwarding == 0).await;
    assert_eq!(s.metrics.forwarded(), 0);
    let stats = s.pipeline.stats();
    assert_eq!(stats.submitted, stats.rejected + stats.processed);
    assert_eq!(stats.processed, 50);
}
