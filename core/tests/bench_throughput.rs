//! Entry-node throughput benchmark
//!
//! Pushes pre-built packets through one pipeline at the target rate and
//! checks throughput, average processing latency, drop rate and buffer
//! reuse. Timing-sensitive, so ignored by default.
//!
//! Run with: cargo test --release --test bench_throughput -- --ignored --nocapture

use async_trait::async_trait;
use betanet_core::mixnode::{Delivery, DeliveryRegistry, Mixnode, MixnodeSettings};
use betanet_core::packet::{encode_with, Circuit, HopDescriptor, NextHop, Packet, Role};
use betanet_core::pipeline::{BufferPool, Pipeline, PipelineConfig};
use betanet_core::{NodeKeys, NodeMetrics, PacketSink, TransportError, PACKET_SIZE};
use std::sync::Arc;
use std::time::{Duration, Instant};

const TARGET_PPS: u64 = 25_000;
const PACKETS: usize = 100_000;

struct NullSink;

#[async_trait]
impl PacketSink for NullSink {
    async fn forward(&self, _next_hop: &NextHop, _packet: Packet) -> Result<(), TransportError> {
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
#[ignore]
async fn bench_entry_pipeline_throughput() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();

    let keys: Vec<_> = (0..3).map(|_| NodeKeys::generate()).collect();
    let hops = keys
        .iter()
        .enumerate()
        .map(|(i, k)| HopDescriptor::from_keys(k, Role::for_position(i, 3), format!("127.0.0.1:{}", 9001 + i).parse().unwrap()))
        .collect();
    let circuit = Arc::new(Circuit::new(hops).unwrap());

    // Building packets costs as much as peeling them, so do it up front
    let body = Delivery {
        destination: "bench".into(),
        data: vec![0x5A; 512],
    }
    .encode()
    .unwrap();
    let chunks = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
    let mut handles = Vec::new();
    for _ in 0..chunks {
        let circuit = Arc::clone(&circuit);
        let body = body.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            (0..PACKETS / chunks)
                .map(|_| encode_with(&circuit, &body, false).unwrap())
                .collect::<Vec<_>>()
        }));
    }
    let mut packets = Vec::with_capacity(PACKETS);
    for handle in handles {
        packets.extend(handle.await.unwrap());
    }
    let total = packets.len() as u64;

    let metrics = Arc::new(NodeMetrics::new());
    let node = Mixnode::new(
        &keys[0],
        MixnodeSettings::for_role(Role::Entry),
        Arc::clone(&metrics),
        DeliveryRegistry::new(),
    )
    .unwrap();
    let pool = BufferPool::new(1024, PACKET_SIZE);
    let pipeline = Pipeline::new(PipelineConfig::default(), Arc::new(node), pool.clone(), Arc::new(NullSink));
    pipeline.start();

    // Pace submissions in 1ms ticks
    let per_tick = (TARGET_PPS / 1000).max(1) as usize;
    let started = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_millis(1));
    let mut iter = packets.into_iter();
    'outer: loop {
        ticker.tick().await;
        for _ in 0..per_tick {
            match iter.next() {
                Some(packet) => {
                    let _ = pipeline.submit(packet);
                }
                None => break 'outer,
            }
        }
    }
    while pipeline.stats().queued > 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let elapsed = started.elapsed();

    let stats = pipeline.stats();
    let pps = stats.processed as f64 / elapsed.as_secs_f64();
    let drop_rate = metrics.dropped() as f64 / total as f64;
    let reuse = pool.stats().reuse_rate;
    println!(
        "processed {} in {:.2?}: {:.0} pps, avg latency {:.3} ms, drop rate {:.4}%, buffer reuse {:.1}%",
        stats.processed,
        elapsed,
        pps,
        metrics.avg_latency_ms(),
        drop_rate * 100.0,
        reuse * 100.0
    );

    assert!(pps >= TARGET_PPS as f64 * 0.95, "throughput {:.0} pps below target", pps);
    assert!(metrics.avg_latency_ms() <= 1.0, "average latency above 1 ms");
    assert!(drop_rate <= 0.001, "drop rate above 0.1%");
    assert!(reuse >= 0.85, "buffer reuse below 85%");
}
