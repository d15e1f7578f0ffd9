// Packet pipeline — bounded queue, batching workers, delayed forwarding
//
// Inbound packets go onto one bounded queue. A full queue rejects the
// packet on the spot. A fixed set of workers takes turns pulling batches
// (up to `batch_size`, or whatever arrived within `batch_window`), peels
// them on the blocking pool, then schedules each forward as its own task
// that sleeps for the VRF delay before writing to the sink. Anything older
// than `max_processing_latency` when dequeued, whose delay would push it
// past that bound, or that is still waiting once the delay is over, is
// dropped.
//
// Each packet carries its ProcessingState from Receiving to Idle; an
// illegal transition drops the packet.

pub mod pool;

pub use pool::{BufferPool, PoolStats, PooledBuffer};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::metrics::DropReason;
use crate::mixnode::{Decision, InvalidTransition, Mixnode, ProcessingState, StateEvent};
use crate::packet::Packet;
use crate::transport::PacketSink;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Inbound queue full (max depth {max_queue_depth})")]
pub struct CapacityError {
    pub max_queue_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub workers: usize,
    pub batch_size: usize,
    pub batch_window: Duration,
    pub max_queue_depth: usize,
    pub max_processing_latency: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            batch_size: 256,
            batch_window: Duration::from_millis(2),
            max_queue_depth: 4096,
            max_processing_latency: Duration::from_secs(1),
        }
    }
}

/// Counters satisfying `submitted == rejected + processed + queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub submitted: u64,
    pub rejected: u64,
    pub processed: u64,
    /// Accepted but not yet decided (queued or in a batch being peeled)
    pub queued: u64,
    /// Packets sitting in the channel right now
    pub queue_depth: usize,
    /// Packets in the Forwarding state: waiting out their delay or being written
    pub forwarding: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    processed: AtomicU64,
    forwarding: AtomicU64,
}

struct Inbound {
    packet: Packet,
    received_at: Instant,
    state: ProcessingState,
}

pub struct Pipeline {
    config: PipelineConfig,
    node: Arc<Mixnode>,
    pool: BufferPool,
    sink: Arc<dyn PacketSink>,
    tx: mpsc::Sender<Inbound>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Inbound>>>,
    counters: Arc<Counters>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// Build the queue. No packet is processed until [`Pipeline::start`].
    pub fn new(config: PipelineConfig, node: Arc<Mixnode>, pool: BufferPool, sink: Arc<dyn PacketSink>) -> Self {
        let (tx, rx) = mpsc::channel(config.max_queue_depth.max(1));
        Self {
            config,
            node,
            pool,
            sink,
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            counters: Arc::new(Counters::default()),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn node(&self) -> &Arc<Mixnode> {
        &self.node
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Enqueue without waiting. A full queue drops the packet.
    pub fn submit(&self, packet: Packet) -> Result<(), CapacityError> {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        // The frame has been read; Idle -> Receiving
        let inbound = Inbound {
            packet,
            received_at: Instant::now(),
            state: ProcessingState::Receiving,
        };
        match self.tx.try_send(inbound) {
            Ok(()) => Ok(()),
            Err(_) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                self.node.metrics().record_drop(DropReason::QueueFull);
                trace!("Queue full, dropping packet");
                Err(CapacityError {
                    max_queue_depth: self.config.max_queue_depth,
                })
            }
        }
    }

    pub fn stats(&self) -> PipelineStats {
        let submitted = self.counters.submitted.load(Ordering::Relaxed);
        let rejected = self.counters.rejected.load(Ordering::Relaxed);
        let processed = self.counters.processed.load(Ordering::Relaxed);
        PipelineStats {
            submitted,
            rejected,
            processed,
            queued: submitted.saturating_sub(rejected + processed),
            queue_depth: self.tx.max_capacity() - self.tx.capacity(),
            forwarding: self.counters.forwarding.load(Ordering::Relaxed),
        }
    }

    /// Spawn the worker pool. Calling twice is a no-op.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        for id in 0..self.config.workers.max(1) {
            let worker = Worker {
                id,
                config: self.config.clone(),
                node: Arc::clone(&self.node),
                pool: self.pool.clone(),
                sink: Arc::clone(&self.sink),
                rx: Arc::clone(&self.rx),
                counters: Arc::clone(&self.counters),
            };
            workers.push(tokio::spawn(worker.run()));
        }
        info!(
            "Pipeline started: {} workers, batch {}, queue {}",
            workers.len(),
            self.config.batch_size,
            self.config.max_queue_depth
        );
    }

    /// Stop the workers. Queued packets are left where they are.
    pub fn shutdown(&self) {
        for handle in self.workers.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    id: usize,
    config: PipelineConfig,
    node: Arc<Mixnode>,
    pool: BufferPool,
    sink: Arc<dyn PacketSink>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Inbound>>>,
    counters: Arc<Counters>,
}

impl Worker {
    async fn run(self) {
        loop {
            let batch = {
                let mut rx = self.rx.lock().await;
                next_batch(&mut rx, self.config.batch_size.max(1), self.config.batch_window).await
            };
            let Some(batch) = batch else {
                debug!("Worker {} exiting, queue closed", self.id);
                return;
            };
            trace!("Worker {} took a batch of {}", self.id, batch.len());

            let node = Arc::clone(&self.node);
            let pool = self.pool.clone();
            let counters = Arc::clone(&self.counters);
            let max_latency = self.config.max_processing_latency;
            let decided = tokio::task::spawn_blocking(move || process_batch(&node, &pool, &counters, batch, max_latency)).await;

            match decided {
                Ok(decisions) => {
                    for (decision, state, received_at) in decisions {
                        self.dispatch(decision, state, received_at);
                    }
                }
                Err(err) => warn!("Worker {} batch task failed: {}", self.id, err),
            }
        }
    }

    fn dispatch(&self, decision: Decision, state: ProcessingState, received_at: Instant) {
        let Decision::Forward {
            next_hop,
            packet,
            delay,
        } = decision
        else {
            complete(state);
            return;
        };

        let metrics = Arc::clone(self.node.metrics());
        let max_latency = self.config.max_processing_latency;
        let budget = max_latency.saturating_sub(received_at.elapsed());
        if delay > budget {
            trace!("Delay {:?} exceeds remaining budget {:?}, dropping", delay, budget);
            metrics.record_drop(DropReason::Expired);
            fail(state);
            return;
        }

        let sink = Arc::clone(&self.sink);
        let counters = Arc::clone(&self.counters);
        counters.forwarding.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if received_at.elapsed() > max_latency {
                trace!("Budget spent during delay, dropping");
                metrics.record_drop(DropReason::Expired);
                fail(state);
            } else {
                match sink.forward(&next_hop, packet).await {
                    Ok(()) => {
                        metrics.record_forwarded();
                        complete(state);
                    }
                    Err(err) => {
                        debug!("Forward to {} failed: {}", next_hop.address, err);
                        metrics.record_drop(DropReason::Unreachable);
                        fail(state);
                    }
                }
            }
            counters.forwarding.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

/// Finish a packet: whatever state it ended in goes back to Idle.
fn complete(state: ProcessingState) {
    match state.on(StateEvent::Completed) {
        Ok(_) => trace!("Packet finished as {:?}", state),
        Err(err) => warn!("{}", err),
    }
}

fn fail(state: ProcessingState) {
    match state.on(StateEvent::Failed) {
        Ok(dropped) => complete(dropped),
        Err(err) => warn!("{}", err),
    }
}

async fn next_batch(rx: &mut mpsc::Receiver<Inbound>, max: usize, window: Duration) -> Option<Vec<Inbound>> {
    let first = rx.recv().await?;
    let mut batch = Vec::with_capacity(max.min(1024));
    batch.push(first);

    while batch.len() < max {
        match rx.try_recv() {
            Ok(item) => batch.push(item),
            Err(_) => break,
        }
    }
    if batch.len() < max && !window.is_zero() {
        let deadline = tokio::time::Instant::now() + window;
        while batch.len() < max {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(item)) => batch.push(item),
                Ok(None) | Err(_) => break,
            }
        }
    }
    Some(batch)
}

fn process_batch(
    node: &Mixnode,
    pool: &BufferPool,
    counters: &Counters,
    batch: Vec<Inbound>,
    max_latency: Duration,
) -> Vec<(Decision, ProcessingState, Instant)> {
    batch
        .into_iter()
        .map(|inbound| {
            let (decision, state) = match decide(node, pool, &inbound, max_latency) {
                Ok(decided) => decided,
                Err(err) => {
                    warn!("{}", err);
                    node.metrics().record_drop(DropReason::Format);
                    (Decision::Dropped(DropReason::Format), ProcessingState::Dropped)
                }
            };
            node.metrics().record_processed(inbound.received_at.elapsed());
            counters.processed.fetch_add(1, Ordering::Relaxed);
            (decision, state, inbound.received_at)
        })
        .collect()
}

/// Walk one packet from Receiving through Decrypting to its outcome.
fn decide(
    node: &Mixnode,
    pool: &BufferPool,
    inbound: &Inbound,
    max_latency: Duration,
) -> Result<(Decision, ProcessingState), InvalidTransition> {
    if inbound.received_at.elapsed() > max_latency {
        node.metrics().record_drop(DropReason::Expired);
        let state = inbound.state.on(StateEvent::Failed)?;
        return Ok((Decision::Dropped(DropReason::Expired), state));
    }
    let decrypting = inbound.state.on(StateEvent::Dequeued)?;
    let decision = node.process(&inbound.packet, pool.acquire());
    let state = decrypting.on(decision.event())?;
    Ok((decision, state))
}
