// Running mixnode — listener, pipeline and outbound links wired together

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::api::MixnetClient;
use super::links::PeerLinks;
use super::server::{serve, ShutdownSignal};
use super::TransportError;
use crate::config::NodeConfig;
use crate::crypto::{NodeId, NodeKeys};
use crate::metrics::{HealthReport, MetricsSnapshot, NodeMetrics, ThroughputMonitor, ThroughputReport};
use crate::mixnode::{DeliveryHandler, DeliveryRegistry, Mixnode};
use crate::packet::{Circuit, HopDescriptor, Role, PACKET_SIZE};
use crate::pipeline::{BufferPool, Pipeline, PipelineStats, PoolStats};
use crate::MixnetError;

/// How often processed throughput is compared against the target.
const THROUGHPUT_WINDOW: Duration = Duration::from_secs(10);

/// Everything `GET /metrics` reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub role: Role,
    pub listen: SocketAddr,
    pub health: HealthReport,
    pub metrics: MetricsSnapshot,
    pub pipeline: PipelineStats,
    pub pool: PoolStats,
    pub throughput: ThroughputReport,
}

pub struct MixnetNode {
    descriptor: HopDescriptor,
    pipeline: Arc<Pipeline>,
    links: Arc<PeerLinks>,
    registry: DeliveryRegistry,
    metrics: Arc<NodeMetrics>,
    throughput: Arc<ThroughputMonitor>,
    shutdown: ShutdownSignal,
    server: Mutex<Option<JoinHandle<Result<(), TransportError>>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl MixnetNode {
    /// Validate `config`, bind the listener and start the workers.
    pub async fn start(keys: &NodeKeys, config: NodeConfig) -> Result<Self, MixnetError> {
        config.validate()?;

        let listener = TcpListener::bind(config.listen_addr())
            .await
            .map_err(TransportError::from)?;
        let local_addr = listener.local_addr().map_err(TransportError::from)?;

        let metrics = Arc::new(NodeMetrics::new());
        let registry = DeliveryRegistry::new();
        let mixnode = Mixnode::new(keys, config.mixnode_settings(), Arc::clone(&metrics), registry.clone())
            .map_err(|e| crate::config::ConfigError::Validation(e.to_string()))?;
        let links = Arc::new(PeerLinks::new(config.link_config(), Arc::clone(&metrics), registry.clone()));
        let pipeline = Arc::new(Pipeline::new(
            config.pipeline_config(),
            Arc::new(mixnode),
            BufferPool::new(config.pool_size, PACKET_SIZE),
            links.clone(),
        ));
        pipeline.start();

        let throughput = Arc::new(ThroughputMonitor::new(config.target_throughput));
        let monitor = tokio::spawn(watch_throughput(Arc::clone(&pipeline), Arc::clone(&throughput)));

        let shutdown = ShutdownSignal::new();
        let server = tokio::spawn(serve(listener, Arc::clone(&pipeline), shutdown.clone()));

        let descriptor = HopDescriptor::from_keys(keys, config.role, local_addr);
        info!(
            "{} node {} up on {} (hop {})",
            config.role,
            descriptor.node_id,
            local_addr,
            config.hop_index
        );

        Ok(Self {
            descriptor,
            pipeline,
            links,
            registry,
            metrics,
            throughput,
            shutdown,
            server: Mutex::new(Some(server)),
            monitor: Mutex::new(Some(monitor)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.descriptor.address
    }

    pub fn node_id(&self) -> NodeId {
        self.descriptor.node_id
    }

    /// Public description other nodes and senders put in circuits.
    pub fn descriptor(&self) -> &HopDescriptor {
        &self.descriptor
    }

    pub fn metrics(&self) -> &Arc<NodeMetrics> {
        &self.metrics
    }

    pub fn pipeline_stats(&self) -> PipelineStats {
        self.pipeline.stats()
    }

    pub fn health(&self) -> HealthReport {
        self.metrics.health()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.descriptor.node_id,
            role: self.descriptor.role,
            listen: self.descriptor.address,
            health: self.metrics.health(),
            metrics: self.metrics.snapshot(),
            pipeline: self.pipeline.stats(),
            pool: self.pipeline.pool().stats(),
            throughput: self.throughput.report(),
        }
    }

    pub fn register_delivery_handler(&self, handler: Arc<dyn DeliveryHandler>) {
        self.registry.register(handler);
    }

    /// Sender bound to `circuit` that reuses this node's outbound links.
    pub fn client(&self, circuit: Circuit) -> MixnetClient {
        MixnetClient::new(circuit, self.links.clone(), self.registry.clone())
    }

    pub async fn shutdown(&self) {
        self.shutdown.trigger();
        self.pipeline.shutdown();
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }
        let server = self.server.lock().take();
        if let Some(handle) = server {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Listener exited with error: {}", e),
                Err(e) => warn!("Listener task failed: {}", e),
            }
        }
        info!("Node {} stopped", self.descriptor.node_id);
    }
}

async fn watch_throughput(pipeline: Arc<Pipeline>, monitor: Arc<ThroughputMonitor>) {
    let mut ticker = tokio::time::interval(THROUGHPUT_WINDOW);
    loop {
        ticker.tick().await;
        let stats = pipeline.stats();
        let report = monitor.sample(Instant::now(), stats.processed, stats.rejected, stats.queue_depth);
        if report.below_target {
            warn!(
                "Processing {} pps against a target of {} pps with packets waiting",
                report.observed_pps, report.target_pps
            );
        }
    }
}
