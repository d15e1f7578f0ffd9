// Outbound links to next hops
//
// One persistent TCP connection per peer address, created on first use.
// Connects are retried a bounded number of times with exponential backoff;
// once those are exhausted the packet is dropped, the path reported as
// degraded, and the peer held down: until the hold-off passes every send to
// it fails at once without dialing. Packets themselves are never queued for
// retransmission.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::framing::write_frame;
use super::{PacketSink, TransportError};
use crate::metrics::NodeMetrics;
use crate::mixnode::DeliveryRegistry;
use crate::packet::{NextHop, Packet};

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub connect_retries: u32,
    pub reconnect_backoff: Duration,
    pub connect_timeout: Duration,
    /// How long an unreachable peer is failed without dialing
    pub unreachable_holdoff: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_retries: 3,
            reconnect_backoff: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(2),
            unreachable_holdoff: Duration::from_secs(5),
        }
    }
}

type Link = Arc<tokio::sync::Mutex<Option<TcpStream>>>;

pub struct PeerLinks {
    config: LinkConfig,
    links: Mutex<HashMap<SocketAddr, Link>>,
    down_until: Mutex<HashMap<SocketAddr, Instant>>,
    metrics: Arc<NodeMetrics>,
    registry: DeliveryRegistry,
}

impl PeerLinks {
    pub fn new(config: LinkConfig, metrics: Arc<NodeMetrics>, registry: DeliveryRegistry) -> Self {
        Self {
            config,
            links: Mutex::new(HashMap::new()),
            down_until: Mutex::new(HashMap::new()),
            metrics,
            registry,
        }
    }

    /// Exponential backoff before connect attempt `attempt + 1`
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let base_ms = self.config.reconnect_backoff.as_millis() as u64;
        let backoff_ms = base_ms.saturating_mul(2u64.pow(attempt.min(5)));
        Duration::from_millis(backoff_ms.min(5_000))
    }

    /// Peers with an open connection right now.
    pub async fn connected_peers(&self) -> usize {
        let links: Vec<Link> = self.links.lock().values().cloned().collect();
        let mut open = 0;
        for link in links {
            if link.lock().await.is_some() {
                open += 1;
            }
        }
        open
    }

    /// True while `addr` is inside its hold-off after exhausting retries.
    pub fn is_down(&self, addr: SocketAddr) -> bool {
        let mut down = self.down_until.lock();
        match down.get(&addr) {
            Some(until) if Instant::now() < *until => true,
            Some(_) => {
                down.remove(&addr);
                false
            }
            None => false,
        }
    }

    fn link(&self, addr: SocketAddr) -> Link {
        Arc::clone(self.links.lock().entry(addr).or_default())
    }

    async fn connect(&self, addr: SocketAddr) -> Result<TcpStream, TransportError> {
        let attempts = self.config.connect_retries.max(1);
        for attempt in 0..attempts {
            match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    info!("Link to {} established", addr);
                    return Ok(stream);
                }
                Ok(Err(e)) => debug!("Connect to {} failed (attempt {}): {}", addr, attempt + 1, e),
                Err(_) => debug!("Connect to {} timed out (attempt {})", addr, attempt + 1),
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(self.backoff_duration(attempt)).await;
            }
        }

        warn!("Peer {} unreachable after {} attempts", addr, attempts);
        self.down_until
            .lock()
            .insert(addr, Instant::now() + self.config.unreachable_holdoff);
        self.metrics.record_link_degraded();
        self.registry.report_degraded(addr, "unreachable");
        Err(TransportError::Unreachable { addr, attempts })
    }

    /// Write one frame to `addr`, connecting first if needed.
    pub async fn send_frame(&self, addr: SocketAddr, bytes: &[u8]) -> Result<(), TransportError> {
        if self.is_down(addr) {
            return Err(TransportError::Unreachable { addr, attempts: 0 });
        }
        let link = self.link(addr);
        let mut slot = link.lock().await;

        // Whoever held the slot before us may have just given up on the peer
        if slot.is_none() && self.is_down(addr) {
            return Err(TransportError::Unreachable { addr, attempts: 0 });
        }

        // A write that fails on an open link loses the packet; only the
        // next one reconnects
        if let Some(stream) = slot.as_mut() {
            return match write_frame(stream, bytes).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    debug!("Link to {} broke: {}", addr, e);
                    *slot = None;
                    Err(e)
                }
            };
        }

        let mut stream = self.connect(addr).await?;
        write_frame(&mut stream, bytes).await?;
        *slot = Some(stream);
        Ok(())
    }
}

#[async_trait]
impl PacketSink for PeerLinks {
    async fn forward(&self, next_hop: &NextHop, packet: Packet) -> Result<(), TransportError> {
        self.send_frame(next_hop.address, packet.as_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixnode::MockDeliveryHandler;
    use crate::packet::PACKET_SIZE;
    use crate::pipeline::BufferPool;
    use crate::transport::framing::{read_frame, FrameRead};
    use mockall::predicate::*;
    use tokio::net::TcpListener;

    fn links(config: LinkConfig, registry: DeliveryRegistry) -> (PeerLinks, Arc<NodeMetrics>) {
        let metrics = Arc::new(NodeMetrics::new());
        (PeerLinks::new(config, Arc::clone(&metrics), registry), metrics)
    }

    #[test]
    fn test_backoff_duration() {
        let (links, _) = links(LinkConfig::default(), DeliveryRegistry::new());
        assert_eq!(links.backoff_duration(0), Duration::from_millis(50));
        assert_eq!(links.backoff_duration(1), Duration::from_millis(100));
        assert_eq!(links.backoff_duration(5), Duration::from_millis(1600));
        assert_eq!(links.backoff_duration(10), Duration::from_millis(1600));
    }

    #[tokio::test]
    async fn test_connection_reused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (links, _) = links(LinkConfig::default(), DeliveryRegistry::new());

        links.send_frame(addr, &vec![1u8; PACKET_SIZE]).await.unwrap();
        links.send_frame(addr, &vec![2u8; PACKET_SIZE]).await.unwrap();
        assert_eq!(links.connected_peers().await, 1);

        let (mut inbound, _) = listener.accept().await.unwrap();
        let pool = BufferPool::new(2, PACKET_SIZE);
        for expected in [1u8, 2u8] {
            match read_frame(&mut inbound, &pool).await.unwrap() {
                FrameRead::Packet(buf) => assert!(buf.iter().all(|b| *b == expected)),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_unreachable_reports_degraded() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let mut handler = MockDeliveryHandler::new();
        handler
            .expect_on_path_degraded()
            .with(eq(addr), always())
            .times(1)
            .return_const(());
        let registry = DeliveryRegistry::new();
        registry.register(Arc::new(handler));

        let config = LinkConfig {
            connect_retries: 2,
            reconnect_backoff: Duration::from_millis(1),
            connect_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let (links, metrics) = links(config, registry);

        match links.send_frame(addr, &[0u8; 4]).await {
            Err(TransportError::Unreachable { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(metrics.snapshot().degraded_links, 1);
        assert_eq!(links.connected_peers().await, 0);
        assert!(links.is_down(addr));
    }

    async fn closed_port() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn test_dead_peer_fails_fast_and_reports_once() {
        let addr = closed_port().await;
        let mut handler = MockDeliveryHandler::new();
        handler
            .expect_on_path_degraded()
            .with(eq(addr), always())
            .times(1)
            .return_const(());
        let registry = DeliveryRegistry::new();
        registry.register(Arc::new(handler));

        // One retry cycle is ~150ms of backoff; twenty serialized cycles would be 3s
        let config = LinkConfig {
            connect_retries: 3,
            reconnect_backoff: Duration::from_millis(50),
            connect_timeout: Duration::from_millis(200),
            unreachable_holdoff: Duration::from_secs(30),
        };
        let (links, metrics) = links(config, registry);
        let links = Arc::new(links);

        let started = Instant::now();
        let sends: Vec<_> = (0..20)
            .map(|_| {
                let links = Arc::clone(&links);
                tokio::spawn(async move { links.send_frame(addr, &[0u8; 4]).await })
            })
            .collect();
        for send in sends {
            assert!(matches!(send.await.unwrap(), Err(TransportError::Unreachable { .. })));
        }
        assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());
        assert_eq!(metrics.snapshot().degraded_links, 1);
    }

    #[tokio::test]
    async fn test_holdoff_expires() {
        let addr = closed_port().await;
        let config = LinkConfig {
            connect_retries: 1,
            reconnect_backoff: Duration::from_millis(1),
            connect_timeout: Duration::from_millis(200),
            unreachable_holdoff: Duration::from_millis(50),
        };
        let (links, metrics) = links(config, DeliveryRegistry::new());

        assert!(matches!(
            links.send_frame(addr, &[0u8; 4]).await,
            Err(TransportError::Unreachable { attempts: 1, .. })
        ));
        assert!(matches!(
            links.send_frame(addr, &[0u8; 4]).await,
            Err(TransportError::Unreachable { attempts: 0, .. })
        ));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!links.is_down(addr));
        assert!(matches!(
            links.send_frame(addr, &[0u8; 4]).await,
            Err(TransportError::Unreachable { attempts: 1, .. })
        ));
        assert_eq!(metrics.snapshot().degraded_links, 2);
    }
}
