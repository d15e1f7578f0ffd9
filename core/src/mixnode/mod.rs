// Mixnode — per-packet processing
//
// A mixnode peels exactly one layer from each packet it dequeues and
// decides what happens next: forward after a VRF-derived delay, hand the
// payload to the registered delivery handlers, or drop. Drops are silent
// toward the network; they only show up in counters and local logs.

pub mod replay;
pub mod state;

pub use replay::ReplayGuard;
pub use state::{InvalidTransition, ProcessingState, StateEvent};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::crypto::{NodeId, NodeKeys, NodeSecret};
use crate::metrics::{DropReason, NodeMetrics};
use crate::packet::{peel_into, NextHop, Packet, PacketError, PeelOutcome, Role, MAX_MESSAGE_SIZE};
use crate::pipeline::pool::PooledBuffer;
use crate::vrf::delay::DelayError;
use crate::vrf::{epoch_seed, DelayPolicy, DelayScheduler, EpochSchedule};

/// Bytes bincode spends on the two length prefixes of a [`Delivery`].
pub const DELIVERY_OVERHEAD: usize = 16;

/// What the exit hands to the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub destination: String,
    pub data: Vec<u8>,
}

impl Delivery {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Largest `data` that fits in one packet for `destination`.
    pub fn max_data_len(destination: &str) -> usize {
        MAX_MESSAGE_SIZE.saturating_sub(DELIVERY_OVERHEAD + destination.len())
    }
}

/// Application callbacks for inbound deliveries.
///
/// Implementations must be cheap; they run on the packet worker.
#[cfg_attr(test, mockall::automock)]
pub trait DeliveryHandler: Send + Sync {
    fn on_delivery(&self, delivery: &Delivery);

    /// A next hop stayed unreachable after all retries.
    fn on_path_degraded(&self, _peer: SocketAddr, _reason: &str) {}
}

/// Shared list of delivery handlers.
#[derive(Clone, Default)]
pub struct DeliveryRegistry {
    handlers: Arc<RwLock<Vec<Arc<dyn DeliveryHandler>>>>,
}

impl DeliveryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: Arc<dyn DeliveryHandler>) {
        self.handlers.write().push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns how many handlers saw the delivery.
    pub fn dispatch(&self, delivery: &Delivery) -> usize {
        let handlers = self.handlers.read();
        for handler in handlers.iter() {
            handler.on_delivery(delivery);
        }
        handlers.len()
    }

    pub fn report_degraded(&self, peer: SocketAddr, reason: &str) {
        for handler in self.handlers.read().iter() {
            handler.on_path_degraded(peer, reason);
        }
    }
}

/// Static parameters of one mixnode.
#[derive(Debug, Clone)]
pub struct MixnodeSettings {
    pub role: Role,
    pub hop_index: u8,
    pub delay_policy: DelayPolicy,
    pub epoch_length: Duration,
    pub replay_capacity: usize,
}

impl MixnodeSettings {
    pub fn for_role(role: Role) -> Self {
        Self {
            role,
            hop_index: role.default_hop_index(),
            delay_policy: DelayPolicy::default(),
            epoch_length: Duration::from_secs(3600),
            replay_capacity: 1 << 16,
        }
    }
}

/// Result of processing one packet.
#[derive(Debug)]
pub enum Decision {
    Forward {
        next_hop: NextHop,
        packet: Packet,
        delay: Duration,
    },
    Delivered,
    Dropped(DropReason),
}

impl Decision {
    /// Event that moves a decrypting packet on to its next state.
    pub fn event(&self) -> StateEvent {
        match self {
            Decision::Forward { .. } => StateEvent::NextHop,
            Decision::Delivered => StateEvent::Payload,
            Decision::Dropped(_) => StateEvent::Failed,
        }
    }
}

pub struct Mixnode {
    node_id: NodeId,
    role: Role,
    secret: NodeSecret,
    delay: DelayScheduler,
    epochs: EpochSchedule,
    replay: ReplayGuard,
    metrics: Arc<NodeMetrics>,
    deliveries: DeliveryRegistry,
}

impl Mixnode {
    pub fn new(
        keys: &NodeKeys,
        settings: MixnodeSettings,
        metrics: Arc<NodeMetrics>,
        deliveries: DeliveryRegistry,
    ) -> Result<Self, DelayError> {
        Ok(Self {
            node_id: keys.node_id(),
            role: settings.role,
            secret: keys.layer_secret(settings.hop_index),
            delay: DelayScheduler::new(keys.vrf_signing_key().clone(), settings.delay_policy)?,
            epochs: EpochSchedule::new(settings.epoch_length),
            replay: ReplayGuard::new(settings.replay_capacity),
            metrics,
            deliveries,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn hop_index(&self) -> u8 {
        self.secret.hop_index()
    }

    pub fn metrics(&self) -> &Arc<NodeMetrics> {
        &self.metrics
    }

    pub fn deliveries(&self) -> &DeliveryRegistry {
        &self.deliveries
    }

    /// Peel one layer off `packet`, writing any onward packet into `out`.
    ///
    /// Counts drops and deliveries; `forwarded` is counted by whoever
    /// actually puts the packet on the wire.
    pub fn process(&self, packet: &Packet, out: PooledBuffer) -> Decision {
        let peeled = match peel_into(packet, &self.secret, out) {
            Ok(peeled) => peeled,
            Err(PacketError::IntegrityViolation) => {
                trace!("Integrity check failed, dropping");
                return self.drop_packet(DropReason::Integrity);
            }
            Err(err) => {
                debug!("Malformed packet: {}", err);
                return self.drop_packet(DropReason::Format);
            }
        };

        if !self.replay.check_and_insert(&peeled.fingerprint) {
            debug!("Replayed packet, dropping");
            return self.drop_packet(DropReason::Replay);
        }

        match peeled.outcome {
            PeelOutcome::Forward {
                next_hop,
                packet: next,
                mix_delay,
            } => {
                let delay = if mix_delay {
                    let seed = epoch_seed(self.epochs.current_epoch());
                    match self.delay.schedule(&seed, &packet.alpha()) {
                        Ok(scheduled) => scheduled.delay,
                        Err(err) => {
                            warn!("VRF delay failed: {}", err);
                            return self.drop_packet(DropReason::Vrf);
                        }
                    }
                } else {
                    Duration::ZERO
                };
                trace!("Forwarding to {} after {:?}", next_hop.node_id, delay);
                Decision::Forward {
                    next_hop,
                    packet: next,
                    delay,
                }
            }
            PeelOutcome::Deliver { .. } if self.role != Role::Exit => {
                debug!("{} node reached a deliver layer, dropping", self.role);
                self.drop_packet(DropReason::Format)
            }
            PeelOutcome::Deliver { payload } => match Delivery::decode(&payload) {
                Ok(delivery) => {
                    if self.deliveries.dispatch(&delivery) == 0 {
                        debug!("Delivery for {} with no handler registered", delivery.destination);
                    }
                    self.metrics.record_delivered();
                    Decision::Delivered
                }
                Err(err) => {
                    debug!("Undecodable delivery payload: {}", err);
                    self.drop_packet(DropReason::Format)
                }
            },
        }
    }

    fn drop_packet(&self, reason: DropReason) -> Decision {
        self.metrics.record_drop(reason);
        Decision::Dropped(reason)
    }
}
