// Betanet Core — Mixnet Packet Routing
//
// Fixed-size layered packets, one layer peeled per hop, forwarded after a
// verifiable random delay. A hop learns its predecessor and its successor
// and nothing else.

pub mod config;
pub mod crypto;
pub mod metrics;
pub mod mixnode;
pub mod packet;
pub mod pipeline;
pub mod transport;
pub mod vrf;

use thiserror::Error;

pub use config::{ConfigError, NodeConfig};
pub use crypto::{CryptoError, IntegrityError, NodeId, NodeKeys};
pub use metrics::{DropReason, HealthReport, HealthStatus, MetricsSnapshot, NodeMetrics, ThroughputReport};
pub use mixnode::{Decision, Delivery, DeliveryHandler, DeliveryRegistry, Mixnode, MixnodeSettings, ProcessingState};
pub use packet::{
    encode, encode_with, peel, Circuit, CircuitBuilder, CircuitError, HopDescriptor, NextHop, Packet, PacketError,
    PeelOutcome, Role, MAX_HOPS, MAX_MESSAGE_SIZE, PACKET_SIZE,
};
pub use pipeline::{BufferPool, CapacityError, Pipeline, PipelineConfig, PipelineStats};
pub use transport::node::NodeStatus;
pub use transport::{DeliveryReceipt, MixnetClient, MixnetNode, MixnetTransport, PacketSink, TransportError};
pub use vrf::{DelayPolicy, RelaySelector, RelayTicket, VrfError};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Crate-wide error. Packet-level variants end the packet, never the node.
#[derive(Debug, Error)]
pub enum MixnetError {
    #[error("Packet format error: {0}")]
    PacketFormat(#[from] PacketError),
    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityError),
    #[error("Capacity error: {0}")]
    Capacity(#[from] CapacityError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("VRF verification error: {0}")]
    VrfVerification(#[from] VrfError),
    #[error("Circuit error: {0}")]
    Circuit(#[from] CircuitError),
    #[error("Key error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl MixnetError {
    /// The drop counter this error lands in when it ends a packet.
    pub fn drop_reason(&self) -> Option<DropReason> {
        match self {
            MixnetError::PacketFormat(PacketError::IntegrityViolation) | MixnetError::Integrity(_) => {
                Some(DropReason::Integrity)
            }
            MixnetError::PacketFormat(_) => Some(DropReason::Format),
            MixnetError::Capacity(_) => Some(DropReason::QueueFull),
            MixnetError::Transport(_) => Some(DropReason::Unreachable),
            MixnetError::VrfVerification(_) => Some(DropReason::Vrf),
            MixnetError::Circuit(_) | MixnetError::Crypto(_) | MixnetError::Config(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversions() {
        let err: MixnetError = PacketError::IntegrityViolation.into();
        assert_eq!(err.drop_reason(), Some(DropReason::Integrity));

        let err: MixnetError = CapacityError { max_queue_depth: 4 }.into();
        assert_eq!(err.drop_reason(), Some(DropReason::QueueFull));
        assert!(err.to_string().contains("queue full"));

        let err: MixnetError = VrfError::VerificationFailed.into();
        assert_eq!(err.drop_reason(), Some(DropReason::Vrf));

        let err: MixnetError = ConfigError::Validation("workers".into()).into();
        assert_eq!(err.drop_reason(), None);
    }
}
