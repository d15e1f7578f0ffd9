// Sender-facing API
//
// The one boundary the VPN and P2P layers use: hand over a destination
// and payload, get a receipt once the packet is on its way to the entry
// node, and register callbacks for what arrives at this node as exit.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::PacketSink;
use crate::mixnode::{Delivery, DeliveryHandler, DeliveryRegistry};
use crate::packet::{encode_with, Circuit, CircuitId, NextHop, PacketError};
use crate::MixnetError;

/// Proof that a packet left for the entry node. Says nothing about
/// delivery; the mixnet never reports back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub id: Uuid,
    pub circuit_id: CircuitId,
    pub entry: SocketAddr,
    pub payload_len: usize,
    pub privacy_required: bool,
}

#[async_trait]
pub trait MixnetTransport: Send + Sync {
    /// Wrap `payload` for `destination` and send it into the circuit.
    async fn send(&self, destination: &str, payload: &[u8], privacy_required: bool) -> Result<DeliveryReceipt, MixnetError>;

    fn register_delivery_handler(&self, handler: Arc<dyn DeliveryHandler>);
}

/// Sends over a fixed circuit through any [`PacketSink`].
pub struct MixnetClient {
    circuit: Circuit,
    sink: Arc<dyn PacketSink>,
    registry: DeliveryRegistry,
}

impl MixnetClient {
    pub fn new(circuit: Circuit, sink: Arc<dyn PacketSink>, registry: DeliveryRegistry) -> Self {
        Self {
            circuit,
            sink,
            registry,
        }
    }

    pub fn circuit(&self) -> &Circuit {
        &self.circuit
    }

    /// Swap in a freshly built circuit, e.g. at an epoch boundary.
    pub fn set_circuit(&mut self, circuit: Circuit) {
        self.circuit = circuit;
    }
}

#[async_trait]
impl MixnetTransport for MixnetClient {
    async fn send(&self, destination: &str, payload: &[u8], privacy_required: bool) -> Result<DeliveryReceipt, MixnetError> {
        if payload.len() > Delivery::max_data_len(destination) {
            return Err(PacketError::PayloadTooLarge(payload.len()).into());
        }
        let envelope = Delivery {
            destination: destination.to_string(),
            data: payload.to_vec(),
        }
        .encode()
        .map_err(|e| PacketError::InvalidFormat(e.to_string()))?;

        let packet = encode_with(&self.circuit, &envelope, privacy_required)?;
        let entry = self.circuit.entry();
        let next_hop = NextHop {
            node_id: entry.node_id,
            address: entry.address,
        };
        self.sink.forward(&next_hop, packet).await?;

        let receipt = DeliveryReceipt {
            id: Uuid::new_v4(),
            circuit_id: self.circuit.id(),
            entry: entry.address,
            payload_len: payload.len(),
            privacy_required,
        };
        debug!("Sent {} bytes via {} ({})", payload.len(), entry.address, receipt.id);
        Ok(receipt)
    }

    fn register_delivery_handler(&self, handler: Arc<dyn DeliveryHandler>) {
        self.registry.register(handler);
    }
}
