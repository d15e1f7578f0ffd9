// Transport module — TCP links between mixnodes and the sender API

pub mod api;
pub mod framing;
pub mod links;
pub mod node;
pub mod server;

pub use api::{DeliveryReceipt, MixnetClient, MixnetTransport};
pub use framing::{read_frame, write_frame, FrameRead, MAX_FRAME_SIZE};
pub use links::{LinkConfig, PeerLinks};
pub use node::MixnetNode;
pub use server::{serve, ShutdownSignal};

use async_trait::async_trait;
use std::net::SocketAddr;
use thiserror::Error;

use crate::packet::{NextHop, Packet};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
    #[error("Peer {addr} unreachable after {attempts} attempts")]
    Unreachable { addr: SocketAddr, attempts: u32 },
    #[error("Transport closed")]
    Closed,
}

/// Where forwarded packets go once their delay has elapsed.
#[async_trait]
pub trait PacketSink: Send + Sync {
    async fn forward(&self, next_hop: &NextHop, packet: Packet) -> Result<(), TransportError>;
}
