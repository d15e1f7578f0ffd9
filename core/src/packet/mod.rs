// Packet format — fixed-size Sphinx-style onion packets
//
// Wire layout (every hop sees the same length):
//
//   alpha   32 bytes   X25519 ephemeral public key for this hop
//   gamma   16 bytes   Poly1305 tag over (beta as AAD, payload)
//   beta    MAX_HOPS * SLOT_SIZE bytes of layered routing slots
//   payload PAYLOAD_SIZE bytes of onion-encrypted, padded data
//
// A routing slot is: flags | next node id | next address | next alpha | next gamma.

pub mod circuit;
pub mod codec;
pub mod padding;

pub use circuit::{Circuit, CircuitBuilder, CircuitConfig, CircuitError, CircuitId, HopDescriptor, Role};
pub use codec::{encode, encode_with, peel, peel_into};

use crate::crypto::NodeId;
use crate::pipeline::pool::PooledBuffer;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

/// Maximum circuit length
pub const MAX_HOPS: usize = 5;

pub const ALPHA_SIZE: usize = 32;
pub const GAMMA_SIZE: usize = 16;
/// Encoded socket address: family tag, 16 address bytes, port
pub const ADDR_SIZE: usize = 19;
pub const SLOT_SIZE: usize = 1 + 32 + ADDR_SIZE + ALPHA_SIZE + GAMMA_SIZE;
pub const BETA_SIZE: usize = MAX_HOPS * SLOT_SIZE;
pub const PAYLOAD_SIZE: usize = 2048;
pub const HEADER_SIZE: usize = ALPHA_SIZE + GAMMA_SIZE + BETA_SIZE;
pub const PACKET_SIZE: usize = HEADER_SIZE + PAYLOAD_SIZE;

/// Largest application payload one packet carries (one byte goes to the pad marker)
pub const MAX_MESSAGE_SIZE: usize = PAYLOAD_SIZE - 1;

pub(crate) const GAMMA_OFFSET: usize = ALPHA_SIZE;
pub(crate) const BETA_OFFSET: usize = GAMMA_OFFSET + GAMMA_SIZE;
pub(crate) const PAYLOAD_OFFSET: usize = HEADER_SIZE;

pub(crate) const FLAG_DELIVER: u8 = 0x01;
pub(crate) const FLAG_FORWARD: u8 = 0x02;
pub(crate) const FLAG_MIX_DELAY: u8 = 0x04;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Invalid packet format: {0}")]
    InvalidFormat(String),
    #[error("Packet integrity violation")]
    IntegrityViolation,
    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

/// One fixed-size packet. Never mutated after construction.
pub struct Packet {
    buf: PooledBuffer,
}

impl Packet {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, PacketError> {
        Self::from_buffer(PooledBuffer::detached(bytes))
    }

    /// Adopt a pooled buffer holding a full packet.
    pub fn from_buffer(buf: PooledBuffer) -> Result<Self, PacketError> {
        if buf.len() != PACKET_SIZE {
            return Err(PacketError::InvalidFormat(format!(
                "expected {} bytes, got {}",
                PACKET_SIZE,
                buf.len()
            )));
        }
        Ok(Self { buf })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn alpha(&self) -> [u8; ALPHA_SIZE] {
        let mut out = [0u8; ALPHA_SIZE];
        out.copy_from_slice(&self.buf[..ALPHA_SIZE]);
        out
    }

    pub fn gamma(&self) -> [u8; GAMMA_SIZE] {
        let mut out = [0u8; GAMMA_SIZE];
        out.copy_from_slice(&self.buf[GAMMA_OFFSET..BETA_OFFSET]);
        out
    }

    pub fn beta(&self) -> &[u8] {
        &self.buf[BETA_OFFSET..PAYLOAD_OFFSET]
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[PAYLOAD_OFFSET..]
    }

    pub fn into_buffer(self) -> PooledBuffer {
        self.buf
    }
}

impl Clone for Packet {
    fn clone(&self) -> Self {
        Self {
            buf: PooledBuffer::detached(self.buf.to_vec()),
        }
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("alpha", &hex::encode(&self.buf[..8]))
            .field("len", &self.buf.len())
            .finish()
    }
}

/// The only routing fact a hop learns: who to hand the packet to next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NextHop {
    pub node_id: NodeId,
    pub address: SocketAddr,
}

pub(crate) fn encode_addr(addr: &SocketAddr, out: &mut [u8]) {
    out[..ADDR_SIZE].fill(0);
    match addr.ip() {
        IpAddr::V4(ip) => {
            out[0] = 4;
            out[1..5].copy_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            out[0] = 6;
            out[1..17].copy_from_slice(&ip.octets());
        }
    }
    out[17..19].copy_from_slice(&addr.port().to_be_bytes());
}

pub(crate) fn decode_addr(bytes: &[u8]) -> Result<SocketAddr, PacketError> {
    let port = u16::from_be_bytes([bytes[17], bytes[18]]);
    let ip = match bytes[0] {
        4 => IpAddr::V4(Ipv4Addr::new(bytes[1], bytes[2], bytes[3], bytes[4])),
        6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&bytes[1..17]);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => {
            return Err(PacketError::InvalidFormat(format!("unknown address family {}", other)));
        }
    };
    Ok(SocketAddr::new(ip, port))
}

/// Result of removing one layer.
#[derive(Debug)]
pub enum PeelOutcome {
    /// Intermediate hop: hand `packet` to `next_hop`
    Forward {
        next_hop: NextHop,
        packet: Packet,
        /// Sender asked for a mixing delay at this hop
        mix_delay: bool,
    },
    /// Exit hop: the unpadded application payload
    Deliver { payload: Vec<u8> },
}

#[derive(Debug)]
pub struct Peeled {
    pub outcome: PeelOutcome,
    /// Per (packet, hop) tag for replay detection
    pub fingerprint: [u8; 32],
}
