// Packet codec — build and peel onion layers
//
// Construction works exit-first. For hop j the sender holds a fresh
// ephemeral key alpha_j and the layer key k_j derived from
// ECDH(alpha_j, node_j). The header beta_j is built so that
//
//     (beta_j || 0^SLOT) XOR stream(k_j) = slot_j || beta_{j+1}
//
// which needs a filler string for the bytes that shift in from the right.
// The payload is sealed under k_j with beta_j as associated data, giving
// gamma_j. Peeling checks gamma_j first; nothing of the header is used
// before the tag verifies.

use rand::RngCore;
use std::ops::Range;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use super::padding::{pad_into, unpad};
use super::{
    decode_addr, encode_addr, Circuit, HopDescriptor, NextHop, Packet, PacketError, PeelOutcome, Peeled,
    ALPHA_SIZE, BETA_OFFSET, BETA_SIZE, FLAG_DELIVER, FLAG_FORWARD, FLAG_MIX_DELAY, GAMMA_OFFSET,
    GAMMA_SIZE, MAX_MESSAGE_SIZE, PACKET_SIZE, PAYLOAD_OFFSET, SLOT_SIZE,
};
use crate::crypto::{decrypt_layer, derive_layer_key, encrypt_layer, NodeId, NodeSecret};
use crate::pipeline::pool::PooledBuffer;

const SLOT_NODE_ID: Range<usize> = 1..33;
const SLOT_ADDR: Range<usize> = 33..52;
const SLOT_ALPHA: Range<usize> = 52..84;
const SLOT_GAMMA: Range<usize> = 84..100;

fn write_forward_slot(
    slot: &mut [u8],
    flags: u8,
    next: &HopDescriptor,
    alpha: &[u8; ALPHA_SIZE],
    gamma: &[u8; GAMMA_SIZE],
) {
    slot[0] = flags;
    slot[SLOT_NODE_ID].copy_from_slice(next.node_id.as_bytes());
    encode_addr(&next.address, &mut slot[SLOT_ADDR]);
    slot[SLOT_ALPHA].copy_from_slice(alpha);
    slot[SLOT_GAMMA].copy_from_slice(gamma);
}

fn xor_in_place(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= *s;
    }
}

/// Build a packet for `circuit` with a mixing delay requested at every hop.
pub fn encode(circuit: &Circuit, payload: &[u8]) -> Result<Packet, PacketError> {
    encode_with(circuit, payload, true)
}

/// Build a packet for `circuit`. With `mix_delay` false, hops forward
/// without waiting for a VRF delay.
pub fn encode_with(circuit: &Circuit, payload: &[u8], mix_delay: bool) -> Result<Packet, PacketError> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(PacketError::PayloadTooLarge(payload.len()));
    }
    let hops = circuit.hops();
    let r = hops.len();
    let mut rng = rand::thread_rng();

    let mut alphas = Vec::with_capacity(r);
    let mut keys = Vec::with_capacity(r);
    for (j, hop) in hops.iter().enumerate() {
        let ephemeral = StaticSecret::random_from_rng(&mut rng);
        alphas.push(PublicKey::from(&ephemeral).to_bytes());
        let shared = ephemeral.diffie_hellman(&PublicKey::from(hop.public_key));
        if !shared.was_contributory() {
            return Err(PacketError::InvalidPath(format!("hop {} has a low-order key", j)));
        }
        keys.push(derive_layer_key(shared.as_bytes(), j as u8));
    }

    let streams: Vec<Zeroizing<Vec<u8>>> = keys
        .iter()
        .map(|k| {
            let mut stream = Zeroizing::new(vec![0u8; BETA_SIZE + SLOT_SIZE]);
            k.header_keystream(&mut stream);
            stream
        })
        .collect();

    // Filler: what the tail of each header decrypts to after the shifts
    let mut filler = Vec::with_capacity((r - 1) * SLOT_SIZE);
    for (j, stream) in streams.iter().enumerate().take(r - 1) {
        filler.extend_from_slice(&[0u8; SLOT_SIZE]);
        xor_in_place(&mut filler, &stream[BETA_SIZE - j * SLOT_SIZE..]);
    }

    let mut out = vec![0u8; PACKET_SIZE];
    pad_into(payload, &mut out[PAYLOAD_OFFSET..]).map_err(|_| PacketError::PayloadTooLarge(payload.len()))?;

    // Exit header: deliver flag, random tail, then filler
    let head = BETA_SIZE - (r - 1) * SLOT_SIZE;
    let mut beta = [0u8; BETA_SIZE];
    rng.fill_bytes(&mut beta[..head]);
    beta[0] = FLAG_DELIVER;
    xor_in_place(&mut beta[..head], &streams[r - 1][..head]);
    beta[head..].copy_from_slice(&filler);

    let mut gamma = encrypt_layer(&keys[r - 1], &beta, &mut out[PAYLOAD_OFFSET..])
        .map_err(|_| PacketError::IntegrityViolation)?;

    let forward_flags = if mix_delay {
        FLAG_FORWARD | FLAG_MIX_DELAY
    } else {
        FLAG_FORWARD
    };
    for j in (0..r - 1).rev() {
        let mut wrapped = [0u8; BETA_SIZE];
        write_forward_slot(&mut wrapped[..SLOT_SIZE], forward_flags, &hops[j + 1], &alphas[j + 1], &gamma);
        wrapped[SLOT_SIZE..].copy_from_slice(&beta[..BETA_SIZE - SLOT_SIZE]);
        xor_in_place(&mut wrapped, &streams[j][..BETA_SIZE]);
        beta = wrapped;

        gamma = encrypt_layer(&keys[j], &beta, &mut out[PAYLOAD_OFFSET..])
            .map_err(|_| PacketError::IntegrityViolation)?;
    }

    out[..ALPHA_SIZE].copy_from_slice(&alphas[0]);
    out[GAMMA_OFFSET..BETA_OFFSET].copy_from_slice(&gamma);
    out[BETA_OFFSET..PAYLOAD_OFFSET].copy_from_slice(&beta);
    Packet::from_bytes(out)
}

/// Remove one layer, allocating the output packet.
pub fn peel(packet: &Packet, secret: &NodeSecret) -> Result<Peeled, PacketError> {
    peel_into(packet, secret, PooledBuffer::detached(vec![0u8; PACKET_SIZE]))
}

/// Remove one layer, writing the next packet into `out`.
///
/// `out` must be `PACKET_SIZE` bytes; its prior contents are ignored. On any
/// error the buffer is dropped, which returns it to its pool.
pub fn peel_into(packet: &Packet, secret: &NodeSecret, mut out: PooledBuffer) -> Result<Peeled, PacketError> {
    if out.len() != PACKET_SIZE {
        return Err(PacketError::InvalidFormat("output buffer has wrong size".to_string()));
    }

    let shared = secret
        .shared_secret(&packet.alpha())
        .map_err(|_| PacketError::IntegrityViolation)?;
    let key = derive_layer_key(&shared, secret.hop_index());

    {
        let payload = &mut out[PAYLOAD_OFFSET..];
        payload.copy_from_slice(packet.payload());
        decrypt_layer(&key, packet.beta(), payload, &packet.gamma())
            .map_err(|_| PacketError::IntegrityViolation)?;
    }

    let mut ext = [0u8; BETA_SIZE + SLOT_SIZE];
    key.header_keystream(&mut ext);
    xor_in_place(&mut ext, packet.beta());

    let fingerprint = key.fingerprint();
    let flags = ext[0];
    let outcome = if flags == FLAG_DELIVER {
        let message = unpad(&out[PAYLOAD_OFFSET..])
            .map_err(|_| PacketError::InvalidFormat("bad payload padding".to_string()))?
            .to_vec();
        PeelOutcome::Deliver { payload: message }
    } else if flags & !FLAG_MIX_DELAY == FLAG_FORWARD {
        let mut node_id = [0u8; 32];
        node_id.copy_from_slice(&ext[SLOT_NODE_ID]);
        let address = decode_addr(&ext[SLOT_ADDR])?;

        out[..ALPHA_SIZE].copy_from_slice(&ext[SLOT_ALPHA]);
        out[GAMMA_OFFSET..BETA_OFFSET].copy_from_slice(&ext[SLOT_GAMMA]);
        out[BETA_OFFSET..PAYLOAD_OFFSET].copy_from_slice(&ext[SLOT_SIZE..]);

        PeelOutcome::Forward {
            next_hop: NextHop {
                node_id: NodeId(node_id),
                address,
            },
            packet: Packet::from_buffer(out)?,
            mix_delay: flags & FLAG_MIX_DELAY != 0,
        }
    } else {
        return Err(PacketError::InvalidFormat(format!("unknown routing flags {:#04x}", flags)));
    };

    Ok(Peeled { outcome, fingerprint })
}
