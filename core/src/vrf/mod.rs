// Verifiable Random Function — ECVRF-EDWARDS25519-SHA512-TAI (RFC 9381)
//
// A node proves that a random value was derived from its own key and a
// public seed, so anyone holding the node's public key can check that the
// value was not picked by hand. Keys are ordinary Ed25519 keys.
//
// Used for:
//   - relay selection (selection.rs): epoch tickets and auditable picks
//   - forwarding delays (delay.rs): per-packet mixing delay

pub mod delay;
pub mod selection;

pub use delay::{DelayDistribution, DelayPolicy, DelayScheduler, ScheduledDelay};
pub use selection::{epoch_seed, EpochSchedule, RelayCandidate, RelaySelector, RelayTicket, Selection};

use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::keys::hex_bytes;

pub const OUTPUT_SIZE: usize = 64;
pub const PROOF_SIZE: usize = 80;

const SUITE: u8 = 0x03;
const ENCODE_TO_CURVE_FRONT: u8 = 0x01;
const CHALLENGE_FRONT: u8 = 0x02;
const PROOF_TO_HASH_FRONT: u8 = 0x03;
const DOMAIN_BACK: u8 = 0x00;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VrfError {
    #[error("Invalid VRF public key")]
    InvalidPublicKey,
    #[error("Malformed VRF proof")]
    InvalidProof,
    #[error("VRF proof does not verify")]
    VerificationFailed,
    #[error("Seed did not map to a curve point")]
    HashToCurve,
}

/// 64 bytes of verifiable randomness.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VrfOutput(#[serde(with = "hex_bytes")] pub [u8; OUTPUT_SIZE]);

impl VrfOutput {
    /// First eight bytes as a little-endian integer.
    pub fn as_u64(&self) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(b)
    }

    /// Uniform value in [0, 1) using 53 bits of the output.
    pub fn as_unit_f64(&self) -> f64 {
        (self.as_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}

impl std::fmt::Debug for VrfOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VrfOutput({})", hex::encode(&self.0[..8]))
    }
}

/// Proof encoding: Gamma (32) | c (16) | s (32).
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VrfProof(#[serde(with = "hex_bytes")] pub [u8; PROOF_SIZE]);

impl std::fmt::Debug for VrfProof {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VrfProof({})", hex::encode(&self.0[..8]))
    }
}

/// Prove `seed` under `secret_key`.
pub fn generate(secret_key: &SigningKey, seed: &[u8]) -> Result<(VrfOutput, VrfProof), VrfError> {
    let public = secret_key.verifying_key().to_bytes();

    let mut expanded = Zeroizing::new([0u8; 64]);
    expanded.copy_from_slice(&Sha512::digest(secret_key.as_bytes()));
    let mut lower = Zeroizing::new([0u8; 32]);
    lower.copy_from_slice(&expanded[..32]);
    lower[0] &= 248;
    lower[31] &= 127;
    lower[31] |= 64;
    let mut x = Scalar::from_bytes_mod_order(*lower);

    let h = encode_to_curve(&public, seed)?;
    let h_bytes = h.compress().to_bytes();
    let gamma = x * h;

    let mut nonce_hash = Sha512::new();
    nonce_hash.update(&expanded[32..]);
    nonce_hash.update(h_bytes);
    let mut k_wide = Zeroizing::new([0u8; 64]);
    k_wide.copy_from_slice(&nonce_hash.finalize());
    let mut k = Scalar::from_bytes_mod_order_wide(&k_wide);

    let u = EdwardsPoint::mul_base(&k);
    let v = k * h;
    let c_bytes = challenge(&[
        &public,
        &h_bytes,
        gamma.compress().as_bytes(),
        u.compress().as_bytes(),
        v.compress().as_bytes(),
    ]);
    let c = challenge_scalar(&c_bytes);
    let s = k + c * x;
    k.zeroize();
    x.zeroize();

    let mut proof = [0u8; PROOF_SIZE];
    proof[..32].copy_from_slice(gamma.compress().as_bytes());
    proof[32..48].copy_from_slice(&c_bytes);
    proof[48..].copy_from_slice(s.as_bytes());

    Ok((gamma_to_output(&gamma), VrfProof(proof)))
}

/// Check `proof` for `seed` under `public_key` and return its output.
pub fn verify_proof(public_key: &[u8; 32], seed: &[u8], proof: &VrfProof) -> Result<VrfOutput, VrfError> {
    let y = CompressedEdwardsY(*public_key)
        .decompress()
        .ok_or(VrfError::InvalidPublicKey)?;
    if y.is_small_order() {
        return Err(VrfError::InvalidPublicKey);
    }

    let mut gamma_bytes = [0u8; 32];
    gamma_bytes.copy_from_slice(&proof.0[..32]);
    let gamma = CompressedEdwardsY(gamma_bytes)
        .decompress()
        .ok_or(VrfError::InvalidProof)?;
    let mut c_bytes = [0u8; 16];
    c_bytes.copy_from_slice(&proof.0[32..48]);
    let mut s_bytes = [0u8; 32];
    s_bytes.copy_from_slice(&proof.0[48..]);
    let s: Scalar = Option::from(Scalar::from_canonical_bytes(s_bytes)).ok_or(VrfError::InvalidProof)?;
    let c = challenge_scalar(&c_bytes);

    let h = encode_to_curve(public_key, seed)?;
    // U = s*B - c*Y, V = s*H - c*Gamma
    let u = EdwardsPoint::vartime_double_scalar_mul_basepoint(&(-c), &y, &s);
    let v = s * h - c * gamma;

    let expected = challenge(&[
        public_key,
        h.compress().as_bytes(),
        &gamma_bytes,
        u.compress().as_bytes(),
        v.compress().as_bytes(),
    ]);
    if bool::from(expected[..].ct_eq(&c_bytes[..])) {
        Ok(gamma_to_output(&gamma))
    } else {
        Err(VrfError::VerificationFailed)
    }
}

/// True when `proof` is valid for `seed` and yields exactly `output`.
pub fn verify(public_key: &[u8; 32], seed: &[u8], output: &VrfOutput, proof: &VrfProof) -> bool {
    match verify_proof(public_key, seed, proof) {
        Ok(derived) => bool::from(derived.0[..].ct_eq(&output.0[..])),
        Err(_) => false,
    }
}

/// Try-and-increment hash to the prime-order subgroup.
fn encode_to_curve(public_key: &[u8; 32], seed: &[u8]) -> Result<EdwardsPoint, VrfError> {
    for ctr in 0u8..=255 {
        let mut hasher = Sha512::new();
        hasher.update([SUITE, ENCODE_TO_CURVE_FRONT]);
        hasher.update(public_key);
        hasher.update(seed);
        hasher.update([ctr, DOMAIN_BACK]);
        let digest = hasher.finalize();

        let mut candidate = [0u8; 32];
        candidate.copy_from_slice(&digest[..32]);
        if let Some(point) = CompressedEdwardsY(candidate).decompress() {
            return Ok(point.mul_by_cofactor());
        }
    }
    Err(VrfError::HashToCurve)
}

fn challenge(points: &[&[u8; 32]; 5]) -> [u8; 16] {
    let mut hasher = Sha512::new();
    hasher.update([SUITE, CHALLENGE_FRONT]);
    for p in points {
        hasher.update(*p);
    }
    hasher.update([DOMAIN_BACK]);
    let digest = hasher.finalize();
    let mut c = [0u8; 16];
    c.copy_from_slice(&digest[..16]);
    c
}

fn challenge_scalar(c: &[u8; 16]) -> Scalar {
    let mut wide = [0u8; 32];
    wide[..16].copy_from_slice(c);
    Scalar::from_bytes_mod_order(wide)
}

fn gamma_to_output(gamma: &EdwardsPoint) -> VrfOutput {
    let mut hasher = Sha512::new();
    hasher.update([SUITE, PROOF_TO_HASH_FRONT]);
    hasher.update(gamma.mul_by_cofactor().compress().as_bytes());
    hasher.update([DOMAIN_BACK]);
    let mut out = [0u8; OUTPUT_SIZE];
    out.copy_from_slice(&hasher.finalize());
    VrfOutput(out)
}

/// Public key matching `secret_key`, as used by [`verify`].
pub fn public_key(secret_key: &SigningKey) -> [u8; 32] {
    secret_key.verifying_key().to_bytes()
}
