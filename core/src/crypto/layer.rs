// Per-layer crypto: key derivation and XChaCha20-Poly1305 sealing
//
// Each hop shares one X25519 secret with the sender. From it we derive:
//   - an AEAD key + nonce that seal the payload layer (header as AAD)
//   - a stream key + nonce that produce the header keystream
//   - a replay fingerprint the node remembers per epoch
//
// The open path does not call into the AEAD crate. It drives the stream
// cipher and Poly1305 directly so the full keystream and MAC are always
// computed, whether or not the tag turns out to match.

use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::XChaCha20;
use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::XChaCha20Poly1305;
use poly1305::universal_hash::UniversalHash;
use poly1305::Poly1305;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::IntegrityError;

/// KDF context for per-hop layer keys. Changing this breaks every circuit in flight.
const LAYER_KDF_CONTEXT: &str = "betanet mixnet layer keys 2026-01-12";

/// Poly1305 tag length
pub const TAG_SIZE: usize = 16;

const KEY_SIZE: usize = 32;
const XNONCE_SIZE: usize = 24;
const OKM_SIZE: usize = KEY_SIZE + XNONCE_SIZE + KEY_SIZE + XNONCE_SIZE + 32;

/// Symmetric material for one hop of one packet.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct LayerKey {
    aead_key: [u8; KEY_SIZE],
    aead_nonce: [u8; XNONCE_SIZE],
    header_key: [u8; KEY_SIZE],
    header_nonce: [u8; XNONCE_SIZE],
    fingerprint: [u8; 32],
}

impl LayerKey {
    /// Tag identifying this (packet, hop) pair for replay detection.
    pub fn fingerprint(&self) -> [u8; 32] {
        self.fingerprint
    }

    /// Fill `out` with the header keystream.
    pub fn header_keystream(&self, out: &mut [u8]) {
        out.fill(0);
        let mut cipher = XChaCha20::new(
            chacha20::Key::from_slice(&self.header_key),
            chacha20::XNonce::from_slice(&self.header_nonce),
        );
        cipher.apply_keystream(out);
    }
}

/// Derive the layer key for `hop_index` from an ECDH shared secret.
///
/// The hop index is mixed into the derivation so that the same shared secret
/// used at a different position yields unrelated keys.
pub fn derive_layer_key(shared_secret: &[u8; 32], hop_index: u8) -> LayerKey {
    let mut hasher = blake3::Hasher::new_derive_key(LAYER_KDF_CONTEXT);
    hasher.update(shared_secret);
    hasher.update(&[hop_index]);

    let mut okm = Zeroizing::new([0u8; OKM_SIZE]);
    hasher.finalize_xof().fill(&mut okm[..]);

    let mut key = LayerKey {
        aead_key: [0u8; KEY_SIZE],
        aead_nonce: [0u8; XNONCE_SIZE],
        header_key: [0u8; KEY_SIZE],
        header_nonce: [0u8; XNONCE_SIZE],
        fingerprint: [0u8; 32],
    };
    let mut at = 0;
    for field in [
        &mut key.aead_key[..],
        &mut key.aead_nonce[..],
        &mut key.header_key[..],
        &mut key.header_nonce[..],
        &mut key.fingerprint[..],
    ] {
        let len = field.len();
        field.copy_from_slice(&okm[at..at + len]);
        at += len;
    }
    key
}

/// Seal `data` in place, binding `aad`. Returns the detached tag.
pub fn encrypt_layer(key: &LayerKey, aad: &[u8], data: &mut [u8]) -> Result<[u8; TAG_SIZE], IntegrityError> {
    let cipher = XChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(&key.aead_key));
    let tag = cipher
        .encrypt_in_place_detached(chacha20poly1305::XNonce::from_slice(&key.aead_nonce), aad, data)
        .map_err(|_| IntegrityError::SealFailed)?;

    let mut out = [0u8; TAG_SIZE];
    out.copy_from_slice(&tag);
    Ok(out)
}

/// Open `data` in place.
///
/// Runs the same instructions whatever the tag: MAC over the ciphertext,
/// keystream over the whole buffer, constant-time compare. On mismatch the
/// buffer is wiped before returning.
pub fn decrypt_layer(
    key: &LayerKey,
    aad: &[u8],
    data: &mut [u8],
    tag: &[u8; TAG_SIZE],
) -> Result<(), IntegrityError> {
    let mut cipher = XChaCha20::new(
        chacha20::Key::from_slice(&key.aead_key),
        chacha20::XNonce::from_slice(&key.aead_nonce),
    );

    // First keystream block keys Poly1305, payload starts at block 1
    let mut mac_key = Zeroizing::new([0u8; KEY_SIZE]);
    cipher.apply_keystream(&mut mac_key[..]);
    let mut mac = Poly1305::new(poly1305::Key::from_slice(&mac_key[..]));
    cipher.seek(64u64);

    mac.update_padded(aad);
    mac.update_padded(data);
    let mut lengths = [0u8; 16];
    lengths[..8].copy_from_slice(&(aad.len() as u64).to_le_bytes());
    lengths[8..].copy_from_slice(&(data.len() as u64).to_le_bytes());
    mac.update_padded(&lengths);
    let expected = mac.finalize();

    cipher.apply_keystream(data);

    if bool::from(expected.as_slice().ct_eq(&tag[..])) {
        Ok(())
    } else {
        data.zeroize();
        Err(IntegrityError::TagMismatch)
    }
}
