// Node key material
//
// Every mixnode holds two long-lived secrets: an X25519 key used to unwrap
// packet layers and an Ed25519 key that backs its VRF proofs. Both are read
// only after startup.

use ed25519_dalek::SigningKey;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use super::CryptoError;

/// Length of an exported secret: 32 bytes X25519 followed by a 32 byte Ed25519 seed.
pub const SECRET_EXPORT_LEN: usize = 64;

/// Stable node identifier: BLAKE3 hash of the node's X25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(*blake3::hash(public_key).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidKey)?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self(arr))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        hex_bytes::serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        hex_bytes::deserialize(deserializer).map(Self)
    }
}

/// Serde adapter writing fixed-size byte arrays as hex strings.
pub mod hex_bytes {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(bytes: &[u8; N], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| D::Error::custom(format!("expected {} bytes", N)))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex()[..16])
    }
}

/// Long-lived secrets of one mixnode.
#[derive(Clone)]
pub struct NodeKeys {
    mix_secret: StaticSecret,
    vrf_key: SigningKey,
}

impl NodeKeys {
    /// Generate fresh keys from the OS RNG
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; SECRET_EXPORT_LEN]);
        rand::rngs::OsRng.fill_bytes(&mut bytes[..]);
        Self::from_secret_bytes(&bytes)
    }

    pub fn from_secret_bytes(bytes: &[u8; SECRET_EXPORT_LEN]) -> Self {
        let mut mix = [0u8; 32];
        let mut seed = [0u8; 32];
        mix.copy_from_slice(&bytes[..32]);
        seed.copy_from_slice(&bytes[32..]);

        let keys = Self {
            mix_secret: StaticSecret::from(mix),
            vrf_key: SigningKey::from_bytes(&seed),
        };
        mix.zeroize();
        seed.zeroize();
        keys
    }

    pub fn to_secret_bytes(&self) -> Zeroizing<[u8; SECRET_EXPORT_LEN]> {
        let mut out = Zeroizing::new([0u8; SECRET_EXPORT_LEN]);
        out[..32].copy_from_slice(self.mix_secret.as_bytes());
        out[32..].copy_from_slice(self.vrf_key.as_bytes());
        out
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let decoded = Zeroizing::new(hex::decode(s.trim()).map_err(|_| CryptoError::InvalidKey)?);
        if decoded.len() != SECRET_EXPORT_LEN {
            return Err(CryptoError::InvalidKey);
        }
        let mut bytes = Zeroizing::new([0u8; SECRET_EXPORT_LEN]);
        bytes.copy_from_slice(&decoded);
        Ok(Self::from_secret_bytes(&bytes))
    }

    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(&self.to_secret_bytes()[..]))
    }

    /// X25519 public key peers use to build layers for this node
    pub fn mix_public_key(&self) -> [u8; 32] {
        PublicKey::from(&self.mix_secret).to_bytes()
    }

    pub fn vrf_public_key(&self) -> [u8; 32] {
        self.vrf_key.verifying_key().to_bytes()
    }

    pub fn vrf_signing_key(&self) -> &SigningKey {
        &self.vrf_key
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_public_key(&self.mix_public_key())
    }

    /// Bind the mix secret to this node's fixed position in the circuit.
    pub fn layer_secret(&self, hop_index: u8) -> NodeSecret {
        NodeSecret {
            secret: self.mix_secret.clone(),
            hop_index,
        }
    }
}

impl fmt::Debug for NodeKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeKeys")
            .field("node_id", &self.node_id())
            .finish_non_exhaustive()
    }
}

/// The private key a hop uses to peel one layer.
#[derive(Clone)]
pub struct NodeSecret {
    secret: StaticSecret,
    hop_index: u8,
}

impl NodeSecret {
    pub fn hop_index(&self) -> u8 {
        self.hop_index
    }

    pub fn public_key(&self) -> [u8; 32] {
        PublicKey::from(&self.secret).to_bytes()
    }

    /// ECDH with a packet's ephemeral key. Rejects low-order points.
    pub fn shared_secret(&self, alpha: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*alpha));
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidKey);
        }
        Ok(Zeroizing::new(shared.to_bytes()))
    }
}
