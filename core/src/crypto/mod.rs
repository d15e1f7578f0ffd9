// Cryptography module — node keys and per-layer sealing

pub mod keys;
pub mod layer;

pub use keys::{NodeId, NodeKeys, NodeSecret};
pub use layer::{decrypt_layer, derive_layer_key, encrypt_layer, LayerKey, TAG_SIZE};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid key material")]
    InvalidKey,
}

/// Authentication failure on a sealed layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("Authentication tag mismatch")]
    TagMismatch,
    #[error("Failed to seal layer")]
    SealFailed,
}
