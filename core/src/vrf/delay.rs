// Mixing delay — VRF-derived forwarding delays
//
// Each forwarded packet waits for a delay drawn from the node's VRF output
// over (epoch seed, packet ephemeral key). The draw is reproducible and
// provable, so a node cannot quietly bias delays to leak timing.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{generate, VrfError, VrfOutput, VrfProof};
use ed25519_dalek::SigningKey;

/// Distribution type for mixing delays
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DelayDistribution {
    /// Uniform over [min, max]
    Uniform,
    /// Exponential with the given mean, clamped to [min, max]
    Exponential { mean_ms: u32 },
}

/// Forwarding delay policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayPolicy {
    pub min_delay_ms: u32,
    pub max_delay_ms: u32,
    pub distribution: DelayDistribution,
}

impl Default for DelayPolicy {
    fn default() -> Self {
        Self {
            min_delay_ms: 0,
            max_delay_ms: 50,
            distribution: DelayDistribution::Exponential { mean_ms: 10 },
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DelayError {
    #[error("Invalid delay policy: {0}")]
    InvalidPolicy(String),
}

impl DelayPolicy {
    /// Validate delay policy
    pub fn validate(&self) -> Result<(), DelayError> {
        if self.min_delay_ms > self.max_delay_ms {
            return Err(DelayError::InvalidPolicy(
                "min_delay_ms must not exceed max_delay_ms".to_string(),
            ));
        }
        if let DelayDistribution::Exponential { mean_ms } = self.distribution {
            if mean_ms == 0 {
                return Err(DelayError::InvalidPolicy("mean_ms must be greater than 0".to_string()));
            }
        }
        Ok(())
    }

    /// Map a VRF output onto a delay within [min_delay_ms, max_delay_ms].
    pub fn delay_from_output(&self, output: &VrfOutput) -> Duration {
        let u = output.as_unit_f64();
        let span = (self.max_delay_ms - self.min_delay_ms) as f64;
        let offset_ms = match self.distribution {
            DelayDistribution::Uniform => (u * (span + 1.0)).floor(),
            DelayDistribution::Exponential { mean_ms } => -(mean_ms as f64) * (1.0 - u).ln(),
        };
        let clamped = offset_ms.clamp(0.0, span) as u64;
        Duration::from_millis(self.min_delay_ms as u64 + clamped)
    }
}

/// A delay along with the proof that produced it.
#[derive(Debug, Clone)]
pub struct ScheduledDelay {
    pub delay: Duration,
    pub output: VrfOutput,
    pub proof: VrfProof,
}

/// Per-node delay generator.
pub struct DelayScheduler {
    key: SigningKey,
    policy: DelayPolicy,
}

impl DelayScheduler {
    pub fn new(key: SigningKey, policy: DelayPolicy) -> Result<Self, DelayError> {
        policy.validate()?;
        Ok(Self { key, policy })
    }

    pub fn policy(&self) -> &DelayPolicy {
        &self.policy
    }

    pub fn seed(epoch_seed: &[u8; 32], packet_alpha: &[u8; 32]) -> [u8; 64] {
        let mut seed = [0u8; 64];
        seed[..32].copy_from_slice(epoch_seed);
        seed[32..].copy_from_slice(packet_alpha);
        seed
    }

    pub fn schedule(&self, epoch_seed: &[u8; 32], packet_alpha: &[u8; 32]) -> Result<ScheduledDelay, VrfError> {
        let (output, proof) = generate(&self.key, &Self::seed(epoch_seed, packet_alpha))?;
        Ok(ScheduledDelay {
            delay: self.policy.delay_from_output(&output),
            output,
            proof,
        })
    }
}
