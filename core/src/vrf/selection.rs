// Relay selection — epoch tickets and auditable VRF picks
//
// Each epoch, a relay publishes a ticket: a VRF proof over the epoch seed
// and its own node id. A selector only considers candidates whose ticket
// verifies; a candidate whose ticket fails is excluded for the rest of that
// epoch. The pick itself is the selector's VRF output over the epoch seed
// and the sorted candidate set, so a third party holding the selector's
// public key can replay it with `audit_selection`.

use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use super::{generate, verify, verify_proof, VrfError, VrfOutput, VrfProof};
use crate::crypto::{NodeId, NodeKeys};
use crate::packet::HopDescriptor;

const EPOCH_SEED_CONTEXT: &str = "betanet mixnet epoch seed 2026-01-12";

/// Public randomness shared by every node for one epoch.
pub fn epoch_seed(epoch: u64) -> [u8; 32] {
    blake3::derive_key(EPOCH_SEED_CONTEXT, &epoch.to_be_bytes())
}

/// Maps wall-clock time onto epoch numbers.
#[derive(Debug, Clone, Copy)]
pub struct EpochSchedule {
    length: Duration,
}

impl EpochSchedule {
    pub fn new(length: Duration) -> Self {
        Self {
            length: length.max(Duration::from_secs(1)),
        }
    }

    pub fn epoch_at(&self, at: SystemTime) -> u64 {
        let since = at.duration_since(UNIX_EPOCH).unwrap_or_default();
        since.as_secs() / self.length.as_secs()
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch_at(SystemTime::now())
    }

    pub fn length(&self) -> Duration {
        self.length
    }
}

fn ticket_seed(epoch: u64, node_id: &NodeId) -> Vec<u8> {
    let mut seed = Vec::with_capacity(64);
    seed.extend_from_slice(&epoch_seed(epoch));
    seed.extend_from_slice(node_id.as_bytes());
    seed
}

/// A relay's proof of participation in one epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayTicket {
    pub epoch: u64,
    pub output: VrfOutput,
    pub proof: VrfProof,
}

impl RelayTicket {
    pub fn issue(keys: &NodeKeys, epoch: u64) -> Result<Self, VrfError> {
        let (output, proof) = generate(keys.vrf_signing_key(), &ticket_seed(epoch, &keys.node_id()))?;
        Ok(Self { epoch, output, proof })
    }

    pub fn verify(&self, descriptor: &HopDescriptor, epoch: u64) -> bool {
        self.epoch == epoch
            && verify(
                &descriptor.vrf_public_key,
                &ticket_seed(epoch, &descriptor.node_id),
                &self.output,
                &self.proof,
            )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayCandidate {
    pub descriptor: HopDescriptor,
    #[serde(default)]
    pub ticket: Option<RelayTicket>,
}

/// Everything needed to replay one selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Selection {
    pub epoch: u64,
    pub position: u8,
    /// Verified candidates in the order the index refers to
    pub candidates: Vec<NodeId>,
    pub chosen: NodeId,
    pub output: VrfOutput,
    pub proof: VrfProof,
}

fn selection_seed(epoch: u64, position: u8, candidates: &[NodeId]) -> Vec<u8> {
    let mut seed = Vec::with_capacity(33 + candidates.len() * 32);
    seed.extend_from_slice(&epoch_seed(epoch));
    seed.push(position);
    for id in candidates {
        seed.extend_from_slice(id.as_bytes());
    }
    seed
}

/// Client-side relay picker holding the selector's VRF key.
pub struct RelaySelector {
    key: SigningKey,
    excluded: HashMap<u64, HashSet<NodeId>>,
}

impl RelaySelector {
    pub fn new(key: SigningKey) -> Self {
        Self {
            key,
            excluded: HashMap::new(),
        }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }

    pub fn is_excluded(&self, epoch: u64, node_id: &NodeId) -> bool {
        self.excluded
            .get(&epoch)
            .map(|set| set.contains(node_id))
            .unwrap_or(false)
    }

    fn exclude(&mut self, epoch: u64, node_id: NodeId) {
        // Exclusions only matter for the current and previous epoch
        self.excluded.retain(|e, _| e.saturating_add(1) >= epoch);
        self.excluded.entry(epoch).or_default().insert(node_id);
    }

    /// Pick one of `candidates` for `position`.
    ///
    /// Returns `Ok(None)` when no candidate has a valid ticket.
    pub fn select(
        &mut self,
        epoch: u64,
        position: u8,
        candidates: &[&RelayCandidate],
    ) -> Result<Option<Selection>, VrfError> {
        let mut valid: Vec<NodeId> = Vec::new();
        for candidate in candidates {
            let id = candidate.descriptor.node_id;
            if self.is_excluded(epoch, &id) {
                continue;
            }
            let ok = candidate
                .ticket
                .as_ref()
                .map(|t| t.verify(&candidate.descriptor, epoch))
                .unwrap_or(false);
            if ok {
                valid.push(id);
            } else {
                warn!("Relay {} failed ticket verification for epoch {}, excluding", id, epoch);
                self.exclude(epoch, id);
            }
        }

        if valid.is_empty() {
            return Ok(None);
        }
        valid.sort();
        valid.dedup();

        let (output, proof) = generate(&self.key, &selection_seed(epoch, position, &valid))?;
        let chosen = valid[(output.as_u64() % valid.len() as u64) as usize];
        debug!(
            "Selected relay {} for position {} among {} candidates",
            chosen,
            position,
            valid.len()
        );

        Ok(Some(Selection {
            epoch,
            position,
            candidates: valid,
            chosen,
            output,
            proof,
        }))
    }
}

/// Re-derive a selection from the selector's public key.
pub fn audit_selection(selector_public_key: &[u8; 32], selection: &Selection) -> bool {
    if selection.candidates.is_empty() {
        return false;
    }
    let seed = selection_seed(selection.epoch, selection.position, &selection.candidates);
    match verify_proof(selector_public_key, &seed, &selection.proof) {
        Ok(output) if output == selection.output => {
            let idx = (output.as_u64() % selection.candidates.len() as u64) as usize;
            selection.candidates[idx] == selection.chosen
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Role;

    fn relay(port: u16) -> (NodeKeys, HopDescriptor) {
        let keys = NodeKeys::generate();
        let desc = HopDescriptor::from_keys(&keys, Role::Middle, format!("127.0.0.1:{}", port).parse().unwrap());
        (keys, desc)
    }

    fn candidate(keys: &NodeKeys, desc: HopDescriptor, epoch: u64) -> RelayCandidate {
        RelayCandidate {
            descriptor: desc,
            ticket: Some(RelayTicket::issue(keys, epoch).unwrap()),
        }
    }

    #[test]
    fn test_epoch_seed_changes_per_epoch() {
        assert_eq!(epoch_seed(7), epoch_seed(7));
        assert_ne!(epoch_seed(7), epoch_seed(8));
    }

    #[test]
    fn test_epoch_schedule() {
        let schedule = EpochSchedule::new(Duration::from_secs(3600));
        let at = UNIX_EPOCH + Duration::from_secs(3600 * 5 + 12);
        assert_eq!(schedule.epoch_at(at), 5);
    }

    #[test]
    fn test_ticket_verifies_only_for_its_epoch() {
        let (keys, desc) = relay(9002);
        let ticket = RelayTicket::issue(&keys, 10).unwrap();
        assert!(ticket.verify(&desc, 10));
        assert!(!ticket.verify(&desc, 11));
    }

    #[test]
    fn test_select_is_deterministic_and_auditable() {
        let epoch = 3;
        let relays: Vec<_> = (0..4).map(|i| relay(9100 + i)).collect();
        let cands: Vec<_> = relays.iter().map(|(k, d)| candidate(k, d.clone(), epoch)).collect();
        let refs: Vec<_> = cands.iter().collect();

        let key = SigningKey::from_bytes(&[42u8; 32]);
        let mut a = RelaySelector::new(key.clone());
        let mut b = RelaySelector::new(key);
        let sa = a.select(epoch, 1, &refs).unwrap().unwrap();
        let sb = b.select(epoch, 1, &refs).unwrap().unwrap();
        assert_eq!(sa.chosen, sb.chosen);
        assert!(audit_selection(&a.public_key(), &sa));

        let mut forged = sa.clone();
        forged.chosen = *forged.candidates.iter().find(|id| **id != sa.chosen).unwrap();
        assert!(!audit_selection(&a.public_key(), &forged));
    }

    #[test]
    fn test_bad_ticket_excluded_for_epoch() {
        let epoch = 9;
        let (good_keys, good_desc) = relay(9201);
        let (bad_keys, bad_desc) = relay(9202);
        let good = candidate(&good_keys, good_desc, epoch);
        // Ticket from the wrong epoch
        let bad = candidate(&bad_keys, bad_desc.clone(), epoch - 1);

        let mut selector = RelaySelector::new(SigningKey::from_bytes(&[1u8; 32]));
        let picked = selector.select(epoch, 1, &[&good, &bad]).unwrap().unwrap();
        assert_eq!(picked.chosen, good.descriptor.node_id);
        assert_eq!(picked.candidates.len(), 1);
        assert!(selector.is_excluded(epoch, &bad_desc.node_id));

        // Even a fixed ticket stays excluded until the epoch turns
        let fixed = candidate(&bad_keys, bad_desc.clone(), epoch);
        assert!(selector.select(epoch, 1, &[&fixed]).unwrap().is_none());
        assert!(selector.select(epoch + 1, 1, &[&candidate(&bad_keys, bad_desc, epoch + 1)]).unwrap().is_some());
    }

    #[test]
    fn test_missing_ticket_yields_none() {
        let (_, desc) = relay(9301);
        let cand = RelayCandidate { descriptor: desc, ticket: None };
        let mut selector = RelaySelector::new(SigningKey::from_bytes(&[2u8; 32]));
        assert!(selector.select(1, 1, &[&cand]).unwrap().is_none());
    }
}
