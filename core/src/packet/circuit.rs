// Circuit building — fixed-length relay paths
//
// A circuit is an ordered list of hops: position 0 is the entry, the last
// position is the exit, everything in between is a middle relay. A node
// never appears twice. Relays are chosen per position with the VRF relay
// selector so picks are auditable.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use thiserror::Error;

use super::MAX_HOPS;
use crate::crypto::keys::hex_bytes;
use crate::crypto::{NodeId, NodeKeys};
use crate::vrf::{RelayCandidate, RelaySelector, Selection, VrfError};

/// Unique identifier for a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CircuitId(u64);

impl CircuitId {
    /// Generate a new random circuit ID
    pub fn random() -> Self {
        use rand::RngCore;
        CircuitId(rand::thread_rng().next_u64())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CircuitError {
    #[error("Circuit length {0} outside supported range")]
    InvalidLength(usize),
    #[error("Hop {position} has role {found}, expected {expected}")]
    RoleOrder { position: usize, expected: Role, found: Role },
    #[error("Node {0} appears more than once")]
    DuplicateNode(NodeId),
    #[error("Node id does not match public key for {0}")]
    KeyMismatch(NodeId),
    #[error("No eligible {0} relay")]
    InsufficientRelays(Role),
    #[error("Selection failed: {0}")]
    Selection(#[from] VrfError),
}

/// Position class of a mixnode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Entry,
    Middle,
    Exit,
}

impl Role {
    /// Reference listening port
    pub fn default_port(&self) -> u16 {
        match self {
            Role::Entry => 9001,
            Role::Middle => 9002,
            Role::Exit => 9003,
        }
    }

    /// Position in a three-hop circuit
    pub fn default_hop_index(&self) -> u8 {
        match self {
            Role::Entry => 0,
            Role::Middle => 1,
            Role::Exit => 2,
        }
    }

    /// Role expected at `position` in a circuit of `len` hops. A
    /// single-hop circuit's only relay is its exit.
    pub fn for_position(position: usize, len: usize) -> Self {
        if position + 1 == len {
            Role::Exit
        } else if position == 0 {
            Role::Entry
        } else {
            Role::Middle
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Entry => "entry",
            Role::Middle => "middle",
            Role::Exit => "exit",
        })
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "entry" => Ok(Role::Entry),
            "middle" => Ok(Role::Middle),
            "exit" => Ok(Role::Exit),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// Public description of one relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopDescriptor {
    pub node_id: NodeId,
    pub role: Role,
    pub address: SocketAddr,
    /// X25519 key used for layer encryption
    #[serde(with = "hex_bytes")]
    pub public_key: [u8; 32],
    /// Ed25519 key backing the relay's VRF proofs
    #[serde(with = "hex_bytes")]
    pub vrf_public_key: [u8; 32],
}

impl HopDescriptor {
    pub fn from_keys(keys: &NodeKeys, role: Role, address: SocketAddr) -> Self {
        Self {
            node_id: keys.node_id(),
            role,
            address,
            public_key: keys.mix_public_key(),
            vrf_public_key: keys.vrf_public_key(),
        }
    }
}

/// Validated, immutable path.
#[derive(Debug, Clone)]
pub struct Circuit {
    id: CircuitId,
    hops: Vec<HopDescriptor>,
}

impl Circuit {
    pub fn new(hops: Vec<HopDescriptor>) -> Result<Self, CircuitError> {
        if hops.is_empty() || hops.len() > MAX_HOPS {
            return Err(CircuitError::InvalidLength(hops.len()));
        }
        let mut seen = HashSet::new();
        for (position, hop) in hops.iter().enumerate() {
            let expected = Role::for_position(position, hops.len());
            if hop.role != expected {
                return Err(CircuitError::RoleOrder {
                    position,
                    expected,
                    found: hop.role,
                });
            }
            if NodeId::from_public_key(&hop.public_key) != hop.node_id {
                return Err(CircuitError::KeyMismatch(hop.node_id));
            }
            if !seen.insert(hop.node_id) {
                return Err(CircuitError::DuplicateNode(hop.node_id));
            }
        }
        Ok(Self {
            id: CircuitId::random(),
            hops,
        })
    }

    pub fn id(&self) -> CircuitId {
        self.id
    }

    pub fn hops(&self) -> &[HopDescriptor] {
        &self.hops
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn entry(&self) -> &HopDescriptor {
        &self.hops[0]
    }

    pub fn exit(&self) -> &HopDescriptor {
        &self.hops[self.hops.len() - 1]
    }
}

/// Configuration for circuit building
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Number of hops including entry and exit
    pub hops: usize,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self { hops: 3 }
    }
}

impl CircuitConfig {
    pub fn validate(&self) -> Result<(), CircuitError> {
        if self.hops == 0 || self.hops > MAX_HOPS {
            return Err(CircuitError::InvalidLength(self.hops));
        }
        Ok(())
    }
}

/// Picks one relay per position with the VRF selector.
pub struct CircuitBuilder {
    candidates: Vec<RelayCandidate>,
    config: CircuitConfig,
    selector: RelaySelector,
    last_selections: Vec<Selection>,
}

impl CircuitBuilder {
    pub fn new(
        candidates: Vec<RelayCandidate>,
        config: CircuitConfig,
        selector: RelaySelector,
    ) -> Result<Self, CircuitError> {
        config.validate()?;
        Ok(Self {
            candidates,
            config,
            selector,
            last_selections: Vec::new(),
        })
    }

    pub fn build(&mut self, epoch: u64) -> Result<Circuit, CircuitError> {
        let mut hops = Vec::with_capacity(self.config.hops);
        let mut selections = Vec::with_capacity(self.config.hops);
        let mut used = HashSet::new();

        for position in 0..self.config.hops {
            let role = Role::for_position(position, self.config.hops);
            let eligible: Vec<&RelayCandidate> = self
                .candidates
                .iter()
                .filter(|c| c.descriptor.role == role && !used.contains(&c.descriptor.node_id))
                .collect();

            let selection = self
                .selector
                .select(epoch, position as u8, &eligible)?
                .ok_or(CircuitError::InsufficientRelays(role))?;
            let chosen = eligible
                .iter()
                .find(|c| c.descriptor.node_id == selection.chosen)
                .ok_or(CircuitError::InsufficientRelays(role))?;

            used.insert(selection.chosen);
            hops.push(chosen.descriptor.clone());
            selections.push(selection);
        }

        let circuit = Circuit::new(hops)?;
        self.last_selections = selections;
        Ok(circuit)
    }

    /// Selections behind the most recent circuit, for auditing.
    pub fn last_selections(&self) -> &[Selection] {
        &self.last_selections
    }

    pub fn candidates(&self) -> &[RelayCandidate] {
        &self.candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vrf::selection::audit_selection;
    use crate::vrf::RelayTicket;
    use ed25519_dalek::SigningKey;

    fn hop(role: Role, port: u16) -> (NodeKeys, HopDescriptor) {
        let keys = NodeKeys::generate();
        let desc = HopDescriptor::from_keys(&keys, role, format!("127.0.0.1:{}", port).parse().unwrap());
        (keys, desc)
    }

    #[test]
    fn test_circuit_valid_three_hop() {
        let hops = vec![hop(Role::Entry, 1).1, hop(Role::Middle, 2).1, hop(Role::Exit, 3).1];
        let circuit = Circuit::new(hops).unwrap();
        assert_eq!(circuit.len(), 3);
        assert_eq!(circuit.entry().role, Role::Entry);
        assert_eq!(circuit.exit().role, Role::Exit);
    }

    #[test]
    fn test_circuit_rejects_bad_role_order() {
        let hops = vec![hop(Role::Middle, 1).1, hop(Role::Entry, 2).1, hop(Role::Exit, 3).1];
        assert!(matches!(Circuit::new(hops), Err(CircuitError::RoleOrder { position: 0, .. })));
    }

    #[test]
    fn test_circuit_rejects_duplicate() {
        let (keys, entry) = hop(Role::Entry, 1);
        let again = HopDescriptor::from_keys(&keys, Role::Middle, entry.address);
        let hops = vec![entry, again, hop(Role::Exit, 3).1];
        assert!(matches!(Circuit::new(hops), Err(CircuitError::DuplicateNode(_))));
    }

    #[test]
    fn test_single_hop_circuit_is_exit_only() {
        let circuit = Circuit::new(vec![hop(Role::Exit, 1).1]).unwrap();
        assert_eq!(circuit.len(), 1);
        assert_eq!(circuit.entry(), circuit.exit());
        assert!(matches!(
            Circuit::new(vec![hop(Role::Entry, 1).1]),
            Err(CircuitError::RoleOrder { position: 0, expected: Role::Exit, .. })
        ));
        assert_eq!(Role::for_position(0, 1), Role::Exit);
        assert_eq!(Role::for_position(0, 2), Role::Entry);
    }

    #[test]
    fn test_circuit_rejects_length() {
        assert!(matches!(Circuit::new(Vec::new()), Err(CircuitError::InvalidLength(0))));
        assert!(CircuitConfig { hops: 0 }.validate().is_err());
        assert!(CircuitConfig { hops: 1 }.validate().is_ok());
        let mut hops = vec![hop(Role::Entry, 1).1];
        for i in 0..MAX_HOPS {
            hops.push(hop(Role::Middle, 10 + i as u16).1);
        }
        hops.push(hop(Role::Exit, 99).1);
        assert!(matches!(Circuit::new(hops), Err(CircuitError::InvalidLength(_))));
    }

    #[test]
    fn test_circuit_rejects_key_mismatch() {
        let (_, entry) = hop(Role::Entry, 1);
        let (_, mut middle) = hop(Role::Middle, 2);
        middle.public_key = entry.public_key;
        let hops = vec![entry, middle, hop(Role::Exit, 3).1];
        assert!(matches!(Circuit::new(hops), Err(CircuitError::KeyMismatch(_))));
    }

    #[test]
    fn test_role_parse_and_defaults() {
        assert_eq!("Middle".parse::<Role>().unwrap(), Role::Middle);
        assert!("relay".parse::<Role>().is_err());
        assert_eq!(Role::Exit.default_port(), 9003);
        assert_eq!(Role::for_position(0, 3), Role::Entry);
        assert_eq!(Role::for_position(1, 3), Role::Middle);
        assert_eq!(Role::for_position(2, 3), Role::Exit);
    }

    #[test]
    fn test_builder_picks_one_per_role() {
        let epoch = 77;
        let mut candidates = Vec::new();
        for (i, role) in [Role::Entry, Role::Entry, Role::Middle, Role::Middle, Role::Exit]
            .into_iter()
            .enumerate()
        {
            let (keys, desc) = hop(role, 9000 + i as u16);
            candidates.push(RelayCandidate {
                descriptor: desc,
                ticket: Some(RelayTicket::issue(&keys, epoch).unwrap()),
            });
        }

        let selector = RelaySelector::new(SigningKey::from_bytes(&[5u8; 32]));
        let selector_pk = selector.public_key();
        let mut builder = CircuitBuilder::new(candidates, CircuitConfig::default(), selector).unwrap();
        let circuit = builder.build(epoch).unwrap();

        let roles: Vec<_> = circuit.hops().iter().map(|h| h.role).collect();
        assert_eq!(roles, vec![Role::Entry, Role::Middle, Role::Exit]);
        assert_eq!(builder.last_selections().len(), 3);
        for selection in builder.last_selections() {
            assert!(audit_selection(&selector_pk, selection));
        }
    }

    #[test]
    fn test_builder_insufficient_relays() {
        let (keys, desc) = hop(Role::Entry, 1);
        let candidates = vec![RelayCandidate {
            descriptor: desc,
            ticket: Some(RelayTicket::issue(&keys, 1).unwrap()),
        }];
        let selector = RelaySelector::new(SigningKey::from_bytes(&[6u8; 32]));
        let mut builder = CircuitBuilder::new(candidates, CircuitConfig::default(), selector).unwrap();
        assert!(matches!(
            builder.build(1),
            Err(CircuitError::InsufficientRelays(Role::Middle))
        ));
    }
}
