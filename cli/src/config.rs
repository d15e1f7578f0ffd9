// Files the CLI reads and writes
//
// - key file: hex-encoded node secret (mix key || VRF seed), owner-only
// - node config: JSON form of NodeConfig, falls back to BETANET_* env vars
// - topology: epoch length, circuit length, and relay candidates with tickets

use anyhow::{Context, Result};
use betanet_core::packet::{CircuitBuilder, CircuitConfig};
use betanet_core::vrf::{EpochSchedule, RelayCandidate, RelaySelector, Selection};
use betanet_core::{Circuit, NodeConfig, NodeKeys};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub fn load_keys(path: &Path) -> Result<NodeKeys> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read key file {}", path.display()))?;
    NodeKeys::from_hex(&contents).context("Key file does not hold a valid node secret")
}

pub fn save_keys(path: &Path, keys: &NodeKeys) -> Result<()> {
    if path.exists() {
        anyhow::bail!("Refusing to overwrite existing key file {}", path.display());
    }
    std::fs::write(path, keys.to_hex().as_bytes())
        .with_context(|| format!("Failed to write key file {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .context("Failed to restrict key file permissions")?;
    }
    Ok(())
}

/// Config file when given, otherwise the environment.
pub fn load_node_config(path: Option<&Path>) -> Result<NodeConfig> {
    let config = match path {
        Some(path) => NodeConfig::load(path)
            .with_context(|| format!("Failed to load node config {}", path.display()))?,
        None => NodeConfig::from_env().context("Invalid BETANET_* environment")?,
    };
    config.validate().context("Node config rejected")?;
    Ok(config)
}

fn default_epoch_secs() -> u64 {
    3600
}

fn default_hops() -> usize {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default = "default_epoch_secs")]
    pub epoch_secs: u64,
    #[serde(default = "default_hops")]
    pub hops: usize,
    pub relays: Vec<RelayCandidate>,
}

impl Topology {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read topology {}", path.display()))?;
        serde_json::from_str(&contents).context("Failed to parse topology file")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize topology")?;
        std::fs::write(path, contents).context("Failed to write topology file")?;
        Ok(())
    }

    pub fn current_epoch(&self) -> u64 {
        EpochSchedule::new(Duration::from_secs(self.epoch_secs.max(1))).current_epoch()
    }

    /// VRF-select a circuit for `epoch` using `selector_keys`.
    pub fn build_circuit(&self, selector_keys: &NodeKeys, epoch: u64) -> Result<(Circuit, Vec<Selection>)> {
        let selector = RelaySelector::new(selector_keys.vrf_signing_key().clone());
        let mut builder = CircuitBuilder::new(self.relays.clone(), CircuitConfig { hops: self.hops }, selector)
            .context("Invalid circuit length in topology")?;
        let circuit = builder
            .build(epoch)
            .with_context(|| format!("Could not build a circuit for epoch {}", epoch))?;
        Ok((circuit, builder.last_selections().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use betanet_core::packet::HopDescriptor;
    use betanet_core::vrf::RelayTicket;
    use betanet_core::Role;
    use tempfile::tempdir;

    fn topology(epoch: u64) -> Topology {
        let relays = [Role::Entry, Role::Middle, Role::Exit]
            .into_iter()
            .enumerate()
            .map(|(i, role)| {
                let keys = NodeKeys::generate();
                RelayCandidate {
                    descriptor: HopDescriptor::from_keys(
                        &keys,
                        role,
                        format!("127.0.0.1:{}", 9001 + i).parse().unwrap(),
                    ),
                    ticket: Some(RelayTicket::issue(&keys, epoch).unwrap()),
                }
            })
            .collect();
        Topology {
            epoch_secs: 3600,
            hops: 3,
            relays,
        }
    }

    #[test]
    fn test_key_file_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.key");
        let keys = NodeKeys::generate();
        save_keys(&path, &keys).unwrap();
        assert_eq!(load_keys(&path).unwrap().node_id(), keys.node_id());
        assert!(save_keys(&path, &keys).is_err());
    }

    #[test]
    fn test_bad_key_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.key");
        std::fs::write(&path, "not hex").unwrap();
        assert!(load_keys(&path).is_err());
    }

    #[test]
    fn test_topology_builds_circuit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("topology.json");
        topology(5).save(&path).unwrap();

        let loaded = Topology::load(&path).unwrap();
        let (circuit, selections) = loaded.build_circuit(&NodeKeys::generate(), 5).unwrap();
        assert_eq!(circuit.len(), 3);
        assert_eq!(selections.len(), 3);
        assert_eq!(circuit.entry().role, Role::Entry);
    }

    #[test]
    fn test_stale_tickets_fail() {
        let topo = topology(5);
        assert!(topo.build_circuit(&NodeKeys::generate(), 6).is_err());
    }

    #[test]
    fn test_node_config_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.json");
        let mut config = NodeConfig::for_role(Role::Exit);
        config.workers = 2;
        config.save(&path).unwrap();
        let loaded = load_node_config(Some(&path)).unwrap();
        assert_eq!(loaded.workers, 2);
        assert_eq!(loaded.port, 9003);
    }
}
