// Node configuration
//
// Every knob has a default and a BETANET_* environment variable. The
// same struct round-trips through JSON so a node can also be started from
// a config file. `validate()` runs before anything binds a socket.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::mixnode::MixnodeSettings;
use crate::packet::{Role, MAX_HOPS};
use crate::pipeline::PipelineConfig;
use crate::transport::LinkConfig;
use crate::vrf::{DelayDistribution, DelayPolicy};

pub const ENV_PREFIX: &str = "BETANET_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
    #[error("Invalid configuration: {0}")]
    Validation(String),
    #[error("Config file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config file malformed: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub log_level: String,
    pub workers: usize,
    pub batch_size: usize,
    pub batch_window_ms: u64,
    pub pool_size: usize,
    pub max_queue_depth: usize,
    /// Packets per second; a backlogged node processing fewer logs a
    /// warning and reports it under `GET /metrics`
    pub target_throughput: u64,
    pub role: Role,
    pub bind_host: IpAddr,
    pub port: u16,
    pub hop_index: u8,
    pub max_processing_latency_ms: u64,
    pub delay: DelayPolicy,
    pub connect_retries: u32,
    pub reconnect_backoff_ms: u64,
    pub unreachable_holdoff_ms: u64,
    pub epoch_secs: u64,
    pub replay_capacity: usize,
    pub health_port: u16,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::for_role(Role::Entry)
    }
}

impl NodeConfig {
    /// Defaults for `role`: reference port and circuit position follow it.
    pub fn for_role(role: Role) -> Self {
        let port = role.default_port();
        Self {
            log_level: "info".to_string(),
            workers: 8,
            batch_size: 256,
            batch_window_ms: 2,
            pool_size: 1024,
            max_queue_depth: 4096,
            target_throughput: 25_000,
            role,
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port,
            hop_index: role.default_hop_index(),
            max_processing_latency_ms: 1000,
            delay: DelayPolicy::default(),
            connect_retries: 3,
            reconnect_backoff_ms: 50,
            unreachable_holdoff_ms: 5000,
            epoch_secs: 3600,
            replay_capacity: 1 << 16,
            health_port: port.saturating_add(1000),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (environment, test map, ...).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        let role: Role = parse(&get, "ROLE", Role::Entry)?;
        let mut config = Self::for_role(role);

        if let Some(level) = get("LOG_LEVEL") {
            config.log_level = level;
        }
        config.workers = parse(&get, "WORKERS", config.workers)?;
        config.batch_size = parse(&get, "BATCH_SIZE", config.batch_size)?;
        config.batch_window_ms = parse(&get, "BATCH_WINDOW_MS", config.batch_window_ms)?;
        config.pool_size = parse(&get, "POOL_SIZE", config.pool_size)?;
        config.max_queue_depth = parse(&get, "MAX_QUEUE_DEPTH", config.max_queue_depth)?;
        config.target_throughput = parse(&get, "TARGET_THROUGHPUT", config.target_throughput)?;
        config.bind_host = parse(&get, "BIND_HOST", config.bind_host)?;
        config.port = parse(&get, "PORT", config.port)?;
        config.hop_index = parse(&get, "HOP_INDEX", config.hop_index)?;
        config.max_processing_latency_ms =
            parse(&get, "MAX_PROCESSING_LATENCY_MS", config.max_processing_latency_ms)?;
        config.connect_retries = parse(&get, "CONNECT_RETRIES", config.connect_retries)?;
        config.reconnect_backoff_ms = parse(&get, "RECONNECT_BACKOFF_MS", config.reconnect_backoff_ms)?;
        config.unreachable_holdoff_ms = parse(&get, "UNREACHABLE_HOLDOFF_MS", config.unreachable_holdoff_ms)?;
        config.epoch_secs = parse(&get, "EPOCH_SECS", config.epoch_secs)?;
        config.replay_capacity = parse(&get, "REPLAY_CAPACITY", config.replay_capacity)?;
        config.health_port = parse(&get, "HEALTH_PORT", config.port.saturating_add(1000))?;

        config.delay.min_delay_ms = parse(&get, "MIN_DELAY_MS", config.delay.min_delay_ms)?;
        config.delay.max_delay_ms = parse(&get, "MAX_DELAY_MS", config.delay.max_delay_ms)?;
        let mean_ms = parse(&get, "DELAY_MEAN_MS", 10u32)?;
        config.delay.distribution = match get("DELAY_DISTRIBUTION").as_deref() {
            None | Some("exponential") => DelayDistribution::Exponential { mean_ms },
            Some("uniform") => DelayDistribution::Uniform,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: format!("{}DELAY_DISTRIBUTION", ENV_PREFIX),
                    value: other.to_string(),
                    reason: "expected 'uniform' or 'exponential'".to_string(),
                })
            }
        };

        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Validation(msg.to_string()));

        if self.workers == 0 {
            return invalid("workers must be at least 1");
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be at least 1");
        }
        if self.pool_size == 0 {
            return invalid("pool_size must be at least 1");
        }
        if self.max_queue_depth == 0 {
            return invalid("max_queue_depth must be at least 1");
        }
        if self.hop_index as usize >= MAX_HOPS {
            return invalid("hop_index must be below the maximum circuit length");
        }
        if self.epoch_secs == 0 {
            return invalid("epoch_secs must be at least 1");
        }
        if self.health_port != 0 && self.health_port == self.port {
            return invalid("health_port must differ from port");
        }
        self.delay
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        if self.delay.max_delay_ms as u64 >= self.max_processing_latency_ms {
            return invalid("max_delay_ms must be below max_processing_latency_ms");
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_host, self.port)
    }

    pub fn health_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_host, self.health_port)
    }

    pub fn mixnode_settings(&self) -> MixnodeSettings {
        MixnodeSettings {
            role: self.role,
            hop_index: self.hop_index,
            delay_policy: self.delay.clone(),
            epoch_length: Duration::from_secs(self.epoch_secs),
            replay_capacity: self.replay_capacity,
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            workers: self.workers,
            batch_size: self.batch_size,
            batch_window: Duration::from_millis(self.batch_window_ms),
            max_queue_depth: self.max_queue_depth,
            max_processing_latency: Duration::from_millis(self.max_processing_latency_ms),
        }
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            connect_retries: self.connect_retries,
            reconnect_backoff: Duration::from_millis(self.reconnect_backoff_ms),
            unreachable_holdoff: Duration::from_millis(self.unreachable_holdoff_ms),
            ..LinkConfig::default()
        }
    }
}

fn parse<T, G>(get: &G, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: format!("{}{}", ENV_PREFIX, name),
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}
