//! Agent configuration.
//!
//! Loaded from an optional TOML file and then overridden from the command
//! line. Every field has a default matching the reference sizing, so an empty
//! file (or no file at all) yields a usable configuration.
//!
//! ```toml
//! [ports]
//! standard_queues = 8
//! hairpin_queues = 1
//!
//! [flows]
//! rss_queues = [1, 3, 2, 4, 5, 7, 0, 6]
//! optional_stages = ["metering"]
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use offload_hal::mempool::DEFAULT_DATA_ROOM;
use offload_hal::PoolParams;
use offload_types::{QueueId, SocketId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flow::FlowStage;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Port and queue sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortsConfig {
    /// Maximum ports used; extra discovered ports are ignored.
    #[serde(default = "default_max_ports")]
    pub max_ports: usize,

    /// Queues serviced by the forwarding loop.
    #[serde(default = "default_standard_queues")]
    pub standard_queues: u16,

    /// Queues wired into hairpin loops.
    #[serde(default = "default_hairpin_queues")]
    pub hairpin_queues: u16,

    /// Descriptors per ring.
    #[serde(default = "default_ring_depth")]
    pub ring_depth: u16,
}

/// Shared buffer pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_name")]
    pub name: String,

    /// Number of buffers.
    #[serde(default = "default_pool_size")]
    pub size: usize,

    #[serde(default = "default_cache_size")]
    pub cache_size: u32,

    /// Payload capacity per buffer, headroom included.
    #[serde(default = "default_data_room")]
    pub data_room: u16,
}

/// Link-up polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    #[serde(default = "default_max_checks")]
    pub max_checks: u32,
}

/// Forwarding loop behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingConfig {
    /// Packets pulled per receive call.
    #[serde(default = "default_burst_size")]
    pub burst_size: usize,

    /// Consecutive retryable counter-query failures tolerated before the
    /// loop stops. Zero makes every failure fatal.
    #[serde(default)]
    pub counter_failure_budget: u32,
}

/// Flow installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowsConfig {
    /// Queue permutation handed to RSS-style rules.
    #[serde(default = "default_rss_queues")]
    pub rss_queues: Vec<QueueId>,

    /// Optional stages to install in addition to the default sequence.
    #[serde(default)]
    pub optional_stages: Vec<FlowStage>,
}

/// Complete agent configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub forwarding: ForwardingConfig,
    #[serde(default)]
    pub flows: FlowsConfig,
}

fn default_max_ports() -> usize {
    2
}

fn default_standard_queues() -> u16 {
    8
}

fn default_hairpin_queues() -> u16 {
    1
}

fn default_ring_depth() -> u16 {
    512
}

fn default_pool_name() -> String {
    "mbuf_pool".to_string()
}

fn default_pool_size() -> usize {
    40960
}

fn default_cache_size() -> u32 {
    128
}

fn default_data_room() -> u16 {
    DEFAULT_DATA_ROOM
}

fn default_check_interval_ms() -> u64 {
    100
}

fn default_max_checks() -> u32 {
    90
}

fn default_burst_size() -> usize {
    32
}

fn default_rss_queues() -> Vec<QueueId> {
    vec![1, 3, 2, 4, 5, 7, 0, 6]
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            max_ports: default_max_ports(),
            standard_queues: default_standard_queues(),
            hairpin_queues: default_hairpin_queues(),
            ring_depth: default_ring_depth(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: default_pool_name(),
            size: default_pool_size(),
            cache_size: default_cache_size(),
            data_room: default_data_room(),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval_ms(),
            max_checks: default_max_checks(),
        }
    }
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            burst_size: default_burst_size(),
            counter_failure_budget: 0,
        }
    }
}

impl Default for FlowsConfig {
    fn default() -> Self {
        Self {
            rss_queues: default_rss_queues(),
            optional_stages: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Loads configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                message,
            },
            other => other,
        })
    }

    /// Parses configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: "<inline>".to_string(),
            message: e.to_string(),
        })
    }

    /// Returns the interval between link-status checks.
    pub fn link_check_interval(&self) -> Duration {
        Duration::from_millis(self.link.check_interval_ms)
    }

    /// Total queues per direction on every port.
    pub fn total_queues(&self) -> u16 {
        self.ports
            .standard_queues
            .saturating_add(self.ports.hairpin_queues)
    }

    /// Returns true if an optional stage has been switched on.
    pub fn stage_enabled(&self, stage: FlowStage) -> bool {
        !stage.is_optional() || self.flows.optional_stages.contains(&stage)
    }

    /// Builds pool creation parameters for the given NUMA socket.
    pub fn pool_params(&self, socket: SocketId) -> PoolParams {
        PoolParams {
            name: self.pool.name.clone(),
            count: self.pool.size,
            cache_size: self.pool.cache_size,
            priv_size: 0,
            data_room: self.pool.data_room,
            socket,
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ports = &self.ports;
        if !(1..=2).contains(&ports.max_ports) {
            return Err(ConfigError::Invalid(format!(
                "max_ports must be 1 or 2, got {}",
                ports.max_ports
            )));
        }
        if ports.standard_queues == 0 {
            return Err(ConfigError::Invalid(
                "standard_queues must be at least 1".to_string(),
            ));
        }
        if ports.hairpin_queues == 0 {
            return Err(ConfigError::Invalid(
                "hairpin_queues must be at least 1".to_string(),
            ));
        }
        if ports.standard_queues.checked_add(ports.hairpin_queues).is_none() {
            return Err(ConfigError::Invalid("queue count overflows".to_string()));
        }
        if ports.ring_depth == 0 {
            return Err(ConfigError::Invalid("ring_depth cannot be 0".to_string()));
        }
        if self.forwarding.burst_size == 0 {
            return Err(ConfigError::Invalid("burst_size cannot be 0".to_string()));
        }
        if self.pool.data_room == 0 {
            return Err(ConfigError::Invalid("data_room cannot be 0".to_string()));
        }

        // Every standard rx ring on every port is backed by the pool.
        let rings = usize::from(ports.ring_depth)
            * usize::from(ports.standard_queues)
            * ports.max_ports;
        if self.pool.size < rings {
            return Err(ConfigError::Invalid(format!(
                "pool of {} buffers cannot back {} ring descriptors",
                self.pool.size, rings
            )));
        }

        let rss = &self.flows.rss_queues;
        if rss.is_empty() {
            return Err(ConfigError::Invalid("rss_queues cannot be empty".to_string()));
        }
        if let Some(q) = rss.iter().find(|q| **q >= ports.standard_queues) {
            return Err(ConfigError::Invalid(format!(
                "rss queue {} outside standard range 0..{}",
                q, ports.standard_queues
            )));
        }
        let distinct: BTreeSet<_> = rss.iter().collect();
        if distinct.len() != rss.len() {
            return Err(ConfigError::Invalid(
                "rss_queues contains duplicates".to_string(),
            ));
        }

        if let Some(stage) = self.flows.optional_stages.iter().find(|s| !s.is_optional()) {
            return Err(ConfigError::Invalid(format!(
                "{} is not an optional stage",
                stage
            )));
        }

        Ok(())
    }
}
