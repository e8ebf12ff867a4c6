//! # Node Configuration
//!
//! All tunables of a mesh node in one struct, validated once at startup.
//! An invalid parameter is fatal: the binary reports it and exits non-zero
//! before any component spawns.

use std::path::PathBuf;
use std::time::Duration;

use crate::balancer::Strategy;
use crate::consensus::ConsensusConfig;
use crate::failover::FailoverConfig;
use crate::flood::FloodingConfig;
use crate::gossip::GossipConfig;
use crate::transport::AdapterKind;

/// Node configuration. `Default` carries the documented defaults; the CLI
/// overlays operator flags on top.
#[derive(Clone, Debug)]
pub struct Config {
    pub adapter: AdapterKind,
    pub port: u16,
    /// Data directory; `None` resolves to `~/.meshweave`.
    pub data_dir: Option<PathBuf>,
    pub quorum_size: usize,
    pub gossip_fanout: usize,
    pub gossip_interval: Duration,
    pub gossip_max_rounds: u32,
    /// Dedup retention window of the flooding protocol.
    pub flood_ttl: Duration,
    pub flood_max_hops: u32,
    pub retry_interval: Duration,
    pub retry_max: u32,
    /// Channel bootstrap secret; `None` loads or creates `session.key` in
    /// the data directory.
    pub session_bootstrap_key: Option<[u8; 32]>,
    pub advertise_interval: Duration,
    pub health_check_interval: Duration,
    pub consensus_timeout: Duration,
    pub balancer_strategy: Strategy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            adapter: AdapterKind::Emulated,
            port: 5680,
            data_dir: None,
            quorum_size: 3,
            gossip_fanout: crate::gossip::DEFAULT_FANOUT,
            gossip_interval: crate::gossip::DEFAULT_GOSSIP_INTERVAL,
            gossip_max_rounds: crate::gossip::DEFAULT_MAX_ROUNDS,
            flood_ttl: crate::flood::DEFAULT_FLOOD_TTL,
            flood_max_hops: crate::flood::DEFAULT_MAX_HOPS,
            retry_interval: crate::failover::DEFAULT_RETRY_INTERVAL,
            retry_max: crate::failover::DEFAULT_MAX_RETRIES,
            session_bootstrap_key: None,
            advertise_interval: crate::discovery::DEFAULT_ADVERTISE_INTERVAL,
            health_check_interval: Duration::from_secs(30),
            consensus_timeout: crate::consensus::DEFAULT_CONSENSUS_TIMEOUT,
            balancer_strategy: Strategy::RoundRobin,
        }
    }
}

impl Config {
    /// Validate startup parameters. Any violation is fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.quorum_size == 0 {
            return Err(ConfigError::new("quorum_size must be at least 1"));
        }
        if self.gossip_fanout == 0 {
            return Err(ConfigError::new("gossip_fanout must be at least 1"));
        }
        if self.gossip_max_rounds == 0 {
            return Err(ConfigError::new("gossip_max_rounds must be at least 1"));
        }
        if self.gossip_interval.is_zero() {
            return Err(ConfigError::new("gossip_interval must be non-zero"));
        }
        if self.flood_ttl.is_zero() {
            return Err(ConfigError::new("flood_ttl must be non-zero"));
        }
        if self.flood_max_hops == 0 {
            return Err(ConfigError::new("flood_max_hops must be at least 1"));
        }
        if self.retry_interval.is_zero() {
            return Err(ConfigError::new("retry_interval must be non-zero"));
        }
        if self.retry_max == 0 {
            return Err(ConfigError::new("retry_max must be at least 1"));
        }
        if self.advertise_interval.is_zero() {
            return Err(ConfigError::new("advertise_interval must be non-zero"));
        }
        if self.health_check_interval.is_zero() {
            return Err(ConfigError::new("health_check_interval must be non-zero"));
        }
        if self.consensus_timeout.is_zero() {
            return Err(ConfigError::new("consensus_timeout must be non-zero"));
        }
        Ok(())
    }

    pub fn flooding(&self) -> FloodingConfig {
        FloodingConfig {
            ttl: self.flood_ttl,
            max_hops: self.flood_max_hops,
        }
    }

    pub fn gossip(&self) -> GossipConfig {
        GossipConfig {
            fanout: self.gossip_fanout,
            interval: self.gossip_interval,
            max_rounds: self.gossip_max_rounds,
        }
    }

    pub fn consensus(&self) -> ConsensusConfig {
        ConsensusConfig {
            quorum_size: self.quorum_size,
            timeout: self.consensus_timeout,
            ..ConsensusConfig::default()
        }
    }

    pub fn failover(&self) -> FailoverConfig {
        FailoverConfig {
            retry_interval: self.retry_interval,
            max_retries: self.retry_max,
        }
    }
}

/// Invalid startup parameter. Fatal by policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(String);

impl ConfigError {
    fn new(msg: &str) -> Self {
        Self(msg.to_string())
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid configuration: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}
