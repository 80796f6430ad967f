//! Harness configuration.
//!
//! Plain numeric/handle parameters consumed by the controller plus the
//! command templates the substrate expands into session descriptors.
//! Loadable from a TOML file; every field has a default so a partial
//! file (or none at all) works.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Errors from loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A stochastic rate must be positive and finite; an arrival process
    /// with rate zero would draw an infinite delay and stall the
    /// schedule.
    #[error("{name} must be positive and finite, got {value}")]
    NonPositiveRate { name: &'static str, value: f64 },
    /// Aggregation fan-out below 2 cannot attach anything.
    #[error("capacity {0} is too small (minimum 2)")]
    CapacityTooSmall(usize),
    /// A finite run duration must be positive.
    #[error("run duration must be positive, got {0}")]
    NonPositiveDuration(f64),
    /// The config file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] io::Error),
    /// The config file could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Parameters of one harness run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// Size of the idle client pool.
    pub clients: usize,
    /// Server sessions spawned up-front when the run starts.
    pub servers: usize,
    /// Fan-out capacity per aggregation node.
    pub capacity: usize,
    /// Arrival rate λ_in (sessions per unit time).
    pub arrival_rate: f64,
    /// Departure rate λ_out (per active session).
    pub departure_rate: f64,
    /// Finite run duration in seconds; `None` runs until interrupted.
    pub run_secs: Option<f64>,
    /// Output file for relayed lines; `None` writes to stdout.
    pub output: Option<PathBuf>,
    /// RNG seed; `None` seeds from entropy.
    pub seed: Option<u64>,
    /// Command template for client sessions.
    pub client_command: String,
    /// Command template for server sessions.
    pub server_command: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            clients: 100,
            servers: 1,
            capacity: 64,
            arrival_rate: 10.0,
            departure_rate: 0.1,
            run_secs: None,
            output: None,
            seed: None,
            client_command: "palma-client -c configs/client.xml -i {iface} -s {station}".into(),
            server_command: "palma-server -c configs/{name}.xml -i {iface}".into(),
        }
    }
}

impl HarnessConfig {
    /// Loads and validates a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error on read, parse, or validation failure.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the scheduling invariants the controller depends on.
    ///
    /// # Errors
    ///
    /// Returns an error for non-positive rates, a fan-out below 2, or a
    /// non-positive finite duration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.arrival_rate.is_finite() && self.arrival_rate > 0.0) {
            return Err(ConfigError::NonPositiveRate {
                name: "arrival_rate",
                value: self.arrival_rate,
            });
        }
        if !(self.departure_rate.is_finite() && self.departure_rate > 0.0) {
            return Err(ConfigError::NonPositiveRate {
                name: "departure_rate",
                value: self.departure_rate,
            });
        }
        if self.capacity < 2 {
            return Err(ConfigError::CapacityTooSmall(self.capacity));
        }
        if let Some(secs) = self.run_secs {
            if !(secs.is_finite() && secs > 0.0) {
                return Err(ConfigError::NonPositiveDuration(secs));
            }
        }
        Ok(())
    }

    /// Leaf names for all sessions, servers first (matching the order
    /// the tree builder and substrate expect).
    #[must_use]
    pub fn leaf_names(&self) -> Vec<String> {
        let servers = (1..=self.servers).map(|i| format!("srv{i}"));
        let clients = (1..=self.clients).map(|i| format!("h{i}"));
        servers.chain(clients).collect()
    }
}
