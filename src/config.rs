//! Configuration for the coordination layer.
//!
//! TOML with sectioned tables; every field has a default so an embedder can
//! start from `Config::default()` and override selectively. No config is
//! written to disk automatically: state is session-scoped by design.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::RegistryError;
use crate::types::ChainId;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub chains: ChainsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub confirmation: ConfirmationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which side of the pairing this process plays.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Signs authorizations for the compromised account
    Registeree,
    /// Submits transactions and pays gas on the registeree's behalf
    Relayer,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Registeree => write!(f, "registeree"),
            Role::Relayer => write!(f, "relayer"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub role: Role,
    /// Stable identifier announced to the partner during pairing
    pub peer_id: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            role: Role::Registeree,
            peer_id: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Listen address for the TCP transport ("ip:port")
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Dial timeout in seconds
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
    /// Known partner addresses keyed by peer id ("id=ip:port")
    #[serde(default)]
    pub peer_addresses: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            dial_timeout_secs: default_dial_timeout(),
            peer_addresses: Vec::new(),
        }
    }
}

fn default_listen_address() -> String {
    "127.0.0.1:0".to_string()
}

fn default_dial_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainsConfig {
    /// Chain treated as the source of truth for registrations
    #[serde(default = "default_canonical_chain")]
    pub canonical_chain_id: ChainId,
}

impl Default for ChainsConfig {
    fn default() -> Self {
        Self {
            canonical_chain_id: default_canonical_chain(),
        }
    }
}

fn default_canonical_chain() -> ChainId {
    1
}

/// Backoff schedule for the reliable hash relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First retry delay; doubles on each subsequent attempt
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

/// Cross-chain confirmation polling parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConfirmationConfig {
    /// Initial settle delay before the first canonical-chain query
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Elapsed time at which the result is reported unverified
    #[serde(default = "default_max_polling_ms")]
    pub max_polling_ms: u64,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            max_polling_ms: default_max_polling_ms(),
        }
    }
}

fn default_settle_delay_ms() -> u64 {
    1_000
}

fn default_poll_interval_ms() -> u64 {
    3_000
}

fn default_max_polling_ms() -> u64 {
    120_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Optional log file; stdout only when unset
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Config {
    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| RegistryError::Serialization(format!("read config: {}", e)))?;
        toml::from_str(&raw)
            .map_err(|e| RegistryError::Serialization(format!("parse config: {}", e)))
    }

    /// Resolve a configured partner address ("id=ip:port") by peer id.
    pub fn peer_address(&self, peer_id: &str) -> Option<String> {
        self.network.peer_addresses.iter().find_map(|entry| {
            let (id, addr) = entry.split_once('=')?;
            (id == peer_id).then(|| addr.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.base_delay_ms, 1_000);
        assert_eq!(config.confirmation.poll_interval_ms, 3_000);
        assert_eq!(config.chains.canonical_chain_id, 1);
        assert_eq!(config.node.role, Role::Registeree);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[node]\nrole = \"relayer\"\npeer_id = \"relay-1\"\n\n[retry]\nmax_retries = 5"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.node.role, Role::Relayer);
        assert_eq!(config.node.peer_id, "relay-1");
        assert_eq!(config.retry.max_retries, 5);
        // Unspecified sections fall back to defaults
        assert_eq!(config.confirmation.settle_delay_ms, 1_000);
    }

    #[test]
    fn test_peer_address_lookup() {
        let config = Config {
            network: NetworkConfig {
                peer_addresses: vec!["relay-1=10.0.0.5:24600".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(
            config.peer_address("relay-1").as_deref(),
            Some("10.0.0.5:24600")
        );
        assert!(config.peer_address("unknown").is_none());
    }
}
