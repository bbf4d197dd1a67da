use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{RelayerError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayerConfig {
    pub global: GlobalConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Log level for the relayer
    pub log_level: String,
    /// SQLite database holding sync progress and pending packets
    pub database_path: String,
    /// Timeout for a single outbound chain query in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Full passes over the endpoint list before a query is reported as failed
    #[serde(default = "default_max_query_rounds")]
    pub max_query_rounds: u32,
    /// How many times a broadcast tx is looked up by hash before giving up
    #[serde(default = "default_tx_poll_retries")]
    pub tx_poll_retries: u32,
    /// Delay between tx lookups in milliseconds
    #[serde(default = "default_tx_poll_interval_ms")]
    pub tx_poll_interval_ms: u64,
    /// How often the leader-election gate is polled in milliseconds
    #[serde(default = "default_gate_poll_interval_ms")]
    pub gate_poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Maximum number of heights fetched per sync iteration
    pub batch_size: u64,
    /// Wait between sync iterations when no new height is available
    pub poll_interval_ms: u64,
    /// Latest height refresh interval
    pub height_poll_interval_ms: u64,
    /// Consecutive height query failures tolerated before the process stops
    pub max_height_failures: u32,
    /// Lag after which the live range is split into a bounded backfill and a fresh live range
    pub catch_up_gap: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            poll_interval_ms: 1000,
            height_poll_interval_ms: 1000,
            max_height_failures: 10,
            catch_up_gap: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Chain identifier
    pub chain_id: String,
    /// CometBFT RPC endpoints, tried in order
    pub rpc_endpoints: Vec<String>,
    /// Cosmos REST (gRPC gateway) endpoints, tried in order
    pub rest_endpoints: Vec<String>,
    /// Bech32 address prefix
    pub address_prefix: String,
    /// Gas price and denom
    pub gas_price: String,
    /// Gas limit for every relay transaction
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    /// First height to sync; defaults to the chain tip on first start
    pub start_height: Option<u64>,
    /// Signing wallets, each running its own relay loop
    #[serde(default)]
    pub wallets: Vec<WalletConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletConfig {
    /// Environment variable holding "address:hexPrivateKey" or "hexPrivateKey"
    pub key_env: Option<String>,
    /// Hex private key (development only)
    pub key_hex: Option<String>,
    /// Maximum packets handled per transaction
    #[serde(default = "default_max_handle_packet")]
    pub max_handle_packet: usize,
    /// Wait between loop iterations in milliseconds
    #[serde(default = "default_loop_interval_ms")]
    pub loop_interval_ms: u64,
    /// Memo attached to every transaction
    #[serde(default)]
    pub memo: String,
}

/// One relayed connection pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub chain_a: String,
    pub connection_a: String,
    pub chain_b: String,
    pub connection_b: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics collection and the `/metrics` endpoint
    pub enabled: bool,
    /// Metrics server host
    #[serde(default = "default_metrics_host")]
    pub host: String,
    /// Metrics server port; 0 picks a free port
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_metrics_host(),
            port: default_metrics_port(),
        }
    }
}

fn default_metrics_host() -> String {
    "127.0.0.1".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_max_query_rounds() -> u32 {
    3
}

fn default_tx_poll_retries() -> u32 {
    10
}

fn default_tx_poll_interval_ms() -> u64 {
    1000
}

fn default_gate_poll_interval_ms() -> u64 {
    5000
}

fn default_gas_limit() -> u64 {
    2_000_000
}

fn default_max_handle_packet() -> usize {
    50
}

fn default_loop_interval_ms() -> u64 {
    1000
}

impl RelayerConfig {
    /// Load configuration from TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            RelayerError::Config(format!("cannot read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: RelayerConfig =
            toml::from_str(content).map_err(|e| RelayerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Every connection must reference configured chains
    pub fn validate(&self) -> Result<()> {
        for conn in &self.connections {
            for chain in [&conn.chain_a, &conn.chain_b] {
                if !self.chains.contains_key(chain) {
                    return Err(RelayerError::Config(format!(
                        "connection {} <-> {} references unknown chain {}",
                        conn.connection_a, conn.connection_b, chain
                    )));
                }
            }
        }
        for (name, chain) in &self.chains {
            if name != &chain.chain_id {
                return Err(RelayerError::Config(format!(
                    "chain table {} must be keyed by its chain_id {}",
                    name, chain.chain_id
                )));
            }
            if chain.rpc_endpoints.is_empty() || chain.rest_endpoints.is_empty() {
                return Err(RelayerError::Config(format!(
                    "chain {} needs at least one rpc and one rest endpoint",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Get chain configuration by ID
    pub fn get_chain(&self, chain_id: &str) -> Option<&ChainConfig> {
        self.chains.values().find(|c| c.chain_id == chain_id)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.global.request_timeout_ms)
    }
}
