//! Node configuration for the Rill full node.
//!
//! Provides [`NodeConfig`] with defaults for data directory, RPC binding,
//! and network settings. The configuration can be customized programmatically
//! or loaded from a config file in the future.

use std::path::PathBuf;

use rill_core::constants::DEFAULT_RPC_PORT;
use rill_network::NetworkConfig;

/// Configuration for a full node instance.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    /// IP address for the JSON-RPC server to bind to.
    pub rpc_bind: String,
    /// Port for the JSON-RPC server.
    pub rpc_port: u16,
    /// P2P network configuration.
    pub network: NetworkConfig,
    /// Log level filter string (e.g. "info", "debug", "rill_node=trace").
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rill");

        Self {
            data_dir,
            rpc_bind: "127.0.0.1".to_string(),
            rpc_port: DEFAULT_RPC_PORT,
            network: NetworkConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    /// Path to the RocksDB chain data directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("chaindata")
    }

    /// Socket address string for the RPC server.
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.rpc_bind, self.rpc_port)
    }
}
