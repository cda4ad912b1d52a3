// src/config.rs - flat process configuration: file defaults,
// CLI overrides, environment-driven default path lookup.
use crate::error::{NodeError, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// One `(address, amount)` credit paid out by the genesis block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisCredit {
    pub address: String,
    pub amount: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    pub store_path: PathBuf,
    pub coordinator_uri: String,
    pub no_sync: bool,
    pub no_mine: bool,
    pub generate_genesis: bool,
    #[serde(default)]
    pub genesis_credits: Vec<GenesisCredit>,
    pub miner_address: Option<String>,
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            store_path: PathBuf::from("jolt-data"),
            coordinator_uri: "https://coordinator.invalid".to_string(),
            no_sync: false,
            no_mine: true,
            generate_genesis: false,
            genesis_credits: Vec::new(),
            miner_address: None,
            log_level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&content).map_err(|e| NodeError::BadTxFields(format!("config parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| NodeError::BadTxFields(format!("config serialize error: {e}")))?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    /// Default config file search order: cwd, then the platform
    /// config directory. Falls back to defaults (persisted to cwd)
    /// when neither exists.
    pub fn load_default() -> Result<Self> {
        let candidates = [
            Some(PathBuf::from("jolt-node.toml")),
            dirs::config_dir().map(|d| d.join("jolt-node").join("config.toml")),
        ];

        for candidate in candidates.into_iter().flatten() {
            if candidate.exists() {
                return Self::load_from_file(candidate);
            }
        }

        let config = Self::default();
        if let Err(e) = config.save_to_file("jolt-node.toml") {
            log::warn!("failed to persist default config: {e}");
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(NodeError::BadTxFields("port cannot be zero".into()));
        }
        if self.coordinator_uri.is_empty() {
            return Err(NodeError::BadTxFields("coordinator_uri cannot be empty".into()));
        }
        if !self.no_mine {
            let addr = self
                .miner_address
                .as_deref()
                .ok_or_else(|| NodeError::BadTxFields("miner_address is required unless no_mine is set".into()))?;
            if !crate::crypto::is_valid_address_shape(addr) {
                return Err(NodeError::BadAddress(addr.to_string()));
            }
        }
        if self.generate_genesis {
            if self.genesis_credits.is_empty() {
                return Err(NodeError::BadTxFields(
                    "generate_genesis requires a non-empty genesis_credits list".into(),
                ));
            }
            for credit in &self.genesis_credits {
                if !crate::crypto::is_valid_address_shape(&credit.address) {
                    return Err(NodeError::BadAddress(credit.address.clone()));
                }
                if credit.amount < 0 {
                    return Err(NodeError::NegativeAmount);
                }
            }
        }
        Ok(())
    }

    /// Apply CLI overrides on top of file-or-default values.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(host) = &cli.host {
            self.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(path) = &cli.store_path {
            self.store_path = path.clone();
        }
        if let Some(uri) = &cli.coordinator_uri {
            self.coordinator_uri = uri.clone();
        }
        if cli.no_sync {
            self.no_sync = true;
        }
        if cli.no_mine {
            self.no_mine = true;
        }
        if cli.generate_genesis {
            self.generate_genesis = true;
        }
        if !cli.genesis_credit.is_empty() {
            self.genesis_credits = cli
                .genesis_credit
                .iter()
                .filter_map(|raw| {
                    let (addr, amount) = raw.split_once(':')?;
                    Some(GenesisCredit {
                        address: addr.to_string(),
                        amount: amount.parse().ok()?,
                    })
                })
                .collect();
        }
        if let Some(addr) = &cli.miner_address {
            self.miner_address = Some(addr.clone());
            self.no_mine = false;
        }
        if let Some(level) = &cli.log_level {
            self.log_level = level.clone();
        }
    }
}

/// A full node for the Jolt proof-of-work chain.
#[derive(Parser, Debug)]
#[command(name = "jolt-node", version, about)]
pub struct Cli {
    /// Path to a TOML config file; overrides the default search order.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub host: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long)]
    pub store_path: Option<PathBuf>,

    #[arg(long)]
    pub coordinator_uri: Option<String>,

    #[arg(long)]
    pub no_sync: bool,

    #[arg(long)]
    pub no_mine: bool,

    #[arg(long)]
    pub generate_genesis: bool,

    /// A genesis credit as `address:amount`; may be repeated.
    #[arg(long)]
    pub genesis_credit: Vec<String>,

    #[arg(long)]
    pub miner_address: Option<String>,

    #[arg(long)]
    pub log_level: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates_when_not_mining() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn mining_without_address_fails_validation() {
        let mut config = NodeConfig::default();
        config.no_mine = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn generate_genesis_without_credits_fails_validation() {
        let mut config = NodeConfig::default();
        config.generate_genesis = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = NodeConfig::default();
        config.save_to_file(&path).unwrap();
        let loaded = NodeConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.port, config.port);
    }
}
