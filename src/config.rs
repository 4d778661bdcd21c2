use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
pub enum NetworkType {
    Mainnet,
    Testnet,
    Regtest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub network_type: NetworkType,
    pub bitcoind: BitcoindConfig,
    pub topology: TopologyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitcoindConfig {
    pub rpc_url: String,
    pub rpc_user: Option<String>,
    pub rpc_password: Option<String>,
    pub cookie_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopologyConfig {
    pub poll_interval_ms: u64,
    /// Rewind floor: the first block tracked after startup.
    pub first_blocknum: u32,
    /// Most blocks connected per tick while catching up.
    pub sync_batch: u32,
    pub fee_target_blocks: u16,
    /// Fee rate (sat/kvB) reported until the backend gives an estimate.
    pub fallback_feerate: u64,
}

impl TopologyConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sync_batch == 0 {
            anyhow::bail!("sync_batch must be at least 1");
        }
        if self.fee_target_blocks == 0 {
            anyhow::bail!("fee_target_blocks must be at least 1");
        }
        Ok(())
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 30_000,
            first_blocknum: 0,
            sync_batch: 50,
            fee_target_blocks: 6,
            fallback_feerate: 10_000, // 10 sat/vB
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network_type: NetworkType::Mainnet,
            bitcoind: BitcoindConfig {
                rpc_url: "http://127.0.0.1:8332".to_string(),
                rpc_user: None,
                rpc_password: None,
                cookie_file: Some(home_dir().join(".bitcoin").join(".cookie")),
            },
            topology: TopologyConfig {
                first_blocknum: 800_000,
                ..TopologyConfig::default()
            },
        }
    }
}

impl Config {
    pub fn testnet() -> Self {
        Self {
            network_type: NetworkType::Testnet,
            bitcoind: BitcoindConfig {
                rpc_url: "http://127.0.0.1:18332".to_string(),
                rpc_user: None,
                rpc_password: None,
                cookie_file: Some(home_dir().join(".bitcoin").join("testnet3").join(".cookie")),
            },
            topology: TopologyConfig {
                first_blocknum: 2_500_000,
                ..TopologyConfig::default()
            },
        }
    }

    pub fn regtest() -> Self {
        Self {
            network_type: NetworkType::Regtest,
            bitcoind: BitcoindConfig {
                rpc_url: "http://127.0.0.1:18443".to_string(),
                rpc_user: None,
                rpc_password: None,
                cookie_file: Some(home_dir().join(".bitcoin").join("regtest").join(".cookie")),
            },
            topology: TopologyConfig {
                poll_interval_ms: 1_000,
                first_blocknum: 0,
                ..TopologyConfig::default()
            },
        }
    }

    pub fn for_network(network: NetworkType) -> Self {
        match network {
            NetworkType::Mainnet => Self::default(),
            NetworkType::Testnet => Self::testnet(),
            NetworkType::Regtest => Self::regtest(),
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.topology.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_path() -> PathBuf {
        Self::data_dir().join("config.json")
    }

    /// Default home for the config file, pid file and daemon logs.
    pub fn data_dir() -> PathBuf {
        home_dir().join(".chainwatch")
    }
}

fn home_dir() -> PathBuf {
    PathBuf::from(env::var("HOME").unwrap_or_else(|_| ".".to_string()))
}
