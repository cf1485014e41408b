use ethers::types::Address;
use serde::{
    Deserialize,
    Serialize,
};
use std::path::Path;

/// Static per-deployment configuration. Passed by value into every component
/// constructor so sessions against different networks can coexist in tests;
/// nothing in this crate reads process-wide state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    /// Human-readable name of the network the contracts are deployed on,
    /// shown next to the wallet's network when they disagree.
    pub network_name: String,
    /// Chain id the contracts are deployed on.
    pub chain_id: u64,
    /// WebSocket endpoint the signer submits through.
    pub ws_url: String,
    /// Optional separate endpoint for reads and log subscriptions (e.g. a
    /// higher-throughput indexer node). Falls back to `ws_url`.
    #[serde(default)]
    pub read_url: Option<String>,
    pub betting_contract: Address,
    pub token_contract: Address,
    /// Optional display icon for the wager token; the ERC-20 surface has no
    /// icon of its own.
    #[serde(default)]
    pub token_icon: Option<String>,
    /// Lower bound for historical log scans. Never genesis.
    pub deployment_block: u64,
    /// Blocks to wait after inclusion before treating a transaction as
    /// final. Too shallow risks reorgs, too deep delays feedback.
    pub confirmations: usize,
    /// Base URL a pending transaction hash is appended to for display.
    #[serde(default)]
    pub explorer_tx_base: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config profile {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config profile {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

impl AppConfig {
    /// The Mumbai deployment the dapp originally shipped against.
    pub fn mumbai() -> Self {
        AppConfig {
            network_name: "maticmum".to_string(),
            chain_id: 80_001,
            ws_url: "wss://rpc-mumbai.maticvigil.com/ws".to_string(),
            read_url: None,
            betting_contract: "0xca3f697B9A1eF4fC2C6ecEFD62239A4b2Df8F925"
                .parse()
                .expect("checked address literal"),
            token_contract: "0x8A953CfE442c5E8855cc6c61b1293FA648BAE472"
                .parse()
                .expect("checked address literal"),
            token_icon: None,
            deployment_block: 25_753_029,
            confirmations: 10,
            explorer_tx_base: Some("https://mumbai.polygonscan.com/tx/".to_string()),
        }
    }

    /// Load a profile from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_slice(&data).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Block-explorer link for a transaction hash, when a base is configured.
    pub fn explorer_tx_url(&self, hash: &ethers::types::TxHash) -> Option<String> {
        self.explorer_tx_base
            .as_ref()
            .map(|base| format!("{base}{hash:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mumbai_profile_round_trips_through_json() {
        let config = AppConfig::mumbai();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.chain_id, config.chain_id);
        assert_eq!(parsed.betting_contract, config.betting_contract);
        assert_eq!(parsed.deployment_block, config.deployment_block);
    }

    #[test]
    fn explorer_tx_url_appends_the_full_hash() {
        let config = AppConfig::mumbai();
        let hash = ethers::types::TxHash::from_low_u64_be(0xabcd);
        let url = config.explorer_tx_url(&hash).unwrap();
        assert!(url.starts_with("https://mumbai.polygonscan.com/tx/0x"));
        assert!(url.ends_with("abcd"));
    }
}
