use anyhow::{anyhow, Result};
use ethers::types::Address;
use std::env;
use std::str::FromStr;
use url::Url;

use crate::connectors::ConnectorKind;

/// A known EVM network with label, chain ID and RPC endpoints.
#[derive(Clone, Debug)]
pub struct EvmNetwork {
    pub label: &'static str,
    pub chain_id: u64,
    pub default_rpc: &'static str,
    /// Infura endpoint pattern with an `{infura_id}` placeholder
    pub infura_rpc: Option<&'static str>,
}

impl EvmNetwork {
    pub const fn new(
        label: &'static str,
        chain_id: u64,
        default_rpc: &'static str,
        infura_rpc: Option<&'static str>,
    ) -> Self {
        Self {
            label,
            chain_id,
            default_rpc,
            infura_rpc,
        }
    }

    /// Resolve the RPC endpoint, preferring the Infura pattern when a project id is known.
    pub fn rpc_url(&self, infura_id: Option<&str>) -> String {
        match (self.infura_rpc, infura_id.map(str::trim).filter(|id| !id.is_empty())) {
            (Some(pattern), Some(id)) => pattern.replace("{infura_id}", id),
            _ => self.default_rpc.to_string(),
        }
    }
}

/// Networks the election contract may be deployed to.
pub const NETWORKS: &[EvmNetwork] = &[
    EvmNetwork::new("Ethereum", 1, "https://ethereum-rpc.publicnode.com", Some("https://mainnet.infura.io/v3/{infura_id}")),
    EvmNetwork::new("Ropsten", 3, "https://rpc.ankr.com/eth_ropsten", Some("https://ropsten.infura.io/v3/{infura_id}")),
    EvmNetwork::new("Sepolia", 11155111, "https://ethereum-sepolia-rpc.publicnode.com", Some("https://sepolia.infura.io/v3/{infura_id}")),
    EvmNetwork::new("Holesky", 17000, "https://ethereum-holesky-rpc.publicnode.com", Some("https://holesky.infura.io/v3/{infura_id}")),
    EvmNetwork::new("Optimism", 10, "https://mainnet.optimism.io", Some("https://optimism-mainnet.infura.io/v3/{infura_id}")),
    EvmNetwork::new("Polygon", 137, "https://polygon-rpc.com", Some("https://polygon-mainnet.infura.io/v3/{infura_id}")),
    EvmNetwork::new("Base", 8453, "https://mainnet.base.org", None),
    EvmNetwork::new("Gnosis Chain", 100, "https://rpc.gnosischain.com", None),
    EvmNetwork::new("Localhost", 31337, "http://127.0.0.1:8545", None),
];

/// Chain id used when nothing else is configured.
pub const DEFAULT_CHAIN_ID: u64 = 11155111;

/// Explorer used for chains without a dedicated entry.
pub const FALLBACK_EXPLORER_URL: &str = "https://blockscan.com";

/// Find a network by chain ID
pub fn find_network_by_chain_id(chain_id: u64) -> Option<&'static EvmNetwork> {
    NETWORKS.iter().find(|n| n.chain_id == chain_id)
}

/// Get the block explorer URL for a given chain ID
pub fn get_block_explorer_url(chain_id: u64) -> Option<&'static str> {
    match chain_id {
        1 => Some("https://etherscan.io"),
        3 => Some("https://ropsten.etherscan.io"),
        11155111 => Some("https://sepolia.etherscan.io"),
        17000 => Some("https://holesky.etherscan.io"),
        10 => Some("https://optimistic.etherscan.io"),
        137 => Some("https://polygonscan.com"),
        8453 => Some("https://basescan.org"),
        100 => Some("https://gnosisscan.io"),
        _ => None,
    }
}

/// Full URL to view a transaction. Always yields a link, falling back to a
/// multi-chain explorer for chains not in the registry.
pub fn get_tx_explorer_url(chain_id: u64, tx_hash: &str) -> String {
    let base = get_block_explorer_url(chain_id).unwrap_or(FALLBACK_EXPLORER_URL);
    format!("{}/tx/{}", base, tx_hash)
}

/// Human label for a chain id, "Unknown" if not registered.
pub fn network_label(chain_id: u64) -> &'static str {
    find_network_by_chain_id(chain_id)
        .map(|n| n.label)
        .unwrap_or("Unknown")
}

/// Parse an optional numeric variable. Unset or blank is `None`; anything
/// else must parse.
fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow!("Invalid {} '{}': {}", key, raw.trim(), e)),
        _ => Ok(None),
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub rpc_url: String,
    pub chain_id: u64,
    pub contract_address: Address,
    /// Connector used when no cached provider token exists
    pub preferred_connector: Option<ConnectorKind>,
    pub private_key: Option<String>,
    pub ledger_account_index: usize,
    pub receipt_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Config {
    pub fn new(rpc_url: String, chain_id: u64, contract_address: Address) -> Self {
        Self {
            rpc_url,
            chain_id,
            contract_address,
            preferred_connector: None,
            private_key: None,
            ledger_account_index: 0,
            receipt_timeout_secs: 120,
            poll_interval_ms: 2000,
        }
    }

    /// Build the configuration from `BALLOT_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let contract_address = match env::var("BALLOT_CONTRACT") {
            Ok(raw) => raw
                .trim()
                .parse::<Address>()
                .map_err(|e| anyhow!("Invalid BALLOT_CONTRACT '{}': {}", raw.trim(), e))?,
            Err(_) => return Err(anyhow!("BALLOT_CONTRACT is not set")),
        };

        let chain_id = env_parse("BALLOT_CHAIN_ID")?.unwrap_or(DEFAULT_CHAIN_ID);
        let infura_id = env::var("BALLOT_INFURA_ID").ok();

        let rpc_url = match env::var("BALLOT_RPC_URL") {
            Ok(url) if !url.trim().is_empty() => url.trim().to_string(),
            _ => find_network_by_chain_id(chain_id)
                .map(|n| n.rpc_url(infura_id.as_deref()))
                .ok_or_else(|| anyhow!("No RPC known for chain {}; set BALLOT_RPC_URL", chain_id))?,
        };

        let mut config = Self::new(rpc_url, chain_id, contract_address);
        config.preferred_connector = match env::var("BALLOT_CONNECTOR") {
            Ok(raw) if !raw.trim().is_empty() => Some(raw.parse()?),
            _ => None,
        };
        config.private_key = env::var("BALLOT_PRIVATE_KEY").ok().filter(|k| !k.trim().is_empty());
        config.ledger_account_index = env_parse("BALLOT_LEDGER_INDEX")?.unwrap_or(0);
        if let Some(secs) = env_parse("BALLOT_RECEIPT_TIMEOUT_SECS")? {
            config.receipt_timeout_secs = secs;
        }
        if let Some(ms) = env_parse("BALLOT_POLL_INTERVAL_MS")? {
            config.poll_interval_ms = ms;
        }

        config.validated_rpc_url()?;
        Ok(config)
    }

    pub fn validated_rpc_url(&self) -> Result<Url> {
        Url::parse(&self.rpc_url).map_err(|e| anyhow!("Invalid RPC URL '{}': {}", self.rpc_url, e))
    }

    pub fn network_label(&self) -> &'static str {
        network_label(self.chain_id)
    }
}
