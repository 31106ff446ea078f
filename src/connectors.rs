//! Wallet selection.
//!
//! Selection takes the cached provider token first, then the configured
//! preference. With neither, the user has not picked a wallet and selection
//! counts as aborted.

use crate::config::Config;
use crate::error::ConnectionError;
use crate::wallet::{MiddlewareWallet, WalletProvider, WatchOptions};
use async_trait::async_trait;
use ethers::prelude::*;
use ethers::signers::{HDPath, Ledger};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorKind {
    /// Accounts managed by the JSON-RPC node (`eth_accounts`)
    Node,
    /// Local private key signing through `SignerMiddleware`
    PrivateKey,
    /// Ledger hardware wallet through ethers' native Ledger signer
    Ledger,
}

impl ConnectorKind {
    pub const ALL: [ConnectorKind; 3] = [ConnectorKind::Node, ConnectorKind::PrivateKey, ConnectorKind::Ledger];

    /// Token persisted for silent reconnect.
    pub fn token(&self) -> &'static str {
        match self {
            ConnectorKind::Node => "node",
            ConnectorKind::PrivateKey => "private-key",
            ConnectorKind::Ledger => "ledger",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ConnectorKind::Node => "Node accounts",
            ConnectorKind::PrivateKey => "Private key",
            ConnectorKind::Ledger => "Ledger",
        }
    }
}

impl fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for ConnectorKind {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        ConnectorKind::ALL
            .into_iter()
            .find(|k| k.token().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ConnectionError::UnknownConnector(wanted.to_string()))
    }
}

/// Result of a successful wallet selection.
pub struct SelectedWallet {
    pub token: String,
    pub provider: Arc<dyn WalletProvider>,
}

#[async_trait]
pub trait WalletSelector: Send + Sync {
    async fn select(&self, cached_token: Option<&str>) -> Result<SelectedWallet, ConnectionError>;
}

/// Serializes Ledger/HID access across connect attempts; the device fails
/// with transient HIDAPI errors when opened twice at once.
fn ledger_lock() -> &'static tokio::sync::Mutex<()> {
    static LEDGER_LOCK: OnceLock<tokio::sync::Mutex<()>> = OnceLock::new();
    LEDGER_LOCK.get_or_init(|| tokio::sync::Mutex::new(()))
}

/// Selector over the built-in connectors.
pub struct ConnectorRegistry {
    config: Config,
}

impl ConnectorRegistry {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    fn watch_options(&self) -> WatchOptions {
        WatchOptions {
            poll_interval: Duration::from_millis(self.config.poll_interval_ms),
            receipt_timeout: Duration::from_secs(self.config.receipt_timeout_secs),
            log_address: Some(self.config.contract_address),
        }
    }

    fn http_provider(&self) -> Result<Provider<Http>, ConnectionError> {
        let url = self
            .config
            .validated_rpc_url()
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
        Provider::<Http>::try_from(url.as_str()).map_err(|e| ConnectionError::Transport(e.to_string()))
    }

    /// Decide which connector to open for this selection.
    pub fn resolve(&self, cached_token: Option<&str>) -> Result<ConnectorKind, ConnectionError> {
        if let Some(token) = cached_token {
            match token.parse() {
                Ok(kind) => return Ok(kind),
                Err(e) => warn!("Ignoring cached provider token: {}", e),
            }
        }
        self.config.preferred_connector.ok_or(ConnectionError::Aborted)
    }

    async fn open(&self, kind: ConnectorKind) -> Result<Arc<dyn WalletProvider>, ConnectionError> {
        let provider = self.http_provider()?;
        let options = self.watch_options();

        match kind {
            ConnectorKind::Node => Ok(Arc::new(MiddlewareWallet::new(provider, None, options))),
            ConnectorKind::PrivateKey => {
                let key = self
                    .config
                    .private_key
                    .as_deref()
                    .ok_or_else(|| ConnectionError::Transport("BALLOT_PRIVATE_KEY is not set".into()))?;
                let chain_id = provider
                    .get_chainid()
                    .await
                    .map_err(|e| ConnectionError::Transport(e.to_string()))?
                    .as_u64();
                let wallet = key
                    .trim()
                    .parse::<LocalWallet>()
                    .map_err(|e| ConnectionError::Transport(format!("Invalid private key: {}", e)))?
                    .with_chain_id(chain_id);
                let address = wallet.address();
                let client = SignerMiddleware::new(provider, wallet);
                Ok(Arc::new(MiddlewareWallet::new(client, Some(address), options).bound_to_chain(chain_id)))
            }
            ConnectorKind::Ledger => {
                let chain_id = provider
                    .get_chainid()
                    .await
                    .map_err(|e| ConnectionError::Transport(e.to_string()))?
                    .as_u64();

                let _lock = ledger_lock().lock().await;
                let path = HDPath::LedgerLive(self.config.ledger_account_index);
                let ledger = Ledger::new(path, chain_id)
                    .await
                    .map_err(|e| ConnectionError::Transport(format!("Ledger error: {}", e)))?;
                let address = ledger.address();
                info!("Ledger account {:?} on chain {}", address, chain_id);
                let client = SignerMiddleware::new(provider, ledger);
                Ok(Arc::new(MiddlewareWallet::new(client, Some(address), options).bound_to_chain(chain_id)))
            }
        }
    }
}

#[async_trait]
impl WalletSelector for ConnectorRegistry {
    async fn select(&self, cached_token: Option<&str>) -> Result<SelectedWallet, ConnectionError> {
        let kind = self.resolve(cached_token)?;
        info!("Opening wallet connector: {}", kind.display_name());
        let provider = self.open(kind).await?;
        Ok(SelectedWallet {
            token: kind.token().to_string(),
            provider,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(preferred: Option<ConnectorKind>) -> ConnectorRegistry {
        let mut config = Config::new("http://127.0.0.1:8545".to_string(), 31337, Address::zero());
        config.preferred_connector = preferred;
        ConnectorRegistry::new(config)
    }

    #[test]
    fn test_connector_kind_round_trips_through_token() {
        for kind in ConnectorKind::ALL {
            assert_eq!(kind.token().parse::<ConnectorKind>().unwrap(), kind);
        }
        assert_eq!("LEDGER".parse::<ConnectorKind>().unwrap(), ConnectorKind::Ledger);
    }

    #[test]
    fn test_connector_kind_unknown_token() {
        assert_eq!(
            "walletconnect".parse::<ConnectorKind>(),
            Err(ConnectionError::UnknownConnector("walletconnect".into()))
        );
    }

    #[test]
    fn test_resolve_prefers_cached_token() {
        let registry = registry(Some(ConnectorKind::Node));
        assert_eq!(registry.resolve(Some("ledger")).unwrap(), ConnectorKind::Ledger);
    }

    #[test]
    fn test_resolve_falls_back_to_preference_on_bad_token() {
        let registry = registry(Some(ConnectorKind::PrivateKey));
        assert_eq!(registry.resolve(Some("garbage")).unwrap(), ConnectorKind::PrivateKey);
    }

    #[test]
    fn test_resolve_without_token_or_preference_is_aborted() {
        let registry = registry(None);
        assert_eq!(registry.resolve(None).unwrap_err(), ConnectionError::Aborted);
    }

    #[tokio::test]
    async fn test_private_key_connector_requires_key() {
        let registry = registry(Some(ConnectorKind::PrivateKey));
        let err = registry.select(None).await.err().unwrap();
        assert!(matches!(err, ConnectionError::Transport(msg) if msg.contains("BALLOT_PRIVATE_KEY")));
    }

    #[tokio::test]
    async fn test_node_connector_opens_without_network() {
        let registry = registry(Some(ConnectorKind::Node));
        let selected = registry.select(None).await.unwrap();
        assert_eq!(selected.token, "node");
    }
}
