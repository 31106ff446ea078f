//! Provider Gateway.
//!
//! Owns wallet selection, the persisted provider token and every
//! subscribe/unsubscribe on a provider. Other components only get a
//! `RequestClient`, which can issue requests but never touch subscriptions.

use crate::connectors::WalletSelector;
use crate::error::{ConnectionError, IdentityError, ProviderError};
use crate::user_settings::TokenStore;
use crate::wallet::{EventSink, SubscriptionId, WalletProvider};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionReceipt, TxHash};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A live wallet connection. Not `Clone`: whoever holds it owns the
/// connection and must hand it back to the gateway to release it.
pub struct ProviderHandle {
    id: u64,
    token: String,
    provider: Option<Arc<dyn WalletProvider>>,
    subscription: Option<SubscriptionId>,
}

impl ProviderHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_released(&self) -> bool {
        self.provider.is_none()
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("id", &self.id)
            .field("token", &self.token)
            .field("released", &self.is_released())
            .field("subscription", &self.subscription)
            .finish()
    }
}

/// Account and chain discovered from a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub account: Address,
    pub chain_id: u64,
}

/// Request-only view of a provider.
#[derive(Clone)]
pub struct RequestClient {
    provider: Arc<dyn WalletProvider>,
}

impl RequestClient {
    #[cfg(test)]
    pub(crate) fn from_provider(provider: Arc<dyn WalletProvider>) -> Self {
        Self { provider }
    }

    pub async fn call(&self, tx: &TypedTransaction) -> Result<Bytes, ProviderError> {
        self.provider.call(tx).await
    }

    pub async fn send_transaction(&self, tx: TypedTransaction) -> Result<TxHash, ProviderError> {
        self.provider.send_transaction(tx).await
    }

    pub async fn wait_for_receipt(&self, tx_hash: TxHash) -> Result<TransactionReceipt, ProviderError> {
        self.provider.wait_for_receipt(tx_hash).await
    }

    /// Re-derive account and chain, e.g. after a network switch.
    pub async fn identity(&self) -> Result<Identity, IdentityError> {
        query_identity(self.provider.as_ref()).await
    }
}

async fn query_identity(provider: &dyn WalletProvider) -> Result<Identity, IdentityError> {
    let accounts = provider
        .accounts()
        .await
        .map_err(|source| IdentityError::Query { what: "accounts", source })?;
    let account = accounts.first().copied().ok_or(IdentityError::NoAccount)?;

    let chain_id = provider
        .chain_id()
        .await
        .map_err(|source| IdentityError::Query { what: "chain id", source })?;

    Ok(Identity { account, chain_id })
}

pub struct ProviderGateway {
    selector: Arc<dyn WalletSelector>,
    tokens: Arc<dyn TokenStore>,
    next_handle: AtomicU64,
}

impl ProviderGateway {
    pub fn new(selector: Arc<dyn WalletSelector>, tokens: Arc<dyn TokenStore>) -> Self {
        Self {
            selector,
            tokens,
            next_handle: AtomicU64::new(1),
        }
    }

    /// True when a previous session left a provider token for silent reconnect.
    pub fn has_cached_provider(&self) -> bool {
        self.tokens.load().is_some()
    }

    /// Run wallet selection (reusing the cached token if any) and return a live handle.
    pub async fn connect(&self) -> Result<ProviderHandle, ConnectionError> {
        let cached = self.tokens.load();
        let selected = match self.selector.select(cached.as_deref()).await {
            Ok(selected) => selected,
            Err(e) => {
                if cached.is_some() {
                    // A stale token would make every later start fail the same way.
                    if let Err(clear_err) = self.tokens.clear() {
                        warn!("Failed to clear cached provider: {}", clear_err);
                    }
                }
                return Err(e);
            }
        };

        if let Err(e) = self.tokens.store(&selected.token) {
            warn!("Failed to persist provider token: {}", e);
        }

        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        info!("Wallet connected via '{}' (handle #{})", selected.token, id);
        Ok(ProviderHandle {
            id,
            token: selected.token,
            provider: Some(selected.provider),
            subscription: None,
        })
    }

    /// First exposed account plus the active chain.
    pub async fn derive_identity(&self, handle: &ProviderHandle) -> Result<Identity, IdentityError> {
        let provider = handle.provider.as_ref().ok_or(IdentityError::NoAccount)?;
        query_identity(provider.as_ref()).await
    }

    pub fn requests(&self, handle: &ProviderHandle) -> Option<RequestClient> {
        handle.provider.as_ref().map(|provider| RequestClient {
            provider: provider.clone(),
        })
    }

    /// Register `sink` for the handle's events. Returns false when the
    /// provider has no event support; an earlier subscription is replaced.
    pub fn subscribe(&self, handle: &mut ProviderHandle, sink: EventSink) -> bool {
        let Some(provider) = handle.provider.as_ref() else {
            return false;
        };
        if let Some(previous) = handle.subscription.take() {
            provider.unsubscribe(previous);
        }
        match provider.subscribe(sink) {
            Some(id) => {
                debug!("Handle #{} subscribed as {:?}", handle.id, id);
                handle.subscription = Some(id);
                true
            }
            None => {
                info!("Provider for handle #{} has no event support", handle.id);
                false
            }
        }
    }

    /// Unregister the exact subscription made for this handle and close the
    /// provider. Leaves the cached token in place. Idempotent.
    pub async fn release(&self, handle: &mut ProviderHandle) {
        let Some(provider) = handle.provider.take() else {
            return;
        };
        if let Some(id) = handle.subscription.take() {
            if !provider.unsubscribe(id) {
                debug!("Subscription {:?} was already gone", id);
            }
        }
        provider.close().await;
        info!("Released provider handle #{}", handle.id);
    }

    /// Release the handle and forget the cached provider. Idempotent.
    pub async fn disconnect(&self, handle: Option<&mut ProviderHandle>) {
        if let Some(handle) = handle {
            self.release(handle).await;
        }
        if let Err(e) = self.tokens.clear() {
            warn!("Failed to clear cached provider: {}", e);
        }
    }
}
