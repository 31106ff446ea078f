//! External wallet boundary.
//!
//! A `WalletProvider` is what a connector hands back after wallet selection:
//! it answers account/chain queries, forwards contract calls and transactions,
//! and optionally pushes lifecycle events into a channel.

use crate::error::ProviderError;
use async_trait::async_trait;
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Consecutive watcher poll failures after which the provider is reported closed.
const MAX_WATCH_FAILURES: u32 = 5;

/// Floor for watcher and receipt polling.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lifecycle notification pushed by a wallet provider.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    Closed,
    AccountsChanged(Vec<Address>),
    NetworkChanged(u64),
    Log(Log),
}

pub type EventSink = mpsc::UnboundedSender<ProviderEvent>;

/// Identity of one registered event subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

#[async_trait]
pub trait WalletProvider: Send + Sync {
    async fn accounts(&self) -> Result<Vec<Address>, ProviderError>;

    async fn chain_id(&self) -> Result<u64, ProviderError>;

    /// Execute a read-only call and return the raw return data.
    async fn call(&self, tx: &TypedTransaction) -> Result<Bytes, ProviderError>;

    /// Hand a transaction to the wallet; resolves once the wallet has
    /// accepted and broadcast it, not when it is mined.
    async fn send_transaction(&self, tx: TypedTransaction) -> Result<TxHash, ProviderError>;

    async fn wait_for_receipt(&self, tx_hash: TxHash) -> Result<TransactionReceipt, ProviderError>;

    /// Register `sink` for lifecycle events. `None` means the provider has no
    /// event support.
    fn subscribe(&self, _sink: EventSink) -> Option<SubscriptionId> {
        None
    }

    /// Remove exactly the subscription returned by `subscribe`. Returns false
    /// if it was not (or no longer) registered.
    fn unsubscribe(&self, _id: SubscriptionId) -> bool {
        false
    }

    /// Release transport resources. Must tolerate repeated calls.
    async fn close(&self) {}
}

/// Map a middleware error string onto the provider error kinds.
pub(crate) fn classify_error(err: impl std::fmt::Display) -> ProviderError {
    let msg = err.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("rejected") || lower.contains("denied") || lower.contains("revert") {
        ProviderError::Rejected(msg)
    } else {
        ProviderError::Transport(msg)
    }
}

/// Polling parameters for a middleware-backed wallet.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub poll_interval: Duration,
    pub receipt_timeout: Duration,
    /// Contract whose logs are forwarded as `ProviderEvent::Log`
    pub log_address: Option<Address>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2000),
            receipt_timeout: Duration::from_secs(120),
            log_address: None,
        }
    }
}

/// Wallet backed by any ethers middleware stack: a node with unlocked
/// accounts, or a `SignerMiddleware` over a local key or a Ledger.
pub struct MiddlewareWallet<M: Middleware> {
    client: Arc<M>,
    /// Set when the signing account is known locally (signer stacks).
    signer_address: Option<Address>,
    /// Chain the signer stack was built for.
    signer_chain_id: Option<u64>,
    options: WatchOptions,
    next_subscription: AtomicU64,
    watchers: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl<M> MiddlewareWallet<M>
where
    M: Middleware + 'static,
{
    pub fn new(client: M, signer_address: Option<Address>, options: WatchOptions) -> Self {
        Self {
            client: Arc::new(client),
            signer_address,
            signer_chain_id: None,
            options,
            next_subscription: AtomicU64::new(1),
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Refuse sends once the wallet reports a chain other than `chain_id`.
    /// Local and Ledger signers embed the chain id in every signature.
    pub fn bound_to_chain(mut self, chain_id: u64) -> Self {
        self.signer_chain_id = Some(chain_id);
        self
    }

    async fn fetch_accounts(client: &M, signer_address: Option<Address>) -> Result<Vec<Address>, ProviderError> {
        match signer_address {
            Some(address) => Ok(vec![address]),
            None => client.get_accounts().await.map_err(classify_error),
        }
    }

    async fn fetch_chain_id(client: &M) -> Result<u64, ProviderError> {
        client
            .get_chainid()
            .await
            .map(|id| id.as_u64())
            .map_err(classify_error)
    }
}

#[async_trait]
impl<M> WalletProvider for MiddlewareWallet<M>
where
    M: Middleware + 'static,
{
    async fn accounts(&self) -> Result<Vec<Address>, ProviderError> {
        Self::fetch_accounts(&self.client, self.signer_address).await
    }

    async fn chain_id(&self) -> Result<u64, ProviderError> {
        Self::fetch_chain_id(&self.client).await
    }

    async fn call(&self, tx: &TypedTransaction) -> Result<Bytes, ProviderError> {
        self.client.call(tx, None).await.map_err(classify_error)
    }

    async fn send_transaction(&self, tx: TypedTransaction) -> Result<TxHash, ProviderError> {
        if let Some(bound) = self.signer_chain_id {
            let current = Self::fetch_chain_id(&self.client).await?;
            if current != bound {
                return Err(ProviderError::Rejected(format!(
                    "signer was opened for chain {} but the wallet is on chain {}; reconnect to sign on this network",
                    bound, current
                )));
            }
        }
        let pending = self
            .client
            .send_transaction(tx, None)
            .await
            .map_err(classify_error)?;
        let tx_hash = pending.tx_hash();
        info!("Transaction accepted by wallet: {:?}", tx_hash);
        Ok(tx_hash)
    }

    async fn wait_for_receipt(&self, tx_hash: TxHash) -> Result<TransactionReceipt, ProviderError> {
        let interval = self.options.poll_interval.max(MIN_POLL_INTERVAL);
        let max_attempts = (self.options.receipt_timeout.as_millis() / interval.as_millis()).max(1);
        let mut attempts = 0u128;

        loop {
            match self.client.get_transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => {}
                Err(e) => debug!("Receipt poll for {:?} failed: {}", tx_hash, e),
            }

            attempts += 1;
            if attempts >= max_attempts {
                return Err(ProviderError::Transport(format!(
                    "Confirmation timeout after {:?}",
                    self.options.receipt_timeout
                )));
            }
            sleep(interval).await;
        }
    }

    fn subscribe(&self, sink: EventSink) -> Option<SubscriptionId> {
        // Watchers are tokio tasks; without a runtime there is no event support.
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let task = runtime.spawn(watch_provider(
            self.client.clone(),
            self.signer_address,
            self.options.clone(),
            sink,
        ));
        match self.watchers.lock() {
            Ok(mut watchers) => {
                watchers.insert(id, task);
            }
            Err(_) => {
                task.abort();
                return None;
            }
        }
        info!("Registered provider watcher #{}", id);
        Some(SubscriptionId(id))
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self
            .watchers
            .lock()
            .ok()
            .and_then(|mut watchers| watchers.remove(&id.0));
        match removed {
            Some(task) => {
                task.abort();
                info!("Removed provider watcher #{}", id.0);
                true
            }
            None => false,
        }
    }

    async fn close(&self) {
        if let Ok(mut watchers) = self.watchers.lock() {
            for (_, task) in watchers.drain() {
                task.abort();
            }
        }
    }
}

/// Poll the node for account, chain and contract-log changes and forward
/// them to `sink` in the order observed.
async fn watch_provider<M>(client: Arc<M>, signer_address: Option<Address>, options: WatchOptions, sink: EventSink)
where
    M: Middleware + 'static,
{
    let mut last_accounts = MiddlewareWallet::<M>::fetch_accounts(&client, signer_address).await.ok();
    let mut last_chain = MiddlewareWallet::<M>::fetch_chain_id(&client).await.ok();
    let mut next_block = client
        .get_block_number()
        .await
        .ok()
        .map(|b| b.as_u64() + 1);
    let mut failures = 0u32;
    let interval = options.poll_interval.max(MIN_POLL_INTERVAL);

    loop {
        sleep(interval).await;

        let polled = async {
            let accounts = MiddlewareWallet::<M>::fetch_accounts(&client, signer_address).await?;
            let chain = MiddlewareWallet::<M>::fetch_chain_id(&client).await?;
            Ok::<_, ProviderError>((accounts, chain))
        }
        .await;

        let (accounts, chain) = match polled {
            Ok(values) => {
                failures = 0;
                values
            }
            Err(e) => {
                failures += 1;
                warn!("Provider poll failed ({}/{}): {}", failures, MAX_WATCH_FAILURES, e);
                if failures >= MAX_WATCH_FAILURES {
                    let _ = sink.send(ProviderEvent::Closed);
                    return;
                }
                continue;
            }
        };

        let mut outgoing = Vec::new();
        if last_accounts.as_ref() != Some(&accounts) {
            outgoing.push(ProviderEvent::AccountsChanged(accounts.clone()));
            last_accounts = Some(accounts);
        }
        if last_chain != Some(chain) {
            outgoing.push(ProviderEvent::NetworkChanged(chain));
            last_chain = Some(chain);
        }

        if let Some(address) = options.log_address {
            if let Ok(head) = client.get_block_number().await {
                let head = head.as_u64();
                let from = next_block.unwrap_or(head);
                if head >= from {
                    let filter = Filter::new().address(address).from_block(from).to_block(head);
                    match client.get_logs(&filter).await {
                        Ok(logs) => {
                            outgoing.extend(logs.into_iter().map(ProviderEvent::Log));
                            next_block = Some(head + 1);
                        }
                        Err(e) => debug!("Log poll failed: {}", e),
                    }
                }
            }
        }

        for event in outgoing {
            if sink.send(event).is_err() {
                debug!("Event receiver dropped, stopping provider watcher");
                return;
            }
        }
    }
}
