//! In-memory wallet and selector used by the unit tests.

use crate::connectors::{SelectedWallet, WalletSelector};
use crate::contract::{self, Candidate, ElectionContract};
use crate::error::{ConnectionError, ProviderError};
use crate::gateway::{ProviderGateway, RequestClient};
use crate::session::ConnectedParts;
use crate::user_settings::MemoryTokenStore;
use crate::wallet::{EventSink, ProviderEvent, SubscriptionId, WalletProvider};
use async_trait::async_trait;
use ethers::abi::Token;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionReceipt, TxHash, H256, I256, U256, U64};
use ethers::utils::keccak256;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Semaphore};

pub(crate) const CONTRACT: Address = Address::repeat_byte(0xee);

pub(crate) fn abi_uint(value: u64) -> Bytes {
    ethers::abi::encode(&[Token::Uint(U256::from(value))]).into()
}

pub(crate) fn abi_int(value: i64) -> Bytes {
    ethers::abi::encode(&[Token::Int(I256::from(value).into_raw())]).into()
}

pub(crate) fn abi_bool(value: bool) -> Bytes {
    ethers::abi::encode(&[Token::Bool(value)]).into()
}

/// Scriptable `WalletProvider`. Reads answer from a calldata-keyed table,
/// sends hand out queued hashes (or keccak of the calldata), and receipts
/// resolve once the test calls `release_receipt`.
pub(crate) struct MockWallet {
    accounts: Mutex<Vec<Address>>,
    chain_id: AtomicU64,
    reads: Mutex<HashMap<Bytes, Result<Bytes, ProviderError>>>,
    read_failure: Mutex<Option<String>>,
    tx_hashes: Mutex<VecDeque<TxHash>>,
    send_failure: Mutex<Option<ProviderError>>,
    sent: Mutex<Vec<Bytes>>,
    receipts: watch::Sender<HashMap<TxHash, u64>>,
    events_supported: bool,
    sink: Mutex<Option<(SubscriptionId, EventSink)>>,
    next_subscription: AtomicU64,
    subscribed: Mutex<Vec<SubscriptionId>>,
    unsubscribed: Mutex<Vec<SubscriptionId>>,
    closes: AtomicUsize,
}

impl MockWallet {
    pub(crate) fn default_account() -> Address {
        Address::repeat_byte(0x11)
    }

    fn build(events_supported: bool) -> Arc<Self> {
        let (receipts, _) = watch::channel(HashMap::new());
        let wallet = Self {
            accounts: Mutex::new(vec![Self::default_account()]),
            chain_id: AtomicU64::new(3),
            reads: Mutex::new(HashMap::new()),
            read_failure: Mutex::new(None),
            tx_hashes: Mutex::new(VecDeque::new()),
            send_failure: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            receipts,
            events_supported,
            sink: Mutex::new(None),
            next_subscription: AtomicU64::new(1),
            subscribed: Mutex::new(Vec::new()),
            unsubscribed: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        };
        wallet.set_seats(0, 0);
        wallet.set_leader(Candidate::A.id() as i64);
        wallet.set_ended(false);
        Arc::new(wallet)
    }

    pub(crate) fn new() -> Arc<Self> {
        Self::build(true)
    }

    pub(crate) fn without_events() -> Arc<Self> {
        Self::build(false)
    }

    pub(crate) fn request_client(self: &Arc<Self>) -> RequestClient {
        RequestClient::from_provider(self.clone())
    }

    // ---- identity ----

    pub(crate) fn set_accounts(&self, accounts: Vec<Address>) {
        *self.accounts.lock().unwrap() = accounts;
    }

    pub(crate) fn set_chain_id(&self, chain_id: u64) {
        self.chain_id.store(chain_id, Ordering::SeqCst);
    }

    // ---- reads ----

    fn set_read(&self, calldata: Bytes, result: Result<Bytes, ProviderError>) {
        self.reads.lock().unwrap().insert(calldata, result);
    }

    pub(crate) fn set_seats(&self, a: u64, b: u64) {
        self.set_read(contract::seats_calldata(Candidate::A).unwrap(), Ok(abi_uint(a)));
        self.set_read(contract::seats_calldata(Candidate::B).unwrap(), Ok(abi_uint(b)));
    }

    pub(crate) fn set_leader(&self, raw: i64) {
        self.set_read(contract::current_leader_calldata().unwrap(), Ok(abi_int(raw)));
    }

    pub(crate) fn set_ended(&self, ended: bool) {
        self.set_read(contract::election_ended_calldata().unwrap(), Ok(abi_bool(ended)));
    }

    pub(crate) fn fail_leader(&self, message: &str) {
        self.set_read(
            contract::current_leader_calldata().unwrap(),
            Err(ProviderError::Rejected(message.to_string())),
        );
    }

    /// Every read fails with `message`.
    pub(crate) fn fail_reads(&self, message: &str) {
        *self.read_failure.lock().unwrap() = Some(message.to_string());
    }

    // ---- writes ----

    pub(crate) fn push_tx_hash(&self, hash: TxHash) {
        self.tx_hashes.lock().unwrap().push_back(hash);
    }

    pub(crate) fn reject_sends(&self, message: &str) {
        *self.send_failure.lock().unwrap() = Some(ProviderError::Rejected(message.to_string()));
    }

    pub(crate) fn sent_calldata(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }

    /// Hash the mock assigns to a send when no hash was queued.
    pub(crate) fn hash_for(calldata: &Bytes) -> TxHash {
        H256::from(keccak256(calldata))
    }

    /// Mine `hash` with the given status. May be called before or after the wait starts.
    pub(crate) fn release_receipt(&self, hash: TxHash, status: u64) {
        self.receipts.send_modify(|receipts| {
            receipts.insert(hash, status);
        });
    }

    // ---- events ----

    pub(crate) fn emit(&self, event: ProviderEvent) -> bool {
        match self.sink.lock().unwrap().as_ref() {
            Some((_, sink)) => sink.send(event).is_ok(),
            None => false,
        }
    }

    pub(crate) fn subscribed_ids(&self) -> Vec<SubscriptionId> {
        self.subscribed.lock().unwrap().clone()
    }

    pub(crate) fn unsubscribed_ids(&self) -> Vec<SubscriptionId> {
        self.unsubscribed.lock().unwrap().clone()
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WalletProvider for MockWallet {
    async fn accounts(&self) -> Result<Vec<Address>, ProviderError> {
        Ok(self.accounts.lock().unwrap().clone())
    }

    async fn chain_id(&self) -> Result<u64, ProviderError> {
        Ok(self.chain_id.load(Ordering::SeqCst))
    }

    async fn call(&self, tx: &TypedTransaction) -> Result<Bytes, ProviderError> {
        if let Some(message) = self.read_failure.lock().unwrap().clone() {
            return Err(ProviderError::Rejected(message));
        }
        let data = tx.data().cloned().unwrap_or_default();
        self.reads
            .lock()
            .unwrap()
            .get(&data)
            .cloned()
            .unwrap_or_else(|| Err(ProviderError::Rejected(format!("unexpected call {}", data))))
    }

    async fn send_transaction(&self, tx: TypedTransaction) -> Result<TxHash, ProviderError> {
        let data = tx.data().cloned().unwrap_or_default();
        if let Some(err) = self.send_failure.lock().unwrap().clone() {
            return Err(err);
        }
        self.sent.lock().unwrap().push(data.clone());
        let queued = self.tx_hashes.lock().unwrap().pop_front();
        Ok(queued.unwrap_or_else(|| Self::hash_for(&data)))
    }

    async fn wait_for_receipt(&self, tx_hash: TxHash) -> Result<TransactionReceipt, ProviderError> {
        let mut rx = self.receipts.subscribe();
        loop {
            let status = rx.borrow_and_update().get(&tx_hash).copied();
            if let Some(status) = status {
                return Ok(TransactionReceipt {
                    transaction_hash: tx_hash,
                    status: Some(U64::from(status)),
                    ..Default::default()
                });
            }
            if rx.changed().await.is_err() {
                return Err(ProviderError::Transport("mock dropped".into()));
            }
        }
    }

    fn subscribe(&self, sink: EventSink) -> Option<SubscriptionId> {
        if !self.events_supported {
            return None;
        }
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        *self.sink.lock().unwrap() = Some((id, sink));
        self.subscribed.lock().unwrap().push(id);
        Some(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut sink = self.sink.lock().unwrap();
        match sink.as_ref() {
            Some((current, _)) if *current == id => {
                *sink = None;
                self.unsubscribed.lock().unwrap().push(id);
                true
            }
            _ => false,
        }
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Selector that hands out mock wallets under the token "mock".
pub(crate) struct MockSelector {
    wallets: Mutex<VecDeque<Arc<MockWallet>>>,
    fallback: Option<Arc<MockWallet>>,
    seen: Arc<Mutex<Vec<Option<String>>>>,
    gate: Option<Arc<Semaphore>>,
}

impl MockSelector {
    fn build(wallets: Vec<Arc<MockWallet>>, fallback: Option<Arc<MockWallet>>) -> Self {
        Self {
            wallets: Mutex::new(wallets.into()),
            fallback,
            seen: Arc::new(Mutex::new(Vec::new())),
            gate: None,
        }
    }

    pub(crate) fn always(wallet: Arc<MockWallet>) -> Self {
        Self::build(Vec::new(), Some(wallet))
    }

    /// One wallet per `select` call, in order; aborts once exhausted.
    pub(crate) fn sequence(wallets: Vec<Arc<MockWallet>>) -> Self {
        Self::build(wallets, None)
    }

    pub(crate) fn aborting() -> Self {
        Self::build(Vec::new(), None)
    }

    /// Every `select` blocks until the test adds a permit to the returned semaphore.
    pub(crate) fn gated(mut self) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        self.gate = Some(gate.clone());
        (self, gate)
    }

    pub(crate) fn seen_tokens(&self) -> Arc<Mutex<Vec<Option<String>>>> {
        self.seen.clone()
    }
}

#[async_trait]
impl WalletSelector for MockSelector {
    async fn select(&self, cached_token: Option<&str>) -> Result<SelectedWallet, ConnectionError> {
        self.seen.lock().unwrap().push(cached_token.map(str::to_string));
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| ConnectionError::Aborted)?
                .forget();
        }
        let next = self.wallets.lock().unwrap().pop_front();
        let wallet = next.or_else(|| self.fallback.clone()).ok_or(ConnectionError::Aborted)?;
        Ok(SelectedWallet {
            token: "mock".to_string(),
            provider: wallet,
        })
    }
}

/// Connect a fresh gateway to `wallet` and assemble the parts a session commits.
pub(crate) fn connected_parts(wallet: &Arc<MockWallet>) -> ConnectedParts {
    let gateway = ProviderGateway::new(
        Arc::new(MockSelector::always(wallet.clone())),
        Arc::new(MemoryTokenStore::default()),
    );
    let handle = tokio_test::block_on(gateway.connect()).unwrap();
    let identity = tokio_test::block_on(gateway.derive_identity(&handle)).unwrap();
    let client = gateway.requests(&handle).unwrap();
    ConnectedParts {
        handle,
        identity,
        contract: ElectionContract::new(CONTRACT, identity.account, client),
        has_ended: false,
    }
}
