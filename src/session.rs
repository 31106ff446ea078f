//! Session state and its named transitions.
//!
//! `Session` is owned by exactly one driver; every field changes through a
//! method here. Asynchronous results carry the `SessionEpoch` they were
//! started under and are dropped once a reset or reconnect moved the epoch on.

use crate::contract::{Candidate, ElectionContract, PendingWrite, Receipt, SeatCounts, StateResult};
use crate::error::{ConnectionError, IdentityError, RemoteCallError, SessionError, ValidationError};
use crate::gateway::{Identity, ProviderHandle};
use crate::notifications::{InfoLog, InfoMessage};
use crate::tracker::{RefreshScope, Settlement, TrackedTransaction, TxId, TxKind, TxSlot};
use ethers::types::Address;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Cached contract reads. A failed read never overwrites a field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElectionSnapshot {
    pub seats: SeatCounts,
    /// Empty until the first successful `currentLeader` read
    pub current_leader_label: String,
    pub has_ended: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormField {
    Region,
    VotesA,
    VotesB,
    Seats,
}

impl FormField {
    fn label(&self) -> &'static str {
        match self {
            FormField::Region => "state name",
            FormField::VotesA => Candidate::A.label(),
            FormField::VotesB => Candidate::B.label(),
            FormField::Seats => "seat count",
        }
    }
}

/// Operator-entered state result awaiting submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmittedForm {
    pub region_name: String,
    pub votes_a: u64,
    pub votes_b: u64,
    pub delegate_seats: u64,
}

impl SubmittedForm {
    /// Parse raw text input into one field. Empty numeric input means zero.
    pub fn set_field(&mut self, field: FormField, raw: &str) -> Result<(), ValidationError> {
        let raw = raw.trim();
        if field == FormField::Region {
            self.region_name = raw.to_string();
            return Ok(());
        }

        let value = if raw.is_empty() {
            0
        } else {
            raw.parse::<u64>().map_err(|_| ValidationError::NotANumber {
                field: field.label(),
                value: raw.to_string(),
            })?
        };
        match field {
            FormField::VotesA => self.votes_a = value,
            FormField::VotesB => self.votes_b = value,
            FormField::Seats => self.delegate_seats = value,
            FormField::Region => {}
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<StateResult, ValidationError> {
        let region = self.region_name.trim();
        if region.is_empty() {
            return Err(ValidationError::EmptyRegion);
        }
        if self.votes_a == 0 {
            return Err(ValidationError::ZeroVotes(Candidate::A.label()));
        }
        if self.votes_b == 0 {
            return Err(ValidationError::ZeroVotes(Candidate::B.label()));
        }
        if self.delegate_seats == 0 {
            return Err(ValidationError::ZeroSeats);
        }
        let seats = u8::try_from(self.delegate_seats)
            .map_err(|_| ValidationError::SeatsOutOfRange(self.delegate_seats))?;

        Ok(StateResult {
            region: region.to_string(),
            votes_a: self.votes_a,
            votes_b: self.votes_b,
            seats,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionEpoch(u64);

/// Everything a successful connect sequence produced.
pub struct ConnectedParts {
    pub handle: ProviderHandle,
    pub identity: Identity,
    pub contract: ElectionContract,
    pub has_ended: bool,
}

/// Permission to run one contract write for the current session.
#[derive(Clone)]
pub struct WriteTicket {
    pub epoch: SessionEpoch,
    pub id: TxId,
    pub kind: TxKind,
    pub contract: ElectionContract,
}

/// Outcome of an `accountsChanged` notification.
#[derive(Debug)]
pub enum AccountChange {
    /// Empty account list: the session was reset; the handle must be disconnected.
    Reset(Option<ProviderHandle>),
    Switched(Address),
    Ignored,
}

/// Immutable view handed to the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub connection_status: ConnectionStatus,
    pub account_address: Option<Address>,
    pub chain_id: u64,
    pub election: ElectionSnapshot,
    pub active_transaction: Option<TrackedTransaction>,
    pub last_info: Option<InfoMessage>,
    pub fetching: bool,
    pub form: SubmittedForm,
}

impl SessionSnapshot {
    pub fn is_connected(&self) -> bool {
        self.connection_status == ConnectionStatus::Connected
    }
}

pub struct Session {
    status: ConnectionStatus,
    account: Option<Address>,
    chain_id: u64,
    default_chain_id: u64,
    handle: Option<ProviderHandle>,
    contract: Option<ElectionContract>,
    election: ElectionSnapshot,
    tx: TxSlot,
    form: SubmittedForm,
    info: InfoLog,
    reads_in_flight: u32,
    epoch: u64,
}

impl Session {
    pub fn new(default_chain_id: u64) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            account: None,
            chain_id: default_chain_id,
            default_chain_id,
            handle: None,
            contract: None,
            election: ElectionSnapshot::default(),
            tx: TxSlot::default(),
            form: SubmittedForm::default(),
            info: InfoLog::default(),
            reads_in_flight: 0,
            epoch: 0,
        }
    }

    // ---- accessors ----

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn account(&self) -> Option<Address> {
        self.account
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn epoch(&self) -> SessionEpoch {
        SessionEpoch(self.epoch)
    }

    pub fn is_current(&self, epoch: SessionEpoch) -> bool {
        epoch.0 == self.epoch
    }

    pub fn election(&self) -> &ElectionSnapshot {
        &self.election
    }

    pub fn form(&self) -> &SubmittedForm {
        &self.form
    }

    pub fn active_transaction(&self) -> Option<&TrackedTransaction> {
        self.tx.current()
    }

    pub fn last_info(&self) -> Option<&InfoMessage> {
        self.info.last()
    }

    pub fn contract(&self) -> Option<&ElectionContract> {
        self.contract.as_ref()
    }

    pub fn handle(&self) -> Option<&ProviderHandle> {
        self.handle.as_ref()
    }

    pub fn handle_mut(&mut self) -> Option<&mut ProviderHandle> {
        self.handle.as_mut()
    }

    pub fn fetching(&self) -> bool {
        self.status == ConnectionStatus::Connecting || self.reads_in_flight > 0 || self.tx.is_busy()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connection_status: self.status,
            account_address: self.account,
            chain_id: self.chain_id,
            election: self.election.clone(),
            active_transaction: self.tx.current().cloned(),
            last_info: self.info.last().cloned(),
            fetching: self.fetching(),
            form: self.form.clone(),
        }
    }

    pub fn push_info(&mut self, entry: InfoMessage) {
        debug!("info: {}", entry.message);
        self.info.push(entry);
    }

    // ---- connection lifecycle ----

    /// Drop every session-scoped value and advance the epoch. Returns the
    /// provider handle, which the caller must release exactly once.
    fn teardown(&mut self) -> Option<ProviderHandle> {
        self.epoch += 1;
        self.account = None;
        self.contract = None;
        self.election = ElectionSnapshot::default();
        self.tx.clear();
        self.form = SubmittedForm::default();
        self.reads_in_flight = 0;
        self.handle.take()
    }

    /// Enter `Connecting`. Any previous connection is torn down and its
    /// handle returned for release.
    pub fn begin_connect(&mut self) -> (SessionEpoch, Option<ProviderHandle>) {
        let previous = self.teardown();
        self.status = ConnectionStatus::Connecting;
        info!("Connecting (epoch {})", self.epoch);
        (self.epoch(), previous)
    }

    /// Commit a finished connect sequence. A stale result hands the handle
    /// back so it can be released.
    pub fn complete_connect(&mut self, epoch: SessionEpoch, parts: ConnectedParts) -> Result<(), ProviderHandle> {
        if !self.is_current(epoch) || self.status != ConnectionStatus::Connecting {
            debug!("Discarding connect result from epoch {:?}", epoch);
            return Err(parts.handle);
        }

        self.status = ConnectionStatus::Connected;
        self.account = Some(parts.identity.account);
        self.chain_id = parts.identity.chain_id;
        self.handle = Some(parts.handle);
        self.contract = Some(parts.contract);
        self.election = ElectionSnapshot {
            has_ended: parts.has_ended,
            ..ElectionSnapshot::default()
        };
        self.tx.clear();
        self.form = SubmittedForm::default();
        info!(
            "Connected as {:?} on chain {} ({})",
            parts.identity.account,
            self.chain_id,
            crate::config::network_label(self.chain_id)
        );
        Ok(())
    }

    /// Returns false when the failure belongs to a superseded attempt.
    pub fn fail_connect(&mut self, epoch: SessionEpoch, error: &ConnectionError) -> bool {
        if !self.is_current(epoch) || self.status != ConnectionStatus::Connecting {
            return false;
        }
        warn!("Connect failed: {}", error);
        self.status = ConnectionStatus::Disconnected;
        self.chain_id = self.default_chain_id;
        self.push_info(InfoMessage::failure(error));
        true
    }

    /// Back to the initial state from anywhere. Returns the provider handle
    /// for the caller to disconnect.
    pub fn reset(&mut self) -> Option<ProviderHandle> {
        let handle = self.teardown();
        self.status = ConnectionStatus::Disconnected;
        self.chain_id = self.default_chain_id;
        self.info.clear();
        info!("Session reset (epoch {})", self.epoch);
        handle
    }

    pub fn accounts_changed(&mut self, accounts: &[Address]) -> AccountChange {
        let Some(first) = accounts.first().copied() else {
            info!("Wallet exposed no accounts, resetting session");
            return AccountChange::Reset(self.reset());
        };
        if self.status != ConnectionStatus::Connected {
            return AccountChange::Ignored;
        }
        self.account = Some(first);
        self.contract = self.contract.as_ref().map(|c| c.with_sender(first));
        info!("Active account changed to {:?}", first);
        AccountChange::Switched(first)
    }

    /// Provider reported a network switch. The read cache is left as is.
    pub fn network_changed(&mut self, chain_id: u64) -> bool {
        if self.status != ConnectionStatus::Connected {
            return false;
        }
        if self.chain_id != chain_id {
            info!("Network changed: {} -> {}", self.chain_id, chain_id);
        }
        self.chain_id = chain_id;
        true
    }

    /// Identity re-derived after a network change.
    pub fn apply_identity(&mut self, epoch: SessionEpoch, result: Result<Identity, IdentityError>) -> bool {
        if !self.is_current(epoch) || self.status != ConnectionStatus::Connected {
            return false;
        }
        match result {
            Ok(identity) => {
                self.chain_id = identity.chain_id;
                if self.account != Some(identity.account) {
                    self.account = Some(identity.account);
                    self.contract = self.contract.as_ref().map(|c| c.with_sender(identity.account));
                }
                true
            }
            Err(e) => {
                warn!("Identity re-derivation failed: {}", e);
                self.push_info(InfoMessage::failure(format!("[func: networkChanged] {}", e)));
                false
            }
        }
    }

    pub fn log_event(&mut self, message: String) {
        info!("Provider log: {}", message);
        self.push_info(InfoMessage::new(message));
    }

    // ---- reads ----

    /// Start a refresh read; `None` when not connected.
    pub fn begin_read(&mut self) -> Option<(SessionEpoch, ElectionContract)> {
        if self.status != ConnectionStatus::Connected {
            return None;
        }
        let contract = self.contract.clone()?;
        self.reads_in_flight += 1;
        Some((self.epoch(), contract))
    }

    fn finish_read<T>(&mut self, epoch: SessionEpoch, result: Result<T, RemoteCallError>) -> Option<T> {
        if !self.is_current(epoch) {
            debug!("Discarding read result from epoch {:?}", epoch);
            return None;
        }
        self.reads_in_flight = self.reads_in_flight.saturating_sub(1);
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Refresh failed: {}", e);
                self.push_info(InfoMessage::failure(&e));
                None
            }
        }
    }

    pub fn apply_seats(&mut self, epoch: SessionEpoch, result: Result<SeatCounts, RemoteCallError>) -> bool {
        match self.finish_read(epoch, result) {
            Some(seats) => {
                self.election.seats = seats;
                true
            }
            None => false,
        }
    }

    pub fn apply_leader(&mut self, epoch: SessionEpoch, result: Result<Candidate, RemoteCallError>) -> bool {
        match self.finish_read(epoch, result) {
            Some(leader) => {
                self.election.current_leader_label = leader.label().to_string();
                true
            }
            None => false,
        }
    }

    pub fn apply_has_ended(&mut self, epoch: SessionEpoch, result: Result<bool, RemoteCallError>) -> bool {
        match self.finish_read(epoch, result) {
            Some(has_ended) => {
                self.election.has_ended = has_ended;
                true
            }
            None => false,
        }
    }

    // ---- form and writes ----

    pub fn update_form(&mut self, field: FormField, raw: &str) -> Result<(), ValidationError> {
        let result = self.form.set_field(field, raw);
        if let Err(e) = &result {
            self.push_info(InfoMessage::failure(e));
        }
        result
    }

    fn require_connected(&mut self, kind: TxKind) -> Result<ElectionContract, SessionError> {
        match (&self.status, &self.contract) {
            (ConnectionStatus::Connected, Some(contract)) => Ok(contract.clone()),
            _ => {
                self.push_info(InfoMessage::failure(format!(
                    "[func: {}] {}",
                    kind.operation_name(),
                    SessionError::NotConnected
                )));
                Err(SessionError::NotConnected)
            }
        }
    }

    /// Claim the tracking slot for a write.
    pub fn begin_write(&mut self, kind: TxKind) -> Result<WriteTicket, SessionError> {
        let contract = self.require_connected(kind)?;
        let id = self.tx.begin(kind);
        Ok(WriteTicket {
            epoch: self.epoch(),
            id,
            kind,
            contract,
        })
    }

    /// Validate the form and claim the slot for `submitStateResult`. The form
    /// is cleared on dispatch; a validation failure leaves it untouched.
    pub fn begin_submission(&mut self) -> Result<(WriteTicket, StateResult), SessionError> {
        self.require_connected(TxKind::SubmitResult)?;
        let result = match self.form.validate() {
            Ok(result) => result,
            Err(e) => {
                self.push_info(InfoMessage::failure(format!(
                    "[func: {}] {}",
                    TxKind::SubmitResult.operation_name(),
                    e
                )));
                return Err(e.into());
            }
        };
        let ticket = self.begin_write(TxKind::SubmitResult)?;
        self.form = SubmittedForm::default();
        Ok((ticket, result))
    }

    /// Wallet answered the write request. True when a receipt should now be awaited.
    pub fn write_accepted(&mut self, epoch: SessionEpoch, id: TxId, result: Result<PendingWrite, RemoteCallError>) -> bool {
        if !self.is_current(epoch) {
            return false;
        }
        match result {
            Ok(pending) => self.tx.accept(id, pending.tx_hash, self.chain_id),
            Err(e) => {
                if self.tx.fail(id) {
                    self.push_info(InfoMessage::failure(&e));
                }
                false
            }
        }
    }

    /// Receipt (or receipt error) arrived. Returns the snapshot fields to
    /// refresh when the write confirmed.
    pub fn write_settled(&mut self, epoch: SessionEpoch, id: TxId, result: Result<Receipt, RemoteCallError>) -> Option<RefreshScope> {
        if !self.is_current(epoch) {
            return None;
        }
        match result {
            Ok(receipt) => match self.tx.settle(id, &receipt)? {
                Settlement::Confirmed(scope) => Some(scope),
                Settlement::Failed(failure) => {
                    let operation = self
                        .tx
                        .current()
                        .map(|tx| tx.kind.operation_name())
                        .unwrap_or("transaction");
                    let link = self.tx.current().and_then(|tx| tx.explorer_link.clone());
                    let mut entry = InfoMessage::failure(format!(
                        "[func: {}] Unsuccessful transaction! {}",
                        operation, failure
                    ));
                    if let Some(link) = link {
                        entry = entry.with_link(link);
                    }
                    self.push_info(entry);
                    None
                }
            },
            Err(e) => {
                if self.tx.fail(id) {
                    self.push_info(InfoMessage::failure(&e));
                }
                None
            }
        }
    }
}
