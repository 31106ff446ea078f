//! Single-owner session driver.
//!
//! `SessionDriver::run` is the only code that touches the `Session`. It
//! multiplexes three inputs:
//! - presentation commands,
//! - provider events of the current connection (one channel per connection),
//! - completions of spawned remote calls, tagged with the epoch they belong to.
//!
//! After every input a fresh `SessionSnapshot` is published on a watch channel.

use crate::contract::{describe_log, Candidate, ElectionContract, PendingWrite, Receipt, SeatCounts, StateResult};
use crate::error::{ConnectionError, IdentityError, RemoteCallError, SessionError};
use crate::gateway::{Identity, ProviderGateway, ProviderHandle};
use crate::notifications::InfoMessage;
use crate::operation_log::OperationLog;
use crate::session::{
    AccountChange, ConnectedParts, ConnectionStatus, FormField, Session, SessionEpoch, SessionSnapshot, WriteTicket,
};
use crate::tracker::{RefreshScope, TxKind};
use crate::wallet::ProviderEvent;
use ethers::types::Address;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Intents accepted from the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect,
    Reset,
    RefreshSeats,
    RefreshLeader,
    RefreshHasEnded,
    UpdateField(FormField, String),
    SubmitResult,
    EndElection,
    ResumeElection,
    Shutdown,
}

struct FailedConnect {
    handle: Option<ProviderHandle>,
    error: ConnectionError,
}

enum Completion {
    Connected {
        epoch: SessionEpoch,
        result: Result<ConnectedParts, FailedConnect>,
    },
    Identity {
        epoch: SessionEpoch,
        result: Result<Identity, IdentityError>,
    },
    Seats {
        epoch: SessionEpoch,
        result: Result<SeatCounts, RemoteCallError>,
    },
    Leader {
        epoch: SessionEpoch,
        result: Result<Candidate, RemoteCallError>,
    },
    HasEnded {
        epoch: SessionEpoch,
        result: Result<bool, RemoteCallError>,
    },
    WriteAccepted {
        ticket: WriteTicket,
        result: Result<PendingWrite, RemoteCallError>,
    },
    WriteSettled {
        ticket: WriteTicket,
        result: Result<Receipt, RemoteCallError>,
    },
}

/// Presentation-side handle: sends commands and reads snapshots.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    /// Queue a command. Fails only once the driver has stopped.
    pub fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands.send(command).map_err(|_| SessionError::NotConnected)
    }

    pub fn connect(&self) -> Result<(), SessionError> {
        self.send(Command::Connect)
    }

    pub fn reset(&self) -> Result<(), SessionError> {
        self.send(Command::Reset)
    }

    pub fn update_field(&self, field: FormField, raw: impl Into<String>) -> Result<(), SessionError> {
        self.send(Command::UpdateField(field, raw.into()))
    }

    pub fn submit_result(&self) -> Result<(), SessionError> {
        self.send(Command::SubmitResult)
    }

    pub fn shutdown(&self) -> Result<(), SessionError> {
        self.send(Command::Shutdown)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Resolve with the first published snapshot satisfying `predicate`
    /// (the current one included). `None` once the driver is gone.
    pub async fn wait_until(&self, predicate: impl FnMut(&SessionSnapshot) -> bool) -> Option<SessionSnapshot> {
        let mut rx = self.snapshots.clone();
        let snapshot = rx.wait_for(predicate).await.ok()?;
        Some(snapshot.clone())
    }
}

pub struct SessionDriver {
    session: Session,
    gateway: Arc<ProviderGateway>,
    contract_address: Address,
    commands: mpsc::UnboundedReceiver<Command>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
    events: Option<mpsc::UnboundedReceiver<ProviderEvent>>,
    snapshots: watch::Sender<SessionSnapshot>,
    operation_log: Option<OperationLog>,
}

impl SessionDriver {
    pub fn new(
        gateway: Arc<ProviderGateway>,
        contract_address: Address,
        default_chain_id: u64,
        operation_log: Option<OperationLog>,
    ) -> (Self, SessionHandle) {
        let session = Session::new(default_chain_id);
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (completion_tx, completions) = mpsc::unbounded_channel();
        let (snapshots, snapshot_rx) = watch::channel(session.snapshot());

        let driver = Self {
            session,
            gateway,
            contract_address,
            commands,
            completion_tx,
            completions,
            events: None,
            snapshots,
            operation_log,
        };
        let handle = SessionHandle {
            commands: command_tx,
            snapshots: snapshot_rx,
        };
        (driver, handle)
    }

    /// Build a driver and run it on the current tokio runtime.
    pub fn spawn(
        gateway: Arc<ProviderGateway>,
        contract_address: Address,
        default_chain_id: u64,
        operation_log: Option<OperationLog>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (driver, handle) = Self::new(gateway, contract_address, default_chain_id, operation_log);
        (handle, tokio::spawn(driver.run()))
    }

    pub async fn run(mut self) {
        if self.gateway.has_cached_provider() {
            info!("Cached provider found, reconnecting");
            self.start_connect().await;
            self.publish();
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                event = next_event(&mut self.events) => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        debug!("Provider event stream ended");
                        self.events = None;
                    }
                },
                Some(completion) = self.completions.recv() => self.handle_completion(completion).await,
            }
            self.publish();
        }

        if let Some(mut handle) = self.session.reset() {
            self.gateway.release(&mut handle).await;
        }
        self.publish();
        info!("Session driver stopped");
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.session.snapshot());
    }

    fn spawn_task<F>(&self, task: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            // The driver may already be gone; nothing to report to then.
            let _ = completions.send(task.await);
        });
    }

    fn log_operation(&self, operation: &str, details: String) {
        if let Some(log) = &self.operation_log {
            if let Err(e) = log.append(operation, self.session.chain_id(), details) {
                warn!("Failed to write operation log: {}", e);
            }
        }
    }

    // ==================== commands ====================

    async fn handle_command(&mut self, command: Command) {
        debug!("Command: {:?}", command);
        match command {
            Command::Connect => self.start_connect().await,
            Command::Reset => self.reset().await,
            Command::RefreshSeats => self.refresh(RefreshScope::Seats),
            Command::RefreshLeader => self.refresh_leader(),
            Command::RefreshHasEnded => self.refresh(RefreshScope::HasEnded),
            Command::UpdateField(field, raw) => {
                let _ = self.session.update_form(field, &raw);
            }
            Command::SubmitResult => match self.session.begin_submission() {
                Ok((ticket, result)) => self.dispatch_submission(ticket, result),
                Err(e) => info!("Submission rejected: {}", e),
            },
            Command::EndElection => {
                self.dispatch_write(TxKind::EndElection, |contract| async move { contract.end_election().await })
            }
            Command::ResumeElection => {
                self.dispatch_write(TxKind::ResumeElection, |contract| async move { contract.resume_election().await })
            }
            Command::Shutdown => {}
        }
    }

    async fn start_connect(&mut self) {
        let (epoch, previous) = self.session.begin_connect();
        self.events = None;
        if let Some(mut previous) = previous {
            self.gateway.release(&mut previous).await;
        }
        self.publish();

        let gateway = self.gateway.clone();
        let contract_address = self.contract_address;
        self.spawn_task(async move {
            Completion::Connected {
                epoch,
                result: connect_sequence(gateway, contract_address).await,
            }
        });
    }

    async fn reset(&mut self) {
        self.events = None;
        let mut handle = self.session.reset();
        self.gateway.disconnect(handle.as_mut()).await;
    }

    fn refresh(&mut self, scope: RefreshScope) {
        let Some((epoch, contract)) = self.session.begin_read() else {
            debug!("Refresh {:?} skipped: not connected", scope);
            return;
        };
        match scope {
            RefreshScope::Seats => self.spawn_task(async move {
                Completion::Seats {
                    epoch,
                    result: contract.seat_counts().await,
                }
            }),
            RefreshScope::HasEnded => self.spawn_task(async move {
                Completion::HasEnded {
                    epoch,
                    result: contract.election_ended().await,
                }
            }),
        }
    }

    fn refresh_leader(&mut self) {
        let Some((epoch, contract)) = self.session.begin_read() else {
            debug!("Leader refresh skipped: not connected");
            return;
        };
        self.spawn_task(async move {
            Completion::Leader {
                epoch,
                result: contract.current_leader().await,
            }
        });
    }

    fn dispatch_submission(&mut self, ticket: WriteTicket, result: StateResult) {
        info!(
            "Submitting {}: {} {} / {} {} / {} seats",
            result.region,
            Candidate::A.label(),
            result.votes_a,
            Candidate::B.label(),
            result.votes_b,
            result.seats
        );
        self.spawn_task(async move {
            let sent = ticket.contract.submit_state_result(&result).await;
            Completion::WriteAccepted { ticket, result: sent }
        });
    }

    fn dispatch_write<F, Fut>(&mut self, kind: TxKind, send: F)
    where
        F: FnOnce(ElectionContract) -> Fut,
        Fut: Future<Output = Result<PendingWrite, RemoteCallError>> + Send + 'static,
    {
        let Ok(ticket) = self.session.begin_write(kind) else {
            return;
        };
        info!("Dispatching {}", kind.operation_name());
        let sent = send(ticket.contract.clone());
        self.spawn_task(async move {
            Completion::WriteAccepted {
                ticket,
                result: sent.await,
            }
        });
    }

    // ==================== provider events ====================

    async fn handle_event(&mut self, event: ProviderEvent) {
        debug!("Provider event: {:?}", event);
        match event {
            ProviderEvent::Closed => {
                info!("Provider closed the connection");
                self.reset().await;
                self.session
                    .push_info(InfoMessage::new("Wallet provider closed the connection; connect again to continue"));
            }
            ProviderEvent::AccountsChanged(accounts) => match self.session.accounts_changed(&accounts) {
                AccountChange::Reset(mut handle) => {
                    self.events = None;
                    self.gateway.disconnect(handle.as_mut()).await;
                }
                AccountChange::Switched(_) | AccountChange::Ignored => {}
            },
            ProviderEvent::NetworkChanged(chain_id) => {
                if !self.session.network_changed(chain_id) {
                    return;
                }
                let epoch = self.session.epoch();
                if let Some(client) = self.session.handle().and_then(|h| self.gateway.requests(h)) {
                    self.spawn_task(async move {
                        Completion::Identity {
                            epoch,
                            result: client.identity().await,
                        }
                    });
                }
            }
            ProviderEvent::Log(log) => self.session.log_event(describe_log(&log)),
        }
    }

    // ==================== completions ====================

    async fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Connected { epoch, result } => self.finish_connect(epoch, result).await,
            Completion::Identity { epoch, result } => {
                self.session.apply_identity(epoch, result);
            }
            Completion::Seats { epoch, result } => {
                self.session.apply_seats(epoch, result);
            }
            Completion::Leader { epoch, result } => {
                self.session.apply_leader(epoch, result);
            }
            Completion::HasEnded { epoch, result } => {
                self.session.apply_has_ended(epoch, result);
            }
            Completion::WriteAccepted { ticket, result } => self.finish_dispatch(ticket, result),
            Completion::WriteSettled { ticket, result } => self.finish_write(ticket, result),
        }
    }

    async fn finish_connect(&mut self, epoch: SessionEpoch, result: Result<ConnectedParts, FailedConnect>) {
        match result {
            Ok(parts) => {
                if let Err(mut stale) = self.session.complete_connect(epoch, parts) {
                    // After a reset nothing may stay cached; a newer attempt keeps its token.
                    if self.session.status() == ConnectionStatus::Disconnected {
                        self.gateway.disconnect(Some(&mut stale)).await;
                    } else {
                        self.gateway.release(&mut stale).await;
                    }
                    return;
                }
                let (event_tx, event_rx) = mpsc::unbounded_channel();
                if let Some(handle) = self.session.handle_mut() {
                    if self.gateway.subscribe(handle, event_tx) {
                        self.events = Some(event_rx);
                    }
                }
                self.refresh_leader();
                self.refresh(RefreshScope::Seats);
            }
            Err(FailedConnect { handle, error: e }) => {
                if let Some(mut handle) = handle {
                    self.gateway.release(&mut handle).await;
                }
                if self.session.fail_connect(epoch, &e) {
                    error!("Connection failed: {}", e);
                }
            }
        }
    }

    fn finish_dispatch(&mut self, ticket: WriteTicket, result: Result<PendingWrite, RemoteCallError>) {
        let operation = ticket.kind.operation_name();
        match &result {
            Ok(pending) => self.log_operation(operation, format!("dispatched\ntx: {:?}", pending.tx_hash)),
            Err(e) => self.log_operation(operation, format!("rejected\nerror: {}", e)),
        }

        let tx_hash = result.as_ref().ok().map(|pending| pending.tx_hash);
        if !self.session.write_accepted(ticket.epoch, ticket.id, result) {
            return;
        }
        let Some(tx_hash) = tx_hash else {
            return;
        };
        self.spawn_task(async move {
            let receipt = ticket.contract.wait_for_receipt(tx_hash).await;
            Completion::WriteSettled { ticket, result: receipt }
        });
    }

    fn finish_write(&mut self, ticket: WriteTicket, result: Result<Receipt, RemoteCallError>) {
        let operation = ticket.kind.operation_name();
        match &result {
            Ok(receipt) if receipt.is_success() => {
                self.log_operation(operation, format!("confirmed\ntx: {:?}", receipt.tx_hash))
            }
            Ok(receipt) => self.log_operation(operation, format!("reverted\ntx: {:?}", receipt.tx_hash)),
            Err(e) => self.log_operation(operation, format!("failed\nerror: {}", e)),
        }

        if let Some(scope) = self.session.write_settled(ticket.epoch, ticket.id, result) {
            self.refresh(scope);
        }
    }
}

/// Next event of the current connection; pending forever while there is none.
async fn next_event(events: &mut Option<mpsc::UnboundedReceiver<ProviderEvent>>) -> Option<ProviderEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// connect → identity → initial `electionEnded` read. On failure after the
/// handle exists, the handle is returned so the driver can release it.
async fn connect_sequence(
    gateway: Arc<ProviderGateway>,
    contract_address: Address,
) -> Result<ConnectedParts, FailedConnect> {
    let handle = gateway
        .connect()
        .await
        .map_err(|error| FailedConnect { handle: None, error })?;

    let identity = match gateway.derive_identity(&handle).await {
        Ok(identity) => identity,
        Err(e) => {
            return Err(FailedConnect {
                handle: Some(handle),
                error: e.into(),
            })
        }
    };

    let Some(client) = gateway.requests(&handle) else {
        return Err(FailedConnect {
            handle: Some(handle),
            error: ConnectionError::Transport("provider handle already released".into()),
        });
    };
    let contract = ElectionContract::new(contract_address, identity.account, client);

    match contract.election_ended().await {
        Ok(has_ended) => Ok(ConnectedParts {
            handle,
            identity,
            contract,
            has_ended,
        }),
        Err(e) => Err(FailedConnect {
            handle: Some(handle),
            error: ConnectionError::InitialRead(e),
        }),
    }
}
