//! Transaction tracking for contract writes.
//!
//! A write moves `Submitted -> Pending -> Confirmed | Failed`. Terminal
//! states are final. Only one transaction occupies the visible slot; results
//! for a transaction that no longer owns the slot are dropped.

use crate::config::get_tx_explorer_url;
use crate::contract::Receipt;
use crate::error::ReceiptFailure;
use ethers::types::TxHash;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Which contract write is being tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKind {
    SubmitResult,
    EndElection,
    ResumeElection,
}

impl TxKind {
    pub fn operation_name(&self) -> &'static str {
        match self {
            TxKind::SubmitResult => "submitElectionResult",
            TxKind::EndElection => "endElection",
            TxKind::ResumeElection => "resumeElection",
        }
    }

    fn description(&self) -> &'static str {
        match self {
            TxKind::SubmitResult => "election result",
            TxKind::EndElection => "end of election",
            TxKind::ResumeElection => "election resume",
        }
    }

    /// Snapshot fields a confirmed write of this kind invalidates.
    pub fn refresh_scope(&self) -> RefreshScope {
        match self {
            TxKind::SubmitResult => RefreshScope::Seats,
            TxKind::EndElection | TxKind::ResumeElection => RefreshScope::HasEnded,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshScope {
    Seats,
    HasEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Handed to the wallet, no hash yet
    Submitted,
    /// Hash known, waiting to be mined
    Pending,
    /// Mined with success status
    Confirmed,
    /// Rejected, reverted, or errored
    Failed,
}

impl TxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Confirmed | TxStatus::Failed)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxId(pub u64);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("transaction {id:?} cannot move from {from:?} to {to:?}")]
pub struct TransitionError {
    pub id: TxId,
    pub from: TxStatus,
    pub to: TxStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedTransaction {
    pub id: TxId,
    pub kind: TxKind,
    pub tx_hash: Option<TxHash>,
    pub status: TxStatus,
    pub explorer_link: Option<String>,
    pub status_message: String,
}

impl TrackedTransaction {
    pub fn submitted(id: TxId, kind: TxKind) -> Self {
        Self {
            id,
            kind,
            tx_hash: None,
            status: TxStatus::Submitted,
            explorer_link: None,
            status_message: format!("Submitting {}...", kind.description()),
        }
    }

    fn transition(&mut self, allowed_from: &[TxStatus], to: TxStatus) -> Result<(), TransitionError> {
        if !allowed_from.contains(&self.status) {
            return Err(TransitionError {
                id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn mark_pending(&mut self, tx_hash: TxHash, chain_id: u64) -> Result<(), TransitionError> {
        self.transition(&[TxStatus::Submitted], TxStatus::Pending)?;
        let hash = format!("{:?}", tx_hash);
        self.explorer_link = Some(get_tx_explorer_url(chain_id, &hash));
        self.status_message = format!("Mining tx {}...", hash);
        self.tx_hash = Some(tx_hash);
        Ok(())
    }

    pub fn mark_confirmed(&mut self) -> Result<(), TransitionError> {
        self.transition(&[TxStatus::Pending], TxStatus::Confirmed)?;
        if let Some(hash) = self.tx_hash {
            self.status_message = format!("Confirmed tx {:?}", hash);
        }
        Ok(())
    }

    /// Keeps the last status message.
    pub fn mark_failed(&mut self) -> Result<(), TransitionError> {
        self.transition(&[TxStatus::Submitted, TxStatus::Pending], TxStatus::Failed)
    }
}

/// What a receipt did to the tracked transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Confirmed(RefreshScope),
    Failed(ReceiptFailure),
}

/// The single visible tracking slot.
#[derive(Debug, Default)]
pub struct TxSlot {
    active: Option<TrackedTransaction>,
    next_id: u64,
}

impl TxSlot {
    /// Start tracking a new write, replacing whatever was in the slot.
    pub fn begin(&mut self, kind: TxKind) -> TxId {
        self.next_id += 1;
        let id = TxId(self.next_id);
        if let Some(previous) = self.active.as_ref().filter(|tx| tx.status.is_active()) {
            warn!(
                "{} {:?} superseded by {} {:?} before settling",
                previous.kind.operation_name(),
                previous.id,
                kind.operation_name(),
                id
            );
        }
        self.active = Some(TrackedTransaction::submitted(id, kind));
        id
    }

    pub fn current(&self) -> Option<&TrackedTransaction> {
        self.active.as_ref()
    }

    pub fn is_busy(&self) -> bool {
        self.active.as_ref().map_or(false, |tx| tx.status.is_active())
    }

    fn matching(&mut self, id: TxId) -> Option<&mut TrackedTransaction> {
        match self.active.as_mut() {
            Some(tx) if tx.id == id => Some(tx),
            _ => {
                debug!("Dropping result for {:?}: no longer in the tracking slot", id);
                None
            }
        }
    }

    /// The wallet accepted the write. Returns false for a stale id.
    pub fn accept(&mut self, id: TxId, tx_hash: TxHash, chain_id: u64) -> bool {
        let Some(tx) = self.matching(id) else {
            return false;
        };
        match tx.mark_pending(tx_hash, chain_id) {
            Ok(()) => {
                info!("{} pending as {:?}", tx.kind.operation_name(), tx_hash);
                true
            }
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }

    /// Apply a receipt. `None` when the id is stale or the transaction
    /// already settled.
    pub fn settle(&mut self, id: TxId, receipt: &Receipt) -> Option<Settlement> {
        let tx = self.matching(id)?;
        if receipt.is_success() {
            tx.mark_confirmed().map_err(|e| warn!("{}", e)).ok()?;
            info!("{} confirmed in {:?}", tx.kind.operation_name(), receipt.tx_hash);
            Some(Settlement::Confirmed(tx.kind.refresh_scope()))
        } else {
            tx.mark_failed().map_err(|e| warn!("{}", e)).ok()?;
            warn!("{} reverted in {:?}", tx.kind.operation_name(), receipt.tx_hash);
            Some(Settlement::Failed(ReceiptFailure {
                tx_hash: receipt.tx_hash,
            }))
        }
    }

    /// The write errored before or while waiting for its receipt.
    pub fn fail(&mut self, id: TxId) -> bool {
        let Some(tx) = self.matching(id) else {
            return false;
        };
        match tx.mark_failed() {
            Ok(()) => true,
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }

    /// Empty the slot. Ids keep increasing so late results never match.
    pub fn clear(&mut self) {
        self.active = None;
    }
}
