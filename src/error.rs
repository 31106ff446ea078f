//! Error taxonomy for the session core.
//!
//! Only `ConnectionError` and `IdentityError` ever change connection state.
//! Everything else is reported through the informational-message channel.

use ethers::types::TxHash;
use thiserror::Error;

/// Raw failure reported by a wallet provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("wallet selection was aborted")]
    Aborted,
    #[error("unknown wallet connector '{0}'")]
    UnknownConnector(String),
    #[error("failed to open wallet transport: {0}")]
    Transport(String),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("initial contract read failed: {0}")]
    InitialRead(RemoteCallError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("wallet exposes no account")]
    NoAccount,
    #[error("failed to query {what}: {source}")]
    Query {
        what: &'static str,
        source: ProviderError,
    },
}

/// A contract call the provider or node refused; carries the raw message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("[func: {method}] {message}")]
pub struct RemoteCallError {
    pub method: &'static str,
    pub message: String,
}

impl RemoteCallError {
    pub fn new(method: &'static str, message: impl Into<String>) -> Self {
        Self {
            method,
            message: message.into(),
        }
    }

    pub fn from_provider(method: &'static str, err: ProviderError) -> Self {
        let message = match err {
            ProviderError::Rejected(msg) | ProviderError::Transport(msg) => msg,
        };
        Self::new(method, message)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("state name cannot be empty")]
    EmptyRegion,
    #[error("votes for {0} must be greater than zero")]
    ZeroVotes(&'static str),
    #[error("seat count must be greater than zero")]
    ZeroSeats,
    #[error("seat count {0} does not fit the contract's 8-bit seat field")]
    SeatsOutOfRange(u64),
    #[error("'{value}' is not a valid number for {field}")]
    NotANumber { field: &'static str, value: String },
}

/// The transaction was mined but its receipt reports failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("transaction {tx_hash:?} was mined but reverted")]
pub struct ReceiptFailure {
    pub tx_hash: TxHash,
}

/// Rejections a presentation-layer intent can receive from the session driver.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("no wallet is connected")]
    NotConnected,
    #[error(transparent)]
    Validation(#[from] ValidationError),
}
