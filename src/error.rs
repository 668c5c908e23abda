//! Error taxonomy for the settlement engine.
//!
//! `ValidationError` and `ConflictError` are deterministic outcomes of the
//! state machine and reach the caller unchanged; a rejected transition never
//! partially executes.

use crate::money::Money;

/// User input rejected before any side effect takes place.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("card {card} is not owned by {user}")]
    NotCardOwner { card: String, user: String },
    #[error("card {0} is not listed for this kind of exchange")]
    WrongListingType(String),
    #[error("card {0} is not active")]
    CardNotActive(String),
    #[error("card {0} is past its expiry date")]
    CardExpired(String),
    #[error("a user cannot trade with themselves")]
    SelfTrade,
    #[error("the two cards in a swap must be distinct")]
    SameCard,
    #[error("{0} is not a participant")]
    NotParticipant(String),
    #[error("only the responder may accept or decline")]
    NotResponder,
    #[error("only the initiator may withdraw")]
    NotInitiator,
    #[error("only the seller may confirm this sale")]
    NotSeller,
    #[error("only the buyer may pay for this sale")]
    NotBuyer,
    #[error("card {0} has no selling price set")]
    NoSellingPrice(String),
    #[error("a dispute requires a reason")]
    EmptyDisputeReason,
    #[error("proposal rejected by trade policy for {0}")]
    PolicyRejected(String),
}

/// The requested transition does not apply to the aggregate's current
/// state. Safe to retry after re-fetching.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConflictError {
    #[error("card {0} is already held by an open escrow")]
    AlreadyLocked(String),
    #[error("this side of the escrow was already released")]
    AlreadyReleased,
    #[error("invalid transition: {event} does not apply in state {state}")]
    InvalidTransition { state: String, event: &'static str },
}

impl ConflictError {
    pub fn invalid<S: std::fmt::Display>(state: S, event: &'static str) -> Self {
        ConflictError::InvalidTransition {
            state: state.to_string(),
            event,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Conflict(#[from] ConflictError),
    #[error("insufficient funds: needed {needed}, available {available}")]
    InsufficientFunds { needed: Money, available: Money },
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("vault unavailable: {0}")]
    Vault(String),
    #[error("storage error: {0}")]
    Store(#[from] sled::Error),
    #[error("codec error: {0}")]
    Codec(String),
    /// Data corruption that must not be repaired automatically, e.g. an
    /// escrow lock referencing a card that is not LOCKED.
    #[error("corrupt state requiring admin intervention: {0}")]
    Corrupt(String),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: &str) -> Self {
        EngineError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

impl From<minicbor::decode::Error> for EngineError {
    fn from(err: minicbor::decode::Error) -> Self {
        EngineError::Codec(err.to_string())
    }
}

impl<E: std::fmt::Display> From<minicbor::encode::Error<E>> for EngineError {
    fn from(err: minicbor::encode::Error<E>) -> Self {
        EngineError::Codec(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
