//! Auction engine error types.

use thiserror::Error;

use auction_types::{Amount, AuctionId, AuctionStatus, PropertyId};

use crate::gateway::GatewayError;
use crate::store::StoreError;

/// Errors that can occur in the auction engine.
///
/// Every variant renders as a human-readable reason suitable for returning
/// to the client as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuctionError {
    // === Not found ===
    #[error("Auction not found: {0}")]
    AuctionNotFound(AuctionId),

    #[error("Property not found: {0}")]
    PropertyNotFound(PropertyId),

    #[error("No pending join for order {0}")]
    PendingJoinNotFound(String),

    // === Wrong state ===
    #[error("Invalid state. Expected: {expected}, Got: {got}")]
    InvalidState {
        expected: AuctionStatus,
        got: AuctionStatus,
    },

    #[error("Illegal transition from {from} to {to}")]
    IllegalTransition {
        from: AuctionStatus,
        to: AuctionStatus,
    },

    #[error("Auction is {0} and no longer accepts participants")]
    AuctionClosed(AuctionStatus),

    #[error("Bidding period ended")]
    BiddingEnded,

    #[error("Participants cannot leave once the auction is active")]
    ParticipantsLocked,

    #[error("Property is not available for auction")]
    PropertyUnavailable,

    #[error("Auction has received bids and cannot be remade")]
    HasBids,

    // === Not authorized ===
    #[error("Not authorized: {0}")]
    NotAuthorized(&'static str),

    #[error("The auction creator cannot participate in their own auction")]
    CreatorCannotParticipate,

    #[error("Not a participant of this auction")]
    NotParticipant,

    #[error("Already a participant of this auction")]
    AlreadyParticipant,

    // === Insufficient bid ===
    #[error("Insufficient bid: minimum is {minimum}, got {offered}")]
    InsufficientBid { minimum: Amount, offered: Amount },

    // === Invalid request ===
    #[error("Invalid timing configuration")]
    InvalidTiming,

    #[error("Invalid amount: {0}")]
    InvalidAmount(&'static str),

    #[error("Cancellation reason must be at least {min_len} characters")]
    ReasonTooShort { min_len: usize },

    // === External / internal ===
    #[error("Payment provider error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Ledger error: {0}")]
    Store(#[from] StoreError),

    #[error("Consistency failure: {0}")]
    Consistency(String),
}

/// Coarse reason category a client can branch on without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectionCategory {
    NotFound,
    WrongState,
    NotAuthorized,
    InsufficientBid,
    PaymentProvider,
    InvalidRequest,
    Internal,
}

/// Failure class, per who caused it and whether retry helps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Caller error, returned as-is
    Validation,
    /// External and possibly transient, safe to retry
    Gateway,
    /// Internal invariant at risk; needs reconciliation
    Consistency,
}

impl AuctionError {
    pub fn category(&self) -> RejectionCategory {
        use AuctionError::*;
        match self {
            AuctionNotFound(_) | PropertyNotFound(_) | PendingJoinNotFound(_) => {
                RejectionCategory::NotFound
            }
            InvalidState { .. }
            | IllegalTransition { .. }
            | AuctionClosed(_)
            | BiddingEnded
            | ParticipantsLocked
            | PropertyUnavailable
            | HasBids => RejectionCategory::WrongState,
            NotAuthorized(_) | CreatorCannotParticipate | NotParticipant | AlreadyParticipant => {
                RejectionCategory::NotAuthorized
            }
            InsufficientBid { .. } => RejectionCategory::InsufficientBid,
            InvalidTiming | InvalidAmount(_) | ReasonTooShort { .. } => {
                RejectionCategory::InvalidRequest
            }
            Gateway(_) => RejectionCategory::PaymentProvider,
            Store(StoreError::NotFound(_)) => RejectionCategory::NotFound,
            Store(StoreError::Conflict(_)) => RejectionCategory::WrongState,
            Store(_) | Consistency(_) => RejectionCategory::Internal,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            AuctionError::Gateway(_) => ErrorClass::Gateway,
            AuctionError::Store(StoreError::Unavailable(_)) | AuctionError::Consistency(_) => {
                ErrorClass::Consistency
            }
            _ => ErrorClass::Validation,
        }
    }
}
