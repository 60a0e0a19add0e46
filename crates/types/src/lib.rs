//! Core type definitions for timed property auctions.
//!
//! This crate provides the shared data structures used across the auction
//! engine, the server and the client: auctions and their bids, admitted
//! participants, gateway-backed deposit holds, and the notifications pushed
//! to connected clients.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub mod notification;

pub use notification::Notification;

// =========================
// IDENTIFIERS & AMOUNTS
// =========================

/// Auction identifier (ledger-assigned).
pub type AuctionId = u64;

/// Bid identifier (ledger-assigned).
pub type BidId = u64;

/// Deposit hold identifier (ledger-assigned).
pub type HoldId = u64;

/// Property identifier (owned by the listing service).
pub type PropertyId = u64;

/// Opaque user identifier issued by the identity service.
pub type UserId = String;

/// Monetary amount. Fixed-point, never floating.
pub type Amount = Decimal;

/// The authenticated principal behind a request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: UserId,
    #[serde(default)]
    pub is_admin: bool,
}

impl Caller {
    pub fn user(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            is_admin: false,
        }
    }

    pub fn admin(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            is_admin: true,
        }
    }
}

// =========================
// AUCTIONS
// =========================

/// Auction lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuctionStatus {
    /// Before start_time
    Scheduled,
    /// Accepting bids
    Active,
    /// Past end_time
    Ended,
    /// Withdrawn by the creator or an admin
    Cancelled,
}

impl AuctionStatus {
    /// Whether participants may still join.
    pub fn is_open(self) -> bool {
        matches!(self, AuctionStatus::Scheduled | AuctionStatus::Active)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AuctionStatus::Scheduled => "scheduled",
            AuctionStatus::Active => "active",
            AuctionStatus::Ended => "ended",
            AuctionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for AuctionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuctionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "scheduled" => Ok(AuctionStatus::Scheduled),
            "active" => Ok(AuctionStatus::Active),
            "ended" => Ok(AuctionStatus::Ended),
            "cancelled" | "canceled" => Ok(AuctionStatus::Cancelled),
            other => Err(format!("unknown auction status: {other}")),
        }
    }
}

/// A timed sale of one property.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auction {
    pub auction_id: AuctionId,
    pub property_id: PropertyId,
    pub creator: UserId,
    pub status: AuctionStatus,

    // Timing
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,

    // Rules
    pub min_increment: Amount,
    pub deposit_amount: Amount,

    // Outcome
    pub winner: Option<UserId>,
    pub cancellation_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Auction {
    /// Whether joining this auction requires a gateway hold.
    pub fn requires_deposit(&self) -> bool {
        self.deposit_amount > Decimal::ZERO
    }

    pub fn is_creator(&self, user: &str) -> bool {
        self.creator == user
    }
}

/// An accepted bid. Immutable once recorded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
    pub bid_id: BidId,
    pub auction_id: AuctionId,
    pub bidder: UserId,
    pub amount: Amount,
    pub placed_at: DateTime<Utc>,
}

/// A user admitted to bid in one auction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub auction_id: AuctionId,
    pub user_id: UserId,
    pub registered_at: DateTime<Utc>,
}

// =========================
// DEPOSIT HOLDS
// =========================

/// State of a gateway-backed guarantee deposit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldStatus {
    /// Funds reserved at the gateway
    Active,
    /// Authorization voided
    Released,
    /// Converted into a payment
    Captured,
}

/// A guarantee deposit held at the payment gateway.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositHold {
    pub hold_id: HoldId,
    pub owner: UserId,
    pub auction_id: AuctionId,
    pub amount: Amount,
    /// Authorization identifier assigned by the gateway
    pub gateway_hold_id: String,
    pub status: HoldStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl DepositHold {
    pub fn is_active(&self) -> bool {
        self.status == HoldStatus::Active
    }
}

// =========================
// PROPERTIES
// =========================

/// Listing state of a property, as far as auctions are concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyStatus {
    /// Awaiting approval by the listing service
    Pending,
    Available,
    UnderAuction,
    Sold,
}

/// The slice of a property listing the auction engine reads and writes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub property_id: PropertyId,
    pub owner: UserId,
    /// Floor for the first bid
    pub starting_price: Amount,
    pub status: PropertyStatus,
}

// =========================
// HELPER FUNCTIONS
// =========================

/// Compute the idempotency key sent with a deposit order request.
///
/// Retrying the same (auction, user, amount) order within one join attempt
/// produces the same key, so the gateway can deduplicate it. `attempt` is the
/// number of holds the user already had on the auction; a join after a leave
/// or a remake gets a fresh order.
pub fn compute_order_request_id(
    auction_id: AuctionId,
    user_id: &str,
    amount: Amount,
    attempt: u32,
) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(b"DEPOSIT_ORDER_V2:");
    hasher.update(auction_id.to_le_bytes());
    hasher.update((user_id.len() as u64).to_le_bytes());
    hasher.update(user_id.as_bytes());
    hasher.update(amount.normalize().to_string().as_bytes());
    hasher.update(attempt.to_le_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_compute_order_request_id() {
        let id1 = compute_order_request_id(1, "alice", dec!(500), 0);
        let id2 = compute_order_request_id(1, "alice", dec!(500.00), 0);
        let id3 = compute_order_request_id(1, "bob", dec!(500), 0);
        let id4 = compute_order_request_id(2, "alice", dec!(500), 0);
        let id5 = compute_order_request_id(1, "alice", dec!(500), 1);

        assert_eq!(id1, id2);
        assert_ne!(id1, id3);
        assert_ne!(id1, id4);
        assert_ne!(id1, id5);
        assert_eq!(id1.len(), 64);
    }

    #[test]
    fn test_auction_status_parse() {
        assert_eq!("Active".parse::<AuctionStatus>(), Ok(AuctionStatus::Active));
        assert_eq!("canceled".parse::<AuctionStatus>(), Ok(AuctionStatus::Cancelled));
        assert!("sealed".parse::<AuctionStatus>().is_err());
    }

    #[test]
    fn test_open_statuses() {
        assert!(AuctionStatus::Scheduled.is_open());
        assert!(AuctionStatus::Active.is_open());
        assert!(!AuctionStatus::Ended.is_open());
        assert!(!AuctionStatus::Cancelled.is_open());
    }

    #[test]
    fn test_amount_serializes_as_string() {
        let bid = Bid {
            bid_id: 7,
            auction_id: 1,
            bidder: "alice".into(),
            amount: dec!(1050.50),
            placed_at: DateTime::from_timestamp(0, 0).unwrap(),
        };
        let json = serde_json::to_value(&bid).unwrap();
        assert_eq!(json["amount"], "1050.50");
    }
}
