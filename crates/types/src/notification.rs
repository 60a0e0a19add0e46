//! Messages pushed to connected clients over the real-time channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AuctionId, Bid};

/// A real-time notification.
///
/// Broadcasts (`AuctionStarted`, `AuctionFinished`, `NewBid`) are fanned out
/// to every member of an auction group or participant list. The remaining
/// variants are direct replies to the connection that issued a request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    AuctionStarted {
        auction_id: AuctionId,
        end_time: DateTime<Utc>,
    },
    AuctionFinished {
        auction_id: AuctionId,
    },
    NewBid {
        auction_id: AuctionId,
        bid: Bid,
    },

    // === Direct replies ===
    BidAccepted {
        bid: Bid,
    },
    BidRejected {
        auction_id: AuctionId,
        reason: String,
    },
    GroupJoined {
        auction_id: AuctionId,
    },
    GroupLeft {
        auction_id: AuctionId,
    },
    GroupRejected {
        auction_id: AuctionId,
        reason: String,
    },
}

impl Notification {
    /// Auction the notification concerns.
    pub fn auction_id(&self) -> AuctionId {
        match self {
            Notification::AuctionStarted { auction_id, .. }
            | Notification::AuctionFinished { auction_id }
            | Notification::NewBid { auction_id, .. }
            | Notification::BidRejected { auction_id, .. }
            | Notification::GroupJoined { auction_id }
            | Notification::GroupLeft { auction_id }
            | Notification::GroupRejected { auction_id, .. } => *auction_id,
            Notification::BidAccepted { bid } => bid.auction_id,
        }
    }
}
