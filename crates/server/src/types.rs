//! RPC parameter types.
//!
//! Every call that acts on behalf of a user carries the acting user in
//! `sender`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use auction_engine::CreateAuctionRequest;
use auction_types::{Amount, AuctionId, AuctionStatus, PropertyId};

/// Parameters for registering a property.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPropertyParams {
    pub owner: String,
    pub starting_price: Amount,
}

/// Parameters for creating an auction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAuctionParams {
    pub sender: String,
    pub property_id: PropertyId,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub min_increment: Amount,
    /// Zero when omitted
    #[serde(default)]
    pub deposit_amount: Amount,
}

impl From<CreateAuctionParams> for CreateAuctionRequest {
    fn from(params: CreateAuctionParams) -> Self {
        CreateAuctionRequest {
            property_id: params.property_id,
            start_time: params.start_time,
            end_time: params.end_time,
            min_increment: params.min_increment,
            deposit_amount: params.deposit_amount,
        }
    }
}

/// A user acting on one auction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuctionCallParams {
    pub sender: String,
    pub auction_id: AuctionId,
}

/// Parameters for cancelling an auction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelAuctionParams {
    pub sender: String,
    pub auction_id: AuctionId,
    pub reason: String,
}

/// Parameters for reopening an ended auction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemakeAuctionParams {
    pub sender: String,
    pub auction_id: AuctionId,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Parameters for confirming a deposit-backed join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmJoinParams {
    pub sender: String,
    pub order_id: String,
    pub auction_id: AuctionId,
}

/// Parameters for placing a bid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceBidParams {
    pub sender: String,
    pub auction_id: AuctionId,
    pub amount: Amount,
}

/// Filter for listing auctions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListAuctionsParams {
    pub status: Option<AuctionStatus>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}
