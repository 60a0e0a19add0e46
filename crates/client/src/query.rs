//! Query functions for auction state.

use async_trait::async_trait;
use jsonrpsee::core::client::ClientT;
use jsonrpsee::rpc_params;
use serde_json::json;

use auction_engine::{AuctionSummary, ParticipationStatus};
use auction_types::{AuctionId, AuctionStatus, Bid, DepositHold, Participant};

use crate::{ClientError, MarketClient};

/// Read access to the marketplace.
#[async_trait]
pub trait MarketQuery {
    /// Get an auction with its bid totals.
    async fn get_auction(&self, auction_id: AuctionId)
        -> Result<Option<AuctionSummary>, ClientError>;

    /// List auctions, optionally only those in `status`.
    async fn list_auctions(
        &self,
        status: Option<AuctionStatus>,
    ) -> Result<Vec<AuctionSummary>, ClientError>;

    /// Get all bids for an auction, oldest first.
    async fn get_auction_bids(&self, auction_id: AuctionId) -> Result<Vec<Bid>, ClientError>;

    async fn get_participants(
        &self,
        auction_id: AuctionId,
    ) -> Result<Vec<Participant>, ClientError>;

    /// Deposit holds of an auction, released ones included.
    async fn get_holds(&self, auction_id: AuctionId) -> Result<Vec<DepositHold>, ClientError>;

    /// Whether the connected user takes part in an auction.
    async fn check_participation(
        &self,
        auction_id: AuctionId,
    ) -> Result<ParticipationStatus, ClientError>;
}

#[async_trait]
impl MarketQuery for MarketClient {
    async fn get_auction(
        &self,
        auction_id: AuctionId,
    ) -> Result<Option<AuctionSummary>, ClientError> {
        Ok(self
            .rpc()
            .request("query_getAuction", rpc_params![auction_id])
            .await?)
    }

    async fn list_auctions(
        &self,
        status: Option<AuctionStatus>,
    ) -> Result<Vec<AuctionSummary>, ClientError> {
        Ok(self
            .rpc()
            .request("query_listAuctions", rpc_params![json!({ "status": status })])
            .await?)
    }

    async fn get_auction_bids(&self, auction_id: AuctionId) -> Result<Vec<Bid>, ClientError> {
        Ok(self
            .rpc()
            .request("query_getAuctionBids", rpc_params![auction_id])
            .await?)
    }

    async fn get_participants(
        &self,
        auction_id: AuctionId,
    ) -> Result<Vec<Participant>, ClientError> {
        Ok(self
            .rpc()
            .request("query_getParticipants", rpc_params![auction_id])
            .await?)
    }

    async fn get_holds(&self, auction_id: AuctionId) -> Result<Vec<DepositHold>, ClientError> {
        Ok(self
            .rpc()
            .request("query_getHolds", rpc_params![auction_id])
            .await?)
    }

    async fn check_participation(
        &self,
        auction_id: AuctionId,
    ) -> Result<ParticipationStatus, ClientError> {
        let params = json!({ "sender": self.user_id(), "auction_id": auction_id });
        Ok(self
            .rpc()
            .request("deposit_checkParticipation", rpc_params![params])
            .await?)
    }
}
