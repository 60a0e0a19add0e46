//! Bid preparation and participation calls.

use jsonrpsee::core::client::ClientT;
use jsonrpsee::rpc_params;
use serde_json::json;

use auction_engine::{AuctionSummary, JoinOutcome};
use auction_types::{Amount, AuctionId, Bid, DepositHold};

use crate::{ClientError, MarketClient};

/// Largest number of decimal places a bid may carry.
pub const MAX_BID_SCALE: u32 = 2;

/// A validated bid ready for submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedBid {
    pub auction_id: AuctionId,
    pub amount: Amount,
}

/// Builder for bids.
///
/// Local checks only catch malformed amounts; the server decides whether
/// the bid clears the current floor.
pub struct BidBuilder {
    auction_id: AuctionId,
    amount: Option<Amount>,
}

impl BidBuilder {
    pub fn new(auction_id: AuctionId) -> Self {
        Self {
            auction_id,
            amount: None,
        }
    }

    /// Bid exactly `amount`.
    pub fn amount(mut self, amount: Amount) -> Self {
        self.amount = Some(amount);
        self
    }

    /// Bid the smallest amount that beats the current highest bid.
    ///
    /// Without any bid yet the floor depends on the property's starting
    /// price, which the summary does not carry, so an explicit amount is
    /// required.
    pub fn outbid(mut self, summary: &AuctionSummary) -> Self {
        if let Some(highest) = summary.highest_bid {
            self.amount = Some(highest + summary.auction.min_increment);
        }
        self
    }

    pub fn build(self) -> Result<PreparedBid, ClientError> {
        let amount = self
            .amount
            .ok_or(ClientError::InvalidBid("no amount given"))?;
        if amount <= Amount::ZERO {
            return Err(ClientError::InvalidBid("amount must be positive"));
        }
        if amount.normalize().scale() > MAX_BID_SCALE {
            return Err(ClientError::InvalidBid("amount has more than two decimal places"));
        }
        Ok(PreparedBid {
            auction_id: self.auction_id,
            amount,
        })
    }
}

impl MarketClient {
    /// Submit a prepared bid.
    pub async fn place_bid(&self, bid: &PreparedBid) -> Result<Bid, ClientError> {
        let params = json!({
            "sender": self.user_id(),
            "auction_id": bid.auction_id,
            "amount": bid.amount,
        });
        Ok(self.rpc().request("realtime_placeBid", rpc_params![params]).await?)
    }

    /// Start joining an auction.
    pub async fn join(&self, auction_id: AuctionId) -> Result<JoinOutcome, ClientError> {
        Ok(self
            .rpc()
            .request("deposit_initiateJoin", rpc_params![self.call(auction_id)])
            .await?)
    }

    /// Finish a join after the deposit order was approved.
    pub async fn confirm_join(
        &self,
        auction_id: AuctionId,
        order_id: &str,
    ) -> Result<DepositHold, ClientError> {
        let params = json!({
            "sender": self.user_id(),
            "auction_id": auction_id,
            "order_id": order_id,
        });
        Ok(self
            .rpc()
            .request("deposit_confirmJoin", rpc_params![params])
            .await?)
    }

    /// Leave an auction that has not started.
    pub async fn leave(&self, auction_id: AuctionId) -> Result<bool, ClientError> {
        Ok(self
            .rpc()
            .request("deposit_leave", rpc_params![self.call(auction_id)])
            .await?)
    }

    /// Subscribe to an auction's broadcasts on the realtime channel.
    pub async fn join_group(&self, auction_id: AuctionId) -> Result<bool, ClientError> {
        Ok(self
            .rpc()
            .request("realtime_joinAuctionGroup", rpc_params![self.call(auction_id)])
            .await?)
    }

    fn call(&self, auction_id: AuctionId) -> serde_json::Value {
        json!({ "sender": self.user_id(), "auction_id": auction_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use auction_types::{Auction, AuctionStatus};
    use chrono::DateTime;
    use rust_decimal_macros::dec;

    fn summary(highest_bid: Option<Amount>) -> AuctionSummary {
        let at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        AuctionSummary {
            auction: Auction {
                auction_id: 4,
                property_id: 1,
                creator: "seller".into(),
                status: AuctionStatus::Active,
                start_time: at,
                end_time: at,
                min_increment: dec!(50),
                deposit_amount: dec!(0),
                winner: None,
                cancellation_reason: None,
                created_at: at,
                updated_at: at,
            },
            num_bids: usize::from(highest_bid.is_some()),
            highest_bid,
        }
    }

    #[test]
    fn test_bid_builder() {
        let bid = BidBuilder::new(4).amount(dec!(1050.50)).build().unwrap();
        assert_eq!(bid.amount, dec!(1050.50));

        assert!(BidBuilder::new(4).amount(dec!(0)).build().is_err());
        assert!(BidBuilder::new(4).amount(dec!(10.001)).build().is_err());
        assert!(BidBuilder::new(4).amount(dec!(10.100)).build().is_ok());
        assert!(BidBuilder::new(4).build().is_err());
    }

    #[test]
    fn test_outbid_adds_increment() {
        let bid = BidBuilder::new(4)
            .outbid(&summary(Some(dec!(1100))))
            .build()
            .unwrap();
        assert_eq!(bid.amount, dec!(1150));

        let err = BidBuilder::new(4).outbid(&summary(None)).build();
        assert!(matches!(err, Err(ClientError::InvalidBid(_))));
    }
}
