//! Query handlers.
//!
//! These functions provide read-only access to auction state.

use serde::{Deserialize, Serialize};

use auction_types::{Amount, Auction, AuctionId, AuctionStatus, Bid, DepositHold, Participant};

use crate::store::LedgerStore;
use crate::HandlerResult;

/// Default page size for `ListAuctions`.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Query request types.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuctionQuery {
    /// Get auction details by ID.
    GetAuction { auction_id: AuctionId },

    /// List auctions, optionally filtered by status (paginated).
    ListAuctions {
        status: Option<AuctionStatus>,
        offset: usize,
        limit: usize,
    },

    /// Get all bids for an auction, in acceptance order.
    GetAuctionBids { auction_id: AuctionId },

    /// Get the participant roster of an auction.
    GetParticipants { auction_id: AuctionId },

    /// Get the deposit holds of an auction.
    GetHolds { auction_id: AuctionId },
}

/// An auction with its bid totals.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuctionSummary {
    #[serde(flatten)]
    pub auction: Auction,
    pub num_bids: usize,
    pub highest_bid: Option<Amount>,
}

/// Query response types.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuctionQueryResponse {
    /// Auction details.
    Auction(Option<AuctionSummary>),

    /// List of auctions.
    AuctionList(Vec<AuctionSummary>),

    /// Bids for an auction.
    Bids(Vec<Bid>),

    /// Participants of an auction.
    Participants(Vec<Participant>),

    /// Deposit holds of an auction.
    Holds(Vec<DepositHold>),
}

async fn summarize(store: &dyn LedgerStore, auction: Auction) -> HandlerResult<AuctionSummary> {
    let bids = store.get_bids(auction.auction_id).await?;
    Ok(AuctionSummary {
        num_bids: bids.len(),
        highest_bid: bids.iter().map(|b| b.amount).max(),
        auction,
    })
}

/// Handle a query.
pub async fn handle_query(
    store: &dyn LedgerStore,
    query: AuctionQuery,
) -> HandlerResult<AuctionQueryResponse> {
    match query {
        AuctionQuery::GetAuction { auction_id } => {
            let summary = match store.get_auction(auction_id).await? {
                Some(auction) => Some(summarize(store, auction).await?),
                None => None,
            };
            Ok(AuctionQueryResponse::Auction(summary))
        }

        AuctionQuery::ListAuctions {
            status,
            offset,
            limit,
        } => {
            let auctions = store
                .find_auctions(&move |a: &Auction| status.map_or(true, |s| a.status == s))
                .await?;
            let mut page = Vec::new();
            for auction in auctions.into_iter().skip(offset).take(limit) {
                page.push(summarize(store, auction).await?);
            }
            Ok(AuctionQueryResponse::AuctionList(page))
        }

        AuctionQuery::GetAuctionBids { auction_id } => {
            Ok(AuctionQueryResponse::Bids(store.get_bids(auction_id).await?))
        }

        AuctionQuery::GetParticipants { auction_id } => Ok(AuctionQueryResponse::Participants(
            store.get_participants(auction_id).await?,
        )),

        AuctionQuery::GetHolds { auction_id } => {
            Ok(AuctionQueryResponse::Holds(store.get_holds(auction_id).await?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestEnv;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_get_auction_summary() {
        let env = TestEnv::new();
        let auction_id = env.auction(AuctionStatus::Active, dec!(0)).await;
        env.bid(auction_id, "alice", dec!(1050)).await;
        env.bid(auction_id, "bob", dec!(1200)).await;

        let response = handle_query(env.ledger.as_ref(), AuctionQuery::GetAuction { auction_id })
            .await
            .unwrap();
        let AuctionQueryResponse::Auction(Some(summary)) = response else {
            panic!("unexpected response: {response:?}");
        };
        assert_eq!(summary.num_bids, 2);
        assert_eq!(summary.highest_bid, Some(dec!(1200)));

        let missing = handle_query(env.ledger.as_ref(), AuctionQuery::GetAuction { auction_id: 99 })
            .await
            .unwrap();
        assert_eq!(missing, AuctionQueryResponse::Auction(None));
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let env = TestEnv::new();
        env.auction(AuctionStatus::Scheduled, dec!(0)).await;
        let active = env.auction(AuctionStatus::Active, dec!(0)).await;
        env.auction(AuctionStatus::Ended, dec!(0)).await;

        let response = handle_query(
            env.ledger.as_ref(),
            AuctionQuery::ListAuctions {
                status: Some(AuctionStatus::Active),
                offset: 0,
                limit: DEFAULT_PAGE_SIZE,
            },
        )
        .await
        .unwrap();
        let AuctionQueryResponse::AuctionList(list) = response else {
            panic!("unexpected response");
        };
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].auction.auction_id, active);

        let response = handle_query(
            env.ledger.as_ref(),
            AuctionQuery::ListAuctions {
                status: None,
                offset: 1,
                limit: 1,
            },
        )
        .await
        .unwrap();
        assert!(matches!(response, AuctionQueryResponse::AuctionList(ref l) if l.len() == 1));
    }

    #[test]
    fn test_summary_flattens_auction_fields() {
        let summary = AuctionSummary {
            auction: Auction {
                auction_id: 3,
                property_id: 1,
                creator: "seller".into(),
                status: AuctionStatus::Active,
                start_time: crate::testing::t0(),
                end_time: crate::testing::t0(),
                min_increment: dec!(50),
                deposit_amount: dec!(0),
                winner: None,
                cancellation_reason: None,
                created_at: crate::testing::t0(),
                updated_at: crate::testing::t0(),
            },
            num_bids: 0,
            highest_bid: None,
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["auction_id"], 3);
        assert_eq!(json["status"], "active");
        assert_eq!(json["num_bids"], 0);
    }
}
