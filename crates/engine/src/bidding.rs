//! Bid validation and recording.

use std::sync::Arc;

use tracing::{debug, warn};

use auction_types::{Amount, AuctionId, AuctionStatus, Bid};

use crate::context::EngineContext;
use crate::error::AuctionError;
use crate::store::{Changeset, IdKind};
use crate::HandlerResult;

/// Validates and records bids, one auction at a time.
#[derive(Clone)]
pub struct BidRecorder {
    ctx: Arc<EngineContext>,
}

impl BidRecorder {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Place a bid.
    ///
    /// The auction's lock is held from reading the current maximum until the
    /// bid is committed and fanned out, so accepted bids on one auction form
    /// a strictly increasing sequence and reach subscribers in that order.
    pub async fn place_bid(
        &self,
        auction_id: AuctionId,
        bidder: &str,
        amount: Amount,
    ) -> HandlerResult<Bid> {
        let _guard = self.ctx.locks.lock(auction_id).await;
        let now = self.ctx.clock.now();

        // Get auction
        let auction = self
            .ctx
            .store
            .get_auction(auction_id)
            .await?
            .ok_or(AuctionError::AuctionNotFound(auction_id))?;

        // Check auction state and bidding period
        if auction.status != AuctionStatus::Active {
            return Err(AuctionError::InvalidState {
                expected: AuctionStatus::Active,
                got: auction.status,
            });
        }
        if now >= auction.end_time {
            return Err(AuctionError::BiddingEnded);
        }

        // Check bidder
        if auction.is_creator(bidder) {
            return Err(AuctionError::CreatorCannotParticipate);
        }
        if self
            .ctx
            .store
            .get_participant(auction_id, bidder)
            .await?
            .is_none()
        {
            return Err(AuctionError::NotParticipant);
        }

        // Check amount against the current floor
        let floor = match self.ctx.store.get_highest_bid(auction_id).await? {
            Some(top) => top.amount,
            None => {
                self.ctx
                    .store
                    .get_property(auction.property_id)
                    .await?
                    .ok_or(AuctionError::PropertyNotFound(auction.property_id))?
                    .starting_price
            }
        };
        let minimum = floor + auction.min_increment;
        if amount < minimum {
            return Err(AuctionError::InsufficientBid {
                minimum,
                offered: amount,
            });
        }

        let bid = Bid {
            bid_id: self.ctx.store.allocate_id(IdKind::Bid).await?,
            auction_id,
            bidder: bidder.to_string(),
            amount,
            placed_at: now,
        };

        let mut changes = Changeset::new();
        changes
            .expect_status(auction_id, AuctionStatus::Active)
            .insert_bid(bid.clone());
        self.ctx.store.commit(changes).await?;

        debug!(auction_id, bid_id = bid.bid_id, bidder, %amount, "Bid accepted");

        if let Err(err) = self.ctx.notifier.new_bid(auction_id, &bid) {
            warn!(auction_id, bid_id = bid.bid_id, error = %err, "New bid notification not delivered");
        }

        Ok(bid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LedgerStore;
    use crate::testing::TestEnv;
    use auction_types::Notification;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    async fn active_with_bidders(env: &TestEnv) -> AuctionId {
        let auction_id = env.auction(AuctionStatus::Active, dec!(0)).await;
        env.participant(auction_id, "alice").await;
        env.participant(auction_id, "bob").await;
        auction_id
    }

    #[tokio::test]
    async fn test_first_bid_floor_is_starting_price() {
        let env = TestEnv::new();
        let bids = BidRecorder::new(env.ctx.clone());
        let auction_id = active_with_bidders(&env).await;

        assert_eq!(
            bids.place_bid(auction_id, "alice", dec!(1000)).await,
            Err(AuctionError::InsufficientBid {
                minimum: dec!(1050),
                offered: dec!(1000)
            })
        );

        let bid = bids.place_bid(auction_id, "alice", dec!(1050)).await.unwrap();
        assert_eq!(bid.amount, dec!(1050));

        assert!(matches!(
            bids.place_bid(auction_id, "bob", dec!(1099.99)).await,
            Err(AuctionError::InsufficientBid { .. })
        ));
        bids.place_bid(auction_id, "bob", dec!(1100)).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejection_reasons_in_order() {
        let env = TestEnv::new();
        let bids = BidRecorder::new(env.ctx.clone());

        assert_eq!(
            bids.place_bid(42, "alice", dec!(2000)).await,
            Err(AuctionError::AuctionNotFound(42))
        );

        let scheduled = env.auction(AuctionStatus::Scheduled, dec!(0)).await;
        env.participant(scheduled, "alice").await;
        assert_eq!(
            bids.place_bid(scheduled, "alice", dec!(2000)).await,
            Err(AuctionError::InvalidState {
                expected: AuctionStatus::Active,
                got: AuctionStatus::Scheduled
            })
        );

        let active = active_with_bidders(&env).await;
        assert_eq!(
            bids.place_bid(active, "seller", dec!(2000)).await,
            Err(AuctionError::CreatorCannotParticipate)
        );
        assert_eq!(
            bids.place_bid(active, "carol", dec!(2000)).await,
            Err(AuctionError::NotParticipant)
        );
    }

    #[tokio::test]
    async fn test_bid_after_end_time_rejected() {
        let env = TestEnv::new();
        let bids = BidRecorder::new(env.ctx.clone());
        let auction_id = active_with_bidders(&env).await;

        // Sweeper has not run yet; status is still Active
        env.clock.advance(Duration::hours(2));
        assert_eq!(
            bids.place_bid(auction_id, "alice", dec!(2000)).await,
            Err(AuctionError::BiddingEnded)
        );
        assert!(env.ledger.get_bids(auction_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_accepted_bid_fans_out_to_group() {
        let env = TestEnv::new();
        let bids = BidRecorder::new(env.ctx.clone());
        let auction_id = active_with_bidders(&env).await;
        let mut bob = env.hub.connect("bob");
        env.hub.join_group(auction_id, "bob");

        let bid = bids.place_bid(auction_id, "alice", dec!(1200)).await.unwrap();
        assert_eq!(
            bob.try_recv().unwrap(),
            Notification::NewBid { auction_id, bid }
        );
    }

    #[tokio::test]
    async fn test_undelivered_notification_does_not_fail_bid() {
        let env = TestEnv::new();
        let bids = BidRecorder::new(env.ctx.clone());
        let auction_id = active_with_bidders(&env).await;
        // Group member without a live connection
        env.hub.join_group(auction_id, "bob");

        assert!(bids.place_bid(auction_id, "alice", dec!(1200)).await.is_ok());
        assert_eq!(env.ledger.get_bids(auction_id).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_bids_strictly_increase() {
        let env = TestEnv::new();
        let bids = BidRecorder::new(env.ctx.clone());
        let auction_id = active_with_bidders(&env).await;

        let mut tasks = Vec::new();
        for i in 0..20u32 {
            let bids = bids.clone();
            let bidder = if i % 2 == 0 { "alice" } else { "bob" };
            let amount = dec!(1050) + Amount::from(i % 5) * dec!(50);
            tasks.push(tokio::spawn(async move {
                bids.place_bid(auction_id, bidder, amount).await
            }));
        }
        for task in tasks {
            let _ = task.await.unwrap();
        }

        let accepted = env.ledger.get_bids(auction_id).await.unwrap();
        assert!(!accepted.is_empty());
        assert!(accepted[0].amount >= dec!(1050));
        for pair in accepted.windows(2) {
            assert!(pair[1].amount >= pair[0].amount + dec!(50));
        }
    }
}
