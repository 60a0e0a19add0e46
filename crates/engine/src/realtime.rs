//! Real-time channel operations.
//!
//! Each operation replies to the calling user's connection on the hub in
//! addition to returning its result.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use auction_types::{Amount, AuctionId, Bid, Notification};

use crate::bidding::BidRecorder;
use crate::deposit::DepositOrchestrator;
use crate::error::AuctionError;
use crate::notify::NotificationHub;
use crate::HandlerResult;

#[derive(Clone)]
pub struct RealtimeChannel {
    bids: BidRecorder,
    deposits: DepositOrchestrator,
    hub: Arc<NotificationHub>,
}

impl RealtimeChannel {
    pub fn new(bids: BidRecorder, deposits: DepositOrchestrator, hub: Arc<NotificationHub>) -> Self {
        Self {
            bids,
            deposits,
            hub,
        }
    }

    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    /// Open the user's notification stream.
    pub fn connect(&self, user_id: &str) -> broadcast::Receiver<Notification> {
        self.hub.connect(user_id)
    }

    pub async fn place_bid(
        &self,
        user_id: &str,
        auction_id: AuctionId,
        amount: Amount,
    ) -> HandlerResult<Bid> {
        let result = self.bids.place_bid(auction_id, user_id, amount).await;
        let reply = match &result {
            Ok(bid) => Notification::BidAccepted { bid: bid.clone() },
            Err(err) => Notification::BidRejected {
                auction_id,
                reason: err.to_string(),
            },
        };
        self.hub.send_to_user(user_id, reply);
        result
    }

    /// Subscribe to an auction's broadcasts. Only admitted participants may.
    pub async fn join_group(&self, user_id: &str, auction_id: AuctionId) -> HandlerResult<()> {
        let status = match self.deposits.check_participation(auction_id, user_id).await {
            Ok(status) => status,
            Err(err) => {
                self.reject(user_id, auction_id, &err.to_string());
                return Err(err);
            }
        };

        if !status.is_participant {
            self.reject(user_id, auction_id, &status.message);
            return Err(AuctionError::NotParticipant);
        }

        self.hub.join_group(auction_id, user_id);
        self.hub
            .send_to_user(user_id, Notification::GroupJoined { auction_id });
        debug!(auction_id, user_id, "Joined auction group");
        Ok(())
    }

    /// Leave an auction and its group.
    ///
    /// Leaving an active auction is refused and the caller is evicted from
    /// the group. Once the auction is over, or the caller no longer holds a
    /// seat, only the group membership is dropped.
    pub async fn leave_group(&self, user_id: &str, auction_id: AuctionId) -> HandlerResult<()> {
        match self.deposits.leave_auction(auction_id, user_id).await {
            Ok(()) => {
                self.left(user_id, auction_id);
                Ok(())
            }
            Err(AuctionError::ParticipantsLocked) => {
                self.hub.evict(auction_id, user_id);
                let err = AuctionError::ParticipantsLocked;
                self.reject(user_id, auction_id, &err.to_string());
                Err(err)
            }
            Err(
                err @ (AuctionError::InvalidState { .. }
                | AuctionError::AuctionNotFound(_)
                | AuctionError::NotParticipant),
            ) => {
                debug!(auction_id, user_id, reason = %err, "Unsubscribed without leaving");
                self.left(user_id, auction_id);
                Ok(())
            }
            Err(err) => {
                self.reject(user_id, auction_id, &err.to_string());
                Err(err)
            }
        }
    }

    fn left(&self, user_id: &str, auction_id: AuctionId) {
        self.hub.leave_group(auction_id, user_id);
        self.hub
            .send_to_user(user_id, Notification::GroupLeft { auction_id });
    }

    fn reject(&self, user_id: &str, auction_id: AuctionId, reason: &str) {
        self.hub.send_to_user(
            user_id,
            Notification::GroupRejected {
                auction_id,
                reason: reason.to_string(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LedgerStore;
    use crate::testing::TestEnv;
    use auction_types::AuctionStatus;
    use rust_decimal_macros::dec;

    fn channel(env: &TestEnv) -> RealtimeChannel {
        RealtimeChannel::new(
            BidRecorder::new(env.ctx.clone()),
            DepositOrchestrator::new(env.ctx.clone()),
            env.hub.clone(),
        )
    }

    #[tokio::test]
    async fn test_group_requires_participation() {
        let env = TestEnv::new();
        let rt = channel(&env);
        let auction_id = env.auction(AuctionStatus::Active, dec!(0)).await;
        let mut carol = rt.connect("carol");

        assert_eq!(
            rt.join_group("carol", auction_id).await,
            Err(AuctionError::NotParticipant)
        );
        assert!(matches!(
            carol.try_recv().unwrap(),
            Notification::GroupRejected { .. }
        ));
        assert!(!env.hub.is_member(auction_id, "carol"));

        env.participant(auction_id, "carol").await;
        rt.join_group("carol", auction_id).await.unwrap();
        assert_eq!(
            carol.try_recv().unwrap(),
            Notification::GroupJoined { auction_id }
        );
        assert!(env.hub.is_member(auction_id, "carol"));
    }

    #[tokio::test]
    async fn test_leaving_active_auction_evicts() {
        let env = TestEnv::new();
        let rt = channel(&env);
        let auction_id = env.auction(AuctionStatus::Active, dec!(0)).await;
        env.participant(auction_id, "alice").await;
        let mut alice = rt.connect("alice");
        rt.join_group("alice", auction_id).await.unwrap();
        let _ = alice.try_recv();

        assert_eq!(
            rt.leave_group("alice", auction_id).await,
            Err(AuctionError::ParticipantsLocked)
        );
        assert!(!env.hub.is_member(auction_id, "alice"));
        assert!(matches!(
            alice.try_recv().unwrap(),
            Notification::GroupRejected { .. }
        ));
    }

    #[tokio::test]
    async fn test_leaving_scheduled_auction() {
        let env = TestEnv::new();
        let rt = channel(&env);
        let auction_id = env.auction(AuctionStatus::Scheduled, dec!(0)).await;
        env.participant(auction_id, "alice").await;
        let mut alice = rt.connect("alice");
        rt.join_group("alice", auction_id).await.unwrap();
        let _ = alice.try_recv();

        rt.leave_group("alice", auction_id).await.unwrap();
        assert_eq!(
            alice.try_recv().unwrap(),
            Notification::GroupLeft { auction_id }
        );
    }

    #[tokio::test]
    async fn test_leaving_ended_auction_unsubscribes() {
        let env = TestEnv::new();
        let rt = channel(&env);
        let auction_id = env.auction(AuctionStatus::Ended, dec!(0)).await;
        env.participant(auction_id, "alice").await;
        let mut alice = rt.connect("alice");
        env.hub.join_group(auction_id, "alice");

        rt.leave_group("alice", auction_id).await.unwrap();
        assert!(!env.hub.is_member(auction_id, "alice"));
        assert_eq!(env.hub.group_count(), 0);
        assert_eq!(
            alice.try_recv().unwrap(),
            Notification::GroupLeft { auction_id }
        );
        // The seat of a finished auction is kept
        assert!(env
            .ledger
            .get_participant(auction_id, "alice")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_leaving_without_seat_unsubscribes() {
        let env = TestEnv::new();
        let rt = channel(&env);
        let auction_id = env.auction(AuctionStatus::Scheduled, dec!(0)).await;
        env.hub.join_group(auction_id, "mallory");

        rt.leave_group("mallory", auction_id).await.unwrap();
        assert!(!env.hub.is_member(auction_id, "mallory"));

        env.hub.join_group(404, "mallory");
        rt.leave_group("mallory", 404).await.unwrap();
        assert_eq!(env.hub.group_count(), 0);
    }

    #[tokio::test]
    async fn test_bid_replies_to_bidder() {
        let env = TestEnv::new();
        let rt = channel(&env);
        let auction_id = env.auction(AuctionStatus::Active, dec!(0)).await;
        env.participant(auction_id, "alice").await;
        let mut alice = rt.connect("alice");

        assert!(rt.place_bid("alice", auction_id, dec!(900)).await.is_err());
        match alice.try_recv().unwrap() {
            Notification::BidRejected { reason, .. } => assert!(reason.contains("Insufficient bid")),
            other => panic!("unexpected {other:?}"),
        }

        let bid = rt.place_bid("alice", auction_id, dec!(1050)).await.unwrap();
        assert_eq!(alice.try_recv().unwrap(), Notification::BidAccepted { bid });
    }
}
