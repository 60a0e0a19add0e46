//! End-to-end integration tests for the property auction engine.
//!
//! These tests drive the assembled engine through full auction lifecycles:
//! 1. Property registration and auction creation
//! 2. Joining, with and without a deposit hold
//! 3. Concurrent bidding
//! 4. Sweeper-driven start, end and deposit settlement

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal_macros::dec;

use auction_engine::gateway::SandboxOp;
use auction_engine::{
    AuctionEngine, AuctionError, Clock, CreateAuctionRequest, EngineContext, GatewayError,
    JoinOutcome, LedgerStore, ManualClock, MemoryLedger, NotificationHub, SandboxGateway,
};
use auction_types::{
    Amount, AuctionId, AuctionStatus, Bid, Caller, HoldStatus, Notification, PropertyStatus,
};

/// Fixed start of test time.
pub fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

/// An engine wired to in-process collaborators.
pub struct Market {
    pub engine: AuctionEngine,
    pub ledger: Arc<MemoryLedger>,
    pub gateway: Arc<SandboxGateway>,
    pub hub: Arc<NotificationHub>,
    pub clock: Arc<ManualClock>,
}

impl Market {
    pub fn new() -> Self {
        let ledger = Arc::new(MemoryLedger::new());
        let gateway = Arc::new(SandboxGateway::default());
        let hub = Arc::new(NotificationHub::new(256));
        let clock = Arc::new(ManualClock::new(t0()));
        let ctx = EngineContext::new(ledger.clone(), gateway.clone(), hub.clone())
            .with_clock(clock.clone());
        Self {
            engine: AuctionEngine::new(ctx),
            ledger,
            gateway,
            hub,
            clock,
        }
    }

    /// Register a property for `seller` and open an auction on it.
    ///
    /// The auction runs from `start` to `start + 1h`; it is active at once
    /// when `start` is not in the future.
    pub async fn open_auction(&self, start: DateTime<Utc>, deposit: Amount) -> AuctionId {
        let property = self
            .engine
            .lifecycle
            .register_property("seller", dec!(1000))
            .await
            .unwrap();
        let auction = self
            .engine
            .lifecycle
            .create(
                &Caller::user("seller"),
                CreateAuctionRequest {
                    property_id: property.property_id,
                    start_time: start,
                    end_time: start + Duration::hours(1),
                    min_increment: dec!(50),
                    deposit_amount: deposit,
                },
            )
            .await
            .unwrap();
        auction.auction_id
    }

    /// Join and, for deposit auctions, confirm the hold.
    pub async fn join(&self, auction_id: AuctionId, user_id: &str) {
        match self
            .engine
            .deposits
            .initiate_join(auction_id, user_id)
            .await
            .unwrap()
        {
            JoinOutcome::Joined => {}
            JoinOutcome::ApprovalRequired { order_id, .. } => {
                self.engine
                    .deposits
                    .confirm_join(&order_id, user_id, auction_id)
                    .await
                    .unwrap();
            }
        }
    }
}

impl Default for Market {
    fn default() -> Self {
        Self::new()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_bids_are_strictly_increasing() {
    let market = Arc::new(Market::new());
    let auction_id = market.open_auction(t0(), dec!(0)).await;
    let bidders: Vec<String> = (0..8).map(|i| format!("bidder-{i}")).collect();
    for bidder in &bidders {
        market.join(auction_id, bidder).await;
    }

    let mut tasks = tokio::task::JoinSet::new();
    for (i, bidder) in bidders.into_iter().enumerate() {
        let market = market.clone();
        tasks.spawn(async move {
            let mut accepted = 0;
            for step in 0..10i64 {
                let amount = Amount::from(1050 + 50 * (step * 8 + i as i64) / 2);
                if market
                    .engine
                    .bids
                    .place_bid(auction_id, &bidder, amount)
                    .await
                    .is_ok()
                {
                    accepted += 1;
                }
            }
            accepted
        });
    }

    let mut accepted = 0;
    while let Some(result) = tasks.join_next().await {
        accepted += result.unwrap();
    }

    let bids = market.ledger.get_bids(auction_id).await.unwrap();
    assert_eq!(bids.len(), accepted);
    assert!(!bids.is_empty());
    assert!(bids[0].amount >= dec!(1050));
    for pair in bids.windows(2) {
        assert!(pair[1].amount >= pair[0].amount + dec!(50));
        assert!(pair[1].bid_id > pair[0].bid_id);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bids_racing_the_sweeper_at_end_time() {
    let market = Arc::new(Market::new());
    let auction_id = market.open_auction(t0(), dec!(0)).await;
    let end_time = t0() + Duration::hours(1);
    let bidders: Vec<String> = (0..6).map(|i| format!("bidder-{i}")).collect();
    for bidder in &bidders {
        market.join(auction_id, bidder).await;
    }
    market.clock.set(end_time - Duration::seconds(1));

    let mut tasks = tokio::task::JoinSet::new();
    for (i, bidder) in bidders.into_iter().enumerate() {
        let market = market.clone();
        tasks.spawn(async move {
            let mut accepted: Vec<Bid> = Vec::new();
            for step in 0..40i64 {
                let amount = Amount::from(1050 + 25 * (step * 6 + i as i64));
                match market.engine.bids.place_bid(auction_id, &bidder, amount).await {
                    Ok(bid) => accepted.push(bid),
                    Err(AuctionError::InsufficientBid { .. }) => {}
                    Err(_) => break,
                }
                tokio::task::yield_now().await;
            }
            accepted
        });
    }

    // End the auction while bids are still arriving
    let sweeper = {
        let market = market.clone();
        tokio::spawn(async move {
            for _ in 0..10_000 {
                if market.ledger.get_bids(auction_id).await.unwrap().len() >= 3 {
                    break;
                }
                tokio::task::yield_now().await;
            }
            market.clock.set(end_time);
            market.engine.sweeper.tick().await
        })
    };

    let mut accepted: Vec<Bid> = Vec::new();
    while let Some(result) = tasks.join_next().await {
        accepted.extend(result.unwrap());
    }
    let report = sweeper.await.unwrap();
    if report.ended == 0 {
        assert_eq!(market.engine.sweeper.tick().await.ended, 1);
    }

    accepted.sort_by_key(|b| b.bid_id);
    let recorded = market.ledger.get_bids(auction_id).await.unwrap();
    assert_eq!(recorded, accepted);
    assert!(recorded.iter().all(|b| b.placed_at < end_time));

    let auction = market.ledger.get_auction(auction_id).await.unwrap().unwrap();
    assert_eq!(auction.status, AuctionStatus::Ended);
    let top = accepted.iter().max_by_key(|b| b.amount).map(|b| b.bidder.clone());
    assert!(top.is_some());
    assert_eq!(auction.winner, top);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_increment_scenario() {
    let market = Arc::new(Market::new());
    let auction_id = market.open_auction(t0(), dec!(0)).await;
    for user in ["alice", "bob", "carol"] {
        market.join(auction_id, user).await;
    }

    let bids = &market.engine.bids;
    assert_eq!(
        bids.place_bid(auction_id, "alice", dec!(1000)).await,
        Err(AuctionError::InsufficientBid {
            minimum: dec!(1050),
            offered: dec!(1000),
        })
    );
    bids.place_bid(auction_id, "alice", dec!(1050)).await.unwrap();

    let (bob, carol) = tokio::join!(
        {
            let market = market.clone();
            async move { market.engine.bids.place_bid(auction_id, "bob", dec!(1050)).await }
        },
        {
            let market = market.clone();
            async move { market.engine.bids.place_bid(auction_id, "carol", dec!(1100)).await }
        },
    );
    assert!(matches!(bob, Err(AuctionError::InsufficientBid { .. })));
    assert_eq!(carol.unwrap().amount, dec!(1100));

    let amounts: Vec<Amount> = market
        .ledger
        .get_bids(auction_id)
        .await
        .unwrap()
        .into_iter()
        .map(|b| b.amount)
        .collect();
    assert_eq!(amounts, vec![dec!(1050), dec!(1100)]);
}

#[tokio::test]
async fn test_bids_rejected_outside_active_window() {
    let market = Market::new();
    let scheduled = market.open_auction(t0() + Duration::hours(1), dec!(0)).await;
    market.join(scheduled, "alice").await;

    assert!(matches!(
        market.engine.bids.place_bid(scheduled, "alice", dec!(5000)).await,
        Err(AuctionError::InvalidState { .. })
    ));

    market
        .engine
        .lifecycle
        .cancel(&Caller::user("seller"), scheduled, "Owner withdrew the listing")
        .await
        .unwrap();
    assert!(market
        .engine
        .bids
        .place_bid(scheduled, "alice", dec!(5000))
        .await
        .is_err());
    assert!(market.ledger.get_bids(scheduled).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sweeper_starts_auction_and_notifies_participants() {
    let market = Market::new();
    let start = t0() + Duration::hours(1);
    let auction_id = market.open_auction(start, dec!(0)).await;
    market.join(auction_id, "alice").await;
    market.join(auction_id, "bob").await;
    let mut alice = market.hub.connect("alice");
    let mut bob = market.hub.connect("bob");

    market.clock.set(start + Duration::seconds(1));
    let report = market.engine.sweeper.tick().await;
    assert_eq!(report.activated, 1);
    assert!(report.committed);

    let auction = market.ledger.get_auction(auction_id).await.unwrap().unwrap();
    assert_eq!(auction.status, AuctionStatus::Active);
    let expected = Notification::AuctionStarted {
        auction_id,
        end_time: auction.end_time,
    };
    assert_eq!(alice.try_recv().unwrap(), expected);
    assert_eq!(bob.try_recv().unwrap(), expected);

    // Nothing left to do
    assert!(market.engine.sweeper.tick().await.is_idle());
    assert!(alice.try_recv().is_err());
}

#[tokio::test]
async fn test_zero_deposit_join() {
    let market = Market::new();
    let auction_id = market.open_auction(t0() + Duration::hours(1), dec!(0)).await;

    let outcome = market
        .engine
        .deposits
        .initiate_join(auction_id, "alice")
        .await
        .unwrap();
    assert_eq!(outcome, JoinOutcome::Joined);

    let participants = market.ledger.get_participants(auction_id).await.unwrap();
    assert_eq!(participants.len(), 1);
    assert_eq!(participants[0].user_id, "alice");
    assert!(market.ledger.get_holds(auction_id).await.unwrap().is_empty());
    assert_eq!(market.gateway.call_count(SandboxOp::CreateOrder), 0);
}

#[tokio::test]
async fn test_double_initiate_returns_same_order() {
    let market = Market::new();
    let auction_id = market
        .open_auction(t0() + Duration::hours(1), dec!(250))
        .await;
    let deposits = &market.engine.deposits;

    let first = deposits.initiate_join(auction_id, "alice").await.unwrap();
    let second = deposits.initiate_join(auction_id, "alice").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(market.gateway.call_count(SandboxOp::CreateOrder), 1);

    let JoinOutcome::ApprovalRequired { order_id, .. } = first else {
        panic!("deposit auction must require approval");
    };
    let hold = deposits
        .confirm_join(&order_id, "alice", auction_id)
        .await
        .unwrap();
    assert_eq!(hold.amount, dec!(250));
    assert_eq!(hold.status, HoldStatus::Active);

    assert_eq!(
        deposits.initiate_join(auction_id, "alice").await,
        Err(AuctionError::AlreadyParticipant)
    );
    assert!(deposits
        .confirm_join(&order_id, "alice", auction_id)
        .await
        .is_err());
    assert_eq!(market.ledger.get_participants(auction_id).await.unwrap().len(), 1);
    assert_eq!(market.ledger.get_holds(auction_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_authorization_leaves_no_rows() {
    let market = Market::new();
    let auction_id = market
        .open_auction(t0() + Duration::hours(1), dec!(250))
        .await;
    let deposits = &market.engine.deposits;

    let JoinOutcome::ApprovalRequired { order_id, .. } =
        deposits.initiate_join(auction_id, "alice").await.unwrap()
    else {
        panic!("deposit auction must require approval");
    };

    market.gateway.fail_next(
        SandboxOp::Authorize,
        GatewayError::Rejected("INSTRUMENT_DECLINED".into()),
    );
    let err = deposits
        .confirm_join(&order_id, "alice", auction_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AuctionError::Gateway(GatewayError::Rejected(_))));
    assert!(market.ledger.get_participants(auction_id).await.unwrap().is_empty());
    assert!(market.ledger.get_holds(auction_id).await.unwrap().is_empty());

    // The pending order survives the failure and can be confirmed again
    deposits
        .confirm_join(&order_id, "alice", auction_id)
        .await
        .unwrap();
    assert_eq!(market.ledger.get_participants(auction_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_leave_active_auction_fails() {
    let market = Market::new();
    let start = t0() + Duration::hours(1);
    let auction_id = market.open_auction(start, dec!(250)).await;
    market.join(auction_id, "alice").await;

    market.clock.set(start);
    assert_eq!(market.engine.sweeper.tick().await.activated, 1);

    assert_eq!(
        market.engine.deposits.leave_auction(auction_id, "alice").await,
        Err(AuctionError::ParticipantsLocked)
    );
    assert_eq!(market.ledger.get_participants(auction_id).await.unwrap().len(), 1);
    assert_eq!(market.gateway.call_count(SandboxOp::Void), 0);
}

#[tokio::test]
async fn test_leave_scheduled_auction_voids_hold() {
    let market = Market::new();
    let auction_id = market
        .open_auction(t0() + Duration::hours(1), dec!(250))
        .await;
    market.join(auction_id, "alice").await;
    let gateway_hold = market.gateway.active_holds().pop().unwrap();

    market
        .engine
        .deposits
        .leave_auction(auction_id, "alice")
        .await
        .unwrap();

    assert!(market.gateway.is_voided(&gateway_hold));
    assert!(market.ledger.get_participants(auction_id).await.unwrap().is_empty());
    let holds = market.ledger.get_holds(auction_id).await.unwrap();
    assert!(holds.iter().all(|h| h.status == HoldStatus::Released));
}

#[tokio::test]
async fn test_full_auction_with_deposits() {
    let market = Market::new();
    let start = t0() + Duration::hours(1);
    let auction_id = market.open_auction(start, dec!(250)).await;
    market.join(auction_id, "alice").await;
    market.join(auction_id, "bob").await;
    assert_eq!(market.gateway.active_holds().len(), 2);

    market.clock.set(start);
    assert_eq!(market.engine.sweeper.tick().await.activated, 1);

    let bids = &market.engine.bids;
    bids.place_bid(auction_id, "alice", dec!(1050)).await.unwrap();
    bids.place_bid(auction_id, "bob", dec!(1200)).await.unwrap();
    bids.place_bid(auction_id, "alice", dec!(1300)).await.unwrap();

    market.clock.set(start + Duration::hours(1));
    let report = market.engine.sweeper.tick().await;
    assert_eq!(report.ended, 1);
    assert_eq!(report.holds_released, 1);

    let auction = market.ledger.get_auction(auction_id).await.unwrap().unwrap();
    assert_eq!(auction.status, AuctionStatus::Ended);
    assert_eq!(auction.winner.as_deref(), Some("alice"));
    let property = market
        .ledger
        .get_property(auction.property_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(property.status, PropertyStatus::Sold);

    // Only the winner's deposit stays on hold
    let holds = market.ledger.get_holds(auction_id).await.unwrap();
    let active: Vec<&str> = holds
        .iter()
        .filter(|h| h.is_active())
        .map(|h| h.owner.as_str())
        .collect();
    assert_eq!(active, vec!["alice"]);
    assert_eq!(market.gateway.active_holds().len(), 1);

    assert!(market
        .engine
        .bids
        .place_bid(auction_id, "bob", dec!(2000))
        .await
        .is_err());
}

#[tokio::test]
async fn test_cancelled_auction_releases_holds() {
    let market = Market::new();
    let auction_id = market
        .open_auction(t0() + Duration::hours(1), dec!(250))
        .await;
    market.join(auction_id, "alice").await;

    let cancelled = market
        .engine
        .lifecycle
        .cancel(&Caller::user("seller"), auction_id, "Title dispute with the lender")
        .await
        .unwrap();
    assert_eq!(cancelled.status, AuctionStatus::Cancelled);
    assert!(market.ledger.get_participants(auction_id).await.unwrap().is_empty());

    let report = market.engine.sweeper.tick().await;
    assert_eq!(report.holds_released, 1);
    assert!(market.gateway.active_holds().is_empty());
    let property = market
        .ledger
        .get_property(cancelled.property_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(property.status, PropertyStatus::Available);
}

#[tokio::test]
async fn test_remake_ended_auction_without_bids() {
    let market = Market::new();
    let start = t0() + Duration::hours(1);
    let auction_id = market.open_auction(start, dec!(0)).await;

    market.clock.set(start + Duration::hours(1));
    let report = market.engine.sweeper.tick().await;
    assert_eq!(report.activated + report.ended, 1);
    if report.ended == 0 {
        assert_eq!(market.engine.sweeper.tick().await.ended, 1);
    }

    let now = market.clock.now();
    let remade = market
        .engine
        .lifecycle
        .remake(
            &Caller::user("seller"),
            auction_id,
            now + Duration::hours(1),
            now + Duration::hours(2),
        )
        .await
        .unwrap();
    assert_eq!(remade.status, AuctionStatus::Scheduled);
    assert_eq!(remade.winner, None);
}
