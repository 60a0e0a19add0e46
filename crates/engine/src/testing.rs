//! Fixtures for unit tests.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal_macros::dec;

use auction_types::{
    Amount, Auction, AuctionId, AuctionStatus, Bid, Participant, Property, PropertyId,
    PropertyStatus,
};

use crate::clock::ManualClock;
use crate::context::EngineContext;
use crate::gateway::SandboxGateway;
use crate::notify::NotificationHub;
use crate::store::{Changeset, IdKind, LedgerStore, MemoryLedger};

pub(crate) fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

pub(crate) struct TestEnv {
    pub ledger: Arc<MemoryLedger>,
    pub gateway: Arc<SandboxGateway>,
    pub hub: Arc<NotificationHub>,
    pub clock: Arc<ManualClock>,
    pub ctx: Arc<EngineContext>,
}

impl TestEnv {
    pub fn new() -> Self {
        let ledger = Arc::new(MemoryLedger::new());
        let gateway = Arc::new(SandboxGateway::default());
        let hub = Arc::new(NotificationHub::new(16));
        let clock = Arc::new(ManualClock::new(t0()));
        let ctx = EngineContext::new(ledger.clone(), gateway.clone(), hub.clone())
            .with_clock(clock.clone());
        Self {
            ledger,
            gateway,
            hub,
            clock,
            ctx: Arc::new(ctx),
        }
    }

    pub async fn property(&self, owner: &str) -> PropertyId {
        let property_id = self.ledger.allocate_id(IdKind::Property).await.unwrap();
        let mut changes = Changeset::new();
        changes.put_property(Property {
            property_id,
            owner: owner.into(),
            starting_price: dec!(1000),
            status: PropertyStatus::Available,
        });
        self.ledger.commit(changes).await.unwrap();
        property_id
    }

    /// An auction by "seller" on a fresh property, starting price 1000,
    /// increment 50.
    pub async fn auction(&self, status: AuctionStatus, deposit: Amount) -> AuctionId {
        let property_id = self.property("seller").await;
        let auction_id = self.ledger.allocate_id(IdKind::Auction).await.unwrap();
        let (start, end) = match status {
            AuctionStatus::Scheduled => (t0() + Duration::hours(1), t0() + Duration::hours(2)),
            AuctionStatus::Active => (t0() - Duration::hours(1), t0() + Duration::hours(1)),
            _ => (t0() - Duration::hours(2), t0() - Duration::hours(1)),
        };

        let mut changes = Changeset::new();
        changes.put_auction(Auction {
            auction_id,
            property_id,
            creator: "seller".into(),
            status,
            start_time: start,
            end_time: end,
            min_increment: dec!(50),
            deposit_amount: deposit,
            winner: None,
            cancellation_reason: None,
            created_at: t0() - Duration::days(1),
            updated_at: t0() - Duration::days(1),
        });
        if status == AuctionStatus::Active {
            changes.set_property_status(property_id, PropertyStatus::UnderAuction);
        }
        self.ledger.commit(changes).await.unwrap();
        auction_id
    }

    pub async fn participant(&self, auction_id: AuctionId, user_id: &str) {
        let mut changes = Changeset::new();
        changes.insert_participant(Participant {
            auction_id,
            user_id: user_id.into(),
            registered_at: t0(),
        });
        self.ledger.commit(changes).await.unwrap();
    }

    pub async fn bid(&self, auction_id: AuctionId, bidder: &str, amount: Amount) {
        let bid_id = self.ledger.allocate_id(IdKind::Bid).await.unwrap();
        let mut changes = Changeset::new();
        changes.insert_bid(Bid {
            bid_id,
            auction_id,
            bidder: bidder.into(),
            amount,
            placed_at: t0(),
        });
        self.ledger.commit(changes).await.unwrap();
    }

    pub async fn auction_row(&self, auction_id: AuctionId) -> Auction {
        self.ledger.get_auction(auction_id).await.unwrap().unwrap()
    }
}
