//! Ledger storage for auctions, bids, participants and deposit holds.
//!
//! Reads go through [`LedgerStore`] getters. Writes are staged in a
//! [`Changeset`] and applied by a single [`LedgerStore::commit`], which is
//! all-or-nothing across entity types.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use auction_types::{
    Auction, AuctionId, AuctionStatus, Bid, DepositHold, HoldId, Participant, Property,
    PropertyId, PropertyStatus, UserId,
};

/// Errors returned by a ledger store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A guard or uniqueness check failed because of a concurrent write.
    #[error("Write conflict: {0}")]
    Conflict(String),

    /// The changeset would violate a ledger invariant.
    #[error("Constraint violated: {0}")]
    Constraint(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Tables with ledger-assigned identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdKind {
    Property,
    Auction,
    Bid,
    Hold,
}

/// A single staged write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    PutAuction(Auction),
    RemoveAuction(AuctionId),
    InsertBid(Bid),
    InsertParticipant(Participant),
    RemoveParticipant { auction_id: AuctionId, user_id: UserId },
    PutHold(DepositHold),
    PutProperty(Property),
    SetPropertyStatus {
        property_id: PropertyId,
        status: PropertyStatus,
    },
}

/// A precondition evaluated atomically with the commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guard {
    AuctionStatus {
        auction_id: AuctionId,
        expected: AuctionStatus,
    },
}

/// Pending writes applied together by [`LedgerStore::commit`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changeset {
    changes: Vec<Change>,
    guards: Vec<Guard>,
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_auction(&mut self, auction: Auction) -> &mut Self {
        self.changes.push(Change::PutAuction(auction));
        self
    }

    pub fn remove_auction(&mut self, auction_id: AuctionId) -> &mut Self {
        self.changes.push(Change::RemoveAuction(auction_id));
        self
    }

    pub fn insert_bid(&mut self, bid: Bid) -> &mut Self {
        self.changes.push(Change::InsertBid(bid));
        self
    }

    pub fn insert_participant(&mut self, participant: Participant) -> &mut Self {
        self.changes.push(Change::InsertParticipant(participant));
        self
    }

    pub fn remove_participant(&mut self, auction_id: AuctionId, user_id: impl Into<UserId>) -> &mut Self {
        self.changes.push(Change::RemoveParticipant {
            auction_id,
            user_id: user_id.into(),
        });
        self
    }

    pub fn put_hold(&mut self, hold: DepositHold) -> &mut Self {
        self.changes.push(Change::PutHold(hold));
        self
    }

    pub fn put_property(&mut self, property: Property) -> &mut Self {
        self.changes.push(Change::PutProperty(property));
        self
    }

    pub fn set_property_status(&mut self, property_id: PropertyId, status: PropertyStatus) -> &mut Self {
        self.changes.push(Change::SetPropertyStatus {
            property_id,
            status,
        });
        self
    }

    /// Fail the whole commit unless the auction is still in `expected`.
    pub fn expect_status(&mut self, auction_id: AuctionId, expected: AuctionStatus) -> &mut Self {
        self.guards.push(Guard::AuctionStatus {
            auction_id,
            expected,
        });
        self
    }

    /// Append another changeset, guards included.
    pub fn extend(&mut self, other: Changeset) -> &mut Self {
        self.changes.extend(other.changes);
        self.guards.extend(other.guards);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn guards(&self) -> &[Guard] {
        &self.guards
    }
}

/// Repository-style access to the auction ledger.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Reserve the next identifier for a table.
    async fn allocate_id(&self, kind: IdKind) -> StoreResult<u64>;

    async fn get_auction(&self, auction_id: AuctionId) -> StoreResult<Option<Auction>>;

    async fn find_auctions(
        &self,
        predicate: &(dyn for<'r> Fn(&'r Auction) -> bool + Send + Sync),
    ) -> StoreResult<Vec<Auction>>;

    async fn get_property(&self, property_id: PropertyId) -> StoreResult<Option<Property>>;

    /// Bids in acceptance order.
    async fn get_bids(&self, auction_id: AuctionId) -> StoreResult<Vec<Bid>>;

    async fn get_highest_bid(&self, auction_id: AuctionId) -> StoreResult<Option<Bid>>;

    async fn get_participant(
        &self,
        auction_id: AuctionId,
        user_id: &str,
    ) -> StoreResult<Option<Participant>>;

    async fn get_participants(&self, auction_id: AuctionId) -> StoreResult<Vec<Participant>>;

    async fn get_active_hold(
        &self,
        auction_id: AuctionId,
        user_id: &str,
    ) -> StoreResult<Option<DepositHold>>;

    async fn get_hold(&self, hold_id: HoldId) -> StoreResult<Option<DepositHold>>;

    async fn get_holds(&self, auction_id: AuctionId) -> StoreResult<Vec<DepositHold>>;

    async fn find_holds(
        &self,
        predicate: &(dyn for<'r> Fn(&'r DepositHold) -> bool + Send + Sync),
    ) -> StoreResult<Vec<DepositHold>>;

    /// Apply every change in the set, or none of them.
    async fn commit(&self, changes: Changeset) -> StoreResult<()>;
}

/// In-memory ledger tables.
#[derive(Debug, Default, Clone)]
struct Tables {
    auctions: HashMap<AuctionId, Auction>,
    properties: HashMap<PropertyId, Property>,
    /// Bids per auction, in acceptance order
    bids: HashMap<AuctionId, Vec<Bid>>,
    /// Participants keyed by (auction_id, user_id)
    participants: BTreeMap<(AuctionId, UserId), Participant>,
    holds: HashMap<HoldId, DepositHold>,
}

#[derive(Debug)]
struct Counters {
    next_property_id: u64,
    next_auction_id: u64,
    next_bid_id: u64,
    next_hold_id: u64,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            next_property_id: 1,
            next_auction_id: 1,
            next_bid_id: 1,
            next_hold_id: 1,
        }
    }
}

/// Single-process ledger.
///
/// Commits apply to a scratch copy of the tables under the write lock and
/// replace the live tables only when every change succeeded.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    tables: RwLock<Tables>,
    counters: Mutex<Counters>,
    commits: Mutex<u64>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful commits so far.
    pub fn commit_count(&self) -> u64 {
        *self.commits.lock()
    }
}

impl Tables {
    fn check_guard(&self, guard: &Guard) -> StoreResult<()> {
        match guard {
            Guard::AuctionStatus {
                auction_id,
                expected,
            } => {
                let auction = self
                    .auctions
                    .get(auction_id)
                    .ok_or_else(|| StoreError::Conflict(format!("auction {auction_id} no longer exists")))?;
                if auction.status != *expected {
                    return Err(StoreError::Conflict(format!(
                        "auction {auction_id} is {}, expected {expected}",
                        auction.status
                    )));
                }
                Ok(())
            }
        }
    }

    fn require_auction(&self, auction_id: AuctionId) -> StoreResult<&Auction> {
        self.auctions
            .get(&auction_id)
            .ok_or_else(|| StoreError::Constraint(format!("auction {auction_id} does not exist")))
    }

    fn apply(&mut self, change: Change) -> StoreResult<()> {
        match change {
            Change::PutAuction(auction) => {
                if !self.properties.contains_key(&auction.property_id) {
                    return Err(StoreError::Constraint(format!(
                        "property {} does not exist",
                        auction.property_id
                    )));
                }
                if auction.status.is_open() {
                    let clash = self.auctions.values().any(|other| {
                        other.auction_id != auction.auction_id
                            && other.property_id == auction.property_id
                            && other.status.is_open()
                    });
                    if clash {
                        return Err(StoreError::Conflict(format!(
                            "property {} already has an open auction",
                            auction.property_id
                        )));
                    }
                }
                self.auctions.insert(auction.auction_id, auction);
            }

            Change::RemoveAuction(auction_id) => {
                self.require_auction(auction_id)?;
                if self.bids.get(&auction_id).is_some_and(|b| !b.is_empty()) {
                    return Err(StoreError::Constraint(format!(
                        "auction {auction_id} has bids and cannot be deleted"
                    )));
                }
                self.auctions.remove(&auction_id);
                self.bids.remove(&auction_id);
                self.participants.retain(|(aid, _), _| *aid != auction_id);
                self.holds.retain(|_, h| h.auction_id != auction_id);
            }

            Change::InsertBid(bid) => {
                self.require_auction(bid.auction_id)?;
                let bids = self.bids.entry(bid.auction_id).or_default();
                if bids.iter().any(|b| b.bid_id == bid.bid_id) {
                    return Err(StoreError::Conflict(format!("bid {} already exists", bid.bid_id)));
                }
                if let Some(top) = bids.iter().map(|b| b.amount).max() {
                    if bid.amount <= top {
                        return Err(StoreError::Conflict(format!(
                            "bid {} does not exceed current highest {top}",
                            bid.amount
                        )));
                    }
                }
                bids.push(bid);
            }

            Change::InsertParticipant(participant) => {
                let auction = self.require_auction(participant.auction_id)?;
                if auction.creator == participant.user_id {
                    return Err(StoreError::Constraint(
                        "auction creator cannot be a participant".into(),
                    ));
                }
                let key = (participant.auction_id, participant.user_id.clone());
                if self.participants.contains_key(&key) {
                    return Err(StoreError::Conflict(format!(
                        "{} is already a participant of auction {}",
                        participant.user_id, participant.auction_id
                    )));
                }
                self.participants.insert(key, participant);
            }

            Change::RemoveParticipant {
                auction_id,
                user_id,
            } => {
                if self.participants.remove(&(auction_id, user_id.clone())).is_none() {
                    return Err(StoreError::NotFound(format!(
                        "participant {user_id} of auction {auction_id}"
                    )));
                }
            }

            Change::PutHold(hold) => {
                self.require_auction(hold.auction_id)?;
                if hold.is_active() {
                    let duplicate = self.holds.values().any(|other| {
                        other.hold_id != hold.hold_id
                            && other.is_active()
                            && other.auction_id == hold.auction_id
                            && other.owner == hold.owner
                    });
                    if duplicate {
                        return Err(StoreError::Constraint(format!(
                            "{} already has an active hold on auction {}",
                            hold.owner, hold.auction_id
                        )));
                    }
                }
                self.holds.insert(hold.hold_id, hold);
            }

            Change::PutProperty(property) => {
                self.properties.insert(property.property_id, property);
            }

            Change::SetPropertyStatus {
                property_id,
                status,
            } => {
                let property = self
                    .properties
                    .get_mut(&property_id)
                    .ok_or_else(|| StoreError::NotFound(format!("property {property_id}")))?;
                property.status = status;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn allocate_id(&self, kind: IdKind) -> StoreResult<u64> {
        let mut counters = self.counters.lock();
        let slot = match kind {
            IdKind::Property => &mut counters.next_property_id,
            IdKind::Auction => &mut counters.next_auction_id,
            IdKind::Bid => &mut counters.next_bid_id,
            IdKind::Hold => &mut counters.next_hold_id,
        };
        let id = *slot;
        *slot += 1;
        Ok(id)
    }

    async fn get_auction(&self, auction_id: AuctionId) -> StoreResult<Option<Auction>> {
        Ok(self.tables.read().auctions.get(&auction_id).cloned())
    }

    async fn find_auctions(
        &self,
        predicate: &(dyn for<'r> Fn(&'r Auction) -> bool + Send + Sync),
    ) -> StoreResult<Vec<Auction>> {
        let tables = self.tables.read();
        let mut found: Vec<Auction> = tables
            .auctions
            .values()
            .filter(|a| predicate(a))
            .cloned()
            .collect();
        found.sort_by_key(|a| a.auction_id);
        Ok(found)
    }

    async fn get_property(&self, property_id: PropertyId) -> StoreResult<Option<Property>> {
        Ok(self.tables.read().properties.get(&property_id).cloned())
    }

    async fn get_bids(&self, auction_id: AuctionId) -> StoreResult<Vec<Bid>> {
        Ok(self
            .tables
            .read()
            .bids
            .get(&auction_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_highest_bid(&self, auction_id: AuctionId) -> StoreResult<Option<Bid>> {
        Ok(self
            .tables
            .read()
            .bids
            .get(&auction_id)
            .and_then(|bids| bids.iter().max_by_key(|b| b.amount))
            .cloned())
    }

    async fn get_participant(
        &self,
        auction_id: AuctionId,
        user_id: &str,
    ) -> StoreResult<Option<Participant>> {
        Ok(self
            .tables
            .read()
            .participants
            .get(&(auction_id, user_id.to_string()))
            .cloned())
    }

    async fn get_participants(&self, auction_id: AuctionId) -> StoreResult<Vec<Participant>> {
        let tables = self.tables.read();
        let start = (auction_id, UserId::new());
        Ok(tables
            .participants
            .range(start..)
            .take_while(|((aid, _), _)| *aid == auction_id)
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn get_active_hold(
        &self,
        auction_id: AuctionId,
        user_id: &str,
    ) -> StoreResult<Option<DepositHold>> {
        Ok(self
            .tables
            .read()
            .holds
            .values()
            .find(|h| h.is_active() && h.auction_id == auction_id && h.owner == user_id)
            .cloned())
    }

    async fn get_hold(&self, hold_id: HoldId) -> StoreResult<Option<DepositHold>> {
        Ok(self.tables.read().holds.get(&hold_id).cloned())
    }

    async fn get_holds(&self, auction_id: AuctionId) -> StoreResult<Vec<DepositHold>> {
        self.find_holds(&move |h: &DepositHold| h.auction_id == auction_id)
            .await
    }

    async fn find_holds(
        &self,
        predicate: &(dyn for<'r> Fn(&'r DepositHold) -> bool + Send + Sync),
    ) -> StoreResult<Vec<DepositHold>> {
        let tables = self.tables.read();
        let mut found: Vec<DepositHold> = tables
            .holds
            .values()
            .filter(|h| predicate(h))
            .cloned()
            .collect();
        found.sort_by_key(|h| h.hold_id);
        Ok(found)
    }

    async fn commit(&self, changes: Changeset) -> StoreResult<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut live = self.tables.write();
        for guard in &changes.guards {
            live.check_guard(guard)?;
        }

        let mut draft = live.clone();
        for change in changes.changes {
            draft.apply(change)?;
        }
        *live = draft;

        *self.commits.lock() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use auction_types::HoldStatus;
    use chrono::{DateTime, Utc};
    use rust_decimal_macros::dec;

    fn ts() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn property(id: PropertyId) -> Property {
        Property {
            property_id: id,
            owner: "seller".into(),
            starting_price: dec!(1000),
            status: PropertyStatus::Available,
        }
    }

    fn auction(id: AuctionId, property_id: PropertyId) -> Auction {
        Auction {
            auction_id: id,
            property_id,
            creator: "seller".into(),
            status: AuctionStatus::Active,
            start_time: ts(),
            end_time: ts() + chrono::Duration::hours(1),
            min_increment: dec!(50),
            deposit_amount: dec!(0),
            winner: None,
            cancellation_reason: None,
            created_at: ts(),
            updated_at: ts(),
        }
    }

    fn bid(id: u64, auction_id: AuctionId, amount: rust_decimal::Decimal) -> Bid {
        Bid {
            bid_id: id,
            auction_id,
            bidder: "alice".into(),
            amount,
            placed_at: ts(),
        }
    }

    fn hold(id: HoldId, auction_id: AuctionId, owner: &str) -> DepositHold {
        DepositHold {
            hold_id: id,
            owner: owner.into(),
            auction_id,
            amount: dec!(500),
            gateway_hold_id: format!("AUTH-{id}"),
            status: HoldStatus::Active,
            created_at: ts(),
            expires_at: ts() + chrono::Duration::days(29),
        }
    }

    async fn seeded() -> MemoryLedger {
        let ledger = MemoryLedger::new();
        let mut changes = Changeset::new();
        changes.put_property(property(1)).put_auction(auction(1, 1));
        ledger.commit(changes).await.unwrap();
        ledger
    }

    #[tokio::test]
    async fn test_allocate_ids_per_table() {
        let ledger = MemoryLedger::new();
        assert_eq!(ledger.allocate_id(IdKind::Auction).await.unwrap(), 1);
        assert_eq!(ledger.allocate_id(IdKind::Auction).await.unwrap(), 2);
        assert_eq!(ledger.allocate_id(IdKind::Bid).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_commit_is_all_or_nothing() {
        let ledger = seeded().await;

        let mut changes = Changeset::new();
        changes
            .insert_bid(bid(1, 1, dec!(1050)))
            .insert_participant(Participant {
                auction_id: 1,
                user_id: "seller".into(),
                registered_at: ts(),
            });

        let result = ledger.commit(changes).await;
        assert!(matches!(result, Err(StoreError::Constraint(_))));
        assert!(ledger.get_bids(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bid_must_exceed_highest() {
        let ledger = seeded().await;

        let mut first = Changeset::new();
        first.insert_bid(bid(1, 1, dec!(1050)));
        ledger.commit(first).await.unwrap();

        let mut second = Changeset::new();
        second.insert_bid(bid(2, 1, dec!(1050)));
        assert!(matches!(
            ledger.commit(second).await,
            Err(StoreError::Conflict(_))
        ));

        let highest = ledger.get_highest_bid(1).await.unwrap().unwrap();
        assert_eq!(highest.bid_id, 1);
    }

    #[tokio::test]
    async fn test_status_guard() {
        let ledger = seeded().await;

        let mut changes = Changeset::new();
        changes
            .expect_status(1, AuctionStatus::Scheduled)
            .set_property_status(1, PropertyStatus::Sold);
        assert!(matches!(
            ledger.commit(changes).await,
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(
            ledger.get_property(1).await.unwrap().unwrap().status,
            PropertyStatus::Available
        );
    }

    #[tokio::test]
    async fn test_one_active_hold_per_user_and_auction() {
        let ledger = seeded().await;

        let mut first = Changeset::new();
        first.put_hold(hold(1, 1, "alice"));
        ledger.commit(first).await.unwrap();

        let mut second = Changeset::new();
        second.put_hold(hold(2, 1, "alice"));
        assert!(matches!(
            ledger.commit(second).await,
            Err(StoreError::Constraint(_))
        ));

        let mut released = hold(1, 1, "alice");
        released.status = HoldStatus::Released;
        let mut third = Changeset::new();
        third.put_hold(released).put_hold(hold(2, 1, "alice"));
        ledger.commit(third).await.unwrap();

        let active = ledger.get_active_hold(1, "alice").await.unwrap().unwrap();
        assert_eq!(active.hold_id, 2);
    }

    #[tokio::test]
    async fn test_remove_auction_cascades() {
        let ledger = seeded().await;

        let mut changes = Changeset::new();
        changes
            .insert_participant(Participant {
                auction_id: 1,
                user_id: "alice".into(),
                registered_at: ts(),
            })
            .put_hold(hold(1, 1, "alice"));
        ledger.commit(changes).await.unwrap();

        let mut remove = Changeset::new();
        remove.remove_auction(1);
        ledger.commit(remove).await.unwrap();

        assert!(ledger.get_auction(1).await.unwrap().is_none());
        assert!(ledger.get_participants(1).await.unwrap().is_empty());
        assert!(ledger.get_holds(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_auction_with_bids_is_never_deleted() {
        let ledger = seeded().await;

        let mut changes = Changeset::new();
        changes.insert_bid(bid(1, 1, dec!(1100)));
        ledger.commit(changes).await.unwrap();

        let mut remove = Changeset::new();
        remove.remove_auction(1);
        assert!(matches!(
            ledger.commit(remove).await,
            Err(StoreError::Constraint(_))
        ));
    }

    #[tokio::test]
    async fn test_one_open_auction_per_property() {
        let ledger = seeded().await;

        let mut changes = Changeset::new();
        changes.put_auction(auction(2, 1));
        assert!(matches!(
            ledger.commit(changes).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_participants_scoped_to_auction() {
        let ledger = seeded().await;
        let mut changes = Changeset::new();
        changes.put_property(property(2)).put_auction(auction(2, 2));
        for (aid, user) in [(1, "alice"), (1, "bob"), (2, "carol")] {
            changes.insert_participant(Participant {
                auction_id: aid,
                user_id: user.into(),
                registered_at: ts(),
            });
        }
        ledger.commit(changes).await.unwrap();

        let ids: Vec<_> = ledger
            .get_participants(1)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.user_id)
            .collect();
        assert_eq!(ids, vec!["alice".to_string(), "bob".to_string()]);
    }
}
