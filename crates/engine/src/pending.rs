//! Correlation of unconfirmed gateway orders to join requests.
//!
//! Entries live between `InitiateJoin` and `ConfirmJoin` and expire after the
//! configured TTL. A deployment with several engine instances needs a shared
//! implementation of [`PendingJoins`] (a key-value store with TTL); the
//! in-memory one only serves a single process.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use auction_types::{AuctionId, UserId};

/// A deposit order the user has not approved yet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingJoin {
    pub order_id: String,
    pub auction_id: AuctionId,
    pub user_id: UserId,
    pub approval_url: String,
    pub expires_at: DateTime<Utc>,
}

impl PendingJoin {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Store of pending joins keyed by gateway order id.
pub trait PendingJoins: Send + Sync {
    fn insert(&self, join: PendingJoin);

    /// Live entry for this (auction, user), if any.
    fn find(&self, auction_id: AuctionId, user_id: &str, now: DateTime<Utc>) -> Option<PendingJoin>;

    /// Remove and return a live entry. Only one caller can claim an order.
    fn claim(&self, order_id: &str, now: DateTime<Utc>) -> Option<PendingJoin>;

    /// Put back an entry whose confirmation failed for a retryable reason.
    fn restore(&self, join: PendingJoin);

    /// Drop expired entries. Returns how many were dropped.
    fn purge_expired(&self, now: DateTime<Utc>) -> usize;
}

#[derive(Debug, Default)]
pub struct MemoryPendingJoins {
    entries: Mutex<HashMap<String, PendingJoin>>,
}

impl MemoryPendingJoins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PendingJoins for MemoryPendingJoins {
    fn insert(&self, join: PendingJoin) {
        self.entries.lock().insert(join.order_id.clone(), join);
    }

    fn find(&self, auction_id: AuctionId, user_id: &str, now: DateTime<Utc>) -> Option<PendingJoin> {
        self.entries
            .lock()
            .values()
            .find(|j| j.auction_id == auction_id && j.user_id == user_id && !j.is_expired(now))
            .cloned()
    }

    fn claim(&self, order_id: &str, now: DateTime<Utc>) -> Option<PendingJoin> {
        let mut entries = self.entries.lock();
        let join = entries.remove(order_id)?;
        (!join.is_expired(now)).then_some(join)
    }

    fn restore(&self, join: PendingJoin) {
        self.insert(join);
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, j| !j.is_expired(now));
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn join(order: &str) -> PendingJoin {
        PendingJoin {
            order_id: order.into(),
            auction_id: 1,
            user_id: "alice".into(),
            approval_url: format!("https://pay/approve?token={order}"),
            expires_at: t0() + Duration::minutes(10),
        }
    }

    #[test]
    fn test_claim_is_exclusive() {
        let pending = MemoryPendingJoins::new();
        pending.insert(join("O-1"));

        assert!(pending.claim("O-1", t0()).is_some());
        assert!(pending.claim("O-1", t0()).is_none());
    }

    #[test]
    fn test_expired_entries_are_invisible() {
        let pending = MemoryPendingJoins::new();
        pending.insert(join("O-1"));
        let later = t0() + Duration::minutes(11);

        assert!(pending.find(1, "alice", t0()).is_some());
        assert!(pending.find(1, "alice", later).is_none());
        assert!(pending.claim("O-1", later).is_none());
    }

    #[test]
    fn test_purge_expired() {
        let pending = MemoryPendingJoins::new();
        pending.insert(join("O-1"));
        let mut fresh = join("O-2");
        fresh.expires_at = t0() + Duration::minutes(30);
        pending.insert(fresh);

        assert_eq!(pending.purge_expired(t0() + Duration::minutes(15)), 1);
        assert_eq!(pending.len(), 1);
    }
}
