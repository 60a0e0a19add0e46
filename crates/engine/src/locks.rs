//! Per-auction serialization points.
//!
//! Every write that depends on an auction's current bid set or status takes
//! that auction's lock. Unrelated auctions never contend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use auction_types::AuctionId;

/// Held while a caller owns an auction's serialization point.
pub type AuctionGuard = OwnedMutexGuard<()>;

/// Async mutexes keyed by auction id.
#[derive(Debug, Default)]
pub struct AuctionLocks {
    slots: Mutex<HashMap<AuctionId, Arc<AsyncMutex<()>>>>,
}

impl AuctionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, auction_id: AuctionId) -> Arc<AsyncMutex<()>> {
        self.slots
            .lock()
            .entry(auction_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to one auction.
    pub async fn lock(&self, auction_id: AuctionId) -> AuctionGuard {
        self.slot(auction_id).lock_owned().await
    }

    /// Like [`lock`](Self::lock) but gives up after `timeout`.
    pub async fn lock_timeout(&self, auction_id: AuctionId, timeout: Duration) -> Option<AuctionGuard> {
        tokio::time::timeout(timeout, self.lock(auction_id)).await.ok()
    }

    /// Take the lock only if nobody holds it right now.
    pub fn try_lock(&self, auction_id: AuctionId) -> Option<AuctionGuard> {
        self.slot(auction_id).try_lock_owned().ok()
    }

    /// Drop slots nobody holds or waits on. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        before - slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
