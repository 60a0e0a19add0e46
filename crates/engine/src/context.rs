//! Shared dependencies of the engine components.

use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::gateway::PaymentGateway;
use crate::locks::AuctionLocks;
use crate::notify::Notifier;
use crate::pending::{MemoryPendingJoins, PendingJoins};
use crate::reconcile::ReconciliationQueue;
use crate::store::LedgerStore;

/// Everything a handler needs to run: the ledger, the gateway, the
/// notifier, the clock and the per-auction locks.
pub struct EngineContext {
    pub store: Arc<dyn LedgerStore>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
    pub pending: Arc<dyn PendingJoins>,
    pub locks: AuctionLocks,
    pub reconciliation: ReconciliationQueue,
    pub config: EngineConfig,
}

impl EngineContext {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            gateway,
            notifier,
            clock: Arc::new(SystemClock),
            pending: Arc::new(MemoryPendingJoins::new()),
            locks: AuctionLocks::new(),
            reconciliation: ReconciliationQueue::new(),
            config: EngineConfig::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_pending_joins(mut self, pending: Arc<dyn PendingJoins>) -> Self {
        self.pending = pending;
        self
    }
}
