//! Auction lifecycle and concurrent bidding engine.
//!
//! This crate implements the core of the property auction marketplace:
//!
//! - A time-bound auction state machine (scheduled, active, ended, cancelled)
//! - Bid validation and recording with per-auction serialization
//! - A two-phase deposit-hold protocol against an external payment gateway
//! - A periodic sweeper that advances auctions and settles deposit holds
//! - Real-time fan-out of state changes to connected clients
//!
//! # Architecture
//!
//! - `store`: ledger contract with atomic multi-entity commits
//! - `gateway`: payment gateway contract and the sandbox gateway
//! - `notify`: notification contract and the in-process hub
//! - `lifecycle`: state machine and client-initiated transitions
//! - `bidding`: bid validator and recorder
//! - `deposit`: join / confirm / leave orchestration
//! - `sweeper`: timer-driven transitions and hold settlement
//! - `reconcile`: retry queue for gateway/ledger divergence
//! - `realtime`: channel operations mapped onto the above
//! - `queries`: read-only access
//!
//! # Example
//!
//! ```ignore
//! use auction_engine::{AuctionEngine, EngineContext};
//!
//! let ctx = EngineContext::new(store, gateway, notifier);
//! let engine = AuctionEngine::new(ctx);
//!
//! let outcome = engine.deposits.initiate_join(auction_id, "alice").await?;
//! let bid = engine.bids.place_bid(auction_id, "alice", amount).await?;
//! ```

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

pub mod bidding;
pub mod clock;
pub mod config;
pub mod context;
pub mod deposit;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod locks;
pub mod notify;
pub mod pending;
pub mod queries;
pub mod realtime;
pub mod reconcile;
pub mod store;
pub mod sweeper;

#[cfg(test)]
mod testing;

pub use bidding::BidRecorder;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigValidationError, EngineConfig};
pub use context::EngineContext;
pub use deposit::{DepositOrchestrator, JoinOutcome, ParticipationStatus};
pub use error::{AuctionError, ErrorClass, RejectionCategory};
pub use gateway::{GatewayError, PaymentGateway, SandboxGateway};
pub use lifecycle::{AuctionLifecycle, CreateAuctionRequest};
pub use notify::{NotificationHub, Notifier, NotifyError};
pub use queries::{AuctionQuery, AuctionQueryResponse, AuctionSummary};
pub use realtime::RealtimeChannel;
pub use store::{Changeset, LedgerStore, MemoryLedger, StoreError};
pub use sweeper::{LifecycleSweeper, SweepReport};

/// Result type for engine operations.
pub type HandlerResult<T> = Result<T, AuctionError>;

/// The assembled engine: one handle per component, sharing one context.
#[derive(Clone)]
pub struct AuctionEngine {
    ctx: Arc<EngineContext>,
    pub lifecycle: AuctionLifecycle,
    pub bids: BidRecorder,
    pub deposits: DepositOrchestrator,
    pub sweeper: LifecycleSweeper,
}

impl AuctionEngine {
    pub fn new(ctx: EngineContext) -> Self {
        let ctx = Arc::new(ctx);
        Self {
            lifecycle: AuctionLifecycle::new(ctx.clone()),
            bids: BidRecorder::new(ctx.clone()),
            deposits: DepositOrchestrator::new(ctx.clone()),
            sweeper: LifecycleSweeper::new(ctx.clone()),
            ctx,
        }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Spawn the sweeper loop. It stops once `shutdown` flips to `true`.
    pub fn spawn_sweeper(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let sweeper = self.sweeper.clone();
        tokio::spawn(async move { sweeper.run(shutdown).await })
    }
}
