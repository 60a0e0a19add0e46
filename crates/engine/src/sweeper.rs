//! Lifecycle sweeper.
//!
//! A single periodic task that advances auctions whose start or end time
//! has passed, settles deposit holds nobody needs anymore and retries
//! queued reconciliation work.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use auction_types::{Auction, AuctionId, AuctionStatus, DepositHold, PropertyStatus, UserId};

use crate::context::EngineContext;
use crate::lifecycle::check_transition;
use crate::locks::AuctionGuard;
use crate::reconcile::{self, void_and_release};
use crate::store::Changeset;
use crate::HandlerResult;

/// What one tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub activated: usize,
    pub ended: usize,
    /// Auctions that were due but skipped (busy lock or read failure)
    pub skipped: usize,
    pub holds_released: usize,
    pub hold_failures: usize,
    pub reconciled: usize,
    /// Whether the transition commit ran
    pub committed: bool,
}

impl SweepReport {
    pub fn is_idle(&self) -> bool {
        *self == SweepReport::default()
    }
}

/// Staged transition of one auction, applied with the rest of the tick.
struct Staged {
    auction: Auction,
    changes: Changeset,
    participants: Vec<UserId>,
}

#[derive(Clone)]
pub struct LifecycleSweeper {
    ctx: Arc<EngineContext>,
}

impl LifecycleSweeper {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Tick every `sweep_interval` until `shutdown` turns true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.ctx.config.sweep_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            interval_secs = self.ctx.config.sweep_interval_secs,
            "Lifecycle sweeper started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.tick().await;
                    if report.is_idle() {
                        debug!("Sweep found nothing to do");
                    } else {
                        info!(?report, "Sweep finished");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Lifecycle sweeper stopped");
    }

    /// Run one sweep.
    pub async fn tick(&self) -> SweepReport {
        let now = self.ctx.clock.now();
        let mut report = SweepReport::default();

        // Locks of staged auctions stay held until the commit finishes
        let mut guards: Vec<AuctionGuard> = Vec::new();
        let mut started: Vec<Staged> = Vec::new();
        let mut finished: Vec<Staged> = Vec::new();

        // 1. Scheduled -> Active
        for auction_id in self
            .due(now, AuctionStatus::Scheduled, &mut report)
            .await
        {
            let Some(guard) = self.lock(auction_id, guards.is_empty(), &mut report).await else {
                continue;
            };
            match self.stage_start(auction_id, now).await {
                Ok(Some(staged)) => {
                    guards.push(guard);
                    started.push(staged);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(auction_id, error = %e, "Failed to stage auction start");
                    report.skipped += 1;
                }
            }
        }

        // 2. Active -> Ended
        let promoted: HashSet<AuctionId> = started.iter().map(|s| s.auction.auction_id).collect();
        for auction_id in self.due(now, AuctionStatus::Active, &mut report).await {
            if promoted.contains(&auction_id) {
                continue;
            }
            let Some(guard) = self.lock(auction_id, guards.is_empty(), &mut report).await else {
                continue;
            };
            match self.stage_end(auction_id, now).await {
                Ok(Some(staged)) => {
                    guards.push(guard);
                    finished.push(staged);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(auction_id, error = %e, "Failed to stage auction end");
                    report.skipped += 1;
                }
            }
        }

        // 3. One commit for every transition of this tick
        if !started.is_empty() || !finished.is_empty() {
            let mut changes = Changeset::new();
            for staged in started.iter().chain(finished.iter()) {
                changes.extend(staged.changes.clone());
            }

            match self.ctx.store.commit(changes).await {
                Ok(()) => {
                    report.committed = true;
                    report.activated = started.len();
                    report.ended = finished.len();
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        starting = started.len(),
                        ending = finished.len(),
                        "Sweep commit failed, transitions retried next tick"
                    );
                    report.skipped += started.len() + finished.len();
                    started.clear();
                    finished.clear();
                }
            }
        }
        drop(guards);

        for staged in &started {
            let auction = &staged.auction;
            info!(
                auction_id = auction.auction_id,
                participants = staged.participants.len(),
                "Auction started"
            );
            if let Err(e) = self.ctx.notifier.auction_started(
                auction.auction_id,
                &staged.participants,
                auction.end_time,
            ) {
                warn!(auction_id = auction.auction_id, error = %e, "Start notification not delivered");
            }
        }
        for staged in &finished {
            let auction = &staged.auction;
            info!(
                auction_id = auction.auction_id,
                winner = auction.winner.as_deref().unwrap_or("none"),
                "Auction ended"
            );
            if let Err(e) = self
                .ctx
                .notifier
                .auction_finished(auction.auction_id, &staged.participants)
            {
                warn!(auction_id = auction.auction_id, error = %e, "Finish notification not delivered");
            }
            self.ctx.notifier.auction_closed(auction.auction_id);
        }

        // 4. Release holds nobody needs anymore
        self.settle_holds(&mut report).await;

        // 5. Retry queued repairs
        report.reconciled = reconcile::run_once(&self.ctx).await.resolved;

        let purged = self.ctx.pending.purge_expired(now);
        if purged > 0 {
            debug!(purged, "Dropped expired pending joins");
        }
        self.ctx.locks.prune();

        report
    }

    async fn due(
        &self,
        now: DateTime<Utc>,
        status: AuctionStatus,
        report: &mut SweepReport,
    ) -> Vec<AuctionId> {
        let found = self
            .ctx
            .store
            .find_auctions(&move |a: &Auction| {
                a.status == status
                    && match status {
                        AuctionStatus::Scheduled => a.start_time <= now,
                        _ => a.end_time <= now,
                    }
            })
            .await;

        match found {
            Ok(auctions) => auctions.into_iter().map(|a| a.auction_id).collect(),
            Err(e) => {
                error!(status = %status, error = %e, "Failed to list due auctions");
                report.skipped += 1;
                Vec::new()
            }
        }
    }

    /// Waits up to `lock_timeout` only while the tick holds no other
    /// auction's lock; otherwise a busy auction is skipped at once.
    async fn lock(
        &self,
        auction_id: AuctionId,
        may_wait: bool,
        report: &mut SweepReport,
    ) -> Option<AuctionGuard> {
        let guard = if may_wait {
            self.ctx
                .locks
                .lock_timeout(auction_id, self.ctx.config.lock_timeout())
                .await
        } else {
            self.ctx.locks.try_lock(auction_id)
        };
        if guard.is_none() {
            warn!(auction_id, "Auction busy, skipping until next sweep");
            report.skipped += 1;
        }
        guard
    }

    async fn stage_start(
        &self,
        auction_id: AuctionId,
        now: DateTime<Utc>,
    ) -> HandlerResult<Option<Staged>> {
        let Some(auction) = self.ctx.store.get_auction(auction_id).await? else {
            return Ok(None);
        };
        if auction.status != AuctionStatus::Scheduled || auction.start_time > now {
            return Ok(None);
        }
        check_transition(auction.status, AuctionStatus::Active)?;

        let participants = self.participant_ids(auction_id).await?;

        let mut active = auction;
        active.status = AuctionStatus::Active;
        active.updated_at = now;

        let mut changes = Changeset::new();
        changes
            .expect_status(auction_id, AuctionStatus::Scheduled)
            .put_auction(active.clone())
            .set_property_status(active.property_id, PropertyStatus::UnderAuction);

        Ok(Some(Staged {
            auction: active,
            changes,
            participants,
        }))
    }

    async fn stage_end(
        &self,
        auction_id: AuctionId,
        now: DateTime<Utc>,
    ) -> HandlerResult<Option<Staged>> {
        let Some(auction) = self.ctx.store.get_auction(auction_id).await? else {
            return Ok(None);
        };
        if auction.status != AuctionStatus::Active || auction.end_time > now {
            return Ok(None);
        }
        check_transition(auction.status, AuctionStatus::Ended)?;

        let winner = self
            .ctx
            .store
            .get_highest_bid(auction_id)
            .await?
            .map(|bid| bid.bidder);
        let participants = self.participant_ids(auction_id).await?;

        let mut ended = auction;
        ended.status = AuctionStatus::Ended;
        ended.winner = winner.clone();
        ended.updated_at = now;

        let property_status = if winner.is_some() {
            PropertyStatus::Sold
        } else {
            PropertyStatus::Available
        };

        let mut changes = Changeset::new();
        changes
            .expect_status(auction_id, AuctionStatus::Active)
            .put_auction(ended.clone())
            .set_property_status(ended.property_id, property_status);
        // Only the winner stays a participant
        for user_id in &participants {
            if winner.as_ref() != Some(user_id) {
                changes.remove_participant(auction_id, user_id.clone());
            }
        }

        Ok(Some(Staged {
            auction: ended,
            changes,
            participants,
        }))
    }

    async fn participant_ids(&self, auction_id: AuctionId) -> HandlerResult<Vec<UserId>> {
        Ok(self
            .ctx
            .store
            .get_participants(auction_id)
            .await?
            .into_iter()
            .map(|p| p.user_id)
            .collect())
    }

    /// Void active holds on ended auctions (except the winner's) and on
    /// cancelled auctions.
    async fn settle_holds(&self, report: &mut SweepReport) {
        let holds = match self.ctx.store.find_holds(&|h: &DepositHold| h.is_active()).await {
            Ok(holds) => holds,
            Err(e) => {
                error!(error = %e, "Failed to list active holds");
                return;
            }
        };

        let mut auctions: HashMap<AuctionId, Option<Auction>> = HashMap::new();
        for hold in holds {
            if !auctions.contains_key(&hold.auction_id) {
                match self.ctx.store.get_auction(hold.auction_id).await {
                    Ok(auction) => {
                        auctions.insert(hold.auction_id, auction);
                    }
                    Err(e) => {
                        warn!(auction_id = hold.auction_id, error = %e, "Failed to load auction for hold settlement");
                        continue;
                    }
                }
            }
            let Some(Some(auction)) = auctions.get(&hold.auction_id) else {
                continue;
            };

            let releasable = match auction.status {
                AuctionStatus::Ended => auction.winner.as_deref() != Some(hold.owner.as_str()),
                AuctionStatus::Cancelled => true,
                _ => false,
            };
            if !releasable {
                continue;
            }

            match void_and_release(&self.ctx, &hold, false).await {
                Ok(()) => {
                    info!(
                        auction_id = hold.auction_id,
                        hold_id = hold.hold_id,
                        owner = %hold.owner,
                        "Deposit hold released"
                    );
                    report.holds_released += 1;
                }
                Err(e) => {
                    warn!(
                        auction_id = hold.auction_id,
                        hold_id = hold.hold_id,
                        error = %e,
                        "Failed to release deposit hold, retrying next sweep"
                    );
                    report.hold_failures += 1;
                }
            }
        }
    }
}
