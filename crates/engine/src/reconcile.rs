//! Retry queue for divergences between the gateway and the ledger.
//!
//! An entry is queued whenever a gateway step succeeded but the matching
//! ledger write did not (or the reverse). The sweeper drains the queue on
//! every tick; entries that still fail are queued again.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use auction_types::{AuctionId, DepositHold, HoldId, HoldStatus, UserId};

use crate::context::EngineContext;
use crate::error::AuctionError;
use crate::gateway::{bounded, GatewayError};
use crate::store::Changeset;

/// A pending repair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconciliationTask {
    /// Gateway hold with no ledger row; void it.
    VoidOrphanedHold {
        gateway_hold_id: String,
        auction_id: AuctionId,
        user_id: UserId,
    },
    /// Ledger hold still active; void it at the gateway and mark it released.
    ReleaseHold { hold_id: HoldId, auction_id: AuctionId },
    /// Gateway already voided the hold; finish the local release.
    FinalizeRelease {
        hold_id: HoldId,
        auction_id: AuctionId,
        user_id: UserId,
        remove_participant: bool,
    },
}

#[derive(Debug, Clone)]
struct QueuedTask {
    task: ReconciliationTask,
    attempts: u32,
}

#[derive(Debug, Default)]
pub struct ReconciliationQueue {
    entries: Mutex<VecDeque<QueuedTask>>,
}

impl ReconciliationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, task: ReconciliationTask) {
        self.requeue(task, 0);
    }

    fn requeue(&self, task: ReconciliationTask, attempts: u32) {
        self.entries.lock().push_back(QueuedTask { task, attempts });
    }

    fn drain(&self) -> Vec<QueuedTask> {
        self.entries.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of queued tasks, oldest first.
    pub fn tasks(&self) -> Vec<ReconciliationTask> {
        self.entries.lock().iter().map(|q| q.task.clone()).collect()
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub resolved: usize,
    pub retried: usize,
}

/// Void a ledger hold at the gateway, then mark it released.
///
/// A declined or failed void leaves the hold untouched. If the void went
/// through but the ledger write failed, the local half is queued.
pub(crate) async fn void_and_release(
    ctx: &EngineContext,
    hold: &DepositHold,
    remove_participant: bool,
) -> Result<(), AuctionError> {
    let voided = bounded(
        ctx.config.gateway_timeout(),
        ctx.gateway.void_hold(&hold.gateway_hold_id),
    )
    .await?;
    if !voided {
        return Err(GatewayError::Rejected(format!(
            "void of authorization {} was declined",
            hold.gateway_hold_id
        ))
        .into());
    }

    let mut released = hold.clone();
    released.status = HoldStatus::Released;
    let mut changes = Changeset::new();
    changes.put_hold(released);
    if remove_participant {
        changes.remove_participant(hold.auction_id, hold.owner.clone());
    }

    if let Err(err) = ctx.store.commit(changes).await {
        error!(
            hold_id = hold.hold_id,
            auction_id = hold.auction_id,
            user_id = %hold.owner,
            error = %err,
            "Hold voided at gateway but ledger release failed; queued for reconciliation"
        );
        ctx.reconciliation.push(ReconciliationTask::FinalizeRelease {
            hold_id: hold.hold_id,
            auction_id: hold.auction_id,
            user_id: hold.owner.clone(),
            remove_participant,
        });
        return Err(AuctionError::Consistency(format!(
            "hold {} voided but not released locally: {err}",
            hold.hold_id
        )));
    }
    Ok(())
}

/// Retry every queued task once.
pub async fn run_once(ctx: &EngineContext) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    for QueuedTask { task, attempts } in ctx.reconciliation.drain() {
        match attempt(ctx, &task).await {
            Ok(()) => {
                info!(?task, attempts, "Reconciled");
                report.resolved += 1;
            }
            Err(err) => {
                warn!(?task, attempts = attempts + 1, error = %err, "Reconciliation failed, will retry");
                ctx.reconciliation.requeue(task, attempts + 1);
                report.retried += 1;
            }
        }
    }

    report
}

async fn attempt(ctx: &EngineContext, task: &ReconciliationTask) -> Result<(), AuctionError> {
    match task {
        ReconciliationTask::VoidOrphanedHold {
            gateway_hold_id, ..
        } => {
            let voided = bounded(
                ctx.config.gateway_timeout(),
                ctx.gateway.void_hold(gateway_hold_id),
            )
            .await?;
            if !voided {
                return Err(GatewayError::Rejected(format!(
                    "void of authorization {gateway_hold_id} was declined"
                ))
                .into());
            }
            Ok(())
        }

        ReconciliationTask::ReleaseHold { hold_id, .. } => {
            match ctx.store.get_hold(*hold_id).await? {
                Some(hold) if hold.is_active() => void_and_release(ctx, &hold, false).await,
                // Already released, or gone with its auction
                _ => Ok(()),
            }
        }

        ReconciliationTask::FinalizeRelease {
            hold_id,
            auction_id,
            user_id,
            remove_participant,
        } => {
            let _guard = ctx
                .locks
                .lock_timeout(*auction_id, ctx.config.lock_timeout())
                .await
                .ok_or_else(|| AuctionError::Consistency(format!("auction {auction_id} is busy")))?;

            let mut changes = Changeset::new();
            if let Some(hold) = ctx.store.get_hold(*hold_id).await? {
                if hold.is_active() {
                    let mut released = hold;
                    released.status = HoldStatus::Released;
                    changes.put_hold(released);
                }
            }
            if *remove_participant && ctx.store.get_participant(*auction_id, user_id).await?.is_some() {
                changes.remove_participant(*auction_id, user_id.clone());
            }
            ctx.store.commit(changes).await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use auction_types::{Auction, AuctionStatus, Participant, Property, PropertyStatus};
    use chrono::{DateTime, Duration};
    use rust_decimal_macros::dec;

    use crate::gateway::{PaymentGateway, SandboxGateway, SandboxOp};
    use crate::notify::NotificationHub;
    use crate::store::{LedgerStore, MemoryLedger};

    struct Fixture {
        ledger: Arc<MemoryLedger>,
        gateway: Arc<SandboxGateway>,
        ctx: EngineContext,
    }

    async fn fixture() -> Fixture {
        let ledger = Arc::new(MemoryLedger::new());
        let gateway = Arc::new(SandboxGateway::default());
        let ctx = EngineContext::new(
            ledger.clone(),
            gateway.clone(),
            Arc::new(NotificationHub::default()),
        );

        let ts = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let mut changes = Changeset::new();
        changes
            .put_property(Property {
                property_id: 1,
                owner: "seller".into(),
                starting_price: dec!(1000),
                status: PropertyStatus::Available,
            })
            .put_auction(Auction {
                auction_id: 1,
                property_id: 1,
                creator: "seller".into(),
                status: AuctionStatus::Scheduled,
                start_time: ts + Duration::hours(1),
                end_time: ts + Duration::hours(2),
                min_increment: dec!(50),
                deposit_amount: dec!(500),
                winner: None,
                cancellation_reason: None,
                created_at: ts,
                updated_at: ts,
            })
            .insert_participant(Participant {
                auction_id: 1,
                user_id: "alice".into(),
                registered_at: ts,
            });
        ledger.commit(changes).await.unwrap();

        Fixture {
            ledger,
            gateway,
            ctx,
        }
    }

    async fn authorized_hold(f: &Fixture) -> DepositHold {
        let order = f
            .gateway
            .create_deposit_order(&crate::gateway::DepositOrderRequest {
                request_id: "r".into(),
                auction_id: 1,
                user_id: "alice".into(),
                amount: dec!(500),
                currency: "USD".into(),
            })
            .await
            .unwrap();
        let gateway_hold_id = f.gateway.authorize_order(&order.order_id).await.unwrap();
        let ts = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let hold = DepositHold {
            hold_id: 1,
            owner: "alice".into(),
            auction_id: 1,
            amount: dec!(500),
            gateway_hold_id,
            status: HoldStatus::Active,
            created_at: ts,
            expires_at: ts + Duration::days(29),
        };
        let mut changes = Changeset::new();
        changes.put_hold(hold.clone());
        f.ledger.commit(changes).await.unwrap();
        hold
    }

    #[tokio::test]
    async fn test_void_and_release_with_participant() {
        let f = fixture().await;
        let hold = authorized_hold(&f).await;

        void_and_release(&f.ctx, &hold, true).await.unwrap();

        assert!(f.gateway.is_voided(&hold.gateway_hold_id));
        let stored = f.ledger.get_hold(1).await.unwrap().unwrap();
        assert_eq!(stored.status, HoldStatus::Released);
        assert!(f.ledger.get_participant(1, "alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_declined_void_leaves_hold_active() {
        let f = fixture().await;
        let hold = authorized_hold(&f).await;
        f.gateway.decline_voids(true);

        let err = void_and_release(&f.ctx, &hold, true).await.unwrap_err();
        assert!(matches!(err, AuctionError::Gateway(GatewayError::Rejected(_))));
        assert!(f.ledger.get_active_hold(1, "alice").await.unwrap().is_some());
        assert!(f.ledger.get_participant(1, "alice").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_task_is_requeued_then_resolved() {
        let f = fixture().await;
        let hold = authorized_hold(&f).await;
        f.ctx.reconciliation.push(ReconciliationTask::ReleaseHold {
            hold_id: hold.hold_id,
            auction_id: 1,
        });
        f.gateway.fail_next(SandboxOp::Void, GatewayError::Transport("connection reset".into()));

        let first = run_once(&f.ctx).await;
        assert_eq!(first, ReconcileReport { resolved: 0, retried: 1 });
        assert_eq!(f.ctx.reconciliation.len(), 1);

        let second = run_once(&f.ctx).await;
        assert_eq!(second, ReconcileReport { resolved: 1, retried: 0 });
        assert!(f.ctx.reconciliation.is_empty());
        assert_eq!(
            f.ledger.get_hold(1).await.unwrap().unwrap().status,
            HoldStatus::Released
        );
    }

    #[tokio::test]
    async fn test_finalize_release_removes_participant() {
        let f = fixture().await;
        let hold = authorized_hold(&f).await;
        f.gateway.void_hold(&hold.gateway_hold_id).await.unwrap();
        f.ctx.reconciliation.push(ReconciliationTask::FinalizeRelease {
            hold_id: hold.hold_id,
            auction_id: 1,
            user_id: "alice".into(),
            remove_participant: true,
        });

        let report = run_once(&f.ctx).await;
        assert_eq!(report.resolved, 1);
        assert!(f.ledger.get_active_hold(1, "alice").await.unwrap().is_none());
        assert!(f.ledger.get_participant(1, "alice").await.unwrap().is_none());
    }
}
