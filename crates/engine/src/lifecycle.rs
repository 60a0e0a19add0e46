//! Auction state machine and the client-initiated transitions.
//!
//! ```text
//! Scheduled --start--> Active --end--> Ended
//!     |                  |               |
//!     +----cancel--------+--> Cancelled  +--remake (no bids)--> Scheduled
//! ```
//!
//! Time-driven transitions belong to the sweeper; this module handles
//! create, cancel, delete and remake.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use auction_types::{
    Amount, Auction, AuctionId, AuctionStatus, Caller, Property, PropertyStatus, UserId,
};

use crate::context::EngineContext;
use crate::error::AuctionError;
use crate::reconcile::ReconciliationTask;
use crate::store::{Changeset, IdKind};
use crate::HandlerResult;

/// Validate a status transition against the state machine.
pub fn check_transition(from: AuctionStatus, to: AuctionStatus) -> HandlerResult<()> {
    use AuctionStatus::*;
    match (from, to) {
        (Scheduled, Active) | (Active, Ended) | (Scheduled, Cancelled) | (Active, Cancelled) => {
            Ok(())
        }
        // Reopen of an auction nobody bid on
        (Ended, Scheduled) => Ok(()),
        _ => Err(AuctionError::IllegalTransition { from, to }),
    }
}

/// Parameters of a new auction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateAuctionRequest {
    pub property_id: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub min_increment: Amount,
    pub deposit_amount: Amount,
}

/// Client-initiated lifecycle operations.
#[derive(Clone)]
pub struct AuctionLifecycle {
    ctx: Arc<EngineContext>,
}

impl AuctionLifecycle {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// List a property so it can be auctioned.
    pub async fn register_property(
        &self,
        owner: impl Into<UserId>,
        starting_price: Amount,
    ) -> HandlerResult<Property> {
        if starting_price <= Amount::ZERO {
            return Err(AuctionError::InvalidAmount("starting price must be positive"));
        }

        let property = Property {
            property_id: self.ctx.store.allocate_id(IdKind::Property).await?,
            owner: owner.into(),
            starting_price,
            status: PropertyStatus::Available,
        };
        let mut changes = Changeset::new();
        changes.put_property(property.clone());
        self.ctx.store.commit(changes).await?;

        info!(property_id = property.property_id, owner = %property.owner, "Property registered");
        Ok(property)
    }

    /// Create an auction for an available property owned by the caller.
    pub async fn create(
        &self,
        caller: &Caller,
        request: CreateAuctionRequest,
    ) -> HandlerResult<Auction> {
        let now = self.ctx.clock.now();

        // Validate timing and amounts
        validate_window(request.start_time, request.end_time, now)?;
        if request.min_increment <= Amount::ZERO {
            return Err(AuctionError::InvalidAmount("minimum increment must be positive"));
        }
        if request.deposit_amount < Amount::ZERO {
            return Err(AuctionError::InvalidAmount("deposit cannot be negative"));
        }

        // Check the property
        let property = self
            .ctx
            .store
            .get_property(request.property_id)
            .await?
            .ok_or(AuctionError::PropertyNotFound(request.property_id))?;
        if property.owner != caller.user_id && !caller.is_admin {
            return Err(AuctionError::NotAuthorized("only the property owner can auction it"));
        }
        if property.status != PropertyStatus::Available {
            return Err(AuctionError::PropertyUnavailable);
        }
        self.ensure_no_open_auction(request.property_id, None).await?;

        let auction_id = self.ctx.store.allocate_id(IdKind::Auction).await?;
        let status = if request.start_time <= now {
            AuctionStatus::Active
        } else {
            AuctionStatus::Scheduled
        };

        let auction = Auction {
            auction_id,
            property_id: request.property_id,
            creator: caller.user_id.clone(),
            status,
            start_time: request.start_time,
            end_time: request.end_time,
            min_increment: request.min_increment,
            deposit_amount: request.deposit_amount,
            winner: None,
            cancellation_reason: None,
            created_at: now,
            updated_at: now,
        };

        let mut changes = Changeset::new();
        changes.put_auction(auction.clone());
        if status == AuctionStatus::Active {
            changes.set_property_status(request.property_id, PropertyStatus::UnderAuction);
        }
        self.ctx.store.commit(changes).await?;

        info!(
            auction_id,
            property_id = request.property_id,
            creator = %auction.creator,
            status = %status,
            "Auction created"
        );
        Ok(auction)
    }

    /// Cancel a scheduled or active auction.
    ///
    /// Participants are dropped at once; their deposit holds are released by
    /// the sweeper.
    pub async fn cancel(
        &self,
        caller: &Caller,
        auction_id: AuctionId,
        reason: &str,
    ) -> HandlerResult<Auction> {
        let reason = reason.trim();
        let min_len = self.ctx.config.min_cancel_reason_len;
        if reason.chars().count() < min_len {
            return Err(AuctionError::ReasonTooShort { min_len });
        }

        let _guard = self.ctx.locks.lock(auction_id).await;

        let auction = self.load(auction_id).await?;
        if !auction.is_creator(&caller.user_id) && !caller.is_admin {
            return Err(AuctionError::NotAuthorized(
                "only the creator or an admin can cancel an auction",
            ));
        }
        check_transition(auction.status, AuctionStatus::Cancelled)?;

        let participants = self.ctx.store.get_participants(auction_id).await?;

        let mut cancelled = auction.clone();
        cancelled.status = AuctionStatus::Cancelled;
        cancelled.cancellation_reason = Some(reason.to_string());
        cancelled.updated_at = self.ctx.clock.now();

        let mut changes = Changeset::new();
        changes
            .expect_status(auction_id, auction.status)
            .put_auction(cancelled.clone())
            .set_property_status(auction.property_id, PropertyStatus::Available);
        for participant in &participants {
            changes.remove_participant(auction_id, participant.user_id.clone());
        }
        self.ctx.store.commit(changes).await?;
        self.ctx.notifier.auction_closed(auction_id);

        info!(
            auction_id,
            from = %auction.status,
            by = %caller.user_id,
            participants = participants.len(),
            "Auction cancelled"
        );
        Ok(cancelled)
    }

    /// Delete a scheduled auction.
    pub async fn delete(&self, caller: &Caller, auction_id: AuctionId) -> HandlerResult<()> {
        let _guard = self.ctx.locks.lock(auction_id).await;

        let auction = self.load(auction_id).await?;
        if !auction.is_creator(&caller.user_id) && !caller.is_admin {
            return Err(AuctionError::NotAuthorized(
                "only the creator or an admin can delete an auction",
            ));
        }
        if auction.status != AuctionStatus::Scheduled {
            return Err(AuctionError::InvalidState {
                expected: AuctionStatus::Scheduled,
                got: auction.status,
            });
        }

        let holds: Vec<_> = self
            .ctx
            .store
            .get_holds(auction_id)
            .await?
            .into_iter()
            .filter(|h| h.is_active())
            .collect();

        let mut changes = Changeset::new();
        changes
            .expect_status(auction_id, AuctionStatus::Scheduled)
            .remove_auction(auction_id)
            .set_property_status(auction.property_id, PropertyStatus::Available);
        self.ctx.store.commit(changes).await?;
        self.ctx.notifier.auction_closed(auction_id);

        // The cascade removed the hold rows; the gateway holds remain
        for hold in holds {
            self.ctx
                .reconciliation
                .push(ReconciliationTask::VoidOrphanedHold {
                    gateway_hold_id: hold.gateway_hold_id,
                    auction_id,
                    user_id: hold.owner,
                });
        }

        info!(auction_id, by = %caller.user_id, "Auction deleted");
        Ok(())
    }

    /// Reopen an ended auction that received no bids.
    pub async fn remake(
        &self,
        caller: &Caller,
        auction_id: AuctionId,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> HandlerResult<Auction> {
        let now = self.ctx.clock.now();
        validate_window(start_time, end_time, now)?;

        let _guard = self.ctx.locks.lock(auction_id).await;

        let auction = self.load(auction_id).await?;
        if !auction.is_creator(&caller.user_id) {
            return Err(AuctionError::NotAuthorized("only the creator can remake an auction"));
        }
        check_transition(auction.status, AuctionStatus::Scheduled)?;
        if !self.ctx.store.get_bids(auction_id).await?.is_empty() {
            return Err(AuctionError::HasBids);
        }
        self.ensure_no_open_auction(auction.property_id, Some(auction_id))
            .await?;

        let mut remade = auction.clone();
        remade.status = AuctionStatus::Scheduled;
        remade.start_time = start_time;
        remade.end_time = end_time;
        remade.winner = None;
        remade.cancellation_reason = None;
        remade.updated_at = now;

        let leftover_holds: Vec<_> = self
            .ctx
            .store
            .get_holds(auction_id)
            .await?
            .into_iter()
            .filter(|h| h.is_active())
            .collect();

        let mut changes = Changeset::new();
        changes
            .expect_status(auction_id, AuctionStatus::Ended)
            .set_property_status(auction.property_id, PropertyStatus::Available)
            .put_auction(remade.clone());
        self.ctx.store.commit(changes).await?;

        for hold in leftover_holds {
            self.ctx.reconciliation.push(ReconciliationTask::ReleaseHold {
                hold_id: hold.hold_id,
                auction_id,
            });
        }

        info!(auction_id, %start_time, %end_time, "Auction remade");
        Ok(remade)
    }

    async fn load(&self, auction_id: AuctionId) -> HandlerResult<Auction> {
        self.ctx
            .store
            .get_auction(auction_id)
            .await?
            .ok_or(AuctionError::AuctionNotFound(auction_id))
    }

    async fn ensure_no_open_auction(
        &self,
        property_id: u64,
        except: Option<AuctionId>,
    ) -> HandlerResult<()> {
        let open = self
            .ctx
            .store
            .find_auctions(&move |a: &Auction| {
                a.property_id == property_id && a.status.is_open() && Some(a.auction_id) != except
            })
            .await?;
        if open.is_empty() {
            Ok(())
        } else {
            Err(AuctionError::PropertyUnavailable)
        }
    }
}

fn validate_window(
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    now: DateTime<Utc>,
) -> HandlerResult<()> {
    if end_time <= start_time || end_time <= now {
        return Err(AuctionError::InvalidTiming);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LedgerStore;
    use crate::testing::{t0, TestEnv};
    use auction_types::HoldStatus;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn request(property_id: u64, start_offset_mins: i64) -> CreateAuctionRequest {
        CreateAuctionRequest {
            property_id,
            start_time: t0() + Duration::minutes(start_offset_mins),
            end_time: t0() + Duration::minutes(start_offset_mins + 60),
            min_increment: dec!(50),
            deposit_amount: dec!(500),
        }
    }

    #[test]
    fn test_transition_table() {
        use AuctionStatus::*;
        for (from, to) in [
            (Scheduled, Active),
            (Active, Ended),
            (Scheduled, Cancelled),
            (Active, Cancelled),
            (Ended, Scheduled),
        ] {
            assert!(check_transition(from, to).is_ok(), "{from} -> {to}");
        }
        for (from, to) in [
            (Ended, Cancelled),
            (Cancelled, Scheduled),
            (Active, Scheduled),
            (Ended, Active),
            (Scheduled, Ended),
        ] {
            assert_eq!(
                check_transition(from, to),
                Err(AuctionError::IllegalTransition { from, to })
            );
        }
    }

    #[tokio::test]
    async fn test_create_scheduled_and_immediately_active() {
        let env = TestEnv::new();
        let lifecycle = AuctionLifecycle::new(env.ctx.clone());
        let seller = Caller::user("seller");

        let later = env.property("seller").await;
        let auction = lifecycle.create(&seller, request(later, 30)).await.unwrap();
        assert_eq!(auction.status, AuctionStatus::Scheduled);
        let property = env.ledger.get_property(later).await.unwrap().unwrap();
        assert_eq!(property.status, PropertyStatus::Available);

        let now = env.property("seller").await;
        let auction = lifecycle.create(&seller, request(now, 0)).await.unwrap();
        assert_eq!(auction.status, AuctionStatus::Active);
        let property = env.ledger.get_property(now).await.unwrap().unwrap();
        assert_eq!(property.status, PropertyStatus::UnderAuction);
    }

    #[tokio::test]
    async fn test_create_rejections() {
        let env = TestEnv::new();
        let lifecycle = AuctionLifecycle::new(env.ctx.clone());
        let property_id = env.property("seller").await;

        let err = lifecycle
            .create(&Caller::user("mallory"), request(property_id, 30))
            .await
            .unwrap_err();
        assert!(matches!(err, AuctionError::NotAuthorized(_)));

        let mut backwards = request(property_id, 30);
        backwards.end_time = backwards.start_time;
        assert_eq!(
            lifecycle.create(&Caller::user("seller"), backwards).await,
            Err(AuctionError::InvalidTiming)
        );

        let mut no_increment = request(property_id, 30);
        no_increment.min_increment = dec!(0);
        assert!(matches!(
            lifecycle.create(&Caller::user("seller"), no_increment).await,
            Err(AuctionError::InvalidAmount(_))
        ));

        assert_eq!(
            lifecycle.create(&Caller::user("seller"), request(99, 30)).await,
            Err(AuctionError::PropertyNotFound(99))
        );

        lifecycle
            .create(&Caller::user("seller"), request(property_id, 30))
            .await
            .unwrap();
        assert_eq!(
            lifecycle
                .create(&Caller::user("seller"), request(property_id, 120))
                .await,
            Err(AuctionError::PropertyUnavailable)
        );
    }

    #[tokio::test]
    async fn test_cancel_active_releases_property_and_participants() {
        let env = TestEnv::new();
        let lifecycle = AuctionLifecycle::new(env.ctx.clone());
        let auction_id = env.auction(AuctionStatus::Active, dec!(0)).await;
        env.participant(auction_id, "alice").await;
        env.hub.join_group(auction_id, "alice");

        let err = lifecycle
            .cancel(&Caller::user("seller"), auction_id, "too short")
            .await
            .unwrap_err();
        assert_eq!(err, AuctionError::ReasonTooShort { min_len: 10 });

        let err = lifecycle
            .cancel(&Caller::user("alice"), auction_id, "I changed my mind")
            .await
            .unwrap_err();
        assert!(matches!(err, AuctionError::NotAuthorized(_)));

        let cancelled = lifecycle
            .cancel(&Caller::admin("ops"), auction_id, "  fraudulent listing  ")
            .await
            .unwrap();
        assert_eq!(cancelled.status, AuctionStatus::Cancelled);
        assert_eq!(cancelled.cancellation_reason.as_deref(), Some("fraudulent listing"));

        let stored = env.auction_row(auction_id).await;
        assert_eq!(stored.status, AuctionStatus::Cancelled);
        let property = env.ledger.get_property(stored.property_id).await.unwrap().unwrap();
        assert_eq!(property.status, PropertyStatus::Available);
        assert!(env.ledger.get_participants(auction_id).await.unwrap().is_empty());
        assert!(!env.hub.is_member(auction_id, "alice"));
        assert_eq!(env.hub.group_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_ended_is_illegal() {
        let env = TestEnv::new();
        let lifecycle = AuctionLifecycle::new(env.ctx.clone());
        let auction_id = env.auction(AuctionStatus::Ended, dec!(0)).await;

        let err = lifecycle
            .cancel(&Caller::user("seller"), auction_id, "no longer for sale")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AuctionError::IllegalTransition {
                from: AuctionStatus::Ended,
                to: AuctionStatus::Cancelled
            }
        );
    }

    #[tokio::test]
    async fn test_delete_scheduled_queues_hold_voids() {
        let env = TestEnv::new();
        let lifecycle = AuctionLifecycle::new(env.ctx.clone());
        let auction_id = env.auction(AuctionStatus::Scheduled, dec!(500)).await;
        env.participant(auction_id, "alice").await;

        let mut changes = Changeset::new();
        changes.put_hold(auction_types::DepositHold {
            hold_id: 1,
            owner: "alice".into(),
            auction_id,
            amount: dec!(500),
            gateway_hold_id: "AUTH-1".into(),
            status: HoldStatus::Active,
            created_at: t0(),
            expires_at: t0() + Duration::days(29),
        });
        env.ledger.commit(changes).await.unwrap();
        env.hub.join_group(auction_id, "alice");

        lifecycle.delete(&Caller::user("seller"), auction_id).await.unwrap();

        assert!(env.ledger.get_auction(auction_id).await.unwrap().is_none());
        assert!(env.hub.group_members(auction_id).is_empty());
        assert_eq!(
            env.ctx.reconciliation.tasks(),
            vec![ReconciliationTask::VoidOrphanedHold {
                gateway_hold_id: "AUTH-1".into(),
                auction_id,
                user_id: "alice".into(),
            }]
        );
    }

    #[tokio::test]
    async fn test_delete_active_rejected() {
        let env = TestEnv::new();
        let lifecycle = AuctionLifecycle::new(env.ctx.clone());
        let auction_id = env.auction(AuctionStatus::Active, dec!(0)).await;

        assert_eq!(
            lifecycle.delete(&Caller::user("seller"), auction_id).await,
            Err(AuctionError::InvalidState {
                expected: AuctionStatus::Scheduled,
                got: AuctionStatus::Active
            })
        );
    }

    #[tokio::test]
    async fn test_remake_requires_no_bids() {
        let env = TestEnv::new();
        let lifecycle = AuctionLifecycle::new(env.ctx.clone());
        let start = t0() + Duration::hours(1);
        let end = t0() + Duration::hours(3);

        let with_bids = env.auction(AuctionStatus::Ended, dec!(0)).await;
        env.bid(with_bids, "alice", dec!(1100)).await;
        assert_eq!(
            lifecycle
                .remake(&Caller::user("seller"), with_bids, start, end)
                .await,
            Err(AuctionError::HasBids)
        );

        let quiet = env.auction(AuctionStatus::Ended, dec!(0)).await;
        assert!(matches!(
            lifecycle.remake(&Caller::admin("ops"), quiet, start, end).await,
            Err(AuctionError::NotAuthorized(_))
        ));

        let remade = lifecycle
            .remake(&Caller::user("seller"), quiet, start, end)
            .await
            .unwrap();
        assert_eq!(remade.status, AuctionStatus::Scheduled);
        assert_eq!(remade.start_time, start);
        assert_eq!(env.auction_row(quiet).await.end_time, end);
    }

    #[tokio::test]
    async fn test_register_property() {
        let env = TestEnv::new();
        let lifecycle = AuctionLifecycle::new(env.ctx.clone());

        let property = lifecycle.register_property("seller", dec!(250000)).await.unwrap();
        assert_eq!(property.status, PropertyStatus::Available);
        assert!(matches!(
            lifecycle.register_property("seller", dec!(0)).await,
            Err(AuctionError::InvalidAmount(_))
        ));
    }
}
