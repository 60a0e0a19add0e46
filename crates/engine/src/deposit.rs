//! Deposit orchestration: joining and leaving auctions.
//!
//! Joining a deposit auction is two-phase. `initiate_join` asks the gateway
//! for an order and parks it in the pending-join store; `confirm_join` turns
//! the approved order into a hold and records the hold and the participant
//! together. No ledger row is written before the gateway confirms, and a
//! gateway hold whose ledger write failed is voided or queued for it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use auction_types::{
    compute_order_request_id, Auction, AuctionId, AuctionStatus, DepositHold, HoldStatus,
    Participant,
};

use crate::context::EngineContext;
use crate::error::AuctionError;
use crate::gateway::{bounded, DepositOrderRequest};
use crate::pending::PendingJoin;
use crate::reconcile::{void_and_release, ReconciliationTask};
use crate::store::{Changeset, IdKind};
use crate::HandlerResult;

/// Result of a join request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JoinOutcome {
    /// Admitted without a deposit.
    Joined,
    /// The user must approve the deposit at `approval_url`, then confirm.
    ApprovalRequired {
        order_id: String,
        approval_url: String,
        expires_at: DateTime<Utc>,
    },
}

impl From<PendingJoin> for JoinOutcome {
    fn from(join: PendingJoin) -> Self {
        JoinOutcome::ApprovalRequired {
            order_id: join.order_id,
            approval_url: join.approval_url,
            expires_at: join.expires_at,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipationStatus {
    pub is_participant: bool,
    pub message: String,
}

/// Join, confirm and leave flows around the payment gateway.
#[derive(Clone)]
pub struct DepositOrchestrator {
    ctx: Arc<EngineContext>,
}

impl DepositOrchestrator {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Start joining an auction.
    ///
    /// Zero-deposit auctions admit the user at once. Otherwise a deposit
    /// order is created and its approval link returned; a repeated request
    /// while that order is pending returns the same link.
    pub async fn initiate_join(
        &self,
        auction_id: AuctionId,
        user_id: &str,
    ) -> HandlerResult<JoinOutcome> {
        let auction = self.load(auction_id).await?;
        self.ensure_joinable(&auction, user_id).await?;

        if !auction.requires_deposit() {
            let _guard = self.ctx.locks.lock(auction_id).await;
            let auction = self.load(auction_id).await?;
            self.ensure_joinable(&auction, user_id).await?;

            let mut changes = Changeset::new();
            changes
                .expect_status(auction_id, auction.status)
                .insert_participant(Participant {
                    auction_id,
                    user_id: user_id.to_string(),
                    registered_at: self.ctx.clock.now(),
                });
            self.ctx.store.commit(changes).await?;

            info!(auction_id, user_id, "Participant joined, no deposit");
            return Ok(JoinOutcome::Joined);
        }

        let now = self.ctx.clock.now();
        if let Some(pending) = self.ctx.pending.find(auction_id, user_id, now) {
            return Ok(pending.into());
        }

        // Earlier holds (left, or from before a remake) make this a new attempt
        let attempt = self
            .ctx
            .store
            .get_holds(auction_id)
            .await?
            .iter()
            .filter(|h| h.owner == user_id)
            .count() as u32;
        let request = DepositOrderRequest {
            request_id: compute_order_request_id(
                auction_id,
                user_id,
                auction.deposit_amount,
                attempt,
            ),
            auction_id,
            user_id: user_id.to_string(),
            amount: auction.deposit_amount,
            currency: self.ctx.config.currency.clone(),
        };
        let order = bounded(
            self.ctx.config.gateway_timeout(),
            self.ctx.gateway.create_deposit_order(&request),
        )
        .await
        .map_err(|err| {
            warn!(auction_id, user_id, error = %err, "Deposit order creation failed");
            err
        })?;

        let pending = PendingJoin {
            order_id: order.order_id,
            auction_id,
            user_id: user_id.to_string(),
            approval_url: order.approval_url,
            expires_at: now + self.ctx.config.pending_join_ttl(),
        };
        self.ctx.pending.insert(pending.clone());

        info!(
            auction_id,
            user_id,
            order_id = %pending.order_id,
            amount = %auction.deposit_amount,
            "Deposit order created"
        );
        Ok(pending.into())
    }

    /// Finish a join once the user approved the deposit order.
    pub async fn confirm_join(
        &self,
        order_id: &str,
        user_id: &str,
        auction_id: AuctionId,
    ) -> HandlerResult<DepositHold> {
        let pending = self
            .ctx
            .pending
            .claim(order_id, self.ctx.clock.now())
            .ok_or_else(|| AuctionError::PendingJoinNotFound(order_id.to_string()))?;
        if pending.auction_id != auction_id || pending.user_id != user_id {
            self.ctx.pending.restore(pending);
            return Err(AuctionError::NotAuthorized(
                "deposit order belongs to another join request",
            ));
        }

        // Nothing to authorize for if the join can no longer succeed
        let auction = self.load(auction_id).await?;
        self.ensure_joinable(&auction, user_id).await?;

        let gateway_hold_id = match bounded(
            self.ctx.config.gateway_timeout(),
            self.ctx.gateway.authorize_order(order_id),
        )
        .await
        {
            Ok(id) => id,
            Err(err) => {
                warn!(auction_id, user_id, order_id, error = %err, "Deposit authorization failed");
                self.ctx.pending.restore(pending);
                return Err(err.into());
            }
        };

        // A hold id already in the ledger was voided or belongs to another join
        let known = self
            .ctx
            .store
            .find_holds(&|h: &DepositHold| h.gateway_hold_id == gateway_hold_id)
            .await?;
        if !known.is_empty() {
            error!(
                auction_id,
                user_id,
                order_id,
                gateway_hold_id = %gateway_hold_id,
                "Gateway returned an authorization already on record"
            );
            return Err(AuctionError::Consistency(format!(
                "authorization {gateway_hold_id} is already recorded"
            )));
        }

        match self
            .record_hold(auction_id, user_id, pending.order_id.as_str(), &gateway_hold_id)
            .await
        {
            Ok(hold) => {
                info!(
                    auction_id,
                    user_id,
                    hold_id = hold.hold_id,
                    gateway_hold_id = %hold.gateway_hold_id,
                    "Deposit hold recorded, participant admitted"
                );
                Ok(hold)
            }
            Err(err) => {
                self.compensate(auction_id, user_id, &gateway_hold_id, &err)
                    .await;
                Err(err)
            }
        }
    }

    async fn record_hold(
        &self,
        auction_id: AuctionId,
        user_id: &str,
        order_id: &str,
        gateway_hold_id: &str,
    ) -> HandlerResult<DepositHold> {
        let _guard = self.ctx.locks.lock(auction_id).await;
        let auction = self.load(auction_id).await?;
        self.ensure_joinable(&auction, user_id).await?;

        let now = self.ctx.clock.now();
        let hold = DepositHold {
            hold_id: self.ctx.store.allocate_id(IdKind::Hold).await?,
            owner: user_id.to_string(),
            auction_id,
            amount: auction.deposit_amount,
            gateway_hold_id: gateway_hold_id.to_string(),
            status: HoldStatus::Active,
            created_at: now,
            expires_at: now + self.ctx.config.hold_validity(),
        };

        let mut changes = Changeset::new();
        changes
            .expect_status(auction_id, auction.status)
            .put_hold(hold.clone())
            .insert_participant(Participant {
                auction_id,
                user_id: user_id.to_string(),
                registered_at: now,
            });
        self.ctx.store.commit(changes).await.map_err(|err| {
            warn!(auction_id, user_id, order_id, error = %err, "Join commit failed");
            err
        })?;
        Ok(hold)
    }

    /// Void a gateway hold whose ledger write failed.
    async fn compensate(
        &self,
        auction_id: AuctionId,
        user_id: &str,
        gateway_hold_id: &str,
        cause: &AuctionError,
    ) {
        let voided = bounded(
            self.ctx.config.gateway_timeout(),
            self.ctx.gateway.void_hold(gateway_hold_id),
        )
        .await;

        match voided {
            Ok(true) => {
                warn!(auction_id, user_id, gateway_hold_id, cause = %cause, "Voided authorization after failed join");
            }
            outcome => {
                error!(
                    auction_id,
                    user_id,
                    gateway_hold_id,
                    cause = %cause,
                    void = ?outcome,
                    "Authorized hold has no ledger record and could not be voided; queued for reconciliation"
                );
                self.ctx
                    .reconciliation
                    .push(ReconciliationTask::VoidOrphanedHold {
                        gateway_hold_id: gateway_hold_id.to_string(),
                        auction_id,
                        user_id: user_id.to_string(),
                    });
            }
        }
    }

    /// Leave a scheduled auction, releasing the deposit hold if any.
    ///
    /// Fails closed: when the gateway does not void the hold, the user stays
    /// a participant.
    pub async fn leave_auction(&self, auction_id: AuctionId, user_id: &str) -> HandlerResult<()> {
        let _guard = self.ctx.locks.lock(auction_id).await;

        let auction = self.load(auction_id).await?;
        match auction.status {
            // Due to start but not yet promoted by the sweeper
            AuctionStatus::Scheduled if self.ctx.clock.now() >= auction.start_time => {
                return Err(AuctionError::ParticipantsLocked)
            }
            AuctionStatus::Scheduled => {}
            AuctionStatus::Active => return Err(AuctionError::ParticipantsLocked),
            got => {
                return Err(AuctionError::InvalidState {
                    expected: AuctionStatus::Scheduled,
                    got,
                })
            }
        }
        if self
            .ctx
            .store
            .get_participant(auction_id, user_id)
            .await?
            .is_none()
        {
            return Err(AuctionError::NotParticipant);
        }

        match self.ctx.store.get_active_hold(auction_id, user_id).await? {
            Some(hold) => {
                void_and_release(&self.ctx, &hold, true)
                    .await
                    .map_err(|err| {
                        warn!(auction_id, user_id, hold_id = hold.hold_id, error = %err, "Leave failed, participant kept");
                        err
                    })?;
            }
            None => {
                let mut changes = Changeset::new();
                changes
                    .expect_status(auction_id, AuctionStatus::Scheduled)
                    .remove_participant(auction_id, user_id);
                self.ctx.store.commit(changes).await?;
            }
        }

        info!(auction_id, user_id, "Participant left auction");
        Ok(())
    }

    /// Whether a user is admitted to an auction.
    pub async fn check_participation(
        &self,
        auction_id: AuctionId,
        user_id: &str,
    ) -> HandlerResult<ParticipationStatus> {
        let auction = self.load(auction_id).await?;

        let (is_participant, message) = if auction.is_creator(user_id) {
            (false, "You created this auction and cannot participate".to_string())
        } else if self
            .ctx
            .store
            .get_participant(auction_id, user_id)
            .await?
            .is_some()
        {
            (true, "You are participating in this auction".to_string())
        } else if self
            .ctx
            .pending
            .find(auction_id, user_id, self.ctx.clock.now())
            .is_some()
        {
            (false, "Your deposit is awaiting approval".to_string())
        } else {
            (false, "You are not participating in this auction".to_string())
        };

        Ok(ParticipationStatus {
            is_participant,
            message,
        })
    }

    async fn load(&self, auction_id: AuctionId) -> HandlerResult<Auction> {
        self.ctx
            .store
            .get_auction(auction_id)
            .await?
            .ok_or(AuctionError::AuctionNotFound(auction_id))
    }

    async fn ensure_joinable(&self, auction: &Auction, user_id: &str) -> HandlerResult<()> {
        if !auction.status.is_open() {
            return Err(AuctionError::AuctionClosed(auction.status));
        }
        if auction.is_creator(user_id) {
            return Err(AuctionError::CreatorCannotParticipate);
        }
        if self
            .ctx
            .store
            .get_participant(auction.auction_id, user_id)
            .await?
            .is_some()
        {
            return Err(AuctionError::AlreadyParticipant);
        }
        Ok(())
    }
}
