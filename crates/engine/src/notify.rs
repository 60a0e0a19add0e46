//! Notification fan-out.
//!
//! Emitters publish through the [`Notifier`] contract and never treat a
//! delivery failure as a failure of the write that triggered it.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

use auction_types::{AuctionId, Bid, Notification, UserId};

/// Errors reported by a notifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifyError {
    #[error("Delivered to {delivered} of {recipients} recipients")]
    Undelivered { recipients: usize, delivered: usize },
}

/// Publish contract used by the bid recorder, the orchestrator and the sweeper.
///
/// Calls must not block. The returned count is the number of recipients the
/// message was handed to.
pub trait Notifier: Send + Sync {
    fn auction_started(
        &self,
        auction_id: AuctionId,
        participants: &[UserId],
        end_time: DateTime<Utc>,
    ) -> Result<usize, NotifyError>;

    fn auction_finished(
        &self,
        auction_id: AuctionId,
        participants: &[UserId],
    ) -> Result<usize, NotifyError>;

    fn new_bid(&self, auction_id: AuctionId, bid: &Bid) -> Result<usize, NotifyError>;

    /// The auction ended or was removed; nothing more is published for it.
    fn auction_closed(&self, _auction_id: AuctionId) {}
}

#[derive(Debug, Default)]
struct HubState {
    /// One channel per connected user
    users: HashMap<UserId, broadcast::Sender<Notification>>,
    /// Auction groups
    groups: HashMap<AuctionId, HashSet<UserId>>,
}

/// In-process fan-out hub.
///
/// Each connected user has a broadcast channel; auction-scoped messages go
/// to the user channels of the auction group's members.
#[derive(Debug)]
pub struct NotificationHub {
    state: RwLock<HubState>,
    capacity: usize,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(64)
    }
}

impl NotificationHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: RwLock::new(HubState::default()),
            capacity: capacity.max(1),
        }
    }

    /// Open a receiver on the user's channel. Multiple connections share it.
    pub fn connect(&self, user_id: &str) -> broadcast::Receiver<Notification> {
        let mut state = self.state.write();
        if let Some(sender) = state.users.get(user_id) {
            return sender.subscribe();
        }
        let (sender, receiver) = broadcast::channel(self.capacity);
        state.users.insert(user_id.to_string(), sender);
        debug!(user_id, "User connected to notification hub");
        receiver
    }

    /// Drop the user's channel once no connection listens on it.
    pub fn disconnect(&self, user_id: &str) {
        let mut state = self.state.write();
        let idle = state
            .users
            .get(user_id)
            .is_some_and(|sender| sender.receiver_count() == 0);
        if idle {
            state.users.remove(user_id);
            debug!(user_id, "User disconnected from notification hub");
        }
    }

    pub fn is_connected(&self, user_id: &str) -> bool {
        self.state
            .read()
            .users
            .get(user_id)
            .is_some_and(|sender| sender.receiver_count() > 0)
    }

    /// Add a user to an auction group.
    pub fn join_group(&self, auction_id: AuctionId, user_id: &str) {
        self.state
            .write()
            .groups
            .entry(auction_id)
            .or_default()
            .insert(user_id.to_string());
    }

    /// Remove a user from an auction group. Returns whether it was a member.
    pub fn leave_group(&self, auction_id: AuctionId, user_id: &str) -> bool {
        let mut state = self.state.write();
        let Some(members) = state.groups.get_mut(&auction_id) else {
            return false;
        };
        let removed = members.remove(user_id);
        if members.is_empty() {
            state.groups.remove(&auction_id);
        }
        removed
    }

    /// Remove a user from a group it tried to leave illegitimately.
    pub fn evict(&self, auction_id: AuctionId, user_id: &str) -> bool {
        let evicted = self.leave_group(auction_id, user_id);
        if evicted {
            info!(auction_id, user_id, "Evicted user from auction group");
        }
        evicted
    }

    /// Forget an auction group. Returns the former members.
    pub fn drop_group(&self, auction_id: AuctionId) -> Vec<UserId> {
        let mut members: Vec<UserId> = self
            .state
            .write()
            .groups
            .remove(&auction_id)
            .map(|m| m.into_iter().collect())
            .unwrap_or_default();
        members.sort();
        if !members.is_empty() {
            debug!(auction_id, members = members.len(), "Dropped auction group");
        }
        members
    }

    pub fn group_count(&self) -> usize {
        self.state.read().groups.len()
    }

    pub fn is_member(&self, auction_id: AuctionId, user_id: &str) -> bool {
        self.state
            .read()
            .groups
            .get(&auction_id)
            .is_some_and(|members| members.contains(user_id))
    }

    pub fn group_members(&self, auction_id: AuctionId) -> Vec<UserId> {
        let mut members: Vec<UserId> = self
            .state
            .read()
            .groups
            .get(&auction_id)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Deliver to one user. Returns whether a live connection received it.
    pub fn send_to_user(&self, user_id: &str, notification: Notification) -> bool {
        let state = self.state.read();
        match state.users.get(user_id) {
            Some(sender) => sender.send(notification).is_ok(),
            None => false,
        }
    }

    fn send_to_users<'a>(
        &self,
        users: impl IntoIterator<Item = &'a UserId>,
        notification: &Notification,
    ) -> Result<usize, NotifyError> {
        let state = self.state.read();
        let mut recipients = 0;
        let mut delivered = 0;
        for user in users {
            recipients += 1;
            if let Some(sender) = state.users.get(user) {
                if sender.send(notification.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        if recipients > 0 && delivered == 0 {
            return Err(NotifyError::Undelivered {
                recipients,
                delivered,
            });
        }
        Ok(delivered)
    }

    /// Deliver to every member of an auction group.
    pub fn broadcast_group(
        &self,
        auction_id: AuctionId,
        notification: &Notification,
    ) -> Result<usize, NotifyError> {
        let members = self.group_members(auction_id);
        self.send_to_users(members.iter(), notification)
    }
}

impl Notifier for NotificationHub {
    fn auction_started(
        &self,
        auction_id: AuctionId,
        participants: &[UserId],
        end_time: DateTime<Utc>,
    ) -> Result<usize, NotifyError> {
        self.send_to_users(
            participants,
            &Notification::AuctionStarted {
                auction_id,
                end_time,
            },
        )
    }

    fn auction_finished(
        &self,
        auction_id: AuctionId,
        participants: &[UserId],
    ) -> Result<usize, NotifyError> {
        self.send_to_users(participants, &Notification::AuctionFinished { auction_id })
    }

    fn new_bid(&self, auction_id: AuctionId, bid: &Bid) -> Result<usize, NotifyError> {
        self.broadcast_group(
            auction_id,
            &Notification::NewBid {
                auction_id,
                bid: bid.clone(),
            },
        )
    }

    fn auction_closed(&self, auction_id: AuctionId) {
        self.drop_group(auction_id);
    }
}
