//! Payment gateway contract and the in-process sandbox gateway.
//!
//! The gateway creates deposit-authorization orders, turns an approved order
//! into a funds hold, and voids holds. Each call may fail independently of
//! local state, so callers bound every call with [`bounded`].

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use auction_types::{Amount, AuctionId, UserId};

/// Errors returned by a payment gateway.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// The provider processed the request and refused it.
    #[error("{0}")]
    Rejected(String),

    #[error("request timed out")]
    Timeout,

    #[error("transport failure: {0}")]
    Transport(String),
}

/// A request for a deposit-authorization order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositOrderRequest {
    /// Idempotency key; repeated requests with the same key yield the same order
    pub request_id: String,
    pub auction_id: AuctionId,
    pub user_id: UserId,
    pub amount: Amount,
    pub currency: String,
}

/// An order awaiting the user's approval.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositOrder {
    pub order_id: String,
    /// Where the user approves the hold
    pub approval_url: String,
}

/// External payment provider.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_deposit_order(
        &self,
        request: &DepositOrderRequest,
    ) -> Result<DepositOrder, GatewayError>;

    /// Convert an approved order into a hold. Returns the gateway hold id.
    async fn authorize_order(&self, order_id: &str) -> Result<String, GatewayError>;

    /// Void a hold. `Ok(false)` means the provider declined to void it.
    async fn void_hold(&self, hold_id: &str) -> Result<bool, GatewayError>;
}

/// Run a gateway call with an upper bound on its duration.
pub async fn bounded<T, F>(timeout: Duration, call: F) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout),
    }
}

/// Operations of the sandbox gateway that can be scripted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SandboxOp {
    CreateOrder,
    Authorize,
    Void,
}

#[derive(Debug, Clone)]
struct SandboxOrder {
    amount: Amount,
    hold_id: Option<String>,
}

#[derive(Debug, Default)]
struct SandboxState {
    orders: HashMap<String, SandboxOrder>,
    /// Idempotency key -> order id
    requests: HashMap<String, String>,
    /// Hold id -> voided
    holds: HashMap<String, bool>,
    failures: HashMap<SandboxOp, Vec<GatewayError>>,
    latency: HashMap<SandboxOp, Duration>,
    decline_voids: bool,
    calls: HashMap<SandboxOp, usize>,
}

/// In-process gateway that approves every order.
///
/// Used for local runs and tests. Failures and latency can be scripted per
/// operation.
#[derive(Debug)]
pub struct SandboxGateway {
    state: Mutex<SandboxState>,
    approval_base: String,
}

impl Default for SandboxGateway {
    fn default() -> Self {
        Self::new("https://sandbox.gateway.local/approve")
    }
}

impl SandboxGateway {
    pub fn new(approval_base: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(SandboxState::default()),
            approval_base: approval_base.into(),
        }
    }

    /// Fail the next call of `op` with `error`. Queued failures are consumed in order.
    pub fn fail_next(&self, op: SandboxOp, error: GatewayError) {
        self.state.lock().failures.entry(op).or_default().push(error);
    }

    /// Delay every call of `op`.
    pub fn set_latency(&self, op: SandboxOp, latency: Duration) {
        self.state.lock().latency.insert(op, latency);
    }

    /// Answer `Ok(false)` to voids.
    pub fn decline_voids(&self, decline: bool) {
        self.state.lock().decline_voids = decline;
    }

    pub fn call_count(&self, op: SandboxOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Holds that were authorized and not voided.
    pub fn active_holds(&self) -> Vec<String> {
        let mut holds: Vec<String> = self
            .state
            .lock()
            .holds
            .iter()
            .filter(|(_, voided)| !**voided)
            .map(|(id, _)| id.clone())
            .collect();
        holds.sort();
        holds
    }

    pub fn is_voided(&self, hold_id: &str) -> bool {
        self.state.lock().holds.get(hold_id).copied().unwrap_or(false)
    }

    /// Count the call, then return its latency and any scripted failure.
    fn begin(&self, op: SandboxOp) -> (Option<Duration>, Option<GatewayError>) {
        let mut state = self.state.lock();
        *state.calls.entry(op).or_insert(0) += 1;
        let latency = state.latency.get(&op).copied();
        let failure = state
            .failures
            .get_mut(&op)
            .filter(|queue| !queue.is_empty())
            .map(|queue| queue.remove(0));
        (latency, failure)
    }

    async fn enter(&self, op: SandboxOp) -> Result<(), GatewayError> {
        let (latency, failure) = self.begin(op);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn random_id(prefix: &str) -> String {
    format!("{prefix}-{}", hex::encode(rand::random::<[u8; 8]>()).to_uppercase())
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    async fn create_deposit_order(
        &self,
        request: &DepositOrderRequest,
    ) -> Result<DepositOrder, GatewayError> {
        self.enter(SandboxOp::CreateOrder).await?;

        if request.amount <= Amount::ZERO {
            return Err(GatewayError::Rejected(
                "INVALID_AMOUNT: deposit amount must be positive".into(),
            ));
        }

        let mut state = self.state.lock();
        let order_id = match state.requests.get(&request.request_id).cloned() {
            Some(existing) => existing,
            None => {
                let order_id = random_id("ORDER");
                state.requests.insert(request.request_id.clone(), order_id.clone());
                state.orders.insert(
                    order_id.clone(),
                    SandboxOrder {
                        amount: request.amount,
                        hold_id: None,
                    },
                );
                order_id
            }
        };

        Ok(DepositOrder {
            approval_url: format!("{}?token={}", self.approval_base, order_id),
            order_id,
        })
    }

    async fn authorize_order(&self, order_id: &str) -> Result<String, GatewayError> {
        self.enter(SandboxOp::Authorize).await?;

        let mut state = self.state.lock();
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| GatewayError::Rejected(format!("RESOURCE_NOT_FOUND: order {order_id}")))?;

        if let Some(hold_id) = &order.hold_id {
            return Ok(hold_id.clone());
        }
        if order.amount <= Amount::ZERO {
            return Err(GatewayError::Rejected("ORDER_NOT_APPROVED".into()));
        }

        let hold_id = random_id("AUTH");
        order.hold_id = Some(hold_id.clone());
        state.holds.insert(hold_id.clone(), false);
        Ok(hold_id)
    }

    async fn void_hold(&self, hold_id: &str) -> Result<bool, GatewayError> {
        self.enter(SandboxOp::Void).await?;

        let mut state = self.state.lock();
        if state.decline_voids {
            return Ok(false);
        }
        match state.holds.get_mut(hold_id) {
            Some(voided) => {
                *voided = true;
                Ok(true)
            }
            None => Err(GatewayError::Rejected(format!(
                "RESOURCE_NOT_FOUND: authorization {hold_id}"
            ))),
        }
    }
}
