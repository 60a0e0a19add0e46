//! Engine configuration.
//!
//! Timing and protocol parameters shared by every component. All fields
//! have defaults, so a partial JSON document is a valid configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the auction engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Lifecycle sweeper period (seconds)
    pub sweep_interval_secs: u64,

    /// Upper bound on any single payment gateway call (seconds)
    pub gateway_timeout_secs: u64,

    /// How long an unconfirmed deposit order stays claimable (seconds)
    pub pending_join_ttl_secs: u64,

    /// Validity of a gateway authorization, used as the hold expiry (days)
    pub hold_validity_days: u32,

    /// How long the sweeper waits for one auction's lock before skipping it (ms)
    pub lock_timeout_ms: u64,

    /// Currency of deposit orders
    pub currency: String,

    /// Minimum length of a cancellation reason (characters)
    pub min_cancel_reason_len: usize,

    /// Buffered notifications per connected user
    pub notification_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            gateway_timeout_secs: 10,
            pending_join_ttl_secs: 600,  // 10 minutes
            hold_validity_days: 29,
            lock_timeout_ms: 5_000,
            currency: "USD".to_string(),
            min_cancel_reason_len: 10,
            notification_buffer: 64,
        }
    }
}

impl EngineConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn pending_join_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.pending_join_ttl_secs as i64)
    }

    pub fn hold_validity(&self) -> chrono::Duration {
        chrono::Duration::days(self.hold_validity_days as i64)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.sweep_interval_secs == 0 {
            return Err(ConfigValidationError::InvalidInterval(
                "Sweep interval cannot be zero".into(),
            ));
        }
        if self.gateway_timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidInterval(
                "Gateway timeout cannot be zero".into(),
            ));
        }
        if self.pending_join_ttl_secs == 0 {
            return Err(ConfigValidationError::InvalidInterval(
                "Pending join TTL cannot be zero".into(),
            ));
        }
        if self.hold_validity_days == 0 {
            return Err(ConfigValidationError::InvalidInterval(
                "Hold validity cannot be zero".into(),
            ));
        }

        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(ConfigValidationError::InvalidCurrency(self.currency.clone()));
        }

        if self.notification_buffer == 0 {
            return Err(ConfigValidationError::InvalidBuffer);
        }

        Ok(())
    }
}

/// Errors that can occur during configuration validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    #[error("Invalid currency code: {0}")]
    InvalidCurrency(String),

    #[error("Notification buffer cannot be zero")]
    InvalidBuffer,
}
