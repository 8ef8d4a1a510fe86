use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Error, Result};

/// Sync configuration for retry limits, timeouts and triggering behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Device prefix embedded in idempotency keys (None = generate and persist one)
    pub device_prefix: Option<String>,

    /// Remote-apply attempts before an item is retired to the dead set
    pub max_attempts: u32,

    /// Upper bound on a single remote-apply call
    pub apply_timeout: Duration,

    /// Delay between an Online transition and the drain it triggers
    pub reconnect_debounce: Duration,

    /// Fallback periodic drain interval (None = event-driven only)
    pub poll_interval: Option<Duration>,

    /// Capacity of the processed-key ledger
    pub ledger_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            device_prefix: None,
            max_attempts: 5,
            apply_timeout: Duration::from_secs(30),
            reconnect_debounce: Duration::from_secs(2),
            poll_interval: None,
            ledger_capacity: 1000,
        }
    }
}

impl SyncConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the device prefix used in idempotency keys
    pub fn with_device_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.device_prefix = Some(prefix.into());
        self
    }

    /// Set maximum remote-apply attempts per item
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the per-call remote-apply timeout
    pub fn with_apply_timeout(mut self, timeout: Duration) -> Self {
        self.apply_timeout = timeout;
        self
    }

    /// Set the reconnect debounce window
    pub fn with_reconnect_debounce(mut self, debounce: Duration) -> Self {
        self.reconnect_debounce = debounce;
        self
    }

    /// Enable periodic fallback draining
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Set the processed-key ledger capacity
    pub fn with_ledger_capacity(mut self, capacity: usize) -> Self {
        self.ledger_capacity = capacity;
        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::InvalidConfig("max_attempts must be greater than 0".to_string()));
        }

        if self.apply_timeout.is_zero() {
            return Err(Error::InvalidConfig("apply_timeout must be greater than 0".to_string()));
        }

        if self.ledger_capacity == 0 {
            return Err(Error::InvalidConfig("ledger_capacity must be greater than 0".to_string()));
        }

        if let Some(interval) = self.poll_interval {
            if interval.is_zero() {
                return Err(Error::InvalidConfig(
                    "poll_interval must be greater than 0 when set".to_string(),
                ));
            }
        }

        if let Some(prefix) = &self.device_prefix {
            if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(Error::InvalidConfig(format!(
                    "device_prefix '{}' must be non-empty ASCII alphanumerics or '_'",
                    prefix
                )));
            }
        }

        Ok(())
    }
}
