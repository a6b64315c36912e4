use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SkeinError};

/// Scheduling core configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Waits longer than this suspend the workflow instead of blocking the
    /// dispatching task.
    #[serde(default = "default_suspend_threshold")]
    pub suspend_threshold_secs: u64,

    /// Maximum wake-ups fetched per `process_due` call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long a fetched wake-up stays invisible to other pollers.
    #[serde(default = "default_lease")]
    pub lease_secs: u64,

    /// Poll interval of the scheduler loop in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Poll interval while waiting in-process for an event, in milliseconds.
    #[serde(default = "default_event_poll_interval")]
    pub event_poll_interval_ms: u64,

    /// Attempts to acquire a step lock before the dispatch gives up.
    #[serde(default = "default_lock_retry_attempts")]
    pub lock_retry_attempts: u32,

    /// Initial backoff between lock attempts in milliseconds.
    #[serde(default = "default_lock_retry_base")]
    pub lock_retry_base_ms: u64,

    /// Backoff cap between lock attempts in milliseconds.
    #[serde(default = "default_lock_retry_max")]
    pub lock_retry_max_ms: u64,

    /// Lifetime of a step lock in seconds.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,

    /// Re-reads after an insert conflict on a call site.
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            suspend_threshold_secs: default_suspend_threshold(),
            batch_size: default_batch_size(),
            lease_secs: default_lease(),
            poll_interval_ms: default_poll_interval(),
            event_poll_interval_ms: default_event_poll_interval(),
            lock_retry_attempts: default_lock_retry_attempts(),
            lock_retry_base_ms: default_lock_retry_base(),
            lock_retry_max_ms: default_lock_retry_max(),
            lock_ttl_secs: default_lock_ttl(),
            conflict_retries: default_conflict_retries(),
        }
    }
}

impl EngineConfig {
    pub fn suspend_threshold(&self) -> Duration {
        Duration::from_secs(self.suspend_threshold_secs)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn event_poll_interval(&self) -> Duration {
        Duration::from_millis(self.event_poll_interval_ms.max(1))
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    /// Backoff before lock attempt `attempt` (zero-based), doubling up to the cap.
    pub fn lock_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(16);
        let delay = self.lock_retry_base_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.lock_retry_max_ms))
    }

    /// Reject values that would stall the engine.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(SkeinError::Config("engine.batch_size must be > 0".into()));
        }
        if self.lock_retry_attempts == 0 {
            return Err(SkeinError::Config(
                "engine.lock_retry_attempts must be > 0".into(),
            ));
        }
        if self.lease_secs == 0 {
            return Err(SkeinError::Config("engine.lease_secs must be > 0".into()));
        }
        Ok(())
    }
}

fn default_suspend_threshold() -> u64 {
    15
}

fn default_batch_size() -> usize {
    100
}

fn default_lease() -> u64 {
    300
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_event_poll_interval() -> u64 {
    250
}

fn default_lock_retry_attempts() -> u32 {
    20
}

fn default_lock_retry_base() -> u64 {
    25
}

fn default_lock_retry_max() -> u64 {
    1000
}

fn default_lock_ttl() -> u64 {
    600
}

fn default_conflict_retries() -> u32 {
    3
}
