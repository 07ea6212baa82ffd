use std::time::Duration;

use crate::error::{ConfigError, Result};

/// Configuration shared by every bucket a [`ClientRegistry`](crate::ClientRegistry) creates.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum tokens per client (burst size).
    pub capacity: u64,
    /// Time needed to accrue one token.
    pub refill_interval: Duration,
    /// Buckets idle for longer than this are swept. `None` keeps every
    /// bucket for the lifetime of the registry.
    pub stale_threshold: Option<Duration>,
    /// Period of the background sweep started by `spawn_cleanup_task`.
    pub cleanup_interval: Duration,
}

impl RegistryConfig {
    pub fn new(capacity: u64, refill_interval: Duration) -> Self {
        Self {
            capacity,
            refill_interval,
            ..Default::default()
        }
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = Some(threshold);
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate(self.capacity, self.refill_interval)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            capacity: 5,
            refill_interval: Duration::from_secs(1),
            stale_threshold: None,
            cleanup_interval: Duration::from_secs(300), // 5 minutes
        }
    }
}

pub(crate) fn validate(capacity: u64, refill_interval: Duration) -> Result<()> {
    if capacity == 0 {
        return Err(ConfigError::ZeroCapacity.into());
    }
    if refill_interval.is_zero() {
        return Err(ConfigError::ZeroRefillInterval.into());
    }
    Ok(())
}
