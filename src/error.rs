/// Reason a capacity/refill configuration was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("capacity must be greater than 0")]
    ZeroCapacity,
    #[error("refill interval must be greater than 0")]
    ZeroRefillInterval,
}

/// Error type for this crate.
///
/// Admission checks never fail; only construction does.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// Capacity or refill interval is not strictly positive.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, RateLimitError>;
