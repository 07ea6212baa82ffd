use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::clock::{Clock, SystemClock};
use crate::config::validate;
use crate::error::Result;

/// Thread-safe token bucket with lazy, whole-token refill.
///
/// The bucket starts full. One token accrues per `refill_interval`; tokens
/// are only materialized when a check observes at least one full interval
/// since the last refill. Time short of a full interval is carried over
/// because `last_refill` does not move until a token is actually added.
///
/// ```
/// use client_ratelimit::{ManualClock, TokenBucket};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let clock = ManualClock::new();
/// let bucket = TokenBucket::with_clock(2, Duration::from_secs(1), Arc::new(clock.clone())).unwrap();
///
/// assert!(bucket.try_acquire());
/// assert!(bucket.try_acquire());
/// assert!(!bucket.try_acquire());
///
/// clock.advance(Duration::from_secs(1));
/// assert!(bucket.try_acquire());
/// ```
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    refill_interval: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: u64,
    last_refill: Instant,
    last_seen: Instant,
}

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquisition {
    pub allowed: bool,
    /// Tokens left after this check.
    pub remaining: u64,
    /// Time until the next token accrues, zero if tokens remain.
    pub retry_after: Duration,
}

impl TokenBucket {
    /// Create a full bucket on the system clock.
    pub fn new(capacity: u64, refill_interval: Duration) -> Result<Self> {
        Self::with_clock(capacity, refill_interval, Arc::new(SystemClock))
    }

    pub fn with_clock(
        capacity: u64,
        refill_interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        validate(capacity, refill_interval)?;
        Ok(Self::new_unchecked(capacity, refill_interval, clock))
    }

    /// Caller guarantees `capacity > 0` and a non-zero `refill_interval`.
    pub(crate) fn new_unchecked(
        capacity: u64,
        refill_interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        Self {
            capacity,
            refill_interval,
            clock,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: now,
                last_seen: now,
            }),
        }
    }

    /// Take one token if available.
    pub fn try_acquire(&self) -> bool {
        self.acquire().allowed
    }

    /// Take one token if available and report what is left.
    pub fn acquire(&self) -> Acquisition {
        let mut state = self.lock();
        let now = self.clock.now();
        state.last_seen = now;
        self.refill(&mut state, now);

        let allowed = state.tokens > 0;
        if allowed {
            state.tokens -= 1;
        }

        Acquisition {
            allowed,
            remaining: state.tokens,
            retry_after: self.retry_after(&state, now),
        }
    }

    /// Refill and return the current token count without consuming.
    pub fn available_tokens(&self) -> u64 {
        let mut state = self.lock();
        let now = self.clock.now();
        self.refill(&mut state, now);
        state.tokens
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn refill_interval(&self) -> Duration {
        self.refill_interval
    }

    /// Whether the bucket has gone unchecked for longer than `threshold`
    /// and has refilled to capacity.
    ///
    /// Such a bucket is indistinguishable from a freshly created one, so
    /// dropping it cannot change any later admission decision.
    pub fn is_stale(&self, threshold: Duration) -> bool {
        let mut state = self.lock();
        let now = self.clock.now();
        self.refill(&mut state, now);
        let idle = now.saturating_duration_since(state.last_seen);
        idle > threshold && state.tokens == self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        // State is always consistent between statements, so a panic elsewhere
        // cannot leave it half-written.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        let intervals = elapsed.as_nanos() / self.refill_interval.as_nanos();
        let to_add = intervals.min(u128::from(self.capacity)) as u64;

        if to_add > 0 {
            state.tokens = state.tokens.saturating_add(to_add).min(self.capacity);
            state.last_refill = now;
        }
    }

    fn retry_after(&self, state: &BucketState, now: Instant) -> Duration {
        if state.tokens > 0 {
            return Duration::ZERO;
        }
        self.refill_interval
            .saturating_sub(now.saturating_duration_since(state.last_refill))
    }
}
