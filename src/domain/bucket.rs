//! Token bucket arithmetic for per-client rate limiting.
//!
//! Buckets refill lazily: nothing ticks in the background, the elapsed time is
//! converted into tokens at the moment a request is checked.

use std::time::Instant;

/// Error returned when a quota is invalid.
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum QuotaError {
    /// Burst (bucket capacity) must be at least one
    #[error("burst must be greater than 0")]
    ZeroBurst,
    /// Refill rate must be a finite, positive number of requests per second
    #[error("requests per second must be finite and greater than 0, got {0}")]
    InvalidRate(f64),
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed
    Allowed,
    /// The request exceeded the client's budget
    Denied,
}

impl Decision {
    /// Check if this decision is Allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }

    /// Check if this decision is Denied.
    pub fn is_denied(&self) -> bool {
        matches!(self, Decision::Denied)
    }
}

/// Validated rate limit parameters shared by every bucket of a store.
///
/// # Example
/// ```
/// use serve_throttle::Quota;
///
/// let quota = Quota::new(2.0, 4).unwrap();
/// assert_eq!(quota.burst(), 4);
/// assert!(Quota::new(0.0, 4).is_err());
/// assert!(Quota::new(2.0, 0).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quota {
    requests_per_second: f64,
    burst: u32,
}

impl Quota {
    /// Create a quota.
    ///
    /// # Arguments
    /// * `requests_per_second` - Sustained refill rate in tokens per second
    /// * `burst` - Bucket capacity, the number of requests admitted back to back
    ///
    /// # Errors
    /// Returns `QuotaError::ZeroBurst` if `burst` is zero, or
    /// `QuotaError::InvalidRate` if the rate is not finite or not positive.
    pub fn new(requests_per_second: f64, burst: u32) -> Result<Self, QuotaError> {
        if burst == 0 {
            return Err(QuotaError::ZeroBurst);
        }
        if !requests_per_second.is_finite() || requests_per_second <= 0.0 {
            return Err(QuotaError::InvalidRate(requests_per_second));
        }
        Ok(Self {
            requests_per_second,
            burst,
        })
    }

    /// Sustained refill rate in tokens per second.
    pub fn requests_per_second(&self) -> f64 {
        self.requests_per_second
    }

    /// Bucket capacity.
    pub fn burst(&self) -> u32 {
        self.burst
    }
}

/// A single client's token bucket.
///
/// Invariant: `0 <= tokens <= capacity`. Refill is computed from the time
/// elapsed since the last refill and clamped to the capacity.
///
/// # Example
/// ```
/// use serve_throttle::{Quota, TokenBucket};
/// use std::time::{Duration, Instant};
///
/// let now = Instant::now();
/// let mut bucket = TokenBucket::full(Quota::new(2.0, 4).unwrap(), now);
///
/// for _ in 0..4 {
///     assert!(bucket.try_acquire(now).is_allowed());
/// }
/// assert!(bucket.try_acquire(now).is_denied());
///
/// // Half a second at 2 tokens/sec buys exactly one more request
/// let later = now + Duration::from_millis(500);
/// assert!(bucket.try_acquire(later).is_allowed());
/// assert!(bucket.try_acquire(later).is_denied());
/// ```
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: u32,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a bucket at full capacity.
    pub fn full(quota: Quota, now: Instant) -> Self {
        Self {
            capacity: quota.burst,
            refill_rate: quota.requests_per_second,
            tokens: f64::from(quota.burst),
            last_refill: now,
        }
    }

    /// Bucket capacity (burst).
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Refill rate in tokens per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Tokens currently stored, as of the last refill.
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Instant of the last refill.
    pub fn last_refill(&self) -> Instant {
        self.last_refill
    }

    /// Tokens that would be available at `now`, without mutating the bucket.
    pub fn available_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.refill_rate).min(f64::from(self.capacity))
    }

    /// Add the tokens earned since the last refill.
    ///
    /// An instant earlier than the last refill counts as zero elapsed time, so a
    /// bucket never observes a refill from the future and never rewinds.
    pub fn refill(&mut self, now: Instant) {
        if now <= self.last_refill {
            return;
        }
        self.tokens = self.available_at(now);
        self.last_refill = now;
    }

    /// Refill, then take one token if at least one is available.
    pub fn try_acquire(&mut self, now: Instant) -> Decision {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            Decision::Allowed
        } else {
            Decision::Denied
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const EPSILON: f64 = 1e-9;

    fn bucket(rps: f64, burst: u32, now: Instant) -> TokenBucket {
        TokenBucket::full(Quota::new(rps, burst).unwrap(), now)
    }

    #[test]
    fn test_burst_then_deny() {
        let now = Instant::now();
        let mut bucket = bucket(1.0, 5, now);

        for i in 0..5 {
            assert_eq!(
                bucket.try_acquire(now),
                Decision::Allowed,
                "Request {} should be allowed",
                i
            );
        }
        assert_eq!(bucket.try_acquire(now), Decision::Denied);
        assert_eq!(bucket.try_acquire(now), Decision::Denied);
    }

    #[test]
    fn test_lazy_refill_matches_formula() {
        let now = Instant::now();
        let mut bucket = bucket(4.0, 10, now);

        for _ in 0..10 {
            bucket.try_acquire(now);
        }
        assert!(bucket.tokens().abs() < EPSILON);

        // 0.125s * 4 tokens/s = 0.5 tokens, not enough
        let t1 = now + Duration::from_millis(125);
        assert_eq!(bucket.try_acquire(t1), Decision::Denied);
        assert!((bucket.tokens() - 0.5).abs() < EPSILON);

        // 0.125s more = 1.0 tokens, enough for one request
        let t2 = t1 + Duration::from_millis(125);
        assert_eq!(bucket.try_acquire(t2), Decision::Allowed);
        assert!(bucket.tokens().abs() < EPSILON);
    }

    #[test]
    fn test_refill_is_clamped_to_capacity() {
        let now = Instant::now();
        let mut bucket = bucket(100.0, 3, now);

        bucket.try_acquire(now);
        bucket.refill(now + Duration::from_secs(3600));

        assert!((bucket.tokens() - 3.0).abs() < EPSILON);
        assert!((bucket.available_at(now + Duration::from_secs(7200)) - 3.0).abs() < EPSILON);
    }

    #[test]
    fn test_earlier_instant_does_not_rewind() {
        let now = Instant::now();
        let later = now + Duration::from_secs(1);
        let mut bucket = bucket(1.0, 1, now);

        assert_eq!(bucket.try_acquire(later), Decision::Allowed);
        // An instant before the last refill earns nothing
        assert_eq!(bucket.try_acquire(now), Decision::Denied);
        assert_eq!(bucket.last_refill(), later);
        assert!(bucket.tokens() >= 0.0);
    }

    #[test]
    fn test_capacity_one() {
        let now = Instant::now();
        let mut bucket = bucket(0.5, 1, now);

        assert_eq!(bucket.try_acquire(now), Decision::Allowed);
        assert_eq!(bucket.try_acquire(now), Decision::Denied);
        assert_eq!(
            bucket.try_acquire(now + Duration::from_millis(1999)),
            Decision::Denied
        );
        assert_eq!(
            bucket.try_acquire(now + Duration::from_millis(2100)),
            Decision::Allowed
        );
    }

    #[test]
    fn test_quota_validation() {
        assert_eq!(Quota::new(1.0, 0), Err(QuotaError::ZeroBurst));
        assert_eq!(Quota::new(0.0, 1), Err(QuotaError::InvalidRate(0.0)));
        assert_eq!(Quota::new(-2.0, 1), Err(QuotaError::InvalidRate(-2.0)));
        assert!(matches!(
            Quota::new(f64::INFINITY, 1),
            Err(QuotaError::InvalidRate(_))
        ));
        assert!(matches!(
            Quota::new(f64::NAN, 1),
            Err(QuotaError::InvalidRate(_))
        ));

        let quota = Quota::new(2.5, 7).unwrap();
        assert_eq!(quota.burst(), 7);
        assert!((quota.requests_per_second() - 2.5).abs() < EPSILON);
    }

    #[test]
    fn test_decision_helpers() {
        assert!(Decision::Allowed.is_allowed());
        assert!(!Decision::Allowed.is_denied());
        assert!(Decision::Denied.is_denied());
    }
}
