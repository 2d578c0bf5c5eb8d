//! Token bucket implementation with whole-minute refill and full-bucket GC

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::util::time::unix_millis;

/// One refill cycle: buckets gain `refills_per_min` tokens per elapsed minute
const REFILL_CYCLE_MS: u64 = 60_000;

/// How often the sweeper reclaims full buckets
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Outcome of a consumption attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitResult {
    /// Tokens were debited
    Allowed,
    /// Not enough tokens; retry details included
    Limited {
        /// How many tokens short the bucket was
        missing_tokens: i64,
        /// Milliseconds until the shortfall is covered by refills
        retry_in: u64,
        /// Absolute unix-millis retry time
        retry_at: u64,
    },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed)
    }
}

/// Per-key rate-limiting state
///
/// Tokens are signed so administrative penalties can drive a bucket below
/// zero; refills always clamp at capacity.
#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: i64,
    /// Only advanced in whole-minute increments during refill, so the
    /// fractional remainder of the current minute is never lost.
    last_refill: u64,
}

/// Token-bucket rate limiter keyed by arbitrary strings (usernames, IPs)
pub struct BucketRateLimiter {
    capacity: u32,
    refills_per_min: u32,
    buckets: DashMap<String, Bucket>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl BucketRateLimiter {
    /// Create a limiter and start its sweeper task.
    ///
    /// The task holds only a [`Weak`] reference, so dropping the last `Arc`
    /// also ends the sweep loop even without an explicit [`dispose`] call.
    ///
    /// [`dispose`]: BucketRateLimiter::dispose
    pub fn new(capacity: u32, refills_per_min: u32) -> Arc<Self> {
        let limiter = Arc::new(Self {
            capacity,
            refills_per_min: refills_per_min.max(1),
            buckets: DashMap::new(),
            sweeper: Mutex::new(None),
        });

        let weak: Weak<Self> = Arc::downgrade(&limiter);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            // First tick completes immediately; skip it
            interval.tick().await;
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(limiter) => limiter.remove_full(),
                    None => break,
                }
            }
        });

        *limiter.sweeper.lock() = Some(handle);
        limiter
    }

    /// Stop the sweeper task. Idempotent.
    pub fn dispose(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }

    /// Attempt to consume `n` tokens from `key`'s bucket.
    pub fn consume(&self, key: &str, n: u32) -> RateLimitResult {
        self.consume_at(key, n, unix_millis())
    }

    /// Consumption against an explicit clock, for deterministic tests.
    fn consume_at(&self, key: &str, n: u32, now: u64) -> RateLimitResult {
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert(Bucket {
                // A brand-new key is evaluated against a full allowance
                tokens: i64::from(self.capacity),
                last_refill: now,
            });

        self.refill(&mut bucket, now);

        let n = i64::from(n);
        if bucket.tokens >= n {
            bucket.tokens -= n;
            return RateLimitResult::Allowed;
        }

        let missing = n - bucket.tokens;
        let elapsed_fraction = now.saturating_sub(bucket.last_refill) % REFILL_CYCLE_MS;
        // Price the shortfall at the refill rate, less the part of the
        // current cycle already elapsed; clamped so clock skew or backdated
        // admin edits never yield a retry time in the past.
        let accrual_ms = div_ceil(
            missing as u64 * REFILL_CYCLE_MS,
            u64::from(self.refills_per_min),
        );
        let retry_in = accrual_ms.saturating_sub(elapsed_fraction);

        RateLimitResult::Limited {
            missing_tokens: missing,
            retry_in,
            retry_at: now + retry_in,
        }
    }

    /// Apply elapsed whole-minute refills to a bucket.
    fn refill(&self, bucket: &mut Bucket, now: u64) {
        let elapsed = now.saturating_sub(bucket.last_refill);
        let cycles = elapsed / REFILL_CYCLE_MS;
        if cycles == 0 {
            return;
        }
        if bucket.tokens < i64::from(self.capacity) {
            bucket.tokens = i64::from(self.capacity)
                .min(bucket.tokens + cycles as i64 * i64::from(self.refills_per_min));
            bucket.last_refill += cycles * REFILL_CYCLE_MS;
        } else {
            // Already full: nothing accrues, but the anchor moves so denial
            // arithmetic never sees a stale minute fraction
            bucket.last_refill = now;
        }
    }

    /// Grant extra tokens to a key (moderation pardon).
    pub fn add_to_bucket(&self, key: &str, amount: i64) {
        self.mutate_raw(key, |tokens| tokens + amount, i64::from(self.capacity) + amount)
    }

    /// Take tokens from a key (moderation penalty). May go negative.
    pub fn subtract_from_bucket(&self, key: &str, amount: i64) {
        self.mutate_raw(key, |tokens| tokens - amount, i64::from(self.capacity) - amount)
    }

    /// Pin a key's token count to an exact value.
    pub fn set_bucket_size(&self, key: &str, amount: i64) {
        self.mutate_raw(key, |_| amount, amount)
    }

    /// Raw token adjustment, bypassing refill. `absent` is the token count a
    /// freshly created bucket receives.
    fn mutate_raw(&self, key: &str, apply: impl FnOnce(i64) -> i64, absent: i64) {
        match self.buckets.get_mut(key) {
            Some(mut bucket) => bucket.tokens = apply(bucket.tokens),
            None => {
                self.buckets.insert(
                    key.to_string(),
                    Bucket {
                        tokens: absent,
                        last_refill: unix_millis(),
                    },
                );
            }
        }
    }

    /// Reclaim buckets that have refilled back to capacity. A full bucket is
    /// indistinguishable from an absent one, so deleting it is unobservable.
    pub fn remove_full(&self) {
        self.remove_full_at(unix_millis())
    }

    fn remove_full_at(&self, now: u64) {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            self.refill(bucket, now);
            bucket.tokens < i64::from(self.capacity)
        });
        // Inserts can race the retain, so the count can only be a floor
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(removed, remaining = self.buckets.len(), "Reclaimed full buckets");
        }
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }
}

impl Drop for BucketRateLimiter {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Integer ceiling division
fn div_ceil(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_700_000_000_000;

    fn limiter(capacity: u32, refills_per_min: u32) -> Arc<BucketRateLimiter> {
        BucketRateLimiter::new(capacity, refills_per_min)
    }

    #[tokio::test]
    async fn fresh_key_consumes_against_full_allowance() {
        let limiter = limiter(10, 5);
        assert_eq!(limiter.consume_at("alice", 3, T0), RateLimitResult::Allowed);
        // 7 remain
        assert_eq!(limiter.consume_at("alice", 7, T0), RateLimitResult::Allowed);
        assert!(!limiter.consume_at("alice", 1, T0).is_allowed());
    }

    #[tokio::test]
    async fn over_capacity_request_on_fresh_key_is_denied_with_shortfall_one() {
        let limiter = limiter(10, 5);
        match limiter.consume_at("bob", 11, T0) {
            RateLimitResult::Limited { missing_tokens, retry_in, retry_at } => {
                assert_eq!(missing_tokens, 1);
                assert!(retry_in > 0);
                assert_eq!(retry_at, T0 + retry_in);
            }
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn denial_reports_shortfall_and_retry_time() {
        // capacity=10, refill=5/min: consume 7, then 5 more is 2 short;
        // 2 tokens accrue in 24s at 5/min
        let limiter = limiter(10, 5);
        assert!(limiter.consume_at("carol", 7, T0).is_allowed());
        match limiter.consume_at("carol", 5, T0) {
            RateLimitResult::Limited { missing_tokens, retry_in, retry_at } => {
                assert_eq!(missing_tokens, 2);
                assert_eq!(retry_in, 24_000);
                assert_eq!(retry_at, T0 + 24_000);
            }
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn refill_accrues_whole_minutes_and_clamps_at_capacity() {
        let limiter = limiter(10, 5);
        assert!(limiter.consume_at("dave", 10, T0).is_allowed());

        // 90s later: exactly one refill cycle has passed, 5 tokens back
        assert!(limiter.consume_at("dave", 5, T0 + 90_000).is_allowed());
        assert!(!limiter.consume_at("dave", 1, T0 + 90_000).is_allowed());

        // After many minutes the bucket is full again, never above capacity
        assert!(limiter.consume_at("dave", 10, T0 + 60 * 60_000).is_allowed());
        assert!(!limiter.consume_at("dave", 1, T0 + 60 * 60_000).is_allowed());
    }

    #[tokio::test]
    async fn refill_preserves_fractional_minute_remainder() {
        let limiter = limiter(10, 5);
        assert!(limiter.consume_at("erin", 10, T0).is_allowed());

        // 150s = 2 whole cycles + 30s; the 30s remainder must carry over so
        // the next cycle completes at T0+180s, not T0+210s
        assert!(limiter.consume_at("erin", 10, T0 + 150_000).is_allowed());
        assert!(limiter.consume_at("erin", 5, T0 + 181_000).is_allowed());
    }

    #[tokio::test]
    async fn denial_accounts_for_elapsed_fraction_of_cycle() {
        let limiter = limiter(10, 5);
        assert!(limiter.consume_at("frank", 10, T0).is_allowed());

        // 30s into the cycle: a 5-token request against an empty bucket
        // needs one full cycle of accrual, half of which has already passed
        match limiter.consume_at("frank", 5, T0 + 30_000) {
            RateLimitResult::Limited { missing_tokens, retry_in, .. } => {
                assert_eq!(missing_tokens, 5);
                // 5 tokens accrue in 60s; 30s already elapsed
                assert_eq!(retry_in, 30_000);
            }
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn retry_never_negative_under_backdated_state() {
        let limiter = limiter(2, 60);
        assert!(limiter.consume_at("gus", 2, T0).is_allowed());
        // Deny deep into the current cycle: the elapsed fraction (59s)
        // exceeds the 1s accrual estimate, so the result clamps to zero
        match limiter.consume_at("gus", 1, T0 + 59_000) {
            RateLimitResult::Limited { retry_in, retry_at, .. } => {
                assert_eq!(retry_in, 0);
                assert_eq!(retry_at, T0 + 59_000);
            }
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn admin_mutators_touch_raw_state() {
        let limiter = limiter(10, 5);
        limiter.subtract_from_bucket("heidi", 4);
        // Created at capacity - 4 = 6
        assert!(limiter.consume_at("heidi", 6, T0).is_allowed());
        assert!(!limiter.consume_at("heidi", 1, T0).is_allowed());

        limiter.add_to_bucket("heidi", 3);
        assert!(limiter.consume_at("heidi", 3, T0).is_allowed());

        limiter.set_bucket_size("heidi", 1);
        assert!(limiter.consume_at("heidi", 1, T0).is_allowed());
        assert!(!limiter.consume_at("heidi", 1, T0).is_allowed());
    }

    #[tokio::test]
    async fn penalties_can_drive_a_bucket_negative() {
        let limiter = limiter(10, 5);
        assert!(limiter.consume_at("ivan", 10, T0).is_allowed());
        limiter.subtract_from_bucket("ivan", 5);
        match limiter.consume_at("ivan", 1, T0) {
            RateLimitResult::Limited { missing_tokens, .. } => assert_eq!(missing_tokens, 6),
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn sweep_reclaims_only_full_buckets() {
        let limiter = limiter(10, 5);
        assert!(limiter.consume_at("full", 2, T0).is_allowed());
        assert!(limiter.consume_at("drained", 10, T0).is_allowed());
        assert_eq!(limiter.tracked_keys(), 2);

        // One minute later "full" has refilled to capacity, "drained" to 5
        limiter.remove_full_at(T0 + 60_000);
        assert_eq!(limiter.tracked_keys(), 1);
        assert!(limiter.consume_at("drained", 5, T0 + 60_000).is_allowed());
    }

    #[tokio::test]
    async fn sweep_tolerates_inserts_racing_the_reclaim() {
        let limiter = limiter(5, 10);

        // Fresh keys keep arriving while the reclaim runs over the map
        let mut tasks = Vec::new();
        for i in 0..8 {
            let writer = limiter.clone();
            tasks.push(tokio::spawn(async move {
                for j in 0..50 {
                    writer.consume_at(&format!("key-{i}-{j}"), 5, T0);
                    tokio::task::yield_now().await;
                }
            }));
        }
        for _ in 0..50 {
            limiter.remove_full_at(T0 + 60_000);
            tokio::task::yield_now().await;
        }
        for task in tasks {
            task.await.unwrap();
        }

        // One cycle refills every bucket to capacity, so a final pass
        // reclaims the lot
        limiter.remove_full_at(T0 + 60_000);
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let limiter = limiter(10, 5);
        limiter.dispose();
        limiter.dispose();
    }
}
