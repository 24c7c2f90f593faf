//! Per-pool rate limiting.
//!
//! A 60-second window with `rate_limit_per_minute` permits, backed by a
//! governor quota. Acquisition blocks up to a bounded budget, observes
//! cancellation from drain/shutdown, and the underlying limiter is
//! replaceable atomically so hot config updates apply to waiters already
//! parked in `acquire`.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use parking_lot::RwLock;
use tracing::{debug, info};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const PERMIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted,
    /// The budget elapsed without a permit becoming available.
    Exhausted,
    /// The pool started draining or shutting down while waiting.
    Cancelled,
}

pub struct PoolRateLimiter {
    limiter: RwLock<Option<Arc<DirectLimiter>>>,
    per_minute: RwLock<Option<u32>>,
}

impl PoolRateLimiter {
    pub fn new(per_minute: Option<u32>) -> Self {
        Self {
            limiter: RwLock::new(Self::build(per_minute)),
            per_minute: RwLock::new(per_minute.filter(|r| *r > 0)),
        }
    }

    fn build(per_minute: Option<u32>) -> Option<Arc<DirectLimiter>> {
        per_minute
            .and_then(NonZeroU32::new)
            .map(|rpm| Arc::new(RateLimiter::direct(Quota::per_minute(rpm))))
    }

    pub fn per_minute(&self) -> Option<u32> {
        *self.per_minute.read()
    }

    pub fn is_limited(&self) -> bool {
        self.limiter
            .read()
            .as_ref()
            .map(|rl| rl.check().is_err())
            .unwrap_or(false)
    }

    /// Swap the permit source atomically. A limit of 0 or None disables
    /// rate limiting; parked waiters observe the change on their next poll.
    pub fn replace(&self, per_minute: Option<u32>) {
        let new_limit = per_minute.filter(|r| *r > 0);
        let old_limit = *self.per_minute.read();
        if new_limit == old_limit {
            return;
        }

        *self.limiter.write() = Self::build(new_limit);
        *self.per_minute.write() = new_limit;

        info!(old = ?old_limit, new = ?new_limit, "Rate limit replaced in-place");
    }

    /// Wait for a permit. Polls so that limiter replacement and removal are
    /// observed mid-wait; returns as soon as a permit is available, the
    /// budget runs out, or the cancellation flag flips.
    pub async fn acquire(&self, budget: Duration, cancelled: &AtomicBool) -> AcquireOutcome {
        let deadline = Instant::now() + budget;
        let mut logged = false;

        loop {
            // An available permit (or no limiter at all) is granted even
            // mid-drain; only the blocked wait is cancellable.
            let limiter = self.limiter.read().clone();
            match limiter {
                None => return AcquireOutcome::Granted,
                Some(rl) if rl.check().is_ok() => return AcquireOutcome::Granted,
                Some(_) => {
                    if !logged {
                        debug!("Rate limited, waiting for permit");
                        logged = true;
                    }
                }
            }

            if cancelled.load(Ordering::SeqCst) {
                return AcquireOutcome::Cancelled;
            }
            if Instant::now() >= deadline {
                return AcquireOutcome::Exhausted;
            }
            tokio::time::sleep(PERMIT_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_grants_immediately() {
        let limiter = PoolRateLimiter::new(None);
        let cancelled = AtomicBool::new(false);
        assert_eq!(
            limiter.acquire(Duration::from_millis(10), &cancelled).await,
            AcquireOutcome::Granted
        );
        assert_eq!(limiter.per_minute(), None);
    }

    #[tokio::test]
    async fn exhausts_budget_when_window_is_spent() {
        // One permit per minute: the first acquire wins, the second cannot.
        let limiter = PoolRateLimiter::new(Some(1));
        let cancelled = AtomicBool::new(false);

        assert_eq!(
            limiter.acquire(Duration::from_millis(10), &cancelled).await,
            AcquireOutcome::Granted
        );
        assert_eq!(
            limiter.acquire(Duration::from_millis(150), &cancelled).await,
            AcquireOutcome::Exhausted
        );
    }

    #[tokio::test]
    async fn cancellation_interrupts_wait() {
        let limiter = Arc::new(PoolRateLimiter::new(Some(1)));
        let cancelled = Arc::new(AtomicBool::new(false));

        let _ = limiter
            .acquire(Duration::from_millis(10), &cancelled)
            .await;

        let waiter = {
            let limiter = limiter.clone();
            let cancelled = cancelled.clone();
            tokio::spawn(async move {
                limiter.acquire(Duration::from_secs(30), &cancelled).await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancelled.store(true, Ordering::SeqCst);

        let outcome = waiter.await.unwrap();
        assert_eq!(outcome, AcquireOutcome::Cancelled);
    }

    #[tokio::test]
    async fn replacement_unblocks_waiters() {
        let limiter = Arc::new(PoolRateLimiter::new(Some(1)));
        let cancelled = Arc::new(AtomicBool::new(false));

        let _ = limiter
            .acquire(Duration::from_millis(10), &cancelled)
            .await;

        let waiter = {
            let limiter = limiter.clone();
            let cancelled = cancelled.clone();
            tokio::spawn(async move {
                limiter.acquire(Duration::from_secs(30), &cancelled).await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        limiter.replace(None);

        let outcome = waiter.await.unwrap();
        assert_eq!(outcome, AcquireOutcome::Granted);
        assert_eq!(limiter.per_minute(), None);
    }

    #[test]
    fn zero_limit_disables() {
        let limiter = PoolRateLimiter::new(Some(0));
        assert_eq!(limiter.per_minute(), None);
        assert!(!limiter.is_limited());
    }
}
