//! Per-user token buckets with periodic idle cleanup.
//!
//! The queue only does bookkeeping here (`touch`/`release` around a
//! task's lifetime, `take` for callers enforcing request budgets); the
//! sweeper reclaims buckets idle past their TTL. A bucket with
//! outstanding tasks is never reclaimed.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use runtime::config::QueueConfig;
use tokio::time::MissedTickBehavior;

use crate::analytics::{Action, Analytics};
use crate::clock::Clock;
use crate::lifecycle::{Lifecycle, LifecycleError};

#[derive(Debug, Clone)]
struct UserBucket {
    tokens: f64,
    last_refill: Duration,
    last_touched: Duration,
    outstanding: u32,
}

pub struct RateLimiter {
    buckets: DashMap<Arc<str>, UserBucket>,
    refill_per_sec: f64,
    burst: f64,
    idle_ttl: Duration,
    sweep_interval: Duration,
    clock: Clock,
    analytics: Analytics,
    lifecycle: Lifecycle,
}

impl RateLimiter {
    pub(crate) fn new(cfg: &QueueConfig, clock: Clock, analytics: Analytics) -> Arc<Self> {
        Arc::new(Self {
            buckets: DashMap::new(),
            refill_per_sec: cfg.rate_limiter_refill_per_sec,
            burst: cfg.rate_limiter_burst,
            idle_ttl: Duration::from_millis(cfg.rate_limiter_idle_ttl_ms),
            sweep_interval: Duration::from_millis(cfg.rate_limiter_sweep_interval_ms),
            clock,
            analytics,
            lifecycle: Lifecycle::new(),
        })
    }

    /// Refill-and-spend. Returns false when the user's bucket cannot
    /// cover `cost` right now.
    pub fn take(&self, user_id: &str, cost: f64) -> bool {
        let now = self.clock.monotonic_now();
        let mut bucket = self
            .buckets
            .entry(Arc::from(user_id))
            .or_insert_with(|| UserBucket {
                tokens: self.burst,
                last_refill: now,
                last_touched: now,
                outstanding: 0,
            });

        let elapsed = now.saturating_sub(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.burst);
        bucket.last_refill = now;
        bucket.last_touched = now;

        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Admission bookkeeping: one more task in flight for this user.
    pub(crate) fn touch(&self, user_id: &str) {
        let now = self.clock.monotonic_now();
        let mut bucket = self
            .buckets
            .entry(Arc::from(user_id))
            .or_insert_with(|| UserBucket {
                tokens: self.burst,
                last_refill: now,
                last_touched: now,
                outstanding: 0,
            });
        bucket.outstanding += 1;
        bucket.last_touched = now;
    }

    /// Terminal bookkeeping: one task finished for this user.
    pub(crate) fn release(&self, user_id: &str) {
        if let Some(mut bucket) = self.buckets.get_mut(user_id) {
            bucket.outstanding = bucket.outstanding.saturating_sub(1);
            bucket.last_touched = self.clock.monotonic_now();
        }
    }

    /// Start the background sweeper. Returns false (and emits a
    /// `rate_limiter_cleanup_restart_noop` event) when it is already
    /// running.
    pub fn restart(self: &Arc<Self>) -> bool {
        let this = self.clone();
        match self.lifecycle.start(move |cancel| async move {
            let mut interval = tokio::time::interval(this.sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => { this.sweep(); }
                    _ = cancel.cancelled() => break,
                }
            }
            Ok(())
        }) {
            Ok(()) => true,
            Err(LifecycleError::AlreadyStarted) => {
                tracing::debug!("rate limiter cleanup already running");
                self.analytics
                    .emit(self.analytics.event(Action::RateLimiterCleanupRestartNoop));
                false
            }
        }
    }

    /// Remove buckets idle past the TTL. Buckets with outstanding
    /// tasks always survive.
    pub(crate) fn sweep(&self) -> usize {
        let now = self.clock.monotonic_now();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            bucket.outstanding > 0 || now.saturating_sub(bucket.last_touched) < self.idle_ttl
        });
        let removed = before - self.buckets.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = self.buckets.len(), "rate limiter sweep");
        }
        removed
    }

    pub(crate) async fn stop(&self, timeout: Duration) {
        let _ = self.lifecycle.stop(timeout).await;
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[cfg(test)]
    fn outstanding(&self, user_id: &str) -> Option<u32> {
        self.buckets.get(user_id).map(|b| b.outstanding)
    }
}
