//! Rate-Limit Accountant (spec §4.6): a fixed-window request budget for
//! the primary CDN speed-test endpoint, with 429/403 detection and
//! failover to a mirror host.
//!
//! Per the design note in spec §9, the budget becomes an owned
//! `RateBudget` (see `model.rs`) behind a single writer; speed workers
//! call [`RateLimiter::acquire`] and block until admitted, rather than
//! reading/writing module-level counters directly.

use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tokio::time::sleep;

use crate::model::{RateBudget, Via};

const CONSECUTIVE_429_WINDOW: Duration = Duration::from_secs(30);
const DEFAULT_429_RETRY: Duration = Duration::from_secs(60);
const MIRROR_FAILBACK_STREAK: u32 = 3;

pub struct RateLimiter {
    budget: Mutex<RateBudget>,
    notify: Notify,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            budget: Mutex::new(RateBudget::default()),
            notify: Notify::new(),
        }
    }

    /// Decide whether the next request should go direct or via mirror,
    /// blocking until the window has room if going direct (spec §4.6,
    /// §8's rate-budget-safety property).
    pub async fn acquire(&self) -> Via {
        loop {
            let wait = {
                let mut budget = self.budget.lock().await;
                prune_and_maybe_failback(&mut budget);

                if budget.using_mirror || budget.paused_until.is_some_and(|until| Instant::now() < until) {
                    return Via::Mirror;
                }

                let now = Instant::now();
                let window_start = now - budget.window_len;
                budget.timestamps.retain(|ts| *ts > window_start);

                if budget.timestamps.len() < budget.capacity {
                    budget.timestamps.push_back(now);
                    return Via::Direct;
                }

                // Window full: wait until the oldest timestamp ages out.
                budget
                    .timestamps
                    .front()
                    .map(|oldest| (*oldest + budget.window_len).saturating_duration_since(now))
                    .unwrap_or(Duration::from_millis(50))
            };

            tokio::select! {
                () = sleep(wait) => {}
                () = self.notify.notified() => {}
            }
        }
    }

    /// Record a successful request. Direct successes don't change budget
    /// state beyond the timestamp already recorded by `acquire`; mirror
    /// successes feed the fail-back streak.
    pub async fn record_success(&self, via: Via) {
        if via == Via::Mirror {
            self.record_mirror_result(true).await;
        }
    }

    /// Record a `429` response: pause direct requests and, after two
    /// within 30s, switch to the mirror until fail-back conditions hold
    /// (spec §4.6).
    pub async fn record_rate_limited(&self, retry_after: Option<Duration>) {
        let mut budget = self.budget.lock().await;
        let now = Instant::now();
        let retry = retry_after.unwrap_or(DEFAULT_429_RETRY);
        budget.paused_until = Some(now + retry);

        let window_start = now - CONSECUTIVE_429_WINDOW;
        budget.consecutive_429s.retain(|ts| *ts > window_start);
        budget.consecutive_429s.push_back(now);
        if budget.consecutive_429s.len() >= 2 {
            budget.using_mirror = true;
        }
        drop(budget);
        self.notify.notify_waiters();
    }

    /// Record the outcome of a request sent via the mirror, for fail-back
    /// accounting (spec §4.6: "resume direct after ... the last three
    /// mirror requests succeeded").
    pub async fn record_mirror_result(&self, success: bool) {
        let mut budget = self.budget.lock().await;
        if success {
            budget.consecutive_mirror_successes =
                (budget.consecutive_mirror_successes + 1).min(MIRROR_FAILBACK_STREAK);
        } else {
            budget.consecutive_mirror_successes = 0;
        }
        prune_and_maybe_failback(&mut budget);
    }

    /// Remaining pause duration, for UI countdown display (spec §4.6).
    pub async fn countdown(&self) -> Option<Duration> {
        let budget = self.budget.lock().await;
        budget
            .paused_until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .filter(|remaining| !remaining.is_zero())
    }
}

/// Clear the pause/mirror-failover state once fail-back conditions hold:
/// `paused_until` has elapsed AND the last three mirror requests
/// succeeded.
fn prune_and_maybe_failback(budget: &mut RateBudget) {
    let past_pause = budget.paused_until.is_none_or(|until| Instant::now() >= until);
    if budget.using_mirror && past_pause && budget.consecutive_mirror_successes >= MIRROR_FAILBACK_STREAK {
        budget.using_mirror = false;
        budget.paused_until = None;
        budget.consecutive_429s.clear();
        budget.consecutive_mirror_successes = 0;
        log::info!("rate-limit: failed back to direct requests");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_up_to_capacity_then_routes_via_mirror_after_pause() {
        let limiter = RateLimiter::new();
        limiter.record_rate_limited(Some(Duration::from_millis(10))).await;
        limiter.record_rate_limited(Some(Duration::from_millis(10))).await;
        assert_eq!(limiter.acquire().await, Via::Mirror);
    }

    #[tokio::test]
    async fn single_429_does_not_trigger_failover() {
        let limiter = RateLimiter::new();
        limiter.record_rate_limited(Some(Duration::from_millis(1))).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(limiter.acquire().await, Via::Direct);
    }

    #[tokio::test]
    async fn direct_requests_stay_under_capacity() {
        let limiter = RateLimiter::new();
        {
            let mut budget = limiter.budget.lock().await;
            budget.capacity = 3;
        }
        for _ in 0..3 {
            assert_eq!(limiter.acquire().await, Via::Direct);
        }
        let budget = limiter.budget.lock().await;
        assert_eq!(budget.timestamps.len(), 3);
    }
}
