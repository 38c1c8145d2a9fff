//! Per-user dual sliding-window rate limiter (minute + day).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::debug;

const MINUTE_WINDOW: Duration = Duration::from_secs(60);
const DAY_WINDOW: Duration = Duration::from_secs(86_400);

/// Read-only snapshot handed to the turn before the runner is invoked.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitStatus {
    pub allowed: bool,
    pub minute_remaining: u32,
    pub day_remaining: u32,
    pub reset_minute: DateTime<Utc>,
    pub reset_day: DateTime<Utc>,
}

#[derive(Clone)]
pub struct RateLimiter {
    per_minute: u32,
    per_day: u32,
    buckets: Arc<Mutex<HashMap<String, UserWindows>>>,
}

#[derive(Default)]
struct UserWindows {
    minute: VecDeque<Instant>,
    day: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(per_minute: u32, per_day: u32) -> Self {
        Self {
            per_minute,
            per_day,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Consume one request slot if both windows have capacity.
    pub fn check(&self, user_id: &str) -> RateLimitStatus {
        self.check_at(user_id, Instant::now())
    }

    fn check_at(&self, user_id: &str, now: Instant) -> RateLimitStatus {
        let mut buckets = self.lock();
        let windows = buckets.entry(user_id.to_string()).or_default();
        prune(&mut windows.minute, now, MINUTE_WINDOW);
        prune(&mut windows.day, now, DAY_WINDOW);

        let allowed = (windows.minute.len() as u32) < self.per_minute
            && (windows.day.len() as u32) < self.per_day;
        if allowed {
            windows.minute.push_back(now);
            windows.day.push_back(now);
        }

        self.status(windows, now, allowed)
    }

    /// Non-consuming view, for display routes.
    pub fn snapshot(&self, user_id: &str) -> RateLimitStatus {
        self.snapshot_at(user_id, Instant::now())
    }

    fn snapshot_at(&self, user_id: &str, now: Instant) -> RateLimitStatus {
        let mut buckets = self.lock();
        let windows = buckets.entry(user_id.to_string()).or_default();
        prune(&mut windows.minute, now, MINUTE_WINDOW);
        prune(&mut windows.day, now, DAY_WINDOW);

        let allowed = (windows.minute.len() as u32) < self.per_minute
            && (windows.day.len() as u32) < self.per_day;
        self.status(windows, now, allowed)
    }

    fn status(&self, windows: &UserWindows, now: Instant, allowed: bool) -> RateLimitStatus {
        RateLimitStatus {
            allowed,
            minute_remaining: self.per_minute.saturating_sub(windows.minute.len() as u32),
            day_remaining: self.per_day.saturating_sub(windows.day.len() as u32),
            reset_minute: reset_time(windows.minute.front(), now, MINUTE_WINDOW),
            reset_day: reset_time(windows.day.front(), now, DAY_WINDOW),
        }
    }

    /// Periodically drop users whose windows have fully drained.
    pub fn spawn_pruner(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let buckets = Arc::clone(&self.buckets);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let mut buckets = buckets
                    .lock()
                    .expect("rate limiter mutex should not be poisoned");
                buckets.retain(|_, windows| {
                    prune(&mut windows.minute, now, MINUTE_WINDOW);
                    prune(&mut windows.day, now, DAY_WINDOW);
                    !windows.minute.is_empty() || !windows.day.is_empty()
                });
                debug!(users = buckets.len(), "Rate limiter pruned");
            }
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, UserWindows>> {
        self.buckets
            .lock()
            .expect("rate limiter mutex should not be poisoned")
    }
}

fn prune(bucket: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    let cutoff = now.checked_sub(window).unwrap_or(now);
    while let Some(front) = bucket.front() {
        if *front <= cutoff {
            bucket.pop_front();
        } else {
            break;
        }
    }
}

fn reset_time(front: Option<&Instant>, now: Instant, window: Duration) -> DateTime<Utc> {
    match front {
        Some(first) => {
            let elapsed = now.saturating_duration_since(*first);
            let until_reset = window.saturating_sub(elapsed);
            Utc::now() + chrono::Duration::from_std(until_reset).unwrap_or_default()
        }
        None => Utc::now(),
    }
}
