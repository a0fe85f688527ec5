//! Fixed-window request limiter keyed by caller identity.
//!
//! Expired windows are swept at most once per window length; a caller whose
//! own window expired is reset on its next request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::config::RateLimitConfig;

/// Result of [`RateLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed { remaining: u32 },
    /// Rejected until the current window closes.
    Limited { retry_after: Duration },
}

struct Windows {
    callers: HashMap<String, (Instant, u32)>,
    last_sweep: Instant,
}

#[derive(Clone)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    windows: Arc<Mutex<Windows>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: Arc::new(Mutex::new(Windows {
                callers: HashMap::new(),
                last_sweep: Instant::now(),
            })),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.requests, Duration::from_secs(config.window_secs))
    }

    pub async fn check(&self, key: &str) -> Decision {
        self.check_at(key, Instant::now()).await
    }

    async fn check_at(&self, key: &str, now: Instant) -> Decision {
        let mut windows = self.windows.lock().await;
        let window = self.window;
        if now.duration_since(windows.last_sweep) >= window {
            windows
                .callers
                .retain(|_, (started, _)| now.duration_since(*started) < window);
            windows.last_sweep = now;
        }

        let (started, count) = windows.callers.entry(key.to_string()).or_insert((now, 0));
        if now.duration_since(*started) >= window {
            *started = now;
            *count = 0;
        }
        if *count >= self.limit {
            let retry_after = window.saturating_sub(now.duration_since(*started));
            return Decision::Limited {
                retry_after: retry_after.max(Duration::from_secs(1)),
            };
        }
        *count += 1;
        Decision::Allowed {
            remaining: self.limit - *count,
        }
    }

    /// Number of callers with an open window.
    pub async fn tracked(&self) -> usize {
        self.windows.lock().await.callers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_over_limit_then_resets() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        let t0 = Instant::now();

        assert_eq!(
            limiter.check_at("1.2.3.4", t0).await,
            Decision::Allowed { remaining: 1 }
        );
        assert_eq!(
            limiter.check_at("1.2.3.4", t0).await,
            Decision::Allowed { remaining: 0 }
        );
        let Decision::Limited { retry_after } =
            limiter.check_at("1.2.3.4", t0 + Duration::from_secs(15)).await
        else {
            panic!("expected rejection");
        };
        assert_eq!(retry_after, Duration::from_secs(45));

        // other callers have their own window
        assert!(matches!(
            limiter.check_at("5.6.7.8", t0).await,
            Decision::Allowed { .. }
        ));

        assert_eq!(
            limiter.check_at("1.2.3.4", t0 + Duration::from_secs(61)).await,
            Decision::Allowed { remaining: 1 }
        );
    }

    #[tokio::test]
    async fn stale_windows_are_pruned() {
        let limiter = RateLimiter::new(5, Duration::from_secs(10));
        let t0 = Instant::now();
        limiter.check_at("a", t0).await;
        limiter.check_at("b", t0).await;
        assert_eq!(limiter.tracked().await, 2);

        limiter.check_at("c", t0 + Duration::from_secs(11)).await;
        assert_eq!(limiter.tracked().await, 1);
    }

    #[tokio::test]
    async fn sweep_runs_once_per_window() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10));
        let t0 = Instant::now();
        limiter.check_at("a", t0 + Duration::from_secs(1)).await;
        limiter.check_at("b", t0 + Duration::from_secs(10)).await;
        assert_eq!(limiter.tracked().await, 2);

        // "a" has expired but the next sweep is not due yet
        limiter.check_at("c", t0 + Duration::from_secs(12)).await;
        assert_eq!(limiter.tracked().await, 3);

        // an expired caller starts a fresh window without the sweep
        assert_eq!(
            limiter.check_at("a", t0 + Duration::from_secs(12)).await,
            Decision::Allowed { remaining: 0 }
        );
        assert_eq!(
            limiter.check_at("a", t0 + Duration::from_secs(13)).await,
            Decision::Limited {
                retry_after: Duration::from_secs(9)
            }
        );

        limiter.check_at("d", t0 + Duration::from_secs(20)).await;
        assert_eq!(limiter.tracked().await, 3);
    }
}
