//! Per-key sliding-window rate limiting.
//!
//! Three independent windows — minute, hour, day — are checked together
//! for every request. A counter is keyed on (key, window) and covers the
//! current bucket; the reset moment is the bucket end, which is what the
//! `X-RateLimit-Reset-*` headers carry. The in-memory counters are
//! infallible; were they ever backed by an external store, increment
//! failures fail open at the middleware (auth already gates traffic).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::queue::{Clock, SystemClock};

// ---------------------------------------------------------------------------
// Windows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateWindow {
    Minute,
    Hour,
    Day,
}

impl RateWindow {
    pub fn seconds(&self) -> i64 {
        match self {
            RateWindow::Minute => 60,
            RateWindow::Hour => 3600,
            RateWindow::Day => 86_400,
        }
    }

    /// Lowercase label used in error payloads (`window: minute`).
    pub fn label(&self) -> &'static str {
        match self {
            RateWindow::Minute => "minute",
            RateWindow::Hour => "hour",
            RateWindow::Day => "day",
        }
    }

    /// Capitalised suffix for `X-RateLimit-*-<Window>` headers.
    pub fn header_suffix(&self) -> &'static str {
        match self {
            RateWindow::Minute => "Minute",
            RateWindow::Hour => "Hour",
            RateWindow::Day => "Day",
        }
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Per-window state after a check, for response headers.
#[derive(Debug, Clone)]
pub struct WindowState {
    pub window: RateWindow,
    pub limit: u32,
    pub remaining: u32,
    /// Unix seconds when the bucket resets.
    pub reset_unix: i64,
}

/// Outcome of one rate-limit check.
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// The violated window with the soonest reset, when rejected.
    pub violated: Option<RateWindow>,
    pub retry_after_secs: u64,
    pub windows: Vec<WindowState>,
}

// ---------------------------------------------------------------------------
// Limiter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Bucket {
    start_unix: i64,
    count: u32,
}

/// In-memory bucketed counters per (key, window).
pub struct SlidingWindowLimiter {
    clock: Arc<dyn Clock>,
    counters: Mutex<HashMap<(String, RateWindow), Bucket>>,
}

impl SlidingWindowLimiter {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Check all three windows for `key`; increment them only when every
    /// one permits. Quotas are (minute, hour, day) limits.
    pub fn check_and_increment(
        &self,
        key: &str,
        quota_per_minute: u32,
        quota_per_hour: u32,
        quota_per_day: u32,
    ) -> RateLimitDecision {
        let now_unix = self.clock.now().timestamp();
        let quotas = [
            (RateWindow::Minute, quota_per_minute),
            (RateWindow::Hour, quota_per_hour),
            (RateWindow::Day, quota_per_day),
        ];

        let mut counters = self.counters.lock().unwrap();
        let mut windows = Vec::with_capacity(3);
        let mut violated: Option<(RateWindow, i64)> = None;

        for (window, limit) in quotas {
            let bucket_start = now_unix - now_unix.rem_euclid(window.seconds());
            let entry = counters
                .entry((key.to_string(), window))
                .or_insert(Bucket {
                    start_unix: bucket_start,
                    count: 0,
                });
            if entry.start_unix != bucket_start {
                entry.start_unix = bucket_start;
                entry.count = 0;
            }

            let reset_unix = bucket_start + window.seconds();
            if entry.count >= limit {
                let until_reset = reset_unix - now_unix;
                match violated {
                    Some((_, best)) if best <= until_reset => {}
                    _ => violated = Some((window, until_reset)),
                }
            }
            windows.push(WindowState {
                window,
                limit,
                remaining: limit.saturating_sub(entry.count),
                reset_unix,
            });
        }

        if let Some((window, until_reset)) = violated {
            return RateLimitDecision {
                allowed: false,
                violated: Some(window),
                retry_after_secs: until_reset.max(1) as u64,
                windows,
            };
        }

        // Permitted: count the request against every window.
        for (window, limit) in quotas {
            if let Some(entry) = counters.get_mut(&(key.to_string(), window)) {
                entry.count += 1;
                if let Some(state) = windows.iter_mut().find(|w| w.window == window) {
                    state.remaining = limit.saturating_sub(entry.count);
                }
            }
        }

        RateLimitDecision {
            allowed: true,
            violated: None,
            retry_after_secs: 0,
            windows,
        }
    }

    /// Simplified single-window check for unauthenticated per-IP limits.
    pub fn check_ip(&self, ip: &str, per_minute: u32) -> RateLimitDecision {
        self.check_and_increment(&format!("ip:{ip}"), per_minute, u32::MAX, u32::MAX)
    }

    /// Drop buckets older than a day — stale keys stop costing memory.
    pub fn prune(&self) {
        let now_unix = self.clock.now().timestamp();
        let mut counters = self.counters.lock().unwrap();
        counters.retain(|(_, window), bucket| {
            now_unix - bucket.start_unix < window.seconds() * 2
        });
    }

    pub fn tracked_keys(&self) -> usize {
        self.counters.lock().unwrap().len()
    }
}

impl Default for SlidingWindowLimiter {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
