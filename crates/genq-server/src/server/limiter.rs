//! Per-requester HTTP rate limiting.
//!
//! A [`RequestLimiter`] counts requests per key in fixed windows. The first
//! request of a key opens its window; once `max` requests have been counted,
//! further requests are rejected until the window ends.

use core::time::Duration;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Window {
    opened_at: Instant,
    count: u32,
}

#[derive(Debug)]
pub struct RequestLimiter {
    max: u32,
    window: Duration,
    windows: Mutex<HashMap<String, Window>>,
}

impl RequestLimiter {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Counts a request for `key`. Returns the time until the window resets
    /// if the limit has been reached.
    pub fn check(&self, key: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let window = windows.entry(key.to_string()).or_insert(Window {
            opened_at: now,
            count: 0,
        });
        if window.opened_at + self.window <= now {
            *window = Window {
                opened_at: now,
                count: 0,
            };
        }

        if window.count >= self.max {
            return Err((window.opened_at + self.window).saturating_duration_since(now));
        }
        window.count += 1;
        Ok(())
    }

    /// Forgets windows that have ended. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, w| w.opened_at + self.window > now);
        before - windows.len()
    }
}
