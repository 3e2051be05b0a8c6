use core::time::Duration;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::time::Instant;

/// Rolling-window limiter on lease starts, shared by every worker in a pool.
///
/// Holds the start instants of the last `max` acquisitions; a new acquisition
/// succeeds once the oldest of them has left the window.
#[derive(Debug)]
pub struct RateWindow {
    max: usize,
    window: Duration,
    starts: Mutex<VecDeque<Instant>>,
}

impl RateWindow {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            max,
            window,
            starts: Mutex::new(VecDeque::with_capacity(max)),
        }
    }

    /// Takes a slot and returns its start instant, or returns how long to wait
    /// before one frees up.
    pub fn try_acquire(&self) -> Result<Instant, Duration> {
        let now = Instant::now();
        let mut starts = self.starts.lock();
        while starts
            .front()
            .is_some_and(|&start| start + self.window <= now)
        {
            starts.pop_front();
        }

        if starts.len() < self.max {
            starts.push_back(now);
            return Ok(now);
        }
        let oldest = starts.front().copied().unwrap_or(now);
        Err((oldest + self.window).saturating_duration_since(now))
    }

    /// Gives back the slot taken at `start`, for an acquisition that found no
    /// work. Slots taken by other acquisitions are left in place.
    pub fn release(&self, start: Instant) {
        let mut starts = self.starts.lock();
        if let Some(pos) = starts.iter().rposition(|&s| s == start) {
            starts.remove(pos);
        }
    }

    /// Slots currently taken within the window.
    pub fn in_window(&self) -> usize {
        let now = Instant::now();
        self.starts
            .lock()
            .iter()
            .filter(|&&start| start + self.window > now)
            .count()
    }
}
