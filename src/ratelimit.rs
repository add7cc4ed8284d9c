//! Sliding-window limiter for outbound forecast requests.
//!
//! Keeps the timestamps of the last `permits` admitted requests. A request is
//! admitted iff fewer than `permits` of them fall inside `(now - window, now]`.

use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct RateLimiter {
    permits: usize,
    window_ms: u64,
    stamps: VecDeque<u64>,
}

impl RateLimiter {
    pub fn new(permits: usize, window_ms: u64) -> Self {
        Self {
            permits,
            window_ms,
            stamps: VecDeque::with_capacity(permits),
        }
    }

    pub fn allow_at(&self, now: u64) -> bool {
        if self.stamps.len() < self.permits {
            return true;
        }
        self.stamps
            .front()
            .is_some_and(|&oldest| oldest + self.window_ms <= now)
    }

    /// Appends `now`; the oldest stamp is shifted out when at capacity.
    pub fn record_at(&mut self, now: u64) {
        if self.stamps.len() == self.permits {
            self.stamps.pop_front();
        }
        self.stamps.push_back(now);
    }

    /// Requests inside the window ending at `now`.
    pub fn in_window(&self, now: u64) -> usize {
        self.stamps
            .iter()
            .filter(|&&t| t + self.window_ms > now)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_the_permit_count() {
        let mut rl = RateLimiter::new(30, 60_000);
        for i in 0..30 {
            assert!(rl.allow_at(1_000 + i));
            rl.record_at(1_000 + i);
        }
        assert!(!rl.allow_at(1_030));
        assert_eq!(rl.in_window(1_030), 30);
    }

    #[test]
    fn oldest_stamp_expires_after_the_window() {
        let mut rl = RateLimiter::new(3, 60_000);
        rl.record_at(0);
        rl.record_at(10);
        rl.record_at(20);
        assert!(!rl.allow_at(59_999));
        assert!(rl.allow_at(60_000));
        rl.record_at(60_000);
        assert!(!rl.allow_at(60_005));
        assert!(rl.allow_at(60_010));
    }

    #[test]
    fn never_more_than_permits_in_any_window() {
        let mut rl = RateLimiter::new(5, 1_000);
        let mut admitted = Vec::new();
        for now in (0..10_000).step_by(37) {
            if rl.allow_at(now) {
                rl.record_at(now);
                admitted.push(now);
            }
        }
        for &start in &admitted {
            let inside = admitted.iter().filter(|&&t| t >= start && t < start + 1_000).count();
            assert!(inside <= 5, "window at {start} admitted {inside}");
        }
    }
}
