//! Fixed-window cycle budget.

use std::time::{Duration, Instant};

/// Length of one budget window.
pub const WINDOW: Duration = Duration::from_secs(1);

/// Caps processed cycles to `budget` per one-second window.
///
/// The window restarts on the first check at least [`WINDOW`] after the
/// previous restart, so a slow loop never accumulates credit.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    window_start: Instant,
    count: u32,
    budget: u32,
}

impl RateLimiter {
    /// Creates a limiter whose first window starts now.
    pub fn new(budget: u32) -> Self {
        Self::starting_at(budget, Instant::now())
    }

    /// Creates a limiter whose first window starts at `start`.
    pub fn starting_at(budget: u32, start: Instant) -> Self {
        Self {
            window_start: start,
            count: 0,
            budget,
        }
    }

    /// Returns `true` and consumes one unit if the current window has budget.
    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    /// [`RateLimiter::allow`] with an explicit clock reading.
    pub fn allow_at(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.window_start) >= WINDOW {
            self.window_start = now;
            self.count = 0;
        }

        if self.count < self.budget {
            self.count += 1;
            true
        } else {
            false
        }
    }

    pub fn budget(&self) -> u32 {
        self.budget
    }

    /// Units consumed in the current window.
    pub fn count(&self) -> u32 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(1)]
    #[test_case(3)]
    #[test_case(6)]
    fn never_exceeds_budget_within_window(budget: u32) {
        let start = Instant::now();
        let mut limiter = RateLimiter::starting_at(budget, start);

        let allowed = (0..100u64)
            .filter(|i| limiter.allow_at(start + Duration::from_millis(i * 9)))
            .count();

        assert_eq!(allowed, budget as usize);
    }

    #[test]
    fn window_resets_at_one_second() {
        let start = Instant::now();
        let mut limiter = RateLimiter::starting_at(2, start);

        assert!(limiter.allow_at(start));
        assert!(limiter.allow_at(start + Duration::from_millis(10)));
        assert!(!limiter.allow_at(start + Duration::from_millis(999)));

        assert!(limiter.allow_at(start + WINDOW));
        assert_eq!(limiter.count(), 1);
    }

    #[test]
    fn zero_budget_never_allows() {
        let start = Instant::now();
        let mut limiter = RateLimiter::starting_at(0, start);
        assert!(!limiter.allow_at(start));
        assert!(!limiter.allow_at(start + WINDOW * 3));
    }

    #[test]
    fn earlier_instant_does_not_reset() {
        let start = Instant::now() + Duration::from_secs(5);
        let mut limiter = RateLimiter::starting_at(1, start);
        assert!(limiter.allow_at(start));
        assert!(!limiter.allow_at(Instant::now()));
    }
}
