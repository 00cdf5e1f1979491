//! Exponential backoff schedule for retried requests.
//!
//! A schedule starts at its minimum delay, doubles on every failure up to a
//! cap, and snaps back to the minimum on success. The config-fetch path uses
//! a 1s..8s schedule, the long-poll path 1s..120s.

use std::time::Duration;

/// Exponential-with-cap delay schedule, reset on success.
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl BackoffSchedule {
    pub fn new(min: Duration, max: Duration) -> Self {
        let min = min.max(Duration::from_millis(1));
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    /// Returns the delay to sleep for this failure, then doubles the next
    /// one (capped).
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Snaps the schedule back to its minimum.
    pub fn on_success(&mut self) {
        self.current = self.min;
    }

    /// The delay the next failure would incur, without advancing the schedule.
    pub fn current(&self) -> Duration {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_until_cap() {
        let mut schedule = BackoffSchedule::new(Duration::from_secs(1), Duration::from_secs(8));

        let expected = [1, 2, 4, 8, 8, 8];
        for secs in expected {
            assert_eq!(schedule.next_delay(), Duration::from_secs(secs));
        }
    }

    #[test]
    fn test_success_resets_to_min() {
        let mut schedule = BackoffSchedule::new(Duration::from_secs(1), Duration::from_secs(120));
        schedule.next_delay();
        schedule.next_delay();
        assert_eq!(schedule.current(), Duration::from_secs(4));

        schedule.on_success();
        assert_eq!(schedule.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_max_never_below_min() {
        let mut schedule = BackoffSchedule::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(schedule.next_delay(), Duration::from_secs(5));
        assert_eq!(schedule.next_delay(), Duration::from_secs(5));
    }
}
