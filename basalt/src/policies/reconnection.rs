//! Reconnection policies produce the schedule of delays between successive
//! attempts to reconnect to a node that is down.

use std::time::Duration;

/// Creates per-node [ReconnectionSchedule]s.
pub trait ReconnectionPolicy: std::fmt::Debug + Send + Sync {
    /// Starts a fresh schedule; called when a node transitions to down.
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule + Send>;
}

/// The sequence of delays between reconnection attempts of one node.
pub trait ReconnectionSchedule {
    /// The delay to wait before the next attempt.
    fn next_delay(&mut self) -> Duration;
}

/// Waits a constant delay between reconnection attempts.
#[derive(Debug, Clone)]
pub struct ConstantReconnectionPolicy {
    delay: Duration,
}

impl ConstantReconnectionPolicy {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for ConstantReconnectionPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl ReconnectionPolicy for ConstantReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule + Send> {
        Box::new(ConstantReconnectionSchedule { delay: self.delay })
    }
}

struct ConstantReconnectionSchedule {
    delay: Duration,
}

impl ReconnectionSchedule for ConstantReconnectionSchedule {
    fn next_delay(&mut self) -> Duration {
        self.delay
    }
}

/// Doubles the delay after every attempt, saturating at a maximum.
#[derive(Debug, Clone)]
pub struct ExponentialReconnectionPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl ExponentialReconnectionPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }
}

impl Default for ExponentialReconnectionPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(10 * 60))
    }
}

impl ReconnectionPolicy for ExponentialReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule + Send> {
        Box::new(ExponentialReconnectionSchedule {
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            attempt: 0,
        })
    }
}

struct ExponentialReconnectionSchedule {
    base_delay: Duration,
    max_delay: Duration,
    attempt: u32,
}

impl ReconnectionSchedule for ExponentialReconnectionSchedule {
    fn next_delay(&mut self) -> Duration {
        let delay = self
            .base_delay
            .checked_mul(1u32.checked_shl(self.attempt).unwrap_or(u32::MAX))
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        if delay < self.max_delay {
            self.attempt += 1;
        }
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_schedule_repeats_delay() {
        let policy = ConstantReconnectionPolicy::new(Duration::from_millis(250));
        let mut schedule = policy.new_schedule();
        for _ in 0..5 {
            assert_eq!(schedule.next_delay(), Duration::from_millis(250));
        }
    }

    #[test]
    fn exponential_schedule_doubles_and_saturates() {
        let policy =
            ExponentialReconnectionPolicy::new(Duration::from_secs(1), Duration::from_secs(8));
        let mut schedule = policy.new_schedule();
        assert_eq!(schedule.next_delay(), Duration::from_secs(1));
        assert_eq!(schedule.next_delay(), Duration::from_secs(2));
        assert_eq!(schedule.next_delay(), Duration::from_secs(4));
        assert_eq!(schedule.next_delay(), Duration::from_secs(8));
        // Saturated.
        assert_eq!(schedule.next_delay(), Duration::from_secs(8));
        assert_eq!(schedule.next_delay(), Duration::from_secs(8));
    }

    #[test]
    fn exponential_schedules_are_independent() {
        let policy =
            ExponentialReconnectionPolicy::new(Duration::from_secs(1), Duration::from_secs(60));
        let mut first = policy.new_schedule();
        first.next_delay();
        first.next_delay();

        let mut second = policy.new_schedule();
        assert_eq!(second.next_delay(), Duration::from_secs(1));
    }
}
