//! `ReconnectionPolicy`: produces the backoff schedule a `HostPool`
//! retries a Defunct Connection's slot on.

use std::time::Duration;

pub trait ReconnectionPolicy: Send + Sync {
    fn new_schedule(&self) -> Box<dyn Iterator<Item = Duration> + Send>;
}

#[derive(Debug, Clone, Copy)]
pub struct ConstantReconnectionPolicy {
    pub delay: Duration,
}

impl ConstantReconnectionPolicy {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl ReconnectionPolicy for ConstantReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        Box::new(std::iter::repeat(self.delay))
    }
}

/// Doubles the delay each attempt up to `max_delay`, with optional
/// jitter (see `DESIGN.md` for why this crate implements it without a
/// `rand` dependency).
#[derive(Debug, Clone, Copy)]
pub struct ExponentialReconnectionPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl ExponentialReconnectionPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, jitter: bool) -> Self {
        Self { base_delay, max_delay, jitter }
    }
}

impl ReconnectionPolicy for ExponentialReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        Box::new(ExponentialSchedule { base: self.base_delay, max: self.max_delay, jitter: self.jitter, attempt: 0 })
    }
}

struct ExponentialSchedule {
    base: Duration,
    max: Duration,
    jitter: bool,
    attempt: u32,
}

impl Iterator for ExponentialSchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let factor = 1u64 << self.attempt.min(20);
        self.attempt = self.attempt.saturating_add(1);
        let delay = self.base.saturating_mul(factor as u32).min(self.max);
        if !self.jitter {
            return Some(delay);
        }
        // Deterministic, dependency-free jitter keyed off the attempt
        // counter: spreads reconnection storms across a cluster without
        // pulling `rand` into the ambient stack for one call site.
        let salt = ((self.attempt.wrapping_mul(2654435761)) % 1000) as f64 / 1000.0;
        let scaled = delay.as_secs_f64() * (0.85 + 0.3 * salt);
        Some(Duration::from_secs_f64(scaled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_schedule_never_changes() {
        let policy = ConstantReconnectionPolicy::new(Duration::from_millis(100));
        let delays: Vec<_> = policy.new_schedule().take(3).collect();
        assert_eq!(delays, vec![Duration::from_millis(100); 3]);
    }

    #[test]
    fn exponential_schedule_grows_and_caps() {
        let policy = ExponentialReconnectionPolicy::new(Duration::from_millis(100), Duration::from_secs(2), false);
        let delays: Vec<_> = policy.new_schedule().take(6).collect();
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[2], Duration::from_millis(400));
        assert!(delays[5] <= Duration::from_secs(2));
    }

    #[test]
    fn jitter_stays_within_the_documented_band() {
        let policy = ExponentialReconnectionPolicy::new(Duration::from_millis(1000), Duration::from_secs(60), true);
        // Only the first, un-capped attempt has a known base to check the
        // 0.85x-1.15x band against; later attempts may be scaled off the
        // `max_delay` cap instead.
        let first = policy.new_schedule().next().unwrap();
        assert!(first >= Duration::from_millis(850));
        assert!(first <= Duration::from_millis(1150));
    }
}
