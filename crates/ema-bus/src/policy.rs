//! Read pacing and shard failure handling.

use std::time::Duration;

use rand::Rng;

pub const DEFAULT_BATCH_LIMIT: usize = 100;
pub const DEFAULT_READ_DELAY_MEAN: Duration = Duration::from_millis(1100);
pub const DEFAULT_READ_DELAY_FUZZ: Duration = Duration::from_millis(600);
pub const DEFAULT_THROTTLE_COOLDOWN: Duration = Duration::from_millis(2000);
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// What a shard reader does after a non-throttling failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShardFailurePolicy {
    /// Stop reading the shard for the rest of the process lifetime.
    #[default]
    Stop,
    /// Re-open the shard at `Latest` after a doubling backoff.
    Reconnect {
        initial_backoff: Duration,
        max_backoff: Duration,
    },
}

#[derive(Debug, Clone)]
pub struct ReadPolicy {
    /// Records requested per read.
    pub batch_limit: usize,
    /// Centre of the pause between two reads of the same shard.
    pub read_delay_mean: Duration,
    /// Width of the uniform jitter around the mean (half on each side).
    pub read_delay_fuzz: Duration,
    /// Pause before retrying a throttled read with the same iterator.
    pub throttle_cooldown: Duration,
    /// Deliveries buffered between shard readers and the agent.
    pub channel_capacity: usize,
    pub on_failure: ShardFailurePolicy,
}

impl Default for ReadPolicy {
    fn default() -> Self {
        Self {
            batch_limit: DEFAULT_BATCH_LIMIT,
            read_delay_mean: DEFAULT_READ_DELAY_MEAN,
            read_delay_fuzz: DEFAULT_READ_DELAY_FUZZ,
            throttle_cooldown: DEFAULT_THROTTLE_COOLDOWN,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            on_failure: ShardFailurePolicy::Stop,
        }
    }
}

impl ReadPolicy {
    /// Pause before the next read: `mean ± fuzz/2`, drawn uniformly so that
    /// many readers drift apart instead of reading in lockstep.
    pub fn next_read_delay(&self) -> Duration {
        let mean = self.read_delay_mean.as_millis() as f64;
        let fuzz = self.read_delay_fuzz.as_millis() as f64;
        let offset = fuzz * (rand::rng().random::<f64>() - 0.5);
        Duration::from_millis((mean + offset).max(0.0) as u64)
    }
}

/// Doubling backoff used by [`ShardFailurePolicy::Reconnect`].
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; the following call returns twice as much, capped.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = std::cmp::min(self.current * 2, self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_delay_stays_within_jitter_bounds() {
        let policy = ReadPolicy::default();
        for _ in 0..1000 {
            let delay = policy.next_read_delay();
            assert!(delay >= Duration::from_millis(800), "{delay:?}");
            assert!(delay <= Duration::from_millis(1400), "{delay:?}");
        }
    }

    #[test]
    fn test_zero_fuzz_gives_fixed_delay() {
        let policy = ReadPolicy {
            read_delay_fuzz: Duration::ZERO,
            ..ReadPolicy::default()
        };
        assert_eq!(policy.next_read_delay(), Duration::from_millis(1100));
    }

    #[test]
    fn test_backoff_doubles_up_to_cap_and_resets() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }
}
