//! Random backoff between lease attempts

use rand::Rng;
use std::time::Duration;

use pv_core::config::SupervisorConfig;

/// Uniformly random delay in a fixed `[min, max]` window.
///
/// Replicas starting together would otherwise retry in lock step and keep
/// conflicting on the controller record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RandomBackoff {
    min: Duration,
    max: Duration,
}

impl RandomBackoff {
    /// Create a backoff; bounds are swapped if given in the wrong order
    pub fn new(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    /// Create a backoff from the supervisor configuration
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self::new(config.backoff_min, config.backoff_max)
    }

    /// Pick the next delay, at millisecond granularity
    pub fn next_delay(&self) -> Duration {
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// Lower bound
    pub fn min(&self) -> Duration {
        self.min
    }

    /// Upper bound
    pub fn max(&self) -> Duration {
        self.max
    }
}

impl Default for RandomBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(20))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_within_bounds() {
        let backoff = RandomBackoff::default();
        for _ in 0..1000 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_secs(20));
        }
    }

    #[test]
    fn test_fixed_window() {
        let backoff = RandomBackoff::new(Duration::from_millis(5), Duration::from_millis(5));
        assert_eq!(backoff.next_delay(), Duration::from_millis(5));
    }

    #[test]
    fn test_swapped_bounds() {
        let backoff = RandomBackoff::new(Duration::from_secs(9), Duration::from_secs(3));
        assert_eq!(backoff.min(), Duration::from_secs(3));
        assert_eq!(backoff.max(), Duration::from_secs(9));
    }

    #[test]
    fn test_from_config() {
        let config = SupervisorConfig {
            backoff_min: Duration::from_secs(2),
            backoff_max: Duration::from_secs(4),
            ..Default::default()
        };
        let backoff = RandomBackoff::from_config(&config);
        assert_eq!(backoff.min(), Duration::from_secs(2));
        assert_eq!(backoff.max(), Duration::from_secs(4));
    }
}
