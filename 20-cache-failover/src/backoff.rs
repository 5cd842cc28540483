use std::time::Duration;

use rand::Rng;

use crate::config::ClientConfig;

/// Reconnect cooldown schedule.
///
/// The delay grows by `factor` for every consecutive reconnect episode that
/// did not end in a successful request, and always lands inside
/// `[min_timeout, max_timeout]`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    factor: f64,
    min: Duration,
    max: Duration,
    randomize: bool,
}

impl Backoff {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            base: config.reconnect,
            factor: config.factor,
            min: config.min_timeout,
            max: config.max_timeout,
            randomize: config.randomize,
        }
    }

    pub fn delay(&self, episode: u32) -> Duration {
        let exponent = i32::try_from(episode).unwrap_or(i32::MAX);
        let mut millis = self.base.as_millis() as f64 * self.factor.powi(exponent);
        if millis.is_nan() {
            // zero base times an overflowed factor
            millis = 0.0;
        }
        if self.randomize {
            millis *= rand::thread_rng().gen_range(1.0..2.0);
        }

        let min = self.min.as_millis() as f64;
        let max = self.max.as_millis() as f64;
        Duration::from_millis(millis.clamp(min, max) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(reconnect: u64, min: u64, max: u64) -> Backoff {
        Backoff::from_config(&ClientConfig {
            reconnect: Duration::from_millis(reconnect),
            min_timeout: Duration::from_millis(min),
            max_timeout: Duration::from_millis(max),
            factor: 2.0,
            ..ClientConfig::default()
        })
    }

    #[test]
    fn first_episode_uses_the_base_delay() {
        assert_eq!(backoff(100, 0, 1_000).delay(0), Duration::from_millis(100));
    }

    #[test]
    fn later_episodes_grow_until_capped() {
        let backoff = backoff(100, 0, 1_000);
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(4), Duration::from_millis(1_000));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn short_base_is_raised_to_the_minimum() {
        assert_eq!(backoff(10, 50, 1_000).delay(0), Duration::from_millis(50));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut backoff = backoff(100, 0, 150);
        backoff.randomize = true;
        for _ in 0..100 {
            let delay = backoff.delay(0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }
}
