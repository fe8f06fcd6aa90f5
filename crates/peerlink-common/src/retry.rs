//! Exponential backoff with jitter.
//!
//! The stream manager backs off only after a full pass over the candidate
//! address list has failed, so the policy here is stateful: [`Backoff`]
//! remembers the last delay and is reset after a successful connection.
//!
//! # Example
//!
//! ```
//! use peerlink_common::retry::{Backoff, RetryConfig};
//! use std::time::Duration;
//!
//! let mut backoff = Backoff::new(RetryConfig {
//!     jitter: false,
//!     ..RetryConfig::default()
//! });
//! assert_eq!(backoff.next_delay(), Duration::from_millis(100));
//! assert_eq!(backoff.next_delay(), Duration::from_millis(200));
//! ```

use std::time::Duration;

use rand::Rng;

/// Configuration for reconnect backoff.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Whether to randomize each delay between 0.5x and 1.5x
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Stateful exponential backoff, capped at `max_delay`.
#[derive(Clone, Debug)]
pub struct Backoff {
    config: RetryConfig,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    /// Create a backoff starting at the configured initial delay
    pub fn new(config: RetryConfig) -> Self {
        let current = config.initial_delay;
        Self {
            config,
            current,
            attempts: 0,
        }
    }

    /// Delay to wait before the next attempt; advances the exponent
    pub fn next_delay(&mut self) -> Duration {
        self.attempts += 1;
        let base = self.current;

        // Exponential backoff, capped at max_delay
        self.current = Duration::from_secs_f64(
            (self.current.as_secs_f64() * self.config.backoff_multiplier)
                .min(self.config.max_delay.as_secs_f64()),
        );

        if self.config.jitter {
            // Add jitter: 0.5x to 1.5x of the delay
            let jitter = rand::thread_rng().gen_range(0.5..1.5);
            Duration::from_secs_f64(base.as_secs_f64() * jitter)
        } else {
            base
        }
    }

    /// Number of delays handed out since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Start over from the initial delay
    pub fn reset(&mut self) {
        self.current = self.config.initial_delay;
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_delay_doubles_until_cap() {
        let mut backoff = Backoff::new(no_jitter());
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40),
                Duration::from_millis(50),
                Duration::from_millis(50),
            ]
        );
        assert_eq!(backoff.attempts(), 5);
    }

    #[test]
    fn test_reset_returns_to_initial_delay() {
        let mut backoff = Backoff::new(no_jitter());
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut backoff = Backoff::new(RetryConfig {
            jitter: true,
            ..no_jitter()
        });
        let delay = backoff.next_delay();
        assert!(delay >= Duration::from_millis(5));
        assert!(delay <= Duration::from_millis(15));
    }
}
