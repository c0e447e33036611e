//! Retry policy for failed handler dispatches.

use std::time::Duration;

/// Configuration for handler retry behavior with exponential backoff.
///
/// When a dispatch fails and `retry_count < max_retries`, the dispatcher
/// increments the run's retry count and re-enqueues the same job delayed by
/// [`RetryPolicy::delay`]. Once retries are exhausted the run becomes
/// terminally FAILED.
///
/// # Backoff Calculation
///
/// The delay before retry N (1-based) is: `min(factor^(N-1) * min_delay,
/// max_delay)`. With `jitter` the result is sampled uniformly from
/// `[0.75 * base, 1.25 * base]`.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use runloom::RetryPolicy;
///
/// let policy = RetryPolicy {
///     max_retries: 3,
///     min_delay: Duration::from_millis(500),
///     max_delay: Some(Duration::from_secs(30)),
///     ..Default::default()
/// };
/// assert_eq!(policy.delay(2), Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Number of retries after the initial attempt. 0 means the first
    /// failure is terminal. Default: 0.
    pub max_retries: u32,

    /// Multiplier applied per retry. Default: 2.
    pub factor: f64,

    /// Delay before the first retry. Default: 1 second.
    pub min_delay: Duration,

    /// Cap on the exponential growth. Default: unbounded.
    pub max_delay: Option<Duration>,

    /// Sample the delay uniformly from `[0.75 * base, 1.25 * base]`.
    /// Default: off.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            factor: 2.0,
            min_delay: Duration::from_millis(1_000),
            max_delay: None,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Shorthand for "N retries with default backoff".
    pub fn retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Calculate the delay before a retry.
    ///
    /// # Arguments
    ///
    /// * `retry_count` - The retry about to be scheduled (1-based)
    pub fn delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1);
        let multiplier = self.factor.max(1.0).powi(exponent.min(i32::MAX as u32) as i32);
        let base = self.min_delay.as_secs_f64() * multiplier;
        let capped = match self.max_delay {
            Some(max) => base.min(max.as_secs_f64()),
            None => base,
        };

        let sampled = if self.jitter {
            capped * (0.75 + rand::random::<f64>() * 0.5)
        } else {
            capped
        };

        Duration::from_secs_f64(sampled)
    }
}
