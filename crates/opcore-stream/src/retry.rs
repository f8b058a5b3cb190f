//! Backoff settings shared by every RPC client.

use std::time::Duration;

use backon::ExponentialBuilder;
use bon::Builder;

/// Default number of attempts before a transient error is surfaced.
pub const MAX_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Copy, Builder)]
pub struct RetryConfig {
    #[builder(default = MAX_ATTEMPTS)]
    pub max_attempts: usize,
    #[builder(default = Duration::from_millis(250))]
    pub min_delay: Duration,
    #[builder(default = Duration::from_secs(5))]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_attempts)
            .with_jitter()
    }

    /// No waiting between attempts, for tests.
    pub fn immediate(max_attempts: usize) -> Self {
        Self { max_attempts, min_delay: Duration::ZERO, max_delay: Duration::ZERO }
    }
}
