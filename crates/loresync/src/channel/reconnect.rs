use tokio::time::Duration;

use crate::config::RetryConfig;

/// Attempt bookkeeping of one channel's exponential backoff.
///
/// The counter resets whenever the channel reaches `Connected` or the network
/// is reported restored.
#[derive(Debug, Clone)]
pub struct ReconnectController {
    config: RetryConfig,
    attempt: u32,
}

impl ReconnectController {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Attempts scheduled since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the next attempt, `None` once the attempts are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.config.delay_for(self.attempt)?;
        self.attempt += 1;
        Some(delay)
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.config.max_attempts
    }
}
