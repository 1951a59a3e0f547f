use std::time::Duration;

use strand_core::config::{BackoffConfig, RetryConfig};

/// Delay strategy between task attempts.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Backoff {
    /// Retry immediately.
    #[default]
    None,
    Fixed(Duration),
    Exponential {
        initial: Duration,
        max: Duration,
        jitter: bool,
    },
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based), or `None` to retry at once.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        match self {
            Self::None => None,
            Self::Fixed(d) => Some(*d),
            Self::Exponential {
                initial,
                max,
                jitter,
            } => Some(calculate_backoff(attempt, *initial, *max, *jitter)),
        }
    }
}

impl From<&BackoffConfig> for Backoff {
    fn from(config: &BackoffConfig) -> Self {
        match config {
            BackoffConfig::None => Self::None,
            BackoffConfig::Fixed { delay_ms } => Self::Fixed(Duration::from_millis(*delay_ms)),
            BackoffConfig::Exponential {
                initial_ms,
                max_ms,
                jitter,
            } => Self::Exponential {
                initial: Duration::from_millis(*initial_ms),
                max: Duration::from_millis(*max_ms),
                jitter: *jitter,
            },
        }
    }
}

fn calculate_backoff(attempt: u32, initial: Duration, max: Duration, jitter: bool) -> Duration {
    let initial_ms = initial.as_millis() as u64;
    let ms = initial_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(max.as_millis() as u64);
    if !jitter {
        return Duration::from_millis(ms);
    }
    // Add jitter: 0.8x to 1.2x
    let factor = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * factor) as u64)
}

/// How many times a task retries and how long it waits in between.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: Backoff::from(&config.backoff),
        }
    }

    /// Total executor invocations allowed, counting the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}
