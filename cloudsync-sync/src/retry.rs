//! Retry and reconnect backoff.
//!
//! `TemporaryError` is retried at the call site with [`with_retry`];
//! `DisconnectedError` puts the whole side into a [`Backoff`] owned by its
//! poller.

use std::time::{Duration, Instant};

use cloudsync_core::CloudError;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts per operation, the first one included.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }

    /// A single attempt, no waiting.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Delay before retry number `attempt` (0 means the first try).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Run `op`, retrying `Temporary` failures up to `config.max_attempts`.
///
/// `on_retry` is called once per retry, before sleeping. Every other error
/// kind is returned immediately.
pub fn with_retry<T>(
    config: &RetryConfig,
    name: &str,
    mut on_retry: impl FnMut(u32, &CloudError),
    mut op: impl FnMut() -> Result<T, CloudError>,
) -> Result<T, CloudError> {
    let mut attempt = 0;
    loop {
        match op() {
            Err(err) if err.is_retryable() && attempt + 1 < config.max_attempts => {
                attempt += 1;
                let delay = config.delay_for_attempt(attempt);
                tracing::warn!(op = name, attempt, ?delay, error = %err, "retrying");
                on_retry(attempt, &err);
                std::thread::sleep(delay);
            }
            other => return other,
        }
    }
}

/// Reconnect schedule for one side after a disconnect.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    failures: u32,
    next_try: Option<Instant>,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            failures: 0,
            next_try: None,
        }
    }

    /// Record a failure and schedule the next attempt. Returns the wait.
    pub fn fail(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = self.config.delay_for_attempt(self.failures);
        self.next_try = Some(Instant::now() + delay);
        delay
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.next_try = None;
    }

    /// A failure has been recorded and not yet cleared by [`Backoff::reset`].
    pub fn is_active(&self) -> bool {
        self.next_try.is_some()
    }

    /// True when no wait is pending.
    pub fn ready(&self) -> bool {
        self.next_try.map_or(true, |t| Instant::now() >= t)
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}
