//! Engine tunables.

use std::time::Duration;

use cloudsync_core::EngineSettings;

use crate::retry::RetryConfig;

/// Runtime configuration of a [`crate::SyncEngine`].
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Sleep between empty change-feed polls.
    pub poll_interval: Duration,
    /// Upper bound on one side's polling per cycle.
    pub poll_budget: Duration,
    /// How long a tombstoned entry is kept before it is purged.
    pub tombstone_grace: Duration,
    /// Call-site retry of temporary failures, also the reconnect schedule.
    pub retry: RetryConfig,
    /// Longest parent chain the path cache will ascend.
    pub max_parent_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            poll_budget: Duration::from_secs(1),
            tombstone_grace: Duration::from_secs(30),
            retry: RetryConfig::default(),
            max_parent_depth: 128,
        }
    }
}

impl EngineConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_poll_budget(mut self, budget: Duration) -> Self {
        self.poll_budget = budget;
        self
    }

    pub fn with_tombstone_grace(mut self, grace: Duration) -> Self {
        self.tombstone_grace = grace;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_parent_depth(mut self, depth: usize) -> Self {
        self.max_parent_depth = depth;
        self
    }
}

impl From<&EngineSettings> for EngineConfig {
    fn from(s: &EngineSettings) -> Self {
        Self {
            poll_interval: Duration::from_millis(s.poll_interval_ms),
            poll_budget: Duration::from_millis(s.poll_budget_ms),
            tombstone_grace: Duration::from_secs(s.tombstone_grace_secs),
            retry: RetryConfig::new(s.max_attempts.max(1))
                .with_initial_delay(Duration::from_millis(s.retry_initial_delay_ms)),
            ..Self::default()
        }
    }
}
