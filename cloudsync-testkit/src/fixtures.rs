//! Engine fixtures.

use std::time::Duration;

use cloudsync_core::{Provider, ProviderConfig, ProviderRegistry};
use cloudsync_sync::{EngineConfig, RetryConfig, RunStats, SyncEngine};

use crate::mock::MockProvider;

const CONVERGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Route test logs through `tracing`, filtered by `RUST_LOG` (default
/// `info`). Safe to call from every test.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_test_writer()
        .try_init();
}

/// Short polls and near-instant retries.
pub fn test_engine_config() -> EngineConfig {
    EngineConfig::default()
        .with_poll_interval(Duration::from_millis(2))
        .with_poll_budget(Duration::from_millis(20))
        .with_tombstone_grace(Duration::from_secs(60))
        .with_retry(
            RetryConfig::new(3)
                .with_initial_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(5)),
        )
}

/// A registry with the mock backend under the name `mock`.
pub fn mock_registry() -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    registry
        .register("mock", build_mock)
        .expect("fresh registry has no mock entry");
    registry
}

fn build_mock(config: ProviderConfig) -> Box<dyn Provider> {
    Box::new(MockProvider::with_config(config))
}

/// Two mock sides behind one engine. `local` is side 0.
pub struct Harness {
    pub local: MockProvider,
    pub remote: MockProvider,
    pub engine: SyncEngine,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_configs(ProviderConfig::default(), ProviderConfig::default())
    }

    pub fn with_configs(local: ProviderConfig, remote: ProviderConfig) -> Self {
        Self::with_engine_config(test_engine_config(), local, remote)
    }

    pub fn with_engine_config(
        config: EngineConfig,
        local: ProviderConfig,
        remote: ProviderConfig,
    ) -> Self {
        init_tracing();
        let local = MockProvider::with_config(local);
        let remote = MockProvider::with_config(remote);
        let engine = SyncEngine::new(
            config,
            vec![Box::new(local.clone()), Box::new(remote.clone())],
        );
        Self {
            local,
            remote,
            engine,
        }
    }

    /// Run until the engine settles, then once more to absorb the echoes of
    /// its own operations. Panics if it does not settle.
    pub fn converge(&self) -> RunStats {
        for round in 0..2 {
            let outcome = self
                .engine
                .run(CONVERGE_TIMEOUT, SyncEngine::is_settled)
                .expect("sync run failed");
            assert!(
                outcome.is_satisfied(),
                "engine did not settle (round {round}): {:#?}",
                self.engine.entries()
            );
        }
        self.engine.stats()
    }

    /// Total mutating calls issued against both sides.
    pub fn mutations(&self) -> usize {
        self.local.mutation_count() + self.remote.mutation_count()
    }

    /// Both sides hold the same files under their sync roots.
    pub fn assert_mirrored(&self) {
        assert_eq!(self.local.files(), self.remote.files(), "file contents differ");
        assert_eq!(self.local.listing(), self.remote.listing(), "trees differ");
    }
}
