/// # Test Utilities Module
///
/// Isolated database fixtures shared by the unit tests. Every fixture gets
/// its own file database inside a temporary directory, so tests run in
/// parallel without seeing each other's procedures or chunks.

use crate::command::Dispatcher;
use crate::config::Config;
use crate::core::db::Runtime;
use std::sync::Arc;
use tempfile::TempDir;

/// A statement that runs for a very long time unless interrupted
pub const SLOW_QUERY: &str = "WITH RECURSIVE counter(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM counter WHERE x < 10000000000) SELECT COUNT(*) FROM counter";

/// Isolated database test fixture
pub struct TestDatabase {
    pub dispatcher: Dispatcher,
    // dropped last so the database file outlives every connection
    _dir: TempDir,
}

impl TestDatabase {
    /// Baseline configuration for fixtures; the path is replaced on use.
    pub fn config() -> Config {
        let mut config = Config::default();
        config.database.acquire_timeout_ms = 2_000;
        config
    }

    pub fn new() -> Self {
        Self::with_config(Self::config())
    }

    pub fn with_pool_size(pool_size: usize) -> Self {
        let mut config = Self::config();
        config.database.pool_size = pool_size;
        Self::with_config(config)
    }

    pub fn with_config(mut config: Config) -> Self {
        let dir = TempDir::new().expect("create temp dir");
        config.database.path = dir.path().join("test.db").to_string_lossy().into_owned();
        let dispatcher = Dispatcher::open(config).expect("open test database");
        TestDatabase { dispatcher, _dir: dir }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        self.dispatcher.runtime()
    }
}
