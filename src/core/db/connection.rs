/// Connection Management Module
///
/// A bounded r2d2 pool of SQLite connections. Every command checks out one
/// connection, runs exactly one statement on it and hands it back when the
/// [`PooledConnection`] guard drops, whichever way the call exits.

use crate::config::DatabaseConfig;
use crate::core::{Result, SprocketError};
use r2d2::{HandleError, ManageConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// A connection checked out of a [`Pool`]; dereferences to
/// [`rusqlite::Connection`] and returns to the pool on drop.
pub type PooledConnection = r2d2::PooledConnection<ConnectionManager>;

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Connections currently open (idle or checked out)
    pub open: usize,
    /// Connections waiting in the pool
    pub idle: usize,
    pub max_size: usize,
}

/// Opens connections with the pool's pragmas and cleans them up on return.
///
/// A connection handed back inside an open transaction is rolled back and
/// kept. It is only discarded when the rollback itself fails.
pub struct ConnectionManager {
    inner: SqliteConnectionManager,
}

impl ConnectionManager {
    fn new(settings: &DatabaseConfig) -> Self {
        let in_memory = settings.is_in_memory();
        let busy_timeout = settings.busy_timeout();
        let source = if in_memory {
            SqliteConnectionManager::memory()
        } else {
            SqliteConnectionManager::file(&settings.path)
        };
        let inner = source.with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            if !in_memory {
                // journal_mode answers with a row, so it cannot go through execute_batch
                let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
            }
            Ok(())
        });
        ConnectionManager { inner }
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager").finish_non_exhaustive()
    }
}

impl ManageConnection for ConnectionManager {
    type Connection = Connection;
    type Error = rusqlite::Error;

    fn connect(&self) -> std::result::Result<Connection, rusqlite::Error> {
        self.inner.connect()
    }

    fn is_valid(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        self.inner.is_valid(conn)
    }

    fn has_broken(&self, conn: &mut Connection) -> bool {
        if conn.is_autocommit() {
            return false;
        }
        warn!("Rolling back a transaction left open on a pooled connection");
        match conn.execute_batch("ROLLBACK") {
            Ok(()) => !conn.is_autocommit(),
            Err(e) => {
                warn!("Rollback failed, discarding connection: {}", e);
                true
            }
        }
    }
}

/// Reports connection failures through `tracing` instead of the `log` crate.
#[derive(Debug)]
struct TracingErrorHandler;

impl HandleError<rusqlite::Error> for TracingErrorHandler {
    fn handle_error(&self, error: rusqlite::Error) {
        warn!("Cannot open pooled connection: {}", error);
    }
}

/// Bounded connection pool.
///
/// Cloning is cheap; clones share the same connections.
#[derive(Clone)]
pub struct Pool {
    inner: r2d2::Pool<ConnectionManager>,
    path: String,
    acquire_timeout: Duration,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("path", &self.path)
            .field("status", &self.status())
            .finish()
    }
}

impl Pool {
    /// Creates a pool for the configured database.
    ///
    /// Connections to a file are opened lazily. A `:memory:` database lives
    /// only as long as its connection, so the pool collapses to a single
    /// connection that is opened eagerly and never expires.
    pub fn new(settings: &DatabaseConfig) -> Result<Self> {
        let in_memory = settings.is_in_memory();
        let max_size = if in_memory {
            1
        } else {
            u32::try_from(settings.pool_size.max(1)).unwrap_or(u32::MAX)
        };
        let acquire_timeout = settings.acquire_timeout().max(Duration::from_millis(1));

        let builder = r2d2::Pool::builder()
            .max_size(max_size)
            .connection_timeout(acquire_timeout)
            .error_handler(Box::new(TracingErrorHandler));
        let builder = if in_memory {
            builder.min_idle(Some(1)).idle_timeout(None).max_lifetime(None)
        } else {
            builder.min_idle(Some(0))
        };
        let inner = builder
            .build(ConnectionManager::new(settings))
            .map_err(|e| SprocketError::Pool(format!("cannot open {}: {}", settings.path, e)))?;

        debug!("Created pool for {} (max {} connections)", settings.path, max_size);
        Ok(Pool {
            inner,
            path: settings.path.clone(),
            acquire_timeout,
        })
    }

    /// Acquires a connection, waiting up to the configured acquire timeout.
    pub fn get(&self) -> Result<PooledConnection> {
        self.inner.get().map_err(|e| {
            SprocketError::Pool(format!(
                "no connection available within {:?}: {}",
                self.acquire_timeout, e
            ))
        })
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state();
        PoolStatus {
            open: state.connections as usize,
            idle: state.idle_connections as usize,
            max_size: self.inner.max_size() as usize,
        }
    }
}
