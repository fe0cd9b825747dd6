/// Database Module
///
/// The connection/execution runtime, split in two concerns:
/// - **Connection Management** (`connection.rs`): the bounded r2d2 pool and
///   the rollback applied to connections coming back to it
/// - **Query Execution** (`query.rs`): statement framing, parameter binding,
///   result shapes, timeouts and cancellation
///
/// All provider failures leave this module as `SprocketError`.
pub mod connection;
pub mod query;

pub use connection::{Pool, PoolStatus, PooledConnection};
pub use query::{CallControl, InterruptOnDrop, ResultStream, Runtime, Watchdog};
