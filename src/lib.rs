//! Execute database procedures with a single JSON parameter.
//!
//! Every call binds one parameter (`@Data` by default) carrying NULL, a
//! primitive, a string, bytes or a JSON document, and reads back either a
//! rows-affected count, one scalar, or one JSON column per row. Payloads too
//! large to travel inline go through the chunked [`storage::LargeObjectStore`].

// Core infrastructure modules
pub mod core;

// Feature-specific modules
pub mod coerce;
pub mod command;
pub mod config;
pub mod log_sink;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_utils;

pub use crate::coerce::{FromRaw, Json, ToParam};
pub use crate::command::{Command, Dispatcher, Outcome, Shape, Target};
pub use crate::config::{load_config, Config};
pub use crate::core::{Result, SprocketError};
pub use crate::log_sink::{DbLogger, LogEntry, LogLevel};
pub use crate::storage::{ChunkReader, LargeObject, LargeObjectStore, LargeText, Lookup};
