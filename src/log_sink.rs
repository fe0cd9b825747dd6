//! Database logging collaborator.
//!
//! Entries are written through the same single-JSON-parameter convention as
//! every other command. Logging is best effort: entries below the configured
//! minimum level are dropped, and any failure while writing is reported via
//! `tracing` and otherwise ignored so it never fails the caller's operation.

use crate::coerce::Json;
use crate::command::{Command, Dispatcher};
use crate::core::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Severity of a database log entry, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Information,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Information => "information",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// One row handed to the logging procedure as `{"level":..,"title":..,"more":..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub more: Option<serde_json::Value>,
}

/// Writes [`LogEntry`] values through the configured logging procedure.
#[derive(Debug, Clone)]
pub struct DbLogger {
    dispatcher: Dispatcher,
}

impl DbLogger {
    pub fn new(dispatcher: Dispatcher) -> Self {
        DbLogger { dispatcher }
    }

    pub fn min_level(&self) -> LogLevel {
        self.dispatcher.config().logging.min_level
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level()
    }

    fn command<M: Serialize + ?Sized>(&self, level: LogLevel, title: &str, more: Option<&M>) -> Result<Command> {
        let more = more
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| crate::core::SprocketError::Serialization {
                type_name: std::any::type_name::<M>(),
                message: e.to_string(),
            })?;
        let entry = LogEntry {
            level,
            title: title.to_string(),
            more,
        };
        Command::procedure(self.dispatcher.config().logging.procedure.as_str()).with_input(&Json(entry))
    }

    /// Writes an entry; returns whether it was persisted.
    pub fn log<M: Serialize + ?Sized>(&self, level: LogLevel, title: &str, more: Option<&M>) -> bool {
        if !self.enabled(level) {
            return false;
        }
        let written = self
            .command(level, title, more)
            .and_then(|command| self.dispatcher.execute(&command));
        match written {
            Ok(_) => true,
            Err(e) => {
                warn!(level = %level, title, error = %e, "database log entry dropped");
                false
            }
        }
    }

    /// Asynchronous [`log`](Self::log) with the same suppression policy.
    pub async fn log_async<M: Serialize + ?Sized>(&self, level: LogLevel, title: &str, more: Option<&M>) -> bool {
        if !self.enabled(level) {
            return false;
        }
        let command = match self.command(level, title, more) {
            Ok(command) => command,
            Err(e) => {
                warn!(level = %level, title, error = %e, "database log entry dropped");
                return false;
            }
        };
        match self.dispatcher.execute_async(command).await {
            Ok(_) => true,
            Err(e) => {
                warn!(level = %level, title, error = %e, "database log entry dropped");
                false
            }
        }
    }

    pub fn info(&self, title: &str) -> bool {
        self.log::<()>(LogLevel::Information, title, None)
    }

    pub fn warning(&self, title: &str) -> bool {
        self.log::<()>(LogLevel::Warning, title, None)
    }

    pub fn error<M: Serialize + ?Sized>(&self, title: &str, more: Option<&M>) -> bool {
        self.log(LogLevel::Error, title, more)
    }
}
