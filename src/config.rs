use crate::core::{Result, SprocketError};
use crate::log_sink::LogLevel;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Table names are spliced into SQL text, so they must be plain identifiers.
static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern compiles"));

/// Path value that selects a private in-memory database.
pub const IN_MEMORY: &str = ":memory:";

/// Top-level configuration structure parsed from a TOML file.
///
/// Built once at startup and shared read-only (`Arc<Config>`) by the runtime,
/// the dispatcher, the large-object store and the database logger.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub execution: ExecutionConfig,
    pub chunks: ChunkConfig,
    pub logging: LoggingConfig,
}

/// Connection and pool settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file path, or `:memory:`
    pub path: String,
    pub pool_size: usize,
    pub acquire_timeout_ms: u64,
    pub busy_timeout_ms: u64,
    /// Catalog table mapping procedure names to statement bodies
    pub procedure_table: String,
}

/// Command execution defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub default_timeout_ms: u64,
    /// Name of the single parameter every command binds
    pub parameter_name: String,
}

/// Large-object chunking settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Upper bound of one chunk, in bytes
    pub chunk_size: usize,
    /// Text longer than this many characters is diverted to the chunk table
    pub inline_threshold: usize,
    pub table: String,
}

/// Database logging settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub min_level: LogLevel,
    pub procedure: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: IN_MEMORY.to_string(),
            pool_size: 4,
            acquire_timeout_ms: 30_000,
            busy_timeout_ms: 5_000,
            procedure_table: "sprocket_procedures".to_string(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            default_timeout_ms: 30_000,
            parameter_name: "@Data".to_string(),
        }
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        ChunkConfig {
            chunk_size: 16 * 1024,
            inline_threshold: 4000,
            table: "sprocket_chunks".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            min_level: LogLevel::Information,
            procedure: "log_event".to_string(),
        }
    }
}

impl DatabaseConfig {
    pub fn is_in_memory(&self) -> bool {
        self.path == IN_MEMORY
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl ExecutionConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl Config {
    /// Defaults with a private in-memory database.
    pub fn in_memory() -> Self {
        Config::default()
    }

    /// Defaults with the database stored at `path`.
    pub fn for_path<P: AsRef<Path>>(path: P) -> Self {
        let mut config = Config::default();
        config.database.path = path.as_ref().to_string_lossy().into_owned();
        config
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| SprocketError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants the runtime relies on.
    pub fn validate(&self) -> Result<()> {
        if self.database.pool_size == 0 {
            return Err(SprocketError::Config("database.pool_size must be at least 1".to_string()));
        }
        if self.chunks.chunk_size == 0 {
            return Err(SprocketError::Config("chunks.chunk_size must be at least 1".to_string()));
        }
        for (key, table) in [
            ("database.procedure_table", &self.database.procedure_table),
            ("chunks.table", &self.chunks.table),
        ] {
            if !IDENTIFIER.is_match(table) {
                return Err(SprocketError::Config(format!(
                    "{} must be a plain identifier, got {:?}",
                    key, table
                )));
            }
        }
        let name = &self.execution.parameter_name;
        let valid_prefix = name.starts_with('@') || name.starts_with(':') || name.starts_with('$');
        if !valid_prefix || !IDENTIFIER.is_match(&name[1..]) {
            return Err(SprocketError::Config(format!(
                "execution.parameter_name must look like @Name, got {:?}",
                name
            )));
        }
        Ok(())
    }
}

/// Loads configuration from a TOML file at the given path.
///
/// # Example
///
/// ```no_run
/// let config = sprocket::config::load_config("sprocket.toml").expect("Failed to load config");
/// println!("{:?}", config.database.path);
/// ```
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = fs::read_to_string(path)?;
    Config::from_toml_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_CONFIG: &str = r#"
[database]
path = "/var/lib/sprocket/app.db"
pool_size = 8

[execution]
default_timeout_ms = 1500

[chunks]
chunk_size = 32768
table = "blob_chunks"

[logging]
min_level = "warning"
procedure = "write_log"
"#;

    #[test]
    fn test_load_config_from_str() {
        let config = Config::from_toml_str(SAMPLE_CONFIG).expect("Failed to parse sample config");
        assert_eq!(config.database.path, "/var/lib/sprocket/app.db");
        assert_eq!(config.database.pool_size, 8);
        assert_eq!(config.database.busy_timeout_ms, 5_000);
        assert_eq!(config.execution.default_timeout(), Duration::from_millis(1500));
        assert_eq!(config.execution.parameter_name, "@Data");
        assert_eq!(config.chunks.chunk_size, 32768);
        assert_eq!(config.chunks.inline_threshold, 4000);
        assert_eq!(config.chunks.table, "blob_chunks");
        assert_eq!(config.logging.min_level, LogLevel::Warning);
        assert_eq!(config.logging.procedure, "write_log");
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert!(config.database.is_in_memory());
        assert_eq!(config.chunks.chunk_size, 16 * 1024);
        assert_eq!(config.logging.min_level, LogLevel::Information);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(Config::from_toml_str("[database]\npool_size = 0").is_err());
        assert!(Config::from_toml_str("[chunks]\nchunk_size = 0").is_err());
        assert!(Config::from_toml_str("[chunks]\ntable = \"chunks; DROP TABLE x\"").is_err());
        assert!(Config::from_toml_str("[execution]\nparameter_name = \"Data\"").is_err());
        assert!(Config::from_toml_str("[execution]\nparameter_name = \":payload\"").is_ok());
    }

    #[test]
    fn test_load_config_missing_file() {
        match load_config("/nonexistent/sprocket.toml") {
            Err(SprocketError::Io(_)) => {}
            other => panic!("Expected I/O error, got {:?}", other),
        }
    }
}
