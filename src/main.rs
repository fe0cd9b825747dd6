use sprocket::{load_config, Config, Dispatcher, LargeObject, Lookup, SprocketError, Target};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, info};
use uuid::Uuid;

const USAGE: &str = "Usage: sprocket [--config <file>] <command>

Commands:
  exec <procedure> [input]   run a catalog procedure, print its JSON result
  sql <statement> [input]    run an inline statement, print its JSON result
  put <file>                 store a file as a large object, print its id
  get <id> <file>            write a large object to a file
  rm <id>                    delete a large object";

/// Config file used when `--config` is not given.
fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("sprocket").join("config.toml"))
}

fn resolve_config(explicit: Option<String>) -> sprocket::Result<Config> {
    if let Some(path) = explicit {
        return load_config(path);
    }
    if let Some(path) = default_config_path().filter(|p| p.exists()) {
        debug!("Using config at {}", path.display());
        return load_config(path);
    }
    let data_dir = dirs::data_dir()
        .map(|dir| dir.join("sprocket"))
        .ok_or_else(|| SprocketError::Config("no data directory; pass --config".to_string()))?;
    std::fs::create_dir_all(&data_dir)?;
    Ok(Config::for_path(data_dir.join("sprocket.db")))
}

fn parse_id(text: &str) -> sprocket::Result<Uuid> {
    Uuid::parse_str(text).map_err(|e| SprocketError::Config(format!("invalid object id {:?}: {}", text, e)))
}

fn run(args: Vec<String>) -> sprocket::Result<()> {
    let mut args = args.into_iter().peekable();
    let mut config_path = None;
    if args.peek().map(String::as_str) == Some("--config") {
        args.next();
        config_path = args.next();
    }
    let command = args.next().unwrap_or_default();
    let rest: Vec<String> = args.collect();

    let dispatcher = Dispatcher::open(resolve_config(config_path)?)?;
    info!("Opened {}", dispatcher.config().database.path);

    match (command.as_str(), rest.as_slice()) {
        ("exec", [name, input @ ..]) | ("sql", [name, input @ ..]) if input.len() <= 1 => {
            let target = if command == "exec" {
                Target::procedure(name.as_str())
            } else {
                Target::statement(name.as_str())
            };
            let result: String = dispatcher.fetch_json(target, &input.first())?;
            println!("{}", result);
        }
        ("put", [file]) => {
            let bytes = std::fs::read(file)?;
            let id = dispatcher.large_objects()?.set(&LargeObject::Binary(bytes))?;
            println!("{}", id);
        }
        ("get", [id, file]) => match dispatcher.large_objects()?.get(parse_id(id)?)? {
            Lookup::Found(object) => std::fs::write(file, object.as_bytes())?,
            Lookup::NotFound => println!("Not found: {}", id),
        },
        ("rm", [id]) => {
            let removed = dispatcher.large_objects()?.delete(parse_id(id)?)?;
            println!("Removed {} chunks", removed);
        }
        _ => {
            eprintln!("{}", USAGE);
            return Err(SprocketError::Config(format!("unrecognized command {:?}", command)));
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    // Initialize the logging system using tracing subscriber; stdout carries results
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    match run(std::env::args().skip(1).collect()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id() {
        assert!(parse_id("67e55044-10b1-426f-9247-bb680e5fe0c8").is_ok());
        assert!(matches!(parse_id("nope"), Err(SprocketError::Config(_))));
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = dir.path().join("config.toml");
        std::fs::write(&config, format!("[database]\npath = {:?}\n", dir.path().join("cli.db"))).unwrap();
        let args = vec!["--config".to_string(), config.to_string_lossy().into_owned(), "frobnicate".to_string()];
        assert!(matches!(run(args), Err(SprocketError::Config(_))));
    }
}
