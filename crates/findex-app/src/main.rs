//! findex binary: brings the index database up to date and reports on it.
//!
//! ```text
//! findex [migrate | status | recover-lock [--force]] [--config PATH]
//! ```

use std::process::ExitCode;

use findex_app::{config, Config, StartupError};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Migrate,
    Status,
    RecoverLock { force: bool },
}

#[derive(Debug)]
struct Cli {
    command: Command,
    config_path: Option<String>,
}

fn parse_args(args: impl Iterator<Item = String>) -> Result<Cli, String> {
    let mut command = None;
    let mut force = false;
    let mut config_path = None;
    let mut args = args;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "migrate" | "status" | "recover-lock" if command.is_none() => {
                command = Some(arg);
            }
            "--force" => force = true,
            "--config" => match args.next().filter(|value| !value.trim().is_empty()) {
                Some(path) => config_path = Some(path),
                None => return Err("--config requires a path".into()),
            },
            other => return Err(format!("unexpected argument: {other}")),
        }
    }

    let command = match command.as_deref() {
        None | Some("migrate") => Command::Migrate,
        Some("status") => Command::Status,
        _ => Command::RecoverLock { force },
    };
    if force && !matches!(command, Command::RecoverLock { .. }) {
        return Err("--force only applies to recover-lock".into());
    }
    Ok(Cli {
        command,
        config_path,
    })
}

fn resolve_config_path(cli_path: Option<String>) -> (String, &'static str) {
    if let Some(path) = cli_path {
        return (path, "cli-arg");
    }

    if let Ok(path) = std::env::var("FINDEX_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (path, "env-var");
        }
    }

    ("findex.toml".to_string(), "default")
}

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), StartupError> {
    let json = serde_json::to_string_pretty(value).map_err(findex_observe::ObserveError::from)?;
    println!("{json}");
    Ok(())
}

fn run(command: Command, config: &Config) -> Result<(), StartupError> {
    match command {
        Command::Migrate => {
            let runtime = findex_app::startup(config)?;
            let report = runtime.report();
            runtime.shutdown();
            println!("{}", report?.to_json_pretty()?);
        }
        Command::Status => print_json(&findex_app::status(config)?)?,
        Command::RecoverLock { force } => {
            let removed = findex_app::recover_lock(config, force)?;
            if removed.is_none() {
                tracing::info!("no migration lock present");
            }
            print_json(&removed)?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = match parse_args(std::env::args().skip(1)) {
        Ok(cli) => cli,
        Err(message) => {
            eprintln!("findex: {message}");
            eprintln!("usage: findex [migrate | status | recover-lock [--force]] [--config PATH]");
            return ExitCode::FAILURE;
        }
    };

    let (config_path, config_source) = resolve_config_path(cli.config_path);
    let config = match config::load_config(Some(&config_path)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("findex: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config);

    tracing::info!(
        source = config_source,
        path = %config_path,
        "resolved configuration path"
    );

    match run(cli.command, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "findex command failed");
            ExitCode::FAILURE
        }
    }
}
