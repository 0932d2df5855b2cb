//! CLI command implementations
//!
//! Every command loads the configuration, does its work and prints one
//! JSON object on stdout. Commands only read stores; opening and upgrading
//! happen through the library API.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use serde_json::{json, Value};

use crate::config::{EngineConfig, EngineKind};
use crate::factory::StoreFactory;

use super::args::{Cli, Command};
use super::errors::{CliError, CliResult};

/// Main CLI entry point
///
/// Parses arguments, dispatches, and prints the response.
/// This is the only function that main.rs should call.
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    let response = run_command(cli.command)?;
    write_response(&response)
}

/// Run a parsed command and return its response body.
pub fn run_command(cmd: Command) -> CliResult<Value> {
    match cmd {
        Command::Init { config } => init(&config),
        Command::Stores { config } => stores(&config),
        Command::Inspect { config, store } => inspect(&config, &store),
    }
}

/// Create the data directory layout.
///
/// Fails if the directory is already initialized.
pub fn init(config_path: &Path) -> CliResult<Value> {
    let config = load_file_config(config_path)?;
    if is_initialized(&config) {
        return Err(CliError::already_initialized());
    }

    let stores_dir = config.stores_path();
    fs::create_dir_all(&stores_dir).map_err(|e| {
        CliError::io_error(format!(
            "Failed to create directory {}: {}",
            stores_dir.display(),
            e
        ))
    })?;

    Ok(json!({
        "data_dir": config.data_dir,
        "initialized": true,
    }))
}

/// List every store with its persisted version.
pub fn stores(config_path: &Path) -> CliResult<Value> {
    let factory = open_factory(config_path)?;
    let stores: Vec<Value> = factory
        .stores()?
        .into_iter()
        .map(|(name, version)| json!({ "name": name, "version": version }))
        .collect();
    Ok(json!({ "stores": stores }))
}

/// Show one store's version and record count.
pub fn inspect(config_path: &Path, store: &str) -> CliResult<Value> {
    let factory = open_factory(config_path)?;
    let version = factory.current_version(store)?;
    if version == 0 {
        return Err(CliError::unknown_store(store));
    }
    let records = factory.record_count(store)?;
    Ok(json!({
        "store": store,
        "version": version,
        "records": records,
    }))
}

fn load_file_config(config_path: &Path) -> CliResult<EngineConfig> {
    let config = EngineConfig::load(config_path)?;
    if config.engine != EngineKind::File {
        return Err(CliError::config_error(
            "CLI commands require engine 'file'",
        ));
    }
    Ok(config)
}

fn is_initialized(config: &EngineConfig) -> bool {
    config.stores_path().is_dir()
}

fn open_factory(config_path: &Path) -> CliResult<StoreFactory> {
    let config = load_file_config(config_path)?;
    if !is_initialized(&config) {
        return Err(CliError::not_initialized());
    }
    // Log lines would break the single-object output.
    Ok(StoreFactory::new(config.with_log_events(false))?)
}

fn write_response(data: &Value) -> CliResult<()> {
    let response = json!({ "status": "ok", "data": data });
    let mut stdout = io::stdout();
    serde_json::to_writer(&mut stdout, &response)?;
    writeln!(stdout)?;
    stdout.flush()?;
    Ok(())
}
