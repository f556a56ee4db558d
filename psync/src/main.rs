//! psync - panelsync command-line entry point

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use eyre::{Context, Result};
use serde_json::json;
use tracing::{debug, info};

use panelsync::cli::{Cli, Command, get_log_path};
use panelsync::config::Config;
use panelsync::demo::{self, VehicleUrlMapper};
use panelsync::location::LocationParams;
use panelsync::resource::{UrlMapper, split_highlights};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_path = get_log_path();
    let log_dir = log_path.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Priority: CLI --log-level > config file > INFO
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());

    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Some(Command::Demo) | None => cmd_demo(&config).await,
        Some(Command::Parse { query }) => cmd_parse(&query),
        Some(Command::Config) => cmd_config(&config),
    }
}

async fn cmd_demo(config: &Config) -> Result<()> {
    info!("cmd_demo: called");
    let transcript = demo::run(config).await.context("Demo session failed")?;
    for line in transcript {
        println!("{}", line);
    }
    println!("Log: {}", get_log_path().display());
    Ok(())
}

fn cmd_parse(query: &str) -> Result<()> {
    debug!(%query, "cmd_parse: called");
    let params = LocationParams::from_query_string(query);
    let (filter_params, highlights) = split_highlights(&params);
    let filters = VehicleUrlMapper.from_params(&filter_params);
    let output = json!({
        "params": params,
        "filters": filters,
        "highlights": highlights,
        "canonical": format!("?{}", VehicleUrlMapper.to_params(&filters).strip_empty().to_query_string()),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn cmd_config(config: &Config) -> Result<()> {
    print!("{}", serde_yaml::to_string(config).context("Failed to serialize configuration")?);
    Ok(())
}
