//! Visage application binary - composition root.
//!
//! 1. Parse CLI arguments
//! 2. Load configuration from TOML and apply overrides
//! 3. Initialise the handle (extractor + persisted collection)
//! 4. Run the requested command and print its result as JSON

mod cli;

use clap::Parser;
use serde_json::json;

use visage_core::config::VisageConfig;
use visage_vector::initialize;

use cli::{CliArgs, Command};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config.
    let config_file = args.resolve_config_path();
    let mut config = if config_file.exists() {
        VisageConfig::load(&config_file)?
    } else {
        VisageConfig::default()
    };
    if let Some(data_dir) = args.resolve_data_dir() {
        config.general.data_dir = data_dir;
    }
    config.general.log_level = args.resolve_log_level(&config.general.log_level);

    // Tracing. RUST_LOG wins over the configured level.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.general.log_level)),
        )
        .init();

    tracing::info!("Starting Visage v{}", env!("CARGO_PKG_VERSION"));
    tracing::debug!(path = %config_file.display(), "Configuration resolved");

    let handle = initialize(config)?;

    let output = match &args.command {
        Command::Ingest { dir } => {
            let summary = handle.ingest(dir).await?;
            serde_json::to_value(summary)?
        }
        Command::Search { image, limit } => {
            let bytes = tokio::fs::read(image).await?;
            let matches = handle.search_with_limit(&bytes, *limit).await?;
            json!({ "matches": matches })
        }
        Command::Info => serde_json::to_value(handle.info()?)?,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);

    handle.shutdown()?;
    Ok(())
}
