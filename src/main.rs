//! Polymock - CLI Entry Point

use anyhow::Result;
use clap::Parser;
use polymock::{EngineConfig, MockEngine};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "polymock",
    about = "Multi-protocol mock engine - load, validate and export mock collections",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "polymock.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,

    /// Print the loaded mocks as a named collection (YAML) and exit
    #[arg(long, value_name = "NAME")]
    export: Option<String>,

    /// List the loaded mocks and exit
    #[arg(long)]
    list: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.print_config {
        println!("{}", serde_yaml::to_string(&EngineConfig::default())?);
        return Ok(());
    }

    // Load configuration
    let config = if args.config.exists() {
        info!(path = ?args.config, "Loading configuration");
        EngineConfig::from_file(&args.config)?
    } else if args.validate || args.export.is_some() || args.list {
        anyhow::bail!("Configuration file not found: {:?}", args.config);
    } else {
        info!("Using default configuration (no mocks)");
        EngineConfig::default()
    };

    if args.validate {
        println!(
            "Configuration is valid ({} mocks, {} stateful resources defined)",
            config.collection.mocks.len(),
            config.collection.stateful_resources.len()
        );
        return Ok(());
    }

    let engine = MockEngine::from_config(config)?;

    if let Some(name) = args.export.as_deref() {
        print!("{}", engine.export_config(Some(name)).to_yaml()?);
        return Ok(());
    }

    if args.list {
        for mock in engine.list_mocks(None) {
            let state = if mock.enabled { "enabled" } else { "disabled" };
            println!(
                "{}\t{}\t{}\t{}",
                mock.id,
                mock.kind(),
                state,
                mock.name.as_deref().unwrap_or("-")
            );
        }
        return Ok(());
    }

    let stats = engine.stats();
    info!(
        mocks = stats.mocks,
        stateful_resources = stats.stateful_resources,
        "Mock engine ready, waiting for shutdown signal"
    );

    tokio::signal::ctrl_c().await?;
    engine.shutdown();

    Ok(())
}
