use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dynamic_tiler::cache::RedisStore;
use dynamic_tiler::feature::log_features;
use dynamic_tiler::server::{serve, AppState};
use dynamic_tiler::{Config, PgExecutor, TileService};

/// Serves Mapbox vector tiles rendered from PostGIS queries.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// YAML configuration file. Without it, settings are read from the environment.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on, overriding the configuration.
    #[arg(short, long)]
    port: Option<u16>,

    /// Log debug output, including generated SQL and feature dumps.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            Config::from_yaml(&data)?
        }
        None => Config::from_env()?,
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    config.debug |= cli.verbose;

    let level = if config.debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp_secs()
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting the async runtime")?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    let executor = PgExecutor::connect_lazy(&config.database, config.query_timeout())?;

    let mut service = TileService::new(executor).with_query_timeout(config.query_timeout());
    if config.debug {
        service = service.with_observer(Arc::new(log_features));
    }

    let mut state = AppState::new(Arc::new(service), &config)?;
    if let Some(url) = &config.redis_url {
        match RedisStore::connect(url, config.redis_cache_ttl()?).await {
            Ok(store) => {
                log::info!("sharing rendered tiles through redis");
                state = state.with_shared_store(Arc::new(store));
            }
            Err(err) => log::warn!("redis is unavailable, caching in process only: {}", err),
        }
    }
    serve(&config, state).await.context("serving tiles")
}
