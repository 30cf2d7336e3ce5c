use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use remotewiz::channels::AdapterBus;
use remotewiz::config::Config;
use remotewiz::db::Database;
use remotewiz::engine::Engine;
use remotewiz::settings::Settings;

#[derive(Debug, Parser)]
#[command(name = "remotewiz", about = "Remote-control gateway for a coding-agent CLI")]
struct Args {
    /// Path to the settings file.
    #[arg(long, default_value = "remotewiz.toml")]
    config: PathBuf,

    /// Directory holding the database and uploads.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Log filter (overridden by RUST_LOG).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    let settings = Settings::load_or_default(&args.config)
        .with_context(|| format!("loading settings from {:?}", args.config))?;
    let mut config = Config::resolve(&settings).context("resolving configuration")?;
    if config.projects.is_empty() {
        tracing::warn!(
            "no projects configured; add a [projects.<alias>] table to {:?}",
            args.config
        );
    }
    if config.engine.uploads_root.is_relative() {
        config.engine.uploads_root = args.data_dir.join(&config.engine.uploads_root);
    }
    std::fs::create_dir_all(&config.engine.uploads_root)
        .context("creating uploads directory")?;

    let db_path = args.data_dir.join("remotewiz.db");
    let store = Database::open(&db_path)
        .await
        .with_context(|| format!("opening database at {db_path:?}"))?;
    tracing::info!(path = %db_path.display(), "database ready");

    let bus = Arc::new(AdapterBus::new());
    let engine = Engine::new(
        store,
        config.engine.clone(),
        config.projects.clone(),
        Arc::clone(&bus),
        None,
    );
    engine.start().await;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown signal received");
    engine.stop().await;
    Ok(())
}
