use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use cartsync_core::InMemoryCatalog;
use cartsync_server::ServerConfig;
use cartsync_store::{CartRepo, CartStore, Database, MemoryStore};
use cartsync_telemetry::{init_telemetry, TelemetryConfig};

/// Shared-cart sync server.
#[derive(Debug, Parser)]
#[command(name = "cartsync", version, about)]
struct Cli {
    /// Settings file (default: ~/.cartsync/settings.json).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Listen port.
    #[arg(long)]
    port: Option<u16>,

    /// Menu JSON file.
    #[arg(long, value_name = "PATH")]
    menu: Option<PathBuf>,

    /// SQLite cart store. Carts stay in memory when unset.
    #[arg(long, value_name = "PATH")]
    store: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = cartsync_settings::load_settings(cli.config.as_deref())
        .context("failed to load settings")?;
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    if let Some(menu) = &cli.menu {
        settings.catalog.menu_path = Some(menu.display().to_string());
    }
    if let Some(store) = &cli.store {
        settings.store.path = Some(store.display().to_string());
    }

    let telemetry = init_telemetry(TelemetryConfig::from_level_str(
        &settings.logging.level,
        settings.logging.json,
    ));
    tracing::info!("starting cartsync server");

    let catalog = match &settings.catalog.menu_path {
        Some(path) => {
            let catalog = InMemoryCatalog::load(Path::new(path))
                .with_context(|| format!("failed to load menu from {path}"))?;
            tracing::info!(path = %path, items = catalog.len(), "menu loaded");
            catalog
        }
        None => {
            tracing::warn!("no menu configured, every cart:add will be rejected");
            InMemoryCatalog::empty()
        }
    };

    let store: Arc<dyn CartStore> = match &settings.store.path {
        Some(path) => {
            let db = Database::open(Path::new(path))
                .with_context(|| format!("failed to open cart store at {path}"))?;
            let repo = CartRepo::new(db);
            tracing::info!(path = %path, carts = repo.count().unwrap_or(0), "cart store ready");
            Arc::new(repo)
        }
        None => {
            tracing::info!("no cart store configured, carts are kept in memory");
            Arc::new(MemoryStore::new())
        }
    };

    let handle = cartsync_server::start(
        ServerConfig::from_settings(&settings),
        Arc::new(catalog),
        store,
        telemetry.metrics(),
    )
    .await
    .context("failed to start server")?;

    tracing::info!(port = handle.port, "cartsync server ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
