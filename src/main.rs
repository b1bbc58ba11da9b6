//! vfs-cache-tier binary: runs the cache over a directory backend and
//! serves its statistics for dashboards.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use vfs_cache_tier::config::{Cli, Config};
use vfs_cache_tier::server::metrics::Metrics;
use vfs_cache_tier::server::{build_router, AppState};
use vfs_cache_tier::{Coordinator, DirectoryBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "vfs_cache_tier=debug,tower_http=debug"
    } else {
        "vfs_cache_tier=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("vfs-cache-tier v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }

    info!(
        memory = config.tiers.memory_capacity_bytes,
        disk = config.tiers.disk_capacity_bytes,
        disk_path = %config.tiers.disk_path.display(),
        persistence = config.tiers.disk_persistence,
        "Tier capacities"
    );

    let backend = Arc::new(DirectoryBackend::new(&cli.backend_root));
    info!(root = %cli.backend_root.display(), "Serving content from directory backend");

    let listen_addr = config.server.listen.clone();
    let cache = Arc::new(Coordinator::new(config, backend).await?);

    let state = Arc::new(AppState {
        cache: cache.clone(),
        metrics: Metrics::new()?,
        start_time: Instant::now(),
    });
    let app = build_router(state);

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    cache.shutdown().await;
    Ok(())
}
