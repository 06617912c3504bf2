//! sigmirror daemon entry point.

use std::sync::Arc;

use log::{error, info};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use sigmirror::config::Config;
use sigmirror::fetcher::{HttpFetcher, RemoteFetcher};
use sigmirror::mirror::MirrorDir;
use sigmirror::oracle::{DnsVersionOracle, NoOracle, VersionOracle};
use sigmirror::server::{run_server, ServerState};
use sigmirror::store::VersionStore;
use sigmirror::updater::{UpdateScheduler, Updater};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let cfg = Config::load()?;

    // Initialize logging
    let default_level = if cfg.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    cfg.validate()?;
    info!("Starting sigmirror with config: {:?}", cfg);

    // Shared on-disk state
    let mirror = MirrorDir::new(&cfg.data_dir);
    mirror.prepare().await?;
    let store = Arc::new(VersionStore::new(&cfg.data_dir));

    let fetcher: Arc<dyn RemoteFetcher> = Arc::new(HttpFetcher::new(
        &cfg.mirror_url,
        &cfg.user_agent,
        cfg.retry_policy(),
        cfg.request_timeout(),
    )?);
    let oracle: Arc<dyn VersionOracle> = match &cfg.dns_version_record {
        Some(record) => Arc::new(DnsVersionOracle::new(record.clone())),
        None => Arc::new(NoOracle),
    };
    let updater = Arc::new(Updater::new(
        Arc::clone(&store),
        mirror.clone(),
        fetcher,
        oracle,
        cfg.updater_settings(),
    ));
    for database in &cfg.databases {
        updater.seed_from_disk(database).await?;
    }

    // Bind before starting anything so a busy port stops the process.
    let listener = TcpListener::bind(cfg.listen_addr()?).await?;
    let shutdown = CancellationToken::new();

    // Updaters
    let scheduler = UpdateScheduler::start(
        Arc::clone(&updater),
        &cfg.databases,
        cfg.refresh_interval(),
        &shutdown,
    );

    // Mirror server
    let state = ServerState::new(mirror, Arc::clone(&store), &cfg.databases);
    let server_shutdown = shutdown.child_token();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = run_server(listener, state, server_shutdown).await {
            error!("Mirror server failed: {}", e);
        }
    });

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    shutdown.cancel();
    scheduler.shutdown().await;
    if let Err(e) = server_handle.await {
        error!("Mirror server task ended abnormally: {}", e);
    }

    info!("Shutdown complete.");
    Ok(())
}
