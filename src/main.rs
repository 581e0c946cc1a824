//! Gateway entry point.
//!
//! Boots the audit store and IPC pipe, seeds the parachains, resets the
//! address pools, then runs the deposit server, withdrawal ingestor, and
//! ingot caster concurrently under the watchdog supervisor until a signal
//! or a load-bearing worker failure stops the process.

use std::sync::Arc;
use std::time::Duration;

use eyre::{eyre, Result};
use tracing::info;

use uia_gateway::config::Config;
use uia_gateway::context::GatewayContext;
use uia_gateway::db;
use uia_gateway::hostledger::WithdrawalIngestor;
use uia_gateway::ingots::IngotCaster;
use uia_gateway::parachain::{cache_doc, ParachainManager};
use uia_gateway::server;
use uia_gateway::types::ParachainFragment;

fn main() -> Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> Result<()> {
    init_logging();

    info!("Starting UIA Gateway");

    let config = Config::load()?;
    info!(
        offerings = ?config.offerings,
        host_nodes = config.host.nodes.len(),
        "Configuration loaded"
    );

    let pool = db::create_pool(&config.database.url).await?;
    info!("Audit database connected");
    db::run_migrations(&pool).await?;
    info!("Audit database migrations complete");

    let ctx = GatewayContext::assemble(config, pool)?;
    ctx.ipc.initialize().await?;
    ctx.watchdog.scrub().await?;

    // session start marker in every offering's archive
    for network in &ctx.config.offerings {
        ctx.chronicle
            .record(&ctx.system_event(*network), "initializing gateway main")
            .await?;
    }

    // all inbound addresses start available
    for network in &ctx.config.offerings {
        let pool_size = ctx.config.network(*network).accounts.len();
        ctx.allocator.initialize(*network, pool_size).await?;
    }

    let parachains = ParachainManager::spawn(ctx.clone());
    wait_for_parachains(&ctx).await?;

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(()).await;
    });

    info!("Workers initialized, gateway open");

    let toggles = ctx.config.processes.clone();
    tokio::select! {
        _ = shutdown_rx.recv() => {
            info!("Shutdown signal received, stopping gateway");
        }
        result = parachains.run() => {
            report("parachain manager", result);
        }
        result = when(toggles.deposits, server::serve(ctx.clone())) => {
            report("deposit server", result);
        }
        result = when(toggles.withdrawals, WithdrawalIngestor::run(ctx.clone())) => {
            report("withdrawal ingestor", result);
        }
        result = when(toggles.ingots, IngotCaster::run(ctx.clone())) => {
            report("ingot caster", result);
        }
        result = supervise(ctx.clone()) => {
            report("watchdog supervisor", result);
        }
    }

    info!("UIA Gateway stopped");
    Ok(())
}

/// Run a worker when its toggle is on; otherwise park the branch forever.
async fn when<F>(enabled: bool, worker: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    if enabled {
        worker.await
    } else {
        std::future::pending().await
    }
}

fn report(worker: &str, result: Result<()>) {
    match result {
        Ok(()) => tracing::error!(worker, "worker exited unexpectedly"),
        Err(err) => tracing::error!(worker, error = ?err, "worker stopped with error"),
    }
}

/// Block until every parachain cache is seeded, so the deposit surface
/// never opens against an empty cache.
async fn wait_for_parachains(ctx: &Arc<GatewayContext>) -> Result<()> {
    for network in &ctx.config.offerings {
        let doc = cache_doc(*network);
        let mut seeded = false;
        for _ in 0..240 {
            if let Ok(Some(cache)) = ctx.ipc.read::<ParachainFragment>(&doc).await {
                if let Some(latest) = cache.keys().next_back() {
                    info!(network = %network, block = latest, "parachain seeded");
                    seeded = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        if !seeded {
            return Err(eyre!("{network} parachain failed to initialize"));
        }
    }
    Ok(())
}

/// Main's side of the watchdog: refresh its own key and alert on stale
/// children.
async fn supervise(ctx: Arc<GatewayContext>) -> Result<()> {
    loop {
        tokio::time::sleep(Duration::from_secs(10)).await;
        ctx.watchdog.supervise().await?;
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,uia_gateway=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
