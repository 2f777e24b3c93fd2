//! ferryd — Ferry transfer relay daemon.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use ferry_core::config::FerryConfig;
use ferry_core::InstanceId;
use ferry_services::{CoordinatorConfig, MemoryMediator, MemoryStore, SessionCoordinator, Sweeper};

mod server;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = FerryConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = FerryConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        FerryConfig::default()
    });

    let instance = if config.instance.id.is_empty() {
        InstanceId::generate()
    } else {
        InstanceId(config.instance.id.clone())
    };
    tracing::info!(instance = %instance, "ferryd starting");

    // Shared registry and mediator. Both are in-process here; a deployment
    // behind a load balancer swaps in shared implementations of the traits.
    let store = Arc::new(MemoryStore::new());
    let mediator = Arc::new(MemoryMediator::new(config.mediator.channel_capacity));
    let coordinator_config = CoordinatorConfig::from(&config.sessions);
    tracing::info!(
        idle_timeout_secs = config.sessions.idle_timeout_secs,
        grace_period_secs = config.sessions.grace_period_secs,
        flow_window = coordinator_config.flow_window,
        "session settings"
    );
    let coordinator = Arc::new(SessionCoordinator::new(
        instance.clone(),
        store,
        mediator,
        coordinator_config,
    ));

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let sweeper_task = tokio::spawn(
        Sweeper::new(
            coordinator.clone(),
            config.sessions.sweep_interval(),
            shutdown_tx.subscribe(),
        )
        .run(),
    );

    let addr = format!("{}:{}", config.network.bind_addr, config.network.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(addr = %listener.local_addr()?, "listening for clients");

    let server_task = tokio::spawn(server::serve(
        listener,
        coordinator,
        instance,
        shutdown_tx.subscribe(),
    ));

    let (sweeper, server) = tokio::join!(sweeper_task, server_task);
    if let Err(e) = sweeper.context("sweeper task panicked")? {
        tracing::error!(error = %e, "sweeper failed");
    }
    if let Err(e) = server.context("server task panicked")? {
        tracing::error!(error = %e, "server failed");
    }

    tracing::info!("ferryd stopped");
    Ok(())
}
