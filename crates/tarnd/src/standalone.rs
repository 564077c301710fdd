//! Standalone mode: the controller runs against a [`LocalCluster`] built
//! from the `[cluster]` node list, with the API server in the same
//! process.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tarn_api::{ApiState, authorizer_from_config, build_router, catalog_for};
use tarn_core::TarnConfig;
use tarn_health::HttpProbe;
use tarn_scheduler::{ControllerSettings, LocalCluster, ReplicaSetController};
use tokio::sync::watch;
use tracing::{info, warn};

pub async fn run_standalone(config: TarnConfig) -> anyhow::Result<()> {
    info!(
        nodes = config.cluster.nodes.len(),
        repository = %config.server.model_repository,
        "Tarn daemon starting in standalone mode"
    );

    // ── Controller ──────────────────────────────────────────────

    let settings = ControllerSettings::from_config(&config)?;
    let cluster = Arc::new(LocalCluster::from_config(&config.cluster));
    let probe = Arc::new(
        HttpProbe::triton(config.server.http_port, config.server.metrics_port)
            .with_timeouts(config.ready_timeout()?, config.probe_timeout()?),
    );
    let controller = ReplicaSetController::new(settings, Arc::clone(&cluster), cluster, probe);
    let handle = controller.handle();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut controller_task = tokio::spawn(controller.run(shutdown_rx.clone()));

    // ── API server ──────────────────────────────────────────────

    let state = ApiState {
        controller: handle,
        authorizer: authorizer_from_config(&config.api),
        catalog: catalog_for(&config.server.model_repository),
        token: config.api.token.clone(),
        replica_http_port: config.server.http_port,
    };
    let router = build_router(state);
    let addr: SocketAddr = format!("{}:{}", config.api.bind_address, config.api.port)
        .parse()
        .with_context(|| format!("invalid API address {}", config.api.bind_address))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server starting");

    let mut api_shutdown = shutdown_rx;
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = api_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });

    // ── Shutdown ────────────────────────────────────────────────

    let controller_result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("shutdown signal received"),
                Err(e) => warn!(error = %e, "failed to listen for ctrl-c, shutting down"),
            }
            let _ = shutdown_tx.send(true);
            controller_task.await
        }
        result = &mut controller_task => {
            warn!("controller exited, stopping API server");
            let _ = shutdown_tx.send(true);
            result
        }
    };

    server.await?.context("API server failed")?;
    controller_result?.context("controller failed")?;

    info!("Tarn daemon stopped");
    Ok(())
}
