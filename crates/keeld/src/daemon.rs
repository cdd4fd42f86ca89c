//! Daemon assembly: open the store, build the gateways, start every
//! control loop and serve the API until Ctrl-C.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use keel_api::{ApiState, build_router};
use keel_autoscale::{Autoscaler, AutoscalerSettings};
use keel_core::KeelConfig;
use keel_core::config::WorkloadConfig;
use keel_gateway::command::{CommandPlatform, CommandScanner, CommandToolchain};
use keel_gateway::fs::FsArtifactStore;
use keel_gateway::manifests::StoreManifests;
use keel_gateway::{ArtifactStore, ManifestRepository, Platform};
use keel_pipeline::{Dispatcher, Gateways, PipelineEngine, StageGraph};
use keel_reconcile::{Reconciler, ReconcilerSettings, SyncSet};
use keel_state::StateStore;

pub async fn run(config: KeelConfig, data_dir: PathBuf, port: u16) -> anyhow::Result<()> {
    info!("keel daemon starting");

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("keel.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let manifests: Arc<dyn ManifestRepository> = Arc::new(StoreManifests::new(store.clone()));
    let artifacts: Arc<dyn ArtifactStore> =
        Arc::new(FsArtifactStore::new(data_dir.join("artifacts")));

    let platform: Arc<dyn Platform> = Arc::new(CommandPlatform::new(
        config.platform.clone(),
        config.platform.timeout()?,
    ));
    if !config.reconcile.sets.is_empty() && !config.platform.can_reconcile() {
        warn!("platform observe/apply/health commands not configured, sync sets will report unknown");
    }

    let stage_timeout = config.pipeline.stage_timeout()?;
    let gateways = Gateways {
        toolchain: Arc::new(CommandToolchain::new(config.toolchain.clone(), stage_timeout)),
        scanner: Arc::new(CommandScanner::new(config.scanner.clone(), stage_timeout)),
        artifacts: artifacts.clone(),
        manifests: manifests.clone(),
    };
    let engine = PipelineEngine::new(
        StageGraph::standard(),
        gateways,
        store.clone(),
        &config.pipeline,
    )?
    .with_workloads(&config.workloads);
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(engine), config.pipeline.supersede));
    info!(
        supersede = ?config.pipeline.supersede,
        threshold = %config.pipeline.severity_threshold,
        "pipeline dispatcher initialized"
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    // ── Reconcile loops ────────────────────────────────────────

    let settings = ReconcilerSettings::from_config(&config.reconcile)?;
    let interval = config.reconcile.interval()?;
    let mut reconcilers = Vec::new();
    for set_config in &config.reconcile.sets {
        let set = SyncSet::from_config(set_config, &config.reconcile);
        info!(set = %set.name, workloads = ?set.workloads, "reconciler initialized");
        let reconciler = Arc::new(Reconciler::new(
            set,
            settings.clone(),
            manifests.clone(),
            platform.clone(),
            store.clone(),
        ));
        reconcilers.push(reconciler.clone());
        handles.push(tokio::spawn(reconciler.run(
            interval,
            store.subscribe_manifests(),
            shutdown_rx.clone(),
        )));
    }

    // ── Autoscaler loops ───────────────────────────────────────

    let scaler_settings = AutoscalerSettings::from_config(&config.autoscale)?;
    let scale_interval = config.autoscale.interval()?;
    let scaled_workloads: &[WorkloadConfig] = if config.platform.can_scale() {
        config.workloads.as_slice()
    } else {
        if !config.workloads.is_empty() {
            warn!("platform scale/load commands not configured, autoscaling disabled");
        }
        &[]
    };
    for workload in scaled_workloads {
        let mut autoscaler = Autoscaler::new(
            &workload.name,
            scaler_settings.clone(),
            manifests.clone(),
            platform.clone(),
            store.clone(),
        );
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            autoscaler.run(scale_interval, shutdown).await;
        }));
    }

    // ── Start API server ───────────────────────────────────────

    let router = build_router(ApiState::new(
        store,
        artifacts,
        dispatcher.clone(),
        reconcilers,
    ));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c, shutting down");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });
    server.await?;

    // Queued and active runs are marked cancelled before the loops exit.
    dispatcher.shutdown().await;
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "control loop panicked");
        }
    }

    info!("keel daemon stopped");
    Ok(())
}
