use kube::{Api, Client};
use release_orchestrator::config::ControllerConfig;
use release_orchestrator::controller::analysis::AnalysisEngine;
use release_orchestrator::controller::clock::SystemClock;
use release_orchestrator::controller::driver::{self, DriverContext, ReconcileTrigger};
use release_orchestrator::controller::prometheus::PrometheusEvaluator;
use release_orchestrator::controller::release::{
    Context, KubeReleaseClient, KubeTrafficRouter, ReleaseStore,
};
use release_orchestrator::controller::signature::EcdsaP256Verifier;
use release_orchestrator::crd::release::Release;
use release_orchestrator::server::{
    create_metrics, run_health_server, shutdown_channel, wait_for_signal, ReadinessState,
};
use std::sync::Arc;
use tracing::{error, info, warn};

fn releases_api(client: Client, config: &ControllerConfig) -> Api<Release> {
    match &config.watch_namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = ControllerConfig::from_env()?;
    info!(
        prometheus = %config.prometheus_address,
        namespace = ?config.watch_namespace,
        max_concurrent = config.max_concurrent_reconciles,
        require_signature = config.require_signature,
        "Starting release controller"
    );

    let (shutdown_controller, shutdown_signal) = shutdown_channel();
    let readiness = ReadinessState::new();
    let metrics = create_metrics()?;

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    let health_readiness = readiness.clone();
    let health_metrics = metrics.clone();
    let health_port = config.health_port;
    let health_handle = tokio::spawn(async move {
        if let Err(e) = run_health_server(health_port, health_readiness, health_metrics).await {
            warn!(error = %e, "Health server failed");
        }
    });

    let ctx = Context {
        store: ReleaseStore::new(Arc::new(KubeReleaseClient::new(client.clone()))),
        router: Arc::new(KubeTrafficRouter::new(client.clone())),
        analysis: AnalysisEngine::new(
            Arc::new(PrometheusEvaluator::new(config.prometheus_address.clone())),
            config.query_timeout,
        ),
        verifier: Arc::new(EcdsaP256Verifier::new(config.require_signature)),
        clock: Arc::new(SystemClock),
        metrics: Some(metrics.clone()),
        conflict_retries: config.conflict_retries,
    };
    let driver_ctx = Arc::new(DriverContext::new(ctx, config.resync_interval));

    // The daemon has no command surface of its own; watch events drive it
    let (_trigger, triggers) = ReconcileTrigger::channel();

    let signal_readiness = readiness.clone();
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(name) => info!(signal = name, "Initiating graceful shutdown"),
            Err(e) => error!(error = %e, "Signal handling failed, shutting down"),
        }
        signal_readiness.set_not_ready();
        shutdown_controller.shutdown();
    });

    readiness.set_ready();
    info!("Controller ready, watching Releases");

    driver::run(
        releases_api(client, &config),
        driver_ctx,
        config.max_concurrent_reconciles,
        triggers,
        shutdown_signal,
    )
    .await;

    health_handle.abort();
    info!("Release controller shut down");
    Ok(())
}
