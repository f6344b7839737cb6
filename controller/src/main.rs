use controller::config::Config;
use controller::error::{self, Result};
use controller::releaser::QuotaReleaser;
use controller::watcher::PendingPodWatcher;

use models::constants::CONTROLLER;
use models::orchestrator::KubeOrchestratorClient;
use models::profile::ProfileStore;
use models::telemetry::init_telemetry_from_env;

use snafu::ResultExt;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{event, Level};

#[tokio::main]
async fn main() -> Result<()> {
    init_telemetry_from_env().context(error::TelemetryConfigurationSnafu)?;

    let config = Config::from_env().context(error::ConfigLoadSnafu)?;
    event!(Level::INFO, ?config, "Starting {}.", CONTROLLER);

    // Ambient cluster credentials are tried first, then a local kubeconfig.
    let k8s_client = kube::client::Client::try_default()
        .await
        .context(error::ClientCreateSnafu)?;
    let profile = ProfileStore::open(&config.profile_store_path)
        .await
        .context(error::ProfileStoreOpenSnafu)?;
    let orchestrator = KubeOrchestratorClient::new(k8s_client.clone(), &config.pod_quota_name);

    let pending_watcher =
        PendingPodWatcher::new(orchestrator.clone(), profile.clone(), &config);
    let releaser = QuotaReleaser::new(orchestrator, profile, &config);

    let mut sigterm = signal(SignalKind::terminate()).context(error::SignalHandlerSnafu)?;
    let mut sigint = signal(SignalKind::interrupt()).context(error::SignalHandlerSnafu)?;

    // The two workers are independent; either exiting is unexpected. A stop
    // signal drops both watch streams and ends the process cleanly.
    tokio::select! {
        _ = pending_watcher.run(k8s_client.clone()) => {
            event!(Level::ERROR, "Scheduling-failure watcher exited.");
        },
        _ = releaser.run(k8s_client) => {
            event!(Level::ERROR, "Quota releaser exited.");
        },
        _ = sigterm.recv() => {
            event!(Level::INFO, "Received SIGTERM; shutting down.");
        },
        _ = sigint.recv() => {
            event!(Level::INFO, "Received SIGINT; shutting down.");
        },
    };
    Ok(())
}
