//! Incremental quota restoration.
//!
//! Quota shrinks applied around evictions would otherwise be permanent. Each
//! `FailedCreate … exceeded quota` event means a workload controller wants to
//! scale but is being held by a shrunken quota, so every such signal releases
//! at most one slot back, up to the service's profiled ceiling. Restoration at
//! the rate of contention keeps the release gentle.

use crate::config::Config;

use models::constants::{
    EXCEEDED_QUOTA_FRAGMENT, FAILED_CREATE_REASON, WORKLOAD_CONTROLLER_KINDS,
};
use models::orchestrator::OrchestratorClient;
use models::profile::ProfileStore;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Event;
use kube::api::Api;
use kube::runtime::watcher::{watcher, Config as WatchConfig, Event as WatchEvent};
use snafu::ResultExt;
use tracing::{event, instrument, Level};

use error::Result;

pub struct QuotaReleaser<T: OrchestratorClient> {
    orchestrator: T,
    profile: ProfileStore,
    stream_idle_timeout_seconds: u32,
}

/// True for events that signal a workload controller held back by a pod
/// quota. The `FailedCreate` reason is already applied server-side as a field
/// selector; kind and message are checked here.
fn is_quota_contention(event: &Event) -> bool {
    if event.reason.as_deref() != Some(FAILED_CREATE_REASON) {
        return false;
    }
    let kind_matches = event
        .involved_object
        .kind
        .as_deref()
        .map(|kind| WORKLOAD_CONTROLLER_KINDS.contains(&kind))
        .unwrap_or(false);
    let message_matches = event
        .message
        .as_deref()
        .map(|message| message.contains(EXCEEDED_QUOTA_FRAGMENT))
        .unwrap_or(false);
    kind_matches && message_matches
}

impl<T: OrchestratorClient> QuotaReleaser<T> {
    pub fn new(orchestrator: T, profile: ProfileStore, config: &Config) -> Self {
        QuotaReleaser {
            orchestrator,
            profile,
            stream_idle_timeout_seconds: config.stream_idle_timeout_seconds,
        }
    }

    /// Runs the releaser worker. Watches cluster events indefinitely; stream
    /// errors are logged and the watch resumes.
    pub async fn run(&self, k8s_client: kube::client::Client) {
        let events: Api<Event> = Api::all(k8s_client);
        let watch_config = WatchConfig::default()
            .fields(&format!("reason={}", FAILED_CREATE_REASON))
            .timeout(self.stream_idle_timeout_seconds);

        event!(Level::INFO, "Quota releaser started.");
        let mut stream = watcher(events, watch_config).boxed();
        while let Some(item) = stream.next().await {
            match item {
                Ok(WatchEvent::Applied(cluster_event)) => {
                    self.process_event(&cluster_event).await;
                }
                Ok(WatchEvent::Restarted(cluster_events)) => {
                    for cluster_event in &cluster_events {
                        self.process_event(cluster_event).await;
                    }
                }
                Ok(WatchEvent::Deleted(_)) => {}
                Err(err) => {
                    event!(
                        Level::WARN,
                        error = %err,
                        "Event watch stream error; watch will resume."
                    );
                }
            }
        }
    }

    async fn process_event(&self, cluster_event: &Event) {
        if !is_quota_contention(cluster_event) {
            return;
        }
        let namespace = match cluster_event
            .involved_object
            .namespace
            .as_deref()
            .or(cluster_event.metadata.namespace.as_deref())
        {
            Some(namespace) => namespace,
            None => return,
        };
        if let Err(err) = self.release_one_slot(namespace).await {
            event!(
                Level::WARN,
                error = %err,
                namespace = %namespace,
                "Unable to release a quota slot; will retry on the next contention signal."
            );
        }
    }

    /// Raises the namespace quota by a single pod, bounded by the service's
    /// profiled `max_container`. Missing profile data makes this a no-op.
    #[instrument(skip(self), fields(service = %service))]
    async fn release_one_slot(&self, service: &str) -> Result<()> {
        let max_container = match self
            .profile
            .max_container(service)
            .await
            .context(error::ProfileReadSnafu)?
        {
            Some(max_container) => max_container,
            None => {
                event!(Level::DEBUG, "Service has no profile row; not releasing.");
                return Ok(());
            }
        };
        let current = match self
            .orchestrator
            .quota_pods(service)
            .await
            .context(error::OrchestratorOpSnafu)?
        {
            Some(current) => current,
            None => {
                event!(Level::DEBUG, "Namespace quota has no pod count; not releasing.");
                return Ok(());
            }
        };

        if current >= max_container {
            event!(
                Level::DEBUG,
                current,
                max_container,
                "Quota already at profiled ceiling."
            );
            return Ok(());
        }

        self.orchestrator
            .patch_quota_pods(service, current + 1)
            .await
            .context(error::OrchestratorOpSnafu)?;
        event!(
            Level::INFO,
            from = current,
            to = current + 1,
            max_container,
            "Released one quota slot."
        );
        Ok(())
    }
}

pub mod error {
    use models::orchestrator::OrchestratorClientError;
    use models::profile::ProfileStoreError;
    use snafu::Snafu;

    pub type Result<T> = std::result::Result<T, Error>;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to read profile: '{}'", source))]
        ProfileRead { source: ProfileStoreError },

        #[snafu(display("Orchestrator operation failed: '{}'", source))]
        OrchestratorOp { source: OrchestratorClientError },
    }
}
