//! Scheduling-failure watcher.
//!
//! Observes pending pods cluster-wide, filters for unschedulable state,
//! debounces duplicates, and drives the planner. Planning and execution are
//! not synchronous with the next observation of the same pod, so a per-pod
//! cool-down absorbs the re-observations that arrive while a plan is still in
//! flight.

use crate::config::Config;
use crate::executor::EvictionExecutor;
use crate::planner::EvictionPlanner;

use models::constants::{POD_PHASE_PENDING, POD_SCHEDULED_CONDITION, UNSCHEDULABLE_REASONS};
use models::orchestrator::OrchestratorClient;
use models::profile::ProfileStore;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::core::ResourceExt;
use kube::runtime::watcher::{watcher, Config as WatchConfig, Event as WatchEvent};
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};
use tracing::{event, Level};

/// A keyed debounce window.
///
/// `admit` answers whether a key may pass right now: a key seen within the
/// window is rejected, a key older than the window (or never seen) passes and
/// its timestamp is reset. Entries for keys that never return are retained;
/// the maps are process-lifetime and keyed by short-lived pod uids.
struct Debounce<K> {
    window: Duration,
    last_seen: HashMap<K, Instant>,
}

impl<K: Eq + Hash> Debounce<K> {
    fn new(window: Duration) -> Self {
        Debounce {
            window,
            last_seen: HashMap::new(),
        }
    }

    fn admit(&mut self, key: K) -> bool {
        self.admit_at(key, Instant::now())
    }

    fn admit_at(&mut self, key: K, now: Instant) -> bool {
        if let Some(&last) = self.last_seen.get(&key) {
            if now.duration_since(last) < self.window {
                return false;
            }
        }
        self.last_seen.insert(key, now);
        true
    }
}

/// True when a pod is Pending with a negative scheduling condition whose
/// reason marks a scheduling failure we act on.
fn is_pending_unschedulable(pod: &Pod) -> bool {
    let status = match pod.status.as_ref() {
        Some(status) => status,
        None => return false,
    };
    if status.phase.as_deref() != Some(POD_PHASE_PENDING) {
        return false;
    }
    status
        .conditions
        .iter()
        .flatten()
        .filter(|condition| {
            condition.type_ == POD_SCHEDULED_CONDITION && condition.status == "False"
        })
        .any(|condition| {
            condition
                .reason
                .as_deref()
                .map(|reason| UNSCHEDULABLE_REASONS.contains(&reason))
                .unwrap_or(false)
        })
}

pub struct PendingPodWatcher<T: OrchestratorClient> {
    orchestrator: T,
    profile: ProfileStore,
    planner: EvictionPlanner<T>,
    executor: EvictionExecutor<T>,
    in_flight: Debounce<String>,
    print_gate: Debounce<(String, String, String)>,
    stream_idle_timeout_seconds: u32,
}

impl<T: OrchestratorClient> PendingPodWatcher<T> {
    pub fn new(orchestrator: T, profile: ProfileStore, config: &Config) -> Self {
        let planner = EvictionPlanner::new(orchestrator.clone(), profile.clone());
        let executor = EvictionExecutor::new(orchestrator.clone(), profile.clone());
        PendingPodWatcher {
            orchestrator,
            profile,
            planner,
            executor,
            in_flight: Debounce::new(config.in_flight_timeout),
            print_gate: Debounce::new(config.print_repeat),
            stream_idle_timeout_seconds: config.stream_idle_timeout_seconds,
        }
    }

    /// Runs the watcher worker. Watches pending pods indefinitely; stream
    /// errors are logged and the watch resumes from the last observed
    /// resource version. Duplicates redelivered across reconnects are
    /// absorbed by the cool-down.
    pub async fn run(mut self, k8s_client: kube::client::Client) {
        let pods: Api<Pod> = Api::all(k8s_client);
        let watch_config = WatchConfig::default()
            .fields(&format!("status.phase={}", POD_PHASE_PENDING))
            .timeout(self.stream_idle_timeout_seconds);

        event!(Level::INFO, "Scheduling-failure watcher started.");
        let mut stream = watcher(pods, watch_config).boxed();
        while let Some(item) = stream.next().await {
            match item {
                Ok(WatchEvent::Applied(pod)) => self.process_pending_pod(&pod).await,
                Ok(WatchEvent::Restarted(pods)) => {
                    for pod in &pods {
                        self.process_pending_pod(pod).await;
                    }
                }
                Ok(WatchEvent::Deleted(_)) => {}
                Err(err) => {
                    event!(
                        Level::WARN,
                        error = %err,
                        "Pod watch stream error; watch will resume."
                    );
                }
            }
        }
    }

    async fn process_pending_pod(&mut self, pod: &Pod) {
        if !is_pending_unschedulable(pod) {
            return;
        }

        let namespace = match pod.namespace() {
            Some(namespace) => namespace,
            None => return,
        };
        let name = pod.name_any();
        let uid = pod.uid().unwrap_or_default();
        // Deployment convention: each service runs in its own namespace.
        let service = namespace.clone();

        if !self.in_flight.admit(uid.clone()) {
            event!(
                Level::TRACE,
                pod = %name,
                "Pending pod re-observed within cool-down; skipping."
            );
            return;
        }
        if self.print_gate.admit((namespace.clone(), name.clone(), uid)) {
            event!(
                Level::INFO,
                pod = %name,
                namespace = %namespace,
                "Detected unschedulable pending pod."
            );
        }

        // Gate: a service already at its profiled ceiling must not displace
        // others.
        let max_container = match self.profile.max_container(&service).await {
            Ok(Some(max_container)) => max_container,
            Ok(None) => {
                event!(
                    Level::WARN,
                    service = %service,
                    "Service has no profile row; leaving pod Pending."
                );
                return;
            }
            Err(err) => {
                event!(
                    Level::WARN,
                    error = %err,
                    service = %service,
                    "Profile read failed; leaving pod Pending."
                );
                return;
            }
        };
        let running = match self.orchestrator.running_pods(&service).await {
            Ok(pods) => pods.len() as i64,
            Err(err) => {
                event!(
                    Level::WARN,
                    error = %err,
                    service = %service,
                    "Unable to count running pods; leaving pod Pending."
                );
                return;
            }
        };
        if running >= max_container {
            event!(
                Level::INFO,
                running,
                max_container,
                service = %service,
                "Service is at its container ceiling; not planning."
            );
            return;
        }

        match self.planner.plan(&service, pod).await {
            Ok(Some(plan)) => {
                event!(
                    Level::INFO,
                    strategy = %plan.strategy,
                    node = %plan.node,
                    evictions = plan.evict_list.len(),
                    "Eviction plan found."
                );
                self.executor.execute(&plan).await;
            }
            Ok(None) => {
                event!(
                    Level::WARN,
                    service = %service,
                    "No feasible eviction plan; falling back to trigger quota shrink."
                );
                if let Err(err) = self.executor.shrink_trigger_quota(&service, pod).await {
                    event!(
                        Level::ERROR,
                        error = %err,
                        service = %service,
                        "Quota-shrink fallback failed."
                    );
                }
            }
            Err(err) => {
                event!(
                    Level::ERROR,
                    error = %err,
                    service = %service,
                    "Planning failed; pod left Pending."
                );
            }
        }
    }
}
