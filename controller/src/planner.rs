//! Eviction planning for pending pods that failed to schedule.
//!
//! Given a pending pod and its trigger service, the planner searches for a
//! single node on which evicting pods of lower-priority services frees enough
//! CPU and memory for the pending pod. Candidates are tried cheapest-to-restart
//! first (`t_cold`), then lowest priority (`weight`); the first feasible
//! (candidate, node) pair wins. No global optimum is sought.

use models::orchestrator::OrchestratorClient;
use models::profile::{ProfileStore, VictimCandidate};
use models::quantity;

use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::{event, instrument, Level};

use error::Result;

/// How a plan was assembled. Carries no behavioral meaning in the executor;
/// it exists for operator observability.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Strategy {
    #[serde(rename = "Single Service")]
    SingleService,
    #[serde(rename = "Cumulative Services")]
    CumulativeServices,
}

serde_plain::derive_display_from_serialize!(Strategy);

/// A number of pods to evict from one service on the plan's node.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Eviction {
    pub service: String,
    pub count: i64,
}

/// A feasible eviction plan: all victims come from a single node.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EvictionPlan {
    pub strategy: Strategy,
    pub node: String,
    pub evict_list: Vec<Eviction>,
}

/// Per-(candidate, node) eviction yield: what deleting pods of one service on
/// one node can free.
#[derive(Clone, Copy, Debug, Default)]
struct ServiceYield {
    /// CPU request of one pod, in millicores. The first Running pod of the
    /// service on the node is taken as the resource exemplar; homogeneity
    /// within (service, node) is assumed.
    pod_cpu_m: i64,
    /// Memory request of one pod, in bytes.
    pod_mem_bytes: i64,
    /// Number of victim-eligible pods of the service on the node.
    reducible_count: i64,
}

/// Minimum victims needed to cover one resource dimension, or `None` when the
/// dimension can never be covered by this candidate (a shortfall exists but
/// each victim frees nothing).
fn victims_for_dimension(request: i64, free: i64, per_pod: i64) -> Option<i64> {
    let shortfall = request - free;
    if shortfall <= 0 {
        return Some(0);
    }
    if per_pod <= 0 {
        return None;
    }
    Some((shortfall + per_pod - 1) / per_pod)
}

pub struct EvictionPlanner<T: OrchestratorClient> {
    orchestrator: T,
    profile: ProfileStore,
}

impl<T: OrchestratorClient> EvictionPlanner<T> {
    pub fn new(orchestrator: T, profile: ProfileStore) -> Self {
        EvictionPlanner {
            orchestrator,
            profile,
        }
    }

    /// Computes an eviction plan for a pending pod, or `None` when no
    /// combination of victims on any single node can satisfy its requests.
    #[instrument(skip(self, pending_pod), fields(trigger = %trigger_service))]
    pub async fn plan(
        &self,
        trigger_service: &str,
        pending_pod: &Pod,
    ) -> Result<Option<EvictionPlan>> {
        let (req_cpu, req_mem) = quantity::pod_requests(pending_pod);
        event!(
            Level::INFO,
            req_cpu_m = req_cpu,
            req_mem_bytes = req_mem,
            "Planning eviction for pending pod."
        );

        let candidates = self
            .profile
            .victim_candidates(trigger_service)
            .await
            .context(error::VictimCandidatesSnafu)?;
        let snapshots = self
            .profile
            .node_snapshots()
            .await
            .context(error::NodeSnapshotsSnafu)?;

        if let Some(plan) = self
            .single_service_plan(&candidates, &snapshots, req_cpu, req_mem)
            .await?
        {
            return Ok(Some(plan));
        }

        self.cumulative_plan(&candidates, &snapshots, req_cpu, req_mem)
            .await
    }

    /// Level 1: one candidate service on one node covers the whole request.
    async fn single_service_plan(
        &self,
        candidates: &[VictimCandidate],
        snapshots: &[models::profile::NodeResourceStatus],
        req_cpu: i64,
        req_mem: i64,
    ) -> Result<Option<EvictionPlan>> {
        for candidate in candidates {
            // Cluster-wide Running count, for the replica-floor check.
            let all_running = self
                .orchestrator
                .running_pods(&candidate.service)
                .await
                .context(error::OrchestratorReadSnafu)?
                .len() as i64;

            for snapshot in snapshots {
                let node_name = &snapshot.node_name;
                let (cpu_free, mem_free) = self.node_realtime_free(node_name).await?;
                let service_yield = self
                    .service_yield_on_node(&candidate.service, node_name)
                    .await?;
                event!(
                    Level::DEBUG,
                    service = %candidate.service,
                    node = %node_name,
                    reducible_count = service_yield.reducible_count,
                    cpu_free,
                    mem_free,
                    "Evaluated eviction candidate."
                );
                if service_yield.reducible_count == 0 {
                    continue;
                }

                let cpu_count =
                    victims_for_dimension(req_cpu, cpu_free, service_yield.pod_cpu_m);
                let mem_count =
                    victims_for_dimension(req_mem, mem_free, service_yield.pod_mem_bytes);
                let count = match (cpu_count, mem_count) {
                    (Some(cpu), Some(mem)) => cpu.max(mem),
                    // A needed dimension with zero per-pod yield can never be
                    // covered by this candidate on this node.
                    _ => continue,
                };

                if count > service_yield.reducible_count {
                    continue;
                }
                if all_running - count < candidate.min_container {
                    continue;
                }

                return Ok(Some(EvictionPlan {
                    strategy: Strategy::SingleService,
                    node: node_name.clone(),
                    evict_list: vec![Eviction {
                        service: candidate.service.clone(),
                        count,
                    }],
                }));
            }
        }
        Ok(None)
    }

    /// Level 2: accumulate candidates in priority order until one node has
    /// shed enough.
    ///
    /// Accumulators seed from the snapshotter's cached free capacity, not the
    /// live reads Level 1 uses, and no replica-floor check is applied to the
    /// victims taken at this level.
    async fn cumulative_plan(
        &self,
        candidates: &[VictimCandidate],
        snapshots: &[models::profile::NodeResourceStatus],
        req_cpu: i64,
        req_mem: i64,
    ) -> Result<Option<EvictionPlan>> {
        struct NodeState {
            node_name: String,
            cpu: i64,
            mem: i64,
            plan: Vec<Eviction>,
        }

        let mut states: Vec<NodeState> = snapshots
            .iter()
            .map(|snapshot| NodeState {
                node_name: snapshot.node_name.clone(),
                cpu: snapshot.cpu_free_m,
                mem: snapshot.mem_free_bytes,
                plan: Vec::new(),
            })
            .collect();

        for candidate in candidates {
            for state in states.iter_mut() {
                let service_yield = self
                    .service_yield_on_node(&candidate.service, &state.node_name)
                    .await?;
                if service_yield.reducible_count > 0 {
                    state.cpu += service_yield.reducible_count * service_yield.pod_cpu_m;
                    state.mem += service_yield.reducible_count * service_yield.pod_mem_bytes;
                    state.plan.push(Eviction {
                        service: candidate.service.clone(),
                        count: service_yield.reducible_count,
                    });
                }

                if state.cpu >= req_cpu && state.mem >= req_mem {
                    return Ok(Some(EvictionPlan {
                        strategy: Strategy::CumulativeServices,
                        node: state.node_name.clone(),
                        evict_list: state.plan.clone(),
                    }));
                }
            }
        }
        Ok(None)
    }

    /// Free capacity of a node right now: allocatable minus the requests of
    /// every pod still occupying it. The snapshotter's cadence is too coarse
    /// relative to admission dynamics, so this is read live per candidate node.
    async fn node_realtime_free(&self, node_name: &str) -> Result<(i64, i64)> {
        let (allocatable_cpu, allocatable_mem) = self
            .orchestrator
            .node_allocatable(node_name)
            .await
            .context(error::OrchestratorReadSnafu)?;
        let pods = self
            .orchestrator
            .active_pods_on_node(node_name)
            .await
            .context(error::OrchestratorReadSnafu)?;

        let (mut used_cpu, mut used_mem) = (0, 0);
        for pod in &pods {
            let (cpu, mem) = quantity::pod_requests(pod);
            used_cpu += cpu;
            used_mem += mem;
        }
        Ok((
            (allocatable_cpu - used_cpu).max(0),
            (allocatable_mem - used_mem).max(0),
        ))
    }

    async fn service_yield_on_node(&self, service: &str, node_name: &str) -> Result<ServiceYield> {
        let pods = self
            .orchestrator
            .running_pods_on_node(service, node_name)
            .await
            .context(error::OrchestratorReadSnafu)?;

        let exemplar = match pods.first() {
            Some(pod) => pod,
            None => return Ok(ServiceYield::default()),
        };
        let (pod_cpu_m, pod_mem_bytes) = quantity::pod_requests(exemplar);
        Ok(ServiceYield {
            pod_cpu_m,
            pod_mem_bytes,
            reducible_count: pods.len() as i64,
        })
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
        #[snafu(display("Unable to load victim candidates: '{}'", source))]
        VictimCandidates { source: ProfileStoreError },

        #[snafu(display("Unable to load node snapshots: '{}'", source))]
        NodeSnapshots { source: ProfileStoreError },

        #[snafu(display("Orchestrator read failed during planning: '{}'", source))]
        OrchestratorRead {
            source: OrchestratorClientError,
        },
    }
}
