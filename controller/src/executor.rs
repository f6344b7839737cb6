//! Applies eviction plans, and the quota-shrink fallback for when no plan is
//! feasible.

use crate::planner::{Eviction, EvictionPlan};

use models::orchestrator::OrchestratorClient;
use models::profile::ProfileStore;

use k8s_openapi::api::core::v1::Pod;
use kube::core::ResourceExt;
use snafu::ResultExt;
use tracing::{event, instrument, Level};

use error::Result;

// Short grace period so victims can drain in-flight requests.
const EVICTION_GRACE_PERIOD_SECONDS: u32 = 1;

pub struct EvictionExecutor<T: OrchestratorClient> {
    orchestrator: T,
    profile: ProfileStore,
}

impl<T: OrchestratorClient> EvictionExecutor<T> {
    pub fn new(orchestrator: T, profile: ProfileStore) -> Self {
        EvictionExecutor {
            orchestrator,
            profile,
        }
    }

    /// Applies a plan. Victim namespaces are processed independently: a
    /// failure on one is logged and does not abort the others, and nothing is
    /// retried inline. The next pending event re-enters planning.
    #[instrument(skip(self, plan), fields(node = %plan.node, strategy = %plan.strategy))]
    pub async fn execute(&self, plan: &EvictionPlan) {
        for eviction in &plan.evict_list {
            if let Err(err) = self.evict_service(&plan.node, eviction).await {
                event!(
                    Level::ERROR,
                    error = %err,
                    service = %eviction.service,
                    "Failed to evict pods for service."
                );
            }
        }
    }

    async fn evict_service(&self, node_name: &str, eviction: &Eviction) -> Result<()> {
        let service = &eviction.service;
        let local_pods = self
            .orchestrator
            .running_pods_on_node(service, node_name)
            .await
            .context(error::OrchestratorOpSnafu)?;
        let global_count = self
            .orchestrator
            .running_pods(service)
            .await
            .context(error::OrchestratorOpSnafu)?
            .len() as i64;

        // Shrink the quota before deleting anything, so the workload
        // controller cannot spawn replacements while the victims terminate.
        // The releaser restores the quota once admission contention shows up.
        let quota = global_count - eviction.count;
        self.orchestrator
            .patch_quota_pods(service, quota)
            .await
            .context(error::OrchestratorOpSnafu)?;
        event!(
            Level::INFO,
            service = %service,
            global_count,
            needed_count = eviction.count,
            quota,
            "Shrank namespace pod quota ahead of eviction."
        );

        let mut evicted = 0;
        for pod in local_pods.iter().take(eviction.count.max(0) as usize) {
            event!(Level::INFO, pod = %pod.name_any(), "Deleting victim pod.");
            self.orchestrator
                .delete_pod(
                    service,
                    &pod.name_any(),
                    Some(EVICTION_GRACE_PERIOD_SECONDS),
                )
                .await
                .context(error::OrchestratorOpSnafu)?;
            evicted += 1;
        }
        event!(
            Level::INFO,
            service = %service,
            node = %node_name,
            evicted,
            "Evicted pods from service."
        );
        Ok(())
    }

    /// Self-limiting fallback for when no one else can yield: lower the
    /// trigger's own ceiling by one and remove the pending pod, so the
    /// workload controller observes a stable target instead of a lingering
    /// Pending pod.
    ///
    /// The quota is never lowered below the service's replica floor; at the
    /// floor the pod is left Pending so it can schedule the moment capacity
    /// frees up elsewhere.
    #[instrument(skip(self, pending_pod), fields(service = %service))]
    pub async fn shrink_trigger_quota(&self, service: &str, pending_pod: &Pod) -> Result<()> {
        let min_container = match self
            .profile
            .min_container(service)
            .await
            .context(error::ProfileReadSnafu)?
        {
            Some(min_container) => min_container,
            None => {
                event!(
                    Level::WARN,
                    "Service has no profile row; leaving pod Pending."
                );
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
                event!(Level::WARN, "Namespace quota has no pod count; leaving pod Pending.");
                return Ok(());
            }
        };

        if current <= min_container {
            event!(
                Level::INFO,
                current,
                min_container,
                "Quota already at replica floor; leaving pod Pending until capacity frees up."
            );
            return Ok(());
        }

        self.orchestrator
            .patch_quota_pods(service, current - 1)
            .await
            .context(error::OrchestratorOpSnafu)?;
        event!(
            Level::INFO,
            from = current,
            to = current - 1,
            "Shrank trigger namespace quota."
        );

        self.orchestrator
            .delete_pod(service, &pending_pod.name_any(), None)
            .await
            .context(error::OrchestratorOpSnafu)?;
        event!(Level::INFO, pod = %pending_pod.name_any(), "Deleted pending pod.");
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
        #[snafu(display("Orchestrator operation failed: '{}'", source))]
        OrchestratorOp { source: OrchestratorClientError },

        #[snafu(display("Unable to read profile: '{}'", source))]
        ProfileRead { source: ProfileStoreError },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::planner::test::{fake_pod, fake_pods, profile_fixture};
    use crate::planner::Strategy;

    use kube::core::ErrorResponse;
    use mockall::Sequence;
    use models::orchestrator::error as orchestrator_error;
    use models::orchestrator::MockOrchestratorClient;

    fn single_service_plan(service: &str, count: i64) -> EvictionPlan {
        EvictionPlan {
            strategy: Strategy::SingleService,
            node: "node-1".to_string(),
            evict_list: vec![Eviction {
                service: service.to_string(),
                count,
            }],
        }
    }

    fn list_error(namespace: &str) -> orchestrator_error::OrchestratorClientError {
        orchestrator_error::OrchestratorClientError::ListPods {
            source: kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: "boom".to_string(),
                reason: "InternalError".to_string(),
                code: 500,
            }),
            namespace: namespace.to_string(),
            field_selector: "status.phase=Running".to_string(),
        }
    }

    /// The quota shrinks to `global_count - needed_count` before any victim
    /// is deleted, and exactly `needed_count` local pods are removed with the
    /// short grace period.
    #[tokio::test]
    async fn quota_shrinks_before_victims_are_deleted() {
        let profile = profile_fixture(&[("svc-b", 10, 5.0, 1, 4)], &[]).await;
        let mut orchestrator = MockOrchestratorClient::new();
        let mut order = Sequence::new();

        orchestrator
            .expect_running_pods_on_node()
            .times(1)
            .returning(|_, _| Ok(fake_pods("svc-b", 3, "500m", "512Mi")));
        orchestrator
            .expect_running_pods()
            .times(1)
            .returning(|_| Ok(fake_pods("svc-b", 4, "500m", "512Mi")));
        orchestrator
            .expect_patch_quota_pods()
            .withf(|namespace, pods| namespace == "svc-b" && *pods == 2)
            .times(1)
            .in_sequence(&mut order)
            .returning(|_, _| Ok(()));
        orchestrator
            .expect_delete_pod()
            .withf(|namespace, pod, grace| {
                namespace == "svc-b" && pod == "svc-b-0" && *grace == Some(1)
            })
            .times(1)
            .in_sequence(&mut order)
            .returning(|_, _, _| Ok(()));
        orchestrator
            .expect_delete_pod()
            .withf(|namespace, pod, grace| {
                namespace == "svc-b" && pod == "svc-b-1" && *grace == Some(1)
            })
            .times(1)
            .in_sequence(&mut order)
            .returning(|_, _, _| Ok(()));

        let executor = EvictionExecutor::new(orchestrator, profile);
        executor.execute(&single_service_plan("svc-b", 2)).await;
    }

    /// A failure in one victim namespace does not abort the rest of the plan.
    #[tokio::test]
    async fn victim_namespaces_are_isolated() {
        let profile = profile_fixture(&[], &[]).await;
        let mut orchestrator = MockOrchestratorClient::new();

        orchestrator
            .expect_running_pods_on_node()
            .returning(|namespace, _| match namespace {
                "svc-b" => Err(list_error("svc-b")),
                _ => Ok(fake_pods(namespace, 2, "250m", "256Mi")),
            });
        orchestrator
            .expect_running_pods()
            .returning(|namespace| Ok(fake_pods(namespace, 2, "250m", "256Mi")));
        orchestrator
            .expect_patch_quota_pods()
            .withf(|namespace, pods| namespace == "svc-c" && *pods == 1)
            .times(1)
            .returning(|_, _| Ok(()));
        orchestrator
            .expect_delete_pod()
            .withf(|namespace, pod, grace| {
                namespace == "svc-c" && pod == "svc-c-0" && *grace == Some(1)
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let plan = EvictionPlan {
            strategy: Strategy::CumulativeServices,
            node: "node-1".to_string(),
            evict_list: vec![
                Eviction {
                    service: "svc-b".to_string(),
                    count: 1,
                },
                Eviction {
                    service: "svc-c".to_string(),
                    count: 1,
                },
            ],
        };

        let executor = EvictionExecutor::new(orchestrator, profile);
        executor.execute(&plan).await;
    }

    /// Re-running the same plan over unchanged orchestrator state converges:
    /// the quota patch lands on the same value both times.
    #[tokio::test]
    async fn repeated_execution_converges() {
        let profile = profile_fixture(&[], &[]).await;
        let mut orchestrator = MockOrchestratorClient::new();

        orchestrator
            .expect_running_pods_on_node()
            .returning(|_, _| Ok(fake_pods("svc-b", 3, "500m", "512Mi")));
        orchestrator
            .expect_running_pods()
            .returning(|_| Ok(fake_pods("svc-b", 4, "500m", "512Mi")));
        orchestrator
            .expect_patch_quota_pods()
            .withf(|namespace, pods| namespace == "svc-b" && *pods == 2)
            .times(2)
            .returning(|_, _| Ok(()));
        orchestrator
            .expect_delete_pod()
            .times(4)
            .returning(|_, _, _| Ok(()));

        let executor = EvictionExecutor::new(orchestrator, profile);
        let plan = single_service_plan("svc-b", 2);
        executor.execute(&plan).await;
        executor.execute(&plan).await;
    }

    /// Fallback: no feasible plan, quota above the floor. The trigger's own
    /// quota drops by one and the pending pod is removed.
    #[tokio::test]
    async fn fallback_decrements_quota_and_deletes_pending_pod() {
        let profile = profile_fixture(&[("svc-a", 1, 1000.0, 1, 3)], &[]).await;
        let mut orchestrator = MockOrchestratorClient::new();
        let mut order = Sequence::new();

        orchestrator
            .expect_quota_pods()
            .times(1)
            .returning(|_| Ok(Some(2)));
        orchestrator
            .expect_patch_quota_pods()
            .withf(|namespace, pods| namespace == "svc-a" && *pods == 1)
            .times(1)
            .in_sequence(&mut order)
            .returning(|_, _| Ok(()));
        orchestrator
            .expect_delete_pod()
            .withf(|namespace, pod, grace| {
                namespace == "svc-a" && pod == "a-pending" && grace.is_none()
            })
            .times(1)
            .in_sequence(&mut order)
            .returning(|_, _, _| Ok(()));

        let executor = EvictionExecutor::new(orchestrator, profile);
        let pending = fake_pod("svc-a", "a-pending", "600m", "600Mi");
        executor
            .shrink_trigger_quota("svc-a", &pending)
            .await
            .unwrap();
    }

    /// Fallback at the replica floor: nothing is patched or deleted, and the
    /// pod stays Pending.
    #[tokio::test]
    async fn fallback_at_floor_leaves_pod_pending() {
        let profile = profile_fixture(&[("svc-a", 1, 1000.0, 1, 3)], &[]).await;
        let mut orchestrator = MockOrchestratorClient::new();

        orchestrator
            .expect_quota_pods()
            .times(1)
            .returning(|_| Ok(Some(1)));
        orchestrator.expect_patch_quota_pods().never();
        orchestrator.expect_delete_pod().never();

        let executor = EvictionExecutor::new(orchestrator, profile);
        let pending = fake_pod("svc-a", "a-pending", "600m", "600Mi");
        executor
            .shrink_trigger_quota("svc-a", &pending)
            .await
            .unwrap();
    }

    /// Fallback with no profile row: missing data makes the decision a no-op.
    #[tokio::test]
    async fn fallback_without_profile_row_is_noop() {
        let profile = profile_fixture(&[], &[]).await;
        let mut orchestrator = MockOrchestratorClient::new();
        orchestrator.expect_quota_pods().never();
        orchestrator.expect_patch_quota_pods().never();
        orchestrator.expect_delete_pod().never();

        let executor = EvictionExecutor::new(orchestrator, profile);
        let pending = fake_pod("svc-a", "a-pending", "600m", "600Mi");
        executor
            .shrink_trigger_quota("svc-a", &pending)
            .await
            .unwrap();
    }
}
