//! Client seam between the controller and the orchestrator API.
//!
//! Provided as a trait so planning and execution logic can be exercised
//! against mocks; the concrete implementation talks to Kubernetes through
//! `kube`.

use crate::constants::{POD_PHASE_RUNNING, QUOTA_PODS_KEY};
use crate::quantity;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod, ResourceQuota};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use snafu::ResultExt;
use std::sync::Arc;
use tracing::instrument;

use error::Result;

#[cfg(feature = "mockall")]
use mockall::mock;

/// A trait providing the orchestrator operations needed for eviction planning
/// and execution. This is provided as a trait in order to allow mocks to be
/// used for testing purposes.
///
/// All pod listings exclude pods that carry a deletion timestamp: a pod that
/// is already on its way out neither yields capacity nor counts against a
/// service's running total.
#[async_trait]
pub trait OrchestratorClient: Clone + Sized + Send + Sync {
    /// Running pods of a namespace, cluster-wide.
    async fn running_pods(&self, namespace: &str) -> Result<Vec<Pod>>;
    /// Running pods of a namespace on a single node.
    async fn running_pods_on_node(&self, namespace: &str, node_name: &str) -> Result<Vec<Pod>>;
    /// All pods on a node that still occupy capacity (not Succeeded/Failed),
    /// across namespaces.
    async fn active_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>>;
    /// A node's allocatable capacity as (millicores, bytes).
    async fn node_allocatable(&self, node_name: &str) -> Result<(i64, i64)>;
    /// Deletes a namespaced pod, optionally with a grace period in seconds.
    async fn delete_pod(
        &self,
        namespace: &str,
        pod_name: &str,
        grace_period_seconds: Option<u32>,
    ) -> Result<()>;
    /// The namespace quota's current `spec.hard.pods`, if set.
    async fn quota_pods(&self, namespace: &str) -> Result<Option<i64>>;
    /// Merge-patches the namespace quota's `spec.hard.pods`.
    async fn patch_quota_pods(&self, namespace: &str, pods: i64) -> Result<()>;
}

#[cfg(feature = "mockall")]
mock! {
    /// A Mock OrchestratorClient for use in tests.
    pub OrchestratorClient {}
    #[async_trait]
    impl OrchestratorClient for OrchestratorClient {
        async fn running_pods(&self, namespace: &str) -> Result<Vec<Pod>>;
        async fn running_pods_on_node(&self, namespace: &str, node_name: &str) -> Result<Vec<Pod>>;
        async fn active_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>>;
        async fn node_allocatable(&self, node_name: &str) -> Result<(i64, i64)>;
        async fn delete_pod(
            &self,
            namespace: &str,
            pod_name: &str,
            grace_period_seconds: Option<u32>,
        ) -> Result<()>;
        async fn quota_pods(&self, namespace: &str) -> Result<Option<i64>>;
        async fn patch_quota_pods(&self, namespace: &str, pods: i64) -> Result<()>;
    }

    impl Clone for OrchestratorClient {
        fn clone(&self) -> Self;
    }
}

#[async_trait]
impl<T> OrchestratorClient for Arc<T>
where
    T: OrchestratorClient,
{
    async fn running_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        (**self).running_pods(namespace).await
    }

    async fn running_pods_on_node(&self, namespace: &str, node_name: &str) -> Result<Vec<Pod>> {
        (**self).running_pods_on_node(namespace, node_name).await
    }

    async fn active_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>> {
        (**self).active_pods_on_node(node_name).await
    }

    async fn node_allocatable(&self, node_name: &str) -> Result<(i64, i64)> {
        (**self).node_allocatable(node_name).await
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        pod_name: &str,
        grace_period_seconds: Option<u32>,
    ) -> Result<()> {
        (**self)
            .delete_pod(namespace, pod_name, grace_period_seconds)
            .await
    }

    async fn quota_pods(&self, namespace: &str) -> Result<Option<i64>> {
        (**self).quota_pods(namespace).await
    }

    async fn patch_quota_pods(&self, namespace: &str, pods: i64) -> Result<()> {
        (**self).patch_quota_pods(namespace, pods).await
    }
}

#[derive(Clone)]
/// Concrete implementation of the `OrchestratorClient` trait against the
/// Kubernetes API.
pub struct KubeOrchestratorClient {
    k8s_client: kube::client::Client,
    quota_name: String,
}

impl KubeOrchestratorClient {
    pub fn new(k8s_client: kube::client::Client, quota_name: &str) -> Self {
        KubeOrchestratorClient {
            k8s_client,
            quota_name: quota_name.to_string(),
        }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.k8s_client.clone(), namespace)
    }

    fn quotas(&self, namespace: &str) -> Api<ResourceQuota> {
        Api::namespaced(self.k8s_client.clone(), namespace)
    }

    async fn list_pods(&self, namespace: &str, field_selector: &str) -> Result<Vec<Pod>> {
        let pods = self
            .pods(namespace)
            .list(&ListParams::default().fields(field_selector))
            .await
            .context(error::ListPodsSnafu {
                namespace,
                field_selector,
            })?;
        Ok(strip_terminating(pods.items))
    }
}

/// Drops pods that are already marked for deletion.
fn strip_terminating(pods: Vec<Pod>) -> Vec<Pod> {
    pods.into_iter()
        .filter(|pod| pod.metadata.deletion_timestamp.is_none())
        .collect()
}

#[async_trait]
impl OrchestratorClient for KubeOrchestratorClient {
    #[instrument(skip(self), err)]
    async fn running_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        let selector = format!("status.phase={}", POD_PHASE_RUNNING);
        self.list_pods(namespace, &selector).await
    }

    #[instrument(skip(self), err)]
    async fn running_pods_on_node(&self, namespace: &str, node_name: &str) -> Result<Vec<Pod>> {
        let selector = format!(
            "spec.nodeName={},status.phase={}",
            node_name, POD_PHASE_RUNNING
        );
        self.list_pods(namespace, &selector).await
    }

    #[instrument(skip(self), err)]
    async fn active_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>> {
        let selector = format!(
            "spec.nodeName={},status.phase!=Succeeded,status.phase!=Failed",
            node_name
        );
        let pods = Api::<Pod>::all(self.k8s_client.clone())
            .list(&ListParams::default().fields(&selector))
            .await
            .context(error::ListPodsSnafu {
                namespace: "",
                field_selector: selector.clone(),
            })?;
        Ok(pods.items)
    }

    #[instrument(skip(self), err)]
    async fn node_allocatable(&self, node_name: &str) -> Result<(i64, i64)> {
        let node = Api::<Node>::all(self.k8s_client.clone())
            .get(node_name)
            .await
            .context(error::GetNodeSnafu { node_name })?;

        let allocatable = node.status.and_then(|status| status.allocatable);
        let cpu = allocatable
            .as_ref()
            .and_then(|alloc| alloc.get("cpu"))
            .map(|q| quantity::parse_cpu_millis(&q.0))
            .unwrap_or(0);
        let mem = allocatable
            .as_ref()
            .and_then(|alloc| alloc.get("memory"))
            .map(|q| quantity::parse_mem_bytes(&q.0))
            .unwrap_or(0);
        Ok((cpu, mem))
    }

    #[instrument(skip(self), err)]
    async fn delete_pod(
        &self,
        namespace: &str,
        pod_name: &str,
        grace_period_seconds: Option<u32>,
    ) -> Result<()> {
        let params = match grace_period_seconds {
            Some(seconds) => DeleteParams::default().grace_period(seconds),
            None => DeleteParams::default(),
        };
        self.pods(namespace)
            .delete(pod_name, &params)
            .await
            .context(error::DeletePodSnafu {
                namespace,
                pod_name,
            })?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn quota_pods(&self, namespace: &str) -> Result<Option<i64>> {
        let quota = self
            .quotas(namespace)
            .get(&self.quota_name)
            .await
            .context(error::ReadQuotaSnafu {
                namespace,
                quota_name: &self.quota_name,
            })?;

        Ok(quota
            .spec
            .and_then(|spec| spec.hard)
            .and_then(|hard| hard.get(QUOTA_PODS_KEY).and_then(|q| q.0.parse::<i64>().ok())))
    }

    #[instrument(skip(self), err)]
    async fn patch_quota_pods(&self, namespace: &str, pods: i64) -> Result<()> {
        let patch = serde_json::json!({
            "spec": {
                "hard": {
                    QUOTA_PODS_KEY: pods.to_string(),
                }
            }
        });
        self.quotas(namespace)
            .patch(
                &self.quota_name,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
            .context(error::PatchQuotaSnafu {
                namespace,
                quota_name: &self.quota_name,
            })?;
        Ok(())
    }
}

pub mod error {
    use snafu::Snafu;

    pub type Result<T> = std::result::Result<T, OrchestratorClientError>;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum OrchestratorClientError {
        #[snafu(display(
            "Unable to list pods in namespace '{}' with selector '{}': '{}'",
            namespace,
            field_selector,
            source
        ))]
        ListPods {
            source: kube::Error,
            namespace: String,
            field_selector: String,
        },

        #[snafu(display("Unable to read node '{}': '{}'", node_name, source))]
        GetNode {
            source: kube::Error,
            node_name: String,
        },

        #[snafu(display("Unable to delete pod '{}/{}': '{}'", namespace, pod_name, source))]
        DeletePod {
            source: kube::Error,
            namespace: String,
            pod_name: String,
        },

        #[snafu(display(
            "Unable to read quota '{}' in namespace '{}': '{}'",
            quota_name,
            namespace,
            source
        ))]
        ReadQuota {
            source: kube::Error,
            namespace: String,
            quota_name: String,
        },

        #[snafu(display(
            "Unable to patch quota '{}' in namespace '{}': '{}'",
            quota_name,
            namespace,
            source
        ))]
        PatchQuota {
            source: kube::Error,
            namespace: String,
            quota_name: String,
        },
    }
}
pub use error::OrchestratorClientError;
