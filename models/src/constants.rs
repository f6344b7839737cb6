// Component names, used for log identification.
pub const FAIRCON: &str = "faircon";
pub const CONTROLLER: &str = "faircon-controller";

// Profile store tables. The profiler owns the schema; we only read it.
pub const SERVICE_PROFILE_TABLE: &str = "service_profile";
pub const NODE_RESOURCE_TABLE: &str = "node_resource_status";

// Per-namespace ResourceQuota object gating pod counts. Every tenant namespace
// carries one under this name unless overridden via `POD_QUOTA_NAME`.
pub const DEFAULT_POD_QUOTA_NAME: &str = "pod-quota";
pub const QUOTA_PODS_KEY: &str = "pods";

// Pod phases and scheduling condition fields used in watch filters.
pub const POD_PHASE_PENDING: &str = "Pending";
pub const POD_PHASE_RUNNING: &str = "Running";
pub const POD_SCHEDULED_CONDITION: &str = "PodScheduled";

// `PodScheduled=False` reasons that indicate a scheduling failure we act on.
pub const UNSCHEDULABLE_REASONS: &[&str] = &["Unschedulable", "SchedulingDisabled"];

// Quota-contention event filtering for the releaser.
pub const FAILED_CREATE_REASON: &str = "FailedCreate";
pub const EXCEEDED_QUOTA_FRAGMENT: &str = "exceeded quota";
pub const WORKLOAD_CONTROLLER_KINDS: &[&str] =
    &["ReplicaSet", "ReplicationController", "StatefulSet", "Job"];
