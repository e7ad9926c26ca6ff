use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ClusterStorageStatus;

/// Annotation an external actor sets to suspend the cluster.
pub const HIBERNATION_ANNOTATION: &str = "postgres.example.com/hibernation";

/// PostgresCluster is the Schema for the postgresclusters API
///
/// Only the storage-related parts of the cluster are modelled here. Bootstrap,
/// certificates, poolers and the database itself are owned by other controllers.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "postgres.example.com",
    version = "v1alpha1",
    kind = "PostgresCluster",
    plural = "postgresclusters",
    shortname = "pgc",
    namespaced,
    status = "PostgresClusterStatus",
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Storage", "type":"string", "jsonPath":".spec.storage.size"}"#,
    printcolumn = r#"{"name":"Resize", "type":"string", "jsonPath":".status.storage.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterSpec {
    /// Number of instances (primary plus replicas)
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Storage configuration for the PostgreSQL data volume
    pub storage: StorageSpec,

    /// Dedicated storage for the write-ahead log.
    /// When absent the WAL lives on the data volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wal_storage: Option<StorageSpec>,
}

fn default_replicas() -> i32 {
    1
}

/// Storage configuration for one volume role
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Storage class name (uses default if not specified)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// Initial size of the persistent volume (e.g., "10Gi", "100Gi")
    pub size: String,

    /// Automatic expansion policy for this volume role
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resize: Option<ResizeSpec>,
}

/// Automatic volume expansion configuration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResizeSpec {
    /// Enable automatic expansion
    #[serde(default)]
    pub enabled: bool,

    /// When a resize fires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggers: Option<ResizeTriggers>,

    /// How much a volume grows and how far
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expansion: Option<ExpansionPolicy>,

    /// Rate limiting, expansion mode and safety checks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ResizeStrategy>,
}

/// Usage thresholds driving the trigger state machine
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResizeTriggers {
    /// Percentage used at or above which a resize fires (default 80)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_threshold: Option<u8>,

    /// Percentage used below which the trigger re-arms (default 50)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hysteresis: Option<u8>,

    /// Percentage used at or above which rate limits are bypassed (default 90)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emergency_threshold: Option<u8>,

    /// Fire when fewer than this many bytes remain available (e.g., "2Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_available: Option<String>,
}

/// Growth computation and ceiling
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExpansionPolicy {
    /// Multiplier applied to the committed size (default 1.5)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub growth_factor: Option<f64>,

    /// Smallest increment per resize (default "1Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_increment: Option<String>,

    /// Largest increment per resize (unbounded when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_increment: Option<String>,

    /// Absolute ceiling for the volume (unbounded when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<String>,

    /// Allocation granularity of the storage backend (default "1Mi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granularity: Option<String>,
}

/// Rate limiting and execution strategy
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResizeStrategy {
    /// Maximum applied resizes per volume inside the window (default 3)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_actions_per_window: Option<u32>,

    /// Rolling window for the rate limit (default "24h")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<String>,

    /// Whether the storage class expands attached volumes (default Online)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ExpansionMode>,

    /// How long to wait for a requested size to be committed (default "10m")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub propagation_timeout: Option<String>,

    /// Checks protecting volumes that hold WAL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wal_safety_policy: Option<WalSafetySpec>,
}

/// How the storage backend applies a size increase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Default)]
pub enum ExpansionMode {
    /// The filesystem grows while the volume stays attached
    #[default]
    Online,
    /// The volume must be detached; pods are recycled to finish the resize
    Offline,
}

/// WAL safety checks for volumes holding the write-ahead log
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct WalSafetySpec {
    /// Required for single-volume clusters to allow resizing the data volume
    #[serde(
        default,
        rename = "acknowledgeWALRisk",
        skip_serializing_if = "Option::is_none"
    )]
    pub acknowledge_wal_risk: Option<bool>,

    /// Block when WAL archiving is failing (default true)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_archive_healthy: Option<bool>,

    /// Block when more WAL files than this wait for archiving (default 100)
    #[serde(
        default,
        rename = "maxPendingWALFiles",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_pending_wal_files: Option<i32>,

    /// Block when an inactive slot retains more than this many bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_slot_retention_bytes: Option<i64>,
}

/// Status of the PostgresCluster
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterStatus {
    /// Observed generation of the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Kubernetes-style conditions owned by the lifecycle controller
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Disk usage, committed sizes and auto-resize bookkeeping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<ClusterStorageStatus>,
}

/// Kubernetes-style condition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition: True, False, or Unknown
    pub status: String,

    /// Reason for the condition's last transition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: String,

    /// Generation observed when condition was set
    #[serde(default)]
    pub observed_generation: Option<i64>,
}

impl PostgresCluster {
    /// Whether the hibernation annotation is set to "on"
    pub fn is_hibernated(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(HIBERNATION_ANNOTATION))
            .is_some_and(|v| v.eq_ignore_ascii_case("on"))
    }

    /// Whether the cluster is being torn down
    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the WAL has its own volume
    pub fn has_wal_volume(&self) -> bool {
        self.spec.wal_storage.is_some()
    }

    /// Whether auto-resize is enabled for any volume role
    pub fn is_auto_resize_enabled(&self) -> bool {
        let enabled = |s: &StorageSpec| s.resize.as_ref().is_some_and(|r| r.enabled);
        enabled(&self.spec.storage) || self.spec.wal_storage.as_ref().is_some_and(enabled)
    }

    /// Persisted storage status, or an empty one
    pub fn storage_status(&self) -> ClusterStorageStatus {
        self.status
            .as_ref()
            .and_then(|s| s.storage.clone())
            .unwrap_or_default()
    }
}
