//! Narrow interfaces between the storage coordinator and the outside world
//!
//! The coordinator only talks to the cluster, its instances and its volumes
//! through these traits. `kube_backend` and `probe` implement them against a
//! real API server; tests substitute in-memory fakes.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::autoresize::{PolicyError, ResizePolicy, WalHealth};
use crate::controller::error::Result;
use crate::controller::events::StorageEvent;
use crate::controller::probe::ProbeError;
use crate::crd::{ClusterStorageStatus, VolumeRole};

/// Namespace and name of a cluster
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterKey {
    pub namespace: String,
    pub name: String,
}

impl ClusterKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Resize configuration of one volume role
#[derive(Clone, Debug, PartialEq)]
pub enum RolePolicy {
    Disabled,
    Enabled(ResizePolicy),
    /// The configuration could not be resolved
    Invalid(PolicyError),
}

impl RolePolicy {
    pub fn from_result(result: std::result::Result<Option<ResizePolicy>, PolicyError>) -> Self {
        match result {
            Ok(Some(policy)) => RolePolicy::Enabled(policy),
            Ok(None) => RolePolicy::Disabled,
            Err(e) => RolePolicy::Invalid(e),
        }
    }

    pub fn enabled(&self) -> Option<&ResizePolicy> {
        match self {
            RolePolicy::Enabled(policy) => Some(policy),
            _ => None,
        }
    }
}

/// A volume role present on every instance of the cluster
#[derive(Clone, Debug, PartialEq)]
pub struct RoleConfig {
    pub role: VolumeRole,
    pub storage_class: Option<String>,
    pub policy: RolePolicy,
}

/// Everything the coordinator reads from the cluster object in one tick
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterSnapshot {
    /// Token for optimistic concurrency on status writes
    pub version: String,
    pub replicas: u32,
    pub roles: Vec<RoleConfig>,
    pub hibernated: bool,
    pub terminating: bool,
    pub status: ClusterStorageStatus,
}

impl ClusterSnapshot {
    pub fn role(&self, role: VolumeRole) -> Option<&RoleConfig> {
        self.roles.iter().find(|r| r.role == role)
    }

    pub fn has_wal_volume(&self) -> bool {
        self.role(VolumeRole::Wal).is_some()
    }

    pub fn policy(&self, role: VolumeRole) -> Option<&ResizePolicy> {
        self.role(role).and_then(|r| r.policy.enabled())
    }

    pub fn any_enabled(&self) -> bool {
        self.roles.iter().any(|r| r.policy.enabled().is_some())
    }
}

/// Durable cluster record
#[async_trait]
pub trait ClusterSource: Send + Sync {
    /// Fresh read of the cluster; `None` once it no longer exists
    async fn load(&self, key: &ClusterKey) -> Result<Option<ClusterSnapshot>>;

    /// Write `next` if the record is still at `version`.
    ///
    /// Returns the new version, or a conflict error if someone else wrote first.
    async fn persist(
        &self,
        key: &ClusterKey,
        version: &str,
        previous: &ClusterStorageStatus,
        next: &ClusterStorageStatus,
    ) -> Result<String>;

    /// Whether the cluster still exists and is not being torn down
    async fn is_active(&self, key: &ClusterKey) -> Result<bool>;
}

/// A member of the cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceInfo {
    /// Stable identity, independent of the pod currently running it
    pub id: String,
    pub pod_ip: Option<String>,
    pub is_primary: bool,
    pub ready: bool,
}

#[async_trait]
pub trait InstanceDirectory: Send + Sync {
    /// Every member the cluster should have, whether or not its pod is running
    async fn instances(&self, key: &ClusterKey, replicas: u32) -> Result<Vec<InstanceInfo>>;
}

/// One usage reading of a volume
#[derive(Clone, Debug, PartialEq)]
pub struct UsageSample {
    pub percent_used: f64,
    pub available_bytes: Option<u64>,
    pub sampled_at: DateTime<Utc>,
    pub wal_health: Option<WalHealth>,
}

#[async_trait]
pub trait UsageProbe: Send + Sync {
    async fn sample(
        &self,
        key: &ClusterKey,
        instance: &InstanceInfo,
        role: VolumeRole,
    ) -> std::result::Result<UsageSample, ProbeError>;
}

/// Sizes of an existing volume claim
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeInfo {
    /// Size currently requested
    pub requested: u64,
    /// Size the backend reports as provisioned, once bound
    pub capacity: Option<u64>,
    pub storage_class: Option<String>,
}

#[async_trait]
pub trait VolumeBackend: Send + Sync {
    /// The claim for `role` on `instance`; `None` if it does not exist yet
    async fn get_volume(
        &self,
        key: &ClusterKey,
        instance: &str,
        role: VolumeRole,
    ) -> Result<Option<VolumeInfo>>;

    /// Whether the storage class can expand volumes at all
    async fn supports_expansion(&self, storage_class: Option<&str>) -> Result<bool>;

    async fn patch_requested_size(
        &self,
        key: &ClusterKey,
        instance: &str,
        role: VolumeRole,
        size: u64,
    ) -> Result<()>;

    /// Create the claim for a member that has none yet
    async fn provision_volume(
        &self,
        key: &ClusterKey,
        instance: &str,
        role: VolumeRole,
        size: u64,
        storage_class: Option<&str>,
    ) -> Result<()>;

    /// Delete the member's pod so it restarts against its resized claim
    async fn recycle_instance(&self, key: &ClusterKey, instance: &str) -> Result<()>;
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, key: &ClusterKey, event: &StorageEvent) -> Result<()>;
}
