//! Persisted disk-usage and auto-resize bookkeeping
//!
//! Everything in this module lives under `status.storage` of a PostgresCluster
//! and is written only by the storage coordinator of that cluster.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::Condition;

/// Which volume of an instance a record refers to
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub enum VolumeRole {
    /// PostgreSQL data directory
    Data,
    /// Dedicated write-ahead log volume
    Wal,
}

impl VolumeRole {
    pub const ALL: [VolumeRole; 2] = [VolumeRole::Data, VolumeRole::Wal];

    /// Prefix of the volume claim name for this role
    pub fn claim_prefix(&self) -> &'static str {
        match self {
            VolumeRole::Data => "data",
            VolumeRole::Wal => "wal",
        }
    }
}

impl fmt::Display for VolumeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.claim_prefix())
    }
}

/// Hysteresis state of one (instance, role) pair
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Default)]
pub enum TriggerState {
    /// Usage is below the trigger threshold, or has re-armed through hysteresis
    #[default]
    Below,
    /// A resize fired; no new trigger until usage drops below hysteresis
    Triggered,
    /// A trigger was denied by policy and is re-evaluated every tick
    Blocked,
}

/// Last known usage of one volume
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeUsage {
    /// Percentage of the filesystem in use (0-100)
    pub percent_used: f64,

    /// Bytes still available on the filesystem, when reported
    #[serde(default)]
    pub available_bytes: Option<u64>,

    /// Size the storage backend has committed to, in bytes
    pub committed_size: u64,

    /// When the last successful sample was taken
    pub last_sampled: DateTime<Utc>,

    /// Whether the most recent probe of this volume failed
    #[serde(default)]
    pub stale: bool,

    /// Probe failures since the last successful sample
    #[serde(default)]
    pub consecutive_failures: u32,

    /// Trigger hysteresis state
    #[serde(default)]
    pub trigger_state: TriggerState,
}

/// Disk status of one instance, keyed by stable instance identity
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceDiskStatus {
    pub data_volume: VolumeUsage,

    /// Absent when the WAL shares the data volume
    #[serde(default)]
    pub wal_volume: Option<VolumeUsage>,
}

impl InstanceDiskStatus {
    pub fn volume(&self, role: VolumeRole) -> Option<&VolumeUsage> {
        match role {
            VolumeRole::Data => Some(&self.data_volume),
            VolumeRole::Wal => self.wal_volume.as_ref(),
        }
    }

    pub fn volume_mut(&mut self, role: VolumeRole) -> Option<&mut VolumeUsage> {
        match role {
            VolumeRole::Data => Some(&mut self.data_volume),
            VolumeRole::Wal => self.wal_volume.as_mut(),
        }
    }
}

/// Outcome recorded for a resize attempt
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ResizeOutcome {
    /// The backend accepted the new size within quota
    Applied,
    /// Applied because the emergency bypass overrode an exhausted quota
    Emergency,
    /// Denied by the per-window quota
    RateLimited,
    /// Denied or reduced because of the absolute size limit
    PolicyCapped,
    /// Denied by a safety check or a structural storage problem
    Blocked,
    /// Requested on a storage class that needs pods recycled to finish
    Deferred,
}

impl ResizeOutcome {
    /// Outcomes that consume rate-limit quota
    pub fn counts_toward_quota(&self) -> bool {
        matches!(self, ResizeOutcome::Applied | ResizeOutcome::Emergency)
    }
}

impl fmt::Display for ResizeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResizeOutcome::Applied => "Applied",
            ResizeOutcome::Emergency => "Emergency",
            ResizeOutcome::RateLimited => "RateLimited",
            ResizeOutcome::PolicyCapped => "PolicyCapped",
            ResizeOutcome::Blocked => "Blocked",
            ResizeOutcome::Deferred => "Deferred",
        };
        f.write_str(s)
    }
}

/// Immutable audit record of a resize attempt
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResizeEvent {
    /// Identifier shared with the intent that produced this event, if any
    pub id: String,
    pub volume_role: VolumeRole,
    pub requested_at: DateTime<Utc>,
    pub from_size: u64,
    pub to_size: u64,
    pub outcome: ResizeOutcome,
    pub trigger_instance: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Why an intent exists
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum IntentReason {
    /// Usage crossed the trigger threshold
    Threshold,
    /// Usage crossed the emergency threshold
    Emergency,
    /// A member's volume is behind the cluster's committed size
    Inherit,
}

/// Progress of an intent through the executor
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum IntentStage {
    /// Recorded; the size patch may or may not have reached the backend
    Requesting,
    /// The backend accepted the patch; waiting for the committed size
    AwaitingPropagation,
}

/// Write-ahead record of a resize the coordinator decided to perform
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResizeIntent {
    pub id: String,
    pub instance: String,
    pub role: VolumeRole,
    pub from_size: u64,
    pub to_size: u64,
    pub reason: IntentReason,
    /// Set when the request only went through because of the emergency bypass
    #[serde(default)]
    pub bypassed_quota: bool,
    pub stage: IntentStage,
    pub requested_at: DateTime<Utc>,
    /// The storage class cannot grow attached volumes
    #[serde(default)]
    pub offline: bool,
    /// When the owning pod was deleted to finish an offline resize
    #[serde(default)]
    pub recycled_at: Option<DateTime<Utc>>,
}

/// Coordinator phase of a cluster
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash, Default)]
pub enum ResizePhase {
    #[default]
    Idle,
    Evaluating,
    Requesting,
    AwaitingPropagation,
}

impl fmt::Display for ResizePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResizePhase::Idle => "Idle",
            ResizePhase::Evaluating => "Evaluating",
            ResizePhase::Requesting => "Requesting",
            ResizePhase::AwaitingPropagation => "AwaitingPropagation",
        };
        f.write_str(s)
    }
}

/// Storage record of one cluster
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStorageStatus {
    #[serde(default)]
    pub phase: ResizePhase,

    /// Per-instance disk status keyed by instance identity
    #[serde(default)]
    pub instances: BTreeMap<String, InstanceDiskStatus>,

    /// Append-only resize history, ordered by `requestedAt`
    #[serde(default)]
    pub auto_resize_history: Vec<ResizeEvent>,

    /// Resizes decided but not yet observed as committed
    #[serde(default)]
    pub pending: Vec<ResizeIntent>,

    /// Storage conditions (DiskUsageStale, StorageResizeBlocked)
    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub last_evaluated: Option<DateTime<Utc>>,
}

impl ClusterStorageStatus {
    /// Largest committed size recorded for a role across all instances
    pub fn max_committed(&self, role: VolumeRole) -> Option<u64> {
        self.instances
            .values()
            .filter_map(|i| i.volume(role))
            .map(|v| v.committed_size)
            .max()
    }

    /// The outstanding intent for a volume, if any
    pub fn pending_for(&self, instance: &str, role: VolumeRole) -> Option<&ResizeIntent> {
        self.pending
            .iter()
            .find(|p| p.instance == instance && p.role == role)
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}
