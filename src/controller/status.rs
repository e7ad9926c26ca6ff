//! Conditions and status patches for the storage record
//!
//! `status.storage` is written with a JSON merge patch. Merge patches replace
//! lists wholesale but merge maps key by key, so instances that disappeared
//! have to be removed with an explicit `null`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{Map, Value, json};

use crate::controller::error::Result;
use crate::crd::{ClusterStorageStatus, Condition};

/// Condition types owned by the storage controller
pub mod condition_types {
    /// Three or more consecutive probe failures on some volume
    pub const DISK_USAGE_STALE: &str = "DiskUsageStale";
    /// Some volume wants to grow but policy or the backend prevents it
    pub const RESIZE_BLOCKED: &str = "StorageResizeBlocked";
}

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
    pub const UNKNOWN: &str = "Unknown";
}

/// Seconds a tick may skip persisting unchanged usage
pub const STATUS_HEARTBEAT_SECS: i64 = 300;

/// Builder for creating and updating status conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
    now: DateTime<Utc>,
}

impl ConditionBuilder {
    /// Create a new condition builder
    pub fn new(generation: Option<i64>) -> Self {
        Self::from_existing(Vec::new(), generation)
    }

    /// Create from existing conditions
    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
            now: Utc::now(),
        }
    }

    /// Use `now` as the transition time of changed conditions
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Set a condition, updating if it exists or adding if it doesn't
    pub fn set_condition(mut self, type_: &str, status: &str, reason: &str, message: &str) -> Self {
        let now = self.now.to_rfc3339();

        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = now;
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: now,
                observed_generation: self.generation,
            });
        }
        self
    }

    /// Set the DiskUsageStale condition
    pub fn disk_usage_stale(self, stale: bool, message: &str) -> Self {
        if stale {
            self.set_condition(
                condition_types::DISK_USAGE_STALE,
                condition_status::TRUE,
                "ProbeFailures",
                message,
            )
        } else {
            self.set_condition(
                condition_types::DISK_USAGE_STALE,
                condition_status::FALSE,
                "UsageCurrent",
                "Disk usage is being sampled",
            )
        }
    }

    /// Set the StorageResizeBlocked condition
    pub fn resize_blocked(self, blocked: bool, reason: &str, message: &str) -> Self {
        let status = if blocked {
            condition_status::TRUE
        } else {
            condition_status::FALSE
        };
        self.set_condition(condition_types::RESIZE_BLOCKED, status, reason, message)
    }

    /// Build the conditions list
    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

/// Merge patch turning `previous` into `next` under `status.storage`,
/// guarded by `resource_version`.
pub fn storage_status_patch(
    previous: &ClusterStorageStatus,
    next: &ClusterStorageStatus,
    resource_version: &str,
) -> Result<Value> {
    let mut storage = serde_json::to_value(next)?;

    if let Some(Value::Object(instances)) = storage.get_mut("instances") {
        for gone in previous.instances.keys() {
            if !next.instances.contains_key(gone) {
                instances.insert(gone.clone(), Value::Null);
            }
        }
    } else {
        let removed: Map<String, Value> = previous
            .instances
            .keys()
            .map(|k| (k.clone(), Value::Null))
            .collect();
        storage["instances"] = Value::Object(removed);
    }

    Ok(json!({
        "metadata": { "resourceVersion": resource_version },
        "status": { "storage": storage }
    }))
}

/// Copy of a status with the fields that change on every sample normalized
fn material_view(status: &ClusterStorageStatus) -> ClusterStorageStatus {
    let mut view = status.clone();
    view.last_evaluated = None;
    for instance in view.instances.values_mut() {
        let volumes = std::iter::once(&mut instance.data_volume).chain(instance.wal_volume.as_mut());
        for volume in volumes {
            volume.percent_used = volume.percent_used.round();
            volume.available_bytes = None;
            volume.last_sampled = DateTime::<Utc>::UNIX_EPOCH;
        }
    }
    view
}

/// Whether `next` differs from `previous` in anything beyond sample noise,
/// or the persisted record is older than the heartbeat.
pub fn needs_persist(
    previous: &ClusterStorageStatus,
    next: &ClusterStorageStatus,
    now: DateTime<Utc>,
) -> bool {
    let heartbeat_due = previous
        .last_evaluated
        .is_none_or(|at| now - at >= ChronoDuration::seconds(STATUS_HEARTBEAT_SECS));
    heartbeat_due || material_view(previous) != material_view(next)
}
