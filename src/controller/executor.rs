//! Applies decided sizes to volume claims
//!
//! The executor is the last gate before the storage backend: it never issues a
//! request that would not strictly grow the claim.

use tracing::{debug, info};

use crate::autoresize::{display_size, next_recycle_step, RecycleCandidate, RecycleStep};
use crate::controller::boundary::{ClusterKey, VolumeBackend};
use crate::controller::error::{Error, Result};
use crate::crd::{ExpansionMode, VolumeRole};

/// Reason reported while an offline expansion waits for pod recycling
pub const OFFLINE_RESIZE_PENDING: &str = "offline-resize-pending";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecuteOutcome {
    /// The backend accepted the new size
    Applied,
    /// The claim already requests at least the target
    NoOp,
    /// Accepted, but the volume only grows once its pod is recycled
    Deferred(String),
}

pub struct ResizeExecutor<'a> {
    backend: &'a dyn VolumeBackend,
}

impl<'a> ResizeExecutor<'a> {
    pub fn new(backend: &'a dyn VolumeBackend) -> Self {
        Self { backend }
    }

    /// Request `target` bytes for `role` on `instance`.
    pub async fn apply(
        &self,
        key: &ClusterKey,
        instance: &str,
        role: VolumeRole,
        target: u64,
        mode: ExpansionMode,
    ) -> Result<ExecuteOutcome> {
        let volume = self
            .backend
            .get_volume(key, instance, role)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{} volume of {}", role, instance)))?;

        if target <= volume.requested {
            debug!(
                instance,
                %role,
                requested = volume.requested,
                target,
                "Volume already requests target size"
            );
            return Ok(ExecuteOutcome::NoOp);
        }

        if !self
            .backend
            .supports_expansion(volume.storage_class.as_deref())
            .await?
        {
            return Err(Error::StructuralError(format!(
                "storage class {} does not allow volume expansion",
                volume.storage_class.as_deref().unwrap_or("<default>")
            )));
        }

        self.backend
            .patch_requested_size(key, instance, role, target)
            .await?;

        info!(
            instance,
            %role,
            from = %display_size(volume.requested),
            to = %display_size(target),
            "Requested volume expansion"
        );

        Ok(match mode {
            ExpansionMode::Online => ExecuteOutcome::Applied,
            ExpansionMode::Offline => ExecuteOutcome::Deferred(OFFLINE_RESIZE_PENDING.to_string()),
        })
    }

    /// Advance the offline recycle sequence of one role by at most one pod.
    pub async fn advance_offline(
        &self,
        key: &ClusterKey,
        role: VolumeRole,
        members: &[RecycleCandidate],
    ) -> Result<RecycleStep> {
        let step = next_recycle_step(members);
        if let RecycleStep::Recycle(instance) = &step {
            info!(instance = %instance, %role, "Recycling instance to finish offline expansion");
            self.backend.recycle_instance(key, instance).await?;
        }
        Ok(step)
    }
}
