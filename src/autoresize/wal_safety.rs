//! Safety checks for volumes that hold the write-ahead log
//!
//! Growing a volume whose WAL is piling up because archiving or a replication
//! slot is stuck only postpones the outage, so such resizes are held back.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crd::VolumeRole;

use super::policy::WalSafetyPolicy;

/// An inactive replication slot and the WAL it retains
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InactiveSlot {
    pub slot_name: String,
    pub retention_bytes: i64,
}

/// WAL health as reported by the instance
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct WalHealth {
    pub archive_healthy: bool,
    #[serde(rename = "pendingWALFiles")]
    pub pending_wal_files: i32,
    #[serde(default)]
    pub inactive_slots: Vec<InactiveSlot>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalBlockReason {
    SingleVolumeNotAcknowledged,
    ArchiveUnhealthy,
    PendingWalExceeded { pending: i32, max: i32 },
    SlotRetentionExceeded { slot: String, retained: i64, max: i64 },
}

impl fmt::Display for WalBlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalBlockReason::SingleVolumeNotAcknowledged => write!(
                f,
                "single-volume cluster requires acknowledgeWALRisk=true in walSafetyPolicy"
            ),
            WalBlockReason::ArchiveUnhealthy => write!(f, "WAL archiving is failing"),
            WalBlockReason::PendingWalExceeded { pending, max } => write!(
                f,
                "pending WAL files ({}) exceed threshold ({})",
                pending, max
            ),
            WalBlockReason::SlotRetentionExceeded {
                slot,
                retained,
                max,
            } => write!(
                f,
                "inactive slot {} retains {} bytes of WAL (threshold {})",
                slot, retained, max
            ),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalSafetyVerdict {
    /// The volume does not hold WAL, or every check passed
    Allowed,
    /// Allowed without verification because no health data was reported
    AllowedUnverified,
    Blocked(WalBlockReason),
}

impl WalSafetyVerdict {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, WalSafetyVerdict::Blocked(_))
    }
}

/// Whether a volume of `role` holds WAL
pub fn holds_wal(role: VolumeRole, has_wal_volume: bool) -> bool {
    match role {
        VolumeRole::Wal => true,
        VolumeRole::Data => !has_wal_volume,
    }
}

/// Evaluate the WAL safety checks for one resize.
pub fn evaluate(
    role: VolumeRole,
    has_wal_volume: bool,
    policy: &WalSafetyPolicy,
    health: Option<&WalHealth>,
) -> WalSafetyVerdict {
    if !holds_wal(role, has_wal_volume) {
        return WalSafetyVerdict::Allowed;
    }

    if role == VolumeRole::Data && !policy.acknowledge_wal_risk {
        return WalSafetyVerdict::Blocked(WalBlockReason::SingleVolumeNotAcknowledged);
    }

    let Some(health) = health else {
        return WalSafetyVerdict::AllowedUnverified;
    };

    if policy.require_archive_healthy && !health.archive_healthy {
        return WalSafetyVerdict::Blocked(WalBlockReason::ArchiveUnhealthy);
    }

    let max_pending = policy.max_pending_wal_files;
    if max_pending > 0 && health.pending_wal_files > max_pending {
        return WalSafetyVerdict::Blocked(WalBlockReason::PendingWalExceeded {
            pending: health.pending_wal_files,
            max: max_pending,
        });
    }

    if let Some(max) = policy.max_slot_retention_bytes.filter(|m| *m > 0) {
        if let Some(slot) = health.inactive_slots.iter().find(|s| s.retention_bytes > max) {
            return WalSafetyVerdict::Blocked(WalBlockReason::SlotRetentionExceeded {
                slot: slot.slot_name.clone(),
                retained: slot.retention_bytes,
                max,
            });
        }
    }

    WalSafetyVerdict::Allowed
}
