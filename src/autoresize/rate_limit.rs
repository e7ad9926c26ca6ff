//! Rolling-window resize quota

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::crd::{ResizeEvent, VolumeRole};

use super::policy::ResizePolicy;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Within quota, or over quota but let through by the emergency bypass
    Allowed { bypassed: bool },
    Denied { used: u32, limit: u32 },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed { .. })
    }
}

fn window_start(now: DateTime<Utc>, policy: &ResizePolicy) -> DateTime<Utc> {
    let window = ChronoDuration::from_std(policy.window).unwrap_or(ChronoDuration::MAX);
    now.checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Quota-consuming events for one volume inside `[now - window, now]`
pub fn used_in_window(
    history: &[ResizeEvent],
    role: VolumeRole,
    instance: &str,
    now: DateTime<Utc>,
    policy: &ResizePolicy,
) -> u32 {
    let start = window_start(now, policy);
    let count = history
        .iter()
        .filter(|e| e.volume_role == role && e.trigger_instance == instance)
        .filter(|e| e.outcome.counts_toward_quota())
        .filter(|e| e.requested_at >= start && e.requested_at <= now)
        .count();
    u32::try_from(count).unwrap_or(u32::MAX)
}

/// Resizes still available to a volume in the current window
pub fn remaining_budget(
    history: &[ResizeEvent],
    role: VolumeRole,
    instance: &str,
    now: DateTime<Utc>,
    policy: &ResizePolicy,
) -> u32 {
    policy
        .max_resizes_per_window
        .saturating_sub(used_in_window(history, role, instance, now, policy))
}

/// Decide whether one more resize of a volume may proceed.
pub fn allow(
    history: &[ResizeEvent],
    role: VolumeRole,
    instance: &str,
    now: DateTime<Utc>,
    emergency: bool,
    policy: &ResizePolicy,
) -> RateLimitDecision {
    let used = used_in_window(history, role, instance, now, policy);
    let limit = policy.max_resizes_per_window;
    if used < limit {
        RateLimitDecision::Allowed { bypassed: false }
    } else if emergency {
        RateLimitDecision::Allowed { bypassed: true }
    } else {
        RateLimitDecision::Denied { used, limit }
    }
}
