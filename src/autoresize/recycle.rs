//! Pod recycle ordering for storage classes that only expand detached volumes
//!
//! Replicas go first, one at a time, and only while every member is ready.
//! The primary goes last, once no replica of the same role is still waiting
//! for its new size, so there is always a synchronized replica to fail over to.

use std::fmt;

/// One member of the cluster as seen by the recycle planner
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecycleCandidate {
    pub instance: String,
    pub is_primary: bool,
    pub ready: bool,
    /// An offline resize of this member's volume has not reached its target
    pub outstanding: bool,
    /// The member's pod was already deleted for the outstanding resize
    pub recycled: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitReason {
    /// A recycled member has not come back with its new size yet
    RecycleInProgress,
    /// Some member is not ready; recycling another would reduce redundancy
    MembersNotReady,
}

impl fmt::Display for WaitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitReason::RecycleInProgress => write!(f, "waiting for a recycled instance"),
            WaitReason::MembersNotReady => write!(f, "waiting for all instances to be ready"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecycleStep {
    Recycle(String),
    Wait(WaitReason),
    Complete,
}

/// Next step of the recycle sequence for one volume role.
pub fn next_recycle_step(members: &[RecycleCandidate]) -> RecycleStep {
    let mut outstanding: Vec<&RecycleCandidate> = members.iter().filter(|m| m.outstanding).collect();
    if outstanding.is_empty() {
        return RecycleStep::Complete;
    }
    if outstanding.iter().any(|m| m.recycled) {
        return RecycleStep::Wait(WaitReason::RecycleInProgress);
    }
    if members.iter().any(|m| !m.ready) {
        return RecycleStep::Wait(WaitReason::MembersNotReady);
    }

    outstanding.sort_by(|a, b| a.is_primary.cmp(&b.is_primary).then(a.instance.cmp(&b.instance)));
    match outstanding.first() {
        Some(next) => RecycleStep::Recycle(next.instance.clone()),
        None => RecycleStep::Complete,
    }
}
