//! Trigger hysteresis and target-size computation
//!
//! The decider is a pure function of the persisted trigger state, the latest
//! observation of one volume and the resolved policy. It never looks at the
//! rate-limit history or the size ceiling; those gates run afterwards.

use std::fmt;

use crate::crd::TriggerState;

use super::policy::ResizePolicy;
use super::quantity::round_up;

/// Latest view of one volume
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub percent_used: f64,
    pub available_bytes: Option<u64>,
    pub committed_size: u64,
    /// The latest probe failed and `percent_used` is the last known value
    pub stale: bool,
}

/// Why the decider withheld a resize although the volume triggered
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeciderBlock {
    /// The usage sample is stale
    StaleSample,
    /// A resize for this volume is still outstanding
    ResizeInFlight,
}

impl fmt::Display for DeciderBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeciderBlock::StaleSample => write!(f, "usage sample is stale"),
            DeciderBlock::ResizeInFlight => write!(f, "a resize is already in flight"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    NoAction,
    Resize { target: u64, emergency: bool },
    Blocked(DeciderBlock),
}

/// Decision together with the trigger state to persist if it is carried out
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Evaluation {
    pub decision: Decision,
    pub next_state: TriggerState,
}

impl Evaluation {
    fn new(decision: Decision, next_state: TriggerState) -> Self {
        Self {
            decision,
            next_state,
        }
    }
}

/// Whether the observation crosses the trigger threshold or the free-space floor
pub fn is_triggered(obs: &Observation, policy: &ResizePolicy) -> bool {
    let below_floor = match (policy.min_available, obs.available_bytes) {
        (Some(min), Some(available)) => available < min,
        _ => false,
    };
    obs.percent_used >= f64::from(policy.trigger_threshold_percent) || below_floor
}

/// Whether the observation is low enough to re-arm the trigger
pub fn is_rearmed(obs: &Observation, policy: &ResizePolicy) -> bool {
    let floor_ok = match (policy.min_available, obs.available_bytes) {
        (Some(min), Some(available)) => available >= min,
        _ => true,
    };
    obs.percent_used < f64::from(policy.hysteresis_percent) && floor_ok
}

pub fn is_emergency(obs: &Observation, policy: &ResizePolicy) -> bool {
    obs.percent_used >= f64::from(policy.emergency_threshold_percent)
}

/// Size to request when growing a volume currently committed at `committed`.
///
/// The increment is `committed * (growthFactor - 1)`, raised to `minIncrement`,
/// capped by `maxIncrement` and the result rounded up to the granularity.
pub fn target_size(committed: u64, policy: &ResizePolicy) -> u64 {
    let grown = (committed as f64 * policy.growth_factor).ceil();
    let grown = if grown >= u64::MAX as f64 {
        u64::MAX
    } else {
        grown as u64
    };
    let mut increment = grown.saturating_sub(committed).max(policy.min_increment);
    if let Some(max) = policy.max_increment {
        increment = increment.min(max);
    }
    round_up(committed.saturating_add(increment), policy.granularity)
}

/// Evaluate one volume.
///
/// `in_flight` is true while an earlier resize of the same volume has not been
/// observed as committed.
pub fn decide(
    state: TriggerState,
    obs: &Observation,
    policy: &ResizePolicy,
    in_flight: bool,
) -> Evaluation {
    if obs.stale {
        return Evaluation::new(Decision::Blocked(DeciderBlock::StaleSample), state);
    }

    let triggered = is_triggered(obs, policy);
    let emergency = is_emergency(obs, policy);

    match state {
        TriggerState::Below | TriggerState::Blocked => {
            if !triggered {
                return Evaluation::new(Decision::NoAction, TriggerState::Below);
            }
            if in_flight {
                return Evaluation::new(Decision::Blocked(DeciderBlock::ResizeInFlight), state);
            }
            Evaluation::new(
                Decision::Resize {
                    target: target_size(obs.committed_size, policy),
                    emergency,
                },
                TriggerState::Triggered,
            )
        }
        TriggerState::Triggered => {
            if is_rearmed(obs, policy) {
                return Evaluation::new(Decision::NoAction, TriggerState::Below);
            }
            if emergency && !in_flight {
                return Evaluation::new(
                    Decision::Resize {
                        target: target_size(obs.committed_size, policy),
                        emergency: true,
                    },
                    TriggerState::Triggered,
                );
            }
            Evaluation::new(Decision::NoAction, TriggerState::Triggered)
        }
    }
}
