//! Pure decision core of the storage auto-resizer
//!
//! Nothing in here performs IO. The controller feeds observations in and
//! carries the returned outcomes out to the cluster.

pub mod decider;
pub mod enforcer;
pub mod history;
pub mod policy;
pub mod quantity;
pub mod rate_limit;
pub mod recycle;
pub mod wal_safety;

use thiserror::Error;

pub use decider::{decide, target_size, DeciderBlock, Decision, Evaluation, Observation};
pub use enforcer::{clamp, ClampOutcome};
pub use policy::{ResizePolicy, WalSafetyPolicy};
pub use quantity::{display_size, format_quantity, parse_duration, parse_quantity};
pub use rate_limit::{allow, remaining_budget, RateLimitDecision};
pub use recycle::{next_recycle_step, RecycleCandidate, RecycleStep, WaitReason};
pub use wal_safety::{WalBlockReason, WalHealth, WalSafetyVerdict};

/// Invalid resize configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("invalid duration: {0}")]
    InvalidDuration(String),

    #[error("invalid resize policy: {0}")]
    Invalid(String),
}
