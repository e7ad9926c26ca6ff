pub mod boundary;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod executor;
pub mod kube_backend;
pub mod probe;
pub mod reconciler;
pub mod state_machine;
pub mod status;
pub mod validation;

pub use boundary::{
    ClusterKey, ClusterSnapshot, ClusterSource, EventSink, InstanceDirectory, InstanceInfo,
    RoleConfig, RolePolicy, UsageProbe, UsageSample, VolumeBackend, VolumeInfo,
};
pub use context::Context;
pub use coordinator::{
    BudgetGauge, Coordinator, CoordinatorConfig, TickOutcome, TickReport, VolumeGauge,
};
pub use error::{BackoffConfig, Error, ErrorContext, Result};
pub use events::{EventReason, KubeEventSink, StorageEvent};
pub use executor::{ExecuteOutcome, ResizeExecutor, OFFLINE_RESIZE_PENDING};
pub use kube_backend::KubeBackend;
pub use probe::{HttpUsageProbe, ProbeError};
pub use reconciler::{error_policy, reconcile};
pub use state_machine::{PhaseEvent, ResizeStateMachine};
pub use status::{condition_types, ConditionBuilder};
pub use validation::{validate_spec, MAX_REPLICAS, MIN_REPLICAS};
