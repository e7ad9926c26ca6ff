//! Reconciliation entry point for PostgresCluster storage
//!
//! Every reconcile runs one storage tick through the coordinator and decides
//! when the cluster is looked at again.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::boundary::ClusterKey;
use crate::controller::context::Context;
use crate::controller::coordinator::TickOutcome;
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::validation::validate_spec;
use crate::crd::{PostgresCluster, ResizePhase};

/// Requeue interval while nothing is in flight
pub const IDLE_REQUEUE: Duration = Duration::from_secs(30);

/// Requeue interval while a resize is being requested or propagating
pub const ACTIVE_REQUEUE: Duration = Duration::from_secs(10);

/// Requeue interval of a hibernated cluster
pub const HIBERNATED_REQUEUE: Duration = Duration::from_secs(300);

/// Default backoff configuration for error handling
fn default_backoff() -> BackoffConfig {
    BackoffConfig::default()
}

fn cluster_key(cluster: &PostgresCluster) -> ClusterKey {
    ClusterKey::new(cluster.namespace().unwrap_or_default(), cluster.name_any())
}

/// Main reconciliation function
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace().unwrap_or_default()))]
pub async fn reconcile(cluster: Arc<PostgresCluster>, ctx: Arc<Context>) -> Result<Action> {
    let key = cluster_key(&cluster);

    // Deletion is never blocked on storage work
    if cluster.is_terminating() {
        debug!("Cluster is being deleted");
        return Ok(Action::await_change());
    }

    if cluster.is_hibernated() {
        debug!("Cluster is hibernated, storage reconciliation suspended");
        return Ok(Action::requeue(HIBERNATED_REQUEUE));
    }

    validate_spec(&cluster)?;

    let started = Instant::now();
    let outcome = ctx.coordinator.tick(&key, Utc::now()).await;

    if let Some(health) = &ctx.health_state {
        match &outcome {
            Ok(_) => {
                health.metrics.record_reconcile(
                    &key.namespace,
                    &key.name,
                    started.elapsed().as_secs_f64(),
                );
                health
                    .last_reconcile
                    .store(Utc::now().timestamp().max(0) as u64, Ordering::Relaxed);
            }
            Err(_) => health.metrics.record_error(&key.namespace, &key.name),
        }
    }

    let action = match outcome? {
        TickOutcome::Abandoned | TickOutcome::Disabled => Action::await_change(),
        TickOutcome::Suspended => Action::requeue(HIBERNATED_REQUEUE),
        TickOutcome::Completed(report) => {
            if let Some(health) = &ctx.health_state {
                health.metrics.record_tick(&key.namespace, &key.name, &report);
            }
            if !report.outcomes.is_empty() {
                info!(phase = %report.phase, outcomes = report.outcomes.len(), "Storage tick recorded resize outcomes");
            }
            match report.phase {
                ResizePhase::Idle => Action::requeue(IDLE_REQUEUE),
                _ => Action::requeue(ACTIVE_REQUEUE),
            }
        }
    };

    ctx.reset_errors(&key);
    Ok(action)
}

/// Error policy for the controller with exponential backoff
pub fn error_policy(cluster: Arc<PostgresCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = cluster_key(&cluster);
    let attempt = ctx.record_error(&key, error).saturating_sub(1);
    let delay = default_backoff().delay_for_error(error, attempt);

    if error.is_retryable() {
        warn!(
            "Retryable error for {}: {:?}, requeuing in {:?}",
            key, error, delay
        );
    } else {
        error!(
            "Non-retryable error for {}: {:?}, requeuing in {:?} for manual intervention",
            key, error, delay
        );
    }

    Action::requeue(delay)
}
