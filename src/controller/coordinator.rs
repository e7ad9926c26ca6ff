//! One storage tick of one cluster
//!
//! A tick reads the cluster record, samples every volume, drives outstanding
//! resize intents forward, evaluates new triggers and writes the record back.
//! Nothing is carried between ticks in memory: a restarted operator resumes
//! from whatever `status.storage` last recorded.
//!
//! Volume claims are only ever patched for an intent that is already
//! persisted. Status writes carry the version of the read they are based on;
//! a conflicting write restarts the whole tick from a fresh read.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::autoresize::policy::DEFAULT_PROPAGATION_TIMEOUT;
use crate::autoresize::{
    clamp, decide, display_size, history, rate_limit, remaining_budget, wal_safety, ClampOutcome,
    Decision, Observation, RateLimitDecision, RecycleCandidate, RecycleStep, ResizePolicy,
    WalHealth, WalSafetyVerdict,
};
use crate::controller::boundary::{
    ClusterKey, ClusterSnapshot, ClusterSource, EventSink, InstanceDirectory, InstanceInfo,
    RolePolicy, UsageProbe, UsageSample, VolumeBackend, VolumeInfo,
};
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::events::{EventReason, StorageEvent};
use crate::controller::executor::{ExecuteOutcome, ResizeExecutor};
use crate::controller::probe::{ProbeError, PROBE_TIMEOUT};
use crate::controller::state_machine::{
    implied_phase, PhaseEvent, ResizeStateMachine, TransitionContext, TransitionResult,
};
use crate::controller::status::{needs_persist, ConditionBuilder};
use crate::crd::{
    ClusterStorageStatus, ExpansionMode, InstanceDiskStatus, IntentReason, IntentStage,
    ResizeEvent, ResizeIntent, ResizeOutcome, ResizePhase, TriggerState, VolumeRole, VolumeUsage,
};

/// Tunables of the coordinator
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Upper bound for one usage probe
    pub probe_timeout: Duration,
    /// Extra attempts after a failed probe within the same tick
    pub probe_retries: u32,
    /// Attempts of a tick whose status write lost a race
    pub max_conflict_retries: u32,
    /// Consecutive probe failures before `DiskUsageStale` is raised
    pub stale_after_failures: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            probe_timeout: PROBE_TIMEOUT,
            probe_retries: 1,
            max_conflict_retries: 3,
            stale_after_failures: 3,
        }
    }
}

/// Usage of one volume at the end of a tick
#[derive(Clone, Debug, PartialEq)]
pub struct VolumeGauge {
    pub instance: String,
    pub role: VolumeRole,
    pub percent_used: f64,
    pub stale: bool,
}

/// Remaining rate-limit quota of one volume
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BudgetGauge {
    pub instance: String,
    pub role: VolumeRole,
    pub remaining: u32,
}

/// What a completed tick did
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TickReport {
    pub phase: ResizePhase,
    pub volumes: Vec<VolumeGauge>,
    /// Outcomes newly recorded in the resize history
    pub outcomes: Vec<(VolumeRole, ResizeOutcome)>,
    pub budgets: Vec<BudgetGauge>,
    /// Whether the final status write happened
    pub persisted: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TickOutcome {
    /// The cluster is gone or being deleted; nothing was written
    Abandoned,
    /// The cluster is hibernated; nothing was read beyond the record
    Suspended,
    /// No volume has auto-resize enabled and nothing is outstanding
    Disabled,
    Completed(TickReport),
}

/// A volume that may not grow, surfaced on the `StorageResizeBlocked` condition
struct BlockNote {
    reason: &'static str,
    message: String,
}

/// Result of running a triggered resize through the policy gates
enum GateVerdict {
    Proceed { to_size: u64, bypassed_quota: bool },
    Deny {
        outcome: ResizeOutcome,
        reason: &'static str,
        message: String,
    },
}

/// One sampled volume
struct VolumeObservation {
    instance: String,
    role: VolumeRole,
    sample: std::result::Result<UsageSample, ProbeError>,
    volume: Option<VolumeInfo>,
}

/// Working state of a tick
struct Tick<'a> {
    key: &'a ClusterKey,
    now: DateTime<Utc>,
    /// Version of the record `persisted` was read from or written as
    version: String,
    persisted: ClusterStorageStatus,
    status: ClusterStorageStatus,
    phase: ResizePhase,
    /// Published after the next successful status write
    events: Vec<StorageEvent>,
    outcomes: Vec<(VolumeRole, ResizeOutcome)>,
    blocked: Vec<BlockNote>,
    /// Intents recorded during this tick, as opposed to resumed ones
    fresh: Vec<String>,
    /// Volumes whose claim could not be read; left untouched this tick
    unreadable: Vec<(String, VolumeRole)>,
    history_window: Duration,
}

impl Tick<'_> {
    fn outstanding(&self) -> TransitionContext {
        let requesting = self
            .status
            .pending
            .iter()
            .filter(|p| p.stage == IntentStage::Requesting)
            .count();
        TransitionContext::new(requesting, self.status.pending.len() - requesting)
    }

    fn emit(&mut self, reason: EventReason, message: String) {
        self.events.push(StorageEvent::new(reason, message));
    }

    /// Append to the history unless an event with the same id exists
    fn record(&mut self, event: ResizeEvent) {
        if history::contains(&self.status.auto_resize_history, &event.id) {
            return;
        }
        self.outcomes.push((event.volume_role, event.outcome));
        history::append(
            &mut self.status.auto_resize_history,
            event,
            self.history_window,
            self.now,
        );
    }

    fn set_trigger_state(&mut self, instance: &str, role: VolumeRole, state: TriggerState) {
        if let Some(usage) = self
            .status
            .instances
            .get_mut(instance)
            .and_then(|i| i.volume_mut(role))
        {
            usage.trigger_state = state;
        }
    }

    fn committed(&self, instance: &str, role: VolumeRole) -> Option<u64> {
        self.status
            .instances
            .get(instance)
            .and_then(|i| i.volume(role))
            .map(|v| v.committed_size)
    }
}

/// Drives the storage state of clusters through the boundary traits
pub struct Coordinator {
    source: Arc<dyn ClusterSource>,
    directory: Arc<dyn InstanceDirectory>,
    probe: Arc<dyn UsageProbe>,
    volumes: Arc<dyn VolumeBackend>,
    events: Arc<dyn EventSink>,
    config: CoordinatorConfig,
    machine: ResizeStateMachine,
}

impl Coordinator {
    pub fn new(
        source: Arc<dyn ClusterSource>,
        directory: Arc<dyn InstanceDirectory>,
        probe: Arc<dyn UsageProbe>,
        volumes: Arc<dyn VolumeBackend>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            source,
            directory,
            probe,
            volumes,
            events,
            config: CoordinatorConfig::default(),
            machine: ResizeStateMachine::new(),
        }
    }

    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Run one tick, restarting from a fresh read when the status write
    /// conflicts.
    pub async fn tick(&self, key: &ClusterKey, now: DateTime<Utc>) -> Result<TickOutcome> {
        let mut attempt = 1;
        loop {
            match self.tick_once(key, now).await {
                Err(e) if e.is_conflict() && attempt < self.config.max_conflict_retries => {
                    debug!(cluster = %key, attempt, "Storage status changed during tick, retrying");
                    attempt += 1;
                }
                Err(e) if e.is_gone() => {
                    info!(cluster = %key, error = %e, "Cluster is gone, abandoning storage tick");
                    return Ok(TickOutcome::Abandoned);
                }
                result => return result,
            }
        }
    }

    async fn tick_once(&self, key: &ClusterKey, now: DateTime<Utc>) -> Result<TickOutcome> {
        let Some(snapshot) = self.source.load(key).await? else {
            return Ok(TickOutcome::Abandoned);
        };
        if snapshot.terminating {
            debug!(cluster = %key, "Cluster is being deleted, skipping storage tick");
            return Ok(TickOutcome::Abandoned);
        }
        if snapshot.hibernated {
            debug!(cluster = %key, phase = %snapshot.status.phase, "Cluster is hibernated, storage tick suspended");
            return Ok(TickOutcome::Suspended);
        }
        let all_disabled = snapshot
            .roles
            .iter()
            .all(|r| matches!(r.policy, RolePolicy::Disabled));
        if all_disabled && snapshot.status.pending.is_empty() {
            return Ok(TickOutcome::Disabled);
        }

        let mut tick = Tick {
            key,
            now,
            version: snapshot.version.clone(),
            persisted: snapshot.status.clone(),
            status: snapshot.status.clone(),
            phase: snapshot.status.phase,
            events: Vec::new(),
            outcomes: Vec::new(),
            blocked: Vec::new(),
            fresh: Vec::new(),
            unreadable: Vec::new(),
            history_window: history_window(&snapshot),
        };

        let instances = self.directory.instances(key, snapshot.replicas).await?;
        let observations = self.observe(&mut tick, &snapshot, &instances).await?;
        let volumes: HashMap<(String, VolumeRole), VolumeInfo> = observations
            .iter()
            .filter_map(|o| {
                o.volume
                    .clone()
                    .map(|v| ((o.instance.clone(), o.role), v))
            })
            .collect();

        self.forget_departed(&mut tick, &snapshot, &instances);
        let wal_health = self.record_observations(&mut tick, &observations);

        let implied = implied_phase(&tick.outstanding());
        if tick.phase != implied {
            if tick.phase != ResizePhase::Evaluating {
                warn!(
                    cluster = %key,
                    recorded = %tick.phase,
                    implied = %implied,
                    "Recorded phase does not match outstanding resizes, repairing"
                );
            }
            tick.phase = implied;
        }

        if tick.phase == ResizePhase::Requesting {
            self.execute_requesting(&mut tick).await?;
        }
        self.check_propagation(&mut tick, &snapshot, &instances).await?;

        if tick.phase == ResizePhase::Idle {
            self.advance(&mut tick, PhaseEvent::TickStarted);
        }

        let mut intents = self
            .evaluate(&mut tick, &snapshot, &instances, &volumes, &wal_health)
            .await?;
        let provisions = self.plan_inheritance(&mut tick, &snapshot, &instances, &volumes, &mut intents);

        if !intents.is_empty() || !provisions.is_empty() {
            if !intents.is_empty() {
                tick.fresh.extend(intents.iter().map(|i| i.id.clone()));
                tick.status.pending.extend(intents);
                self.advance(&mut tick, PhaseEvent::TriggerFired);
                self.persist(&mut tick).await?;
            }

            if !self.source.is_active(key).await? {
                info!(cluster = %key, "Cluster is being deleted, leaving volumes as they are");
                return Ok(TickOutcome::Abandoned);
            }

            for (instance, role, size, storage_class) in provisions {
                match self
                    .volumes
                    .provision_volume(key, &instance, role, size, storage_class.as_deref())
                    .await
                {
                    Ok(()) => info!(
                        instance = %instance,
                        %role,
                        size = %display_size(size),
                        "Provisioned volume at the cluster's committed size"
                    ),
                    Err(e) if e.is_gone() => return Err(e),
                    Err(e) => warn!(instance = %instance, %role, error = %e, "Failed to provision volume"),
                }
            }

            if tick.outstanding().requesting > 0 {
                self.execute_requesting(&mut tick).await?;
            }
        }

        if tick.phase == ResizePhase::Evaluating {
            self.advance(&mut tick, PhaseEvent::NoTrigger);
        }
        if tick.phase == ResizePhase::AwaitingPropagation && tick.outstanding().awaiting == 0 {
            self.advance(&mut tick, PhaseEvent::PropagationObserved);
        }

        self.update_conditions(&mut tick);
        tick.status.last_evaluated = Some(now);
        history::prune(&mut tick.status.auto_resize_history, tick.history_window, now);

        let persisted = if needs_persist(&tick.persisted, &tick.status, now) {
            self.persist(&mut tick).await?;
            true
        } else {
            tick.status.phase = tick.phase;
            self.flush_events(&mut tick).await;
            false
        };

        Ok(TickOutcome::Completed(report(&tick, &snapshot, persisted)))
    }

    /// Sample every (instance, role) concurrently and read the claims.
    ///
    /// A claim that cannot be read only takes its own volume out of the tick.
    async fn observe(
        &self,
        tick: &mut Tick<'_>,
        snapshot: &ClusterSnapshot,
        instances: &[InstanceInfo],
    ) -> Result<Vec<VolumeObservation>> {
        let key = tick.key;
        let mut roles: Vec<VolumeRole> = snapshot.roles.iter().map(|r| r.role).collect();
        roles.sort();
        let roles = roles.as_slice();

        let probes = instances.iter().flat_map(move |instance| {
            roles.iter().map(move |role| async move {
                let sample = self.sample_with_retry(key, instance, *role).await;
                (instance.id.clone(), *role, sample)
            })
        });
        let samples = join_all(probes).await;

        let mut observations = Vec::with_capacity(samples.len());
        for (instance, role, sample) in samples {
            let volume = match self.volumes.get_volume(key, &instance, role).await {
                Ok(volume) => volume,
                Err(e) if e.is_gone() => return Err(e),
                Err(e) => {
                    warn!(cluster = %key, instance = %instance, %role, error = %e, "Failed to read volume claim");
                    if !e.is_retryable() {
                        tick.blocked.push(BlockNote {
                            reason: "InvalidVolumeClaim",
                            message: format!("{} volume of {}: {}", role, instance, e),
                        });
                    }
                    tick.unreadable.push((instance.clone(), role));
                    None
                }
            };
            observations.push(VolumeObservation {
                instance,
                role,
                sample,
                volume,
            });
        }
        Ok(observations)
    }

    async fn sample_with_retry(
        &self,
        key: &ClusterKey,
        instance: &InstanceInfo,
        role: VolumeRole,
    ) -> std::result::Result<UsageSample, ProbeError> {
        let backoff = BackoffConfig::probe();
        let mut attempt = 0;
        loop {
            let result = timeout(
                self.config.probe_timeout,
                self.probe.sample(key, instance, role),
            )
            .await
            .unwrap_or(Err(ProbeError::Timeout));

            match result {
                Ok(sample) => return Ok(sample),
                Err(e @ (ProbeError::NotReady(_) | ProbeError::NoPodIp(_))) => return Err(e),
                Err(e) if attempt >= self.config.probe_retries => return Err(e),
                Err(e) => {
                    let delay = backoff.delay_for_attempt(attempt);
                    debug!(instance = %instance.id, %role, error = %e, ?delay, "Retrying usage probe");
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Drop records and intents of members beyond `spec.replicas` and WAL
    /// records of clusters without a WAL volume.
    fn forget_departed(&self, tick: &mut Tick<'_>, snapshot: &ClusterSnapshot, instances: &[InstanceInfo]) {
        let members: Vec<&str> = instances.iter().map(|i| i.id.as_str()).collect();
        let key = tick.key;

        tick.status.instances.retain(|id, _| {
            let keep = members.contains(&id.as_str());
            if !keep {
                info!(cluster = %key, instance = %id, "Removing storage record of decommissioned instance");
            }
            keep
        });
        tick.status
            .pending
            .retain(|p| members.contains(&p.instance.as_str()));

        if !snapshot.has_wal_volume() {
            for instance in tick.status.instances.values_mut() {
                instance.wal_volume = None;
            }
            tick.status.pending.retain(|p| p.role != VolumeRole::Wal);
        }
    }

    /// Fold the samples into the instance records.
    ///
    /// Returns the WAL health each instance reported.
    fn record_observations(
        &self,
        tick: &mut Tick<'_>,
        observations: &[VolumeObservation],
    ) -> HashMap<String, WalHealth> {
        let mut wal_health = HashMap::new();

        for obs in observations {
            let capacity = obs.volume.as_ref().and_then(|v| v.capacity);
            let existing = tick
                .status
                .instances
                .get_mut(&obs.instance)
                .and_then(|i| i.volume_mut(obs.role));

            match (&obs.sample, existing) {
                (Ok(sample), Some(usage)) => {
                    if let Some(capacity) = capacity {
                        usage.committed_size = usage.committed_size.max(capacity);
                    }
                    if sample.sampled_at >= usage.last_sampled {
                        usage.percent_used = sample.percent_used;
                        usage.available_bytes = sample.available_bytes;
                        usage.last_sampled = sample.sampled_at;
                    } else {
                        debug!(
                            instance = %obs.instance,
                            role = %obs.role,
                            "Ignoring sample older than the recorded one"
                        );
                    }
                    usage.stale = false;
                    usage.consecutive_failures = 0;
                }
                (Ok(sample), None) => {
                    let Some(volume) = &obs.volume else {
                        debug!(instance = %obs.instance, role = %obs.role, "No claim for sampled volume yet");
                        continue;
                    };
                    let usage = VolumeUsage {
                        percent_used: sample.percent_used,
                        available_bytes: sample.available_bytes,
                        committed_size: volume.capacity.unwrap_or(volume.requested),
                        last_sampled: sample.sampled_at,
                        stale: false,
                        consecutive_failures: 0,
                        trigger_state: TriggerState::Below,
                    };
                    match obs.role {
                        VolumeRole::Data => {
                            tick.status.instances.insert(
                                obs.instance.clone(),
                                InstanceDiskStatus {
                                    data_volume: usage,
                                    wal_volume: None,
                                },
                            );
                        }
                        VolumeRole::Wal => {
                            if let Some(instance) = tick.status.instances.get_mut(&obs.instance) {
                                instance.wal_volume = Some(usage);
                            }
                        }
                    }
                }
                (Err(e), Some(usage)) => {
                    if let Some(capacity) = capacity {
                        usage.committed_size = usage.committed_size.max(capacity);
                    }
                    usage.stale = true;
                    usage.consecutive_failures = usage.consecutive_failures.saturating_add(1);
                    debug!(
                        instance = %obs.instance,
                        role = %obs.role,
                        failures = usage.consecutive_failures,
                        error = %e,
                        "Usage probe failed, keeping last known value"
                    );
                }
                (Err(e), None) => {
                    debug!(instance = %obs.instance, role = %obs.role, error = %e, "Usage probe failed");
                }
            }

            if let Ok(UsageSample {
                wal_health: Some(health),
                ..
            }) = &obs.sample
            {
                wal_health
                    .entry(obs.instance.clone())
                    .or_insert_with(|| health.clone());
            }
        }

        wal_health
    }

    /// Issue every intent still in `Requesting` and settle the phase.
    async fn execute_requesting(&self, tick: &mut Tick<'_>) -> Result<()> {
        let executor = ResizeExecutor::new(self.volumes.as_ref());
        let requesting: Vec<ResizeIntent> = tick
            .status
            .pending
            .iter()
            .filter(|p| p.stage == IntentStage::Requesting)
            .cloned()
            .collect();

        let mut deferred = false;
        for intent in requesting {
            let mode = if intent.offline {
                ExpansionMode::Offline
            } else {
                ExpansionMode::Online
            };
            match executor
                .apply(tick.key, &intent.instance, intent.role, intent.to_size, mode)
                .await
            {
                // Nothing was sent; only a resumed intent can have been
                // issued before its outcome was recorded
                Ok(ExecuteOutcome::NoOp) if tick.fresh.contains(&intent.id) => {
                    debug!(
                        instance = %intent.instance,
                        role = %intent.role,
                        size = %display_size(intent.to_size),
                        "Claim already requests the target size, dropping intent"
                    );
                    tick.status.pending.retain(|p| p.id != intent.id);
                }
                Ok(outcome) => {
                    deferred |= matches!(outcome, ExecuteOutcome::Deferred(_));
                    self.accept_intent(tick, &intent);
                }
                Err(Error::NotFound(what)) => {
                    warn!(instance = %intent.instance, role = %intent.role, "Claim not found ({}), will retry", what);
                }
                Err(e) if e.is_gone() => return Err(e),
                Err(Error::StructuralError(message)) => self.reject_intent(tick, &intent, message),
                Err(e) => {
                    warn!(
                        instance = %intent.instance,
                        role = %intent.role,
                        error = %e,
                        "Resize request failed, will retry"
                    );
                }
            }
        }

        let event = if tick.outstanding().requesting > 0 {
            PhaseEvent::RequestFailed
        } else if deferred {
            PhaseEvent::RequestDeferred
        } else {
            PhaseEvent::RequestAccepted
        };
        self.advance(tick, event);
        Ok(())
    }

    fn accept_intent(&self, tick: &mut Tick<'_>, intent: &ResizeIntent) {
        if let Some(pending) = tick.status.pending.iter_mut().find(|p| p.id == intent.id) {
            pending.stage = IntentStage::AwaitingPropagation;
        }

        if intent.reason != IntentReason::Inherit {
            let outcome = if intent.offline {
                ResizeOutcome::Deferred
            } else if intent.bypassed_quota {
                ResizeOutcome::Emergency
            } else {
                ResizeOutcome::Applied
            };
            tick.record(ResizeEvent {
                id: intent.id.clone(),
                volume_role: intent.role,
                requested_at: intent.requested_at,
                from_size: intent.from_size,
                to_size: intent.to_size,
                outcome,
                trigger_instance: intent.instance.clone(),
                message: None,
            });
        }

        let message = format!(
            "Requested {} for {} volume of {} (was {})",
            display_size(intent.to_size),
            intent.role,
            intent.instance,
            display_size(intent.from_size)
        );
        tick.emit(EventReason::AutoResizeStarted, message);
    }

    fn reject_intent(&self, tick: &mut Tick<'_>, intent: &ResizeIntent, message: String) {
        warn!(
            instance = %intent.instance,
            role = %intent.role,
            "Storage backend cannot resize volume: {}",
            message
        );
        tick.status.pending.retain(|p| p.id != intent.id);

        if intent.reason != IntentReason::Inherit {
            let already_recorded = history::contains(&tick.status.auto_resize_history, &intent.id);
            tick.record(ResizeEvent {
                id: intent.id.clone(),
                volume_role: intent.role,
                requested_at: tick.now,
                from_size: intent.from_size,
                to_size: intent.to_size,
                outcome: ResizeOutcome::Blocked,
                trigger_instance: intent.instance.clone(),
                message: Some(message.clone()),
            });
            if !already_recorded {
                tick.emit(
                    EventReason::AutoResizeBlocked,
                    format!("{} volume of {}: {}", intent.role, intent.instance, message),
                );
            }
            tick.set_trigger_state(&intent.instance, intent.role, TriggerState::Blocked);
        }

        tick.blocked.push(BlockNote {
            reason: "StorageNotExpandable",
            message: format!("{} volume of {}: {}", intent.role, intent.instance, message),
        });
    }

    /// Complete or expire intents waiting for their size and advance offline
    /// recycling.
    async fn check_propagation(
        &self,
        tick: &mut Tick<'_>,
        snapshot: &ClusterSnapshot,
        instances: &[InstanceInfo],
    ) -> Result<()> {
        let awaiting: Vec<ResizeIntent> = tick
            .status
            .pending
            .iter()
            .filter(|p| p.stage == IntentStage::AwaitingPropagation)
            .cloned()
            .collect();

        let mut observed = 0;
        let mut timed_out = 0;
        for intent in &awaiting {
            let committed = tick.committed(&intent.instance, intent.role).unwrap_or(0);
            if committed >= intent.to_size {
                tick.status.pending.retain(|p| p.id != intent.id);
                observed += 1;
                if intent.offline && intent.reason != IntentReason::Inherit {
                    tick.record(ResizeEvent {
                        id: format!("{}-committed", intent.id),
                        volume_role: intent.role,
                        requested_at: tick.now,
                        from_size: intent.from_size,
                        to_size: intent.to_size,
                        outcome: ResizeOutcome::Applied,
                        trigger_instance: intent.instance.clone(),
                        message: None,
                    });
                }
                info!(
                    instance = %intent.instance,
                    role = %intent.role,
                    size = %display_size(committed),
                    "Volume resize committed"
                );
                tick.emit(
                    EventReason::AutoResizeSuccess,
                    format!(
                        "{} volume of {} is now {}",
                        intent.role,
                        intent.instance,
                        display_size(committed)
                    ),
                );
                continue;
            }

            let limit = snapshot
                .policy(intent.role)
                .map(|p| p.propagation_timeout)
                .unwrap_or(DEFAULT_PROPAGATION_TIMEOUT);
            let limit = ChronoDuration::from_std(limit).unwrap_or(ChronoDuration::MAX);
            if tick.now - intent.requested_at >= limit {
                tick.status.pending.retain(|p| p.id != intent.id);
                tick.set_trigger_state(&intent.instance, intent.role, TriggerState::Below);
                timed_out += 1;
                warn!(
                    instance = %intent.instance,
                    role = %intent.role,
                    requested = %display_size(intent.to_size),
                    committed = %display_size(committed),
                    "Gave up waiting for volume resize, usage will be re-evaluated"
                );
            }
        }

        self.advance_recycles(tick, instances).await?;

        if tick.phase == ResizePhase::AwaitingPropagation {
            let event = if tick.outstanding().awaiting > 0 {
                PhaseEvent::PropagationPending
            } else if timed_out > 0 && observed == 0 {
                PhaseEvent::PropagationTimedOut
            } else {
                PhaseEvent::PropagationObserved
            };
            self.advance(tick, event);
        }
        Ok(())
    }

    /// Recycle at most one member per role for offline resizes
    async fn advance_recycles(&self, tick: &mut Tick<'_>, instances: &[InstanceInfo]) -> Result<()> {
        let executor = ResizeExecutor::new(self.volumes.as_ref());

        for role in VolumeRole::ALL {
            let members: Vec<RecycleCandidate> = {
                let offline: Vec<&ResizeIntent> = tick
                    .status
                    .pending
                    .iter()
                    .filter(|p| {
                        p.role == role && p.offline && p.stage == IntentStage::AwaitingPropagation
                    })
                    .collect();
                if offline.is_empty() {
                    continue;
                }
                instances
                    .iter()
                    .map(|i| {
                        let intent = offline.iter().find(|p| p.instance == i.id);
                        RecycleCandidate {
                            instance: i.id.clone(),
                            is_primary: i.is_primary,
                            ready: i.ready,
                            outstanding: intent.is_some(),
                            recycled: intent.is_some_and(|p| p.recycled_at.is_some()),
                        }
                    })
                    .collect()
            };

            match executor.advance_offline(tick.key, role, &members).await {
                Ok(RecycleStep::Recycle(instance)) => {
                    let now = tick.now;
                    if let Some(intent) = tick.status.pending.iter_mut().find(|p| {
                        p.instance == instance && p.role == role && p.offline
                    }) {
                        intent.recycled_at = Some(now);
                    }
                }
                Ok(RecycleStep::Wait(reason)) => {
                    debug!(cluster = %tick.key, %role, "Offline resize {}", reason);
                }
                Ok(RecycleStep::Complete) => {}
                Err(e) if e.is_gone() => return Err(e),
                Err(e) => warn!(cluster = %tick.key, %role, error = %e, "Failed to recycle instance"),
            }
        }
        Ok(())
    }

    /// Run the decider for every enabled volume and gate what it asks for.
    ///
    /// Returns the intents to record.
    async fn evaluate(
        &self,
        tick: &mut Tick<'_>,
        snapshot: &ClusterSnapshot,
        instances: &[InstanceInfo],
        volumes: &HashMap<(String, VolumeRole), VolumeInfo>,
        wal_health: &HashMap<String, WalHealth>,
    ) -> Result<Vec<ResizeIntent>> {
        let mut intents = Vec::new();
        let mut expandable: HashMap<Option<String>, bool> = HashMap::new();

        for config in &snapshot.roles {
            let role = config.role;
            let policy = match &config.policy {
                RolePolicy::Disabled => continue,
                RolePolicy::Invalid(e) => {
                    tick.blocked.push(BlockNote {
                        reason: "InvalidPolicy",
                        message: format!("{} volume: {}", role, e),
                    });
                    continue;
                }
                RolePolicy::Enabled(policy) => policy,
            };

            for instance in instances {
                if tick.unreadable.contains(&(instance.id.clone(), role)) {
                    continue;
                }
                let Some(usage) = tick
                    .status
                    .instances
                    .get(&instance.id)
                    .and_then(|i| i.volume(role))
                else {
                    continue;
                };
                let state = usage.trigger_state;
                let obs = Observation {
                    percent_used: usage.percent_used,
                    available_bytes: usage.available_bytes,
                    committed_size: usage.committed_size,
                    stale: usage.stale,
                };
                let in_flight = tick.status.pending_for(&instance.id, role).is_some();

                let evaluation = decide(state, &obs, policy, in_flight);
                let (target, emergency) = match evaluation.decision {
                    Decision::NoAction => {
                        tick.set_trigger_state(&instance.id, role, evaluation.next_state);
                        continue;
                    }
                    Decision::Blocked(block) => {
                        debug!(instance = %instance.id, %role, "No resize decision: {}", block);
                        continue;
                    }
                    Decision::Resize { target, emergency } => (target, emergency),
                };

                let volume = volumes.get(&(instance.id.clone(), role));
                let capped = policy.max_size.map_or(target, |max| target.min(max));
                if let Some(requested) = volume
                    .map(|v| v.requested)
                    .filter(|r| *r > obs.committed_size && *r >= capped)
                {
                    // An earlier request that timed out is still outstanding
                    if state != TriggerState::Triggered {
                        info!(
                            instance = %instance.id,
                            %role,
                            requested = %display_size(requested),
                            committed = %display_size(obs.committed_size),
                            "Volume already requests the target size, waiting for the storage backend"
                        );
                    }
                    tick.set_trigger_state(&instance.id, role, TriggerState::Triggered);
                    continue;
                }

                if state != TriggerState::Blocked {
                    info!(
                        instance = %instance.id,
                        %role,
                        percent_used = obs.percent_used,
                        emergency,
                        target = %display_size(target),
                        "Volume resize triggered"
                    );
                    tick.emit(
                        EventReason::AutoResizeTriggered,
                        format!(
                            "{} volume of {} is {:.1}% full (threshold {}%), growing {} to {}",
                            role,
                            instance.id,
                            obs.percent_used,
                            policy.trigger_threshold_percent,
                            display_size(obs.committed_size),
                            display_size(target)
                        ),
                    );
                }

                let storage_class = volume.map(|v| v.storage_class.clone());
                let can_expand = match storage_class {
                    Some(class) => match expandable.get(&class) {
                        Some(known) => *known,
                        None => {
                            let known = self.volumes.supports_expansion(class.as_deref()).await?;
                            expandable.insert(class, known);
                            known
                        }
                    },
                    None => true,
                };

                let verdict = gate(
                    tick,
                    snapshot,
                    policy,
                    &instance.id,
                    role,
                    &obs,
                    target,
                    emergency,
                    can_expand,
                    wal_health.get(&instance.id),
                );

                match verdict {
                    GateVerdict::Proceed {
                        to_size,
                        bypassed_quota,
                    } => {
                        tick.set_trigger_state(&instance.id, role, TriggerState::Triggered);
                        intents.push(ResizeIntent {
                            id: Uuid::new_v4().to_string(),
                            instance: instance.id.clone(),
                            role,
                            from_size: obs.committed_size,
                            to_size,
                            reason: if emergency {
                                IntentReason::Emergency
                            } else {
                                IntentReason::Threshold
                            },
                            bypassed_quota,
                            stage: IntentStage::Requesting,
                            requested_at: tick.now,
                            offline: policy.mode == ExpansionMode::Offline,
                            recycled_at: None,
                        });
                    }
                    GateVerdict::Deny {
                        outcome,
                        reason,
                        message,
                    } => {
                        if state != TriggerState::Blocked {
                            warn!(instance = %instance.id, %role, %outcome, "Volume resize denied: {}", message);
                            tick.record(ResizeEvent {
                                id: Uuid::new_v4().to_string(),
                                volume_role: role,
                                requested_at: tick.now,
                                from_size: obs.committed_size,
                                to_size: target,
                                outcome,
                                trigger_instance: instance.id.clone(),
                                message: Some(message.clone()),
                            });
                            let reason = if outcome == ResizeOutcome::RateLimited {
                                EventReason::AutoResizeRateLimited
                            } else {
                                EventReason::AutoResizeBlocked
                            };
                            tick.emit(
                                reason,
                                format!("{} volume of {}: {}", role, instance.id, message),
                            );
                        }
                        tick.set_trigger_state(&instance.id, role, TriggerState::Blocked);
                        if outcome != ResizeOutcome::RateLimited {
                            tick.blocked.push(BlockNote {
                                reason,
                                message: format!("{} volume of {}: {}", role, instance.id, message),
                            });
                        }
                    }
                }
            }
        }

        Ok(intents)
    }

    /// Align members behind the cluster's committed size.
    ///
    /// Claims that exist get an `Inherit` intent; missing claims are returned
    /// to be provisioned at that size.
    fn plan_inheritance(
        &self,
        tick: &mut Tick<'_>,
        snapshot: &ClusterSnapshot,
        instances: &[InstanceInfo],
        volumes: &HashMap<(String, VolumeRole), VolumeInfo>,
        intents: &mut Vec<ResizeIntent>,
    ) -> Vec<(String, VolumeRole, u64, Option<String>)> {
        let mut provisions = Vec::new();

        for config in &snapshot.roles {
            let Some(policy) = config.policy.enabled() else {
                continue;
            };
            let Some(target) = tick.status.max_committed(config.role) else {
                continue;
            };

            for instance in instances {
                let busy = tick.status.pending_for(&instance.id, config.role).is_some()
                    || tick.unreadable.contains(&(instance.id.clone(), config.role))
                    || intents
                        .iter()
                        .any(|i| i.instance == instance.id && i.role == config.role);
                if busy {
                    continue;
                }

                match volumes.get(&(instance.id.clone(), config.role)) {
                    None => provisions.push((
                        instance.id.clone(),
                        config.role,
                        target,
                        config.storage_class.clone(),
                    )),
                    Some(volume) if volume.requested < target => {
                        info!(
                            instance = %instance.id,
                            role = %config.role,
                            from = %display_size(volume.requested),
                            to = %display_size(target),
                            "Aligning volume with the cluster's committed size"
                        );
                        intents.push(ResizeIntent {
                            id: Uuid::new_v4().to_string(),
                            instance: instance.id.clone(),
                            role: config.role,
                            from_size: volume.requested,
                            to_size: target,
                            reason: IntentReason::Inherit,
                            bypassed_quota: false,
                            stage: IntentStage::Requesting,
                            requested_at: tick.now,
                            offline: policy.mode == ExpansionMode::Offline,
                            recycled_at: None,
                        });
                    }
                    Some(_) => {}
                }
            }
        }

        provisions
    }

    fn update_conditions(&self, tick: &mut Tick<'_>) {
        let threshold = self.config.stale_after_failures;
        let stale: Vec<String> = tick
            .status
            .instances
            .iter()
            .flat_map(|(id, instance)| {
                VolumeRole::ALL.into_iter().filter_map(move |role| {
                    instance
                        .volume(role)
                        .filter(|v| v.consecutive_failures >= threshold)
                        .map(|v| format!("{} {}: {} failed probes", id, role, v.consecutive_failures))
                })
            })
            .collect();

        let (blocked, reason, message) = match tick.blocked.first() {
            Some(first) => (
                true,
                first.reason,
                tick.blocked
                    .iter()
                    .map(|n| n.message.as_str())
                    .collect::<Vec<_>>()
                    .join("; "),
            ),
            None => (false, "ResizeAllowed", "No volume is blocked from growing".to_string()),
        };

        tick.status.conditions = ConditionBuilder::from_existing(std::mem::take(&mut tick.status.conditions), None)
            .at(tick.now)
            .disk_usage_stale(!stale.is_empty(), &stale.join("; "))
            .resize_blocked(blocked, reason, &message)
            .build();
    }

    fn advance(&self, tick: &mut Tick<'_>, event: PhaseEvent) {
        let result = self
            .machine
            .transition(&tick.phase, event, &tick.outstanding());
        match &result {
            TransitionResult::Success {
                from,
                to,
                description,
                ..
            } => {
                if from != to {
                    debug!(cluster = %tick.key, %from, %to, %event, "{}", description);
                }
            }
            TransitionResult::InvalidTransition { current, event } => {
                debug!(cluster = %tick.key, phase = %current, %event, "Phase event does not apply");
            }
            TransitionResult::GuardFailed {
                from, event, reason, ..
            } => {
                warn!(cluster = %tick.key, phase = %from, %event, "Phase transition refused: {}", reason);
            }
        }
        tick.phase = result.phase();
    }

    /// Write the working status and publish the events gathered so far
    async fn persist(&self, tick: &mut Tick<'_>) -> Result<()> {
        tick.status.phase = tick.phase;
        tick.version = self
            .source
            .persist(tick.key, &tick.version, &tick.persisted, &tick.status)
            .await?;
        tick.persisted = tick.status.clone();
        self.flush_events(tick).await;
        Ok(())
    }

    async fn flush_events(&self, tick: &mut Tick<'_>) {
        for event in tick.events.drain(..) {
            if let Err(e) = self.events.emit(tick.key, &event).await {
                warn!(cluster = %tick.key, reason = %event.reason, error = %e, "Failed to publish event");
            }
        }
    }
}

/// WAL safety, storage class, ceiling and quota, in that order
#[allow(clippy::too_many_arguments)]
fn gate(
    tick: &Tick<'_>,
    snapshot: &ClusterSnapshot,
    policy: &ResizePolicy,
    instance: &str,
    role: VolumeRole,
    obs: &Observation,
    target: u64,
    emergency: bool,
    can_expand: bool,
    wal_health: Option<&WalHealth>,
) -> GateVerdict {
    match wal_safety::evaluate(role, snapshot.has_wal_volume(), &policy.wal_safety, wal_health) {
        WalSafetyVerdict::Blocked(reason) => {
            return GateVerdict::Deny {
                outcome: ResizeOutcome::Blocked,
                reason: "WALSafety",
                message: reason.to_string(),
            };
        }
        WalSafetyVerdict::AllowedUnverified => {
            warn!(instance, %role, "WAL health unavailable, resizing without WAL safety checks");
        }
        WalSafetyVerdict::Allowed => {}
    }

    if !can_expand {
        return GateVerdict::Deny {
            outcome: ResizeOutcome::Blocked,
            reason: "StorageNotExpandable",
            message: "storage class does not allow volume expansion".to_string(),
        };
    }

    let to_size = match clamp(target, obs.committed_size, policy.max_size) {
        ClampOutcome::AtLimit(size) => {
            return GateVerdict::Deny {
                outcome: ResizeOutcome::PolicyCapped,
                reason: "SizeLimitReached",
                message: format!("volume is already at its limit of {}", display_size(size)),
            };
        }
        ClampOutcome::Capped(size) => {
            info!(instance, %role, limit = %display_size(size), "Resize capped at the size limit");
            size
        }
        ClampOutcome::Allowed(size) => size,
    };

    match rate_limit::allow(
        &tick.status.auto_resize_history,
        role,
        instance,
        tick.now,
        emergency,
        policy,
    ) {
        RateLimitDecision::Denied { used, limit } => GateVerdict::Deny {
            outcome: ResizeOutcome::RateLimited,
            reason: "RateLimited",
            message: format!(
                "{} of {} resizes already used in the last {}h",
                used,
                limit,
                policy.window.as_secs() / 3_600
            ),
        },
        RateLimitDecision::Allowed { bypassed } => {
            if bypassed {
                warn!(instance, %role, "Resize quota exhausted, emergency bypass applied");
            }
            GateVerdict::Proceed {
                to_size,
                bypassed_quota: bypassed,
            }
        }
    }
}

/// Largest window any enabled policy counts resizes over
fn history_window(snapshot: &ClusterSnapshot) -> Duration {
    snapshot
        .roles
        .iter()
        .filter_map(|r| r.policy.enabled())
        .map(|p| p.window)
        .max()
        .unwrap_or(crate::autoresize::policy::DEFAULT_WINDOW)
}

fn report(tick: &Tick<'_>, snapshot: &ClusterSnapshot, persisted: bool) -> TickReport {
    let mut volumes = Vec::new();
    let mut budgets = Vec::new();

    for (id, instance) in &tick.status.instances {
        for role in VolumeRole::ALL {
            let Some(usage) = instance.volume(role) else {
                continue;
            };
            volumes.push(VolumeGauge {
                instance: id.clone(),
                role,
                percent_used: usage.percent_used,
                stale: usage.stale,
            });
            if let Some(policy) = snapshot.policy(role) {
                budgets.push(BudgetGauge {
                    instance: id.clone(),
                    role,
                    remaining: remaining_budget(
                        &tick.status.auto_resize_history,
                        role,
                        id,
                        tick.now,
                        policy,
                    ),
                });
            }
        }
    }

    TickReport {
        phase: tick.phase,
        volumes,
        outcomes: tick.outcomes.clone(),
        budgets,
        persisted,
    }
}
