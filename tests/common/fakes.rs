//! In-memory implementations of the coordinator's boundary traits
//!
//! Every fake is cheap to clone and shares its state, so a test keeps a handle
//! to inspect and steer it while the coordinator owns another.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use postgres_storage_operator::autoresize::WalHealth;
use postgres_storage_operator::controller::kube_backend::snapshot_of;
use postgres_storage_operator::controller::{
    ClusterKey, ClusterSnapshot, ClusterSource, Coordinator, CoordinatorConfig, Error,
    EventReason, EventSink, InstanceDirectory, InstanceInfo, ProbeError, Result, StorageEvent,
    TickOutcome, TickReport, UsageProbe, UsageSample, VolumeBackend, VolumeInfo,
};
use postgres_storage_operator::crd::{
    ClusterStorageStatus, HIBERNATION_ANNOTATION, PostgresCluster, PostgresClusterStatus,
    VolumeRole,
};
use postgres_storage_operator::resources::common::instance_names;

use super::fixtures::t0;

// =============================================================================
// ClusterSource
// =============================================================================

struct ClusterState {
    cluster: Option<PostgresCluster>,
    version: u64,
    persists: u32,
    /// Writes that lose a race against a concurrent writer
    conflicts: u32,
    /// Successful writes left before the next write fails
    fail_after: Option<u32>,
}

/// Versioned cluster store with conflict and failure injection
#[derive(Clone)]
pub struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
    pub fn new(cluster: PostgresCluster) -> Self {
        Self {
            state: Arc::new(Mutex::new(ClusterState {
                cluster: Some(cluster),
                version: 1,
                persists: 0,
                conflicts: 0,
                fail_after: None,
            })),
        }
    }

    pub fn status(&self) -> ClusterStorageStatus {
        let state = self.state.lock().unwrap();
        state
            .cluster
            .as_ref()
            .map(|c| c.storage_status())
            .unwrap_or_default()
    }

    pub fn version(&self) -> u64 {
        self.state.lock().unwrap().version
    }

    /// Successful status writes so far
    pub fn persists(&self) -> u32 {
        self.state.lock().unwrap().persists
    }

    /// The next `n` writes find the record changed by someone else
    pub fn inject_conflicts(&self, n: u32) {
        self.state.lock().unwrap().conflicts = n;
    }

    /// After `n` more successful writes, the next write fails once
    pub fn fail_after(&self, n: u32) {
        self.state.lock().unwrap().fail_after = Some(n);
    }

    pub fn update(&self, f: impl FnOnce(&mut PostgresCluster)) {
        let mut state = self.state.lock().unwrap();
        if let Some(cluster) = state.cluster.as_mut() {
            f(cluster);
        }
        state.version += 1;
    }

    pub fn set_hibernated(&self, on: bool) {
        self.update(|c| {
            let annotations = c.metadata.annotations.get_or_insert_with(BTreeMap::new);
            if on {
                annotations.insert(HIBERNATION_ANNOTATION.to_string(), "on".to_string());
            } else {
                annotations.remove(HIBERNATION_ANNOTATION);
            }
        });
    }

    pub fn set_replicas(&self, replicas: i32) {
        self.update(|c| c.spec.replicas = replicas);
    }

    pub fn mark_terminating(&self) {
        self.update(|c| {
            c.metadata.deletion_timestamp =
                Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(t0()));
        });
    }

    pub fn delete(&self) {
        let mut state = self.state.lock().unwrap();
        state.cluster = None;
        state.version += 1;
    }
}

#[async_trait]
impl ClusterSource for FakeCluster {
    async fn load(&self, _key: &ClusterKey) -> Result<Option<ClusterSnapshot>> {
        let state = self.state.lock().unwrap();
        let Some(cluster) = state.cluster.as_ref() else {
            return Ok(None);
        };
        let mut cluster = cluster.clone();
        cluster.metadata.resource_version = Some(state.version.to_string());
        snapshot_of(&cluster).map(Some)
    }

    async fn persist(
        &self,
        key: &ClusterKey,
        version: &str,
        _previous: &ClusterStorageStatus,
        next: &ClusterStorageStatus,
    ) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        if state.cluster.is_none() {
            return Err(Error::NotFound(key.to_string()));
        }
        if state.conflicts > 0 {
            state.conflicts -= 1;
            state.version += 1;
            return Err(Error::ConflictError(key.to_string()));
        }
        if state.version.to_string() != version {
            return Err(Error::ConflictError(format!(
                "{} is at version {}, write was based on {}",
                key, state.version, version
            )));
        }
        match state.fail_after {
            Some(0) => {
                state.fail_after = None;
                return Err(Error::TransientError("injected write failure".to_string()));
            }
            Some(n) => state.fail_after = Some(n - 1),
            None => {}
        }

        state.version += 1;
        state.persists += 1;
        if let Some(cluster) = state.cluster.as_mut() {
            cluster
                .status
                .get_or_insert_with(PostgresClusterStatus::default)
                .storage = Some(next.clone());
        }
        Ok(state.version.to_string())
    }

    async fn is_active(&self, _key: &ClusterKey) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state
            .cluster
            .as_ref()
            .is_some_and(|c| !c.is_terminating()))
    }
}

// =============================================================================
// InstanceDirectory
// =============================================================================

/// Members named after their ordinal; ordinal 0 is the primary
#[derive(Clone, Default)]
pub struct FakeDirectory {
    not_ready: Arc<Mutex<Vec<String>>>,
    primary: Arc<Mutex<Option<String>>>,
}

impl FakeDirectory {
    pub fn set_ready(&self, instance: &str, ready: bool) {
        let mut not_ready = self.not_ready.lock().unwrap();
        not_ready.retain(|i| i != instance);
        if !ready {
            not_ready.push(instance.to_string());
        }
    }

    pub fn set_primary(&self, instance: &str) {
        *self.primary.lock().unwrap() = Some(instance.to_string());
    }
}

#[async_trait]
impl InstanceDirectory for FakeDirectory {
    async fn instances(&self, key: &ClusterKey, replicas: u32) -> Result<Vec<InstanceInfo>> {
        let not_ready = self.not_ready.lock().unwrap();
        let primary = self.primary.lock().unwrap().clone();
        Ok(instance_names(&key.name, replicas)
            .into_iter()
            .enumerate()
            .map(|(ordinal, id)| InstanceInfo {
                is_primary: match &primary {
                    Some(p) => *p == id,
                    None => ordinal == 0,
                },
                ready: !not_ready.contains(&id),
                pod_ip: Some(format!("10.0.0.{}", ordinal + 10)),
                id,
            })
            .collect())
    }
}

// =============================================================================
// UsageProbe
// =============================================================================

#[derive(Clone, Debug)]
enum Reading {
    Percent(f64),
    Failing,
}

#[derive(Default)]
struct ProbeState {
    readings: HashMap<(String, VolumeRole), Reading>,
    wal_health: HashMap<String, WalHealth>,
    now: Option<DateTime<Utc>>,
    calls: u32,
}

/// Scripted usage readings; unscripted volumes report 10%
#[derive(Clone, Default)]
pub struct FakeProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl FakeProbe {
    pub fn set_usage(&self, instance: &str, role: VolumeRole, percent: f64) {
        self.state
            .lock()
            .unwrap()
            .readings
            .insert((instance.to_string(), role), Reading::Percent(percent));
    }

    pub fn fail(&self, instance: &str, role: VolumeRole) {
        self.state
            .lock()
            .unwrap()
            .readings
            .insert((instance.to_string(), role), Reading::Failing);
    }

    pub fn set_wal_health(&self, instance: &str, health: WalHealth) {
        self.state
            .lock()
            .unwrap()
            .wal_health
            .insert(instance.to_string(), health);
    }

    /// Timestamp put on every following sample
    pub fn set_clock(&self, now: DateTime<Utc>) {
        self.state.lock().unwrap().now = Some(now);
    }

    pub fn calls(&self) -> u32 {
        self.state.lock().unwrap().calls
    }
}

#[async_trait]
impl UsageProbe for FakeProbe {
    async fn sample(
        &self,
        _key: &ClusterKey,
        instance: &InstanceInfo,
        role: VolumeRole,
    ) -> std::result::Result<UsageSample, ProbeError> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        let reading = state
            .readings
            .get(&(instance.id.clone(), role))
            .cloned()
            .unwrap_or(Reading::Percent(10.0));
        match reading {
            Reading::Failing => Err(ProbeError::ConnectionError(format!(
                "{} refused connection",
                instance.id
            ))),
            Reading::Percent(percent) => Ok(UsageSample {
                percent_used: percent,
                available_bytes: None,
                sampled_at: state.now.unwrap_or_else(t0),
                wal_health: state.wal_health.get(&instance.id).cloned(),
            }),
        }
    }
}

// =============================================================================
// VolumeBackend
// =============================================================================

#[derive(Default)]
struct VolumeState {
    claims: HashMap<(String, VolumeRole), VolumeInfo>,
    non_expandable: Vec<Option<String>>,
    /// Claims whose storage request cannot be parsed
    malformed: Vec<(String, VolumeRole)>,
    patches: Vec<(String, VolumeRole, u64)>,
    provisioned: Vec<(String, VolumeRole, u64)>,
    recycled: Vec<String>,
    /// Requested sizes become committed as soon as they are patched
    auto_propagate: bool,
}

/// Volume claims with requested and committed sizes
#[derive(Clone, Default)]
pub struct FakeVolumes {
    state: Arc<Mutex<VolumeState>>,
}

impl FakeVolumes {
    /// A bound claim of `size` bytes
    pub fn add_claim(&self, instance: &str, role: VolumeRole, size: u64) {
        self.state.lock().unwrap().claims.insert(
            (instance.to_string(), role),
            VolumeInfo {
                requested: size,
                capacity: Some(size),
                storage_class: None,
            },
        );
    }

    pub fn remove_claim(&self, instance: &str, role: VolumeRole) {
        self.state
            .lock()
            .unwrap()
            .claims
            .remove(&(instance.to_string(), role));
    }

    pub fn set_expandable(&self, storage_class: Option<&str>, expandable: bool) {
        let class = storage_class.map(str::to_string);
        let mut state = self.state.lock().unwrap();
        state.non_expandable.retain(|c| *c != class);
        if !expandable {
            state.non_expandable.push(class);
        }
    }

    /// Make reads of one claim fail as if its storage request were garbage
    pub fn set_malformed(&self, instance: &str, role: VolumeRole, malformed: bool) {
        let key = (instance.to_string(), role);
        let mut state = self.state.lock().unwrap();
        state.malformed.retain(|k| *k != key);
        if malformed {
            state.malformed.push(key);
        }
    }

    pub fn set_auto_propagate(&self, on: bool) {
        self.state.lock().unwrap().auto_propagate = on;
    }

    pub fn requested(&self, instance: &str, role: VolumeRole) -> Option<u64> {
        self.claim(instance, role).map(|v| v.requested)
    }

    pub fn capacity(&self, instance: &str, role: VolumeRole) -> Option<u64> {
        self.claim(instance, role).and_then(|v| v.capacity)
    }

    pub fn claim(&self, instance: &str, role: VolumeRole) -> Option<VolumeInfo> {
        self.state
            .lock()
            .unwrap()
            .claims
            .get(&(instance.to_string(), role))
            .cloned()
    }

    /// The backend finishes growing one claim to its requested size
    pub fn propagate(&self, instance: &str, role: VolumeRole) {
        if let Some(claim) = self
            .state
            .lock()
            .unwrap()
            .claims
            .get_mut(&(instance.to_string(), role))
        {
            claim.capacity = Some(claim.requested);
        }
    }

    pub fn propagate_all(&self) {
        for claim in self.state.lock().unwrap().claims.values_mut() {
            claim.capacity = Some(claim.requested);
        }
    }

    pub fn patches(&self) -> Vec<(String, VolumeRole, u64)> {
        self.state.lock().unwrap().patches.clone()
    }

    pub fn provisioned(&self) -> Vec<(String, VolumeRole, u64)> {
        self.state.lock().unwrap().provisioned.clone()
    }

    pub fn recycled(&self) -> Vec<String> {
        self.state.lock().unwrap().recycled.clone()
    }
}

#[async_trait]
impl VolumeBackend for FakeVolumes {
    async fn get_volume(
        &self,
        _key: &ClusterKey,
        instance: &str,
        role: VolumeRole,
    ) -> Result<Option<VolumeInfo>> {
        let key = (instance.to_string(), role);
        if self.state.lock().unwrap().malformed.contains(&key) {
            return Err(Error::ValidationError(format!(
                "claim {}-{} has no parsable storage request",
                role.claim_prefix(),
                instance
            )));
        }
        Ok(self.claim(instance, role))
    }

    async fn supports_expansion(&self, storage_class: Option<&str>) -> Result<bool> {
        let class = storage_class.map(str::to_string);
        Ok(!self.state.lock().unwrap().non_expandable.contains(&class))
    }

    async fn patch_requested_size(
        &self,
        _key: &ClusterKey,
        instance: &str,
        role: VolumeRole,
        size: u64,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let auto_propagate = state.auto_propagate;
        let claim = state
            .claims
            .get_mut(&(instance.to_string(), role))
            .ok_or_else(|| Error::NotFound(format!("{} volume of {}", role, instance)))?;
        claim.requested = size;
        if auto_propagate {
            claim.capacity = Some(size);
        }
        state.patches.push((instance.to_string(), role, size));
        Ok(())
    }

    async fn provision_volume(
        &self,
        _key: &ClusterKey,
        instance: &str,
        role: VolumeRole,
        size: u64,
        storage_class: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.claims.insert(
            (instance.to_string(), role),
            VolumeInfo {
                requested: size,
                capacity: Some(size),
                storage_class: storage_class.map(str::to_string),
            },
        );
        state.provisioned.push((instance.to_string(), role, size));
        Ok(())
    }

    async fn recycle_instance(&self, _key: &ClusterKey, instance: &str) -> Result<()> {
        self.state.lock().unwrap().recycled.push(instance.to_string());
        Ok(())
    }
}

// =============================================================================
// EventSink
// =============================================================================

/// Records every published event
#[derive(Clone, Default)]
pub struct RecordingEvents {
    events: Arc<Mutex<Vec<StorageEvent>>>,
}

impl RecordingEvents {
    pub fn all(&self) -> Vec<StorageEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn reasons(&self) -> Vec<EventReason> {
        self.all().into_iter().map(|e| e.reason).collect()
    }

    pub fn count(&self, reason: EventReason) -> usize {
        self.all().iter().filter(|e| e.reason == reason).count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

#[async_trait]
impl EventSink for RecordingEvents {
    async fn emit(&self, _key: &ClusterKey, event: &StorageEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

// =============================================================================
// Harness
// =============================================================================

/// A coordinator wired to fakes of one cluster
pub struct Harness {
    pub key: ClusterKey,
    pub cluster: FakeCluster,
    pub directory: FakeDirectory,
    pub probe: FakeProbe,
    pub volumes: FakeVolumes,
    pub events: RecordingEvents,
    pub coordinator: Coordinator,
}

impl Harness {
    /// Seed a bound claim of the spec size for every member and role
    pub fn new(cluster: PostgresCluster) -> Self {
        let key = ClusterKey::new(
            cluster.metadata.namespace.clone().unwrap_or_default(),
            cluster.metadata.name.clone().unwrap_or_default(),
        );
        let volumes = FakeVolumes::default();
        let snapshot = snapshot_of(&cluster).unwrap();
        for instance in instance_names(&key.name, snapshot.replicas) {
            volumes.add_claim(&instance, VolumeRole::Data, spec_size(&cluster.spec.storage.size));
            if let Some(wal) = &cluster.spec.wal_storage {
                volumes.add_claim(&instance, VolumeRole::Wal, spec_size(&wal.size));
            }
        }

        let cluster = FakeCluster::new(cluster);
        let directory = FakeDirectory::default();
        let probe = FakeProbe::default();
        let events = RecordingEvents::default();

        let coordinator = Coordinator::new(
            Arc::new(cluster.clone()),
            Arc::new(directory.clone()),
            Arc::new(probe.clone()),
            Arc::new(volumes.clone()),
            Arc::new(events.clone()),
        )
        .with_config(CoordinatorConfig {
            probe_retries: 0,
            ..Default::default()
        });

        Self {
            key,
            cluster,
            directory,
            probe,
            volumes,
            events,
            coordinator,
        }
    }

    /// Identity of the member with the given ordinal
    pub fn instance(&self, ordinal: u32) -> String {
        format!("{}-{}", self.key.name, ordinal)
    }

    /// Run one tick with samples taken at `now`
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickOutcome> {
        self.probe.set_clock(now);
        self.coordinator.tick(&self.key, now).await
    }

    /// Run one tick that must complete
    pub async fn completed_tick(&self, now: DateTime<Utc>) -> TickReport {
        match self.tick(now).await.unwrap() {
            TickOutcome::Completed(report) => report,
            other => panic!("expected a completed tick, got {:?}", other),
        }
    }

    pub fn status(&self) -> ClusterStorageStatus {
        self.cluster.status()
    }
}

fn spec_size(size: &str) -> u64 {
    postgres_storage_operator::autoresize::parse_quantity(size).unwrap()
}
