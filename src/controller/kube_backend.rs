//! Boundary traits implemented against the Kubernetes API

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info};

use crate::autoresize::ResizePolicy;
use crate::controller::boundary::{
    ClusterKey, ClusterSnapshot, ClusterSource, InstanceDirectory, InstanceInfo, RoleConfig,
    RolePolicy, VolumeBackend, VolumeInfo,
};
use crate::controller::error::{Error, Result};
use crate::controller::status::storage_status_patch;
use crate::crd::{ClusterStorageStatus, PostgresCluster, StorageSpec, VolumeRole};
use crate::resources::common::{
    instance_names, pvc_name, CLUSTER_LABEL, FIELD_MANAGER, PRIMARY_ROLE, ROLE_LABEL,
};
use crate::resources::volume::{capacity_bytes, claim_for_instance, requested_bytes, resize_patch};

/// Annotation marking the cluster-wide default storage class
const DEFAULT_CLASS_ANNOTATION: &str = "storageclass.kubernetes.io/is-default-class";

/// Reads clusters, pods and claims and writes claims and cluster status
#[derive(Clone)]
pub struct KubeBackend {
    client: Client,
}

impl KubeBackend {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn clusters(&self, key: &ClusterKey) -> Api<PostgresCluster> {
        Api::namespaced(self.client.clone(), &key.namespace)
    }

    fn claims(&self, key: &ClusterKey) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), &key.namespace)
    }

    fn pods(&self, key: &ClusterKey) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &key.namespace)
    }

    async fn default_storage_class(&self) -> Result<Option<StorageClass>> {
        let classes: Api<StorageClass> = Api::all(self.client.clone());
        let list = classes.list(&ListParams::default()).await?;
        Ok(list.items.into_iter().find(|sc| {
            sc.annotations()
                .get(DEFAULT_CLASS_ANNOTATION)
                .is_some_and(|v| v == "true")
        }))
    }
}

fn role_config(role: VolumeRole, storage: &StorageSpec) -> RoleConfig {
    RoleConfig {
        role,
        storage_class: storage.storage_class.clone(),
        policy: RolePolicy::from_result(ResizePolicy::from_spec(storage.resize.as_ref())),
    }
}

/// Everything the coordinator needs from a cluster object
pub fn snapshot_of(cluster: &PostgresCluster) -> Result<ClusterSnapshot> {
    let version = cluster
        .resource_version()
        .ok_or(Error::MissingObjectKey(".metadata.resourceVersion"))?;

    let mut roles = vec![role_config(VolumeRole::Data, &cluster.spec.storage)];
    if let Some(wal) = &cluster.spec.wal_storage {
        roles.push(role_config(VolumeRole::Wal, wal));
    }

    Ok(ClusterSnapshot {
        version,
        replicas: u32::try_from(cluster.spec.replicas).unwrap_or(0),
        roles,
        hibernated: cluster.is_hibernated(),
        terminating: cluster.is_terminating(),
        status: cluster.storage_status(),
    })
}

fn is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

fn is_primary(pod: &Pod) -> bool {
    pod.labels()
        .get(ROLE_LABEL)
        .is_some_and(|role| role == PRIMARY_ROLE)
}

#[async_trait]
impl ClusterSource for KubeBackend {
    async fn load(&self, key: &ClusterKey) -> Result<Option<ClusterSnapshot>> {
        match self.clusters(key).get_opt(&key.name).await? {
            Some(cluster) => Ok(Some(snapshot_of(&cluster)?)),
            None => Ok(None),
        }
    }

    async fn persist(
        &self,
        key: &ClusterKey,
        version: &str,
        previous: &ClusterStorageStatus,
        next: &ClusterStorageStatus,
    ) -> Result<String> {
        let patch = storage_status_patch(previous, next, version)?;
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };

        let updated = match self
            .clusters(key)
            .patch_status(&key.name, &params, &Patch::Merge(&patch))
            .await
        {
            Ok(updated) => updated,
            Err(kube::Error::Api(e)) if e.code == 409 => {
                return Err(Error::ConflictError(format!(
                    "{} changed since version {}",
                    key, version
                )));
            }
            Err(e) => return Err(e.into()),
        };

        debug!(cluster = %key, phase = %next.phase, "Persisted storage status");
        updated
            .resource_version()
            .ok_or(Error::MissingObjectKey(".metadata.resourceVersion"))
    }

    async fn is_active(&self, key: &ClusterKey) -> Result<bool> {
        Ok(self
            .clusters(key)
            .get_opt(&key.name)
            .await?
            .is_some_and(|c| !c.is_terminating()))
    }
}

#[async_trait]
impl InstanceDirectory for KubeBackend {
    async fn instances(&self, key: &ClusterKey, replicas: u32) -> Result<Vec<InstanceInfo>> {
        let selector = format!("{}={}", CLUSTER_LABEL, key.name);
        let pods = self
            .pods(key)
            .list(&ListParams::default().labels(&selector))
            .await?;

        Ok(instance_names(&key.name, replicas)
            .into_iter()
            .map(|id| {
                let pod = pods.items.iter().find(|p| p.name_any() == id);
                InstanceInfo {
                    pod_ip: pod
                        .and_then(|p| p.status.as_ref())
                        .and_then(|s| s.pod_ip.clone()),
                    is_primary: pod.is_some_and(is_primary),
                    ready: pod.is_some_and(is_ready),
                    id,
                }
            })
            .collect())
    }
}

#[async_trait]
impl VolumeBackend for KubeBackend {
    async fn get_volume(
        &self,
        key: &ClusterKey,
        instance: &str,
        role: VolumeRole,
    ) -> Result<Option<VolumeInfo>> {
        let name = pvc_name(instance, role);
        let Some(pvc) = self.claims(key).get_opt(&name).await? else {
            return Ok(None);
        };
        let requested = requested_bytes(&pvc).ok_or_else(|| {
            Error::ValidationError(format!("claim {} has no parsable storage request", name))
        })?;

        Ok(Some(VolumeInfo {
            requested,
            capacity: capacity_bytes(&pvc),
            storage_class: pvc.spec.as_ref().and_then(|s| s.storage_class_name.clone()),
        }))
    }

    async fn supports_expansion(&self, storage_class: Option<&str>) -> Result<bool> {
        let class = match storage_class {
            Some(name) => {
                let classes: Api<StorageClass> = Api::all(self.client.clone());
                classes.get_opt(name).await?
            }
            None => self.default_storage_class().await?,
        };
        Ok(class.is_some_and(|sc| sc.allow_volume_expansion.unwrap_or(false)))
    }

    async fn patch_requested_size(
        &self,
        key: &ClusterKey,
        instance: &str,
        role: VolumeRole,
        size: u64,
    ) -> Result<()> {
        let name = pvc_name(instance, role);
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.claims(key)
            .patch(&name, &params, &Patch::Merge(&resize_patch(size)))
            .await?;
        debug!(pvc = %name, size, "Patched claim size");
        Ok(())
    }

    async fn provision_volume(
        &self,
        key: &ClusterKey,
        instance: &str,
        role: VolumeRole,
        size: u64,
        storage_class: Option<&str>,
    ) -> Result<()> {
        let claim = claim_for_instance(
            &key.name,
            &key.namespace,
            instance,
            role,
            size,
            storage_class.map(str::to_string),
        );
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        match self.claims(key).create(&params, &claim).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(pvc = %claim.name_any(), "Claim already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn recycle_instance(&self, key: &ClusterKey, instance: &str) -> Result<()> {
        match self.pods(key).delete(instance, &DeleteParams::default()).await {
            Ok(_) => {
                info!(pod = %instance, "Deleted pod to finish offline volume expansion");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
