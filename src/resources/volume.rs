//! Volume claims for new members
//!
//! A StatefulSet adopts an existing claim with the expected name instead of
//! creating one from its template, so pre-creating the claim lets a new member
//! start at the cluster's current size rather than the original template size.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::core::ObjectMeta;

use crate::autoresize::format_quantity;
use crate::crd::VolumeRole;
use crate::resources::common::{pvc_name, standard_labels};

/// Size requested by a claim, in bytes
pub fn requested_bytes(pvc: &PersistentVolumeClaim) -> Option<u64> {
    let q = pvc
        .spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get("storage")?;
    crate::autoresize::parse_quantity(&q.0).ok()
}

/// Capacity the storage backend reports for a bound claim, in bytes
pub fn capacity_bytes(pvc: &PersistentVolumeClaim) -> Option<u64> {
    let q = pvc.status.as_ref()?.capacity.as_ref()?.get("storage")?;
    crate::autoresize::parse_quantity(&q.0).ok()
}

/// Claim for `role` on `instance`, requesting `size` bytes
pub fn claim_for_instance(
    cluster_name: &str,
    namespace: &str,
    instance: &str,
    role: VolumeRole,
    size: u64,
    storage_class: Option<String>,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(pvc_name(instance, role)),
            namespace: Some(namespace.to_string()),
            labels: Some(standard_labels(cluster_name)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: storage_class,
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(format_quantity(size)),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Merge patch raising the requested size of a claim
pub fn resize_patch(size: u64) -> serde_json::Value {
    serde_json::json!({
        "spec": {
            "resources": {
                "requests": {
                    "storage": format_quantity(size)
                }
            }
        }
    })
}
