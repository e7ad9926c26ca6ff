//! Common utilities for Kubernetes resource naming and labelling
//!
//! Instance identities and claim names follow the StatefulSet conventions of
//! the lifecycle controller: pods are `<cluster>-<ordinal>` and claims are
//! `<template>-<cluster>-<ordinal>`.

use std::collections::BTreeMap;

use crate::crd::VolumeRole;

/// Operator field manager name for patches
pub const FIELD_MANAGER: &str = "postgres-storage-operator";

/// Label carrying the owning cluster's name on pods and claims
pub const CLUSTER_LABEL: &str = "postgres.example.com/cluster";

/// Label Patroni sets on the leader pod
pub const ROLE_LABEL: &str = "spilo-role";

/// Value of [`ROLE_LABEL`] on the primary
pub const PRIMARY_ROLE: &str = "master";

/// Generate standard labels for resources belonging to a PostgresCluster
pub fn standard_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            cluster_name.to_string(),
        ),
        (
            "app.kubernetes.io/component".to_string(),
            "postgresql".to_string(),
        ),
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
        (CLUSTER_LABEL.to_string(), cluster_name.to_string()),
    ])
}

/// Stable identity of the member with the given ordinal
pub fn instance_name(cluster_name: &str, ordinal: u32) -> String {
    format!("{}-{}", cluster_name, ordinal)
}

/// Identities of every member the spec asks for
pub fn instance_names(cluster_name: &str, replicas: u32) -> Vec<String> {
    (0..replicas).map(|i| instance_name(cluster_name, i)).collect()
}

/// Ordinal of an instance identity, if it belongs to the cluster
pub fn instance_ordinal(cluster_name: &str, instance: &str) -> Option<u32> {
    instance
        .strip_prefix(cluster_name)?
        .strip_prefix('-')?
        .parse()
        .ok()
}

/// Name of the claim backing `role` on `instance`
pub fn pvc_name(instance: &str, role: VolumeRole) -> String {
    format!("{}-{}", role.claim_prefix(), instance)
}
