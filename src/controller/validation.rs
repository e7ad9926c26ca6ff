//! Validation of the storage-related parts of a PostgresCluster spec
//!
//! Resize policies are not validated here: an invalid policy only disables
//! resizing of its own volume role and is reported on the
//! `StorageResizeBlocked` condition, so the other role keeps working.

use crate::autoresize::parse_quantity;
use crate::controller::error::{Error, Result};
use crate::crd::{PostgresCluster, StorageSpec};

/// Minimum number of replicas
pub const MIN_REPLICAS: i32 = 1;

/// Maximum number of replicas (arbitrary limit for safety)
pub const MAX_REPLICAS: i32 = 100;

/// Validate the cluster spec
pub fn validate_spec(cluster: &PostgresCluster) -> Result<()> {
    validate_replicas(cluster)?;
    validate_storage("storage", &cluster.spec.storage)?;
    if let Some(wal) = &cluster.spec.wal_storage {
        validate_storage("walStorage", wal)?;
    }
    Ok(())
}

/// Validate replica count
fn validate_replicas(cluster: &PostgresCluster) -> Result<()> {
    let replicas = cluster.spec.replicas;

    if replicas < MIN_REPLICAS {
        return Err(Error::ValidationError(format!(
            "replica count {} is below minimum {}",
            replicas, MIN_REPLICAS
        )));
    }

    if replicas > MAX_REPLICAS {
        return Err(Error::ValidationError(format!(
            "replica count {} exceeds maximum {}",
            replicas, MAX_REPLICAS
        )));
    }

    Ok(())
}

/// Validate the size of one volume role
fn validate_storage(field: &str, storage: &StorageSpec) -> Result<()> {
    let bytes = parse_quantity(&storage.size)
        .map_err(|e| Error::ValidationError(format!("{}.size: {}", field, e)))?;

    if bytes == 0 {
        return Err(Error::ValidationError(format!(
            "{}.size must be greater than zero",
            field
        )));
    }

    Ok(())
}
