use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use kube::Client;

use crate::controller::boundary::ClusterKey;
use crate::controller::coordinator::Coordinator;
use crate::controller::error::{Error, ErrorContext};
use crate::controller::events::KubeEventSink;
use crate::controller::kube_backend::KubeBackend;
use crate::controller::probe::HttpUsageProbe;
use crate::health::HealthState;

/// Shared context for the controller
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Health and metrics state, when the health server runs
    pub health_state: Option<Arc<HealthState>>,
    pub coordinator: Coordinator,
    /// Consecutive failures per cluster, for requeue backoff
    errors: Mutex<HashMap<ClusterKey, ErrorContext>>,
}

impl Context {
    /// Context backed by the API server. `instance` identifies this replica on
    /// published events.
    pub fn new(
        client: Client,
        health_state: Option<Arc<HealthState>>,
        instance: Option<String>,
    ) -> Self {
        let backend = Arc::new(KubeBackend::new(client.clone()));
        let coordinator = Coordinator::new(
            backend.clone(),
            backend.clone(),
            Arc::new(HttpUsageProbe::default()),
            backend,
            Arc::new(KubeEventSink::new(client.clone(), instance)),
        );
        Self {
            client,
            health_state,
            coordinator,
            errors: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure and return the number of consecutive failures
    pub fn record_error(&self, key: &ClusterKey, error: &Error) -> u32 {
        let Ok(mut errors) = self.errors.lock() else {
            return 0;
        };
        let entry = errors.entry(key.clone()).or_default();
        entry.record_error(error);
        entry.consecutive_errors
    }

    pub fn reset_errors(&self, key: &ClusterKey) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.remove(key);
        }
    }
}
