//! Kubernetes events emitted by the storage controller

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};

use crate::controller::boundary::{ClusterKey, EventSink};
use crate::controller::error::Result;
use crate::crd::PostgresCluster;

/// Controller name reported on events
pub const REPORTER: &str = "postgres-storage-operator";

/// Event reasons. Rate-limit denials are only ever reported as
/// `AutoResizeRateLimited`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventReason {
    AutoResizeTriggered,
    AutoResizeStarted,
    AutoResizeSuccess,
    AutoResizeBlocked,
    AutoResizeRateLimited,
}

impl EventReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventReason::AutoResizeTriggered => "AutoResizeTriggered",
            EventReason::AutoResizeStarted => "AutoResizeStarted",
            EventReason::AutoResizeSuccess => "AutoResizeSuccess",
            EventReason::AutoResizeBlocked => "AutoResizeBlocked",
            EventReason::AutoResizeRateLimited => "AutoResizeRateLimited",
        }
    }

    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            EventReason::AutoResizeBlocked | EventReason::AutoResizeRateLimited
        )
    }
}

impl fmt::Display for EventReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event waiting to be published
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageEvent {
    pub reason: EventReason,
    pub message: String,
}

impl StorageEvent {
    pub fn new(reason: EventReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

/// Publishes events against the PostgresCluster object
pub struct KubeEventSink {
    recorder: Recorder,
}

impl KubeEventSink {
    pub fn new(client: Client, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: REPORTER.to_string(),
            instance,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

fn cluster_reference(key: &ClusterKey) -> ObjectReference {
    ObjectReference {
        api_version: Some(PostgresCluster::api_version(&()).to_string()),
        kind: Some(PostgresCluster::kind(&()).to_string()),
        name: Some(key.name.clone()),
        namespace: Some(key.namespace.clone()),
        ..Default::default()
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn emit(&self, key: &ClusterKey, event: &StorageEvent) -> Result<()> {
        let type_ = if event.reason.is_warning() {
            EventType::Warning
        } else {
            EventType::Normal
        };
        self.recorder
            .publish(
                &Event {
                    type_,
                    reason: event.reason.to_string(),
                    note: Some(event.message.clone()),
                    action: "Resize".to_string(),
                    secondary: None,
                },
                &cluster_reference(key),
            )
            .await?;
        Ok(())
    }
}
