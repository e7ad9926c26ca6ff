//! Disk usage probe against the instance manager's HTTP endpoint
//!
//! Every PostgreSQL pod runs an instance manager that reports filesystem
//! statistics for its mounted volumes on `GET /storage` (port 8000):
//!
//! ```json
//! {
//!   "sampledAt": "2026-03-01T12:00:00Z",
//!   "volumes": {
//!     "data": { "percentUsed": 81.5, "availableBytes": 396361728, "totalBytes": 2147483648 },
//!     "wal":  { "percentUsed": 12.0, "availableBytes": 944892805, "totalBytes": 1073741824 }
//!   },
//!   "walHealth": { "archiveHealthy": true, "pendingWALFiles": 2, "inactiveSlots": [] }
//! }
//! ```
//!
//! # Requirements
//!
//! The operator must run inside the cluster with network access to pod IPs.
//! If NetworkPolicies restrict traffic to PostgreSQL pods, allow the operator
//! namespace to reach port 8000.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1;
use hyper::Request;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::autoresize::WalHealth;
use crate::controller::boundary::{ClusterKey, InstanceInfo, UsageProbe, UsageSample};
use crate::crd::VolumeRole;

/// Overall timeout for one probe (connect + request + response)
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Instance manager HTTP port
pub const INSTANCE_MANAGER_PORT: u16 = 8000;

const STORAGE_PATH: &str = "/storage";

/// Errors that can occur while sampling disk usage.
///
/// All of them are transient from the coordinator's point of view: the last
/// known value is kept and marked stale.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// The instance is not running or not ready
    #[error("Instance {0} is not ready")]
    NotReady(String),

    /// Pod IP not available (pod may be starting)
    #[error("Pod IP not available for {0}")]
    NoPodIp(String),

    /// The instance does not report the requested volume
    #[error("Instance {instance} reports no {role} volume")]
    MissingVolume { instance: String, role: VolumeRole },

    /// Reported usage is outside 0-100
    #[error("Implausible usage {0} reported")]
    InvalidUsage(f64),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP request failed: {0}")]
    HttpError(String),

    #[error("Connection failed: {0}")]
    ConnectionError(String),

    #[error("Request timed out")]
    Timeout,
}

/// Usage of one mounted volume
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeStats {
    pub percent_used: f64,
    #[serde(default)]
    pub available_bytes: Option<u64>,
    #[serde(default)]
    pub total_bytes: Option<u64>,
}

/// Body of `GET /storage`
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageReport {
    #[serde(default)]
    pub sampled_at: Option<DateTime<Utc>>,
    pub volumes: BTreeMap<String, VolumeStats>,
    #[serde(default)]
    pub wal_health: Option<WalHealth>,
}

/// Extract the sample for `role` from a report.
///
/// `received_at` stands in for the sample time when the instance does not
/// report one.
pub fn sample_from_report(
    instance: &str,
    role: VolumeRole,
    report: StorageReport,
    received_at: DateTime<Utc>,
) -> Result<UsageSample, ProbeError> {
    let stats = report
        .volumes
        .get(role.claim_prefix())
        .ok_or_else(|| ProbeError::MissingVolume {
            instance: instance.to_string(),
            role,
        })?;

    if !stats.percent_used.is_finite() || !(0.0..=100.0).contains(&stats.percent_used) {
        return Err(ProbeError::InvalidUsage(stats.percent_used));
    }

    Ok(UsageSample {
        percent_used: stats.percent_used,
        available_bytes: stats.available_bytes,
        sampled_at: report.sampled_at.unwrap_or(received_at),
        wal_health: report.wal_health,
    })
}

/// Socket address of the status endpoint of a pod.
///
/// Its display form, with IPv6 addresses bracketed, doubles as the `Host`
/// header.
pub fn instance_endpoint(pod_ip: &str, port: u16) -> Result<SocketAddr, ProbeError> {
    let ip: IpAddr = pod_ip
        .parse()
        .map_err(|e| ProbeError::ConnectionError(format!("Invalid pod IP {}: {}", pod_ip, e)))?;
    Ok(SocketAddr::new(ip, port))
}

/// Probes instances over plain HTTP on the pod network
#[derive(Clone, Debug)]
pub struct HttpUsageProbe {
    port: u16,
    timeout: Duration,
}

impl Default for HttpUsageProbe {
    fn default() -> Self {
        Self {
            port: INSTANCE_MANAGER_PORT,
            timeout: PROBE_TIMEOUT,
        }
    }
}

impl HttpUsageProbe {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }

    async fn fetch_report(&self, pod_ip: &str) -> Result<StorageReport, ProbeError> {
        timeout(self.timeout, self.query_storage(pod_ip))
            .await
            .map_err(|_| ProbeError::Timeout)?
    }

    async fn query_storage(&self, pod_ip: &str) -> Result<StorageReport, ProbeError> {
        let addr = instance_endpoint(pod_ip, self.port)?;

        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ProbeError::ConnectionError(e.to_string()))?;

        let io = TokioIo::new(stream);

        let (mut sender, conn) = http1::handshake(io)
            .await
            .map_err(|e| ProbeError::HttpError(e.to_string()))?;

        let req = Request::builder()
            .method("GET")
            .uri(STORAGE_PATH)
            .header("Host", addr.to_string())
            .body(Empty::<Bytes>::new())
            .map_err(|e| ProbeError::HttpError(e.to_string()))?;

        // The connection future must be polled for the request to make progress
        let response = tokio::select! {
            conn_result = conn => {
                if let Err(e) = conn_result {
                    debug!("Connection closed: {}", e);
                }
                return Err(ProbeError::ConnectionError("Connection closed unexpectedly".to_string()));
            }
            response = sender.send_request(req) => {
                response.map_err(|e| ProbeError::HttpError(e.to_string()))?
            }
        };

        if !response.status().is_success() {
            return Err(ProbeError::HttpError(format!(
                "HTTP {}: {}",
                response.status().as_u16(),
                response.status().canonical_reason().unwrap_or("Unknown")
            )));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ProbeError::HttpError(e.to_string()))?
            .to_bytes();

        trace!(pod_ip = pod_ip, response = %String::from_utf8_lossy(&body), "Storage report");

        serde_json::from_slice(&body).map_err(|e| {
            debug!(pod_ip = pod_ip, error = %e, "Failed to parse storage report");
            ProbeError::JsonError(e)
        })
    }
}

#[async_trait]
impl UsageProbe for HttpUsageProbe {
    async fn sample(
        &self,
        _key: &ClusterKey,
        instance: &InstanceInfo,
        role: VolumeRole,
    ) -> Result<UsageSample, ProbeError> {
        if !instance.ready {
            return Err(ProbeError::NotReady(instance.id.clone()));
        }
        let pod_ip = instance
            .pod_ip
            .as_deref()
            .ok_or_else(|| ProbeError::NoPodIp(instance.id.clone()))?;

        let report = self.fetch_report(pod_ip).await?;
        sample_from_report(&instance.id, role, report, Utc::now())
    }
}
