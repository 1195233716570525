//! Orchestrator adapter: the capability set the control plane needs from
//! the cluster that actually runs sandboxes.
//!
//! The trait abstracts over the real Kubernetes client so the reaper,
//! reconciler and API handlers can be exercised against a fake in tests.
//! `NotFound` is a value here, not a failure: delete paths treat it as
//! already-done, status paths map it to [`PodStatus::NotFound`].

mod kube;

pub use kube::KubeOrchestrator;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::sandbox::models::{PodStatus, SandboxRecord, StartRequest};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("timed out waiting for pod {0} to become ready")]
    ReadyTimeout(String),

    #[error("pod {pod} failed with status: {status}")]
    PodFailed { pod: String, status: PodStatus },

    #[error("{0} timed out")]
    Timeout(String),

    #[error("errors deleting sandbox: {0}")]
    Teardown(String),

    #[error("{context}: {source}")]
    Api {
        context: String,
        #[source]
        source: ::kube::Error,
    },
}

impl OrchestratorError {
    /// Whether this error means the referenced object does not exist.
    /// Delete paths treat that as already-done.
    pub fn is_not_found(&self) -> bool {
        match self {
            OrchestratorError::NotFound { .. } => true,
            OrchestratorError::Api { source, .. } => {
                matches!(source, ::kube::Error::Api(response) if response.code == 404)
            }
            _ => false,
        }
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Observed status of one workload, aggregated across its containers.
#[derive(Debug, Clone)]
pub struct PodStatusInfo {
    pub status: PodStatus,
    pub restart_count: i32,
    pub restart_reasons: Vec<String>,
}

impl PodStatusInfo {
    pub fn not_found() -> Self {
        Self {
            status: PodStatus::NotFound,
            restart_count: 0,
            restart_reasons: Vec::new(),
        }
    }
}

/// Capability set over sandbox workloads.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Provision the workload, service and ingress for a sandbox. Objects
    /// already created are deleted again when a later step fails.
    async fn create_sandbox(
        &self,
        spec: &StartRequest,
        record: &SandboxRecord,
    ) -> OrchestratorResult<()>;

    /// Delete ingress, service and workload, in that order. A missing
    /// object is not an error; only real failures are reported.
    async fn delete_sandbox(&self, record: &SandboxRecord) -> OrchestratorResult<()>;

    /// Observed status for one workload. A missing workload yields
    /// [`PodStatus::NotFound`], not an error.
    async fn pod_status(&self, pod_name: &str) -> OrchestratorResult<PodStatusInfo>;

    /// Statuses for several workloads in a single list call. Requested
    /// names missing from the cluster map to [`PodStatus::NotFound`].
    async fn pod_statuses(
        &self,
        pod_names: &[String],
    ) -> OrchestratorResult<HashMap<String, PodStatusInfo>>;

    /// Pause: tear down the workload while leaving service and ingress in
    /// place so hostnames stay stable.
    async fn scale_to_zero(&self, pod_name: &str) -> OrchestratorResult<()>;

    /// Resume: re-provision the workload from stored metadata.
    async fn recreate_pod(
        &self,
        spec: &StartRequest,
        record: &SandboxRecord,
    ) -> OrchestratorResult<()>;

    /// Poll until the workload reports ready. Fails fast on `failed` or
    /// `crashloopbackoff`, otherwise errors after `timeout`.
    async fn wait_for_pod_ready(
        &self,
        pod_name: &str,
        timeout: Duration,
    ) -> OrchestratorResult<()>;

    /// Reconstruct records for every sandbox workload in the cluster.
    async fn discover_all(&self) -> OrchestratorResult<Vec<SandboxRecord>>;

    /// Reconstruct the record for one runtime id, if its workload exists.
    async fn discover_by_runtime_id(
        &self,
        runtime_id: &str,
    ) -> OrchestratorResult<Option<SandboxRecord>>;

    /// Reconstruct the record for one session id, if its workload exists.
    async fn discover_by_session_id(
        &self,
        session_id: &str,
    ) -> OrchestratorResult<Option<SandboxRecord>>;
}
