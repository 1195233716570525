//! Sandbox data models and wire types.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::TryRngCore;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a sandbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    /// Record exists, workload creation in flight.
    Pending,
    /// Workload created.
    Running,
    /// Workload torn down, service and ingress kept.
    Paused,
    /// Sandbox deleted.
    Stopped,
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxStatus::Pending => write!(f, "pending"),
            SandboxStatus::Running => write!(f, "running"),
            SandboxStatus::Paused => write!(f, "paused"),
            SandboxStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Observed workload status, as reported by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "running")]
    Running,
    /// Phase running and every container ready.
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "crashloopbackoff")]
    CrashLoopBackOff,
    #[serde(rename = "not found")]
    NotFound,
    #[serde(rename = "unknown")]
    Unknown,
}

impl std::fmt::Display for PodStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PodStatus::Pending => write!(f, "pending"),
            PodStatus::Running => write!(f, "running"),
            PodStatus::Ready => write!(f, "ready"),
            PodStatus::Failed => write!(f, "failed"),
            PodStatus::CrashLoopBackOff => write!(f, "crashloopbackoff"),
            PodStatus::NotFound => write!(f, "not found"),
            PodStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// A sandbox record: the control plane's cached projection of one
/// per-session workload, plus the metadata only the control plane knows
/// (session key, activity).
#[derive(Debug, Clone)]
pub struct SandboxRecord {
    /// Opaque 128-bit identifier, hex-encoded.
    pub runtime_id: String,
    /// Caller-supplied logical identifier. Original casing is preserved for
    /// lookups; hostnames use the lower-cased form.
    pub session_id: String,
    /// Primary public URL (per-sandbox hostname form).
    pub url: String,
    /// 256-bit secret, hex-encoded, injected into the sandbox at creation.
    pub session_api_key: String,
    pub status: SandboxStatus,
    pub pod_status: PodStatus,
    /// Worker public URL -> worker port.
    pub work_hosts: HashMap<String, i32>,
    pub pod_name: String,
    pub service_name: String,
    pub ingress_name: String,
    pub restart_count: i32,
    pub restart_reasons: Vec<String>,
    /// Creation wall-clock; rebuilt from the workload's creation stamp on
    /// rediscovery.
    pub created_at: DateTime<Utc>,
    /// Updated on every accepted data-plane proxy request; drives idle
    /// reaping.
    pub last_activity_at: DateTime<Utc>,
}

/// Container command, accepted either as a single string (run under
/// `/bin/bash -c`, replacing the entrypoint) or as an argument vector
/// (used verbatim as the container command).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    Line(String),
    Argv(Vec<String>),
}

impl Default for CommandSpec {
    fn default() -> Self {
        CommandSpec::Line(String::new())
    }
}

impl CommandSpec {
    /// Resolve into container `(command, args)`. `None` keeps the image
    /// entrypoint. An empty string or empty array is treated as absent; a
    /// single-element array is treated as the string form.
    pub fn to_exec(&self) -> Option<(Vec<String>, Vec<String>)> {
        match self {
            CommandSpec::Argv(argv) if argv.len() > 1 => Some((argv.clone(), Vec::new())),
            CommandSpec::Argv(argv) => match argv.first() {
                Some(line) if !line.is_empty() => Some(bash_c(line)),
                _ => None,
            },
            CommandSpec::Line(line) if !line.is_empty() => Some(bash_c(line)),
            CommandSpec::Line(_) => None,
        }
    }
}

fn bash_c(line: &str) -> (Vec<String>, Vec<String>) {
    (
        vec!["/bin/bash".to_string(), "-c".to_string()],
        vec![line.to_string()],
    )
}

/// Request body for `POST /start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub image: String,
    #[serde(default)]
    pub command: CommandSpec,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    pub session_id: String,
    #[serde(default)]
    pub resource_factor: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_class: Option<String>,
}

/// Request body for `POST /stop`, `/pause` and `/resume`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeIdRequest {
    pub runtime_id: String,
}

/// Response shape shared by every management operation that returns a
/// sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeResponse {
    pub runtime_id: String,
    pub session_id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vscode_url: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_api_key: String,
    pub status: SandboxStatus,
    pub pod_status: PodStatus,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub work_hosts: HashMap<String, i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_count: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub restart_reasons: Vec<String>,
}

/// Response body for `GET /list`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ListResponse {
    pub runtimes: Vec<RuntimeResponse>,
}

/// Response body for `GET /registry_prefix`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RegistryPrefixResponse {
    pub registry_prefix: String,
}

/// Response body for `GET /image_exists`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ImageExistsResponse {
    pub exists: bool,
}

/// One entry of the batch-conversations request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConversationSandbox {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub conversation_ids: Vec<String>,
}

/// Request body for `POST /sessions/batch-conversations`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConversationsRequest {
    #[serde(default)]
    pub sandboxes: HashMap<String, BatchConversationSandbox>,
}

/// The four public hostnames derived from one session id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHosts {
    pub agent: String,
    pub vscode: String,
    pub worker_1: String,
    pub worker_2: String,
}

/// Derive the per-sandbox hostnames for a session. Hostnames must be RFC
/// 1123 subdomains, so the session id is lower-cased here; callers keep
/// the original for lookups.
pub fn session_hosts(session_id: &str, base_domain: &str) -> SessionHosts {
    let session = session_id.to_lowercase();
    SessionHosts {
        agent: format!("{session}.{base_domain}"),
        vscode: format!("vscode-{session}.{base_domain}"),
        worker_1: format!("work-1-{session}.{base_domain}"),
        worker_2: format!("work-2-{session}.{base_domain}"),
    }
}

/// Worker public URL -> worker port mapping for a session.
pub fn work_hosts(
    session_id: &str,
    base_domain: &str,
    worker_1_port: i32,
    worker_2_port: i32,
) -> HashMap<String, i32> {
    let hosts = session_hosts(session_id, base_domain);
    HashMap::from([
        (format!("https://{}", hosts.worker_1), worker_1_port),
        (format!("https://{}", hosts.worker_2), worker_2_port),
    ])
}

/// Name shared by the workload, service and ingress of a sandbox.
pub fn runtime_object_name(runtime_id: &str) -> String {
    format!("runtime-{runtime_id}")
}

/// Check that `s` is a valid RFC 1123 DNS subdomain: dot-separated labels
/// of lowercase alphanumerics and `-`, each 1-63 chars starting and ending
/// alphanumeric, 253 chars total.
pub fn is_dns1123_subdomain(s: &str) -> bool {
    if s.is_empty() || s.len() > 253 {
        return false;
    }
    s.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    })
}

/// Generate a fresh runtime id: 16 random bytes, hex-encoded.
pub fn generate_runtime_id() -> String {
    random_hex(16)
}

/// Generate a fresh session API key: 32 random bytes, hex-encoded.
pub fn generate_session_api_key() -> String {
    random_hex(32)
}

/// Hex-encode `len` bytes from the OS RNG. If the RNG fails we degrade to
/// a timestamp-derived value rather than failing the request.
fn random_hex(len: usize) -> String {
    let mut buf = vec![0u8; len];
    match OsRng.try_fill_bytes(&mut buf) {
        Ok(()) => hex::encode(buf),
        Err(err) => {
            log::warn!("OS RNG unavailable, falling back to timestamp id: {err}");
            format!("{:x}", Utc::now().timestamp_nanos_opt().unwrap_or_default())
        }
    }
}

impl SandboxRecord {
    /// Build a fresh record for a new session. Object names derive from the
    /// runtime id; the public URL and worker hosts derive from the session
    /// id and base domain.
    pub fn new(
        runtime_id: String,
        session_id: String,
        session_api_key: String,
        base_domain: &str,
        worker_1_port: i32,
        worker_2_port: i32,
    ) -> Self {
        let hosts = session_hosts(&session_id, base_domain);
        let name = runtime_object_name(&runtime_id);
        let now = Utc::now();
        Self {
            runtime_id,
            url: format!("https://{}", hosts.agent),
            work_hosts: work_hosts(&session_id, base_domain, worker_1_port, worker_2_port),
            session_id,
            session_api_key,
            status: SandboxStatus::Pending,
            pod_status: PodStatus::Pending,
            pod_name: name.clone(),
            service_name: name.clone(),
            ingress_name: name,
            restart_count: 0,
            restart_reasons: Vec::new(),
            created_at: now,
            last_activity_at: now,
        }
    }
}
