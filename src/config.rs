//! Process configuration, assembled once from the environment.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use config::Environment;
use serde::Deserialize;

/// Immutable configuration for the control plane.
///
/// Every field maps to an environment variable of the same name in upper
/// case (e.g. `server_port` <- `SERVER_PORT`). Durations are expressed in
/// the unit their name carries.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listening port for the HTTP server.
    pub server_port: u16,
    /// Management API key (required). Compared in constant time.
    pub api_key: String,
    /// `info` or `debug`. Debug logs request headers and bodies, which
    /// includes API keys and session secrets.
    pub log_level: String,
    /// Bound on the graceful drain of in-flight requests at shutdown.
    pub shutdown_timeout_seconds: u64,

    /// Timeout for create/delete/recreate calls against the orchestrator.
    pub k8s_operation_timeout_seconds: u64,
    /// Timeout for get/list calls against the orchestrator.
    pub k8s_query_timeout_seconds: u64,

    /// Namespace holding every sandbox object.
    pub namespace: String,
    /// Ingress controller class name.
    pub ingress_class: String,
    /// Public base domain for per-sandbox hostnames.
    pub base_domain: String,
    /// Extra annotations merged into each sandbox ingress, as
    /// comma-separated `key=value` pairs. Values may contain `=`.
    pub sandbox_ingress_annotations: String,

    /// Registry prefix returned verbatim by `/registry_prefix`.
    pub registry_prefix: String,
    /// Image used when resuming a paused sandbox.
    pub default_image: String,
    /// Comma-separated secret names referenced as image pull secrets.
    pub image_pull_secrets: String,

    pub agent_port: i32,
    pub vscode_port: i32,
    pub worker_1_port: i32,
    pub worker_2_port: i32,

    /// Webhook destination injected into each sandbox (wins over any
    /// caller-supplied value).
    pub app_server_url: String,
    /// CORS origin injected into each sandbox.
    pub app_server_public_url: String,

    /// When set, `/start` returns URLs under this base and the sandbox
    /// proxy is mounted. Trailing slash is stripped at load.
    pub proxy_base_url: String,

    pub cleanup_enabled: bool,
    pub cleanup_interval_minutes: u64,
    pub cleanup_failed_threshold_minutes: i64,
    pub cleanup_idle_threshold_minutes: i64,

    /// Optional CA certificate secret mounted into each sandbox.
    pub ca_cert_secret_name: String,
    /// Key within the CA secret.
    pub ca_cert_secret_key: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_port: 8080,
            api_key: String::new(),
            log_level: "info".to_string(),
            shutdown_timeout_seconds: 30,
            k8s_operation_timeout_seconds: 60,
            k8s_query_timeout_seconds: 10,
            namespace: "sandboxes".to_string(),
            ingress_class: "nginx".to_string(),
            base_domain: "sandbox.example.com".to_string(),
            sandbox_ingress_annotations: String::new(),
            registry_prefix: "ghcr.io/sandboxd".to_string(),
            default_image: "ghcr.io/sandboxd/agent:latest".to_string(),
            image_pull_secrets: String::new(),
            agent_port: 60000,
            vscode_port: 60001,
            worker_1_port: 12000,
            worker_2_port: 12001,
            app_server_url: String::new(),
            app_server_public_url: String::new(),
            proxy_base_url: String::new(),
            cleanup_enabled: true,
            cleanup_interval_minutes: 5,
            cleanup_failed_threshold_minutes: 60,
            cleanup_idle_threshold_minutes: 1440,
            ca_cert_secret_name: String::new(),
            ca_cert_secret_key: "ca-certificates.crt".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the environment, applying defaults for
    /// anything unset.
    pub fn from_env() -> Result<Self> {
        let cfg: Config = config::Config::builder()
            .add_source(Environment::default().try_parsing(true))
            .build()
            .context("reading environment")?
            .try_deserialize()
            .context("deserializing configuration")?;
        Ok(cfg.normalized())
    }

    fn normalized(mut self) -> Self {
        while self.proxy_base_url.ends_with('/') {
            self.proxy_base_url.pop();
        }
        self
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.k8s_operation_timeout_seconds)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.k8s_query_timeout_seconds)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_minutes * 60)
    }

    /// Whether the stable-URL proxy mode is active.
    pub fn proxy_mode(&self) -> bool {
        !self.proxy_base_url.is_empty()
    }

    /// Parsed sandbox ingress annotations.
    pub fn ingress_annotations(&self) -> HashMap<String, String> {
        parse_annotations(&self.sandbox_ingress_annotations)
    }

    /// Parsed image pull secret names.
    pub fn pull_secrets(&self) -> Vec<String> {
        parse_name_list(&self.image_pull_secrets)
    }
}

/// Parse `key1=value1,key2=value2` into a map. Values may contain `=`;
/// malformed pairs are skipped.
fn parse_annotations(s: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for pair in s.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        out.insert(key.to_string(), value.trim().to_string());
    }
    out
}

/// Parse a comma-separated list of names, dropping empties.
fn parse_name_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}
