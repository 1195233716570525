//! Kubernetes implementation of the orchestrator adapter.
//!
//! Every sandbox is one pod + one service + one ingress, all named
//! `runtime-{runtime_id}` and labeled `app=sandbox` so the whole fleet can
//! be rediscovered from labels alone after a control-plane restart.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HTTPGetAction, KeyToPath, LocalObjectReference, Pod,
    PodSpec, Probe, ResourceRequirements, SecretVolumeSource, Service, ServicePort, ServiceSpec,
    Volume, VolumeMount,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use log::{debug, info, warn};

use crate::config::Config;
use crate::sandbox::models::{
    session_hosts, PodStatus, SandboxRecord, SandboxStatus, StartRequest,
};

use super::{Orchestrator, OrchestratorError, OrchestratorResult, PodStatusInfo};

const LABEL_APP: &str = "app";
const LABEL_APP_VALUE: &str = "sandbox";
const LABEL_RUNTIME_ID: &str = "runtime-id";
const LABEL_SESSION_ID: &str = "session-id";

const CONTAINER_NAME: &str = "agent";
const CA_VOLUME_NAME: &str = "additional-ca";
const CA_MOUNT_PATH: &str = "/usr/local/share/ca-certificates/additional-ca.crt";
const CA_FILE_NAME: &str = "additional-ca.crt";
const SYSTEM_CA_BUNDLE: &str = "/etc/ssl/certs/ca-certificates.crt";

const READY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Kubernetes-backed orchestrator.
#[derive(Clone)]
pub struct KubeOrchestrator {
    client: Client,
    config: Arc<Config>,
}

impl KubeOrchestrator {
    pub fn new(client: Client, config: Arc<Config>) -> Self {
        Self { client, config }
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn ingresses(&self) -> Api<Ingress> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    /// Run one cluster call under a timeout, wrapping failures with their
    /// context.
    async fn run<T, F>(&self, timeout: Duration, what: &str, fut: F) -> OrchestratorResult<T>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        match tokio::time::timeout(timeout, fut).await {
            Err(_) => Err(OrchestratorError::Timeout(what.to_string())),
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(OrchestratorError::Api {
                context: what.to_string(),
                source,
            }),
        }
    }

    async fn delete_pod(&self, name: &str) -> OrchestratorResult<()> {
        let pods = self.pods();
        let params = DeleteParams::default().grace_period(0);
        self.run(self.config.operation_timeout(), "deleting pod", async move {
            pods.delete(name, &params).await.map(|_| ())
        })
        .await
    }

    async fn delete_service(&self, name: &str) -> OrchestratorResult<()> {
        let services = self.services();
        self.run(self.config.operation_timeout(), "deleting service", async move {
            services.delete(name, &DeleteParams::default()).await.map(|_| ())
        })
        .await
    }

    async fn delete_ingress(&self, name: &str) -> OrchestratorResult<()> {
        let ingresses = self.ingresses();
        self.run(self.config.operation_timeout(), "deleting ingress", async move {
            ingresses.delete(name, &DeleteParams::default()).await.map(|_| ())
        })
        .await
    }

    async fn list_sandbox_pods(&self, selector: &str) -> OrchestratorResult<Vec<Pod>> {
        let pods = self.pods();
        let params = ListParams::default().labels(selector);
        let list = self
            .run(self.config.query_timeout(), "listing sandbox pods", async move {
                pods.list(&params).await
            })
            .await?;
        Ok(list.items)
    }
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn create_sandbox(
        &self,
        spec: &StartRequest,
        record: &SandboxRecord,
    ) -> OrchestratorResult<()> {
        debug!("creating sandbox objects for runtime {}", record.runtime_id);

        let pod = build_pod(&self.config, spec, record);
        let pods = self.pods();
        self.run(self.config.operation_timeout(), "creating pod", async move {
            pods.create(&PostParams::default(), &pod).await
        })
        .await?;

        let service = build_service(&self.config, record);
        let services = self.services();
        if let Err(err) = self
            .run(self.config.operation_timeout(), "creating service", async move {
                services.create(&PostParams::default(), &service).await
            })
            .await
        {
            let _ = self.delete_pod(&record.pod_name).await;
            return Err(err);
        }

        let ingress = build_ingress(&self.config, record);
        let ingresses = self.ingresses();
        if let Err(err) = self
            .run(self.config.operation_timeout(), "creating ingress", async move {
                ingresses.create(&PostParams::default(), &ingress).await
            })
            .await
        {
            let _ = self.delete_pod(&record.pod_name).await;
            let _ = self.delete_service(&record.service_name).await;
            return Err(err);
        }

        info!(
            "created sandbox runtime={} session={}",
            record.runtime_id, record.session_id
        );
        Ok(())
    }

    async fn delete_sandbox(&self, record: &SandboxRecord) -> OrchestratorResult<()> {
        debug!("deleting sandbox objects for runtime {}", record.runtime_id);
        let mut failures = Vec::new();

        for (what, result) in [
            ("ingress", self.delete_ingress(&record.ingress_name).await),
            ("service", self.delete_service(&record.service_name).await),
            ("pod", self.delete_pod(&record.pod_name).await),
        ] {
            match result {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {
                    debug!("{what} for runtime {} already gone", record.runtime_id);
                }
                Err(err) => {
                    warn!(
                        "failed to delete {what} for runtime {}: {err}",
                        record.runtime_id
                    );
                    failures.push(format!("{what}: {err}"));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::Teardown(failures.join("; ")))
        }
    }

    async fn pod_status(&self, pod_name: &str) -> OrchestratorResult<PodStatusInfo> {
        let pods = self.pods();
        let name = pod_name.to_string();
        match self
            .run(self.config.query_timeout(), "getting pod", async move {
                pods.get(&name).await
            })
            .await
        {
            Ok(pod) => Ok(map_pod_status(&pod)),
            Err(err) if err.is_not_found() => Ok(PodStatusInfo::not_found()),
            Err(err) => Err(err),
        }
    }

    async fn pod_statuses(
        &self,
        pod_names: &[String],
    ) -> OrchestratorResult<HashMap<String, PodStatusInfo>> {
        let selector = format!("{LABEL_APP}={LABEL_APP_VALUE}");
        let pods = self.list_sandbox_pods(&selector).await?;

        let mut by_name: HashMap<String, PodStatusInfo> = pods
            .iter()
            .filter_map(|pod| {
                let name = pod.metadata.name.clone()?;
                Some((name, map_pod_status(pod)))
            })
            .collect();

        let mut out = HashMap::with_capacity(pod_names.len());
        for name in pod_names {
            let info = by_name.remove(name).unwrap_or_else(PodStatusInfo::not_found);
            out.insert(name.clone(), info);
        }
        Ok(out)
    }

    async fn scale_to_zero(&self, pod_name: &str) -> OrchestratorResult<()> {
        debug!("scaling pod {pod_name} to zero");
        match self.delete_pod(pod_name).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn recreate_pod(
        &self,
        spec: &StartRequest,
        record: &SandboxRecord,
    ) -> OrchestratorResult<()> {
        debug!("recreating pod {}", record.pod_name);
        let pod = build_pod(&self.config, spec, record);
        let pods = self.pods();
        self.run(self.config.operation_timeout(), "recreating pod", async move {
            pods.create(&PostParams::default(), &pod).await
        })
        .await?;
        Ok(())
    }

    async fn wait_for_pod_ready(
        &self,
        pod_name: &str,
        timeout: Duration,
    ) -> OrchestratorResult<()> {
        let poll = async {
            let mut ticker = tokio::time::interval(READY_POLL_INTERVAL);
            loop {
                ticker.tick().await;
                let info = self.pod_status(pod_name).await?;
                match info.status {
                    PodStatus::Ready => return Ok(()),
                    PodStatus::Failed | PodStatus::CrashLoopBackOff => {
                        return Err(OrchestratorError::PodFailed {
                            pod: pod_name.to_string(),
                            status: info.status,
                        })
                    }
                    _ => {}
                }
            }
        };
        match tokio::time::timeout(timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(OrchestratorError::ReadyTimeout(pod_name.to_string())),
        }
    }

    async fn discover_all(&self) -> OrchestratorResult<Vec<SandboxRecord>> {
        let selector = format!("{LABEL_APP}={LABEL_APP_VALUE}");
        let pods = self.list_sandbox_pods(&selector).await?;
        Ok(pods
            .iter()
            .filter_map(|pod| reconstruct_record(&self.config, pod))
            .collect())
    }

    async fn discover_by_runtime_id(
        &self,
        runtime_id: &str,
    ) -> OrchestratorResult<Option<SandboxRecord>> {
        let selector = format!("{LABEL_APP}={LABEL_APP_VALUE},{LABEL_RUNTIME_ID}={runtime_id}");
        let pods = self.list_sandbox_pods(&selector).await?;
        Ok(pods.first().and_then(|pod| reconstruct_record(&self.config, pod)))
    }

    async fn discover_by_session_id(
        &self,
        session_id: &str,
    ) -> OrchestratorResult<Option<SandboxRecord>> {
        let selector = format!("{LABEL_APP}={LABEL_APP_VALUE},{LABEL_SESSION_ID}={session_id}");
        let pods = self.list_sandbox_pods(&selector).await?;
        Ok(pods.first().and_then(|pod| reconstruct_record(&self.config, pod)))
    }
}

fn labels(record: &SandboxRecord) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_APP.to_string(), LABEL_APP_VALUE.to_string()),
        (LABEL_RUNTIME_ID.to_string(), record.runtime_id.clone()),
        (LABEL_SESSION_ID.to_string(), record.session_id.clone()),
    ])
}

/// Sandbox environment, in injection order. The webhook URL comes last
/// because duplicate keys resolve last-writer-wins in the container.
fn build_env(config: &Config, spec: &StartRequest, record: &SandboxRecord) -> Vec<EnvVar> {
    let mut env = vec![
        env_var("SESSION_API_KEY", &record.session_api_key),
        env_var("SESSION_API_KEYS_0", &record.session_api_key),
        env_var("SANDBOX_RUNTIME_ID", &record.runtime_id),
        env_var("VSCODE_PORT", &config.vscode_port.to_string()),
        env_var("WORKER_1_PORT", &config.worker_1_port.to_string()),
        env_var("WORKER_2_PORT", &config.worker_2_port.to_string()),
    ];

    if !config.app_server_public_url.is_empty() {
        env.push(env_var("CORS_ALLOW_ORIGIN", &config.app_server_public_url));
    }
    if !config.ca_cert_secret_name.is_empty() {
        env.push(env_var("SSL_CERT_FILE", SYSTEM_CA_BUNDLE));
    }

    let mut overrides: Vec<_> = spec.environment.iter().collect();
    overrides.sort_by_key(|(key, _)| key.as_str());
    for (key, value) in overrides {
        env.push(env_var(key, value));
    }

    if !config.app_server_url.is_empty() {
        let webhook = format!("{}/api/v1/webhooks", config.app_server_url);
        env.push(env_var("WEBHOOK_BASE_URL", &webhook));
    }

    env
}

fn build_pod(config: &Config, spec: &StartRequest, record: &SandboxRecord) -> Pod {
    let factor = if spec.resource_factor == 0.0 {
        1.0
    } else {
        spec.resource_factor
    };

    let requests = BTreeMap::from([
        ("cpu".to_string(), Quantity(format!("{:.0}m", 1000.0 * factor))),
        ("memory".to_string(), Quantity(format!("{:.0}Mi", 2048.0 * factor))),
    ]);
    let limits = BTreeMap::from([
        ("cpu".to_string(), Quantity(format!("{:.0}m", 2000.0 * factor))),
        ("memory".to_string(), Quantity(format!("{:.0}Mi", 4096.0 * factor))),
    ]);

    let (command, args) = match spec.command.to_exec() {
        Some((command, args)) => (Some(command), Some(args)),
        None => (None, None),
    };

    let mut volume_mounts = Vec::new();
    let mut volumes = Vec::new();
    if !config.ca_cert_secret_name.is_empty() {
        volumes.push(Volume {
            name: CA_VOLUME_NAME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(config.ca_cert_secret_name.clone()),
                items: Some(vec![KeyToPath {
                    key: config.ca_cert_secret_key.clone(),
                    path: CA_FILE_NAME.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        });
        volume_mounts.push(VolumeMount {
            name: CA_VOLUME_NAME.to_string(),
            mount_path: CA_MOUNT_PATH.to_string(),
            sub_path: Some(CA_FILE_NAME.to_string()),
            read_only: Some(true),
            ..Default::default()
        });
    }

    let image_pull_secrets = {
        let secrets = config.pull_secrets();
        if secrets.is_empty() {
            None
        } else {
            Some(
                secrets
                    .into_iter()
                    .map(|name| LocalObjectReference { name })
                    .collect(),
            )
        }
    };

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(spec.image.clone()),
        command,
        args,
        working_dir: if spec.working_dir.is_empty() {
            None
        } else {
            Some(spec.working_dir.clone())
        },
        env: Some(build_env(config, spec, record)),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ports: Some(vec![
            container_port("agent", config.agent_port),
            container_port("vscode", config.vscode_port),
            container_port("worker-1", config.worker_1_port),
            container_port("worker-2", config.worker_2_port),
        ]),
        resources: Some(ResourceRequirements {
            requests: Some(requests),
            limits: Some(limits),
            ..Default::default()
        }),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/alive".to_string()),
                port: IntOrString::Int(clamp_port(config.agent_port)),
                ..Default::default()
            }),
            initial_delay_seconds: Some(5),
            period_seconds: Some(10),
            failure_threshold: Some(6),
            ..Default::default()
        }),
        volume_mounts: if volume_mounts.is_empty() {
            None
        } else {
            Some(volume_mounts)
        },
        ..Default::default()
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(record.pod_name.clone()),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels(record)),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            restart_policy: Some("Always".to_string()),
            runtime_class_name: spec.runtime_class.clone(),
            image_pull_secrets,
            volumes: if volumes.is_empty() { None } else { Some(volumes) },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_service(config: &Config, record: &SandboxRecord) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(record.service_name.clone()),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels(record)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([(
                LABEL_RUNTIME_ID.to_string(),
                record.runtime_id.clone(),
            )])),
            ports: Some(vec![
                service_port("agent", config.agent_port),
                service_port("vscode", config.vscode_port),
                service_port("worker-1", config.worker_1_port),
                service_port("worker-2", config.worker_2_port),
            ]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_ingress(config: &Config, record: &SandboxRecord) -> Ingress {
    let hosts = session_hosts(&record.session_id, &config.base_domain);

    let mut annotations = BTreeMap::from([
        (
            "nginx.ingress.kubernetes.io/ssl-redirect".to_string(),
            "true".to_string(),
        ),
        (
            "nginx.ingress.kubernetes.io/websocket-services".to_string(),
            record.service_name.clone(),
        ),
    ]);
    for (key, value) in config.ingress_annotations() {
        annotations.insert(key, value);
    }

    let rules = vec![
        host_rule(&hosts.agent, &record.service_name, config.agent_port),
        host_rule(&hosts.vscode, &record.service_name, config.vscode_port),
        host_rule(&hosts.worker_1, &record.service_name, config.worker_1_port),
        host_rule(&hosts.worker_2, &record.service_name, config.worker_2_port),
    ];

    Ingress {
        metadata: ObjectMeta {
            name: Some(record.ingress_name.clone()),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels(record)),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: Some(config.ingress_class.clone()),
            rules: Some(rules),
            tls: Some(vec![IngressTLS {
                hosts: Some(vec![hosts.agent, hosts.vscode, hosts.worker_1, hosts.worker_2]),
                secret_name: Some(format!("runtime-{}-tls", record.runtime_id)),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Rebuild a record from one discovered pod. Pods missing either id label
/// are skipped.
fn reconstruct_record(config: &Config, pod: &Pod) -> Option<SandboxRecord> {
    let pod_labels = pod.metadata.labels.as_ref()?;
    let runtime_id = pod_labels.get(LABEL_RUNTIME_ID)?.clone();
    let session_id = pod_labels.get(LABEL_SESSION_ID)?.clone();

    let session_api_key = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.containers.first())
        .and_then(|container| container.env.as_ref())
        .and_then(|env| {
            env.iter()
                .find(|var| var.name == "SESSION_API_KEY")
                .and_then(|var| var.value.clone())
        })
        .unwrap_or_default();

    let status_info = map_pod_status(pod);
    let mut record = SandboxRecord::new(
        runtime_id,
        session_id,
        session_api_key,
        &config.base_domain,
        config.worker_1_port,
        config.worker_2_port,
    );
    record.status = SandboxStatus::Running;
    record.pod_status = status_info.status;
    record.restart_count = status_info.restart_count;
    record.restart_reasons = status_info.restart_reasons;
    // The orchestrator-recorded creation stamp, not "now": a record
    // rediscovered after a restart must keep its real age or the reaper's
    // failed bucket never fires.
    record.created_at = pod
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|time| time.0)
        .unwrap_or_else(Utc::now);
    Some(record)
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: clamp_port(port),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn service_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port: clamp_port(port),
        target_port: Some(IntOrString::Int(clamp_port(port))),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn host_rule(host: &str, service_name: &str, port: i32) -> IngressRule {
    IngressRule {
        host: Some(host.to_string()),
        http: Some(HTTPIngressRuleValue {
            paths: vec![HTTPIngressPath {
                path: Some("/".to_string()),
                path_type: "Prefix".to_string(),
                backend: IngressBackend {
                    service: Some(IngressServiceBackend {
                        name: service_name.to_string(),
                        port: Some(ServiceBackendPort {
                            number: Some(clamp_port(port)),
                            ..Default::default()
                        }),
                    }),
                    ..Default::default()
                },
            }],
        }),
    }
}

/// Kubernetes port fields are int32 with a valid range of 1-65535; clamp
/// rather than let the API server reject the object.
fn clamp_port(port: i32) -> i32 {
    port.clamp(1, 65535)
}

/// Map orchestrator phase and per-container state into the pod status
/// enum. `failed` beats `crashloopbackoff`, which beats the phase-derived
/// states; `ready` requires every container ready.
fn map_pod_status(pod: &Pod) -> PodStatusInfo {
    let mut restart_count = 0;
    let mut restart_reasons = Vec::new();
    let mut crash_looping = false;
    let mut all_ready = true;
    let mut container_count = 0;

    if let Some(statuses) = pod
        .status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref())
    {
        for cs in statuses {
            container_count += 1;
            restart_count += cs.restart_count;
            if !cs.ready {
                all_ready = false;
            }
            if let Some(state) = &cs.state {
                if let Some(waiting) = &state.waiting {
                    if let Some(reason) = &waiting.reason {
                        if reason == "CrashLoopBackOff" {
                            crash_looping = true;
                        }
                        restart_reasons.push(reason.clone());
                    }
                }
                if let Some(terminated) = &state.terminated {
                    if let Some(reason) = &terminated.reason {
                        restart_reasons.push(reason.clone());
                    }
                }
            }
        }
    }

    let phase = pod
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .unwrap_or("");

    let status = if phase == "Failed" {
        PodStatus::Failed
    } else if crash_looping {
        PodStatus::CrashLoopBackOff
    } else {
        match phase {
            "Running" if all_ready && container_count > 0 => PodStatus::Ready,
            "Running" => PodStatus::Running,
            "Pending" => PodStatus::Pending,
            "Unknown" => PodStatus::Unknown,
            _ => PodStatus::Pending,
        }
    };

    PodStatusInfo {
        status,
        restart_count,
        restart_reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStateWaiting, ContainerStatus,
        PodStatus as K8sPodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn test_config() -> Config {
        Config {
            app_server_url: "https://app.example.com".to_string(),
            app_server_public_url: "https://app.example.com".to_string(),
            ca_cert_secret_name: "corp-ca".to_string(),
            image_pull_secrets: "regcred".to_string(),
            ..Config::default()
        }
    }

    fn test_record() -> SandboxRecord {
        SandboxRecord::new(
            "abc123".to_string(),
            "S1".to_string(),
            "secret-key".to_string(),
            "sandbox.example.com",
            12000,
            12001,
        )
    }

    fn test_spec() -> StartRequest {
        StartRequest {
            image: "img".to_string(),
            command: Default::default(),
            working_dir: String::new(),
            environment: HashMap::new(),
            session_id: "S1".to_string(),
            resource_factor: 0.0,
            runtime_class: None,
        }
    }

    fn pod_with(phase: &str, containers: Vec<ContainerStatus>) -> Pod {
        Pod {
            status: Some(K8sPodStatus {
                phase: Some(phase.to_string()),
                container_statuses: Some(containers),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn container_status(ready: bool, restarts: i32) -> ContainerStatus {
        ContainerStatus {
            name: CONTAINER_NAME.to_string(),
            ready,
            restart_count: restarts,
            ..Default::default()
        }
    }

    #[test]
    fn clamp_port_bounds() {
        assert_eq!(clamp_port(0), 1);
        assert_eq!(clamp_port(-5), 1);
        assert_eq!(clamp_port(80), 80);
        assert_eq!(clamp_port(65535), 65535);
        assert_eq!(clamp_port(70000), 65535);
    }

    #[test]
    fn status_ready_requires_all_containers_ready() {
        let info = map_pod_status(&pod_with(
            "Running",
            vec![container_status(true, 0), container_status(true, 1)],
        ));
        assert_eq!(info.status, PodStatus::Ready);
        assert_eq!(info.restart_count, 1);

        let info = map_pod_status(&pod_with(
            "Running",
            vec![container_status(true, 0), container_status(false, 0)],
        ));
        assert_eq!(info.status, PodStatus::Running);
    }

    #[test]
    fn status_running_without_containers_is_not_ready() {
        let info = map_pod_status(&pod_with("Running", vec![]));
        assert_eq!(info.status, PodStatus::Running);
    }

    #[test]
    fn status_crashloop_wins_over_running_phase() {
        let mut cs = container_status(false, 4);
        cs.state = Some(ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: Some("CrashLoopBackOff".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
        let info = map_pod_status(&pod_with("Running", vec![cs]));
        assert_eq!(info.status, PodStatus::CrashLoopBackOff);
        assert_eq!(info.restart_count, 4);
        assert_eq!(info.restart_reasons, vec!["CrashLoopBackOff"]);
    }

    #[test]
    fn status_failed_phase_wins_over_crashloop() {
        let mut cs = container_status(false, 2);
        cs.state = Some(ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: Some("CrashLoopBackOff".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
        let info = map_pod_status(&pod_with("Failed", vec![cs]));
        assert_eq!(info.status, PodStatus::Failed);
    }

    #[test]
    fn status_collects_terminated_reasons() {
        let mut cs = container_status(false, 1);
        cs.state = Some(ContainerState {
            terminated: Some(ContainerStateTerminated {
                reason: Some("OOMKilled".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
        let info = map_pod_status(&pod_with("Pending", vec![cs]));
        assert_eq!(info.status, PodStatus::Pending);
        assert_eq!(info.restart_reasons, vec!["OOMKilled"]);
    }

    #[test]
    fn env_injects_key_under_two_names_and_webhook_last() {
        let config = test_config();
        let record = test_record();
        let spec = StartRequest {
            environment: HashMap::from([(
                "WEBHOOK_BASE_URL".to_string(),
                "https://rogue.example.com".to_string(),
            )]),
            ..test_spec()
        };

        let env = build_env(&config, &spec, &record);
        let names: Vec<_> = env.iter().map(|var| var.name.as_str()).collect();
        assert!(names.contains(&"SESSION_API_KEY"));
        assert!(names.contains(&"SESSION_API_KEYS_0"));
        assert!(names.contains(&"SANDBOX_RUNTIME_ID"));
        assert!(names.contains(&"CORS_ALLOW_ORIGIN"));
        assert!(names.contains(&"SSL_CERT_FILE"));

        // The configured webhook must come after the caller's attempted
        // override so last-writer-wins resolves in its favor.
        assert_eq!(names.last(), Some(&"WEBHOOK_BASE_URL"));
        let webhook_values: Vec<_> = env
            .iter()
            .filter(|var| var.name == "WEBHOOK_BASE_URL")
            .filter_map(|var| var.value.as_deref())
            .collect();
        assert_eq!(
            webhook_values,
            vec!["https://rogue.example.com", "https://app.example.com/api/v1/webhooks"]
        );
    }

    #[test]
    fn env_key_appears_under_both_names_with_same_value() {
        let config = test_config();
        let record = test_record();
        let env = build_env(&config, &test_spec(), &record);
        let by_name: HashMap<_, _> = env
            .iter()
            .map(|var| (var.name.as_str(), var.value.as_deref().unwrap_or("")))
            .collect();
        assert_eq!(by_name["SESSION_API_KEY"], "secret-key");
        assert_eq!(by_name["SESSION_API_KEYS_0"], "secret-key");
        assert_eq!(by_name["SANDBOX_RUNTIME_ID"], "abc123");
    }

    #[test]
    fn pod_scales_resources_and_sets_probe() {
        let config = test_config();
        let record = test_record();
        let spec = StartRequest {
            command: crate::sandbox::models::CommandSpec::Line("run".to_string()),
            working_dir: "/workspace".to_string(),
            resource_factor: 2.0,
            runtime_class: Some("gvisor".to_string()),
            ..test_spec()
        };

        let pod = build_pod(&config, &spec, &record);
        let pod_spec = pod.spec.unwrap();
        assert_eq!(pod_spec.runtime_class_name.as_deref(), Some("gvisor"));
        assert_eq!(pod_spec.restart_policy.as_deref(), Some("Always"));
        assert_eq!(
            pod_spec.image_pull_secrets.as_ref().unwrap()[0].name,
            "regcred"
        );

        let container = &pod_spec.containers[0];
        assert_eq!(container.name, CONTAINER_NAME);
        assert_eq!(container.command.as_ref().unwrap(), &vec!["/bin/bash", "-c"]);
        assert_eq!(container.args.as_ref().unwrap(), &vec!["run"]);
        assert_eq!(container.working_dir.as_deref(), Some("/workspace"));

        let resources = container.resources.as_ref().unwrap();
        assert_eq!(resources.requests.as_ref().unwrap()["cpu"].0, "2000m");
        assert_eq!(resources.requests.as_ref().unwrap()["memory"].0, "4096Mi");
        assert_eq!(resources.limits.as_ref().unwrap()["cpu"].0, "4000m");
        assert_eq!(resources.limits.as_ref().unwrap()["memory"].0, "8192Mi");

        let probe = container.readiness_probe.as_ref().unwrap();
        assert_eq!(probe.initial_delay_seconds, Some(5));
        assert_eq!(probe.period_seconds, Some(10));
        assert_eq!(probe.failure_threshold, Some(6));
        assert_eq!(probe.http_get.as_ref().unwrap().path.as_deref(), Some("/alive"));

        // CA secret configured: mounted at the fixed path.
        let mounts = container.volume_mounts.as_ref().unwrap();
        assert_eq!(mounts[0].mount_path, CA_MOUNT_PATH);
        assert_eq!(mounts[0].sub_path.as_deref(), Some(CA_FILE_NAME));
    }

    #[test]
    fn pod_zero_factor_uses_default_resources() {
        let config = Config::default();
        let record = test_record();
        let pod = build_pod(&config, &test_spec(), &record);
        let container = &pod.spec.unwrap().containers[0];
        let resources = container.resources.as_ref().unwrap();
        assert_eq!(resources.requests.as_ref().unwrap()["cpu"].0, "1000m");
        assert_eq!(resources.limits.as_ref().unwrap()["memory"].0, "4096Mi");
        // No CA secret, no pull secrets: nothing mounted.
        assert!(container.volume_mounts.is_none());
        // Empty command keeps the image entrypoint.
        assert!(container.command.is_none());
        assert!(container.working_dir.is_none());
    }

    #[test]
    fn service_selects_runtime_and_names_four_ports() {
        let config = Config::default();
        let record = test_record();
        let service = build_service(&config, &record);
        let spec = service.spec.unwrap();
        assert_eq!(
            spec.selector.unwrap().get(LABEL_RUNTIME_ID).map(String::as_str),
            Some("abc123")
        );
        let ports = spec.ports.unwrap();
        let names: Vec<_> = ports.iter().filter_map(|p| p.name.as_deref()).collect();
        assert_eq!(names, vec!["agent", "vscode", "worker-1", "worker-2"]);
        assert_eq!(ports[0].port, 60000);
    }

    #[test]
    fn ingress_carries_four_hosts_and_tls() {
        let config = test_config();
        let record = test_record();
        let ingress = build_ingress(&config, &record);

        let spec = ingress.spec.unwrap();
        let rules = spec.rules.unwrap();
        let hosts: Vec<_> = rules.iter().filter_map(|rule| rule.host.as_deref()).collect();
        assert_eq!(
            hosts,
            vec![
                "s1.sandbox.example.com",
                "vscode-s1.sandbox.example.com",
                "work-1-s1.sandbox.example.com",
                "work-2-s1.sandbox.example.com",
            ]
        );

        let tls = &spec.tls.unwrap()[0];
        assert_eq!(tls.secret_name.as_deref(), Some("runtime-abc123-tls"));
        assert_eq!(tls.hosts.as_ref().unwrap().len(), 4);

        let annotations = ingress.metadata.annotations.unwrap();
        assert_eq!(
            annotations
                .get("nginx.ingress.kubernetes.io/ssl-redirect")
                .map(String::as_str),
            Some("true")
        );
        assert_eq!(
            annotations
                .get("nginx.ingress.kubernetes.io/websocket-services")
                .map(String::as_str),
            Some("runtime-abc123")
        );
    }

    #[test]
    fn ingress_merges_configured_annotations() {
        let config = Config {
            sandbox_ingress_annotations:
                "cert-manager.io/cluster-issuer=letsencrypt".to_string(),
            ..Config::default()
        };
        let ingress = build_ingress(&config, &test_record());
        let annotations = ingress.metadata.annotations.unwrap();
        assert_eq!(
            annotations.get("cert-manager.io/cluster-issuer").map(String::as_str),
            Some("letsencrypt")
        );
    }

    #[test]
    fn reconstruct_record_rebuilds_from_labels_and_env() {
        let config = Config::default();
        let created = chrono::DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);

        let mut pod = pod_with("Running", vec![container_status(true, 0)]);
        pod.metadata = ObjectMeta {
            name: Some("runtime-abc123".to_string()),
            labels: Some(BTreeMap::from([
                (LABEL_APP.to_string(), LABEL_APP_VALUE.to_string()),
                (LABEL_RUNTIME_ID.to_string(), "abc123".to_string()),
                (LABEL_SESSION_ID.to_string(), "S1".to_string()),
            ])),
            creation_timestamp: Some(Time(created)),
            ..Default::default()
        };
        pod.spec = Some(PodSpec {
            containers: vec![Container {
                name: CONTAINER_NAME.to_string(),
                env: Some(vec![env_var("SESSION_API_KEY", "recovered-key")]),
                ..Default::default()
            }],
            ..Default::default()
        });

        let record = reconstruct_record(&config, &pod).unwrap();
        assert_eq!(record.runtime_id, "abc123");
        assert_eq!(record.session_id, "S1");
        assert_eq!(record.session_api_key, "recovered-key");
        assert_eq!(record.created_at, created);
        assert_eq!(record.status, SandboxStatus::Running);
        assert_eq!(record.pod_status, PodStatus::Ready);
        assert_eq!(record.pod_name, "runtime-abc123");
        assert_eq!(record.url, "https://s1.sandbox.example.com");
        assert!(record.work_hosts.contains_key("https://work-1-s1.sandbox.example.com"));
    }

    #[test]
    fn reconstruct_record_skips_unlabeled_pods() {
        let config = Config::default();
        let mut pod = pod_with("Running", vec![]);
        pod.metadata.labels = Some(BTreeMap::from([(
            LABEL_APP.to_string(),
            LABEL_APP_VALUE.to_string(),
        )]));
        assert!(reconstruct_record(&config, &pod).is_none());
    }
}
