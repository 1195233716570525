//! Test utilities: a router wired to a fake orchestrator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;

use sandboxd::api::{create_router, AppState};
use sandboxd::config::Config;
use sandboxd::orchestrator::{Orchestrator, OrchestratorError, OrchestratorResult, PodStatusInfo};
use sandboxd::sandbox::models::{PodStatus, SandboxRecord, StartRequest};
use sandboxd::sandbox::StateStore;

pub const TEST_API_KEY: &str = "test-management-key";

/// Records every orchestrator call and serves configurable statuses and
/// discoverable records.
#[derive(Default)]
pub struct FakeOrchestrator {
    pub created: Mutex<Vec<SandboxRecord>>,
    pub deleted: Mutex<Vec<String>>,
    pub scaled_to_zero: Mutex<Vec<String>>,
    pub recreated: Mutex<Vec<String>>,
    pub statuses: Mutex<HashMap<String, PodStatus>>,
    pub discoverable: Mutex<Vec<SandboxRecord>>,
    fail_create: AtomicBool,
}

impl FakeOrchestrator {
    pub fn fail_next_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    pub fn set_status(&self, pod_name: &str, status: PodStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(pod_name.to_string(), status);
    }

    pub fn add_discoverable(&self, record: SandboxRecord) {
        self.discoverable.lock().unwrap().push(record);
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    fn status_for(&self, pod_name: &str) -> PodStatusInfo {
        let status = self
            .statuses
            .lock()
            .unwrap()
            .get(pod_name)
            .copied()
            .unwrap_or(PodStatus::Ready);
        PodStatusInfo {
            status,
            restart_count: 0,
            restart_reasons: Vec::new(),
        }
    }
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn create_sandbox(
        &self,
        _spec: &StartRequest,
        record: &SandboxRecord,
    ) -> OrchestratorResult<()> {
        if self.fail_create.swap(false, Ordering::SeqCst) {
            return Err(OrchestratorError::Timeout("creating pod".to_string()));
        }
        self.created.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn delete_sandbox(&self, record: &SandboxRecord) -> OrchestratorResult<()> {
        self.deleted.lock().unwrap().push(record.runtime_id.clone());
        Ok(())
    }

    async fn pod_status(&self, pod_name: &str) -> OrchestratorResult<PodStatusInfo> {
        Ok(self.status_for(pod_name))
    }

    async fn pod_statuses(
        &self,
        pod_names: &[String],
    ) -> OrchestratorResult<HashMap<String, PodStatusInfo>> {
        Ok(pod_names
            .iter()
            .map(|name| (name.clone(), self.status_for(name)))
            .collect())
    }

    async fn scale_to_zero(&self, pod_name: &str) -> OrchestratorResult<()> {
        self.scaled_to_zero.lock().unwrap().push(pod_name.to_string());
        Ok(())
    }

    async fn recreate_pod(
        &self,
        _spec: &StartRequest,
        record: &SandboxRecord,
    ) -> OrchestratorResult<()> {
        self.recreated.lock().unwrap().push(record.pod_name.clone());
        Ok(())
    }

    async fn wait_for_pod_ready(
        &self,
        _pod_name: &str,
        _timeout: std::time::Duration,
    ) -> OrchestratorResult<()> {
        Ok(())
    }

    async fn discover_all(&self) -> OrchestratorResult<Vec<SandboxRecord>> {
        Ok(self.discoverable.lock().unwrap().clone())
    }

    async fn discover_by_runtime_id(
        &self,
        runtime_id: &str,
    ) -> OrchestratorResult<Option<SandboxRecord>> {
        Ok(self
            .discoverable
            .lock()
            .unwrap()
            .iter()
            .find(|record| record.runtime_id == runtime_id)
            .cloned())
    }

    async fn discover_by_session_id(
        &self,
        session_id: &str,
    ) -> OrchestratorResult<Option<SandboxRecord>> {
        Ok(self
            .discoverable
            .lock()
            .unwrap()
            .iter()
            .find(|record| record.session_id == session_id)
            .cloned())
    }
}

/// A router plus handles to the fakes behind it.
pub struct TestContext {
    pub app: Router,
    pub orchestrator: Arc<FakeOrchestrator>,
    pub store: Arc<StateStore>,
    pub config: Arc<Config>,
}

impl TestContext {
    /// Seed a record directly into the store, as if a sandbox already ran.
    pub fn seed_record(&self, runtime_id: &str, session_id: &str) -> SandboxRecord {
        let mut record = SandboxRecord::new(
            runtime_id.to_string(),
            session_id.to_string(),
            format!("key-{runtime_id}"),
            &self.config.base_domain,
            self.config.worker_1_port,
            self.config.worker_2_port,
        );
        record.status = sandboxd::sandbox::SandboxStatus::Running;
        self.store.add(record.clone());
        record
    }
}

fn build_app(config: Config) -> TestContext {
    let config = Arc::new(config);
    let orchestrator = Arc::new(FakeOrchestrator::default());
    let store = Arc::new(StateStore::new());
    let state = AppState::new(store.clone(), orchestrator.clone(), config.clone());
    TestContext {
        app: create_router(state),
        orchestrator,
        store,
        config,
    }
}

/// Application with hostname-mode URLs.
pub fn test_app() -> TestContext {
    build_app(Config {
        api_key: TEST_API_KEY.to_string(),
        ..Config::default()
    })
}

/// Application with the stable-URL proxy mounted.
pub fn test_app_proxy_mode() -> TestContext {
    build_app(Config {
        api_key: TEST_API_KEY.to_string(),
        proxy_base_url: "https://rt.example.com".to_string(),
        ..Config::default()
    })
}
