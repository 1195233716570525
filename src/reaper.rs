//! Bounds sandbox lifetime: failed-long and idle-long sandboxes are torn
//! down by a single timer-driven task.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::orchestrator::{Orchestrator, PodStatusInfo};
use crate::sandbox::models::{PodStatus, SandboxRecord, SandboxStatus};
use crate::sandbox::StateStore;

/// Why a sandbox was reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReapReason {
    PodFailed,
    PodIdle,
}

/// Counters across reaper runs.
#[derive(Debug, Clone, Default)]
pub struct ReaperStats {
    pub last_run_at: Option<DateTime<Utc>>,
    pub total_runs: u64,
    pub total_cleaned: u64,
    pub failed_cleaned: u64,
    pub idle_cleaned: u64,
    pub last_errors: Vec<String>,
}

/// Timer-driven cleanup of failed and idle sandboxes.
pub struct Reaper {
    store: Arc<StateStore>,
    orchestrator: Arc<dyn Orchestrator>,
    failed_threshold: ChronoDuration,
    idle_threshold: ChronoDuration,
    stats: Mutex<ReaperStats>,
}

impl Reaper {
    pub fn new(
        store: Arc<StateStore>,
        orchestrator: Arc<dyn Orchestrator>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            orchestrator,
            failed_threshold: ChronoDuration::minutes(config.cleanup_failed_threshold_minutes),
            idle_threshold: ChronoDuration::minutes(config.cleanup_idle_threshold_minutes),
            stats: Mutex::new(ReaperStats::default()),
        }
    }

    pub fn stats(&self) -> ReaperStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// One reaper tick: walk the store, delete every sandbox past its
    /// threshold. Serial within the tick; races with API writers are
    /// resolved by the store's atomicity.
    pub async fn run_once(&self) {
        debug!("reaper: starting run");
        let now = Utc::now();
        let mut cleaned: u64 = 0;
        let mut failed: u64 = 0;
        let mut idle: u64 = 0;
        let mut errors = Vec::new();

        for record in self.store.list() {
            if record.status == SandboxStatus::Stopped {
                continue;
            }

            let status = match self.orchestrator.pod_status(&record.pod_name).await {
                Ok(status) => status,
                Err(err) => {
                    debug!("reaper: error getting status for {}: {err}", record.pod_name);
                    errors.push(format!("pod status for {}: {err}", record.pod_name));
                    continue;
                }
            };

            let Some(reason) = self.should_reap(&record, &status, now) else {
                continue;
            };

            info!(
                "reaper: cleaning up runtime {} (session: {}, reason: {})",
                record.runtime_id,
                record.session_id,
                match reason {
                    ReapReason::PodFailed => "pod_failed",
                    ReapReason::PodIdle => "pod_idle",
                }
            );

            if let Err(err) = self.orchestrator.delete_sandbox(&record).await {
                warn!("reaper: failed to delete sandbox {}: {err}", record.runtime_id);
                errors.push(format!("deleting {}: {err}", record.runtime_id));
                continue;
            }
            if let Err(err) = self.store.delete(&record.runtime_id) {
                debug!("reaper: record {} already removed: {err}", record.runtime_id);
            }

            cleaned += 1;
            match reason {
                ReapReason::PodFailed => failed += 1,
                ReapReason::PodIdle => idle += 1,
            }
        }

        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.last_run_at = Some(now);
        stats.total_runs += 1;
        stats.total_cleaned += cleaned;
        stats.failed_cleaned += failed;
        stats.idle_cleaned += idle;
        stats.last_errors = errors;
        drop(stats);

        if cleaned > 0 {
            info!("reaper: cleaned {cleaned} sandbox(es) ({failed} failed, {idle} idle)");
        } else {
            debug!("reaper: nothing to clean");
        }
    }

    /// Failed bucket is measured from creation; idle bucket from the last
    /// data-plane activity, which the proxy refreshes.
    fn should_reap(
        &self,
        record: &SandboxRecord,
        status: &PodStatusInfo,
        now: DateTime<Utc>,
    ) -> Option<ReapReason> {
        let broken = matches!(status.status, PodStatus::Failed | PodStatus::CrashLoopBackOff);
        if broken && now - record.created_at >= self.failed_threshold {
            return Some(ReapReason::PodFailed);
        }
        if !broken && now - record.last_activity_at >= self.idle_threshold {
            return Some(ReapReason::PodIdle);
        }
        None
    }

    /// Spawn the reaper loop: an immediate first run, then one per
    /// interval until shutdown.
    pub fn spawn(
        self: Arc<Self>,
        interval: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        info!(
            "starting reaper (interval: {:?}, failed threshold: {}m, idle threshold: {}m)",
            interval,
            self.failed_threshold.num_minutes(),
            self.idle_threshold.num_minutes()
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.run_once().await,
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("reaper stopped");
                            return;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{OrchestratorResult, PodStatusInfo};
    use crate::sandbox::models::StartRequest;
    use async_trait::async_trait;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeOrchestrator {
        statuses: Mutex<HashMap<String, PodStatus>>,
        deleted: Mutex<Vec<String>>,
    }

    impl FakeOrchestrator {
        fn set_status(&self, pod_name: &str, status: PodStatus) {
            self.statuses
                .lock()
                .unwrap()
                .insert(pod_name.to_string(), status);
        }

        fn deleted(&self) -> Vec<String> {
            self.deleted.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Orchestrator for FakeOrchestrator {
        async fn create_sandbox(
            &self,
            _spec: &StartRequest,
            _record: &SandboxRecord,
        ) -> OrchestratorResult<()> {
            Ok(())
        }

        async fn delete_sandbox(&self, record: &SandboxRecord) -> OrchestratorResult<()> {
            self.deleted.lock().unwrap().push(record.runtime_id.clone());
            Ok(())
        }

        async fn pod_status(&self, pod_name: &str) -> OrchestratorResult<PodStatusInfo> {
            let status = self
                .statuses
                .lock()
                .unwrap()
                .get(pod_name)
                .copied()
                .unwrap_or(PodStatus::Ready);
            Ok(PodStatusInfo {
                status,
                restart_count: 0,
                restart_reasons: Vec::new(),
            })
        }

        async fn pod_statuses(
            &self,
            pod_names: &[String],
        ) -> OrchestratorResult<HashMap<String, PodStatusInfo>> {
            let mut out = HashMap::new();
            for name in pod_names {
                out.insert(name.clone(), self.pod_status(name).await?);
            }
            Ok(out)
        }

        async fn scale_to_zero(&self, _pod_name: &str) -> OrchestratorResult<()> {
            Ok(())
        }

        async fn recreate_pod(
            &self,
            _spec: &StartRequest,
            _record: &SandboxRecord,
        ) -> OrchestratorResult<()> {
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
            Ok(Vec::new())
        }

        async fn discover_by_runtime_id(
            &self,
            _runtime_id: &str,
        ) -> OrchestratorResult<Option<SandboxRecord>> {
            Ok(None)
        }

        async fn discover_by_session_id(
            &self,
            _session_id: &str,
        ) -> OrchestratorResult<Option<SandboxRecord>> {
            Ok(None)
        }
    }

    fn record(runtime_id: &str, session_id: &str) -> SandboxRecord {
        let mut record = SandboxRecord::new(
            runtime_id.to_string(),
            session_id.to_string(),
            "key".to_string(),
            "sandbox.example.com",
            12000,
            12001,
        );
        record.status = SandboxStatus::Running;
        record
    }

    fn reaper_with(
        store: Arc<StateStore>,
        orchestrator: Arc<FakeOrchestrator>,
    ) -> Reaper {
        Reaper::new(store, orchestrator, &Config::default())
    }

    #[tokio::test]
    async fn reaps_idle_sandbox_past_threshold() {
        let store = Arc::new(StateStore::new());
        let orch = Arc::new(FakeOrchestrator::default());

        let mut idle = record("r1", "s1");
        idle.last_activity_at = Utc::now() - ChronoDuration::minutes(1441);
        store.add(idle);

        let mut active = record("r2", "s2");
        active.last_activity_at = Utc::now();
        store.add(active);

        let reaper = reaper_with(store.clone(), orch.clone());
        reaper.run_once().await;

        assert_eq!(orch.deleted(), vec!["r1"]);
        assert!(store.get("r1").is_none());
        assert!(store.get("r2").is_some());

        let stats = reaper.stats();
        assert_eq!(stats.total_cleaned, 1);
        assert_eq!(stats.idle_cleaned, 1);
        assert_eq!(stats.failed_cleaned, 0);
        assert_eq!(stats.total_runs, 1);
    }

    #[tokio::test]
    async fn reaps_failed_sandbox_by_creation_age() {
        let store = Arc::new(StateStore::new());
        let orch = Arc::new(FakeOrchestrator::default());

        let mut broken = record("r1", "s1");
        broken.created_at = Utc::now() - ChronoDuration::minutes(61);
        // Recent activity must not shield a failed pod.
        broken.last_activity_at = Utc::now();
        store.add(broken.clone());
        orch.set_status(&broken.pod_name, PodStatus::Failed);

        let reaper = reaper_with(store.clone(), orch.clone());
        reaper.run_once().await;

        assert_eq!(orch.deleted(), vec!["r1"]);
        let stats = reaper.stats();
        assert_eq!(stats.failed_cleaned, 1);
        assert_eq!(stats.idle_cleaned, 0);
    }

    #[tokio::test]
    async fn young_failed_sandbox_survives() {
        let store = Arc::new(StateStore::new());
        let orch = Arc::new(FakeOrchestrator::default());

        let mut broken = record("r1", "s1");
        broken.created_at = Utc::now() - ChronoDuration::minutes(10);
        store.add(broken.clone());
        orch.set_status(&broken.pod_name, PodStatus::CrashLoopBackOff);

        let reaper = reaper_with(store.clone(), orch.clone());
        reaper.run_once().await;

        assert!(orch.deleted().is_empty());
        assert!(store.get("r1").is_some());
    }

    #[tokio::test]
    async fn crashlooping_old_sandbox_counts_as_failed() {
        let store = Arc::new(StateStore::new());
        let orch = Arc::new(FakeOrchestrator::default());

        let mut broken = record("r1", "s1");
        broken.created_at = Utc::now() - ChronoDuration::minutes(120);
        store.add(broken.clone());
        orch.set_status(&broken.pod_name, PodStatus::CrashLoopBackOff);

        let reaper = reaper_with(store.clone(), orch.clone());
        reaper.run_once().await;

        assert_eq!(reaper.stats().failed_cleaned, 1);
    }

    #[tokio::test]
    async fn stopped_records_are_skipped() {
        let store = Arc::new(StateStore::new());
        let orch = Arc::new(FakeOrchestrator::default());

        let mut stopped = record("r1", "s1");
        stopped.status = SandboxStatus::Stopped;
        stopped.last_activity_at = Utc::now() - ChronoDuration::days(30);
        store.add(stopped);

        let reaper = reaper_with(store.clone(), orch.clone());
        reaper.run_once().await;

        assert!(orch.deleted().is_empty());
        assert_eq!(reaper.stats().total_cleaned, 0);
    }

    #[tokio::test]
    async fn paused_idle_sandbox_is_reaped() {
        // A paused sandbox has no pod (status "not found") but still ages
        // in the idle bucket.
        let store = Arc::new(StateStore::new());
        let orch = Arc::new(FakeOrchestrator::default());

        let mut paused = record("r1", "s1");
        paused.status = SandboxStatus::Paused;
        paused.last_activity_at = Utc::now() - ChronoDuration::minutes(2000);
        store.add(paused.clone());
        orch.set_status(&paused.pod_name, PodStatus::NotFound);

        let reaper = reaper_with(store.clone(), orch.clone());
        reaper.run_once().await;

        assert_eq!(orch.deleted(), vec!["r1"]);
        assert_eq!(reaper.stats().idle_cleaned, 1);
    }
}
