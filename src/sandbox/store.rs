//! In-memory sandbox state, indexed by runtime id and session id.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;
use thiserror::Error;

use super::models::SandboxRecord;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("runtime not found: {0}")]
    RuntimeNotFound(String),
}

#[derive(Default)]
struct Indexes {
    by_runtime: HashMap<String, SandboxRecord>,
    /// session id -> runtime id
    by_session: HashMap<String, String>,
}

/// Thread-safe map of sandbox records. Records are owned here; the
/// orchestrator owns the workloads. No persistence; the reconciler
/// rebuilds this from cluster labels after a restart.
///
/// All operations are atomic with respect to each other: reads return
/// complete cloned records, writers are mutually exclusive.
#[derive(Default)]
pub struct StateStore {
    inner: RwLock<Indexes>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record under both indices. An existing session mapping is
    /// overwritten (last writer wins).
    pub fn add(&self, record: SandboxRecord) {
        let mut inner = self.write();
        inner
            .by_session
            .insert(record.session_id.clone(), record.runtime_id.clone());
        inner.by_runtime.insert(record.runtime_id.clone(), record);
    }

    pub fn get(&self, runtime_id: &str) -> Option<SandboxRecord> {
        self.read().by_runtime.get(runtime_id).cloned()
    }

    pub fn get_by_session(&self, session_id: &str) -> Option<SandboxRecord> {
        let inner = self.read();
        let runtime_id = inner.by_session.get(session_id)?;
        inner.by_runtime.get(runtime_id).cloned()
    }

    /// Replace an existing record. Errors if the runtime id is unknown.
    pub fn update(&self, record: SandboxRecord) -> Result<(), StoreError> {
        let mut inner = self.write();
        if !inner.by_runtime.contains_key(&record.runtime_id) {
            return Err(StoreError::RuntimeNotFound(record.runtime_id.clone()));
        }
        inner
            .by_session
            .insert(record.session_id.clone(), record.runtime_id.clone());
        inner.by_runtime.insert(record.runtime_id.clone(), record);
        Ok(())
    }

    /// Remove a record from both indices atomically, returning it. The
    /// session index entry is only removed when it still points at this
    /// runtime id, so deleting a superseded record never unlinks its
    /// successor.
    pub fn delete(&self, runtime_id: &str) -> Result<SandboxRecord, StoreError> {
        let mut inner = self.write();
        let record = inner
            .by_runtime
            .remove(runtime_id)
            .ok_or_else(|| StoreError::RuntimeNotFound(runtime_id.to_string()))?;
        if inner.by_session.get(&record.session_id).map(String::as_str) == Some(runtime_id) {
            inner.by_session.remove(&record.session_id);
        }
        Ok(record)
    }

    pub fn list(&self) -> Vec<SandboxRecord> {
        self.read().by_runtime.values().cloned().collect()
    }

    /// Fetch the records for the given session ids, in input order,
    /// skipping unknown sessions.
    pub fn get_many_by_sessions(&self, session_ids: &[String]) -> Vec<SandboxRecord> {
        let inner = self.read();
        session_ids
            .iter()
            .filter_map(|session_id| {
                let runtime_id = inner.by_session.get(session_id)?;
                inner.by_runtime.get(runtime_id).cloned()
            })
            .collect()
    }

    /// Stamp `last_activity_at` with the current time. Returns false when
    /// the runtime id is unknown.
    pub fn touch_activity(&self, runtime_id: &str) -> bool {
        let mut inner = self.write();
        match inner.by_runtime.get_mut(runtime_id) {
            Some(record) => {
                record.last_activity_at = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn contains_runtime(&self, runtime_id: &str) -> bool {
        self.read().by_runtime.contains_key(runtime_id)
    }

    pub fn len(&self) -> usize {
        self.read().by_runtime.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Indexes> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Indexes> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}
