use crate::models::{BackgroundJob, ListingJob};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("patch produced an invalid record: {0}")]
    InvalidPatch(String),
}

/// In-process listing store. The store is the read path; remote
/// persistence mirrors writes best-effort (see `supabase.rs`).
#[derive(Clone, Default)]
pub struct ListingStore {
    inner: Arc<Mutex<HashMap<Uuid, ListingJob>>>,
}

impl ListingStore {
    pub async fn insert(&self, job: ListingJob) {
        self.inner.lock().await.insert(job.id, job);
    }

    pub async fn get(&self, id: Uuid) -> Option<ListingJob> {
        self.inner.lock().await.get(&id).cloned()
    }

    /// Runs a closure against the stored job under the lock, keeping a
    /// single writer per record.
    pub async fn with_job<R>(
        &self,
        id: Uuid,
        apply: impl FnOnce(&mut ListingJob) -> R,
    ) -> Result<R, StoreError> {
        let mut guard = self.inner.lock().await;
        let job = guard.get_mut(&id).ok_or(StoreError::NotFound)?;
        Ok(apply(job))
    }
}

#[derive(Clone, Default)]
pub struct JobStore {
    inner: Arc<Mutex<HashMap<Uuid, BackgroundJob>>>,
}

impl JobStore {
    pub async fn insert(&self, job: BackgroundJob) {
        self.inner.lock().await.insert(job.id, job);
    }

    pub async fn get(&self, id: Uuid) -> Option<BackgroundJob> {
        self.inner.lock().await.get(&id).cloned()
    }

    pub async fn with_job<R>(
        &self,
        id: Uuid,
        apply: impl FnOnce(&mut BackgroundJob) -> R,
    ) -> Result<R, StoreError> {
        let mut guard = self.inner.lock().await;
        let job = guard.get_mut(&id).ok_or(StoreError::NotFound)?;
        let result = apply(job);
        job.updated_at = Utc::now();
        Ok(result)
    }

    /// Ids of jobs whose status is not yet terminal; the poller re-attaches
    /// these after a restart.
    pub async fn non_terminal_ids(&self) -> Vec<Uuid> {
        self.inner
            .lock()
            .await
            .values()
            .filter(|job| !job.status.is_terminal())
            .map(|job| job.id)
            .collect()
    }

    /// RFC 7386 merge-patch against the stored record. Applying the same
    /// patch twice is a no-op beyond the first; returns whether the record
    /// changed.
    pub async fn merge_patch(&self, id: Uuid, patch: &Value) -> Result<bool, StoreError> {
        let mut guard = self.inner.lock().await;
        let job = guard.get_mut(&id).ok_or(StoreError::NotFound)?;
        let mut doc = serde_json::to_value(&*job)
            .map_err(|err| StoreError::InvalidPatch(err.to_string()))?;
        let before = doc.clone();
        merge_patch_value(&mut doc, patch);
        if doc == before {
            return Ok(false);
        }
        let mut patched: BackgroundJob = serde_json::from_value(doc)
            .map_err(|err| StoreError::InvalidPatch(err.to_string()))?;
        patched.id = job.id;
        patched.updated_at = Utc::now();
        *job = patched;
        Ok(true)
    }
}

fn merge_patch_value(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(entries) => {
            if !target.is_object() {
                *target = Value::Object(Default::default());
            }
            let object = target.as_object_mut().expect("object ensured above");
            for (key, value) in entries {
                if value.is_null() {
                    object.remove(key);
                } else {
                    merge_patch_value(object.entry(key.clone()).or_insert(Value::Null), value);
                }
            }
        }
        other => *target = other.clone(),
    }
}
