//! Detached background tasks with queryable outcomes.
//!
//! Work the caller does not wait for is spawned here. Each task's status
//! is recorded when it finishes, so a later call (or a test) can inspect
//! or await convergence. Finished records are pruned by count per instance
//! and by age.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::secrets::SecretsManager;

/// Lifecycle of a background task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Succeeded,
    /// Failed with a redacted message.
    Failed { message: String },
}

/// Snapshot of one background task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub instance_id: String,
    pub name: String,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    records: HashMap<String, TaskRecord>,
    handles: HashMap<String, JoinHandle<()>>,
}

/// Registry of detached tasks. Clones share state.
#[derive(Clone)]
pub struct TaskTracker {
    inner: Arc<Mutex<Inner>>,
    retain_per_instance: usize,
    retain_for: Duration,
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::with_retention(32, Duration::from_secs(24 * 60 * 60))
    }
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps at most `per_instance` finished records per instance, none
    /// older than `max_age`. Running tasks are always kept.
    pub fn with_retention(per_instance: usize, max_age: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            retain_per_instance: per_instance,
            retain_for: max_age,
        }
    }

    /// Spawns `work` detached and returns its task ID.
    ///
    /// Failures are logged and recorded with `secrets` redacted; they never
    /// reach the caller that spawned the task.
    pub fn spawn<F>(&self, instance_id: &str, name: &str, secrets: SecretsManager, work: F) -> String
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let id = format!("task_{}", uuid::Uuid::new_v4().simple());
        let record = TaskRecord {
            id: id.clone(),
            instance_id: instance_id.to_string(),
            name: name.to_string(),
            status: TaskStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
        };

        // Hold the lock across spawn so the task cannot finish before its
        // record exists.
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.records.insert(id.clone(), record);

        let tracker = self.clone();
        let task_id = id.clone();
        let task_name = name.to_string();
        let task_instance = instance_id.to_string();
        let handle = tokio::spawn(async move {
            let status = match work.await {
                Ok(()) => {
                    tracing::info!(task = %task_name, instance_id = %task_instance, "background task succeeded");
                    TaskStatus::Succeeded
                }
                Err(err) => {
                    let message = secrets.redact(&err.to_string());
                    tracing::error!(task = %task_name, instance_id = %task_instance, error = %message, "background task failed");
                    TaskStatus::Failed { message }
                }
            };
            tracker.finish(&task_id, status);
        });
        inner.handles.insert(id.clone(), handle);
        id
    }

    fn finish(&self, id: &str, status: TaskStatus) {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        let instance_id = match inner.records.get_mut(id) {
            Some(record) => {
                record.status = status;
                record.finished_at = Some(Utc::now());
                record.instance_id.clone()
            }
            None => return,
        };
        inner.handles.remove(id);
        self.prune(&mut inner, &instance_id);
    }

    fn prune(&self, inner: &mut Inner, instance_id: &str) {
        let now = Utc::now();
        let before = inner.records.len();
        inner.records.retain(|_, r| match r.finished_at {
            Some(done) => (now - done)
                .to_std()
                .map_or(true, |age| age <= self.retain_for),
            None => true,
        });

        let mut finished: Vec<(DateTime<Utc>, String)> = inner
            .records
            .values()
            .filter(|r| r.instance_id == instance_id)
            .filter_map(|r| r.finished_at.map(|done| (done, r.id.clone())))
            .collect();
        if finished.len() > self.retain_per_instance {
            finished.sort();
            let excess = finished.len() - self.retain_per_instance;
            for (_, id) in finished.into_iter().take(excess) {
                inner.records.remove(&id);
            }
        }

        let dropped = before - inner.records.len();
        if dropped > 0 {
            tracing::debug!(instance_id, dropped, "pruned finished task records");
        }
    }

    /// Returns the current record of a task.
    pub fn get(&self, id: &str) -> Option<TaskRecord> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.records.get(id).cloned())
    }

    /// Returns all tasks of an instance, oldest first.
    pub fn list(&self, instance_id: &str) -> Vec<TaskRecord> {
        let mut records: Vec<TaskRecord> = self
            .inner
            .lock()
            .map(|inner| {
                inner
                    .records
                    .values()
                    .filter(|r| r.instance_id == instance_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        records.sort_by_key(|r| r.started_at);
        records
    }

    /// Waits for a task to finish and returns its final record.
    pub async fn wait(&self, id: &str) -> Option<TaskRecord> {
        let handle = self
            .inner
            .lock()
            .ok()
            .and_then(|mut inner| inner.handles.remove(id));
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                // A panicked task never reaches finish().
                self.finish(
                    id,
                    TaskStatus::Failed {
                        message: format!("task aborted: {}", err),
                    },
                );
            }
        }
        self.get(id)
    }

    /// Waits for every task of an instance, including ones spawned by
    /// tasks that were still running.
    pub async fn wait_all(&self, instance_id: &str) -> Vec<TaskRecord> {
        loop {
            let pending: Vec<String> = self
                .list(instance_id)
                .into_iter()
                .filter(|r| r.status == TaskStatus::Running)
                .map(|r| r.id)
                .collect();
            if pending.is_empty() {
                return self.list(instance_id);
            }
            for id in pending {
                self.wait(&id).await;
            }
            tokio::task::yield_now().await;
        }
    }
}
