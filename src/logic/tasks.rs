use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CodingError, Rejection};
use crate::model::generate_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: String,
    pub name: String,
    pub state: TaskState,
    pub progress: u8,
    pub result: Option<Value>,
    pub error: Option<Rejection>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Progress reporting for a unit of work, 0 to 100
#[derive(Debug, Clone, Default)]
pub struct ProgressHandle {
    value: Arc<AtomicU8>,
}

impl ProgressHandle {
    /// A handle nobody reads; for work running on the request path
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn set(&self, percent: u8) {
        self.value.store(percent.min(100), Ordering::Relaxed);
    }

    pub fn set_fraction(&self, done: usize, total: usize) {
        let percent = if total == 0 { 100 } else { done * 100 / total };
        self.set(percent.min(100) as u8);
    }

    pub fn get(&self) -> u8 {
        self.value.load(Ordering::Relaxed)
    }
}

struct TaskEntry {
    snapshot: TaskSnapshot,
    progress: ProgressHandle,
}

const DEFAULT_RETENTION: Duration = Duration::from_secs(3600);

/// Runs long operations off the request path. Finished tasks stay
/// readable for the retention window, then they are evicted.
#[derive(Clone)]
pub struct TaskRunner {
    tasks: Arc<RwLock<HashMap<String, TaskEntry>>>,
    retention: Duration,
}

impl Default for TaskRunner {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

impl TaskRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            retention,
        }
    }

    /// Drop tasks that finished more than the retention window ago
    pub fn purge_finished(&self) -> usize {
        let cutoff = chrono::Duration::from_std(self.retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention));
        let mut tasks = self.tasks.write();
        let before = tasks.len();
        tasks.retain(|_, entry| match (entry.snapshot.finished_at, cutoff) {
            (Some(finished_at), Some(cutoff)) => finished_at > cutoff,
            _ => true,
        });
        let removed = before - tasks.len();
        if removed > 0 {
            log::debug!("Evicted {} finished tasks", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn `work` on the runtime and return its task id
    pub fn submit<F, Fut, T>(&self, name: &str, work: F) -> String
    where
        F: FnOnce(ProgressHandle) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, CodingError>> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        self.purge_finished();
        let id = generate_id();
        let progress = ProgressHandle::default();
        self.tasks.write().insert(
            id.clone(),
            TaskEntry {
                snapshot: TaskSnapshot {
                    id: id.clone(),
                    name: name.to_string(),
                    state: TaskState::Queued,
                    progress: 0,
                    result: None,
                    error: None,
                    created_at: Utc::now(),
                    finished_at: None,
                },
                progress: progress.clone(),
            },
        );

        let tasks = self.tasks.clone();
        let task_id = id.clone();
        let task_name = name.to_string();
        tokio::spawn(async move {
            Self::update(&tasks, &task_id, |s| s.state = TaskState::Running);
            log::info!("Task {} ({}) started", task_id, task_name);

            let outcome = work(progress.clone()).await;
            let outcome = outcome.and_then(|value| {
                serde_json::to_value(value).map_err(|e| CodingError::Store(e.into()))
            });

            match outcome {
                Ok(value) => {
                    log::info!("Task {} ({}) completed", task_id, task_name);
                    Self::update(&tasks, &task_id, |s| {
                        s.state = TaskState::Completed;
                        s.progress = 100;
                        s.result = Some(value);
                        s.finished_at = Some(Utc::now());
                    });
                }
                Err(e) => {
                    log::error!("Task {} ({}) failed: {}", task_id, task_name, e);
                    let rejection = e.rejection();
                    Self::update(&tasks, &task_id, |s| {
                        s.state = TaskState::Failed;
                        s.error = Some(rejection);
                        s.finished_at = Some(Utc::now());
                    });
                }
            }
        });

        id
    }

    fn update(
        tasks: &RwLock<HashMap<String, TaskEntry>>,
        id: &str,
        apply: impl FnOnce(&mut TaskSnapshot),
    ) {
        if let Some(entry) = tasks.write().get_mut(id) {
            apply(&mut entry.snapshot);
        }
    }

    pub fn status(&self, id: &str) -> Option<TaskSnapshot> {
        let tasks = self.tasks.read();
        let entry = tasks.get(id)?;
        let mut snapshot = entry.snapshot.clone();
        if !snapshot.state.is_finished() {
            snapshot.progress = entry.progress.get();
        }
        Some(snapshot)
    }

    /// The typed result of a completed task
    pub fn result<T: DeserializeOwned>(&self, id: &str) -> anyhow::Result<Option<T>> {
        match self.status(id).and_then(|s| s.result) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Poll until the task finishes or `timeout` passes
    pub async fn wait(&self, id: &str, timeout: Duration) -> Option<TaskSnapshot> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let snapshot = self.status(id)?;
            if snapshot.state.is_finished() || tokio::time::Instant::now() >= deadline {
                return Some(snapshot);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
