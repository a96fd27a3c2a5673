use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::model::{JobId, JobStatus, WorkspaceId};

/// Something changed the coding state of a workspace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CodingEvent {
    CasesAllocated {
        workspace_id: WorkspaceId,
        job_ids: Vec<JobId>,
    },
    ResultsApplied {
        workspace_id: WorkspaceId,
        job_id: JobId,
    },
    ResolutionsApplied {
        workspace_id: WorkspaceId,
        responses: usize,
    },
    JobCancelled {
        workspace_id: WorkspaceId,
        job_id: JobId,
    },
    ProgressSaved {
        workspace_id: WorkspaceId,
        job_id: JobId,
        units: usize,
    },
    JobStatusChanged {
        workspace_id: WorkspaceId,
        job_id: JobId,
        status: JobStatus,
    },
}

impl CodingEvent {
    pub fn workspace_id(&self) -> WorkspaceId {
        match self {
            Self::CasesAllocated { workspace_id, .. }
            | Self::ResultsApplied { workspace_id, .. }
            | Self::ResolutionsApplied { workspace_id, .. }
            | Self::JobCancelled { workspace_id, .. }
            | Self::ProgressSaved { workspace_id, .. }
            | Self::JobStatusChanged { workspace_id, .. } => *workspace_id,
        }
    }
}

#[async_trait::async_trait]
pub trait CodingEventListener: Send + Sync {
    fn name(&self) -> &str;
    async fn on_event(&self, event: &CodingEvent) -> anyhow::Result<()>;
}

/// Delivers coding events to every registered cache owner
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<RwLock<Vec<Arc<dyn CodingEventListener>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn CodingEventListener>) {
        self.listeners.write().push(listener);
    }

    /// Runs listeners in registration order. A failing listener is logged;
    /// the operation that published the event has already succeeded.
    pub async fn publish(&self, event: CodingEvent) {
        let listeners: Vec<Arc<dyn CodingEventListener>> = self.listeners.read().clone();
        for listener in listeners {
            if let Err(e) = listener.on_event(&event).await {
                log::warn!(
                    "Listener '{}' failed to handle {:?}: {:#}",
                    listener.name(),
                    event,
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder {
        seen: Mutex<Vec<WorkspaceId>>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl CodingEventListener for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn on_event(&self, event: &CodingEvent) -> anyhow::Result<()> {
            self.seen.lock().push(event.workspace_id());
            if self.fail {
                anyhow::bail!("listener down");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_all_listeners_receive_events() {
        let bus = EventBus::new();
        let failing = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            fail: true,
        });
        let healthy = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            fail: false,
        });
        bus.subscribe(failing.clone());
        bus.subscribe(healthy.clone());

        bus.publish(CodingEvent::ResultsApplied {
            workspace_id: 4,
            job_id: 9,
        })
        .await;

        assert_eq!(*failing.seen.lock(), vec![4]);
        assert_eq!(*healthy.seen.lock(), vec![4]);
    }
}
