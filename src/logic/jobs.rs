use serde::{Deserialize, Serialize};

use crate::error::{CodingError, Rejection, Result};
use crate::logic::events::{CodingEvent, EventBus};
use crate::model::{CodingJob, CodingJobUnit, JobId, JobStatus, UnitProgress, WorkspaceId};
use crate::store::traits::Store;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveProgressResult {
    pub saved: usize,
    /// Entries that do not match a unit of the job
    pub ignored: usize,
    pub status: JobStatus,
}

pub struct JobService;

impl JobService {
    /// The job, if it belongs to the workspace
    pub async fn get<S: Store>(store: &S, workspace_id: WorkspaceId, job_id: JobId) -> Result<CodingJob> {
        store
            .get_coding_job(workspace_id, job_id)
            .await?
            .ok_or_else(|| {
                CodingError::NotFound(
                    Rejection::new("coding-job.not-found")
                        .with("jobId", job_id)
                        .with("workspaceId", workspace_id),
                )
            })
    }

    pub async fn list<S: Store>(store: &S, workspace_id: WorkspaceId) -> Result<Vec<CodingJob>> {
        let mut jobs = store.list_coding_jobs(workspace_id).await?;
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    pub async fn transition<S: Store>(
        store: &S,
        events: &EventBus,
        workspace_id: WorkspaceId,
        job_id: JobId,
        target: JobStatus,
    ) -> Result<CodingJob> {
        let mut job = Self::get(store, workspace_id, job_id).await?;
        if job.status == target {
            return Ok(job);
        }

        // Applying results is the only way into results_applied
        if target == JobStatus::ResultsApplied || !job.status.can_transition_to(target) {
            return Err(CodingError::Precondition(
                Rejection::new("coding-job.status.invalid-transition")
                    .with("from", job.status.as_str())
                    .with("to", target.as_str()),
            ));
        }

        store.update_job_status(job_id, target).await?;
        log::info!("Coding job {} moved from {} to {}", job_id, job.status, target);
        job.status = target;
        events
            .publish(CodingEvent::JobStatusChanged {
                workspace_id,
                job_id,
                status: target,
            })
            .await;
        Ok(job)
    }

    /// Delete a job that has not been completed, releasing its cases
    pub async fn cancel<S: Store>(
        store: &S,
        events: &EventBus,
        workspace_id: WorkspaceId,
        job_id: JobId,
    ) -> Result<()> {
        let job = Self::get(store, workspace_id, job_id).await?;
        if !job.status.can_cancel() {
            return Err(Self::cancel_not_allowed(job.status));
        }

        // The store re-checks the status, so a job completed in the meantime stays
        if !store.cancel_coding_job(job_id).await? {
            let current = Self::get(store, workspace_id, job_id).await?;
            return Err(Self::cancel_not_allowed(current.status));
        }

        log::info!("Cancelled coding job {} in workspace {}", job_id, workspace_id);
        events
            .publish(CodingEvent::JobCancelled {
                workspace_id,
                job_id,
            })
            .await;
        Ok(())
    }

    fn cancel_not_allowed(status: JobStatus) -> CodingError {
        CodingError::Precondition(Rejection::new("coding-job.cancel.not-allowed").with("status", status.as_str()))
    }

    /// Units a coder works on. Open jobs only show what is still undecided.
    pub async fn units<S: Store>(store: &S, workspace_id: WorkspaceId, job_id: JobId) -> Result<Vec<CodingJobUnit>> {
        let job = Self::get(store, workspace_id, job_id).await?;
        let mut units = store.list_job_units(job_id).await?;
        if job.status.is_open() {
            units.retain(|u| !u.decision.is_decided());
        }
        Ok(units)
    }

    pub async fn save_progress<S: Store>(
        store: &S,
        events: &EventBus,
        workspace_id: WorkspaceId,
        job_id: JobId,
        progress: &[UnitProgress],
    ) -> Result<SaveProgressResult> {
        let job = Self::get(store, workspace_id, job_id).await?;
        if !job.status.is_open() {
            return Err(Self::job_closed(job.status));
        }

        let Some(written) = store.save_unit_progress(job_id, progress).await? else {
            let current = Self::get(store, workspace_id, job_id).await?;
            return Err(Self::job_closed(current.status));
        };
        if job.status == JobStatus::Pending && written.status == JobStatus::Active {
            log::info!("Coding job {} became active", job_id);
        }

        if written.saved > 0 {
            events
                .publish(CodingEvent::ProgressSaved {
                    workspace_id,
                    job_id,
                    units: written.saved,
                })
                .await;
        }

        Ok(SaveProgressResult {
            saved: written.saved,
            ignored: progress.len() - written.saved,
            status: written.status,
        })
    }

    fn job_closed(status: JobStatus) -> CodingError {
        CodingError::Precondition(Rejection::new("coding-job.progress.job-closed").with("status", status.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CodingDecision;
    use crate::store::memory::MemoryStore;
    use crate::store::traits::CodingJobStore;
    use crate::test_support::{decision, job_for};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn coded(response_id: i64, code: i32) -> UnitProgress {
        decision(response_id, "v1", CodingDecision::Coded(code))
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<CodingEvent>>,
    }

    #[async_trait::async_trait]
    impl crate::logic::events::CodingEventListener for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn on_event(&self, event: &CodingEvent) -> anyhow::Result<()> {
            self.seen.lock().push(event.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let store = MemoryStore::new();
        let events = EventBus::new();
        let job_id = job_for(&store, 1, "v1", &[1, 2]).await;

        let err = JobService::transition(&store, &events, 1, job_id, JobStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, CodingError::Precondition(_)));

        let saved = JobService::save_progress(&store, &events, 1, job_id, &[coded(1, 2), coded(9, 1)])
            .await
            .unwrap();
        assert_eq!(saved.saved, 1);
        assert_eq!(saved.ignored, 1);
        assert_eq!(saved.status, JobStatus::Active);
        assert_eq!(JobService::get(&store, 1, job_id).await.unwrap().status, JobStatus::Active);

        let open = JobService::units(&store, 1, job_id).await.unwrap();
        assert_eq!(open.iter().map(|u| u.response_id).collect::<Vec<_>>(), vec![2]);

        for target in [JobStatus::Paused, JobStatus::Active, JobStatus::Completed] {
            JobService::transition(&store, &events, 1, job_id, target).await.unwrap();
        }
        assert_eq!(JobService::units(&store, 1, job_id).await.unwrap().len(), 2);

        let err = JobService::save_progress(&store, &events, 1, job_id, &[coded(2, 1)])
            .await
            .unwrap_err();
        assert_eq!(err.rejection().key, "coding-job.progress.job-closed");
        let err = JobService::transition(&store, &events, 1, job_id, JobStatus::ResultsApplied)
            .await
            .unwrap_err();
        assert!(matches!(err, CodingError::Precondition(_)));
    }

    #[tokio::test]
    async fn test_progress_and_transitions_publish_events() {
        let store = MemoryStore::new();
        let events = EventBus::new();
        let recorder = Arc::new(Recorder::default());
        events.subscribe(recorder.clone());
        let job_id = job_for(&store, 1, "v1", &[1, 2]).await;

        // Nothing matched, nothing changed
        JobService::save_progress(&store, &events, 1, job_id, &[coded(9, 1)])
            .await
            .unwrap();
        JobService::save_progress(&store, &events, 1, job_id, &[coded(1, 1), coded(2, 0)])
            .await
            .unwrap();
        JobService::transition(&store, &events, 1, job_id, JobStatus::Completed)
            .await
            .unwrap();

        assert_eq!(
            *recorder.seen.lock(),
            vec![
                CodingEvent::ProgressSaved {
                    workspace_id: 1,
                    job_id,
                    units: 2,
                },
                CodingEvent::JobStatusChanged {
                    workspace_id: 1,
                    job_id,
                    status: JobStatus::Completed,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_cancel_releases_cases() {
        let store = MemoryStore::new();
        let job_id = job_for(&store, 1, "v1", &[1, 2]).await;
        JobService::cancel(&store, &EventBus::new(), 1, job_id).await.unwrap();
        assert!(store.all_units().is_empty());
        assert!(matches!(
            JobService::get(&store, 1, job_id).await,
            Err(CodingError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_rejected_after_completion() {
        let store = MemoryStore::new();
        let events = EventBus::new();
        let job_id = job_for(&store, 1, "v1", &[1]).await;
        JobService::transition(&store, &events, 1, job_id, JobStatus::Active).await.unwrap();
        JobService::transition(&store, &events, 1, job_id, JobStatus::Completed).await.unwrap();

        let err = JobService::cancel(&store, &events, 1, job_id).await.unwrap_err();
        assert_eq!(err.rejection().key, "coding-job.cancel.not-allowed");
        assert_eq!(store.all_units().len(), 1);
    }

    #[tokio::test]
    async fn test_store_keeps_jobs_completed_after_the_status_check() {
        let store = MemoryStore::new();
        let job_id = job_for(&store, 1, "v1", &[1]).await;

        // Another writer completes the job between a caller's read and its write
        let seen = JobService::get(&store, 1, job_id).await.unwrap();
        assert!(seen.status.can_cancel());
        store.update_job_status(job_id, JobStatus::Completed).await.unwrap();

        assert!(!store.cancel_coding_job(job_id).await.unwrap());
        assert!(store.save_unit_progress(job_id, &[coded(1, 1)]).await.unwrap().is_none());
        assert_eq!(store.all_units().len(), 1);
        assert!(!store.all_units()[0].decision.is_decided());
    }

    #[tokio::test]
    async fn test_foreign_workspace_is_not_found() {
        let store = MemoryStore::new();
        let job_id = job_for(&store, 1, "v1", &[1]).await;
        assert!(matches!(
            JobService::units(&store, 2, job_id).await,
            Err(CodingError::NotFound(_))
        ));
    }
}
