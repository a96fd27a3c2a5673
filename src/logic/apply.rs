use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::config::CodingSettings;
use crate::error::{CodingError, Rejection, Result};
use crate::logic::events::{CodingEvent, EventBus};
use crate::logic::jobs::JobService;
use crate::model::{CodingDecision, CodingJobUnit, JobId, JobStatus, ResponseId, ResponseUpdate, WorkspaceId};
use crate::store::traits::Store;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyResultsOutcome {
    pub success: bool,
    pub updated_responses_count: usize,
    /// Double-coded units left for the reviewer because coders disagree
    pub skipped_review_count: usize,
    pub message_key: String,
    pub message_params: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobApplyStatus {
    Applied {
        updated_responses_count: usize,
        skipped_review_count: usize,
    },
    /// The job was not in a state that allows applying
    Skipped { reason: Rejection },
    Failed { reason: Rejection },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobApplyReport {
    pub job_id: JobId,
    pub job_name: String,
    pub status: JobApplyStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkApplyReport {
    pub success: bool,
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
    pub updated_responses_count: usize,
    pub jobs: Vec<JobApplyReport>,
}

/// Merges a completed job's decisions into the response records
pub struct ResultsApplier;

impl ResultsApplier {
    pub async fn apply<S: Store>(
        store: &S,
        events: &EventBus,
        settings: &CodingSettings,
        workspace_id: WorkspaceId,
        job_id: JobId,
    ) -> Result<ApplyResultsOutcome> {
        let job = JobService::get(store, workspace_id, job_id).await?;
        match job.status {
            JobStatus::Completed => {}
            JobStatus::ResultsApplied => {
                return Err(CodingError::Precondition(
                    Rejection::new("coding-job.apply.already-applied").with("jobId", job_id),
                ))
            }
            other => {
                return Err(CodingError::Precondition(
                    Rejection::new("coding-job.apply.not-completed").with("status", other.as_str()),
                ))
            }
        }

        let units = store.list_job_units(job_id).await?;
        let review_count = units.iter().filter(|u| u.decision.requires_review()).count();
        if review_count > 0 {
            return Err(CodingError::Precondition(
                Rejection::new("coding-job.apply.review-required").with("count", review_count),
            ));
        }

        let disputed = Self::disputed_responses(store, workspace_id, job_id, &units).await?;
        let updates: Vec<ResponseUpdate> = units
            .iter()
            .filter(|u| !disputed.contains(&u.response_id))
            .map(|u| ResponseUpdate {
                response_id: u.response_id,
                outcome: u.decision.outcome(u.score),
                value: None,
            })
            .collect();
        let skipped = units.len() - updates.len();

        log::info!(
            "Applying {} result(s) of coding job {} ({} left for review)",
            updates.len(),
            job_id,
            skipped
        );
        let updated = store
            .apply_job_results(workspace_id, job_id, &updates, settings.apply_batch_size)
            .await?;

        events
            .publish(CodingEvent::ResultsApplied {
                workspace_id,
                job_id,
            })
            .await;

        Ok(ApplyResultsOutcome {
            success: true,
            updated_responses_count: updated,
            skipped_review_count: skipped,
            message_key: "coding-job.apply.success".to_string(),
            message_params: BTreeMap::from([
                ("updated".to_string(), Value::from(updated)),
                ("skipped".to_string(), Value::from(skipped)),
            ]),
        })
    }

    /// Responses of this job that another job decided differently
    async fn disputed_responses<S: Store>(
        store: &S,
        workspace_id: WorkspaceId,
        job_id: JobId,
        units: &[CodingJobUnit],
    ) -> Result<HashSet<ResponseId>> {
        let ids: Vec<ResponseId> = units.iter().map(|u| u.response_id).collect();
        let others = store.list_coder_units_for_responses(workspace_id, &ids).await?;

        let own: HashMap<(ResponseId, &str), CodingDecision> = units
            .iter()
            .map(|u| ((u.response_id, u.variable_id.as_str()), u.decision))
            .collect();

        let mut disputed = HashSet::new();
        for other in others.iter().filter(|o| o.unit.coding_job_id != job_id) {
            let key = (other.unit.response_id, other.unit.variable_id.as_str());
            if let Some(decision) = own.get(&key) {
                if *decision != other.unit.decision {
                    disputed.insert(other.unit.response_id);
                }
            }
        }
        Ok(disputed)
    }

    /// Apply every completed job of the workspace, one after another. Each job
    /// is applied atomically on its own; a failing job does not stop the run.
    pub async fn apply_all<S: Store>(
        store: &S,
        events: &EventBus,
        settings: &CodingSettings,
        workspace_id: WorkspaceId,
    ) -> Result<BulkApplyReport> {
        let jobs = JobService::list(store, workspace_id).await?;
        let mut report = BulkApplyReport::default();

        for job in jobs.into_iter().filter(|j| j.status == JobStatus::Completed) {
            let status = match Self::apply(store, events, settings, workspace_id, job.id).await {
                Ok(outcome) => {
                    report.applied += 1;
                    report.updated_responses_count += outcome.updated_responses_count;
                    JobApplyStatus::Applied {
                        updated_responses_count: outcome.updated_responses_count,
                        skipped_review_count: outcome.skipped_review_count,
                    }
                }
                Err(e @ (CodingError::Precondition(_) | CodingError::NotFound(_))) => {
                    report.skipped += 1;
                    log::info!("Skipping coding job {}: {}", job.id, e);
                    JobApplyStatus::Skipped { reason: e.rejection() }
                }
                Err(e) => {
                    report.failed += 1;
                    log::error!("Applying coding job {} failed: {}", job.id, e);
                    JobApplyStatus::Failed { reason: e.rejection() }
                }
            };
            report.jobs.push(JobApplyReport {
                job_id: job.id,
                job_name: job.name,
                status,
            });
        }

        report.success = report.failed == 0;
        log::info!(
            "Bulk apply in workspace {}: {} applied, {} skipped, {} failed",
            workspace_id,
            report.applied,
            report.skipped,
            report.failed
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResponseStatus;
    use crate::store::memory::MemoryStore;
    use crate::test_support::{complete_job, decision, job_for, seed_responses, shared_jobs, WORKSPACE};

    async fn apply(store: &MemoryStore, job_id: JobId) -> Result<ApplyResultsOutcome> {
        ResultsApplier::apply(store, &EventBus::new(), &CodingSettings::default(), WORKSPACE, job_id).await
    }

    #[tokio::test]
    async fn test_outcomes_follow_decisions() {
        let store = MemoryStore::new();
        seed_responses(&store, "v1", 1..=4);
        let job = job_for(&store, 1, "v1", &[1, 2, 3, 4]).await;
        complete_job(
            &store,
            job,
            &[
                decision(1, "v1", CodingDecision::Coded(2)),
                decision(2, "v1", CodingDecision::Invalid),
                decision(3, "v1", CodingDecision::Error),
            ],
        )
        .await;

        let outcome = apply(&store, job).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.updated_responses_count, 4);
        assert_eq!(outcome.skipped_review_count, 0);

        let r1 = store.response(1).unwrap();
        assert_eq!(r1.status_v2, Some(ResponseStatus::CodingComplete));
        assert_eq!(r1.code_v2, Some(2));
        assert_eq!(store.response(2).unwrap().status_v2, Some(ResponseStatus::Invalid));
        assert_eq!(store.response(3).unwrap().status_v2, Some(ResponseStatus::CodingError));
        assert_eq!(store.response(4).unwrap().status_v2, Some(ResponseStatus::CodingIncomplete));

        let err = apply(&store, job).await.unwrap_err();
        assert_eq!(err.rejection().key, "coding-job.apply.already-applied");
    }

    #[tokio::test]
    async fn test_not_completed_is_rejected_without_changes() {
        let store = MemoryStore::new();
        seed_responses(&store, "v1", 1..=2);
        let job = job_for(&store, 1, "v1", &[1, 2]).await;

        let err = apply(&store, job).await.unwrap_err();
        let rejection = err.rejection();
        assert_eq!(rejection.key, "coding-job.apply.not-completed");
        assert_eq!(rejection.params["status"], "pending");
        assert_eq!(store.response(1).unwrap().status_v2, None);
    }

    #[tokio::test]
    async fn test_uncertain_decisions_block_apply() {
        let store = MemoryStore::new();
        seed_responses(&store, "v1", 1..=3);
        let job = job_for(&store, 1, "v1", &[1, 2, 3]).await;
        complete_job(
            &store,
            job,
            &[
                decision(1, "v1", CodingDecision::Uncertain),
                decision(2, "v1", CodingDecision::NeedsReview),
                decision(3, "v1", CodingDecision::Coded(1)),
            ],
        )
        .await;

        let rejection = apply(&store, job).await.unwrap_err().rejection();
        assert_eq!(rejection.key, "coding-job.apply.review-required");
        assert_eq!(rejection.params["count"], 2);
        assert_eq!(store.response(3).unwrap().status_v2, None);
    }

    #[tokio::test]
    async fn test_failed_batch_rolls_back_everything() {
        let store = MemoryStore::new();
        seed_responses(&store, "v1", 1..=1200);
        let ids: Vec<i64> = (1..=1200).collect();
        let job = job_for(&store, 1, "v1", &ids).await;
        let decisions: Vec<_> = ids.iter().map(|id| decision(*id, "v1", CodingDecision::Coded(1))).collect();
        complete_job(&store, job, &decisions).await;

        store.fail_apply_after_batches(Some(1));
        let err = apply(&store, job).await.unwrap_err();
        assert!(matches!(err, CodingError::Store(_)));
        assert!(ids.iter().all(|id| store.response(*id).unwrap().status_v2.is_none()));
        let job_after = JobService::get(&store, WORKSPACE, job).await.unwrap();
        assert_eq!(job_after.status, JobStatus::Completed);

        store.fail_apply_after_batches(None);
        assert_eq!(apply(&store, job).await.unwrap().updated_responses_count, 1200);
    }

    #[tokio::test]
    async fn test_disagreeing_double_codes_are_left_for_review() {
        let store = MemoryStore::new();
        seed_responses(&store, "v1", 1..=2);
        let jobs = shared_jobs(&store, &[1, 2], "v1", &[1, 2]).await;
        let (first, second) = (jobs[0], jobs[1]);
        complete_job(
            &store,
            first,
            &[
                decision(1, "v1", CodingDecision::Coded(1)),
                decision(2, "v1", CodingDecision::Coded(2)),
            ],
        )
        .await;
        complete_job(
            &store,
            second,
            &[
                decision(1, "v1", CodingDecision::Coded(1)),
                decision(2, "v1", CodingDecision::Coded(0)),
            ],
        )
        .await;

        let outcome = apply(&store, first).await.unwrap();
        assert_eq!(outcome.updated_responses_count, 1);
        assert_eq!(outcome.skipped_review_count, 1);
        assert_eq!(store.response(2).unwrap().status_v2, None);
    }

    #[tokio::test]
    async fn test_apply_all_reports_per_job() {
        let store = MemoryStore::new();
        seed_responses(&store, "v1", 1..=2);
        seed_responses(&store, "v2", 3..=4);
        seed_responses(&store, "v3", 5..=5);
        let ready = job_for(&store, 1, "v1", &[1, 2]).await;
        let blocked = job_for(&store, 1, "v2", &[3, 4]).await;
        let open = job_for(&store, 1, "v3", &[5]).await;
        complete_job(&store, ready, &[decision(1, "v1", CodingDecision::Coded(1))]).await;
        complete_job(&store, blocked, &[decision(3, "v2", CodingDecision::Uncertain)]).await;

        let report = ResultsApplier::apply_all(&store, &EventBus::new(), &CodingSettings::default(), WORKSPACE)
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(report.applied, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.updated_responses_count, 2);
        assert!(report.jobs.iter().all(|j| j.job_id != open));
        assert!(matches!(report.jobs[1].status, JobApplyStatus::Skipped { .. }));
    }
}
