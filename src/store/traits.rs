use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::model::{
    BundleId, CaseRef, CodingJob, CodingJobUnit, CoderUnit, ExpectedCombination, JobId,
    JobStatus, NewCodingJob, Response, ResponseId, ResponseStatus, ResponseUpdate, UnitProgress,
    VariableBundle, VariableRef, WorkspaceId,
};

/// Per-variable counts of responses that still need coding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncompleteVariable {
    pub unit_name: String,
    pub variable_id: String,
    pub response_count: usize,
    pub cases_in_jobs: usize,
    pub available_cases: usize,
}

/// One coder's share of an allocation run for one variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAssignment {
    pub job: NewCodingJob,
    pub cases: Vec<CaseRef>,
}

/// Everything an allocation run writes for one variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationPlan {
    pub workspace_id: WorkspaceId,
    pub variable: VariableRef,
    pub assignments: Vec<JobAssignment>,
}

impl AllocationPlan {
    pub fn response_ids(&self) -> HashSet<ResponseId> {
        self.assignments
            .iter()
            .flat_map(|a| a.cases.iter().map(|c| c.response_id))
            .collect()
    }
}

/// Outcome of committing one assignment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedJob {
    pub job: CodingJob,
    pub reused: bool,
    pub units_inserted: usize,
}

/// What a progress write touched and the job status after it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedProgress {
    pub saved: usize,
    pub status: JobStatus,
}

/// Another writer assigned some of the planned cases first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationConflict {
    pub variable: VariableRef,
    pub conflicting_responses: Vec<ResponseId>,
}

impl fmt::Display for AllocationConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} case(s) of {} were assigned concurrently",
            self.conflicting_responses.len(),
            self.variable.label()
        )
    }
}

impl std::error::Error for AllocationConflict {}

#[async_trait::async_trait]
pub trait ResponseStore: Send + Sync {
    /// Which of the given combinations have at least one response with a non-empty value
    async fn find_existing_combinations(
        &self,
        workspace_id: WorkspaceId,
        combinations: &[ExpectedCombination],
    ) -> Result<HashSet<ExpectedCombination>>;
    async fn get_responses(
        &self,
        workspace_id: WorkspaceId,
        ids: &[ResponseId],
    ) -> Result<Vec<Response>>;
    /// Response counts grouped by effective status
    async fn count_responses_by_status(
        &self,
        workspace_id: WorkspaceId,
    ) -> Result<Vec<(ResponseStatus, usize)>>;
    async fn list_incomplete_variables(
        &self,
        workspace_id: WorkspaceId,
    ) -> Result<Vec<IncompleteVariable>>;
    /// Write a reviewer's resolution to one response. Returns false if the response does not exist.
    async fn apply_resolution(
        &self,
        workspace_id: WorkspaceId,
        update: &ResponseUpdate,
    ) -> Result<bool>;
}

#[async_trait::async_trait]
pub trait CodingJobStore: Send + Sync {
    async fn get_coding_job(&self, workspace_id: WorkspaceId, job_id: JobId) -> Result<Option<CodingJob>>;
    async fn list_coding_jobs(&self, workspace_id: WorkspaceId) -> Result<Vec<CodingJob>>;
    async fn update_job_status(&self, job_id: JobId, status: JobStatus) -> Result<()>;
    /// Delete a job and its units while it is still pending or active.
    /// Returns false when the job is gone or has moved past that point.
    async fn cancel_coding_job(&self, job_id: JobId) -> Result<bool>;
    async fn list_job_units(&self, job_id: JobId) -> Result<Vec<CodingJobUnit>>;
    /// Store coder decisions for units of a job and activate a pending job
    /// that received any. Returns `None` if the job is no longer open.
    async fn save_unit_progress(&self, job_id: JobId, progress: &[UnitProgress]) -> Result<Option<SavedProgress>>;
    /// Every decided unit of the workspace for the given responses, with coder info
    async fn list_coder_units_for_responses(
        &self,
        workspace_id: WorkspaceId,
        response_ids: &[ResponseId],
    ) -> Result<Vec<CoderUnit>>;
    /// Decided units of responses that more than one job has decided on
    async fn list_double_coded_units(&self, workspace_id: WorkspaceId) -> Result<Vec<CoderUnit>>;
    /// Write all updates in batches inside one transaction and mark the job
    /// `results_applied` in the same transaction. Nothing is written on error.
    async fn apply_job_results(
        &self,
        workspace_id: WorkspaceId,
        job_id: JobId,
        updates: &[ResponseUpdate],
        batch_size: usize,
    ) -> Result<usize>;
}

#[async_trait::async_trait]
pub trait AllocationStore: Send + Sync {
    /// Cases of a variable that need coding and are not held by any job, ascending by response id
    async fn list_allocatable_cases(
        &self,
        workspace_id: WorkspaceId,
        variable: &VariableRef,
    ) -> Result<Vec<CaseRef>>;
    /// Atomically re-check that none of the planned cases were assigned in the
    /// meantime, create or reuse the jobs and insert the units. Fails with
    /// [`AllocationConflict`] when the check does not hold.
    async fn commit_allocation(&self, plan: &AllocationPlan) -> Result<Vec<CommittedJob>>;
}

#[async_trait::async_trait]
pub trait VariableBundleStore: Send + Sync {
    async fn get_variable_bundles(
        &self,
        workspace_id: WorkspaceId,
        ids: &[BundleId],
    ) -> Result<Vec<VariableBundle>>;
}

pub trait Store:
    ResponseStore + CodingJobStore + AllocationStore + VariableBundleStore + Send + Sync
{
}
