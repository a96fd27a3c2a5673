//! Fixtures shared by the unit tests

use crate::model::{
    CaseOrderingMode, CaseRef, CodingDecision, CoderId, JobId, JobStatus, NewCodingJob, Response,
    ResponseId, ResponseStatus, UnitProgress, VariableRef, WorkspaceId,
};
use crate::store::memory::MemoryStore;
use crate::store::traits::{AllocationPlan, AllocationStore, CodingJobStore, JobAssignment};

pub const WORKSPACE: WorkspaceId = 1;

pub fn response(id: ResponseId, variable_id: &str) -> Response {
    Response {
        id,
        workspace_id: WORKSPACE,
        unit_name: "UNIT".to_string(),
        login_name: format!("login{}", id),
        login_code: "code".to_string(),
        booklet_id: "B1".to_string(),
        variable_id: variable_id.to_string(),
        value: Some(format!("answer {}", id)),
        status_v1: ResponseStatus::CodingIncomplete,
        status_v2: None,
        code_v2: None,
        score_v2: None,
    }
}

pub fn seed_responses(store: &MemoryStore, variable_id: &str, ids: impl IntoIterator<Item = ResponseId>) {
    for id in ids {
        store.insert_response(response(id, variable_id));
    }
}

fn assignment(coder_id: CoderId, variable: &VariableRef, ids: &[ResponseId]) -> JobAssignment {
    JobAssignment {
        job: NewCodingJob {
            name: format!("coder{}_{}", coder_id, variable.label()),
            coder_id,
            coder_name: format!("coder{}", coder_id),
            variable: variable.clone(),
            bundle_id: None,
            missings_profile_id: None,
            case_ordering_mode: CaseOrderingMode::Continuous,
        },
        cases: ids
            .iter()
            .map(|id| CaseRef {
                response_id: *id,
                unit_name: variable.unit_name.clone(),
                variable_id: variable.variable_id.clone(),
                booklet_id: "B1".to_string(),
                login_name: format!("login{}", id),
                login_code: "code".to_string(),
            })
            .collect(),
    }
}

/// Commit one job per coder, all holding the same responses of `UNIT_{variable_id}`,
/// in a single allocation the way the allocator hands out double-coded cases
pub async fn shared_jobs(
    store: &MemoryStore,
    coder_ids: &[CoderId],
    variable_id: &str,
    ids: &[ResponseId],
) -> Vec<JobId> {
    let variable = VariableRef::new("UNIT", variable_id);
    let plan = AllocationPlan {
        workspace_id: WORKSPACE,
        variable: variable.clone(),
        assignments: coder_ids
            .iter()
            .map(|coder_id| assignment(*coder_id, &variable, ids))
            .collect(),
    };
    store
        .commit_allocation(&plan)
        .await
        .expect("fixture allocation should commit")
        .into_iter()
        .map(|committed| committed.job.id)
        .collect()
}

/// Commit a job for one coder holding the given responses of `UNIT_{variable_id}`
pub async fn job_for(store: &MemoryStore, coder_id: CoderId, variable_id: &str, ids: &[ResponseId]) -> JobId {
    shared_jobs(store, &[coder_id], variable_id, ids).await[0]
}

pub fn decision(response_id: ResponseId, variable_id: &str, decision: CodingDecision) -> UnitProgress {
    UnitProgress {
        response_id,
        variable_id: variable_id.to_string(),
        decision,
        score: decision.code().map(|c| c.min(1)),
        notes: None,
    }
}

/// Save the decisions and move the job to completed
pub async fn complete_job(store: &MemoryStore, job_id: JobId, decisions: &[UnitProgress]) {
    store
        .save_unit_progress(job_id, decisions)
        .await
        .expect("fixture progress should save")
        .expect("fixture job should be open");
    store
        .update_job_status(job_id, JobStatus::Completed)
        .await
        .expect("fixture job should exist");
}
