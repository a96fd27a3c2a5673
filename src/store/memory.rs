use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::model::{
    BundleId, CaseRef, CodingJob, CodingJobUnit, CoderId, CoderUnit, CodingDecision,
    ExpectedCombination, JobId, JobStatus, Response, ResponseId, ResponseStatus, ResponseUpdate,
    UnitProgress, VariableBundle, VariableRef, WorkspaceId,
};
use crate::store::traits::{
    AllocationConflict, AllocationPlan, AllocationStore, CodingJobStore, CommittedJob,
    IncompleteVariable, ResponseStore, SavedProgress, Store, VariableBundleStore,
};

#[derive(Debug, Default)]
struct MemoryState {
    responses: BTreeMap<ResponseId, Response>,
    jobs: BTreeMap<JobId, CodingJob>,
    units: Vec<CodingJobUnit>,
    bundles: BTreeMap<BundleId, VariableBundle>,
    coders: HashMap<CoderId, String>,
    next_job_id: JobId,
    next_unit_id: i64,
}

impl MemoryState {
    /// Responses of a variable that some job still holds. Units of applied jobs
    /// release their response only if it was left incomplete.
    fn held_responses(&self, workspace_id: WorkspaceId, variable: &VariableRef) -> HashSet<ResponseId> {
        self.units
            .iter()
            .filter(|u| u.unit_name == variable.unit_name && u.variable_id == variable.variable_id)
            .filter(|u| {
                let Some(job) = self.jobs.get(&u.coding_job_id) else {
                    return false;
                };
                if job.workspace_id != workspace_id {
                    return false;
                }
                if job.status != JobStatus::ResultsApplied {
                    return true;
                }
                self.responses
                    .get(&u.response_id)
                    .map_or(true, |r| r.status_v2 != Some(ResponseStatus::CodingIncomplete))
            })
            .map(|u| u.response_id)
            .collect()
    }

    fn coder_unit(&self, unit: &CodingJobUnit) -> Option<CoderUnit> {
        let job = self.jobs.get(&unit.coding_job_id)?;
        let coder_id = job.primary_coder()?;
        Some(CoderUnit {
            unit: unit.clone(),
            coder_id,
            coder_name: self
                .coders
                .get(&coder_id)
                .cloned()
                .unwrap_or_else(|| format!("coder-{}", coder_id)),
            job_name: job.name.clone(),
        })
    }

    fn decided_workspace_units(&self, workspace_id: WorkspaceId) -> impl Iterator<Item = &CodingJobUnit> {
        self.units.iter().filter(move |u| {
            u.decision.is_decided()
                && self
                    .jobs
                    .get(&u.coding_job_id)
                    .is_some_and(|j| j.workspace_id == workspace_id)
        })
    }
}

/// Store backed by process memory. Used by tests and local tooling; supports
/// injecting failures to exercise rollback paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    fail_apply_after_batches: Mutex<Option<usize>>,
    fail_lookups: AtomicBool,
    lookups_until_failure: Mutex<Option<usize>>,
    failing_jobs: Mutex<HashSet<JobId>>,
    forced_conflicts: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_response(&self, response: Response) {
        self.state.write().responses.insert(response.id, response);
    }

    pub fn insert_coder(&self, id: CoderId, name: impl Into<String>) {
        self.state.write().coders.insert(id, name.into());
    }

    pub fn insert_bundle(&self, bundle: VariableBundle) {
        self.state.write().bundles.insert(bundle.id, bundle);
    }

    pub fn response(&self, id: ResponseId) -> Option<Response> {
        self.state.read().responses.get(&id).cloned()
    }

    pub fn all_units(&self) -> Vec<CodingJobUnit> {
        self.state.read().units.clone()
    }

    /// Make `apply_job_results` fail once the given number of batches has been written
    pub fn fail_apply_after_batches(&self, batches: Option<usize>) {
        *self.fail_apply_after_batches.lock() = batches;
    }

    /// Make the next `count` allocation commits fail as if another run got there first
    pub fn force_allocation_conflicts(&self, count: usize) {
        *self.forced_conflicts.lock() = count;
    }

    /// Make combination lookups fail
    pub fn fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    /// Let `lookups` more combination lookups succeed, then fail the rest
    pub fn fail_lookups_after(&self, lookups: Option<usize>) {
        *self.lookups_until_failure.lock() = lookups;
    }

    /// Make reads of one job and its units fail
    pub fn fail_job_reads(&self, job_id: JobId) {
        self.failing_jobs.lock().insert(job_id);
    }

    fn check_job_read(&self, job_id: JobId) -> Result<()> {
        if self.failing_jobs.lock().contains(&job_id) {
            bail!("coding job {} unavailable", job_id);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ResponseStore for MemoryStore {
    async fn find_existing_combinations(
        &self,
        workspace_id: WorkspaceId,
        combinations: &[ExpectedCombination],
    ) -> Result<HashSet<ExpectedCombination>> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            bail!("response lookup unavailable");
        }
        if let Some(remaining) = self.lookups_until_failure.lock().as_mut() {
            if *remaining == 0 {
                bail!("response lookup unavailable");
            }
            *remaining -= 1;
        }

        let wanted: HashSet<&ExpectedCombination> = combinations.iter().collect();
        let state = self.state.read();
        let found = state
            .responses
            .values()
            .filter(|r| r.workspace_id == workspace_id && r.has_value())
            .map(|r| ExpectedCombination {
                unit_key: r.unit_name.clone(),
                login_name: r.login_name.clone(),
                login_code: r.login_code.clone(),
                booklet_id: r.booklet_id.clone(),
                variable_id: r.variable_id.clone(),
            })
            .filter(|c| wanted.contains(c))
            .collect();
        Ok(found)
    }

    async fn get_responses(&self, workspace_id: WorkspaceId, ids: &[ResponseId]) -> Result<Vec<Response>> {
        let state = self.state.read();
        Ok(ids
            .iter()
            .filter_map(|id| state.responses.get(id))
            .filter(|r| r.workspace_id == workspace_id)
            .cloned()
            .collect())
    }

    async fn count_responses_by_status(&self, workspace_id: WorkspaceId) -> Result<Vec<(ResponseStatus, usize)>> {
        let state = self.state.read();
        let mut counts: BTreeMap<ResponseStatus, usize> = BTreeMap::new();
        for response in state.responses.values().filter(|r| r.workspace_id == workspace_id) {
            *counts.entry(response.effective_status()).or_default() += 1;
        }
        Ok(counts.into_iter().collect())
    }

    async fn list_incomplete_variables(&self, workspace_id: WorkspaceId) -> Result<Vec<IncompleteVariable>> {
        let state = self.state.read();
        let mut by_variable: BTreeMap<VariableRef, Vec<ResponseId>> = BTreeMap::new();
        for response in state
            .responses
            .values()
            .filter(|r| r.workspace_id == workspace_id && r.needs_coding())
        {
            by_variable.entry(response.variable()).or_default().push(response.id);
        }

        Ok(by_variable
            .into_iter()
            .map(|(variable, ids)| {
                let held = state.held_responses(workspace_id, &variable);
                let cases_in_jobs = ids.iter().filter(|id| held.contains(id)).count();
                IncompleteVariable {
                    unit_name: variable.unit_name,
                    variable_id: variable.variable_id,
                    response_count: ids.len(),
                    cases_in_jobs,
                    available_cases: ids.len() - cases_in_jobs,
                }
            })
            .collect())
    }

    async fn apply_resolution(&self, workspace_id: WorkspaceId, update: &ResponseUpdate) -> Result<bool> {
        let mut state = self.state.write();
        let Some(response) = state
            .responses
            .get_mut(&update.response_id)
            .filter(|r| r.workspace_id == workspace_id)
        else {
            return Ok(false);
        };
        response.apply_outcome(&update.outcome);
        if let Some(value) = &update.value {
            response.value = Some(value.clone());
        }
        Ok(true)
    }
}

#[async_trait::async_trait]
impl CodingJobStore for MemoryStore {
    async fn get_coding_job(&self, workspace_id: WorkspaceId, job_id: JobId) -> Result<Option<CodingJob>> {
        self.check_job_read(job_id)?;
        Ok(self
            .state
            .read()
            .jobs
            .get(&job_id)
            .filter(|j| j.workspace_id == workspace_id)
            .cloned())
    }

    async fn list_coding_jobs(&self, workspace_id: WorkspaceId) -> Result<Vec<CodingJob>> {
        Ok(self
            .state
            .read()
            .jobs
            .values()
            .filter(|j| j.workspace_id == workspace_id)
            .cloned()
            .collect())
    }

    async fn update_job_status(&self, job_id: JobId, status: JobStatus) -> Result<()> {
        let mut state = self.state.write();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| anyhow!("Coding job {} not found", job_id))?;
        job.status = status;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn cancel_coding_job(&self, job_id: JobId) -> Result<bool> {
        let mut state = self.state.write();
        if !state.jobs.get(&job_id).is_some_and(|j| j.status.can_cancel()) {
            return Ok(false);
        }
        state.jobs.remove(&job_id);
        state.units.retain(|u| u.coding_job_id != job_id);
        Ok(true)
    }

    async fn list_job_units(&self, job_id: JobId) -> Result<Vec<CodingJobUnit>> {
        self.check_job_read(job_id)?;
        let state = self.state.read();
        let mut units: Vec<CodingJobUnit> = state
            .units
            .iter()
            .filter(|u| u.coding_job_id == job_id)
            .cloned()
            .collect();
        units.sort_by_key(|u| u.response_id);
        Ok(units)
    }

    async fn save_unit_progress(&self, job_id: JobId, progress: &[UnitProgress]) -> Result<Option<SavedProgress>> {
        let mut state = self.state.write();
        if !state.jobs.get(&job_id).is_some_and(|j| j.status.is_open()) {
            return Ok(None);
        }
        let now = Utc::now();
        let mut touched = 0;
        for entry in progress {
            if let Some(unit) = state.units.iter_mut().find(|u| {
                u.coding_job_id == job_id
                    && u.response_id == entry.response_id
                    && u.variable_id == entry.variable_id
            }) {
                unit.decision = entry.decision;
                unit.score = entry.score;
                unit.notes = entry.notes.clone();
                unit.coded_at = entry.decision.is_decided().then_some(now);
                touched += 1;
            }
        }

        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if job.status == JobStatus::Pending && touched > 0 {
            job.status = JobStatus::Active;
            job.updated_at = now;
        }
        Ok(Some(SavedProgress {
            saved: touched,
            status: job.status,
        }))
    }

    async fn list_coder_units_for_responses(
        &self,
        workspace_id: WorkspaceId,
        response_ids: &[ResponseId],
    ) -> Result<Vec<CoderUnit>> {
        let wanted: HashSet<ResponseId> = response_ids.iter().copied().collect();
        let state = self.state.read();
        Ok(state
            .decided_workspace_units(workspace_id)
            .filter(|u| wanted.contains(&u.response_id))
            .filter_map(|u| state.coder_unit(u))
            .collect())
    }

    async fn list_double_coded_units(&self, workspace_id: WorkspaceId) -> Result<Vec<CoderUnit>> {
        let state = self.state.read();
        let mut jobs_per_response: HashMap<ResponseId, HashSet<JobId>> = HashMap::new();
        for unit in state.decided_workspace_units(workspace_id) {
            jobs_per_response
                .entry(unit.response_id)
                .or_default()
                .insert(unit.coding_job_id);
        }

        let mut units: Vec<CoderUnit> = state
            .decided_workspace_units(workspace_id)
            .filter(|u| jobs_per_response.get(&u.response_id).is_some_and(|jobs| jobs.len() > 1))
            .filter_map(|u| state.coder_unit(u))
            .collect();
        units.sort_by_key(|cu| (cu.unit.response_id, cu.unit.coding_job_id));
        Ok(units)
    }

    async fn apply_job_results(
        &self,
        workspace_id: WorkspaceId,
        job_id: JobId,
        updates: &[ResponseUpdate],
        batch_size: usize,
    ) -> Result<usize> {
        let fail_after = *self.fail_apply_after_batches.lock();
        let mut state = self.state.write();

        match state.jobs.get(&job_id) {
            Some(job) if job.workspace_id == workspace_id && job.status == JobStatus::Completed => {}
            Some(job) => bail!("Coding job {} is {}, expected completed", job_id, job.status),
            None => bail!("Coding job {} not found", job_id),
        }

        // Work on a copy so a failing batch leaves nothing behind
        let mut staged = state.responses.clone();
        let mut updated = 0;
        for (index, batch) in updates.chunks(batch_size.max(1)).enumerate() {
            if fail_after.is_some_and(|limit| index >= limit) {
                bail!("Injected failure in batch {}", index + 1);
            }
            for update in batch {
                if let Some(response) = staged
                    .get_mut(&update.response_id)
                    .filter(|r| r.workspace_id == workspace_id)
                {
                    response.apply_outcome(&update.outcome);
                    updated += 1;
                }
            }
        }

        state.responses = staged;
        if let Some(job) = state.jobs.get_mut(&job_id) {
            job.status = JobStatus::ResultsApplied;
            job.updated_at = Utc::now();
        }
        Ok(updated)
    }
}

#[async_trait::async_trait]
impl AllocationStore for MemoryStore {
    async fn list_allocatable_cases(&self, workspace_id: WorkspaceId, variable: &VariableRef) -> Result<Vec<CaseRef>> {
        let state = self.state.read();
        let held = state.held_responses(workspace_id, variable);
        Ok(state
            .responses
            .values()
            .filter(|r| {
                r.workspace_id == workspace_id
                    && r.unit_name == variable.unit_name
                    && r.variable_id == variable.variable_id
                    && r.needs_coding()
                    && !held.contains(&r.id)
            })
            .map(|r| CaseRef {
                response_id: r.id,
                unit_name: r.unit_name.clone(),
                variable_id: r.variable_id.clone(),
                booklet_id: r.booklet_id.clone(),
                login_name: r.login_name.clone(),
                login_code: r.login_code.clone(),
            })
            .collect())
    }

    async fn commit_allocation(&self, plan: &AllocationPlan) -> Result<Vec<CommittedJob>> {
        {
            let mut forced = self.forced_conflicts.lock();
            if *forced > 0 {
                *forced -= 1;
                return Err(anyhow::Error::new(AllocationConflict {
                    variable: plan.variable.clone(),
                    conflicting_responses: Vec::new(),
                }));
            }
        }

        let mut state = self.state.write();

        let held = state.held_responses(plan.workspace_id, &plan.variable);
        let mut conflicting: Vec<ResponseId> = plan
            .response_ids()
            .into_iter()
            .filter(|id| held.contains(id))
            .collect();
        if !conflicting.is_empty() {
            conflicting.sort_unstable();
            return Err(anyhow::Error::new(AllocationConflict {
                variable: plan.variable.clone(),
                conflicting_responses: conflicting,
            }));
        }

        let now = Utc::now();
        let mut committed = Vec::with_capacity(plan.assignments.len());
        for assignment in &plan.assignments {
            let new_job = &assignment.job;
            state
                .coders
                .entry(new_job.coder_id)
                .or_insert_with(|| new_job.coder_name.clone());

            let reusable = state
                .jobs
                .values()
                .find(|j| {
                    j.workspace_id == plan.workspace_id
                        && j.status.is_open()
                        && j.assigned_coders == [new_job.coder_id]
                        && j.assigned_variables == [plan.variable.clone()]
                })
                .map(|j| j.id);

            let (job_id, reused) = match reusable {
                Some(id) => (id, true),
                None => {
                    state.next_job_id += 1;
                    let id = state.next_job_id;
                    state.jobs.insert(
                        id,
                        CodingJob {
                            id,
                            workspace_id: plan.workspace_id,
                            name: new_job.name.clone(),
                            status: JobStatus::Pending,
                            assigned_coders: vec![new_job.coder_id],
                            assigned_variables: vec![plan.variable.clone()],
                            assigned_variable_bundles: new_job.bundle_id.into_iter().collect(),
                            missings_profile_id: new_job.missings_profile_id,
                            case_ordering_mode: new_job.case_ordering_mode,
                            created_at: now,
                            updated_at: now,
                        },
                    );
                    (id, false)
                }
            };

            for case in &assignment.cases {
                state.next_unit_id += 1;
                let id = state.next_unit_id;
                state.units.push(CodingJobUnit {
                    id,
                    coding_job_id: job_id,
                    response_id: case.response_id,
                    unit_name: case.unit_name.clone(),
                    variable_id: case.variable_id.clone(),
                    booklet_id: case.booklet_id.clone(),
                    login_name: case.login_name.clone(),
                    login_code: case.login_code.clone(),
                    decision: CodingDecision::NoDecision,
                    score: None,
                    notes: None,
                    coded_at: None,
                });
            }

            let job = state
                .jobs
                .get_mut(&job_id)
                .ok_or_else(|| anyhow!("Coding job {} vanished during allocation", job_id))?;
            job.updated_at = now;
            committed.push(CommittedJob {
                job: job.clone(),
                reused,
                units_inserted: assignment.cases.len(),
            });
        }

        Ok(committed)
    }
}

#[async_trait::async_trait]
impl VariableBundleStore for MemoryStore {
    async fn get_variable_bundles(&self, workspace_id: WorkspaceId, ids: &[BundleId]) -> Result<Vec<VariableBundle>> {
        let state = self.state.read();
        Ok(ids
            .iter()
            .filter_map(|id| state.bundles.get(id))
            .filter(|b| b.workspace_id == workspace_id)
            .cloned()
            .collect())
    }
}

impl Store for MemoryStore {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CaseOrderingMode, NewCodingJob, ResponseOutcome};
    use crate::store::traits::JobAssignment;

    fn response(id: ResponseId, variable: &str) -> Response {
        Response {
            id,
            workspace_id: 1,
            unit_name: "UNIT".to_string(),
            login_name: format!("login{}", id),
            login_code: "c".to_string(),
            booklet_id: "B".to_string(),
            variable_id: variable.to_string(),
            value: Some("answer".to_string()),
            status_v1: ResponseStatus::CodingIncomplete,
            status_v2: None,
            code_v2: None,
            score_v2: None,
        }
    }

    fn plan_for(store_cases: Vec<CaseRef>, coder_id: CoderId) -> AllocationPlan {
        let variable = VariableRef::new("UNIT", "v1");
        AllocationPlan {
            workspace_id: 1,
            variable: variable.clone(),
            assignments: vec![JobAssignment {
                job: NewCodingJob {
                    name: format!("job-{}", coder_id),
                    coder_id,
                    coder_name: format!("Coder {}", coder_id),
                    variable,
                    bundle_id: None,
                    missings_profile_id: None,
                    case_ordering_mode: CaseOrderingMode::Continuous,
                },
                cases: store_cases,
            }],
        }
    }

    #[tokio::test]
    async fn test_commit_rejects_already_assigned_cases() {
        let store = MemoryStore::new();
        for id in 1..=3 {
            store.insert_response(response(id, "v1"));
        }
        let variable = VariableRef::new("UNIT", "v1");
        let cases = store.list_allocatable_cases(1, &variable).await.unwrap();
        assert_eq!(cases.len(), 3);

        store.commit_allocation(&plan_for(cases.clone(), 7)).await.unwrap();
        let err = store.commit_allocation(&plan_for(cases, 8)).await.unwrap_err();
        let conflict = err.downcast_ref::<AllocationConflict>().expect("conflict error");
        assert_eq!(conflict.conflicting_responses, vec![1, 2, 3]);

        assert!(store.list_allocatable_cases(1, &variable).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_job_is_reused() {
        let store = MemoryStore::new();
        for id in 1..=4 {
            store.insert_response(response(id, "v1"));
        }
        let variable = VariableRef::new("UNIT", "v1");
        let cases = store.list_allocatable_cases(1, &variable).await.unwrap();

        let first = store.commit_allocation(&plan_for(cases[..2].to_vec(), 7)).await.unwrap();
        let second = store.commit_allocation(&plan_for(cases[2..].to_vec(), 7)).await.unwrap();
        assert!(!first[0].reused);
        assert!(second[0].reused);
        assert_eq!(first[0].job.id, second[0].job.id);
        assert_eq!(store.list_job_units(first[0].job.id).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_applied_incomplete_cases_are_released() {
        let store = MemoryStore::new();
        store.insert_response(response(1, "v1"));
        let variable = VariableRef::new("UNIT", "v1");
        let cases = store.list_allocatable_cases(1, &variable).await.unwrap();
        let committed = store.commit_allocation(&plan_for(cases, 7)).await.unwrap();
        let job_id = committed[0].job.id;

        store.update_job_status(job_id, JobStatus::Completed).await.unwrap();
        let update = ResponseUpdate {
            response_id: 1,
            outcome: ResponseOutcome {
                status: ResponseStatus::CodingIncomplete,
                code: None,
                score: None,
            },
            value: None,
        };
        store.apply_job_results(1, job_id, &[update], 500).await.unwrap();

        let again = store.list_allocatable_cases(1, &variable).await.unwrap();
        assert_eq!(again.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_lookup_surfaces() {
        let store = MemoryStore::new();
        store.fail_lookups(true);
        assert!(store.find_existing_combinations(1, &[]).await.is_err());
    }
}
