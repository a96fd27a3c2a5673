use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::config::CodingSettings;
use crate::error::{CodingError, Rejection, Result};
use crate::logic::events::{CodingEvent, EventBus};
use crate::logic::tasks::ProgressHandle;
use crate::model::{
    BundleId, CaseOrderingMode, CaseRef, Coder, CoderId, JobId, NewCodingJob, VariableRef,
    WorkspaceId,
};
use crate::store::traits::{AllocationConflict, AllocationPlan, CommittedJob, JobAssignment, Store};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributedJobsRequest {
    #[serde(default)]
    pub selected_variables: Vec<VariableRef>,
    #[serde(default)]
    pub selected_variable_bundles: Vec<BundleId>,
    pub selected_coders: Vec<Coder>,
    pub double_coding_absolute: Option<usize>,
    /// Fraction in `[0, 1]`; values above 1 are read as percent
    pub double_coding_percentage: Option<f64>,
    #[serde(default)]
    pub case_ordering_mode: CaseOrderingMode,
    pub max_coding_cases: Option<usize>,
    pub missings_profile_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoubleCodingInfo {
    pub total_cases: usize,
    pub double_coded_cases: usize,
    pub single_coded_cases_assigned: usize,
    pub double_coded_cases_per_coder: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub job_id: JobId,
    pub job_name: String,
    pub coder_id: CoderId,
    pub coder_name: String,
    pub variable: VariableRef,
    pub case_count: usize,
    pub reused: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributedJobsResult {
    pub success: bool,
    /// Jobs that did not exist before this run
    pub jobs_created: usize,
    /// Variable label → coder label (`name (id)`) → number of cases
    pub distribution: BTreeMap<String, BTreeMap<String, usize>>,
    pub double_coding_info: BTreeMap<String, DoubleCodingInfo>,
    pub jobs: Vec<JobSummary>,
}

/// Variable selected for allocation, with the bundle it came from
#[derive(Debug, Clone, PartialEq)]
struct SelectedVariable {
    variable: VariableRef,
    bundle_id: Option<BundleId>,
}

/// `min(n, max(absolute, round(n * fraction)))`
pub fn double_coding_count(total: usize, absolute: Option<usize>, percentage: Option<f64>) -> usize {
    let fraction = match percentage {
        Some(p) if p > 1.0 => p / 100.0,
        Some(p) => p,
        None => 0.0,
    };
    let by_fraction = (total as f64 * fraction).round() as usize;
    absolute.unwrap_or(0).max(by_fraction).min(total)
}

/// Split `cases` disjointly over `coders` slots
pub fn split_cases(cases: &[CaseRef], coders: usize, mode: CaseOrderingMode) -> Vec<Vec<CaseRef>> {
    let mut shares = vec![Vec::new(); coders];
    if coders == 0 {
        return shares;
    }

    match mode {
        CaseOrderingMode::Alternating => {
            for (i, case) in cases.iter().enumerate() {
                shares[i % coders].push(case.clone());
            }
        }
        CaseOrderingMode::Continuous => {
            let base = cases.len() / coders;
            let extra = cases.len() % coders;
            let mut start = 0;
            for (i, share) in shares.iter_mut().enumerate() {
                let size = base + usize::from(i < extra);
                share.extend_from_slice(&cases[start..start + size]);
                start += size;
            }
        }
    }
    shares
}

fn validate_request(request: &DistributedJobsRequest) -> Result<()> {
    if request.selected_coders.is_empty() {
        return Err(CodingError::InvalidInput(Rejection::new(
            "coding-job.allocation.no-coders",
        )));
    }
    if request.selected_variables.is_empty() && request.selected_variable_bundles.is_empty() {
        return Err(CodingError::InvalidInput(Rejection::new(
            "coding-job.allocation.no-variables",
        )));
    }
    if let Some(p) = request.double_coding_percentage {
        if !p.is_finite() || !(0.0..=100.0).contains(&p) {
            return Err(CodingError::InvalidInput(
                Rejection::new("coding-job.allocation.invalid-percentage").with("percentage", p),
            ));
        }
    }
    Ok(())
}

/// Distributes outstanding cases of the selected variables over coders
pub struct CaseAllocator;

impl CaseAllocator {
    pub async fn create_distributed_jobs<S: Store>(
        store: &S,
        events: &EventBus,
        settings: &CodingSettings,
        workspace_id: WorkspaceId,
        request: &DistributedJobsRequest,
        progress: &ProgressHandle,
    ) -> Result<DistributedJobsResult> {
        validate_request(request)?;

        let mut seen_coders = HashSet::new();
        let coders: Vec<Coder> = request
            .selected_coders
            .iter()
            .filter(|c| seen_coders.insert(c.id))
            .cloned()
            .collect();

        let variables = Self::expand_selection(store, workspace_id, request).await?;
        log::info!(
            "Allocating {} variable(s) to {} coder(s) in workspace {}",
            variables.len(),
            coders.len(),
            workspace_id
        );

        let mut result = DistributedJobsResult {
            success: true,
            ..Default::default()
        };
        let mut job_ids = Vec::new();

        for (index, selected) in variables.iter().enumerate() {
            let outcome = Self::allocate_variable(store, settings, workspace_id, selected, &coders, request).await;
            let (info, committed) = match outcome {
                Ok(done) => done,
                Err(e) => {
                    // Variables committed so far stay allocated
                    if !job_ids.is_empty() {
                        events
                            .publish(CodingEvent::CasesAllocated {
                                workspace_id,
                                job_ids,
                            })
                            .await;
                    }
                    return Err(e);
                }
            };

            let label = selected.variable.label();
            let mut per_coder: BTreeMap<String, usize> =
                coders.iter().map(|c| (c.label(), 0)).collect();
            for (committed_job, coder) in committed {
                *per_coder.entry(coder.label()).or_default() += committed_job.units_inserted;
                if !committed_job.reused {
                    result.jobs_created += 1;
                }
                job_ids.push(committed_job.job.id);
                result.jobs.push(JobSummary {
                    job_id: committed_job.job.id,
                    job_name: committed_job.job.name.clone(),
                    coder_id: coder.id,
                    coder_name: coder.name.clone(),
                    variable: selected.variable.clone(),
                    case_count: committed_job.units_inserted,
                    reused: committed_job.reused,
                });
            }
            result.distribution.insert(label.clone(), per_coder);
            result.double_coding_info.insert(label, info);
            progress.set_fraction(index + 1, variables.len());
        }

        if !job_ids.is_empty() {
            events
                .publish(CodingEvent::CasesAllocated {
                    workspace_id,
                    job_ids,
                })
                .await;
        }

        log::info!(
            "Allocation in workspace {} created {} job(s), {} touched",
            workspace_id,
            result.jobs_created,
            result.jobs.len()
        );
        Ok(result)
    }

    /// Selected variables followed by bundle members, first occurrence wins
    async fn expand_selection<S: Store>(
        store: &S,
        workspace_id: WorkspaceId,
        request: &DistributedJobsRequest,
    ) -> Result<Vec<SelectedVariable>> {
        let mut selected: Vec<SelectedVariable> = request
            .selected_variables
            .iter()
            .map(|v| SelectedVariable {
                variable: v.clone(),
                bundle_id: None,
            })
            .collect();

        if !request.selected_variable_bundles.is_empty() {
            let bundles = store
                .get_variable_bundles(workspace_id, &request.selected_variable_bundles)
                .await?;
            let found: HashSet<BundleId> = bundles.iter().map(|b| b.id).collect();
            let unknown: Vec<BundleId> = request
                .selected_variable_bundles
                .iter()
                .copied()
                .filter(|id| !found.contains(id))
                .collect();
            if !unknown.is_empty() {
                return Err(CodingError::NotFound(
                    Rejection::new("coding-job.allocation.unknown-bundles").with("bundleIds", unknown),
                ));
            }

            for bundle in bundles {
                selected.extend(bundle.variables.into_iter().map(|variable| SelectedVariable {
                    variable,
                    bundle_id: Some(bundle.id),
                }));
            }
        }

        let mut seen = HashSet::new();
        selected.retain(|s| seen.insert(s.variable.clone()));
        Ok(selected)
    }

    /// Plan and commit one variable, recomputing the pool when another run
    /// claimed some of its cases first
    async fn allocate_variable<S: Store>(
        store: &S,
        settings: &CodingSettings,
        workspace_id: WorkspaceId,
        selected: &SelectedVariable,
        coders: &[Coder],
        request: &DistributedJobsRequest,
    ) -> Result<(DoubleCodingInfo, Vec<(CommittedJob, Coder)>)> {
        let attempts = settings.allocation_retries + 1;
        for attempt in 1..=attempts {
            let pool = store.list_allocatable_cases(workspace_id, &selected.variable).await?;
            let (plan, info, plan_coders) = Self::plan(workspace_id, selected, pool, coders, request);

            if plan.assignments.is_empty() {
                log::info!("No outstanding cases for {}", selected.variable.label());
                return Ok((info, Vec::new()));
            }

            match store.commit_allocation(&plan).await {
                Ok(committed) => {
                    log::debug!(
                        "{}: {} cases, {} double coded",
                        selected.variable.label(),
                        info.total_cases,
                        info.double_coded_cases
                    );
                    return Ok((info, committed.into_iter().zip(plan_coders).collect()));
                }
                Err(e) if e.is::<AllocationConflict>() => {
                    log::warn!("Attempt {}/{}: {:#}", attempt, attempts, e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(CodingError::AllocationConflict(
            Rejection::new("coding-job.allocation.conflict")
                .with("variable", selected.variable.label())
                .with("attempts", attempts),
        ))
    }

    /// Build the assignments for one variable. Coders left without cases get no job.
    fn plan(
        workspace_id: WorkspaceId,
        selected: &SelectedVariable,
        mut pool: Vec<CaseRef>,
        coders: &[Coder],
        request: &DistributedJobsRequest,
    ) -> (AllocationPlan, DoubleCodingInfo, Vec<Coder>) {
        pool.sort_by_key(|c| c.response_id);
        if let Some(max) = request.max_coding_cases {
            pool.truncate(max);
        }

        let total = pool.len();
        let double = double_coding_count(total, request.double_coding_absolute, request.double_coding_percentage);
        let (shared, rest) = pool.split_at(double);
        let shares = split_cases(rest, coders.len(), request.case_ordering_mode);

        let mut assignments = Vec::new();
        let mut plan_coders = Vec::new();
        for (coder, share) in coders.iter().zip(shares) {
            let cases: Vec<CaseRef> = shared.iter().cloned().chain(share).collect();
            if cases.is_empty() {
                continue;
            }
            assignments.push(JobAssignment {
                job: NewCodingJob {
                    name: format!("{}_{}", coder.name, selected.variable.label()),
                    coder_id: coder.id,
                    coder_name: coder.name.clone(),
                    variable: selected.variable.clone(),
                    bundle_id: selected.bundle_id,
                    missings_profile_id: request.missings_profile_id,
                    case_ordering_mode: request.case_ordering_mode,
                },
                cases,
            });
            plan_coders.push(coder.clone());
        }

        let info = DoubleCodingInfo {
            total_cases: total,
            double_coded_cases: double,
            single_coded_cases_assigned: total - double,
            double_coded_cases_per_coder: double,
        };
        let plan = AllocationPlan {
            workspace_id,
            variable: selected.variable.clone(),
            assignments,
        };
        (plan, info, plan_coders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Response, ResponseStatus, VariableBundle};
    use crate::store::memory::MemoryStore;
    use std::collections::HashMap;

    fn seed(store: &MemoryStore, variable: &str, ids: std::ops::RangeInclusive<i64>) {
        for id in ids {
            store.insert_response(Response {
                id,
                workspace_id: 1,
                unit_name: "UNIT".to_string(),
                login_name: format!("login{}", id),
                login_code: "c".to_string(),
                booklet_id: "B".to_string(),
                variable_id: variable.to_string(),
                value: Some("text".to_string()),
                status_v1: ResponseStatus::CodingIncomplete,
                status_v2: None,
                code_v2: None,
                score_v2: None,
            });
        }
    }

    fn coders(n: i64) -> Vec<Coder> {
        (1..=n)
            .map(|id| Coder {
                id,
                name: format!("coder{}", id),
            })
            .collect()
    }

    fn request(variables: &[&str], coder_count: i64) -> DistributedJobsRequest {
        DistributedJobsRequest {
            selected_variables: variables.iter().map(|v| VariableRef::new("UNIT", *v)).collect(),
            selected_variable_bundles: Vec::new(),
            selected_coders: coders(coder_count),
            double_coding_absolute: None,
            double_coding_percentage: None,
            case_ordering_mode: CaseOrderingMode::Continuous,
            max_coding_cases: None,
            missings_profile_id: None,
        }
    }

    async fn allocate(store: &MemoryStore, request: &DistributedJobsRequest) -> Result<DistributedJobsResult> {
        CaseAllocator::create_distributed_jobs(
            store,
            &EventBus::new(),
            &CodingSettings::default(),
            1,
            request,
            &ProgressHandle::detached(),
        )
        .await
    }

    fn cases(n: i64) -> Vec<CaseRef> {
        (1..=n)
            .map(|id| CaseRef {
                response_id: id,
                unit_name: "UNIT".to_string(),
                variable_id: "v".to_string(),
                booklet_id: "B".to_string(),
                login_name: String::new(),
                login_code: String::new(),
            })
            .collect()
    }

    #[test]
    fn test_double_coding_count() {
        assert_eq!(double_coding_count(100, None, Some(0.2)), 20);
        assert_eq!(double_coding_count(100, Some(30), Some(0.2)), 30);
        assert_eq!(double_coding_count(100, None, Some(20.0)), 20);
        assert_eq!(double_coding_count(10, Some(50), None), 10);
        assert_eq!(double_coding_count(0, Some(5), Some(0.5)), 0);
        assert_eq!(double_coding_count(7, None, None), 0);
    }

    #[test]
    fn test_continuous_split_gives_extra_to_earlier_coders() {
        let shares = split_cases(&cases(80), 3, CaseOrderingMode::Continuous);
        let sizes: Vec<usize> = shares.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![27, 27, 26]);
        assert_eq!(shares[0][0].response_id, 1);
        assert_eq!(shares[1][0].response_id, 28);
        assert_eq!(shares[2][25].response_id, 80);
    }

    #[test]
    fn test_alternating_split_is_round_robin() {
        let shares = split_cases(&cases(5), 2, CaseOrderingMode::Alternating);
        let ids: Vec<Vec<i64>> = shares
            .iter()
            .map(|s| s.iter().map(|c| c.response_id).collect())
            .collect();
        assert_eq!(ids, vec![vec![1, 3, 5], vec![2, 4]]);
    }

    #[tokio::test]
    async fn test_reference_scenario() {
        let store = MemoryStore::new();
        seed(&store, "v1", 1..=100);
        let mut req = request(&["v1"], 3);
        req.double_coding_percentage = Some(0.2);
        req.case_ordering_mode = CaseOrderingMode::Alternating;

        let result = allocate(&store, &req).await.unwrap();
        assert_eq!(result.jobs_created, 3);

        let info = result.double_coding_info["UNIT_v1"];
        assert_eq!(info.total_cases, 100);
        assert_eq!(info.double_coded_cases, 20);
        assert_eq!(info.single_coded_cases_assigned, 80);

        let units = store.all_units();
        let mut per_response: HashMap<i64, usize> = HashMap::new();
        for unit in &units {
            *per_response.entry(unit.response_id).or_default() += 1;
        }
        let double_units: usize = per_response.values().filter(|n| **n == 3).sum();
        assert_eq!(double_units, 60);
        assert!(per_response.values().all(|n| *n == 1 || *n == 3));

        let singles: Vec<usize> = result
            .jobs
            .iter()
            .map(|job| job.case_count - info.double_coded_cases)
            .collect();
        assert_eq!(singles, vec![27, 27, 26]);
        assert_eq!(result.distribution["UNIT_v1"]["coder1 (1)"], 47);
    }

    #[tokio::test]
    async fn test_coders_sharing_a_name_are_counted_apart() {
        let store = MemoryStore::new();
        seed(&store, "v1", 1..=6);
        let mut req = request(&["v1"], 2);
        for coder in &mut req.selected_coders {
            coder.name = "sam".to_string();
        }

        let result = allocate(&store, &req).await.unwrap();
        let distribution = &result.distribution["UNIT_v1"];
        assert_eq!(distribution.len(), 2);
        assert_eq!(distribution["sam (1)"], 3);
        assert_eq!(distribution["sam (2)"], 3);
    }

    #[tokio::test]
    async fn test_second_run_only_takes_new_cases() {
        let store = MemoryStore::new();
        seed(&store, "v1", 1..=10);
        allocate(&store, &request(&["v1"], 2)).await.unwrap();

        seed(&store, "v1", 11..=14);
        let second = allocate(&store, &request(&["v1"], 2)).await.unwrap();
        assert_eq!(second.jobs_created, 0);
        assert!(second.jobs.iter().all(|j| j.reused));
        assert_eq!(second.double_coding_info["UNIT_v1"].total_cases, 4);

        let mut ids: Vec<i64> = store.all_units().iter().map(|u| u.response_id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (1..=14).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_max_cases_and_empty_pool() {
        let store = MemoryStore::new();
        seed(&store, "v1", 1..=10);
        let mut req = request(&["v1", "empty"], 2);
        req.max_coding_cases = Some(4);

        let result = allocate(&store, &req).await.unwrap();
        assert_eq!(result.double_coding_info["UNIT_v1"].total_cases, 4);
        assert_eq!(result.double_coding_info["UNIT_empty"], DoubleCodingInfo::default());
        assert_eq!(result.distribution["UNIT_empty"]["coder1 (1)"], 0);
        assert_eq!(result.jobs.len(), 2);
        assert!(store.all_units().iter().all(|u| u.response_id <= 4));
    }

    #[tokio::test]
    async fn test_bundles_expand_and_dedupe() {
        let store = MemoryStore::new();
        seed(&store, "v1", 1..=4);
        seed(&store, "v2", 5..=8);
        store.insert_bundle(VariableBundle {
            id: 7,
            workspace_id: 1,
            name: "reading".to_string(),
            variables: vec![VariableRef::new("UNIT", "v1"), VariableRef::new("UNIT", "v2")],
        });
        let mut req = request(&["v1"], 1);
        req.selected_variable_bundles = vec![7];

        let result = allocate(&store, &req).await.unwrap();
        assert_eq!(result.jobs_created, 2);
        assert_eq!(result.distribution.len(), 2);

        req.selected_variable_bundles = vec![99];
        assert!(matches!(allocate(&store, &req).await, Err(CodingError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let store = MemoryStore::new();
        assert!(matches!(
            allocate(&store, &request(&["v1"], 0)).await,
            Err(CodingError::InvalidInput(_))
        ));
        assert!(matches!(
            allocate(&store, &request(&[], 2)).await,
            Err(CodingError::InvalidInput(_))
        ));
        let mut req = request(&["v1"], 2);
        req.double_coding_percentage = Some(-0.5);
        assert!(matches!(allocate(&store, &req).await, Err(CodingError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let store = MemoryStore::new();
        seed(&store, "v1", 1..=6);
        store.force_allocation_conflicts(2);
        let result = allocate(&store, &request(&["v1"], 2)).await.unwrap();
        assert_eq!(result.jobs_created, 2);

        seed(&store, "v1", 7..=8);
        store.force_allocation_conflicts(10);
        let err = allocate(&store, &request(&["v1"], 2)).await.unwrap_err();
        assert!(matches!(err, CodingError::AllocationConflict(_)));
    }
}
