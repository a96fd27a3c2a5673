use chrono::{DateTime, SecondsFormat, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::config::CacheConfig;
use crate::error::{CodingError, Rejection, Result};
use crate::logic::events::{CodingEvent, EventBus};
use crate::logic::kappa::{average_kappa, pair_agreement};
use crate::logic::statistics::STATISTICS_NAMESPACE;
use crate::model::{
    CodePair, CoderId, CoderPairAgreement, CoderPairCodes, CoderUnit, CodingDecision, CodingJobUnit,
    JobId, PageInfo, ResponseId, ResponseUpdate, WorkspaceId,
};
use crate::store::cache::CacheFacade;
use crate::store::traits::Store;

/// What one coder decided for a double-coded response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoderResult {
    pub coder_id: CoderId,
    pub coder_name: String,
    pub job_id: JobId,
    pub job_name: String,
    pub decision: CodingDecision,
    pub code: Option<i32>,
    pub score: Option<i32>,
    pub notes: Option<String>,
    pub coded_at: Option<DateTime<Utc>>,
}

impl From<&CoderUnit> for CoderResult {
    fn from(cu: &CoderUnit) -> Self {
        Self {
            coder_id: cu.coder_id,
            coder_name: cu.coder_name.clone(),
            job_id: cu.unit.coding_job_id,
            job_name: cu.job_name.clone(),
            decision: cu.unit.decision,
            code: cu.unit.decision.code(),
            score: cu.unit.score,
            notes: cu.unit.notes.clone(),
            coded_at: cu.unit.coded_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoubleCodedItem {
    pub response_id: ResponseId,
    pub unit_name: String,
    pub variable_id: String,
    pub booklet_id: String,
    pub login_name: String,
    pub login_code: String,
    pub given_answer: Option<String>,
    pub coder_results: Vec<CoderResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoubleCodedPage {
    pub data: Vec<DoubleCodedItem>,
    pub total: usize,
    pub pagination: PageInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionDecision {
    pub response_id: ResponseId,
    pub selected_job_id: JobId,
    pub resolution_comment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    Applied,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionItem {
    pub response_id: ResponseId,
    pub selected_job_id: JobId,
    pub status: ResolutionStatus,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionReport {
    pub success: bool,
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
    pub items: Vec<ResolutionItem>,
}

impl ResolutionReport {
    fn record(&mut self, decision: &ResolutionDecision, status: ResolutionStatus, reason: Option<&str>) {
        match status {
            ResolutionStatus::Applied => self.applied += 1,
            ResolutionStatus::Skipped => self.skipped += 1,
            ResolutionStatus::Failed => self.failed += 1,
        }
        self.items.push(ResolutionItem {
            response_id: decision.response_id,
            selected_job_id: decision.selected_job_id,
            status,
            reason: reason.map(str::to_string),
        });
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KappaSummary {
    pub coder_pairs: Vec<CoderPairAgreement>,
    pub average_kappa: Option<f64>,
    pub total_double_coded_responses: usize,
    pub total_coder_pairs: usize,
    pub unique_variables: usize,
    pub unique_coders: usize,
}

/// Units of a job, or `None` if the job is not part of the workspace
async fn selected_job_units<S: Store>(
    store: &S,
    workspace_id: WorkspaceId,
    job_id: JobId,
) -> anyhow::Result<Option<Vec<CodingJobUnit>>> {
    if store.get_coding_job(workspace_id, job_id).await?.is_none() {
        return Ok(None);
    }
    Ok(Some(store.list_job_units(job_id).await?))
}

/// Prefix a resolution note to the response value
pub fn annotate_value(original: Option<&str>, comment: &str, at: DateTime<Utc>) -> String {
    let note = format!(
        "[{}] Resolution: {}",
        at.to_rfc3339_opts(SecondsFormat::Secs, true),
        comment
    );
    match original {
        Some(value) if !value.is_empty() => format!("{}\n{}", note, value),
        _ => note,
    }
}

/// Units of the same response in response order
fn group_by_response(units: Vec<CoderUnit>) -> Vec<(ResponseId, Vec<CoderUnit>)> {
    let mut groups = Vec::new();
    for (response_id, group) in &units
        .into_iter()
        .sorted_by_key(|cu| (cu.unit.response_id, cu.unit.coding_job_id))
        .chunk_by(|cu| cu.unit.response_id)
    {
        groups.push((response_id, group.collect()));
    }
    groups
}

/// Codes of every pair of coders that decided the same responses
fn coder_pair_codes(groups: &[(ResponseId, Vec<CoderUnit>)]) -> Vec<CoderPairCodes> {
    let mut pairs: BTreeMap<(CoderId, CoderId), CoderPairCodes> = BTreeMap::new();
    for (_, units) in groups {
        let coders: Vec<&CoderUnit> = units
            .iter()
            .sorted_by_key(|cu| cu.coder_id)
            .dedup_by(|a, b| a.coder_id == b.coder_id)
            .collect();
        for (first, second) in coders.into_iter().tuple_combinations() {
            pairs
                .entry((first.coder_id, second.coder_id))
                .or_insert_with(|| CoderPairCodes {
                    coder1_id: first.coder_id,
                    coder1_name: first.coder_name.clone(),
                    coder2_id: second.coder_id,
                    coder2_name: second.coder_name.clone(),
                    codes: Vec::new(),
                })
                .codes
                .push(CodePair {
                    code1: first.unit.decision.code(),
                    code2: second.unit.decision.code(),
                });
        }
    }
    pairs.into_values().collect()
}

/// Review and agreement over responses coded by more than one job
pub struct DoubleCodingReconciler;

impl DoubleCodingReconciler {
    pub async fn double_coded_for_review<S: Store>(
        store: &S,
        workspace_id: WorkspaceId,
        page: usize,
        limit: usize,
    ) -> Result<DoubleCodedPage> {
        if limit == 0 {
            return Err(CodingError::InvalidInput(
                Rejection::new("double-coded.invalid-limit").with("limit", limit),
            ));
        }

        let groups = group_by_response(store.list_double_coded_units(workspace_id).await?);
        let total = groups.len();
        let pagination = PageInfo::new(total, page, limit);
        let page_groups = &groups[pagination.range(total)];

        let ids: Vec<ResponseId> = page_groups.iter().map(|(id, _)| *id).collect();
        let responses: HashMap<ResponseId, _> = store
            .get_responses(workspace_id, &ids)
            .await?
            .into_iter()
            .map(|r| (r.id, r))
            .collect();

        let data = page_groups
            .iter()
            .filter_map(|(response_id, units)| {
                let Some(response) = responses.get(response_id) else {
                    log::warn!("Double-coded response {} has no response record", response_id);
                    return None;
                };
                Some(DoubleCodedItem {
                    response_id: *response_id,
                    unit_name: response.unit_name.clone(),
                    variable_id: response.variable_id.clone(),
                    booklet_id: response.booklet_id.clone(),
                    login_name: response.login_name.clone(),
                    login_code: response.login_code.clone(),
                    given_answer: response.value.clone(),
                    coder_results: units.iter().map(CoderResult::from).collect(),
                })
            })
            .collect();

        Ok(DoubleCodedPage {
            data,
            total,
            pagination,
        })
    }

    /// Copy the chosen coder's decision into each response
    pub async fn apply_resolutions<S: Store>(
        store: &S,
        events: &EventBus,
        workspace_id: WorkspaceId,
        decisions: &[ResolutionDecision],
    ) -> Result<ResolutionReport> {
        let mut report = ResolutionReport::default();
        let mut job_units: HashMap<JobId, Option<Vec<CodingJobUnit>>> = HashMap::new();

        for decision in decisions {
            if !job_units.contains_key(&decision.selected_job_id) {
                match selected_job_units(store, workspace_id, decision.selected_job_id).await {
                    Ok(units) => {
                        job_units.insert(decision.selected_job_id, units);
                    }
                    Err(e) => {
                        log::warn!("Reading coding job {} failed: {:#}", decision.selected_job_id, e);
                        report.record(decision, ResolutionStatus::Failed, Some("store-error"));
                        continue;
                    }
                }
            }

            let Some(units) = job_units.get(&decision.selected_job_id).and_then(Option::as_ref) else {
                report.record(decision, ResolutionStatus::Skipped, Some("job-not-in-workspace"));
                continue;
            };
            let Some(unit) = units.iter().find(|u| u.response_id == decision.response_id) else {
                report.record(decision, ResolutionStatus::Skipped, Some("response-not-in-job"));
                continue;
            };

            let comment = decision
                .resolution_comment
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty());
            let value = match comment {
                Some(comment) => match store.get_responses(workspace_id, &[decision.response_id]).await {
                    Ok(original) => {
                        let original = original.first().and_then(|r| r.value.as_deref());
                        Some(annotate_value(original, comment, Utc::now()))
                    }
                    Err(e) => {
                        log::warn!("Reading response {} failed: {:#}", decision.response_id, e);
                        report.record(decision, ResolutionStatus::Failed, Some("store-error"));
                        continue;
                    }
                },
                None => None,
            };

            let update = ResponseUpdate {
                response_id: decision.response_id,
                outcome: unit.decision.outcome(unit.score),
                value,
            };
            match store.apply_resolution(workspace_id, &update).await {
                Ok(true) => report.record(decision, ResolutionStatus::Applied, None),
                Ok(false) => report.record(decision, ResolutionStatus::Skipped, Some("response-not-found")),
                Err(e) => {
                    log::warn!("Resolution for response {} failed: {:#}", decision.response_id, e);
                    report.record(decision, ResolutionStatus::Failed, Some("store-error"));
                }
            }
        }

        report.success = report.failed == 0;
        log::info!(
            "Resolutions in workspace {}: {} applied, {} skipped, {} failed",
            workspace_id,
            report.applied,
            report.skipped,
            report.failed
        );

        if report.applied > 0 {
            events
                .publish(CodingEvent::ResolutionsApplied {
                    workspace_id,
                    responses: report.applied,
                })
                .await;
        }
        Ok(report)
    }

    pub fn calculate_cohens_kappa(pairs: &[CoderPairCodes]) -> Vec<CoderPairAgreement> {
        pairs.iter().map(pair_agreement).collect()
    }

    /// Agreement over every coder pair of the workspace, cached until the next coding event
    pub async fn workspace_kappa_summary<S: Store>(
        store: &S,
        cache: &CacheFacade,
        cache_config: &CacheConfig,
        workspace_id: WorkspaceId,
    ) -> Result<KappaSummary> {
        let key = CacheFacade::generate_key(STATISTICS_NAMESPACE, workspace_id, "kappa-summary");
        match cache.get::<KappaSummary>(&key).await {
            Ok(Some(summary)) => return Ok(summary),
            Ok(None) => {}
            Err(e) => log::warn!("Ignoring unreadable kappa summary {}: {:#}", key, e),
        }

        let groups = group_by_response(store.list_double_coded_units(workspace_id).await?);
        let coder_pairs = Self::calculate_cohens_kappa(&coder_pair_codes(&groups));

        let units = groups.iter().flat_map(|(_, units)| units.iter());
        let unique_variables = units
            .clone()
            .map(|cu| (cu.unit.unit_name.as_str(), cu.unit.variable_id.as_str()))
            .collect::<HashSet<_>>()
            .len();
        let unique_coders = units.map(|cu| cu.coder_id).collect::<HashSet<_>>().len();

        let summary = KappaSummary {
            average_kappa: average_kappa(&coder_pairs),
            total_double_coded_responses: groups.len(),
            total_coder_pairs: coder_pairs.len(),
            unique_variables,
            unique_coders,
            coder_pairs,
        };

        if let Err(e) = cache.set(&key, &summary, cache_config.statistics_ttl_seconds).await {
            log::warn!("Failed to cache kappa summary {}: {:#}", key, e);
        }
        Ok(summary)
    }
}
