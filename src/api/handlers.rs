use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    Json as RequestJson,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::api::state::AppState;
use crate::error::{CodingError, Rejection};
use crate::logic::{
    ApplyResultsOutcome, BulkApplyReport, CaseAllocator, CodingStatistics, CompletenessValidator,
    DistributedJobsRequest, DistributedJobsResult, DoubleCodedPage, DoubleCodingReconciler,
    JobService, KappaSummary, ProgressHandle, ResolutionDecision, ResolutionReport, ResultsApplier,
    SaveProgressResult, TaskSnapshot, ValidationPage,
};
use crate::model::{
    CoderPairAgreement, CoderPairCodes, CodingJob, CodingJobUnit, ExpectedCombination, JobId,
    JobStatus, UnitProgress, ValidationResultSet, WorkspaceId,
};
use crate::store::traits::{IncompleteVariable, Store};

const DEFAULT_PAGE_SIZE: usize = 50;

pub type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// Error body: a message key plus the parameters to render it
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub params: BTreeMap<String, Value>,
}

impl From<Rejection> for ErrorResponse {
    fn from(rejection: Rejection) -> Self {
        Self {
            error: rejection.key,
            params: rejection.params,
        }
    }
}

pub fn error_response(err: CodingError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &err {
        CodingError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        CodingError::NotFound(_) => StatusCode::NOT_FOUND,
        CodingError::Precondition(_) | CodingError::AllocationConflict(_) => StatusCode::CONFLICT,
        CodingError::Validation(_) | CodingError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        log::error!("Request failed: {}", err);
    } else {
        log::debug!("Request rejected: {}", err);
    }
    (status, Json(err.rejection().into()))
}

fn not_found(key: &str, name: &str, value: impl Into<Value>) -> (StatusCode, Json<ErrorResponse>) {
    error_response(CodingError::NotFound(Rejection::new(key).with(name, value)))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAccepted {
    pub task_id: String,
}

pub async fn task_status<S: Store + 'static>(
    State(state): State<AppState<S>>,
    Path(task_id): Path<String>,
) -> ApiResult<TaskSnapshot> {
    match state.tasks.status(&task_id) {
        Some(snapshot) => Ok(Json(snapshot)),
        None => Err(not_found("task.not-found", "taskId", task_id)),
    }
}

// Completeness validation

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRequest {
    pub expected_combinations: Vec<ExpectedCombination>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageQuery {
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

pub async fn validate_combinations<S: Store + 'static>(
    State(state): State<AppState<S>>,
    Path(workspace_id): Path<WorkspaceId>,
    RequestJson(request): RequestJson<ValidationRequest>,
) -> ApiResult<ValidationPage> {
    let validator = CompletenessValidator::new(&*state.store, &state.cache, &state.settings, &state.cache_config);
    validator
        .validate(
            workspace_id,
            &request.expected_combinations,
            request.page.unwrap_or(1),
            request.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
            &ProgressHandle::detached(),
        )
        .await
        .map(Json)
        .map_err(error_response)
}

/// Run the validation in the background; the first page is the task result
pub async fn validate_combinations_task<S: Store + 'static>(
    State(state): State<AppState<S>>,
    Path(workspace_id): Path<WorkspaceId>,
    RequestJson(request): RequestJson<ValidationRequest>,
) -> Result<(StatusCode, Json<TaskAccepted>), (StatusCode, Json<ErrorResponse>)> {
    let task_state = state.clone();
    let task_id = state.tasks.submit("validation", move |progress| async move {
        let validator = CompletenessValidator::new(
            &*task_state.store,
            &task_state.cache,
            &task_state.settings,
            &task_state.cache_config,
        );
        validator
            .validate(
                workspace_id,
                &request.expected_combinations,
                request.page.unwrap_or(1),
                request.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
                &progress,
            )
            .await
    });
    Ok((StatusCode::ACCEPTED, Json(TaskAccepted { task_id })))
}

pub async fn get_validation_page<S: Store + 'static>(
    State(state): State<AppState<S>>,
    Path((workspace_id, cache_key)): Path<(WorkspaceId, String)>,
    Query(query): Query<PageQuery>,
) -> ApiResult<ValidationPage> {
    let validator = CompletenessValidator::new(&*state.store, &state.cache, &state.settings, &state.cache_config);
    let page = validator
        .cached_page(
            workspace_id,
            &cache_key,
            query.page.unwrap_or(1),
            query.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
        )
        .await
        .map_err(error_response)?;
    page.map(Json)
        .ok_or_else(|| not_found("validation.not-cached", "cacheKey", cache_key))
}

pub async fn export_validation<S: Store + 'static>(
    State(state): State<AppState<S>>,
    Path((workspace_id, cache_key)): Path<(WorkspaceId, String)>,
) -> ApiResult<ValidationResultSet> {
    let validator = CompletenessValidator::new(&*state.store, &state.cache, &state.settings, &state.cache_config);
    let set = validator
        .export_all(workspace_id, &cache_key)
        .await
        .map_err(error_response)?;
    set.map(Json)
        .ok_or_else(|| not_found("validation.not-cached", "cacheKey", cache_key))
}

#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub deleted: bool,
}

pub async fn delete_validation<S: Store + 'static>(
    State(state): State<AppState<S>>,
    Path((workspace_id, cache_key)): Path<(WorkspaceId, String)>,
) -> ApiResult<DeletedResponse> {
    let validator = CompletenessValidator::new(&*state.store, &state.cache, &state.settings, &state.cache_config);
    validator
        .invalidate(workspace_id, &cache_key)
        .await
        .map(|deleted| Json(DeletedResponse { deleted }))
        .map_err(error_response)
}

// Allocation

pub async fn create_distributed_jobs<S: Store + 'static>(
    State(state): State<AppState<S>>,
    Path(workspace_id): Path<WorkspaceId>,
    RequestJson(request): RequestJson<DistributedJobsRequest>,
) -> ApiResult<DistributedJobsResult> {
    CaseAllocator::create_distributed_jobs(
        &*state.store,
        &state.events,
        &state.settings,
        workspace_id,
        &request,
        &ProgressHandle::detached(),
    )
    .await
    .map(Json)
    .map_err(error_response)
}

pub async fn create_distributed_jobs_task<S: Store + 'static>(
    State(state): State<AppState<S>>,
    Path(workspace_id): Path<WorkspaceId>,
    RequestJson(request): RequestJson<DistributedJobsRequest>,
) -> Result<(StatusCode, Json<TaskAccepted>), (StatusCode, Json<ErrorResponse>)> {
    let task_state = state.clone();
    let task_id = state.tasks.submit("allocation", move |progress| async move {
        CaseAllocator::create_distributed_jobs(
            &*task_state.store,
            &task_state.events,
            &task_state.settings,
            workspace_id,
            &request,
            &progress,
        )
        .await
    });
    Ok((StatusCode::ACCEPTED, Json(TaskAccepted { task_id })))
}

// Coding jobs

pub async fn list_coding_jobs<S: Store + 'static>(
    State(state): State<AppState<S>>,
    Path(workspace_id): Path<WorkspaceId>,
) -> ApiResult<Vec<CodingJob>> {
    JobService::list(&*state.store, workspace_id)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn list_job_units<S: Store + 'static>(
    State(state): State<AppState<S>>,
    Path((workspace_id, job_id)): Path<(WorkspaceId, JobId)>,
) -> ApiResult<Vec<CodingJobUnit>> {
    JobService::units(&*state.store, workspace_id, job_id)
        .await
        .map(Json)
        .map_err(error_response)
}

#[derive(Debug, Deserialize)]
pub struct SaveProgressRequest {
    pub units: Vec<UnitProgress>,
}

pub async fn save_job_progress<S: Store + 'static>(
    State(state): State<AppState<S>>,
    Path((workspace_id, job_id)): Path<(WorkspaceId, JobId)>,
    RequestJson(request): RequestJson<SaveProgressRequest>,
) -> ApiResult<SaveProgressResult> {
    JobService::save_progress(&*state.store, &state.events, workspace_id, job_id, &request.units)
        .await
        .map(Json)
        .map_err(error_response)
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: JobStatus,
}

pub async fn update_job_status<S: Store + 'static>(
    State(state): State<AppState<S>>,
    Path((workspace_id, job_id)): Path<(WorkspaceId, JobId)>,
    RequestJson(request): RequestJson<StatusRequest>,
) -> ApiResult<CodingJob> {
    JobService::transition(&*state.store, &state.events, workspace_id, job_id, request.status)
        .await
        .map(Json)
        .map_err(error_response)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub success: bool,
    pub job_id: JobId,
}

pub async fn cancel_job<S: Store + 'static>(
    State(state): State<AppState<S>>,
    Path((workspace_id, job_id)): Path<(WorkspaceId, JobId)>,
) -> ApiResult<CancelResponse> {
    JobService::cancel(&*state.store, &state.events, workspace_id, job_id)
        .await
        .map(|()| Json(CancelResponse { success: true, job_id }))
        .map_err(error_response)
}

pub async fn apply_job_results<S: Store + 'static>(
    State(state): State<AppState<S>>,
    Path((workspace_id, job_id)): Path<(WorkspaceId, JobId)>,
) -> ApiResult<ApplyResultsOutcome> {
    ResultsApplier::apply(&*state.store, &state.events, &state.settings, workspace_id, job_id)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn apply_all_job_results<S: Store + 'static>(
    State(state): State<AppState<S>>,
    Path(workspace_id): Path<WorkspaceId>,
) -> ApiResult<BulkApplyReport> {
    ResultsApplier::apply_all(&*state.store, &state.events, &state.settings, workspace_id)
        .await
        .map(Json)
        .map_err(error_response)
}

// Double coding

#[derive(Debug, Deserialize)]
pub struct ReviewQuery {
    pub page: Option<usize>,
    pub limit: Option<usize>,
}

pub async fn double_coded_for_review<S: Store + 'static>(
    State(state): State<AppState<S>>,
    Path(workspace_id): Path<WorkspaceId>,
    Query(query): Query<ReviewQuery>,
) -> ApiResult<DoubleCodedPage> {
    DoubleCodingReconciler::double_coded_for_review(
        &*state.store,
        workspace_id,
        query.page.unwrap_or(1),
        query.limit.unwrap_or(DEFAULT_PAGE_SIZE),
    )
    .await
    .map(Json)
    .map_err(error_response)
}

#[derive(Debug, Deserialize)]
pub struct ResolutionsRequest {
    pub decisions: Vec<ResolutionDecision>,
}

pub async fn apply_resolutions<S: Store + 'static>(
    State(state): State<AppState<S>>,
    Path(workspace_id): Path<WorkspaceId>,
    RequestJson(request): RequestJson<ResolutionsRequest>,
) -> ApiResult<ResolutionReport> {
    DoubleCodingReconciler::apply_resolutions(&*state.store, &state.events, workspace_id, &request.decisions)
        .await
        .map(Json)
        .map_err(error_response)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KappaRequest {
    pub coder_pairs: Vec<CoderPairCodes>,
}

#[derive(Debug, Serialize)]
pub struct KappaResponse {
    pub results: Vec<CoderPairAgreement>,
}

/// Stateless; the workspace only scopes the route
pub async fn calculate_kappa(
    Path(_workspace_id): Path<WorkspaceId>,
    RequestJson(request): RequestJson<KappaRequest>,
) -> Json<KappaResponse> {
    Json(KappaResponse {
        results: DoubleCodingReconciler::calculate_cohens_kappa(&request.coder_pairs),
    })
}

pub async fn kappa_summary<S: Store + 'static>(
    State(state): State<AppState<S>>,
    Path(workspace_id): Path<WorkspaceId>,
) -> ApiResult<KappaSummary> {
    DoubleCodingReconciler::workspace_kappa_summary(&*state.store, &state.cache, &state.cache_config, workspace_id)
        .await
        .map(Json)
        .map_err(error_response)
}

// Statistics

pub async fn coding_statistics<S: Store + 'static>(
    State(state): State<AppState<S>>,
    Path(workspace_id): Path<WorkspaceId>,
) -> ApiResult<CodingStatistics> {
    state
        .statistics
        .coding_statistics(&*state.store, workspace_id)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn incomplete_variables<S: Store + 'static>(
    State(state): State<AppState<S>>,
    Path(workspace_id): Path<WorkspaceId>,
) -> ApiResult<Vec<IncompleteVariable>> {
    state
        .statistics
        .incomplete_variables(&*state.store, workspace_id)
        .await
        .map(Json)
        .map_err(error_response)
}
