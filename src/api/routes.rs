use axum::{
    routing::{get, post, put},
    Router,
};

use crate::api::handlers;
use crate::api::state::AppState;
use crate::store::traits::Store;

pub fn create_router<S: Store + 'static>() -> Router<AppState<S>> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Background tasks
        .route("/tasks/:task_id", get(handlers::task_status::<S>))
        // Completeness validation
        .route(
            "/workspaces/:workspace_id/validation",
            post(handlers::validate_combinations::<S>),
        )
        .route(
            "/workspaces/:workspace_id/validation/tasks",
            post(handlers::validate_combinations_task::<S>),
        )
        .route(
            "/workspaces/:workspace_id/validation/:cache_key",
            get(handlers::get_validation_page::<S>).delete(handlers::delete_validation::<S>),
        )
        .route(
            "/workspaces/:workspace_id/validation/:cache_key/export",
            get(handlers::export_validation::<S>),
        )
        // Allocation
        .route(
            "/workspaces/:workspace_id/coding-jobs/distributed",
            post(handlers::create_distributed_jobs::<S>),
        )
        .route(
            "/workspaces/:workspace_id/coding-jobs/distributed/tasks",
            post(handlers::create_distributed_jobs_task::<S>),
        )
        // Coding jobs
        .route(
            "/workspaces/:workspace_id/coding-jobs",
            get(handlers::list_coding_jobs::<S>),
        )
        .route(
            "/workspaces/:workspace_id/coding-jobs/apply-results",
            post(handlers::apply_all_job_results::<S>),
        )
        .route(
            "/workspaces/:workspace_id/coding-jobs/:job_id/units",
            get(handlers::list_job_units::<S>),
        )
        .route(
            "/workspaces/:workspace_id/coding-jobs/:job_id/progress",
            put(handlers::save_job_progress::<S>),
        )
        .route(
            "/workspaces/:workspace_id/coding-jobs/:job_id/status",
            post(handlers::update_job_status::<S>),
        )
        .route(
            "/workspaces/:workspace_id/coding-jobs/:job_id/cancel",
            post(handlers::cancel_job::<S>),
        )
        .route(
            "/workspaces/:workspace_id/coding-jobs/:job_id/apply-results",
            post(handlers::apply_job_results::<S>),
        )
        // Double coding review and agreement
        .route(
            "/workspaces/:workspace_id/double-coded",
            get(handlers::double_coded_for_review::<S>),
        )
        .route(
            "/workspaces/:workspace_id/double-coded/resolutions",
            post(handlers::apply_resolutions::<S>),
        )
        .route("/workspaces/:workspace_id/kappa", post(handlers::calculate_kappa))
        .route(
            "/workspaces/:workspace_id/kappa/summary",
            get(handlers::kappa_summary::<S>),
        )
        // Statistics
        .route(
            "/workspaces/:workspace_id/statistics",
            get(handlers::coding_statistics::<S>),
        )
        .route(
            "/workspaces/:workspace_id/incomplete-variables",
            get(handlers::incomplete_variables::<S>),
        )
}
