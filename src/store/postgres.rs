use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::collections::HashSet;

use crate::model::{
    BundleId, CaseOrderingMode, CaseRef, CoderUnit, CodingDecision, CodingJob, CodingJobUnit,
    ExpectedCombination, JobId, JobStatus, Response, ResponseId, ResponseStatus, ResponseUpdate,
    UnitProgress, VariableBundle, VariableRef, WorkspaceId,
};
use crate::store::traits::{
    AllocationConflict, AllocationPlan, AllocationStore, CodingJobStore, CommittedJob,
    IncompleteVariable, ResponseStore, SavedProgress, Store, VariableBundleStore,
};

const JOB_COLUMNS: &str = "id, workspace_id, name, status, assigned_coders, assigned_variables, \
     assigned_variable_bundles, missings_profile_id, case_ordering_mode, created_at, updated_at";

const UNIT_COLUMNS: &str = "u.id, u.coding_job_id, u.response_id, u.unit_name, u.variable_id, \
     u.booklet_id, u.login_name, u.login_code, u.code, u.score, u.notes, u.coded_at";

const RESPONSE_COLUMNS: &str = "id, workspace_id, unit_name, login_name, login_code, booklet_id, \
     variable_id, value, status_v1, status_v2, code_v2, score_v2";

/// Response `r` still waits for a coder
const NEEDS_CODING: &str =
    "r.status_v1 = 'CODING_INCOMPLETE' AND (r.status_v2 IS NULL OR r.status_v2 = 'CODING_INCOMPLETE')";

/// Response `r` is held by a job for its variable. Applied jobs only release
/// responses they left incomplete.
const HELD_BY_JOB: &str = "EXISTS (
    SELECT 1 FROM coding_job_units hu
    JOIN coding_jobs hj ON hj.id = hu.coding_job_id
    WHERE hj.workspace_id = r.workspace_id
      AND hu.response_id = r.id
      AND hu.unit_name = r.unit_name
      AND hu.variable_id = r.variable_id
      AND (hj.status <> 'results_applied' OR r.status_v2 IS DISTINCT FROM 'CODING_INCOMPLETE')
)";

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given database URL
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn try_commit_allocation(&self, plan: &AllocationPlan) -> Result<Vec<CommittedJob>> {
        let mut tx = self.pool.begin().await.context("Failed to begin allocation transaction")?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .context("Failed to set isolation level")?;

        let planned: Vec<ResponseId> = plan.response_ids().into_iter().collect();
        let conflicting: Vec<ResponseId> = sqlx::query(&format!(
            "SELECT r.id FROM responses r WHERE r.workspace_id = $1 AND r.id = ANY($2) AND {} ORDER BY r.id",
            HELD_BY_JOB
        ))
        .bind(plan.workspace_id)
        .bind(&planned)
        .fetch_all(&mut *tx)
        .await
        .context("Failed to check planned cases")?
        .iter()
        .map(|row| row.try_get::<i64, _>("id"))
        .collect::<Result<_, _>>()?;

        if !conflicting.is_empty() {
            return Err(anyhow::Error::new(AllocationConflict {
                variable: plan.variable.clone(),
                conflicting_responses: conflicting,
            }));
        }

        let variables = Json(vec![plan.variable.clone()]);
        let mut committed = Vec::with_capacity(plan.assignments.len());
        for assignment in &plan.assignments {
            let new_job = &assignment.job;

            sqlx::query("INSERT INTO coders (id, name) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING")
                .bind(new_job.coder_id)
                .bind(&new_job.coder_name)
                .execute(&mut *tx)
                .await
                .context("Failed to register coder")?;

            let existing = sqlx::query(&format!(
                "SELECT {} FROM coding_jobs
                 WHERE workspace_id = $1 AND assigned_coders = $2 AND assigned_variables = $3
                   AND status IN ('pending', 'active', 'paused')
                 ORDER BY id LIMIT 1",
                JOB_COLUMNS
            ))
            .bind(plan.workspace_id)
            .bind(vec![new_job.coder_id])
            .bind(&variables)
            .fetch_optional(&mut *tx)
            .await
            .context("Failed to look up reusable job")?;

            let (job, reused) = match existing {
                Some(row) => (job_from_row(&row)?, true),
                None => {
                    let bundles: Vec<BundleId> = new_job.bundle_id.into_iter().collect();
                    let row = sqlx::query(&format!(
                        "INSERT INTO coding_jobs (workspace_id, name, status, assigned_coders, assigned_variables,
                             assigned_variable_bundles, missings_profile_id, case_ordering_mode)
                         VALUES ($1, $2, 'pending', $3, $4, $5, $6, $7)
                         RETURNING {}",
                        JOB_COLUMNS
                    ))
                    .bind(plan.workspace_id)
                    .bind(&new_job.name)
                    .bind(vec![new_job.coder_id])
                    .bind(&variables)
                    .bind(bundles)
                    .bind(new_job.missings_profile_id)
                    .bind(new_job.case_ordering_mode.as_str())
                    .fetch_one(&mut *tx)
                    .await
                    .context("Failed to create coding job")?;
                    (job_from_row(&row)?, false)
                }
            };

            let cases = &assignment.cases;
            let inserted = sqlx::query(
                "INSERT INTO coding_job_units
                     (coding_job_id, response_id, unit_name, variable_id, booklet_id, login_name, login_code)
                 SELECT $1::bigint, d.response_id, d.unit_name, d.variable_id, d.booklet_id, d.login_name, d.login_code
                 FROM UNNEST($2::bigint[], $3::text[], $4::text[], $5::text[], $6::text[], $7::text[])
                     AS d(response_id, unit_name, variable_id, booklet_id, login_name, login_code)",
            )
            .bind(job.id)
            .bind(cases.iter().map(|c| c.response_id).collect::<Vec<_>>())
            .bind(cases.iter().map(|c| c.unit_name.clone()).collect::<Vec<_>>())
            .bind(cases.iter().map(|c| c.variable_id.clone()).collect::<Vec<_>>())
            .bind(cases.iter().map(|c| c.booklet_id.clone()).collect::<Vec<_>>())
            .bind(cases.iter().map(|c| c.login_name.clone()).collect::<Vec<_>>())
            .bind(cases.iter().map(|c| c.login_code.clone()).collect::<Vec<_>>())
            .execute(&mut *tx)
            .await
            .context("Failed to insert coding job units")?;

            sqlx::query("UPDATE coding_jobs SET updated_at = NOW() WHERE id = $1")
                .bind(job.id)
                .execute(&mut *tx)
                .await
                .context("Failed to touch coding job")?;

            committed.push(CommittedJob {
                job,
                reused,
                units_inserted: inserted.rows_affected() as usize,
            });
        }

        tx.commit().await.context("Failed to commit allocation")?;
        Ok(committed)
    }
}

fn is_serialization_failure(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("40001"),
        _ => false,
    }
}

fn parse_response_status(value: &str) -> Result<ResponseStatus> {
    ResponseStatus::parse(value).ok_or_else(|| anyhow!("Unknown response status '{}'", value))
}

fn job_from_row(row: &PgRow) -> Result<CodingJob> {
    let status: String = row.try_get("status")?;
    let ordering: String = row.try_get("case_ordering_mode")?;
    let variables: Json<Vec<VariableRef>> = row.try_get("assigned_variables")?;

    Ok(CodingJob {
        id: row.try_get("id")?,
        workspace_id: row.try_get("workspace_id")?,
        name: row.try_get("name")?,
        status: JobStatus::parse(&status).ok_or_else(|| anyhow!("Unknown job status '{}'", status))?,
        assigned_coders: row.try_get("assigned_coders")?,
        assigned_variables: variables.0,
        assigned_variable_bundles: row.try_get("assigned_variable_bundles")?,
        missings_profile_id: row.try_get("missings_profile_id")?,
        case_ordering_mode: CaseOrderingMode::parse(&ordering).unwrap_or_default(),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn unit_from_row(row: &PgRow) -> Result<CodingJobUnit> {
    Ok(CodingJobUnit {
        id: row.try_get("id")?,
        coding_job_id: row.try_get("coding_job_id")?,
        response_id: row.try_get("response_id")?,
        unit_name: row.try_get("unit_name")?,
        variable_id: row.try_get("variable_id")?,
        booklet_id: row.try_get("booklet_id")?,
        login_name: row.try_get("login_name")?,
        login_code: row.try_get("login_code")?,
        decision: CodingDecision::from_raw(row.try_get("code")?),
        score: row.try_get("score")?,
        notes: row.try_get("notes")?,
        coded_at: row.try_get("coded_at")?,
    })
}

fn coder_unit_from_row(row: &PgRow) -> Result<CoderUnit> {
    Ok(CoderUnit {
        unit: unit_from_row(row)?,
        coder_id: row.try_get("coder_id")?,
        coder_name: row.try_get("coder_name")?,
        job_name: row.try_get("job_name")?,
    })
}

fn response_from_row(row: &PgRow) -> Result<Response> {
    let status_v1: String = row.try_get("status_v1")?;
    let status_v2: Option<String> = row.try_get("status_v2")?;
    Ok(Response {
        id: row.try_get("id")?,
        workspace_id: row.try_get("workspace_id")?,
        unit_name: row.try_get("unit_name")?,
        login_name: row.try_get("login_name")?,
        login_code: row.try_get("login_code")?,
        booklet_id: row.try_get("booklet_id")?,
        variable_id: row.try_get("variable_id")?,
        value: row.try_get("value")?,
        status_v1: parse_response_status(&status_v1)?,
        status_v2: status_v2.as_deref().map(parse_response_status).transpose()?,
        code_v2: row.try_get("code_v2")?,
        score_v2: row.try_get("score_v2")?,
    })
}

fn coder_units_query(filter: &str) -> String {
    format!(
        "SELECT {units}, j.name AS job_name, j.assigned_coders[1] AS coder_id,
                COALESCE(c.name, 'coder-' || j.assigned_coders[1]::text) AS coder_name
         FROM coding_job_units u
         JOIN coding_jobs j ON j.id = u.coding_job_id
         LEFT JOIN coders c ON c.id = j.assigned_coders[1]
         WHERE j.workspace_id = $1 AND u.code IS NOT NULL AND cardinality(j.assigned_coders) > 0 AND {filter}
         ORDER BY u.response_id, u.coding_job_id",
        units = UNIT_COLUMNS,
        filter = filter
    )
}

#[async_trait::async_trait]
impl ResponseStore for PostgresStore {
    async fn find_existing_combinations(
        &self,
        workspace_id: WorkspaceId,
        combinations: &[ExpectedCombination],
    ) -> Result<HashSet<ExpectedCombination>> {
        if combinations.is_empty() {
            return Ok(HashSet::new());
        }

        let rows = sqlx::query(
            "SELECT DISTINCT c.unit_key, c.login_name, c.login_code, c.booklet_id, c.variable_id
             FROM UNNEST($2::text[], $3::text[], $4::text[], $5::text[], $6::text[])
                 AS c(unit_key, login_name, login_code, booklet_id, variable_id)
             JOIN responses r
               ON r.workspace_id = $1
              AND r.unit_name = c.unit_key
              AND r.login_name = c.login_name
              AND r.login_code = c.login_code
              AND r.booklet_id = c.booklet_id
              AND r.variable_id = c.variable_id
             WHERE r.value IS NOT NULL AND btrim(r.value) <> ''",
        )
        .bind(workspace_id)
        .bind(combinations.iter().map(|c| c.unit_key.clone()).collect::<Vec<_>>())
        .bind(combinations.iter().map(|c| c.login_name.clone()).collect::<Vec<_>>())
        .bind(combinations.iter().map(|c| c.login_code.clone()).collect::<Vec<_>>())
        .bind(combinations.iter().map(|c| c.booklet_id.clone()).collect::<Vec<_>>())
        .bind(combinations.iter().map(|c| c.variable_id.clone()).collect::<Vec<_>>())
        .fetch_all(&self.pool)
        .await
        .context("Failed to look up expected combinations")?;

        rows.iter()
            .map(|row| {
                Ok(ExpectedCombination {
                    unit_key: row.try_get("unit_key")?,
                    login_name: row.try_get("login_name")?,
                    login_code: row.try_get("login_code")?,
                    booklet_id: row.try_get("booklet_id")?,
                    variable_id: row.try_get("variable_id")?,
                })
            })
            .collect()
    }

    async fn get_responses(&self, workspace_id: WorkspaceId, ids: &[ResponseId]) -> Result<Vec<Response>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM responses WHERE workspace_id = $1 AND id = ANY($2) ORDER BY id",
            RESPONSE_COLUMNS
        ))
        .bind(workspace_id)
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch responses")?;

        rows.iter().map(response_from_row).collect()
    }

    async fn count_responses_by_status(&self, workspace_id: WorkspaceId) -> Result<Vec<(ResponseStatus, usize)>> {
        let rows = sqlx::query(
            "SELECT COALESCE(status_v2, status_v1) AS status, COUNT(*) AS total
             FROM responses WHERE workspace_id = $1
             GROUP BY 1 ORDER BY 1",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to count responses by status")?;

        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                let total: i64 = row.try_get("total")?;
                Ok((parse_response_status(&status)?, total as usize))
            })
            .collect()
    }

    async fn list_incomplete_variables(&self, workspace_id: WorkspaceId) -> Result<Vec<IncompleteVariable>> {
        let rows = sqlx::query(&format!(
            "SELECT r.unit_name, r.variable_id, COUNT(*) AS response_count,
                    COUNT(*) FILTER (WHERE {held}) AS cases_in_jobs
             FROM responses r
             WHERE r.workspace_id = $1 AND {needs}
             GROUP BY r.unit_name, r.variable_id
             ORDER BY r.unit_name, r.variable_id",
            held = HELD_BY_JOB,
            needs = NEEDS_CODING
        ))
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list incomplete variables")?;

        rows.iter()
            .map(|row| {
                let response_count = row.try_get::<i64, _>("response_count")? as usize;
                let cases_in_jobs = row.try_get::<i64, _>("cases_in_jobs")? as usize;
                Ok(IncompleteVariable {
                    unit_name: row.try_get("unit_name")?,
                    variable_id: row.try_get("variable_id")?,
                    response_count,
                    cases_in_jobs,
                    available_cases: response_count.saturating_sub(cases_in_jobs),
                })
            })
            .collect()
    }

    async fn apply_resolution(&self, workspace_id: WorkspaceId, update: &ResponseUpdate) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE responses
             SET status_v2 = $3, code_v2 = $4, score_v2 = $5, value = COALESCE($6, value)
             WHERE workspace_id = $1 AND id = $2",
        )
        .bind(workspace_id)
        .bind(update.response_id)
        .bind(update.outcome.status.as_str())
        .bind(update.outcome.code)
        .bind(update.outcome.score)
        .bind(update.value.as_deref())
        .execute(&self.pool)
        .await
        .context("Failed to apply resolution")?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait::async_trait]
impl CodingJobStore for PostgresStore {
    async fn get_coding_job(&self, workspace_id: WorkspaceId, job_id: JobId) -> Result<Option<CodingJob>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM coding_jobs WHERE workspace_id = $1 AND id = $2",
            JOB_COLUMNS
        ))
        .bind(workspace_id)
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch coding job")?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_coding_jobs(&self, workspace_id: WorkspaceId) -> Result<Vec<CodingJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM coding_jobs WHERE workspace_id = $1 ORDER BY id",
            JOB_COLUMNS
        ))
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list coding jobs")?;

        rows.iter().map(job_from_row).collect()
    }

    async fn update_job_status(&self, job_id: JobId, status: JobStatus) -> Result<()> {
        let result = sqlx::query("UPDATE coding_jobs SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(job_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .context("Failed to update coding job status")?;

        if result.rows_affected() == 0 {
            bail!("Coding job {} not found", job_id);
        }
        Ok(())
    }

    async fn cancel_coding_job(&self, job_id: JobId) -> Result<bool> {
        // Units go with the job through ON DELETE CASCADE
        let result = sqlx::query("DELETE FROM coding_jobs WHERE id = $1 AND status IN ('pending', 'active')")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .context("Failed to cancel coding job")?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_job_units(&self, job_id: JobId) -> Result<Vec<CodingJobUnit>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM coding_job_units u WHERE u.coding_job_id = $1 ORDER BY u.response_id",
            UNIT_COLUMNS
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list coding job units")?;

        rows.iter().map(unit_from_row).collect()
    }

    async fn save_unit_progress(&self, job_id: JobId, progress: &[UnitProgress]) -> Result<Option<SavedProgress>> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let status: Option<String> = sqlx::query_scalar(
            "SELECT status FROM coding_jobs WHERE id = $1 AND status IN ('pending', 'active', 'paused') FOR UPDATE",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to lock coding job")?;
        let Some(status) = status else {
            return Ok(None);
        };
        let mut status = JobStatus::parse(&status).ok_or_else(|| anyhow!("Unknown job status '{}'", status))?;

        let now = Utc::now();
        let mut touched = 0;

        for entry in progress {
            let result = sqlx::query(
                "UPDATE coding_job_units SET code = $4, score = $5, notes = $6, coded_at = $7
                 WHERE coding_job_id = $1 AND response_id = $2 AND variable_id = $3",
            )
            .bind(job_id)
            .bind(entry.response_id)
            .bind(&entry.variable_id)
            .bind(entry.decision.to_raw())
            .bind(entry.score)
            .bind(entry.notes.as_deref())
            .bind(entry.decision.is_decided().then_some(now))
            .execute(&mut *tx)
            .await
            .context("Failed to save coding progress")?;
            touched += result.rows_affected() as usize;
        }

        if status == JobStatus::Pending && touched > 0 {
            sqlx::query("UPDATE coding_jobs SET status = 'active', updated_at = NOW() WHERE id = $1")
                .bind(job_id)
                .execute(&mut *tx)
                .await
                .context("Failed to activate coding job")?;
            status = JobStatus::Active;
        }

        tx.commit().await.context("Failed to commit coding progress")?;
        Ok(Some(SavedProgress { saved: touched, status }))
    }

    async fn list_coder_units_for_responses(
        &self,
        workspace_id: WorkspaceId,
        response_ids: &[ResponseId],
    ) -> Result<Vec<CoderUnit>> {
        let rows = sqlx::query(&coder_units_query("u.response_id = ANY($2)"))
            .bind(workspace_id)
            .bind(response_ids)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list coded units")?;

        rows.iter().map(coder_unit_from_row).collect()
    }

    async fn list_double_coded_units(&self, workspace_id: WorkspaceId) -> Result<Vec<CoderUnit>> {
        let rows = sqlx::query(&coder_units_query(
            "u.response_id IN (
                SELECT du.response_id FROM coding_job_units du
                JOIN coding_jobs dj ON dj.id = du.coding_job_id
                WHERE dj.workspace_id = $1 AND du.code IS NOT NULL
                GROUP BY du.response_id
                HAVING COUNT(DISTINCT du.coding_job_id) > 1
            )",
        ))
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list double-coded units")?;

        rows.iter().map(coder_unit_from_row).collect()
    }

    async fn apply_job_results(
        &self,
        workspace_id: WorkspaceId,
        job_id: JobId,
        updates: &[ResponseUpdate],
        batch_size: usize,
    ) -> Result<usize> {
        // Dropping `tx` on any early return rolls everything back
        let mut tx = self.pool.begin().await.context("Failed to begin apply transaction")?;

        let status: Option<String> = sqlx::query_scalar(
            "SELECT status FROM coding_jobs WHERE id = $1 AND workspace_id = $2 FOR UPDATE",
        )
        .bind(job_id)
        .bind(workspace_id)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to lock coding job")?;

        match status.as_deref() {
            Some("completed") => {}
            Some(other) => bail!("Coding job {} is {}, expected completed", job_id, other),
            None => bail!("Coding job {} not found", job_id),
        }

        let mut updated = 0;
        let batch_count = updates.len().div_ceil(batch_size.max(1));
        for (index, batch) in updates.chunks(batch_size.max(1)).enumerate() {
            let result = sqlx::query(
                "UPDATE responses AS r
                 SET status_v2 = d.status, code_v2 = d.code, score_v2 = d.score
                 FROM UNNEST($2::bigint[], $3::text[], $4::int4[], $5::int4[]) AS d(id, status, code, score)
                 WHERE r.id = d.id AND r.workspace_id = $1",
            )
            .bind(workspace_id)
            .bind(batch.iter().map(|u| u.response_id).collect::<Vec<_>>())
            .bind(batch.iter().map(|u| u.outcome.status.as_str().to_string()).collect::<Vec<_>>())
            .bind(batch.iter().map(|u| u.outcome.code).collect::<Vec<Option<i32>>>())
            .bind(batch.iter().map(|u| u.outcome.score).collect::<Vec<Option<i32>>>())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to apply batch {} of job {}", index + 1, job_id))?;

            updated += result.rows_affected() as usize;
            log::debug!(
                "Job {}: applied batch {}/{} ({} responses)",
                job_id,
                index + 1,
                batch_count,
                batch.len()
            );
        }

        sqlx::query("UPDATE coding_jobs SET status = 'results_applied', updated_at = NOW() WHERE id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .context("Failed to mark job as applied")?;

        tx.commit().await.context("Failed to commit applied results")?;
        Ok(updated)
    }
}

#[async_trait::async_trait]
impl AllocationStore for PostgresStore {
    async fn list_allocatable_cases(&self, workspace_id: WorkspaceId, variable: &VariableRef) -> Result<Vec<CaseRef>> {
        let rows = sqlx::query(&format!(
            "SELECT r.id, r.unit_name, r.variable_id, r.booklet_id, r.login_name, r.login_code
             FROM responses r
             WHERE r.workspace_id = $1 AND r.unit_name = $2 AND r.variable_id = $3
               AND {needs} AND NOT {held}
             ORDER BY r.id",
            needs = NEEDS_CODING,
            held = HELD_BY_JOB
        ))
        .bind(workspace_id)
        .bind(&variable.unit_name)
        .bind(&variable.variable_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list allocatable cases")?;

        rows.iter()
            .map(|row| {
                Ok(CaseRef {
                    response_id: row.try_get("id")?,
                    unit_name: row.try_get("unit_name")?,
                    variable_id: row.try_get("variable_id")?,
                    booklet_id: row.try_get("booklet_id")?,
                    login_name: row.try_get("login_name")?,
                    login_code: row.try_get("login_code")?,
                })
            })
            .collect()
    }

    async fn commit_allocation(&self, plan: &AllocationPlan) -> Result<Vec<CommittedJob>> {
        match self.try_commit_allocation(plan).await {
            Err(err) if err.downcast_ref::<sqlx::Error>().is_some_and(is_serialization_failure) => {
                Err(anyhow::Error::new(AllocationConflict {
                    variable: plan.variable.clone(),
                    conflicting_responses: Vec::new(),
                }))
            }
            other => other,
        }
    }
}

#[async_trait::async_trait]
impl VariableBundleStore for PostgresStore {
    async fn get_variable_bundles(&self, workspace_id: WorkspaceId, ids: &[BundleId]) -> Result<Vec<VariableBundle>> {
        let rows = sqlx::query(
            "SELECT id, workspace_id, name, variables FROM variable_bundles
             WHERE workspace_id = $1 AND id = ANY($2) ORDER BY id",
        )
        .bind(workspace_id)
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch variable bundles")?;

        rows.iter()
            .map(|row| {
                let variables: Json<Vec<VariableRef>> = row.try_get("variables")?;
                Ok(VariableBundle {
                    id: row.try_get("id")?,
                    workspace_id: row.try_get("workspace_id")?,
                    name: row.try_get("name")?,
                    variables: variables.0,
                })
            })
            .collect()
    }
}

impl Store for PostgresStore {}
