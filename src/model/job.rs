use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::common::{BundleId, CoderId, JobId, ResponseId, VariableRef, WorkspaceId};
use crate::model::decision::CodingDecision;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Active,
    Paused,
    Completed,
    ResultsApplied,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::ResultsApplied => "results_applied",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "pending" => Self::Pending,
            "active" => Self::Active,
            "paused" => Self::Paused,
            "completed" => Self::Completed,
            "results_applied" => Self::ResultsApplied,
            _ => return None,
        })
    }

    /// Coders may still change decisions
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Active | Self::Paused)
    }

    pub fn can_cancel(&self) -> bool {
        matches!(self, Self::Pending | Self::Active)
    }

    /// Transitions a caller may request. `ResultsApplied` is only reachable
    /// through the results applier and is terminal.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, target),
            (Pending, Active)
                | (Active, Paused)
                | (Paused, Active)
                | (Active, Completed)
                | (Completed, ResultsApplied)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseOrderingMode {
    /// Contiguous blocks per coder
    Continuous,
    /// Round-robin over coders
    Alternating,
}

impl Default for CaseOrderingMode {
    fn default() -> Self {
        Self::Continuous
    }
}

impl CaseOrderingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continuous => "continuous",
            Self::Alternating => "alternating",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "continuous" => Some(Self::Continuous),
            "alternating" => Some(Self::Alternating),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodingJob {
    pub id: JobId,
    pub workspace_id: WorkspaceId,
    pub name: String,
    pub status: JobStatus,
    pub assigned_coders: Vec<CoderId>,
    pub assigned_variables: Vec<VariableRef>,
    pub assigned_variable_bundles: Vec<BundleId>,
    pub missings_profile_id: Option<i64>,
    pub case_ordering_mode: CaseOrderingMode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CodingJob {
    pub fn primary_coder(&self) -> Option<CoderId> {
        self.assigned_coders.first().copied()
    }
}

/// Job fields supplied at creation time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCodingJob {
    pub name: String,
    pub coder_id: CoderId,
    pub coder_name: String,
    pub variable: VariableRef,
    pub bundle_id: Option<BundleId>,
    pub missings_profile_id: Option<i64>,
    pub case_ordering_mode: CaseOrderingMode,
}

/// One case inside one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodingJobUnit {
    pub id: i64,
    pub coding_job_id: JobId,
    pub response_id: ResponseId,
    pub unit_name: String,
    pub variable_id: String,
    pub booklet_id: String,
    pub login_name: String,
    pub login_code: String,
    pub decision: CodingDecision,
    pub score: Option<i32>,
    pub notes: Option<String>,
    pub coded_at: Option<DateTime<Utc>>,
}

impl CodingJobUnit {
    pub fn variable(&self) -> VariableRef {
        VariableRef::new(self.unit_name.clone(), self.variable_id.clone())
    }
}

/// A job unit together with who coded it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoderUnit {
    pub unit: CodingJobUnit,
    pub coder_id: CoderId,
    pub coder_name: String,
    pub job_name: String,
}

/// Coder input for one unit of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitProgress {
    pub response_id: ResponseId,
    pub variable_id: String,
    pub decision: CodingDecision,
    pub score: Option<i32>,
    pub notes: Option<String>,
}
