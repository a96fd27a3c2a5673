use serde::{Deserialize, Serialize};

use crate::model::common::{ResponseId, VariableRef, WorkspaceId};
use crate::model::decision::{ResponseOutcome, ResponseStatus};

/// A test-taker's response to one variable, owned by the delivery platform.
/// Only the `_v2` fields are written by this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub id: ResponseId,
    pub workspace_id: WorkspaceId,
    pub unit_name: String,
    pub login_name: String,
    pub login_code: String,
    pub booklet_id: String,
    pub variable_id: String,
    pub value: Option<String>,
    pub status_v1: ResponseStatus,
    pub status_v2: Option<ResponseStatus>,
    pub code_v2: Option<i32>,
    pub score_v2: Option<i32>,
}

impl Response {
    pub fn variable(&self) -> VariableRef {
        VariableRef::new(self.unit_name.clone(), self.variable_id.clone())
    }

    pub fn has_value(&self) -> bool {
        self.value.as_deref().is_some_and(|v| !v.trim().is_empty())
    }

    /// Status after coding if any, otherwise the original status
    pub fn effective_status(&self) -> ResponseStatus {
        self.status_v2.unwrap_or(self.status_v1)
    }

    /// Still waiting for a human coder
    pub fn needs_coding(&self) -> bool {
        self.status_v1 == ResponseStatus::CodingIncomplete
            && matches!(self.status_v2, None | Some(ResponseStatus::CodingIncomplete))
    }

    pub fn apply_outcome(&mut self, outcome: &ResponseOutcome) {
        self.status_v2 = Some(outcome.status);
        self.code_v2 = outcome.code;
        self.score_v2 = outcome.score;
    }
}

/// One pending write to a response's `_v2` fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseUpdate {
    pub response_id: ResponseId,
    pub outcome: ResponseOutcome,
    /// Replacement for the response's free-text value, if any
    pub value: Option<String>,
}

/// A response that can still be allocated to coders
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseRef {
    pub response_id: ResponseId,
    pub unit_name: String,
    pub variable_id: String,
    pub booklet_id: String,
    pub login_name: String,
    pub login_code: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(value: Option<&str>) -> Response {
        Response {
            id: 1,
            workspace_id: 1,
            unit_name: "U".to_string(),
            login_name: "l".to_string(),
            login_code: "c".to_string(),
            booklet_id: "b".to_string(),
            variable_id: "v".to_string(),
            value: value.map(str::to_string),
            status_v1: ResponseStatus::CodingIncomplete,
            status_v2: None,
            code_v2: None,
            score_v2: None,
        }
    }

    #[test]
    fn test_has_value() {
        assert!(response(Some("text")).has_value());
        assert!(!response(Some("  ")).has_value());
        assert!(!response(Some("")).has_value());
        assert!(!response(None).has_value());
    }

    #[test]
    fn test_needs_coding_until_outcome_applied() {
        let mut r = response(Some("x"));
        assert!(r.needs_coding());
        r.apply_outcome(&ResponseOutcome {
            status: ResponseStatus::CodingComplete,
            code: Some(1),
            score: Some(1),
        });
        assert!(!r.needs_coding());
        assert_eq!(r.effective_status(), ResponseStatus::CodingComplete);
    }
}
