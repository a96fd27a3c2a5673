use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a response with respect to coding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Unset,
    NotReached,
    Displayed,
    ValueChanged,
    Invalid,
    CodingIncomplete,
    CodingError,
    CodingComplete,
    IntendedIncomplete,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unset => "UNSET",
            Self::NotReached => "NOT_REACHED",
            Self::Displayed => "DISPLAYED",
            Self::ValueChanged => "VALUE_CHANGED",
            Self::Invalid => "INVALID",
            Self::CodingIncomplete => "CODING_INCOMPLETE",
            Self::CodingError => "CODING_ERROR",
            Self::CodingComplete => "CODING_COMPLETE",
            Self::IntendedIncomplete => "INTENDED_INCOMPLETE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "UNSET" => Self::Unset,
            "NOT_REACHED" => Self::NotReached,
            "DISPLAYED" => Self::Displayed,
            "VALUE_CHANGED" => Self::ValueChanged,
            "INVALID" => Self::Invalid,
            "CODING_INCOMPLETE" => Self::CodingIncomplete,
            "CODING_ERROR" => Self::CodingError,
            "CODING_COMPLETE" => Self::CodingComplete,
            "INTENDED_INCOMPLETE" => Self::IntendedIncomplete,
            _ => return None,
        })
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const UNCERTAIN: i32 = -1;
const NEEDS_REVIEW: i32 = -2;
const INVALID: i32 = -3;
const CODING_ERROR: i32 = -4;

/// What a coder decided for one case.
///
/// Storage keeps the legacy nullable integer column where negative values
/// are reserved markers; `from_raw`/`to_raw` are the only places that know
/// about them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "code", rename_all = "snake_case")]
pub enum CodingDecision {
    Coded(i32),
    Uncertain,
    NeedsReview,
    Invalid,
    Error,
    NoDecision,
}

impl CodingDecision {
    pub fn from_raw(code: Option<i32>) -> Self {
        match code {
            None => Self::NoDecision,
            Some(UNCERTAIN) => Self::Uncertain,
            Some(NEEDS_REVIEW) => Self::NeedsReview,
            Some(INVALID) => Self::Invalid,
            Some(CODING_ERROR) => Self::Error,
            Some(code) if code < 0 => Self::Error,
            Some(code) => Self::Coded(code),
        }
    }

    pub fn to_raw(self) -> Option<i32> {
        match self {
            Self::Coded(code) => Some(code),
            Self::Uncertain => Some(UNCERTAIN),
            Self::NeedsReview => Some(NEEDS_REVIEW),
            Self::Invalid => Some(INVALID),
            Self::Error => Some(CODING_ERROR),
            Self::NoDecision => None,
        }
    }

    /// The coder has not settled on a code and a reviewer must look first
    pub fn requires_review(&self) -> bool {
        matches!(self, Self::Uncertain | Self::NeedsReview)
    }

    pub fn is_decided(&self) -> bool {
        !matches!(self, Self::NoDecision)
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Coded(code) => Some(*code),
            _ => None,
        }
    }

    /// Response outcome this decision produces once applied
    pub fn outcome(&self, score: Option<i32>) -> ResponseOutcome {
        let outcome = match self {
            Self::Coded(code) => ResponseOutcome {
                status: ResponseStatus::CodingComplete,
                code: Some(*code),
                score,
            },
            Self::Invalid => ResponseOutcome {
                status: ResponseStatus::Invalid,
                code: None,
                score: None,
            },
            Self::Error => ResponseOutcome {
                status: ResponseStatus::CodingError,
                code: None,
                score: None,
            },
            Self::NoDecision | Self::Uncertain | Self::NeedsReview => ResponseOutcome {
                status: ResponseStatus::CodingIncomplete,
                code: None,
                score: None,
            },
        };
        outcome.normalized()
    }
}

/// Target values for a response's `_v2` fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseOutcome {
    pub status: ResponseStatus,
    pub code: Option<i32>,
    pub score: Option<i32>,
}

impl ResponseOutcome {
    /// A complete outcome must carry a code
    pub fn normalized(self) -> Self {
        if self.status == ResponseStatus::CodingComplete && self.code.is_none() {
            return Self {
                status: ResponseStatus::CodingIncomplete,
                code: None,
                score: None,
            };
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_mapping() {
        assert_eq!(CodingDecision::from_raw(None), CodingDecision::NoDecision);
        assert_eq!(CodingDecision::from_raw(Some(-1)), CodingDecision::Uncertain);
        assert_eq!(CodingDecision::from_raw(Some(-2)), CodingDecision::NeedsReview);
        assert_eq!(CodingDecision::from_raw(Some(-3)), CodingDecision::Invalid);
        assert_eq!(CodingDecision::from_raw(Some(-4)), CodingDecision::Error);
        assert_eq!(CodingDecision::from_raw(Some(0)), CodingDecision::Coded(0));
        assert_eq!(CodingDecision::from_raw(Some(3)), CodingDecision::Coded(3));
        assert_eq!(CodingDecision::Invalid.to_raw(), Some(-3));
        assert_eq!(CodingDecision::NoDecision.to_raw(), None);
    }

    #[test]
    fn test_unknown_negative_is_error() {
        assert_eq!(CodingDecision::from_raw(Some(-99)), CodingDecision::Error);
    }

    #[test]
    fn test_outcomes() {
        let coded = CodingDecision::Coded(2).outcome(Some(1));
        assert_eq!(coded.status, ResponseStatus::CodingComplete);
        assert_eq!(coded.code, Some(2));
        assert_eq!(coded.score, Some(1));

        assert_eq!(
            CodingDecision::NoDecision.outcome(Some(1)).status,
            ResponseStatus::CodingIncomplete
        );
        assert_eq!(
            CodingDecision::Invalid.outcome(None).status,
            ResponseStatus::Invalid
        );
        assert_eq!(
            CodingDecision::Error.outcome(None).status,
            ResponseStatus::CodingError
        );
    }

    #[test]
    fn test_complete_without_code_degrades() {
        let outcome = ResponseOutcome {
            status: ResponseStatus::CodingComplete,
            code: None,
            score: Some(1),
        }
        .normalized();
        assert_eq!(outcome.status, ResponseStatus::CodingIncomplete);
        assert_eq!(outcome.score, None);
    }

    #[test]
    fn test_decision_serde_shape() {
        let json = serde_json::to_value(CodingDecision::Coded(4)).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "coded", "code": 4}));
        let back: CodingDecision =
            serde_json::from_value(serde_json::json!({"kind": "needs_review"})).unwrap();
        assert_eq!(back, CodingDecision::NeedsReview);
    }

    #[test]
    fn test_status_strings() {
        for status in [
            ResponseStatus::CodingIncomplete,
            ResponseStatus::CodingComplete,
            ResponseStatus::IntendedIncomplete,
        ] {
            assert_eq!(ResponseStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ResponseStatus::parse("nope"), None);
    }
}
