use serde::{Deserialize, Serialize};

use crate::model::common::CoderId;

/// Landis & Koch style bands for a kappa value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KappaInterpretation {
    Poor,
    Slight,
    Fair,
    Moderate,
    Substantial,
    AlmostPerfect,
    NoData,
}

impl KappaInterpretation {
    pub fn classify(kappa: Option<f64>) -> Self {
        match kappa {
            None => Self::NoData,
            Some(k) if k < 0.0 => Self::Poor,
            Some(k) if k < 0.2 => Self::Slight,
            Some(k) if k < 0.4 => Self::Fair,
            Some(k) if k < 0.6 => Self::Moderate,
            Some(k) if k < 0.8 => Self::Substantial,
            Some(_) => Self::AlmostPerfect,
        }
    }
}

/// Codes two coders gave on the cases they share
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoderPairCodes {
    pub coder1_id: CoderId,
    pub coder1_name: String,
    pub coder2_id: CoderId,
    pub coder2_name: String,
    pub codes: Vec<CodePair>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodePair {
    pub code1: Option<i32>,
    pub code2: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoderPairAgreement {
    pub coder1_id: CoderId,
    pub coder1_name: String,
    pub coder2_id: CoderId,
    pub coder2_name: String,
    pub kappa: Option<f64>,
    pub agreement: Option<f64>,
    pub total_shared_responses: usize,
    pub valid_pairs: usize,
    pub interpretation: KappaInterpretation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bands() {
        assert_eq!(KappaInterpretation::classify(None), KappaInterpretation::NoData);
        assert_eq!(KappaInterpretation::classify(Some(-0.1)), KappaInterpretation::Poor);
        assert_eq!(KappaInterpretation::classify(Some(0.0)), KappaInterpretation::Slight);
        assert_eq!(KappaInterpretation::classify(Some(0.2)), KappaInterpretation::Fair);
        assert_eq!(KappaInterpretation::classify(Some(0.45)), KappaInterpretation::Moderate);
        assert_eq!(KappaInterpretation::classify(Some(0.6)), KappaInterpretation::Substantial);
        assert_eq!(KappaInterpretation::classify(Some(0.8)), KappaInterpretation::AlmostPerfect);
        assert_eq!(KappaInterpretation::classify(Some(1.0)), KappaInterpretation::AlmostPerfect);
    }
}
