use itertools::Itertools;
use std::collections::HashMap;

use crate::model::{CodePair, CoderPairAgreement, CoderPairCodes, KappaInterpretation};

/// Agreement between two coders over the pairs where both gave a code
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KappaStats {
    pub kappa: Option<f64>,
    pub agreement: Option<f64>,
    pub valid_pairs: usize,
}

/// Cohen's kappa over a list of code pairs. Pairs missing either code are ignored.
pub fn cohens_kappa(pairs: &[CodePair]) -> KappaStats {
    let valid: Vec<(i32, i32)> = pairs
        .iter()
        .filter_map(|p| Some((p.code1?, p.code2?)))
        .collect();

    let n = valid.len();
    if n == 0 {
        return KappaStats {
            kappa: None,
            agreement: None,
            valid_pairs: 0,
        };
    }

    let total = n as f64;
    let observed = valid.iter().filter(|(a, b)| a == b).count() as f64 / total;

    // Marginal totals of the confusion matrix
    let rows: HashMap<i32, usize> = valid.iter().map(|(a, _)| *a).counts();
    let cols: HashMap<i32, usize> = valid.iter().map(|(_, b)| *b).counts();
    let expected = rows
        .iter()
        .map(|(code, row)| (*row * cols.get(code).copied().unwrap_or(0)) as f64)
        .sum::<f64>()
        / (total * total);

    let kappa = if (1.0 - expected).abs() < f64::EPSILON {
        1.0
    } else {
        (observed - expected) / (1.0 - expected)
    };

    KappaStats {
        kappa: Some(kappa),
        agreement: Some(observed),
        valid_pairs: n,
    }
}

pub fn pair_agreement(pair: &CoderPairCodes) -> CoderPairAgreement {
    let stats = cohens_kappa(&pair.codes);
    CoderPairAgreement {
        coder1_id: pair.coder1_id,
        coder1_name: pair.coder1_name.clone(),
        coder2_id: pair.coder2_id,
        coder2_name: pair.coder2_name.clone(),
        kappa: stats.kappa,
        agreement: stats.agreement,
        total_shared_responses: pair.codes.len(),
        valid_pairs: stats.valid_pairs,
        interpretation: KappaInterpretation::classify(stats.kappa),
    }
}

/// Mean over the pairs that have a kappa value
pub fn average_kappa(agreements: &[CoderPairAgreement]) -> Option<f64> {
    let defined: Vec<f64> = agreements.iter().filter_map(|a| a.kappa).collect();
    if defined.is_empty() {
        None
    } else {
        Some(defined.iter().sum::<f64>() / defined.len() as f64)
    }
}
