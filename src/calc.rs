use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{GradeError, GradeResult};

/// Component scores keyed by a short synthetic column key ("tx1", "dk2", ...).
pub type ScoreMap = BTreeMap<String, f64>;

pub const SCORE_MIN: f64 = 0.0;
pub const SCORE_MAX: f64 = 10.0;
pub const PASS_THRESHOLD: f64 = 5.0;

const TX_WEIGHT: f64 = 1.0;
const DK_WEIGHT: f64 = 2.0;
const FINAL_WEIGHT: f64 = 0.6;
const TBKT_WEIGHT: f64 = 0.4;

/// Half-away-from-zero rounding to 2 decimals.
///
/// The epsilon nudge keeps binary-float artefacts such as `6.665` (stored as
/// `6.66499999...`) on the side a person would expect.
pub fn round_2(x: f64) -> f64 {
    let scaled = x * 100.0;
    let nudged = scaled + scaled.signum() * 1e-9;
    nudged.round() / 100.0
}

fn average<'a, I>(values: I) -> Option<f64>
where
    I: IntoIterator<Item = &'a f64>,
{
    let mut sum = 0.0;
    let mut n: usize = 0;
    for v in values {
        sum += *v;
        n += 1;
    }
    if n == 0 {
        None
    } else {
        Some(sum / n as f64)
    }
}

pub fn compute_tbkt(tx: &ScoreMap, dk: &ScoreMap) -> Option<f64> {
    let tx_avg = average(tx.values())?;
    let dk_avg = average(dk.values())?;
    Some(round_2(
        (tx_avg * TX_WEIGHT + dk_avg * DK_WEIGHT) / (TX_WEIGHT + DK_WEIGHT),
    ))
}

pub fn compute_tbmh(tbkt: Option<f64>, final_score: Option<f64>) -> Option<f64> {
    let (tbkt, final_score) = (tbkt?, final_score?);
    Some(round_2(final_score * FINAL_WEIGHT + tbkt * TBKT_WEIGHT))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    #[serde(rename = "Excellent")]
    Excellent,
    #[serde(rename = "Good")]
    Good,
    #[serde(rename = "Fairly Good")]
    FairlyGood,
    #[serde(rename = "Average")]
    Average,
    #[serde(rename = "Weak")]
    Weak,
}

impl Classification {
    pub fn label(self) -> &'static str {
        match self {
            Self::Excellent => "Excellent",
            Self::Good => "Good",
            Self::FairlyGood => "Fairly Good",
            Self::Average => "Average",
            Self::Weak => "Weak",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Excellent" => Some(Self::Excellent),
            "Good" => Some(Self::Good),
            "Fairly Good" => Some(Self::FairlyGood),
            "Average" => Some(Self::Average),
            "Weak" => Some(Self::Weak),
            _ => None,
        }
    }
}

pub fn classify(tbmh: Option<f64>) -> Option<Classification> {
    let v = tbmh?;
    let band = if v >= 9.0 {
        Classification::Excellent
    } else if v >= 8.0 {
        Classification::Good
    } else if v >= 7.0 {
        Classification::FairlyGood
    } else if v >= PASS_THRESHOLD {
        Classification::Average
    } else {
        Classification::Weak
    };
    Some(band)
}

/// A student below the continuous-assessment threshold may not have a final exam on record.
pub fn final_is_gated(tbkt: Option<f64>) -> bool {
    matches!(tbkt, Some(v) if v < PASS_THRESHOLD)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputedScores {
    /// Final score as it will be persisted, after gating.
    pub final_score: Option<f64>,
    pub tbkt: Option<f64>,
    pub tbmh: Option<f64>,
    pub classification: Option<Classification>,
    pub passed: bool,
}

pub fn derive(tx: &ScoreMap, dk: &ScoreMap, final_score: Option<f64>) -> ComputedScores {
    derive_with_tbkt(compute_tbkt(tx, dk), final_score)
}

/// Same as [`derive`] but for a TBKT carried forward from an earlier attempt.
pub fn derive_with_tbkt(tbkt: Option<f64>, final_score: Option<f64>) -> ComputedScores {
    let final_score = if final_is_gated(tbkt) {
        None
    } else {
        final_score
    };
    let tbmh = compute_tbmh(tbkt, final_score);
    ComputedScores {
        final_score,
        tbkt,
        tbmh,
        classification: classify(tbmh),
        passed: matches!(tbmh, Some(v) if v >= PASS_THRESHOLD),
    }
}

pub fn validate_score(field: &str, value: f64) -> GradeResult<f64> {
    if !value.is_finite() || !(SCORE_MIN..=SCORE_MAX).contains(&value) {
        return Err(GradeError::validation_with(
            format!("{} must be between {} and {}", field, SCORE_MIN, SCORE_MAX),
            serde_json::json!({ "field": field, "value": value }),
        ));
    }
    Ok(value)
}

pub fn validate_component_map(field: &str, scores: &ScoreMap) -> GradeResult<()> {
    for (key, v) in scores {
        if key.trim().is_empty() {
            return Err(GradeError::validation(format!(
                "{} component keys must not be empty",
                field
            )));
        }
        validate_score(&format!("{}.{}", field, key), *v)?;
    }
    Ok(())
}
