//! Decision engine: combines signal scores, classifies the result and
//! ranks candidates deterministically.

use std::cmp::Ordering;
use uuid::Uuid;

use crate::config::ScoringConfig;
use crate::engine::scorers::{Signal, SignalScore};

/// A combined score over the non-abstaining signals of one pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CombinedScore {
    pub value: f64,
    /// True when the operative amount signal was the FX scorer, which
    /// flags the pair as a cross-currency match for notification purposes.
    pub cross_currency: bool,
}

/// Weighted average over non-abstaining signals with weights renormalized
/// to the participating set. Returns `None` when every signal abstained;
/// such a pair is not a candidate at all.
pub fn combine(scores: &[SignalScore]) -> Option<CombinedScore> {
    if scores.is_empty() {
        return None;
    }
    let total_weight: f64 = scores.iter().map(|s| s.weight).sum();
    if total_weight <= 0.0 {
        return None;
    }
    let weighted_sum: f64 = scores.iter().map(|s| s.value * s.weight).sum();
    let value = (weighted_sum / total_weight).clamp(0.0, 1.0);
    let cross_currency = scores.iter().any(|s| s.signal == Signal::Fx);
    Some(CombinedScore {
        value,
        cross_currency,
    })
}

/// Classification of a combined score against the configured floors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// At or above the auto-match floor: link both sides without review.
    Auto,
    /// In the suggestion band: surface for human confirmation.
    Suggested,
    /// Below the suggestion floor: this candidate contributes nothing.
    NoContribution,
}

pub fn classify(value: f64, config: &ScoringConfig) -> Classification {
    if value >= config.auto_match_floor {
        Classification::Auto
    } else if value >= config.suggestion_floor {
        Classification::Suggested
    } else {
        Classification::NoContribution
    }
}

/// One scored candidate pair, carrying what ranking and event emission
/// need after the signal values themselves are no longer interesting.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub transaction_id: Uuid,
    pub document_id: Uuid,
    pub combined: f64,
    pub cross_currency: bool,
    pub date_distance_days: Option<i64>,
    pub signals: Vec<SignalScore>,
}

/// Orders candidates best-first: highest combined score, ties broken by
/// nearest date, then by lowest document id, then by lowest transaction
/// id, so repeated evaluations of the same pool pick the same winner.
pub fn rank(candidates: &mut [ScoredCandidate]) {
    candidates.sort_by(|a, b| {
        b.combined
            .partial_cmp(&a.combined)
            .unwrap_or(Ordering::Equal)
            .then_with(
                || match (a.date_distance_days, b.date_distance_days) {
                    (Some(x), Some(y)) => x.cmp(&y),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                },
            )
            .then_with(|| a.document_id.cmp(&b.document_id))
            .then_with(|| a.transaction_id.cmp(&b.transaction_id))
    });
}
