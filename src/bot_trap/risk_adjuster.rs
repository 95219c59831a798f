// =============================================================================
// SuspectPatternRiskAdjuster — shrinks size and tightens risk on suspect POIs
// =============================================================================

use super::precision::{PrecisionAnalysis, SuspicionLevel};

#[derive(Debug, Clone, Copy)]
pub struct RiskAdjustment {
    pub size_multiplier: f64,
    pub max_stop_fraction: f64,
    pub cvd_confirmation_multiplier: f64,
    pub requires_passive_absorption: bool,
}

const BASE_SIZE_MULTIPLIER: f64 = 0.5;
const SIZE_FLOOR: f64 = 0.25;
const BASE_STOP_FRACTION: f64 = 0.01;
const BASE_CVD_MULTIPLIER: f64 = 1.5;

pub struct SuspectPatternRiskAdjuster;

impl SuspectPatternRiskAdjuster {
    /// Returns `None` when the analysis isn't suspect — the signal pipeline
    /// applies no adjustment in that case.
    pub fn adjust(analysis: &PrecisionAnalysis) -> Option<RiskAdjustment> {
        if !analysis.is_suspect {
            return None;
        }

        let level_penalty = match analysis.suspicion_level {
            SuspicionLevel::High => 0.75,
            SuspicionLevel::Extreme => 0.5,
            _ => 1.0,
        };

        let size_multiplier = (BASE_SIZE_MULTIPLIER * level_penalty).max(SIZE_FLOOR);

        Some(RiskAdjustment {
            size_multiplier,
            max_stop_fraction: BASE_STOP_FRACTION,
            cvd_confirmation_multiplier: BASE_CVD_MULTIPLIER,
            requires_passive_absorption: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analysis(level: SuspicionLevel, is_suspect: bool) -> PrecisionAnalysis {
        PrecisionAnalysis {
            precision_score: 80.0,
            timing_score: 50.0,
            volume_anomaly_score: 0.0,
            complexity_score: 50.0,
            frequency_score: 0.0,
            suspicion_score: 65.0,
            suspicion_level: level,
            is_suspect,
            exact_tick_precision: 80.0,
        }
    }

    #[test]
    fn non_suspect_pattern_gets_no_adjustment() {
        let a = analysis(SuspicionLevel::Low, false);
        assert!(SuspectPatternRiskAdjuster::adjust(&a).is_none());
    }

    #[test]
    fn medium_suspect_halves_size() {
        let a = analysis(SuspicionLevel::Medium, true);
        let adj = SuspectPatternRiskAdjuster::adjust(&a).unwrap();
        assert!((adj.size_multiplier - 0.5).abs() < 1e-9);
        assert!(adj.requires_passive_absorption);
    }

    #[test]
    fn high_suspicion_applies_additional_penalty() {
        let a = analysis(SuspicionLevel::High, true);
        let adj = SuspectPatternRiskAdjuster::adjust(&a).unwrap();
        assert!((adj.size_multiplier - 0.375).abs() < 1e-9);
    }

    #[test]
    fn extreme_suspicion_never_drops_below_floor() {
        let a = analysis(SuspicionLevel::Extreme, true);
        let adj = SuspectPatternRiskAdjuster::adjust(&a).unwrap();
        assert!(adj.size_multiplier >= SIZE_FLOOR);
    }
}
