// =============================================================================
// BotTrapDetector — precision analysis, risk adjustment, adaptive learning
// =============================================================================

pub mod learning;
pub mod precision;
pub mod risk_adjuster;

pub use learning::{AdaptiveLearningEngine, OutcomeRecord};
pub use precision::{PatternPrecisionAnalyzer, PrecisionAnalysis, SuspicionLevel};
pub use risk_adjuster::{RiskAdjustment, SuspectPatternRiskAdjuster};

/// Composes the three sub-modules into the single entry point the
/// signal-generation pipeline calls.
pub struct BotTrapDetector {
    pub analyzer: PatternPrecisionAnalyzer,
    pub learning: AdaptiveLearningEngine,
}

impl BotTrapDetector {
    pub fn new(round_step: f64) -> Self {
        Self {
            analyzer: PatternPrecisionAnalyzer::new(round_step),
            learning: AdaptiveLearningEngine::default(),
        }
    }

    /// Runs precision analysis and, if the pattern is suspect, computes the
    /// corresponding risk adjustment in one call.
    pub fn evaluate(
        &self,
        poi: &crate::poi::Poi,
        poi_volume: f64,
        avg_volume: f64,
        confirming_elements: u32,
        similar_patterns_recent: u32,
        timestamp: chrono::DateTime<chrono::Utc>,
    ) -> (PrecisionAnalysis, Option<RiskAdjustment>) {
        let analysis = self.analyzer.analyze(poi, poi_volume, avg_volume, confirming_elements, similar_patterns_recent, timestamp);
        let adjustment = SuspectPatternRiskAdjuster::adjust(&analysis);
        (analysis, adjustment)
    }
}

impl Default for BotTrapDetector {
    fn default() -> Self {
        Self::new(100.0)
    }
}
