// =============================================================================
// PatternPrecisionAnalyzer — scores a candidate POI for trap-likeness
// =============================================================================

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::poi::Poi;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuspicionLevel {
    Low,
    Medium,
    High,
    Extreme,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrecisionAnalysis {
    pub precision_score: f64,
    pub timing_score: f64,
    pub volume_anomaly_score: f64,
    pub complexity_score: f64,
    pub frequency_score: f64,
    pub suspicion_score: f64,
    pub suspicion_level: SuspicionLevel,
    pub is_suspect: bool,
    pub exact_tick_precision: f64,
}

pub const SUSPECT_THRESHOLD: f64 = 60.0;
pub const EXACT_TICK_THRESHOLD: f64 = 95.0;

/// How exactly the POI's boundary sits on a round number (tick/round price
/// level). 100 = dead-on a round number.
fn precision_against_round_number(price: f64, round_step: f64) -> f64 {
    if round_step <= 0.0 {
        return 0.0;
    }
    let remainder = (price % round_step).abs();
    let distance = remainder.min(round_step - remainder);
    let normalized = 1.0 - (distance / (round_step / 2.0)).min(1.0);
    normalized * 100.0
}

fn timing_score(timestamp: DateTime<Utc>) -> f64 {
    let minute = timestamp.minute();
    let on_round_minute = minute % 15 == 0;
    let near_session_open = (0..5).contains(&(timestamp.hour() % 24));
    match (on_round_minute, near_session_open) {
        (true, true) => 100.0,
        (true, false) => 60.0,
        (false, true) => 40.0,
        (false, false) => 10.0,
    }
}

fn volume_anomaly_score(poi_volume: f64, avg_volume: f64) -> f64 {
    if avg_volume <= 0.0 {
        return 0.0;
    }
    let ratio = poi_volume / avg_volume;
    // A suspiciously *low* volume pattern masquerading as a strong level is
    // as trap-prone as an unexplained spike, so score both extremes high.
    if ratio > 3.0 {
        ((ratio - 3.0) * 15.0).min(100.0)
    } else if ratio < 0.3 {
        ((0.3 - ratio) * 200.0).min(100.0)
    } else {
        0.0
    }
}

/// Pattern simplicity = trap-prone: a bare single-touch level scores higher
/// than one confirmed by several independent structural elements.
fn complexity_score(confirming_elements: u32) -> f64 {
    match confirming_elements {
        0 => 100.0,
        1 => 70.0,
        2 => 40.0,
        3 => 15.0,
        _ => 0.0,
    }
}

fn frequency_score(similar_patterns_recent: u32) -> f64 {
    (similar_patterns_recent as f64 * 20.0).min(100.0)
}

fn suspicion_level(score: f64) -> SuspicionLevel {
    if score >= 90.0 {
        SuspicionLevel::Extreme
    } else if score >= 75.0 {
        SuspicionLevel::High
    } else if score >= SUSPECT_THRESHOLD {
        SuspicionLevel::Medium
    } else {
        SuspicionLevel::Low
    }
}

pub struct PatternPrecisionAnalyzer {
    round_step: f64,
}

impl PatternPrecisionAnalyzer {
    pub fn new(round_step: f64) -> Self {
        Self { round_step }
    }

    pub fn analyze(
        &self,
        poi: &Poi,
        poi_volume: f64,
        avg_volume: f64,
        confirming_elements: u32,
        similar_patterns_recent: u32,
        timestamp: DateTime<Utc>,
    ) -> PrecisionAnalysis {
        let precision_score = precision_against_round_number(poi.price_top, self.round_step);
        let timing_score = timing_score(timestamp);
        let volume_anomaly_score = volume_anomaly_score(poi_volume, avg_volume);
        let complexity_score = complexity_score(confirming_elements);
        let frequency_score = frequency_score(similar_patterns_recent);

        let suspicion_score = precision_score * 0.3
            + timing_score * 0.2
            + volume_anomaly_score * 0.2
            + complexity_score * 0.2
            + frequency_score * 0.1;

        let is_suspect = suspicion_score >= SUSPECT_THRESHOLD || precision_score >= EXACT_TICK_THRESHOLD;

        PrecisionAnalysis {
            precision_score,
            timing_score,
            volume_anomaly_score,
            complexity_score,
            frequency_score,
            suspicion_score,
            suspicion_level: suspicion_level(suspicion_score),
            is_suspect,
            exact_tick_precision: precision_score,
        }
    }
}

impl Default for PatternPrecisionAnalyzer {
    fn default() -> Self {
        Self::new(100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;

    fn make_poi(price: f64) -> Poi {
        Poi {
            id: "p".into(),
            symbol: "BTCUSDT".into(),
            kind: crate::poi::PoiKind::LiquidityPool,
            direction: Direction::Long,
            price_top: price,
            price_bottom: price - 1.0,
            bar_index: 0,
            timestamp_ms: 0,
            confidence: 80.0,
            base_confidence: 80.0,
            mitigated: false,
            age_bars: 0,
        }
    }

    #[test]
    fn exact_round_number_scores_high_precision() {
        let analyzer = PatternPrecisionAnalyzer::new(100.0);
        let poi = make_poi(50_000.0);
        let result = analyzer.analyze(&poi, 10.0, 10.0, 2, 0, Utc::now());
        assert!(result.exact_tick_precision > 99.0);
    }

    #[test]
    fn suspect_flagged_when_score_crosses_threshold() {
        let analyzer = PatternPrecisionAnalyzer::new(100.0);
        let poi = make_poi(50_000.0);
        let result = analyzer.analyze(&poi, 100.0, 10.0, 0, 5, Utc::now());
        assert!(result.is_suspect);
    }

    #[test]
    fn exact_tick_precision_alone_forces_suspect_flag() {
        let analyzer = PatternPrecisionAnalyzer::new(100.0);
        let poi = make_poi(50_000.0);
        // high confirming elements push the weighted score down, but exact
        // tick precision alone must still force is_suspect = true.
        let result = analyzer.analyze(&poi, 10.0, 10.0, 4, 0, Utc::now());
        assert!(result.exact_tick_precision >= EXACT_TICK_THRESHOLD);
        assert!(result.is_suspect);
    }
}
