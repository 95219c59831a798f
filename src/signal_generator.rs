// =============================================================================
// SignalGenerator — pipeline composition producing entry signals
// =============================================================================
//
// Mirrors the mandatory-gate-chain shape used elsewhere for pre-trade checks:
// each stage either advances the candidate or returns a blocking reason that
// gets recorded in a `DecisionEnvelope` instead of silently dropping the
// candidate, the same auditable-rejection pattern the gate chains use.

use chrono::Utc;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::bot_trap::{BotTrapDetector, PrecisionAnalysis, RiskAdjustment};
use crate::config::EffectiveConfig;
use crate::cvd::{validate_with_cvd, PriceCvdPoint};
use crate::decision_envelope::{DecisionEnvelope, Stage};
use crate::external_adapters::{composite_external_bias, GlobalCvdReading, OracleReading};
use crate::hologram::HologramState;
use crate::poi::Poi;
use crate::session::SessionProfiler;
use crate::types::{Direction, HologramStatus};

const POI_PROXIMITY_PCT: f64 = 0.005;
const DEFAULT_R_MULTIPLE: f64 = 3.0;

#[derive(Debug, Clone, Serialize)]
pub struct Signal {
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub position_size: f64,
    pub leverage: f64,
    pub conviction_multiplier: f64,
    pub reasoning: Vec<String>,
    pub cvd_confirmed: bool,
    pub oracle_score: Option<f64>,
    pub global_cvd_score: Option<f64>,
    pub created_at: chrono::DateTime<Utc>,
}

pub struct SignalCandidate<'a> {
    pub symbol: &'a str,
    pub direction: Direction,
    pub price: f64,
    pub atr_stop_distance: f64,
    pub equity: f64,
}

/// Everything the pipeline needs to evaluate one candidate. Borrowed rather
/// than owned since the orchestrator holds the authoritative copies.
pub struct PipelineInputs<'a> {
    pub hologram: &'a HologramState,
    pub session: &'a SessionProfiler,
    pub now: chrono::DateTime<Utc>,
    pub pois: &'a [Poi],
    pub cvd_prior: PriceCvdPoint,
    pub cvd_current: PriceCvdPoint,
    /// Volume-spike passive-absorption signature on the same symbol's tick
    /// window, independent of the price/CVD divergence gate above. This is
    /// what the bot-trap adjuster's `requires_passive_absorption` checks.
    pub passive_absorption: bool,
    pub oracle: Option<&'a OracleReading>,
    pub global_cvd: Option<&'a GlobalCvdReading>,
    pub bot_trap: Option<(&'a Poi, &'a PrecisionAnalysis, Option<RiskAdjustment>)>,
    pub cfg: &'a EffectiveConfig,
}

pub struct SignalGenerator {
    detector: BotTrapDetector,
}

impl SignalGenerator {
    pub fn new() -> Self {
        Self {
            detector: BotTrapDetector::default(),
        }
    }

    pub fn detector(&self) -> &BotTrapDetector {
        &self.detector
    }

    /// Runs the full mandatory-gate pipeline for one candidate. Returns
    /// either a generated `Signal` or a `DecisionEnvelope` explaining the
    /// block — callers persist the envelope regardless of outcome.
    pub fn generate(&self, candidate: SignalCandidate, inputs: PipelineInputs) -> (Option<Signal>, DecisionEnvelope) {
        let side = candidate.direction.to_string();
        let strategy = "hunter_core";

        // Stage 1: hologram status must be A_PLUS or B.
        if !matches!(inputs.hologram.status, HologramStatus::APlus | HologramStatus::B) {
            return (
                None,
                DecisionEnvelope::blocked(candidate.symbol, &side, strategy, Stage::Hologram, format!("status is {}", inputs.hologram.status)),
            );
        }

        // Stage 2: session must be a killzone.
        if !inputs.session.is_killzone(inputs.now) {
            return (
                None,
                DecisionEnvelope::blocked(candidate.symbol, &side, strategy, Stage::Session, "not inside a killzone window"),
            );
        }

        // Stage 3: RS score must agree with direction. Folded into the
        // hologram verdict — it reads off the same `HologramState`.
        if !inputs.hologram.rs_matches(candidate.direction, inputs.cfg.rs_threshold) {
            return (
                None,
                DecisionEnvelope::blocked(candidate.symbol, &side, strategy, Stage::Hologram, "rs score does not support direction"),
            );
        }

        // Stage 4: price within proximity of a non-mitigated POI of matching direction.
        let matching_poi = inputs.pois.iter().find(|p| {
            !p.mitigated
                && p.direction == candidate.direction
                && (candidate.price - p.midpoint()).abs() / candidate.price <= POI_PROXIMITY_PCT
        });
        let Some(poi) = matching_poi else {
            return (
                None,
                DecisionEnvelope::blocked(candidate.symbol, &side, strategy, Stage::Poi, "no non-mitigated POI within proximity"),
            );
        };

        // Stage 5: CVD must confirm — mandatory.
        let (cvd_confirmed, _delta) = validate_with_cvd(candidate.direction, inputs.cvd_prior, inputs.cvd_current);
        if !cvd_confirmed {
            return (
                None,
                DecisionEnvelope::blocked(candidate.symbol, &side, strategy, Stage::Cvd, "absorption/distribution not confirmed"),
            );
        }

        // Stage 6: oracle/global-cvd/bot-trap modulate conviction; bot-trap
        // can require passive absorption that this candidate doesn't prove,
        // in which case it vetoes.
        let mut conviction = 1.0;
        let mut reasoning = vec![
            format!("hologram {} ({:.1})", inputs.hologram.status, inputs.hologram.alignment_score),
            format!("poi {:?} at {:.4}", poi.kind, poi.midpoint()),
            "cvd confirmed".to_string(),
        ];

        let oracle_score = inputs.oracle.map(|o| o.sentiment);
        let global_cvd_score = inputs.global_cvd.map(|g| g.divergence_score);
        if let Some(bias) = composite_external_bias(inputs.oracle, inputs.global_cvd) {
            let agrees = (bias > 0.0 && candidate.direction == Direction::Long) || (bias < 0.0 && candidate.direction == Direction::Short);
            conviction *= if agrees { 1.0 + bias.abs() * 0.3 } else { 1.0 - bias.abs() * 0.3 };
            reasoning.push(format!("external bias {:.2}", bias));
        }

        if let Some((_trap_poi, analysis, adjustment)) = inputs.bot_trap {
            if let Some(adj) = adjustment {
                if adj.requires_passive_absorption && !inputs.passive_absorption {
                    return (
                        None,
                        DecisionEnvelope::blocked(candidate.symbol, &side, strategy, Stage::BotTrap, "suspect pattern requires passive absorption"),
                    );
                }
                conviction *= adj.size_multiplier;
                reasoning.push(format!("bot-trap suspect (score {:.1}), size x{:.2}", analysis.suspicion_score, adj.size_multiplier));
            }
        }

        conviction = conviction.clamp(inputs.cfg.conviction_min, inputs.cfg.conviction_max);

        // Stage 7: position size from volatility.
        if candidate.atr_stop_distance <= 0.0 {
            return (
                None,
                DecisionEnvelope::blocked(candidate.symbol, &side, strategy, Stage::Sizing, "atr stop distance is zero"),
            );
        }
        let position_size = (candidate.equity * inputs.cfg.risk_per_trade * conviction) / (candidate.atr_stop_distance * candidate.price);

        // Stage 8: stop at POI outer boundary with buffer, target at R multiple.
        let buffer = candidate.atr_stop_distance * 0.1;
        let stop_loss = match candidate.direction {
            Direction::Long => poi.price_bottom - buffer,
            Direction::Short => poi.price_top + buffer,
        };
        let risk_distance = (candidate.price - stop_loss).abs();
        if risk_distance <= 0.0 {
            return (
                None,
                DecisionEnvelope::blocked(candidate.symbol, &side, strategy, Stage::Sizing, "entry equals stop"),
            );
        }
        let take_profit = match candidate.direction {
            Direction::Long => candidate.price + DEFAULT_R_MULTIPLE * risk_distance,
            Direction::Short => candidate.price - DEFAULT_R_MULTIPLE * risk_distance,
        };

        let signal = Signal {
            id: Uuid::new_v4().to_string(),
            symbol: candidate.symbol.to_string(),
            direction: candidate.direction,
            entry_price: candidate.price,
            stop_loss,
            take_profit,
            position_size,
            leverage: inputs.cfg.max_leverage,
            conviction_multiplier: conviction,
            reasoning,
            cvd_confirmed,
            oracle_score,
            global_cvd_score,
            created_at: inputs.now,
        };

        debug!(symbol = candidate.symbol, conviction, "signal generated");

        (Some(signal), DecisionEnvelope::allow(candidate.symbol, &side, strategy))
    }
}

impl Default for SignalGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigManager, StrategyDefaults};
    use crate::hologram::TimeframeAnalysis;
    use crate::poi::PoiKind;
    use crate::types::{Location, Trend};
    use chrono::TimeZone;
    use std::collections::HashSet;

    fn cfg() -> EffectiveConfig {
        (*ConfigManager::new(StrategyDefaults::default()).unwrap().effective()).clone()
    }

    fn strong_tf() -> TimeframeAnalysis {
        TimeframeAnalysis { trend: Trend::Bull, location: Location::Discount, mss: false, bos: true, atr: 1.0 }
    }

    fn hologram_a_plus(symbol: &str) -> HologramState {
        HologramState {
            symbol: symbol.to_string(),
            daily: strong_tf(),
            h4: strong_tf(),
            m15: strong_tf(),
            alignment_score: 95.0,
            rs_score: 0.05,
            status: HologramStatus::APlus,
            veto_reasons: HashSet::new(),
            updated_at: Utc::now(),
        }
    }

    fn bullish_poi(price: f64) -> Poi {
        Poi {
            id: "poi-1".into(),
            symbol: "BTCUSDT".into(),
            kind: PoiKind::Fvg,
            direction: Direction::Long,
            price_top: price + 0.5,
            price_bottom: price - 0.5,
            bar_index: 0,
            timestamp_ms: 0,
            confidence: 80.0,
            base_confidence: 80.0,
            mitigated: false,
            age_bars: 0,
        }
    }

    #[test]
    fn full_pipeline_produces_a_signal_on_all_gates_passing() {
        let config = cfg();
        let hologram = hologram_a_plus("BTCUSDT");
        let session = SessionProfiler::default();
        let pois = vec![bullish_poi(100.0)];
        let now = chrono::Utc.with_ymd_and_hms(2026, 8, 1, 9, 0, 0).unwrap();

        let candidate = SignalCandidate {
            symbol: "BTCUSDT",
            direction: Direction::Long,
            price: 100.0,
            atr_stop_distance: 1.5,
            equity: 10_000.0,
        };

        let inputs = PipelineInputs {
            hologram: &hologram,
            session: &session,
            now,
            pois: &pois,
            cvd_prior: PriceCvdPoint { price: 101.0, cvd: -5.0 },
            cvd_current: PriceCvdPoint { price: 100.0, cvd: -2.0 },
            passive_absorption: false,
            oracle: None,
            global_cvd: None,
            bot_trap: None,
            cfg: &config,
        };

        let generator = SignalGenerator::new();
        let (signal, envelope) = generator.generate(candidate, inputs);
        assert!(signal.is_some());
        assert_eq!(envelope.final_decision, "ALLOW");
        let signal = signal.unwrap();
        let r_multiple = (signal.take_profit - signal.entry_price).abs() / (signal.entry_price - signal.stop_loss).abs();
        assert!((r_multiple - DEFAULT_R_MULTIPLE).abs() < 1e-6);
    }

    #[test]
    fn blocks_when_cvd_does_not_confirm() {
        let config = cfg();
        let hologram = hologram_a_plus("BTCUSDT");
        let session = SessionProfiler::default();
        let pois = vec![bullish_poi(100.0)];
        let now = chrono::Utc.with_ymd_and_hms(2026, 8, 1, 9, 0, 0).unwrap();

        let candidate = SignalCandidate {
            symbol: "BTCUSDT",
            direction: Direction::Long,
            price: 100.0,
            atr_stop_distance: 1.5,
            equity: 10_000.0,
        };

        let inputs = PipelineInputs {
            hologram: &hologram,
            session: &session,
            now,
            pois: &pois,
            cvd_prior: PriceCvdPoint { price: 100.0, cvd: 5.0 },
            cvd_current: PriceCvdPoint { price: 101.0, cvd: 5.0 },
            passive_absorption: false,
            oracle: None,
            global_cvd: None,
            bot_trap: None,
            cfg: &config,
        };

        let generator = SignalGenerator::new();
        let (signal, envelope) = generator.generate(candidate, inputs);
        assert!(signal.is_none());
        assert_eq!(envelope.blocking_stage.as_deref(), Some("cvd"));
    }

    #[test]
    fn blocks_outside_killzone() {
        let config = cfg();
        let hologram = hologram_a_plus("BTCUSDT");
        let session = SessionProfiler::default();
        let pois = vec![bullish_poi(100.0)];
        let now = chrono::Utc.with_ymd_and_hms(2026, 8, 1, 23, 0, 0).unwrap();

        let candidate = SignalCandidate {
            symbol: "BTCUSDT",
            direction: Direction::Long,
            price: 100.0,
            atr_stop_distance: 1.5,
            equity: 10_000.0,
        };

        let inputs = PipelineInputs {
            hologram: &hologram,
            session: &session,
            now,
            pois: &pois,
            cvd_prior: PriceCvdPoint { price: 101.0, cvd: -5.0 },
            cvd_current: PriceCvdPoint { price: 100.0, cvd: -2.0 },
            passive_absorption: false,
            oracle: None,
            global_cvd: None,
            bot_trap: None,
            cfg: &config,
        };

        let generator = SignalGenerator::new();
        let (signal, envelope) = generator.generate(candidate, inputs);
        assert!(signal.is_none());
        assert_eq!(envelope.blocking_stage.as_deref(), Some("session"));
    }
}
