// =============================================================================
// Decision Envelope — auditable record of every trade/no-trade decision
// =============================================================================
//
// Every candidate flows through the gate chain in `signal_generator.rs`. The
// envelope captures a verdict for each of the five gates a candidate can be
// vetoed on — hologram, session, poi, cvd, bot_trap — plus which one (if any)
// blocked it, so every decision is auditable after the fact without having
// to replay the pipeline. The relative-strength check folds into the
// hologram verdict (it reads directly off `HologramState`); stop/target
// sizing has no dedicated verdict since every upstream gate having already
// passed is itself the interesting fact.

use serde::Serialize;

/// One of the gate-chain's five vetoable stages, plus the terminal sizing
/// step which can still fail (zero ATR, entry == stop) after every gate
/// passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Hologram,
    Session,
    Poi,
    Cvd,
    BotTrap,
    Sizing,
}

impl Stage {
    fn as_str(self) -> &'static str {
        match self {
            Stage::Hologram => "hologram",
            Stage::Session => "session",
            Stage::Poi => "poi",
            Stage::Cvd => "cvd",
            Stage::BotTrap => "bot_trap",
            Stage::Sizing => "sizing",
        }
    }

    /// Position in the gate chain, for the four intermediate stages.
    /// `Sizing` runs after all of them and has no slot of its own.
    fn order_index(self) -> Option<usize> {
        match self {
            Stage::Hologram => Some(0),
            Stage::Session => Some(1),
            Stage::Poi => Some(2),
            Stage::Cvd => Some(3),
            Stage::BotTrap => Some(4),
            Stage::Sizing => None,
        }
    }
}

fn verdict_for(field: Stage, blocked_at: Stage) -> &'static str {
    match (field.order_index(), blocked_at.order_index()) {
        (Some(f), Some(b)) if f < b => "PASS",
        (Some(f), Some(b)) if f == b => "FAIL",
        (Some(_), Some(_)) => "SKIP",
        (Some(_), None) => "PASS",
        _ => "SKIP",
    }
}

/// Complete auditable record of a trade decision, including every gate's
/// verdict.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionEnvelope {
    pub id: String,
    pub symbol: String,
    /// "LONG" or "SHORT".
    pub side: String,
    pub strategy_name: String,

    pub hologram_verdict: String,
    pub session_verdict: String,
    pub poi_verdict: String,
    pub cvd_verdict: String,
    pub bot_trap_verdict: String,

    /// "ALLOW" or "BLOCK".
    pub final_decision: String,
    /// Which stage blocked the trade, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocking_stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smart_filters: Option<serde_json::Value>,
}

impl DecisionEnvelope {
    /// Every gate cleared.
    pub fn allow(symbol: impl Into<String>, side: impl Into<String>, strategy_name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            side: side.into(),
            strategy_name: strategy_name.into(),
            hologram_verdict: "PASS".to_string(),
            session_verdict: "PASS".to_string(),
            poi_verdict: "PASS".to_string(),
            cvd_verdict: "PASS".to_string(),
            bot_trap_verdict: "PASS".to_string(),
            final_decision: "ALLOW".to_string(),
            blocking_stage: None,
            reason: None,
            created_at: chrono::Utc::now().to_rfc3339(),
            smart_filters: None,
        }
    }

    /// Blocked at `stage`. Gates before it get "PASS", the blocking gate gets
    /// "FAIL", everything after gets "SKIP" since the pipeline never reached it.
    pub fn blocked(symbol: impl Into<String>, side: impl Into<String>, strategy_name: impl Into<String>, stage: Stage, reason: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            side: side.into(),
            strategy_name: strategy_name.into(),
            hologram_verdict: verdict_for(Stage::Hologram, stage).to_string(),
            session_verdict: verdict_for(Stage::Session, stage).to_string(),
            poi_verdict: verdict_for(Stage::Poi, stage).to_string(),
            cvd_verdict: verdict_for(Stage::Cvd, stage).to_string(),
            bot_trap_verdict: verdict_for(Stage::BotTrap, stage).to_string(),
            final_decision: "BLOCK".to_string(),
            blocking_stage: Some(stage.as_str().to_string()),
            reason: Some(reason.into()),
            created_at: chrono::Utc::now().to_rfc3339(),
            smart_filters: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_sets_every_verdict_to_pass() {
        let envelope = DecisionEnvelope::allow("BTCUSDT", "LONG", "hunter_core");
        assert_eq!(envelope.final_decision, "ALLOW");
        assert_eq!(envelope.hologram_verdict, "PASS");
        assert_eq!(envelope.bot_trap_verdict, "PASS");
        assert!(envelope.blocking_stage.is_none());
    }

    #[test]
    fn blocked_at_poi_skips_downstream_gates_but_passes_upstream_ones() {
        let envelope = DecisionEnvelope::blocked("BTCUSDT", "LONG", "hunter_core", Stage::Poi, "no poi in range");
        assert_eq!(envelope.hologram_verdict, "PASS");
        assert_eq!(envelope.session_verdict, "PASS");
        assert_eq!(envelope.poi_verdict, "FAIL");
        assert_eq!(envelope.cvd_verdict, "SKIP");
        assert_eq!(envelope.bot_trap_verdict, "SKIP");
        assert_eq!(envelope.blocking_stage.as_deref(), Some("poi"));
    }

    #[test]
    fn blocked_at_sizing_leaves_every_gate_verdict_as_pass() {
        let envelope = DecisionEnvelope::blocked("BTCUSDT", "LONG", "hunter_core", Stage::Sizing, "entry equals stop");
        assert_eq!(envelope.hologram_verdict, "PASS");
        assert_eq!(envelope.bot_trap_verdict, "PASS");
        assert_eq!(envelope.blocking_stage.as_deref(), Some("sizing"));
    }
}
