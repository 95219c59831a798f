// =============================================================================
// EmergencyProtocolManager — graceful degradation under abnormal conditions
// =============================================================================
//
// Same warn-don't-act posture as the reconciliation module's safety policy:
// this manager never cancels orders or force-closes positions itself. It
// raises `Event::Emergency` and downgrades what new signal generation is
// allowed to do; an operator or the position manager's own stop logic
// handles anything already open.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::event_bus::{Event, EventBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmergencyTrigger {
    PredictionEmergency,
    LiquidityEmergency,
    FlowEmergency,
    TrapSaturation,
}

impl std::fmt::Display for EmergencyTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PredictionEmergency => write!(f, "PREDICTION_EMERGENCY"),
            Self::LiquidityEmergency => write!(f, "LIQUIDITY_EMERGENCY"),
            Self::FlowEmergency => write!(f, "FLOW_EMERGENCY"),
            Self::TrapSaturation => write!(f, "TRAP_SATURATION"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DegradationLevel {
    None,
    Partial,
    Significant,
    Emergency,
}

impl EmergencyTrigger {
    /// Notification cooldown — each trigger type is noisy in bursts, so a
    /// re-trip inside the window doesn't re-publish the event.
    fn cooldown(self) -> Duration {
        match self {
            Self::PredictionEmergency => Duration::minutes(15),
            Self::LiquidityEmergency => Duration::minutes(5),
            Self::FlowEmergency => Duration::minutes(10),
            Self::TrapSaturation => Duration::minutes(30),
        }
    }

    fn severity(self) -> DegradationLevel {
        match self {
            Self::LiquidityEmergency => DegradationLevel::Emergency,
            // Also the trigger a daily/weekly drawdown-tier breach raises.
            Self::PredictionEmergency => DegradationLevel::Emergency,
            Self::FlowEmergency => DegradationLevel::Significant,
            Self::TrapSaturation => DegradationLevel::Partial,
        }
    }
}

struct ActiveTrigger {
    since: DateTime<Utc>,
    last_notified: DateTime<Utc>,
}

pub struct EmergencyProtocolManager {
    active: RwLock<HashMap<EmergencyTrigger, ActiveTrigger>>,
    bus: EventBus,
}

impl EmergencyProtocolManager {
    pub fn new(bus: EventBus) -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
            bus,
        }
    }

    /// Raises a trigger. Publishes `Event::Emergency` unless the same
    /// trigger already fired within its cooldown window.
    pub fn raise(&self, trigger: EmergencyTrigger, reason: &str, now: DateTime<Utc>) {
        let mut active = self.active.write();
        let should_notify = match active.get(&trigger) {
            Some(existing) => now - existing.last_notified >= trigger.cooldown(),
            None => true,
        };

        active
            .entry(trigger)
            .and_modify(|t| {
                if should_notify {
                    t.last_notified = now;
                }
            })
            .or_insert(ActiveTrigger { since: now, last_notified: now });

        if should_notify {
            warn!(%trigger, reason, "emergency trigger raised");
            self.bus.publish(Event::Emergency { kind: trigger.to_string(), reason: reason.to_string() });
        }
    }

    /// Clears a trigger once the underlying condition resolves.
    pub fn clear(&self, trigger: EmergencyTrigger) {
        self.active.write().remove(&trigger);
    }

    /// The worst currently-active degradation level. `Emergency` halts new
    /// signal generation outright; `Significant` falls back to the
    /// conservative "classic" strategy path instead of the full pipeline.
    pub fn degradation_level(&self) -> DegradationLevel {
        self.active.read().keys().map(|t| t.severity()).max().unwrap_or(DegradationLevel::None)
    }

    pub fn active_triggers(&self) -> Vec<EmergencyTrigger> {
        self.active.read().keys().copied().collect()
    }

    pub fn should_use_classic_fallback(&self) -> bool {
        self.degradation_level() >= DegradationLevel::Significant
    }

    pub fn is_halted(&self) -> bool {
        self.degradation_level() == DegradationLevel::Emergency
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liquidity_emergency_halts_trading() {
        let mgr = EmergencyProtocolManager::new(EventBus::new());
        mgr.raise(EmergencyTrigger::LiquidityEmergency, "orderbook depth collapsed", Utc::now());
        assert!(mgr.is_halted());
    }

    #[test]
    fn prediction_emergency_halts_trading() {
        let mgr = EmergencyProtocolManager::new(EventBus::new());
        mgr.raise(EmergencyTrigger::PredictionEmergency, "daily drawdown tier 3 breached", Utc::now());
        assert!(mgr.is_halted());
    }

    #[test]
    fn trap_saturation_alone_only_partially_degrades() {
        let mgr = EmergencyProtocolManager::new(EventBus::new());
        mgr.raise(EmergencyTrigger::TrapSaturation, "too many suspect patterns", Utc::now());
        assert_eq!(mgr.degradation_level(), DegradationLevel::Partial);
        assert!(!mgr.should_use_classic_fallback());
    }

    #[test]
    fn flow_emergency_triggers_classic_fallback() {
        let mgr = EmergencyProtocolManager::new(EventBus::new());
        mgr.raise(EmergencyTrigger::FlowEmergency, "order flow inverted", Utc::now());
        assert!(mgr.should_use_classic_fallback());
        assert!(!mgr.is_halted());
    }

    #[test]
    fn clearing_a_trigger_restores_normal_level() {
        let mgr = EmergencyProtocolManager::new(EventBus::new());
        let now = Utc::now();
        mgr.raise(EmergencyTrigger::PredictionEmergency, "model disagreement", now);
        mgr.clear(EmergencyTrigger::PredictionEmergency);
        assert_eq!(mgr.degradation_level(), DegradationLevel::None);
    }

    #[test]
    fn repeat_trigger_inside_cooldown_does_not_renotify() {
        let mgr = EmergencyProtocolManager::new(EventBus::new());
        let now = Utc::now();
        mgr.raise(EmergencyTrigger::LiquidityEmergency, "first", now);
        let mut rx = mgr.bus.subscribe();
        mgr.raise(EmergencyTrigger::LiquidityEmergency, "second", now + Duration::minutes(1));
        assert!(rx.try_recv().is_err());
    }
}
