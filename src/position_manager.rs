// =============================================================================
// PositionManager — OPEN -> BE_MOVED -> PARTIALED -> TRAILING -> CLOSED
// =============================================================================
//
// Same `RwLock<Vec<Position>>` shape as the position engine this replaces,
// generalized from a fixed TP1/TP2 ladder to R-multiple-driven transitions
// measured against the original entry/stop, never the moving trailing stop.

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::event_bus::{Event, EventBus};
use crate::types::{Direction, ExitReason, PositionState};

const BE_MOVE_R: f64 = 1.5;
const PARTIAL_R: f64 = 2.0;
const PARTIAL_CLOSE_FRACTION: f64 = 0.5;
const TRAIL_ATR_MULTIPLE: f64 = 1.0;
const TIGHTEN_AFTER_HOURS: i64 = 48;
const TIGHTENED_ATR_MULTIPLE: f64 = 0.5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub original_stop: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub quantity: f64,
    pub current_price: f64,
    pub state: PositionState,
    pub highest_favorable_price: f64,
    pub opened_at: chrono::DateTime<Utc>,
    pub closed_at: Option<chrono::DateTime<Utc>>,
    pub realized_pnl: f64,
}

impl Position {
    fn risk_per_unit(&self) -> f64 {
        (self.entry_price - self.original_stop).abs()
    }

    /// Favorable excursion expressed as a multiple of the original risk.
    fn r_multiple(&self, price: f64) -> f64 {
        let risk = self.risk_per_unit();
        if risk <= 0.0 {
            return 0.0;
        }
        self.direction.sign() * (price - self.entry_price) / risk
    }
}

pub struct PositionManager {
    open: RwLock<Vec<Position>>,
    closed: RwLock<Vec<Position>>,
    bus: EventBus,
}

impl PositionManager {
    pub fn new(bus: EventBus) -> Self {
        Self {
            open: RwLock::new(Vec::new()),
            closed: RwLock::new(Vec::new()),
            bus,
        }
    }

    pub fn open_position(&self, symbol: &str, direction: Direction, entry_price: f64, stop_loss: f64, take_profit: f64, quantity: f64) -> String {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let pos = Position {
            id: id.clone(),
            symbol: symbol.to_string(),
            direction,
            entry_price,
            original_stop: stop_loss,
            stop_loss,
            take_profit,
            quantity,
            current_price: entry_price,
            state: PositionState::Open,
            highest_favorable_price: entry_price,
            opened_at: now,
            closed_at: None,
            realized_pnl: 0.0,
        };
        info!(id = %id, symbol, ?direction, entry_price, stop_loss, take_profit, "position opened");
        self.bus.publish(Event::PositionUpdated { position_id: id.clone(), symbol: symbol.to_string(), state: PositionState::Open });
        self.open.write().push(pos);
        id
    }

    /// Updates price and advances the state machine for every open position
    /// on `symbol`. Transitions are monotone: a position never regresses to
    /// an earlier state, and a full close always takes precedence.
    pub fn on_price_update(&self, symbol: &str, price: f64, atr: f64) -> Vec<(String, ExitReason)> {
        let mut exits = Vec::new();
        let mut positions = self.open.write();

        for pos in positions.iter_mut().filter(|p| p.symbol == symbol) {
            pos.current_price = price;
            let favorable = match pos.direction {
                Direction::Long => price > pos.highest_favorable_price,
                Direction::Short => price < pos.highest_favorable_price,
            };
            if favorable {
                pos.highest_favorable_price = price;
            }

            if Self::stop_hit(pos, price) {
                exits.push((pos.id.clone(), ExitReason::StopLoss));
                continue;
            }
            if Self::target_hit(pos, price) {
                exits.push((pos.id.clone(), ExitReason::TakeProfit));
                continue;
            }

            let r = pos.r_multiple(price);
            let mut new_state = None;

            if pos.state == PositionState::Open && r >= BE_MOVE_R {
                pos.stop_loss = pos.entry_price;
                new_state = Some(PositionState::BeMoved);
            }

            if matches!(pos.state, PositionState::Open | PositionState::BeMoved) && r >= PARTIAL_R {
                let close_qty = pos.quantity * PARTIAL_CLOSE_FRACTION;
                let realized = pos.direction.sign() * (price - pos.entry_price) * close_qty;
                pos.quantity -= close_qty;
                pos.realized_pnl += realized;
                pos.stop_loss = pos.entry_price;
                new_state = Some(PositionState::Partialed);
                info!(id = %pos.id, close_qty, remaining = pos.quantity, realized, "position partialed at 2R");
            }

            if matches!(pos.state, PositionState::Partialed | PositionState::Trailing) {
                let age_hours = (Utc::now() - pos.opened_at).num_hours();
                let multiple = if age_hours >= TIGHTEN_AFTER_HOURS { TIGHTENED_ATR_MULTIPLE } else { TRAIL_ATR_MULTIPLE };
                let trail_distance = atr * multiple;
                let trail_stop = match pos.direction {
                    Direction::Long => pos.highest_favorable_price - trail_distance,
                    Direction::Short => pos.highest_favorable_price + trail_distance,
                };
                let tightens = match pos.direction {
                    Direction::Long => trail_stop > pos.stop_loss,
                    Direction::Short => trail_stop < pos.stop_loss,
                };
                if tightens {
                    pos.stop_loss = trail_stop;
                }
                new_state = Some(PositionState::Trailing);
            }

            if let Some(state) = new_state {
                if state != pos.state {
                    pos.state = state;
                    self.bus.publish(Event::PositionUpdated { position_id: pos.id.clone(), symbol: symbol.to_string(), state });
                }
            }
        }

        exits
    }

    fn stop_hit(pos: &Position, price: f64) -> bool {
        match pos.direction {
            Direction::Long => price <= pos.stop_loss,
            Direction::Short => price >= pos.stop_loss,
        }
    }

    fn target_hit(pos: &Position, price: f64) -> bool {
        match pos.direction {
            Direction::Long => price >= pos.take_profit,
            Direction::Short => price <= pos.take_profit,
        }
    }

    pub fn close_position(&self, id: &str, reason: ExitReason, close_price: f64) -> Option<f64> {
        let mut open = self.open.write();
        let idx = open.iter().position(|p| p.id == id)?;
        let mut pos = open.remove(idx);

        let final_pnl = pos.direction.sign() * (close_price - pos.entry_price) * pos.quantity;
        pos.realized_pnl += final_pnl;
        pos.current_price = close_price;
        pos.state = PositionState::Closed;
        pos.closed_at = Some(Utc::now());
        pos.quantity = 0.0;

        let total_pnl = pos.realized_pnl;
        info!(id, ?reason, close_price, realized_pnl = total_pnl, "position closed");
        self.bus.publish(Event::PositionUpdated { position_id: id.to_string(), symbol: pos.symbol.clone(), state: PositionState::Closed });
        self.closed.write().push(pos);
        Some(total_pnl)
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.open.read().clone()
    }

    pub fn closed_positions(&self, count: usize) -> Vec<Position> {
        self.closed.read().iter().rev().take(count).cloned().collect()
    }

    pub fn open_count(&self) -> usize {
        self.open.read().len()
    }
}

impl std::fmt::Debug for PositionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionManager")
            .field("open_positions", &self.open.read().len())
            .field("closed_positions", &self.closed.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moves_to_be_at_1_5r() {
        let mgr = PositionManager::new(EventBus::new());
        let id = mgr.open_position("BTCUSDT", Direction::Long, 100.0, 98.0, 112.0, 1.0);
        mgr.on_price_update("BTCUSDT", 103.0, 1.0); // 1.5R
        let pos = mgr.open_positions().into_iter().find(|p| p.id == id).unwrap();
        assert_eq!(pos.state, PositionState::BeMoved);
        assert!((pos.stop_loss - 100.0).abs() < 1e-9);
    }

    #[test]
    fn partials_at_2r_and_keeps_stop_at_breakeven() {
        let mgr = PositionManager::new(EventBus::new());
        let id = mgr.open_position("BTCUSDT", Direction::Long, 100.0, 98.0, 112.0, 2.0);
        mgr.on_price_update("BTCUSDT", 104.0, 1.0); // 2R
        let pos = mgr.open_positions().into_iter().find(|p| p.id == id).unwrap();
        assert_eq!(pos.state, PositionState::Partialed);
        assert!((pos.quantity - 1.0).abs() < 1e-9);
        assert!((pos.stop_loss - 100.0).abs() < 1e-9);
    }

    #[test]
    fn trails_by_one_atr_after_partial() {
        let mgr = PositionManager::new(EventBus::new());
        let id = mgr.open_position("BTCUSDT", Direction::Long, 100.0, 98.0, 112.0, 2.0);
        mgr.on_price_update("BTCUSDT", 104.0, 1.0);
        mgr.on_price_update("BTCUSDT", 106.0, 1.0);
        let pos = mgr.open_positions().into_iter().find(|p| p.id == id).unwrap();
        assert_eq!(pos.state, PositionState::Trailing);
        assert!((pos.stop_loss - 105.0).abs() < 1e-9);
    }

    #[test]
    fn stop_loss_triggers_exit() {
        let mgr = PositionManager::new(EventBus::new());
        mgr.open_position("BTCUSDT", Direction::Long, 100.0, 98.0, 112.0, 1.0);
        let exits = mgr.on_price_update("BTCUSDT", 97.0, 1.0);
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].1, ExitReason::StopLoss);
    }
}
