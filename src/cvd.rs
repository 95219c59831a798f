// =============================================================================
// CVDValidator — cumulative volume delta, absorption/distribution divergence
// =============================================================================
//
// Ingests aggressor-tagged trade ticks via a capability callback and tracks a
// rolling 10-minute cumulative volume delta. `detect_absorption`/
// `detect_distribution` below are a price/CVD divergence check used to
// confirm a POI. `passive_absorption_signature` is a different, volume-spike
// based check on the same tick window: a single oversized print that moves
// price almost nowhere, which is what the bot-trap gate means by "passive
// absorption" — size being absorbed without displacement.

use std::collections::VecDeque;

use crate::exchange::AggTrade;
use crate::types::Direction;

const WINDOW_SECS: i64 = 600;
const ABSORPTION_LOOKBACK_TICKS: usize = 10;
const ABSORPTION_VOLUME_MULTIPLE: f64 = 4.0;
const ABSORPTION_MAX_PRICE_MOVE_PCT: f64 = 0.0015;

#[derive(Debug, Clone, Copy)]
struct TickRecord {
    timestamp_ms: i64,
    price: f64,
    signed_size: f64,
}

/// Tracks the rolling CVD window for one symbol.
pub struct CvdValidator {
    window_secs: i64,
    ticks: VecDeque<TickRecord>,
    cvd: f64,
}

impl CvdValidator {
    pub fn new() -> Self {
        Self {
            window_secs: WINDOW_SECS,
            ticks: VecDeque::new(),
            cvd: 0.0,
        }
    }

    /// Feed one trade tick. `signed_size` convention: `+size` for a
    /// buy-aggressor trade, `-size` for a sell-aggressor trade.
    pub fn on_trade(&mut self, trade: &AggTrade) {
        let signed_size = if trade.is_buyer_aggressor { trade.size } else { -trade.size };
        self.cvd += signed_size;
        self.ticks.push_back(TickRecord {
            timestamp_ms: trade.timestamp_ms,
            price: trade.price,
            signed_size,
        });
        self.evict_stale(trade.timestamp_ms);
    }

    fn evict_stale(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.window_secs * 1000;
        while let Some(front) = self.ticks.front() {
            if front.timestamp_ms < cutoff {
                self.cvd -= front.signed_size;
                self.ticks.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn current_cvd(&self) -> f64 {
        self.cvd
    }

    pub fn tick_count(&self) -> usize {
        self.ticks.len()
    }

    /// True if the most recent ticks show a single print far above the
    /// window's average size that moved price almost nowhere — size being
    /// absorbed passively rather than driving a breakout.
    pub fn passive_absorption_signature(&self) -> bool {
        if self.ticks.len() < ABSORPTION_LOOKBACK_TICKS {
            return false;
        }
        let avg_size: f64 = self.ticks.iter().map(|t| t.signed_size.abs()).sum::<f64>() / self.ticks.len() as f64;
        if avg_size <= 0.0 {
            return false;
        }

        let window: Vec<TickRecord> = self
            .ticks
            .iter()
            .skip(self.ticks.len() - ABSORPTION_LOOKBACK_TICKS)
            .copied()
            .collect();
        let spike = window.iter().any(|t| t.signed_size.abs() >= avg_size * ABSORPTION_VOLUME_MULTIPLE);
        if !spike {
            return false;
        }

        let first_price = window.first().map(|t| t.price).unwrap_or(0.0);
        let last_price = window.last().map(|t| t.price).unwrap_or(0.0);
        if first_price <= 0.0 {
            return false;
        }
        let price_move_pct = (last_price - first_price).abs() / first_price;
        price_move_pct <= ABSORPTION_MAX_PRICE_MOVE_PCT
    }

    /// CVD value at the start of the rolling window, used to compute
    /// per-timeframe extrema over the retained ticks.
    pub fn window_extrema(&self) -> Option<(f64, f64)> {
        if self.ticks.is_empty() {
            return None;
        }
        let mut running = self.cvd;
        let mut high = running;
        let mut low = running;
        for tick in self.ticks.iter().rev() {
            running -= tick.signed_size;
            high = high.max(running);
            low = low.min(running);
        }
        Some((high, low))
    }
}

impl Default for CvdValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// A two-point observation of price and CVD used for divergence checks.
#[derive(Debug, Clone, Copy)]
pub struct PriceCvdPoint {
    pub price: f64,
    pub cvd: f64,
}

/// Bullish absorption: price prints a lower low while CVD prints a higher
/// low over the same span — sellers are being absorbed.
pub fn detect_absorption(prior: PriceCvdPoint, current: PriceCvdPoint) -> bool {
    current.price < prior.price && current.cvd > prior.cvd
}

/// Bearish distribution: price prints a higher high while CVD prints a lower
/// high — buyers are being distributed into.
pub fn detect_distribution(prior: PriceCvdPoint, current: PriceCvdPoint) -> bool {
    current.price > prior.price && current.cvd < prior.cvd
}

/// Confirms a candidate POI/direction against the current divergence state.
/// Returns `(confirmed, delta_confidence)` where `delta_confidence` is the
/// confidence adjustment applied to the POI on confirmation.
pub fn validate_with_cvd(direction: Direction, prior: PriceCvdPoint, current: PriceCvdPoint) -> (bool, i32) {
    match direction {
        Direction::Long => {
            let confirmed = detect_absorption(prior, current);
            (confirmed, if confirmed { 15 } else { -10 })
        }
        Direction::Short => {
            let confirmed = detect_distribution(prior, current);
            (confirmed, if confirmed { 15 } else { -10 })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(ts: i64, price: f64, size: f64, buyer_aggressor: bool) -> AggTrade {
        AggTrade {
            timestamp_ms: ts,
            price,
            size,
            is_buyer_aggressor: buyer_aggressor,
        }
    }

    #[test]
    fn cvd_accumulates_signed_size() {
        let mut validator = CvdValidator::new();
        validator.on_trade(&trade(0, 100.0, 1.0, true));
        validator.on_trade(&trade(1000, 100.0, 0.5, false));
        assert!((validator.current_cvd() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn stale_ticks_are_evicted_from_the_window() {
        let mut validator = CvdValidator::new();
        validator.on_trade(&trade(0, 100.0, 2.0, true));
        validator.on_trade(&trade(700_000, 100.0, 1.0, false));
        assert_eq!(validator.tick_count(), 1);
        assert!((validator.current_cvd() - -1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn detects_bullish_absorption_on_lower_low_higher_cvd_low() {
        let prior = PriceCvdPoint { price: 100.0, cvd: -5.0 };
        let current = PriceCvdPoint { price: 99.0, cvd: -2.0 };
        assert!(detect_absorption(prior, current));
        assert!(!detect_distribution(prior, current));
    }

    #[test]
    fn detects_bearish_distribution_on_higher_high_lower_cvd_high() {
        let prior = PriceCvdPoint { price: 100.0, cvd: 5.0 };
        let current = PriceCvdPoint { price: 101.0, cvd: 2.0 };
        assert!(detect_distribution(prior, current));
        assert!(!detect_absorption(prior, current));
    }

    #[test]
    fn passive_absorption_flags_an_oversized_print_with_no_displacement() {
        let mut validator = CvdValidator::new();
        for i in 0..9 {
            validator.on_trade(&trade(i * 1000, 100.0, 0.1, i % 2 == 0));
        }
        validator.on_trade(&trade(9000, 100.02, 5.0, true));
        assert!(validator.passive_absorption_signature());
    }

    #[test]
    fn no_passive_absorption_when_the_spike_moves_price() {
        let mut validator = CvdValidator::new();
        for i in 0..9 {
            validator.on_trade(&trade(i * 1000, 100.0, 0.1, i % 2 == 0));
        }
        validator.on_trade(&trade(9000, 105.0, 5.0, true));
        assert!(!validator.passive_absorption_signature());
    }

    #[test]
    fn validate_with_cvd_matches_direction_to_pattern() {
        let prior = PriceCvdPoint { price: 100.0, cvd: -5.0 };
        let current = PriceCvdPoint { price: 99.0, cvd: -2.0 };
        let (confirmed, delta) = validate_with_cvd(Direction::Long, prior, current);
        assert!(confirmed);
        assert_eq!(delta, 15);

        let (confirmed_short, delta_short) = validate_with_cvd(Direction::Short, prior, current);
        assert!(!confirmed_short);
        assert_eq!(delta_short, -10);
    }
}
