// =============================================================================
// InefficiencyMapper — FVG / Order Block / Liquidity Pool detection
// =============================================================================
//
// Runs once per minute against the closed-bar sequence for a symbol. Each
// detected POI decays in confidence with age using the same exponential
// half-life shape used for signal freshness elsewhere, just measured in bars
// instead of wall-clock seconds. Mitigation is permanent: once price trades
// through a POI's range, `mitigated` never flips back.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fractal::{detect_fractals, detect_bos};
use crate::market_data::Candle;
use crate::types::{Direction, Trend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoiKind {
    Fvg,
    OrderBlock,
    LiquidityPool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Poi {
    pub id: String,
    pub symbol: String,
    pub kind: PoiKind,
    pub direction: Direction,
    pub price_top: f64,
    pub price_bottom: f64,
    pub bar_index: usize,
    pub timestamp_ms: i64,
    pub confidence: f64,
    pub mitigated: bool,
    pub age_bars: u64,
    /// Confidence at detection time, before any age decay is applied.
    /// `confidence` is recomputed from this on every refresh so repeated
    /// scans never compound the decay.
    pub(crate) base_confidence: f64,
}

impl Poi {
    pub fn midpoint(&self) -> f64 {
        (self.price_top + self.price_bottom) / 2.0
    }

    pub fn contains(&self, price: f64) -> bool {
        price <= self.price_top && price >= self.price_bottom
    }
}

/// Half-life of a POI's confidence, in bars. Default picked to roughly
/// match a multi-day fade on M15 bars.
pub const DEFAULT_HALF_LIFE_BARS: f64 = 96.0;

fn decayed_confidence(base_confidence: f64, age_bars: u64, half_life_bars: f64) -> f64 {
    let decay = (-(age_bars as f64) * std::f64::consts::LN_2 / half_life_bars).exp();
    (base_confidence * decay).clamp(0.0, 100.0)
}

pub struct InefficiencyMapper {
    half_life_bars: f64,
    pois: Vec<Poi>,
}

impl InefficiencyMapper {
    pub fn new(half_life_bars: f64) -> Self {
        Self {
            half_life_bars,
            pois: Vec::new(),
        }
    }

    pub fn pois(&self) -> &[Poi] {
        &self.pois
    }

    /// Rescans the bar sequence for `symbol`, appending newly detected POIs
    /// and refreshing ages/confidence/mitigation for existing ones.
    pub fn scan(&mut self, symbol: &str, bars: &[Candle]) {
        self.detect_fvgs(symbol, bars);
        self.detect_order_blocks(symbol, bars);
        self.detect_liquidity_pools(symbol, bars);
        self.refresh(bars);
    }

    fn detect_fvgs(&mut self, symbol: &str, bars: &[Candle]) {
        if bars.len() < 3 {
            return;
        }
        for i in 1..bars.len() - 1 {
            let prev = &bars[i - 1];
            let next = &bars[i + 1];

            if prev.high < next.low {
                self.push_if_new(symbol, PoiKind::Fvg, Direction::Long, next.low, prev.high, i, bars[i].open_time, 70.0);
            } else if prev.low > next.high {
                self.push_if_new(symbol, PoiKind::Fvg, Direction::Short, prev.low, next.high, i, bars[i].open_time, 70.0);
            }
        }
    }

    fn detect_order_blocks(&mut self, symbol: &str, bars: &[Candle]) {
        let bos = detect_bos(bars, Trend::Bull).or_else(|| detect_bos(bars, Trend::Bear));
        let Some((bos_index, direction)) = bos else {
            return;
        };
        // The order block is the last opposite-colour bar immediately
        // preceding the BOS bar.
        let mut i = bos_index;
        while i > 0 {
            i -= 1;
            let bar = &bars[i];
            let is_bearish = bar.close < bar.open;
            let is_bullish = bar.close > bar.open;
            let opposite = match direction {
                Trend::Bull => is_bearish,
                Trend::Bear => is_bullish,
                Trend::Range => false,
            };
            if opposite {
                let dir = match direction {
                    Trend::Bull => Direction::Long,
                    Trend::Bear => Direction::Short,
                    Trend::Range => return,
                };
                self.push_if_new(symbol, PoiKind::OrderBlock, dir, bar.high, bar.low, i, bar.open_time, 80.0);
                return;
            }
        }
    }

    fn detect_liquidity_pools(&mut self, symbol: &str, bars: &[Candle]) {
        let fractals = detect_fractals(bars);
        if fractals.is_empty() {
            return;
        }
        let avg_volume: f64 = bars.iter().map(|b| b.volume).sum::<f64>() / bars.len().max(1) as f64;
        if avg_volume <= 0.0 {
            return;
        }
        for fractal in &fractals {
            let bar = &bars[fractal.index];
            let multiple = bar.volume / avg_volume;
            if multiple < 1.2 {
                continue;
            }
            let strength = (multiple * 20.0).min(100.0);
            let direction = if fractal.is_high { Direction::Short } else { Direction::Long };
            let (top, bottom) = if fractal.is_high {
                (bar.high, bar.high * 0.999)
            } else {
                (bar.low * 1.001, bar.low)
            };
            self.push_if_new(symbol, PoiKind::LiquidityPool, direction, top, bottom, fractal.index, bar.open_time, strength);
        }
    }

    fn push_if_new(
        &mut self,
        symbol: &str,
        kind: PoiKind,
        direction: Direction,
        price_top: f64,
        price_bottom: f64,
        bar_index: usize,
        timestamp_ms: i64,
        base_confidence: f64,
    ) {
        let duplicate = self.pois.iter().any(|p| {
            p.symbol == symbol
                && p.kind == kind
                && p.bar_index == bar_index
                && (p.price_top - price_top).abs() < f64::EPSILON
        });
        if duplicate {
            return;
        }
        self.pois.push(Poi {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            kind,
            direction,
            price_top,
            price_bottom,
            bar_index,
            timestamp_ms,
            confidence: base_confidence,
            base_confidence,
            mitigated: false,
            age_bars: 0,
        });
    }

    /// Updates every tracked POI's age, decayed confidence, and mitigation
    /// status against the latest bar sequence.
    fn refresh(&mut self, bars: &[Candle]) {
        let latest_index = bars.len().saturating_sub(1);
        for poi in &mut self.pois {
            poi.age_bars = latest_index.saturating_sub(poi.bar_index) as u64;
            poi.confidence = decayed_confidence(poi.base_confidence, poi.age_bars, self.half_life_bars);

            if !poi.mitigated {
                for bar in bars.iter().skip(poi.bar_index + 1) {
                    if bar.high >= poi.price_bottom && bar.low <= poi.price_top {
                        poi.mitigated = true;
                        break;
                    }
                }
            }
        }
    }

    /// Validates a POI's current state against an extended price history.
    /// Mirrors the mitigation/confidence update `refresh` performs, for
    /// callers that hold a POI id rather than re-scanning everything.
    pub fn validate_poi(&mut self, poi_id: &str, bars_since: &[Candle]) -> Option<(bool, f64)> {
        let poi = self.pois.iter_mut().find(|p| p.id == poi_id)?;
        if !poi.mitigated {
            for bar in bars_since {
                if bar.high >= poi.price_bottom && bar.low <= poi.price_top {
                    poi.mitigated = true;
                    break;
                }
            }
        }
        poi.age_bars += bars_since.len() as u64;
        poi.confidence = decayed_confidence(poi.base_confidence, poi.age_bars, self.half_life_bars);
        Some((poi.mitigated, poi.confidence))
    }
}

impl Default for InefficiencyMapper {
    fn default() -> Self {
        Self::new(DEFAULT_HALF_LIFE_BARS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open_time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle {
            open_time,
            close_time: open_time + 1,
            open,
            high,
            low,
            close,
            volume,
            quote_volume: volume * close,
            trades_count: 10,
            taker_buy_volume: volume / 2.0,
            taker_buy_quote_volume: volume * close / 2.0,
            is_closed: true,
        }
    }

    #[test]
    fn detects_bullish_fvg() {
        let bars = vec![
            bar(0, 100.0, 101.0, 99.0, 100.5, 10.0),
            bar(1, 101.0, 102.0, 100.5, 101.8, 10.0),
            bar(2, 103.0, 105.0, 103.0, 104.0, 10.0),
        ];
        let mut mapper = InefficiencyMapper::default();
        mapper.scan("BTCUSDT", &bars);
        let fvgs: Vec<_> = mapper.pois().iter().filter(|p| p.kind == PoiKind::Fvg).collect();
        assert_eq!(fvgs.len(), 1);
        assert_eq!(fvgs[0].direction, Direction::Long);
    }

    #[test]
    fn mitigation_is_permanent_once_set() {
        let mut mapper = InefficiencyMapper::default();
        mapper.pois.push(Poi {
            id: "test".into(),
            symbol: "BTCUSDT".into(),
            kind: PoiKind::Fvg,
            direction: Direction::Long,
            price_top: 101.0,
            price_bottom: 100.0,
            bar_index: 0,
            timestamp_ms: 0,
            confidence: 70.0,
            base_confidence: 70.0,
            mitigated: false,
            age_bars: 0,
        });

        let sweep = vec![bar(1, 100.5, 101.5, 99.5, 100.5, 5.0)];
        let (mitigated, _) = mapper.validate_poi("test", &sweep).unwrap();
        assert!(mitigated);

        // A longer history with no further sweep must still report mitigated.
        let later = vec![bar(2, 200.0, 201.0, 199.0, 200.0, 5.0)];
        let (still_mitigated, _) = mapper.validate_poi("test", &later).unwrap();
        assert!(still_mitigated);
    }

    #[test]
    fn confidence_decays_with_age() {
        let fresh = decayed_confidence(100.0, 0, 96.0);
        let aged = decayed_confidence(100.0, 96, 96.0);
        assert!((fresh - 100.0).abs() < 1e-9);
        assert!((aged - 50.0).abs() < 1.0);
        assert!(aged < fresh);
    }

    #[test]
    fn detects_order_block_before_bos() {
        // Bearish bar immediately preceding a bullish BOS.
        let bars = vec![
            bar(0, 100.0, 101.0, 98.0, 99.0, 10.0),
            bar(1, 99.0, 100.0, 98.5, 99.5, 10.0),
            bar(2, 99.5, 100.5, 99.0, 100.0, 10.0), // last opposite (bearish close < open) bar
            bar(3, 100.0, 110.0, 99.9, 109.0, 10.0), // BOS bar closing well above prior highs
        ];
        let mut mapper = InefficiencyMapper::default();
        mapper.scan("BTCUSDT", &bars);
        let obs: Vec<_> = mapper.pois().iter().filter(|p| p.kind == PoiKind::OrderBlock).collect();
        assert!(!obs.is_empty());
    }
}
