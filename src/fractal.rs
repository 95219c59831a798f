// =============================================================================
// Fractal Math — pure numerical kernels over a bar sequence
// =============================================================================
//
// Everything here is a pure function of its inputs: no shared state, no I/O,
// no clock reads. Re-invoking any function with the same bars yields the same
// output, which is what lets the hologram engine treat a timeframe analysis as
// a cacheable, atomically-replaceable snapshot.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::indicators::atr::calculate_atr;
use crate::market_data::Candle;
use crate::types::{Location, Trend};

/// A Bill Williams 5-bar fractal: a bar whose high (or low) is a strict local
/// extreme against its two neighbours on each side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fractal {
    pub index: usize,
    pub price: f64,
    pub is_high: bool,
}

/// `(high, mid, low)` of the dealing range over the lookback window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DealingRange {
    pub high: f64,
    pub mid: f64,
    pub low: f64,
}

/// Fraction of the premium/discount band width used to classify location.
/// `k ≈ 0.1`: price within the innermost 80% of the range is EQUILIBRIUM.
const LOCATION_K: f64 = 0.1;

/// Detect 5-bar fractal highs and lows.
///
/// A bar at index `i` is a fractal high when `high[i]` strictly exceeds both
/// of its two left neighbours and both of its two right neighbours;
/// analogously for fractal lows. The output indices are always a subset of
/// `[2, N-3]`, and the function returns an empty vector when `bars.len() < 5`.
pub fn detect_fractals(bars: &[Candle]) -> Vec<Fractal> {
    let n = bars.len();
    if n < 5 {
        return Vec::new();
    }

    let mut fractals = Vec::new();
    for i in 2..n - 2 {
        let h = bars[i].high;
        if h > bars[i - 2].high
            && h > bars[i - 1].high
            && h > bars[i + 1].high
            && h > bars[i + 2].high
        {
            fractals.push(Fractal {
                index: i,
                price: h,
                is_high: true,
            });
        }

        let l = bars[i].low;
        if l < bars[i - 2].low && l < bars[i - 1].low && l < bars[i + 1].low && l < bars[i + 2].low
        {
            fractals.push(Fractal {
                index: i,
                price: l,
                is_high: false,
            });
        }
    }

    fractals
}

/// Scan for a close beyond the most recent opposing swing extreme.
///
/// For `Trend::Bull`, this looks for a close above the most recent fractal
/// high formed before the close; for `Trend::Bear`, a close below the most
/// recent fractal low. Returns `(bar_index, direction)` of the first such
/// break found when scanning forward, or `None`.
pub fn detect_bos(bars: &[Candle], trend: Trend) -> Option<(usize, Trend)> {
    let fractals = detect_fractals(bars);
    if fractals.is_empty() {
        return None;
    }

    match trend {
        Trend::Bull => {
            let mut last_high: Option<f64> = None;
            for (i, bar) in bars.iter().enumerate() {
                if let Some(h) = fractals
                    .iter()
                    .filter(|f| f.is_high && f.index < i)
                    .map(|f| f.price)
                    .fold(None, |acc: Option<f64>, p| Some(acc.map_or(p, |a| a.max(p))))
                {
                    last_high = Some(h);
                }
                if let Some(h) = last_high {
                    if bar.close > h {
                        return Some((i, Trend::Bull));
                    }
                }
            }
            None
        }
        Trend::Bear => {
            let mut last_low: Option<f64> = None;
            for (i, bar) in bars.iter().enumerate() {
                if let Some(l) = fractals
                    .iter()
                    .filter(|f| !f.is_high && f.index < i)
                    .map(|f| f.price)
                    .fold(None, |acc: Option<f64>, p| Some(acc.map_or(p, |a| a.min(p))))
                {
                    last_low = Some(l);
                }
                if let Some(l) = last_low {
                    if bar.close < l {
                        return Some((i, Trend::Bear));
                    }
                }
            }
            None
        }
        Trend::Range => None,
    }
}

/// Detect the first close on the opposite side of the last same-side swing
/// after a prior BOS — a Market Structure Shift indicating trend reversal.
///
/// `bars` must be in chronological order. Returns `(bar_index, new_trend)` of
/// the reversal, or `None` if no BOS has occurred yet or no reversal follows.
pub fn detect_mss(bars: &[Candle]) -> Option<(usize, Trend)> {
    let bull_bos = detect_bos(bars, Trend::Bull);
    let bear_bos = detect_bos(bars, Trend::Bear);

    let (bos_index, bos_trend) = match (bull_bos, bear_bos) {
        (Some(b), Some(s)) => {
            if b.0 >= s.0 {
                b
            } else {
                s
            }
        }
        (Some(b), None) => b,
        (None, Some(s)) => s,
        (None, None) => return None,
    };

    if bos_index + 1 >= bars.len() {
        return None;
    }

    let after = &bars[bos_index + 1..];
    let reversal_trend = bos_trend.opposite_trend();
    detect_bos(after, reversal_trend).map(|(rel_idx, t)| (bos_index + 1 + rel_idx, t))
}

impl Trend {
    fn opposite_trend(self) -> Trend {
        match self {
            Trend::Bull => Trend::Bear,
            Trend::Bear => Trend::Bull,
            Trend::Range => Trend::Range,
        }
    }
}

/// Compute the dealing range `(high, mid, low)` over the last `window` bars.
///
/// Returns `None` when `bars` is empty. `window` is clamped to `bars.len()`.
pub fn calc_dealing_range(bars: &[Candle], window: usize) -> Option<DealingRange> {
    if bars.is_empty() || window == 0 {
        return None;
    }
    let window = window.min(bars.len());
    let slice = &bars[bars.len() - window..];

    let high = slice.iter().map(|b| b.high).fold(f64::MIN, f64::max);
    let low = slice.iter().map(|b| b.low).fold(f64::MAX, f64::min);
    let mid = (high + low) / 2.0;

    Some(DealingRange { high, mid, low })
}

/// Classify `price` within `range` as PREMIUM / EQUILIBRIUM / DISCOUNT.
pub fn classify_location(price: f64, range: &DealingRange) -> Location {
    let upper_band = range.mid + LOCATION_K * (range.high - range.mid);
    let lower_band = range.mid - LOCATION_K * (range.mid - range.low);

    if price >= upper_band {
        Location::Premium
    } else if price <= lower_band {
        Location::Discount
    } else {
        Location::Equilibrium
    }
}

/// Classify the dominant trend from the fractal sequence: BULL on higher-highs
/// *and* higher-lows, BEAR on lower-highs *and* lower-lows, else RANGE.
pub fn get_trend_state(bars: &[Candle]) -> Trend {
    let fractals = detect_fractals(bars);
    let highs: Vec<f64> = fractals.iter().filter(|f| f.is_high).map(|f| f.price).collect();
    let lows: Vec<f64> = fractals.iter().filter(|f| !f.is_high).map(|f| f.price).collect();

    let higher_highs = is_monotone_increasing(&highs);
    let higher_lows = is_monotone_increasing(&lows);
    let lower_highs = is_monotone_decreasing(&highs);
    let lower_lows = is_monotone_decreasing(&lows);

    if higher_highs && higher_lows {
        Trend::Bull
    } else if lower_highs && lower_lows {
        Trend::Bear
    } else {
        Trend::Range
    }
}

fn is_monotone_increasing(series: &[f64]) -> bool {
    series.len() >= 2 && series.windows(2).all(|w| w[1] > w[0])
}

fn is_monotone_decreasing(series: &[f64]) -> bool {
    series.len() >= 2 && series.windows(2).all(|w| w[1] < w[0])
}

/// Shared ATR kernel, reused by every component that needs a volatility
/// estimate (signal sizing, position trailing, dealing-range buffers) so the
/// crate keeps a single Wilder-smoothed implementation.
pub fn atr(bars: &[Candle], period: usize) -> Option<f64> {
    calculate_atr(bars, period)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(h: f64, l: f64, c: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open: c,
            high: h,
            low: l,
            close: c,
            volume: 1.0,
            quote_volume: 0.0,
            trades_count: 0,
            taker_buy_volume: 0.0,
            taker_buy_quote_volume: 0.0,
            is_closed: true,
        }
    }

    #[test]
    fn fractals_empty_below_five_bars() {
        let bars = vec![bar(10.0, 9.0, 9.5); 4];
        assert!(detect_fractals(&bars).is_empty());
    }

    #[test]
    fn fractals_are_deterministic() {
        let bars = vec![
            bar(10.0, 9.0, 9.5),
            bar(11.0, 9.5, 10.0),
            bar(15.0, 10.0, 11.0),
            bar(11.0, 9.5, 10.0),
            bar(10.0, 9.0, 9.5),
        ];
        let a = detect_fractals(&bars);
        let b = detect_fractals(&bars);
        assert_eq!(a, b);
        assert!(a.iter().all(|f| f.index >= 2 && f.index <= bars.len() - 3));
    }

    #[test]
    fn detects_high_fractal_at_center() {
        let bars = vec![
            bar(10.0, 9.0, 9.5),
            bar(11.0, 9.5, 10.0),
            bar(15.0, 10.0, 11.0),
            bar(11.0, 9.5, 10.0),
            bar(10.0, 9.0, 9.5),
        ];
        let fractals = detect_fractals(&bars);
        assert!(fractals.iter().any(|f| f.index == 2 && f.is_high));
    }

    #[test]
    fn dealing_range_computes_high_mid_low() {
        let bars = vec![bar(110.0, 90.0, 100.0), bar(120.0, 95.0, 105.0)];
        let range = calc_dealing_range(&bars, 2).unwrap();
        assert_eq!(range.high, 120.0);
        assert_eq!(range.low, 90.0);
        assert_eq!(range.mid, 105.0);
    }

    #[test]
    fn classify_location_extremes() {
        let range = DealingRange {
            high: 100.0,
            mid: 50.0,
            low: 0.0,
        };
        assert_eq!(classify_location(95.0, &range), Location::Premium);
        assert_eq!(classify_location(5.0, &range), Location::Discount);
        assert_eq!(classify_location(50.0, &range), Location::Equilibrium);
    }

    #[test]
    fn trend_state_range_when_insufficient_fractals() {
        let bars = vec![bar(10.0, 9.0, 9.5); 4];
        assert_eq!(get_trend_state(&bars), Trend::Range);
    }

    #[test]
    fn atr_reuses_shared_indicator_kernel() {
        let bars: Vec<Candle> = (0..20)
            .map(|i| bar(100.0 + i as f64, 99.0 + i as f64, 99.5 + i as f64))
            .collect();
        assert!(atr(&bars, 14).is_some());
    }
}
