// =============================================================================
// HologramEngine & Scanner — per-symbol multi-timeframe alignment state
// =============================================================================
//
// For each symbol the engine computes a `TimeframeAnalysis` on Daily, H4, and
// M15 windows, folds them into a weighted alignment score, applies
// direction-aware veto rules, and maps the result onto a `HologramStatus`.
// The Scanner fans this out in parallel across the configured symbol list
// every cycle and ranks by score.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, warn};

use crate::config::{AlignmentWeights, EffectiveConfig};
use crate::event_bus::{Event, EventBus};
use crate::exchange::ExchangeAdapter;
use crate::fractal::{calc_dealing_range, classify_location, detect_bos, get_trend_state};
use crate::market_data::Candle;
use crate::types::{Direction, HologramStatus, Location, Timeframe, Trend};

#[derive(Debug, Clone, Copy)]
pub struct TimeframeAnalysis {
    pub trend: Trend,
    pub location: Location,
    pub mss: bool,
    pub bos: bool,
    pub atr: f64,
}

/// Awards additive points for trend definiteness, fresh BOS, and favorable
/// location relative to `direction`. Never subtracts, so the weighted sum is
/// monotone by construction in per-timeframe agreement.
fn score_timeframe(analysis: &TimeframeAnalysis, direction: Direction) -> f64 {
    let mut score = 0.0;

    let trend_favorable = matches!(
        (analysis.trend, direction),
        (Trend::Bull, Direction::Long) | (Trend::Bear, Direction::Short)
    );
    if trend_favorable {
        score += 50.0;
    }

    if analysis.bos {
        score += 25.0;
    }

    let location_favorable = match direction {
        Direction::Long => matches!(analysis.location, Location::Discount | Location::Equilibrium),
        Direction::Short => matches!(analysis.location, Location::Premium | Location::Equilibrium),
    };
    if location_favorable {
        score += 25.0;
    }

    score
}

pub fn analyze_timeframe(bars: &[Candle], dealing_window: usize, atr_period: usize) -> Option<TimeframeAnalysis> {
    if bars.len() < 5 {
        return None;
    }
    let trend = get_trend_state(bars);
    let range = calc_dealing_range(bars, dealing_window)?;
    let location = classify_location(bars.last()?.close, &range);
    let bos = detect_bos(bars, Trend::Bull).is_some() || detect_bos(bars, Trend::Bear).is_some();
    let mss = crate::fractal::detect_mss(bars).is_some();
    let atr = crate::fractal::atr(bars, atr_period).unwrap_or(0.0);
    Some(TimeframeAnalysis {
        trend,
        location,
        mss,
        bos,
        atr,
    })
}

#[derive(Debug, Clone)]
pub struct HologramState {
    pub symbol: String,
    pub daily: TimeframeAnalysis,
    pub h4: TimeframeAnalysis,
    pub m15: TimeframeAnalysis,
    pub alignment_score: f64,
    pub rs_score: f64,
    pub status: HologramStatus,
    pub veto_reasons: HashSet<String>,
    pub updated_at: chrono::DateTime<Utc>,
}

fn weighted_alignment_score(daily: &TimeframeAnalysis, h4: &TimeframeAnalysis, m15: &TimeframeAnalysis, direction: Direction, weights: &AlignmentWeights) -> f64 {
    weights.daily * score_timeframe(daily, direction)
        + weights.h4 * score_timeframe(h4, direction)
        + weights.m15 * score_timeframe(m15, direction)
}

fn apply_vetoes(daily: &TimeframeAnalysis, h4: &TimeframeAnalysis, direction: Direction) -> HashSet<String> {
    let mut vetoes = HashSet::new();
    match direction {
        Direction::Long => {
            if daily.trend == Trend::Bull && h4.location == Location::Premium {
                vetoes.insert("chasing premium".to_string());
            }
        }
        Direction::Short => {
            if daily.trend == Trend::Bear && h4.location == Location::Discount {
                vetoes.insert("shorting discount".to_string());
            }
        }
    }
    vetoes
}

fn map_status(score: f64, vetoes: &HashSet<String>, a_plus_threshold: f64, b_threshold: f64) -> HologramStatus {
    if !vetoes.is_empty() {
        HologramStatus::Conflict
    } else if score >= a_plus_threshold {
        HologramStatus::APlus
    } else if score >= b_threshold {
        HologramStatus::B
    } else {
        HologramStatus::NoPlay
    }
}

/// Computes relative strength of `symbol` vs BTC over the last 4 hours:
/// `return(symbol, 4h) - return(BTC, 4h)`.
pub fn relative_strength(symbol_closes: &[f64], btc_closes: &[f64]) -> Option<f64> {
    let ret = |closes: &[f64]| -> Option<f64> {
        let first = *closes.first()?;
        let last = *closes.last()?;
        if first.abs() < f64::EPSILON {
            return None;
        }
        Some((last - first) / first)
    };
    Some(ret(symbol_closes)? - ret(btc_closes)?)
}

/// Computes the full hologram state for a symbol given its three timeframe
/// windows, an intended direction (used only for scoring/veto — the scanner
/// evaluates both directions and keeps whichever produces the higher score),
/// and the resolved effective config.
pub fn compute_hologram(
    symbol: &str,
    daily_bars: &[Candle],
    h4_bars: &[Candle],
    m15_bars: &[Candle],
    btc_h4_bars: &[Candle],
    direction: Direction,
    cfg: &EffectiveConfig,
) -> Option<HologramState> {
    let daily = analyze_timeframe(daily_bars, 200, 14)?;
    let h4 = analyze_timeframe(h4_bars, 300, 14)?;
    let m15 = analyze_timeframe(m15_bars, 500, 14)?;

    let score = weighted_alignment_score(&daily, &h4, &m15, direction, &cfg.alignment_weights);
    let vetoes = apply_vetoes(&daily, &h4, direction);
    let status = map_status(score, &vetoes, cfg.a_plus_threshold, cfg.b_threshold);

    let symbol_closes: Vec<f64> = h4_bars.iter().map(|b| b.close).collect();
    let btc_closes: Vec<f64> = btc_h4_bars.iter().map(|b| b.close).collect();
    let rs_score = relative_strength(&symbol_closes, &btc_closes).unwrap_or(0.0);

    Some(HologramState {
        symbol: symbol.to_string(),
        daily,
        h4,
        m15,
        alignment_score: score,
        rs_score,
        status,
        veto_reasons: vetoes,
        updated_at: Utc::now(),
    })
}

impl HologramState {
    /// Gate used by the signal pipeline: RS must agree with direction beyond
    /// the configured threshold.
    pub fn rs_matches(&self, direction: Direction, rs_threshold: f64) -> bool {
        match direction {
            Direction::Long => self.rs_score >= rs_threshold,
            Direction::Short => self.rs_score <= -rs_threshold,
        }
    }
}

/// Soft and hard scan-cycle time budgets. Crossing the soft limit raises a
/// warning event; crossing the hard limit skips the remainder of the cycle.
pub const SCAN_SOFT_LIMIT: Duration = Duration::from_secs(30);
pub const SCAN_HARD_LIMIT: Duration = Duration::from_secs(90);
pub const DEFAULT_TOP_N: usize = 20;

/// Fans out per-symbol hologram computation, ranks by score, and selects the
/// top N for downstream monitoring. Partial per-symbol failures never abort
/// the cycle — they're logged and the symbol is skipped for this pass.
pub struct Scanner {
    top_n: usize,
}

impl Scanner {
    pub fn new(top_n: usize) -> Self {
        Self { top_n }
    }

    pub async fn scan(
        &self,
        adapter: Arc<dyn ExchangeAdapter>,
        symbols: &[String],
        direction: Direction,
        cfg: &EffectiveConfig,
        bus: &EventBus,
    ) -> Vec<HologramState> {
        let started = Instant::now();
        let mut futures = Vec::with_capacity(symbols.len());

        let btc_adapter = adapter.clone();
        let btc_h4 = btc_adapter.fetch_ohlcv("BTCUSDT", "4h", 300).await.unwrap_or_default();

        for symbol in symbols {
            let adapter = adapter.clone();
            let symbol = symbol.clone();
            let btc_h4 = btc_h4.clone();
            futures.push(async move {
                if started.elapsed() > SCAN_HARD_LIMIT {
                    return None;
                }
                let daily = adapter.fetch_ohlcv(&symbol, "1d", 200).await.ok()?;
                let h4 = adapter.fetch_ohlcv(&symbol, "4h", 300).await.ok()?;
                let m15 = adapter.fetch_ohlcv(&symbol, "15m", 500).await.ok()?;
                Some((symbol, daily, h4, m15, btc_h4))
            });
        }

        let results = futures_util::future::join_all(futures).await;

        let mut states: Vec<HologramState> = Vec::new();
        for result in results.into_iter().flatten() {
            let (symbol, daily, h4, m15, btc_h4) = result;
            match compute_hologram(&symbol, &daily, &h4, &m15, &btc_h4, direction, cfg) {
                Some(state) => {
                    bus.publish(Event::HologramUpdated {
                        symbol: state.symbol.clone(),
                        status: state.status,
                        alignment_score: state.alignment_score,
                    });
                    states.push(state);
                }
                None => {
                    debug!(symbol, "insufficient data for hologram computation, skipping");
                }
            }
        }

        if started.elapsed() > SCAN_SOFT_LIMIT {
            warn!(elapsed_ms = started.elapsed().as_millis(), "scan cycle exceeded soft time limit");
            bus.publish(Event::Error {
                component: "scanner".to_string(),
                message: "scan cycle exceeded soft time limit".to_string(),
            });
        }

        states.sort_by(|a, b| b.alignment_score.partial_cmp(&a.alignment_score).unwrap_or(std::cmp::Ordering::Equal));
        states.truncate(self.top_n);
        states
    }
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new(DEFAULT_TOP_N)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategyDefaults;

    fn bars(trend_up: bool, count: usize) -> Vec<Candle> {
        (0..count)
            .map(|i| {
                let base = if trend_up { 100.0 + i as f64 } else { 200.0 - i as f64 };
                Candle {
                    open_time: i as i64,
                    close_time: i as i64 + 1,
                    open: base,
                    high: base + 1.0,
                    low: base - 1.0,
                    close: base + if trend_up { 0.5 } else { -0.5 },
                    volume: 10.0,
                    quote_volume: 1000.0,
                    trades_count: 5,
                    taker_buy_volume: 5.0,
                    taker_buy_quote_volume: 500.0,
                    is_closed: true,
                }
            })
            .collect()
    }

    fn default_cfg() -> EffectiveConfig {
        let cm = crate::config::ConfigManager::new(StrategyDefaults::default()).unwrap();
        (*cm.effective()).clone()
    }

    #[test]
    fn score_is_monotone_in_favorable_agreement() {
        let weak = TimeframeAnalysis { trend: Trend::Range, location: Location::Equilibrium, mss: false, bos: false, atr: 1.0 };
        let strong = TimeframeAnalysis { trend: Trend::Bull, location: Location::Discount, mss: false, bos: true, atr: 1.0 };
        assert!(score_timeframe(&strong, Direction::Long) > score_timeframe(&weak, Direction::Long));
    }

    #[test]
    fn veto_chasing_premium_on_bull_daily_premium_h4() {
        let daily = TimeframeAnalysis { trend: Trend::Bull, location: Location::Equilibrium, mss: false, bos: false, atr: 1.0 };
        let h4 = TimeframeAnalysis { trend: Trend::Bull, location: Location::Premium, mss: false, bos: false, atr: 1.0 };
        let vetoes = apply_vetoes(&daily, &h4, Direction::Long);
        assert!(vetoes.contains("chasing premium"));
    }

    #[test]
    fn veto_shorting_discount_on_bear_daily_discount_h4() {
        let daily = TimeframeAnalysis { trend: Trend::Bear, location: Location::Equilibrium, mss: false, bos: false, atr: 1.0 };
        let h4 = TimeframeAnalysis { trend: Trend::Bear, location: Location::Discount, mss: false, bos: false, atr: 1.0 };
        let vetoes = apply_vetoes(&daily, &h4, Direction::Short);
        assert!(vetoes.contains("shorting discount"));
    }

    #[test]
    fn range_trend_and_equilibrium_never_veto() {
        let daily = TimeframeAnalysis { trend: Trend::Range, location: Location::Equilibrium, mss: false, bos: false, atr: 1.0 };
        let h4 = TimeframeAnalysis { trend: Trend::Range, location: Location::Equilibrium, mss: false, bos: false, atr: 1.0 };
        assert!(apply_vetoes(&daily, &h4, Direction::Long).is_empty());
        assert!(apply_vetoes(&daily, &h4, Direction::Short).is_empty());
    }

    #[test]
    fn status_maps_a_plus_b_conflict_no_play() {
        let vetoes = HashSet::new();
        assert_eq!(map_status(85.0, &vetoes, 80.0, 65.0), HologramStatus::APlus);
        assert_eq!(map_status(70.0, &vetoes, 80.0, 65.0), HologramStatus::B);
        assert_eq!(map_status(40.0, &vetoes, 80.0, 65.0), HologramStatus::NoPlay);
        let mut v = HashSet::new();
        v.insert("chasing premium".to_string());
        assert_eq!(map_status(95.0, &v, 80.0, 65.0), HologramStatus::Conflict);
    }

    #[test]
    fn relative_strength_is_signed_difference_of_returns() {
        let symbol_closes = vec![100.0, 110.0];
        let btc_closes = vec![100.0, 104.0];
        let rs = relative_strength(&symbol_closes, &btc_closes).unwrap();
        assert!((rs - 0.06).abs() < 1e-9);
    }

    #[test]
    fn compute_hologram_none_on_insufficient_bars() {
        let cfg = default_cfg();
        let result = compute_hologram("BTCUSDT", &bars(true, 3), &bars(true, 3), &bars(true, 3), &bars(true, 3), Direction::Long, &cfg);
        assert!(result.is_none());
    }
}
