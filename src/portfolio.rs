// =============================================================================
// PortfolioManager — correlation, heat, and drawdown gates across positions
// =============================================================================
//
// Same `RwLock<Inner>` + date-roll-reset shape the risk engine uses, widened
// from four single-symbol circuit breakers to portfolio-level ones: rolling
// correlation between symbols, aggregate heat/notional caps, and tiered
// daily/weekly drawdown protection with a cooldown after a losing streak.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use tracing::warn;

const CORRELATION_WINDOW_HOURS: i64 = 24;
const CORRELATION_BLOCK_THRESHOLD: f64 = 0.7;
const MAX_CORRELATED_EXPOSURE_PCT: f64 = 0.40;
const MAX_PORTFOLIO_HEAT_PCT: f64 = 0.15;
const MAX_CONCURRENT_POSITIONS: usize = 5;
const MAX_TOTAL_NOTIONAL_PCT: f64 = 2.0;

const DAILY_DD_TIER_1: f64 = 0.03;
const DAILY_DD_TIER_2: f64 = 0.05;
const DAILY_DD_TIER_3: f64 = 0.07;
const WEEKLY_DD_HARD_STOP: f64 = 0.10;
const CONSECUTIVE_LOSS_PAUSE: u32 = 3;
const PAUSE_DURATION_HOURS: i64 = 24;
const WIN_RATE_WINDOW: usize = 20;
const WIN_RATE_ALERT_THRESHOLD: f64 = 0.40;

/// Three escalating levels of restriction a trade may fall into before the
/// weekly hard stop blocks everything outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawdownTier {
    Normal,
    Tier1,
    Tier2,
    Tier3,
    HardStop,
}

impl DrawdownTier {
    /// Size multiplier applied to a candidate position once a tier is
    /// active. Tier1/Tier2 scale down instead of blocking outright; Tier3
    /// and the weekly hard stop both reduce to zero, which `blocks()` also
    /// reports as an explicit halt so the caller can log why.
    pub fn size_multiplier(self) -> f64 {
        match self {
            DrawdownTier::Normal => 1.0,
            DrawdownTier::Tier1 => 0.75,
            DrawdownTier::Tier2 => 0.5,
            DrawdownTier::Tier3 => 0.0,
            DrawdownTier::HardStop => 0.0,
        }
    }
}

struct ReturnSample {
    at: DateTime<Utc>,
    ret: f64,
}

/// Tracks rolling returns per symbol and flags pairs too correlated to hold
/// simultaneously at full size.
pub struct CorrelationManager {
    returns: RwLock<HashMap<String, VecDeque<ReturnSample>>>,
}

impl CorrelationManager {
    pub fn new() -> Self {
        Self { returns: RwLock::new(HashMap::new()) }
    }

    pub fn record_return(&self, symbol: &str, ret: f64, now: DateTime<Utc>) {
        let mut map = self.returns.write();
        let series = map.entry(symbol.to_string()).or_default();
        series.push_back(ReturnSample { at: now, ret });
        let cutoff = now - ChronoDuration::hours(CORRELATION_WINDOW_HOURS);
        while series.front().is_some_and(|s| s.at < cutoff) {
            series.pop_front();
        }
    }

    /// Pearson correlation between two symbols' return series over the
    /// retained window. `None` if either has fewer than 3 samples.
    pub fn correlation(&self, a: &str, b: &str) -> Option<f64> {
        let map = self.returns.read();
        let xs: Vec<f64> = map.get(a)?.iter().map(|s| s.ret).collect();
        let ys: Vec<f64> = map.get(b)?.iter().map(|s| s.ret).collect();
        let n = xs.len().min(ys.len());
        if n < 3 {
            return None;
        }
        let xs = &xs[xs.len() - n..];
        let ys = &ys[ys.len() - n..];

        let mean_x = xs.iter().sum::<f64>() / n as f64;
        let mean_y = ys.iter().sum::<f64>() / n as f64;
        let mut cov = 0.0;
        let mut var_x = 0.0;
        let mut var_y = 0.0;
        for i in 0..n {
            let dx = xs[i] - mean_x;
            let dy = ys[i] - mean_y;
            cov += dx * dy;
            var_x += dx * dx;
            var_y += dy * dy;
        }
        if var_x <= 0.0 || var_y <= 0.0 {
            return Some(0.0);
        }
        Some(cov / (var_x.sqrt() * var_y.sqrt()))
    }

    /// True if `candidate` is too correlated with any currently open symbol.
    pub fn blocks(&self, candidate: &str, open_symbols: &[String]) -> Option<String> {
        for other in open_symbols {
            if other == candidate {
                continue;
            }
            if let Some(corr) = self.correlation(candidate, other) {
                if corr.abs() >= CORRELATION_BLOCK_THRESHOLD {
                    return Some(format!("correlation {corr:.2} with {other} exceeds {CORRELATION_BLOCK_THRESHOLD}"));
                }
            }
        }
        None
    }
}

impl Default for CorrelationManager {
    fn default() -> Self {
        Self::new()
    }
}

struct DrawdownInner {
    current_date: String,
    week_start: DateTime<Utc>,
    daily_pnl_pct: f64,
    weekly_pnl_pct: f64,
    consecutive_losses: u32,
    paused_until: Option<DateTime<Utc>>,
    recent_outcomes: VecDeque<bool>,
}

/// Tiered daily/weekly drawdown protection with a cooldown after a losing
/// streak, mirroring the risk engine's date-roll-reset shape but split into
/// daily and weekly horizons.
pub struct DrawdownProtector {
    state: RwLock<DrawdownInner>,
}

impl DrawdownProtector {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: RwLock::new(DrawdownInner {
                current_date: now.format("%Y-%m-%d").to_string(),
                week_start: now,
                daily_pnl_pct: 0.0,
                weekly_pnl_pct: 0.0,
                consecutive_losses: 0,
                paused_until: None,
                recent_outcomes: VecDeque::with_capacity(WIN_RATE_WINDOW),
            }),
        }
    }

    fn maybe_roll(&self, s: &mut DrawdownInner, now: DateTime<Utc>) {
        let today = now.format("%Y-%m-%d").to_string();
        if s.current_date != today {
            s.current_date = today;
            s.daily_pnl_pct = 0.0;
        }
        if (now - s.week_start) >= ChronoDuration::days(7) {
            s.week_start = now;
            s.weekly_pnl_pct = 0.0;
        }
    }

    pub fn record_trade(&self, pnl_pct: f64, now: DateTime<Utc>) {
        let mut s = self.state.write();
        self.maybe_roll(&mut s, now);
        s.daily_pnl_pct += pnl_pct;
        s.weekly_pnl_pct += pnl_pct;

        let is_loss = pnl_pct < 0.0;
        if is_loss {
            s.consecutive_losses += 1;
        } else {
            s.consecutive_losses = 0;
        }
        if s.consecutive_losses >= CONSECUTIVE_LOSS_PAUSE {
            s.paused_until = Some(now + ChronoDuration::hours(PAUSE_DURATION_HOURS));
            warn!(consecutive_losses = s.consecutive_losses, "drawdown protector: pausing after consecutive losses");
        }

        s.recent_outcomes.push_back(!is_loss);
        if s.recent_outcomes.len() > WIN_RATE_WINDOW {
            s.recent_outcomes.pop_front();
        }
    }

    pub fn win_rate_alert(&self) -> bool {
        let s = self.state.read();
        if s.recent_outcomes.len() < WIN_RATE_WINDOW {
            return false;
        }
        let wins = s.recent_outcomes.iter().filter(|w| **w).count();
        (wins as f64 / s.recent_outcomes.len() as f64) < WIN_RATE_ALERT_THRESHOLD
    }

    pub fn tier(&self, now: DateTime<Utc>) -> DrawdownTier {
        let mut s = self.state.write();
        self.maybe_roll(&mut s, now);
        let daily_loss = (-s.daily_pnl_pct).max(0.0);
        let weekly_loss = (-s.weekly_pnl_pct).max(0.0);

        if weekly_loss >= WEEKLY_DD_HARD_STOP {
            DrawdownTier::HardStop
        } else if daily_loss >= DAILY_DD_TIER_3 {
            DrawdownTier::Tier3
        } else if daily_loss >= DAILY_DD_TIER_2 {
            DrawdownTier::Tier2
        } else if daily_loss >= DAILY_DD_TIER_1 {
            DrawdownTier::Tier1
        } else {
            DrawdownTier::Normal
        }
    }

    pub fn blocks(&self, now: DateTime<Utc>) -> Option<String> {
        let paused_until = self.state.read().paused_until;
        if let Some(until) = paused_until {
            if now < until {
                return Some(format!("paused after consecutive losses until {until}"));
            }
        }
        match self.tier(now) {
            DrawdownTier::HardStop => Some("weekly drawdown hard stop triggered".to_string()),
            DrawdownTier::Tier3 => Some("daily drawdown tier 3 breached, new entries halted".to_string()),
            _ => None,
        }
    }
}

/// A single open position's contribution to portfolio heat/notional.
pub struct ExposureSnapshot {
    pub symbol: String,
    pub notional: f64,
    pub risk_pct: f64,
}

pub struct PortfolioManager {
    pub correlation: CorrelationManager,
    pub drawdown: DrawdownProtector,
}

impl PortfolioManager {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            correlation: CorrelationManager::new(),
            drawdown: DrawdownProtector::new(now),
        }
    }

    /// Runs every portfolio-level gate for a proposed new position. Returns
    /// the first blocking reason, or `None` if the trade may proceed.
    pub fn can_open(&self, candidate_symbol: &str, candidate_notional: f64, candidate_risk_pct: f64, equity: f64, open: &[ExposureSnapshot], now: DateTime<Utc>) -> Option<String> {
        if let Some(reason) = self.drawdown.blocks(now) {
            return Some(reason);
        }
        if open.len() >= MAX_CONCURRENT_POSITIONS {
            return Some(format!("max concurrent positions reached ({MAX_CONCURRENT_POSITIONS})"));
        }

        let open_symbols: Vec<String> = open.iter().map(|e| e.symbol.clone()).collect();
        if let Some(reason) = self.correlation.blocks(candidate_symbol, &open_symbols) {
            let correlated_notional: f64 = open
                .iter()
                .filter(|e| self.correlation.correlation(candidate_symbol, &e.symbol).map(|c| c.abs() >= CORRELATION_BLOCK_THRESHOLD).unwrap_or(false))
                .map(|e| e.notional)
                .sum();
            if (correlated_notional + candidate_notional) / equity.max(1.0) > MAX_CORRELATED_EXPOSURE_PCT {
                return Some(reason);
            }
        }

        let total_heat: f64 = open.iter().map(|e| e.risk_pct).sum::<f64>() + candidate_risk_pct;
        if total_heat > MAX_PORTFOLIO_HEAT_PCT {
            return Some(format!("portfolio heat {total_heat:.3} exceeds {MAX_PORTFOLIO_HEAT_PCT}"));
        }

        let total_notional: f64 = open.iter().map(|e| e.notional).sum::<f64>() + candidate_notional;
        if total_notional / equity.max(1.0) > MAX_TOTAL_NOTIONAL_PCT {
            return Some(format!("total notional exceeds {:.0}% of equity", MAX_TOTAL_NOTIONAL_PCT * 100.0));
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_blocks_highly_correlated_pair() {
        let mgr = CorrelationManager::new();
        let now = Utc::now();
        for i in 0..10 {
            let t = now - ChronoDuration::minutes(i);
            mgr.record_return("BTCUSDT", 0.01 * i as f64, t);
            mgr.record_return("ETHUSDT", 0.01 * i as f64, t);
        }
        let reason = mgr.blocks("BTCUSDT", &["ETHUSDT".to_string()]);
        assert!(reason.is_some());
    }

    #[test]
    fn drawdown_tier_escalates_with_daily_loss() {
        let now = Utc::now();
        let protector = DrawdownProtector::new(now);
        protector.record_trade(-0.04, now);
        assert_eq!(protector.tier(now), DrawdownTier::Tier1);
    }

    #[test]
    fn tier3_daily_drawdown_halts_new_entries() {
        let now = Utc::now();
        let protector = DrawdownProtector::new(now);
        protector.record_trade(-0.08, now);
        assert_eq!(protector.tier(now), DrawdownTier::Tier3);
        assert!(protector.blocks(now).is_some());
        assert_eq!(DrawdownTier::Tier3.size_multiplier(), 0.0);
        assert_eq!(DrawdownTier::Tier1.size_multiplier(), 0.75);
    }

    #[test]
    fn weekly_hard_stop_blocks_trading() {
        let now = Utc::now();
        let protector = DrawdownProtector::new(now);
        protector.record_trade(-0.11, now);
        assert!(protector.blocks(now).is_some());
    }

    #[test]
    fn three_consecutive_losses_pauses_for_24h() {
        let now = Utc::now();
        let protector = DrawdownProtector::new(now);
        protector.record_trade(-0.01, now);
        protector.record_trade(-0.01, now);
        protector.record_trade(-0.01, now);
        assert!(protector.blocks(now).is_some());
        assert!(protector.blocks(now + ChronoDuration::hours(25)).is_none());
    }

    #[test]
    fn max_concurrent_positions_blocks_a_sixth() {
        let now = Utc::now();
        let portfolio = PortfolioManager::new(now);
        let open: Vec<ExposureSnapshot> = (0..5)
            .map(|i| ExposureSnapshot { symbol: format!("SYM{i}"), notional: 100.0, risk_pct: 0.01 })
            .collect();
        let reason = portfolio.can_open("NEWSYM", 100.0, 0.01, 10_000.0, &open, now);
        assert!(reason.is_some());
    }
}
