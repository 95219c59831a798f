// =============================================================================
// BacktestEngine — deterministic historical replay and performance metrics
// =============================================================================
//
// Implements `ExchangeAdapter` over recorded bars so the exact same signal
// generation, execution, and position management code paths that run live
// also run here. Every stochastic element (post-only non-fill, slippage) is
// driven by a seeded PRNG so the same seed, config, and data always produce
// the same trades and metrics.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::exchange::{AggTrade, BoxFuture, ExchangeAdapter, OrderParams, OrderType};
use crate::market_data::Candle;
use crate::types::{Direction, ExitReason};

const POST_ONLY_SLIPPAGE_PCT: f64 = 0.001;
const IOC_SLIPPAGE_PCT: f64 = 0.002;
const MARKET_SLIPPAGE_PCT: f64 = 0.003;
const POST_ONLY_NON_FILL_PROB: f64 = 0.10;
const MAKER_FEE_PCT: f64 = -0.0001;
const TAKER_FEE_PCT: f64 = 0.0005;

/// A single closed trade produced by the replay, with enough detail to
/// reconstruct every aggregate metric without re-reading the bar history.
#[derive(Debug, Clone, Serialize)]
pub struct BacktestTrade {
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub r_multiple: f64,
    pub fees_paid: f64,
    pub slippage_paid: f64,
    pub hold_time_secs: i64,
    pub exit_reason: ExitReason,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub regime: Option<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct BacktestMetrics {
    pub total_trades: usize,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub sharpe: f64,
    pub sortino: f64,
    pub calmar: f64,
    pub max_drawdown_pct: f64,
    pub max_drawdown_duration_secs: i64,
    pub equity_curve: Vec<f64>,
    pub drawdown_curve: Vec<f64>,
    pub consecutive_loss_clusters: Vec<LossCluster>,
}

/// A run of consecutive losing trades, annotated with the regime label
/// reported by the candidate's bars while the cluster was forming (if any
/// bar in the cluster carried one — the first non-`None` wins).
#[derive(Debug, Clone, Serialize)]
pub struct LossCluster {
    pub length: usize,
    pub total_r: f64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub regime: Option<String>,
}

/// One symbol's recorded bar history plus an optional per-bar regime label,
/// fed to the engine ahead of a run.
#[derive(Debug, Clone)]
pub struct ScenarioBars {
    pub symbol: String,
    pub candles: Vec<Candle>,
    pub regime_labels: Vec<Option<String>>,
}

struct ReplayState {
    rng: StdRng,
    bars: HashMap<String, ScenarioBars>,
    cursor: HashMap<String, usize>,
    equity: f64,
}

/// Deterministic `ExchangeAdapter` over recorded bars. Construct with a
/// fixed `seed` so the same scenario always produces the same trades.
pub struct BacktestEngine {
    state: Mutex<ReplayState>,
    starting_equity: f64,
}

impl BacktestEngine {
    pub fn new(seed: u64, starting_equity: f64, scenarios: Vec<ScenarioBars>) -> Self {
        let mut bars = HashMap::new();
        let mut cursor = HashMap::new();
        for s in scenarios {
            cursor.insert(s.symbol.clone(), 0);
            bars.insert(s.symbol.clone(), s);
        }
        Self {
            state: Mutex::new(ReplayState {
                rng: StdRng::seed_from_u64(seed),
                bars,
                cursor,
                equity: starting_equity,
            }),
            starting_equity,
        }
    }

    /// Advances every symbol's cursor by one bar. Returns `false` once every
    /// series is exhausted.
    pub fn advance(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let mut any_advanced = false;
        let symbols: Vec<String> = state.bars.keys().cloned().collect();
        for symbol in symbols {
            let len = state.bars[&symbol].candles.len();
            let cur = state.cursor.get_mut(&symbol).unwrap();
            if *cur + 1 < len {
                *cur += 1;
                any_advanced = true;
            }
        }
        any_advanced
    }

    fn current_candle(&self, symbol: &str) -> Option<Candle> {
        let state = self.state.lock().unwrap();
        let scenario = state.bars.get(symbol)?;
        let cursor = *state.cursor.get(symbol)?;
        scenario.candles.get(cursor).cloned()
    }

    fn current_regime(&self, symbol: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        let scenario = state.bars.get(symbol)?;
        let cursor = *state.cursor.get(symbol)?;
        scenario.regime_labels.get(cursor).cloned().flatten()
    }

    /// Resolves a fill and exit for a simulated trade opened at `entry_price`
    /// and closed at `exit_price`, applying the slippage and fee model for
    /// `order_type`. Returns the net trade record.
    pub fn close_simulated_trade(
        &self,
        symbol: &str,
        direction: Direction,
        order_type: OrderType,
        entry_price: f64,
        exit_price: f64,
        quantity: f64,
        risk_per_unit: f64,
        exit_reason: ExitReason,
        opened_at: DateTime<Utc>,
        closed_at: DateTime<Utc>,
    ) -> BacktestTrade {
        let slippage_pct = match order_type {
            OrderType::PostOnly => POST_ONLY_SLIPPAGE_PCT,
            OrderType::Ioc => IOC_SLIPPAGE_PCT,
            OrderType::Market => MARKET_SLIPPAGE_PCT,
        };
        let fee_pct = match order_type {
            OrderType::PostOnly => MAKER_FEE_PCT,
            OrderType::Ioc | OrderType::Market => TAKER_FEE_PCT,
        };

        let notional = entry_price * quantity;
        let slippage_paid = notional * slippage_pct;
        let fees_paid = notional * fee_pct;

        let gross_pnl = direction.sign() * (exit_price - entry_price) * quantity;
        let net_pnl = gross_pnl - slippage_paid - fees_paid;
        let r_multiple = if risk_per_unit > 0.0 {
            net_pnl / (risk_per_unit * quantity)
        } else {
            0.0
        };

        {
            let mut state = self.state.lock().unwrap();
            state.equity += net_pnl;
        }

        BacktestTrade {
            symbol: symbol.to_string(),
            direction,
            entry_price,
            exit_price,
            quantity,
            r_multiple,
            fees_paid,
            slippage_paid,
            hold_time_secs: (closed_at - opened_at).num_seconds(),
            exit_reason,
            opened_at,
            closed_at,
            regime: self.current_regime(symbol),
        }
    }

    pub fn equity(&self) -> f64 {
        self.state.lock().unwrap().equity
    }
}

impl ExchangeAdapter for BacktestEngine {
    fn fetch_ohlcv<'a>(&'a self, symbol: &'a str, _timeframe: &'a str, limit: u32) -> BoxFuture<'a, Vec<Candle>> {
        Box::pin(async move {
            let state = self.state.lock().unwrap();
            let scenario = state
                .bars
                .get(symbol)
                .ok_or_else(|| anyhow!("no recorded bars for {symbol}"))?;
            let cursor = *state.cursor.get(symbol).unwrap_or(&0);
            let start = cursor.saturating_sub(limit as usize);
            Ok(scenario.candles[start..=cursor].to_vec())
        })
    }

    fn get_current_price<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, f64> {
        Box::pin(async move {
            self.current_candle(symbol)
                .map(|c| c.close)
                .ok_or_else(|| anyhow!("no recorded bars for {symbol}"))
        })
    }

    fn get_equity<'a>(&'a self) -> BoxFuture<'a, f64> {
        Box::pin(async move { Ok(self.equity()) })
    }

    fn subscribe_agg_trades<'a>(
        &'a self,
        _symbol: &'a str,
        _on_trade: Box<dyn FnMut(AggTrade) + Send>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move { Ok(()) })
    }

    /// Post-only orders fail to fill with `POST_ONLY_NON_FILL_PROB`
    /// probability, drawn from the engine's seeded PRNG. Other order types
    /// always "place" — fill resolution happens in `close_simulated_trade`.
    fn place_order<'a>(&'a self, params: OrderParams) -> BoxFuture<'a, String> {
        Box::pin(async move {
            if params.order_type == OrderType::PostOnly {
                let roll: f64 = self.state.lock().unwrap().rng.gen();
                if roll < POST_ONLY_NON_FILL_PROB {
                    return Err(anyhow!("simulated post-only non-fill"));
                }
            }
            Ok(format!("backtest-{}-{}", params.symbol, Utc::now().timestamp_millis()))
        })
    }

    fn cancel_order<'a>(&'a self, _symbol: &'a str, _order_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move { Ok(()) })
    }

    fn set_stop_loss<'a>(&'a self, _symbol: &'a str, _price: f64) -> BoxFuture<'a, ()> {
        Box::pin(async move { Ok(()) })
    }

    fn set_take_profit<'a>(&'a self, _symbol: &'a str, _price: f64) -> BoxFuture<'a, ()> {
        Box::pin(async move { Ok(()) })
    }

    fn set_leverage<'a>(&'a self, _symbol: &'a str, _leverage: f64) -> BoxFuture<'a, ()> {
        Box::pin(async move { Ok(()) })
    }

    fn is_connected(&self) -> bool {
        true
    }
}

/// Computes aggregate performance metrics over a completed run's trade list.
/// `risk_free_rate` is a per-trade hurdle (usually 0.0) subtracted from each
/// R-multiple before the Sharpe/Sortino ratio is taken.
pub fn compute_metrics(trades: &[BacktestTrade], starting_equity: f64, risk_free_rate: f64) -> BacktestMetrics {
    if trades.is_empty() {
        return BacktestMetrics::default();
    }

    let total_trades = trades.len();
    let wins = trades.iter().filter(|t| t.r_multiple > 0.0).count();
    let win_rate = wins as f64 / total_trades as f64;

    let gross_profit: f64 = trades.iter().map(|t| t.r_multiple).filter(|&r| r > 0.0).sum();
    let gross_loss: f64 = trades.iter().map(|t| t.r_multiple).filter(|&r| r < 0.0).map(f64::abs).sum();
    let profit_factor = if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else if gross_profit > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    let returns: Vec<f64> = trades.iter().map(|t| t.r_multiple - risk_free_rate).collect();
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    let std_dev = variance.sqrt();
    let sharpe = if std_dev > 0.0 { mean / std_dev } else { 0.0 };

    let downside: Vec<f64> = returns.iter().copied().filter(|&r| r < 0.0).collect();
    let downside_dev = if downside.is_empty() {
        0.0
    } else {
        (downside.iter().map(|r| r.powi(2)).sum::<f64>() / downside.len() as f64).sqrt()
    };
    let sortino = if downside_dev > 0.0 { mean / downside_dev } else { 0.0 };

    // Equity curve in account-currency terms, reconstructed from each
    // trade's net PnL against fixed fractional risk of 1R per unit risked.
    let mut equity_curve = Vec::with_capacity(total_trades + 1);
    let mut equity = starting_equity;
    equity_curve.push(equity);
    let risk_per_trade = starting_equity * 0.01;
    for t in trades {
        equity += t.r_multiple * risk_per_trade;
        equity_curve.push(equity);
    }

    let mut peak = equity_curve[0];
    let mut max_dd_pct = 0.0_f64;
    let mut drawdown_curve = Vec::with_capacity(equity_curve.len());
    let mut dd_start_idx = 0;
    let mut max_dd_duration_secs = 0_i64;
    let mut current_dd_start_idx = 0;
    for (i, &e) in equity_curve.iter().enumerate() {
        if e > peak {
            peak = e;
            current_dd_start_idx = i;
        }
        let dd_pct = if peak > 0.0 { (peak - e) / peak } else { 0.0 };
        drawdown_curve.push(dd_pct);
        if dd_pct > max_dd_pct {
            max_dd_pct = dd_pct;
            dd_start_idx = current_dd_start_idx;
            let start_time = if dd_start_idx == 0 { trades[0].opened_at } else { trades[dd_start_idx - 1].closed_at };
            let end_time = if i == 0 { trades[0].opened_at } else { trades[i - 1].closed_at };
            max_dd_duration_secs = (end_time - start_time).num_seconds().max(0);
        }
    }

    let total_return_pct = if starting_equity > 0.0 {
        (equity - starting_equity) / starting_equity
    } else {
        0.0
    };
    let calmar = if max_dd_pct > 0.0 { total_return_pct / max_dd_pct } else { 0.0 };

    BacktestMetrics {
        total_trades,
        win_rate,
        profit_factor,
        sharpe,
        sortino,
        calmar,
        max_drawdown_pct: max_dd_pct,
        max_drawdown_duration_secs: max_dd_duration_secs,
        equity_curve,
        drawdown_curve,
        consecutive_loss_clusters: find_loss_clusters(trades),
    }
}

/// Finds every run of 2+ consecutive losing trades and annotates each with
/// the first non-`None` regime label reported during the run.
fn find_loss_clusters(trades: &[BacktestTrade]) -> Vec<LossCluster> {
    let mut clusters = Vec::new();
    let mut run_start: Option<usize> = None;

    for (i, t) in trades.iter().enumerate() {
        let is_loss = t.r_multiple < 0.0;
        match (is_loss, run_start) {
            (true, None) => run_start = Some(i),
            (false, Some(start)) => {
                push_cluster_if_long_enough(&mut clusters, trades, start, i);
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(start) = run_start {
        push_cluster_if_long_enough(&mut clusters, trades, start, trades.len());
    }
    clusters
}

fn push_cluster_if_long_enough(clusters: &mut Vec<LossCluster>, trades: &[BacktestTrade], start: usize, end: usize) {
    if end - start < 2 {
        return;
    }
    let slice = &trades[start..end];
    clusters.push(LossCluster {
        length: slice.len(),
        total_r: slice.iter().map(|t| t.r_multiple).sum(),
        started_at: slice[0].opened_at,
        ended_at: slice[slice.len() - 1].closed_at,
        regime: slice.iter().find_map(|t| t.regime.clone()),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn sample_trade(r_multiple: f64, idx: i64) -> BacktestTrade {
        let opened = Utc::now() + ChronoDuration::hours(idx);
        BacktestTrade {
            symbol: "BTCUSDT".to_string(),
            direction: Direction::Long,
            entry_price: 100.0,
            exit_price: 100.0 + r_multiple,
            quantity: 1.0,
            r_multiple,
            fees_paid: 0.0,
            slippage_paid: 0.0,
            hold_time_secs: 3600,
            exit_reason: if r_multiple >= 0.0 { ExitReason::TakeProfit } else { ExitReason::StopLoss },
            opened_at: opened,
            closed_at: opened + ChronoDuration::hours(1),
            regime: None,
        }
    }

    #[tokio::test]
    async fn same_seed_produces_identical_fill_decisions() {
        let scenarios = vec![ScenarioBars { symbol: "BTCUSDT".to_string(), candles: vec![], regime_labels: vec![] }];
        let engine_a = BacktestEngine::new(42, 1000.0, scenarios.clone());
        let engine_b = BacktestEngine::new(42, 1000.0, scenarios);

        let params = OrderParams {
            symbol: "BTCUSDT".to_string(),
            direction: Direction::Long,
            order_type: OrderType::PostOnly,
            quantity: 1.0,
            price: Some(100.0),
        };

        let mut results_a = Vec::new();
        let mut results_b = Vec::new();
        for _ in 0..20 {
            results_a.push(engine_a.place_order(params.clone()).await.is_ok());
            results_b.push(engine_b.place_order(params.clone()).await.is_ok());
        }
        assert_eq!(results_a, results_b);
    }

    #[test]
    fn win_rate_and_profit_factor_over_mixed_trades() {
        let trades = vec![sample_trade(2.0, 0), sample_trade(-1.0, 1), sample_trade(1.5, 2), sample_trade(-1.0, 3)];
        let metrics = compute_metrics(&trades, 1000.0, 0.0);
        assert_eq!(metrics.total_trades, 4);
        assert!((metrics.win_rate - 0.5).abs() < 1e-9);
        assert!((metrics.profit_factor - (3.5 / 2.0)).abs() < 1e-9);
    }

    #[test]
    fn detects_a_three_trade_loss_cluster() {
        let trades = vec![sample_trade(1.0, 0), sample_trade(-1.0, 1), sample_trade(-0.5, 2), sample_trade(-1.2, 3), sample_trade(2.0, 4)];
        let metrics = compute_metrics(&trades, 1000.0, 0.0);
        assert_eq!(metrics.consecutive_loss_clusters.len(), 1);
        assert_eq!(metrics.consecutive_loss_clusters[0].length, 3);
    }

    #[test]
    fn drawdown_curve_tracks_equity_below_running_peak() {
        let trades = vec![sample_trade(2.0, 0), sample_trade(-1.0, 1)];
        let metrics = compute_metrics(&trades, 1000.0, 0.0);
        assert!(metrics.max_drawdown_pct > 0.0);
        assert_eq!(metrics.drawdown_curve.len(), metrics.equity_curve.len());
    }
}
