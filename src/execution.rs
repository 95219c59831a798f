// =============================================================================
// LimitOrderExecutor — places and monitors post-only entries
// =============================================================================
//
// Replaces the teacher's direct demo/live dispatch with a single monitored
// path: every entry goes out post-only and is watched against price action
// for up to `MONITOR_TIMEOUT`, the same shape the teacher used for
// demo-vs-live branching but generalized to one retrying state machine.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::event_bus::{Event, EventBus};
use crate::exchange::{ExchangeAdapter, OrderParams, OrderType};
use crate::signal_generator::Signal;
use crate::types::Direction;

pub const MONITOR_TIMEOUT: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const DRIFT_CANCEL_PCT: f64 = 0.002;
const WICK_CANCEL_PCT: f64 = 0.005;
const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutionOutcome {
    Filled { fill_price: f64, slippage_bps: f64 },
    Cancelled(String),
    Rejected(String),
}

pub struct LimitOrderExecutor {
    adapter: Arc<dyn ExchangeAdapter>,
    bus: EventBus,
}

impl LimitOrderExecutor {
    pub fn new(adapter: Arc<dyn ExchangeAdapter>, bus: EventBus) -> Self {
        Self { adapter, bus }
    }

    /// Places a post-only order for `signal` and monitors it until filled,
    /// cancelled, or rejected after retry exhaustion.
    pub async fn execute(&self, signal: &Signal) -> ExecutionOutcome {
        let mut attempt = 0u32;
        loop {
            match self.attempt_once(signal).await {
                Ok(outcome @ ExecutionOutcome::Filled { fill_price, slippage_bps }) => {
                    self.bus.publish(Event::ExecutionComplete {
                        signal_id: signal.id.clone(),
                        symbol: signal.symbol.clone(),
                        fill_price,
                        slippage_bps,
                    });
                    return outcome;
                }
                Ok(outcome @ ExecutionOutcome::Cancelled(_)) => return outcome,
                Ok(ExecutionOutcome::Rejected(_)) | Err(_) => {
                    attempt += 1;
                    if attempt > MAX_RETRIES {
                        let reason = "order rejected after exhausting retries".to_string();
                        warn!(symbol = %signal.symbol, signal_id = %signal.id, "ORDER_REJECTED: {reason}");
                        self.bus.publish(Event::Error {
                            component: "execution".to_string(),
                            message: format!("ORDER_REJECTED {}: {reason}", signal.symbol),
                        });
                        return ExecutionOutcome::Rejected(reason);
                    }
                    sleep(BASE_BACKOFF * 2u32.pow(attempt - 1)).await;
                }
            }
        }
    }

    async fn attempt_once(&self, signal: &Signal) -> anyhow::Result<ExecutionOutcome> {
        let params = OrderParams {
            symbol: signal.symbol.clone(),
            direction: signal.direction,
            order_type: OrderType::PostOnly,
            quantity: signal.position_size,
            price: Some(signal.entry_price),
        };

        let order_id = self.adapter.place_order(params).await?;
        info!(symbol = %signal.symbol, order_id, "post-only order placed, monitoring for fill");

        let outcome = self.monitor(signal).await?;
        if !matches!(outcome, ExecutionOutcome::Filled { .. }) {
            self.adapter.cancel_order(&signal.symbol, &order_id).await.ok();
        }
        Ok(outcome)
    }

    /// Polls price for up to `MONITOR_TIMEOUT`. A resting post-only order
    /// fills once price trades through the entry in the favorable direction;
    /// it's cancelled if price wicks too far through without filling, or
    /// drifts away without ever reaching it, or the window times out.
    async fn monitor(&self, signal: &Signal) -> anyhow::Result<ExecutionOutcome> {
        let start = Instant::now();
        while start.elapsed() < MONITOR_TIMEOUT {
            let price = self.adapter.get_current_price(&signal.symbol).await?;
            let crossed = match signal.direction {
                Direction::Long => price <= signal.entry_price,
                Direction::Short => price >= signal.entry_price,
            };
            if crossed {
                let wick_pct = (signal.entry_price - price).abs() / signal.entry_price;
                if wick_pct > WICK_CANCEL_PCT {
                    return Ok(ExecutionOutcome::Cancelled(format!("wicked {:.3}% through entry before fill", wick_pct * 100.0)));
                }
                let slippage_bps = (price - signal.entry_price).abs() / signal.entry_price * 10_000.0;
                return Ok(ExecutionOutcome::Filled { fill_price: price, slippage_bps });
            }

            let drift_pct = (price - signal.entry_price).abs() / signal.entry_price;
            if drift_pct > DRIFT_CANCEL_PCT {
                return Ok(ExecutionOutcome::Cancelled(format!("price drifted {:.3}% away without fill", drift_pct * 100.0)));
            }

            sleep(POLL_INTERVAL).await;
        }
        Ok(ExecutionOutcome::Cancelled("monitor window timed out".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{AggTrade, BoxFuture};
    use crate::market_data::Candle;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubAdapter {
        prices: Vec<f64>,
        call: AtomicUsize,
    }

    impl ExchangeAdapter for StubAdapter {
        fn fetch_ohlcv<'a>(&'a self, _symbol: &'a str, _timeframe: &'a str, _limit: u32) -> BoxFuture<'a, Vec<Candle>> {
            Box::pin(async { Ok(Vec::new()) })
        }
        fn get_current_price<'a>(&'a self, _symbol: &'a str) -> BoxFuture<'a, f64> {
            let idx = self.call.fetch_add(1, Ordering::SeqCst);
            let price = *self.prices.get(idx).unwrap_or(self.prices.last().unwrap());
            Box::pin(async move { Ok(price) })
        }
        fn get_equity<'a>(&'a self) -> BoxFuture<'a, f64> {
            Box::pin(async { Ok(10_000.0) })
        }
        fn subscribe_agg_trades<'a>(&'a self, _symbol: &'a str, _on_trade: Box<dyn FnMut(AggTrade) + Send>) -> BoxFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }
        fn place_order<'a>(&'a self, _params: crate::exchange::OrderParams) -> BoxFuture<'a, String> {
            Box::pin(async { Ok("order-1".to_string()) })
        }
        fn cancel_order<'a>(&'a self, _symbol: &'a str, _order_id: &'a str) -> BoxFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }
        fn set_stop_loss<'a>(&'a self, _symbol: &'a str, _price: f64) -> BoxFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }
        fn set_take_profit<'a>(&'a self, _symbol: &'a str, _price: f64) -> BoxFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }
        fn set_leverage<'a>(&'a self, _symbol: &'a str, _leverage: f64) -> BoxFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }
        fn is_connected(&self) -> bool {
            true
        }
    }

    fn test_signal() -> Signal {
        Signal {
            id: "sig-1".into(),
            symbol: "BTCUSDT".into(),
            direction: Direction::Long,
            entry_price: 100.0,
            stop_loss: 98.0,
            take_profit: 106.0,
            position_size: 1.0,
            leverage: 3.0,
            conviction_multiplier: 1.0,
            reasoning: vec![],
            cvd_confirmed: true,
            oracle_score: None,
            global_cvd_score: None,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn fills_when_price_crosses_entry() {
        let adapter = Arc::new(StubAdapter { prices: vec![100.5, 100.0, 99.9], call: AtomicUsize::new(0) });
        let executor = LimitOrderExecutor::new(adapter, EventBus::new());
        let outcome = executor.execute(&test_signal()).await;
        assert!(matches!(outcome, ExecutionOutcome::Filled { .. }));
    }

    #[tokio::test]
    async fn cancels_on_drift_away_from_entry() {
        let adapter = Arc::new(StubAdapter { prices: vec![105.0, 106.0, 107.0], call: AtomicUsize::new(0) });
        let executor = LimitOrderExecutor::new(adapter, EventBus::new());
        let outcome = executor.execute(&test_signal()).await;
        assert!(matches!(outcome, ExecutionOutcome::Cancelled(_)));
    }
}
