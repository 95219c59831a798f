// =============================================================================
// Exchange capability contract — trait consumed by the core, not owned by it
// =============================================================================
//
// Deliberately `async_trait`-free: each method returns a boxed future so the
// trait stays object-safe and a caller can hold `Arc<dyn ExchangeAdapter>`
// without pulling in a proc-macro. `BinanceAdapter` is one concrete
// implementation; `BacktestEngine` supplies a second, deterministic one over
// recorded bars.
// =============================================================================

pub mod binance;
pub mod rate_limit;

use std::future::Future;
use std::pin::Pin;

use anyhow::Result;

use crate::market_data::Candle;
use crate::types::Direction;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    PostOnly,
    Ioc,
    Market,
}

#[derive(Debug, Clone)]
pub struct OrderParams {
    pub symbol: String,
    pub direction: Direction,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct AggTrade {
    pub timestamp_ms: i64,
    pub price: f64,
    pub size: f64,
    pub is_buyer_aggressor: bool,
}

/// Market-data and trading capability surface the core consumes. Cached
/// per (symbol, timeframe) for 5 minutes by callers — the trait itself is a
/// thin transport contract, not a caching layer.
pub trait ExchangeAdapter: Send + Sync {
    fn fetch_ohlcv<'a>(&'a self, symbol: &'a str, timeframe: &'a str, limit: u32) -> BoxFuture<'a, Vec<Candle>>;
    fn get_current_price<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, f64>;
    fn get_equity<'a>(&'a self) -> BoxFuture<'a, f64>;
    /// Streams aggressor-tagged trades until the connection drops; `on_trade`
    /// runs on every tick. Callers reconnect; this call does not retry itself.
    fn subscribe_agg_trades<'a>(
        &'a self,
        symbol: &'a str,
        on_trade: Box<dyn FnMut(AggTrade) + Send>,
    ) -> BoxFuture<'a, ()>;
    fn place_order<'a>(&'a self, params: OrderParams) -> BoxFuture<'a, String>;
    fn cancel_order<'a>(&'a self, symbol: &'a str, order_id: &'a str) -> BoxFuture<'a, ()>;
    fn set_stop_loss<'a>(&'a self, symbol: &'a str, price: f64) -> BoxFuture<'a, ()>;
    fn set_take_profit<'a>(&'a self, symbol: &'a str, price: f64) -> BoxFuture<'a, ()>;
    fn set_leverage<'a>(&'a self, symbol: &'a str, leverage: f64) -> BoxFuture<'a, ()>;
    fn is_connected(&self) -> bool;
}
