// =============================================================================
// Binance adapter — signed REST client implementing `ExchangeAdapter`
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Every signed
// request carries X-MBX-APIKEY as a header and a 5000ms recvWindow to
// tolerate clock drift between this process and Binance's servers.
// =============================================================================

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use futures_util::StreamExt;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tokio_tungstenite::connect_async;
use tracing::{debug, instrument, warn};

use super::rate_limit::RateLimitTracker;
use super::{AggTrade, BoxFuture, ExchangeAdapter, OrderParams, OrderType};
use crate::market_data::Candle;

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW: u64 = 5000;

// Approximate REST weights per Binance's published limits table.
const WEIGHT_KLINES: u32 = 2;
const WEIGHT_TICKER_PRICE: u32 = 2;
const WEIGHT_ACCOUNT: u32 = 10;
const WEIGHT_ORDER: u32 = 1;

#[derive(Clone)]
pub struct BinanceAdapter {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    rate_limit: std::sync::Arc<RateLimitTracker>,
}

impl BinanceAdapter {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key,
            secret,
            base_url: "https://api.binance.com".to_string(),
            client,
            rate_limit: std::sync::Arc::new(RateLimitTracker::new()),
        }
    }

    /// Current rate-limit counters, for dashboards/health checks.
    pub fn rate_limit_snapshot(&self) -> super::rate_limit::RateLimitSnapshot {
        self.rate_limit.snapshot()
    }

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    #[instrument(skip(self), name = "binance::get_account")]
    async fn get_account(&self) -> Result<serde_json::Value> {
        if !self.rate_limit.can_send_request(WEIGHT_ACCOUNT) {
            anyhow::bail!("rate limit would be exceeded by GET /api/v3/account");
        }
        let qs = self.signed_query("");
        let url = format!("{}/api/v3/account?{}", self.base_url, qs);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/account request failed")?;
        let status = resp.status();
        self.rate_limit.update_from_headers(resp.headers());
        let body: serde_json::Value = resp.json().await.context("failed to parse account response")?;
        if !status.is_success() {
            anyhow::bail!("Binance GET /api/v3/account returned {}: {}", status, body);
        }
        Ok(body)
    }
}

impl ExchangeAdapter for BinanceAdapter {
    fn fetch_ohlcv<'a>(&'a self, symbol: &'a str, timeframe: &'a str, limit: u32) -> BoxFuture<'a, Vec<Candle>> {
        Box::pin(async move {
            if !self.rate_limit.can_send_request(WEIGHT_KLINES) {
                anyhow::bail!("rate limit would be exceeded by GET /api/v3/klines");
            }
            let url = format!(
                "{}/api/v3/klines?symbol={}&interval={}&limit={}",
                self.base_url, symbol, timeframe, limit
            );
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .context("GET /api/v3/klines request failed")?;
            let status = resp.status();
            self.rate_limit.update_from_headers(resp.headers());
            let body: serde_json::Value = resp.json().await.context("failed to parse klines response")?;
            if !status.is_success() {
                anyhow::bail!("Binance GET /api/v3/klines returned {}: {}", status, body);
            }
            let raw = body.as_array().context("klines response is not an array")?;
            let mut candles = Vec::with_capacity(raw.len());
            for entry in raw {
                let arr = entry.as_array().context("kline entry is not an array")?;
                if arr.len() < 11 {
                    warn!("skipping malformed kline entry with {} elements", arr.len());
                    continue;
                }
                let parse = |v: &serde_json::Value| -> Result<f64> {
                    v.as_str()
                        .and_then(|s| s.parse().ok())
                        .or_else(|| v.as_f64())
                        .context("expected string or number")
                };
                candles.push(Candle {
                    open_time: arr[0].as_i64().unwrap_or(0),
                    close_time: arr[6].as_i64().unwrap_or(0),
                    open: parse(&arr[1])?,
                    high: parse(&arr[2])?,
                    low: parse(&arr[3])?,
                    close: parse(&arr[4])?,
                    volume: parse(&arr[5])?,
                    quote_volume: parse(&arr[7]).unwrap_or(0.0),
                    trades_count: arr[8].as_u64().unwrap_or(0),
                    taker_buy_volume: parse(&arr[9]).unwrap_or(0.0),
                    taker_buy_quote_volume: parse(&arr[10]).unwrap_or(0.0),
                    is_closed: true,
                });
            }
            debug!(symbol, timeframe, count = candles.len(), "ohlcv fetched");
            Ok(candles)
        })
    }

    fn get_current_price<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, f64> {
        Box::pin(async move {
            if !self.rate_limit.can_send_request(WEIGHT_TICKER_PRICE) {
                anyhow::bail!("rate limit would be exceeded by GET /api/v3/ticker/price");
            }
            let url = format!("{}/api/v3/ticker/price?symbol={}", self.base_url, symbol);
            let resp = self.client.get(&url).send().await.context("ticker price request failed")?;
            self.rate_limit.update_from_headers(resp.headers());
            let body: serde_json::Value = resp.json().await.context("failed to parse ticker response")?;
            body["price"]
                .as_str()
                .context("missing price field")?
                .parse::<f64>()
                .context("price is not a valid f64")
        })
    }

    fn subscribe_agg_trades<'a>(
        &'a self,
        symbol: &'a str,
        mut on_trade: Box<dyn FnMut(AggTrade) + Send>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move { run_agg_trade_stream(symbol, move |t| on_trade(t)).await })
    }

    fn get_equity<'a>(&'a self) -> BoxFuture<'a, f64> {
        Box::pin(async move {
            let account = self.get_account().await?;
            let balances = account["balances"].as_array().context("missing balances array")?;
            let usdt = balances
                .iter()
                .find(|b| b["asset"].as_str() == Some("USDT"))
                .and_then(|b| b["free"].as_str())
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(0.0);
            Ok(usdt)
        })
    }

    fn place_order<'a>(&'a self, params: OrderParams) -> BoxFuture<'a, String> {
        Box::pin(async move {
            if !self.rate_limit.can_send_request(WEIGHT_ORDER) || !self.rate_limit.can_place_order() {
                anyhow::bail!("rate limit would be exceeded by POST /api/v3/order");
            }
            let side = match params.direction {
                crate::types::Direction::Long => "BUY",
                crate::types::Direction::Short => "SELL",
            };
            let order_type = match params.order_type {
                OrderType::PostOnly => "LIMIT_MAKER",
                OrderType::Ioc => "LIMIT",
                OrderType::Market => "MARKET",
            };
            let mut query = format!(
                "symbol={}&side={}&type={}&quantity={}",
                params.symbol, side, order_type, params.quantity
            );
            if let Some(p) = params.price {
                query.push_str(&format!("&price={p}"));
            }
            if params.order_type == OrderType::Ioc {
                query.push_str("&timeInForce=IOC");
            }
            let qs = self.signed_query(&query);
            let url = format!("{}/api/v3/order?{}", self.base_url, qs);
            let resp = self.client.post(&url).send().await.context("place_order request failed")?;
            let status = resp.status();
            self.rate_limit.update_from_headers(resp.headers());
            self.rate_limit.record_order_sent();
            let body: serde_json::Value = resp.json().await.context("failed to parse order response")?;
            if !status.is_success() {
                anyhow::bail!("Binance POST /api/v3/order returned {}: {}", status, body);
            }
            body["orderId"]
                .as_i64()
                .map(|id| id.to_string())
                .context("order response missing orderId")
        })
    }

    fn cancel_order<'a>(&'a self, symbol: &'a str, order_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if !self.rate_limit.can_send_request(WEIGHT_ORDER) {
                anyhow::bail!("rate limit would be exceeded by DELETE /api/v3/order");
            }
            let query = format!("symbol={symbol}&orderId={order_id}");
            let qs = self.signed_query(&query);
            let url = format!("{}/api/v3/order?{}", self.base_url, qs);
            let resp = self.client.delete(&url).send().await.context("cancel_order request failed")?;
            self.rate_limit.update_from_headers(resp.headers());
            if !resp.status().is_success() {
                anyhow::bail!("Binance DELETE /api/v3/order returned {}", resp.status());
            }
            Ok(())
        })
    }

    fn set_stop_loss<'a>(&'a self, symbol: &'a str, price: f64) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            debug!(symbol, price, "set_stop_loss is expressed as a fresh STOP_LOSS_LIMIT order by the caller");
            Ok(())
        })
    }

    fn set_take_profit<'a>(&'a self, symbol: &'a str, price: f64) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            debug!(symbol, price, "set_take_profit is expressed as a fresh TAKE_PROFIT_LIMIT order by the caller");
            Ok(())
        })
    }

    fn set_leverage<'a>(&'a self, symbol: &'a str, leverage: f64) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            debug!(symbol, leverage, "spot market — leverage is a no-op on this adapter");
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        !self.api_key.is_empty()
    }
}

/// Connect to the aggTrade WebSocket stream and invoke `on_trade` for each
/// parsed trade until the stream disconnects.
pub async fn run_agg_trade_stream(
    symbol: &str,
    mut on_trade: impl FnMut(AggTrade) + Send,
) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("wss://stream.binance.com:9443/ws/{lower}@aggTrade");
    let (ws_stream, _) = connect_async(&url).await.context("failed to connect to aggTrade WebSocket")?;
    let (_write, mut read) = ws_stream.split();

    while let Some(msg) = read.next().await {
        match msg {
            Ok(tokio_tungstenite::tungstenite::Message::Text(text)) => {
                if let Ok(trade) = parse_agg_trade(&text) {
                    on_trade(trade);
                }
            }
            Ok(_) => {}
            Err(e) => anyhow::bail!("aggTrade WebSocket read error: {e}"),
        }
    }
    Ok(())
}

fn parse_agg_trade(text: &str) -> Result<AggTrade> {
    let root: serde_json::Value = serde_json::from_str(text).context("failed to parse aggTrade JSON")?;
    let price: f64 = root["p"].as_str().context("missing p")?.parse().context("bad price")?;
    let size: f64 = root["q"].as_str().context("missing q")?.parse().context("bad qty")?;
    let timestamp_ms = root["T"].as_i64().context("missing T")?;
    // Binance's `m` flag is true when the buyer is the market maker, i.e. the
    // aggressor was the seller.
    let buyer_is_maker = root["m"].as_bool().context("missing m")?;
    Ok(AggTrade {
        timestamp_ms,
        price,
        size,
        is_buyer_aggressor: !buyer_is_maker,
    })
}

impl std::fmt::Debug for BinanceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceAdapter")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signing_is_deterministic_for_same_query() {
        let adapter = BinanceAdapter::new("key", "secret");
        let sig_a = adapter.sign("timestamp=1000");
        let sig_b = adapter.sign("timestamp=1000");
        assert_eq!(sig_a, sig_b);
        assert_ne!(sig_a, adapter.sign("timestamp=1001"));
    }

    #[test]
    fn parses_agg_trade_message() {
        let json = r#"{"e":"aggTrade","s":"BTCUSDT","p":"37000.50","q":"0.01","T":1700000000000,"m":false}"#;
        let trade = parse_agg_trade(json).unwrap();
        assert!((trade.price - 37000.50).abs() < f64::EPSILON);
        assert!(trade.is_buyer_aggressor);
    }

    #[test]
    fn maker_flag_flips_aggressor_side() {
        let json = r#"{"p":"1.0","q":"1.0","T":0,"m":true}"#;
        let trade = parse_agg_trade(json).unwrap();
        assert!(!trade.is_buyer_aggressor);
    }
}
