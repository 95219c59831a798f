// =============================================================================
// Central Application State — orchestrator
// =============================================================================
//
// The single source of truth tying every subsystem together. Each async task
// spawned from `main.rs` holds an `Arc<AppState>` and calls `run_cycle` for
// its symbol on a timer. Per-symbol mutable analysis state (session windows,
// POIs, CVD) lives behind `RwLock<HashMap<...>>` so one symbol's cycle never
// blocks another's.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::bot_trap::PrecisionAnalysis;
use crate::config::ConfigManager;
use crate::cvd::{CvdValidator, PriceCvdPoint};
use crate::decision_envelope::DecisionEnvelope;
use crate::emergency::{EmergencyProtocolManager, EmergencyTrigger};
use crate::errors::HunterError;
use crate::event_bus::EventBus;
use crate::exchange::ExchangeAdapter;
use crate::execution::LimitOrderExecutor;
use crate::fractal::atr;
use crate::hologram::{compute_hologram, Scanner};
use crate::logger::Logger;
use crate::market_data::Candle;
use crate::poi::InefficiencyMapper;
use crate::portfolio::{DrawdownTier, ExposureSnapshot, PortfolioManager};
use crate::position_manager::PositionManager;
use crate::session::{SessionProfiler, SessionWindows};
use crate::signal_generator::{PipelineInputs, SignalCandidate, SignalGenerator};
use crate::types::{Direction, ExitReason};

const MAX_RECENT_DECISIONS: usize = 200;

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    pub config: Arc<ConfigManager>,
    pub bus: EventBus,
    pub adapter: Arc<dyn ExchangeAdapter>,
    pub scanner: Scanner,
    pub signal_generator: SignalGenerator,
    pub executor: LimitOrderExecutor,
    pub position_manager: Arc<PositionManager>,
    pub portfolio: Arc<PortfolioManager>,
    pub emergency: Arc<EmergencyProtocolManager>,
    pub logger: Logger,

    sessions: RwLock<HashMap<String, SessionProfiler>>,
    pois: RwLock<HashMap<String, InefficiencyMapper>>,
    cvd: RwLock<HashMap<String, CvdValidator>>,
    last_cvd_point: RwLock<HashMap<String, PriceCvdPoint>>,
    recent_decisions: RwLock<Vec<DecisionEnvelope>>,

    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(config: Arc<ConfigManager>, adapter: Arc<dyn ExchangeAdapter>, log_path: impl Into<std::path::PathBuf>) -> Self {
        let bus = EventBus::new();
        let symbols = config.effective().symbols.clone();

        let mut sessions = HashMap::new();
        let mut pois = HashMap::new();
        let mut cvd = HashMap::new();
        for symbol in &symbols {
            sessions.insert(symbol.clone(), SessionProfiler::new(SessionWindows::default()));
            pois.insert(symbol.clone(), InefficiencyMapper::default());
            cvd.insert(symbol.clone(), CvdValidator::new());
        }

        Self {
            config,
            bus: bus.clone(),
            adapter: adapter.clone(),
            scanner: Scanner::default(),
            signal_generator: SignalGenerator::new(),
            executor: LimitOrderExecutor::new(adapter, bus.clone()),
            position_manager: Arc::new(PositionManager::new(bus.clone())),
            portfolio: Arc::new(PortfolioManager::new(Utc::now())),
            emergency: Arc::new(EmergencyProtocolManager::new(bus)),
            logger: Logger::spawn(log_path),
            sessions: RwLock::new(sessions),
            pois: RwLock::new(pois),
            cvd: RwLock::new(cvd),
            last_cvd_point: RwLock::new(HashMap::new()),
            recent_decisions: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn push_decision(&self, envelope: DecisionEnvelope) {
        let mut decisions = self.recent_decisions.write();
        decisions.push(envelope);
        while decisions.len() > MAX_RECENT_DECISIONS {
            decisions.remove(0);
        }
    }

    pub fn recent_decisions(&self) -> Vec<DecisionEnvelope> {
        self.recent_decisions.read().clone()
    }

    /// Feeds one closed-bar sequence into a symbol's session profiler and
    /// POI map.
    pub fn on_bar(&self, symbol: &str, bars: &[crate::market_data::Candle]) {
        if let Some(bar) = bars.last() {
            if let Some(profiler) = self.sessions.write().get_mut(symbol) {
                profiler.on_bar(bar, Utc::now());
            }
        }
        if let Some(mapper) = self.pois.write().get_mut(symbol) {
            mapper.scan(symbol, bars);
        }
    }

    /// Feeds one aggressor-tagged trade into a symbol's CVD validator.
    pub fn on_trade(&self, symbol: &str, trade: &crate::exchange::AggTrade) {
        if let Some(validator) = self.cvd.write().get_mut(symbol) {
            validator.on_trade(trade);
            let point = PriceCvdPoint { price: trade.price, cvd: validator.current_cvd() };
            self.last_cvd_point.write().insert(symbol.to_string(), point);
        }
    }

    /// Runs one full evaluation cycle for `symbol`: computes the hologram,
    /// runs the signal pipeline, and — if a signal clears every gate — checks
    /// portfolio limits and dispatches execution. Always records a
    /// `DecisionEnvelope`, win or lose.
    ///
    /// Before anything else, this re-derives the halt state from the daily
    /// drawdown tier and the adapter's connectivity and, if either trips,
    /// flattens `symbol` instead of proceeding.
    pub async fn run_cycle(&self, symbol: &str, direction: Direction) -> anyhow::Result<()> {
        let now = Utc::now();
        match self.portfolio.drawdown.tier(now) {
            DrawdownTier::Tier3 | DrawdownTier::HardStop => {
                self.emergency.raise(EmergencyTrigger::PredictionEmergency, "daily/weekly drawdown tier breached", now);
            }
            _ => self.emergency.clear(EmergencyTrigger::PredictionEmergency),
        }
        if self.adapter.is_connected() {
            self.emergency.clear(EmergencyTrigger::LiquidityEmergency);
        } else {
            self.emergency.raise(EmergencyTrigger::LiquidityEmergency, "exchange adapter reports disconnected", now);
        }

        if self.emergency.is_halted() {
            self.flatten_symbol(symbol).await?;
            return Ok(());
        }

        let cfg = self.config.effective();
        let daily_bars = match self.fetch_bars(symbol, "1d", 220).await {
            Ok(bars) => bars,
            Err(e) => return self.handle_fetch_error(e),
        };
        let h4_bars = match self.fetch_bars(symbol, "4h", 320).await {
            Ok(bars) => bars,
            Err(e) => return self.handle_fetch_error(e),
        };
        let m15_bars = match self.fetch_bars(symbol, "15m", 520).await {
            Ok(bars) => bars,
            Err(e) => return self.handle_fetch_error(e),
        };
        let btc_h4 = match self.fetch_bars("BTCUSDT", "4h", 320).await {
            Ok(bars) => bars,
            Err(e) => return self.handle_fetch_error(e),
        };

        let Some(hologram) = compute_hologram(symbol, &daily_bars, &h4_bars, &m15_bars, &btc_h4, direction, &cfg) else {
            return Ok(());
        };
        self.bus.publish(crate::event_bus::Event::HologramUpdated {
            symbol: symbol.to_string(),
            status: hologram.status,
            alignment_score: hologram.alignment_score,
        });

        self.on_bar(symbol, &m15_bars);

        let price = self.adapter.get_current_price(symbol).await?;
        let equity = self.adapter.get_equity().await?;
        let atr_stop_distance = atr(&m15_bars, 14).unwrap_or(0.0);

        let prior = self.last_cvd_point.read().get(symbol).copied().unwrap_or(PriceCvdPoint { price, cvd: 0.0 });
        let current = self
            .cvd
            .read()
            .get(symbol)
            .map(|v| PriceCvdPoint { price, cvd: v.current_cvd() })
            .unwrap_or(PriceCvdPoint { price, cvd: 0.0 });

        let pois = self.pois.read().get(symbol).map(|m| m.pois().to_vec()).unwrap_or_default();
        let passive_absorption = self.cvd.read().get(symbol).map(|v| v.passive_absorption_signature()).unwrap_or(false);

        let (envelope, signal) = {
            let sessions = self.sessions.read();
            let Some(session) = sessions.get(symbol) else { return Ok(()) };

            let candidate = SignalCandidate { symbol, direction, price, atr_stop_distance, equity };
            let inputs = PipelineInputs {
                hologram: &hologram,
                session,
                now: Utc::now(),
                pois: &pois,
                cvd_prior: prior,
                cvd_current: current,
                passive_absorption,
                oracle: None,
                global_cvd: None,
                bot_trap: None,
                cfg: &cfg,
            };
            let (signal, envelope) = self.signal_generator.generate(candidate, inputs);
            (envelope, signal)
        };

        self.push_decision(envelope);

        let Some(mut signal) = signal else { return Ok(()) };

        let tier = self.portfolio.drawdown.tier(now);
        signal.position_size *= tier.size_multiplier();
        if signal.position_size <= 0.0 {
            warn!(symbol, ?tier, "drawdown tier scaled signal size to zero, dropping");
            return Ok(());
        }

        let notional = signal.position_size * signal.entry_price;
        let risk_pct = (signal.entry_price - signal.stop_loss).abs() * signal.position_size / equity.max(1.0);
        let open_exposure: Vec<ExposureSnapshot> = self
            .position_manager
            .open_positions()
            .iter()
            .map(|p| ExposureSnapshot {
                symbol: p.symbol.clone(),
                notional: p.entry_price * p.quantity,
                risk_pct: (p.entry_price - p.original_stop).abs() * p.quantity / equity.max(1.0),
            })
            .collect();

        if let Some(reason) = self.portfolio.can_open(symbol, notional, risk_pct, equity, &open_exposure, Utc::now()) {
            warn!(symbol, reason, "portfolio gate blocked signal");
            self.logger.log_signal(serde_json::json!({ "symbol": symbol, "blocked": true, "reason": reason }));
            return Ok(());
        }

        self.logger.log_signal(&signal);
        self.bus.publish(crate::event_bus::Event::SignalGenerated {
            signal_id: signal.id.clone(),
            symbol: symbol.to_string(),
            direction: signal.direction,
        });

        let outcome = self.executor.execute(&signal).await;
        self.logger.log_execution(serde_json::json!({ "signal_id": signal.id, "outcome": format!("{outcome:?}") }));

        if let crate::execution::ExecutionOutcome::Filled { fill_price, .. } = outcome {
            let position_id = self.position_manager.open_position(symbol, signal.direction, fill_price, signal.stop_loss, signal.take_profit, signal.position_size);
            info!(position_id, symbol, "opened position from signal");
        }

        Ok(())
    }

    /// Fetches candles through the adapter, converting `anyhow::Error` into
    /// `HunterError::ExternalTransient` at this boundary so the caller can
    /// decide retry-vs-escalate on the taxonomy instead of the raw error.
    async fn fetch_bars(&self, symbol: &str, timeframe: &str, limit: u32) -> Result<Vec<Candle>, HunterError> {
        self.adapter
            .fetch_ohlcv(symbol, timeframe, limit)
            .await
            .map_err(|source| HunterError::ExternalTransient { symbol: symbol.to_string(), source })
    }

    /// Transient fetch failures are logged and swallowed so the next cycle
    /// retries; anything `fetch_bars` could in principle return that isn't
    /// retryable is escalated instead of silently dropped.
    fn handle_fetch_error(&self, err: HunterError) -> anyhow::Result<()> {
        if err.is_retryable() {
            warn!(error = %err, "market data fetch failed, will retry next cycle");
            Ok(())
        } else {
            Err(err.into())
        }
    }

    /// Closes every open position on `symbol` at the current market price.
    /// Called when the emergency manager reports a halt — the manager itself
    /// never force-closes anything, so this is the one place that does.
    async fn flatten_symbol(&self, symbol: &str) -> anyhow::Result<()> {
        let open: Vec<_> = self.position_manager.open_positions().into_iter().filter(|p| p.symbol == symbol).collect();
        if open.is_empty() {
            return Ok(());
        }
        let price = match self.adapter.get_current_price(symbol).await {
            Ok(price) => price,
            Err(e) => {
                warn!(symbol, error = %e, "could not fetch price while flattening under emergency halt");
                return Ok(());
            }
        };
        let equity = self.adapter.get_equity().await.unwrap_or(1.0).max(1.0);
        for pos in open {
            if let Some(pnl) = self.position_manager.close_position(&pos.id, ExitReason::Emergency, price) {
                warn!(symbol, position_id = %pos.id, pnl, "position flattened under emergency halt");
                self.record_closed_trade(pnl / equity);
            }
        }
        Ok(())
    }

    /// Advances every open position on `symbol` against the latest tick.
    /// Meant to run on a tighter timer than `run_cycle` so trailing stops and
    /// partials react between full pipeline evaluations.
    pub async fn monitor_positions(&self, symbol: &str) -> anyhow::Result<()> {
        if !self.position_manager.open_positions().iter().any(|p| p.symbol == symbol) {
            return Ok(());
        }
        let price = self.adapter.get_current_price(symbol).await?;
        let recent = self.adapter.fetch_ohlcv(symbol, "15m", 20).await.unwrap_or_default();
        let atr_distance = atr(&recent, 14).unwrap_or(0.0);
        let equity = self.adapter.get_equity().await.unwrap_or(1.0).max(1.0);

        for (position_id, reason) in self.position_manager.on_price_update(symbol, price, atr_distance) {
            if let Some(pnl) = self.position_manager.close_position(&position_id, reason, price) {
                info!(symbol, position_id, ?reason, pnl, "position closed from price monitor");
                self.record_closed_trade(pnl / equity);
            }
        }
        Ok(())
    }

    /// Records a trade's realized PnL (as a fraction of equity at entry)
    /// against the drawdown protector after a position closes.
    pub fn record_closed_trade(&self, pnl_pct: f64) {
        self.portfolio.drawdown.record_trade(pnl_pct, Utc::now());
        if self.portfolio.drawdown.win_rate_alert() {
            warn!("win rate has fallen below the alert threshold over the trailing window");
        }
    }

    /// Reports a recognized precision pattern against a POI for logging and
    /// future bot-trap recalibration; the learning loop itself consumes
    /// these records out of band from the exported log.
    pub fn log_bot_trap_pattern(&self, symbol: &str, analysis: &PrecisionAnalysis) {
        if analysis.suspicion_score > 0.0 {
            self.logger.log_signal(serde_json::json!({ "symbol": symbol, "bot_trap_suspicion": analysis.suspicion_score }));
        }
    }
}
