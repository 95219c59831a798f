// =============================================================================
// Configuration — three-level hierarchy merged into one immutable snapshot
// =============================================================================
//
// StrategyDefaults < PhaseConfig < BrainOverrides, increasing precedence.
// Each level deserializes independently with `#[serde(default)]` so a
// partially-specified override file never fails to load; missing keys fall
// through to the level below. The merge result is validated as a unit before
// publication — a failed validation keeps the previous snapshot live.
// =============================================================================

pub mod credentials;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::event_bus::{Event, EventBus};
use crate::types::{AccountMode, TradingMode};

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

/// Strategy-level tunables with hard-coded fallback values. This is the
/// bottom of the merge chain — every field here is always populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyDefaults {
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    #[serde(default = "default_alignment_weights")]
    pub alignment_weights: AlignmentWeights,
    #[serde(default = "default_a_plus_threshold")]
    pub a_plus_threshold: f64,
    #[serde(default = "default_b_threshold")]
    pub b_threshold: f64,
    #[serde(default)]
    pub rs_threshold: f64,
    #[serde(default = "default_target_r")]
    pub target_r_min: f64,
    #[serde(default = "default_target_r_max")]
    pub target_r_max: f64,
    #[serde(default = "default_risk_per_trade")]
    pub risk_per_trade: f64,
    #[serde(default = "default_conviction_min")]
    pub conviction_min: f64,
    #[serde(default = "default_conviction_max")]
    pub conviction_max: f64,
    #[serde(default = "default_max_concurrent_positions")]
    pub max_concurrent_positions: u32,
    #[serde(default = "default_max_leverage")]
    pub max_leverage: f64,
    #[serde(default = "default_max_heat")]
    pub max_portfolio_heat: f64,
    #[serde(default = "default_max_correlated_exposure")]
    pub max_correlated_exposure: f64,
}

fn default_alignment_weights() -> AlignmentWeights {
    AlignmentWeights::default()
}
fn default_a_plus_threshold() -> f64 {
    80.0
}
fn default_b_threshold() -> f64 {
    65.0
}
fn default_target_r() -> f64 {
    2.0
}
fn default_target_r_max() -> f64 {
    4.0
}
fn default_risk_per_trade() -> f64 {
    0.01
}
fn default_conviction_min() -> f64 {
    0.25
}
fn default_conviction_max() -> f64 {
    2.0
}
fn default_max_concurrent_positions() -> u32 {
    5
}
fn default_max_leverage() -> f64 {
    5.0
}
fn default_max_heat() -> f64 {
    0.15
}
fn default_max_correlated_exposure() -> f64 {
    0.40
}

/// Weights applied to each timeframe's per-TF score when computing the
/// overall hologram alignment score. Must sum to 1.0.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AlignmentWeights {
    pub daily: f64,
    pub h4: f64,
    pub m15: f64,
}

impl Default for AlignmentWeights {
    fn default() -> Self {
        Self {
            daily: 0.5,
            h4: 0.3,
            m15: 0.2,
        }
    }
}

impl Default for StrategyDefaults {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            alignment_weights: AlignmentWeights::default(),
            a_plus_threshold: default_a_plus_threshold(),
            b_threshold: default_b_threshold(),
            rs_threshold: 0.0,
            target_r_min: default_target_r(),
            target_r_max: default_target_r_max(),
            risk_per_trade: default_risk_per_trade(),
            conviction_min: default_conviction_min(),
            conviction_max: default_conviction_max(),
            max_concurrent_positions: default_max_concurrent_positions(),
            max_leverage: default_max_leverage(),
            max_portfolio_heat: default_max_heat(),
            max_correlated_exposure: default_max_correlated_exposure(),
        }
    }
}

/// Phase-level overrides. Every field is optional; `None` means "inherit from
/// `StrategyDefaults`".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseConfig {
    #[serde(default)]
    pub symbols: Option<Vec<String>>,
    #[serde(default)]
    pub rs_threshold: Option<f64>,
    #[serde(default)]
    pub target_r_min: Option<f64>,
    #[serde(default)]
    pub target_r_max: Option<f64>,
    #[serde(default)]
    pub risk_per_trade: Option<f64>,
    #[serde(default)]
    pub max_concurrent_positions: Option<u32>,
    #[serde(default)]
    pub max_leverage: Option<f64>,
}

/// Brain-level overrides — the highest-precedence, operator-controlled layer.
/// Same shape as `PhaseConfig`, plus the operational-mode toggles that only
/// the top level is allowed to flip.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrainOverrides {
    #[serde(default)]
    pub symbols: Option<Vec<String>>,
    #[serde(default)]
    pub rs_threshold: Option<f64>,
    #[serde(default)]
    pub risk_per_trade: Option<f64>,
    #[serde(default)]
    pub max_concurrent_positions: Option<u32>,
    #[serde(default)]
    pub trading_mode: Option<TradingMode>,
    #[serde(default)]
    pub account_mode: Option<AccountMode>,
}

/// The fully-merged, validated configuration every component reads. Always
/// internally consistent — there is no way to observe a half-applied update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub trading_mode: TradingMode,
    pub account_mode: AccountMode,
    pub symbols: Vec<String>,
    pub alignment_weights: AlignmentWeights,
    pub a_plus_threshold: f64,
    pub b_threshold: f64,
    pub rs_threshold: f64,
    pub target_r_min: f64,
    pub target_r_max: f64,
    pub risk_per_trade: f64,
    pub conviction_min: f64,
    pub conviction_max: f64,
    pub max_concurrent_positions: u32,
    pub max_leverage: f64,
    pub max_portfolio_heat: f64,
    pub max_correlated_exposure: f64,
}

fn merge(
    defaults: &StrategyDefaults,
    phase: &PhaseConfig,
    brain: &BrainOverrides,
) -> EffectiveConfig {
    EffectiveConfig {
        trading_mode: brain.trading_mode.unwrap_or_default(),
        account_mode: brain.account_mode.unwrap_or_default(),
        symbols: brain
            .symbols
            .clone()
            .or_else(|| phase.symbols.clone())
            .unwrap_or_else(|| defaults.symbols.clone()),
        alignment_weights: defaults.alignment_weights,
        a_plus_threshold: defaults.a_plus_threshold,
        b_threshold: defaults.b_threshold,
        rs_threshold: brain
            .rs_threshold
            .or(phase.rs_threshold)
            .unwrap_or(defaults.rs_threshold),
        target_r_min: phase.target_r_min.unwrap_or(defaults.target_r_min),
        target_r_max: phase.target_r_max.unwrap_or(defaults.target_r_max),
        risk_per_trade: brain
            .risk_per_trade
            .or(phase.risk_per_trade)
            .unwrap_or(defaults.risk_per_trade),
        conviction_min: defaults.conviction_min,
        conviction_max: defaults.conviction_max,
        max_concurrent_positions: brain
            .max_concurrent_positions
            .or(phase.max_concurrent_positions)
            .unwrap_or(defaults.max_concurrent_positions),
        max_leverage: phase.max_leverage.unwrap_or(defaults.max_leverage),
        max_portfolio_heat: defaults.max_portfolio_heat,
        max_correlated_exposure: defaults.max_correlated_exposure,
    }
}

/// Every violation found is reported together rather than stopping at the
/// first one, so an operator fixing a bad override file doesn't have to
/// retry field-by-field.
fn validate(cfg: &EffectiveConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if cfg.symbols.is_empty() {
        errors.push("symbols must not be empty".to_string());
    }
    let w = &cfg.alignment_weights;
    if (w.daily + w.h4 + w.m15 - 1.0).abs() > 1e-6 {
        errors.push(format!(
            "alignment_weights must sum to 1.0, got {}",
            w.daily + w.h4 + w.m15
        ));
    }
    if cfg.target_r_min > cfg.target_r_max {
        errors.push(format!(
            "target_r_min ({}) must be <= target_r_max ({})",
            cfg.target_r_min, cfg.target_r_max
        ));
    }
    if !(0.0..=1.0).contains(&cfg.risk_per_trade) {
        errors.push(format!(
            "risk_per_trade must be in [0,1], got {}",
            cfg.risk_per_trade
        ));
    }
    if cfg.conviction_min > cfg.conviction_max {
        errors.push("conviction_min must be <= conviction_max".to_string());
    }
    if cfg.max_concurrent_positions == 0 {
        errors.push("max_concurrent_positions must be >= 1".to_string());
    }
    if cfg.max_leverage <= 0.0 {
        errors.push("max_leverage must be > 0".to_string());
    }
    if !(0.0..=1.0).contains(&cfg.max_portfolio_heat) {
        errors.push("max_portfolio_heat must be in [0,1]".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Owns the three source layers and publishes a validated `EffectiveConfig`
/// snapshot behind an atomic pointer swap.
pub struct ConfigManager {
    defaults: StrategyDefaults,
    phase: RwLock<PhaseConfig>,
    brain: RwLock<BrainOverrides>,
    effective: RwLock<Arc<EffectiveConfig>>,
    revision: std::sync::atomic::AtomicU64,
}

impl ConfigManager {
    pub fn new(defaults: StrategyDefaults) -> Result<Self> {
        let effective = merge(&defaults, &PhaseConfig::default(), &BrainOverrides::default());
        validate(&effective).map_err(|errs| anyhow::anyhow!("invalid default config: {errs:?}"))?;
        Ok(Self {
            defaults,
            phase: RwLock::new(PhaseConfig::default()),
            brain: RwLock::new(BrainOverrides::default()),
            effective: RwLock::new(Arc::new(effective)),
            revision: std::sync::atomic::AtomicU64::new(0),
        })
    }

    pub fn load(strategy_path: impl AsRef<Path>) -> Result<Self> {
        let path = strategy_path.as_ref();
        let defaults: StrategyDefaults = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("failed to parse strategy defaults from {}", path.display()))?,
            Err(_) => {
                warn!(path = %path.display(), "no strategy defaults file, using built-in defaults");
                StrategyDefaults::default()
            }
        };
        Self::new(defaults)
    }

    /// Current effective configuration. Cheap: just an `Arc` clone.
    pub fn effective(&self) -> Arc<EffectiveConfig> {
        self.effective.read().clone()
    }

    /// Apply a new phase-level override set, re-merge, validate, and publish.
    /// On failure the previously-published snapshot remains live.
    pub fn apply_phase(&self, phase: PhaseConfig, bus: Option<&EventBus>) -> Result<(), Vec<String>> {
        let brain = self.brain.read().clone();
        let merged = merge(&self.defaults, &phase, &brain);
        validate(&merged)?;
        *self.phase.write() = phase;
        self.publish(merged, bus);
        Ok(())
    }

    /// Apply a new brain-level override set, re-merge, validate, and publish.
    pub fn apply_brain(&self, brain: BrainOverrides, bus: Option<&EventBus>) -> Result<(), Vec<String>> {
        let phase = self.phase.read().clone();
        let merged = merge(&self.defaults, &phase, &brain);
        validate(&merged)?;
        *self.brain.write() = brain;
        self.publish(merged, bus);
        Ok(())
    }

    fn publish(&self, merged: EffectiveConfig, bus: Option<&EventBus>) {
        *self.effective.write() = Arc::new(merged);
        let revision = self.revision.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        info!(revision, "effective config published");
        if let Some(bus) = bus {
            bus.publish(Event::ConfigChanged { revision });
        }
    }
}
