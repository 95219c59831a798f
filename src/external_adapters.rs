// =============================================================================
// Oracle & GlobalCVD — external-confidence capability adapters
// =============================================================================
//
// Both are capability interfaces the core consumes with strict staleness
// rules: when the underlying data is older than the configured threshold,
// the adapter returns `None` and the signal pipeline proceeds without that
// layer rather than failing outright. The equal-weighted, staleness-aware
// folding pattern mirrors the one `futures_intel::FuturesIntelState` uses to
// average funding-rate/open-interest/long-short-ratio signals into one bias.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventImpact {
    Low,
    Med,
    High,
    Extreme,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleEvent {
    pub title: String,
    pub probability: f64,
    pub impact: EventImpact,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleReading {
    pub sentiment: f64,
    pub confidence: f64,
    pub events: Vec<OracleEvent>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consensus {
    Bullish,
    Bearish,
    Mixed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalCvdReading {
    pub consensus: Consensus,
    pub divergence_score: f64,
    pub exchanges_agree: u32,
    pub fetched_at: DateTime<Utc>,
}

fn is_stale(fetched_at: DateTime<Utc>, now: DateTime<Utc>, threshold: Duration) -> bool {
    let age = now.signed_duration_since(fetched_at);
    age > chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::zero())
}

/// Prediction-market sentiment capability. `fetch` always returns the raw
/// reading with its own timestamp; staleness is evaluated by the caller via
/// `fresh` so the same reading can be reused across multiple staleness
/// policies without re-fetching.
pub trait OracleAdapter: Send + Sync {
    fn fetch<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, OracleReading>;
}

/// Cross-exchange CVD consensus capability.
pub trait GlobalCvdAdapter: Send + Sync {
    fn fetch<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, GlobalCvdReading>;
}

pub const DEFAULT_STALENESS_THRESHOLD: Duration = Duration::from_secs(300);

/// Returns `Some(reading)` when fresh, `None` when stale — the contract the
/// signal pipeline relies on to gracefully drop this layer.
pub fn fresh_oracle(reading: OracleReading, now: DateTime<Utc>, threshold: Duration) -> Option<OracleReading> {
    if is_stale(reading.fetched_at, now, threshold) {
        None
    } else {
        Some(reading)
    }
}

pub fn fresh_global_cvd(reading: GlobalCvdReading, now: DateTime<Utc>, threshold: Duration) -> Option<GlobalCvdReading> {
    if is_stale(reading.fetched_at, now, threshold) {
        None
    } else {
        Some(reading)
    }
}

/// Folds whichever external-confidence layers are currently fresh into one
/// equal-weighted bias in [-1, 1], matching the futures-intel composite
/// pattern: signals that are absent (stale or never fetched) are simply
/// excluded from the average rather than counted as zero.
pub fn composite_external_bias(oracle: Option<&OracleReading>, global_cvd: Option<&GlobalCvdReading>) -> Option<f64> {
    let mut signals = Vec::new();

    if let Some(o) = oracle {
        signals.push(o.sentiment / 100.0);
    }
    if let Some(g) = global_cvd {
        let sign = match g.consensus {
            Consensus::Bullish => 1.0,
            Consensus::Bearish => -1.0,
            Consensus::Mixed => 0.0,
        };
        signals.push(sign * (1.0 - g.divergence_score / 100.0));
    }

    if signals.is_empty() {
        None
    } else {
        Some(signals.iter().sum::<f64>() / signals.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oracle_at(age_secs: i64, now: DateTime<Utc>) -> OracleReading {
        OracleReading {
            sentiment: 50.0,
            confidence: 80.0,
            events: vec![],
            fetched_at: now - chrono::Duration::seconds(age_secs),
        }
    }

    #[test]
    fn fresh_reading_within_threshold_is_kept() {
        let now = Utc::now();
        let reading = oracle_at(60, now);
        assert!(fresh_oracle(reading, now, DEFAULT_STALENESS_THRESHOLD).is_some());
    }

    #[test]
    fn stale_reading_beyond_threshold_becomes_none() {
        let now = Utc::now();
        let reading = oracle_at(360, now);
        assert!(fresh_oracle(reading, now, DEFAULT_STALENESS_THRESHOLD).is_none());
    }

    #[test]
    fn composite_bias_none_when_both_layers_absent() {
        assert_eq!(composite_external_bias(None, None), None);
    }

    #[test]
    fn composite_bias_averages_available_layers_only() {
        let now = Utc::now();
        let oracle = oracle_at(10, now);
        let bias_oracle_only = composite_external_bias(Some(&oracle), None).unwrap();
        assert!((bias_oracle_only - 0.5).abs() < 1e-9);

        let cvd = GlobalCvdReading {
            consensus: Consensus::Bullish,
            divergence_score: 20.0,
            exchanges_agree: 4,
            fetched_at: now,
        };
        let bias_both = composite_external_bias(Some(&oracle), Some(&cvd)).unwrap();
        let expected = (0.5 + 0.8) / 2.0;
        assert!((bias_both - expected).abs() < 1e-9);
    }
}
