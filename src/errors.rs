// =============================================================================
// Error taxonomy — matches the categories every component reports against
// =============================================================================
//
// Adapter-level transient failures travel as `anyhow::Error` with `.context(..)`
// attached at each hop; they are converted into `HunterError::ExternalTransient`
// only at the boundary where the orchestrator actually decides retry-vs-degrade.
// Everything else that a caller needs to match on (not just render) gets its
// own variant family here.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HunterError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("malformed bar data: {0}")]
    MalformedBar(String),

    #[error("transient exchange error on {symbol}: {source}")]
    ExternalTransient {
        symbol: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("persistent exchange error: {0}")]
    ExternalPersistent(String),

    #[error("illegal state transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("duplicate signal for open position on {0}")]
    DuplicateSignal(String),

    #[error("safety trip: {0}")]
    SafetyTrip(String),

    #[error("fatal invariant violated: {0}")]
    Fatal(String),
}

impl HunterError {
    /// True for categories the orchestrator should retry rather than escalate.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HunterError::ExternalTransient { .. })
    }

    /// True for categories that must halt the affected symbol rather than be
    /// silently corrected.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HunterError::Fatal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_retryable_nothing_else_is() {
        let e = HunterError::ExternalTransient {
            symbol: "BTCUSDT".into(),
            source: anyhow::anyhow!("timeout"),
        };
        assert!(e.is_retryable());
        assert!(!HunterError::Fatal("x".into()).is_retryable());
    }

    #[test]
    fn fatal_flagged_correctly() {
        let e = HunterError::Fatal("stop == entry".into());
        assert!(e.is_fatal());
        assert!(!HunterError::SafetyTrip("drawdown".into()).is_fatal());
    }
}
