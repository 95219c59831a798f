// =============================================================================
// Session profiling — UTC killzone classification, Asian range memory, Judas swing
// =============================================================================
//
// Classifies the current UTC time into ASIAN / LONDON / NY / DEAD_ZONE by
// configurable windows, remembers the Asian session's high/low for the rest
// of the UTC day, and flags the early-session liquidity sweep known as a
// Judas swing. Session windows never overlap; DEAD_ZONE is whatever the
// other three don't cover.

use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::market_data::Candle;
use crate::types::{Direction, SessionKind};

/// Configurable UTC hour windows. Defaults follow conventional FX/crypto
/// session hours: Asian 00:00-08:00, London 07:00-16:00, NY 12:00-21:00.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionWindows {
    pub asian_start_hour: u32,
    pub asian_end_hour: u32,
    pub london_start_hour: u32,
    pub london_end_hour: u32,
    pub ny_start_hour: u32,
    pub ny_end_hour: u32,
}

impl Default for SessionWindows {
    fn default() -> Self {
        Self {
            asian_start_hour: 0,
            asian_end_hour: 8,
            london_start_hour: 7,
            london_end_hour: 16,
            ny_start_hour: 12,
            ny_end_hour: 21,
        }
    }
}

fn hour_in_window(hour: u32, start: u32, end: u32) -> bool {
    if start <= end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

/// Range persisted from the most recent Asian session, used as the sweep
/// reference for Judas-swing detection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AsianRange {
    pub high: f64,
    pub low: f64,
    pub day: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub kind: SessionKind,
    pub window_start: NaiveTime,
    pub window_end: NaiveTime,
    pub asian_range: Option<AsianRange>,
}

/// Tracks session transitions and Asian-range memory for one symbol.
pub struct SessionProfiler {
    windows: SessionWindows,
    current: Option<SessionKind>,
    asian_range: Option<AsianRange>,
    asian_accum_high: f64,
    asian_accum_low: f64,
}

impl SessionProfiler {
    pub fn new(windows: SessionWindows) -> Self {
        Self {
            windows,
            current: None,
            asian_range: None,
            asian_accum_high: f64::MIN,
            asian_accum_low: f64::MAX,
        }
    }

    pub fn classify(&self, now: DateTime<Utc>) -> SessionKind {
        let hour = now.hour();
        if hour_in_window(hour, self.windows.london_start_hour, self.windows.london_end_hour) {
            SessionKind::London
        } else if hour_in_window(hour, self.windows.ny_start_hour, self.windows.ny_end_hour) {
            SessionKind::Ny
        } else if hour_in_window(hour, self.windows.asian_start_hour, self.windows.asian_end_hour) {
            SessionKind::Asian
        } else {
            SessionKind::DeadZone
        }
    }

    pub fn is_killzone(&self, now: DateTime<Utc>) -> bool {
        matches!(self.classify(now), SessionKind::London | SessionKind::Ny)
    }

    /// Feed a closed bar; updates the Asian-range accumulator while in the
    /// Asian window and emits a transition signal (symbol-agnostic; the
    /// caller attaches the symbol to the bus event) when the session changes.
    ///
    /// Returns `Some(new_kind)` only on a transition.
    pub fn on_bar(&mut self, bar: &Candle, now: DateTime<Utc>) -> Option<SessionKind> {
        let kind = self.classify(now);

        if kind == SessionKind::Asian {
            self.asian_accum_high = self.asian_accum_high.max(bar.high);
            self.asian_accum_low = self.asian_accum_low.min(bar.low);
        }

        let transitioned = self.current != Some(kind);
        if transitioned {
            if self.current == Some(SessionKind::Asian) && kind != SessionKind::Asian {
                // Asian session just closed — freeze the range for the rest
                // of the UTC day.
                self.asian_range = Some(AsianRange {
                    high: self.asian_accum_high,
                    low: self.asian_accum_low,
                    day: now.ordinal0() as i32,
                });
            }
            if kind == SessionKind::Asian && self.current != Some(SessionKind::Asian) {
                // Fresh Asian open discards the prior day's memory and
                // restarts accumulation.
                self.asian_accum_high = bar.high;
                self.asian_accum_low = bar.low;
            }
            info!(from = ?self.current, to = ?kind, "session transition");
            self.current = Some(kind);
        }

        transitioned.then_some(kind)
    }

    pub fn asian_range(&self) -> Option<AsianRange> {
        self.asian_range
    }

    pub fn state(&self, now: DateTime<Utc>) -> SessionState {
        let kind = self.classify(now);
        SessionState {
            kind,
            window_start: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
            window_end: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
            asian_range: self.asian_range,
        }
    }

    /// Detects a Judas swing within the first 60 minutes of LONDON or NY:
    /// price sweeps beyond the Asian range and closes back inside it.
    /// Returns the sweep direction if detected.
    pub fn detect_judas_swing(
        &self,
        now: DateTime<Utc>,
        session_open: DateTime<Utc>,
        bar: &Candle,
    ) -> Option<Direction> {
        if !matches!(self.classify(now), SessionKind::London | SessionKind::Ny) {
            return None;
        }
        let minutes_since_open = (now - session_open).num_minutes();
        if !(0..60).contains(&minutes_since_open) {
            return None;
        }
        let range = self.asian_range?;

        let swept_high = bar.high > range.high && bar.close < range.high;
        let swept_low = bar.low < range.low && bar.close > range.low;

        if swept_high {
            // Swept above, closed back inside: a bearish Judas swing.
            Some(Direction::Short)
        } else if swept_low {
            Some(Direction::Long)
        } else {
            None
        }
    }
}

impl Default for SessionProfiler {
    fn default() -> Self {
        Self::new(SessionWindows::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bar(high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open: close,
            high,
            low,
            close,
            volume: 1.0,
            quote_volume: 1.0,
            trades_count: 1,
            taker_buy_volume: 0.5,
            taker_buy_quote_volume: 0.5,
            is_closed: true,
        }
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn classifies_each_window() {
        let profiler = SessionProfiler::default();
        assert_eq!(profiler.classify(at(2)), SessionKind::Asian);
        assert_eq!(profiler.classify(at(9)), SessionKind::London);
        assert_eq!(profiler.classify(at(14)), SessionKind::Ny);
        assert_eq!(profiler.classify(at(23)), SessionKind::DeadZone);
    }

    #[test]
    fn killzone_is_only_london_and_ny() {
        let profiler = SessionProfiler::default();
        assert!(!profiler.is_killzone(at(2)));
        assert!(profiler.is_killzone(at(9)));
        assert!(profiler.is_killzone(at(14)));
        assert!(!profiler.is_killzone(at(23)));
    }

    #[test]
    fn asian_range_persists_after_session_closes() {
        let mut profiler = SessionProfiler::default();
        profiler.on_bar(&bar(105.0, 95.0, 100.0), at(1));
        profiler.on_bar(&bar(110.0, 90.0, 100.0), at(3));
        let transition = profiler.on_bar(&bar(100.0, 100.0, 100.0), at(9));
        assert_eq!(transition, Some(SessionKind::London));
        let range = profiler.asian_range().unwrap();
        assert_eq!(range.high, 110.0);
        assert_eq!(range.low, 90.0);
    }

    #[test]
    fn judas_swing_detects_sweep_above_and_close_back_inside() {
        let mut profiler = SessionProfiler::default();
        profiler.on_bar(&bar(105.0, 95.0, 100.0), at(3));
        profiler.on_bar(&bar(100.0, 100.0, 100.0), at(9));

        let session_open = at(7);
        let sweep_bar = bar(108.0, 99.0, 103.0); // sweeps 105 high, closes back under
        let result = profiler.detect_judas_swing(at(7) + chrono::Duration::minutes(10), session_open, &sweep_bar);
        assert_eq!(result, Some(Direction::Short));
    }

    #[test]
    fn judas_swing_none_outside_first_60_minutes() {
        let mut profiler = SessionProfiler::default();
        profiler.on_bar(&bar(105.0, 95.0, 100.0), at(3));
        profiler.on_bar(&bar(100.0, 100.0, 100.0), at(9));

        let session_open = at(7);
        let sweep_bar = bar(108.0, 99.0, 103.0);
        let result = profiler.detect_judas_swing(at(7) + chrono::Duration::minutes(90), session_open, &sweep_bar);
        assert_eq!(result, None);
    }
}
