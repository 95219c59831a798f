// =============================================================================
// RateLimitTracker — tracks Binance REST weight/order usage to avoid 429s
// =============================================================================
//
// Binance enforces a request-weight budget (1200/minute, hard-capped here at
// 1000) plus order-rate ceilings (10/10s, 200000/day). The tracker reads the
// `X-MBX-USED-WEIGHT-1M` / `X-MBX-ORDER-COUNT-*` response headers after every
// call and keeps atomic counters any task may check lock-free before sending
// the next request.

use std::sync::atomic::{AtomicU32, Ordering};

use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const WEIGHT_HARD_LIMIT: u32 = 1000;
const WEIGHT_WARN_THRESHOLD: u32 = 800;
const ORDER_10S_LIMIT: u32 = 10;
const ORDER_1D_LIMIT: u32 = 200_000;

pub struct RateLimitTracker {
    used_weight_1m: AtomicU32,
    order_count_10s: AtomicU32,
    order_count_1d: AtomicU32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub used_weight_1m: u32,
    pub order_count_10s: u32,
    pub order_count_1d: u32,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
            order_count_10s: AtomicU32::new(0),
            order_count_1d: AtomicU32::new(0),
        }
    }

    /// Updates counters from the headers on a REST response. Only
    /// `X-MBX-USED-WEIGHT-1M` is guaranteed present; the order-count headers
    /// only appear on trading endpoints.
    pub fn update_from_headers(&self, headers: &HeaderMap) {
        if let Some(w) = header_u32(headers, "X-MBX-USED-WEIGHT-1M") {
            let prev = self.used_weight_1m.swap(w, Ordering::Relaxed);
            if w >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
                warn!(used_weight = w, hard_limit = WEIGHT_HARD_LIMIT, "rate-limit weight crossed warning threshold");
            } else if w >= WEIGHT_WARN_THRESHOLD {
                warn!(used_weight = w, "rate-limit weight remains above warning threshold");
            }
            debug!(used_weight_1m = w, "rate-limit weight updated from header");
        }
        if let Some(c) = header_u32(headers, "X-MBX-ORDER-COUNT-10S") {
            self.order_count_10s.store(c, Ordering::Relaxed);
        }
        if let Some(c) = header_u32(headers, "X-MBX-ORDER-COUNT-1D") {
            self.order_count_1d.store(c, Ordering::Relaxed);
        }
    }

    /// `true` if sending a request costing `weight` keeps us under the hard
    /// limit. Call this before every REST call, not after.
    pub fn can_send_request(&self, weight: u32) -> bool {
        let current = self.used_weight_1m.load(Ordering::Relaxed);
        let allowed = current + weight <= WEIGHT_HARD_LIMIT;
        if !allowed {
            warn!(current_weight = current, requested_weight = weight, hard_limit = WEIGHT_HARD_LIMIT, "request blocked — would exceed rate-limit");
        }
        allowed
    }

    pub fn can_place_order(&self) -> bool {
        let count_10s = self.order_count_10s.load(Ordering::Relaxed);
        let count_1d = self.order_count_1d.load(Ordering::Relaxed);
        if count_10s >= ORDER_10S_LIMIT {
            warn!(count_10s, limit = ORDER_10S_LIMIT, "order blocked — 10s order limit reached");
            return false;
        }
        if count_1d >= ORDER_1D_LIMIT {
            warn!(count_1d, limit = ORDER_1D_LIMIT, "order blocked — daily order limit reached");
            return false;
        }
        true
    }

    /// Optimistically bumps the order counters ahead of the exchange's own
    /// header update, so a burst of `place_order` calls inside the same
    /// second still self-throttles.
    pub fn record_order_sent(&self) {
        self.order_count_10s.fetch_add(1, Ordering::Relaxed);
        self.order_count_1d.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            used_weight_1m: self.used_weight_1m.load(Ordering::Relaxed),
            order_count_10s: self.order_count_10s.load(Ordering::Relaxed),
            order_count_1d: self.order_count_1d.load(Ordering::Relaxed),
        }
    }
}

fn header_u32(headers: &HeaderMap, name: &str) -> Option<u32> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("used_weight_1m", &self.used_weight_1m.load(Ordering::Relaxed))
            .field("order_count_10s", &self.order_count_10s.load(Ordering::Relaxed))
            .field("order_count_1d", &self.order_count_1d.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_limit_blocks_oversized_request() {
        let tracker = RateLimitTracker::new();
        tracker.used_weight_1m.store(990, Ordering::Relaxed);
        assert!(!tracker.can_send_request(20));
        assert!(tracker.can_send_request(5));
    }

    #[test]
    fn order_limit_blocks_after_10s_ceiling() {
        let tracker = RateLimitTracker::new();
        tracker.order_count_10s.store(ORDER_10S_LIMIT, Ordering::Relaxed);
        assert!(!tracker.can_place_order());
    }

    #[test]
    fn header_update_reads_used_weight() {
        let tracker = RateLimitTracker::new();
        let mut headers = HeaderMap::new();
        headers.insert("X-MBX-USED-WEIGHT-1M", "123".parse().unwrap());
        tracker.update_from_headers(&headers);
        assert_eq!(tracker.snapshot().used_weight_1m, 123);
    }
}
