// =============================================================================
// Rate-Limit Tracker — keeps the live gateway under the venue's caps
// =============================================================================
//
// The venue enforces a request-weight budget per minute and order-count
// caps per 10 s and per day. The tracker mirrors the server's counters from
// response headers and blocks requests that would cross the hard limits.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, warn};

/// Hard ceiling at which we refuse to send additional requests.
const WEIGHT_HARD_LIMIT: u32 = 1000;
/// Soft warning threshold.
const WEIGHT_WARN_THRESHOLD: u32 = 800;

/// Maximum orders per 10-second window.
const ORDER_10S_LIMIT: u32 = 10;
/// Maximum orders per day.
const ORDER_1D_LIMIT: u32 = 200_000;

/// Lock-free tracker backed by atomic counters.
pub struct RateLimitTracker {
    used_weight_1m: AtomicU32,
    order_count_10s: AtomicU32,
    order_count_1d: AtomicU32,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
            order_count_10s: AtomicU32::new(0),
            order_count_1d: AtomicU32::new(0),
        }
    }

    /// Mirror the server's counters from response headers.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        let read = |name: &str| -> Option<u32> {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
        };

        if let Some(weight) = read("X-MBX-USED-WEIGHT-1M") {
            let prev = self.used_weight_1m.swap(weight, Ordering::Relaxed);
            if weight >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
                warn!(
                    used_weight = weight,
                    hard_limit = WEIGHT_HARD_LIMIT,
                    "request weight crossed warning threshold"
                );
            }
            debug!(used_weight_1m = weight, "rate-limit weight updated");
        }
        if let Some(count) = read("X-MBX-ORDER-COUNT-10S") {
            self.order_count_10s.store(count, Ordering::Relaxed);
        }
        if let Some(count) = read("X-MBX-ORDER-COUNT-1D") {
            self.order_count_1d.store(count, Ordering::Relaxed);
        }
    }

    /// Whether `weight` more request weight fits under the hard limit.
    pub fn can_send_request(&self, weight: u32) -> bool {
        let current = self.used_weight_1m.load(Ordering::Relaxed);
        let allowed = current + weight <= WEIGHT_HARD_LIMIT;
        if !allowed {
            warn!(
                current_weight = current,
                requested_weight = weight,
                "request blocked — would exceed rate limit"
            );
        }
        allowed
    }

    /// Whether another order fits under the 10 s and daily caps.
    pub fn can_place_order(&self) -> bool {
        if self.order_count_10s.load(Ordering::Relaxed) >= ORDER_10S_LIMIT {
            warn!("order blocked — 10 s order limit reached");
            return false;
        }
        if self.order_count_1d.load(Ordering::Relaxed) >= ORDER_1D_LIMIT {
            warn!("order blocked — daily order limit reached");
            return false;
        }
        true
    }

    /// Count an order locally before the server echoes updated headers.
    pub fn record_order_sent(&self) {
        self.order_count_10s.fetch_add(1, Ordering::Relaxed);
        self.order_count_1d.fetch_add(1, Ordering::Relaxed);
    }

    /// Reset the 10-second window (called from a periodic timer).
    pub fn reset_10s_counter(&self) {
        self.order_count_10s.store(0, Ordering::Relaxed);
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_budget_enforced() {
        let tracker = RateLimitTracker::new();
        assert!(tracker.can_send_request(100));

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("X-MBX-USED-WEIGHT-1M", "990".parse().unwrap());
        tracker.update_from_headers(&headers);
        assert!(!tracker.can_send_request(100));
        assert!(tracker.can_send_request(10));
    }

    #[test]
    fn order_caps_enforced() {
        let tracker = RateLimitTracker::new();
        for _ in 0..ORDER_10S_LIMIT {
            assert!(tracker.can_place_order());
            tracker.record_order_sent();
        }
        assert!(!tracker.can_place_order());
        tracker.reset_10s_counter();
        assert!(tracker.can_place_order());
    }
}
