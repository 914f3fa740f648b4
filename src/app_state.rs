// =============================================================================
// Shared state — the market-data hub feed tasks and the engine both see
// =============================================================================
//
// Ownership is deliberately narrow: the feed tasks write into the
// aggregates they own, the engine reads snapshots, and trading state never
// appears here. The telemetry slot is the engine's one write into shared
// space, for whatever control plane wants to observe it.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;

use crate::market_data::{CandleBuffer, OrderBookManager, TradesAggregator};
use crate::telemetry::TelemetrySnapshot;
use crate::types::EngineMode;

/// Shared across all tasks via `Arc<AppState>`.
pub struct AppState {
    pub candles: Arc<CandleBuffer>,
    pub trades: Arc<TradesAggregator>,
    pub books: Arc<OrderBookManager>,
    /// Latest per-cycle snapshot, rebuilt by the engine.
    pub telemetry: RwLock<TelemetrySnapshot>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(preset_name: &str, mode: EngineMode, max_trade_window_s: u64) -> Self {
        Self {
            candles: Arc::new(CandleBuffer::new(500)),
            trades: Arc::new(TradesAggregator::new(max_trade_window_s)),
            books: Arc::new(OrderBookManager::new()),
            telemetry: RwLock::new(TelemetrySnapshot::empty(preset_name, mode)),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
