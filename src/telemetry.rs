// =============================================================================
// Telemetry — the engine's observable surface
// =============================================================================
//
// One snapshot per cycle, published into shared state for whatever serves
// the control plane, plus a per-cycle tick pushed onto a single-producer
// queue drained by a dedicated logging task so the control loop never
// blocks on output.
// =============================================================================

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

use crate::market_data::BookSide;
use crate::position_fsm::{FsmState, Position};
use crate::types::{EngineMode, Side};

/// Density digest for the snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct DensitySummary {
    pub price_bucket: f64,
    pub side: BookSide,
    pub eaten_ratio: f64,
}

/// Per-symbol microstructure digest.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolTelemetry {
    pub symbol: String,
    pub tpm: f64,
    pub tps: f64,
    pub vol_delta: f64,
    pub activity_index: f64,
    pub is_dropping: bool,
    pub spread_bps: Option<f64>,
    pub book_stale: bool,
    pub densities: Vec<DensitySummary>,
}

/// Open-position digest.
#[derive(Debug, Clone, Serialize)]
pub struct PositionSummary {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub state: FsmState,
    pub qty_open: f64,
    pub entry_price: f64,
    pub stop_price: f64,
    pub realized_r: f64,
}

impl From<&Position> for PositionSummary {
    fn from(pos: &Position) -> Self {
        Self {
            id: pos.id.clone(),
            symbol: pos.symbol.clone(),
            side: pos.side,
            state: pos.state,
            qty_open: pos.qty_open,
            entry_price: pos.entry_price,
            stop_price: pos.stop_price,
            realized_r: pos.realized_r,
        }
    }
}

/// Full observable state, rebuilt every cycle.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    pub state: String,
    pub preset: String,
    pub mode: EngineMode,
    pub slots_available: u32,
    pub open_positions: Vec<PositionSummary>,
    pub cycle: u64,
    pub cycle_latency_ms: u64,
    pub daily_r: f64,
    pub consecutive_losses: u32,
    pub last_signal_ms: Option<i64>,
    pub symbols: Vec<SymbolTelemetry>,
}

impl TelemetrySnapshot {
    pub fn empty(preset: &str, mode: EngineMode) -> Self {
        Self {
            state: "IDLE".to_string(),
            preset: preset.to_string(),
            mode,
            slots_available: 0,
            open_positions: Vec::new(),
            cycle: 0,
            cycle_latency_ms: 0,
            daily_r: 0.0,
            consecutive_losses: 0,
            last_signal_ms: None,
            symbols: Vec::new(),
        }
    }
}

/// One control-loop heartbeat.
#[derive(Debug, Clone, Serialize)]
pub struct CycleTick {
    pub cycle: u64,
    pub state: String,
    pub latency_ms: u64,
    pub events_drained: usize,
    pub signals_emitted: usize,
    pub signals_rejected: usize,
    pub open_positions: usize,
    pub timestamp_ms: i64,
}

/// Spawn the drain task for cycle ticks. Unbounded because the producer is
/// the single control loop and ticks are tiny.
pub fn spawn_tick_logger() -> mpsc::UnboundedSender<CycleTick> {
    let (tx, mut rx) = mpsc::unbounded_channel::<CycleTick>();
    tokio::spawn(async move {
        while let Some(tick) = rx.recv().await {
            info!(
                cycle = tick.cycle,
                state = %tick.state,
                latency_ms = tick.latency_ms,
                events = tick.events_drained,
                signals = tick.signals_emitted,
                rejected = tick.signals_rejected,
                positions = tick.open_positions,
                "engine tick"
            );
        }
    });
    tx
}
