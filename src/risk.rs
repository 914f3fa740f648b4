// =============================================================================
// Risk Manager — sizing, caps and the kill switch
// =============================================================================
//
// Every signal passes through here before execution:
//
//   1. Kill switch       — latched on daily loss in R or consecutive losses;
//                          cleared only by an operator retry.
//   2. Concurrency       — open positions below the cap, one idea per
//                          (symbol, side).
//   3. Risk budget       — open risk plus the new position's risk must fit
//                          inside the daily limit minus realised losses.
//   4. Correlation       — BTC-correlated open risk stays under its cap.
//   5. Sizing            — qty = risk / |entry - stop|, floored to the
//                          exchange step; zero after flooring fails the
//                          signal with qty_below_min.
//
// Daily counters reset when the UTC date rolls over.
// =============================================================================

use chrono::{TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::RiskRejection;
use crate::preset::RiskConfig;
use crate::signal_generator::Signal;
use crate::types::{floor_to_step, Side};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A signal with its computed size attached.
#[derive(Debug, Clone)]
pub struct SizedSignal {
    pub signal: Signal,
    pub qty: f64,
    /// Account currency at risk if the stop is hit (the value of 1 R).
    pub risk_amount: f64,
}

/// Open-position digest the risk manager needs for its caps.
#[derive(Debug, Clone)]
pub struct OpenPositionRisk {
    pub symbol: String,
    pub side: Side,
    pub open_risk_usd: f64,
    pub btc_correlated: bool,
}

/// Serialisable daily-counter state (persisted across restarts).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskDaySnapshot {
    pub date: String,
    pub realized_r_today: f64,
    pub realized_pnl_today: f64,
    pub consecutive_losses: u32,
    pub trades_today: u32,
    pub kill_switch: bool,
}

struct Inner {
    date: String,
    realized_r_today: f64,
    realized_pnl_today: f64,
    consecutive_losses: u32,
    trades_today: u32,
    kill_switch: bool,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct RiskManager {
    cfg: RiskConfig,
    state: RwLock<Inner>,
}

impl RiskManager {
    pub fn new(cfg: RiskConfig) -> Self {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        info!(
            risk_per_trade = cfg.risk_per_trade,
            daily_risk_limit = cfg.daily_risk_limit,
            max_concurrent = cfg.max_concurrent_positions,
            kill_switch_loss_r = cfg.kill_switch_loss_r,
            kill_switch_consecutive = cfg.kill_switch_consecutive,
            "risk manager initialised"
        );
        Self {
            cfg,
            state: RwLock::new(Inner {
                date: today,
                realized_r_today: 0.0,
                realized_pnl_today: 0.0,
                consecutive_losses: 0,
                trades_today: 0,
                kill_switch: false,
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Pre-trade gate + sizing
    // -------------------------------------------------------------------------

    /// Check every cap and size the signal. `now_ms` drives the daily reset
    /// so replays stay deterministic.
    pub fn evaluate(
        &self,
        signal: &Signal,
        equity: f64,
        step_size: f64,
        open: &[OpenPositionRisk],
        btc_correlated: bool,
        now_ms: i64,
    ) -> Result<SizedSignal, RiskRejection> {
        self.maybe_reset_daily(now_ms);
        let s = self.state.read();

        if s.kill_switch {
            return Err(RiskRejection::KillSwitch);
        }

        if open.len() >= self.cfg.max_concurrent_positions as usize {
            return Err(RiskRejection::MaxConcurrent {
                open: open.len(),
                cap: self.cfg.max_concurrent_positions,
            });
        }

        if open
            .iter()
            .any(|p| p.symbol == signal.symbol && p.side == signal.side)
        {
            return Err(RiskRejection::DuplicateExposure {
                symbol: signal.symbol.clone(),
                side: signal.side,
            });
        }

        let risk_amount = self.cfg.risk_per_trade * equity;
        let stop_distance = (signal.entry_price - signal.stop_price).abs();
        if stop_distance <= f64::EPSILON {
            return Err(RiskRejection::ZeroRiskDistance);
        }

        // Daily budget: realised losses eat into what may still be put at
        // risk today.
        let realized_loss = (-s.realized_pnl_today).max(0.0);
        let remaining = self.cfg.daily_risk_limit * equity - realized_loss;
        let open_risk: f64 = open.iter().map(|p| p.open_risk_usd).sum();
        if open_risk + risk_amount > remaining {
            return Err(RiskRejection::RiskBudgetExhausted {
                open_risk,
                new_risk: risk_amount,
                remaining: remaining.max(0.0),
            });
        }

        // BTC-correlated exposure cap, as a fraction of the daily budget.
        if btc_correlated {
            let correlated_risk: f64 = open
                .iter()
                .filter(|p| p.btc_correlated)
                .map(|p| p.open_risk_usd)
                .sum::<f64>()
                + risk_amount;
            let cap = self.cfg.btc_correlation_cap * self.cfg.daily_risk_limit * equity;
            if correlated_risk > cap {
                return Err(RiskRejection::CorrelationCap {
                    exposure: correlated_risk,
                    cap,
                });
            }
        }

        let raw_qty = risk_amount / stop_distance;
        let qty = floor_to_step(raw_qty, step_size);
        if qty <= 0.0 {
            return Err(RiskRejection::QtyBelowMin { step: step_size });
        }

        debug!(
            symbol = %signal.symbol,
            side = %signal.side,
            qty,
            risk_amount,
            stop_distance,
            "signal sized"
        );

        Ok(SizedSignal {
            signal: signal.clone(),
            qty,
            risk_amount,
        })
    }

    // -------------------------------------------------------------------------
    // Trade results
    // -------------------------------------------------------------------------

    /// Record a closed position's result. Returns `true` when this result
    /// tripped the kill switch.
    pub fn record_close(&self, realized_r: f64, realized_pnl: f64, now_ms: i64) -> bool {
        self.maybe_reset_daily(now_ms);
        let mut s = self.state.write();

        s.realized_r_today += realized_r;
        s.realized_pnl_today += realized_pnl;
        s.trades_today += 1;
        if realized_pnl < 0.0 {
            s.consecutive_losses += 1;
        } else {
            s.consecutive_losses = 0;
        }

        let loss_r = -s.realized_r_today;
        let tripped = !s.kill_switch
            && (loss_r >= self.cfg.kill_switch_loss_r
                || s.consecutive_losses >= self.cfg.kill_switch_consecutive);
        if tripped {
            s.kill_switch = true;
            warn!(
                daily_r = s.realized_r_today,
                consecutive_losses = s.consecutive_losses,
                "kill switch latched"
            );
        }

        debug!(
            realized_r,
            realized_pnl,
            daily_r = s.realized_r_today,
            consecutive_losses = s.consecutive_losses,
            "trade result recorded"
        );
        tripped
    }

    // -------------------------------------------------------------------------
    // Kill switch
    // -------------------------------------------------------------------------

    /// Latch the kill switch from an operator command.
    pub fn trip_kill_switch(&self) {
        let mut s = self.state.write();
        s.kill_switch = true;
        warn!("kill switch latched by command");
    }

    /// Clear the latch (operator `retry`). Consecutive losses also reset so
    /// the very next loss does not immediately re-trip.
    pub fn reset_kill_switch(&self) {
        let mut s = self.state.write();
        s.kill_switch = false;
        s.consecutive_losses = 0;
        info!("kill switch cleared");
    }

    pub fn kill_switch_active(&self) -> bool {
        self.state.read().kill_switch
    }

    pub fn daily_r(&self) -> f64 {
        self.state.read().realized_r_today
    }

    pub fn consecutive_losses(&self) -> u32 {
        self.state.read().consecutive_losses
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    pub fn snapshot(&self) -> RiskDaySnapshot {
        let s = self.state.read();
        RiskDaySnapshot {
            date: s.date.clone(),
            realized_r_today: s.realized_r_today,
            realized_pnl_today: s.realized_pnl_today,
            consecutive_losses: s.consecutive_losses,
            trades_today: s.trades_today,
            kill_switch: s.kill_switch,
        }
    }

    /// Restore the daily counters from a checkpoint. A snapshot from an
    /// older date is discarded (the day already rolled).
    pub fn restore(&self, snapshot: &RiskDaySnapshot, now_ms: i64) {
        let today = date_of(now_ms);
        let mut s = self.state.write();
        if snapshot.date == today {
            s.date = snapshot.date.clone();
            s.realized_r_today = snapshot.realized_r_today;
            s.realized_pnl_today = snapshot.realized_pnl_today;
            s.consecutive_losses = snapshot.consecutive_losses;
            s.trades_today = snapshot.trades_today;
            s.kill_switch = snapshot.kill_switch;
        } else {
            // The kill switch survives a date roll: clearing it stays an
            // operator decision.
            s.kill_switch = snapshot.kill_switch;
            info!(old = %snapshot.date, new = %today, "risk checkpoint from a previous day discarded");
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn maybe_reset_daily(&self, now_ms: i64) {
        let today = date_of(now_ms);
        {
            let s = self.state.read();
            if s.date == today {
                return;
            }
        }
        let mut s = self.state.write();
        if s.date != today {
            info!(old_date = %s.date, new_date = %today, "date rolled — resetting daily risk counters");
            s.date = today;
            s.realized_r_today = 0.0;
            s.realized_pnl_today = 0.0;
            s.consecutive_losses = 0;
            s.trades_today = 0;
            // kill_switch deliberately survives the roll.
        }
    }
}

fn date_of(now_ms: i64) -> String {
    Utc.timestamp_millis_opt(now_ms)
        .single()
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

impl std::fmt::Debug for RiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.read();
        f.debug_struct("RiskManager")
            .field("date", &s.date)
            .field("realized_r_today", &s.realized_r_today)
            .field("consecutive_losses", &s.consecutive_losses)
            .field("kill_switch", &s.kill_switch)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
