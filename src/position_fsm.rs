// =============================================================================
// Position FSM — per-position life cycle
// =============================================================================
//
//   ENTRY -> RUNNING -> BREAKEVEN -> PARTIAL_CLOSED -> TRAILING -> EXITING
//                                                                     |
//                                 CLOSED  <---------------------------+
//
// The step function is pure: it receives a position snapshot plus the
// cycle's inputs and returns the transition and the actions the execution
// layer must perform. All mutation happens in the registry that owns the
// positions, so replaying the same inputs always yields the same
// trajectory.
//
// The protective stop only ever moves in the favourable direction. A
// computed stop that would widen the risk is discarded and logged as an
// invariant violation.
// =============================================================================

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::density_detector::Density;
use crate::errors::InvariantViolation;
use crate::level_detector::Level;
use crate::preset::{PlacementMode, PositionConfig, TpLevelConfig};
use crate::types::{bps_to_frac, distance_bps, Side};

// ---------------------------------------------------------------------------
// States and reasons
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsmState {
    Entry,
    Running,
    Breakeven,
    PartialClosed,
    Trailing,
    Exiting,
    Closed,
}

impl FsmState {
    /// States in which the position is filled and actively managed.
    pub fn is_running_family(self) -> bool {
        matches!(
            self,
            Self::Running | Self::Breakeven | Self::PartialClosed | Self::Trailing
        )
    }
}

impl std::fmt::Display for FsmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Entry => "ENTRY",
            Self::Running => "RUNNING",
            Self::Breakeven => "BREAKEVEN",
            Self::PartialClosed => "PARTIAL_CLOSED",
            Self::Trailing => "TRAILING",
            Self::Exiting => "EXITING",
            Self::Closed => "CLOSED",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopHit,
    TrailingStop,
    EntryTimeout,
    FailedBreakout,
    PanicExit,
    TimeStop,
    LadderComplete,
    Panic,
    Manual,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::StopHit => "stop_hit",
            Self::TrailingStop => "trailing_stop",
            Self::EntryTimeout => "entry_timeout",
            Self::FailedBreakout => "failed_breakout",
            Self::PanicExit => "panic_exit",
            Self::TimeStop => "time_stop",
            Self::LadderComplete => "ladder_complete",
            Self::Panic => "panic",
            Self::Manual => "manual",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// One take-profit rung with its working price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TpRung {
    pub reward_multiple: f64,
    pub size_pct: f64,
    pub placement_mode: PlacementMode,
    pub price: f64,
    pub filled: bool,
}

/// A tracked position. Serialises exactly for checkpointing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub qty_open: f64,
    pub qty_initial: f64,
    pub stop_price: f64,
    /// The stop the position was born with; defines the value of 1 R.
    pub initial_stop: f64,
    pub tp_ladder: Vec<TpRung>,
    /// The breakout level that justified the entry.
    pub level_price: f64,
    pub opened_ms: i64,
    pub bars_since_entry: u32,
    pub realized_r: f64,
    pub realized_pnl: f64,
    /// Max favourable / adverse excursion, in R.
    pub mfe: f64,
    pub mae: f64,
    pub state: FsmState,
    pub history: VecDeque<FsmState>,
    pub exit_attempts: u32,
    pub exit_reason: Option<ExitReason>,
    pub closed_ms: Option<i64>,
}

impl Position {
    /// Price distance worth exactly 1 R.
    pub fn risk_per_unit(&self) -> f64 {
        (self.entry_price - self.initial_stop).abs()
    }

    /// Unrealised reward multiple at `price`.
    pub fn unrealized_r(&self, price: f64) -> f64 {
        let risk = self.risk_per_unit();
        if risk <= f64::EPSILON {
            return 0.0;
        }
        self.side.sign() * (price - self.entry_price) / risk
    }

    /// Account currency still at risk if the current stop fills. Zero once
    /// the stop is at or beyond break-even.
    pub fn open_risk_usd(&self) -> f64 {
        let adverse = self.side.sign() * (self.entry_price - self.stop_price);
        (adverse * self.qty_open).max(0.0)
    }

    /// Move the stop if and only if the move is favourable. Widening moves
    /// are discarded and reported.
    pub fn try_move_stop(&mut self, new_stop: f64) -> Result<bool, InvariantViolation> {
        let improvement = self.side.sign() * (new_stop - self.stop_price);
        if improvement > 0.0 {
            debug!(
                id = %self.id,
                from = self.stop_price,
                to = new_stop,
                "stop moved"
            );
            self.stop_price = new_stop;
            Ok(true)
        } else if improvement < 0.0 {
            Err(InvariantViolation::StopWidensRisk {
                position_id: self.id.clone(),
                current: self.stop_price,
                proposed: new_stop,
            })
        } else {
            Ok(false)
        }
    }

    /// Track max favourable / adverse excursion.
    pub fn update_excursions(&mut self, price: f64) {
        let r = self.unrealized_r(price);
        if r > self.mfe {
            self.mfe = r;
        }
        if r < self.mae {
            self.mae = r;
        }
    }

    /// Apply a fill that reduces the position, prorating realised R by the
    /// filled fraction of the initial quantity.
    pub fn apply_exit_fill(&mut self, qty: f64, price: f64) {
        let qty = qty.min(self.qty_open);
        if qty <= 0.0 || self.qty_initial <= 0.0 {
            return;
        }
        self.realized_r += (qty / self.qty_initial) * self.unrealized_r(price);
        self.realized_pnl += self.side.sign() * (price - self.entry_price) * qty;
        self.qty_open -= qty;
        if self.qty_open < 1e-12 {
            self.qty_open = 0.0;
        }
    }

    pub fn record_state(&mut self, state: FsmState, history_cap: usize) {
        self.state = state;
        self.history.push_back(state);
        while self.history.len() > history_cap {
            self.history.pop_front();
        }
    }
}

// ---------------------------------------------------------------------------
// FSM inputs / outputs
// ---------------------------------------------------------------------------

/// Everything the step function may look at for one position this cycle.
#[derive(Debug, Clone, Default)]
pub struct FsmInputs {
    pub price: f64,
    pub now_ms: i64,
    /// A working-timeframe bar closed since the last step.
    pub bar_closed: bool,
    /// The last closed bar re-entered the breakout level (beyond the
    /// failed-breakout threshold).
    pub closed_back_inside_level: bool,
    pub activity_dropping: bool,
    /// A TP rung filled since the last step.
    pub tp_fill_since_last_step: bool,
    /// Market data for the symbol is stale; only time-based transitions run.
    pub data_stale: bool,
}

/// Side effects the execution layer must carry out.
#[derive(Debug, Clone, PartialEq)]
pub enum FsmAction {
    MoveStop { to: f64 },
    ReplaceTp { index: usize, price: f64 },
    CancelEntry,
    /// Submit a reduce-only market order for the remaining quantity.
    SubmitExit { qty: f64 },
    /// Cancel resting TP (and stop) orders ahead of closing out.
    CancelOpenOrders,
}

/// Result of one step: the state to record plus the actions to run.
#[derive(Debug, Clone)]
pub struct FsmStep {
    pub next: FsmState,
    pub reason: Option<ExitReason>,
    pub actions: Vec<FsmAction>,
}

impl FsmStep {
    fn stay(state: FsmState) -> Self {
        Self {
            next: state,
            reason: None,
            actions: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// FSM
// ---------------------------------------------------------------------------

/// Obstacles the smart TP placement steers around.
#[derive(Debug, Clone, Copy, Default)]
pub struct LadderContext<'a> {
    pub densities: &'a [Density],
    pub levels: &'a [Level],
    pub round_steps: &'a [f64],
}

pub struct PositionFsm {
    cfg: PositionConfig,
}

impl PositionFsm {
    pub fn new(cfg: PositionConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &PositionConfig {
        &self.cfg
    }

    // -------------------------------------------------------------------------
    // Ladder construction
    // -------------------------------------------------------------------------

    /// Price the TP ladder for a new position.
    pub fn build_ladder(
        &self,
        ladder_cfg: &[TpLevelConfig],
        side: Side,
        entry: f64,
        initial_stop: f64,
        ctx: &LadderContext<'_>,
    ) -> Vec<TpRung> {
        let risk = (entry - initial_stop).abs();
        let mut rungs: Vec<TpRung> = Vec::with_capacity(ladder_cfg.len());

        for cfg_rung in ladder_cfg {
            let target = entry + side.sign() * cfg_rung.reward_multiple * risk;
            let price = match cfg_rung.placement_mode {
                PlacementMode::Fixed | PlacementMode::Adaptive => target,
                PlacementMode::Smart => self.smart_adjust(target, side, ctx),
            };
            // Adjustments must not break the ladder ordering.
            let price = match rungs.last() {
                Some(prev) if side.sign() * (price - prev.price) <= 0.0 => target,
                _ => price,
            };
            rungs.push(TpRung {
                reward_multiple: cfg_rung.reward_multiple,
                size_pct: cfg_rung.size_pct,
                placement_mode: cfg_rung.placement_mode,
                price,
                filled: false,
            });
        }
        rungs
    }

    /// Nudge a smart TP within `max_adjustment_bps`: stay in front of
    /// density walls and levels, otherwise snap to a round number.
    fn smart_adjust(&self, target: f64, side: Side, ctx: &LadderContext<'_>) -> f64 {
        let max_adj = self.cfg.max_adjustment_bps;
        if max_adj <= 0.0 {
            return target;
        }

        // Obstacle at or just beyond the target: take profit in front of it.
        let mut obstacles: Vec<f64> = ctx
            .densities
            .iter()
            .map(|d| d.price_bucket)
            .chain(ctx.levels.iter().map(|l| l.price))
            .filter(|&p| {
                let beyond = side.sign() * (p - target) >= 0.0;
                beyond && distance_bps(p, target) <= max_adj
            })
            .collect();
        if !obstacles.is_empty() {
            obstacles.sort_by(|a, b| {
                let da = side.sign() * (a - target);
                let db = side.sign() * (b - target);
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            });
            let front = obstacles[0] * (1.0 - side.sign() * bps_to_frac(2.0));
            return front;
        }

        // No obstacle: prefer a round number inside the window.
        for &step in ctx.round_steps {
            if step <= 0.0 || target < step {
                continue;
            }
            let nearest = (target / step).round() * step;
            if distance_bps(nearest, target) <= max_adj {
                return nearest;
            }
        }
        target
    }

    // -------------------------------------------------------------------------
    // Step
    // -------------------------------------------------------------------------

    /// Advance one position by one cycle.
    pub fn step(&self, pos: &Position, inputs: &FsmInputs) -> FsmStep {
        match pos.state {
            FsmState::Entry => self.step_entry(pos, inputs),
            s if s.is_running_family() => self.step_running_family(pos, inputs),
            FsmState::Exiting => self.step_exiting(pos),
            _ => FsmStep::stay(pos.state),
        }
    }

    fn step_entry(&self, pos: &Position, _inputs: &FsmInputs) -> FsmStep {
        if pos.qty_open >= pos.qty_initial - 1e-12 {
            return FsmStep {
                next: FsmState::Running,
                reason: None,
                actions: Vec::new(),
            };
        }
        if pos.bars_since_entry > self.cfg.fsm_config.entry_confirmation_bars {
            if pos.qty_open > 0.0 {
                // Partially filled at timeout: keep what we have, cancel
                // the rest. The registry shrinks qty_initial to the fill.
                return FsmStep {
                    next: FsmState::Running,
                    reason: None,
                    actions: vec![FsmAction::CancelEntry],
                };
            }
            return FsmStep {
                next: FsmState::Closed,
                reason: Some(ExitReason::EntryTimeout),
                actions: vec![FsmAction::CancelEntry, FsmAction::CancelOpenOrders],
            };
        }
        FsmStep::stay(FsmState::Entry)
    }

    fn step_running_family(&self, pos: &Position, inputs: &FsmInputs) -> FsmStep {
        // Time-based exits run even on stale data.
        let held_ms = inputs.now_ms - pos.opened_ms;
        if held_ms as f64 >= self.cfg.max_hold_time_hours * 3_600_000.0 {
            return self.begin_exit(pos, ExitReason::TimeStop);
        }
        // Stagnation: never progressed past RUNNING within the time stop.
        if pos.state == FsmState::Running
            && held_ms >= (self.cfg.time_stop_minutes as i64) * 60_000
        {
            return self.begin_exit(pos, ExitReason::TimeStop);
        }

        if inputs.data_stale {
            // Price-driven transitions are suspended; the resting stop at
            // the exchange still protects the position.
            return FsmStep::stay(pos.state);
        }

        let price = inputs.price;
        let r = pos.unrealized_r(price);

        // 1. Stop crossed.
        if pos.side.sign() * (price - pos.stop_price) <= 0.0 {
            let reason = if pos.state == FsmState::Trailing {
                ExitReason::TrailingStop
            } else {
                ExitReason::StopHit
            };
            return self.begin_exit(pos, reason);
        }

        // 2. Failed breakout: price closed back inside the level early on.
        if self.cfg.exit_rules.failed_breakout_enabled
            && inputs.closed_back_inside_level
            && pos.bars_since_entry <= self.cfg.exit_rules.failed_breakout_bars
        {
            return self.begin_exit(pos, ExitReason::FailedBreakout);
        }

        // 3. Activity collapse.
        if self.cfg.exit_rules.activity_drop_enabled && inputs.activity_dropping {
            return self.begin_exit(pos, ExitReason::PanicExit);
        }

        // 4. TP fill upgrades the state.
        if inputs.tp_fill_since_last_step
            && matches!(pos.state, FsmState::Running | FsmState::Breakeven)
        {
            if pos.tp_ladder.iter().all(|rung| rung.filled) && pos.qty_open <= 1e-12 {
                // Single-rung full-size ladder: nothing left to manage.
                return FsmStep {
                    next: FsmState::Closed,
                    reason: Some(ExitReason::LadderComplete),
                    actions: vec![FsmAction::CancelOpenOrders],
                };
            }
            return FsmStep {
                next: FsmState::PartialClosed,
                reason: None,
                actions: Vec::new(),
            };
        }

        // 5. Favourable upgrades and trailing maintenance.
        match pos.state {
            FsmState::Running if r >= self.cfg.breakeven_trigger_r => {
                let buffered = pos.entry_price
                    * (1.0 + pos.side.sign() * bps_to_frac(self.cfg.breakeven_buffer_bps));
                FsmStep {
                    next: FsmState::Breakeven,
                    reason: None,
                    actions: self.stop_move_actions(pos, buffered),
                }
            }
            FsmState::Breakeven if r >= self.cfg.trailing_activation_r => FsmStep {
                next: FsmState::Trailing,
                reason: None,
                actions: self.trailing_actions(pos, price, r),
            },
            FsmState::PartialClosed
                if r >= self.cfg.fsm_config.partial_closed_trail_trigger_r =>
            {
                FsmStep {
                    next: FsmState::Trailing,
                    reason: None,
                    actions: self.trailing_actions(pos, price, r),
                }
            }
            FsmState::Trailing => FsmStep {
                next: FsmState::Trailing,
                reason: None,
                actions: self.trailing_actions(pos, price, r),
            },
            state => FsmStep::stay(state),
        }
    }

    fn step_exiting(&self, pos: &Position) -> FsmStep {
        if pos.qty_open <= 1e-12 {
            return FsmStep {
                next: FsmState::Closed,
                reason: pos.exit_reason.or(Some(ExitReason::Manual)),
                actions: Vec::new(),
            };
        }
        if pos.exit_attempts >= self.cfg.fsm_config.exiting_panic_after_attempts {
            warn!(
                id = %pos.id,
                attempts = pos.exit_attempts,
                "exit attempts exhausted — abandoning position as panic"
            );
            return FsmStep {
                next: FsmState::Closed,
                reason: Some(ExitReason::Panic),
                actions: Vec::new(),
            };
        }
        FsmStep {
            next: FsmState::Exiting,
            reason: pos.exit_reason,
            actions: vec![FsmAction::SubmitExit { qty: pos.qty_open }],
        }
    }

    fn begin_exit(&self, pos: &Position, reason: ExitReason) -> FsmStep {
        FsmStep {
            next: FsmState::Exiting,
            reason: Some(reason),
            actions: vec![
                FsmAction::CancelOpenOrders,
                FsmAction::SubmitExit { qty: pos.qty_open },
            ],
        }
    }

    /// Discrete trailing: the stop follows price at the trailing step
    /// distance, switching to the acceleration step deep in profit. Also
    /// re-anchors adaptive TP rungs as the stop ratchets.
    fn trailing_actions(&self, pos: &Position, price: f64, r: f64) -> Vec<FsmAction> {
        let step_bps = if r >= self.cfg.trailing_accel_after_r {
            self.cfg.trailing_accel_step_bps
        } else {
            self.cfg.trailing_step_bps
        };
        let candidate = price * (1.0 - pos.side.sign() * bps_to_frac(step_bps));
        let mut actions = self.stop_move_actions(pos, candidate);

        let risk = pos.risk_per_unit();
        for (i, rung) in pos.tp_ladder.iter().enumerate() {
            if rung.filled || rung.placement_mode != PlacementMode::Adaptive {
                continue;
            }
            let re_anchored = candidate + pos.side.sign() * rung.reward_multiple * risk;
            if pos.side.sign() * (re_anchored - rung.price) > 0.0 {
                actions.push(FsmAction::ReplaceTp {
                    index: i,
                    price: re_anchored,
                });
            }
        }
        actions
    }

    /// MoveStop only when the candidate improves on the current stop.
    fn stop_move_actions(&self, pos: &Position, candidate: f64) -> Vec<FsmAction> {
        if pos.side.sign() * (candidate - pos.stop_price) > 0.0 {
            vec![FsmAction::MoveStop { to: candidate }]
        } else {
            Vec::new()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::BookSide;
    use crate::preset::{ExitRules, FsmConfig, SlMode};

    const NOW: i64 = 1_700_000_000_000;

    fn cfg() -> PositionConfig {
        PositionConfig {
            tp_levels: vec![
                TpLevelConfig {
                    reward_multiple: 1.5,
                    size_pct: 0.5,
                    placement_mode: PlacementMode::Fixed,
                },
                TpLevelConfig {
                    reward_multiple: 3.0,
                    size_pct: 0.3,
                    placement_mode: PlacementMode::Fixed,
                },
            ],
            tp1_r: None,
            tp2_r: None,
            sl_mode: SlMode::Fixed,
            breakeven_trigger_r: 1.0,
            breakeven_buffer_bps: 3.0,
            trailing_activation_r: 1.5,
            trailing_step_bps: 20.0,
            trailing_accel_after_r: 3.0,
            trailing_accel_step_bps: 40.0,
            max_adjustment_bps: 10.0,
            time_stop_minutes: 600,
            max_hold_time_hours: 24.0,
            exit_rules: ExitRules {
                failed_breakout_enabled: true,
                failed_breakout_bars: 6,
                failed_breakout_retest_threshold_bps: 4.0,
                activity_drop_enabled: true,
            },
            fsm_config: FsmConfig {
                entry_confirmation_bars: 3,
                partial_closed_trail_trigger_r: 2.0,
                exiting_panic_after_attempts: 3,
                history_cap: 16,
            },
        }
    }

    fn fsm() -> PositionFsm {
        PositionFsm::new(cfg())
    }

    /// Long 1.0 at 100 with stop 99, already filled (RUNNING).
    fn long_position() -> Position {
        let f = fsm();
        let ladder = f.build_ladder(
            &cfg().tp_levels,
            Side::Long,
            100.0,
            99.0,
            &LadderContext::default(),
        );
        Position {
            id: "pos-1".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            entry_price: 100.0,
            qty_open: 1.0,
            qty_initial: 1.0,
            stop_price: 99.0,
            initial_stop: 99.0,
            tp_ladder: ladder,
            level_price: 99.5,
            opened_ms: NOW,
            bars_since_entry: 0,
            realized_r: 0.0,
            realized_pnl: 0.0,
            mfe: 0.0,
            mae: 0.0,
            state: FsmState::Running,
            history: VecDeque::new(),
            exit_attempts: 0,
            exit_reason: None,
            closed_ms: None,
        }
    }

    fn inputs(price: f64) -> FsmInputs {
        FsmInputs {
            price,
            now_ms: NOW + 60_000,
            bar_closed: false,
            closed_back_inside_level: false,
            activity_dropping: false,
            tp_fill_since_last_step: false,
            data_stale: false,
        }
    }

    #[test]
    fn ladder_prices_at_r_multiples() {
        let pos = long_position();
        assert!((pos.tp_ladder[0].price - 101.5).abs() < 1e-9);
        assert!((pos.tp_ladder[1].price - 103.0).abs() < 1e-9);
    }

    #[test]
    fn entry_fills_to_running() {
        let f = fsm();
        let mut pos = long_position();
        pos.state = FsmState::Entry;
        let step = f.step(&pos, &inputs(100.0));
        assert_eq!(step.next, FsmState::Running);
    }

    #[test]
    fn entry_timeout_cancels_and_closes() {
        let f = fsm();
        let mut pos = long_position();
        pos.state = FsmState::Entry;
        pos.qty_open = 0.0;
        pos.bars_since_entry = 4;
        let step = f.step(&pos, &inputs(100.0));
        assert_eq!(step.next, FsmState::Closed);
        assert_eq!(step.reason, Some(ExitReason::EntryTimeout));
        assert!(step.actions.contains(&FsmAction::CancelEntry));
    }

    #[test]
    fn stop_hit_begins_exit() {
        let f = fsm();
        let pos = long_position();
        let step = f.step(&pos, &inputs(98.9));
        assert_eq!(step.next, FsmState::Exiting);
        assert_eq!(step.reason, Some(ExitReason::StopHit));
        assert!(step
            .actions
            .iter()
            .any(|a| matches!(a, FsmAction::SubmitExit { qty } if (*qty - 1.0).abs() < 1e-9)));
    }

    #[test]
    fn breakeven_then_trailing_trajectory() {
        // Entry 100, stop 99: breakeven at R=1, trailing arms at R=1.5
        // with a 20 bps step.
        let f = fsm();
        let mut pos = long_position();

        // R = 1.0 -> BREAKEVEN, stop to entry + buffer.
        let step = f.step(&pos, &inputs(101.0));
        assert_eq!(step.next, FsmState::Breakeven);
        let to = match step.actions.as_slice() {
            [FsmAction::MoveStop { to }] => *to,
            other => panic!("expected MoveStop, got {other:?}"),
        };
        assert!((to - 100.0 * (1.0 + 3.0 / 10_000.0)).abs() < 1e-9);
        pos.record_state(step.next, 16);
        assert!(pos.try_move_stop(to).unwrap());

        // R = 1.5 -> TRAILING arms and immediately ratchets the stop.
        let step = f.step(&pos, &inputs(101.5));
        assert_eq!(step.next, FsmState::Trailing);
        let to = step
            .actions
            .iter()
            .find_map(|a| match a {
                FsmAction::MoveStop { to } => Some(*to),
                _ => None,
            })
            .expect("trailing must move the stop");
        assert!((to - 101.5 * (1.0 - 20.0 / 10_000.0)).abs() < 1e-9);
        pos.record_state(step.next, 16);
        assert!(pos.try_move_stop(to).unwrap());

        // Price 102 -> stop 101.796, monotone.
        let step = f.step(&pos, &inputs(102.0));
        let to = step
            .actions
            .iter()
            .find_map(|a| match a {
                FsmAction::MoveStop { to } => Some(*to),
                _ => None,
            })
            .expect("stop must ratchet");
        assert!((to - 102.0 * (1.0 - 20.0 / 10_000.0)).abs() < 1e-9);
        assert!(to > pos.stop_price);
        assert!(pos.try_move_stop(to).unwrap());

        // Price falls through the trail -> EXITING.
        let step = f.step(&pos, &inputs(101.79));
        assert_eq!(step.next, FsmState::Exiting);
        assert_eq!(step.reason, Some(ExitReason::TrailingStop));
    }

    #[test]
    fn stop_never_widens() {
        let mut pos = long_position();
        assert!(pos.try_move_stop(99.5).unwrap());
        let err = pos.try_move_stop(99.2).unwrap_err();
        assert!(matches!(err, InvariantViolation::StopWidensRisk { .. }));
        assert!((pos.stop_price - 99.5).abs() < 1e-12);
        // No-op move is not a violation.
        assert!(!pos.try_move_stop(99.5).unwrap());
    }

    #[test]
    fn failed_breakout_exits_early() {
        let f = fsm();
        let mut pos = long_position();
        pos.bars_since_entry = 2;
        let mut input = inputs(99.6);
        input.closed_back_inside_level = true;
        let step = f.step(&pos, &input);
        assert_eq!(step.next, FsmState::Exiting);
        assert_eq!(step.reason, Some(ExitReason::FailedBreakout));

        // Outside the window the same close is ignored.
        pos.bars_since_entry = 20;
        let step = f.step(&pos, &input);
        assert_ne!(step.reason, Some(ExitReason::FailedBreakout));
    }

    #[test]
    fn activity_drop_panic_exit() {
        let f = fsm();
        let pos = long_position();
        let mut input = inputs(100.5);
        input.activity_dropping = true;
        let step = f.step(&pos, &input);
        assert_eq!(step.next, FsmState::Exiting);
        assert_eq!(step.reason, Some(ExitReason::PanicExit));
    }

    #[test]
    fn max_hold_time_stops_out() {
        let f = fsm();
        let pos = long_position();
        let mut input = inputs(100.5);
        input.now_ms = NOW + 25 * 3_600_000;
        let step = f.step(&pos, &input);
        assert_eq!(step.next, FsmState::Exiting);
        assert_eq!(step.reason, Some(ExitReason::TimeStop));
    }

    #[test]
    fn stagnant_running_position_times_out() {
        let f = fsm();
        let pos = long_position();
        let mut input = inputs(100.1);
        input.now_ms = NOW + 601 * 60_000;
        let step = f.step(&pos, &input);
        assert_eq!(step.next, FsmState::Exiting);
        assert_eq!(step.reason, Some(ExitReason::TimeStop));
    }

    #[test]
    fn tp_fill_moves_to_partial_closed() {
        let f = fsm();
        let mut pos = long_position();
        pos.record_state(FsmState::Breakeven, 16);
        pos.stop_price = 100.03;
        pos.tp_ladder[0].filled = true;
        pos.apply_exit_fill(0.5, 101.5);

        let mut input = inputs(101.5);
        input.tp_fill_since_last_step = true;
        let step = f.step(&pos, &input);
        assert_eq!(step.next, FsmState::PartialClosed);
        // Realised R: half the size at 1.5 R.
        assert!((pos.realized_r - 0.75).abs() < 1e-9);
        assert!((pos.qty_open - 0.5).abs() < 1e-9);
    }

    #[test]
    fn single_full_size_rung_closes_directly() {
        let f = fsm();
        let mut pos = long_position();
        pos.tp_ladder = vec![TpRung {
            reward_multiple: 2.0,
            size_pct: 1.0,
            placement_mode: PlacementMode::Fixed,
            price: 102.0,
            filled: true,
        }];
        pos.record_state(FsmState::Breakeven, 16);
        pos.stop_price = 100.03;
        pos.apply_exit_fill(1.0, 102.0);

        let mut input = inputs(102.0);
        input.tp_fill_since_last_step = true;
        let step = f.step(&pos, &input);
        assert_eq!(step.next, FsmState::Closed);
        assert_eq!(step.reason, Some(ExitReason::LadderComplete));
        assert!((pos.realized_r - 2.0).abs() < 1e-9);
    }

    #[test]
    fn partial_closed_arms_trailing_at_trigger() {
        let f = fsm();
        let mut pos = long_position();
        pos.record_state(FsmState::PartialClosed, 16);
        pos.stop_price = 100.03;
        pos.qty_open = 0.5;

        // Below the trigger: stays.
        let step = f.step(&pos, &inputs(101.8));
        assert_eq!(step.next, FsmState::PartialClosed);

        // At 2 R: trailing arms.
        let step = f.step(&pos, &inputs(102.0));
        assert_eq!(step.next, FsmState::Trailing);
    }

    #[test]
    fn exiting_drains_then_closes() {
        let f = fsm();
        let mut pos = long_position();
        pos.record_state(FsmState::Exiting, 16);
        pos.exit_reason = Some(ExitReason::StopHit);

        let step = f.step(&pos, &inputs(99.0));
        assert_eq!(step.next, FsmState::Exiting);
        assert!(step
            .actions
            .iter()
            .any(|a| matches!(a, FsmAction::SubmitExit { .. })));

        pos.apply_exit_fill(1.0, 99.0);
        let step = f.step(&pos, &inputs(99.0));
        assert_eq!(step.next, FsmState::Closed);
        assert_eq!(step.reason, Some(ExitReason::StopHit));
        assert!((pos.realized_r + 1.0).abs() < 1e-9);
    }

    #[test]
    fn exhausted_exit_attempts_abandon_as_panic() {
        let f = fsm();
        let mut pos = long_position();
        pos.record_state(FsmState::Exiting, 16);
        pos.exit_attempts = 3;
        let step = f.step(&pos, &inputs(99.0));
        assert_eq!(step.next, FsmState::Closed);
        assert_eq!(step.reason, Some(ExitReason::Panic));
    }

    #[test]
    fn stale_data_freezes_price_transitions() {
        let f = fsm();
        let pos = long_position();
        let mut input = inputs(98.0); // would be a stop hit
        input.data_stale = true;
        let step = f.step(&pos, &input);
        assert_eq!(step.next, FsmState::Running);
        assert!(step.actions.is_empty());
    }

    #[test]
    fn smart_tp_stops_in_front_of_density() {
        let f = fsm();
        let densities = vec![Density {
            symbol: "BTCUSDT".to_string(),
            price_bucket: 101.55,
            side: BookSide::Ask,
            initial_size: 50.0,
            current_size: 50.0,
            first_seen_ms: 0,
            eaten_ratio: 0.0,
        }];
        let ctx = LadderContext {
            densities: &densities,
            levels: &[],
            round_steps: &[],
        };
        let ladder_cfg = vec![TpLevelConfig {
            reward_multiple: 1.5,
            size_pct: 1.0,
            placement_mode: PlacementMode::Smart,
        }];
        let rungs = f.build_ladder(&ladder_cfg, Side::Long, 100.0, 99.0, &ctx);
        // Target 101.5; the wall at 101.55 is within 10 bps, so the TP is
        // pulled just in front of it.
        assert!(rungs[0].price < 101.55);
        assert!(rungs[0].price > 101.5 - 0.2);
    }

    #[test]
    fn adaptive_tp_reanchors_while_trailing() {
        let f = fsm();
        let mut pos = long_position();
        pos.tp_ladder[1].placement_mode = PlacementMode::Adaptive;
        pos.record_state(FsmState::Trailing, 16);
        pos.stop_price = 101.0;

        let step = f.step(&pos, &inputs(102.5));
        let replaced = step.actions.iter().find_map(|a| match a {
            FsmAction::ReplaceTp { index, price } => Some((*index, *price)),
            _ => None,
        });
        let (idx, price) = replaced.expect("adaptive rung must re-anchor");
        assert_eq!(idx, 1);
        assert!(price > pos.tp_ladder[1].price);
    }

    #[test]
    fn open_risk_zero_after_breakeven() {
        let mut pos = long_position();
        assert!((pos.open_risk_usd() - 1.0).abs() < 1e-9);
        pos.try_move_stop(100.05).unwrap();
        assert_eq!(pos.open_risk_usd(), 0.0);
    }

    #[test]
    fn history_is_bounded() {
        let mut pos = long_position();
        for _ in 0..40 {
            pos.record_state(FsmState::Running, 16);
        }
        assert_eq!(pos.history.len(), 16);
    }

    #[test]
    fn position_serialisation_round_trips_exactly() {
        let mut pos = long_position();
        pos.record_state(FsmState::Breakeven, 16);
        pos.mfe = 1.2;
        pos.mae = -0.3;
        let json = serde_json::to_string(&pos).unwrap();
        let back: Position = serde_json::from_str(&json).unwrap();
        assert_eq!(pos, back);
    }
}
