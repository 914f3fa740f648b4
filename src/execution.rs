// =============================================================================
// Execution Manager — placement plans, fills and the position registry
// =============================================================================
//
// Owns every Position and every order record. A sized signal becomes an
// entry order plus a protective stop plus a reduce-only TP ladder, all
// tagged with the position id through deterministic client ids:
//
//   {pid}-entry    {pid}-stop-{n}    {pid}-tp{i}(-r{m})    {pid}-exit-{n}
//
// Deterministic ids double as the idempotency key: a reissue after a
// transport error cannot create a duplicate live order.
//
// Stop moves are place-new-then-cancel-old, so a failed replacement leaves
// the previous stop armed. A position is never live without a protective
// stop: if the stop cannot be placed at open, the freshly filled entry is
// immediately closed back out.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::GatewayError;
use crate::gateway::{
    with_retry, ExchangeGateway, OrderEvent, OrderKind, OrderRequest, OrderStatus,
};
use crate::position_fsm::{
    ExitReason, FsmAction, FsmInputs, FsmState, LadderContext, Position, PositionFsm,
};
use crate::preset::TpLevelConfig;
use crate::risk::SizedSignal;
use crate::signal_generator::EntryKind;
use crate::types::{floor_to_step, OrderSide, Side};

/// Closed positions kept for telemetry.
const CLOSED_HISTORY_CAP: usize = 200;

// ---------------------------------------------------------------------------
// Order records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderRole {
    Entry,
    Stop,
    TakeProfit(usize),
    Exit,
}

#[derive(Debug, Clone)]
pub struct OrderRecord {
    pub client_id: String,
    pub position_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub qty: f64,
    pub status: OrderStatus,
    pub filled_qty: f64,
    pub avg_fill: f64,
    pub fees: f64,
    pub role: OrderRole,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct ExecutionManager {
    gateway: Arc<dyn ExchangeGateway>,
    fsm: PositionFsm,
    positions: HashMap<String, Position>,
    closed: Vec<Position>,
    orders: HashMap<String, OrderRecord>,
    /// TP fill seen since the position's last FSM step.
    tp_fill_flags: HashMap<String, bool>,
    /// Per-position counters for replace client ids.
    stop_seq: HashMap<String, u32>,
    exit_seq: HashMap<String, u32>,
    tp_replace_seq: HashMap<String, u32>,
}

impl ExecutionManager {
    pub fn new(gateway: Arc<dyn ExchangeGateway>, fsm: PositionFsm) -> Self {
        Self {
            gateway,
            fsm,
            positions: HashMap::new(),
            closed: Vec::new(),
            orders: HashMap::new(),
            tp_fill_flags: HashMap::new(),
            stop_seq: HashMap::new(),
            exit_seq: HashMap::new(),
            tp_replace_seq: HashMap::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn open_positions(&self) -> Vec<&Position> {
        let mut positions: Vec<&Position> = self.positions.values().collect();
        positions.sort_by(|a, b| a.id.cmp(&b.id));
        positions
    }

    pub fn position(&self, id: &str) -> Option<&Position> {
        self.positions.get(id)
    }

    pub fn closed_positions(&self) -> &[Position] {
        &self.closed
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.len()
    }

    /// (symbol, side) pairs that already carry exposure. A position exists
    /// from the moment its entry order is placed, so resting entries are
    /// covered too.
    pub fn exposure(&self) -> HashSet<(String, Side)> {
        self.positions
            .values()
            .map(|p| (p.symbol.clone(), p.side))
            .collect()
    }

    // -------------------------------------------------------------------------
    // Placement
    // -------------------------------------------------------------------------

    /// Turn a sized signal into a live placement plan. Returns the new
    /// position id.
    pub async fn place(
        &mut self,
        sized: &SizedSignal,
        ladder_cfg: &[TpLevelConfig],
        ladder_ctx: &LadderContext<'_>,
        step_size: f64,
        now_ms: i64,
    ) -> Result<String, GatewayError> {
        let signal = &sized.signal;
        let position_id = Uuid::new_v4().to_string();
        let entry_side = match signal.side {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        };
        let exit_side = match signal.side {
            Side::Long => OrderSide::Sell,
            Side::Short => OrderSide::Buy,
        };

        // 1. Entry.
        let entry_kind = match signal.entry {
            EntryKind::Market => OrderKind::Market,
            EntryKind::Limit { price } => OrderKind::Limit { price },
        };
        let entry_req = OrderRequest {
            client_id: format!("{position_id}-entry"),
            symbol: signal.symbol.clone(),
            side: entry_side,
            kind: entry_kind,
            qty: sized.qty,
            reduce_only: false,
        };
        let gateway = self.gateway.clone();
        with_retry("place_entry", || gateway.place_order(entry_req.clone())).await?;
        self.record_order(&position_id, &entry_req, OrderRole::Entry);

        // 2. Protective stop. A position must never exist unprotected: if
        // the stop cannot be placed, unwind the entry immediately.
        let stop_req = OrderRequest {
            client_id: format!("{position_id}-stop-0"),
            symbol: signal.symbol.clone(),
            side: exit_side,
            kind: OrderKind::StopMarket {
                trigger: signal.stop_price,
            },
            qty: sized.qty,
            reduce_only: true,
        };
        let gateway = self.gateway.clone();
        if let Err(e) = with_retry("place_stop", || gateway.place_order(stop_req.clone())).await {
            error!(
                position_id = %position_id,
                symbol = %signal.symbol,
                error = %e,
                "stop placement failed — unwinding entry"
            );
            let _ = self
                .gateway
                .cancel_order(&signal.symbol, &entry_req.client_id)
                .await;
            let unwind = OrderRequest {
                client_id: format!("{position_id}-exit-0"),
                symbol: signal.symbol.clone(),
                side: exit_side,
                kind: OrderKind::Market,
                qty: sized.qty,
                reduce_only: true,
            };
            let _ = self.gateway.place_order(unwind).await;
            return Err(e);
        }
        self.record_order(&position_id, &stop_req, OrderRole::Stop);
        self.stop_seq.insert(position_id.clone(), 0);

        // 3. TP ladder, reduce-only limits.
        let ladder = self.fsm.build_ladder(
            ladder_cfg,
            signal.side,
            signal.entry_price,
            signal.stop_price,
            ladder_ctx,
        );
        for (i, rung) in ladder.iter().enumerate() {
            let tp_qty = floor_to_step(sized.qty * rung.size_pct, step_size);
            if tp_qty <= 0.0 {
                debug!(position_id = %position_id, rung = i, "tp rung below step — skipped");
                continue;
            }
            let tp_req = OrderRequest {
                client_id: format!("{position_id}-tp{i}"),
                symbol: signal.symbol.clone(),
                side: exit_side,
                kind: OrderKind::Limit { price: rung.price },
                qty: tp_qty,
                reduce_only: true,
            };
            let gateway = self.gateway.clone();
            match with_retry("place_tp", || gateway.place_order(tp_req.clone())).await {
                Ok(_) => self.record_order(&position_id, &tp_req, OrderRole::TakeProfit(i)),
                Err(e) => {
                    // The stop still protects the position; the rung just
                    // has no resting order.
                    warn!(position_id = %position_id, rung = i, error = %e, "tp placement failed");
                }
            }
        }

        let position = Position {
            id: position_id.clone(),
            symbol: signal.symbol.clone(),
            side: signal.side,
            entry_price: signal.entry_price,
            qty_open: 0.0,
            qty_initial: sized.qty,
            stop_price: signal.stop_price,
            initial_stop: signal.stop_price,
            tp_ladder: ladder,
            level_price: signal.level.price,
            opened_ms: now_ms,
            bars_since_entry: 0,
            realized_r: 0.0,
            realized_pnl: 0.0,
            mfe: 0.0,
            mae: 0.0,
            state: FsmState::Entry,
            history: std::collections::VecDeque::from([FsmState::Entry]),
            exit_attempts: 0,
            exit_reason: None,
            closed_ms: None,
        };
        info!(
            position_id = %position_id,
            symbol = %signal.symbol,
            side = %signal.side,
            qty = sized.qty,
            entry = signal.entry_price,
            stop = signal.stop_price,
            rungs = position.tp_ladder.len(),
            "placement plan live"
        );
        self.positions.insert(position_id.clone(), position);
        Ok(position_id)
    }

    fn record_order(&mut self, position_id: &str, req: &OrderRequest, role: OrderRole) {
        self.orders.insert(
            req.client_id.clone(),
            OrderRecord {
                client_id: req.client_id.clone(),
                position_id: position_id.to_string(),
                symbol: req.symbol.clone(),
                side: req.side,
                kind: req.kind,
                qty: req.qty,
                status: OrderStatus::Open,
                filled_qty: 0.0,
                avg_fill: 0.0,
                fees: 0.0,
                role,
            },
        );
    }

    // -------------------------------------------------------------------------
    // Order events
    // -------------------------------------------------------------------------

    /// Drain gateway events and apply them to orders and positions.
    pub async fn handle_events(&mut self) -> Result<(), GatewayError> {
        let events = self.gateway.poll_events().await?;
        for event in events {
            self.apply_event(&event);
        }
        Ok(())
    }

    fn apply_event(&mut self, event: &OrderEvent) {
        let Some(record) = self.orders.get_mut(&event.client_id) else {
            debug!(client_id = %event.client_id, "event for unknown order ignored");
            return;
        };

        if event.fill_qty > 0.0 {
            let prev = record.filled_qty;
            record.filled_qty += event.fill_qty;
            record.avg_fill = if record.filled_qty > 0.0 {
                (record.avg_fill * prev + event.fill_price * event.fill_qty) / record.filled_qty
            } else {
                event.fill_price
            };
            record.fees += event.fee;
        }
        record.status = event.status;

        let position_id = record.position_id.clone();
        let role = record.role;
        let Some(pos) = self.positions.get_mut(&position_id) else {
            return;
        };

        match role {
            OrderRole::Entry if event.fill_qty > 0.0 => {
                let prev_qty = pos.qty_open;
                let new_qty = prev_qty + event.fill_qty;
                pos.entry_price = (pos.entry_price * prev_qty
                    + event.fill_price * event.fill_qty)
                    / new_qty;
                pos.qty_open = new_qty.min(pos.qty_initial);
                debug!(
                    position_id = %position_id,
                    filled = pos.qty_open,
                    of = pos.qty_initial,
                    "entry fill applied"
                );
            }
            OrderRole::Stop if event.fill_qty > 0.0 => {
                pos.apply_exit_fill(event.fill_qty, event.fill_price);
                if pos.exit_reason.is_none() {
                    pos.exit_reason = Some(if pos.state == FsmState::Trailing {
                        ExitReason::TrailingStop
                    } else {
                        ExitReason::StopHit
                    });
                }
                if pos.state.is_running_family() {
                    pos.record_state(FsmState::Exiting, self.fsm.config().fsm_config.history_cap);
                }
                info!(
                    position_id = %position_id,
                    fill_price = event.fill_price,
                    qty_open = pos.qty_open,
                    "protective stop filled"
                );
            }
            OrderRole::TakeProfit(index) if event.fill_qty > 0.0 => {
                pos.apply_exit_fill(event.fill_qty, event.fill_price);
                if let Some(rung) = pos.tp_ladder.get_mut(index) {
                    if event.status == OrderStatus::Filled {
                        rung.filled = true;
                    }
                }
                self.tp_fill_flags.insert(position_id.clone(), true);
                info!(
                    position_id = %position_id,
                    rung = index,
                    fill_price = event.fill_price,
                    qty_open = pos.qty_open,
                    "take profit filled"
                );
            }
            OrderRole::Exit if event.fill_qty > 0.0 => {
                pos.apply_exit_fill(event.fill_qty, event.fill_price);
                debug!(
                    position_id = %position_id,
                    qty_open = pos.qty_open,
                    "exit fill applied"
                );
            }
            _ => {}
        }
    }

    // -------------------------------------------------------------------------
    // FSM stepping
    // -------------------------------------------------------------------------

    /// Step every open position once, in id order, applying the resulting
    /// actions. Returns positions that reached CLOSED this step.
    pub async fn step_positions<F>(&mut self, build_inputs: F) -> Vec<Position>
    where
        F: Fn(&Position) -> FsmInputs,
    {
        let ids: Vec<String> = {
            let mut ids: Vec<String> = self.positions.keys().cloned().collect();
            ids.sort();
            ids
        };

        let mut closed_now = Vec::new();
        for id in ids {
            let Some(pos) = self.positions.get(&id) else {
                continue;
            };
            let mut inputs = build_inputs(pos);
            inputs.tp_fill_since_last_step = self.tp_fill_flags.remove(&id).unwrap_or(false);

            // Excursion + bar bookkeeping before stepping.
            if let Some(pos) = self.positions.get_mut(&id) {
                if !inputs.data_stale && inputs.price > 0.0 {
                    pos.update_excursions(inputs.price);
                }
                if inputs.bar_closed {
                    pos.bars_since_entry = pos.bars_since_entry.saturating_add(1);
                }
            }

            let Some(pos_snapshot) = self.positions.get(&id).cloned() else {
                continue;
            };
            let step = self.fsm.step(&pos_snapshot, &inputs);

            for action in &step.actions {
                self.apply_action(&id, action).await;
            }

            let history_cap = self.fsm.config().fsm_config.history_cap;
            if let Some(pos) = self.positions.get_mut(&id) {
                if let Some(reason) = step.reason {
                    pos.exit_reason = Some(reason);
                }
                if step.next != pos.state {
                    info!(
                        position_id = %id,
                        from = %pos.state,
                        to = %step.next,
                        reason = ?step.reason,
                        "fsm transition"
                    );
                    pos.record_state(step.next, history_cap);
                }
                if pos.state == FsmState::Closed {
                    pos.closed_ms = Some(inputs.now_ms);
                }
            }

            if self
                .positions
                .get(&id)
                .map_or(false, |p| p.state == FsmState::Closed)
            {
                self.cancel_position_orders(&id, true).await;
                if let Some(pos) = self.positions.remove(&id) {
                    info!(
                        position_id = %id,
                        reason = ?pos.exit_reason,
                        realized_r = pos.realized_r,
                        realized_pnl = pos.realized_pnl,
                        "position closed"
                    );
                    self.closed.push(pos.clone());
                    while self.closed.len() > CLOSED_HISTORY_CAP {
                        self.closed.remove(0);
                    }
                    closed_now.push(pos);
                }
            }
        }
        closed_now
    }

    async fn apply_action(&mut self, position_id: &str, action: &FsmAction) {
        match action {
            FsmAction::MoveStop { to } => self.move_stop(position_id, *to).await,
            FsmAction::ReplaceTp { index, price } => {
                self.replace_tp(position_id, *index, *price).await
            }
            FsmAction::CancelEntry => {
                let client_id = format!("{position_id}-entry");
                if let Some(pos) = self.positions.get(position_id) {
                    let symbol = pos.symbol.clone();
                    if let Err(e) = self.gateway.cancel_order(&symbol, &client_id).await {
                        warn!(position_id, error = %e, "entry cancel failed");
                    }
                }
                if let Some(record) = self.orders.get_mut(&client_id) {
                    record.status = OrderStatus::Cancelled;
                }
                // Partial fill at timeout: the fill becomes the position.
                if let Some(pos) = self.positions.get_mut(position_id) {
                    if pos.qty_open > 0.0 && pos.qty_open < pos.qty_initial {
                        info!(
                            position_id,
                            qty = pos.qty_open,
                            was = pos.qty_initial,
                            "entry partially filled at timeout — shrinking position"
                        );
                        pos.qty_initial = pos.qty_open;
                    }
                }
            }
            FsmAction::SubmitExit { qty } => self.submit_exit(position_id, *qty).await,
            FsmAction::CancelOpenOrders => {
                self.cancel_position_orders(position_id, false).await;
            }
        }
    }

    /// Place-new-then-cancel-old stop replacement. If the new stop cannot
    /// be placed the old one stays armed.
    async fn move_stop(&mut self, position_id: &str, to: f64) {
        let Some(pos) = self.positions.get(position_id) else {
            return;
        };
        let symbol = pos.symbol.clone();
        let exit_side = match pos.side {
            Side::Long => OrderSide::Sell,
            Side::Short => OrderSide::Buy,
        };
        let qty = pos.qty_open.max(pos.qty_initial);
        let seq = self.stop_seq.entry(position_id.to_string()).or_insert(0);
        let old_seq = *seq;
        let new_seq = old_seq + 1;

        let req = OrderRequest {
            client_id: format!("{position_id}-stop-{new_seq}"),
            symbol: symbol.clone(),
            side: exit_side,
            kind: OrderKind::StopMarket { trigger: to },
            qty,
            reduce_only: true,
        };
        let gateway = self.gateway.clone();
        match with_retry("replace_stop", || gateway.place_order(req.clone())).await {
            Ok(_) => {
                self.record_order(position_id, &req, OrderRole::Stop);
                self.stop_seq.insert(position_id.to_string(), new_seq);
                let old_id = format!("{position_id}-stop-{old_seq}");
                if let Err(e) = self.gateway.cancel_order(&symbol, &old_id).await {
                    warn!(position_id, error = %e, "old stop cancel failed (reduce-only, harmless)");
                }
                if let Some(record) = self.orders.get_mut(&old_id) {
                    record.status = OrderStatus::Cancelled;
                }
                if let Some(pos) = self.positions.get_mut(position_id) {
                    match pos.try_move_stop(to) {
                        Ok(_) => {}
                        Err(violation) => error!(position_id, %violation, "rejected stop move"),
                    }
                }
            }
            Err(e) => {
                // The previous stop remains armed; the position is still
                // protected.
                warn!(position_id, error = %e, "stop replacement failed — keeping old stop");
            }
        }
    }

    async fn replace_tp(&mut self, position_id: &str, index: usize, price: f64) {
        let Some(pos) = self.positions.get(position_id) else {
            return;
        };
        let symbol = pos.symbol.clone();
        let exit_side = match pos.side {
            Side::Long => OrderSide::Sell,
            Side::Short => OrderSide::Buy,
        };
        let Some(rung) = pos.tp_ladder.get(index) else {
            return;
        };
        if rung.filled {
            return;
        }
        let qty = {
            let old_id = format!("{position_id}-tp{index}");
            self.orders.get(&old_id).map(|r| r.qty)
        };
        let Some(qty) = qty else {
            return;
        };

        let n = self
            .tp_replace_seq
            .entry(format!("{position_id}-tp{index}"))
            .or_insert(0);
        *n += 1;
        let new_id = format!("{position_id}-tp{index}-r{n}");

        let req = OrderRequest {
            client_id: new_id,
            symbol: symbol.clone(),
            side: exit_side,
            kind: OrderKind::Limit { price },
            qty,
            reduce_only: true,
        };
        let gateway = self.gateway.clone();
        match with_retry("replace_tp", || gateway.place_order(req.clone())).await {
            Ok(_) => {
                let old_id = format!("{position_id}-tp{index}");
                let _ = self.gateway.cancel_order(&symbol, &old_id).await;
                self.orders.remove(&old_id);
                self.record_order(position_id, &req, OrderRole::TakeProfit(index));
                if let Some(pos) = self.positions.get_mut(position_id) {
                    if let Some(rung) = pos.tp_ladder.get_mut(index) {
                        rung.price = price;
                    }
                }
            }
            Err(e) => warn!(position_id, index, error = %e, "tp replacement failed"),
        }
    }

    /// Submit a reduce-only market exit unless one is already resting.
    async fn submit_exit(&mut self, position_id: &str, qty: f64) {
        let exit_live = self.orders.values().any(|r| {
            r.position_id == position_id
                && r.role == OrderRole::Exit
                && !r.status.is_terminal()
        });
        if exit_live {
            return;
        }
        let Some(pos) = self.positions.get(position_id) else {
            return;
        };
        let symbol = pos.symbol.clone();
        let exit_side = match pos.side {
            Side::Long => OrderSide::Sell,
            Side::Short => OrderSide::Buy,
        };
        let seq = self.exit_seq.entry(position_id.to_string()).or_insert(0);
        *seq += 1;
        let req = OrderRequest {
            client_id: format!("{position_id}-exit-{seq}"),
            symbol,
            side: exit_side,
            kind: OrderKind::Market,
            qty,
            reduce_only: true,
        };
        let gateway = self.gateway.clone();
        match with_retry("submit_exit", || gateway.place_order(req.clone())).await {
            Ok(_) => {
                self.record_order(position_id, &req, OrderRole::Exit);
            }
            Err(e) => {
                if let Some(pos) = self.positions.get_mut(position_id) {
                    pos.exit_attempts += 1;
                    warn!(
                        position_id,
                        attempts = pos.exit_attempts,
                        error = %e,
                        "exit submission failed"
                    );
                }
            }
        }
    }

    /// Cancel resting orders for a position. `include_exit` also cancels
    /// reduce-only exits (registry teardown after CLOSED).
    async fn cancel_position_orders(&mut self, position_id: &str, include_exit: bool) {
        let to_cancel: Vec<(String, String)> = self
            .orders
            .values()
            .filter(|r| r.position_id == position_id && !r.status.is_terminal())
            .filter(|r| include_exit || r.role != OrderRole::Exit)
            .map(|r| (r.symbol.clone(), r.client_id.clone()))
            .collect();
        for (symbol, client_id) in to_cancel {
            if let Err(e) = self.gateway.cancel_order(&symbol, &client_id).await {
                debug!(position_id, client_id = %client_id, error = %e, "cancel failed");
            }
            if let Some(record) = self.orders.get_mut(&client_id) {
                record.status = OrderStatus::Cancelled;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Panic exit
    // -------------------------------------------------------------------------

    /// Reduce-only market out of every open position and advance each FSM
    /// to EXITING. Does not wait for fills; failures surface in the log and
    /// in `exit_attempts`.
    pub async fn panic_exit_all(&mut self) {
        self.flatten_all(ExitReason::PanicExit).await;
    }

    /// Flatten every open position with the given reason.
    pub async fn flatten_all(&mut self, reason: ExitReason) {
        let ids: Vec<String> = {
            let mut ids: Vec<String> = self.positions.keys().cloned().collect();
            ids.sort();
            ids
        };
        warn!(count = ids.len(), %reason, "flattening all positions");
        let history_cap = self.fsm.config().fsm_config.history_cap;
        for id in ids {
            self.cancel_position_orders(&id, false).await;
            let qty = match self.positions.get_mut(&id) {
                Some(pos) => {
                    pos.exit_reason = Some(reason);
                    if pos.state != FsmState::Exiting && pos.state != FsmState::Closed {
                        pos.record_state(FsmState::Exiting, history_cap);
                    }
                    pos.qty_open
                }
                None => continue,
            };
            if qty > 0.0 {
                self.submit_exit(&id, qty).await;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    pub fn snapshot_positions(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.id.cmp(&b.id));
        positions
    }

    /// Restore open positions from a checkpoint (fresh process start).
    pub fn restore_positions(&mut self, positions: Vec<Position>) {
        for pos in positions {
            if pos.state != FsmState::Closed {
                self.stop_seq.entry(pos.id.clone()).or_insert(0);
                self.positions.insert(pos.id.clone(), pos);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::paper::PaperGateway;
    use crate::gateway::SymbolMeta;
    use crate::level_detector::{Level, LevelSide};
    use crate::preset::PositionConfig;
    use crate::signal_generator::{Signal, SignalKind};

    const NOW: i64 = 1_700_000_000_000;

    fn paper() -> Arc<PaperGateway> {
        let gw = Arc::new(PaperGateway::new(10_000.0));
        gw.set_symbol_meta(
            "BTCUSDT",
            SymbolMeta {
                tick_size: 0.1,
                step_size: 0.001,
                min_qty: 0.001,
            },
        );
        gw
    }

    fn manager(gw: Arc<PaperGateway>) -> ExecutionManager {
        ExecutionManager::new(gw, PositionFsm::new(PositionConfig::default()))
    }

    fn sized_long() -> SizedSignal {
        SizedSignal {
            signal: Signal {
                id: "sig".to_string(),
                symbol: "BTCUSDT".to_string(),
                side: Side::Long,
                kind: SignalKind::Momentum {
                    break_bps: 5.0,
                    density_eaten: Some(0.8),
                    volume_ratio: 2.0,
                },
                level: Level {
                    symbol: "BTCUSDT".to_string(),
                    price: 100.0,
                    side: LevelSide::Resistance,
                    strength: 0.7,
                    age_bars: 10,
                    touch_count: 2,
                    is_round_number: false,
                    in_cascade: false,
                    vertical_approach: false,
                },
                entry: EntryKind::Market,
                entry_price: 100.0,
                stop_price: 99.0,
                confidence: 0.8,
                created_ms: NOW,
            },
            qty: 1.0,
            risk_amount: 100.0,
        }
    }

    fn inputs_at(price: f64) -> impl Fn(&Position) -> FsmInputs {
        move |_pos| FsmInputs {
            price,
            now_ms: NOW + 60_000,
            bar_closed: false,
            closed_back_inside_level: false,
            activity_dropping: false,
            tp_fill_since_last_step: false,
            data_stale: false,
        }
    }

    #[tokio::test]
    async fn placement_plan_creates_entry_stop_and_ladder() {
        let gw = paper();
        let mut exec = manager(gw.clone());
        let pid = exec
            .place(
                &sized_long(),
                &PositionConfig::default().tp_levels,
                &LadderContext::default(),
                0.001,
                NOW,
            )
            .await
            .unwrap();

        let open = gw.open_orders("BTCUSDT");
        // entry + stop + 3 default rungs
        assert_eq!(open.len(), 5);
        assert!(open.iter().any(|o| o.client_id == format!("{pid}-entry")));
        assert!(open.iter().any(|o| o.client_id == format!("{pid}-stop-0")));
        assert!(open
            .iter()
            .filter(|o| o.client_id.contains("-tp"))
            .all(|o| o.reduce_only));

        let pos = exec.position(&pid).unwrap();
        assert_eq!(pos.state, FsmState::Entry);
        assert_eq!(pos.qty_open, 0.0);
    }

    #[tokio::test]
    async fn entry_fill_then_running() {
        let gw = paper();
        let mut exec = manager(gw.clone());
        let pid = exec
            .place(
                &sized_long(),
                &PositionConfig::default().tp_levels,
                &LadderContext::default(),
                0.001,
                NOW,
            )
            .await
            .unwrap();

        // Next trade fills the market entry (and nothing else at 100.0).
        gw.on_trade("BTCUSDT", 100.0, NOW + 1_000);
        exec.handle_events().await.unwrap();

        let closed = exec.step_positions(inputs_at(100.0)).await;
        assert!(closed.is_empty());
        let pos = exec.position(&pid).unwrap();
        assert_eq!(pos.state, FsmState::Running);
        assert!((pos.qty_open - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn stop_fill_closes_position_and_reports_r() {
        let gw = paper();
        let mut exec = manager(gw.clone());
        let pid = exec
            .place(
                &sized_long(),
                &PositionConfig::default().tp_levels,
                &LadderContext::default(),
                0.001,
                NOW,
            )
            .await
            .unwrap();

        gw.on_trade("BTCUSDT", 100.0, NOW + 1_000);
        exec.handle_events().await.unwrap();
        exec.step_positions(inputs_at(100.0)).await;

        // Price collapses through the stop; the resting stop fills.
        gw.on_trade("BTCUSDT", 98.9, NOW + 2_000);
        exec.handle_events().await.unwrap();

        let closed = exec.step_positions(inputs_at(98.9)).await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].id, pid);
        assert_eq!(closed[0].exit_reason, Some(ExitReason::StopHit));
        assert!(closed[0].realized_r < -1.0); // gapped through the stop
        assert_eq!(exec.open_position_count(), 0);
    }

    #[tokio::test]
    async fn tp_fill_partial_closes() {
        let gw = paper();
        let mut exec = manager(gw.clone());
        let pid = exec
            .place(
                &sized_long(),
                &PositionConfig::default().tp_levels,
                &LadderContext::default(),
                0.001,
                NOW,
            )
            .await
            .unwrap();

        gw.on_trade("BTCUSDT", 100.0, NOW + 1_000);
        exec.handle_events().await.unwrap();
        exec.step_positions(inputs_at(100.0)).await;

        // Ride up through breakeven to the first rung (1.5 R = 101.5).
        exec.step_positions(inputs_at(101.0)).await;
        gw.on_trade("BTCUSDT", 101.5, NOW + 3_000);
        exec.handle_events().await.unwrap();
        let closed = exec.step_positions(inputs_at(101.5)).await;
        assert!(closed.is_empty());

        let pos = exec.position(&pid).unwrap();
        assert_eq!(pos.state, FsmState::PartialClosed);
        assert!(pos.qty_open < 1.0);
        assert!(pos.realized_r > 0.0);
        assert!(pos.tp_ladder[0].filled);
    }

    #[tokio::test]
    async fn breakeven_move_replaces_stop_order() {
        let gw = paper();
        let mut exec = manager(gw.clone());
        let pid = exec
            .place(
                &sized_long(),
                &PositionConfig::default().tp_levels,
                &LadderContext::default(),
                0.001,
                NOW,
            )
            .await
            .unwrap();
        gw.on_trade("BTCUSDT", 100.0, NOW + 1_000);
        exec.handle_events().await.unwrap();
        exec.step_positions(inputs_at(100.0)).await;

        // Breakeven trigger moves the stop; a new stop id appears and the
        // old one is cancelled.
        exec.step_positions(inputs_at(101.0)).await;
        let pos = exec.position(&pid).unwrap();
        assert!(pos.stop_price > 99.9);
        let open = gw.open_orders("BTCUSDT");
        assert!(open.iter().any(|o| o.client_id == format!("{pid}-stop-1")));
        assert!(!open.iter().any(|o| o.client_id == format!("{pid}-stop-0")));
    }

    #[tokio::test]
    async fn panic_exit_flattens_everything() {
        let gw = paper();
        let mut exec = manager(gw.clone());
        let pid = exec
            .place(
                &sized_long(),
                &PositionConfig::default().tp_levels,
                &LadderContext::default(),
                0.001,
                NOW,
            )
            .await
            .unwrap();
        gw.on_trade("BTCUSDT", 100.0, NOW + 1_000);
        exec.handle_events().await.unwrap();
        exec.step_positions(inputs_at(100.0)).await;

        exec.panic_exit_all().await;
        let pos = exec.position(&pid).unwrap();
        assert_eq!(pos.state, FsmState::Exiting);
        assert_eq!(pos.exit_reason, Some(ExitReason::PanicExit));

        // The reduce-only market exit fills on the next print.
        gw.on_trade("BTCUSDT", 100.2, NOW + 2_000);
        exec.handle_events().await.unwrap();
        let closed = exec.step_positions(inputs_at(100.2)).await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].exit_reason, Some(ExitReason::PanicExit));
    }

    #[tokio::test]
    async fn snapshot_restore_round_trips() {
        let gw = paper();
        let mut exec = manager(gw.clone());
        exec.place(
            &sized_long(),
            &PositionConfig::default().tp_levels,
            &LadderContext::default(),
            0.001,
            NOW,
        )
        .await
        .unwrap();
        gw.on_trade("BTCUSDT", 100.0, NOW + 1_000);
        exec.handle_events().await.unwrap();
        exec.step_positions(inputs_at(100.0)).await;

        let snapshot = exec.snapshot_positions();
        assert_eq!(snapshot.len(), 1);

        let mut fresh = manager(paper());
        fresh.restore_positions(snapshot.clone());
        assert_eq!(fresh.snapshot_positions(), snapshot);
    }
}
