// =============================================================================
// Engine — the single-writer control loop
// =============================================================================
//
// Top-level state machine:
//
//   IDLE -> INITIALIZING -> SCANNING -> LEVEL_BUILDING -> SIGNAL_WAIT
//        -> SIZING -> EXECUTION -> MANAGING -> (SCANNING | EMERGENCY | STOPPED)
//
// One task owns every state transition, the position registry and the
// preset handle. Market-data tasks only push into the bounded event
// channel; commands arrive on their own channel and are processed at cycle
// boundaries — except kill_switch and panic_exit, which set an urgent flag
// the loop also checks mid-cycle.
//
// Within a cycle the order is fixed: drain market events, refresh
// density/activity, scan (when scheduled), generate signals, size and
// route, step every position FSM, emit telemetry. No event is observed
// twice.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::activity_tracker::ActivityTracker;
use crate::app_state::AppState;
use crate::density_detector::DensityDetector;
use crate::execution::ExecutionManager;
use crate::gateway::{with_retry, ExchangeGateway, SymbolMeta};
use crate::level_detector::LevelDetector;
use crate::market_data::{atr, returns_correlation, CandleKey, MarketEvent};
use crate::market_filter::{MarketFilter, SymbolSnapshot};
use crate::persistence::{Checkpoint, CooldownEntry};
use crate::position_fsm::{ExitReason, FsmInputs, LadderContext, Position, PositionFsm};
use crate::preset::Preset;
use crate::risk::{OpenPositionRisk, RiskManager};
use crate::scanner::{ScanCandidate, Scanner, ScannerInput};
use crate::signal_generator::{SignalContext, SignalGenerator};
use crate::telemetry::{
    CycleTick, DensitySummary, PositionSummary, SymbolTelemetry, TelemetrySnapshot,
};
use crate::types::{bps_to_frac, EngineMode};

/// Working timeframe for levels, signals and position management.
const WORK_INTERVAL: &str = "5m";
/// Timeframe for the scanner's ATR feature.
const ATR_INTERVAL: &str = "15m";

/// Control-loop cadence.
const CYCLE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);
/// Budget for draining the market-data channel per cycle.
const DRAIN_WAIT: std::time::Duration = std::time::Duration::from_millis(250);
/// |correlation| above which a symbol counts as BTC-correlated for the
/// risk manager's exposure cap.
const BTC_CORRELATED_THRESHOLD: f64 = 0.7;
/// Cycles between checkpoint saves and equity refreshes.
const CHECKPOINT_EVERY: u64 = 30;
/// Graceful shutdown budget for in-flight gateway work.
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(10);
/// Consecutive fill-poll failures before the engine halts (global fault).
const GATEWAY_FAULT_LIMIT: u32 = 10;

// ---------------------------------------------------------------------------
// States, commands, handle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Initializing,
    Scanning,
    LevelBuilding,
    SignalWait,
    Sizing,
    Execution,
    Managing,
    Emergency,
    Halted,
    Stopped,
}

impl EngineState {
    fn is_trading(self) -> bool {
        matches!(
            self,
            Self::Scanning
                | Self::LevelBuilding
                | Self::SignalWait
                | Self::Sizing
                | Self::Execution
                | Self::Managing
        )
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Initializing => "INITIALIZING",
            Self::Scanning => "SCANNING",
            Self::LevelBuilding => "LEVEL_BUILDING",
            Self::SignalWait => "SIGNAL_WAIT",
            Self::Sizing => "SIZING",
            Self::Execution => "EXECUTION",
            Self::Managing => "MANAGING",
            Self::Emergency => "EMERGENCY",
            Self::Halted => "HALTED",
            Self::Stopped => "STOPPED",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCommand {
    Start { mode: EngineMode },
    Stop,
    Pause,
    Resume,
    TimeStop,
    PanicExit,
    KillSwitch,
    Retry,
}

/// Accepted/rejected verdict for a command.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub accepted: bool,
    pub reason: Option<String>,
}

impl CommandOutcome {
    fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

struct CommandEnvelope {
    cmd: EngineCommand,
    reply: oneshot::Sender<CommandOutcome>,
}

/// Cheap clonable handle for the control plane.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<CommandEnvelope>,
    urgent: Arc<AtomicBool>,
}

impl EngineHandle {
    pub async fn send(&self, cmd: EngineCommand) -> CommandOutcome {
        if matches!(cmd, EngineCommand::KillSwitch | EngineCommand::PanicExit) {
            self.urgent.store(true, Ordering::SeqCst);
        }
        let (reply, rx) = oneshot::channel();
        if self.tx.send(CommandEnvelope { cmd, reply }).await.is_err() {
            return CommandOutcome::rejected("engine is gone");
        }
        rx.await
            .unwrap_or_else(|_| CommandOutcome::rejected("engine dropped the command"))
    }
}

// ---------------------------------------------------------------------------
// Per-cycle symbol digest (feeds the FSM input closure)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct SymbolCycle {
    last_price: f64,
    last_close: Option<f64>,
    bar_closed: bool,
    data_stale: bool,
    activity_dropping: bool,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    preset: Arc<Preset>,
    app: Arc<AppState>,
    gateway: Arc<dyn ExchangeGateway>,
    market_rx: mpsc::Receiver<MarketEvent>,
    cmd_rx: mpsc::Receiver<CommandEnvelope>,
    urgent: Arc<AtomicBool>,
    tick_tx: mpsc::UnboundedSender<CycleTick>,

    density: DensityDetector,
    activity: ActivityTracker,
    levels: LevelDetector,
    filter: MarketFilter,
    scanner: Scanner,
    signals: SignalGenerator,
    risk: RiskManager,
    exec: ExecutionManager,

    mode: EngineMode,
    state: EngineState,
    paused: bool,
    cycle: u64,
    equity: f64,
    last_scan_ms: i64,
    last_signal_ms: Option<i64>,
    candidates: Vec<ScanCandidate>,
    symbol_meta: HashMap<String, SymbolMeta>,
    /// open_time of the last seen closed working-interval bar per symbol.
    last_bar_seen: HashMap<String, i64>,
    /// Consecutive fill-poll failures; a long streak is a global fault.
    gateway_fault_streak: u32,
    checkpoint_path: Option<PathBuf>,
}

impl Engine {
    pub fn new(
        preset: Arc<Preset>,
        app: Arc<AppState>,
        gateway: Arc<dyn ExchangeGateway>,
        market_rx: mpsc::Receiver<MarketEvent>,
        tick_tx: mpsc::UnboundedSender<CycleTick>,
        checkpoint_path: Option<PathBuf>,
    ) -> (Self, EngineHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let urgent = Arc::new(AtomicBool::new(false));
        let handle = EngineHandle {
            tx: cmd_tx,
            urgent: urgent.clone(),
        };

        let engine = Self {
            density: DensityDetector::new(
                preset.density_config.clone(),
                preset.signal_config.enter_on_density_eat_ratio,
            ),
            activity: ActivityTracker::new(preset.signal_config.activity.clone()),
            levels: LevelDetector::new(preset.levels_rules.clone()),
            filter: MarketFilter::new(
                preset.liquidity_filters.clone(),
                preset.risk.btc_correlation_cap,
            ),
            scanner: Scanner::new(preset.scanner.clone()),
            signals: SignalGenerator::new(preset.signal_config.clone()),
            risk: RiskManager::new(preset.risk.clone()),
            exec: ExecutionManager::new(
                gateway.clone(),
                PositionFsm::new(preset.position_config.clone()),
            ),
            preset,
            app,
            gateway,
            market_rx,
            cmd_rx,
            urgent,
            tick_tx,
            mode: EngineMode::Paper,
            state: EngineState::Idle,
            paused: false,
            cycle: 0,
            equity: 0.0,
            last_scan_ms: 0,
            last_signal_ms: None,
            candidates: Vec::new(),
            symbol_meta: HashMap::new(),
            last_bar_seen: HashMap::new(),
            gateway_fault_streak: 0,
            checkpoint_path,
        };
        (engine, handle)
    }

    // -------------------------------------------------------------------------
    // Main loop
    // -------------------------------------------------------------------------

    pub async fn run(mut self) {
        info!(preset = %self.preset.name, "engine task started");
        loop {
            match self.state {
                EngineState::Idle | EngineState::Stopped => {
                    // Nothing to do until a command arrives.
                    match self.cmd_rx.recv().await {
                        Some(envelope) => self.handle_command(envelope).await,
                        None => break,
                    }
                }
                EngineState::Halted | EngineState::Emergency => {
                    self.drain_commands().await;
                    if matches!(self.state, EngineState::Idle | EngineState::Stopped) {
                        continue;
                    }
                    // Open positions keep being managed while halted; no
                    // new signals are produced.
                    self.managing_only_cycle().await;
                    tokio::time::sleep(CYCLE_INTERVAL).await;
                }
                _ => {
                    self.drain_commands().await;
                    if !self.state.is_trading() {
                        continue;
                    }
                    let started = std::time::Instant::now();
                    self.cycle().await;
                    let elapsed = started.elapsed();
                    if elapsed < CYCLE_INTERVAL {
                        tokio::time::sleep(CYCLE_INTERVAL - elapsed).await;
                    }
                }
            }
        }
        info!("engine task finished");
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    /// Process every queued command without waiting for new ones.
    async fn drain_commands(&mut self) {
        while let Ok(envelope) = self.cmd_rx.try_recv() {
            self.handle_command_inner(envelope).await;
        }
        self.urgent.store(false, Ordering::SeqCst);
    }

    async fn handle_command(&mut self, envelope: CommandEnvelope) {
        self.handle_command_inner(envelope).await;
        self.urgent.store(false, Ordering::SeqCst);
    }

    async fn handle_command_inner(&mut self, envelope: CommandEnvelope) {
        let cmd = envelope.cmd;
        info!(?cmd, state = %self.state, "command received");
        let outcome = match cmd {
            EngineCommand::Start { mode } => self.cmd_start(mode).await,
            EngineCommand::Stop => self.cmd_stop().await,
            EngineCommand::Pause => {
                if self.state.is_trading() && !self.paused {
                    self.paused = true;
                    CommandOutcome::accepted()
                } else {
                    CommandOutcome::rejected(format!("cannot pause in {}", self.state))
                }
            }
            EngineCommand::Resume => {
                if self.paused {
                    self.paused = false;
                    CommandOutcome::accepted()
                } else {
                    CommandOutcome::rejected("engine is not paused")
                }
            }
            EngineCommand::TimeStop => {
                if self.state.is_trading() || self.state == EngineState::Halted {
                    self.exec.flatten_all(ExitReason::TimeStop).await;
                    CommandOutcome::accepted()
                } else {
                    CommandOutcome::rejected(format!("cannot time_stop in {}", self.state))
                }
            }
            EngineCommand::PanicExit => {
                if self.state.is_trading() || self.state == EngineState::Halted {
                    self.exec.panic_exit_all().await;
                    self.state = EngineState::Emergency;
                    CommandOutcome::accepted()
                } else {
                    CommandOutcome::rejected(format!("cannot panic_exit in {}", self.state))
                }
            }
            EngineCommand::KillSwitch => {
                self.risk.trip_kill_switch();
                if self.state.is_trading() {
                    self.state = EngineState::Halted;
                }
                CommandOutcome::accepted()
            }
            EngineCommand::Retry => {
                if self.state == EngineState::Halted
                    || self.state == EngineState::Emergency
                    || self.risk.kill_switch_active()
                {
                    self.risk.reset_kill_switch();
                    if matches!(self.state, EngineState::Halted | EngineState::Emergency) {
                        self.state = EngineState::Scanning;
                    }
                    CommandOutcome::accepted()
                } else {
                    CommandOutcome::rejected("nothing to retry")
                }
            }
        };
        if !outcome.accepted {
            warn!(?cmd, reason = ?outcome.reason, "command rejected");
        }
        let _ = envelope.reply.send(outcome);
    }

    async fn cmd_start(&mut self, mode: EngineMode) -> CommandOutcome {
        if !matches!(self.state, EngineState::Idle | EngineState::Stopped) {
            return CommandOutcome::rejected(format!("cannot start in {}", self.state));
        }
        if self.risk.kill_switch_active() {
            return CommandOutcome::rejected("kill switch is latched — retry first");
        }
        self.mode = mode;
        self.state = EngineState::Initializing;
        match self.initialize().await {
            Ok(()) => {
                self.state = EngineState::Scanning;
                info!(mode = %mode, "engine started");
                CommandOutcome::accepted()
            }
            Err(e) => {
                error!(error = %e, "initialisation failed");
                self.state = EngineState::Idle;
                CommandOutcome::rejected(format!("initialisation failed: {e}"))
            }
        }
    }

    async fn cmd_stop(&mut self) -> CommandOutcome {
        if matches!(self.state, EngineState::Idle | EngineState::Stopped) {
            return CommandOutcome::rejected("engine is not running");
        }
        // Drain in-flight gateway work within the grace budget, then stop.
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, self.exec.handle_events()).await;
        if drained.is_err() {
            warn!("shutdown grace elapsed with gateway work still in flight");
        }
        self.save_checkpoint();
        self.state = EngineState::Stopped;
        info!("engine stopped");
        CommandOutcome::accepted()
    }

    async fn initialize(&mut self) -> anyhow::Result<()> {
        // Account equity is required before any sizing can happen.
        let gateway = self.gateway.clone();
        self.equity = with_retry("account_equity", || gateway.account_equity())
            .await
            .map_err(|e| anyhow::anyhow!("equity fetch failed: {e}"))?;
        if self.equity <= 0.0 {
            anyhow::bail!("account equity is zero");
        }

        for symbol in &self.preset.symbols {
            let gateway = self.gateway.clone();
            let meta = with_retry("symbol_meta", || gateway.symbol_meta(symbol))
                .await
                .map_err(|e| anyhow::anyhow!("symbol meta for {symbol} failed: {e}"))?;
            self.symbol_meta.insert(symbol.clone(), meta);
            self.app.books.register(symbol, meta.tick_size);
            self.app.trades.subscribe(symbol);
        }

        // Reload what survives restarts: positions, risk day, cooldowns.
        if let Some(path) = &self.checkpoint_path {
            if path.exists() {
                match Checkpoint::load(path) {
                    Ok(checkpoint) => {
                        let now_ms = Utc::now().timestamp_millis();
                        self.risk.restore(&checkpoint.risk_day, now_ms);
                        let rows: Vec<_> = checkpoint
                            .cooldowns
                            .iter()
                            .map(|c| (c.symbol.clone(), c.level_price, c.side, c.expires_ms))
                            .collect();
                        self.signals.restore_cooldowns(&rows);
                        self.exec.restore_positions(checkpoint.positions);
                        info!("checkpoint restored");
                    }
                    Err(e) => warn!(error = %e, "checkpoint unreadable — starting clean"),
                }
            }
        }

        info!(
            equity = self.equity,
            symbols = self.preset.symbols.len(),
            "initialisation complete"
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // The cycle
    // -------------------------------------------------------------------------

    async fn cycle(&mut self) {
        let cycle_started = std::time::Instant::now();
        let now_ms = Utc::now().timestamp_millis();
        self.cycle += 1;

        // 1. Drain market events.
        let (events_drained, symbol_cycle) = self.drain_market_events(now_ms).await;
        self.check_urgent().await;
        if !self.state.is_trading() {
            return;
        }

        // 2. Scan when scheduled (levels are rebuilt inside the scan).
        let scan_due = self.candidates.is_empty()
            || now_ms - self.last_scan_ms >= (self.preset.scanner.scan_interval_s as i64) * 1000;
        if scan_due && !self.paused {
            self.state = EngineState::LevelBuilding;
            let inputs = self.build_scanner_inputs();
            self.state = EngineState::Scanning;
            let outcome = self.scanner.scan(inputs, &self.filter);
            for (symbol, reason) in &outcome.rejections {
                debug!(symbol = %symbol, %reason, "symbol filtered from scan");
            }
            self.candidates = outcome.candidates;
            self.last_scan_ms = now_ms;
        }

        // 3. Signals.
        self.state = EngineState::SignalWait;
        let mut emitted = Vec::new();
        let mut rejected_count = 0usize;
        if !self.paused && !self.risk.kill_switch_active() {
            let mut exposure = self.exec.exposure();
            let candidates = self.candidates.clone();
            for candidate in &candidates {
                let key = CandleKey::new(candidate.symbol.clone(), WORK_INTERVAL);
                let candles = self.app.candles.closed(&key, 100);
                let last_price = self
                    .app
                    .trades
                    .last_price(&candidate.symbol)
                    .or_else(|| self.app.books.mid(&candidate.symbol))
                    .or_else(|| candles.last().map(|c| c.close))
                    .unwrap_or(0.0);
                if last_price <= 0.0 {
                    continue;
                }
                let densities = self.density.densities(&candidate.symbol);
                let activity = self.activity.metrics(&candidate.symbol);
                let avg_volume = if candles.len() > 1 {
                    let prior = &candles[..candles.len() - 1];
                    let window = prior.len().min(20);
                    prior[prior.len() - window..]
                        .iter()
                        .map(|c| c.volume)
                        .sum::<f64>()
                        / window as f64
                } else {
                    0.0
                };
                let ctx = SignalContext {
                    candles: &candles,
                    last_price,
                    densities: &densities,
                    activity: &activity,
                    tpm_now: self.app.trades.tpm(&candidate.symbol, 60, now_ms),
                    tpm_mean: self.activity.tpm_mean(&candidate.symbol),
                    avg_volume,
                    data_fresh: self.app.trades.is_fresh(&candidate.symbol, now_ms)
                        && !self.app.books.is_stale(&candidate.symbol),
                    open_exposure: &exposure,
                    now_ms,
                };
                let (signals, notes) = self.signals.evaluate(candidate, &ctx);
                rejected_count += notes.len();
                for signal in signals {
                    exposure.insert((signal.symbol.clone(), signal.side));
                    emitted.push(signal);
                }
            }
        }
        if !emitted.is_empty() {
            self.last_signal_ms = Some(now_ms);
        }
        self.check_urgent().await;
        if !self.state.is_trading() {
            return;
        }

        // 4. Sizing + execution.
        self.state = EngineState::Sizing;
        let signals_emitted = emitted.len();
        for signal in emitted {
            let meta = self
                .symbol_meta
                .get(&signal.symbol)
                .copied()
                .unwrap_or(SymbolMeta {
                    tick_size: 0.0,
                    step_size: 0.0,
                    min_qty: 0.0,
                });
            let open_risks = self.open_position_risks();
            let btc_correlated = self.is_btc_correlated(&signal.symbol);
            match self.risk.evaluate(
                &signal,
                self.equity,
                meta.step_size,
                &open_risks,
                btc_correlated,
                now_ms,
            ) {
                Ok(sized) => {
                    self.state = EngineState::Execution;
                    let densities = self.density.densities(&signal.symbol);
                    let key = CandleKey::new(signal.symbol.clone(), WORK_INTERVAL);
                    let level_candles = self.app.candles.closed(&key, 100);
                    let levels = self.levels.detect(&signal.symbol, &level_candles);
                    let ladder_ctx = LadderContext {
                        densities: &densities,
                        levels: &levels,
                        round_steps: &self.preset.levels_rules.round_step_candidates,
                    };
                    let ladder_cfg = match self.preset.effective_tp_ladder() {
                        Ok(cfg) => cfg,
                        Err(e) => {
                            error!(error = %e, "preset ladder invalid at runtime");
                            continue;
                        }
                    };
                    match self
                        .exec
                        .place(&sized, &ladder_cfg, &ladder_ctx, meta.step_size, now_ms)
                        .await
                    {
                        Ok(position_id) => {
                            info!(
                                position_id = %position_id,
                                symbol = %sized.signal.symbol,
                                side = %sized.signal.side,
                                qty = sized.qty,
                                "signal routed"
                            );
                        }
                        Err(e) => {
                            warn!(symbol = %sized.signal.symbol, error = %e, "placement failed");
                        }
                    }
                }
                Err(rejection) => {
                    debug!(symbol = %signal.symbol, %rejection, "signal rejected by risk");
                }
            }
        }

        // 5. Manage positions: fills first, then one FSM step each.
        self.state = EngineState::Managing;
        match self.exec.handle_events().await {
            Ok(()) => self.gateway_fault_streak = 0,
            Err(e) => {
                self.gateway_fault_streak += 1;
                warn!(
                    error = %e,
                    streak = self.gateway_fault_streak,
                    "fill polling failed"
                );
                if self.gateway_fault_streak >= GATEWAY_FAULT_LIMIT {
                    error!("persistent gateway failure — engine halted");
                    self.state = EngineState::Halted;
                }
            }
        }
        let closed = self.step_all_positions(&symbol_cycle, now_ms).await;
        for position in &closed {
            let tripped =
                self.risk
                    .record_close(position.realized_r, position.realized_pnl, now_ms);
            if tripped {
                warn!("kill switch tripped — engine halted");
                self.state = EngineState::Halted;
            }
        }

        // 6. Housekeeping + telemetry.
        if self.cycle % CHECKPOINT_EVERY == 0 {
            self.refresh_equity().await;
            self.save_checkpoint();
        }
        let latency_ms = cycle_started.elapsed().as_millis() as u64;
        self.publish_telemetry(now_ms, latency_ms);
        let _ = self.tick_tx.send(CycleTick {
            cycle: self.cycle,
            state: self.state.to_string(),
            latency_ms,
            events_drained,
            signals_emitted,
            signals_rejected: rejected_count,
            open_positions: self.exec.open_position_count(),
            timestamp_ms: now_ms,
        });

        if self.state == EngineState::Managing {
            self.state = EngineState::Scanning;
        }
    }

    /// Halted/emergency mode: keep positions protected, produce nothing new.
    async fn managing_only_cycle(&mut self) {
        let now_ms = Utc::now().timestamp_millis();
        let (_, symbol_cycle) = self.drain_market_events(now_ms).await;
        if let Err(e) = self.exec.handle_events().await {
            warn!(error = %e, "fill polling failed");
        }
        let closed = self.step_all_positions(&symbol_cycle, now_ms).await;
        for position in &closed {
            self.risk
                .record_close(position.realized_r, position.realized_pnl, now_ms);
        }
        let latency_ms = 0;
        self.publish_telemetry(now_ms, latency_ms);
    }

    // -------------------------------------------------------------------------
    // Cycle internals
    // -------------------------------------------------------------------------

    /// Drain the bounded market channel and refresh density/activity. Every
    /// event is consumed exactly once.
    async fn drain_market_events(&mut self, now_ms: i64) -> (usize, HashMap<String, SymbolCycle>) {
        let mut drained = 0usize;
        let mut bars_closed: HashSet<String> = HashSet::new();

        // Wait briefly for the first event, then drain whatever is queued.
        let first = tokio::time::timeout(DRAIN_WAIT, self.market_rx.recv()).await;
        let mut pending = match first {
            Ok(Some(event)) => vec![event],
            _ => Vec::new(),
        };
        while let Ok(event) = self.market_rx.try_recv() {
            pending.push(event);
            if pending.len() >= 10_000 {
                break;
            }
        }

        for event in pending {
            drained += 1;
            match event {
                MarketEvent::Trade { .. } | MarketEvent::BookDelta { .. } => {}
                MarketEvent::CandleClosed { symbol, interval } => {
                    if interval == WORK_INTERVAL {
                        bars_closed.insert(symbol);
                    }
                }
                MarketEvent::BookStale { symbol } => {
                    // Depth-derived state is untrustworthy until the
                    // resnapshot; drop the densities outright.
                    self.density.clear_symbol(&symbol);
                }
                MarketEvent::StreamGap { symbol } => {
                    self.app.trades.mark_gap(&symbol, now_ms);
                }
            }
        }

        // Refresh activity and densities per symbol from current state.
        let mut out = HashMap::new();
        for symbol in &self.preset.symbols {
            let metrics = self.app.trades.metrics(symbol, 60, now_ms);
            let act =
                self.activity
                    .refresh(symbol, metrics.tpm, metrics.tps, metrics.vol_delta, now_ms);

            if let Some(book) = self.app.books.snapshot(symbol) {
                let tick = self.app.books.tick_size(symbol).unwrap_or(0.0);
                for event in self.density.scan(&book, tick, now_ms) {
                    debug!(symbol = %symbol, ?event, "density event");
                }
            }

            let last_price = self
                .app
                .trades
                .last_price(symbol)
                .or_else(|| self.app.books.mid(symbol))
                .unwrap_or(0.0);
            // Feed the tape into the gateway so paper fills materialise.
            if last_price > 0.0 {
                self.gateway.on_trade(symbol, last_price, now_ms);
            }

            let key = CandleKey::new(symbol.clone(), WORK_INTERVAL);
            let last_closed = self.app.candles.closed(&key, 1).pop();
            let bar_closed = match &last_closed {
                Some(candle) => {
                    let seen = self.last_bar_seen.insert(symbol.clone(), candle.open_time);
                    bars_closed.contains(symbol)
                        || seen.map_or(false, |prev| prev != candle.open_time)
                }
                None => false,
            };

            out.insert(
                symbol.clone(),
                SymbolCycle {
                    last_price,
                    last_close: last_closed.map(|c| c.close),
                    bar_closed,
                    data_stale: self.app.books.is_stale(symbol)
                        || !self.app.trades.is_fresh(symbol, now_ms),
                    activity_dropping: act.is_dropping,
                },
            );
        }
        (drained, out)
    }

    async fn step_all_positions(
        &mut self,
        symbol_cycle: &HashMap<String, SymbolCycle>,
        now_ms: i64,
    ) -> Vec<Position> {
        let retest_threshold =
            bps_to_frac(self.preset.position_config.exit_rules.failed_breakout_retest_threshold_bps);
        let cycle_data = symbol_cycle.clone();
        self.exec
            .step_positions(move |pos| {
                let data = cycle_data.get(&pos.symbol).cloned().unwrap_or_default();
                let price = if data.last_price > 0.0 {
                    data.last_price
                } else {
                    pos.entry_price
                };
                // A close back through the level (plus threshold) on the
                // adverse side flags the failed breakout.
                let closed_back_inside_level = data
                    .last_close
                    .map(|close| {
                        let boundary =
                            pos.level_price * (1.0 - pos.side.sign() * retest_threshold);
                        pos.side.sign() * (close - boundary) < 0.0
                    })
                    .unwrap_or(false);
                FsmInputs {
                    price,
                    now_ms,
                    bar_closed: data.bar_closed,
                    closed_back_inside_level,
                    activity_dropping: data.activity_dropping,
                    tp_fill_since_last_step: false,
                    data_stale: data.data_stale,
                }
            })
            .await
    }

    fn build_scanner_inputs(&self) -> Vec<ScannerInput> {
        let btc_key = CandleKey::new("BTCUSDT", WORK_INTERVAL);
        let btc_closes: Vec<f64> = self
            .app
            .candles
            .closed(&btc_key, 60)
            .iter()
            .map(|c| c.close)
            .collect();

        let mut inputs = Vec::new();
        for symbol in &self.preset.symbols {
            let key5 = CandleKey::new(symbol.clone(), WORK_INTERVAL);
            let key15 = CandleKey::new(symbol.clone(), ATR_INTERVAL);
            let day = self.app.candles.closed(&key5, 288);
            let candles15 = self.app.candles.closed(&key15, 50);

            let last_close = day.last().map(|c| c.close).unwrap_or(0.0);
            let volume_24h = if day.is_empty() {
                None
            } else {
                Some(day.iter().map(|c| c.quote_volume).sum::<f64>())
            };
            let range_24h_pct = if last_close > 0.0 && !day.is_empty() {
                let high = day.iter().map(|c| c.high).fold(f64::MIN, f64::max);
                let low = day.iter().map(|c| c.low).fold(f64::MAX, f64::min);
                Some(((high - low) / last_close) * 100.0)
            } else {
                None
            };
            let atr15 = atr(&candles15, 14);
            let atr_pct = match (atr15, last_close > 0.0) {
                (Some(a), true) => Some((a / last_close) * 100.0),
                _ => None,
            };

            // Volume surge: the last hour against the day's hourly average.
            let vol_surge_1h = if day.len() >= 24 {
                let hour: f64 = day[day.len() - 12..].iter().map(|c| c.quote_volume).sum();
                let avg_hour = day.iter().map(|c| c.quote_volume).sum::<f64>()
                    / (day.len() as f64 / 12.0);
                if avg_hour > 0.0 {
                    hour / avg_hour
                } else {
                    0.0
                }
            } else {
                0.0
            };

            let metrics = self.app.trades.metrics(symbol, 300, Utc::now().timestamp_millis());
            let trades_pressure = metrics.tpm * (metrics.buy_ratio - 0.5).abs() * 2.0;
            let spread_bps = self.app.books.spread_bps(symbol);
            let spread_quality = spread_bps.map(|s| 1.0 / (1.0 + s)).unwrap_or(0.0);

            let closes: Vec<f64> = day.iter().map(|c| c.close).collect();
            let btc_correlation = if symbol == "BTCUSDT" {
                None
            } else {
                returns_correlation(&closes, &btc_closes)
            };

            let levels = self.levels.detect(symbol, &day);
            let level_strength_max = levels
                .iter()
                .map(|l| l.strength)
                .fold(0.0f64, f64::max);

            inputs.push(ScannerInput {
                snapshot: SymbolSnapshot {
                    symbol: symbol.clone(),
                    volume_24h_usd: volume_24h,
                    depth_usd: self.app.books.depth_usd_within_bps(symbol, 10.0),
                    spread_bps,
                    range_24h_pct,
                    atr_pct,
                    btc_correlation,
                },
                features: crate::scanner::FeatureBreakdown {
                    vol_surge_1h,
                    oi_delta_24h: None,
                    atr15m_pct: atr_pct.unwrap_or(0.0),
                    trades_pressure,
                    spread_quality,
                    level_strength_max,
                },
                levels,
                metrics: self.activity.metrics(symbol),
            });
        }
        inputs
    }

    fn open_position_risks(&self) -> Vec<OpenPositionRisk> {
        self.exec
            .open_positions()
            .iter()
            .map(|pos| OpenPositionRisk {
                symbol: pos.symbol.clone(),
                side: pos.side,
                open_risk_usd: pos.open_risk_usd(),
                btc_correlated: self.is_btc_correlated(&pos.symbol),
            })
            .collect()
    }

    fn is_btc_correlated(&self, symbol: &str) -> bool {
        if symbol == "BTCUSDT" {
            return true;
        }
        let btc_key = CandleKey::new("BTCUSDT", WORK_INTERVAL);
        let key = CandleKey::new(symbol.to_string(), WORK_INTERVAL);
        let btc: Vec<f64> = self
            .app
            .candles
            .closed(&btc_key, 60)
            .iter()
            .map(|c| c.close)
            .collect();
        let own: Vec<f64> = self
            .app
            .candles
            .closed(&key, 60)
            .iter()
            .map(|c| c.close)
            .collect();
        returns_correlation(&own, &btc)
            .map_or(false, |corr| corr.abs() >= BTC_CORRELATED_THRESHOLD)
    }

    async fn refresh_equity(&mut self) {
        let gateway = self.gateway.clone();
        match with_retry("account_equity", || gateway.account_equity()).await {
            Ok(equity) if equity > 0.0 => self.equity = equity,
            Ok(_) => warn!("equity refresh returned zero — keeping previous value"),
            Err(e) => warn!(error = %e, "equity refresh failed — keeping previous value"),
        }
    }

    fn save_checkpoint(&self) {
        let Some(path) = &self.checkpoint_path else {
            return;
        };
        let checkpoint = Checkpoint {
            positions: self.exec.snapshot_positions(),
            risk_day: self.risk.snapshot(),
            cooldowns: self
                .signals
                .cooldown_snapshot()
                .into_iter()
                .map(|(symbol, level_price, side, expires_ms)| CooldownEntry {
                    symbol,
                    level_price,
                    side,
                    expires_ms,
                })
                .collect(),
        };
        if let Err(e) = checkpoint.save(path) {
            warn!(error = %e, "checkpoint save failed");
        }
    }

    async fn check_urgent(&mut self) {
        if self.urgent.load(Ordering::SeqCst) {
            self.drain_commands().await;
        }
    }

    fn publish_telemetry(&self, now_ms: i64, latency_ms: u64) {
        let slots_available = self
            .preset
            .risk
            .max_concurrent_positions
            .saturating_sub(self.exec.open_position_count() as u32);

        let symbols = self
            .preset
            .symbols
            .iter()
            .map(|symbol| {
                let metrics = self.app.trades.metrics(symbol, 60, now_ms);
                let act = self.activity.metrics(symbol);
                SymbolTelemetry {
                    symbol: symbol.clone(),
                    tpm: metrics.tpm,
                    tps: metrics.tps,
                    vol_delta: metrics.vol_delta,
                    activity_index: act.index,
                    is_dropping: act.is_dropping,
                    spread_bps: self.app.books.spread_bps(symbol),
                    book_stale: self.app.books.is_stale(symbol),
                    densities: self
                        .density
                        .densities(symbol)
                        .iter()
                        .map(|d| DensitySummary {
                            price_bucket: d.price_bucket,
                            side: d.side,
                            eaten_ratio: d.eaten_ratio,
                        })
                        .collect(),
                }
            })
            .collect();

        let snapshot = TelemetrySnapshot {
            state: self.state.to_string(),
            preset: self.preset.name.clone(),
            mode: self.mode,
            slots_available,
            open_positions: self
                .exec
                .open_positions()
                .iter()
                .map(|p| PositionSummary::from(*p))
                .collect(),
            cycle: self.cycle,
            cycle_latency_ms: latency_ms,
            daily_r: self.risk.daily_r(),
            consecutive_losses: self.risk.consecutive_losses(),
            last_signal_ms: self.last_signal_ms,
            symbols,
        };
        *self.app.telemetry.write() = snapshot;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::paper::PaperGateway;
    use crate::telemetry::spawn_tick_logger;

    fn test_preset() -> Preset {
        let mut preset = Preset::default();
        preset.symbols = vec!["BTCUSDT".to_string()];
        preset.scanner.scan_interval_s = 1;
        preset
    }

    fn paper_for(preset: &Preset) -> Arc<PaperGateway> {
        let gw = Arc::new(PaperGateway::new(10_000.0));
        for symbol in &preset.symbols {
            gw.set_symbol_meta(
                symbol,
                SymbolMeta {
                    tick_size: 0.1,
                    step_size: 0.001,
                    min_qty: 0.001,
                },
            );
        }
        gw
    }

    async fn spawn_engine(
        preset: Preset,
    ) -> (EngineHandle, Arc<AppState>, mpsc::Sender<MarketEvent>) {
        let preset = Arc::new(preset);
        let app = Arc::new(AppState::new(&preset.name, EngineMode::Paper, 600));
        let gw = paper_for(&preset);
        let (market_tx, market_rx) = mpsc::channel(1024);
        let tick_tx = spawn_tick_logger();
        let (engine, handle) = Engine::new(preset, app.clone(), gw, market_rx, tick_tx, None);
        tokio::spawn(engine.run());
        (handle, app, market_tx)
    }

    #[tokio::test(start_paused = true)]
    async fn start_stop_lifecycle() {
        let (handle, app, _market_tx) = spawn_engine(test_preset()).await;

        let outcome = handle
            .send(EngineCommand::Start {
                mode: EngineMode::Paper,
            })
            .await;
        assert!(outcome.accepted, "start rejected: {:?}", outcome.reason);

        // A second start is rejected while running.
        let outcome = handle
            .send(EngineCommand::Start {
                mode: EngineMode::Paper,
            })
            .await;
        assert!(!outcome.accepted);

        // Let a couple of cycles run.
        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        assert!(app.telemetry.read().cycle > 0);

        let outcome = handle.send(EngineCommand::Stop).await;
        assert!(outcome.accepted);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_and_resume() {
        let (handle, _app, _market_tx) = spawn_engine(test_preset()).await;
        handle
            .send(EngineCommand::Start {
                mode: EngineMode::Paper,
            })
            .await;

        assert!(!handle.send(EngineCommand::Resume).await.accepted);
        assert!(handle.send(EngineCommand::Pause).await.accepted);
        assert!(!handle.send(EngineCommand::Pause).await.accepted);
        assert!(handle.send(EngineCommand::Resume).await.accepted);
    }

    #[tokio::test(start_paused = true)]
    async fn kill_switch_blocks_start_until_retry() {
        let (handle, _app, _market_tx) = spawn_engine(test_preset()).await;
        handle
            .send(EngineCommand::Start {
                mode: EngineMode::Paper,
            })
            .await;

        assert!(handle.send(EngineCommand::KillSwitch).await.accepted);
        assert!(handle.send(EngineCommand::Stop).await.accepted);

        // Start is refused while the latch holds.
        let outcome = handle
            .send(EngineCommand::Start {
                mode: EngineMode::Paper,
            })
            .await;
        assert!(!outcome.accepted);

        assert!(handle.send(EngineCommand::Retry).await.accepted);
        let outcome = handle
            .send(EngineCommand::Start {
                mode: EngineMode::Paper,
            })
            .await;
        assert!(outcome.accepted, "start rejected: {:?}", outcome.reason);
    }
}
