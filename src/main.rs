// =============================================================================
// Borealis Breakout Nexus — Main Entry Point
// =============================================================================
//
// The engine starts in paper mode and IDLE. It begins trading only on an
// explicit start command (or BOREALIS_AUTOSTART for unattended paper runs).
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod activity_tracker;
mod app_state;
mod density_detector;
mod engine;
mod errors;
mod execution;
mod gateway;
mod level_detector;
mod market_data;
mod market_filter;
mod persistence;
mod position_fsm;
mod preset;
mod risk;
mod scanner;
mod signal_generator;
mod telemetry;
mod types;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::engine::{Engine, EngineCommand, EngineHandle};
use crate::gateway::live::LiveGateway;
use crate::gateway::paper::PaperGateway;
use crate::gateway::ExchangeGateway;
use crate::market_data::trades::DEFAULT_MAX_WINDOW_S;
use crate::market_data::MarketEvent;
use crate::preset::Preset;
use crate::types::EngineMode;

/// Bounded capacity of the market-data event channel.
const MARKET_CHANNEL_CAPACITY: usize = 4096;
/// Candle intervals the feeds subscribe to.
const INTERVALS: &[&str] = &["5m", "15m"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Borealis Breakout Nexus — Starting Up            ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let preset_path =
        std::env::var("BOREALIS_PRESET").unwrap_or_else(|_| "preset.json".to_string());
    let preset = match Preset::load(&preset_path) {
        Ok(preset) => preset,
        Err(e) if std::path::Path::new(&preset_path).exists() => {
            // An existing but invalid preset is a refusal, not a fallback.
            error!(error = %e, path = %preset_path, "preset rejected — refusing to start");
            return Err(e);
        }
        Err(_) => {
            warn!(path = %preset_path, "no preset file — using built-in defaults");
            Preset::default()
        }
    };
    let preset = Arc::new(preset);

    let mode = match std::env::var("BOREALIS_MODE").as_deref() {
        Ok("live") => EngineMode::Live,
        _ => EngineMode::Paper,
    };
    info!(preset = %preset.name, mode = %mode, symbols = ?preset.symbols, "configuration loaded");

    // ── 2. Shared state & gateway ────────────────────────────────────────
    let app = Arc::new(AppState::new(&preset.name, mode, DEFAULT_MAX_WINDOW_S));

    let gateway: Arc<dyn ExchangeGateway> = match mode {
        EngineMode::Paper => {
            let paper = Arc::new(PaperGateway::new(
                std::env::var("BOREALIS_PAPER_EQUITY")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10_000.0),
            ));
            // Paper mode needs trading rules; seed sensible spot defaults.
            for symbol in &preset.symbols {
                paper.set_symbol_meta(
                    symbol,
                    gateway::SymbolMeta {
                        tick_size: 0.01,
                        step_size: 0.0001,
                        min_qty: 0.0001,
                    },
                );
            }
            paper
        }
        EngineMode::Live => {
            let api_key = std::env::var("BOREALIS_API_KEY").unwrap_or_default();
            let api_secret = std::env::var("BOREALIS_API_SECRET").unwrap_or_default();
            if api_key.is_empty() || api_secret.is_empty() {
                anyhow::bail!("live mode requires BOREALIS_API_KEY and BOREALIS_API_SECRET");
            }
            Arc::new(LiveGateway::new(api_key, api_secret))
        }
    };

    // ── 3. Market data feeds ─────────────────────────────────────────────
    let (market_tx, market_rx) = mpsc::channel::<MarketEvent>(MARKET_CHANNEL_CAPACITY);

    for symbol in &preset.symbols {
        for interval in INTERVALS {
            let buffer = app.candles.clone();
            let events = market_tx.clone();
            let sym = symbol.clone();
            let iv = interval.to_string();
            tokio::spawn(async move {
                loop {
                    if let Err(e) =
                        market_data::candle_buffer::run_kline_feed(&sym, &iv, &buffer, &events)
                            .await
                    {
                        error!(symbol = %sym, interval = %iv, error = %e, "kline feed error — reconnecting in 5s");
                    }
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                }
            });
        }

        {
            let aggregator = app.trades.clone();
            let events = market_tx.clone();
            let sym = symbol.clone();
            aggregator.subscribe(&sym);
            tokio::spawn(async move {
                loop {
                    if let Err(e) =
                        market_data::trades::run_trade_feed(&sym, &aggregator, &events).await
                    {
                        error!(symbol = %sym, error = %e, "trade feed error — reconnecting in 5s");
                    }
                    // The window survives the gap; freshness is withheld
                    // until trades flow again.
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    aggregator.mark_gap(&sym, now_ms);
                    let _ = events.try_send(MarketEvent::StreamGap { symbol: sym.clone() });
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                }
            });
        }

        {
            let books = app.books.clone();
            let events = market_tx.clone();
            let sym = symbol.clone();
            tokio::spawn(async move {
                loop {
                    if let Err(e) =
                        market_data::orderbook::run_depth_feed(&sym, &books, &events).await
                    {
                        error!(symbol = %sym, error = %e, "depth feed error — reconnecting in 5s");
                    }
                    books.mark_stale(&sym);
                    let _ = events.try_send(MarketEvent::BookStale { symbol: sym.clone() });
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                }
            });
        }
    }
    info!(count = preset.symbols.len(), "market data feeds launched");

    // ── 4. Engine ────────────────────────────────────────────────────────
    let tick_tx = telemetry::spawn_tick_logger();
    let checkpoint_path = std::env::var("BOREALIS_CHECKPOINT")
        .unwrap_or_else(|_| "borealis_checkpoint.json".to_string());
    let (engine, handle) = Engine::new(
        preset.clone(),
        app.clone(),
        gateway,
        market_rx,
        tick_tx,
        Some(checkpoint_path.into()),
    );
    let engine_task = tokio::spawn(engine.run());

    if std::env::var("BOREALIS_AUTOSTART").is_ok() {
        autostart(&handle, mode).await;
    } else {
        info!("engine idle — waiting for a start command");
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    let outcome = handle.send(EngineCommand::Stop).await;
    if !outcome.accepted {
        warn!(reason = ?outcome.reason, "stop command rejected during shutdown");
    }
    engine_task.abort();

    info!("Borealis Breakout Nexus shut down complete.");
    Ok(())
}

async fn autostart(handle: &EngineHandle, mode: EngineMode) {
    // Give the feeds a moment to seed candles before the first scan.
    tokio::time::sleep(std::time::Duration::from_secs(10)).await;
    let outcome = handle.send(EngineCommand::Start { mode }).await;
    if outcome.accepted {
        info!(mode = %mode, "engine auto-started");
    } else {
        error!(reason = ?outcome.reason, "auto-start rejected");
    }
}
