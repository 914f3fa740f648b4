// =============================================================================
// Trades Aggregator — rolling trade-flow statistics per symbol
// =============================================================================
//
// Turns the continuous trade feed into bounded rolling windows. Queries over
// unsubscribed symbols return empty metrics rather than failing, so callers
// never need to special-case subscription order.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use super::MarketEvent;
use crate::types::TakerSide;

/// Default rolling-window span when not configured.
pub const DEFAULT_MAX_WINDOW_S: u64 = 600;

/// A trade should arrive at least this often on a liquid symbol; longer
/// silence marks the stream unfresh.
const FRESHNESS_HORIZON_MS: i64 = 30_000;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single trade print.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub price: f64,
    pub size: f64,
    pub side: TakerSide,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Copy)]
struct TradeRecord {
    price: f64,
    size: f64,
    side: TakerSide,
    timestamp_ms: i64,
}

/// Rolling metrics over one symbol's window. `Default` is the empty-window
/// shape: zero rates, balanced buy ratio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeMetrics {
    pub tpm: f64,
    pub tps: f64,
    /// Signed volume delta: sum of size * sign(side).
    pub vol_delta: f64,
    /// Buy volume over total volume; 0.5 when the window is empty.
    pub buy_ratio: f64,
    pub trade_count: usize,
    pub last_price: f64,
    pub is_fresh: bool,
}

impl Default for TradeMetrics {
    fn default() -> Self {
        Self {
            tpm: 0.0,
            tps: 0.0,
            vol_delta: 0.0,
            buy_ratio: 0.5,
            trade_count: 0,
            last_price: 0.0,
            is_fresh: false,
        }
    }
}

struct TradeWindow {
    trades: VecDeque<TradeRecord>,
    /// Timestamp of the last recorded stream gap, if any.
    gap_marker_ms: Option<i64>,
    last_trade_ms: i64,
}

impl TradeWindow {
    fn new() -> Self {
        Self {
            trades: VecDeque::new(),
            gap_marker_ms: None,
            last_trade_ms: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

/// Owns the rolling trade windows for all subscribed symbols.
pub struct TradesAggregator {
    windows: RwLock<HashMap<String, TradeWindow>>,
    max_window_s: u64,
}

impl TradesAggregator {
    pub fn new(max_window_s: u64) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            max_window_s,
        }
    }

    /// Start maintaining a window for `symbol`. Idempotent.
    pub fn subscribe(&self, symbol: &str) {
        self.windows
            .write()
            .entry(symbol.to_string())
            .or_insert_with(TradeWindow::new);
    }

    /// Drop the window for `symbol`. Idempotent.
    pub fn unsubscribe(&self, symbol: &str) {
        self.windows.write().remove(symbol);
    }

    pub fn is_subscribed(&self, symbol: &str) -> bool {
        self.windows.read().contains_key(symbol)
    }

    /// Append a trade into the symbol's window, evicting entries older than
    /// the maximum window span. Trades for unsubscribed symbols are ignored.
    pub fn on_trade(&self, trade: &Trade) {
        let mut map = self.windows.write();
        let Some(window) = map.get_mut(&trade.symbol) else {
            return;
        };

        window.trades.push_back(TradeRecord {
            price: trade.price,
            size: trade.size,
            side: trade.side,
            timestamp_ms: trade.timestamp_ms,
        });
        window.last_trade_ms = window.last_trade_ms.max(trade.timestamp_ms);

        let horizon = trade.timestamp_ms - (self.max_window_s as i64) * 1000;
        while let Some(front) = window.trades.front() {
            if front.timestamp_ms < horizon {
                window.trades.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record a stream gap (reconnect). The window is preserved; freshness
    /// is withheld until a newer trade arrives.
    pub fn mark_gap(&self, symbol: &str, now_ms: i64) {
        if let Some(window) = self.windows.write().get_mut(symbol) {
            window.gap_marker_ms = Some(now_ms);
            warn!(symbol, now_ms, "trade stream gap recorded");
        }
    }

    /// Trades per minute over the trailing `window_s` seconds.
    pub fn tpm(&self, symbol: &str, window_s: u64, now_ms: i64) -> f64 {
        let count = self.count_in_window(symbol, window_s, now_ms);
        count as f64 / (window_s as f64 / 60.0)
    }

    /// Trades per second over the trailing `window_s` seconds.
    pub fn tps(&self, symbol: &str, window_s: u64, now_ms: i64) -> f64 {
        let count = self.count_in_window(symbol, window_s, now_ms);
        count as f64 / window_s as f64
    }

    /// Signed volume delta over the trailing `window_s` seconds.
    pub fn vol_delta(&self, symbol: &str, window_s: u64, now_ms: i64) -> f64 {
        self.fold_window(symbol, window_s, now_ms, 0.0, |acc, t| {
            acc + t.size * t.side.sign()
        })
    }

    /// Buy volume over total volume; 0.5 for an empty window.
    pub fn buy_sell_ratio(&self, symbol: &str, window_s: u64, now_ms: i64) -> f64 {
        let (buy, total) =
            self.fold_window(symbol, window_s, now_ms, (0.0, 0.0), |(b, t), rec| {
                let b = if rec.side == TakerSide::Buy {
                    b + rec.size
                } else {
                    b
                };
                (b, t + rec.size)
            });
        if total > 0.0 {
            buy / total
        } else {
            0.5
        }
    }

    /// Whether the stream can be trusted: a trade arrived recently and no
    /// unhealed gap marker is outstanding.
    pub fn is_fresh(&self, symbol: &str, now_ms: i64) -> bool {
        let map = self.windows.read();
        let Some(window) = map.get(symbol) else {
            return false;
        };
        if window.last_trade_ms == 0 || now_ms - window.last_trade_ms > FRESHNESS_HORIZON_MS {
            return false;
        }
        match window.gap_marker_ms {
            Some(gap_ms) => window.last_trade_ms > gap_ms,
            None => true,
        }
    }

    /// Full metrics bundle for one symbol. Never fails: unsubscribed symbols
    /// yield the empty-window default.
    pub fn metrics(&self, symbol: &str, window_s: u64, now_ms: i64) -> TradeMetrics {
        let map = self.windows.read();
        let Some(window) = map.get(symbol) else {
            return TradeMetrics::default();
        };

        let horizon = now_ms - (window_s as i64) * 1000;
        let mut count = 0usize;
        let mut buy = 0.0;
        let mut total = 0.0;
        let mut delta = 0.0;
        let mut last_price = 0.0;
        for rec in window.trades.iter().rev() {
            if rec.timestamp_ms < horizon {
                break;
            }
            if last_price == 0.0 {
                last_price = rec.price;
            }
            count += 1;
            total += rec.size;
            delta += rec.size * rec.side.sign();
            if rec.side == TakerSide::Buy {
                buy += rec.size;
            }
        }
        drop(map);

        TradeMetrics {
            tpm: count as f64 / (window_s as f64 / 60.0),
            tps: count as f64 / window_s as f64,
            vol_delta: delta,
            buy_ratio: if total > 0.0 { buy / total } else { 0.5 },
            trade_count: count,
            last_price,
            is_fresh: self.is_fresh(symbol, now_ms),
        }
    }

    /// Most recent trade price seen for `symbol`, if any.
    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        let map = self.windows.read();
        map.get(symbol)
            .and_then(|w| w.trades.back().map(|t| t.price))
    }

    fn count_in_window(&self, symbol: &str, window_s: u64, now_ms: i64) -> usize {
        self.fold_window(symbol, window_s, now_ms, 0usize, |acc, _| acc + 1)
    }

    fn fold_window<T>(
        &self,
        symbol: &str,
        window_s: u64,
        now_ms: i64,
        init: T,
        mut f: impl FnMut(T, &TradeRecord) -> T,
    ) -> T {
        let map = self.windows.read();
        let Some(window) = map.get(symbol) else {
            return init;
        };
        let horizon = now_ms - (window_s as i64) * 1000;
        let mut acc = init;
        for rec in window.trades.iter().rev() {
            if rec.timestamp_ms < horizon {
                break;
            }
            acc = f(acc, rec);
        }
        acc
    }
}

// ---------------------------------------------------------------------------
// Trade WebSocket feed
// ---------------------------------------------------------------------------

/// Connect to the exchange aggregated-trade stream for one symbol and feed
/// trades into `aggregator`, waking the engine per trade.
///
/// Trade wake-ups use `try_send`: the windows are statistical, so dropping a
/// wake-up when the engine is saturated loses nothing — the trade itself is
/// already in the window.
pub async fn run_trade_feed(
    symbol: &str,
    aggregator: &Arc<TradesAggregator>,
    events: &mpsc::Sender<MarketEvent>,
) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("wss://stream.binance.com:9443/ws/{lower}@aggTrade");
    info!(url = %url, symbol = %symbol, "connecting to trade WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to trade WebSocket")?;

    info!(symbol = %symbol, "trade WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_agg_trade(symbol, &text) {
                        Ok(trade) => {
                            aggregator.on_trade(&trade);
                            let _ = events.try_send(MarketEvent::Trade {
                                symbol: symbol.to_string(),
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to parse aggTrade message");
                        }
                    }
                }
            }
            Some(Err(e)) => {
                error!(symbol = %symbol, error = %e, "trade WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol = %symbol, "trade WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse an aggregated-trade message.
///
/// Expected shape:
/// ```json
/// { "e": "aggTrade", "s": "BTCUSDT", "p": "37000.00", "q": "0.123",
///   "T": 1700000000123, "m": true }
/// ```
fn parse_agg_trade(symbol: &str, text: &str) -> Result<Trade> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse aggTrade JSON")?;

    let price: f64 = root["p"]
        .as_str()
        .context("missing field p")?
        .parse()
        .context("failed to parse price")?;

    let size: f64 = root["q"]
        .as_str()
        .context("missing field q")?
        .parse()
        .context("failed to parse quantity")?;

    let is_buyer_maker = root["m"].as_bool().context("missing field m")?;
    let timestamp_ms = root["T"].as_i64().context("missing field T")?;

    debug!(symbol, price, size, is_buyer_maker, "trade parsed");

    Ok(Trade {
        symbol: symbol.to_string(),
        price,
        size,
        // Buyer as maker means the aggressor sold.
        side: if is_buyer_maker {
            TakerSide::Sell
        } else {
            TakerSide::Buy
        },
        timestamp_ms,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_trade(symbol: &str, price: f64, size: f64, side: TakerSide, ts: i64) -> Trade {
        Trade {
            symbol: symbol.to_string(),
            price,
            size,
            side,
            timestamp_ms: ts,
        }
    }

    #[test]
    fn unsubscribed_symbol_returns_empty_metrics() {
        let agg = TradesAggregator::new(600);
        let m = agg.metrics("NOPEUSDT", 60, 1_000_000);
        assert_eq!(m.tpm, 0.0);
        assert_eq!(m.buy_ratio, 0.5);
        assert!(!m.is_fresh);
    }

    #[test]
    fn subscribe_is_idempotent() {
        let agg = TradesAggregator::new(600);
        agg.subscribe("BTCUSDT");
        agg.on_trade(&make_trade("BTCUSDT", 100.0, 1.0, TakerSide::Buy, 1000));
        agg.subscribe("BTCUSDT");
        let m = agg.metrics("BTCUSDT", 60, 2000);
        assert_eq!(m.trade_count, 1);
    }

    #[test]
    fn window_metrics() {
        let agg = TradesAggregator::new(600);
        agg.subscribe("BTCUSDT");
        let base = 1_000_000i64;
        for i in 0..30 {
            let side = if i % 3 == 0 {
                TakerSide::Sell
            } else {
                TakerSide::Buy
            };
            agg.on_trade(&make_trade("BTCUSDT", 100.0, 2.0, side, base + i * 1000));
        }
        let now = base + 30_000;

        // All 30 trades within 60 s.
        assert!((agg.tpm("BTCUSDT", 60, now) - 30.0).abs() < 1e-9);
        assert!((agg.tps("BTCUSDT", 60, now) - 0.5).abs() < 1e-9);

        // 20 buys, 10 sells, 2.0 each.
        assert!((agg.vol_delta("BTCUSDT", 60, now) - 20.0).abs() < 1e-9);
        assert!((agg.buy_sell_ratio("BTCUSDT", 60, now) - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn old_trades_evicted_past_max_window() {
        let agg = TradesAggregator::new(10);
        agg.subscribe("ETHUSDT");
        agg.on_trade(&make_trade("ETHUSDT", 10.0, 1.0, TakerSide::Buy, 0));
        agg.on_trade(&make_trade("ETHUSDT", 10.0, 1.0, TakerSide::Buy, 20_000));
        // First trade is 20 s older than the newest with a 10 s max window.
        let m = agg.metrics("ETHUSDT", 3600, 20_000);
        assert_eq!(m.trade_count, 1);
    }

    #[test]
    fn gap_marker_suppresses_freshness_until_new_trade() {
        let agg = TradesAggregator::new(600);
        agg.subscribe("BTCUSDT");
        agg.on_trade(&make_trade("BTCUSDT", 100.0, 1.0, TakerSide::Buy, 10_000));
        assert!(agg.is_fresh("BTCUSDT", 12_000));

        agg.mark_gap("BTCUSDT", 15_000);
        assert!(!agg.is_fresh("BTCUSDT", 16_000));

        agg.on_trade(&make_trade("BTCUSDT", 100.5, 1.0, TakerSide::Buy, 17_000));
        assert!(agg.is_fresh("BTCUSDT", 18_000));
    }

    #[test]
    fn stale_after_silence() {
        let agg = TradesAggregator::new(600);
        agg.subscribe("BTCUSDT");
        agg.on_trade(&make_trade("BTCUSDT", 100.0, 1.0, TakerSide::Buy, 0));
        assert!(!agg.is_fresh("BTCUSDT", FRESHNESS_HORIZON_MS + 1));
    }

    #[test]
    fn parse_agg_trade_sides() {
        let buy = r#"{"e":"aggTrade","s":"BTCUSDT","p":"100.5","q":"0.25","T":123,"m":false}"#;
        let t = parse_agg_trade("BTCUSDT", buy).unwrap();
        assert_eq!(t.side, TakerSide::Buy);
        assert!((t.price - 100.5).abs() < 1e-12);

        let sell = r#"{"e":"aggTrade","s":"BTCUSDT","p":"100.4","q":"0.25","T":124,"m":true}"#;
        let t = parse_agg_trade("BTCUSDT", sell).unwrap();
        assert_eq!(t.side, TakerSide::Sell);
    }
}
