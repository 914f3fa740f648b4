// =============================================================================
// Order Book Manager — canonical L2 book per symbol
// =============================================================================
//
// Each book is modified only by its ingestion task; readers take short read
// locks and clone what they need. A crossed update or a sequence gap drops
// the book into `stale` until a fresh snapshot arrives, and everything that
// depends on depth is suppressed for that symbol in the meantime.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use super::MarketEvent;
use crate::errors::DataError;

/// How long a book delta send may block before the book is forced stale and
/// a resnapshot is requested (block-newest backpressure threshold).
pub const DELTA_BLOCK_THRESHOLD_MS: u64 = 500;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookSide {
    Bid,
    Ask,
}

impl std::fmt::Display for BookSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bid => write!(f, "bid"),
            Self::Ask => write!(f, "ask"),
        }
    }
}

/// One resting price level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

/// A single delta entry; `size == 0` removes the level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookUpdate {
    pub side: BookSide,
    pub price: f64,
    pub size: f64,
}

/// Full book state for one symbol. Bids descend, asks ascend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: String,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub seq: u64,
    pub timestamp_ms: i64,
    pub stale: bool,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<&BookLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&BookLevel> {
        self.asks.first()
    }

    pub fn mid(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b.price + a.price) / 2.0),
            _ => None,
        }
    }

    pub fn spread_bps(&self) -> Option<f64> {
        let mid = self.mid()?;
        if mid <= 0.0 {
            return None;
        }
        let bid = self.best_bid()?.price;
        let ask = self.best_ask()?.price;
        Some(((ask - bid) / mid) * 10_000.0)
    }

    fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => b.price >= a.price,
            _ => false,
        }
    }
}

/// Aggregated resting size in one price bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthBucket {
    /// Lower edge of the bucket.
    pub price: f64,
    pub size: f64,
}

struct BookState {
    book: OrderBook,
    tick_size: f64,
    resnapshot_requested: bool,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Owns the current L2 book for every registered symbol.
pub struct OrderBookManager {
    books: RwLock<HashMap<String, BookState>>,
}

impl OrderBookManager {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
        }
    }

    /// Register a symbol with its tick size. Until a snapshot arrives the
    /// book is stale. Idempotent; re-registering updates the tick size only.
    pub fn register(&self, symbol: &str, tick_size: f64) {
        let mut map = self.books.write();
        map.entry(symbol.to_string())
            .and_modify(|s| s.tick_size = tick_size)
            .or_insert_with(|| BookState {
                book: OrderBook {
                    symbol: symbol.to_string(),
                    bids: Vec::new(),
                    asks: Vec::new(),
                    seq: 0,
                    timestamp_ms: 0,
                    stale: true,
                },
                tick_size,
                resnapshot_requested: true,
            });
    }

    pub fn tick_size(&self, symbol: &str) -> Option<f64> {
        self.books.read().get(symbol).map(|s| s.tick_size)
    }

    /// Replace the book wholesale and seed the sequence. A crossed snapshot
    /// is rejected and the book stays stale.
    pub fn apply_snapshot(
        &self,
        symbol: &str,
        mut bids: Vec<BookLevel>,
        mut asks: Vec<BookLevel>,
        seq: u64,
        timestamp_ms: i64,
    ) -> Result<(), DataError> {
        bids.retain(|l| l.size > 0.0);
        asks.retain(|l| l.size > 0.0);
        bids.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));
        asks.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));

        let mut map = self.books.write();
        let state = map
            .get_mut(symbol)
            .ok_or_else(|| DataError::UnknownSymbol {
                symbol: symbol.to_string(),
            })?;

        let candidate = OrderBook {
            symbol: symbol.to_string(),
            bids,
            asks,
            seq,
            timestamp_ms,
            stale: false,
        };
        if candidate.is_crossed() {
            state.book.stale = true;
            state.resnapshot_requested = true;
            return Err(DataError::CrossedBook {
                symbol: symbol.to_string(),
                bid: format!("{:?}", candidate.best_bid().map(|l| l.price)),
                ask: format!("{:?}", candidate.best_ask().map(|l| l.price)),
            });
        }

        state.book = candidate;
        state.resnapshot_requested = false;
        debug!(symbol, seq, "book snapshot applied");
        Ok(())
    }

    /// Apply a delta if `seq` is the expected successor; otherwise the book
    /// goes stale and a resnapshot is requested.
    pub fn apply_delta(
        &self,
        symbol: &str,
        updates: &[BookUpdate],
        seq: u64,
        timestamp_ms: i64,
    ) -> Result<(), DataError> {
        let mut map = self.books.write();
        let state = map
            .get_mut(symbol)
            .ok_or_else(|| DataError::UnknownSymbol {
                symbol: symbol.to_string(),
            })?;

        if state.book.stale {
            state.resnapshot_requested = true;
            return Err(DataError::SequenceGap {
                symbol: symbol.to_string(),
                expected: state.book.seq + 1,
                got: seq,
            });
        }

        let expected = state.book.seq + 1;
        if seq != expected {
            state.book.stale = true;
            state.resnapshot_requested = true;
            warn!(symbol, expected, got = seq, "book sequence gap — marking stale");
            return Err(DataError::SequenceGap {
                symbol: symbol.to_string(),
                expected,
                got: seq,
            });
        }

        for update in updates {
            match update.side {
                BookSide::Bid => apply_level(&mut state.book.bids, update, true),
                BookSide::Ask => apply_level(&mut state.book.asks, update, false),
            }
        }
        state.book.seq = seq;
        state.book.timestamp_ms = timestamp_ms;

        if state.book.is_crossed() {
            state.book.stale = true;
            state.resnapshot_requested = true;
            let err = DataError::CrossedBook {
                symbol: symbol.to_string(),
                bid: format!("{:?}", state.book.best_bid().map(|l| l.price)),
                ask: format!("{:?}", state.book.best_ask().map(|l| l.price)),
            };
            warn!(symbol, %err, "crossed book after delta — marking stale");
            return Err(err);
        }

        Ok(())
    }

    /// Force the book stale (used when the delta channel blocked too long).
    pub fn mark_stale(&self, symbol: &str) {
        if let Some(state) = self.books.write().get_mut(symbol) {
            state.book.stale = true;
            state.resnapshot_requested = true;
        }
    }

    pub fn is_stale(&self, symbol: &str) -> bool {
        self.books
            .read()
            .get(symbol)
            .map_or(true, |s| s.book.stale)
    }

    /// Whether an ingestion task should fetch a fresh snapshot. Cleared once
    /// the snapshot is applied.
    pub fn needs_resnapshot(&self, symbol: &str) -> bool {
        self.books
            .read()
            .get(symbol)
            .map_or(false, |s| s.resnapshot_requested)
    }

    /// Top `n` levels of both sides. `None` while stale or unregistered.
    pub fn top(&self, symbol: &str, n: usize) -> Option<(Vec<BookLevel>, Vec<BookLevel>)> {
        let map = self.books.read();
        let state = map.get(symbol)?;
        if state.book.stale {
            return None;
        }
        Some((
            state.book.bids.iter().take(n).copied().collect(),
            state.book.asks.iter().take(n).copied().collect(),
        ))
    }

    pub fn mid(&self, symbol: &str) -> Option<f64> {
        let map = self.books.read();
        let state = map.get(symbol)?;
        if state.book.stale {
            return None;
        }
        state.book.mid()
    }

    pub fn spread_bps(&self, symbol: &str) -> Option<f64> {
        let map = self.books.read();
        let state = map.get(symbol)?;
        if state.book.stale {
            return None;
        }
        state.book.spread_bps()
    }

    /// Consistent copy of the whole book (copy-on-read for detectors).
    /// `None` while stale.
    pub fn snapshot(&self, symbol: &str) -> Option<OrderBook> {
        let map = self.books.read();
        let state = map.get(symbol)?;
        if state.book.stale {
            return None;
        }
        Some(state.book.clone())
    }

    /// Cumulative depth aggregated into buckets of `bucket_ticks` ticks.
    pub fn depth_by_bucket(
        &self,
        symbol: &str,
        bucket_ticks: u32,
    ) -> Option<(Vec<DepthBucket>, Vec<DepthBucket>)> {
        let map = self.books.read();
        let state = map.get(symbol)?;
        if state.book.stale || state.tick_size <= 0.0 {
            return None;
        }
        let width = state.tick_size * bucket_ticks as f64;
        Some((
            bucketise(&state.book.bids, width),
            bucketise(&state.book.asks, width),
        ))
    }

    /// Resting notional (USD) within `bps` of the mid, both sides summed.
    pub fn depth_usd_within_bps(&self, symbol: &str, bps: f64) -> Option<f64> {
        let map = self.books.read();
        let state = map.get(symbol)?;
        if state.book.stale {
            return None;
        }
        let mid = state.book.mid()?;
        let band = mid * bps / 10_000.0;
        let mut usd = 0.0;
        for level in &state.book.bids {
            if mid - level.price > band {
                break;
            }
            usd += level.price * level.size;
        }
        for level in &state.book.asks {
            if level.price - mid > band {
                break;
            }
            usd += level.price * level.size;
        }
        Some(usd)
    }

    pub fn symbols(&self) -> Vec<String> {
        self.books.read().keys().cloned().collect()
    }
}

impl Default for OrderBookManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Insert, replace or remove a level keeping the ladder sorted.
fn apply_level(ladder: &mut Vec<BookLevel>, update: &BookUpdate, descending: bool) {
    let pos = ladder.iter().position(|l| l.price == update.price);
    match (pos, update.size > 0.0) {
        (Some(i), true) => ladder[i].size = update.size,
        (Some(i), false) => {
            ladder.remove(i);
        }
        (None, true) => {
            let idx = ladder
                .iter()
                .position(|l| {
                    if descending {
                        l.price < update.price
                    } else {
                        l.price > update.price
                    }
                })
                .unwrap_or(ladder.len());
            ladder.insert(
                idx,
                BookLevel {
                    price: update.price,
                    size: update.size,
                },
            );
        }
        (None, false) => {}
    }
}

fn bucketise(ladder: &[BookLevel], width: f64) -> Vec<DepthBucket> {
    let mut buckets: Vec<DepthBucket> = Vec::new();
    for level in ladder {
        let edge = (level.price / width).floor() * width;
        match buckets.iter_mut().find(|b| (b.price - edge).abs() < width / 2.0) {
            Some(bucket) => bucket.size += level.size,
            None => buckets.push(DepthBucket {
                price: edge,
                size: level.size,
            }),
        }
    }
    buckets
}

// ---------------------------------------------------------------------------
// Depth WebSocket feed
// ---------------------------------------------------------------------------

/// Connect to the partial-depth stream for one symbol and feed book updates
/// into `manager`.
///
/// Depth messages are correctness-critical: the engine wake-up uses a
/// bounded blocking send with a timeout, and blocking past the threshold
/// forces the book stale so nothing trades on silently old depth.
pub async fn run_depth_feed(
    symbol: &str,
    manager: &Arc<OrderBookManager>,
    events: &mpsc::Sender<MarketEvent>,
) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("wss://stream.binance.com:9443/ws/{lower}@depth20@100ms");
    info!(url = %url, symbol = %symbol, "connecting to depth WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to depth WebSocket")?;

    info!(symbol = %symbol, "depth WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_depth_message(&text) {
                        Ok((bids, asks, seq)) => {
                            let now_ms = chrono::Utc::now().timestamp_millis();
                            match manager.apply_snapshot(symbol, bids, asks, seq, now_ms) {
                                Ok(()) => {
                                    let event = MarketEvent::BookDelta {
                                        symbol: symbol.to_string(),
                                    };
                                    let sent = events
                                        .send_timeout(
                                            event,
                                            std::time::Duration::from_millis(
                                                DELTA_BLOCK_THRESHOLD_MS,
                                            ),
                                        )
                                        .await;
                                    if sent.is_err() {
                                        manager.mark_stale(symbol);
                                        let _ = events.try_send(MarketEvent::BookStale {
                                            symbol: symbol.to_string(),
                                        });
                                        warn!(
                                            symbol,
                                            "engine backpressure on depth — book forced stale"
                                        );
                                    }
                                }
                                Err(e) => {
                                    warn!(symbol, error = %e, "depth update rejected");
                                    let _ = events.try_send(MarketEvent::BookStale {
                                        symbol: symbol.to_string(),
                                    });
                                }
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to parse depth message");
                        }
                    }
                }
            }
            Some(Err(e)) => {
                error!(symbol = %symbol, error = %e, "depth WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol = %symbol, "depth WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse a partial-depth message into full ladders.
///
/// Expected shape:
/// ```json
/// { "lastUpdateId": 12345,
///   "bids": [["37000.00", "1.5"], ...],
///   "asks": [["37001.00", "1.2"], ...] }
/// ```
fn parse_depth_message(text: &str) -> Result<(Vec<BookLevel>, Vec<BookLevel>, u64)> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse depth JSON")?;

    let seq = root["lastUpdateId"]
        .as_u64()
        .context("missing field lastUpdateId")?;

    let parse_side = |name: &str| -> Result<Vec<BookLevel>> {
        root[name]
            .as_array()
            .with_context(|| format!("missing field {name}"))?
            .iter()
            .map(|entry| {
                let price: f64 = entry
                    .get(0)
                    .and_then(|v| v.as_str())
                    .context("missing price")?
                    .parse()
                    .context("bad price")?;
                let size: f64 = entry
                    .get(1)
                    .and_then(|v| v.as_str())
                    .context("missing size")?
                    .parse()
                    .context("bad size")?;
                Ok(BookLevel { price, size })
            })
            .collect()
    };

    Ok((parse_side("bids")?, parse_side("asks")?, seq))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
