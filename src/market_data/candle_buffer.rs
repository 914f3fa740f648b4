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

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single OHLCV candle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub trades_count: u64,
    pub is_closed: bool,
}

impl Candle {
    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    /// Upper + lower wick as a fraction of the full range.
    pub fn wick_ratio(&self) -> f64 {
        let range = self.range();
        if range <= f64::EPSILON {
            return 0.0;
        }
        let body = (self.close - self.open).abs();
        ((range - body) / range).clamp(0.0, 1.0)
    }
}

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub interval: String,
}

impl CandleKey {
    pub fn new(symbol: impl Into<String>, interval: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            interval: interval.into(),
        }
    }
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

// ---------------------------------------------------------------------------
// CandleBuffer -- thread-safe ring buffer per (symbol, interval)
// ---------------------------------------------------------------------------

/// Ring buffer holding the most recent candles per `(symbol, interval)`.
/// The live (unclosed) candle is updated in place and kept separate from the
/// closed history that indicators consume.
pub struct CandleBuffer {
    buffers: RwLock<HashMap<CandleKey, VecDeque<Candle>>>,
    max_candles: usize,
}

impl CandleBuffer {
    pub fn new(max_candles: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            max_candles,
        }
    }

    /// Insert or replace the latest candle for the given key.
    ///
    /// A closed candle replaces its own in-progress version and trims the
    /// ring; an open candle replaces the previous open candle in place.
    pub fn update(&self, key: CandleKey, candle: Candle) {
        let mut map = self.buffers.write();
        let ring = map
            .entry(key)
            .or_insert_with(|| VecDeque::with_capacity(self.max_candles + 1));

        if let Some(last) = ring.back() {
            if !last.is_closed && last.open_time == candle.open_time {
                ring.pop_back();
            }
        }
        ring.push_back(candle);
        while ring.len() > self.max_candles {
            ring.pop_front();
        }
    }

    /// The most recent `count` **closed** candles, oldest first.
    pub fn closed(&self, key: &CandleKey, count: usize) -> Vec<Candle> {
        let map = self.buffers.read();
        match map.get(key) {
            Some(ring) => {
                let closed: Vec<&Candle> = ring.iter().filter(|c| c.is_closed).collect();
                let start = closed.len().saturating_sub(count);
                closed[start..].iter().map(|c| (*c).clone()).collect()
            }
            None => Vec::new(),
        }
    }

    /// Close price of the most recent closed candle, if any.
    pub fn last_close(&self, key: &CandleKey) -> Option<f64> {
        let map = self.buffers.read();
        map.get(key)
            .and_then(|ring| ring.iter().rev().find(|c| c.is_closed).map(|c| c.close))
    }

    pub fn count(&self, key: &CandleKey) -> usize {
        let map = self.buffers.read();
        map.get(key).map_or(0, VecDeque::len)
    }
}

// ---------------------------------------------------------------------------
// Indicators over closed candles
// ---------------------------------------------------------------------------

/// Average true range over the last `period` closed candles. `None` until
/// `period + 1` candles are available.
pub fn atr(candles: &[Candle], period: usize) -> Option<f64> {
    if candles.len() < period + 1 || period == 0 {
        return None;
    }
    let slice = &candles[candles.len() - period - 1..];
    let mut sum = 0.0;
    for i in 1..slice.len() {
        let tr = (slice[i].high - slice[i].low)
            .max((slice[i].high - slice[i - 1].close).abs())
            .max((slice[i].low - slice[i - 1].close).abs());
        sum += tr;
    }
    Some(sum / period as f64)
}

/// Pearson correlation of close-to-close returns of two aligned series.
pub fn returns_correlation(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n < 3 {
        return None;
    }
    let ra: Vec<f64> = a[a.len() - n..]
        .windows(2)
        .map(|w| if w[0] != 0.0 { w[1] / w[0] - 1.0 } else { 0.0 })
        .collect();
    let rb: Vec<f64> = b[b.len() - n..]
        .windows(2)
        .map(|w| if w[0] != 0.0 { w[1] / w[0] - 1.0 } else { 0.0 })
        .collect();

    let m = ra.len() as f64;
    let mean_a = ra.iter().sum::<f64>() / m;
    let mean_b = rb.iter().sum::<f64>() / m;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..ra.len() {
        let da = ra[i] - mean_a;
        let db = rb[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a <= f64::EPSILON || var_b <= f64::EPSILON {
        return None;
    }
    Some(cov / (var_a.sqrt() * var_b.sqrt()))
}

// ---------------------------------------------------------------------------
// Kline WebSocket feed
// ---------------------------------------------------------------------------

/// Connect to the exchange kline stream for one (symbol, interval) pair and
/// feed candles into `buffer`, waking the engine on every candle close.
///
/// Runs until the stream disconnects or errors, then returns so the caller
/// can handle reconnection.
pub async fn run_kline_feed(
    symbol: &str,
    interval: &str,
    buffer: &Arc<CandleBuffer>,
    events: &mpsc::Sender<MarketEvent>,
) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("wss://stream.binance.com:9443/ws/{lower}@kline_{interval}");
    info!(url = %url, symbol = %symbol, interval = %interval, "connecting to kline WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to kline WebSocket")?;

    info!(symbol = %symbol, interval = %interval, "kline WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_kline_message(&text) {
                        Ok((key, candle)) => {
                            let closed = candle.is_closed;
                            debug!(key = %key, close = candle.close, closed, "candle update");
                            buffer.update(key.clone(), candle);
                            if closed {
                                // Candle closes are infrequent and cheap to
                                // drop only when the engine is far behind.
                                let _ = events.try_send(MarketEvent::CandleClosed {
                                    symbol: key.symbol,
                                    interval: key.interval,
                                });
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to parse kline message");
                        }
                    }
                }
            }
            Some(Err(e)) => {
                error!(error = %e, "kline WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol = %symbol, interval = %interval, "kline WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse a kline message (single-stream payload or combined-stream envelope).
fn parse_kline_message(text: &str) -> Result<(CandleKey, Candle)> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse kline JSON")?;

    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    let symbol = data["s"]
        .as_str()
        .context("missing field s")?
        .to_uppercase();

    let k = &data["k"];
    let interval = k["i"].as_str().context("missing field k.i")?.to_string();

    let candle = Candle {
        open_time: k["t"].as_i64().context("missing field k.t")?,
        close_time: k["T"].as_i64().context("missing field k.T")?,
        open: parse_string_f64(&k["o"], "k.o")?,
        high: parse_string_f64(&k["h"], "k.h")?,
        low: parse_string_f64(&k["l"], "k.l")?,
        close: parse_string_f64(&k["c"], "k.c")?,
        volume: parse_string_f64(&k["v"], "k.v")?,
        quote_volume: parse_string_f64(&k["q"], "k.q")?,
        trades_count: k["n"].as_u64().context("missing field k.n")?,
        is_closed: k["x"].as_bool().context("missing field k.x")?,
    };

    Ok((CandleKey { symbol, interval }, candle))
}

/// Exchange kline payloads carry numeric values as JSON strings.
fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_candle(open_time: i64, close: f64, is_closed: bool) -> Candle {
        Candle {
            open_time,
            close_time: open_time + 299_999,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100.0,
            quote_volume: 200.0,
            trades_count: 50,
            is_closed,
        }
    }

    fn make_key(sym: &str, iv: &str) -> CandleKey {
        CandleKey::new(sym, iv)
    }

    #[test]
    fn ring_buffer_trimming() {
        let buf = CandleBuffer::new(3);
        let key = make_key("BTCUSDT", "5m");

        for i in 0..5 {
            buf.update(
                key.clone(),
                sample_candle(i * 300_000, 100.0 + i as f64, true),
            );
        }

        assert_eq!(buf.count(&key), 3);
        let closes: Vec<f64> = buf.closed(&key, 10).iter().map(|c| c.close).collect();
        assert_eq!(closes, vec![102.0, 103.0, 104.0]);
    }

    #[test]
    fn in_progress_replacement() {
        let buf = CandleBuffer::new(10);
        let key = make_key("ETHUSDT", "5m");

        buf.update(key.clone(), sample_candle(0, 50.0, false));
        buf.update(key.clone(), sample_candle(0, 51.0, false));
        assert_eq!(buf.count(&key), 1);

        buf.update(key.clone(), sample_candle(0, 52.0, true));
        assert_eq!(buf.count(&key), 1);
        assert_eq!(buf.last_close(&key), Some(52.0));
    }

    #[test]
    fn closed_filters_out_in_progress() {
        let buf = CandleBuffer::new(10);
        let key = make_key("BTCUSDT", "5m");

        buf.update(key.clone(), sample_candle(0, 100.0, true));
        buf.update(key.clone(), sample_candle(300_000, 101.0, true));
        buf.update(key.clone(), sample_candle(600_000, 102.0, false));

        assert_eq!(buf.closed(&key, 10).len(), 2);
        assert_eq!(buf.last_close(&key), Some(101.0));
    }

    #[test]
    fn atr_requires_enough_history() {
        let candles: Vec<Candle> = (0..10)
            .map(|i| sample_candle(i * 300_000, 100.0, true))
            .collect();
        assert!(atr(&candles, 14).is_none());
        let val = atr(&candles, 5).unwrap();
        assert!((val - 2.0).abs() < 1e-9);
    }

    #[test]
    fn correlation_of_identical_series_is_one() {
        let a = vec![100.0, 101.0, 99.5, 102.0, 103.0, 101.5];
        let corr = returns_correlation(&a, &a).unwrap();
        assert!((corr - 1.0).abs() < 1e-9);
    }

    #[test]
    fn parse_kline_message_ok() {
        let json = r#"{
            "e": "kline",
            "s": "BTCUSDT",
            "k": {
                "t": 1700000000000,
                "T": 1700000299999,
                "i": "5m",
                "o": "37000.00",
                "h": "37050.00",
                "l": "36990.00",
                "c": "37020.00",
                "v": "123.456",
                "q": "4567890.12",
                "n": 1500,
                "x": true
            }
        }"#;
        let (key, candle) = parse_kline_message(json).expect("should parse");
        assert_eq!(key.symbol, "BTCUSDT");
        assert_eq!(key.interval, "5m");
        assert!((candle.close - 37020.0).abs() < f64::EPSILON);
        assert!(candle.is_closed);
    }
}
