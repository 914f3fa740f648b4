// =============================================================================
// Market data layer — candles, trades, order books
// =============================================================================
//
// Each feed task owns the write side of its aggregate (ring buffer, rolling
// window, book) and notifies the engine's control loop through a bounded
// event channel. The control loop never blocks a feed; feeds never touch
// trading state.
// =============================================================================

pub mod candle_buffer;
pub mod orderbook;
pub mod trades;

pub use candle_buffer::{atr, returns_correlation, Candle, CandleBuffer, CandleKey};
pub use orderbook::{BookLevel, BookSide, BookUpdate, DepthBucket, OrderBook, OrderBookManager};
pub use trades::{Trade, TradeMetrics, TradesAggregator};

/// Lightweight wake-up pushed to the engine when an aggregate changed.
/// The payload stays small: the data itself lives in the owning aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarketEvent {
    /// One or more trades were appended for the symbol.
    Trade { symbol: String },
    /// The order book for the symbol changed.
    BookDelta { symbol: String },
    /// The book dropped to stale (gap or crossed update) and needs a
    /// resnapshot before depth-dependent logic may run again.
    BookStale { symbol: String },
    /// A candle closed on the given interval.
    CandleClosed { symbol: String, interval: String },
    /// The trade stream for the symbol reconnected; a gap marker was set.
    StreamGap { symbol: String },
}

impl MarketEvent {
    pub fn symbol(&self) -> &str {
        match self {
            Self::Trade { symbol }
            | Self::BookDelta { symbol }
            | Self::BookStale { symbol }
            | Self::CandleClosed { symbol, .. }
            | Self::StreamGap { symbol } => symbol,
        }
    }
}
