// =============================================================================
// Density Detector — order-book walls and how fast they are being eaten
// =============================================================================
//
// A density is a price bucket whose resting size materially exceeds the
// local median. Each density remembers the size it was born with; the eaten
// ratio — how much of that original size has been consumed — only ever
// grows, even if the wall is later refilled.
//
// Event ordering within a single scan is fixed: Created, then Eaten, then
// Disappeared. Observers always see events after the book state that caused
// them, because the scan runs on a snapshot the caller already holds.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::market_data::{BookSide, OrderBook};
use crate::preset::DensityConfig;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A live density wall.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Density {
    pub symbol: String,
    /// Lower edge of the price bucket.
    pub price_bucket: f64,
    pub side: BookSide,
    pub initial_size: f64,
    pub current_size: f64,
    pub first_seen_ms: i64,
    /// (initial - current) / initial, clamped to [0, 1], monotone
    /// non-decreasing over the record's lifetime.
    pub eaten_ratio: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisappearReason {
    /// Size fell below the re-entry threshold.
    Consumed,
    /// The record outlived its TTL.
    Expired,
}

/// Emitted by a scan, in order: Created, Eaten, Disappeared.
#[derive(Debug, Clone)]
pub enum DensityEvent {
    Created(Density),
    /// Fired once, when the eaten ratio first reaches the entry threshold.
    Eaten(Density),
    Disappeared {
        symbol: String,
        price_bucket: f64,
        side: BookSide,
        reason: DisappearReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct DensityKey {
    bucket_idx: i64,
    side: BookSide,
}

struct DensityRecord {
    density: Density,
    eaten_fired: bool,
}

struct SymbolDensities {
    records: HashMap<DensityKey, DensityRecord>,
    last_scan_ms: i64,
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Tracks density walls per symbol from read-only book snapshots.
pub struct DensityDetector {
    cfg: DensityConfig,
    /// Eaten ratio at which the Eaten event fires (signal entry threshold).
    eat_event_ratio: f64,
    states: RwLock<HashMap<String, SymbolDensities>>,
}

impl DensityDetector {
    pub fn new(cfg: DensityConfig, eat_event_ratio: f64) -> Self {
        Self {
            cfg,
            eat_event_ratio,
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Scan a book snapshot. Throttled per symbol to the configured minimum
    /// interval; a throttled call returns no events.
    pub fn scan(&self, book: &OrderBook, tick_size: f64, now_ms: i64) -> Vec<DensityEvent> {
        if tick_size <= 0.0 {
            return Vec::new();
        }
        let width = tick_size * self.cfg.bucket_ticks as f64;

        let mut states = self.states.write();
        let state = states
            .entry(book.symbol.clone())
            .or_insert_with(|| SymbolDensities {
                records: HashMap::new(),
                last_scan_ms: 0,
            });

        if state.last_scan_ms != 0
            && now_ms - state.last_scan_ms < self.cfg.min_scan_interval_ms as i64
        {
            return Vec::new();
        }
        state.last_scan_ms = now_ms;

        let mut created = Vec::new();
        let mut eaten = Vec::new();
        let mut disappeared = Vec::new();

        for (side, ladder) in [(BookSide::Bid, &book.bids), (BookSide::Ask, &book.asks)] {
            let buckets = bucket_sizes(ladder, width);
            let present: HashMap<i64, f64> = buckets.iter().copied().collect();

            for (i, &(bucket_idx, size)) in buckets.iter().enumerate() {
                let median = local_median(&buckets, i, self.cfg.median_window);
                let key = DensityKey { bucket_idx, side };

                let qualifies = median > 0.0 && size >= self.cfg.k_density * median;

                match state.records.get_mut(&key) {
                    None if qualifies => {
                        let density = Density {
                            symbol: book.symbol.clone(),
                            price_bucket: bucket_idx as f64 * width,
                            side,
                            initial_size: size,
                            current_size: size,
                            first_seen_ms: now_ms,
                            eaten_ratio: 0.0,
                        };
                        debug!(
                            symbol = %book.symbol,
                            bucket = density.price_bucket,
                            side = %side,
                            size,
                            "density created"
                        );
                        state.records.insert(
                            key,
                            DensityRecord {
                                density: density.clone(),
                                eaten_fired: false,
                            },
                        );
                        created.push(DensityEvent::Created(density));
                    }
                    Some(record) => {
                        record.density.current_size = size;
                        let ratio = ((record.density.initial_size - size)
                            / record.density.initial_size)
                            .clamp(0.0, 1.0);
                        // Monotone: refills never shrink the eaten ratio.
                        if ratio > record.density.eaten_ratio {
                            record.density.eaten_ratio = ratio;
                        }
                        if !record.eaten_fired
                            && record.density.eaten_ratio >= self.eat_event_ratio
                        {
                            record.eaten_fired = true;
                            eaten.push(DensityEvent::Eaten(record.density.clone()));
                        }
                    }
                    None => {}
                }
            }

            // Buckets that vanished from the ladder are fully consumed.
            for (key, record) in state.records.iter_mut() {
                if key.side == side && !present.contains_key(&key.bucket_idx) {
                    record.density.current_size = 0.0;
                    record.density.eaten_ratio = 1.0;
                    if !record.eaten_fired {
                        record.eaten_fired = true;
                        eaten.push(DensityEvent::Eaten(record.density.clone()));
                    }
                }
            }
        }

        // Destruction pass: re-entry threshold or TTL.
        state.records.retain(|key, record| {
            let ttl_expired =
                now_ms - record.density.first_seen_ms >= (self.cfg.ttl_s as i64) * 1000;
            let consumed = record.density.current_size
                < self.cfg.reentry_ratio * record.density.initial_size;
            if ttl_expired || consumed {
                disappeared.push(DensityEvent::Disappeared {
                    symbol: record.density.symbol.clone(),
                    price_bucket: key.bucket_idx as f64 * width,
                    side: key.side,
                    reason: if consumed {
                        DisappearReason::Consumed
                    } else {
                        DisappearReason::Expired
                    },
                });
                false
            } else {
                true
            }
        });

        let mut events = created;
        events.extend(eaten);
        events.extend(disappeared);
        events
    }

    /// Current densities for a symbol.
    pub fn densities(&self, symbol: &str) -> Vec<Density> {
        self.states
            .read()
            .get(symbol)
            .map(|s| s.records.values().map(|r| r.density.clone()).collect())
            .unwrap_or_default()
    }

    /// Densities within `radius_bps` of `price`, optionally on one side.
    pub fn densities_near(
        &self,
        symbol: &str,
        price: f64,
        radius_bps: f64,
        side: Option<BookSide>,
    ) -> Vec<Density> {
        let radius = price.abs() * radius_bps / 10_000.0;
        self.densities(symbol)
            .into_iter()
            .filter(|d| side.map_or(true, |s| d.side == s))
            .filter(|d| (d.price_bucket - price).abs() <= radius)
            .collect()
    }

    /// Drop all records for a symbol (stale book, unsubscribed).
    pub fn clear_symbol(&self, symbol: &str) {
        self.states.write().remove(symbol);
    }
}

/// Aggregate ladder sizes into (bucket index, size) pairs, ladder order.
fn bucket_sizes(ladder: &[crate::market_data::BookLevel], width: f64) -> Vec<(i64, f64)> {
    let mut out: Vec<(i64, f64)> = Vec::new();
    for level in ladder {
        let idx = (level.price / width).floor() as i64;
        match out.iter_mut().find(|(i, _)| *i == idx) {
            Some((_, size)) => *size += level.size,
            None => out.push((idx, level.size)),
        }
    }
    out
}

/// Median bucket size over +-`window` neighbours of position `i`.
fn local_median(buckets: &[(i64, f64)], i: usize, window: usize) -> f64 {
    let lo = i.saturating_sub(window);
    let hi = (i + window + 1).min(buckets.len());
    let mut sizes: Vec<f64> = buckets[lo..hi].iter().map(|&(_, s)| s).collect();
    if sizes.is_empty() {
        return 0.0;
    }
    sizes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sizes.len() / 2;
    if sizes.len() % 2 == 0 {
        (sizes[mid - 1] + sizes[mid]) / 2.0
    } else {
        sizes[mid]
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::BookLevel;

    fn cfg() -> DensityConfig {
        DensityConfig {
            k_density: 3.0,
            bucket_ticks: 1,
            ttl_s: 900,
            median_window: 5,
            reentry_ratio: 0.1,
            min_scan_interval_ms: 0,
        }
    }

    fn book_with_ask_wall(wall_size: f64) -> OrderBook {
        // Uniform 1.0-size ladder with one oversized ask at 50010.
        let bids = (0..10)
            .map(|i| BookLevel {
                price: 50_000.0 - i as f64 * 10.0,
                size: 1.0,
            })
            .collect();
        let asks = (0..10)
            .map(|i| {
                let price = 50_010.0 + i as f64 * 10.0;
                BookLevel {
                    price,
                    size: if i == 0 { wall_size } else { 1.0 },
                }
            })
            .collect();
        OrderBook {
            symbol: "BTCUSDT".to_string(),
            bids,
            asks,
            seq: 1,
            timestamp_ms: 0,
            stale: false,
        }
    }

    #[test]
    fn wall_above_median_is_created() {
        let det = DensityDetector::new(cfg(), 0.75);
        let events = det.scan(&book_with_ask_wall(100.0), 10.0, 1_000);
        let created: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, DensityEvent::Created(_)))
            .collect();
        assert_eq!(created.len(), 1);
        let all = det.densities("BTCUSDT");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].side, BookSide::Ask);
        assert!((all[0].initial_size - 100.0).abs() < 1e-9);
    }

    #[test]
    fn eaten_ratio_is_monotone_and_fires_once() {
        let det = DensityDetector::new(cfg(), 0.75);
        det.scan(&book_with_ask_wall(100.0), 10.0, 1_000);

        // 80 of 100 eaten -> ratio 0.8 >= 0.75 -> Eaten fires.
        let events = det.scan(&book_with_ask_wall(20.0), 10.0, 2_000);
        assert!(events
            .iter()
            .any(|e| matches!(e, DensityEvent::Eaten(d) if (d.eaten_ratio - 0.8).abs() < 1e-9)));

        // Refill to 60: ratio must not decrease, no second Eaten.
        let events = det.scan(&book_with_ask_wall(60.0), 10.0, 3_000);
        assert!(!events.iter().any(|e| matches!(e, DensityEvent::Eaten(_))));
        let d = &det.densities("BTCUSDT")[0];
        assert!((d.eaten_ratio - 0.8).abs() < 1e-9);
    }

    #[test]
    fn consumed_wall_disappears() {
        let det = DensityDetector::new(cfg(), 0.75);
        det.scan(&book_with_ask_wall(100.0), 10.0, 1_000);
        // 5 remaining < reentry_ratio 0.1 * 100.
        let events = det.scan(&book_with_ask_wall(5.0), 10.0, 2_000);
        assert!(events.iter().any(|e| matches!(
            e,
            DensityEvent::Disappeared {
                reason: DisappearReason::Consumed,
                ..
            }
        )));
        assert!(det.densities("BTCUSDT").is_empty());
    }

    #[test]
    fn ttl_expiry_disappears() {
        let det = DensityDetector::new(cfg(), 0.75);
        det.scan(&book_with_ask_wall(100.0), 10.0, 1_000);
        let events = det.scan(&book_with_ask_wall(100.0), 10.0, 1_000 + 901_000);
        assert!(events.iter().any(|e| matches!(
            e,
            DensityEvent::Disappeared {
                reason: DisappearReason::Expired,
                ..
            }
        )));
    }

    #[test]
    fn event_order_is_created_eaten_disappeared() {
        let det = DensityDetector::new(cfg(), 0.5);
        det.scan(&book_with_ask_wall(100.0), 10.0, 1_000);

        // A second wall appears on the bid side while the ask wall is eaten
        // below the re-entry threshold: one scan yields Created + Eaten +
        // Disappeared, strictly in that order.
        let mut book = book_with_ask_wall(5.0);
        book.bids[3].size = 120.0;
        let events = det.scan(&book, 10.0, 2_000);

        let order: Vec<u8> = events
            .iter()
            .map(|e| match e {
                DensityEvent::Created(_) => 0,
                DensityEvent::Eaten(_) => 1,
                DensityEvent::Disappeared { .. } => 2,
            })
            .collect();
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(order, sorted);
        assert!(order.contains(&0) && order.contains(&1) && order.contains(&2));
    }

    #[test]
    fn throttled_scan_is_empty() {
        let mut config = cfg();
        config.min_scan_interval_ms = 1_000;
        let det = DensityDetector::new(config, 0.75);
        det.scan(&book_with_ask_wall(100.0), 10.0, 1_000);
        let events = det.scan(&book_with_ask_wall(20.0), 10.0, 1_500);
        assert!(events.is_empty());
    }

    #[test]
    fn densities_near_filters_by_radius_and_side() {
        let det = DensityDetector::new(cfg(), 0.75);
        det.scan(&book_with_ask_wall(100.0), 10.0, 1_000);
        let near = det.densities_near("BTCUSDT", 50_000.0, 10.0, Some(BookSide::Ask));
        assert_eq!(near.len(), 1);
        let far = det.densities_near("BTCUSDT", 50_000.0, 0.5, Some(BookSide::Ask));
        assert!(far.is_empty());
        let wrong_side = det.densities_near("BTCUSDT", 50_000.0, 10.0, Some(BookSide::Bid));
        assert!(wrong_side.is_empty());
    }
}
