// =============================================================================
// Level Detector — horizontal support/resistance from closed candles
// =============================================================================
//
// Pivots confirmed by `pivot_lookback` bars on each side become levels.
// Strength folds in touch count, age, round-number coincidence and cascade
// membership; overlapping levels merge into the stronger one. A level whose
// latest approach was near-vertical is flagged and excluded from retest
// entries until the slope flattens on a later detection pass.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::market_data::Candle;
use crate::preset::LevelsRules;
use crate::types::distance_bps;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LevelSide {
    Support,
    Resistance,
}

impl std::fmt::Display for LevelSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Support => write!(f, "support"),
            Self::Resistance => write!(f, "resistance"),
        }
    }
}

/// One horizontal level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Level {
    pub symbol: String,
    pub price: f64,
    pub side: LevelSide,
    /// Normalised strength in [0, 1].
    pub strength: f64,
    /// Bars since the pivot that created the level.
    pub age_bars: usize,
    pub touch_count: usize,
    pub is_round_number: bool,
    pub in_cascade: bool,
    /// Latest approach was near-vertical; retest entries skip this level.
    pub vertical_approach: bool,
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

pub struct LevelDetector {
    rules: LevelsRules,
}

impl LevelDetector {
    pub fn new(rules: LevelsRules) -> Self {
        Self { rules }
    }

    /// Build levels from closed candles, oldest first.
    pub fn detect(&self, symbol: &str, candles: &[Candle]) -> Vec<Level> {
        let lb = self.rules.pivot_lookback;
        if candles.len() < 2 * lb + 1 {
            return Vec::new();
        }

        let mut levels: Vec<Level> = Vec::new();

        for i in lb..candles.len() - lb {
            let high = candles[i].high;
            let low = candles[i].low;

            let pivot_high = (1..=lb)
                .all(|k| candles[i - k].high < high && candles[i + k].high < high);
            let pivot_low =
                (1..=lb).all(|k| candles[i - k].low > low && candles[i + k].low > low);

            if pivot_high {
                levels.push(self.build_level(symbol, high, LevelSide::Resistance, i, candles));
            }
            if pivot_low {
                levels.push(self.build_level(symbol, low, LevelSide::Support, i, candles));
            }
        }

        self.apply_cascades(&mut levels);
        let mut merged = self.merge(levels);
        for level in &mut merged {
            level.strength = level.strength.clamp(0.0, 1.0);
            level.vertical_approach = self.approach_is_vertical(level, candles);
        }
        merged.sort_by(|a, b| {
            a.price
                .partial_cmp(&b.price)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        merged
    }

    fn build_level(
        &self,
        symbol: &str,
        price: f64,
        side: LevelSide,
        pivot_idx: usize,
        candles: &[Candle],
    ) -> Level {
        let touch_count = candles
            .iter()
            .filter(|c| {
                let probe = match side {
                    LevelSide::Resistance => c.high,
                    LevelSide::Support => c.low,
                };
                distance_bps(probe, price) <= self.rules.touch_tolerance_bps
            })
            .count();

        let age_bars = candles.len() - 1 - pivot_idx;

        // Touches dominate, age credibility is capped.
        let mut strength = 0.25
            + 0.12 * (touch_count.min(5) as f64)
            + 0.004 * (age_bars.min(50) as f64);

        let (is_round, round_bonus) = self.round_number_bonus(price);
        strength *= 1.0 + round_bonus;

        Level {
            symbol: symbol.to_string(),
            price,
            side,
            strength,
            age_bars,
            touch_count,
            is_round_number: is_round,
            in_cascade: false,
            vertical_approach: false,
        }
    }

    /// 5-15 % bonus scaled by proximity to the nearest round step.
    fn round_number_bonus(&self, price: f64) -> (bool, f64) {
        for &step in &self.rules.round_step_candidates {
            if step <= 0.0 || price < step {
                continue;
            }
            let nearest = (price / step).round() * step;
            let dist = distance_bps(price, nearest);
            if dist <= self.rules.round_number_tol_bps {
                let proximity = 1.0 - dist / self.rules.round_number_tol_bps.max(f64::EPSILON);
                return (true, 0.05 + 0.10 * proximity);
            }
        }
        (false, 0.0)
    }

    /// Mark cascade members (clusters of levels within the cascade radius)
    /// and apply the +25 % bonus.
    fn apply_cascades(&self, levels: &mut [Level]) {
        let prices: Vec<f64> = levels.iter().map(|l| l.price).collect();
        for level in levels.iter_mut() {
            let neighbours = prices
                .iter()
                .filter(|&&p| distance_bps(p, level.price) <= self.rules.cascade_radius_bps)
                .count();
            if neighbours >= self.rules.cascade_min_levels {
                level.in_cascade = true;
                level.strength *= 1.25;
            }
        }
    }

    /// Collapse levels within the merge radius into the stronger one;
    /// equal strength prefers the older level.
    fn merge(&self, mut levels: Vec<Level>) -> Vec<Level> {
        levels.sort_by(|a, b| {
            a.price
                .partial_cmp(&b.price)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut merged: Vec<Level> = Vec::new();
        for level in levels {
            match merged.last_mut() {
                Some(last) if distance_bps(level.price, last.price) <= self.rules.merge_radius_bps => {
                    let replace = level.strength > last.strength
                        || ((level.strength - last.strength).abs() < 1e-9
                            && level.age_bars > last.age_bars);
                    if replace {
                        *last = level;
                    }
                }
                _ => merged.push(level),
            }
        }
        merged
    }

    /// Whether the latest approach to the level is near-vertical: the
    /// per-bar slope over the approach lookback exceeds the configured cap.
    fn approach_is_vertical(&self, level: &Level, candles: &[Candle]) -> bool {
        let lb = self.rules.approach_lookback;
        if candles.len() < lb + 1 {
            return false;
        }
        let last = candles[candles.len() - 1].close;
        let prior = candles[candles.len() - 1 - lb].close;
        if prior <= 0.0 {
            return false;
        }
        // Only an approach towards the level counts.
        let moving_towards = (last - prior).abs() > f64::EPSILON
            && ((level.price - prior).signum() == (last - prior).signum());
        if !moving_towards {
            return false;
        }
        let slope_pct_per_bar = ((last / prior - 1.0).abs() * 100.0) / lb as f64;
        slope_pct_per_bar >= self.rules.max_approach_slope_pct
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open,
            high,
            low,
            close,
            volume: 100.0,
            quote_volume: 10_000.0,
            trades_count: 50,
            is_closed: true,
        }
    }

    fn rules() -> LevelsRules {
        LevelsRules {
            pivot_lookback: 2,
            merge_radius_bps: 15.0,
            touch_tolerance_bps: 10.0,
            round_number_tol_bps: 5.0,
            round_step_candidates: vec![1_000.0, 100.0, 10.0],
            cascade_min_levels: 3,
            cascade_radius_bps: 40.0,
            max_approach_slope_pct: 1.0,
            approach_lookback: 4,
        }
    }

    /// Flat series with a single spike high at `peak` in the middle.
    fn spike_series(base: f64, peak: f64, len: usize) -> Vec<Candle> {
        (0..len)
            .map(|i| {
                if i == len / 2 {
                    candle(base, peak, base - 1.0, base)
                } else {
                    candle(base, base + 1.0, base - 1.0, base)
                }
            })
            .collect()
    }

    #[test]
    fn pivot_high_becomes_resistance() {
        let det = LevelDetector::new(rules());
        let candles = spike_series(100.0, 105.0, 11);
        let levels = det.detect("BTCUSDT", &candles);
        let res: Vec<_> = levels
            .iter()
            .filter(|l| l.side == LevelSide::Resistance)
            .collect();
        assert!(res.iter().any(|l| (l.price - 105.0).abs() < 1e-9));
    }

    #[test]
    fn too_little_history_yields_nothing() {
        let det = LevelDetector::new(rules());
        let candles = spike_series(100.0, 105.0, 4);
        assert!(det.detect("BTCUSDT", &candles).is_empty());
    }

    #[test]
    fn round_number_gets_bonus() {
        let det = LevelDetector::new(rules());
        // Two otherwise identical spikes: one at a round 1000 multiple.
        let round = det.detect("A", &spike_series(995.0, 1_000.0, 11));
        let plain = det.detect("B", &spike_series(995.2, 1_000.7, 11));

        let round_level = round
            .iter()
            .find(|l| l.side == LevelSide::Resistance && (l.price - 1_000.0).abs() < 1e-9)
            .unwrap();
        let plain_level = plain
            .iter()
            .find(|l| l.side == LevelSide::Resistance && (l.price - 1_000.7).abs() < 1e-9)
            .unwrap();

        assert!(round_level.is_round_number);
        assert!(!plain_level.is_round_number);
        assert!(round_level.strength > plain_level.strength);
    }

    #[test]
    fn nearby_levels_merge_keeping_stronger() {
        let det = LevelDetector::new(rules());
        // Two pivot highs 2 bps apart; the later one touches more often.
        let mut candles = Vec::new();
        for i in 0..30 {
            let c = match i {
                5 => candle(100.0, 101.0, 99.0, 100.0),
                15 | 20 | 25 => candle(100.0, 101.02, 99.0, 100.0),
                _ => candle(100.0, 100.5, 99.0, 100.0),
            };
            candles.push(c);
        }
        let levels = det.detect("BTCUSDT", &candles);
        let res: Vec<_> = levels
            .iter()
            .filter(|l| l.side == LevelSide::Resistance && l.price > 100.9)
            .collect();
        assert_eq!(res.len(), 1, "levels within merge radius must collapse");
    }

    #[test]
    fn cascade_bonus_applies_to_clusters() {
        let det = LevelDetector::new(rules());
        // Three distinct pivot highs within the 40 bps cascade radius.
        let mut candles = Vec::new();
        for i in 0..40 {
            let c = match i {
                5 => candle(100.0, 101.0, 99.0, 100.0),
                15 => candle(100.0, 101.25, 99.0, 100.0),
                25 => candle(100.0, 101.38, 99.0, 100.0),
                _ => candle(100.0, 100.2, 99.0, 100.0),
            };
            candles.push(c);
        }
        let levels = det.detect("BTCUSDT", &candles);
        assert!(levels
            .iter()
            .filter(|l| l.side == LevelSide::Resistance)
            .any(|l| l.in_cascade));
    }

    #[test]
    fn vertical_approach_is_flagged() {
        let det = LevelDetector::new(rules());
        // Pivot high early, then a steep run towards it at the end.
        let mut candles = Vec::new();
        for i in 0..20 {
            let c = match i {
                4 => candle(100.0, 106.0, 99.0, 100.0),
                16..=19 => {
                    let close = 100.0 + (i as f64 - 15.0) * 1.3;
                    candle(close - 1.0, close + 0.2, close - 1.2, close)
                }
                _ => candle(100.0, 100.5, 99.0, 100.0),
            };
            candles.push(c);
        }
        let levels = det.detect("BTCUSDT", &candles);
        let resistance = levels
            .iter()
            .find(|l| l.side == LevelSide::Resistance && (l.price - 106.0).abs() < 1e-9)
            .unwrap();
        assert!(resistance.vertical_approach);
    }

    #[test]
    fn strength_is_normalised() {
        let det = LevelDetector::new(rules());
        let levels = det.detect("BTCUSDT", &spike_series(100.0, 101.0, 60));
        for level in levels {
            assert!((0.0..=1.0).contains(&level.strength));
        }
    }
}
