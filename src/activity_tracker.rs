// =============================================================================
// Activity Tracker — z-scored composite of trade-flow intensity
// =============================================================================
//
// Holds a rolling mean/variance of TPM, TPS and |vol delta| per symbol and
// exposes a composite index: the sum of the three z-scores, clamped to
// [-10, +10]. When the index falls sharply from its recent maximum the
// tracker latches `is_dropping`; the latch clears after a cooldown.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::preset::ActivityConfig;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// Snapshot of one symbol's activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityMetrics {
    pub symbol: String,
    pub tpm: f64,
    pub tps: f64,
    pub vol_delta: f64,
    /// z(tpm) + z(tps) + z(|vol_delta|), clamped to [-10, +10].
    pub index: f64,
    pub is_dropping: bool,
}

impl ActivityMetrics {
    fn empty(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            tpm: 0.0,
            tps: 0.0,
            vol_delta: 0.0,
            index: 0.0,
            is_dropping: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    timestamp_ms: i64,
    tpm: f64,
    tps: f64,
    abs_delta: f64,
}

struct ActivityState {
    samples: VecDeque<Sample>,
    /// Recent index values, newest last, bounded by the drop window.
    index_history: VecDeque<f64>,
    latched_at_ms: Option<i64>,
    last: ActivityMetrics,
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

pub struct ActivityTracker {
    cfg: ActivityConfig,
    states: RwLock<HashMap<String, ActivityState>>,
}

impl ActivityTracker {
    pub fn new(cfg: ActivityConfig) -> Self {
        Self {
            cfg,
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Feed a fresh (tpm, tps, vol_delta) observation and recompute the
    /// index and the drop latch.
    pub fn refresh(
        &self,
        symbol: &str,
        tpm: f64,
        tps: f64,
        vol_delta: f64,
        now_ms: i64,
    ) -> ActivityMetrics {
        let mut states = self.states.write();
        let state = states
            .entry(symbol.to_string())
            .or_insert_with(|| ActivityState {
                samples: VecDeque::new(),
                index_history: VecDeque::new(),
                latched_at_ms: None,
                last: ActivityMetrics::empty(symbol),
            });

        state.samples.push_back(Sample {
            timestamp_ms: now_ms,
            tpm,
            tps,
            abs_delta: vol_delta.abs(),
        });
        let horizon = now_ms - (self.cfg.window_s as i64) * 1000;
        while let Some(front) = state.samples.front() {
            if front.timestamp_ms < horizon {
                state.samples.pop_front();
            } else {
                break;
            }
        }

        let index = if state.samples.len() < 2 {
            0.0
        } else {
            let z_tpm = zscore(state.samples.iter().map(|s| s.tpm), tpm);
            let z_tps = zscore(state.samples.iter().map(|s| s.tps), tps);
            let z_delta = zscore(state.samples.iter().map(|s| s.abs_delta), vol_delta.abs());
            (z_tpm + z_tps + z_delta).clamp(-10.0, 10.0)
        };

        state.index_history.push_back(index);
        while state.index_history.len() > self.cfg.drop_window_bars {
            state.index_history.pop_front();
        }

        // Latch maintenance: clear after the cooldown, then re-evaluate.
        if let Some(latched_at) = state.latched_at_ms {
            if now_ms - latched_at >= (self.cfg.cooldown_s as i64) * 1000 {
                state.latched_at_ms = None;
                debug!(symbol, "activity drop latch cleared");
            }
        }

        if state.latched_at_ms.is_none() {
            let recent_max = state
                .index_history
                .iter()
                .copied()
                .fold(f64::NEG_INFINITY, f64::max);
            if recent_max > 0.0 && (recent_max - index) >= self.cfg.drop_threshold * recent_max {
                state.latched_at_ms = Some(now_ms);
                debug!(
                    symbol,
                    index,
                    recent_max,
                    threshold = self.cfg.drop_threshold,
                    "activity drop latched"
                );
            }
        }

        let metrics = ActivityMetrics {
            symbol: symbol.to_string(),
            tpm,
            tps,
            vol_delta,
            index,
            is_dropping: state.latched_at_ms.is_some(),
        };
        state.last = metrics.clone();
        metrics
    }

    /// Last computed metrics; the empty shape for unknown symbols.
    pub fn metrics(&self, symbol: &str) -> ActivityMetrics {
        self.states
            .read()
            .get(symbol)
            .map(|s| s.last.clone())
            .unwrap_or_else(|| ActivityMetrics::empty(symbol))
    }

    pub fn is_dropping(&self, symbol: &str) -> bool {
        self.states
            .read()
            .get(symbol)
            .map_or(false, |s| s.latched_at_ms.is_some())
    }

    /// Mean TPM over the rolling sample window.
    pub fn tpm_mean(&self, symbol: &str) -> f64 {
        let states = self.states.read();
        let Some(state) = states.get(symbol) else {
            return 0.0;
        };
        if state.samples.is_empty() {
            return 0.0;
        }
        state.samples.iter().map(|s| s.tpm).sum::<f64>() / state.samples.len() as f64
    }
}

/// z-score of `value` against the sample iterator; 0 when variance is ~0.
fn zscore(samples: impl Iterator<Item = f64>, value: f64) -> f64 {
    let values: Vec<f64> = samples.collect();
    let n = values.len() as f64;
    if n < 2.0 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    if var <= f64::EPSILON {
        return 0.0;
    }
    (value - mean) / var.sqrt()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ActivityConfig {
        ActivityConfig {
            window_s: 300,
            drop_threshold: 0.4,
            drop_window_bars: 10,
            cooldown_s: 60,
        }
    }

    #[test]
    fn empty_window_yields_zero_index() {
        let tracker = ActivityTracker::new(cfg());
        let m = tracker.metrics("BTCUSDT");
        assert_eq!(m.index, 0.0);
        assert!(!m.is_dropping);

        // A single sample has no variance yet.
        let m = tracker.refresh("BTCUSDT", 10.0, 0.2, 5.0, 1_000);
        assert_eq!(m.index, 0.0);
        assert!(!m.is_dropping);
    }

    #[test]
    fn surge_produces_positive_index() {
        let tracker = ActivityTracker::new(cfg());
        for i in 0..10 {
            tracker.refresh("BTCUSDT", 10.0 + (i % 2) as f64, 0.2, 5.0, 1_000 + i * 1000);
        }
        let m = tracker.refresh("BTCUSDT", 40.0, 0.8, 30.0, 12_000);
        assert!(m.index > 1.0, "index {} should be positive", m.index);
        assert!(m.index <= 10.0);
    }

    #[test]
    fn sharp_fall_latches_drop_and_cooldown_clears() {
        let tracker = ActivityTracker::new(cfg());
        for i in 0..8 {
            tracker.refresh("BTCUSDT", 10.0 + (i % 2) as f64, 0.2, 5.0, 1_000 + i * 1000);
        }
        // Spike pushes the index (and the recent max) up.
        let spike = tracker.refresh("BTCUSDT", 50.0, 1.0, 40.0, 9_500);
        assert!(spike.index > 0.0);

        // Collapse: index falls far below the recent max -> latch.
        let crash = tracker.refresh("BTCUSDT", 1.0, 0.01, 0.1, 10_500);
        assert!(crash.is_dropping);
        assert!(tracker.is_dropping("BTCUSDT"));

        // Still latched inside the cooldown; the spike ages out of the
        // index history while we wait.
        for i in 0..12 {
            let inside = tracker.refresh("BTCUSDT", 1.0, 0.01, 0.1, 20_000 + i * 1000);
            assert!(inside.is_dropping);
        }

        // Cooldown elapsed and the recent max has decayed: latch clears.
        let after = tracker.refresh("BTCUSDT", 1.0, 0.01, 0.1, 75_000);
        assert!(!after.is_dropping);
    }

    #[test]
    fn index_is_clamped() {
        let tracker = ActivityTracker::new(cfg());
        for i in 0..20 {
            tracker.refresh("BTCUSDT", 1.0 + (i % 2) as f64 * 0.01, 0.02, 0.5, 1_000 + i * 1000);
        }
        let m = tracker.refresh("BTCUSDT", 1_000_000.0, 20_000.0, 900_000.0, 25_000);
        assert!(m.index <= 10.0);
    }

    #[test]
    fn tpm_mean_tracks_samples() {
        let tracker = ActivityTracker::new(cfg());
        tracker.refresh("BTCUSDT", 10.0, 0.2, 0.0, 1_000);
        tracker.refresh("BTCUSDT", 20.0, 0.3, 0.0, 2_000);
        assert!((tracker.tpm_mean("BTCUSDT") - 15.0).abs() < 1e-9);
        assert_eq!(tracker.tpm_mean("NOPE"), 0.0);
    }
}
