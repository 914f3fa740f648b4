// =============================================================================
// Scanner — ranks the filtered universe by weighted, batch-z-scored features
// =============================================================================
//
// Features are z-scored across the current batch before weighting so that a
// quiet market and a frantic one produce comparable scores. Ties break by
// symbol ascending, which keeps the candidate list deterministic for a
// given input batch.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::activity_tracker::ActivityMetrics;
use crate::level_detector::Level;
use crate::market_filter::{FilterRejection, MarketFilter, SymbolSnapshot};
use crate::preset::ScannerConfig;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// Raw feature values for one symbol.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureBreakdown {
    /// Last hour's quote volume over the trailing average hour.
    pub vol_surge_1h: f64,
    /// 24h open-interest delta, when the venue provides it.
    pub oi_delta_24h: Option<f64>,
    /// 15m ATR as a percentage of price.
    pub atr15m_pct: f64,
    /// Taker buy-pressure measure from the trade windows.
    pub trades_pressure: f64,
    /// Inverse spread quality (tighter is better).
    pub spread_quality: f64,
    /// Strongest level the symbol currently carries.
    pub level_strength_max: f64,
}

/// One ranked scan result. Not persisted across cycles.
#[derive(Debug, Clone, Serialize)]
pub struct ScanCandidate {
    pub symbol: String,
    pub score: f64,
    pub features: FeatureBreakdown,
    pub levels: Vec<Level>,
    pub metrics: ActivityMetrics,
}

/// Per-symbol scan input assembled by the engine.
#[derive(Debug, Clone)]
pub struct ScannerInput {
    pub snapshot: SymbolSnapshot,
    pub features: FeatureBreakdown,
    pub levels: Vec<Level>,
    pub metrics: ActivityMetrics,
}

/// Result of one scan cycle: the short-list plus every rejection.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub candidates: Vec<ScanCandidate>,
    pub rejections: Vec<(String, FilterRejection)>,
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

pub struct Scanner {
    cfg: ScannerConfig,
}

impl Scanner {
    pub fn new(cfg: ScannerConfig) -> Self {
        Self { cfg }
    }

    /// Filter, score and rank a batch of symbols, returning the bounded
    /// top-K with full feature breakdowns.
    pub fn scan(&self, inputs: Vec<ScannerInput>, filter: &MarketFilter) -> ScanOutcome {
        let mut rejections = Vec::new();
        let mut survivors: Vec<ScannerInput> = Vec::new();

        for input in inputs {
            match filter.evaluate(&input.snapshot) {
                Ok(()) => survivors.push(input),
                Err(reason) => {
                    debug!(symbol = %input.snapshot.symbol, %reason, "scan rejection");
                    rejections.push((input.snapshot.symbol.clone(), reason));
                }
            }
        }

        if survivors.is_empty() {
            return ScanOutcome {
                candidates: Vec::new(),
                rejections,
            };
        }

        // Batch z-scoring, one column per feature.
        let col = |f: &dyn Fn(&FeatureBreakdown) -> f64| -> Vec<f64> {
            survivors.iter().map(|s| f(&s.features)).collect()
        };
        let vol_surge = zscores(&col(&|f| f.vol_surge_1h));
        let oi_delta = zscores(&col(&|f| f.oi_delta_24h.unwrap_or(0.0)));
        let atr_quality = zscores(&col(&|f| f.atr15m_pct));
        let trades_pressure = zscores(&col(&|f| f.trades_pressure));
        let spread_quality = zscores(&col(&|f| f.spread_quality));
        let level_strength = zscores(&col(&|f| f.level_strength_max));

        let w = &self.cfg.score_weights;
        let mut candidates: Vec<ScanCandidate> = survivors
            .into_iter()
            .enumerate()
            .map(|(i, input)| {
                // A symbol without OI data contributes nothing on that axis.
                let oi_term = if input.features.oi_delta_24h.is_some() {
                    w.oi_delta * oi_delta[i]
                } else {
                    0.0
                };
                let score = w.vol_surge * vol_surge[i]
                    + oi_term
                    + w.atr_quality * atr_quality[i]
                    + w.trades_pressure * trades_pressure[i]
                    + w.spread_quality * spread_quality[i]
                    + w.level_strength * level_strength[i];
                ScanCandidate {
                    symbol: input.snapshot.symbol.clone(),
                    score,
                    features: input.features,
                    levels: input.levels,
                    metrics: input.metrics,
                }
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });
        candidates.truncate(self.cfg.top_k);

        debug!(
            kept = candidates.len(),
            rejected = rejections.len(),
            "scan cycle complete"
        );

        ScanOutcome {
            candidates,
            rejections,
        }
    }
}

/// Column z-scores; a zero-variance column maps to all zeros.
fn zscores(values: &[f64]) -> Vec<f64> {
    let n = values.len() as f64;
    if n < 2.0 {
        return vec![0.0; values.len()];
    }
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    if var <= f64::EPSILON {
        return vec![0.0; values.len()];
    }
    let std = var.sqrt();
    values.iter().map(|v| (v - mean) / std).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preset::{LiquidityFilters, ScoreWeights};

    fn scanner(top_k: usize) -> Scanner {
        Scanner::new(ScannerConfig {
            score_weights: ScoreWeights {
                vol_surge: 1.0,
                oi_delta: 0.0,
                atr_quality: 0.0,
                trades_pressure: 0.0,
                spread_quality: 0.0,
                level_strength: 0.0,
            },
            top_k,
            scan_interval_s: 30,
        })
    }

    fn permissive_filter() -> MarketFilter {
        MarketFilter::new(
            LiquidityFilters {
                min_24h_volume_usd: 0.0,
                min_depth_usd: 0.0,
                max_spread_bps: 1_000.0,
                max_24h_range_pct: 1_000.0,
                min_atr_pct: 0.0,
            },
            1.0,
        )
    }

    fn input(symbol: &str, vol_surge: f64) -> ScannerInput {
        ScannerInput {
            snapshot: SymbolSnapshot {
                symbol: symbol.to_string(),
                volume_24h_usd: Some(1_000_000.0),
                depth_usd: Some(100_000.0),
                spread_bps: Some(1.0),
                range_24h_pct: Some(3.0),
                atr_pct: Some(0.5),
                btc_correlation: None,
            },
            features: FeatureBreakdown {
                vol_surge_1h: vol_surge,
                ..FeatureBreakdown::default()
            },
            levels: Vec::new(),
            metrics: ActivityMetrics {
                symbol: symbol.to_string(),
                tpm: 0.0,
                tps: 0.0,
                vol_delta: 0.0,
                index: 0.0,
                is_dropping: false,
            },
        }
    }

    #[test]
    fn ranks_by_weighted_zscore() {
        let outcome = scanner(10).scan(
            vec![input("AAAUSDT", 1.0), input("BBBUSDT", 3.0), input("CCCUSDT", 2.0)],
            &permissive_filter(),
        );
        let symbols: Vec<&str> = outcome
            .candidates
            .iter()
            .map(|c| c.symbol.as_str())
            .collect();
        assert_eq!(symbols, vec!["BBBUSDT", "CCCUSDT", "AAAUSDT"]);
    }

    #[test]
    fn top_k_bounds_the_list() {
        let outcome = scanner(1).scan(
            vec![input("AAAUSDT", 1.0), input("BBBUSDT", 3.0)],
            &permissive_filter(),
        );
        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(outcome.candidates[0].symbol, "BBBUSDT");
    }

    #[test]
    fn ties_break_by_symbol_ascending() {
        let outcome = scanner(10).scan(
            vec![input("ZZZUSDT", 2.0), input("AAAUSDT", 2.0)],
            &permissive_filter(),
        );
        let symbols: Vec<&str> = outcome
            .candidates
            .iter()
            .map(|c| c.symbol.as_str())
            .collect();
        assert_eq!(symbols, vec!["AAAUSDT", "ZZZUSDT"]);
    }

    #[test]
    fn filtered_symbols_land_in_rejections() {
        let strict = MarketFilter::new(
            LiquidityFilters {
                min_24h_volume_usd: 10_000_000.0,
                min_depth_usd: 0.0,
                max_spread_bps: 1_000.0,
                max_24h_range_pct: 1_000.0,
                min_atr_pct: 0.0,
            },
            1.0,
        );
        let outcome = scanner(10).scan(vec![input("AAAUSDT", 1.0)], &strict);
        assert!(outcome.candidates.is_empty());
        assert_eq!(outcome.rejections.len(), 1);
        assert_eq!(outcome.rejections[0].0, "AAAUSDT");
    }
}
