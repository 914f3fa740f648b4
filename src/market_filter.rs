// =============================================================================
// Market Filter — liquidity, volatility and correlation gates
// =============================================================================
//
// Every symbol entering a scan passes through this gate chain. The first
// failing gate rejects the symbol with a typed reason code that flows into
// telemetry, so a rejected symbol is always explainable after the fact.
// =============================================================================

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::preset::LiquidityFilters;

/// Why a symbol was rejected from the scan universe.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
pub enum FilterRejection {
    #[error("24h volume {volume:.0} below minimum {min:.0}")]
    LowVolume { volume: f64, min: f64 },

    #[error("book depth {depth:.0} USD below minimum {min:.0}")]
    ThinBook { depth: f64, min: f64 },

    #[error("spread {spread_bps:.2} bps above maximum {max_bps:.2}")]
    WideSpread { spread_bps: f64, max_bps: f64 },

    #[error("24h range {range_pct:.2}% above maximum {max_pct:.2}%")]
    ExcessiveRange { range_pct: f64, max_pct: f64 },

    #[error("atr {atr_pct:.3}% below minimum {min_pct:.3}% (flat market)")]
    FlatVolatility { atr_pct: f64, min_pct: f64 },

    #[error("btc correlation {corr:.2} above cap {cap:.2}")]
    BtcCorrelation { corr: f64, cap: f64 },

    #[error("missing market data: {field}")]
    MissingData { field: String },
}

/// Per-symbol inputs to the gate chain. `None` means the datum is not
/// available this cycle.
#[derive(Debug, Clone, Default)]
pub struct SymbolSnapshot {
    pub symbol: String,
    pub volume_24h_usd: Option<f64>,
    pub depth_usd: Option<f64>,
    pub spread_bps: Option<f64>,
    pub range_24h_pct: Option<f64>,
    pub atr_pct: Option<f64>,
    pub btc_correlation: Option<f64>,
}

pub struct MarketFilter {
    liquidity: LiquidityFilters,
    btc_correlation_cap: f64,
}

impl MarketFilter {
    pub fn new(liquidity: LiquidityFilters, btc_correlation_cap: f64) -> Self {
        Self {
            liquidity,
            btc_correlation_cap,
        }
    }

    /// Run all gates. The first failure wins.
    pub fn evaluate(&self, snap: &SymbolSnapshot) -> Result<(), FilterRejection> {
        let missing = |field: &str| FilterRejection::MissingData {
            field: field.to_string(),
        };

        // 1. 24h volume
        let volume = snap.volume_24h_usd.ok_or_else(|| missing("volume_24h_usd"))?;
        if volume < self.liquidity.min_24h_volume_usd {
            return Err(FilterRejection::LowVolume {
                volume,
                min: self.liquidity.min_24h_volume_usd,
            });
        }

        // 2. Book depth near the spread
        let depth = snap.depth_usd.ok_or_else(|| missing("depth_usd"))?;
        if depth < self.liquidity.min_depth_usd {
            return Err(FilterRejection::ThinBook {
                depth,
                min: self.liquidity.min_depth_usd,
            });
        }

        // 3. Spread
        let spread_bps = snap.spread_bps.ok_or_else(|| missing("spread_bps"))?;
        if spread_bps > self.liquidity.max_spread_bps {
            return Err(FilterRejection::WideSpread {
                spread_bps,
                max_bps: self.liquidity.max_spread_bps,
            });
        }

        // 4. 24h range cap
        if let Some(range_pct) = snap.range_24h_pct {
            if range_pct > self.liquidity.max_24h_range_pct {
                return Err(FilterRejection::ExcessiveRange {
                    range_pct,
                    max_pct: self.liquidity.max_24h_range_pct,
                });
            }
        }

        // 5. ATR floor (flat market)
        if let Some(atr_pct) = snap.atr_pct {
            if atr_pct < self.liquidity.min_atr_pct {
                return Err(FilterRejection::FlatVolatility {
                    atr_pct,
                    min_pct: self.liquidity.min_atr_pct,
                });
            }
        }

        // 6. BTC correlation cap. Missing correlation passes: BTC itself
        // and freshly listed symbols have no series to correlate.
        if let Some(corr) = snap.btc_correlation {
            if corr.abs() > self.btc_correlation_cap {
                return Err(FilterRejection::BtcCorrelation {
                    corr,
                    cap: self.btc_correlation_cap,
                });
            }
        }

        debug!(symbol = %snap.symbol, "market filter passed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> MarketFilter {
        MarketFilter::new(
            LiquidityFilters {
                min_24h_volume_usd: 1_000_000.0,
                min_depth_usd: 10_000.0,
                max_spread_bps: 5.0,
                max_24h_range_pct: 20.0,
                min_atr_pct: 0.1,
            },
            0.8,
        )
    }

    fn healthy() -> SymbolSnapshot {
        SymbolSnapshot {
            symbol: "SOLUSDT".to_string(),
            volume_24h_usd: Some(50_000_000.0),
            depth_usd: Some(100_000.0),
            spread_bps: Some(1.5),
            range_24h_pct: Some(4.0),
            atr_pct: Some(0.4),
            btc_correlation: Some(0.3),
        }
    }

    #[test]
    fn healthy_symbol_passes() {
        assert!(filter().evaluate(&healthy()).is_ok());
    }

    #[test]
    fn each_gate_rejects_with_its_reason() {
        let f = filter();

        let mut s = healthy();
        s.volume_24h_usd = Some(10.0);
        assert!(matches!(
            f.evaluate(&s),
            Err(FilterRejection::LowVolume { .. })
        ));

        let mut s = healthy();
        s.depth_usd = Some(100.0);
        assert!(matches!(
            f.evaluate(&s),
            Err(FilterRejection::ThinBook { .. })
        ));

        let mut s = healthy();
        s.spread_bps = Some(9.0);
        assert!(matches!(
            f.evaluate(&s),
            Err(FilterRejection::WideSpread { .. })
        ));

        let mut s = healthy();
        s.range_24h_pct = Some(35.0);
        assert!(matches!(
            f.evaluate(&s),
            Err(FilterRejection::ExcessiveRange { .. })
        ));

        let mut s = healthy();
        s.atr_pct = Some(0.01);
        assert!(matches!(
            f.evaluate(&s),
            Err(FilterRejection::FlatVolatility { .. })
        ));

        let mut s = healthy();
        s.btc_correlation = Some(-0.95);
        assert!(matches!(
            f.evaluate(&s),
            Err(FilterRejection::BtcCorrelation { .. })
        ));
    }

    #[test]
    fn missing_mandatory_data_rejects() {
        let f = filter();
        let mut s = healthy();
        s.spread_bps = None;
        assert!(matches!(
            f.evaluate(&s),
            Err(FilterRejection::MissingData { .. })
        ));
    }

    #[test]
    fn missing_correlation_passes() {
        let f = filter();
        let mut s = healthy();
        s.btc_correlation = None;
        assert!(f.evaluate(&s).is_ok());
    }
}
