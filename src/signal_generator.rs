// =============================================================================
// Signal Generator — momentum and retest entries with microstructure gating
// =============================================================================
//
// For every candidate level the generator tries two strategies:
//
//   Momentum — price closed beyond the level and either a density wall on
//   the breakout side has been eaten past the threshold or the breakout bar
//   carries confirming volume (both, under strict confirmation).
//
//   Retest — a previously recorded momentum break is revisited within the
//   retest band with live tape (TPM on touch) and no activity drop.
//
// A signal is emitted at most once per (symbol, level, side) within the
// cooldown window, and never against existing exposure on that side.
// =============================================================================

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::activity_tracker::ActivityMetrics;
use crate::density_detector::Density;
use crate::level_detector::{Level, LevelSide};
use crate::market_data::{BookSide, Candle};
use crate::preset::SignalConfig;
use crate::scanner::ScanCandidate;
use crate::types::{bps_to_frac, distance_bps, Side};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// Strategy-specific parameters carried on the signal (tagged variant).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum SignalKind {
    Momentum {
        /// Distance of the confirming close beyond the level.
        break_bps: f64,
        /// Best eaten ratio among densities on the breakout side, if any.
        density_eaten: Option<f64>,
        /// Breakout volume over average volume.
        volume_ratio: f64,
    },
    Retest {
        /// Distance of price from the level at emission.
        band_bps: f64,
        /// TPM on touch over the rolling TPM mean.
        touch_tpm_ratio: f64,
    },
}

impl SignalKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Momentum { .. } => "momentum",
            Self::Retest { .. } => "retest",
        }
    }
}

/// How the entry order is routed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum EntryKind {
    Market,
    Limit { price: f64 },
}

/// A fully gated trade signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub kind: SignalKind,
    pub level: Level,
    pub entry: EntryKind,
    /// Reference entry price used for sizing (limit price or last price).
    pub entry_price: f64,
    pub stop_price: f64,
    pub confidence: f64,
    pub created_ms: i64,
}

/// Why a (symbol, level, side) produced no signal this cycle.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SignalRejection {
    #[error("no_break")]
    NoBreak,
    #[error("unconfirmed")]
    Unconfirmed,
    #[error("market_quality: {0}")]
    MarketQuality(String),
    #[error("too_far_from_level")]
    TooFarFromLevel,
    #[error("false_start")]
    FalseStart,
    #[error("session_edge")]
    SessionEdge,
    #[error("vertical_approach")]
    VerticalApproach,
    #[error("activity_dropping")]
    ActivityDropping,
    #[error("thin_touch_tape")]
    ThinTouchTape,
    #[error("cooldown")]
    Cooldown,
    #[error("existing_exposure")]
    ExistingExposure,
    #[error("data_stale")]
    DataStale,
    #[error("low_confidence: {confidence:.2} < {min:.2}")]
    LowConfidence { confidence: f64, min: f64 },
}

/// A rejection note for the audit trail.
#[derive(Debug, Clone)]
pub struct RejectionNote {
    pub symbol: String,
    pub level_price: f64,
    pub strategy: &'static str,
    pub reason: SignalRejection,
}

/// Everything the generator needs from the rest of the engine for one
/// candidate evaluation.
pub struct SignalContext<'a> {
    /// Closed candles on the working timeframe, oldest first.
    pub candles: &'a [Candle],
    pub last_price: f64,
    pub densities: &'a [Density],
    pub activity: &'a ActivityMetrics,
    /// Rolling TPM at evaluation time and its window mean.
    pub tpm_now: f64,
    pub tpm_mean: f64,
    /// Average volume of the bars preceding the breakout bar.
    pub avg_volume: f64,
    /// Book and trade streams are trustworthy for this symbol.
    pub data_fresh: bool,
    /// (symbol, side) pairs with an open position, open order or pending
    /// signal.
    pub open_exposure: &'a HashSet<(String, Side)>,
    pub now_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct LevelKey {
    /// Level price in 1e-8 units.
    price_e8: i64,
    side: Side,
}

fn level_key(price: f64, side: Side) -> LevelKey {
    LevelKey {
        price_e8: (price * 1e8).round() as i64,
        side,
    }
}

#[derive(Debug, Clone)]
struct BreakoutRecord {
    recorded_ms: i64,
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

pub struct SignalGenerator {
    cfg: SignalConfig,
    /// (symbol, level, side) -> cooldown expiry.
    cooldowns: HashMap<(String, LevelKey), i64>,
    /// Momentum breaks eligible for retest entries.
    breakouts: HashMap<(String, LevelKey), BreakoutRecord>,
}

impl SignalGenerator {
    pub fn new(cfg: SignalConfig) -> Self {
        Self {
            cfg,
            cooldowns: HashMap::new(),
            breakouts: HashMap::new(),
        }
    }

    /// Evaluate one scan candidate against all of its levels.
    pub fn evaluate(
        &mut self,
        candidate: &ScanCandidate,
        ctx: &SignalContext<'_>,
    ) -> (Vec<Signal>, Vec<RejectionNote>) {
        let mut signals = Vec::new();
        let mut notes = Vec::new();

        self.prune(ctx.now_ms);

        for level in &candidate.levels {
            let side = match level.side {
                LevelSide::Resistance => Side::Long,
                LevelSide::Support => Side::Short,
            };

            match self.try_momentum(candidate, level, side, ctx) {
                Ok(signal) => signals.push(signal),
                Err(reason) => notes.push(RejectionNote {
                    symbol: candidate.symbol.clone(),
                    level_price: level.price,
                    strategy: "momentum",
                    reason,
                }),
            }

            match self.try_retest(candidate, level, side, ctx) {
                Ok(signal) => signals.push(signal),
                Err(reason) => notes.push(RejectionNote {
                    symbol: candidate.symbol.clone(),
                    level_price: level.price,
                    strategy: "retest",
                    reason,
                }),
            }
        }

        (signals, notes)
    }

    /// Drop expired cooldowns and stale breakout records.
    fn prune(&mut self, now_ms: i64) {
        self.cooldowns.retain(|_, expiry| *expiry > now_ms);
        let breakout_ttl = (self.cfg.cooldown_s as i64) * 4 * 1000;
        self.breakouts
            .retain(|_, rec| now_ms - rec.recorded_ms < breakout_ttl);
    }

    // -------------------------------------------------------------------------
    // Momentum
    // -------------------------------------------------------------------------

    fn try_momentum(
        &mut self,
        candidate: &ScanCandidate,
        level: &Level,
        side: Side,
        ctx: &SignalContext<'_>,
    ) -> Result<Signal, SignalRejection> {
        if !ctx.data_fresh {
            return Err(SignalRejection::DataStale);
        }

        let last = ctx.candles.last().ok_or(SignalRejection::NoBreak)?;

        // Close must be beyond the level by the minimum break distance.
        let break_frac = side.sign() * (last.close - level.price) / level.price;
        let break_bps = break_frac * 10_000.0;
        if break_bps < self.cfg.momentum_min_break_bps {
            return Err(SignalRejection::NoBreak);
        }

        self.common_gates(candidate, level, side, ctx, "momentum")?;

        // Confirmation: density eaten on the breakout side, and/or volume.
        let breakout_book_side = match side {
            Side::Long => BookSide::Ask,
            Side::Short => BookSide::Bid,
        };
        let density_eaten = ctx
            .densities
            .iter()
            .filter(|d| d.side == breakout_book_side)
            .filter(|d| {
                distance_bps(d.price_bucket, level.price)
                    <= self.cfg.entry_rules.max_distance_from_level_bps
            })
            .map(|d| d.eaten_ratio)
            .fold(None, |best: Option<f64>, r| {
                Some(best.map_or(r, |b| b.max(r)))
            });
        let density_ok = density_eaten
            .map_or(false, |r| r >= self.cfg.enter_on_density_eat_ratio);

        let volume_ratio = if ctx.avg_volume > 0.0 {
            last.volume / ctx.avg_volume
        } else {
            0.0
        };
        let volume_ok = volume_ratio >= self.cfg.volume_confirmation_multiplier;

        let confirmed = if self.cfg.strict_confirmation {
            density_ok && volume_ok
        } else {
            density_ok || volume_ok
        };
        if !confirmed {
            return Err(SignalRejection::Unconfirmed);
        }

        // False start: an earlier break of this level that closed back
        // inside within the lookback disqualifies the fresh break.
        if self.had_false_start(level, side, ctx.candles) {
            return Err(SignalRejection::FalseStart);
        }

        let entry = if self.cfg.use_aggressive_limit {
            let price =
                level.price * (1.0 + side.sign() * bps_to_frac(self.cfg.prelevel_limit_offset_bps));
            EntryKind::Limit { price }
        } else {
            EntryKind::Market
        };
        let entry_price = match entry {
            EntryKind::Limit { price } => price,
            EntryKind::Market => ctx.last_price,
        };
        let stop_price =
            level.price * (1.0 - side.sign() * bps_to_frac(self.cfg.stop_buffer_bps));

        let act_norm = (ctx.activity.index.clamp(0.0, 5.0)) / 5.0;
        let vol_norm =
            (volume_ratio / self.cfg.volume_confirmation_multiplier).clamp(0.0, 1.0);
        let confidence = (0.2
            + 0.3 * level.strength
            + 0.3 * density_eaten.unwrap_or(0.0)
            + 0.1 * act_norm
            + 0.1 * vol_norm)
            .clamp(0.0, 1.0);
        if confidence < self.cfg.min_confidence {
            return Err(SignalRejection::LowConfidence {
                confidence,
                min: self.cfg.min_confidence,
            });
        }

        self.arm_cooldown(&candidate.symbol, level, side, ctx.now_ms);
        self.breakouts.insert(
            (candidate.symbol.clone(), level_key(level.price, side)),
            BreakoutRecord {
                recorded_ms: ctx.now_ms,
            },
        );

        let signal = Signal {
            id: Uuid::new_v4().to_string(),
            symbol: candidate.symbol.clone(),
            side,
            kind: SignalKind::Momentum {
                break_bps,
                density_eaten,
                volume_ratio,
            },
            level: level.clone(),
            entry,
            entry_price,
            stop_price,
            confidence,
            created_ms: ctx.now_ms,
        };
        info!(
            symbol = %signal.symbol,
            side = %signal.side,
            level = level.price,
            break_bps = format!("{break_bps:.1}"),
            density_ok,
            volume_ok,
            confidence = format!("{confidence:.2}"),
            "momentum signal emitted"
        );
        Ok(signal)
    }

    // -------------------------------------------------------------------------
    // Retest
    // -------------------------------------------------------------------------

    fn try_retest(
        &mut self,
        candidate: &ScanCandidate,
        level: &Level,
        side: Side,
        ctx: &SignalContext<'_>,
    ) -> Result<Signal, SignalRejection> {
        if !ctx.data_fresh {
            return Err(SignalRejection::DataStale);
        }

        // A retest needs a prior momentum break of this exact level.
        let key = (candidate.symbol.clone(), level_key(level.price, side));
        let record = self.breakouts.get(&key).ok_or(SignalRejection::NoBreak)?;
        if record.recorded_ms >= ctx.now_ms {
            return Err(SignalRejection::NoBreak);
        }

        if self.cfg.entry_rules.require_clean_approach && level.vertical_approach {
            return Err(SignalRejection::VerticalApproach);
        }

        let band_bps = distance_bps(ctx.last_price, level.price);
        if band_bps > self.cfg.retest_band_bps {
            return Err(SignalRejection::NoBreak);
        }

        if ctx.activity.is_dropping {
            return Err(SignalRejection::ActivityDropping);
        }

        let touch_tpm_ratio = if ctx.tpm_mean > 0.0 {
            ctx.tpm_now / ctx.tpm_mean
        } else {
            0.0
        };
        if touch_tpm_ratio < self.cfg.tpm_on_touch_frac {
            return Err(SignalRejection::ThinTouchTape);
        }

        self.common_gates(candidate, level, side, ctx, "retest")?;

        let entry_price =
            level.price * (1.0 + side.sign() * bps_to_frac(self.cfg.retest_offset_bps));
        let stop_price =
            level.price * (1.0 - side.sign() * bps_to_frac(self.cfg.stop_buffer_bps));

        let act_norm = (ctx.activity.index.clamp(0.0, 5.0)) / 5.0;
        let tpm_norm = (touch_tpm_ratio / 2.0).clamp(0.0, 1.0);
        let confidence =
            (0.2 + 0.35 * level.strength + 0.25 * tpm_norm + 0.2 * act_norm).clamp(0.0, 1.0);
        if confidence < self.cfg.min_confidence {
            return Err(SignalRejection::LowConfidence {
                confidence,
                min: self.cfg.min_confidence,
            });
        }

        self.arm_cooldown(&candidate.symbol, level, side, ctx.now_ms);

        let signal = Signal {
            id: Uuid::new_v4().to_string(),
            symbol: candidate.symbol.clone(),
            side,
            kind: SignalKind::Retest {
                band_bps,
                touch_tpm_ratio,
            },
            level: level.clone(),
            entry: EntryKind::Limit { price: entry_price },
            entry_price,
            stop_price,
            confidence,
            created_ms: ctx.now_ms,
        };
        info!(
            symbol = %signal.symbol,
            side = %signal.side,
            level = level.price,
            band_bps = format!("{band_bps:.1}"),
            touch_tpm_ratio = format!("{touch_tpm_ratio:.2}"),
            confidence = format!("{confidence:.2}"),
            "retest signal emitted"
        );
        Ok(signal)
    }

    // -------------------------------------------------------------------------
    // Shared gates
    // -------------------------------------------------------------------------

    fn common_gates(
        &self,
        candidate: &ScanCandidate,
        level: &Level,
        side: Side,
        ctx: &SignalContext<'_>,
        strategy: &str,
    ) -> Result<(), SignalRejection> {
        // Exposure: one live idea per (symbol, side).
        if ctx
            .open_exposure
            .contains(&(candidate.symbol.clone(), side))
        {
            return Err(SignalRejection::ExistingExposure);
        }

        // Cooldown per (symbol, level, side).
        let key = (candidate.symbol.clone(), level_key(level.price, side));
        if self
            .cooldowns
            .get(&key)
            .map_or(false, |expiry| *expiry > ctx.now_ms)
        {
            return Err(SignalRejection::Cooldown);
        }

        // Distance from the level.
        if distance_bps(ctx.last_price, level.price)
            > self.cfg.entry_rules.max_distance_from_level_bps
        {
            return Err(SignalRejection::TooFarFromLevel);
        }

        // Session edge: no entries around the UTC day roll.
        let minutes_of_day = (ctx.now_ms / 60_000).rem_euclid(1_440);
        let edge = self.cfg.entry_rules.session_edge_minutes as i64;
        if minutes_of_day < edge || minutes_of_day >= 1_440 - edge {
            return Err(SignalRejection::SessionEdge);
        }

        self.market_quality(ctx.candles)?;

        debug!(
            symbol = %candidate.symbol,
            strategy,
            level = level.price,
            "signal gates passed"
        );
        Ok(())
    }

    /// Flat-market, noise and volatility-stability checks over the recent
    /// window.
    fn market_quality(&self, candles: &[Candle]) -> Result<(), SignalRejection> {
        let mq = &self.cfg.market_quality;
        if candles.len() < mq.lookback_bars {
            return Err(SignalRejection::MarketQuality(format!(
                "insufficient candles: {} < {}",
                candles.len(),
                mq.lookback_bars
            )));
        }
        let recent = &candles[candles.len() - mq.lookback_bars..];

        let flat_count = recent
            .iter()
            .filter(|c| {
                let mid = (c.high + c.low) / 2.0;
                mid > 0.0 && (c.range() / mid) * 10_000.0 < mq.flat_range_bps
            })
            .count();
        let flat_frac = flat_count as f64 / recent.len() as f64;
        if flat_frac > mq.max_flat_bar_frac {
            return Err(SignalRejection::MarketQuality(format!(
                "flat market: {:.0}% flat bars",
                flat_frac * 100.0
            )));
        }

        let avg_wick =
            recent.iter().map(|c| c.wick_ratio()).sum::<f64>() / recent.len() as f64;
        if avg_wick > mq.max_wick_noise {
            return Err(SignalRejection::MarketQuality(format!(
                "noisy tape: avg wick ratio {avg_wick:.2}"
            )));
        }

        // Volatility stability: recent half vs older half of the window.
        let half = recent.len() / 2;
        let range_sum = |slice: &[Candle]| slice.iter().map(Candle::range).sum::<f64>();
        let old_r = range_sum(&recent[..half]);
        let new_r = range_sum(&recent[half..]);
        if old_r > 0.0 && new_r > 0.0 {
            let drift = (new_r / old_r).max(old_r / new_r);
            if drift > mq.max_volatility_drift {
                return Err(SignalRejection::MarketQuality(format!(
                    "volatility unstable: drift {drift:.2}"
                )));
            }
        }

        Ok(())
    }

    /// An earlier break of this level that closed back inside, within the
    /// false-start lookback (the confirming bar itself excluded).
    fn had_false_start(&self, level: &Level, side: Side, candles: &[Candle]) -> bool {
        let lookback = self.cfg.entry_rules.false_start_lookback_bars;
        if candles.len() < 3 || lookback == 0 {
            return false;
        }
        let history = &candles[..candles.len() - 1];
        let start = history.len().saturating_sub(lookback);
        let min_break = bps_to_frac(self.cfg.momentum_min_break_bps);

        for i in start..history.len() {
            let broke = side.sign() * (history[i].close - level.price) / level.price >= min_break;
            if !broke {
                continue;
            }
            if history[i + 1..]
                .iter()
                .any(|c| side.sign() * (c.close - level.price) < 0.0)
            {
                return true;
            }
        }
        false
    }

    fn arm_cooldown(&mut self, symbol: &str, level: &Level, side: Side, now_ms: i64) {
        self.cooldowns.insert(
            (symbol.to_string(), level_key(level.price, side)),
            now_ms + (self.cfg.cooldown_s as i64) * 1000,
        );
    }

    // -------------------------------------------------------------------------
    // Persistence hooks
    // -------------------------------------------------------------------------

    /// Cooldowns as (symbol, level price, side, expiry) rows.
    pub fn cooldown_snapshot(&self) -> Vec<(String, f64, Side, i64)> {
        self.cooldowns
            .iter()
            .map(|((symbol, key), expiry)| {
                (symbol.clone(), key.price_e8 as f64 / 1e8, key.side, *expiry)
            })
            .collect()
    }

    pub fn restore_cooldowns(&mut self, rows: &[(String, f64, Side, i64)]) {
        for (symbol, price, side, expiry) in rows {
            self.cooldowns
                .insert((symbol.clone(), level_key(*price, *side)), *expiry);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
