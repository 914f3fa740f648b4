// =============================================================================
// Strategy Preset — the immutable parameter set behind every engine decision
// =============================================================================
//
// A preset is loaded once, validated, and never mutated afterwards. Unknown
// fields are rejected so a typo in a preset file fails loudly instead of
// silently running with defaults.
//
// Serialisation is stable: struct field order is fixed and the schema holds
// no maps, so serialise -> deserialise -> serialise is byte-equal.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "SOLUSDT".to_string(),
        "XRPUSDT".to_string(),
        "DOGEUSDT".to_string(),
    ]
}

fn default_round_steps() -> Vec<f64> {
    vec![10_000.0, 1_000.0, 100.0, 10.0, 1.0, 0.1, 0.01]
}

fn default_tp_ladder() -> Vec<TpLevelConfig> {
    vec![
        TpLevelConfig {
            reward_multiple: 1.5,
            size_pct: 0.4,
            placement_mode: PlacementMode::Smart,
        },
        TpLevelConfig {
            reward_multiple: 2.5,
            size_pct: 0.3,
            placement_mode: PlacementMode::Smart,
        },
        TpLevelConfig {
            reward_multiple: 4.0,
            size_pct: 0.2,
            placement_mode: PlacementMode::Adaptive,
        },
    ]
}

// =============================================================================
// Validation errors
// =============================================================================

/// A preset that fails validation is rejected at load; the engine refuses to
/// start with it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PresetError {
    #[error("field {field} out of range: {detail}")]
    OutOfRange { field: String, detail: String },

    #[error("tp ladder invalid: {0}")]
    Ladder(String),

    #[error("legacy tp fields contradict the ladder: {0}")]
    LegacyTpConflict(String),

    #[error("preset rejected: {0}")]
    Other(String),
}

fn range_err(field: &str, detail: impl Into<String>) -> PresetError {
    PresetError::OutOfRange {
        field: field.to_string(),
        detail: detail.into(),
    }
}

fn check_frac(field: &str, v: f64) -> Result<(), PresetError> {
    if !(0.0..=1.0).contains(&v) || !v.is_finite() {
        return Err(range_err(field, format!("{v} not in [0, 1]")));
    }
    Ok(())
}

fn check_non_negative(field: &str, v: f64) -> Result<(), PresetError> {
    if v < 0.0 || !v.is_finite() {
        return Err(range_err(field, format!("{v} is negative")));
    }
    Ok(())
}

fn check_positive(field: &str, v: f64) -> Result<(), PresetError> {
    if v <= 0.0 || !v.is_finite() {
        return Err(range_err(field, format!("{v} is not positive")));
    }
    Ok(())
}

// =============================================================================
// Risk
// =============================================================================

/// Risk budget and kill-switch parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RiskConfig {
    /// Fraction of account equity risked per trade (0.005 = 0.5 %).
    pub risk_per_trade: f64,
    /// Fraction of equity that may be lost (realised + open risk) in a day.
    pub daily_risk_limit: f64,
    pub max_concurrent_positions: u32,
    /// Daily realised loss in R units that latches the kill switch.
    pub kill_switch_loss_r: f64,
    /// Consecutive losing trades that latch the kill switch.
    pub kill_switch_consecutive: u32,
    /// Cap on the fraction of open risk held in BTC-correlated symbols.
    pub btc_correlation_cap: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_per_trade: 0.005,
            daily_risk_limit: 0.03,
            max_concurrent_positions: 3,
            kill_switch_loss_r: 5.0,
            kill_switch_consecutive: 4,
            btc_correlation_cap: 0.6,
        }
    }
}

// =============================================================================
// Liquidity / market filters
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LiquidityFilters {
    pub min_24h_volume_usd: f64,
    /// Minimum resting depth (USD) within the spread-side bucket.
    pub min_depth_usd: f64,
    pub max_spread_bps: f64,
    /// Reject symbols whose 24 h range exceeds this (percent, e.g. 25.0).
    pub max_24h_range_pct: f64,
    /// Reject flat symbols whose ATR is below this fraction of price
    /// (percent, e.g. 0.15).
    pub min_atr_pct: f64,
}

impl Default for LiquidityFilters {
    fn default() -> Self {
        Self {
            min_24h_volume_usd: 20_000_000.0,
            min_depth_usd: 50_000.0,
            max_spread_bps: 6.0,
            max_24h_range_pct: 25.0,
            min_atr_pct: 0.15,
        }
    }
}

// =============================================================================
// Scanner
// =============================================================================

/// Weights applied to batch-z-scored features when ranking candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScoreWeights {
    pub vol_surge: f64,
    pub oi_delta: f64,
    pub atr_quality: f64,
    pub trades_pressure: f64,
    pub spread_quality: f64,
    pub level_strength: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            vol_surge: 0.25,
            oi_delta: 0.10,
            atr_quality: 0.15,
            trades_pressure: 0.20,
            spread_quality: 0.10,
            level_strength: 0.20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScannerConfig {
    pub score_weights: ScoreWeights,
    /// Size of the candidate short-list produced per scan cycle.
    pub top_k: usize,
    /// Seconds between full scans.
    pub scan_interval_s: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            score_weights: ScoreWeights::default(),
            top_k: 8,
            scan_interval_s: 30,
        }
    }
}

// =============================================================================
// Levels
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LevelsRules {
    /// Bars required on each side of a pivot extreme.
    pub pivot_lookback: usize,
    /// Two levels closer than this collapse into the stronger one.
    pub merge_radius_bps: f64,
    /// Tolerance when counting candle touches of a level.
    pub touch_tolerance_bps: f64,
    pub round_number_tol_bps: f64,
    /// Candidate round steps, largest first.
    #[serde(default = "default_round_steps")]
    pub round_step_candidates: Vec<f64>,
    /// Minimum cluster size for the cascade bonus (the level itself counts).
    pub cascade_min_levels: usize,
    pub cascade_radius_bps: f64,
    /// Per-bar slope (percent) above which an approach is flagged vertical.
    pub max_approach_slope_pct: f64,
    pub approach_lookback: usize,
}

impl Default for LevelsRules {
    fn default() -> Self {
        Self {
            pivot_lookback: 3,
            merge_radius_bps: 15.0,
            touch_tolerance_bps: 10.0,
            round_number_tol_bps: 5.0,
            round_step_candidates: default_round_steps(),
            cascade_min_levels: 3,
            cascade_radius_bps: 40.0,
            max_approach_slope_pct: 1.2,
            approach_lookback: 5,
        }
    }
}

// =============================================================================
// Densities
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DensityConfig {
    /// A bucket is a density when size >= k_density x local median.
    pub k_density: f64,
    /// Bucket width in ticks.
    pub bucket_ticks: u32,
    /// Densities older than this are dropped.
    pub ttl_s: u64,
    /// Half-width of the local median window, in buckets.
    pub median_window: usize,
    /// A density whose size falls below this fraction of its initial size is
    /// considered gone.
    pub reentry_ratio: f64,
    /// Minimum interval between scans of the same symbol.
    pub min_scan_interval_ms: u64,
}

impl Default for DensityConfig {
    fn default() -> Self {
        Self {
            k_density: 4.0,
            bucket_ticks: 5,
            ttl_s: 900,
            median_window: 10,
            reentry_ratio: 0.15,
            min_scan_interval_ms: 250,
        }
    }
}

// =============================================================================
// Activity
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActivityConfig {
    /// Rolling window for the mean/variance of TPM, TPS and |vol delta|.
    pub window_s: u64,
    /// Fractional fall from the recent index max that latches `is_dropping`.
    pub drop_threshold: f64,
    /// Number of index samples the recent max is taken over.
    pub drop_window_bars: usize,
    /// Seconds after which the drop latch clears.
    pub cooldown_s: u64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            window_s: 300,
            drop_threshold: 0.35,
            drop_window_bars: 12,
            cooldown_s: 120,
        }
    }
}

// =============================================================================
// Signals
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntryRules {
    /// Maximum distance from the level at signal time.
    pub max_distance_from_level_bps: f64,
    /// A failed break of the same level within this many bars blocks entry.
    pub false_start_lookback_bars: usize,
    /// Minutes around 00:00 UTC during which no entries are taken.
    pub session_edge_minutes: u32,
    /// Vertical-approach levels are excluded from retest entries.
    #[serde(default = "default_true")]
    pub require_clean_approach: bool,
}

impl Default for EntryRules {
    fn default() -> Self {
        Self {
            max_distance_from_level_bps: 35.0,
            false_start_lookback_bars: 12,
            session_edge_minutes: 10,
            require_clean_approach: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarketQuality {
    /// Bars inspected by the quality checks.
    pub lookback_bars: usize,
    /// A bar with range below this is "flat".
    pub flat_range_bps: f64,
    /// Maximum fraction of flat bars in the lookback.
    pub max_flat_bar_frac: f64,
    /// Maximum average wick-to-range ratio (noise).
    pub max_wick_noise: f64,
    /// Recent/old ATR ratio must stay within [1/x, x].
    pub max_volatility_drift: f64,
}

impl Default for MarketQuality {
    fn default() -> Self {
        Self {
            lookback_bars: 20,
            flat_range_bps: 3.0,
            max_flat_bar_frac: 0.6,
            max_wick_noise: 0.75,
            max_volatility_drift: 3.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignalConfig {
    /// Minimum close beyond the level for a momentum breakout.
    pub momentum_min_break_bps: f64,
    /// Breakout volume must reach this multiple of average volume.
    pub volume_confirmation_multiplier: f64,
    /// Density eaten ratio that counts as breakout confirmation.
    pub enter_on_density_eat_ratio: f64,
    /// When true, momentum needs BOTH density-eaten and volume confirmation.
    #[serde(default)]
    pub strict_confirmation: bool,
    /// TPM on a retest touch must reach this fraction of the rolling mean.
    pub tpm_on_touch_frac: f64,
    pub retest_band_bps: f64,
    /// Retest limit orders rest this far beyond the level.
    pub retest_offset_bps: f64,
    /// Momentum limit entries rest this far inside the level.
    pub prelevel_limit_offset_bps: f64,
    /// Momentum entries use an aggressive limit instead of a market order.
    #[serde(default)]
    pub use_aggressive_limit: bool,
    pub stop_buffer_bps: f64,
    pub min_confidence: f64,
    /// Cooldown between signals on the same (symbol, level, side).
    pub cooldown_s: u64,
    pub entry_rules: EntryRules,
    pub market_quality: MarketQuality,
    pub activity: ActivityConfig,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            momentum_min_break_bps: 6.0,
            volume_confirmation_multiplier: 2.0,
            enter_on_density_eat_ratio: 0.75,
            strict_confirmation: false,
            tpm_on_touch_frac: 0.7,
            retest_band_bps: 12.0,
            retest_offset_bps: 4.0,
            prelevel_limit_offset_bps: 3.0,
            use_aggressive_limit: false,
            stop_buffer_bps: 12.0,
            min_confidence: 0.55,
            cooldown_s: 900,
            entry_rules: EntryRules::default(),
            market_quality: MarketQuality::default(),
            activity: ActivityConfig::default(),
        }
    }
}

// =============================================================================
// Position management
// =============================================================================

/// How a take-profit rung is priced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlacementMode {
    /// Exactly at the configured R multiple.
    Fixed,
    /// Nudged within `max_adjustment_bps` to respect density walls and
    /// prefer round numbers.
    Smart,
    /// Re-anchored while the position trails.
    Adaptive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlMode {
    Fixed,
    Atr,
    Chandelier,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TpLevelConfig {
    pub reward_multiple: f64,
    /// Fraction of the initial quantity closed at this rung.
    pub size_pct: f64,
    pub placement_mode: PlacementMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExitRules {
    #[serde(default = "default_true")]
    pub failed_breakout_enabled: bool,
    /// Bars after entry during which a close back inside the level exits.
    pub failed_breakout_bars: u32,
    /// Close must re-enter at least this far beyond the level.
    pub failed_breakout_retest_threshold_bps: f64,
    /// Exit on an activity-drop latch.
    #[serde(default = "default_true")]
    pub activity_drop_enabled: bool,
}

impl Default for ExitRules {
    fn default() -> Self {
        Self {
            failed_breakout_enabled: true,
            failed_breakout_bars: 6,
            failed_breakout_retest_threshold_bps: 4.0,
            activity_drop_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FsmConfig {
    /// Bars an entry order may rest unfilled before it is cancelled.
    pub entry_confirmation_bars: u32,
    /// Unrealised R that upgrades PARTIAL_CLOSED to TRAILING.
    pub partial_closed_trail_trigger_r: f64,
    /// Failed exit attempts before the position is abandoned as panic.
    pub exiting_panic_after_attempts: u32,
    /// Bounded per-position state history.
    pub history_cap: usize,
}

impl Default for FsmConfig {
    fn default() -> Self {
        Self {
            entry_confirmation_bars: 3,
            partial_closed_trail_trigger_r: 2.0,
            exiting_panic_after_attempts: 5,
            history_cap: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PositionConfig {
    #[serde(default)]
    pub tp_levels: Vec<TpLevelConfig>,
    /// Legacy two-level schema. Accepted only when consistent with (or in
    /// lieu of) `tp_levels`; contradictions are rejected at load.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tp1_r: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tp2_r: Option<f64>,
    pub sl_mode: SlMode,
    pub breakeven_trigger_r: f64,
    pub breakeven_buffer_bps: f64,
    pub trailing_activation_r: f64,
    pub trailing_step_bps: f64,
    /// Unrealised R past which the trailing step accelerates.
    pub trailing_accel_after_r: f64,
    pub trailing_accel_step_bps: f64,
    /// Smart TP rungs may move at most this far from their R target.
    pub max_adjustment_bps: f64,
    /// A position still in RUNNING after this many minutes is stagnant and
    /// exits with reason time_stop.
    pub time_stop_minutes: u64,
    /// Hard cap on total hold time.
    pub max_hold_time_hours: f64,
    pub exit_rules: ExitRules,
    pub fsm_config: FsmConfig,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            tp_levels: default_tp_ladder(),
            tp1_r: None,
            tp2_r: None,
            sl_mode: SlMode::Fixed,
            breakeven_trigger_r: 1.0,
            breakeven_buffer_bps: 3.0,
            trailing_activation_r: 1.5,
            trailing_step_bps: 20.0,
            trailing_accel_after_r: 3.0,
            trailing_accel_step_bps: 40.0,
            max_adjustment_bps: 10.0,
            time_stop_minutes: 180,
            max_hold_time_hours: 24.0,
            exit_rules: ExitRules::default(),
            fsm_config: FsmConfig::default(),
        }
    }
}

// =============================================================================
// Preset
// =============================================================================

/// Top-level strategy preset. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Preset {
    pub name: String,
    /// Symbols the engine watches when no universe is supplied by a caller.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    pub risk: RiskConfig,
    pub liquidity_filters: LiquidityFilters,
    pub scanner: ScannerConfig,
    pub levels_rules: LevelsRules,
    pub density_config: DensityConfig,
    pub signal_config: SignalConfig,
    pub position_config: PositionConfig,
}

impl Default for Preset {
    fn default() -> Self {
        Self {
            name: "breakout-balanced".to_string(),
            symbols: default_symbols(),
            risk: RiskConfig::default(),
            liquidity_filters: LiquidityFilters::default(),
            scanner: ScannerConfig::default(),
            levels_rules: LevelsRules::default(),
            density_config: DensityConfig::default(),
            signal_config: SignalConfig::default(),
            position_config: PositionConfig::default(),
        }
    }
}

impl Preset {
    /// Parse a preset from JSON and validate it. Unknown fields and range
    /// violations both reject the preset.
    pub fn from_json(json: &str) -> Result<Self> {
        let preset: Self =
            serde_json::from_str(json).context("failed to parse preset JSON")?;
        preset.validate().map_err(anyhow::Error::from)?;
        Ok(preset)
    }

    /// Load a preset from a file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read preset from {}", path.display()))?;
        let preset = Self::from_json(&content)
            .with_context(|| format!("invalid preset at {}", path.display()))?;
        info!(path = %path.display(), name = %preset.name, "preset loaded");
        Ok(preset)
    }

    /// Field-level validation. Every range rule from the schema is enforced
    /// here; a failing preset never reaches the engine.
    pub fn validate(&self) -> Result<(), PresetError> {
        if self.name.trim().is_empty() {
            return Err(PresetError::Other("name is empty".into()));
        }
        if self.symbols.is_empty() {
            return Err(PresetError::Other("symbols list is empty".into()));
        }

        // Risk
        check_frac("risk.risk_per_trade", self.risk.risk_per_trade)?;
        check_positive("risk.risk_per_trade", self.risk.risk_per_trade)?;
        check_frac("risk.daily_risk_limit", self.risk.daily_risk_limit)?;
        check_positive("risk.daily_risk_limit", self.risk.daily_risk_limit)?;
        if self.risk.max_concurrent_positions == 0 {
            return Err(range_err("risk.max_concurrent_positions", "must be >= 1"));
        }
        check_positive("risk.kill_switch_loss_r", self.risk.kill_switch_loss_r)?;
        if self.risk.kill_switch_consecutive == 0 {
            return Err(range_err("risk.kill_switch_consecutive", "must be >= 1"));
        }
        check_frac("risk.btc_correlation_cap", self.risk.btc_correlation_cap)?;

        // Liquidity filters
        check_non_negative(
            "liquidity_filters.min_24h_volume_usd",
            self.liquidity_filters.min_24h_volume_usd,
        )?;
        check_non_negative(
            "liquidity_filters.min_depth_usd",
            self.liquidity_filters.min_depth_usd,
        )?;
        check_non_negative(
            "liquidity_filters.max_spread_bps",
            self.liquidity_filters.max_spread_bps,
        )?;
        check_positive(
            "liquidity_filters.max_24h_range_pct",
            self.liquidity_filters.max_24h_range_pct,
        )?;
        check_non_negative(
            "liquidity_filters.min_atr_pct",
            self.liquidity_filters.min_atr_pct,
        )?;

        // Scanner
        if self.scanner.top_k == 0 {
            return Err(range_err("scanner.top_k", "must be >= 1"));
        }
        if self.scanner.scan_interval_s == 0 {
            return Err(range_err("scanner.scan_interval_s", "must be >= 1"));
        }

        // Levels
        if self.levels_rules.pivot_lookback == 0 {
            return Err(range_err("levels_rules.pivot_lookback", "must be >= 1"));
        }
        check_non_negative("levels_rules.merge_radius_bps", self.levels_rules.merge_radius_bps)?;
        check_non_negative(
            "levels_rules.round_number_tol_bps",
            self.levels_rules.round_number_tol_bps,
        )?;
        if self.levels_rules.cascade_min_levels < 2 {
            return Err(range_err("levels_rules.cascade_min_levels", "must be >= 2"));
        }
        check_non_negative("levels_rules.cascade_radius_bps", self.levels_rules.cascade_radius_bps)?;
        check_positive(
            "levels_rules.max_approach_slope_pct",
            self.levels_rules.max_approach_slope_pct,
        )?;
        if self.levels_rules.approach_lookback == 0 {
            return Err(range_err("levels_rules.approach_lookback", "must be >= 1"));
        }
        if self.levels_rules.round_step_candidates.is_empty() {
            return Err(range_err("levels_rules.round_step_candidates", "must not be empty"));
        }

        // Densities
        if self.density_config.k_density <= 1.0 {
            return Err(range_err("density_config.k_density", "must be > 1"));
        }
        if self.density_config.bucket_ticks == 0 {
            return Err(range_err("density_config.bucket_ticks", "must be >= 1"));
        }
        if self.density_config.ttl_s == 0 {
            return Err(range_err("density_config.ttl_s", "must be >= 1"));
        }
        check_frac("density_config.reentry_ratio", self.density_config.reentry_ratio)?;

        // Signals
        let sig = &self.signal_config;
        check_non_negative("signal_config.momentum_min_break_bps", sig.momentum_min_break_bps)?;
        check_positive(
            "signal_config.volume_confirmation_multiplier",
            sig.volume_confirmation_multiplier,
        )?;
        check_frac(
            "signal_config.enter_on_density_eat_ratio",
            sig.enter_on_density_eat_ratio,
        )?;
        check_frac("signal_config.tpm_on_touch_frac", sig.tpm_on_touch_frac)?;
        check_non_negative("signal_config.retest_band_bps", sig.retest_band_bps)?;
        check_non_negative("signal_config.retest_offset_bps", sig.retest_offset_bps)?;
        check_non_negative(
            "signal_config.prelevel_limit_offset_bps",
            sig.prelevel_limit_offset_bps,
        )?;
        check_non_negative("signal_config.stop_buffer_bps", sig.stop_buffer_bps)?;
        check_frac("signal_config.min_confidence", sig.min_confidence)?;
        check_non_negative(
            "signal_config.entry_rules.max_distance_from_level_bps",
            sig.entry_rules.max_distance_from_level_bps,
        )?;
        check_frac("signal_config.activity.drop_threshold", sig.activity.drop_threshold)?;
        if sig.activity.window_s == 0 {
            return Err(range_err("signal_config.activity.window_s", "must be >= 1"));
        }
        if sig.activity.drop_window_bars == 0 {
            return Err(range_err("signal_config.activity.drop_window_bars", "must be >= 1"));
        }
        check_frac("signal_config.market_quality.max_flat_bar_frac", sig.market_quality.max_flat_bar_frac)?;
        check_frac("signal_config.market_quality.max_wick_noise", sig.market_quality.max_wick_noise)?;
        if sig.market_quality.max_volatility_drift < 1.0 {
            return Err(range_err(
                "signal_config.market_quality.max_volatility_drift",
                "must be >= 1",
            ));
        }

        // Position config
        let pos = &self.position_config;
        self.validate_ladder()?;
        check_positive("position_config.breakeven_trigger_r", pos.breakeven_trigger_r)?;
        check_non_negative("position_config.breakeven_buffer_bps", pos.breakeven_buffer_bps)?;
        check_positive("position_config.trailing_activation_r", pos.trailing_activation_r)?;
        check_positive("position_config.trailing_step_bps", pos.trailing_step_bps)?;
        check_positive("position_config.trailing_accel_after_r", pos.trailing_accel_after_r)?;
        check_positive("position_config.trailing_accel_step_bps", pos.trailing_accel_step_bps)?;
        check_non_negative("position_config.max_adjustment_bps", pos.max_adjustment_bps)?;
        check_positive("position_config.max_hold_time_hours", pos.max_hold_time_hours)?;
        if pos.fsm_config.entry_confirmation_bars == 0 {
            return Err(range_err(
                "position_config.fsm_config.entry_confirmation_bars",
                "must be >= 1",
            ));
        }
        if pos.fsm_config.exiting_panic_after_attempts == 0 {
            return Err(range_err(
                "position_config.fsm_config.exiting_panic_after_attempts",
                "must be >= 1",
            ));
        }
        if pos.fsm_config.history_cap == 0 {
            return Err(range_err("position_config.fsm_config.history_cap", "must be >= 1"));
        }

        Ok(())
    }

    /// The effective TP ladder after reconciling the legacy two-level fields.
    ///
    /// Rules:
    /// * ladder only -> ladder;
    /// * legacy only -> two rungs at 50 % / 50 %;
    /// * both -> legacy values must equal rungs 1-2 exactly, else rejected.
    pub fn effective_tp_ladder(&self) -> Result<Vec<TpLevelConfig>, PresetError> {
        let pos = &self.position_config;
        let legacy = match (pos.tp1_r, pos.tp2_r) {
            (None, None) => None,
            (Some(a), Some(b)) => Some((a, b)),
            _ => {
                return Err(PresetError::LegacyTpConflict(
                    "tp1_r and tp2_r must be given together".into(),
                ))
            }
        };

        match legacy {
            None => Ok(pos.tp_levels.clone()),
            Some((tp1, tp2)) if pos.tp_levels.is_empty() => Ok(vec![
                TpLevelConfig {
                    reward_multiple: tp1,
                    size_pct: 0.5,
                    placement_mode: PlacementMode::Fixed,
                },
                TpLevelConfig {
                    reward_multiple: tp2,
                    size_pct: 0.5,
                    placement_mode: PlacementMode::Fixed,
                },
            ]),
            Some((tp1, tp2)) => {
                if pos.tp_levels.len() < 2
                    || (pos.tp_levels[0].reward_multiple - tp1).abs() > 1e-9
                    || (pos.tp_levels[1].reward_multiple - tp2).abs() > 1e-9
                {
                    return Err(PresetError::LegacyTpConflict(format!(
                        "tp1_r={tp1} tp2_r={tp2} do not match ladder rungs 1-2"
                    )));
                }
                Ok(pos.tp_levels.clone())
            }
        }
    }

    fn validate_ladder(&self) -> Result<(), PresetError> {
        let ladder = self.effective_tp_ladder()?;
        if ladder.is_empty() || ladder.len() > 6 {
            return Err(PresetError::Ladder(format!(
                "{} rungs (expected 1-6)",
                ladder.len()
            )));
        }

        let mut prev_r = 0.0;
        let mut size_sum = 0.0;
        for (i, rung) in ladder.iter().enumerate() {
            if rung.reward_multiple <= prev_r {
                return Err(PresetError::Ladder(format!(
                    "reward multiples must be strictly increasing (rung {i})"
                )));
            }
            if rung.size_pct <= 0.0 || rung.size_pct > 1.0 {
                return Err(PresetError::Ladder(format!(
                    "size_pct {} out of (0, 1] (rung {i})",
                    rung.size_pct
                )));
            }
            prev_r = rung.reward_multiple;
            size_sum += rung.size_pct;
        }
        if size_sum > 1.0 + 1e-9 {
            return Err(PresetError::Ladder(format!(
                "size_pct sum {size_sum:.4} exceeds 1.0"
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_preset_is_valid() {
        let preset = Preset::default();
        assert!(preset.validate().is_ok());
        assert_eq!(preset.effective_tp_ladder().unwrap().len(), 3);
    }

    #[test]
    fn serialisation_round_trip_is_byte_equal() {
        let preset = Preset::default();
        let first = serde_json::to_string(&preset).unwrap();
        let parsed: Preset = serde_json::from_str(&first).unwrap();
        let second = serde_json::to_string(&parsed).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let mut value = serde_json::to_value(Preset::default()).unwrap();
        value["surprise_field"] = serde_json::json!(1);
        let json = serde_json::to_string(&value).unwrap();
        assert!(Preset::from_json(&json).is_err());
    }

    #[test]
    fn out_of_range_risk_rejected() {
        let mut preset = Preset::default();
        preset.risk.risk_per_trade = 1.5;
        assert!(matches!(
            preset.validate(),
            Err(PresetError::OutOfRange { .. })
        ));
    }

    #[test]
    fn ladder_must_be_strictly_increasing() {
        let mut preset = Preset::default();
        preset.position_config.tp_levels[1].reward_multiple =
            preset.position_config.tp_levels[0].reward_multiple;
        assert!(matches!(preset.validate(), Err(PresetError::Ladder(_))));
    }

    #[test]
    fn ladder_size_sum_capped_at_one() {
        let mut preset = Preset::default();
        for rung in &mut preset.position_config.tp_levels {
            rung.size_pct = 0.5;
        }
        assert!(matches!(preset.validate(), Err(PresetError::Ladder(_))));
    }

    #[test]
    fn single_rung_full_size_is_allowed() {
        let mut preset = Preset::default();
        preset.position_config.tp_levels = vec![TpLevelConfig {
            reward_multiple: 2.0,
            size_pct: 1.0,
            placement_mode: PlacementMode::Fixed,
        }];
        assert!(preset.validate().is_ok());
    }

    #[test]
    fn legacy_fields_alone_expand_to_two_rungs() {
        let mut preset = Preset::default();
        preset.position_config.tp_levels = Vec::new();
        preset.position_config.tp1_r = Some(1.0);
        preset.position_config.tp2_r = Some(2.0);
        let ladder = preset.effective_tp_ladder().unwrap();
        assert_eq!(ladder.len(), 2);
        assert!((ladder[0].size_pct - 0.5).abs() < 1e-12);
        assert!(preset.validate().is_ok());
    }

    #[test]
    fn contradictory_legacy_fields_rejected() {
        let mut preset = Preset::default();
        preset.position_config.tp1_r = Some(9.0);
        preset.position_config.tp2_r = Some(10.0);
        assert!(matches!(
            preset.validate(),
            Err(PresetError::LegacyTpConflict(_))
        ));
    }

    #[test]
    fn lone_legacy_field_rejected() {
        let mut preset = Preset::default();
        preset.position_config.tp1_r = Some(1.0);
        assert!(matches!(
            preset.validate(),
            Err(PresetError::LegacyTpConflict(_))
        ));
    }
}
