// =============================================================================
// Error taxonomy for the Borealis trading engine
// =============================================================================
//
// Transport failures are retryable; business rejections are not. Data
// integrity errors mark a symbol stale and suppress anything derived from
// that symbol's feeds until the data is rebuilt.
// =============================================================================

use thiserror::Error;

use crate::types::Side;

/// Failures at the exchange gateway boundary.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Network / timeout class failures. Safe to retry with backoff.
    #[error("transport error: {0}")]
    Transport(String),

    /// The exchange throttled us. Retryable after a pause.
    #[error("rate limited by exchange")]
    RateLimited,

    /// A business rejection (insufficient margin, price band, post-only
    /// violation). Never retried.
    #[error("rejected by exchange (code {code}): {message}")]
    Rejected { code: i64, message: String },
}

impl GatewayError {
    /// Whether the retry/backoff path may re-issue the request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::RateLimited)
    }
}

/// Market-data integrity failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataError {
    #[error("crossed book for {symbol}: bid {bid} >= ask {ask}")]
    CrossedBook {
        symbol: String,
        bid: String,
        ask: String,
    },

    #[error("sequence gap for {symbol}: expected {expected}, got {got}")]
    SequenceGap {
        symbol: String,
        expected: u64,
        got: u64,
    },

    #[error("no book state for {symbol}")]
    UnknownSymbol { symbol: String },
}

/// Reasons the risk manager refuses to size or route a signal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RiskRejection {
    #[error("kill switch is latched")]
    KillSwitch,

    #[error("max concurrent positions reached: {open} >= {cap}")]
    MaxConcurrent { open: usize, cap: u32 },

    #[error("daily risk budget exhausted: open {open_risk:.2} + new {new_risk:.2} > remaining {remaining:.2}")]
    RiskBudgetExhausted {
        open_risk: f64,
        new_risk: f64,
        remaining: f64,
    },

    #[error("btc-correlated exposure cap reached: {exposure:.2} > {cap:.2}")]
    CorrelationCap { exposure: f64, cap: f64 },

    #[error("already exposed on {symbol} {side}")]
    DuplicateExposure { symbol: String, side: Side },

    #[error("qty_below_min: computed quantity rounds to zero at step {step}")]
    QtyBelowMin { step: f64 },

    #[error("stop equals entry: cannot size position")]
    ZeroRiskDistance,
}

/// A detected violation of an engine invariant. Fatal for the step that
/// produced it; the engine logs the full context and continues.
#[derive(Debug, Clone, Error)]
pub enum InvariantViolation {
    #[error("stop move for {position_id} would widen risk: {current} -> {proposed}")]
    StopWidensRisk {
        position_id: String,
        current: f64,
        proposed: f64,
    },
}
