// =============================================================================
// Exchange Gateway — the seam between the engine and the wire
// =============================================================================
//
// The engine only ever talks to this trait. The paper gateway simulates
// fills from the live tape; the live gateway signs REST requests. Client
// order ids are generated by the engine and are the idempotency key: a
// reissued request with an id the gateway has already seen must not create
// a second live order.
// =============================================================================

pub mod live;
pub mod paper;
pub mod rate_limit;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::GatewayError;
use crate::types::OrderSide;

/// Default per-call RPC timeout.
pub const RPC_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
/// Transport-error retries before giving up.
pub const MAX_RETRIES: u32 = 3;

// ---------------------------------------------------------------------------
// Order types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit { price: f64 },
    /// Protective stop, triggers into a market order.
    StopMarket { trigger: f64 },
}

/// Order lifecycle: pending -> open -> {partial -> filled, filled,
/// cancelled, rejected}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Open,
    Partial,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }
}

/// A request the engine hands to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Engine-generated idempotency key.
    pub client_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub qty: f64,
    /// May only reduce an existing position.
    pub reduce_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub client_id: String,
    pub status: OrderStatus,
}

/// A fill or lifecycle event reported back to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub client_id: String,
    pub status: OrderStatus,
    /// Incremental fill quantity carried by this event (0 for pure
    /// lifecycle changes).
    pub fill_qty: f64,
    pub fill_price: f64,
    pub fee: f64,
    pub timestamp_ms: i64,
}

/// Exchange trading rules for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SymbolMeta {
    pub tick_size: f64,
    pub step_size: f64,
    pub min_qty: f64,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Total account equity in the quote currency.
    async fn account_equity(&self) -> Result<f64, GatewayError>;

    async fn symbol_meta(&self, symbol: &str) -> Result<SymbolMeta, GatewayError>;

    /// Place an order. Placing the same `client_id` twice must return the
    /// original ack, not a new order.
    async fn place_order(&self, req: OrderRequest) -> Result<OrderAck, GatewayError>;

    async fn cancel_order(&self, symbol: &str, client_id: &str) -> Result<(), GatewayError>;

    /// Drain order lifecycle events accumulated since the last poll.
    async fn poll_events(&self) -> Result<Vec<OrderEvent>, GatewayError>;

    /// Inform the gateway of a trade print (paper mode matches resting
    /// orders against it; live gateways ignore it).
    fn on_trade(&self, _symbol: &str, _price: f64, _timestamp_ms: i64) {}
}

// ---------------------------------------------------------------------------
// Retry helper
// ---------------------------------------------------------------------------

/// Run a gateway call with a per-call timeout and jittered backoff.
/// Transport errors are retried up to `MAX_RETRIES`; business rejections
/// surface immediately.
pub async fn with_retry<T, F, Fut>(label: &str, mut call: F) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, GatewayError>>,
{
    let mut attempt = 0u32;
    loop {
        let result = tokio::time::timeout(RPC_TIMEOUT, call()).await;
        let err = match result {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e,
            Err(_) => GatewayError::Transport(format!("{label}: rpc timeout")),
        };

        if !err.is_retryable() || attempt >= MAX_RETRIES {
            return Err(err);
        }
        attempt += 1;

        let base = 200u64 * 2u64.pow(attempt - 1);
        let jitter = rand::thread_rng().gen_range(0..base / 2 + 1);
        let delay = std::time::Duration::from_millis(base + jitter);
        warn!(label, attempt, ?delay, error = %err, "gateway call failed — retrying");
        tokio::time::sleep(delay).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retry_retries_transport_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, _> = with_retry("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(GatewayError::Transport("boom".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_never_retries_rejections() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, _> = with_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(GatewayError::Rejected {
                    code: -2010,
                    message: "insufficient balance".into(),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(GatewayError::Rejected { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
