// =============================================================================
// Paper Gateway — simulated fills from the live tape
// =============================================================================
//
// Market orders fill at the next trade print. Limit orders fill on limit
// touch, stops trigger into a market fill at the trigger print. No request
// leaves the process; the fill stream looks exactly like the live one so
// the execution layer cannot tell the difference.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};

use super::{
    ExchangeGateway, OrderAck, OrderEvent, OrderKind, OrderRequest, OrderStatus, SymbolMeta,
};
use crate::errors::GatewayError;
use crate::types::OrderSide;

/// Taker fee applied to simulated fills, in basis points.
const PAPER_FEE_BPS: f64 = 7.5;

struct PaperOrder {
    request: OrderRequest,
    status: OrderStatus,
}

/// In-process exchange simulator.
pub struct PaperGateway {
    equity: RwLock<f64>,
    meta: RwLock<HashMap<String, SymbolMeta>>,
    orders: RwLock<HashMap<String, PaperOrder>>,
    events: RwLock<VecDeque<OrderEvent>>,
}

impl PaperGateway {
    pub fn new(starting_equity: f64) -> Self {
        info!(starting_equity, "paper gateway initialised");
        Self {
            equity: RwLock::new(starting_equity),
            meta: RwLock::new(HashMap::new()),
            orders: RwLock::new(HashMap::new()),
            events: RwLock::new(VecDeque::new()),
        }
    }

    pub fn set_symbol_meta(&self, symbol: &str, meta: SymbolMeta) {
        self.meta.write().insert(symbol.to_string(), meta);
    }

    pub fn set_equity(&self, equity: f64) {
        *self.equity.write() = equity;
    }

    /// Open (non-terminal) orders for a symbol, for tests and telemetry.
    pub fn open_orders(&self, symbol: &str) -> Vec<OrderRequest> {
        self.orders
            .read()
            .values()
            .filter(|o| !o.status.is_terminal() && o.request.symbol == symbol)
            .map(|o| o.request.clone())
            .collect()
    }

}

#[async_trait]
impl ExchangeGateway for PaperGateway {
    async fn account_equity(&self) -> Result<f64, GatewayError> {
        Ok(*self.equity.read())
    }

    async fn symbol_meta(&self, symbol: &str) -> Result<SymbolMeta, GatewayError> {
        self.meta
            .read()
            .get(symbol)
            .copied()
            .ok_or_else(|| GatewayError::Rejected {
                code: -1121,
                message: format!("unknown symbol {symbol}"),
            })
    }

    async fn place_order(&self, req: OrderRequest) -> Result<OrderAck, GatewayError> {
        let mut orders = self.orders.write();

        // Idempotency: a known client id returns the original ack.
        if let Some(existing) = orders.get(&req.client_id) {
            debug!(client_id = %req.client_id, "duplicate client id — returning original ack");
            return Ok(OrderAck {
                client_id: req.client_id.clone(),
                status: existing.status,
            });
        }

        if req.qty <= 0.0 {
            return Err(GatewayError::Rejected {
                code: -1013,
                message: "quantity must be positive".into(),
            });
        }

        let status = OrderStatus::Open;
        debug!(
            client_id = %req.client_id,
            symbol = %req.symbol,
            side = %req.side,
            ?req.kind,
            qty = req.qty,
            reduce_only = req.reduce_only,
            "paper order accepted"
        );
        orders.insert(
            req.client_id.clone(),
            PaperOrder {
                request: req.clone(),
                status,
            },
        );
        Ok(OrderAck {
            client_id: req.client_id,
            status,
        })
    }

    async fn cancel_order(&self, _symbol: &str, client_id: &str) -> Result<(), GatewayError> {
        let mut orders = self.orders.write();
        match orders.get_mut(client_id) {
            Some(order) if !order.status.is_terminal() => {
                order.status = OrderStatus::Cancelled;
                self.events.write().push_back(OrderEvent {
                    client_id: client_id.to_string(),
                    status: OrderStatus::Cancelled,
                    fill_qty: 0.0,
                    fill_price: 0.0,
                    fee: 0.0,
                    timestamp_ms: 0,
                });
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(GatewayError::Rejected {
                code: -2011,
                message: format!("unknown order {client_id}"),
            }),
        }
    }

    async fn poll_events(&self) -> Result<Vec<OrderEvent>, GatewayError> {
        Ok(self.events.write().drain(..).collect())
    }

    /// Match resting orders against a trade print.
    fn on_trade(&self, symbol: &str, price: f64, timestamp_ms: i64) {
        let mut orders = self.orders.write();
        for (client_id, order) in orders.iter_mut() {
            if order.status.is_terminal() || order.request.symbol != symbol {
                continue;
            }
            let filled = match order.request.kind {
                // Market: fill at the next print, whatever it is.
                OrderKind::Market => Some(price),
                // Limit: touch fills at the limit price.
                OrderKind::Limit { price: limit } => match order.request.side {
                    OrderSide::Buy if price <= limit => Some(limit),
                    OrderSide::Sell if price >= limit => Some(limit),
                    _ => None,
                },
                // Stop: trigger crossing fills at the trigger print.
                OrderKind::StopMarket { trigger } => match order.request.side {
                    OrderSide::Buy if price >= trigger => Some(price),
                    OrderSide::Sell if price <= trigger => Some(price),
                    _ => None,
                },
            };
            if let Some(fill_price) = filled {
                order.status = OrderStatus::Filled;
                let fee = fill_price * order.request.qty * PAPER_FEE_BPS / 10_000.0;
                self.events.write().push_back(OrderEvent {
                    client_id: client_id.clone(),
                    status: OrderStatus::Filled,
                    fill_qty: order.request.qty,
                    fill_price,
                    fee,
                    timestamp_ms,
                });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn market(client_id: &str, side: OrderSide, qty: f64) -> OrderRequest {
        OrderRequest {
            client_id: client_id.to_string(),
            symbol: "BTCUSDT".to_string(),
            side,
            kind: OrderKind::Market,
            qty,
            reduce_only: false,
        }
    }

    #[tokio::test]
    async fn market_fills_at_next_trade() {
        let gw = PaperGateway::new(10_000.0);
        gw.place_order(market("m-1", OrderSide::Buy, 1.0))
            .await
            .unwrap();

        assert!(gw.poll_events().await.unwrap().is_empty());

        gw.on_trade("BTCUSDT", 50_000.0, 1_000);
        let events = gw.poll_events().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, OrderStatus::Filled);
        assert!((events[0].fill_price - 50_000.0).abs() < 1e-9);
        assert!((events[0].fill_qty - 1.0).abs() < 1e-9);
        assert!(events[0].fee > 0.0);
    }

    #[tokio::test]
    async fn limit_fills_on_touch_only() {
        let gw = PaperGateway::new(10_000.0);
        gw.place_order(OrderRequest {
            client_id: "l-1".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            kind: OrderKind::Limit { price: 49_900.0 },
            qty: 1.0,
            reduce_only: false,
        })
        .await
        .unwrap();

        gw.on_trade("BTCUSDT", 50_000.0, 1_000);
        assert!(gw.poll_events().await.unwrap().is_empty());

        gw.on_trade("BTCUSDT", 49_890.0, 2_000);
        let events = gw.poll_events().await.unwrap();
        assert_eq!(events.len(), 1);
        assert!((events[0].fill_price - 49_900.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn sell_stop_triggers_below() {
        let gw = PaperGateway::new(10_000.0);
        gw.place_order(OrderRequest {
            client_id: "s-1".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Sell,
            kind: OrderKind::StopMarket { trigger: 49_000.0 },
            qty: 1.0,
            reduce_only: true,
        })
        .await
        .unwrap();

        gw.on_trade("BTCUSDT", 49_500.0, 1_000);
        assert!(gw.poll_events().await.unwrap().is_empty());

        gw.on_trade("BTCUSDT", 48_990.0, 2_000);
        let events = gw.poll_events().await.unwrap();
        assert_eq!(events.len(), 1);
        assert!((events[0].fill_price - 48_990.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn duplicate_client_id_does_not_duplicate() {
        let gw = PaperGateway::new(10_000.0);
        gw.place_order(market("dup", OrderSide::Buy, 1.0))
            .await
            .unwrap();
        gw.place_order(market("dup", OrderSide::Buy, 1.0))
            .await
            .unwrap();

        gw.on_trade("BTCUSDT", 50_000.0, 1_000);
        let events = gw.poll_events().await.unwrap();
        // One live order, one fill.
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn cancel_stops_future_fills() {
        let gw = PaperGateway::new(10_000.0);
        gw.place_order(market("c-1", OrderSide::Buy, 1.0))
            .await
            .unwrap();
        gw.cancel_order("BTCUSDT", "c-1").await.unwrap();
        gw.on_trade("BTCUSDT", 50_000.0, 1_000);

        let events = gw.poll_events().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn unknown_cancel_is_rejected() {
        let gw = PaperGateway::new(10_000.0);
        let err = gw.cancel_order("BTCUSDT", "ghost").await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected { .. }));
    }
}
