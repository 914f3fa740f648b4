// =============================================================================
// Live Gateway — HMAC-SHA256 signed REST wire adapter
// =============================================================================
//
// SECURITY: the secret key is never logged or serialised. All signed
// requests carry the API key as a header and a recvWindow to tolerate minor
// clock drift against the venue.
//
// Fills are reconciled by polling order status for every tracked
// non-terminal client id; the diff against the last seen executed quantity
// becomes the incremental fill event.
// =============================================================================

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use tracing::{debug, warn};

use super::rate_limit::RateLimitTracker;
use super::{
    ExchangeGateway, OrderAck, OrderEvent, OrderKind, OrderRequest, OrderStatus, SymbolMeta,
};
use crate::errors::GatewayError;
use crate::types::OrderSide;

type HmacSha256 = Hmac<Sha256>;

/// recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

struct TrackedOrder {
    symbol: String,
    last_status: OrderStatus,
    last_filled_qty: f64,
}

/// REST client with HMAC-SHA256 request signing.
pub struct LiveGateway {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    limits: RateLimitTracker,
    tracked: RwLock<HashMap<String, TrackedOrder>>,
    quote_asset: String,
}

impl LiveGateway {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();

        let mut default_headers = reqwest::header::HeaderMap::new();
        if let Ok(val) = reqwest::header::HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }
        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key,
            secret: secret.into(),
            base_url: "https://api.binance.com".to_string(),
            client,
            limits: RateLimitTracker::new(),
            tracked: RwLock::new(HashMap::new()),
            quote_asset: "USDT".to_string(),
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // HTTP plumbing
    // -------------------------------------------------------------------------

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &str,
        weight: u32,
    ) -> Result<serde_json::Value, GatewayError> {
        if !self.limits.can_send_request(weight) {
            return Err(GatewayError::RateLimited);
        }

        let url = format!("{}{}?{}", self.base_url, path, query);
        let resp = self
            .client
            .request(method, &url)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(format!("{path}: {e}")))?;

        self.limits.update_from_headers(resp.headers());
        let status = resp.status();
        if status.as_u16() == 429 || status.as_u16() == 418 {
            return Err(GatewayError::RateLimited);
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::Transport(format!("{path}: bad body: {e}")))?;

        if !status.is_success() {
            let code = body["code"].as_i64().unwrap_or(status.as_u16() as i64);
            let message = body["msg"]
                .as_str()
                .unwrap_or("unknown exchange error")
                .to_string();
            return Err(GatewayError::Rejected { code, message });
        }
        Ok(body)
    }

    fn parse_status(raw: &str) -> OrderStatus {
        match raw {
            "NEW" => OrderStatus::Open,
            "PARTIALLY_FILLED" => OrderStatus::Partial,
            "FILLED" => OrderStatus::Filled,
            "CANCELED" | "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatus::Cancelled,
            "REJECTED" => OrderStatus::Rejected,
            _ => OrderStatus::Pending,
        }
    }
}

#[async_trait]
impl ExchangeGateway for LiveGateway {
    /// Free + locked balance of the quote asset.
    async fn account_equity(&self) -> Result<f64, GatewayError> {
        let qs = self.signed_query("");
        let body = self
            .request(reqwest::Method::GET, "/api/v3/account", &qs, 20)
            .await?;

        let balances = body["balances"].as_array().ok_or_else(|| {
            GatewayError::Transport("account response missing balances".into())
        })?;

        for entry in balances {
            if entry["asset"].as_str() == Some(self.quote_asset.as_str()) {
                let free: f64 = entry["free"]
                    .as_str()
                    .unwrap_or("0")
                    .parse()
                    .unwrap_or(0.0);
                let locked: f64 = entry["locked"]
                    .as_str()
                    .unwrap_or("0")
                    .parse()
                    .unwrap_or(0.0);
                return Ok(free + locked);
            }
        }
        warn!(asset = %self.quote_asset, "quote asset not found in balances");
        Ok(0.0)
    }

    async fn symbol_meta(&self, symbol: &str) -> Result<SymbolMeta, GatewayError> {
        let body = self
            .request(
                reqwest::Method::GET,
                "/api/v3/exchangeInfo",
                &format!("symbol={symbol}"),
                20,
            )
            .await?;

        let filters = body["symbols"][0]["filters"].as_array().ok_or_else(|| {
            GatewayError::Transport(format!("exchangeInfo missing filters for {symbol}"))
        })?;

        let mut meta = SymbolMeta {
            tick_size: 0.0,
            step_size: 0.0,
            min_qty: 0.0,
        };
        for filter in filters {
            match filter["filterType"].as_str() {
                Some("PRICE_FILTER") => {
                    meta.tick_size = filter["tickSize"]
                        .as_str()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0.0);
                }
                Some("LOT_SIZE") => {
                    meta.step_size = filter["stepSize"]
                        .as_str()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0.0);
                    meta.min_qty = filter["minQty"]
                        .as_str()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0.0);
                }
                _ => {}
            }
        }
        Ok(meta)
    }

    async fn place_order(&self, req: OrderRequest) -> Result<OrderAck, GatewayError> {
        if !self.limits.can_place_order() {
            return Err(GatewayError::RateLimited);
        }

        let side = match req.side {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        };
        let mut params = format!(
            "symbol={}&side={}&quantity={}&newClientOrderId={}",
            req.symbol, side, req.qty, req.client_id
        );
        match req.kind {
            OrderKind::Market => params.push_str("&type=MARKET"),
            OrderKind::Limit { price } => {
                params.push_str(&format!("&type=LIMIT&timeInForce=GTC&price={price}"));
            }
            OrderKind::StopMarket { trigger } => {
                params.push_str(&format!("&type=STOP_LOSS&stopPrice={trigger}"));
            }
        }

        let qs = self.signed_query(&params);
        let body = self
            .request(reqwest::Method::POST, "/api/v3/order", &qs, 1)
            .await?;
        self.limits.record_order_sent();

        let status = Self::parse_status(body["status"].as_str().unwrap_or("NEW"));
        self.tracked.write().insert(
            req.client_id.clone(),
            TrackedOrder {
                symbol: req.symbol.clone(),
                last_status: status,
                last_filled_qty: 0.0,
            },
        );
        debug!(client_id = %req.client_id, ?status, "live order placed");
        Ok(OrderAck {
            client_id: req.client_id,
            status,
        })
    }

    async fn cancel_order(&self, symbol: &str, client_id: &str) -> Result<(), GatewayError> {
        let params = format!("symbol={symbol}&origClientOrderId={client_id}");
        let qs = self.signed_query(&params);
        self.request(reqwest::Method::DELETE, "/api/v3/order", &qs, 1)
            .await?;
        Ok(())
    }

    /// Reconcile tracked orders against the venue and emit the diffs.
    async fn poll_events(&self) -> Result<Vec<OrderEvent>, GatewayError> {
        let pending: Vec<(String, String)> = self
            .tracked
            .read()
            .iter()
            .filter(|(_, t)| !t.last_status.is_terminal())
            .map(|(id, t)| (id.clone(), t.symbol.clone()))
            .collect();

        let mut events = Vec::new();
        for (client_id, symbol) in pending {
            let params = format!("symbol={symbol}&origClientOrderId={client_id}");
            let qs = self.signed_query(&params);
            let body = match self
                .request(reqwest::Method::GET, "/api/v3/order", &qs, 4)
                .await
            {
                Ok(body) => body,
                Err(e) => {
                    warn!(client_id = %client_id, error = %e, "order status poll failed");
                    continue;
                }
            };

            let status = Self::parse_status(body["status"].as_str().unwrap_or("NEW"));
            let executed: f64 = body["executedQty"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0);
            let cumulative_quote: f64 = body["cummulativeQuoteQty"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0);
            let avg_price = if executed > 0.0 {
                cumulative_quote / executed
            } else {
                0.0
            };

            let mut tracked = self.tracked.write();
            if let Some(entry) = tracked.get_mut(&client_id) {
                let fill_delta = (executed - entry.last_filled_qty).max(0.0);
                if fill_delta > 0.0 || status != entry.last_status {
                    events.push(OrderEvent {
                        client_id: client_id.clone(),
                        status,
                        fill_qty: fill_delta,
                        fill_price: avg_price,
                        fee: 0.0,
                        timestamp_ms: body["updateTime"].as_i64().unwrap_or(0),
                    });
                    entry.last_filled_qty = executed;
                    entry.last_status = status;
                }
            }
        }
        Ok(events)
    }
}

impl std::fmt::Debug for LiveGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveGateway")
            .field("base_url", &self.base_url)
            .field("api_key_set", &!self.api_key.is_empty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_hex() {
        let gw = LiveGateway::new("key", "secret");
        let sig = gw.sign("symbol=BTCUSDT&side=BUY");
        assert_eq!(sig, gw.sign("symbol=BTCUSDT&side=BUY"));
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn status_mapping() {
        assert_eq!(LiveGateway::parse_status("NEW"), OrderStatus::Open);
        assert_eq!(
            LiveGateway::parse_status("PARTIALLY_FILLED"),
            OrderStatus::Partial
        );
        assert_eq!(LiveGateway::parse_status("FILLED"), OrderStatus::Filled);
        assert_eq!(LiveGateway::parse_status("CANCELED"), OrderStatus::Cancelled);
        assert_eq!(LiveGateway::parse_status("REJECTED"), OrderStatus::Rejected);
    }
}
