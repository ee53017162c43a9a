// =============================================================================
// REST Broker — HMAC-SHA256 signed brokerage adapter
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Signed requests
// carry the API key as a header plus a signature over the query string and a
// recvWindow to tolerate minor clock drift.
//
// The adapter normalizes everything at this boundary: wire positions use a
// signed quantity, wire rejections use code strings; the engine sees
// LONG/SHORT with positive qty and the BrokerError taxonomy.
// =============================================================================

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

use crate::broker::{Broker, OrderRequest};
use crate::error::BrokerError;
use crate::types::{
    Account, Order, OrderSide, OrderStatus, OrderType, Position, PositionSide,
};

type HmacSha256 = Hmac<Sha256>;

/// Clock skew tolerated between engine and broker on signed requests
/// (milliseconds).
const CLOCK_SKEW_WINDOW_MS: u64 = 5000;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AccountWire {
    equity: f64,
    buying_power: f64,
    #[serde(default)]
    day_pnl_pct: f64,
    #[serde(default)]
    peak_equity: Option<f64>,
    #[serde(default)]
    blocked: bool,
}

#[derive(Debug, Deserialize)]
struct PositionWire {
    symbol: String,
    /// Signed: positive long, negative short.
    qty: f64,
    avg_entry_price: f64,
    #[serde(default)]
    opened_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderWire {
    order_id: String,
    symbol: String,
    side: String,
    qty: f64,
    #[serde(rename = "type")]
    order_type: String,
    #[serde(default)]
    limit_price: Option<f64>,
    status: String,
    #[serde(default)]
    filled_qty: f64,
    #[serde(default)]
    filled_avg_price: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SubmitResponseWire {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorWire {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// REST brokerage adapter with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct RestBroker {
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl RestBroker {
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let api_key = api_key.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MRD-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            secret: secret.into(),
            base_url: base_url.into(),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Request signing
    // -------------------------------------------------------------------------

    /// Build a fully signed request URL for `path`.
    ///
    /// The send time and skew window ride as the last two query pairs, and
    /// the signature covers the complete query string exactly as sent, so
    /// the server can verify it without re-sorting anything.
    fn authed_url(&self, path: &str, params: &[(&str, String)]) -> String {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis();

        let mut pairs: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
        pairs.push(format!("timestamp={now_ms}"));
        pairs.push(format!("recvWindow={CLOCK_SKEW_WINDOW_MS}"));
        let query = pairs.join("&");

        let mut signer = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key size");
        signer.update(query.as_bytes());
        let signature = hex::encode(signer.finalize().into_bytes());

        format!("{}{}?{}&signature={}", self.base_url, path, query, signature)
    }

    // -------------------------------------------------------------------------
    // Error normalization
    // -------------------------------------------------------------------------

    fn transport_error(e: reqwest::Error) -> BrokerError {
        if e.is_timeout() {
            BrokerError::Timeout
        } else {
            BrokerError::Transport(e.to_string())
        }
    }

    /// Map an error body's `code` onto the core taxonomy.
    fn normalize_reject(code: Option<&str>, message: &str) -> BrokerError {
        match code {
            Some("INSUFFICIENT_BUYING_POWER") => BrokerError::InsufficientBuyingPower,
            Some("MARKET_CLOSED") => BrokerError::MarketClosed,
            Some("SYMBOL_NOT_TRADABLE") => BrokerError::SymbolNotTradable,
            Some("RATE_LIMITED") => BrokerError::RateLimited,
            Some("AUTH") => BrokerError::Auth,
            _ => BrokerError::Rejected(message.to_string()),
        }
    }

    async fn check_response(resp: reqwest::Response) -> Result<reqwest::Response, BrokerError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        match status.as_u16() {
            429 => Err(BrokerError::RateLimited),
            401 | 403 => Err(BrokerError::Auth),
            s if s >= 500 => Err(BrokerError::Upstream5xx { status: s }),
            _ => {
                let wire: ErrorWire = resp.json().await.unwrap_or(ErrorWire {
                    code: None,
                    message: None,
                });
                let message = wire.message.unwrap_or_else(|| format!("HTTP {status}"));
                Err(Self::normalize_reject(wire.code.as_deref(), &message))
            }
        }
    }

    // -------------------------------------------------------------------------
    // Wire -> core conversions
    // -------------------------------------------------------------------------

    fn normalize_position(wire: PositionWire) -> Option<Position> {
        if wire.qty == 0.0 {
            return None;
        }
        Some(Position {
            symbol: wire.symbol,
            side: if wire.qty > 0.0 {
                PositionSide::Long
            } else {
                PositionSide::Short
            },
            qty: wire.qty.abs(),
            entry_price: wire.avg_entry_price,
            opened_at: wire.opened_at.unwrap_or_default(),
        })
    }

    fn parse_status(status: &str) -> OrderStatus {
        match status {
            "NEW" => OrderStatus::New,
            "ACCEPTED" => OrderStatus::Accepted,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "FILLED" => OrderStatus::Filled,
            "REJECTED" => OrderStatus::Rejected,
            "CANCELED" | "CANCELLED" => OrderStatus::Canceled,
            other => {
                warn!(status = %other, "unknown order status from broker; treating as NEW");
                OrderStatus::New
            }
        }
    }

    fn normalize_order(wire: OrderWire) -> Order {
        Order {
            order_id: wire.order_id,
            symbol: wire.symbol,
            side: if wire.side == "SELL" {
                OrderSide::Sell
            } else {
                OrderSide::Buy
            },
            qty: wire.qty,
            order_type: if wire.order_type == "MARKET" {
                OrderType::Market
            } else {
                OrderType::Limit
            },
            limit_price: wire.limit_price,
            status: Self::parse_status(&wire.status),
            filled_qty: wire.filled_qty,
            filled_avg_price: wire.filled_avg_price,
        }
    }
}

#[async_trait]
impl Broker for RestBroker {
    #[instrument(skip(self), name = "broker::account")]
    async fn account(&self) -> Result<Account, BrokerError> {
        let url = self.authed_url("/v1/account", &[]);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(Self::transport_error)?;
        let resp = Self::check_response(resp).await?;
        let wire: AccountWire = resp
            .json()
            .await
            .map_err(|e| BrokerError::Other(format!("account parse failed: {e}")))?;

        debug!(equity = wire.equity, buying_power = wire.buying_power, "account fetched");
        Ok(Account {
            equity: wire.equity,
            buying_power: wire.buying_power,
            day_pnl_pct: wire.day_pnl_pct,
            peak_equity: wire.peak_equity.unwrap_or(wire.equity),
            blocked: wire.blocked,
        })
    }

    #[instrument(skip(self), name = "broker::positions")]
    async fn positions(&self) -> Result<Vec<Position>, BrokerError> {
        let url = self.authed_url("/v1/positions", &[]);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(Self::transport_error)?;
        let resp = Self::check_response(resp).await?;
        let wire: Vec<PositionWire> = resp
            .json()
            .await
            .map_err(|e| BrokerError::Other(format!("positions parse failed: {e}")))?;

        Ok(wire.into_iter().filter_map(Self::normalize_position).collect())
    }

    #[instrument(skip(self, req), name = "broker::submit_order")]
    async fn submit_order(&self, req: &OrderRequest) -> Result<String, BrokerError> {
        let order_type = match req.order_type {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
        };
        let mut params: Vec<(&str, String)> = vec![
            ("symbol", req.symbol.clone()),
            ("side", req.side.to_string()),
            ("type", order_type.to_string()),
            ("qty", req.qty.to_string()),
        ];
        if let Some(price) = req.limit_price {
            params.push(("limit_price", price.to_string()));
        }
        if let Some(cid) = &req.client_order_id {
            params.push(("client_order_id", cid.clone()));
        }

        let url = self.authed_url("/v1/orders", &params);

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(Self::transport_error)?;
        let resp = Self::check_response(resp).await?;
        let wire: SubmitResponseWire = resp
            .json()
            .await
            .map_err(|e| BrokerError::Other(format!("submit parse failed: {e}")))?;

        debug!(order_id = %wire.order_id, symbol = %req.symbol, side = %req.side, "order submitted");
        Ok(wire.order_id)
    }

    async fn place_stop(
        &self,
        symbol: &str,
        side: OrderSide,
        stop_price: f64,
        qty: f64,
    ) -> Result<String, BrokerError> {
        let params = [
            ("symbol", symbol.to_string()),
            ("side", side.to_string()),
            ("type", "STOP".to_string()),
            ("stop_price", stop_price.to_string()),
            ("qty", qty.to_string()),
            ("reduce_only", "true".to_string()),
        ];
        let url = self.authed_url("/v1/orders", &params);

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(Self::transport_error)?;
        let resp = Self::check_response(resp).await?;
        let wire: SubmitResponseWire = resp
            .json()
            .await
            .map_err(|e| BrokerError::Other(format!("stop parse failed: {e}")))?;
        Ok(wire.order_id)
    }

    async fn place_target(
        &self,
        symbol: &str,
        side: OrderSide,
        limit_price: f64,
        qty: f64,
    ) -> Result<String, BrokerError> {
        let params = [
            ("symbol", symbol.to_string()),
            ("side", side.to_string()),
            ("type", "LIMIT".to_string()),
            ("limit_price", limit_price.to_string()),
            ("qty", qty.to_string()),
            ("reduce_only", "true".to_string()),
        ];
        let url = self.authed_url("/v1/orders", &params);

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(Self::transport_error)?;
        let resp = Self::check_response(resp).await?;
        let wire: SubmitResponseWire = resp
            .json()
            .await
            .map_err(|e| BrokerError::Other(format!("target parse failed: {e}")))?;
        Ok(wire.order_id)
    }

    #[instrument(skip(self), name = "broker::order")]
    async fn order(&self, order_id: &str) -> Result<Order, BrokerError> {
        let url = self.authed_url(&format!("/v1/orders/{order_id}"), &[]);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(Self::transport_error)?;
        if resp.status().as_u16() == 404 {
            return Err(BrokerError::UnknownOrder(order_id.to_string()));
        }
        let resp = Self::check_response(resp).await?;
        let wire: OrderWire = resp
            .json()
            .await
            .map_err(|e| BrokerError::Other(format!("order parse failed: {e}")))?;
        Ok(Self::normalize_order(wire))
    }

    async fn cancel(&self, order_id: &str) -> Result<(), BrokerError> {
        let url = self.authed_url(&format!("/v1/orders/{order_id}"), &[]);

        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(Self::transport_error)?;
        Self::check_response(resp).await?;
        Ok(())
    }
}

impl std::fmt::Debug for RestBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestBroker")
            .field("base_url", &self.base_url)
            .finish()
    }
}
