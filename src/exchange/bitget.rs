use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use base64::Engine;
use chrono::{TimeZone, Utc};
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;

use super::{Exchange, GatewayError};
use crate::models::{
    AccountState, Direction, ExchangePosition, OrderRequest, OrderResult, OrderSide, OrderType,
};

const BITGET_API_BASE: &str = "https://api.bitget.com";
const SUCCESS_CODE: &str = "00000";
const FILL_POLL_ATTEMPTS: u32 = 5;
const FILL_POLL_INTERVAL: Duration = Duration::from_millis(300);

// Bitget error codes for bad key, signature, timestamp, passphrase and IP whitelist
const AUTH_ERROR_CODES: &[&str] = &["40006", "40009", "40012", "40014", "40037"];

type BitgetRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// API key triple for signed Bitget requests
#[derive(Clone)]
pub struct BitgetCredentials {
    pub api_key: String,
    pub secret_key: String,
    pub passphrase: String,
}

impl fmt::Debug for BitgetCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitgetCredentials")
            .field("api_key", &"***")
            .field("secret_key", &"***")
            .field("passphrase", &"***")
            .finish()
    }
}

/// Bitget v2 USDT-margined perpetual futures client.
///
/// Each method makes a single attempt and classifies the failure; retries are
/// the gateway's job. Outbound calls pass through a shared rate limiter so
/// clones never exceed the configured request rate together.
#[derive(Clone)]
pub struct BitgetClient {
    client: Client,
    base_url: String,
    credentials: BitgetCredentials,
    sandbox: bool,
    rate_limiter: Arc<BitgetRateLimiter>,
    fill_poll_attempts: u32,
    fill_poll_interval: Duration,
}

/// Response envelope shared by every v2 endpoint
#[derive(Debug, Deserialize)]
struct Envelope {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerData {
    last_pr: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaceOrderData {
    order_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderDetailData {
    order_id: String,
    #[serde(default)]
    client_oid: String,
    state: String,
    #[serde(default)]
    price_avg: String,
    #[serde(default)]
    base_volume: String,
    #[serde(default)]
    u_time: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountData {
    account_equity: String,
    available: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionData {
    symbol: String,
    hold_side: String,
    total: String,
    open_price_avg: String,
    #[serde(default)]
    mark_price: String,
}

impl BitgetClient {
    /// Create a client. `sandbox` routes every call to Bitget's demo trading environment.
    pub fn new(
        credentials: BitgetCredentials,
        sandbox: bool,
        requests_per_sec: u32,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        let per_sec = NonZeroU32::new(requests_per_sec).context("rate limit must be positive")?;
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(per_sec)));

        Ok(Self {
            client,
            base_url: BITGET_API_BASE.to_string(),
            credentials,
            sandbox,
            rate_limiter,
            fill_poll_attempts: FILL_POLL_ATTEMPTS,
            fill_poll_interval: FILL_POLL_INTERVAL,
        })
    }

    /// Point the client at a different host (used for testing with mock servers)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_fill_polling(mut self, attempts: u32, interval: Duration) -> Self {
        self.fill_poll_attempts = attempts.max(1);
        self.fill_poll_interval = interval;
        self
    }

    pub fn is_sandbox(&self) -> bool {
        self.sandbox
    }

    fn product_type(&self) -> &'static str {
        if self.sandbox {
            "SUSDT-FUTURES"
        } else {
            "USDT-FUTURES"
        }
    }

    fn margin_coin(&self) -> &'static str {
        if self.sandbox {
            "SUSDT"
        } else {
            "USDT"
        }
    }

    /// ACCESS-SIGN: base64(HMAC-SHA256(timestamp + METHOD + requestPath + body))
    fn sign(
        &self,
        timestamp: &str,
        method: &str,
        request_path: &str,
        body: &str,
    ) -> Result<String, GatewayError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.credentials.secret_key.as_bytes())
            .map_err(|e| GatewayError::Authentication(format!("invalid secret key: {}", e)))?;
        mac.update(timestamp.as_bytes());
        mac.update(method.as_bytes());
        mac.update(request_path.as_bytes());
        mac.update(body.as_bytes());
        Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// Send one signed request and unwrap the envelope.
    ///
    /// `mutating` marks requests that may have taken effect even when the
    /// response is lost; those report `UnknownOutcome` instead of a transient error.
    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Value>,
        mutating: bool,
    ) -> Result<T, GatewayError> {
        self.rate_limiter.until_ready().await;

        let request_path = if query.is_empty() {
            path.to_string()
        } else {
            let qs: Vec<String> = query.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            format!("{}?{}", path, qs.join("&"))
        };
        let body_text = body.map(|b| b.to_string()).unwrap_or_default();
        let timestamp = Utc::now().timestamp_millis().to_string();
        let signature = self.sign(&timestamp, method.as_str(), &request_path, &body_text)?;

        let mut request = self
            .client
            .request(method, format!("{}{}", self.base_url, request_path))
            .header("ACCESS-KEY", &self.credentials.api_key)
            .header("ACCESS-SIGN", signature)
            .header("ACCESS-TIMESTAMP", &timestamp)
            .header("ACCESS-PASSPHRASE", &self.credentials.passphrase)
            .header("Content-Type", "application/json")
            .header("locale", "en-US");
        if self.sandbox {
            request = request.header("paptrading", "1");
        }
        if !body_text.is_empty() {
            request = request.body(body_text);
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_transport(&e, mutating))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        let text = response
            .text()
            .await
            .map_err(|e| classify_transport(&e, mutating))?;
        let envelope: Option<Envelope> = serde_json::from_str(&text).ok();

        if !status.is_success() {
            let (code, msg) = match &envelope {
                Some(env) => (Some(env.code.as_str()), env.msg.as_str()),
                None => (None, text.as_str()),
            };
            return Err(unconfirmed(
                classify_status(status, code, msg, retry_after),
                mutating,
            ));
        }

        let envelope = envelope.ok_or_else(|| {
            let err = GatewayError::TransientNetwork(format!("malformed response from {}", path));
            unconfirmed(err, mutating)
        })?;
        if envelope.code != SUCCESS_CODE {
            return Err(classify_status(
                status,
                Some(&envelope.code),
                &envelope.msg,
                retry_after,
            ));
        }

        serde_json::from_value(envelope.data).map_err(|e| {
            let err =
                GatewayError::TransientNetwork(format!("unexpected payload from {}: {}", path, e));
            unconfirmed(err, mutating)
        })
    }

    async fn submit_market_order(
        &self,
        request: &OrderRequest,
    ) -> Result<OrderResult, GatewayError> {
        let mut body = json!({
            "symbol": request.symbol,
            "productType": self.product_type(),
            "marginMode": "crossed",
            "marginCoin": self.margin_coin(),
            "size": format_decimal(request.quantity)?,
            "side": request.side.as_str(),
            "orderType": "market",
            "clientOid": request.client_order_id,
            "reduceOnly": if request.reduce_only { "YES" } else { "NO" },
        });
        if let Some(stop) = request.preset_stop_loss {
            body["presetStopLossPrice"] = Value::String(format_decimal(stop)?);
        }

        let placed: PlaceOrderData = self
            .send(Method::POST, "/api/v2/mix/order/place-order", &[], Some(body), true)
            .await?;

        tracing::debug!(
            order_id = %placed.order_id,
            client_order_id = %request.client_order_id,
            "Order accepted, awaiting fill"
        );

        self.await_fill(&request.symbol, &placed.order_id, request).await
    }

    /// Poll order detail until the market order reports filled
    async fn await_fill(
        &self,
        symbol: &str,
        order_id: &str,
        request: &OrderRequest,
    ) -> Result<OrderResult, GatewayError> {
        for attempt in 1..=self.fill_poll_attempts {
            let query = [
                ("symbol", symbol),
                ("productType", self.product_type()),
                ("orderId", order_id),
            ];
            match self
                .send::<OrderDetailData>(
                    Method::GET,
                    "/api/v2/mix/order/detail",
                    &query,
                    None,
                    false,
                )
                .await
            {
                Ok(detail) if detail.state == "filled" => {
                    let fill_price = parse_number(&detail.price_avg, "priceAvg")
                        .map_err(|e| GatewayError::UnknownOutcome(e.to_string()))?;
                    let filled_quantity = parse_number(&detail.base_volume, "baseVolume")
                        .map_err(|e| GatewayError::UnknownOutcome(e.to_string()))?;
                    let timestamp = detail
                        .u_time
                        .parse::<i64>()
                        .ok()
                        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                        .unwrap_or_else(Utc::now);
                    let client_order_id = if detail.client_oid.is_empty() {
                        request.client_order_id.clone()
                    } else {
                        detail.client_oid
                    };
                    return Ok(OrderResult {
                        order_id: detail.order_id,
                        client_order_id,
                        fill_price,
                        filled_quantity,
                        timestamp,
                    });
                }
                Ok(detail) if detail.state == "canceled" || detail.state == "cancelled" => {
                    return Err(GatewayError::Validation(format!(
                        "order {} was canceled by the exchange",
                        order_id
                    )));
                }
                Ok(detail) => {
                    tracing::debug!(
                        order_id,
                        state = %detail.state,
                        attempt,
                        "Order not filled yet"
                    );
                }
                Err(GatewayError::Authentication(msg)) => {
                    return Err(GatewayError::Authentication(msg));
                }
                Err(e) => {
                    tracing::debug!(order_id, attempt, error = %e, "Order detail lookup failed");
                }
            }
            tokio::time::sleep(self.fill_poll_interval).await;
        }

        Err(GatewayError::UnknownOutcome(format!(
            "order {} accepted but fill not confirmed",
            order_id
        )))
    }

    /// Move the position-level stop loss
    async fn submit_stop_update(
        &self,
        request: &OrderRequest,
    ) -> Result<OrderResult, GatewayError> {
        let trigger = request.price.ok_or_else(|| {
            GatewayError::Validation("stop order requires a trigger price".to_string())
        })?;
        // The closing side identifies which leg the stop protects
        let hold_side = match request.side {
            OrderSide::Sell => "long",
            OrderSide::Buy => "short",
        };
        let body = json!({
            "marginCoin": self.margin_coin(),
            "productType": self.product_type(),
            "symbol": request.symbol,
            "stopLossTriggerPrice": format_decimal(trigger)?,
            "stopLossTriggerType": "mark_price",
            "holdSide": hold_side,
            "stopLossClientOid": request.client_order_id,
        });

        let data: Value = self
            .send(Method::POST, "/api/v2/mix/order/place-pos-tpsl", &[], Some(body), true)
            .await?;

        let order_id = data
            .as_array()
            .and_then(|orders| orders.first())
            .and_then(|o| o.get("orderId"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(OrderResult {
            order_id,
            client_order_id: request.client_order_id.clone(),
            fill_price: trigger,
            filled_quantity: 0.0,
            timestamp: Utc::now(),
        })
    }
}

impl Exchange for BitgetClient {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResult, GatewayError> {
        match request.order_type {
            OrderType::Market => self.submit_market_order(request).await,
            OrderType::StopLoss => self.submit_stop_update(request).await,
        }
    }

    async fn fetch_price(&self, symbol: &str) -> Result<f64, GatewayError> {
        let query = [("symbol", symbol), ("productType", self.product_type())];
        let tickers: Vec<TickerData> = self
            .send(Method::GET, "/api/v2/mix/market/ticker", &query, None, false)
            .await?;

        let ticker = tickers.first().ok_or_else(|| {
            GatewayError::Validation(format!("no ticker returned for {}", symbol))
        })?;
        let price = parse_number(&ticker.last_pr, "lastPr")?;
        if price <= 0.0 {
            return Err(GatewayError::TransientNetwork(format!(
                "non-positive price {} for {}",
                price, symbol
            )));
        }
        Ok(price)
    }

    async fn fetch_account(&self, symbol: &str) -> Result<AccountState, GatewayError> {
        let query = [
            ("symbol", symbol),
            ("productType", self.product_type()),
            ("marginCoin", self.margin_coin()),
        ];

        let account: AccountData = self
            .send(Method::GET, "/api/v2/mix/account/account", &query, None, false)
            .await?;
        let raw_positions: Vec<PositionData> = self
            .send(Method::GET, "/api/v2/mix/position/single-position", &query, None, false)
            .await?;

        let mut positions = Vec::new();
        for raw in raw_positions {
            let size = parse_number(&raw.total, "total")?;
            if size <= 0.0 {
                continue;
            }
            let side = match raw.hold_side.as_str() {
                "long" => Direction::Long,
                "short" => Direction::Short,
                other => {
                    return Err(GatewayError::TransientNetwork(format!(
                        "unknown holdSide '{}'",
                        other
                    )))
                }
            };
            let entry_price = parse_number(&raw.open_price_avg, "openPriceAvg")?;
            let mark_price = if raw.mark_price.is_empty() {
                entry_price
            } else {
                parse_number(&raw.mark_price, "markPrice")?
            };
            positions.push(ExchangePosition {
                symbol: raw.symbol,
                side,
                size,
                entry_price,
                mark_price,
            });
        }

        Ok(AccountState {
            equity: parse_number(&account.account_equity, "accountEquity")?,
            available: parse_number(&account.available, "available")?,
            positions,
        })
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), GatewayError> {
        let body = json!({
            "symbol": symbol,
            "productType": self.product_type(),
            "marginCoin": self.margin_coin(),
            "leverage": leverage.to_string(),
        });
        let _: Value = self
            .send(Method::POST, "/api/v2/mix/account/set-leverage", &[], Some(body), false)
            .await?;
        Ok(())
    }

    fn supports_stop_orders(&self) -> bool {
        true
    }
}

fn classify_transport(err: &reqwest::Error, mutating: bool) -> GatewayError {
    if err.is_connect() || !mutating {
        GatewayError::TransientNetwork(err.to_string())
    } else {
        // Request may have reached the exchange
        GatewayError::UnknownOutcome(err.to_string())
    }
}

/// A mutating request that failed on the server side may still have been applied
fn unconfirmed(err: GatewayError, mutating: bool) -> GatewayError {
    match err {
        GatewayError::TransientNetwork(detail) if mutating => GatewayError::UnknownOutcome(detail),
        other => other,
    }
}

fn classify_status(
    status: StatusCode,
    code: Option<&str>,
    msg: &str,
    retry_after: Option<Duration>,
) -> GatewayError {
    let detail = match code {
        Some(code) => format!("{} {}: {}", status.as_u16(), code, msg),
        None => format!("{}: {}", status.as_u16(), msg),
    };

    if status == StatusCode::TOO_MANY_REQUESTS || code == Some("429") {
        return GatewayError::RateLimited { retry_after };
    }
    if status.is_server_error() {
        return GatewayError::TransientNetwork(detail);
    }
    if status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || code.is_some_and(|c| AUTH_ERROR_CODES.contains(&c))
    {
        return GatewayError::Authentication(detail);
    }
    GatewayError::Validation(detail)
}

fn parse_number(raw: &str, field: &str) -> Result<f64, GatewayError> {
    raw.trim().parse::<f64>().map_err(|_| {
        GatewayError::TransientNetwork(format!("invalid {} value '{}'", field, raw))
    })
}

/// Render a quantity or price the way the exchange expects: plain decimal, no exponent
fn format_decimal(value: f64) -> Result<String, GatewayError> {
    Decimal::from_f64_retain(value)
        .map(|d| d.round_dp(8).normalize().to_string())
        .ok_or_else(|| GatewayError::Validation(format!("cannot encode {} as decimal", value)))
}
