use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{TimeZone, Utc};
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use std::num::NonZeroU32;
use std::sync::Arc;

use super::{ExchangeApi, ExchangeEnvironment};
use crate::candles::Timeframe;
use crate::error::ExchangeError;
use crate::models::{
    normalize_symbol, AccountBalance, Action, Candle, ExchangePosition, InstrumentInfo, MarginMode,
    OrderRequest, OrderResponse, OrderStatus, OrderType, PositionMode, PositionSide, Ticker,
};

pub const OKX_API_BASE: &str = "https://www.okx.com";

/// Most rows the candles endpoint returns per request
const MAX_CANDLE_LIMIT: usize = 300;

/// OKX codes for bad or expired credentials
const AUTH_ERROR_CODES: &[&str] = &["50100", "50101", "50102", "50103", "50104", "50105", "50111", "50112", "50113", "50114"];

type OkxRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct OkxConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub api_passphrase: String,
    /// Value of the `x-simulated-trading` header; "0" on the production venue
    pub simulated_trading: String,
    pub sandbox: bool,
    pub requests_per_second: u32,
    /// `tdMode` for orders and `mgnMode` for leverage
    pub margin_mode: MarginMode,
}

impl Default for OkxConfig {
    fn default() -> Self {
        Self {
            base_url: OKX_API_BASE.to_string(),
            api_key: String::new(),
            api_secret: String::new(),
            api_passphrase: String::new(),
            simulated_trading: "0".to_string(),
            sandbox: false,
            requests_per_second: 10,
            margin_mode: MarginMode::Cross,
        }
    }
}

// ============== Response Types ==============

#[derive(Debug, Deserialize)]
struct OkxResponse<T> {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInstrument {
    inst_id: String,
    #[serde(default)]
    ct_val: String,
    #[serde(default)]
    lot_sz: String,
    #[serde(default)]
    min_sz: String,
    #[serde(default)]
    tick_sz: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTicker {
    inst_id: String,
    last: String,
    #[serde(default)]
    bid_px: String,
    #[serde(default)]
    ask_px: String,
    ts: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBalance {
    #[serde(default)]
    total_eq: String,
    #[serde(default)]
    details: Vec<RawBalanceDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBalanceDetail {
    ccy: String,
    #[serde(default)]
    avail_eq: String,
    #[serde(default)]
    avail_bal: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPosition {
    inst_id: String,
    #[serde(default)]
    pos_side: String,
    #[serde(default)]
    pos: String,
    #[serde(default)]
    avg_px: String,
    #[serde(default)]
    lever: String,
    #[serde(default)]
    mgn_mode: String,
    #[serde(default)]
    upl: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOrder {
    ord_id: String,
    #[serde(default)]
    cl_ord_id: String,
    inst_id: String,
    side: String,
    ord_type: String,
    sz: String,
    #[serde(default)]
    px: String,
    #[serde(default)]
    acc_fill_sz: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    c_time: String,
    #[serde(default)]
    pos_side: String,
    #[serde(default)]
    reduce_only: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOrderAck {
    #[serde(default)]
    ord_id: String,
    #[serde(default)]
    cl_ord_id: String,
    #[serde(default)]
    s_code: String,
    #[serde(default)]
    s_msg: String,
}

// ============== Parsing helpers ==============

fn parse_f64(value: &str, field: &str) -> Result<f64, ExchangeError> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| ExchangeError::Decode(format!("invalid {} '{}'", field, value)))
}

/// Empty strings are how OKX reports "not applicable"
fn parse_opt_f64(value: &str) -> Option<f64> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        value.parse().ok()
    }
}

fn parse_timestamp(ms: &str) -> chrono::DateTime<Utc> {
    ms.trim()
        .parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}

fn parse_action(side: &str) -> Result<Action, ExchangeError> {
    match side {
        "buy" => Ok(Action::Buy),
        "sell" => Ok(Action::Sell),
        other => Err(ExchangeError::Decode(format!("invalid side '{}'", other))),
    }
}

fn classify_api_error(code: String, message: String) -> ExchangeError {
    if AUTH_ERROR_CODES.contains(&code.as_str()) {
        ExchangeError::Auth(format!("[{}] {}", code, message))
    } else {
        ExchangeError::Api { code, message }
    }
}

fn encode_query(query: &[(&str, String)]) -> String {
    query
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Base64 HMAC-SHA256 over `timestamp + method + request_path + body`
pub fn sign_request(secret: &str, timestamp: &str, method: &str, request_path: &str, body: &str) -> Result<String, ExchangeError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::Auth(format!("invalid API secret: {}", e)))?;
    mac.update(timestamp.as_bytes());
    mac.update(method.as_bytes());
    mac.update(request_path.as_bytes());
    mac.update(body.as_bytes());
    Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

/// OKX REST v5 client for USDT-margined swaps
///
/// Cloneable; clones share the HTTP pool and the rate limiter.
#[derive(Clone)]
pub struct OkxClient {
    client: Client,
    config: OkxConfig,
    rate_limiter: Arc<OkxRateLimiter>,
}

impl OkxClient {
    pub fn new(config: OkxConfig) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| ExchangeError::Network(format!("failed to build HTTP client: {}", e)))?;

        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(per_second)));

        tracing::info!(
            "🔌 OKX client: base_url={} simulated_trading={} rate={}/s",
            config.base_url,
            config.simulated_trading,
            per_second
        );

        Ok(Self {
            client,
            config,
            rate_limiter,
        })
    }

    fn headers(&self, method: &Method, request_path: &str, body: &str, signed: bool) -> Result<HeaderMap, ExchangeError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-simulated-trading",
            HeaderValue::from_str(&self.config.simulated_trading)
                .map_err(|e| ExchangeError::Auth(format!("invalid simulated-trading header: {}", e)))?,
        );
        if !signed {
            return Ok(headers);
        }

        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
        let signature = sign_request(&self.config.api_secret, &timestamp, method.as_str(), request_path, body)?;

        let header = |value: &str, name: &str| {
            HeaderValue::from_str(value).map_err(|e| ExchangeError::Auth(format!("invalid {} header: {}", name, e)))
        };
        headers.insert("ok-access-key", header(&self.config.api_key, "OK-ACCESS-KEY")?);
        headers.insert("ok-access-sign", header(&signature, "OK-ACCESS-SIGN")?);
        headers.insert("ok-access-timestamp", header(&timestamp, "OK-ACCESS-TIMESTAMP")?);
        headers.insert("ok-access-passphrase", header(&self.config.api_passphrase, "OK-ACCESS-PASSPHRASE")?);
        Ok(headers)
    }

    /// Rate-limited request returning the `data` array of the response envelope
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
        signed: bool,
    ) -> Result<Vec<T>, ExchangeError> {
        self.rate_limiter.until_ready().await;

        let request_path = if query.is_empty() {
            path.to_string()
        } else {
            format!("{}?{}", path, encode_query(query))
        };
        let body = body.map(|b| b.to_string()).unwrap_or_default();
        let headers = self.headers(&method, &request_path, &body, signed)?;
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), request_path);

        tracing::debug!("OKX {} {}", method, request_path);
        let mut builder = self.client.request(method, &url).headers(headers);
        if !body.is_empty() {
            builder = builder.body(body);
        }
        let response = builder.send().await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000);
            return Err(ExchangeError::RateLimited { retry_after_ms });
        }

        let text = response.text().await?;
        if status == StatusCode::UNAUTHORIZED {
            return Err(ExchangeError::Auth(text));
        }

        let envelope: OkxResponse<T> = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(_) if status.is_server_error() => {
                return Err(ExchangeError::Network(format!("HTTP {}: {}", status, text)));
            }
            Err(e) => return Err(e.into()),
        };
        if envelope.code != "0" {
            return Err(classify_api_error(envelope.code, envelope.msg));
        }
        Ok(envelope.data)
    }

    async fn post_setting(&self, path: &str, body: serde_json::Value) -> Result<(), ExchangeError> {
        self.request::<serde_json::Value>(Method::POST, path, &[], Some(body), true)
            .await
            .map(|_| ())
    }

    fn to_order_response(raw: RawOrder) -> Result<OrderResponse, ExchangeError> {
        let amount = parse_f64(&raw.sz, "sz")?;
        let filled = parse_opt_f64(&raw.acc_fill_sz).unwrap_or(0.0);
        let status = match raw.state.as_str() {
            "partially_filled" => OrderStatus::PartiallyFilled,
            "filled" => OrderStatus::Filled,
            "canceled" | "mmp_canceled" => OrderStatus::Canceled,
            _ => OrderStatus::Open,
        };
        Ok(OrderResponse {
            id: raw.ord_id,
            client_order_id: Some(raw.cl_ord_id).filter(|id| !id.is_empty()),
            symbol: raw.inst_id,
            side: parse_action(&raw.side)?,
            order_type: if raw.ord_type == "market" {
                OrderType::Market
            } else {
                OrderType::Limit
            },
            amount,
            price: parse_opt_f64(&raw.px),
            filled,
            remaining: (amount - filled).max(0.0),
            status,
            timestamp: parse_timestamp(&raw.c_time),
            pos_side: PositionSide::parse(&raw.pos_side).filter(|s| *s != PositionSide::None),
            reduce_only: raw.reduce_only == "true",
            realized_pnl: None,
        })
    }
}

#[async_trait]
impl ExchangeApi for OkxClient {
    fn environment(&self) -> ExchangeEnvironment {
        ExchangeEnvironment {
            sandbox: self.config.sandbox,
            simulated_trading: Some(self.config.simulated_trading.clone()),
            endpoints: vec![self.config.base_url.clone()],
        }
    }

    async fn load_markets(&self) -> Result<Vec<InstrumentInfo>, ExchangeError> {
        let raw: Vec<RawInstrument> = self
            .request(
                Method::GET,
                "/api/v5/public/instruments",
                &[("instType", "SWAP".to_string())],
                None,
                false,
            )
            .await?;

        let mut instruments = Vec::with_capacity(raw.len());
        for inst in raw {
            let (Some(ct_val), Some(lot_sz), Some(min_sz)) = (
                parse_opt_f64(&inst.ct_val),
                parse_opt_f64(&inst.lot_sz),
                parse_opt_f64(&inst.min_sz),
            ) else {
                tracing::debug!("Skipping instrument {} with incomplete metadata", inst.inst_id);
                continue;
            };
            instruments.push(InstrumentInfo {
                symbol: inst.inst_id,
                ct_val,
                lot_sz,
                min_sz,
                tick_sz: parse_opt_f64(&inst.tick_sz).unwrap_or(0.0),
            });
        }
        tracing::debug!("Loaded {} OKX swap instruments", instruments.len());
        Ok(instruments)
    }

    async fn fetch_ohlcv(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Candle>, ExchangeError> {
        let inst_id = normalize_symbol(symbol);
        let limit = limit.clamp(1, MAX_CANDLE_LIMIT);
        let rows: Vec<Vec<String>> = self
            .request(
                Method::GET,
                "/api/v5/market/candles",
                &[
                    ("instId", inst_id),
                    ("bar", timeframe.okx_bar().to_string()),
                    ("limit", limit.to_string()),
                ],
                None,
                false,
            )
            .await?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows.iter() {
            if row.len() < 6 {
                return Err(ExchangeError::Decode(format!("candle row has {} fields", row.len())));
            }
            let mut values = [0.0; 6];
            for (i, value) in values.iter_mut().enumerate() {
                *value = parse_f64(&row[i], "candle field")?;
            }
            candles.push(Candle::from_row(values));
        }
        // OKX returns newest first
        candles.reverse();
        Ok(candles)
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let inst_id = normalize_symbol(symbol);
        let raw: Vec<RawTicker> = self
            .request(Method::GET, "/api/v5/market/ticker", &[("instId", inst_id.clone())], None, false)
            .await?;
        let ticker = raw
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::UnknownInstrument(inst_id))?;

        Ok(Ticker {
            last: parse_f64(&ticker.last, "last")?,
            bid: parse_opt_f64(&ticker.bid_px),
            ask: parse_opt_f64(&ticker.ask_px),
            timestamp: parse_timestamp(&ticker.ts),
            symbol: ticker.inst_id,
        })
    }

    async fn fetch_balance(&self) -> Result<AccountBalance, ExchangeError> {
        let raw: Vec<RawBalance> = self
            .request(Method::GET, "/api/v5/account/balance", &[("ccy", "USDT".to_string())], None, true)
            .await?;
        let account = raw
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::Decode("empty balance response".into()))?;

        let total_equity = parse_f64(&account.total_eq, "totalEq")?;
        let available = account
            .details
            .iter()
            .find(|d| d.ccy == "USDT")
            .and_then(|d| parse_opt_f64(&d.avail_eq).or_else(|| parse_opt_f64(&d.avail_bal)))
            .unwrap_or(total_equity);

        Ok(AccountBalance { total_equity, available })
    }

    async fn fetch_positions(&self, symbol: Option<&str>) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let mut query = vec![("instType", "SWAP".to_string())];
        if let Some(symbol) = symbol {
            query.push(("instId", normalize_symbol(symbol)));
        }
        let raw: Vec<RawPosition> = self
            .request(Method::GET, "/api/v5/account/positions", &query, None, true)
            .await?;

        let mut positions = Vec::with_capacity(raw.len());
        for p in raw {
            let pos = parse_opt_f64(&p.pos).unwrap_or(0.0);
            // Net mode reports one signed position per instrument
            let side = match PositionSide::parse(&p.pos_side) {
                Some(PositionSide::None) | None if pos < 0.0 => PositionSide::Short,
                Some(PositionSide::None) | None => PositionSide::Long,
                Some(side) => side,
            };
            positions.push(ExchangePosition {
                symbol: p.inst_id,
                side,
                contracts: pos.abs(),
                entry_price: parse_opt_f64(&p.avg_px).unwrap_or(0.0),
                leverage: parse_opt_f64(&p.lever).map(|l| l.round() as u32).unwrap_or(1),
                margin_mode: if p.mgn_mode == "isolated" {
                    MarginMode::Isolated
                } else {
                    MarginMode::Cross
                },
                unrealized_pnl: parse_opt_f64(&p.upl).unwrap_or(0.0),
            });
        }
        Ok(positions)
    }

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderResponse>, ExchangeError> {
        let mut query = vec![("instType", "SWAP".to_string())];
        if let Some(symbol) = symbol {
            query.push(("instId", normalize_symbol(symbol)));
        }
        let raw: Vec<RawOrder> = self
            .request(Method::GET, "/api/v5/trade/orders-pending", &query, None, true)
            .await?;
        raw.into_iter().map(Self::to_order_response).collect()
    }

    async fn create_order(&self, request: &OrderRequest) -> Result<OrderResponse, ExchangeError> {
        let inst_id = normalize_symbol(&request.symbol);
        let mut body = json!({
            "instId": inst_id,
            "tdMode": self.config.margin_mode.as_str(),
            "side": request.side.as_str(),
            "ordType": request.order_type.as_str(),
            "sz": request.amount.to_string(),
        });
        if let Some(price) = request.price {
            body["px"] = json!(price.to_string());
        }
        if let Some(pos_side) = request.pos_side.filter(|s| *s != PositionSide::None) {
            body["posSide"] = json!(pos_side.as_str());
        }
        if request.reduce_only {
            body["reduceOnly"] = json!(true);
        }
        if let Some(cl_ord_id) = &request.client_order_id {
            body["clOrdId"] = json!(cl_ord_id);
        }

        let acks: Vec<RawOrderAck> = self
            .request(Method::POST, "/api/v5/trade/order", &[], Some(body), true)
            .await?;
        let ack = acks
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::Decode("empty order response".into()))?;
        if !ack.s_code.is_empty() && ack.s_code != "0" {
            return Err(classify_api_error(ack.s_code, ack.s_msg));
        }

        Ok(OrderResponse {
            id: ack.ord_id,
            client_order_id: Some(ack.cl_ord_id)
                .filter(|id| !id.is_empty())
                .or_else(|| request.client_order_id.clone()),
            symbol: inst_id,
            side: request.side,
            order_type: request.order_type,
            amount: request.amount,
            price: request.price,
            filled: 0.0,
            remaining: request.amount,
            status: OrderStatus::Open,
            timestamp: Utc::now(),
            pos_side: request.pos_side,
            reduce_only: request.reduce_only,
            realized_pnl: None,
        })
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<(), ExchangeError> {
        let acks: Vec<RawOrderAck> = self
            .request(
                Method::POST,
                "/api/v5/trade/cancel-order",
                &[],
                Some(json!({ "instId": normalize_symbol(symbol), "ordId": order_id })),
                true,
            )
            .await?;
        match acks.into_iter().next() {
            Some(ack) if !ack.s_code.is_empty() && ack.s_code != "0" => Err(classify_api_error(ack.s_code, ack.s_msg)),
            _ => Ok(()),
        }
    }

    async fn set_leverage(
        &self,
        symbol: &str,
        leverage: u32,
        margin_mode: MarginMode,
        pos_side: Option<PositionSide>,
    ) -> Result<(), ExchangeError> {
        let mut body = json!({
            "instId": normalize_symbol(symbol),
            "lever": leverage.to_string(),
            "mgnMode": margin_mode.as_str(),
        });
        // posSide only applies to isolated margin in hedge mode
        if let Some(pos_side) = pos_side.filter(|s| *s != PositionSide::None) {
            if margin_mode == MarginMode::Isolated {
                body["posSide"] = json!(pos_side.as_str());
            }
        }
        self.post_setting("/api/v5/account/set-leverage", body).await
    }

    async fn set_position_mode(&self, mode: PositionMode) -> Result<(), ExchangeError> {
        self.post_setting(
            "/api/v5/account/set-position-mode",
            json!({ "posMode": mode.as_okx_str() }),
        )
        .await
    }

    /// OKX has no standalone margin-mode switch; it is applied through leverage
    async fn set_margin_mode(&self, symbol: &str, margin_mode: MarginMode, leverage: u32) -> Result<(), ExchangeError> {
        self.set_leverage(symbol, leverage, margin_mode, None).await
    }
}
