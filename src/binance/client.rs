// =============================================================================
// Binance USDⓈ-M Futures REST Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow (default 5 000 ms) to
// tolerate minor clock drift between the engine and Binance servers.
//
// Signed timestamps are local wall clock plus a persisted server-time offset.
// When the local clock drifts from observed server time beyond the configured
// bound, signed calls are refused with `ClockDrift` until a resync succeeds.
//
// Every call passes the shared rate limiter before the wire and feeds the
// venue's used-weight header back into it afterwards. A circuit breaker per
// endpoint class fails fast while the venue is unhealthy; rate-limit
// responses are back-pressure and never count as breaker failures.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use tracing::{debug, info, instrument, warn};

use crate::breaker::CircuitBreaker;
use crate::error::VenueError;
use crate::limiter::{EndpointClass, RateLimiter};
use crate::market_data::Candle;

use super::models::{
    ApiErrorBody, AssetBalance, NewOrderRequest, OpenOrder, OrderAck, PositionRisk,
    PremiumIndex, ServerTime, SymbolFilters,
};

type HmacSha256 = Hmac<Sha256>;

/// Venue error codes that indicate bad credentials or a bad signature.
const SIGNATURE_ERROR_CODES: &[i64] = &[-1022, -2014, -2015];

/// Binance USDⓈ-M futures REST client with typed errors and request signing.
pub struct VenueClient {
    api_key: String,
    secret: String,
    base_url: String,
    http: reqwest::Client,
    limiter: Arc<RateLimiter>,
    order_breaker: CircuitBreaker,
    account_breaker: CircuitBreaker,
    market_breaker: CircuitBreaker,
    /// Server time minus local wall clock, in milliseconds.
    time_offset_ms: AtomicI64,
    /// Whether a baseline sync has happened at all.
    time_synced: AtomicBool,
    /// Cleared when drift beyond the limit is observed; set by a resync.
    clock_ok: AtomicBool,
    drift_limit_ms: i64,
    recv_window_ms: u64,
}

impl VenueClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new `VenueClient`.
    ///
    /// # Arguments
    /// * `api_key` — API key (sent as a header, never in query params).
    /// * `secret`  — secret key used exclusively for HMAC signing.
    /// * `limiter` — shared rate limiter all venue calls go through.
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        limiter: Arc<RateLimiter>,
        drift_limit_ms: i64,
        recv_window_ms: u64,
    ) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        // The API key header is required for all signed endpoints.
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let http = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!("VenueClient initialised (base_url=https://fapi.binance.com)");

        Self {
            api_key,
            secret,
            base_url: "https://fapi.binance.com".to_string(),
            http,
            limiter,
            order_breaker: CircuitBreaker::new("order"),
            account_breaker: CircuitBreaker::new("account"),
            market_breaker: CircuitBreaker::new("market_data"),
            time_offset_ms: AtomicI64::new(0),
            time_synced: AtomicBool::new(false),
            clock_ok: AtomicBool::new(true),
            drift_limit_ms,
            recv_window_ms,
        }
    }

    /// Override the base URL (tests point this at a mock venue).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Local UNIX wall-clock time in milliseconds.
    fn local_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as i64
    }

    /// Venue-corrected timestamp for signed requests.
    fn venue_timestamp_ms(&self) -> i64 {
        Self::local_ms() + self.time_offset_ms.load(Ordering::Relaxed)
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = self.venue_timestamp_ms();
        let rw = self.recv_window_ms;
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={rw}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={rw}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Clock discipline
    // -------------------------------------------------------------------------

    /// Fetch venue server time and update the persisted offset.
    ///
    /// If the local clock has drifted from the predicted server time by more
    /// than the configured bound since the last sync, signed calls are
    /// blocked and `ClockDrift` is returned; the *next* call to `sync_time`
    /// re-baselines the offset and unblocks.
    pub async fn sync_time(&self) -> Result<(), VenueError> {
        let st: ServerTime = self
            .request_public(Method::GET, "/fapi/v1/time", "", 1)
            .await?;
        let local = Self::local_ms();
        let new_offset = st.server_time - local;

        let was_synced = self.time_synced.swap(true, Ordering::Relaxed);
        let old_offset = self.time_offset_ms.swap(new_offset, Ordering::Relaxed);

        if was_synced && self.clock_ok.load(Ordering::Relaxed) {
            let drift = (new_offset - old_offset).abs();
            if drift > self.drift_limit_ms {
                self.clock_ok.store(false, Ordering::Relaxed);
                warn!(
                    drift_ms = drift,
                    limit_ms = self.drift_limit_ms,
                    "clock drift detected, signed calls blocked until resync"
                );
                return Err(VenueError::ClockDrift {
                    drift_ms: drift,
                    limit_ms: self.drift_limit_ms,
                });
            }
        } else {
            // Fresh baseline (first sync, or a resync after drift).
            self.clock_ok.store(true, Ordering::Relaxed);
        }

        debug!(offset_ms = new_offset, "server time synced");
        Ok(())
    }

    fn ensure_clock_ok(&self) -> Result<(), VenueError> {
        if self.clock_ok.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(VenueError::ClockDrift {
                drift_ms: self.drift_limit_ms + 1,
                limit_ms: self.drift_limit_ms,
            })
        }
    }

    // -------------------------------------------------------------------------
    // Account / positions
    // -------------------------------------------------------------------------

    /// Free balance of `asset` from GET /fapi/v2/balance (signed).
    #[instrument(skip(self), name = "venue::get_account_balance")]
    pub async fn get_account_balance(&self, asset: &str) -> Result<Decimal, VenueError> {
        let balances: Vec<AssetBalance> = self
            .request_signed(Method::GET, "/fapi/v2/balance", "", EndpointClass::Account, 5)
            .await?;

        for b in &balances {
            if b.asset == asset {
                debug!(asset, balance = %b.balance, "balance retrieved");
                return Ok(b.balance);
            }
        }

        warn!(asset, "asset not found in balances, returning 0");
        Ok(Decimal::ZERO)
    }

    /// All position-risk rows from GET /fapi/v2/positionRisk (signed).
    /// Flat symbols are included; callers filter with `to_position()`.
    #[instrument(skip(self), name = "venue::get_positions")]
    pub async fn get_positions(&self) -> Result<Vec<PositionRisk>, VenueError> {
        let rows: Vec<PositionRisk> = self
            .request_signed(
                Method::GET,
                "/fapi/v2/positionRisk",
                "",
                EndpointClass::Account,
                5,
            )
            .await?;
        debug!(count = rows.len(), "position risk retrieved");
        Ok(rows)
    }

    // -------------------------------------------------------------------------
    // Market data
    // -------------------------------------------------------------------------

    /// Venue server time in milliseconds (public).
    pub async fn get_server_time(&self) -> Result<i64, VenueError> {
        let st: ServerTime = self
            .request_public(Method::GET, "/fapi/v1/time", "", 1)
            .await?;
        Ok(st.server_time)
    }

    /// Current mark price for `symbol` from GET /fapi/v1/premiumIndex.
    #[instrument(skip(self), name = "venue::get_mark_price")]
    pub async fn get_mark_price(&self, symbol: &str) -> Result<Decimal, VenueError> {
        let idx: PremiumIndex = self
            .request_public(
                Method::GET,
                "/fapi/v1/premiumIndex",
                &format!("symbol={symbol}"),
                1,
            )
            .await?;
        Ok(idx.mark_price)
    }

    /// GET /fapi/v1/klines (public).
    ///
    /// Array indices:
    ///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
    ///   [6] closeTime, ...
    #[instrument(skip(self), name = "venue::get_klines")]
    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, VenueError> {
        let body: serde_json::Value = self
            .request_public(
                Method::GET,
                "/fapi/v1/klines",
                &format!("symbol={symbol}&interval={interval}&limit={limit}"),
                5,
            )
            .await?;

        let raw = body
            .as_array()
            .ok_or_else(|| VenueError::Unknown("klines response is not an array".into()))?;

        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = match entry.as_array() {
                Some(a) if a.len() >= 7 => a,
                _ => {
                    warn!("skipping malformed kline entry");
                    continue;
                }
            };
            candles.push(Candle {
                open_time: arr[0].as_i64().unwrap_or(0),
                open: parse_decimal_value(&arr[1])?,
                high: parse_decimal_value(&arr[2])?,
                low: parse_decimal_value(&arr[3])?,
                close: parse_decimal_value(&arr[4])?,
                volume: parse_decimal_value(&arr[5])?,
                close_time: arr[6].as_i64().unwrap_or(0),
                is_closed: true,
            });
        }

        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    /// Lot-size and notional filters from GET /fapi/v1/exchangeInfo.
    #[instrument(skip(self), name = "venue::get_exchange_filters")]
    pub async fn get_exchange_filters(&self, symbol: &str) -> Result<SymbolFilters, VenueError> {
        let body: serde_json::Value = self
            .request_public(
                Method::GET,
                "/fapi/v1/exchangeInfo",
                &format!("symbol={symbol}"),
                1,
            )
            .await?;

        let info = body["symbols"]
            .as_array()
            .and_then(|arr| arr.first())
            .ok_or_else(|| VenueError::Unknown("symbol not found in exchangeInfo".into()))?;

        SymbolFilters::from_symbol_info(info)
            .ok_or_else(|| VenueError::Unknown("exchangeInfo missing LOT_SIZE filter".into()))
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// POST /fapi/v1/order (signed) — submit a new order.
    #[instrument(skip(self, req), name = "venue::place_order", fields(symbol = %req.symbol, side = %req.side, order_type = %req.order_type))]
    pub async fn place_order(&self, req: &NewOrderRequest) -> Result<OrderAck, VenueError> {
        let ack: OrderAck = self
            .request_signed(
                Method::POST,
                "/fapi/v1/order",
                &req.to_params(),
                EndpointClass::Order,
                1,
            )
            .await?;

        info!(
            symbol = %ack.symbol,
            order_id = ack.order_id,
            client_order_id = %ack.client_order_id,
            status = %ack.status,
            "order placed"
        );
        Ok(ack)
    }

    /// DELETE /fapi/v1/order (signed) — cancel an existing order.
    #[instrument(skip(self), name = "venue::cancel_order")]
    pub async fn cancel_order(&self, symbol: &str, order_id: u64) -> Result<OrderAck, VenueError> {
        let ack: OrderAck = self
            .request_signed(
                Method::DELETE,
                "/fapi/v1/order",
                &format!("symbol={symbol}&orderId={order_id}"),
                EndpointClass::Order,
                1,
            )
            .await?;
        info!(symbol, order_id, "order cancelled");
        Ok(ack)
    }

    /// GET /fapi/v1/openOrders (signed).
    #[instrument(skip(self), name = "venue::get_open_orders")]
    pub async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<OpenOrder>, VenueError> {
        let params = match symbol {
            Some(s) => format!("symbol={s}"),
            None => String::new(),
        };
        let orders: Vec<OpenOrder> = self
            .request_signed(
                Method::GET,
                "/fapi/v1/openOrders",
                &params,
                EndpointClass::Account,
                5,
            )
            .await?;
        debug!(count = orders.len(), "open orders retrieved");
        Ok(orders)
    }

    /// POST /fapi/v1/leverage (signed) — set leverage for a symbol.
    #[instrument(skip(self), name = "venue::set_leverage")]
    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), VenueError> {
        let _: serde_json::Value = self
            .request_signed(
                Method::POST,
                "/fapi/v1/leverage",
                &format!("symbol={symbol}&leverage={leverage}"),
                EndpointClass::Order,
                1,
            )
            .await?;
        info!(symbol, leverage, "leverage set");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    async fn request_public<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &str,
        weight: u32,
    ) -> Result<T, VenueError> {
        self.request(method, path, params.to_string(), false, EndpointClass::MarketData, weight)
            .await
    }

    async fn request_signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &str,
        class: EndpointClass,
        weight: u32,
    ) -> Result<T, VenueError> {
        self.ensure_clock_ok()?;
        self.request(method, path, params.to_string(), true, class, weight)
            .await
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: String,
        signed: bool,
        class: EndpointClass,
        weight: u32,
    ) -> Result<T, VenueError> {
        let breaker = self.breaker(class);
        breaker.check()?;

        self.limiter.acquire(class, weight).await;

        let qs = if signed {
            self.signed_query(&params)
        } else {
            params
        };
        let url = if qs.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, qs)
        };

        let resp = match self.http.request(method, &url).send().await {
            Ok(r) => r,
            Err(e) => {
                breaker.record_failure();
                return Err(VenueError::Network(e.to_string()));
            }
        };

        // Feed the venue's weight ground truth back into the limiter.
        if let Some(used) = header_u32(resp.headers(), "X-MBX-USED-WEIGHT-1M") {
            self.limiter.record_used_weight(used);
        }

        let status = resp.status();
        let retry_after = header_u64(resp.headers(), "Retry-After");
        let body = match resp.text().await {
            Ok(b) => b,
            Err(e) => {
                breaker.record_failure();
                return Err(VenueError::Network(e.to_string()));
            }
        };

        if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
            // Back-pressure, not a fault: the breaker is not informed.
            self.limiter.on_rate_limited(retry_after);
            return Err(VenueError::RateLimited {
                retry_after_secs: retry_after.unwrap_or(120),
            });
        }

        if !status.is_success() {
            let api_err: Option<ApiErrorBody> = serde_json::from_str(&body).ok();
            let err = classify_http_failure(status, api_err, &body);
            match &err {
                // A clean business rejection means the endpoint itself works.
                VenueError::Rejected { .. } => breaker.record_success(),
                _ => breaker.record_failure(),
            }
            return Err(err);
        }

        breaker.record_success();
        serde_json::from_str::<T>(&body).map_err(|e| {
            VenueError::Unknown(format!("failed to decode venue response: {e}: {body}"))
        })
    }

    fn breaker(&self, class: EndpointClass) -> &CircuitBreaker {
        match class {
            EndpointClass::Order => &self.order_breaker,
            EndpointClass::Account => &self.account_breaker,
            EndpointClass::MarketData => &self.market_breaker,
        }
    }
}

/// Map a non-success HTTP response to the error taxonomy.
fn classify_http_failure(
    status: StatusCode,
    api_err: Option<ApiErrorBody>,
    raw_body: &str,
) -> VenueError {
    if status == StatusCode::UNAUTHORIZED {
        return VenueError::Signature(format!("HTTP 401: {raw_body}"));
    }

    if let Some(e) = api_err {
        if SIGNATURE_ERROR_CODES.contains(&e.code) {
            return VenueError::Signature(format!("code {}: {}", e.code, e.msg));
        }
        if status.is_client_error() {
            return VenueError::Rejected {
                code: e.code,
                message: e.msg,
            };
        }
        return VenueError::Unknown(format!("HTTP {} code {}: {}", status, e.code, e.msg));
    }

    VenueError::Unknown(format!("HTTP {status}: {raw_body}"))
}

fn header_u32(headers: &HeaderMap, name: &str) -> Option<u32> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

/// Parse a JSON value that may be either a string or a number into `Decimal`.
fn parse_decimal_value(val: &serde_json::Value) -> Result<Decimal, VenueError> {
    if let Some(s) = val.as_str() {
        s.parse::<Decimal>()
            .map_err(|e| VenueError::Unknown(format!("failed to parse '{s}' as decimal: {e}")))
    } else if let Some(n) = val.as_f64() {
        Decimal::try_from(n)
            .map_err(|e| VenueError::Unknown(format!("failed to convert {n} to decimal: {e}")))
    } else {
        Err(VenueError::Unknown(format!(
            "expected string or number, got: {val}"
        )))
    }
}

impl std::fmt::Debug for VenueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VenueClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> VenueClient {
        let limiter = Arc::new(RateLimiter::new(2400, 0.8));
        VenueClient::new(
            "vmPUZE6mv9SD5VNHk4HlWFsOr6aKE2zvsw0MuIgwCIPy6utIco14y7Ju91duEh8A",
            "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j",
            limiter,
            500,
            5000,
        )
    }

    #[test]
    fn hmac_signature_matches_binance_doc_vector() {
        // Known-answer test from the Binance API signing documentation.
        let client = test_client();
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        let sig = client.sign(query);
        assert_eq!(
            sig,
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn signed_query_carries_timestamp_window_signature() {
        let client = test_client();
        let qs = client.signed_query("symbol=BTCUSDT");
        assert!(qs.starts_with("symbol=BTCUSDT&timestamp="));
        assert!(qs.contains("&recvWindow=5000&"));
        assert!(qs.contains("&signature="));
    }

    #[test]
    fn classify_maps_signature_codes_fatal() {
        let err = classify_http_failure(
            StatusCode::BAD_REQUEST,
            Some(ApiErrorBody {
                code: -1022,
                msg: "Signature for this request is not valid.".into(),
            }),
            "",
        );
        assert!(matches!(err, VenueError::Signature(_)));
        assert!(err.is_fatal());

        let err = classify_http_failure(StatusCode::UNAUTHORIZED, None, "denied");
        assert!(matches!(err, VenueError::Signature(_)));
    }

    #[test]
    fn classify_maps_business_rejection() {
        let err = classify_http_failure(
            StatusCode::BAD_REQUEST,
            Some(ApiErrorBody {
                code: -2019,
                msg: "Margin is insufficient.".into(),
            }),
            "",
        );
        match err {
            VenueError::Rejected { code, message } => {
                assert_eq!(code, -2019);
                assert!(message.contains("Margin"));
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[test]
    fn classify_maps_server_errors_unknown() {
        let err = classify_http_failure(StatusCode::BAD_GATEWAY, None, "upstream down");
        assert!(matches!(err, VenueError::Unknown(_)));
    }

    #[test]
    fn clock_gate_blocks_when_drift_flagged() {
        let client = test_client();
        client.clock_ok.store(false, Ordering::Relaxed);
        let err = client.ensure_clock_ok().unwrap_err();
        assert!(matches!(err, VenueError::ClockDrift { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn parse_decimal_value_both_forms() {
        use rust_decimal_macros::dec;
        assert_eq!(
            parse_decimal_value(&serde_json::json!("95000.5")).unwrap(),
            dec!(95000.5)
        );
        assert_eq!(
            parse_decimal_value(&serde_json::json!(12)).unwrap(),
            dec!(12)
        );
        assert!(parse_decimal_value(&serde_json::json!(null)).is_err());
    }

    #[test]
    fn debug_redacts_credentials() {
        let client = test_client();
        let dbg = format!("{client:?}");
        assert!(dbg.contains("<redacted>"));
        assert!(!dbg.contains("NhqPtmdSJYdK"));
    }
}
