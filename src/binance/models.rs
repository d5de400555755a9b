// =============================================================================
// Typed payloads for the Binance USDⓈ-M futures REST API
// =============================================================================
//
// Binance encodes most numbers as JSON strings; every money field here is a
// `Decimal`, which deserialises from either form. Unknown keys are ignored so
// venue-side additions never break parsing.
// =============================================================================

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{Position, Side};

/// GET /fapi/v1/time
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTime {
    pub server_time: i64,
}

/// One element of GET /fapi/v2/balance
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetBalance {
    pub asset: String,
    pub balance: Decimal,
    pub available_balance: Decimal,
}

/// One element of GET /fapi/v2/positionRisk
///
/// `position_amt` is signed: negative means short.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRisk {
    pub symbol: String,
    pub position_amt: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    #[serde(rename = "unRealizedProfit")]
    pub unrealized_profit: Decimal,
    pub leverage: Decimal,
}

impl PositionRisk {
    /// Convert to the engine's position model. Zero-quantity rows (flat
    /// symbols) yield `None`.
    pub fn to_position(&self) -> Option<Position> {
        if self.position_amt.is_zero() {
            return None;
        }
        let side = if self.position_amt.is_sign_positive() {
            Side::Long
        } else {
            Side::Short
        };
        Some(Position {
            symbol: self.symbol.clone(),
            side,
            quantity: self.position_amt.abs(),
            entry_price: self.entry_price,
            mark_price: self.mark_price,
            unrealized_pnl: self.unrealized_profit,
            leverage: self.leverage.to_u32().unwrap_or(1),
            is_ghost: false,
            intent_id: None,
        })
    }
}

/// GET /fapi/v1/premiumIndex
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PremiumIndex {
    pub symbol: String,
    pub mark_price: Decimal,
}

/// Response to order placement / cancellation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    pub order_id: u64,
    pub client_order_id: String,
    pub symbol: String,
    pub status: String,
    #[serde(default)]
    pub avg_price: Option<Decimal>,
    #[serde(default)]
    pub executed_qty: Option<Decimal>,
    #[serde(default)]
    pub orig_qty: Option<Decimal>,
}

/// One element of GET /fapi/v1/openOrders
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOrder {
    pub order_id: u64,
    pub client_order_id: String,
    pub symbol: String,
    #[serde(rename = "type")]
    pub order_type: String,
    pub side: String,
    #[serde(default)]
    pub stop_price: Option<Decimal>,
    #[serde(default)]
    pub reduce_only: bool,
}

/// Venue error body: `{"code": -2019, "msg": "Margin is insufficient."}`
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub code: i64,
    pub msg: String,
}

/// Lot-size and notional constraints extracted from exchangeInfo filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolFilters {
    pub step_size: Decimal,
    pub min_qty: Decimal,
    pub min_notional: Decimal,
}

impl SymbolFilters {
    /// Parse the `filters` array of one exchangeInfo symbol entry.
    pub fn from_symbol_info(info: &serde_json::Value) -> Option<Self> {
        let filters = info.get("filters")?.as_array()?;

        let mut step_size = None;
        let mut min_qty = None;
        let mut min_notional = None;

        for f in filters {
            match f.get("filterType").and_then(|v| v.as_str()) {
                Some("LOT_SIZE") => {
                    step_size = f
                        .get("stepSize")
                        .and_then(|v| v.as_str())
                        .and_then(|s| s.parse().ok());
                    min_qty = f
                        .get("minQty")
                        .and_then(|v| v.as_str())
                        .and_then(|s| s.parse().ok());
                }
                Some("MIN_NOTIONAL") => {
                    min_notional = f
                        .get("notional")
                        .and_then(|v| v.as_str())
                        .and_then(|s| s.parse().ok());
                }
                _ => {}
            }
        }

        Some(Self {
            step_size: step_size?,
            min_qty: min_qty?,
            min_notional: min_notional.unwrap_or(Decimal::ZERO),
        })
    }

    /// Round a quantity down to the lot-size step.
    pub fn round_qty(&self, qty: Decimal) -> Decimal {
        if self.step_size.is_zero() {
            return qty;
        }
        (qty / self.step_size).floor() * self.step_size
    }
}

/// Parameters for POST /fapi/v1/order, serialised as a query string.
#[derive(Debug, Clone, Serialize)]
pub struct NewOrderRequest {
    pub symbol: String,
    /// "BUY" or "SELL".
    pub side: String,
    /// "MARKET", "STOP_MARKET", "TAKE_PROFIT_MARKET".
    pub order_type: String,
    pub quantity: Decimal,
    pub reduce_only: bool,
    pub client_order_id: Option<String>,
    pub stop_price: Option<Decimal>,
}

impl NewOrderRequest {
    pub fn market(
        symbol: impl Into<String>,
        side: &str,
        quantity: Decimal,
        client_order_id: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side: side.to_string(),
            order_type: "MARKET".to_string(),
            quantity,
            reduce_only: false,
            client_order_id: Some(client_order_id.into()),
            stop_price: None,
        }
    }

    pub fn reduce_only_market(symbol: impl Into<String>, side: &str, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side: side.to_string(),
            order_type: "MARKET".to_string(),
            quantity,
            reduce_only: true,
            client_order_id: None,
            stop_price: None,
        }
    }

    pub fn stop_market(
        symbol: impl Into<String>,
        side: &str,
        quantity: Decimal,
        stop_price: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side: side.to_string(),
            order_type: "STOP_MARKET".to_string(),
            quantity,
            reduce_only: true,
            client_order_id: None,
            stop_price: Some(stop_price),
        }
    }

    pub fn take_profit_market(
        symbol: impl Into<String>,
        side: &str,
        quantity: Decimal,
        stop_price: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side: side.to_string(),
            order_type: "TAKE_PROFIT_MARKET".to_string(),
            quantity,
            reduce_only: true,
            client_order_id: None,
            stop_price: Some(stop_price),
        }
    }

    /// Render as venue query parameters (unsigned portion).
    pub fn to_params(&self) -> String {
        let mut params = format!(
            "symbol={}&side={}&type={}&quantity={}",
            self.symbol, self.side, self.order_type, self.quantity
        );
        if self.reduce_only {
            params.push_str("&reduceOnly=true");
        }
        if let Some(coid) = &self.client_order_id {
            params.push_str(&format!("&newClientOrderId={coid}"));
        }
        if let Some(sp) = &self.stop_price {
            params.push_str(&format!("&stopPrice={sp}"));
        }
        params
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn position_risk_parses_and_converts() {
        let json = r#"{
            "symbol": "BTCUSDT",
            "positionAmt": "-0.010",
            "entryPrice": "94000.0",
            "markPrice": "94500.00000000",
            "unRealizedProfit": "-5.00000000",
            "leverage": "20",
            "liquidationPrice": "103000.0",
            "marginType": "cross"
        }"#;
        let risk: PositionRisk = serde_json::from_str(json).unwrap();
        let pos = risk.to_position().unwrap();
        assert_eq!(pos.side, Side::Short);
        assert_eq!(pos.quantity, dec!(0.010));
        assert_eq!(pos.entry_price, dec!(94000.0));
        assert_eq!(pos.leverage, 20);
    }

    #[test]
    fn flat_position_converts_to_none() {
        let json = r#"{
            "symbol": "ETHUSDT",
            "positionAmt": "0",
            "entryPrice": "0.0",
            "markPrice": "3000.0",
            "unRealizedProfit": "0",
            "leverage": "5"
        }"#;
        let risk: PositionRisk = serde_json::from_str(json).unwrap();
        assert!(risk.to_position().is_none());
    }

    #[test]
    fn filters_parse_and_round() {
        let info = serde_json::json!({
            "symbol": "BTCUSDT",
            "filters": [
                { "filterType": "PRICE_FILTER", "tickSize": "0.10" },
                { "filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001", "maxQty": "1000" },
                { "filterType": "MIN_NOTIONAL", "notional": "100" }
            ]
        });
        let f = SymbolFilters::from_symbol_info(&info).unwrap();
        assert_eq!(f.step_size, dec!(0.001));
        assert_eq!(f.min_notional, dec!(100));
        assert_eq!(f.round_qty(dec!(0.10526)), dec!(0.105));
        assert_eq!(f.round_qty(dec!(0.0009)), dec!(0.000));
    }

    #[test]
    fn order_request_renders_params() {
        let req = NewOrderRequest::market("BTCUSDT", "BUY", dec!(0.105), "abc-123");
        let p = req.to_params();
        assert!(p.contains("symbol=BTCUSDT"));
        assert!(p.contains("side=BUY"));
        assert!(p.contains("type=MARKET"));
        assert!(p.contains("quantity=0.105"));
        assert!(p.contains("newClientOrderId=abc-123"));
        assert!(!p.contains("reduceOnly"));

        let stop = NewOrderRequest::stop_market("BTCUSDT", "SELL", dec!(0.105), dec!(93100));
        let p = stop.to_params();
        assert!(p.contains("type=STOP_MARKET"));
        assert!(p.contains("reduceOnly=true"));
        assert!(p.contains("stopPrice=93100"));
    }

    #[test]
    fn order_ack_parses_partial_fields() {
        let json = r#"{
            "orderId": 123456,
            "clientOrderId": "9b2a7c1e",
            "symbol": "BTCUSDT",
            "status": "FILLED",
            "avgPrice": "95010.5",
            "executedQty": "0.105",
            "updateTime": 1700000000000
        }"#;
        let ack: OrderAck = serde_json::from_str(json).unwrap();
        assert_eq!(ack.order_id, 123456);
        assert_eq!(ack.avg_price, Some(dec!(95010.5)));
        assert_eq!(ack.executed_qty, Some(dec!(0.105)));
    }
}
