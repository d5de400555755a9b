// =============================================================================
// Shared types used across the Vela futures engine
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Direction of a signal or position.
///
/// `Hold` only ever appears on signals; an intent or position always carries
/// `Long` or `Short`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Long,
    Short,
    Hold,
}

impl Side {
    /// Venue order side that opens a position in this direction.
    pub fn order_side(&self) -> &'static str {
        match self {
            Self::Long => "BUY",
            Self::Short => "SELL",
            Self::Hold => "NONE",
        }
    }

    /// Venue order side that reduces a position in this direction.
    pub fn closing_side(&self) -> &'static str {
        match self {
            Self::Long => "SELL",
            Self::Short => "BUY",
            Self::Hold => "NONE",
        }
    }

    /// Sign multiplier for PnL arithmetic: +1 for long, -1 for short.
    pub fn direction(&self) -> Decimal {
        match self {
            Self::Long => Decimal::ONE,
            Self::Short => Decimal::NEGATIVE_ONE,
            Self::Hold => Decimal::ZERO,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
            Self::Hold => write!(f, "HOLD"),
        }
    }
}

/// Logical status of an intent, reduced over the journal by last-write-wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentStatus {
    /// Written and fsynced before any venue call.
    Intent,
    /// The venue accepted the order (and brackets where applicable).
    Committed,
    /// Terminal: the order never reached an accepted state.
    Failed,
    /// Created by the reconciler for a venue position with no local record.
    GhostAdopted,
    /// Terminal: the position covered by this intent is gone.
    Closed,
}

impl IntentStatus {
    /// Whether this status ends the intent's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

impl std::fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Intent => write!(f, "INTENT"),
            Self::Committed => write!(f, "COMMITTED"),
            Self::Failed => write!(f, "FAILED"),
            Self::GhostAdopted => write!(f, "GHOST_ADOPTED"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// A candidate order, identified before any venue call and journaled through
/// its whole lifecycle. `id` doubles as the venue `client_order_id`, which is
/// what makes submissions idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub leverage: u32,
    pub timestamp: DateTime<Utc>,
    pub status: IntentStatus,
}

impl Intent {
    /// Notional value of the intent in quote currency.
    pub fn notional(&self) -> Decimal {
        self.quantity * self.entry_price
    }
}

/// Output of the decision oracle. Consumed once; carries no identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub side: Side,
    /// Confidence in [0, 1].
    pub confidence: f64,
    pub reasoning: String,
    #[serde(default)]
    pub recommended_leverage: Option<u32>,
    pub decision_time: DateTime<Utc>,
}

impl Signal {
    /// A HOLD signal used whenever the oracle times out or errors.
    pub fn hold(symbol: impl Into<String>, reasoning: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            side: Side::Hold,
            confidence: 0.0,
            reasoning: reasoning.into(),
            recommended_leverage: None,
            decision_time: Utc::now(),
        }
    }
}

/// A single market event from the combined kline stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketTick {
    pub symbol: String,
    pub interval: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub event_time_ms: i64,
    pub open_time_ms: i64,
    pub close_time_ms: i64,
    pub is_closed: bool,
}

/// A live position as tracked locally. The local set is always a subset of
/// what the venue reports; the reconciler drives convergence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub leverage: u32,
    /// True when the position was adopted from the venue without a local
    /// intent preceding it.
    pub is_ghost: bool,
    /// Journal id covering this position, when known.
    #[serde(default)]
    pub intent_id: Option<Uuid>,
}

impl Position {
    /// Signed percent PnL relative to entry (positive = in our favour).
    pub fn pnl_pct(&self) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        self.side.direction() * (self.mark_price - self.entry_price) / self.entry_price
    }

    /// Notional value at the current mark.
    pub fn notional(&self) -> Decimal {
        self.quantity.abs() * self.mark_price
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_position(side: Side, entry: Decimal, mark: Decimal) -> Position {
        Position {
            symbol: "BTCUSDT".into(),
            side,
            quantity: dec!(0.1),
            entry_price: entry,
            mark_price: mark,
            unrealized_pnl: Decimal::ZERO,
            leverage: 5,
            is_ghost: false,
            intent_id: None,
        }
    }

    #[test]
    fn side_serialises_screaming() {
        assert_eq!(serde_json::to_string(&Side::Long).unwrap(), "\"LONG\"");
        assert_eq!(serde_json::to_string(&Side::Hold).unwrap(), "\"HOLD\"");
        let back: Side = serde_json::from_str("\"SHORT\"").unwrap();
        assert_eq!(back, Side::Short);
    }

    #[test]
    fn status_terminality() {
        assert!(IntentStatus::Failed.is_terminal());
        assert!(IntentStatus::Closed.is_terminal());
        assert!(!IntentStatus::Intent.is_terminal());
        assert!(!IntentStatus::Committed.is_terminal());
        assert!(!IntentStatus::GhostAdopted.is_terminal());
    }

    #[test]
    fn closing_side_is_opposite() {
        assert_eq!(Side::Long.order_side(), "BUY");
        assert_eq!(Side::Long.closing_side(), "SELL");
        assert_eq!(Side::Short.order_side(), "SELL");
        assert_eq!(Side::Short.closing_side(), "BUY");
    }

    #[test]
    fn pnl_pct_signs() {
        let long = sample_position(Side::Long, dec!(100), dec!(102));
        assert_eq!(long.pnl_pct(), dec!(0.02));

        let short = sample_position(Side::Short, dec!(100), dec!(102));
        assert_eq!(short.pnl_pct(), dec!(-0.02));
    }

    #[test]
    fn intent_status_roundtrip_wal_format() {
        // The journal stores statuses in SCREAMING_SNAKE_CASE.
        let s = serde_json::to_string(&IntentStatus::GhostAdopted).unwrap();
        assert_eq!(s, "\"GHOST_ADOPTED\"");
        let back: IntentStatus = serde_json::from_str(&s).unwrap();
        assert_eq!(back, IntentStatus::GhostAdopted);
    }
}
