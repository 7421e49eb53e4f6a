use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{Exchange, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Market,
    Limit,
    Stop,
}

impl OrderKind {
    /// Map an exchange order type string. Anything conditional (stop,
    /// take-profit, trailing) is treated as a stop.
    pub fn from_api_str(s: &str) -> Self {
        let upper = s.to_uppercase();
        if upper.contains("STOP") || upper.contains("TAKE") || upper.contains("TRAIL") {
            OrderKind::Stop
        } else if upper == "MARKET" {
            OrderKind::Market
        } else {
            OrderKind::Limit
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillStatus {
    Filled,
    PartiallyFilled,
}

impl FillStatus {
    pub fn from_api_str(s: &str) -> Option<Self> {
        match s.to_uppercase().replace(['_', ' '], "").as_str() {
            "FILLED" => Some(FillStatus::Filled),
            "PARTIALLYFILLED" => Some(FillStatus::PartiallyFilled),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// CanonicalOrderEvent: the only message crossing the event bus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalOrderEvent {
    pub master_exchange: Exchange,
    pub strategy_tag: String,
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_kind: OrderKind,
    pub status: FillStatus,
    /// Quantity newly filled by this notification.
    pub filled_quantity: Decimal,
    pub limit_price: Option<Decimal>,
    pub avg_fill_price: Decimal,
    pub reduce_only: bool,
    pub received_at: DateTime<Utc>,
}

impl CanonicalOrderEvent {
    /// Best known execution price: average fill, falling back to the limit.
    pub fn reference_price(&self) -> Decimal {
        if self.avg_fill_price > Decimal::ZERO {
            self.avg_fill_price
        } else {
            self.limit_price.unwrap_or(Decimal::ZERO)
        }
    }
}

impl fmt::Display for CanonicalOrderEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} @ {}{}",
            self.master_exchange,
            self.side,
            self.filled_quantity,
            self.symbol,
            self.reference_price(),
            if self.reduce_only { " (reduce-only)" } else { "" },
        )
    }
}
