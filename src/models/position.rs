use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::Side;

/// Database row for the positions table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Position {
    pub id: Uuid,
    pub follower_id: i64,
    pub symbol: String,
    pub side: String,
    pub avg_entry_price: Decimal,
    pub total_quantity: Decimal,
    pub status: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn side(&self) -> Option<Side> {
        Side::from_api_str(&self.side)
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::OPEN
    }
}

/// Position status constants.
pub struct PositionStatus;

impl PositionStatus {
    pub const OPEN: &'static str = "open";
    pub const CLOSED: &'static str = "closed";
}

/// Weighted-average entry after adding `qty` at `price` to an existing lot.
pub fn averaged_entry(
    old_price: Decimal,
    old_qty: Decimal,
    price: Decimal,
    qty: Decimal,
) -> Decimal {
    let total = old_qty + qty;
    if total.is_zero() {
        return price;
    }
    (old_price * old_qty + price * qty) / total
}
