use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Exchange, Side};

/// A scaled market order placed on a follower account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaOrder {
    pub follower_id: i64,
    pub exchange: Exchange,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub reduce_only: bool,
    /// Master's execution price, used for notional checks and dry runs.
    pub reference_price: Decimal,
}

impl ReplicaOrder {
    pub fn notional(&self) -> Decimal {
        self.quantity * self.reference_price
    }
}

/// Exchange acknowledgement for a placed order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: String,
    /// Average execution price if the venue reported one synchronously.
    pub avg_price: Option<Decimal>,
}
