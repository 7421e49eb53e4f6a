use rust_decimal::Decimal;
use uuid::Uuid;

use crate::exchanges::{ClientError, ExchangeClient};
use crate::models::{OrderAck, ReplicaOrder};

/// Places replica orders through a follower's command client, or only logs
/// them in dry-run mode.
#[derive(Debug, Clone, Copy)]
pub struct OrderExecutor {
    dry_run: bool,
}

impl OrderExecutor {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub async fn execute(
        &self,
        client: &dyn ExchangeClient,
        order: &ReplicaOrder,
    ) -> Result<OrderAck, ClientError> {
        if self.dry_run {
            tracing::info!(
                follower_id = order.follower_id,
                exchange = %order.exchange,
                symbol = %order.symbol,
                side = %order.side,
                qty = %order.quantity,
                reduce_only = order.reduce_only,
                price = %order.reference_price,
                "[DRY-RUN] Would place market order"
            );
            return Ok(OrderAck {
                order_id: format!("dry-run-{}", Uuid::new_v4()),
                avg_price: Some(order.reference_price),
            });
        }

        tracing::info!(
            follower_id = order.follower_id,
            exchange = %order.exchange,
            symbol = %order.symbol,
            side = %order.side,
            qty = %order.quantity,
            reduce_only = order.reduce_only,
            "Placing replica order"
        );
        client.place_order(order).await
    }

    /// Whether the follower can pay for a spot buy. A failed balance query
    /// does not block the order.
    pub async fn has_quote_balance(&self, client: &dyn ExchangeClient, order: &ReplicaOrder) -> bool {
        if self.dry_run {
            return true;
        }
        let required = order.notional();
        match client.get_balance().await {
            Ok(available) if available < required => {
                tracing::warn!(
                    follower_id = order.follower_id,
                    required = %required,
                    available = %available,
                    "Insufficient quote balance, skipping order"
                );
                false
            }
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(
                    follower_id = order.follower_id,
                    error = %e,
                    "Failed to check balance, proceeding anyway"
                );
                true
            }
        }
    }
}

/// Price to record in the ledger for a placed replica.
pub fn fill_price(ack: &OrderAck, order: &ReplicaOrder) -> Decimal {
    ack.avg_price
        .filter(|p| *p > Decimal::ZERO)
        .unwrap_or(order.reference_price)
}
