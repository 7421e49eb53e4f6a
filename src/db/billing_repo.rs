use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::PgPool;

use crate::execution::collaborators::Billing;

/// Performance fees charged against `followers.token_balance`.
#[derive(Debug, Clone)]
pub struct PgBilling {
    pool: PgPool,
}

impl PgBilling {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Billing for PgBilling {
    async fn deduct_fee(&self, follower_id: i64, amount: Decimal) -> anyhow::Result<Decimal> {
        let row: Option<(Decimal,)> = sqlx::query_as(
            r#"
            UPDATE followers
            SET token_balance = token_balance - $2
            WHERE id = $1
            RETURNING token_balance
            "#,
        )
        .bind(follower_id)
        .bind(amount)
        .fetch_optional(&self.pool)
        .await?;

        let (balance,) = row.ok_or_else(|| anyhow::anyhow!("unknown follower {follower_id}"))?;
        tracing::debug!(follower_id, fee = %amount, balance = %balance, "Performance fee deducted");
        Ok(balance)
    }
}
