use async_trait::async_trait;
use metrics::counter;
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;

use super::{LedgerError, PositionLedger};
use crate::models::{averaged_entry, Position, Side};

const MAX_ATTEMPTS: u32 = 5;
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Postgres-backed ledger. The partial unique index on open rows is what
/// keeps concurrent writers from creating two open positions.
#[derive(Debug, Clone)]
pub struct PgPositionLedger {
    pool: PgPool,
}

impl PgPositionLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock_open(
        tx: &mut Transaction<'_, Postgres>,
        follower_id: i64,
        symbol: &str,
    ) -> Result<Option<Position>, sqlx::Error> {
        sqlx::query_as::<_, Position>(
            r#"
            SELECT * FROM positions
            WHERE follower_id = $1 AND symbol = $2 AND status = 'open'
            FOR UPDATE
            "#,
        )
        .bind(follower_id)
        .bind(symbol)
        .fetch_optional(&mut **tx)
        .await
    }

    /// One attempt: read-lock the open row and average in, or insert.
    async fn try_record_fill(
        &self,
        follower_id: i64,
        symbol: &str,
        side: Side,
        price: Decimal,
        quantity: Decimal,
    ) -> Result<Position, LedgerError> {
        let mut tx = self.pool.begin().await?;

        let position = match Self::lock_open(&mut tx, follower_id, symbol).await? {
            Some(pos) => {
                if pos.side() != Some(side) {
                    return Err(LedgerError::SideMismatch {
                        follower_id,
                        symbol: symbol.to_string(),
                        existing: pos.side,
                        requested: side,
                    });
                }
                let new_avg = averaged_entry(pos.avg_entry_price, pos.total_quantity, price, quantity);
                sqlx::query_as::<_, Position>(
                    r#"
                    UPDATE positions
                    SET avg_entry_price = $2, total_quantity = total_quantity + $3
                    WHERE id = $1
                    RETURNING *
                    "#,
                )
                .bind(pos.id)
                .bind(new_avg)
                .bind(quantity)
                .fetch_one(&mut *tx)
                .await?
            }
            None => {
                sqlx::query_as::<_, Position>(
                    r#"
                    INSERT INTO positions (follower_id, symbol, side, avg_entry_price, total_quantity)
                    VALUES ($1, $2, $3, $4, $5)
                    RETURNING *
                    "#,
                )
                .bind(follower_id)
                .bind(symbol)
                .bind(side.as_str())
                .bind(price)
                .bind(quantity)
                .fetch_one(&mut *tx)
                .await?
            }
        };

        tx.commit().await?;
        Ok(position)
    }
}

fn is_unique_violation(err: &LedgerError) -> bool {
    match err {
        LedgerError::Database(sqlx::Error::Database(db_err)) => db_err.is_unique_violation(),
        _ => false,
    }
}

#[async_trait]
impl PositionLedger for PgPositionLedger {
    async fn open_position(
        &self,
        follower_id: i64,
        symbol: &str,
    ) -> Result<Option<Position>, LedgerError> {
        let pos = sqlx::query_as::<_, Position>(
            "SELECT * FROM positions WHERE follower_id = $1 AND symbol = $2 AND status = 'open'",
        )
        .bind(follower_id)
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;

        Ok(pos)
    }

    async fn record_fill(
        &self,
        follower_id: i64,
        symbol: &str,
        side: Side,
        price: Decimal,
        quantity: Decimal,
    ) -> Result<Position, LedgerError> {
        for attempt in 1..=MAX_ATTEMPTS {
            match self
                .try_record_fill(follower_id, symbol, side, price, quantity)
                .await
            {
                Err(e) if is_unique_violation(&e) => {
                    // Another writer inserted the open row first; re-read and average in.
                    counter!("ledger_race_retries_total").increment(1);
                    tracing::debug!(follower_id, symbol, attempt, "Open position race, retrying");
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
                other => return other,
            }
        }

        Err(LedgerError::RetriesExhausted {
            follower_id,
            symbol: symbol.to_string(),
            attempts: MAX_ATTEMPTS,
        })
    }

    async fn reduce_position(
        &self,
        follower_id: i64,
        symbol: &str,
        quantity: Decimal,
    ) -> Result<Option<Position>, LedgerError> {
        let mut tx = self.pool.begin().await?;

        let Some(pos) = Self::lock_open(&mut tx, follower_id, symbol).await? else {
            return Ok(None);
        };

        let updated = if quantity >= pos.total_quantity {
            sqlx::query_as::<_, Position>(
                r#"
                UPDATE positions
                SET status = 'closed', closed_at = NOW()
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(pos.id)
            .fetch_one(&mut *tx)
            .await?
        } else {
            sqlx::query_as::<_, Position>(
                r#"
                UPDATE positions
                SET total_quantity = total_quantity - $2
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(pos.id)
            .bind(quantity)
            .fetch_one(&mut *tx)
            .await?
        };

        tx.commit().await?;
        Ok(Some(updated))
    }

    async fn record_close(
        &self,
        follower_id: i64,
        symbol: &str,
    ) -> Result<Option<Position>, LedgerError> {
        let pos = sqlx::query_as::<_, Position>(
            r#"
            UPDATE positions
            SET status = 'closed', closed_at = NOW()
            WHERE follower_id = $1 AND symbol = $2 AND status = 'open'
            RETURNING *
            "#,
        )
        .bind(follower_id)
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;

        Ok(pos)
    }

    async fn list_open_positions(
        &self,
        follower_id: Option<i64>,
    ) -> Result<Vec<Position>, LedgerError> {
        let positions = sqlx::query_as::<_, Position>(
            r#"
            SELECT * FROM positions
            WHERE status = 'open' AND ($1::BIGINT IS NULL OR follower_id = $1)
            ORDER BY opened_at DESC
            "#,
        )
        .bind(follower_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(positions)
    }
}
