pub mod billing_repo;
pub mod connection_repo;
pub mod in_memory;
pub mod position_repo;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;

use crate::models::{Position, Side};

pub use billing_repo::PgBilling;
pub use connection_repo::{PassthroughCipher, PgCredentialStore, SecretCipher};
pub use in_memory::InMemoryLedger;
pub use position_repo::PgPositionLedger;

pub async fn init_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;

    // Verify connectivity
    sqlx::query("SELECT 1").execute(&pool).await?;

    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("open {existing} position on {symbol} for follower {follower_id} cannot take a {requested} fill")]
    SideMismatch {
        follower_id: i64,
        symbol: String,
        existing: String,
        requested: Side,
    },

    #[error("gave up recording fill for follower {follower_id} on {symbol} after {attempts} attempts")]
    RetriesExhausted {
        follower_id: i64,
        symbol: String,
        attempts: u32,
    },
}

/// Durable per-follower, per-symbol position record.
///
/// At most one open position exists per (follower, symbol). Fills on the
/// same side are averaged in; reductions shrink the open quantity; a close
/// retires the row so the next fill opens a fresh one.
#[async_trait]
pub trait PositionLedger: Send + Sync {
    async fn open_position(
        &self,
        follower_id: i64,
        symbol: &str,
    ) -> Result<Option<Position>, LedgerError>;

    /// Open a position or average `quantity` at `price` into the open one.
    async fn record_fill(
        &self,
        follower_id: i64,
        symbol: &str,
        side: Side,
        price: Decimal,
        quantity: Decimal,
    ) -> Result<Position, LedgerError>;

    /// Subtract `quantity` from the open position, closing it when nothing
    /// is left. `None` if there was no open position.
    async fn reduce_position(
        &self,
        follower_id: i64,
        symbol: &str,
        quantity: Decimal,
    ) -> Result<Option<Position>, LedgerError>;

    /// Close the open position. Closed rows keep their last quantity.
    async fn record_close(
        &self,
        follower_id: i64,
        symbol: &str,
    ) -> Result<Option<Position>, LedgerError>;

    async fn list_open_positions(
        &self,
        follower_id: Option<i64>,
    ) -> Result<Vec<Position>, LedgerError>;
}
