//! Services the copier consumes but does not own.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::models::{Credentials, Exchange, FollowerConnection};

pub use crate::exchanges::{ClientFactory, ExchangeClient};

/// Source of follower connections and their decrypted API credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_decrypted_credentials(
        &self,
        follower_id: i64,
        exchange: Exchange,
    ) -> anyhow::Result<Option<Credentials>>;

    /// Connections eligible for copying, optionally restricted to one
    /// strategy tag.
    async fn get_follower_connections(
        &self,
        strategy_tag: Option<&str>,
    ) -> anyhow::Result<Vec<FollowerConnection>>;
}

/// Best-effort delivery of a message to a follower. Never fails the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, follower_id: i64, message: &str);
}

#[async_trait]
pub trait Billing: Send + Sync {
    /// Deduct `amount` from the follower's internal token balance and
    /// return the new balance.
    async fn deduct_fee(&self, follower_id: i64, amount: Decimal) -> anyhow::Result<Decimal>;
}
