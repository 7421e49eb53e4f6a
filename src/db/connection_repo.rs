use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::sync::Arc;

use crate::execution::collaborators::CredentialStore;
use crate::models::{Credentials, Exchange, FollowerConnection};

/// Opaque decryption of stored API secrets.
pub trait SecretCipher: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> anyhow::Result<String>;
}

/// For deployments where secrets are stored unencrypted, e.g. local testing.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughCipher;

impl SecretCipher for PassthroughCipher {
    fn decrypt(&self, ciphertext: &str) -> anyhow::Result<String> {
        Ok(ciphertext.to_string())
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct ConnectionRow {
    follower_id: i64,
    exchange: String,
    strategy_tag: String,
    reserved_capital: Decimal,
    risk_pct: Decimal,
    is_active: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct SecretRow {
    api_key_enc: String,
    api_secret_enc: String,
    passphrase_enc: Option<String>,
}

/// Credential store over the `followers` and `follower_connections` tables.
#[derive(Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
    cipher: Arc<dyn SecretCipher>,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool, cipher: Arc<dyn SecretCipher>) -> Self {
        Self { pool, cipher }
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn get_decrypted_credentials(
        &self,
        follower_id: i64,
        exchange: Exchange,
    ) -> anyhow::Result<Option<Credentials>> {
        let row = sqlx::query_as::<_, SecretRow>(
            r#"
            SELECT api_key_enc, api_secret_enc, passphrase_enc
            FROM follower_connections
            WHERE follower_id = $1 AND exchange = $2
            "#,
        )
        .bind(follower_id)
        .bind(exchange.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let passphrase = match row.passphrase_enc.as_deref() {
            Some(enc) if !enc.is_empty() => Some(self.cipher.decrypt(enc)?),
            _ => None,
        };
        Ok(Some(Credentials::new(
            self.cipher.decrypt(&row.api_key_enc)?,
            self.cipher.decrypt(&row.api_secret_enc)?,
            passphrase,
        )))
    }

    /// Active connections of followers with copying enabled and a positive
    /// token balance.
    async fn get_follower_connections(
        &self,
        strategy_tag: Option<&str>,
    ) -> anyhow::Result<Vec<FollowerConnection>> {
        let rows = sqlx::query_as::<_, ConnectionRow>(
            r#"
            SELECT c.follower_id, c.exchange, c.strategy_tag, c.reserved_capital, c.risk_pct, c.is_active
            FROM follower_connections c
            JOIN followers f ON f.id = c.follower_id
            WHERE c.is_active
              AND f.copytrading_enabled
              AND f.token_balance > 0
              AND ($1::TEXT IS NULL OR c.strategy_tag = $1)
            ORDER BY c.follower_id
            "#,
        )
        .bind(strategy_tag)
        .fetch_all(&self.pool)
        .await?;

        let connections = rows
            .into_iter()
            .filter_map(|row| {
                let Some(exchange) = Exchange::from_api_str(&row.exchange) else {
                    tracing::warn!(
                        follower_id = row.follower_id,
                        exchange = %row.exchange,
                        "Skipping connection to unsupported exchange"
                    );
                    return None;
                };
                Some(FollowerConnection {
                    follower_id: row.follower_id,
                    exchange,
                    strategy_tag: row.strategy_tag,
                    reserved_capital: row.reserved_capital,
                    risk_pct: row.risk_pct,
                    active: row.is_active,
                })
            })
            .collect();

        Ok(connections)
    }
}
