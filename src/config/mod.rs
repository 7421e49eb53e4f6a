use rust_decimal::Decimal;
use std::collections::HashMap;
use std::env;

use crate::execution::position_sizer::DEFAULT_MASTER_CAPITAL;
use crate::models::{Credentials, Exchange};

/// Shorter keys are treated as placeholders, not credentials.
const MIN_KEY_LEN: usize = 10;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    /// Bearer token required on `/api` routes. Unset disables auth.
    pub api_token: Option<String>,

    // Execution
    pub dry_run: bool,
    pub master_capital: HashMap<Exchange, Decimal>,
    pub performance_fee: Decimal,

    // Master accounts, keyed by venue
    pub masters: HashMap<Exchange, Credentials>,
    pub strategy_tags: HashMap<Exchange, String>,

    // Listeners
    pub okx_poll_interval_ms: u64,
    pub reconnect_delay_secs: u64,

    // Notifications
    pub telegram_bot_token: Option<String>,
    pub notifications_enabled: bool,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn upper(exchange: Exchange) -> String {
    exchange.as_str().to_uppercase()
}

/// Read `<EX>_MASTER_KEY` / `<EX>_MASTER_SECRET` (and `OKX_MASTER_PASSWORD`).
fn master_credentials_from_env(exchange: Exchange) -> Option<Credentials> {
    let prefix = upper(exchange);
    let key = env::var(format!("{prefix}_MASTER_KEY")).ok()?;
    let secret = env::var(format!("{prefix}_MASTER_SECRET")).ok()?;
    if key.trim().len() < MIN_KEY_LEN || secret.trim().is_empty() {
        return None;
    }
    let passphrase = match exchange {
        Exchange::Okx => env::var("OKX_MASTER_PASSWORD").ok(),
        _ => None,
    };
    Some(Credentials::new(
        key.trim().to_string(),
        secret.trim().to_string(),
        passphrase,
    ))
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut masters = HashMap::new();
        let mut master_capital = HashMap::new();
        let mut strategy_tags = HashMap::new();
        for exchange in Exchange::ALL {
            let prefix = upper(exchange);
            if let Some(creds) = master_credentials_from_env(exchange) {
                masters.insert(exchange, creds);
            }
            master_capital.insert(
                exchange,
                env_or(
                    &format!("MASTER_CAPITAL_{prefix}"),
                    Decimal::from(DEFAULT_MASTER_CAPITAL),
                ),
            );
            strategy_tags.insert(
                exchange,
                env::var(format!("STRATEGY_TAG_{prefix}"))
                    .unwrap_or_else(|_| exchange.default_strategy_tag().into()),
            );
        }

        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?,
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".into())
                .parse()?,
            api_token: env::var("API_TOKEN").ok().filter(|t| !t.is_empty()),

            dry_run: env_or("DRY_RUN", true),
            master_capital,
            performance_fee: env_or("PERFORMANCE_FEE", Decimal::ZERO),

            masters,
            strategy_tags,

            okx_poll_interval_ms: env_or("OKX_POLL_INTERVAL_MS", 2_000),
            reconnect_delay_secs: env_or("RECONNECT_DELAY_SECS", 5),

            telegram_bot_token: env::var("TELEGRAM_BOT_TOKEN").ok().filter(|t| !t.is_empty()),
            notifications_enabled: env_or("NOTIFICATIONS_ENABLED", false),
        })
    }

    /// Minimal configuration for tests and tooling: dry run, no masters.
    pub fn for_database(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            host: "127.0.0.1".into(),
            port: 0,
            api_token: None,
            dry_run: true,
            master_capital: HashMap::new(),
            performance_fee: Decimal::ZERO,
            masters: HashMap::new(),
            strategy_tags: HashMap::new(),
            okx_poll_interval_ms: 2_000,
            reconnect_delay_secs: 5,
            telegram_bot_token: None,
            notifications_enabled: false,
        }
    }

    pub fn master_credentials(&self, exchange: Exchange) -> Option<&Credentials> {
        self.masters.get(&exchange)
    }

    pub fn strategy_tag(&self, exchange: Exchange) -> &str {
        self.strategy_tags
            .get(&exchange)
            .map(String::as_str)
            .unwrap_or_else(|| exchange.default_strategy_tag())
    }

    /// Returns true if Telegram notifications can be sent.
    pub fn has_notifications(&self) -> bool {
        self.notifications_enabled && self.telegram_bot_token.is_some()
    }
}
