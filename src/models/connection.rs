use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::Exchange;

/// A follower's linked exchange account as seen by the copier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowerConnection {
    pub follower_id: i64,
    pub exchange: Exchange,
    pub strategy_tag: String,
    /// USD capital the follower allots to automated copying on this exchange.
    pub reserved_capital: Decimal,
    /// Percent of reserved capital risked per replicated spot trade.
    pub risk_pct: Decimal,
    pub active: bool,
}

/// Decrypted API credentials. Never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: Option<String>,
}

impl Credentials {
    pub fn new(api_key: String, api_secret: String, passphrase: Option<String>) -> Self {
        Self {
            api_key,
            api_secret,
            passphrase,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key_hint: String = self.api_key.chars().take(4).collect();
        f.debug_struct("Credentials")
            .field("api_key", &format!("{key_hint}…"))
            .field("api_secret", &"<redacted>")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
