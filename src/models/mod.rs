pub mod connection;
pub mod event;
pub mod order;
pub mod position;

pub use connection::{Credentials, FollowerConnection};
pub use event::{CanonicalOrderEvent, FillStatus, OrderKind};
pub use order::{OrderAck, ReplicaOrder};
pub use position::{averaged_entry, Position, PositionStatus};

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn from_api_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Exchange
// ---------------------------------------------------------------------------

/// Venues supported both as master sources and as follower destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
    Bybit,
    Bingx,
    Okx,
}

/// Whether copies from a venue mirror derivatives positions or spot holdings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketType {
    Futures,
    Spot,
}

impl Exchange {
    pub const ALL: [Exchange; 4] = [
        Exchange::Binance,
        Exchange::Bybit,
        Exchange::Bingx,
        Exchange::Okx,
    ];

    pub fn from_api_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "binance" => Some(Exchange::Binance),
            "bybit" => Some(Exchange::Bybit),
            "bingx" => Some(Exchange::Bingx),
            "okx" => Some(Exchange::Okx),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::Bybit => "bybit",
            Exchange::Bingx => "bingx",
            Exchange::Okx => "okx",
        }
    }

    /// Market traded on this venue by the copier.
    pub fn market_type(&self) -> MarketType {
        match self {
            Exchange::Okx => MarketType::Spot,
            _ => MarketType::Futures,
        }
    }

    /// Strategy tag a master on this venue publishes under unless overridden.
    pub fn default_strategy_tag(&self) -> &'static str {
        match self.market_type() {
            MarketType::Futures => "bro-bot",
            MarketType::Spot => "cgt",
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Symbols
// ---------------------------------------------------------------------------

const QUOTE_ASSETS: [&str; 6] = ["USDT", "USDC", "BUSD", "FDUSD", "BTC", "ETH"];

/// Normalize an exchange-native instrument name to the canonical form
/// (`BTC-USDT`, `BTC/USDT:USDT`, `BTC_USDT` → `BTCUSDT`).
pub fn normalize_symbol(raw: &str) -> String {
    let base = raw.split(':').next().unwrap_or(raw);
    let mut symbol: String = base
        .chars()
        .filter(|c| !matches!(c, '-' | '/' | '_'))
        .collect::<String>()
        .to_uppercase();

    // BingX demo trading settles in VST
    if let Some(stripped) = symbol.strip_suffix("VST") {
        symbol = format!("{stripped}USDT");
    }
    // OKX perpetual instruments carry a SWAP suffix
    if let Some(stripped) = symbol.strip_suffix("SWAP") {
        symbol = stripped.to_string();
    }
    symbol
}

/// Split a canonical symbol into (base, quote).
pub fn split_symbol(symbol: &str) -> Option<(&str, &str)> {
    QUOTE_ASSETS.iter().find_map(|quote| {
        symbol
            .strip_suffix(quote)
            .filter(|base| !base.is_empty())
            .map(|base| (base, *quote))
    })
}

/// Render a canonical symbol with a separator between base and quote
/// (`BTCUSDT` → `BTC-USDT`). Unknown quotes pass through unchanged.
pub fn dashed_symbol(symbol: &str) -> String {
    match split_symbol(symbol) {
        Some((base, quote)) => format!("{base}-{quote}"),
        None => symbol.to_string(),
    }
}
