use rust_decimal::Decimal;
use serde::{de, Deserialize, Deserializer};
use std::str::FromStr;

/// Deserialize a decimal that exchanges may send as a string, a number,
/// an empty string, or null. Empty and null mean "not reported"; anything
/// else that does not parse is an error.
pub fn lenient_decimal<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    let raw = match value {
        None | Some(serde_json::Value::Null) => return Ok(None),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => return Ok(None),
        Some(serde_json::Value::String(s)) => s.trim().to_string(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        Some(other) => return Err(de::Error::custom(format!("expected decimal, got {other}"))),
    };
    Decimal::from_str(&raw)
        .or_else(|_| Decimal::from_scientific(&raw))
        .map(Some)
        .map_err(|_| de::Error::custom(format!("invalid decimal {raw:?}")))
}

/// Deserialize an identifier that may arrive as a string or a number.
/// Null or empty identifiers are rejected.
pub fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    let id = match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Number(n) => n.to_string(),
        other => return Err(de::Error::custom(format!("expected identifier, got {other}"))),
    };
    if id.trim().is_empty() {
        return Err(de::Error::custom("empty identifier"));
    }
    Ok(id)
}

/// Deserialize a flag that may arrive as a bool or a "true"/"false" string.
pub fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Bool(b)) => b,
        Some(serde_json::Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    })
}

// ---------------------------------------------------------------------------
// Binance USDⓈ-M futures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct BinanceListenKey {
    #[serde(rename = "listenKey")]
    pub listen_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BinanceApiError {
    pub code: i64,
    pub msg: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BinanceOrderResponse {
    #[serde(rename = "orderId", deserialize_with = "string_or_number")]
    pub order_id: String,
    #[serde(rename = "avgPrice", default, deserialize_with = "lenient_decimal")]
    pub avg_price: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BinanceBalance {
    pub asset: String,
    #[serde(rename = "availableBalance", default, deserialize_with = "lenient_decimal")]
    pub available_balance: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BinanceExchangeInfo {
    pub symbols: Vec<BinanceSymbolInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BinanceSymbolInfo {
    pub symbol: String,
    #[serde(default)]
    pub filters: Vec<BinanceSymbolFilter>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BinanceSymbolFilter {
    #[serde(rename = "filterType")]
    pub filter_type: String,
    #[serde(rename = "stepSize", default, deserialize_with = "lenient_decimal")]
    pub step_size: Option<Decimal>,
}

// ---------------------------------------------------------------------------
// Bybit v5
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct BybitEnvelope<T> {
    #[serde(rename = "retCode")]
    pub ret_code: i64,
    #[serde(rename = "retMsg", default)]
    pub ret_msg: String,
    pub result: Option<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BybitOrderResult {
    #[serde(rename = "orderId")]
    pub order_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BybitList<T> {
    #[serde(default = "Vec::new")]
    pub list: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BybitWalletAccount {
    #[serde(default)]
    pub coin: Vec<BybitCoinBalance>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BybitCoinBalance {
    pub coin: String,
    #[serde(rename = "walletBalance", default, deserialize_with = "lenient_decimal")]
    pub wallet_balance: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BybitInstrument {
    pub symbol: String,
    #[serde(rename = "lotSizeFilter")]
    pub lot_size_filter: BybitLotSizeFilter,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BybitLotSizeFilter {
    #[serde(rename = "qtyStep", default, deserialize_with = "lenient_decimal")]
    pub qty_step: Option<Decimal>,
}

// ---------------------------------------------------------------------------
// BingX swap v2
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct BingxEnvelope<T> {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
    pub data: Option<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BingxListenKey {
    #[serde(rename = "listenKey")]
    pub listen_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BingxOrderData {
    pub order: BingxOrder,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BingxOrder {
    #[serde(rename = "orderId", deserialize_with = "string_or_number")]
    pub order_id: String,
    #[serde(rename = "avgPrice", default, deserialize_with = "lenient_decimal")]
    pub avg_price: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BingxBalanceData {
    pub balance: BingxBalance,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BingxBalance {
    #[serde(rename = "availableMargin", default, deserialize_with = "lenient_decimal")]
    pub available_margin: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BingxContract {
    pub symbol: String,
    #[serde(rename = "quantityPrecision", default)]
    pub quantity_precision: Option<u32>,
}

// ---------------------------------------------------------------------------
// OKX v5
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct OkxEnvelope<T> {
    pub code: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OkxOrderAck {
    #[serde(rename = "ordId", default)]
    pub ord_id: String,
    #[serde(rename = "sCode", default)]
    pub s_code: String,
    #[serde(rename = "sMsg", default)]
    pub s_msg: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OkxAccountBalance {
    #[serde(default)]
    pub details: Vec<OkxBalanceDetail>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OkxBalanceDetail {
    pub ccy: String,
    #[serde(rename = "availBal", default, deserialize_with = "lenient_decimal")]
    pub avail_bal: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OkxInstrument {
    #[serde(rename = "instId")]
    pub inst_id: String,
    #[serde(rename = "lotSz", default, deserialize_with = "lenient_decimal")]
    pub lot_sz: Option<Decimal>,
}

/// One entry of `GET /api/v5/trade/orders-history`.
#[derive(Debug, Clone, Deserialize)]
pub struct OkxHistoricalOrder {
    #[serde(rename = "ordId")]
    pub ord_id: String,
    #[serde(rename = "instId")]
    pub inst_id: String,
    pub side: String,
    #[serde(rename = "ordType", default)]
    pub ord_type: String,
    pub state: String,
    #[serde(rename = "accFillSz", default, deserialize_with = "lenient_decimal")]
    pub acc_fill_sz: Option<Decimal>,
    #[serde(rename = "avgPx", default, deserialize_with = "lenient_decimal")]
    pub avg_px: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub px: Option<Decimal>,
}
