use async_trait::async_trait;
use flate2::read::GzDecoder;
use reqwest::Method;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::Read;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

use super::binance::OrderTradeUpdate;
use super::listener::{Frame, ListenerError, OrderUpdate, SessionTicket, StreamVenue};
use crate::exchanges::types::{lenient_bool, lenient_decimal, string_or_number};
use crate::exchanges::RestExchangeClient;
use crate::models::{normalize_symbol, Exchange, FillStatus, OrderKind, Side};

pub const BINGX_STREAM_BASE: &str = "wss://open-api-swap.bingx.com/swap-market";
const LISTEN_KEY_PATH: &str = "/openApi/swap/v2/user/auth/userDataStream";
const RENEW_EVERY: Duration = Duration::from_secs(30 * 60);

/// BingX perpetual swap user data stream. Frames arrive gzip-compressed.
pub struct BingxVenue {
    client: RestExchangeClient,
    stream_base: String,
}

impl BingxVenue {
    pub fn new(client: RestExchangeClient) -> Self {
        Self {
            client,
            stream_base: BINGX_STREAM_BASE.into(),
        }
    }
}

/// `dataType=ORDER_UPDATE` payload.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BingxOrderUpdate {
    #[serde(deserialize_with = "string_or_number")]
    order_id: String,
    symbol: String,
    side: String,
    #[serde(default)]
    order_type: String,
    status: String,
    #[serde(default, deserialize_with = "lenient_decimal")]
    executed_qty: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    order_qty: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    price: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    avg_price: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_bool")]
    reduce_only: bool,
}

impl BingxOrderUpdate {
    fn into_update(self) -> Result<Option<OrderUpdate>, ListenerError> {
        let Some(status) = FillStatus::from_api_str(&self.status) else {
            return Ok(None);
        };
        let side = Side::from_api_str(&self.side)
            .ok_or_else(|| ListenerError::Decode(format!("unknown side {}", self.side)))?;
        let cumulative_quantity = match (status, self.executed_qty) {
            (_, Some(qty)) => qty,
            (FillStatus::Filled, None) => self.order_qty.unwrap_or_default(),
            (FillStatus::PartiallyFilled, None) => Decimal::ZERO,
        };
        Ok(Some(OrderUpdate {
            order_id: self.order_id,
            symbol: normalize_symbol(&self.symbol),
            side,
            order_kind: OrderKind::from_api_str(&self.order_type),
            status,
            cumulative_quantity,
            limit_price: self.price,
            avg_fill_price: self.avg_price.unwrap_or_default(),
            reduce_only: self.reduce_only,
        }))
    }
}

fn gunzip(bytes: &[u8]) -> Result<String, ListenerError> {
    let mut text = String::new();
    GzDecoder::new(bytes)
        .read_to_string(&mut text)
        .map_err(|e| ListenerError::Decode(format!("gzip: {e}")))?;
    Ok(text)
}

fn decode_text(text: &str) -> Result<Frame, ListenerError> {
    if text == "Ping" {
        return Ok(Frame::Reply(Message::Text("Pong".into())));
    }

    let value: Value = serde_json::from_str(text)?;
    if let Some(ping) = value.get("ping") {
        let pong = json!({ "pong": ping });
        return Ok(Frame::Reply(Message::Text(pong.to_string().into())));
    }

    match value.get("e").and_then(Value::as_str) {
        Some("listenKeyExpired") => return Ok(Frame::SessionExpired),
        Some("ORDER_TRADE_UPDATE") => {
            let order = value
                .get("o")
                .cloned()
                .ok_or_else(|| ListenerError::Decode("ORDER_TRADE_UPDATE without o".into()))?;
            let order: OrderTradeUpdate = serde_json::from_value(order)?;
            return Ok(match order.into_update()? {
                Some(update) => Frame::Updates(vec![update]),
                None => Frame::Ignored,
            });
        }
        _ => {}
    }

    if value.get("dataType").and_then(Value::as_str) == Some("ORDER_UPDATE") {
        let data = value
            .get("data")
            .cloned()
            .ok_or_else(|| ListenerError::Decode("ORDER_UPDATE without data".into()))?;
        let order: BingxOrderUpdate = serde_json::from_value(data)?;
        return Ok(match order.into_update()? {
            Some(update) => Frame::Updates(vec![update]),
            None => Frame::Ignored,
        });
    }

    Ok(Frame::Ignored)
}

/// BingX returns the listen key either bare or inside a `data` envelope.
fn extract_listen_key(body: &Value) -> Option<String> {
    body.get("listenKey")
        .or_else(|| body.get("data").and_then(|d| d.get("listenKey")))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[async_trait]
impl StreamVenue for BingxVenue {
    fn exchange(&self) -> Exchange {
        Exchange::Bingx
    }

    async fn open_session(&self) -> Result<SessionTicket, ListenerError> {
        let body: Value = self
            .client
            .signed_json(Method::POST, LISTEN_KEY_PATH, &[])
            .await?;
        let key = extract_listen_key(&body)
            .ok_or_else(|| ListenerError::Session(format!("no listenKey in {body}")))?;
        Ok(SessionTicket {
            url: format!("{}?listenKey={}", self.stream_base, key),
            listen_key: Some(key),
        })
    }

    async fn renew_session(&self, ticket: &SessionTicket) -> Result<(), ListenerError> {
        let key = ticket
            .listen_key
            .clone()
            .ok_or_else(|| ListenerError::Session("missing listen key".into()))?;
        let (status, body) = self
            .client
            .send_signed(Method::PUT, LISTEN_KEY_PATH, &[("listenKey", key.into())])
            .await?;
        if !status.is_success() {
            return Err(ListenerError::Session(format!("{status}: {body}")));
        }
        Ok(())
    }

    fn renew_interval(&self) -> Option<Duration> {
        Some(RENEW_EVERY)
    }

    fn decode(&self, msg: &Message) -> Result<Frame, ListenerError> {
        match msg {
            Message::Binary(bytes) => decode_text(&gunzip(bytes)?),
            Message::Text(text) => decode_text(text.as_str()),
            _ => Ok(Frame::Ignored),
        }
    }
}
