use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

use super::listener::{Frame, ListenerError, OrderUpdate, SessionTicket, StreamVenue};
use crate::exchanges::types::{lenient_bool, lenient_decimal, string_or_number, BinanceListenKey};
use crate::exchanges::RestExchangeClient;
use crate::models::{normalize_symbol, Exchange, FillStatus, OrderKind, Side};

pub const BINANCE_STREAM_BASE: &str = "wss://fstream.binance.com/ws";
const LISTEN_KEY_PATH: &str = "/fapi/v1/listenKey";
/// Listen keys expire after 60 minutes without a keepalive.
const RENEW_EVERY: Duration = Duration::from_secs(30 * 60);

/// Binance USDⓈ-M futures user data stream.
pub struct BinanceVenue {
    client: RestExchangeClient,
    stream_base: String,
}

impl BinanceVenue {
    pub fn new(client: RestExchangeClient) -> Self {
        Self {
            client,
            stream_base: BINANCE_STREAM_BASE.into(),
        }
    }

    async fn listen_key_request(
        &self,
        method: reqwest::Method,
    ) -> Result<reqwest::Response, ListenerError> {
        let url = format!("{}{}", self.client.base_url(), LISTEN_KEY_PATH);
        let resp = self
            .client
            .http()
            .request(method, url)
            .header("X-MBX-APIKEY", self.client.signer().api_key())
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ListenerError::Session(format!("{status}: {body}")));
        }
        Ok(resp)
    }
}

/// User data stream envelope; only the fields the copier reads.
#[derive(Debug, Deserialize)]
struct UserDataEvent {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "o")]
    order: Option<OrderTradeUpdate>,
}

/// The `o` object of an `ORDER_TRADE_UPDATE`. BingX mirrors this shape.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct OrderTradeUpdate {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "o", default)]
    order_type: String,
    #[serde(rename = "ot", default)]
    original_type: String,
    #[serde(rename = "X")]
    status: String,
    #[serde(rename = "z", default, deserialize_with = "lenient_decimal")]
    cumulative_qty: Option<Decimal>,
    #[serde(rename = "p", default, deserialize_with = "lenient_decimal")]
    price: Option<Decimal>,
    #[serde(rename = "ap", default, deserialize_with = "lenient_decimal")]
    avg_price: Option<Decimal>,
    #[serde(rename = "R", default, deserialize_with = "lenient_bool")]
    reduce_only: bool,
    #[serde(rename = "i", deserialize_with = "string_or_number")]
    order_id: String,
}

impl OrderTradeUpdate {
    /// `None` unless the order has (partially) filled.
    pub(crate) fn into_update(self) -> Result<Option<OrderUpdate>, ListenerError> {
        let Some(status) = FillStatus::from_api_str(&self.status) else {
            return Ok(None);
        };
        let side = Side::from_api_str(&self.side)
            .ok_or_else(|| ListenerError::Decode(format!("unknown side {}", self.side)))?;
        let order_kind = match OrderKind::from_api_str(&self.original_type) {
            OrderKind::Stop => OrderKind::Stop,
            _ => OrderKind::from_api_str(&self.order_type),
        };
        Ok(Some(OrderUpdate {
            order_id: self.order_id,
            symbol: normalize_symbol(&self.symbol),
            side,
            order_kind,
            status,
            cumulative_quantity: self.cumulative_qty.unwrap_or_default(),
            limit_price: self.price,
            avg_fill_price: self.avg_price.unwrap_or_default(),
            reduce_only: self.reduce_only,
        }))
    }
}

pub(crate) fn decode_user_event(text: &str) -> Result<Frame, ListenerError> {
    let event: UserDataEvent = serde_json::from_str(text)?;
    match event.event_type.as_str() {
        "ORDER_TRADE_UPDATE" => {
            let order = event
                .order
                .ok_or_else(|| ListenerError::Decode("ORDER_TRADE_UPDATE without o".into()))?;
            Ok(match order.into_update()? {
                Some(update) => Frame::Updates(vec![update]),
                None => Frame::Ignored,
            })
        }
        "listenKeyExpired" => Ok(Frame::SessionExpired),
        _ => Ok(Frame::Ignored),
    }
}

#[async_trait]
impl StreamVenue for BinanceVenue {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    async fn open_session(&self) -> Result<SessionTicket, ListenerError> {
        let key: BinanceListenKey = self
            .listen_key_request(reqwest::Method::POST)
            .await?
            .json()
            .await?;
        Ok(SessionTicket {
            url: format!("{}/{}", self.stream_base, key.listen_key),
            listen_key: Some(key.listen_key),
        })
    }

    async fn renew_session(&self, _ticket: &SessionTicket) -> Result<(), ListenerError> {
        self.listen_key_request(reqwest::Method::PUT).await?;
        Ok(())
    }

    fn renew_interval(&self) -> Option<Duration> {
        Some(RENEW_EVERY)
    }

    fn decode(&self, msg: &Message) -> Result<Frame, ListenerError> {
        match msg {
            Message::Text(text) => decode_user_event(text.as_str()),
            _ => Ok(Frame::Ignored),
        }
    }
}
