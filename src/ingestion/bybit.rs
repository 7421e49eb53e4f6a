use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

use super::listener::{Frame, ListenerError, OrderUpdate, SessionTicket, StreamVenue};
use crate::exchanges::auth::bybit_ws_auth_args;
use crate::exchanges::types::{lenient_bool, lenient_decimal, string_or_number};
use crate::models::{normalize_symbol, Credentials, Exchange, FillStatus, OrderKind, Side};

pub const BYBIT_PRIVATE_STREAM: &str = "wss://stream.bybit.com/v5/private";
const PING_EVERY: Duration = Duration::from_secs(20);
const AUTH_EXPIRY_MS: i64 = 10_000;

/// Bybit v5 private stream, `order` topic.
pub struct BybitVenue {
    credentials: Credentials,
    url: String,
}

impl BybitVenue {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            url: BYBIT_PRIVATE_STREAM.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    op: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    ret_msg: Option<String>,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitOrder {
    #[serde(deserialize_with = "string_or_number")]
    order_id: String,
    symbol: String,
    side: String,
    #[serde(default)]
    order_type: String,
    order_status: String,
    #[serde(default, deserialize_with = "lenient_decimal")]
    cum_exec_qty: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    qty: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    price: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    avg_price: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_bool")]
    reduce_only: bool,
    #[serde(default)]
    stop_order_type: String,
}

impl BybitOrder {
    fn into_update(self) -> Result<Option<OrderUpdate>, ListenerError> {
        let Some(status) = FillStatus::from_api_str(&self.order_status) else {
            return Ok(None);
        };
        let side = Side::from_api_str(&self.side)
            .ok_or_else(|| ListenerError::Decode(format!("unknown side {}", self.side)))?;
        let order_kind = if self.stop_order_type.is_empty() {
            OrderKind::from_api_str(&self.order_type)
        } else {
            OrderKind::Stop
        };
        let cumulative_quantity = match (status, self.cum_exec_qty) {
            (_, Some(qty)) => qty,
            (FillStatus::Filled, None) => self.qty.unwrap_or_default(),
            (FillStatus::PartiallyFilled, None) => Decimal::ZERO,
        };
        Ok(Some(OrderUpdate {
            order_id: self.order_id,
            symbol: normalize_symbol(&self.symbol),
            side,
            order_kind,
            status,
            cumulative_quantity,
            limit_price: self.price,
            avg_fill_price: self.avg_price.unwrap_or_default(),
            reduce_only: self.reduce_only,
        }))
    }
}

fn decode_stream_message(text: &str) -> Result<Frame, ListenerError> {
    let msg: StreamMessage = serde_json::from_str(text)?;

    if msg.op.as_deref() == Some("auth") {
        if msg.success == Some(true) {
            tracing::info!("Bybit stream authenticated");
            return Ok(Frame::Ignored);
        }
        tracing::error!(reason = ?msg.ret_msg, "Bybit stream authentication rejected");
        return Ok(Frame::SessionExpired);
    }

    if msg.topic.as_deref() != Some("order") {
        return Ok(Frame::Ignored);
    }

    // One bad order must not cost the rest of the batch.
    let mut updates = Vec::new();
    for raw in msg.data {
        let decoded = serde_json::from_value::<BybitOrder>(raw)
            .map_err(ListenerError::from)
            .and_then(BybitOrder::into_update);
        match decoded {
            Ok(Some(update)) => updates.push(update),
            Ok(None) => {}
            Err(e) => {
                counter!("decode_errors_total", "exchange" => Exchange::Bybit.as_str()).increment(1);
                tracing::warn!(error = %e, "Dropping undecodable Bybit order");
            }
        }
    }
    Ok(if updates.is_empty() {
        Frame::Ignored
    } else {
        Frame::Updates(updates)
    })
}

#[async_trait]
impl StreamVenue for BybitVenue {
    fn exchange(&self) -> Exchange {
        Exchange::Bybit
    }

    async fn open_session(&self) -> Result<SessionTicket, ListenerError> {
        Ok(SessionTicket {
            url: self.url.clone(),
            listen_key: None,
        })
    }

    fn handshake(&self) -> Result<Vec<Message>, ListenerError> {
        let expires = Utc::now().timestamp_millis() + AUTH_EXPIRY_MS;
        let [api_key, _, signature] = bybit_ws_auth_args(&self.credentials, expires)?;
        let auth = json!({"op": "auth", "args": [api_key, expires, signature]});
        let subscribe = json!({"op": "subscribe", "args": ["order"]});
        Ok(vec![
            Message::Text(auth.to_string().into()),
            Message::Text(subscribe.to_string().into()),
        ])
    }

    fn keepalive(&self) -> Option<(Duration, Message)> {
        Some((PING_EVERY, Message::Text(r#"{"op":"ping"}"#.into())))
    }

    fn decode(&self, msg: &Message) -> Result<Frame, ListenerError> {
        match msg {
            Message::Text(text) => decode_stream_message(text.as_str()),
            _ => Ok(Frame::Ignored),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDER_FILLED: &str = r#"{
        "id": "5923240c6880ab-c59f-420b-9adb-3639adc9dd90",
        "topic": "order",
        "creationTime": 1672364262474,
        "data": [{
            "symbol": "ETHUSDT", "orderId": "5cf98598-39a7-459e-97bf-76ca765ee020",
            "side": "Buy", "orderType": "Market", "price": "1250.00", "qty": "0.15",
            "orderStatus": "Filled", "avgPrice": "1201.45", "cumExecQty": "0.15",
            "reduceOnly": false, "stopOrderType": "", "category": "linear"
        }, {
            "symbol": "ETHUSDT", "orderId": "other", "side": "Buy", "orderType": "Limit",
            "price": "1100", "qty": "1", "orderStatus": "New", "cumExecQty": "0"
        }]
    }"#;

    #[test]
    fn decodes_filled_orders_only() {
        let Frame::Updates(updates) = decode_stream_message(ORDER_FILLED).unwrap() else {
            panic!("expected updates");
        };
        assert_eq!(updates.len(), 1);
        let u = &updates[0];
        assert_eq!(u.side, Side::Buy);
        assert_eq!(u.order_kind, OrderKind::Market);
        assert_eq!(u.status, FillStatus::Filled);
        assert_eq!(u.cumulative_quantity, "0.15".parse::<Decimal>().unwrap());
        assert_eq!(u.avg_fill_price, "1201.45".parse::<Decimal>().unwrap());
        assert!(!u.reduce_only);
    }

    #[test]
    fn bad_order_does_not_drop_the_batch() {
        let text = r#"{"topic":"order","data":[
            {"symbol":"ETHUSDT","orderId":"a1","side":"Sideways","orderType":"Market",
             "orderStatus":"Filled","cumExecQty":"1"},
            {"symbol":"ETHUSDT","side":"Buy","orderType":"Market","orderStatus":"Filled","cumExecQty":"1"},
            {"symbol":"BTCUSDT","orderId":"b2","side":"Sell","orderType":"Market",
             "orderStatus":"PartiallyFilled","cumExecQty":"0.01","avgPrice":"60000"}
        ]}"#;
        let Frame::Updates(updates) = decode_stream_message(text).unwrap() else {
            panic!("expected updates");
        };
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].order_id, "b2");
        assert_eq!(updates[0].side, Side::Sell);
    }

    #[test]
    fn conditional_orders_are_stops() {
        let text = ORDER_FILLED.replace(r#""stopOrderType": """#, r#""stopOrderType": "StopLoss""#);
        let Frame::Updates(updates) = decode_stream_message(&text).unwrap() else {
            panic!("expected updates");
        };
        assert_eq!(updates[0].order_kind, OrderKind::Stop);
    }

    #[test]
    fn failed_auth_forces_reconnect() {
        let frame =
            decode_stream_message(r#"{"success":false,"ret_msg":"invalid sign","op":"auth"}"#)
                .unwrap();
        assert_eq!(frame, Frame::SessionExpired);

        let ok = decode_stream_message(r#"{"success":true,"ret_msg":"","op":"auth"}"#).unwrap();
        assert_eq!(ok, Frame::Ignored);
    }

    #[test]
    fn pong_and_subscribe_acks_are_ignored() {
        let pong = decode_stream_message(r#"{"success":true,"ret_msg":"pong","op":"ping"}"#);
        assert_eq!(pong.unwrap(), Frame::Ignored);
    }

    #[test]
    fn handshake_logs_in_then_subscribes() {
        let venue = BybitVenue::new(Credentials::new("key-abcdefgh".into(), "secret".into(), None));
        let frames = venue.handshake().unwrap();
        assert_eq!(frames.len(), 2);
        let Message::Text(auth) = &frames[0] else {
            panic!("expected text frame");
        };
        let auth: serde_json::Value = serde_json::from_str(auth.as_str()).unwrap();
        assert_eq!(auth["op"], "auth");
        assert_eq!(auth["args"][0], "key-abcdefgh");
        assert!(auth["args"][1].is_i64());
        assert_eq!(auth["args"][2].as_str().unwrap().len(), 64);
    }
}
