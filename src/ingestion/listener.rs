use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::bus::EventPublisher;
use super::fill_tracker::FillTracker;
use crate::exchanges::{AuthError, ClientError};
use crate::models::{CanonicalOrderEvent, Exchange, FillStatus, OrderKind, Side};
use crate::wait_for_shutdown;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("session request failed: {0}")]
    Session(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("malformed frame: {0}")]
    Decode(String),
}

impl From<serde_json::Error> for ListenerError {
    fn from(e: serde_json::Error) -> Self {
        ListenerError::Decode(e.to_string())
    }
}

/// A live session on a push venue.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionTicket {
    pub url: String,
    /// Listen key for venues that key their user stream by one.
    pub listen_key: Option<String>,
}

/// A fill notification as reported by the venue, before delta tracking.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderUpdate {
    pub order_id: String,
    /// Normalized symbol.
    pub symbol: String,
    pub side: Side,
    pub order_kind: OrderKind,
    pub status: FillStatus,
    /// Quantity filled so far on this order.
    pub cumulative_quantity: Decimal,
    pub limit_price: Option<Decimal>,
    pub avg_fill_price: Decimal,
    pub reduce_only: bool,
}

impl OrderUpdate {
    pub fn into_event(
        self,
        exchange: Exchange,
        strategy_tag: &str,
        filled_quantity: Decimal,
    ) -> CanonicalOrderEvent {
        CanonicalOrderEvent {
            master_exchange: exchange,
            strategy_tag: strategy_tag.to_string(),
            order_id: self.order_id,
            symbol: self.symbol,
            side: self.side,
            order_kind: self.order_kind,
            status: self.status,
            filled_quantity,
            limit_price: self.limit_price.filter(|p| !p.is_zero()),
            avg_fill_price: self.avg_fill_price,
            reduce_only: self.reduce_only,
            received_at: Utc::now(),
        }
    }
}

/// What the supervisor should do with one decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Updates(Vec<OrderUpdate>),
    /// Venue-level heartbeat that must be answered on the same socket.
    Reply(Message),
    /// The session is no longer valid; reconnect with a fresh one.
    SessionExpired,
    Ignored,
}

/// A master venue reachable over a private websocket stream.
#[async_trait]
pub trait StreamVenue: Send + Sync {
    fn exchange(&self) -> Exchange;

    /// Obtain whatever the venue needs before connecting (listen key, URL).
    async fn open_session(&self) -> Result<SessionTicket, ListenerError>;

    /// Extend the session. Called every [`StreamVenue::renew_interval`].
    async fn renew_session(&self, _ticket: &SessionTicket) -> Result<(), ListenerError> {
        Ok(())
    }

    fn renew_interval(&self) -> Option<Duration> {
        None
    }

    /// Frames sent right after connecting (login, subscriptions).
    fn handshake(&self) -> Result<Vec<Message>, ListenerError> {
        Ok(Vec::new())
    }

    /// Application-level keepalive sent on a timer.
    fn keepalive(&self) -> Option<(Duration, Message)> {
        None
    }

    fn decode(&self, msg: &Message) -> Result<Frame, ListenerError>;
}

/// Per-adapter state that survives reconnects.
pub struct ListenerContext {
    pub strategy_tag: String,
    pub publisher: EventPublisher,
    pub reconnect_delay: Duration,
    fills: FillTracker,
}

impl ListenerContext {
    pub fn new(strategy_tag: impl Into<String>, publisher: EventPublisher) -> Self {
        Self {
            strategy_tag: strategy_tag.into(),
            publisher,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            fills: FillTracker::default(),
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Turn decoded updates into events for the newly filled quantity and
    /// publish them. Returns the number of events published.
    pub fn publish_updates(&mut self, exchange: Exchange, updates: Vec<OrderUpdate>) -> usize {
        let mut published = 0;
        for update in updates {
            let Some(delta) = self.fills.observe(&update.order_id, update.cumulative_quantity)
            else {
                tracing::debug!(
                    exchange = %exchange,
                    order_id = %update.order_id,
                    "No new quantity filled, skipping"
                );
                continue;
            };
            let event = update.into_event(exchange, &self.strategy_tag, delta);
            tracing::info!(
                exchange = %exchange,
                order_id = %event.order_id,
                symbol = %event.symbol,
                side = %event.side,
                qty = %event.filled_quantity,
                price = %event.avg_fill_price,
                reduce_only = event.reduce_only,
                "Master fill detected"
            );
            if self.publisher.publish(event) {
                published += 1;
            }
        }
        published
    }
}

/// Run a push-venue adapter until shutdown: open a session, connect, send
/// the handshake, read frames, keep the session alive, and reconnect with
/// a fixed delay on any failure.
pub async fn run_stream_listener(
    venue: Arc<dyn StreamVenue>,
    mut ctx: ListenerContext,
    mut shutdown: watch::Receiver<bool>,
) {
    let exchange = venue.exchange();

    loop {
        if *shutdown.borrow() {
            break;
        }

        match venue.open_session().await {
            Ok(ticket) => {
                let stop = run_session(&venue, &ticket, &mut ctx, &mut shutdown).await;
                if stop {
                    break;
                }
            }
            Err(e) => {
                tracing::error!(exchange = %exchange, error = %e, "Failed to open session");
            }
        }

        tracing::info!(
            exchange = %exchange,
            delay_secs = ctx.reconnect_delay.as_secs(),
            "Reconnecting..."
        );
        tokio::select! {
            _ = sleep(ctx.reconnect_delay) => {}
            _ = wait_for_shutdown(&mut shutdown) => break,
        }
    }

    tracing::info!(exchange = %exchange, "Listener stopped");
}

/// One connected session. Returns `true` when shutdown was requested.
async fn run_session(
    venue: &Arc<dyn StreamVenue>,
    ticket: &SessionTicket,
    ctx: &mut ListenerContext,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let exchange = venue.exchange();
    tracing::info!(exchange = %exchange, "Connecting to master stream...");

    let ws_stream = match connect_async(ticket.url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            tracing::error!(exchange = %exchange, error = %e, "WebSocket connection failed");
            return false;
        }
    };
    tracing::info!(exchange = %exchange, "Master stream connected");

    let (mut write, mut read) = ws_stream.split();

    let handshake = match venue.handshake() {
        Ok(frames) => frames,
        Err(e) => {
            tracing::error!(exchange = %exchange, error = %e, "Failed to build handshake");
            return false;
        }
    };
    for frame in handshake {
        if let Err(e) = write.send(frame).await {
            tracing::error!(exchange = %exchange, error = %e, "Failed to send handshake frame");
            return false;
        }
    }

    // Renewal runs in its own task so a busy socket never delays it.
    let (expired_tx, mut expired_rx) = mpsc::channel::<ListenerError>(1);
    let renewal = venue.renew_interval().map(|every| {
        let venue = Arc::clone(venue);
        let ticket = ticket.clone();
        tokio::spawn(async move {
            let mut timer = interval(every);
            timer.tick().await;
            loop {
                timer.tick().await;
                match venue.renew_session(&ticket).await {
                    Ok(()) => {
                        tracing::info!(exchange = %venue.exchange(), "Session renewed");
                    }
                    Err(e) => {
                        let _ = expired_tx.send(e).await;
                        return;
                    }
                }
            }
        })
    });

    let (keepalive_every, keepalive_frame) = match venue.keepalive() {
        Some((every, frame)) => (every, Some(frame)),
        None => (Duration::from_secs(30), None),
    };
    let mut keepalive_timer = interval(keepalive_every);
    keepalive_timer.tick().await;

    let mut stop = false;
    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            tracing::warn!(exchange = %exchange, error = %e, "Failed to send pong");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::warn!(exchange = %exchange, "WebSocket server sent close frame");
                        break;
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(message)) => match venue.decode(&message) {
                        Ok(Frame::Updates(updates)) => {
                            ctx.publish_updates(exchange, updates);
                        }
                        Ok(Frame::Reply(reply)) => {
                            if let Err(e) = write.send(reply).await {
                                tracing::warn!(exchange = %exchange, error = %e, "Failed to answer heartbeat");
                                break;
                            }
                        }
                        Ok(Frame::SessionExpired) => {
                            tracing::warn!(exchange = %exchange, "Session expired, reconnecting");
                            break;
                        }
                        Ok(Frame::Ignored) => {}
                        Err(e) => {
                            counter!("decode_errors_total", "exchange" => exchange.as_str()).increment(1);
                            let raw: String = message.to_text().unwrap_or("<binary>").chars().take(200).collect();
                            tracing::warn!(exchange = %exchange, error = %e, frame = %raw, "Dropping undecodable frame");
                        }
                    },
                    Some(Err(e)) => {
                        tracing::error!(exchange = %exchange, error = %e, "WebSocket read error");
                        break;
                    }
                    None => {
                        tracing::warn!(exchange = %exchange, "WebSocket stream ended");
                        break;
                    }
                }
            }
            _ = keepalive_timer.tick(), if keepalive_frame.is_some() => {
                if let Some(frame) = keepalive_frame.clone() {
                    if let Err(e) = write.send(frame).await {
                        tracing::warn!(exchange = %exchange, error = %e, "Failed to send keepalive");
                        break;
                    }
                }
            }
            Some(e) = expired_rx.recv() => {
                tracing::warn!(exchange = %exchange, error = %e, "Session renewal failed, reconnecting");
                break;
            }
            _ = wait_for_shutdown(shutdown) => {
                tracing::info!(exchange = %exchange, "Shutdown requested, closing stream");
                let _ = write.send(Message::Close(None)).await;
                stop = true;
                break;
            }
        }
    }

    if let Some(handle) = renewal {
        handle.abort();
    }
    stop
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::bus::EventBus;

    fn update(order_id: &str, cumulative: &str) -> OrderUpdate {
        OrderUpdate {
            order_id: order_id.into(),
            symbol: "ETHUSDT".into(),
            side: Side::Sell,
            order_kind: OrderKind::Limit,
            status: FillStatus::PartiallyFilled,
            cumulative_quantity: cumulative.parse().unwrap(),
            limit_price: Some(Decimal::ZERO),
            avg_fill_price: Decimal::from(3000),
            reduce_only: true,
        }
    }

    #[test]
    fn publishes_only_new_quantity() {
        let (publisher, mut consumer) = EventBus::channel();
        let mut ctx = ListenerContext::new("bro-bot", publisher);

        let sent = ctx.publish_updates(
            Exchange::Binance,
            vec![update("9", "0.4"), update("9", "0.4"), update("9", "1.0")],
        );
        assert_eq!(sent, 2);

        let first = consumer.try_recv().unwrap();
        assert_eq!(first.filled_quantity, "0.4".parse::<Decimal>().unwrap());
        assert_eq!(first.strategy_tag, "bro-bot");
        assert!(first.reduce_only);
        // a zero limit price means "none"
        assert_eq!(first.limit_price, None);

        let second = consumer.try_recv().unwrap();
        assert_eq!(second.filled_quantity, "0.6".parse::<Decimal>().unwrap());
        assert!(consumer.try_recv().is_none());
    }
}
