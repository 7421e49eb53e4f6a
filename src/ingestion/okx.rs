use chrono::Utc;
use reqwest::Method;
use rust_decimal::Decimal;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

use super::bus::EventPublisher;
use super::listener::ListenerError;
use super::seen_orders::SeenOrders;
use crate::exchanges::types::{OkxEnvelope, OkxHistoricalOrder};
use crate::exchanges::{ClientError, RestExchangeClient};
use crate::models::{
    normalize_symbol, CanonicalOrderEvent, Exchange, FillStatus, OrderKind, Side,
};
use crate::wait_for_shutdown;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const ORDERS_HISTORY_PATH: &str = "/api/v5/trade/orders-history";
const SYNC_LIMIT: u32 = 100;
const POLL_LIMIT: u32 = 20;

/// OKX spot has no private push channel the copier relies on, so closed
/// orders are polled and deduplicated by order id.
pub struct OkxPoller {
    client: RestExchangeClient,
    strategy_tag: String,
    seen: SeenOrders,
    poll_interval: Duration,
    retry_delay: Duration,
}

impl OkxPoller {
    pub fn new(client: RestExchangeClient, strategy_tag: impl Into<String>) -> Self {
        Self {
            client,
            strategy_tag: strategy_tag.into(),
            seen: SeenOrders::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            retry_delay: super::listener::DEFAULT_RECONNECT_DELAY,
        }
    }

    pub fn with_poll_interval(mut self, every: Duration) -> Self {
        self.poll_interval = every;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Fetch the most recent closed spot orders, newest first.
    pub async fn fetch_closed(&self, limit: u32) -> Result<Vec<OkxHistoricalOrder>, ListenerError> {
        let env: OkxEnvelope<OkxHistoricalOrder> = self
            .client
            .signed_json(
                Method::GET,
                ORDERS_HISTORY_PATH,
                &[("instType", "SPOT".into()), ("limit", limit.to_string().into())],
            )
            .await?;
        if env.code != "0" {
            return Err(ClientError::Rejected {
                exchange: Exchange::Okx,
                code: env.code,
                message: env.msg,
            }
            .into());
        }
        Ok(env.data)
    }

    /// Mark every order in `orders` as seen without emitting anything.
    pub fn synchronize(&mut self, orders: &[OkxHistoricalOrder]) -> usize {
        orders
            .iter()
            .filter(|order| self.seen.insert(&order.ord_id))
            .count()
    }

    /// Turn a poll result into events for closed orders not seen before,
    /// oldest first.
    pub fn process_batch(&mut self, orders: Vec<OkxHistoricalOrder>) -> Vec<CanonicalOrderEvent> {
        let mut events = Vec::new();
        for order in orders.into_iter().rev() {
            let filled = order.acc_fill_sz.unwrap_or_default();
            let status = match order.state.as_str() {
                "filled" => FillStatus::Filled,
                "canceled" | "mmp_canceled" => FillStatus::PartiallyFilled,
                _ => continue,
            };
            if !self.seen.insert(&order.ord_id) {
                continue;
            }
            if filled <= Decimal::ZERO {
                continue;
            }
            match self.to_event(order, status, filled) {
                Some(event) => events.push(event),
                None => tracing::warn!("Skipping OKX order with unknown side"),
            }
        }
        events
    }

    fn to_event(
        &self,
        order: OkxHistoricalOrder,
        status: FillStatus,
        filled: Decimal,
    ) -> Option<CanonicalOrderEvent> {
        let side = Side::from_api_str(&order.side)?;
        let limit_price = order.px.filter(|p| !p.is_zero());
        let avg_fill_price = order
            .avg_px
            .filter(|p| !p.is_zero())
            .or(limit_price)
            .unwrap_or_default();
        Some(CanonicalOrderEvent {
            master_exchange: Exchange::Okx,
            strategy_tag: self.strategy_tag.clone(),
            order_id: order.ord_id,
            symbol: normalize_symbol(&order.inst_id),
            side,
            order_kind: OrderKind::from_api_str(&order.ord_type),
            status,
            filled_quantity: filled,
            limit_price,
            avg_fill_price,
            reduce_only: false,
            received_at: Utc::now(),
        })
    }
}

/// Poll OKX until shutdown. The first successful fetch only records what
/// already exists so that orders closed before startup are never copied.
pub async fn run_okx_poller(
    mut poller: OkxPoller,
    publisher: EventPublisher,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!("OKX poller: synchronizing order history...");
    loop {
        match poller.fetch_closed(SYNC_LIMIT).await {
            Ok(orders) => {
                let ignored = poller.synchronize(&orders);
                tracing::info!(ignored, "OKX poller synchronized, ignoring historical orders");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "OKX history sync failed, retrying");
            }
        }
        tokio::select! {
            _ = sleep(poller.retry_delay) => {}
            _ = wait_for_shutdown(&mut shutdown) => return,
        }
    }

    loop {
        let delay = match poller.fetch_closed(POLL_LIMIT).await {
            Ok(orders) => {
                for event in poller.process_batch(orders) {
                    tracing::info!(
                        order_id = %event.order_id,
                        symbol = %event.symbol,
                        side = %event.side,
                        qty = %event.filled_quantity,
                        price = %event.avg_fill_price,
                        "Master fill detected"
                    );
                    publisher.publish(event);
                }
                poller.poll_interval
            }
            Err(e) => {
                tracing::debug!(error = %e, "OKX poll failed");
                poller.retry_delay
            }
        };

        tokio::select! {
            _ = sleep(delay) => {}
            _ = wait_for_shutdown(&mut shutdown) => break,
        }
    }

    tracing::info!("OKX poller stopped");
}
