use metrics::counter;
use tokio::sync::mpsc;

use crate::models::CanonicalOrderEvent;

/// In-process queue between the master adapters and the trade copier.
///
/// Many producers, one consumer. Publishing never blocks; events from a
/// single adapter arrive in the order they were published, with no
/// ordering promise across adapters. Nothing is persisted.
pub struct EventBus;

impl EventBus {
    pub fn channel() -> (EventPublisher, EventConsumer) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventPublisher { tx }, EventConsumer { rx })
    }
}

/// Producer handle. Clone one per adapter.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: mpsc::UnboundedSender<CanonicalOrderEvent>,
}

impl EventPublisher {
    /// Enqueue an event. Returns `false` if the consumer has gone away.
    pub fn publish(&self, event: CanonicalOrderEvent) -> bool {
        let exchange = event.master_exchange.as_str();
        match self.tx.send(event) {
            Ok(()) => {
                counter!("bus_events_published_total", "exchange" => exchange).increment(1);
                true
            }
            Err(e) => {
                tracing::error!(
                    exchange,
                    order_id = %e.0.order_id,
                    "Event bus consumer dropped, event discarded"
                );
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The single consumer side of the bus.
#[derive(Debug)]
pub struct EventConsumer {
    rx: mpsc::UnboundedReceiver<CanonicalOrderEvent>,
}

impl EventConsumer {
    /// Wait for the next event. `None` once every publisher is dropped and
    /// the queue is drained.
    pub async fn recv(&mut self) -> Option<CanonicalOrderEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<CanonicalOrderEvent> {
        self.rx.try_recv().ok()
    }

    /// Number of events waiting.
    pub fn backlog(&self) -> usize {
        self.rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Exchange, FillStatus, OrderKind, Side};
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn event(exchange: Exchange, order_id: &str) -> CanonicalOrderEvent {
        CanonicalOrderEvent {
            master_exchange: exchange,
            strategy_tag: exchange.default_strategy_tag().into(),
            order_id: order_id.into(),
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            order_kind: OrderKind::Market,
            status: FillStatus::Filled,
            filled_quantity: Decimal::ONE,
            limit_price: None,
            avg_fill_price: Decimal::from(60_000),
            reduce_only: false,
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn preserves_per_publisher_order() {
        let (publisher, mut consumer) = EventBus::channel();
        let bybit = publisher.clone();

        let a = tokio::spawn(async move {
            for i in 0..50 {
                assert!(publisher.publish(event(Exchange::Binance, &format!("b{i}"))));
            }
        });
        let b = tokio::spawn(async move {
            for i in 0..50 {
                assert!(bybit.publish(event(Exchange::Bybit, &format!("y{i}"))));
            }
        });
        a.await.unwrap();
        b.await.unwrap();

        let mut binance_seen = Vec::new();
        let mut bybit_seen = Vec::new();
        while let Some(ev) = consumer.recv().await {
            match ev.master_exchange {
                Exchange::Binance => binance_seen.push(ev.order_id),
                _ => bybit_seen.push(ev.order_id),
            }
        }
        let expected_binance: Vec<String> = (0..50).map(|i| format!("b{i}")).collect();
        let expected_bybit: Vec<String> = (0..50).map(|i| format!("y{i}")).collect();
        assert_eq!(binance_seen, expected_binance);
        assert_eq!(bybit_seen, expected_bybit);
    }

    #[test]
    fn publish_reports_dropped_consumer() {
        let (publisher, consumer) = EventBus::channel();
        drop(consumer);
        assert!(publisher.is_closed());
        assert!(!publisher.publish(event(Exchange::Okx, "1")));
    }
}
