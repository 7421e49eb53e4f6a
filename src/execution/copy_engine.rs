use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use dashmap::DashMap;
use futures_util::future::join_all;
use metrics::{counter, gauge, histogram};
use rust_decimal::Decimal;
use tokio::sync::watch;

use crate::db::PositionLedger;
use crate::ingestion::EventConsumer;
use crate::models::{CanonicalOrderEvent, Exchange, FollowerConnection, MarketType, ReplicaOrder, Side};
use crate::services::notifier::{format_fee_exhausted, format_replica_filled};
use crate::wait_for_shutdown;

use super::collaborators::{Billing, ClientFactory, CredentialStore, ExchangeClient, Notifier};
use super::order_executor::{fill_price, OrderExecutor};
use super::position_sizer::{self, ReplicaPlan, SizingStrategy, SkipReason, DEFAULT_MASTER_CAPITAL};

/// Configuration for the copy engine.
#[derive(Debug, Clone)]
pub struct CopyEngineConfig {
    pub dry_run: bool,
    /// Nominal capital behind each futures master, the denominator of
    /// proportional sizing.
    pub master_capital: HashMap<Exchange, Decimal>,
    /// Token fee charged per successful replica. Zero disables billing.
    pub performance_fee: Decimal,
}

impl Default for CopyEngineConfig {
    fn default() -> Self {
        Self {
            dry_run: true,
            master_capital: HashMap::new(),
            performance_fee: Decimal::ZERO,
        }
    }
}

impl CopyEngineConfig {
    pub fn sizing_for(&self, master: Exchange) -> SizingStrategy {
        let capital = self
            .master_capital
            .get(&master)
            .copied()
            .unwrap_or_else(|| Decimal::from(DEFAULT_MASTER_CAPITAL));
        SizingStrategy::for_market(master.market_type(), capital)
    }
}

/// What happened for one follower on one event.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaOutcome {
    Placed {
        order_id: String,
        quantity: Decimal,
        closed: bool,
    },
    Skipped(SkipReason),
    Failed(String),
}

/// Turns master events into follower orders and ledger updates.
pub struct CopyEngine {
    store: Arc<dyn CredentialStore>,
    clients: Arc<dyn ClientFactory>,
    ledger: Arc<dyn PositionLedger>,
    notifier: Option<Arc<dyn Notifier>>,
    billing: Option<Arc<dyn Billing>>,
    executor: OrderExecutor,
    config: CopyEngineConfig,
    steps: DashMap<(Exchange, String), Decimal>,
}

impl CopyEngine {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        clients: Arc<dyn ClientFactory>,
        ledger: Arc<dyn PositionLedger>,
        config: CopyEngineConfig,
    ) -> Self {
        Self {
            store,
            clients,
            ledger,
            notifier: None,
            billing: None,
            executor: OrderExecutor::new(config.dry_run),
            config,
            steps: DashMap::new(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_billing(mut self, billing: Arc<dyn Billing>) -> Self {
        self.billing = Some(billing);
        self
    }

    pub fn config(&self) -> &CopyEngineConfig {
        &self.config
    }

    /// Replicate one master event onto every eligible follower. Followers
    /// are handled concurrently and independently; one follower's failure
    /// never affects another.
    pub async fn process_event(
        &self,
        event: &CanonicalOrderEvent,
    ) -> anyhow::Result<Vec<(i64, ReplicaOutcome)>> {
        let connections = self
            .store
            .get_follower_connections(Some(&event.strategy_tag))
            .await
            .context("loading follower connections")?;

        let eligible: Vec<FollowerConnection> = connections
            .into_iter()
            .filter(|c| c.active && c.strategy_tag == event.strategy_tag)
            .collect();

        tracing::info!(
            event = %event,
            strategy = %event.strategy_tag,
            followers = eligible.len(),
            "Replicating master fill"
        );

        let outcomes = join_all(eligible.iter().map(|conn| async move {
            (conn.follower_id, self.replicate(event, conn).await)
        }))
        .await;

        Ok(outcomes)
    }

    async fn replicate(&self, event: &CanonicalOrderEvent, conn: &FollowerConnection) -> ReplicaOutcome {
        match self.try_replicate(event, conn).await {
            Ok(outcome) => outcome,
            Err(e) => {
                counter!("replica_orders_failed_total", "exchange" => conn.exchange.as_str())
                    .increment(1);
                tracing::error!(
                    follower_id = conn.follower_id,
                    exchange = %conn.exchange,
                    symbol = %event.symbol,
                    error = %format!("{e:#}"),
                    "Replica failed"
                );
                ReplicaOutcome::Failed(format!("{e:#}"))
            }
        }
    }

    async fn try_replicate(
        &self,
        event: &CanonicalOrderEvent,
        conn: &FollowerConnection,
    ) -> anyhow::Result<ReplicaOutcome> {
        let credentials = self
            .store
            .get_decrypted_credentials(conn.follower_id, conn.exchange)
            .await?
            .with_context(|| format!("no credentials for {}", conn.exchange))?;
        let client = self.clients.build(conn.exchange, credentials)?;

        let step = self.quantity_step(client.as_ref(), &event.symbol).await?;
        let open = self
            .ledger
            .open_position(conn.follower_id, &event.symbol)
            .await?;

        let strategy = self.config.sizing_for(event.master_exchange);
        let plan = position_sizer::plan_replica(strategy, conn, event, open.as_ref(), step);
        let quantity = match plan {
            ReplicaPlan::Skip(reason) => return Ok(self.skipped(event, conn, reason)),
            ReplicaPlan::Open { quantity }
            | ReplicaPlan::Reduce { quantity }
            | ReplicaPlan::CloseAll { quantity } => quantity,
        };

        let order = ReplicaOrder {
            follower_id: conn.follower_id,
            exchange: conn.exchange,
            symbol: event.symbol.clone(),
            side: event.side,
            quantity,
            reduce_only: plan.is_close(),
            reference_price: event.reference_price(),
        };

        if matches!(plan, ReplicaPlan::Open { .. })
            && order.side == Side::Buy
            && conn.exchange.market_type() == MarketType::Spot
            && !self.executor.has_quote_balance(client.as_ref(), &order).await
        {
            return Ok(self.skipped(event, conn, SkipReason::InsufficientBalance));
        }

        let ack = self.executor.execute(client.as_ref(), &order).await?;
        counter!("replica_orders_placed_total", "exchange" => conn.exchange.as_str()).increment(1);

        let price = fill_price(&ack, &order);
        let recorded = match plan {
            ReplicaPlan::Open { quantity } => self
                .ledger
                .record_fill(conn.follower_id, &order.symbol, order.side, price, quantity)
                .await
                .map(Some),
            ReplicaPlan::Reduce { quantity } => {
                self.ledger
                    .reduce_position(conn.follower_id, &order.symbol, quantity)
                    .await
            }
            ReplicaPlan::CloseAll { .. } => {
                self.ledger
                    .record_close(conn.follower_id, &order.symbol)
                    .await
            }
            ReplicaPlan::Skip(_) => Ok(None),
        };
        // The order is live on the exchange either way; a ledger miss is
        // reported but does not turn the replica into a failure.
        let position = match recorded {
            Ok(position) => position,
            Err(e) => {
                counter!("ledger_write_failures_total", "exchange" => conn.exchange.as_str())
                    .increment(1);
                tracing::error!(
                    follower_id = conn.follower_id,
                    exchange = %conn.exchange,
                    order_id = %ack.order_id,
                    symbol = %order.symbol,
                    error = %e,
                    "Replica placed but ledger write failed"
                );
                None
            }
        };

        tracing::info!(
            follower_id = conn.follower_id,
            exchange = %conn.exchange,
            order_id = %ack.order_id,
            symbol = %order.symbol,
            side = %order.side,
            qty = %quantity,
            price = %price,
            position_qty = ?position.as_ref().map(|p| p.total_quantity),
            "Replica placed"
        );

        if let Some(n) = &self.notifier {
            n.send(conn.follower_id, &format_replica_filled(&order, price, plan.is_close()))
                .await;
        }
        self.charge_fee(conn.follower_id).await;

        Ok(ReplicaOutcome::Placed {
            order_id: ack.order_id,
            quantity,
            closed: plan.is_close(),
        })
    }

    fn skipped(
        &self,
        event: &CanonicalOrderEvent,
        conn: &FollowerConnection,
        reason: SkipReason,
    ) -> ReplicaOutcome {
        counter!("replica_orders_skipped_total", "reason" => reason.to_string()).increment(1);
        tracing::info!(
            follower_id = conn.follower_id,
            exchange = %conn.exchange,
            symbol = %event.symbol,
            reason = %reason,
            "Replica skipped"
        );
        ReplicaOutcome::Skipped(reason)
    }

    async fn quantity_step(&self, client: &dyn ExchangeClient, symbol: &str) -> anyhow::Result<Decimal> {
        let key = (client.exchange(), symbol.to_string());
        if let Some(step) = self.steps.get(&key) {
            return Ok(*step);
        }
        let step = client
            .quantity_step(symbol)
            .await
            .with_context(|| format!("loading quantity step for {symbol}"))?;
        self.steps.insert(key, step);
        Ok(step)
    }

    async fn charge_fee(&self, follower_id: i64) {
        if self.config.performance_fee <= Decimal::ZERO {
            return;
        }
        let Some(billing) = &self.billing else {
            return;
        };
        match billing.deduct_fee(follower_id, self.config.performance_fee).await {
            Ok(balance) if balance <= Decimal::ZERO => {
                tracing::info!(follower_id, balance = %balance, "Token balance exhausted, copying paused");
                if let Some(n) = &self.notifier {
                    n.send(follower_id, &format_fee_exhausted(balance)).await;
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(follower_id, error = %e, "Failed to deduct performance fee");
            }
        }
    }
}

/// Run the copy engine loop until the bus closes or shutdown is requested.
/// An event already being processed is always finished.
pub async fn run_copy_engine(
    mut consumer: EventConsumer,
    engine: Arc<CopyEngine>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(dry_run = engine.config().dry_run, "Copy engine started");

    loop {
        let event = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => {
                tracing::info!(backlog = consumer.backlog(), "Copy engine stopping");
                break;
            }
            event = consumer.recv() => match event {
                Some(event) => event,
                None => {
                    tracing::warn!("Event bus closed, shutting down copy engine");
                    break;
                }
            },
        };

        let start = Instant::now();
        if let Err(e) = engine.process_event(&event).await {
            tracing::error!(
                error = %e,
                order_id = %event.order_id,
                exchange = %event.master_exchange,
                "Failed to process master event"
            );
        }
        histogram!("replication_latency_seconds").record(start.elapsed().as_secs_f64());
        gauge!("event_bus_backlog").set(consumer.backlog() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{InMemoryLedger, LedgerError};
    use crate::exchanges::ClientError;
    use crate::ingestion::EventBus;
    use crate::models::{Credentials, FillStatus, OrderAck, OrderKind};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    fn d(v: &str) -> Decimal {
        v.parse().unwrap()
    }

    struct StaticStore {
        connections: Vec<FollowerConnection>,
    }

    #[async_trait]
    impl CredentialStore for StaticStore {
        async fn get_decrypted_credentials(
            &self,
            follower_id: i64,
            _exchange: Exchange,
        ) -> anyhow::Result<Option<Credentials>> {
            Ok(Some(Credentials::new(
                format!("key-{follower_id}"),
                "secret".into(),
                None,
            )))
        }

        async fn get_follower_connections(
            &self,
            strategy_tag: Option<&str>,
        ) -> anyhow::Result<Vec<FollowerConnection>> {
            Ok(self
                .connections
                .iter()
                .filter(|c| strategy_tag.map_or(true, |t| t == c.strategy_tag))
                .cloned()
                .collect())
        }
    }

    /// Records placed orders; rejects every order for `fail_for`.
    #[derive(Default)]
    struct RecordingFactory {
        fail_for: Option<String>,
        placed: Arc<Mutex<Vec<ReplicaOrder>>>,
    }

    struct RecordingClient {
        exchange: Exchange,
        api_key: String,
        fail_for: Option<String>,
        placed: Arc<Mutex<Vec<ReplicaOrder>>>,
    }

    impl ClientFactory for RecordingFactory {
        fn build(
            &self,
            exchange: Exchange,
            credentials: Credentials,
        ) -> Result<Arc<dyn ExchangeClient>, ClientError> {
            Ok(Arc::new(RecordingClient {
                exchange,
                api_key: credentials.api_key,
                fail_for: self.fail_for.clone(),
                placed: Arc::clone(&self.placed),
            }))
        }
    }

    #[async_trait]
    impl ExchangeClient for RecordingClient {
        fn exchange(&self) -> Exchange {
            self.exchange
        }

        async fn place_order(&self, order: &ReplicaOrder) -> Result<OrderAck, ClientError> {
            if self.fail_for.as_deref() == Some(self.api_key.as_str()) {
                return Err(ClientError::Rejected {
                    exchange: self.exchange,
                    code: "-2019".into(),
                    message: "Margin is insufficient".into(),
                });
            }
            self.placed.lock().unwrap().push(order.clone());
            Ok(OrderAck {
                order_id: format!("ack-{}", order.follower_id),
                avg_price: None,
            })
        }

        async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> Result<(), ClientError> {
            Ok(())
        }

        async fn get_balance(&self) -> Result<Decimal, ClientError> {
            Ok(Decimal::from(1_000_000))
        }

        async fn quantity_step(&self, _symbol: &str) -> Result<Decimal, ClientError> {
            Ok(d("0.001"))
        }
    }

    fn connection(follower_id: i64, reserved: &str) -> FollowerConnection {
        FollowerConnection {
            follower_id,
            exchange: Exchange::Binance,
            strategy_tag: "t1".into(),
            reserved_capital: d(reserved),
            risk_pct: d("1"),
            active: true,
        }
    }

    fn event(side: Side, qty: &str, reduce_only: bool) -> CanonicalOrderEvent {
        CanonicalOrderEvent {
            master_exchange: Exchange::Binance,
            strategy_tag: "t1".into(),
            order_id: "m-1".into(),
            symbol: "BTCUSDT".into(),
            side,
            order_kind: OrderKind::Market,
            status: FillStatus::Filled,
            filled_quantity: d(qty),
            limit_price: None,
            avg_fill_price: d("60000"),
            reduce_only,
            received_at: Utc::now(),
        }
    }

    fn engine(
        connections: Vec<FollowerConnection>,
        factory: RecordingFactory,
        ledger: Arc<InMemoryLedger>,
    ) -> CopyEngine {
        CopyEngine::new(
            Arc::new(StaticStore { connections }),
            Arc::new(factory),
            ledger,
            CopyEngineConfig {
                dry_run: false,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn scenario_opens_scaled_position() {
        let ledger = Arc::new(InMemoryLedger::new());
        let factory = RecordingFactory::default();
        let placed = Arc::clone(&factory.placed);
        let engine = engine(vec![connection(7, "6000")], factory, Arc::clone(&ledger));

        engine.process_event(&event(Side::Buy, "1.0", false)).await.unwrap();

        let orders = placed.lock().unwrap().clone();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].quantity, d("0.1"));
        assert!(!orders[0].reduce_only);

        let pos = ledger.open_position(7, "BTCUSDT").await.unwrap().unwrap();
        assert_eq!(pos.side(), Some(Side::Buy));
        assert_eq!(pos.avg_entry_price, d("60000"));
        assert_eq!(pos.total_quantity, d("0.1"));
        assert!(pos.is_open());
    }

    #[tokio::test]
    async fn one_failing_follower_does_not_block_others() {
        let ledger = Arc::new(InMemoryLedger::new());
        let factory = RecordingFactory {
            fail_for: Some("key-2".into()),
            ..Default::default()
        };
        let placed = Arc::clone(&factory.placed);
        let engine = engine(
            vec![connection(1, "6000"), connection(2, "6000"), connection(3, "6000")],
            factory,
            Arc::clone(&ledger),
        );

        let outcomes = engine.process_event(&event(Side::Buy, "1.0", false)).await.unwrap();

        assert_eq!(placed.lock().unwrap().len(), 2);
        assert!(matches!(outcomes[1], (2, ReplicaOutcome::Failed(_))));
        assert!(ledger.open_position(1, "BTCUSDT").await.unwrap().is_some());
        assert!(ledger.open_position(2, "BTCUSDT").await.unwrap().is_none());
        assert!(ledger.open_position(3, "BTCUSDT").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn reduce_only_is_capped_and_closes_the_ledger_row() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger
            .record_fill(7, "BTCUSDT", Side::Buy, d("60000"), d("0.05"))
            .await
            .unwrap();
        let factory = RecordingFactory::default();
        let placed = Arc::clone(&factory.placed);
        let engine = engine(vec![connection(7, "6000")], factory, Arc::clone(&ledger));

        let outcomes = engine.process_event(&event(Side::Sell, "5", true)).await.unwrap();

        let orders = placed.lock().unwrap().clone();
        assert_eq!(orders[0].quantity, d("0.05"));
        assert!(orders[0].reduce_only);
        assert_eq!(orders[0].side, Side::Sell);
        assert!(matches!(outcomes[0].1, ReplicaOutcome::Placed { closed: true, .. }));
        assert!(ledger.open_position(7, "BTCUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reduce_only_without_position_places_nothing() {
        let ledger = Arc::new(InMemoryLedger::new());
        let factory = RecordingFactory::default();
        let placed = Arc::clone(&factory.placed);
        let engine = engine(vec![connection(7, "6000")], factory, ledger);

        let outcomes = engine.process_event(&event(Side::Sell, "1", true)).await.unwrap();

        assert!(placed.lock().unwrap().is_empty());
        assert_eq!(
            outcomes,
            vec![(7, ReplicaOutcome::Skipped(SkipReason::NoPositionToReduce))]
        );
    }

    #[tokio::test]
    async fn inactive_and_other_strategy_followers_are_ignored() {
        let ledger = Arc::new(InMemoryLedger::new());
        let mut inactive = connection(1, "6000");
        inactive.active = false;
        let mut other = connection(2, "6000");
        other.strategy_tag = "cgt".into();
        let engine = engine(
            vec![inactive, other, connection(3, "6000")],
            RecordingFactory::default(),
            ledger,
        );

        let outcomes = engine.process_event(&event(Side::Buy, "1", false)).await.unwrap();
        let ids: Vec<i64> = outcomes.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![3]);
    }

    #[tokio::test]
    async fn full_close_sends_step_rounded_reduce_only_order() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger
            .record_fill(7, "BTCUSDT", Side::Buy, d("60000"), d("0.0505"))
            .await
            .unwrap();
        let factory = RecordingFactory::default();
        let placed = Arc::clone(&factory.placed);
        let engine = engine(vec![connection(7, "6000")], factory, Arc::clone(&ledger));

        engine.process_event(&event(Side::Sell, "5", true)).await.unwrap();

        let orders = placed.lock().unwrap().clone();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].quantity, d("0.05"));
        assert!(orders[0].reduce_only);
        assert!(ledger.open_position(7, "BTCUSDT").await.unwrap().is_none());
    }

    /// Ledger whose writes always fail.
    struct BrokenLedger;

    #[async_trait]
    impl PositionLedger for BrokenLedger {
        async fn open_position(
            &self,
            _follower_id: i64,
            _symbol: &str,
        ) -> Result<Option<crate::models::Position>, LedgerError> {
            Ok(None)
        }

        async fn record_fill(
            &self,
            follower_id: i64,
            symbol: &str,
            _side: Side,
            _price: Decimal,
            _quantity: Decimal,
        ) -> Result<crate::models::Position, LedgerError> {
            Err(LedgerError::RetriesExhausted {
                follower_id,
                symbol: symbol.to_string(),
                attempts: 5,
            })
        }

        async fn reduce_position(
            &self,
            _follower_id: i64,
            _symbol: &str,
            _quantity: Decimal,
        ) -> Result<Option<crate::models::Position>, LedgerError> {
            Ok(None)
        }

        async fn record_close(
            &self,
            _follower_id: i64,
            _symbol: &str,
        ) -> Result<Option<crate::models::Position>, LedgerError> {
            Ok(None)
        }

        async fn list_open_positions(
            &self,
            _follower_id: Option<i64>,
        ) -> Result<Vec<crate::models::Position>, LedgerError> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(i64, String)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, follower_id: i64, message: &str) {
            self.sent.lock().unwrap().push((follower_id, message.to_string()));
        }
    }

    #[tokio::test]
    async fn ledger_failure_after_placement_still_reports_placed() {
        let factory = RecordingFactory::default();
        let placed = Arc::clone(&factory.placed);
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = CopyEngine::new(
            Arc::new(StaticStore {
                connections: vec![connection(7, "6000")],
            }),
            Arc::new(factory),
            Arc::new(BrokenLedger),
            CopyEngineConfig {
                dry_run: false,
                ..Default::default()
            },
        )
        .with_notifier(notifier.clone());

        let outcomes = engine.process_event(&event(Side::Buy, "1.0", false)).await.unwrap();

        assert_eq!(placed.lock().unwrap().len(), 1);
        assert_eq!(
            outcomes,
            vec![(
                7,
                ReplicaOutcome::Placed {
                    order_id: "ack-7".into(),
                    quantity: d("0.1"),
                    closed: false,
                }
            )]
        );
        assert_eq!(notifier.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn worker_drains_bus_and_stops_on_shutdown() {
        let ledger = Arc::new(InMemoryLedger::new());
        let engine = Arc::new(engine(
            vec![connection(7, "6000")],
            RecordingFactory::default(),
            Arc::clone(&ledger),
        ));
        let (publisher, consumer) = EventBus::channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        publisher.publish(event(Side::Buy, "1", false));
        publisher.publish(event(Side::Buy, "1", false));
        drop(publisher);

        run_copy_engine(consumer, engine, stop_rx).await;
        drop(stop_tx);

        let pos = ledger.open_position(7, "BTCUSDT").await.unwrap().unwrap();
        assert_eq!(pos.total_quantity, d("0.2"));
    }
}
