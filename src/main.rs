use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use copytrader::api::router::create_router;
use copytrader::config::AppConfig;
use copytrader::db::{self, PassthroughCipher, PgBilling, PgCredentialStore, PgPositionLedger, PositionLedger};
use copytrader::exchanges::{http_client, RestClientFactory, RestExchangeClient};
use copytrader::execution::copy_engine::{run_copy_engine, CopyEngine, CopyEngineConfig};
use copytrader::ingestion::binance::BinanceVenue;
use copytrader::ingestion::bingx::BingxVenue;
use copytrader::ingestion::bybit::BybitVenue;
use copytrader::ingestion::{
    run_okx_poller, run_stream_listener, EventBus, EventPublisher, ListenerContext, OkxPoller,
    StreamVenue,
};
use copytrader::models::Exchange;
use copytrader::services::notifier::TelegramNotifier;
use copytrader::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        tracing::debug!("rustls crypto provider already installed");
    }

    let config = AppConfig::from_env()?;
    let addr = format!("{}:{}", config.host, config.port);
    let metrics_handle = copytrader::metrics::init_metrics()?;

    tracing::info!("Connecting to database...");
    let pool = db::init_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;
    tracing::info!("Database connected");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (publisher, consumer) = EventBus::channel();
    let http = http_client();

    // --- Ingestion: one listener per configured master account ---
    let mut tasks = Vec::new();
    for exchange in Exchange::ALL {
        let Some(creds) = config.master_credentials(exchange).cloned() else {
            tracing::warn!(%exchange, "No master credentials configured, listener disabled");
            continue;
        };
        let tag = config.strategy_tag(exchange).to_string();
        let client = match RestExchangeClient::new(http.clone(), exchange, creds.clone()) {
            Ok(client) => client,
            Err(e) => {
                tracing::error!(%exchange, error = %e, "Invalid master credentials, listener disabled");
                continue;
            }
        };

        let venue: Arc<dyn StreamVenue> = match exchange {
            Exchange::Binance => Arc::new(BinanceVenue::new(client)),
            Exchange::Bybit => Arc::new(BybitVenue::new(creds)),
            Exchange::Bingx => Arc::new(BingxVenue::new(client)),
            Exchange::Okx => {
                let poller = OkxPoller::new(client, tag)
                    .with_poll_interval(Duration::from_millis(config.okx_poll_interval_ms))
                    .with_retry_delay(Duration::from_secs(config.reconnect_delay_secs));
                tasks.push(tokio::spawn(run_okx_poller(
                    poller,
                    publisher.clone(),
                    shutdown_rx.clone(),
                )));
                tracing::info!(%exchange, "OKX poller spawned");
                continue;
            }
        };

        let ctx = listener_context(&config, tag, publisher.clone());
        tasks.push(tokio::spawn(run_stream_listener(venue, ctx, shutdown_rx.clone())));
        tracing::info!(%exchange, "Stream listener spawned");
    }
    // Listeners hold their own publishers; the bus closes when they all exit.
    drop(publisher);

    // --- Replication worker ---
    let ledger = Arc::new(PgPositionLedger::new(pool.clone()));
    let engine_config = CopyEngineConfig {
        dry_run: config.dry_run,
        master_capital: config.master_capital.clone(),
        performance_fee: config.performance_fee,
    };
    let mut engine = CopyEngine::new(
        Arc::new(PgCredentialStore::new(pool.clone(), Arc::new(PassthroughCipher))),
        Arc::new(RestClientFactory::new(http.clone())),
        ledger.clone(),
        engine_config,
    );
    if !config.performance_fee.is_zero() {
        engine = engine.with_billing(Arc::new(PgBilling::new(pool.clone())));
    }
    match (config.has_notifications(), config.telegram_bot_token.clone()) {
        (true, Some(token)) => {
            engine = engine.with_notifier(Arc::new(TelegramNotifier::new(http.clone(), token)));
            tracing::info!("Telegram notifications enabled");
        }
        _ => tracing::info!("Telegram notifications disabled"),
    }
    if config.dry_run {
        tracing::warn!("DRY_RUN enabled, replica orders will be logged but not sent");
    }
    let engine_task = tokio::spawn(run_copy_engine(consumer, Arc::new(engine), shutdown_rx.clone()));

    // --- HTTP API ---
    let state = AppState {
        db: pool,
        config,
        metrics_handle,
        ledger: ledger as Arc<dyn PositionLedger>,
    };
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {addr}");
    let mut server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                copytrader::wait_for_shutdown(&mut server_shutdown).await;
            })
            .await
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    shutdown_tx.send(true)?;

    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Listener task panicked");
        }
    }
    if let Err(e) = engine_task.await {
        tracing::error!(error = %e, "Copy engine task panicked");
    }
    server.await??;

    tracing::info!("Shutdown complete");
    Ok(())
}

fn listener_context(config: &AppConfig, tag: String, publisher: EventPublisher) -> ListenerContext {
    ListenerContext::new(tag, publisher)
        .with_reconnect_delay(Duration::from_secs(config.reconnect_delay_secs))
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}
