use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rally_api::{app, worker, AppState};
use rally_core::notify::{NoopNotifier, SettlementNotifier};
use rally_core::payment::PaymentGateway;
use rally_core::{Clock, SystemClock};
use rally_settlement::MockPaymentGateway;
use rally_store::app_config::{Config, PaymentProviderKind};
use rally_store::{DbClient, EventProducer, PgLedger, RedisClient, StripeGateway};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "rally_api=debug,rally_settlement=debug,rally_store=info,tower_http=debug,axum::rejection=trace".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting Rally settlement API on port {}", config.server.port);

    let db = DbClient::new(&config.database).await.context("Failed to connect to Postgres")?;
    db.migrate().await.context("Failed to run migrations")?;
    let ledger = Arc::new(PgLedger::new(db.pool.clone()));

    let gateway: Arc<dyn PaymentGateway> = match config.payments.provider {
        PaymentProviderKind::Stripe => Arc::new(StripeGateway::new(&config.payments)?),
        PaymentProviderKind::Mock => {
            tracing::warn!("Using the mock payment gateway; no money will move");
            Arc::new(MockPaymentGateway::new())
        }
    };

    let notifier: Arc<dyn SettlementNotifier> = match &config.kafka {
        Some(kafka) => Arc::new(EventProducer::new(&kafka.brokers, kafka.topic.clone()).context("Failed to create Kafka producer")?),
        None => Arc::new(NoopNotifier),
    };

    let redis = match &config.redis {
        Some(redis) => match RedisClient::new(&redis.url).await {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                tracing::warn!("Redis unavailable, rate limiting disabled: {}", e);
                None
            }
        },
        None => None,
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state = AppState::new(&config, ledger, gateway, notifier, clock, redis)?;

    tokio::spawn(worker::start_settlement_worker(
        state.sweeper.clone(),
        state.metrics.clone(),
        Duration::from_secs(config.sweeper.interval_seconds.max(1)),
    ));

    let app = app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}
