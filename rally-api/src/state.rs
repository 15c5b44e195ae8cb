use std::sync::Arc;
use std::time::Duration;

use rally_core::notify::SettlementNotifier;
use rally_core::payment::PaymentGateway;
use rally_core::{Clock, SettlementLedger};
use rally_settlement::{RefundManager, SettlementSweeper, TransferOrchestrator, WebhookProcessor};
use rally_shared::Masked;
use rally_store::app_config::Config;
use rally_store::RedisClient;

use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: Masked<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn SettlementLedger>,
    pub webhooks: Arc<WebhookProcessor>,
    pub orchestrator: Arc<TransferOrchestrator>,
    pub refunds: Arc<RefundManager>,
    pub sweeper: Arc<SettlementSweeper>,
    /// Rate limiting is skipped when no Redis is configured.
    pub redis: Option<Arc<RedisClient>>,
    pub rate_limit_per_minute: i64,
    pub metrics: Metrics,
    pub auth: AuthConfig,
    pub sweep_secret: Masked<String>,
}

impl AppState {
    /// Wires the settlement services around one ledger, gateway and notifier.
    pub fn new(
        config: &Config,
        ledger: Arc<dyn SettlementLedger>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn SettlementNotifier>,
        clock: Arc<dyn Clock>,
        redis: Option<Arc<RedisClient>>,
    ) -> Result<Self, prometheus::Error> {
        let call_timeout: Duration = config.payments.request_timeout();

        let webhooks = Arc::new(WebhookProcessor::new(
            ledger.clone(),
            notifier.clone(),
            clock.clone(),
            config.commission,
            config.payments.webhook_secret.expose().clone(),
            config.payments.webhook_tolerance_seconds,
        ));
        let orchestrator = Arc::new(TransferOrchestrator::new(
            ledger.clone(),
            gateway.clone(),
            notifier.clone(),
            clock.clone(),
            config.commission,
            call_timeout,
        ));
        let refunds = Arc::new(RefundManager::new(
            ledger.clone(),
            gateway,
            notifier,
            clock.clone(),
            call_timeout,
        ));
        let sweeper = Arc::new(SettlementSweeper::new(
            ledger.clone(),
            orchestrator.clone(),
            clock,
            config.sweeper.batch_limit,
            config.sweeper.concurrency,
            Duration::from_secs(config.sweeper.retry_backoff_seconds),
        ));

        Ok(Self {
            ledger,
            webhooks,
            orchestrator,
            refunds,
            sweeper,
            redis,
            rate_limit_per_minute: config.redis.as_ref().map(|r| r.rate_limit_per_minute).unwrap_or(100),
            metrics: Metrics::new()?,
            auth: AuthConfig {
                secret: config.auth.jwt_secret.clone(),
            },
            sweep_secret: config.sweeper.trigger_secret.clone(),
        })
    }
}
