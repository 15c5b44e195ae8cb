pub mod mock;
pub mod refund;
pub mod sweeper;
pub mod transfer;
pub mod webhook;

pub use mock::MockPaymentGateway;
pub use refund::{PackageRefundOutcome, RefundError, RefundManager, RefundOutcome};
pub use sweeper::{SettlementSweeper, SweepFailure, SweepReport};
pub use transfer::{SettlementError, SettlementOutcome, TransferOrchestrator};
pub use webhook::{PaymentEvent, WebhookError, WebhookOutcome, WebhookProcessor};

use rally_core::notify::SettlementNotifier;
use rally_shared::SettlementEvent;

/// Publishes without gating: a failed notification is logged and dropped.
pub(crate) async fn publish(notifier: &dyn SettlementNotifier, event: SettlementEvent) {
    if let Err(e) = notifier.notify(&event).await {
        tracing::warn!(event = event.name(), key = %event.key(), error = %e, "Failed to publish settlement event");
    }
}

/// Bounds an external call; an elapsed timeout is a failure, never a success.
pub(crate) async fn with_timeout<T, F>(limit: std::time::Duration, call: F) -> Result<T, rally_core::payment::GatewayError>
where
    F: std::future::Future<Output = Result<T, rally_core::payment::GatewayError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(rally_core::payment::GatewayError::Timeout),
    }
}
