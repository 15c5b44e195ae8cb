use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use chrono::Duration;
use std::sync::Arc;
use tracing::{info, warn};

use rally_core::{Clock, LedgerError, SettlementLedger, SettlementTarget};

use crate::transfer::{SettlementOutcome, TransferOrchestrator};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepFailure {
    pub target: SettlementTarget,
    pub error: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub attempted: usize,
    pub succeeded: usize,
    /// Candidates that turned out ineligible by the time they were settled.
    pub skipped: usize,
    /// Units closed with a zero payout.
    pub closed: usize,
    pub failed: Vec<SweepFailure>,
}

/// Periodic scan for units whose service window has closed.
///
/// Overlapping sweeps and manual settles are safe: each unit goes through
/// the orchestrator's claim, so the sweeper itself holds no lock. A unit
/// that fails for a reason retrying cannot fix is deferred by
/// `retry_backoff` so it stops taking a batch slot every run.
pub struct SettlementSweeper {
    ledger: Arc<dyn SettlementLedger>,
    orchestrator: Arc<TransferOrchestrator>,
    clock: Arc<dyn Clock>,
    batch_limit: i64,
    concurrency: usize,
    retry_backoff: Duration,
}

impl SettlementSweeper {
    pub fn new(
        ledger: Arc<dyn SettlementLedger>,
        orchestrator: Arc<TransferOrchestrator>,
        clock: Arc<dyn Clock>,
        batch_limit: i64,
        concurrency: usize,
        retry_backoff: std::time::Duration,
    ) -> Self {
        Self {
            ledger,
            orchestrator,
            clock,
            batch_limit,
            concurrency: concurrency.max(1),
            retry_backoff: Duration::from_std(retry_backoff).unwrap_or_else(|_| Duration::days(365)),
        }
    }

    pub async fn sweep(&self) -> Result<SweepReport, LedgerError> {
        let now = self.clock.now();
        let candidates = self.ledger.list_settlement_candidates(now, self.batch_limit).await?;

        let mut report = SweepReport {
            attempted: candidates.len(),
            ..SweepReport::default()
        };

        let results: Vec<_> = stream::iter(candidates)
            .map(|target| {
                let orchestrator = Arc::clone(&self.orchestrator);
                async move { (target, orchestrator.settle(target).await) }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (target, result) in results {
            match result {
                Ok(SettlementOutcome::Transferred { .. }) => report.succeeded += 1,
                Ok(SettlementOutcome::Ineligible { .. }) => report.skipped += 1,
                Ok(SettlementOutcome::NothingOwed { .. }) => report.closed += 1,
                Err(e) => {
                    let retryable = e.is_retryable();
                    warn!(?target, error = %e, retryable, "Settlement failed during sweep");
                    if !retryable {
                        let until = now + self.retry_backoff;
                        if let Err(defer_error) = self.ledger.defer_transfer(target, until).await {
                            warn!(?target, error = %defer_error, "Failed to defer unit after permanent failure");
                        }
                    }
                    report.failed.push(SweepFailure {
                        target,
                        retryable,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            skipped = report.skipped,
            closed = report.closed,
            failed = report.failed.len(),
            "Settlement sweep finished"
        );
        Ok(report)
    }
}
