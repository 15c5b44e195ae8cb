use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

use rally_settlement::SettlementSweeper;

use crate::metrics::Metrics;

/// Runs a settlement sweep every `period`, starting immediately.
pub async fn start_settlement_worker(sweeper: Arc<SettlementSweeper>, metrics: Metrics, period: Duration) {
    info!(period_secs = period.as_secs(), "Settlement worker started");

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        match sweeper.sweep().await {
            Ok(report) => {
                metrics.sweeps.with_label_values(&["schedule", "ok"]).inc();
                if !report.failed.is_empty() {
                    info!(failed = report.failed.len(), "Sweep left units for the next run");
                }
            }
            Err(e) => {
                metrics.sweeps.with_label_values(&["schedule", "error"]).inc();
                error!("Settlement sweep failed: {}", e);
            }
        }
    }
}
