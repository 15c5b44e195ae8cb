use async_trait::async_trait;
use rally_shared::SettlementEvent;
use std::sync::Mutex;

/// Downstream collaborators told about settlement transitions.
/// Failures are the caller's to log; they never roll back a transition.
#[async_trait]
pub trait SettlementNotifier: Send + Sync {
    async fn notify(&self, event: &SettlementEvent) -> Result<(), String>;
}

/// Used when no event stream is configured.
pub struct NoopNotifier;

#[async_trait]
impl SettlementNotifier for NoopNotifier {
    async fn notify(&self, event: &SettlementEvent) -> Result<(), String> {
        tracing::debug!(event = event.name(), key = %event.key(), "No notifier configured, dropping event");
        Ok(())
    }
}

/// Keeps every event in memory; for tests and local runs.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<SettlementEvent>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SettlementEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl SettlementNotifier for RecordingNotifier {
    async fn notify(&self, event: &SettlementEvent) -> Result<(), String> {
        self.events
            .lock()
            .map_err(|_| "recording notifier lock poisoned".to_string())?
            .push(event.clone());
        Ok(())
    }
}
