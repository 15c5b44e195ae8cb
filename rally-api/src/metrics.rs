use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

use crate::state::AppState;

/// Settlement counters, one registry per process.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub webhook_events: IntCounterVec,
    pub settlements: IntCounterVec,
    pub refunds: IntCounterVec,
    pub sweeps: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("rally".to_string()), None)?;

        let webhook_events = IntCounterVec::new(
            Opts::new("webhook_events_total", "Payment webhook deliveries by outcome"),
            &["outcome"],
        )?;
        let settlements = IntCounterVec::new(
            Opts::new("settlements_total", "Transfer attempts by result"),
            &["result"],
        )?;
        let refunds = IntCounterVec::new(Opts::new("refunds_total", "Refund requests by kind and result"), &["kind", "result"])?;
        let sweeps = IntCounterVec::new(Opts::new("sweeps_total", "Settlement sweeps by trigger and result"), &["trigger", "result"])?;

        registry.register(Box::new(webhook_events.clone()))?;
        registry.register(Box::new(settlements.clone()))?;
        registry.register(Box::new(refunds.clone()))?;
        registry.register(Box::new(sweeps.clone()))?;

        Ok(Self {
            registry,
            webhook_events,
            settlements,
            refunds,
            sweeps,
        })
    }

    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// GET /metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render_with_prefix() {
        let metrics = Metrics::new().unwrap();
        metrics.webhook_events.with_label_values(&["payment_confirmed"]).inc();
        metrics.sweeps.with_label_values(&["schedule", "ok"]).inc_by(2);

        let body = metrics.render().unwrap();
        assert!(body.contains("rally_webhook_events_total{outcome=\"payment_confirmed\"} 1"));
        assert!(body.contains("rally_sweeps_total{result=\"ok\",trigger=\"schedule\"} 2"));
    }
}
