use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde_json::{json, Value};

use rally_settlement::webhook::SIGNATURE_HEADER;

use crate::error::AppError;
use crate::state::AppState;

/// POST /v1/webhooks/payments
///
/// The raw body is verified before it is parsed. Anything acknowledged with
/// 2xx is never redelivered, so storage failures surface as 500.
pub async fn handle_payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|h| h.to_str().ok());

    match state.webhooks.handle(&body, signature).await {
        Ok(outcome) => {
            state.metrics.webhook_events.with_label_values(&[outcome.label()]).inc();
            Ok((StatusCode::OK, Json(json!({ "received": true, "outcome": outcome.label() }))))
        }
        Err(e) => {
            let label = if e.is_client_error() { "rejected" } else { "error" };
            state.metrics.webhook_events.with_label_values(&[label]).inc();
            tracing::warn!(error = %e, "Payment webhook not processed");
            Err(e.into())
        }
    }
}
