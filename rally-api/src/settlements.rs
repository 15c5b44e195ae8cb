use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use serde_json::{json, Value};
use uuid::Uuid;

use rally_settlement::SettlementOutcome;

use crate::error::AppError;
use crate::middleware::Claims;
use crate::state::AppState;

/// POST /v1/bookings/{id}/complete
pub async fn complete_booking(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(booking_id): Path<Uuid>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let booking = state
        .ledger
        .get_booking(booking_id)
        .await?
        .ok_or_else(|| AppError::NotFoundError(format!("booking not found: {}", booking_id)))?;

    if !claims.is_operator() && !claims.is_party_to(&[booking.buyer_id, booking.provider_id]) {
        return Err(AppError::AuthorizationError("not a party to this booking".to_string()));
    }

    settle_response(&state, state.orchestrator.settle_booking(booking_id).await)
}

/// POST /v1/installments/{id}/complete
pub async fn complete_installment(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(installment_id): Path<Uuid>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let package = state
        .ledger
        .find_package_by_installment(installment_id)
        .await?
        .ok_or_else(|| AppError::NotFoundError(format!("installment not found: {}", installment_id)))?;

    if !claims.is_operator() && !claims.is_party_to(&[package.buyer_id, package.provider_id]) {
        return Err(AppError::AuthorizationError("not a party to this package".to_string()));
    }

    settle_response(&state, state.orchestrator.settle_installment(installment_id).await)
}

fn settle_response(
    state: &AppState,
    result: Result<SettlementOutcome, rally_settlement::SettlementError>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    match result {
        Ok(outcome @ SettlementOutcome::Transferred { .. }) => {
            state.metrics.settlements.with_label_values(&["transferred"]).inc();
            Ok((StatusCode::OK, Json(json!(outcome))))
        }
        Ok(outcome @ SettlementOutcome::NothingOwed { .. }) => {
            state.metrics.settlements.with_label_values(&["nothing_owed"]).inc();
            Ok((StatusCode::OK, Json(json!(outcome))))
        }
        Ok(SettlementOutcome::Ineligible { target, reason }) => {
            state.metrics.settlements.with_label_values(&["ineligible"]).inc();
            Ok((
                StatusCode::CONFLICT,
                Json(json!({
                    "status": "ineligible",
                    "target": target,
                    "reason": reason.code(),
                    "message": reason.to_string(),
                    "retry_later": reason.may_clear(),
                })),
            ))
        }
        Err(e) => {
            state.metrics.settlements.with_label_values(&["failed"]).inc();
            Err(e.into())
        }
    }
}
