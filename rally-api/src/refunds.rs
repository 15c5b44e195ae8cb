use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde::Deserialize;
use uuid::Uuid;

use rally_core::payment::RefundReason;
use rally_settlement::{PackageRefundOutcome, RefundOutcome};

use crate::error::AppError;
use crate::middleware::Claims;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct BookingRefundRequest {
    /// Omitted means everything not yet refunded.
    pub amount_minor: Option<i64>,
    pub reason: Option<RefundReason>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PackageRefundRequest {
    pub reason: Option<RefundReason>,
}

/// POST /v1/admin/bookings/{id}/refunds
pub async fn refund_booking(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(booking_id): Path<Uuid>,
    Json(req): Json<BookingRefundRequest>,
) -> Result<Json<RefundOutcome>, AppError> {
    let reason = req.reason.unwrap_or(RefundReason::RequestedByCustomer);
    tracing::info!(
        operator = %claims.sub,
        %booking_id,
        amount = ?req.amount_minor,
        reason = reason.as_str(),
        "Operator refund requested"
    );

    let (kind, result) = match req.amount_minor {
        Some(amount) => ("partial", state.refunds.refund_partial(booking_id, amount, reason).await),
        None => ("full", state.refunds.refund_full(booking_id, reason).await),
    };

    let label = if result.is_ok() { "ok" } else { "error" };
    state.metrics.refunds.with_label_values(&[kind, label]).inc();

    Ok(Json(result?))
}

/// POST /v1/admin/packages/{id}/refunds
pub async fn refund_package(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(package_id): Path<Uuid>,
    Json(req): Json<PackageRefundRequest>,
) -> Result<Json<PackageRefundOutcome>, AppError> {
    let reason = req.reason.unwrap_or(RefundReason::RequestedByCustomer);
    tracing::info!(operator = %claims.sub, %package_id, reason = reason.as_str(), "Package cancellation requested");

    let result = state.refunds.refund_package_pro_rata(package_id, reason).await;

    let label = if result.is_ok() { "ok" } else { "error" };
    state.metrics.refunds.with_label_values(&["pro_rata", label]).inc();

    Ok(Json(result?))
}
