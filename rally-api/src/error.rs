use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use rally_core::LedgerError;
use rally_settlement::{RefundError, SettlementError, WebhookError};

#[derive(Debug)]
pub enum AppError {
    AuthenticationError(String),
    AuthorizationError(String),
    ValidationError(String),
    NotFoundError(String),
    ConflictError(String),
    UnprocessableError(String),
    /// The payment processor failed or timed out; safe to retry.
    UpstreamError(String),
    InternalServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::AuthenticationError(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::AuthorizationError(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFoundError(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::ConflictError(msg) => (StatusCode::CONFLICT, msg),
            AppError::UnprocessableError(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            AppError::UpstreamError(msg) => {
                tracing::warn!("Upstream failure: {}", msg);
                (StatusCode::BAD_GATEWAY, msg)
            }
            AppError::InternalServerError(msg) => {
                tracing::error!("Internal Server Error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string())
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound { .. } => AppError::NotFoundError(err.to_string()),
            _ => AppError::InternalServerError(err.to_string()),
        }
    }
}

impl From<SettlementError> for AppError {
    fn from(err: SettlementError) -> Self {
        match err {
            SettlementError::NotFound { .. } => AppError::NotFoundError(err.to_string()),
            SettlementError::AccountUnusable(_) => AppError::UnprocessableError(err.to_string()),
            SettlementError::Gateway(_) => AppError::UpstreamError(err.to_string()),
            SettlementError::Ledger(_) | SettlementError::Inconsistency { .. } => {
                AppError::InternalServerError(err.to_string())
            }
        }
    }
}

impl From<RefundError> for AppError {
    fn from(err: RefundError) -> Self {
        match err {
            RefundError::NotFound { .. } => AppError::NotFoundError(err.to_string()),
            RefundError::Validation(_) => AppError::ValidationError(err.to_string()),
            RefundError::NotRefundable(_) => AppError::ConflictError(err.to_string()),
            RefundError::Gateway(_) => AppError::UpstreamError(err.to_string()),
            RefundError::Ledger(_) | RefundError::Inconsistency { .. } => AppError::InternalServerError(err.to_string()),
        }
    }
}

impl From<WebhookError> for AppError {
    fn from(err: WebhookError) -> Self {
        if err.is_client_error() {
            AppError::ValidationError(err.to_string())
        } else {
            AppError::InternalServerError(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rally_core::payment::GatewayError;
    use uuid::Uuid;

    fn status_of(err: impl Into<AppError>) -> StatusCode {
        err.into().into_response().status()
    }

    #[test]
    fn test_settlement_errors_map_to_status() {
        let id = Uuid::new_v4();
        assert_eq!(status_of(SettlementError::NotFound { kind: "booking", id }), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(SettlementError::AccountUnusable("payouts are not enabled".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(status_of(SettlementError::Gateway(GatewayError::Timeout)), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status_of(SettlementError::Ledger(LedgerError::Storage("down".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_refund_errors_map_to_status() {
        assert_eq!(status_of(RefundError::Validation("too much".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(RefundError::NotRefundable("not paid".into())), StatusCode::CONFLICT);
        assert_eq!(status_of(WebhookError::SignatureMismatch), StatusCode::BAD_REQUEST);
    }
}
