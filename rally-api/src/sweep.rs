use axum::{extract::State, Json};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use rally_settlement::SweepReport;

use crate::error::AppError;
use crate::state::AppState;

/// POST /internal/settlements/sweep
///
/// Guarded by a shared trigger secret rather than a user token so a
/// scheduler can call it.
pub async fn trigger_sweep(
    State(state): State<AppState>,
    TypedHeader(Authorization(bearer)): TypedHeader<Authorization<Bearer>>,
) -> Result<Json<SweepReport>, AppError> {
    if !token_matches(bearer.token(), state.sweep_secret.expose()) {
        return Err(AppError::AuthenticationError("invalid sweep trigger token".to_string()));
    }

    match state.sweeper.sweep().await {
        Ok(report) => {
            state.metrics.sweeps.with_label_values(&["manual", "ok"]).inc();
            Ok(Json(report))
        }
        Err(e) => {
            state.metrics.sweeps.with_label_values(&["manual", "error"]).inc();
            Err(e.into())
        }
    }
}

/// Constant-time comparison: both sides are reduced to a MAC under the
/// expected secret, and `verify_slice` compares the digests.
fn token_matches(presented: &str, expected: &str) -> bool {
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(expected.as_bytes()) else {
        return false;
    };
    let mut reference = mac.clone();
    mac.update(presented.as_bytes());
    reference.update(expected.as_bytes());
    mac.verify_slice(&reference.finalize().into_bytes()).is_ok()
}
