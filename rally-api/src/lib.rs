use axum::{
    extract::State,
    http::Method,
    middleware::from_fn_with_state,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod error;
pub mod metrics;
pub mod middleware;
pub mod refunds;
pub mod settlements;
pub mod state;
pub mod sweep;
pub mod webhooks;
pub mod worker;

pub use state::AppState;

use middleware::{auth_middleware, operator_auth_middleware};

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::header::USER_AGENT,
        ]);

    let participant_routes = Router::new()
        .route("/v1/bookings/{id}/complete", post(settlements::complete_booking))
        .route("/v1/installments/{id}/complete", post(settlements::complete_installment))
        .route_layer(from_fn_with_state(state.clone(), auth_middleware));

    let operator_routes = Router::new()
        .route("/v1/admin/bookings/{id}/refunds", post(refunds::refund_booking))
        .route("/v1/admin/packages/{id}/refunds", post(refunds::refund_package))
        .route_layer(from_fn_with_state(state.clone(), operator_auth_middleware));

    let mut router = Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/v1/webhooks/payments", post(webhooks::handle_payment_webhook))
        .route("/internal/settlements/sweep", post(sweep::trigger_sweep))
        .merge(participant_routes)
        .merge(operator_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    if state.redis.is_some() {
        router = router.layer(from_fn_with_state(state.clone(), rate_limit_middleware));
    }

    router.with_state(state)
}

async fn rate_limit_middleware(
    State(state): State<AppState>,
    axum::extract::ConnectInfo(addr): axum::extract::ConnectInfo<SocketAddr>,
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Result<impl IntoResponse, impl IntoResponse> {
    let Some(redis) = state.redis.as_ref() else {
        return Ok(next.run(req).await);
    };
    let key = format!("ratelimit:{}", addr.ip());

    match redis.check_rate_limit(&key, state.rate_limit_per_minute, 60).await {
        Ok(true) => Ok(next.run(req).await),
        Ok(false) => Err((axum::http::StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded")),
        Err(e) => {
            // Fail open
            tracing::warn!("Rate limiter unavailable: {}", e);
            Ok(next.run(req).await)
        }
    }
}
