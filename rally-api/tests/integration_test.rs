use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use chrono::{Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

use rally_api::middleware::auth::{Claims, ROLE_BUYER, ROLE_OPERATOR, ROLE_PROVIDER};
use rally_api::{app, AppState};
use rally_core::notify::RecordingNotifier;
use rally_core::{Booking, BookingKind, Clock, CommissionPolicy, FixedClock, Package, SessionSlot, SettlementLedger};
use rally_settlement::webhook::sign_payload;
use rally_settlement::MockPaymentGateway;
use rally_shared::Masked;
use rally_store::app_config::{
    AuthConfig, Config, DatabaseConfig, PaymentProviderKind, PaymentsConfig, ServerConfig, SweeperConfig,
};
use rally_store::InMemoryLedger;

const JWT_SECRET: &str = "jwt-test";
const WEBHOOK_SECRET: &str = "whsec_test";
const SWEEP_SECRET: &str = "sweep-test";

fn test_config() -> Config {
    Config {
        server: ServerConfig { port: 0 },
        database: DatabaseConfig {
            url: Masked::from("postgres://unused"),
            max_connections: 1,
        },
        redis: None,
        kafka: None,
        auth: AuthConfig {
            jwt_secret: Masked::from(JWT_SECRET),
        },
        payments: PaymentsConfig {
            provider: PaymentProviderKind::Mock,
            api_key: Masked::default(),
            api_base: "http://localhost".to_string(),
            webhook_secret: Masked::from(WEBHOOK_SECRET),
            webhook_tolerance_seconds: 300,
            request_timeout_ms: 2_000,
        },
        commission: CommissionPolicy::default(),
        sweeper: SweeperConfig {
            interval_seconds: 3600,
            batch_limit: 100,
            concurrency: 2,
            retry_backoff_seconds: 3600,
            trigger_secret: Masked::from(SWEEP_SECRET),
        },
    }
}

struct TestApp {
    state: AppState,
    ledger: Arc<InMemoryLedger>,
    gateway: Arc<MockPaymentGateway>,
    clock: Arc<FixedClock>,
}

impl TestApp {
    fn new() -> Self {
        let ledger = Arc::new(InMemoryLedger::new());
        let gateway = Arc::new(MockPaymentGateway::new());
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let state = AppState::new(
            &test_config(),
            ledger.clone(),
            gateway.clone(),
            Arc::new(RecordingNotifier::new()),
            clock.clone(),
            None,
        )
        .unwrap();

        Self { state, ledger, gateway, clock }
    }

    async fn send(&self, req: Request<Body>) -> (StatusCode, Value) {
        let response = app(self.state.clone()).oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        (status, body)
    }

    async fn post(&self, uri: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        self.send(builder.body(Body::from(body.to_string())).unwrap()).await
    }

    async fn webhook(&self, event_type: &str, object: Value) -> (StatusCode, Value) {
        let payload = json!({
            "id": format!("evt_{}", Uuid::new_v4().simple()),
            "type": event_type,
            "data": { "object": object },
        })
        .to_string();
        let signature = sign_payload(payload.as_bytes(), WEBHOOK_SECRET, self.clock.now().timestamp());

        let req = Request::builder()
            .method("POST")
            .uri("/v1/webhooks/payments")
            .header("Stripe-Signature", signature)
            .body(Body::from(payload))
            .unwrap();
        self.send(req).await
    }

    async fn paid_booking(&self, gross: i64, ends_in: Duration) -> Booking {
        let split = CommissionPolicy::default().compute(gross, BookingKind::SingleSession).unwrap();
        let end = self.clock.now() + ends_in;
        let booking = Booking::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            split,
            end - Duration::hours(1),
            end,
            Some("acct_coach".to_string()),
        );
        self.ledger.insert_booking(&booking).await.unwrap();

        let (status, body) = self
            .webhook(
                "charge.succeeded",
                json!({
                    "id": format!("ch_{}", booking.id.simple()),
                    "amount": gross,
                    "metadata": { "booking_id": booking.id.to_string() },
                }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "payment_confirmed");
        booking
    }
}

fn token(sub: Uuid, role: &str) -> String {
    let claims = Claims {
        sub: sub.to_string(),
        role: role.to_string(),
        exp: (Utc::now().timestamp() + 3600) as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(JWT_SECRET.as_bytes())).unwrap()
}

#[tokio::test]
async fn test_health_and_metrics() {
    let t = TestApp::new();

    let (status, body) = t.send(Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("OK".to_string()));

    t.paid_booking(12000, Duration::hours(-1)).await;
    let (status, body) = t.send(Request::get("/metrics").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_str().unwrap().contains("rally_webhook_events_total{outcome=\"payment_confirmed\"} 1"));
}

#[tokio::test]
async fn test_webhook_rejects_unsigned_and_tampered_payloads() {
    let t = TestApp::new();
    let payload = json!({ "id": "evt_x", "type": "charge.succeeded", "data": { "object": { "id": "ch_x" } } }).to_string();

    let unsigned = Request::post("/v1/webhooks/payments").body(Body::from(payload.clone())).unwrap();
    let (status, _) = t.send(unsigned).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let signature = sign_payload(payload.as_bytes(), "whsec_wrong", t.clock.now().timestamp());
    let forged = Request::post("/v1/webhooks/payments")
        .header("Stripe-Signature", signature)
        .body(Body::from(payload))
        .unwrap();
    let (status, body) = t.send(forged).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_provider_completes_booking_once() {
    let t = TestApp::new();
    let booking = t.paid_booking(12000, Duration::hours(-1)).await;
    let provider = token(booking.provider_id, ROLE_PROVIDER);
    let uri = format!("/v1/bookings/{}/complete", booking.id);

    let (status, body) = t.post(&uri, Some(&provider), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "transferred");
    assert_eq!(body["amount_minor"], 10200);

    let (status, body) = t.post(&uri, Some(&provider), json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["reason"], "already_transferred");
    assert_eq!(t.gateway.transfer_calls(), 1);
}

#[tokio::test]
async fn test_complete_booking_checks_caller() {
    let t = TestApp::new();
    let booking = t.paid_booking(12000, Duration::hours(-1)).await;
    let uri = format!("/v1/bookings/{}/complete", booking.id);

    let (status, _) = t.post(&uri, None, json!({})).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = t.post(&uri, Some("not-a-jwt"), json!({})).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let stranger = token(Uuid::new_v4(), ROLE_BUYER);
    let (status, _) = t.post(&uri, Some(&stranger), json!({})).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let operator = token(Uuid::new_v4(), ROLE_OPERATOR);
    let (status, _) = t.post(&format!("/v1/bookings/{}/complete", Uuid::new_v4()), Some(&operator), json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    assert_eq!(t.gateway.transfer_calls(), 0);
}

#[tokio::test]
async fn test_completion_before_session_end_is_refused() {
    let t = TestApp::new();
    let booking = t.paid_booking(12000, Duration::hours(2)).await;
    let buyer = token(booking.buyer_id, ROLE_BUYER);

    let (status, body) = t.post(&format!("/v1/bookings/{}/complete", booking.id), Some(&buyer), json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["reason"], "not_yet_completed");
    assert_eq!(body["retry_later"], true);
    assert_eq!(t.gateway.transfer_calls(), 0);
}

#[tokio::test]
async fn test_operator_refunds_booking() {
    let t = TestApp::new();
    let booking = t.paid_booking(12000, Duration::hours(2)).await;
    let uri = format!("/v1/admin/bookings/{}/refunds", booking.id);
    let operator = token(Uuid::new_v4(), ROLE_OPERATOR);

    let provider = token(booking.provider_id, ROLE_PROVIDER);
    let (status, _) = t.post(&uri, Some(&provider), json!({ "amount_minor": 1000 })).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = t.post(&uri, Some(&operator), json!({ "amount_minor": 12001 })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = t
        .post(&uri, Some(&operator), json!({ "amount_minor": 3000, "reason": "requested_by_customer" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["refunded_minor"], 3000);
    assert_eq!(body["refund_status"], "PARTIAL");

    let (status, body) = t.post(&uri, Some(&operator), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["amount_minor"], 9000);
    assert_eq!(body["refund_status"], "FULL");
    assert_eq!(body["transfer_status"], "CANCELLED");

    let (status, _) = t.post(&uri, Some(&operator), json!({ "amount_minor": 1 })).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(t.gateway.refund_calls(), 2);
}

#[tokio::test]
async fn test_package_installment_then_pro_rata_cancellation() {
    let t = TestApp::new();
    let first_end = t.clock.now() - Duration::hours(1);
    let slots: Vec<SessionSlot> = (0..2)
        .map(|i| SessionSlot {
            start: first_end - Duration::hours(1) + Duration::days(i),
            end: first_end + Duration::days(i),
            hours: 1,
        })
        .collect();
    let split = CommissionPolicy::default().compute(10000, BookingKind::PackageInstallment).unwrap();
    let package = Package::new(Uuid::new_v4(), Uuid::new_v4(), split, &slots, Some("acct_coach".to_string()))
        .unwrap()
        .with_checkout_reference("cs_package");
    t.ledger.insert_package(&package).await.unwrap();

    let (status, body) = t
        .webhook(
            "checkout.session.completed",
            json!({
                "id": "cs_package",
                "payment_status": "paid",
                "payment_intent": "pi_package",
                "amount_total": 10000,
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "payment_confirmed");

    let provider = token(package.provider_id, ROLE_PROVIDER);
    let first = package.installments[0].id;
    let (status, body) = t.post(&format!("/v1/installments/{}/complete", first), Some(&provider), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "transferred");

    let operator = token(Uuid::new_v4(), ROLE_OPERATOR);
    let (status, body) = t
        .post(&format!("/v1/admin/packages/{}/refunds", package.id), Some(&operator), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["amount_minor"], 5000);
    assert_eq!(body["remaining_sessions"], 1);
    assert_eq!(body["sessions_paid_out"], 1);

    let second = package.installments[1].id;
    let (status, body) = t.post(&format!("/v1/installments/{}/complete", second), Some(&provider), json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["reason"], "cancelled");
}

#[tokio::test]
async fn test_sweep_trigger_requires_secret() {
    let t = TestApp::new();
    t.paid_booking(12000, Duration::hours(-1)).await;
    t.paid_booking(8000, Duration::hours(3)).await;

    let (status, _) = t.post("/internal/settlements/sweep", Some("wrong"), json!({})).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = t.post("/internal/settlements/sweep", None, json!({})).await;
    assert!(status.is_client_error());

    let (status, body) = t.post("/internal/settlements/sweep", Some(SWEEP_SECRET), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["attempted"], 1);
    assert_eq!(body["succeeded"], 1);
    assert_eq!(t.gateway.transfer_calls(), 1);
}
