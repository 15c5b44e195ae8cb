use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use rally_core::notify::SettlementNotifier;
use rally_core::repository::PaymentConfirmation;
use rally_core::{
    BookingKind, Clock, CommissionPolicy, CoreError, LedgerError, PaymentTarget, SettlementLedger,
};
use rally_shared::models::events::{PaymentConfirmedEvent, PaymentFailedEvent};
use rally_shared::{SettlementEvent, UnitKind};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("missing signature header")]
    MissingSignature,
    #[error("malformed signature header")]
    MalformedSignature,
    #[error("signature timestamp outside tolerance")]
    StaleTimestamp,
    #[error("signature mismatch")]
    SignatureMismatch,
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("commission computation failed: {0}")]
    Commission(#[from] CoreError),
}

impl WebhookError {
    /// Rejections the sender must not retry; everything else asks for redelivery.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, WebhookError::Ledger(_) | WebhookError::Commission(_))
    }
}

/// Verifies a `t=<unix>,v1=<hex>[,v1=<hex>...]` signature header against
/// HMAC-SHA256 of `"{t}.{payload}"`.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now_unix: i64,
    tolerance_seconds: i64,
) -> Result<(), WebhookError> {
    let mut timestamp: Option<i64> = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(WebhookError::MalformedSignature)?;
    if signatures.is_empty() {
        return Err(WebhookError::MalformedSignature);
    }
    if (now_unix - timestamp).abs() > tolerance_seconds {
        return Err(WebhookError::StaleTimestamp);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| WebhookError::SignatureMismatch)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);

    let matched = signatures.iter().any(|candidate| {
        hex::decode(candidate)
            .map(|bytes| mac.clone().verify_slice(&bytes).is_ok())
            .unwrap_or(false)
    });

    if matched {
        Ok(())
    } else {
        Err(WebhookError::SignatureMismatch)
    }
}

/// Builds a header `verify_signature` accepts. Used by senders in tests and
/// by local tooling that replays events.
pub fn sign_payload(payload: &[u8], secret: &str, timestamp: i64) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return format!("t={}", timestamp),
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Deserialize)]
struct Envelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: EnvelopeData,
}

#[derive(Debug, Deserialize)]
struct EnvelopeData {
    object: Value,
}

/// The money-moving part of a processor object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentObject {
    /// Reference persisted on the unit once paid; transfers are sourced from it.
    pub payment_reference: String,
    /// Every reference the unit may already be stored under, most specific first.
    pub lookup_references: Vec<String>,
    pub amount_minor: Option<i64>,
    pub metadata: BTreeMap<String, String>,
}

impl PaymentObject {
    fn target_from_metadata(&self) -> Option<PaymentTarget> {
        let parse = |key: &str| self.metadata.get(key).and_then(|v| Uuid::parse_str(v).ok());
        parse("booking_id")
            .map(PaymentTarget::Booking)
            .or_else(|| parse("package_id").map(PaymentTarget::Package))
    }
}

/// Closed set of processor notifications the engine reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentEvent {
    /// `checkout.session.completed` with funds captured.
    CheckoutCompleted(PaymentObject),
    /// `checkout.session.completed` for a delayed payment method.
    CheckoutAwaitingPayment,
    /// `charge.succeeded` / `payment_intent.succeeded`.
    ChargeSucceeded(PaymentObject),
    /// `charge.failed` / `payment_intent.payment_failed`.
    ChargeFailed(PaymentObject),
    /// `customer.subscription.*`; provider billing, not settlement.
    SubscriptionLifecycle,
    Unrecognized,
}

fn str_field(object: &Value, key: &str) -> Option<String> {
    object.get(key).and_then(Value::as_str).map(str::to_string)
}

fn metadata(object: &Value) -> BTreeMap<String, String> {
    object
        .get("metadata")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn object_id(object: &Value) -> Result<String, WebhookError> {
    str_field(object, "id").ok_or_else(|| WebhookError::MalformedPayload("object without id".to_string()))
}

impl PaymentEvent {
    pub fn classify(event_type: &str, object: &Value) -> Result<Self, WebhookError> {
        match event_type {
            "checkout.session.completed" => {
                if str_field(object, "payment_status").as_deref() != Some("paid") {
                    return Ok(PaymentEvent::CheckoutAwaitingPayment);
                }
                let id = object_id(object)?;
                let intent = str_field(object, "payment_intent");
                Ok(PaymentEvent::CheckoutCompleted(PaymentObject {
                    payment_reference: intent.clone().unwrap_or_else(|| id.clone()),
                    lookup_references: [Some(id), intent].into_iter().flatten().collect(),
                    amount_minor: object.get("amount_total").and_then(Value::as_i64),
                    metadata: metadata(object),
                }))
            }
            "charge.succeeded" | "charge.failed" => {
                let id = object_id(object)?;
                let intent = str_field(object, "payment_intent");
                let payment = PaymentObject {
                    payment_reference: id.clone(),
                    lookup_references: [Some(id), intent].into_iter().flatten().collect(),
                    amount_minor: object.get("amount").and_then(Value::as_i64),
                    metadata: metadata(object),
                };
                Ok(if event_type == "charge.succeeded" {
                    PaymentEvent::ChargeSucceeded(payment)
                } else {
                    PaymentEvent::ChargeFailed(payment)
                })
            }
            "payment_intent.succeeded" | "payment_intent.payment_failed" => {
                let id = object_id(object)?;
                let charge = str_field(object, "latest_charge");
                let payment = PaymentObject {
                    payment_reference: charge.clone().unwrap_or_else(|| id.clone()),
                    lookup_references: [Some(id), charge].into_iter().flatten().collect(),
                    amount_minor: object.get("amount").and_then(Value::as_i64),
                    metadata: metadata(object),
                };
                Ok(if event_type == "payment_intent.succeeded" {
                    PaymentEvent::ChargeSucceeded(payment)
                } else {
                    PaymentEvent::ChargeFailed(payment)
                })
            }
            t if t.starts_with("customer.subscription.") => Ok(PaymentEvent::SubscriptionLifecycle),
            _ => Ok(PaymentEvent::Unrecognized),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    PaymentConfirmed(PaymentTarget),
    PaymentFailed(PaymentTarget),
    /// The unit's payment status was already terminal; nothing changed.
    AlreadyProcessed(PaymentTarget),
    /// The event id was processed before.
    DuplicateEvent,
    UnknownTarget,
    AwaitingPayment,
    Acknowledged,
    Ignored,
}

impl WebhookOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            WebhookOutcome::PaymentConfirmed(_) => "payment_confirmed",
            WebhookOutcome::PaymentFailed(_) => "payment_failed",
            WebhookOutcome::AlreadyProcessed(_) => "already_processed",
            WebhookOutcome::DuplicateEvent => "duplicate_event",
            WebhookOutcome::UnknownTarget => "unknown_target",
            WebhookOutcome::AwaitingPayment => "awaiting_payment",
            WebhookOutcome::Acknowledged => "acknowledged",
            WebhookOutcome::Ignored => "ignored",
        }
    }
}

pub struct WebhookProcessor {
    ledger: Arc<dyn SettlementLedger>,
    notifier: Arc<dyn SettlementNotifier>,
    clock: Arc<dyn Clock>,
    commission: CommissionPolicy,
    secret: String,
    tolerance_seconds: i64,
}

impl WebhookProcessor {
    pub fn new(
        ledger: Arc<dyn SettlementLedger>,
        notifier: Arc<dyn SettlementNotifier>,
        clock: Arc<dyn Clock>,
        commission: CommissionPolicy,
        secret: impl Into<String>,
        tolerance_seconds: i64,
    ) -> Self {
        Self {
            ledger,
            notifier,
            clock,
            commission,
            secret: secret.into(),
            tolerance_seconds,
        }
    }

    /// Verifies, classifies and applies one delivery.
    pub async fn handle(&self, payload: &[u8], signature_header: Option<&str>) -> Result<WebhookOutcome, WebhookError> {
        let header = signature_header.ok_or(WebhookError::MissingSignature)?;
        let now = self.clock.now();
        verify_signature(payload, header, &self.secret, now.timestamp(), self.tolerance_seconds)?;

        let envelope: Envelope =
            serde_json::from_slice(payload).map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;

        if self.ledger.webhook_event_seen(&envelope.id).await? {
            debug!(event_id = %envelope.id, "Webhook event already processed");
            return Ok(WebhookOutcome::DuplicateEvent);
        }

        let event = PaymentEvent::classify(&envelope.event_type, &envelope.data.object)?;
        let outcome = match event {
            PaymentEvent::CheckoutCompleted(payment) | PaymentEvent::ChargeSucceeded(payment) => {
                self.confirm(&payment).await?
            }
            PaymentEvent::ChargeFailed(payment) => self.fail(&payment).await?,
            PaymentEvent::CheckoutAwaitingPayment => WebhookOutcome::AwaitingPayment,
            PaymentEvent::SubscriptionLifecycle => WebhookOutcome::Acknowledged,
            PaymentEvent::Unrecognized => WebhookOutcome::Ignored,
        };

        self.ledger
            .record_webhook_event(&envelope.id, &envelope.event_type, now)
            .await?;

        info!(event_id = %envelope.id, event_type = %envelope.event_type, outcome = outcome.label(), "Webhook processed");
        Ok(outcome)
    }

    async fn resolve(&self, payment: &PaymentObject) -> Result<Option<PaymentTarget>, WebhookError> {
        if let Some(target) = payment.target_from_metadata() {
            let exists = match target {
                PaymentTarget::Booking(id) => self.ledger.get_booking(id).await?.is_some(),
                PaymentTarget::Package(id) => self.ledger.get_package(id).await?.is_some(),
            };
            if exists {
                return Ok(Some(target));
            }
        }

        for reference in &payment.lookup_references {
            if let Some(target) = self.ledger.find_by_payment_reference(reference).await? {
                return Ok(Some(target));
            }
        }
        Ok(None)
    }

    async fn confirm(&self, payment: &PaymentObject) -> Result<WebhookOutcome, WebhookError> {
        let Some(target) = self.resolve(payment).await? else {
            warn!(payment_reference = %payment.payment_reference, "Payment succeeded for unknown unit, acknowledging");
            return Ok(WebhookOutcome::UnknownTarget);
        };

        let (gross_minor, kind, unit_kind, already_terminal) = match target {
            PaymentTarget::Booking(id) => {
                let booking = self
                    .ledger
                    .get_booking(id)
                    .await?
                    .ok_or(LedgerError::NotFound { kind: "booking", id })?;
                (booking.gross_minor, BookingKind::SingleSession, UnitKind::Booking, booking.payment_status.is_terminal())
            }
            PaymentTarget::Package(id) => {
                let package = self
                    .ledger
                    .get_package(id)
                    .await?
                    .ok_or(LedgerError::NotFound { kind: "package", id })?;
                (package.gross_minor, BookingKind::PackageInstallment, UnitKind::Package, package.payment_status.is_terminal())
            }
        };

        if already_terminal {
            debug!(?target, "Payment status already terminal, ignoring success event");
            return Ok(WebhookOutcome::AlreadyProcessed(target));
        }

        if let Some(amount) = payment.amount_minor {
            if amount != gross_minor {
                warn!(?target, charged = amount, gross = gross_minor, "Charged amount differs from unit gross");
            }
        }

        let split = self.commission.compute(gross_minor, kind)?;
        let confirmation = PaymentConfirmation {
            payment_reference: payment.payment_reference.clone(),
            split,
            paid_at: self.clock.now(),
        };

        let confirmed = match target {
            PaymentTarget::Booking(id) => self.ledger.confirm_booking_payment(id, &confirmation).await?,
            PaymentTarget::Package(id) => self.ledger.confirm_package_payment(id, &confirmation).await?,
        };
        if !confirmed {
            // Lost the race to a concurrent delivery.
            return Ok(WebhookOutcome::AlreadyProcessed(target));
        }

        info!(
            ?target,
            payment_reference = %confirmation.payment_reference,
            commission = split.commission_minor,
            provider_net = split.provider_net_minor,
            "Payment confirmed"
        );

        crate::publish(
            self.notifier.as_ref(),
            SettlementEvent::PaymentConfirmed(PaymentConfirmedEvent {
                unit_id: match target {
                    PaymentTarget::Booking(id) | PaymentTarget::Package(id) => id,
                },
                unit_kind,
                payment_reference: confirmation.payment_reference.clone(),
                gross_minor,
                commission_minor: split.commission_minor,
                provider_net_minor: split.provider_net_minor,
                timestamp: confirmation.paid_at.timestamp(),
            }),
        )
        .await;

        Ok(WebhookOutcome::PaymentConfirmed(target))
    }

    async fn fail(&self, payment: &PaymentObject) -> Result<WebhookOutcome, WebhookError> {
        let Some(target) = self.resolve(payment).await? else {
            warn!(payment_reference = %payment.payment_reference, "Payment failed for unknown unit, acknowledging");
            return Ok(WebhookOutcome::UnknownTarget);
        };

        let (failed, unit_id, unit_kind) = match target {
            PaymentTarget::Booking(id) => (self.ledger.fail_booking_payment(id).await?, id, UnitKind::Booking),
            PaymentTarget::Package(id) => (self.ledger.fail_package_payment(id).await?, id, UnitKind::Package),
        };
        if !failed {
            return Ok(WebhookOutcome::AlreadyProcessed(target));
        }

        info!(?target, "Payment failed, unit void for settlement");
        crate::publish(
            self.notifier.as_ref(),
            SettlementEvent::PaymentFailed(PaymentFailedEvent {
                unit_id,
                unit_kind,
                timestamp: self.clock.now().timestamp(),
            }),
        )
        .await;

        Ok(WebhookOutcome::PaymentFailed(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECRET: &str = "whsec_test";

    #[test]
    fn test_signature_round_trip() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = sign_payload(payload, SECRET, 1_700_000_000);
        assert!(verify_signature(payload, &header, SECRET, 1_700_000_100, 300).is_ok());
    }

    #[test]
    fn test_signature_rejections() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = sign_payload(payload, SECRET, 1_700_000_000);

        assert!(matches!(
            verify_signature(payload, &header, "whsec_other", 1_700_000_000, 300),
            Err(WebhookError::SignatureMismatch)
        ));
        assert!(matches!(
            verify_signature(br#"{"id":"evt_2"}"#, &header, SECRET, 1_700_000_000, 300),
            Err(WebhookError::SignatureMismatch)
        ));
        assert!(matches!(
            verify_signature(payload, &header, SECRET, 1_700_000_301, 300),
            Err(WebhookError::StaleTimestamp)
        ));
        assert!(matches!(
            verify_signature(payload, "v1=abcd", SECRET, 1_700_000_000, 300),
            Err(WebhookError::MalformedSignature)
        ));
    }

    #[test]
    fn test_any_v1_signature_may_match() {
        let payload = b"{}";
        let valid = sign_payload(payload, SECRET, 42);
        let rotated = format!("t=42,v1={},{}", "00".repeat(32), valid.trim_start_matches("t=42,"));
        assert!(verify_signature(payload, &rotated, SECRET, 42, 300).is_ok());
    }

    #[test]
    fn test_classify_checkout() {
        let paid = json!({"id": "cs_1", "payment_status": "paid", "payment_intent": "pi_1", "amount_total": 12000});
        let PaymentEvent::CheckoutCompleted(payment) = PaymentEvent::classify("checkout.session.completed", &paid).unwrap()
        else {
            panic!("expected checkout completion");
        };
        assert_eq!(payment.payment_reference, "pi_1");
        assert_eq!(payment.lookup_references, vec!["cs_1".to_string(), "pi_1".to_string()]);
        assert_eq!(payment.amount_minor, Some(12000));

        let unpaid = json!({"id": "cs_2", "payment_status": "unpaid"});
        assert_eq!(
            PaymentEvent::classify("checkout.session.completed", &unpaid).unwrap(),
            PaymentEvent::CheckoutAwaitingPayment
        );
    }

    #[test]
    fn test_classify_charge_and_others() {
        let charge = json!({"id": "ch_1", "payment_intent": "pi_1", "metadata": {"booking_id": Uuid::nil().to_string()}});
        let PaymentEvent::ChargeSucceeded(payment) = PaymentEvent::classify("charge.succeeded", &charge).unwrap() else {
            panic!("expected charge success");
        };
        assert_eq!(payment.payment_reference, "ch_1");
        assert_eq!(payment.target_from_metadata(), Some(PaymentTarget::Booking(Uuid::nil())));

        assert!(matches!(
            PaymentEvent::classify("payment_intent.payment_failed", &json!({"id": "pi_9"})).unwrap(),
            PaymentEvent::ChargeFailed(_)
        ));
        assert_eq!(
            PaymentEvent::classify("customer.subscription.updated", &json!({})).unwrap(),
            PaymentEvent::SubscriptionLifecycle
        );
        assert_eq!(PaymentEvent::classify("invoice.paid", &json!({})).unwrap(), PaymentEvent::Unrecognized);
        assert!(PaymentEvent::classify("charge.succeeded", &json!({})).is_err());
    }
}
