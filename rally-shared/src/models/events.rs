use uuid::Uuid;

/// Which ledger unit an event refers to.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Booking,
    Package,
    Installment,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq, Eq)]
pub struct PaymentConfirmedEvent {
    pub unit_id: Uuid,
    pub unit_kind: UnitKind,
    pub payment_reference: String,
    pub gross_minor: i64,
    pub commission_minor: i64,
    pub provider_net_minor: i64,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq, Eq)]
pub struct PaymentFailedEvent {
    pub unit_id: Uuid,
    pub unit_kind: UnitKind,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq, Eq)]
pub struct PayoutReleasedEvent {
    pub unit_id: Uuid,
    pub unit_kind: UnitKind,
    pub provider_id: Uuid,
    pub transfer_reference: String,
    pub amount_minor: i64,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq, Eq)]
pub struct RefundIssuedEvent {
    pub unit_id: Uuid,
    pub unit_kind: UnitKind,
    pub refund_reference: String,
    pub amount_minor: i64,
    pub fully_refunded: bool,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq, Eq)]
pub struct PackageCancelledEvent {
    pub package_id: Uuid,
    pub sessions_paid_out: i32,
    pub refunded_minor: i64,
    pub timestamp: i64,
}

/// Everything downstream collaborators (notifications, channel provisioning)
/// are told about. None of these gate a ledger transition.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SettlementEvent {
    PaymentConfirmed(PaymentConfirmedEvent),
    PaymentFailed(PaymentFailedEvent),
    PayoutReleased(PayoutReleasedEvent),
    RefundIssued(RefundIssuedEvent),
    PackageCancelled(PackageCancelledEvent),
}

impl SettlementEvent {
    /// Partition key for the event stream; keeps a unit's events ordered.
    pub fn key(&self) -> Uuid {
        match self {
            SettlementEvent::PaymentConfirmed(e) => e.unit_id,
            SettlementEvent::PaymentFailed(e) => e.unit_id,
            SettlementEvent::PayoutReleased(e) => e.unit_id,
            SettlementEvent::RefundIssued(e) => e.unit_id,
            SettlementEvent::PackageCancelled(e) => e.package_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SettlementEvent::PaymentConfirmed(_) => "payment_confirmed",
            SettlementEvent::PaymentFailed(_) => "payment_failed",
            SettlementEvent::PayoutReleased(_) => "payout_released",
            SettlementEvent::RefundIssued(_) => "refund_issued",
            SettlementEvent::PackageCancelled(_) => "package_cancelled",
        }
    }
}
