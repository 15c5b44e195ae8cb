use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::booking::Booking;
use crate::commission::Commission;
use crate::package::Package;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: Uuid },
    #[error("guarded update on {id} matched no row: {detail}")]
    GuardViolated { id: Uuid, detail: String },
    #[error("corrupt ledger row: {0}")]
    Corrupt(String),
    #[error("ledger storage error: {0}")]
    Storage(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// A unit the Transfer Orchestrator can settle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum SettlementTarget {
    Booking(Uuid),
    Installment(Uuid),
}

impl SettlementTarget {
    pub fn id(&self) -> Uuid {
        match self {
            SettlementTarget::Booking(id) | SettlementTarget::Installment(id) => *id,
        }
    }
}

/// A unit a buyer's charge pays for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum PaymentTarget {
    Booking(Uuid),
    Package(Uuid),
}

/// Written together with the PENDING → PAID transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentConfirmation {
    pub payment_reference: String,
    pub split: Commission,
    pub paid_at: DateTime<Utc>,
}

/// Written together with the IN_PROGRESS → TRANSFERRED transition.
/// A unit owed nothing closes with no reference and a zero amount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub transfer_reference: Option<String>,
    pub amount_minor: i64,
    pub transferred_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BookingRefundReservation {
    pub booking: Booking,
    /// The reservation moved a PENDING transfer to CANCELLED.
    pub cancelled_transfer: bool,
}

#[derive(Debug, Clone)]
pub struct PackageRefundReservation {
    pub package: Package,
    /// Installments moved PENDING → CANCELLED by the reservation.
    pub cancelled_installments: Vec<Uuid>,
}

/// Persisted settlement ledger: the single source of truth shared by the
/// webhook handler, manual triggers and every sweeper instance.
///
/// Every method that changes a status is a guarded transition: it succeeds
/// only if the current row still satisfies the guard, atomically. A `false`
/// or `None` return means another caller got there first.
#[async_trait]
pub trait SettlementLedger: Send + Sync {
    async fn insert_booking(&self, booking: &Booking) -> LedgerResult<()>;

    async fn insert_package(&self, package: &Package) -> LedgerResult<()>;

    async fn get_booking(&self, id: Uuid) -> LedgerResult<Option<Booking>>;

    async fn get_package(&self, id: Uuid) -> LedgerResult<Option<Package>>;

    async fn find_package_by_installment(&self, installment_id: Uuid) -> LedgerResult<Option<Package>>;

    /// Matches either the checkout reference or the payment reference.
    async fn find_by_payment_reference(&self, reference: &str) -> LedgerResult<Option<PaymentTarget>>;

    /// PENDING → PAID, with commission split and payment reference.
    async fn confirm_booking_payment(&self, id: Uuid, confirmation: &PaymentConfirmation) -> LedgerResult<bool>;

    /// PENDING → FAILED.
    async fn fail_booking_payment(&self, id: Uuid) -> LedgerResult<bool>;

    /// PENDING → PAID for the package; installment payout slices are
    /// recomputed from the confirmed split in the same write.
    async fn confirm_package_payment(&self, id: Uuid, confirmation: &PaymentConfirmation) -> LedgerResult<bool>;

    async fn fail_package_payment(&self, id: Uuid) -> LedgerResult<bool>;

    /// Units that satisfy the ledger side of transfer eligibility at `now`
    /// and are not deferred past it, oldest service end first.
    async fn list_settlement_candidates(&self, now: DateTime<Utc>, limit: i64) -> LedgerResult<Vec<SettlementTarget>>;

    /// Compare-and-swap PENDING → IN_PROGRESS, guarded on payment PAID,
    /// no refund in flight and the service window closed at `now`.
    async fn claim_transfer(&self, target: SettlementTarget, now: DateTime<Utc>) -> LedgerResult<bool>;

    /// IN_PROGRESS → TRANSFERRED; for installments also advances the
    /// package's completed sessions and remaining hours.
    async fn complete_transfer(&self, target: SettlementTarget, receipt: &TransferReceipt) -> LedgerResult<()>;

    /// IN_PROGRESS → PENDING after a failed external call.
    async fn release_transfer(&self, target: SettlementTarget) -> LedgerResult<()>;

    /// Keeps a PENDING unit out of the candidate list until `until`. Manual
    /// settles ignore it. A unit in any other state is left untouched.
    async fn defer_transfer(&self, target: SettlementTarget, until: DateTime<Utc>) -> LedgerResult<()>;

    /// Reserves `amount` against the booking's refundable balance. With
    /// `cancel_pending_transfer` a PENDING transfer is moved to CANCELLED in
    /// the same write. Fails (None) when the balance is short or a transfer
    /// is in progress.
    async fn reserve_booking_refund(
        &self,
        id: Uuid,
        amount_minor: i64,
        cancel_pending_transfer: bool,
    ) -> LedgerResult<Option<BookingRefundReservation>>;

    /// Moves a reservation into the refunded total and derives refund status.
    async fn commit_booking_refund(&self, id: Uuid, amount_minor: i64, refund_reference: &str) -> LedgerResult<Booking>;

    async fn release_booking_refund(&self, id: Uuid, amount_minor: i64, restore_transfer: bool) -> LedgerResult<()>;

    /// Reserves a pro-rata refund and cancels the package and its pending
    /// installments, guarded on the completed-session count still being
    /// `expected_sessions_completed` and no installment transfer in flight.
    async fn reserve_package_refund(
        &self,
        id: Uuid,
        amount_minor: i64,
        expected_sessions_completed: i32,
    ) -> LedgerResult<Option<PackageRefundReservation>>;

    async fn commit_package_refund(&self, id: Uuid, amount_minor: i64, refund_reference: &str) -> LedgerResult<Package>;

    /// Undoes a reservation, re-activating the package and the listed installments.
    async fn release_package_refund(&self, id: Uuid, amount_minor: i64, restore_installments: &[Uuid]) -> LedgerResult<()>;

    async fn webhook_event_seen(&self, event_id: &str) -> LedgerResult<bool>;

    async fn record_webhook_event(&self, event_id: &str, event_type: &str, received_at: DateTime<Utc>) -> LedgerResult<()>;
}
