use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use rally_core::notify::SettlementNotifier;
use rally_core::payment::{GatewayError, PaymentGateway, RefundReason, RefundRequest};
use rally_core::{
    Booking, Clock, LedgerError, Package, PackageStatus, PaymentStatus, RefundStatus, SettlementLedger,
    TransferStatus,
};
use rally_shared::models::events::{PackageCancelledEvent, RefundIssuedEvent};
use rally_shared::{SettlementEvent, UnitKind};

#[derive(Debug, thiserror::Error)]
pub enum RefundError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: Uuid },
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Not refundable: {0}")]
    NotRefundable(String),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("refund {refund_reference} for {unit_id} succeeded but the ledger write failed: {source}")]
    Inconsistency {
        unit_id: Uuid,
        refund_reference: String,
        source: LedgerError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefundOutcome {
    pub booking_id: Uuid,
    pub refund_reference: String,
    pub amount_minor: i64,
    pub refunded_minor: i64,
    pub refund_status: RefundStatus,
    pub transfer_status: TransferStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageRefundOutcome {
    pub package_id: Uuid,
    pub refund_reference: String,
    pub amount_minor: i64,
    pub remaining_sessions: i32,
    pub total_sessions: i32,
    pub sessions_paid_out: i32,
    pub note: String,
}

/// `gross × remaining / total`, floored, so the platform never refunds more
/// than the unconsumed share.
pub fn pro_rata_amount(gross_minor: i64, remaining_sessions: i32, total_sessions: i32) -> i64 {
    if total_sessions <= 0 || remaining_sessions <= 0 {
        return 0;
    }
    let remaining = remaining_sessions.min(total_sessions) as i128;
    (gross_minor as i128 * remaining / total_sessions as i128) as i64
}

/// Offset of this refund in the unit's cumulative refund stream. Stable for
/// a retried refund of the same slice, distinct for concurrent ones.
fn refund_idempotency_key(unit_id: Uuid, refunded_minor: i64, reserved_minor: i64, amount_minor: i64) -> String {
    format!("refund-{}-{}", unit_id, refunded_minor + reserved_minor - amount_minor)
}

fn booking_refusal(booking: &Booking) -> Option<String> {
    if booking.payment_status != PaymentStatus::Paid || booking.payment_reference.is_none() {
        return Some("booking has not been paid".to_string());
    }
    if booking.refund_status == RefundStatus::Full {
        return Some("booking is already fully refunded".to_string());
    }
    if booking.transfer_status == TransferStatus::InProgress {
        return Some("a payout for this booking is in progress, retry shortly".to_string());
    }
    if booking.refund_reserved_minor > 0 {
        return Some("another refund for this booking is in progress".to_string());
    }
    None
}

pub struct RefundManager {
    ledger: Arc<dyn SettlementLedger>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn SettlementNotifier>,
    clock: Arc<dyn Clock>,
    call_timeout: Duration,
}

impl RefundManager {
    pub fn new(
        ledger: Arc<dyn SettlementLedger>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn SettlementNotifier>,
        clock: Arc<dyn Clock>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            gateway,
            notifier,
            clock,
            call_timeout,
        }
    }

    async fn load_booking(&self, id: Uuid) -> Result<Booking, RefundError> {
        self.ledger
            .get_booking(id)
            .await?
            .ok_or(RefundError::NotFound { kind: "booking", id })
    }

    /// Refunds everything not yet refunded and cancels a pending payout.
    pub async fn refund_full(&self, booking_id: Uuid, reason: RefundReason) -> Result<RefundOutcome, RefundError> {
        let booking = self.load_booking(booking_id).await?;
        if let Some(refusal) = booking_refusal(&booking) {
            return Err(RefundError::NotRefundable(refusal));
        }

        let amount = booking.retained_gross_minor();
        if amount <= 0 {
            return Err(RefundError::NotRefundable("nothing left to refund".to_string()));
        }

        self.refund_booking(booking_id, amount, true, reason).await
    }

    /// Refunds `amount_minor` of what remains. Reaching the gross makes the
    /// refund FULL and cancels a pending payout.
    pub async fn refund_partial(
        &self,
        booking_id: Uuid,
        amount_minor: i64,
        reason: RefundReason,
    ) -> Result<RefundOutcome, RefundError> {
        if amount_minor <= 0 {
            return Err(RefundError::Validation("refund amount must be positive".to_string()));
        }

        let booking = self.load_booking(booking_id).await?;
        if let Some(refusal) = booking_refusal(&booking) {
            return Err(RefundError::NotRefundable(refusal));
        }

        let remaining = booking.refundable_minor();
        if amount_minor > remaining {
            return Err(RefundError::Validation(format!(
                "refund amount {} exceeds refundable balance {}",
                amount_minor, remaining
            )));
        }

        let reaches_full = amount_minor == booking.retained_gross_minor();
        self.refund_booking(booking_id, amount_minor, reaches_full, reason).await
    }

    async fn refund_booking(
        &self,
        booking_id: Uuid,
        amount_minor: i64,
        cancel_pending_transfer: bool,
        reason: RefundReason,
    ) -> Result<RefundOutcome, RefundError> {
        let Some(reservation) = self
            .ledger
            .reserve_booking_refund(booking_id, amount_minor, cancel_pending_transfer)
            .await?
        else {
            let current = self.load_booking(booking_id).await?;
            let refusal = booking_refusal(&current).unwrap_or_else(|| {
                format!("refund amount {} exceeds refundable balance {}", amount_minor, current.refundable_minor())
            });
            return Err(RefundError::NotRefundable(refusal));
        };

        let booking = &reservation.booking;
        let payment_reference = booking
            .payment_reference
            .clone()
            .ok_or_else(|| LedgerError::Corrupt(format!("paid booking {} has no payment reference", booking_id)))?;

        let mut metadata = BTreeMap::new();
        metadata.insert("booking_id".to_string(), booking_id.to_string());

        let request = RefundRequest {
            payment_reference,
            amount_minor,
            reason,
            idempotency_key: refund_idempotency_key(
                booking_id,
                booking.refunded_minor,
                booking.refund_reserved_minor,
                amount_minor,
            ),
            metadata,
        };

        let refund_reference = match crate::with_timeout(self.call_timeout, self.gateway.create_refund(&request)).await {
            Ok(reference) => reference,
            Err(e) => {
                warn!(%booking_id, amount = amount_minor, error = %e, "Refund call failed, releasing reservation");
                if let Err(release_error) = self
                    .ledger
                    .release_booking_refund(booking_id, amount_minor, reservation.cancelled_transfer)
                    .await
                {
                    error!(%booking_id, error = %release_error, "Failed to release refund reservation");
                }
                return Err(RefundError::Gateway(e));
            }
        };

        let updated = match self
            .ledger
            .commit_booking_refund(booking_id, amount_minor, &refund_reference)
            .await
        {
            Ok(booking) => booking,
            Err(e) => {
                error!(
                    %booking_id,
                    refund_reference = %refund_reference,
                    amount = amount_minor,
                    error = %e,
                    "CRITICAL: refund issued but ledger not updated; reconcile manually"
                );
                return Err(RefundError::Inconsistency {
                    unit_id: booking_id,
                    refund_reference,
                    source: e,
                });
            }
        };

        if updated.transfer_status == TransferStatus::Transferred {
            // Payout already left escrow; the provider's share is not reversed.
            info!(%booking_id, refund_reference = %refund_reference, "Refund after payout, provider transfer left in place");
        }
        info!(
            %booking_id,
            refund_reference = %refund_reference,
            amount = amount_minor,
            refund_status = updated.refund_status.as_str(),
            "Refund issued"
        );

        crate::publish(
            self.notifier.as_ref(),
            SettlementEvent::RefundIssued(RefundIssuedEvent {
                unit_id: booking_id,
                unit_kind: UnitKind::Booking,
                refund_reference: refund_reference.clone(),
                amount_minor,
                fully_refunded: updated.refund_status == RefundStatus::Full,
                timestamp: self.clock.now().timestamp(),
            }),
        )
        .await;

        Ok(RefundOutcome {
            booking_id,
            refund_reference,
            amount_minor,
            refunded_minor: updated.refunded_minor,
            refund_status: updated.refund_status,
            transfer_status: updated.transfer_status,
        })
    }

    /// Refunds the unconsumed share of a package and cancels it. Sessions
    /// already paid out stay with the provider.
    pub async fn refund_package_pro_rata(
        &self,
        package_id: Uuid,
        reason: RefundReason,
    ) -> Result<PackageRefundOutcome, RefundError> {
        let package = self
            .ledger
            .get_package(package_id)
            .await?
            .ok_or(RefundError::NotFound { kind: "package", id: package_id })?;

        if let Some(refusal) = package_refusal(&package) {
            return Err(RefundError::NotRefundable(refusal));
        }

        let remaining_sessions = package.remaining_sessions();
        let amount_minor = pro_rata_amount(package.gross_minor, remaining_sessions, package.total_sessions)
            .min(package.refundable_minor());
        if amount_minor <= 0 {
            return Err(RefundError::Validation("package has no unconsumed value to refund".to_string()));
        }

        let Some(reservation) = self
            .ledger
            .reserve_package_refund(package_id, amount_minor, package.sessions_completed)
            .await?
        else {
            let current = self
                .ledger
                .get_package(package_id)
                .await?
                .ok_or(RefundError::NotFound { kind: "package", id: package_id })?;
            let refusal = package_refusal(&current)
                .unwrap_or_else(|| "package changed while the refund was prepared, retry".to_string());
            return Err(RefundError::NotRefundable(refusal));
        };

        let reserved = &reservation.package;
        let payment_reference = reserved
            .payment_reference
            .clone()
            .ok_or_else(|| LedgerError::Corrupt(format!("paid package {} has no payment reference", package_id)))?;

        let mut metadata = BTreeMap::new();
        metadata.insert("package_id".to_string(), package_id.to_string());
        metadata.insert("remaining_sessions".to_string(), remaining_sessions.to_string());

        let request = RefundRequest {
            payment_reference,
            amount_minor,
            reason,
            idempotency_key: refund_idempotency_key(
                package_id,
                reserved.refunded_minor,
                reserved.refund_reserved_minor,
                amount_minor,
            ),
            metadata,
        };

        let refund_reference = match crate::with_timeout(self.call_timeout, self.gateway.create_refund(&request)).await {
            Ok(reference) => reference,
            Err(e) => {
                warn!(%package_id, amount = amount_minor, error = %e, "Package refund call failed, re-activating package");
                if let Err(release_error) = self
                    .ledger
                    .release_package_refund(package_id, amount_minor, &reservation.cancelled_installments)
                    .await
                {
                    error!(%package_id, error = %release_error, "Failed to release package refund reservation");
                }
                return Err(RefundError::Gateway(e));
            }
        };

        let updated = match self
            .ledger
            .commit_package_refund(package_id, amount_minor, &refund_reference)
            .await
        {
            Ok(package) => package,
            Err(e) => {
                error!(
                    %package_id,
                    refund_reference = %refund_reference,
                    amount = amount_minor,
                    error = %e,
                    "CRITICAL: package refund issued but ledger not updated; reconcile manually"
                );
                return Err(RefundError::Inconsistency {
                    unit_id: package_id,
                    refund_reference,
                    source: e,
                });
            }
        };

        let sessions_paid_out = updated.sessions_paid_out();
        info!(
            %package_id,
            refund_reference = %refund_reference,
            amount = amount_minor,
            remaining_sessions,
            sessions_paid_out,
            "Package refunded pro-rata and cancelled"
        );

        let now = self.clock.now().timestamp();
        crate::publish(
            self.notifier.as_ref(),
            SettlementEvent::RefundIssued(RefundIssuedEvent {
                unit_id: package_id,
                unit_kind: UnitKind::Package,
                refund_reference: refund_reference.clone(),
                amount_minor,
                fully_refunded: updated.refund_status == RefundStatus::Full,
                timestamp: now,
            }),
        )
        .await;
        crate::publish(
            self.notifier.as_ref(),
            SettlementEvent::PackageCancelled(PackageCancelledEvent {
                package_id,
                sessions_paid_out,
                refunded_minor: updated.refunded_minor,
                timestamp: now,
            }),
        )
        .await;

        Ok(PackageRefundOutcome {
            package_id,
            refund_reference,
            amount_minor,
            remaining_sessions,
            total_sessions: updated.total_sessions,
            sessions_paid_out,
            note: format!(
                "{} session(s) already paid out to the coach are not clawed back",
                sessions_paid_out
            ),
        })
    }
}

fn package_refusal(package: &Package) -> Option<String> {
    if package.payment_status != PaymentStatus::Paid || package.payment_reference.is_none() {
        return Some("package has not been paid".to_string());
    }
    if package.status == PackageStatus::Cancelled {
        return Some("package is already cancelled".to_string());
    }
    if package
        .installments
        .iter()
        .any(|i| i.transfer_status == TransferStatus::InProgress)
    {
        return Some("an installment payout is in progress, retry shortly".to_string());
    }
    if package.refund_reserved_minor > 0 {
        return Some("another refund for this package is in progress".to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pro_rata_amount() {
        assert_eq!(pro_rata_amount(10000, 7, 10), 7000);
        assert_eq!(pro_rata_amount(10000, 0, 10), 0);
        assert_eq!(pro_rata_amount(10000, 10, 10), 10000);
        // floored: 10000 * 1 / 3
        assert_eq!(pro_rata_amount(10000, 1, 3), 3333);
        assert_eq!(pro_rata_amount(10000, 3, 0), 0);
    }

    #[test]
    fn test_refund_keys_are_offsets() {
        let id = Uuid::nil();
        // first refund of 500: nothing refunded, 500 reserved including itself
        assert_eq!(refund_idempotency_key(id, 0, 500, 500), format!("refund-{}-0", id));
        // a second concurrent refund of 300 stacks on the first reservation
        assert_eq!(refund_idempotency_key(id, 0, 800, 300), format!("refund-{}-500", id));
    }
}
