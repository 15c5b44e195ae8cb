use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use rally_core::repository::{
    BookingRefundReservation, PackageRefundReservation, PaymentConfirmation, TransferReceipt,
};
use rally_core::{
    Booking, LedgerError, LedgerResult, Package, PackageStatus, PaymentStatus, PaymentTarget, RefundStatus,
    SettlementLedger, SettlementTarget, TransferStatus,
};

#[derive(Default)]
struct LedgerState {
    bookings: HashMap<Uuid, Booking>,
    packages: HashMap<Uuid, Package>,
    installment_index: HashMap<Uuid, Uuid>,
    webhook_events: HashMap<String, (String, DateTime<Utc>)>,
}

impl LedgerState {
    fn booking_mut(&mut self, id: Uuid) -> LedgerResult<&mut Booking> {
        self.bookings
            .get_mut(&id)
            .ok_or(LedgerError::NotFound { kind: "booking", id })
    }

    fn package_mut(&mut self, id: Uuid) -> LedgerResult<&mut Package> {
        self.packages
            .get_mut(&id)
            .ok_or(LedgerError::NotFound { kind: "package", id })
    }

    fn package_for_installment_mut(&mut self, installment_id: Uuid) -> LedgerResult<&mut Package> {
        let package_id = *self
            .installment_index
            .get(&installment_id)
            .ok_or(LedgerError::NotFound { kind: "installment", id: installment_id })?;
        self.package_mut(package_id)
    }
}

/// Process-local ledger with the same guarded transitions as `PgLedger`.
/// Every method runs under one lock, which makes each transition atomic.
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> LedgerResult<MutexGuard<'_, LedgerState>> {
        self.state
            .lock()
            .map_err(|_| LedgerError::Storage("ledger lock poisoned".to_string()))
    }
}

fn in_progress_guard(id: Uuid) -> LedgerError {
    LedgerError::GuardViolated {
        id,
        detail: "transfer is not IN_PROGRESS".to_string(),
    }
}

#[async_trait]
impl SettlementLedger for InMemoryLedger {
    async fn insert_booking(&self, booking: &Booking) -> LedgerResult<()> {
        self.state()?.bookings.insert(booking.id, booking.clone());
        Ok(())
    }

    async fn insert_package(&self, package: &Package) -> LedgerResult<()> {
        let mut state = self.state()?;
        for installment in &package.installments {
            state.installment_index.insert(installment.id, package.id);
        }
        state.packages.insert(package.id, package.clone());
        Ok(())
    }

    async fn get_booking(&self, id: Uuid) -> LedgerResult<Option<Booking>> {
        Ok(self.state()?.bookings.get(&id).cloned())
    }

    async fn get_package(&self, id: Uuid) -> LedgerResult<Option<Package>> {
        Ok(self.state()?.packages.get(&id).cloned())
    }

    async fn find_package_by_installment(&self, installment_id: Uuid) -> LedgerResult<Option<Package>> {
        let state = self.state()?;
        Ok(state
            .installment_index
            .get(&installment_id)
            .and_then(|package_id| state.packages.get(package_id))
            .cloned())
    }

    async fn find_by_payment_reference(&self, reference: &str) -> LedgerResult<Option<PaymentTarget>> {
        let state = self.state()?;
        let matches = |checkout: &Option<String>, payment: &Option<String>| {
            checkout.as_deref() == Some(reference) || payment.as_deref() == Some(reference)
        };

        if let Some(booking) = state
            .bookings
            .values()
            .find(|b| matches(&b.checkout_reference, &b.payment_reference))
        {
            return Ok(Some(PaymentTarget::Booking(booking.id)));
        }

        Ok(state
            .packages
            .values()
            .find(|p| matches(&p.checkout_reference, &p.payment_reference))
            .map(|p| PaymentTarget::Package(p.id)))
    }

    async fn confirm_booking_payment(&self, id: Uuid, confirmation: &PaymentConfirmation) -> LedgerResult<bool> {
        let mut state = self.state()?;
        let booking = state.booking_mut(id)?;
        if booking.payment_status != PaymentStatus::Pending {
            return Ok(false);
        }

        booking.payment_status = PaymentStatus::Paid;
        booking.payment_reference = Some(confirmation.payment_reference.clone());
        booking.commission_minor = confirmation.split.commission_minor;
        booking.provider_net_minor = confirmation.split.provider_net_minor;
        booking.paid_at = Some(confirmation.paid_at);
        booking.updated_at = Utc::now();
        Ok(true)
    }

    async fn fail_booking_payment(&self, id: Uuid) -> LedgerResult<bool> {
        let mut state = self.state()?;
        let booking = state.booking_mut(id)?;
        if booking.payment_status != PaymentStatus::Pending {
            return Ok(false);
        }
        booking.payment_status = PaymentStatus::Failed;
        booking.updated_at = Utc::now();
        Ok(true)
    }

    async fn confirm_package_payment(&self, id: Uuid, confirmation: &PaymentConfirmation) -> LedgerResult<bool> {
        let mut state = self.state()?;
        let package = state.package_mut(id)?;
        if package.payment_status != PaymentStatus::Pending {
            return Ok(false);
        }

        package.payment_status = PaymentStatus::Paid;
        package.payment_reference = Some(confirmation.payment_reference.clone());
        package.commission_minor = confirmation.split.commission_minor;
        package.provider_net_minor = confirmation.split.provider_net_minor;
        package.paid_at = Some(confirmation.paid_at);
        package.updated_at = Utc::now();

        let payouts = package.installment_payouts(confirmation.split.provider_net_minor);
        for (installment, payout) in package.installments.iter_mut().zip(payouts) {
            installment.payout_minor = payout;
        }
        Ok(true)
    }

    async fn fail_package_payment(&self, id: Uuid) -> LedgerResult<bool> {
        let mut state = self.state()?;
        let package = state.package_mut(id)?;
        if package.payment_status != PaymentStatus::Pending {
            return Ok(false);
        }
        package.payment_status = PaymentStatus::Failed;
        package.updated_at = Utc::now();
        Ok(true)
    }

    async fn list_settlement_candidates(&self, now: DateTime<Utc>, limit: i64) -> LedgerResult<Vec<SettlementTarget>> {
        let state = self.state()?;
        let limit = limit.max(0) as usize;
        let due = |retry_at: Option<DateTime<Utc>>| retry_at.map_or(true, |at| at <= now);

        let bookings = state
            .bookings
            .values()
            .filter(|b| due(b.transfer_retry_at) && b.transfer_eligibility(now).is_ok())
            .map(|b| (b.service_end, SettlementTarget::Booking(b.id)));

        let installments = state.packages.values().flat_map(|p| {
            p.installments
                .iter()
                .filter(move |i| due(i.transfer_retry_at) && p.installment_eligibility(i, now).is_ok())
                .map(|i| (i.service_end, SettlementTarget::Installment(i.id)))
        });

        let mut candidates: Vec<(DateTime<Utc>, SettlementTarget)> = bookings.chain(installments).collect();
        candidates.sort_by_key(|(service_end, target)| (*service_end, target.id()));

        Ok(candidates
            .into_iter()
            .take(limit)
            .map(|(_, target)| target)
            .collect())
    }

    async fn claim_transfer(&self, target: SettlementTarget, now: DateTime<Utc>) -> LedgerResult<bool> {
        let mut state = self.state()?;
        match target {
            SettlementTarget::Booking(id) => {
                let booking = state.booking_mut(id)?;
                let claimable = booking.payment_status == PaymentStatus::Paid
                    && booking.transfer_status == TransferStatus::Pending
                    && booking.refund_status != RefundStatus::Full
                    && booking.refund_reserved_minor == 0
                    && booking.service_end <= now;
                if claimable {
                    booking.transfer_status = TransferStatus::InProgress;
                    booking.updated_at = Utc::now();
                }
                Ok(claimable)
            }
            SettlementTarget::Installment(id) => {
                let package = state.package_for_installment_mut(id)?;
                let package_ok = package.payment_status == PaymentStatus::Paid
                    && package.status == PackageStatus::Active
                    && package.refund_status != RefundStatus::Full
                    && package.refund_reserved_minor == 0;
                let Some(installment) = package.installments.iter_mut().find(|i| i.id == id) else {
                    return Err(LedgerError::NotFound { kind: "installment", id });
                };
                let claimable = package_ok
                    && installment.transfer_status == TransferStatus::Pending
                    && installment.service_end <= now;
                if claimable {
                    installment.transfer_status = TransferStatus::InProgress;
                }
                Ok(claimable)
            }
        }
    }

    async fn complete_transfer(&self, target: SettlementTarget, receipt: &TransferReceipt) -> LedgerResult<()> {
        let mut state = self.state()?;
        match target {
            SettlementTarget::Booking(id) => {
                let booking = state.booking_mut(id)?;
                if booking.transfer_status != TransferStatus::InProgress {
                    return Err(in_progress_guard(id));
                }
                booking.transfer_status = TransferStatus::Transferred;
                booking.transfer_reference = receipt.transfer_reference.clone();
                booking.transferred_minor = Some(receipt.amount_minor);
                booking.transferred_at = Some(receipt.transferred_at);
                booking.transfer_retry_at = None;
                booking.updated_at = Utc::now();
                Ok(())
            }
            SettlementTarget::Installment(id) => {
                let package = state.package_for_installment_mut(id)?;
                let Some(installment) = package.installments.iter_mut().find(|i| i.id == id) else {
                    return Err(LedgerError::NotFound { kind: "installment", id });
                };
                if installment.transfer_status != TransferStatus::InProgress {
                    return Err(in_progress_guard(id));
                }
                installment.transfer_status = TransferStatus::Transferred;
                installment.transfer_reference = receipt.transfer_reference.clone();
                installment.payout_minor = receipt.amount_minor;
                installment.transferred_at = Some(receipt.transferred_at);
                installment.transfer_retry_at = None;
                let hours = installment.hours;

                package.sessions_completed += 1;
                package.remaining_hours = (package.remaining_hours - hours).max(0);
                package.updated_at = Utc::now();
                Ok(())
            }
        }
    }

    async fn release_transfer(&self, target: SettlementTarget) -> LedgerResult<()> {
        let mut state = self.state()?;
        let status = match target {
            SettlementTarget::Booking(id) => &mut state.booking_mut(id)?.transfer_status,
            SettlementTarget::Installment(id) => {
                let package = state.package_for_installment_mut(id)?;
                match package.installments.iter_mut().find(|i| i.id == id) {
                    Some(installment) => &mut installment.transfer_status,
                    None => return Err(LedgerError::NotFound { kind: "installment", id }),
                }
            }
        };

        if *status != TransferStatus::InProgress {
            return Err(in_progress_guard(target.id()));
        }
        *status = TransferStatus::Pending;
        Ok(())
    }

    async fn defer_transfer(&self, target: SettlementTarget, until: DateTime<Utc>) -> LedgerResult<()> {
        let mut state = self.state()?;
        match target {
            SettlementTarget::Booking(id) => {
                let booking = state.booking_mut(id)?;
                if booking.transfer_status == TransferStatus::Pending {
                    booking.transfer_retry_at = Some(until);
                    booking.updated_at = Utc::now();
                }
            }
            SettlementTarget::Installment(id) => {
                let package = state.package_for_installment_mut(id)?;
                let Some(installment) = package.installments.iter_mut().find(|i| i.id == id) else {
                    return Err(LedgerError::NotFound { kind: "installment", id });
                };
                if installment.transfer_status == TransferStatus::Pending {
                    installment.transfer_retry_at = Some(until);
                }
            }
        }
        Ok(())
    }

    async fn reserve_booking_refund(
        &self,
        id: Uuid,
        amount_minor: i64,
        cancel_pending_transfer: bool,
    ) -> LedgerResult<Option<BookingRefundReservation>> {
        let mut state = self.state()?;
        let booking = state.booking_mut(id)?;

        let reservable = booking.payment_status == PaymentStatus::Paid
            && booking.payment_reference.is_some()
            && booking.transfer_status != TransferStatus::InProgress
            && amount_minor > 0
            && booking.refunded_minor + booking.refund_reserved_minor + amount_minor <= booking.gross_minor;
        if !reservable {
            return Ok(None);
        }

        booking.refund_reserved_minor += amount_minor;
        let cancelled_transfer = cancel_pending_transfer && booking.transfer_status == TransferStatus::Pending;
        if cancelled_transfer {
            booking.transfer_status = TransferStatus::Cancelled;
        }
        booking.updated_at = Utc::now();

        Ok(Some(BookingRefundReservation {
            booking: booking.clone(),
            cancelled_transfer,
        }))
    }

    async fn commit_booking_refund(&self, id: Uuid, amount_minor: i64, refund_reference: &str) -> LedgerResult<Booking> {
        let mut state = self.state()?;
        let booking = state.booking_mut(id)?;
        if booking.refund_reserved_minor < amount_minor {
            return Err(LedgerError::GuardViolated {
                id,
                detail: format!("no refund reservation of {} to commit", amount_minor),
            });
        }

        booking.refund_reserved_minor -= amount_minor;
        booking.refunded_minor += amount_minor;
        booking.refund_references.push(refund_reference.to_string());
        booking.refund_status = RefundStatus::for_amounts(booking.refunded_minor, booking.gross_minor);
        booking.updated_at = Utc::now();
        Ok(booking.clone())
    }

    async fn release_booking_refund(&self, id: Uuid, amount_minor: i64, restore_transfer: bool) -> LedgerResult<()> {
        let mut state = self.state()?;
        let booking = state.booking_mut(id)?;
        if booking.refund_reserved_minor < amount_minor {
            return Err(LedgerError::GuardViolated {
                id,
                detail: format!("no refund reservation of {} to release", amount_minor),
            });
        }

        booking.refund_reserved_minor -= amount_minor;
        if restore_transfer && booking.transfer_status == TransferStatus::Cancelled {
            booking.transfer_status = TransferStatus::Pending;
        }
        booking.updated_at = Utc::now();
        Ok(())
    }

    async fn reserve_package_refund(
        &self,
        id: Uuid,
        amount_minor: i64,
        expected_sessions_completed: i32,
    ) -> LedgerResult<Option<PackageRefundReservation>> {
        let mut state = self.state()?;
        let package = state.package_mut(id)?;

        let in_flight = package
            .installments
            .iter()
            .any(|i| i.transfer_status == TransferStatus::InProgress);
        let reservable = package.payment_status == PaymentStatus::Paid
            && package.status == PackageStatus::Active
            && package.payment_reference.is_some()
            && package.sessions_completed == expected_sessions_completed
            && !in_flight
            && amount_minor > 0
            && package.refunded_minor + package.refund_reserved_minor + amount_minor <= package.gross_minor;
        if !reservable {
            return Ok(None);
        }

        package.refund_reserved_minor += amount_minor;
        package.status = PackageStatus::Cancelled;
        package.updated_at = Utc::now();

        let mut cancelled_installments = Vec::new();
        for installment in package.installments.iter_mut() {
            if installment.transfer_status == TransferStatus::Pending {
                installment.transfer_status = TransferStatus::Cancelled;
                cancelled_installments.push(installment.id);
            }
        }

        Ok(Some(PackageRefundReservation {
            package: package.clone(),
            cancelled_installments,
        }))
    }

    async fn commit_package_refund(&self, id: Uuid, amount_minor: i64, refund_reference: &str) -> LedgerResult<Package> {
        let mut state = self.state()?;
        let package = state.package_mut(id)?;
        if package.refund_reserved_minor < amount_minor {
            return Err(LedgerError::GuardViolated {
                id,
                detail: format!("no package refund reservation of {} to commit", amount_minor),
            });
        }

        package.refund_reserved_minor -= amount_minor;
        package.refunded_minor += amount_minor;
        package.refund_references.push(refund_reference.to_string());
        package.refund_status = RefundStatus::for_amounts(package.refunded_minor, package.gross_minor);
        package.updated_at = Utc::now();
        Ok(package.clone())
    }

    async fn release_package_refund(&self, id: Uuid, amount_minor: i64, restore_installments: &[Uuid]) -> LedgerResult<()> {
        let mut state = self.state()?;
        let package = state.package_mut(id)?;
        if package.refund_reserved_minor < amount_minor {
            return Err(LedgerError::GuardViolated {
                id,
                detail: format!("no package refund reservation of {} to release", amount_minor),
            });
        }

        package.refund_reserved_minor -= amount_minor;
        package.status = PackageStatus::Active;
        package.updated_at = Utc::now();
        for installment in package.installments.iter_mut() {
            if restore_installments.contains(&installment.id) && installment.transfer_status == TransferStatus::Cancelled {
                installment.transfer_status = TransferStatus::Pending;
            }
        }
        Ok(())
    }

    async fn webhook_event_seen(&self, event_id: &str) -> LedgerResult<bool> {
        Ok(self.state()?.webhook_events.contains_key(event_id))
    }

    async fn record_webhook_event(&self, event_id: &str, event_type: &str, received_at: DateTime<Utc>) -> LedgerResult<()> {
        self.state()?
            .webhook_events
            .entry(event_id.to_string())
            .or_insert_with(|| (event_type.to_string(), received_at));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rally_core::{Commission, SessionSlot};

    fn split() -> Commission {
        Commission { commission_minor: 1800, provider_net_minor: 10200 }
    }

    fn confirmation() -> PaymentConfirmation {
        PaymentConfirmation {
            payment_reference: "ch_123".to_string(),
            split: split(),
            paid_at: Utc::now(),
        }
    }

    async fn paid_booking(ledger: &InMemoryLedger, end: DateTime<Utc>) -> Booking {
        let booking = Booking::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            split(),
            end - Duration::hours(1),
            end,
            Some("acct_coach".to_string()),
        )
        .with_checkout_reference("cs_123");
        ledger.insert_booking(&booking).await.unwrap();
        assert!(ledger.confirm_booking_payment(booking.id, &confirmation()).await.unwrap());
        ledger.get_booking(booking.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_payment_confirmation_is_one_shot() {
        let ledger = InMemoryLedger::new();
        let booking = paid_booking(&ledger, Utc::now()).await;

        assert!(!ledger.confirm_booking_payment(booking.id, &confirmation()).await.unwrap());
        assert!(!ledger.fail_booking_payment(booking.id).await.unwrap());
        assert_eq!(booking.payment_status, PaymentStatus::Paid);
        assert_eq!(booking.payment_reference.as_deref(), Some("ch_123"));
    }

    #[tokio::test]
    async fn test_lookup_by_checkout_or_payment_reference() {
        let ledger = InMemoryLedger::new();
        let booking = paid_booking(&ledger, Utc::now()).await;

        assert_eq!(
            ledger.find_by_payment_reference("cs_123").await.unwrap(),
            Some(PaymentTarget::Booking(booking.id))
        );
        assert_eq!(
            ledger.find_by_payment_reference("ch_123").await.unwrap(),
            Some(PaymentTarget::Booking(booking.id))
        );
        assert_eq!(ledger.find_by_payment_reference("ch_other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let ledger = InMemoryLedger::new();
        let now = Utc::now();
        let booking = paid_booking(&ledger, now - Duration::minutes(1)).await;
        let target = SettlementTarget::Booking(booking.id);

        assert!(ledger.claim_transfer(target, now).await.unwrap());
        assert!(!ledger.claim_transfer(target, now).await.unwrap());

        ledger.release_transfer(target).await.unwrap();
        assert!(ledger.claim_transfer(target, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_respects_service_window() {
        let ledger = InMemoryLedger::new();
        let now = Utc::now();
        let booking = paid_booking(&ledger, now + Duration::hours(1)).await;

        assert!(!ledger.claim_transfer(SettlementTarget::Booking(booking.id), now).await.unwrap());
        assert!(ledger.list_settlement_candidates(now, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deferred_unit_leaves_candidate_list_until_due() {
        let ledger = InMemoryLedger::new();
        let now = Utc::now();
        let booking = paid_booking(&ledger, now - Duration::minutes(1)).await;
        let target = SettlementTarget::Booking(booking.id);

        ledger.defer_transfer(target, now + Duration::hours(6)).await.unwrap();
        assert!(ledger.list_settlement_candidates(now, 10).await.unwrap().is_empty());
        assert_eq!(
            ledger.list_settlement_candidates(now + Duration::hours(6), 10).await.unwrap(),
            vec![target]
        );

        // Deferral only steers the sweeper; a direct claim still works.
        assert!(ledger.claim_transfer(target, now).await.unwrap());
        ledger.defer_transfer(target, now + Duration::hours(12)).await.unwrap();
        let stored = ledger.get_booking(booking.id).await.unwrap().unwrap();
        assert_eq!(stored.transfer_retry_at, Some(now + Duration::hours(6)));
    }

    #[tokio::test]
    async fn test_candidates_interleave_bookings_and_installments() {
        let ledger = InMemoryLedger::new();
        let now = Utc::now();
        let slots = [SessionSlot {
            start: now - Duration::hours(6),
            end: now - Duration::hours(5),
            hours: 1,
        }];
        let package = Package::new(Uuid::new_v4(), Uuid::new_v4(), split(), &slots, Some("acct_coach".into()))
            .unwrap()
            .with_checkout_reference("cs_pkg");
        ledger.insert_package(&package).await.unwrap();
        assert!(ledger.confirm_package_payment(package.id, &confirmation()).await.unwrap());
        let booking = paid_booking(&ledger, now - Duration::hours(1)).await;

        let candidates = ledger.list_settlement_candidates(now, 1).await.unwrap();
        assert_eq!(candidates, vec![SettlementTarget::Installment(package.installments[0].id)]);

        let candidates = ledger.list_settlement_candidates(now, 10).await.unwrap();
        assert_eq!(candidates[1], SettlementTarget::Booking(booking.id));
    }

    #[tokio::test]
    async fn test_refund_reservation_bounds() {
        let ledger = InMemoryLedger::new();
        let booking = paid_booking(&ledger, Utc::now()).await;

        assert!(ledger.reserve_booking_refund(booking.id, 8000, false).await.unwrap().is_some());
        // 8000 reserved; 4001 more would exceed gross
        assert!(ledger.reserve_booking_refund(booking.id, 4001, false).await.unwrap().is_none());

        let committed = ledger.commit_booking_refund(booking.id, 8000, "re_1").await.unwrap();
        assert_eq!(committed.refunded_minor, 8000);
        assert_eq!(committed.refund_status, RefundStatus::Partial);
        assert_eq!(committed.refund_reserved_minor, 0);
    }

    #[tokio::test]
    async fn test_full_refund_reservation_cancels_and_release_restores() {
        let ledger = InMemoryLedger::new();
        let booking = paid_booking(&ledger, Utc::now()).await;

        let reservation = ledger
            .reserve_booking_refund(booking.id, 12000, true)
            .await
            .unwrap()
            .unwrap();
        assert!(reservation.cancelled_transfer);
        assert_eq!(reservation.booking.transfer_status, TransferStatus::Cancelled);

        ledger.release_booking_refund(booking.id, 12000, true).await.unwrap();
        let restored = ledger.get_booking(booking.id).await.unwrap().unwrap();
        assert_eq!(restored.transfer_status, TransferStatus::Pending);
        assert_eq!(restored.refund_reserved_minor, 0);
    }

    #[tokio::test]
    async fn test_refund_blocked_while_transfer_in_flight() {
        let ledger = InMemoryLedger::new();
        let now = Utc::now();
        let booking = paid_booking(&ledger, now - Duration::minutes(1)).await;

        assert!(ledger.claim_transfer(SettlementTarget::Booking(booking.id), now).await.unwrap());
        assert!(ledger.reserve_booking_refund(booking.id, 100, false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_installment_completion_advances_package() {
        let ledger = InMemoryLedger::new();
        let now = Utc::now();
        let slots: Vec<SessionSlot> = (0..3)
            .map(|i| SessionSlot {
                start: now - Duration::hours(10 - i),
                end: now - Duration::hours(9 - i),
                hours: 2,
            })
            .collect();
        let package = Package::new(Uuid::new_v4(), Uuid::new_v4(), split(), &slots, Some("acct_coach".into()))
            .unwrap()
            .with_checkout_reference("cs_pkg");
        ledger.insert_package(&package).await.unwrap();
        assert!(ledger.confirm_package_payment(package.id, &confirmation()).await.unwrap());

        let first = SettlementTarget::Installment(package.installments[0].id);
        assert!(ledger.claim_transfer(first, now).await.unwrap());
        ledger
            .complete_transfer(
                first,
                &TransferReceipt { transfer_reference: Some("tr_1".into()), amount_minor: 3400, transferred_at: now },
            )
            .await
            .unwrap();

        let package = ledger.get_package(package.id).await.unwrap().unwrap();
        assert_eq!(package.sessions_completed, 1);
        assert_eq!(package.remaining_hours, 4);
        assert_eq!(package.sessions_paid_out(), 1);

        // A stale completed-session count loses the reservation race.
        assert!(ledger.reserve_package_refund(package.id, 100, 0).await.unwrap().is_none());

        let reservation = ledger.reserve_package_refund(package.id, 8000, 1).await.unwrap().unwrap();
        assert_eq!(reservation.cancelled_installments.len(), 2);
        assert_eq!(reservation.package.status, PackageStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_webhook_event_log() {
        let ledger = InMemoryLedger::new();
        assert!(!ledger.webhook_event_seen("evt_1").await.unwrap());
        ledger.record_webhook_event("evt_1", "charge.succeeded", Utc::now()).await.unwrap();
        ledger.record_webhook_event("evt_1", "charge.succeeded", Utc::now()).await.unwrap();
        assert!(ledger.webhook_event_seen("evt_1").await.unwrap());
    }
}
