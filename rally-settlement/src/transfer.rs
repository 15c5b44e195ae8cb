use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use rally_core::notify::SettlementNotifier;
use rally_core::payment::{GatewayError, PaymentGateway, TransferRequest};
use rally_core::repository::TransferReceipt;
use rally_core::{
    BookingKind, Clock, CommissionPolicy, IneligibleReason, LedgerError, SettlementLedger, SettlementTarget,
};
use rally_shared::models::events::PayoutReleasedEvent;
use rally_shared::{SettlementEvent, UnitKind};

#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: Uuid },
    #[error("payout account unusable: {0}")]
    AccountUnusable(String),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("transfer {transfer_reference} for {target:?} succeeded but the ledger write failed: {source}")]
    Inconsistency {
        target: SettlementTarget,
        transfer_reference: String,
        source: LedgerError,
    },
}

impl SettlementError {
    /// Whether the next sweep may succeed without anyone acting.
    pub fn is_retryable(&self) -> bool {
        match self {
            SettlementError::Gateway(GatewayError::Rejected { .. }) => false,
            SettlementError::Gateway(_) | SettlementError::Ledger(_) => true,
            _ => false,
        }
    }
}

/// Expected results of `settle`. Ineligibility is an answer, not a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SettlementOutcome {
    Transferred {
        target: SettlementTarget,
        transfer_reference: String,
        amount_minor: i64,
    },
    Ineligible {
        target: SettlementTarget,
        reason: IneligibleReason,
    },
    /// Refunds left the provider nothing; the unit is closed with a zero payout.
    NothingOwed { target: SettlementTarget },
}

/// Everything needed to call the payout API for one unit.
struct TransferPlan {
    amount_minor: i64,
    destination: String,
    source_reference: String,
    provider_id: Uuid,
    unit_kind: UnitKind,
    metadata: BTreeMap<String, String>,
}

pub struct TransferOrchestrator {
    ledger: Arc<dyn SettlementLedger>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn SettlementNotifier>,
    clock: Arc<dyn Clock>,
    commission: CommissionPolicy,
    call_timeout: Duration,
}

impl TransferOrchestrator {
    pub fn new(
        ledger: Arc<dyn SettlementLedger>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn SettlementNotifier>,
        clock: Arc<dyn Clock>,
        commission: CommissionPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            gateway,
            notifier,
            clock,
            commission,
            call_timeout,
        }
    }

    /// Releases a unit's provider share at most once.
    ///
    /// The unit is claimed PENDING → IN_PROGRESS with a conditional update
    /// before the payout call; a caller that loses the claim gets the
    /// current ineligibility reason and never reaches the processor. The
    /// amount is read after the claim, when refunds can no longer reserve
    /// against the unit.
    pub async fn settle(&self, target: SettlementTarget) -> Result<SettlementOutcome, SettlementError> {
        let now = self.clock.now();

        let planned = match self.plan(target, Some(now)).await? {
            Ok(plan) => plan,
            Err(reason) => {
                info!(?target, reason = reason.code(), "Unit not eligible for transfer");
                return Ok(SettlementOutcome::Ineligible { target, reason });
            }
        };

        if planned.amount_minor > 0 {
            let account =
                crate::with_timeout(self.call_timeout, self.gateway.retrieve_account(&planned.destination)).await?;
            if let Some(reason) = account.unusable_reason() {
                warn!(?target, destination = %planned.destination, %reason, "Payout account cannot receive transfers");
                return Err(SettlementError::AccountUnusable(reason));
            }
        }

        if !self.ledger.claim_transfer(target, now).await? {
            let reason = match self.plan(target, Some(now)).await? {
                Err(reason) => reason,
                Ok(_) => IneligibleReason::TransferInProgress,
            };
            info!(?target, reason = reason.code(), "Lost transfer claim");
            return Ok(SettlementOutcome::Ineligible { target, reason });
        }

        let plan = match self.plan(target, None).await {
            Ok(Ok(plan)) => plan,
            Ok(Err(reason)) => {
                self.release(target).await;
                return Ok(SettlementOutcome::Ineligible { target, reason });
            }
            Err(e) => {
                self.release(target).await;
                return Err(e);
            }
        };

        if plan.amount_minor <= 0 {
            return self.close_without_payout(target).await;
        }

        let request = TransferRequest {
            amount_minor: plan.amount_minor,
            destination: plan.destination.clone(),
            source_reference: plan.source_reference.clone(),
            idempotency_key: format!("transfer-{}-{}", target.id(), plan.amount_minor),
            metadata: plan.metadata.clone(),
        };

        let transfer_reference = match crate::with_timeout(self.call_timeout, self.gateway.create_transfer(&request)).await {
            Ok(reference) => reference,
            Err(e) => {
                warn!(?target, error = %e, "Transfer call failed, releasing claim");
                self.release(target).await;
                return Err(SettlementError::Gateway(e));
            }
        };

        let receipt = TransferReceipt {
            transfer_reference: Some(transfer_reference.clone()),
            amount_minor: plan.amount_minor,
            transferred_at: self.clock.now(),
        };

        if let Err(e) = self.ledger.complete_transfer(target, &receipt).await {
            error!(
                ?target,
                transfer_reference = %transfer_reference,
                amount = plan.amount_minor,
                error = %e,
                "CRITICAL: payout sent but ledger not updated; reconcile manually"
            );
            return Err(SettlementError::Inconsistency {
                target,
                transfer_reference,
                source: e,
            });
        }

        info!(
            ?target,
            transfer_reference = %transfer_reference,
            amount = plan.amount_minor,
            destination = %plan.destination,
            "Payout released"
        );

        crate::publish(
            self.notifier.as_ref(),
            SettlementEvent::PayoutReleased(PayoutReleasedEvent {
                unit_id: target.id(),
                unit_kind: plan.unit_kind,
                provider_id: plan.provider_id,
                transfer_reference: transfer_reference.clone(),
                amount_minor: plan.amount_minor,
                timestamp: receipt.transferred_at.timestamp(),
            }),
        )
        .await;

        Ok(SettlementOutcome::Transferred {
            target,
            transfer_reference,
            amount_minor: plan.amount_minor,
        })
    }

    /// Marks a claimed unit TRANSFERRED with a zero payout and no processor call.
    async fn close_without_payout(&self, target: SettlementTarget) -> Result<SettlementOutcome, SettlementError> {
        let receipt = TransferReceipt {
            transfer_reference: None,
            amount_minor: 0,
            transferred_at: self.clock.now(),
        };

        if let Err(e) = self.ledger.complete_transfer(target, &receipt).await {
            self.release(target).await;
            return Err(SettlementError::Ledger(e));
        }

        info!(?target, "Nothing owed after refunds, unit closed without payout");
        Ok(SettlementOutcome::NothingOwed { target })
    }

    async fn release(&self, target: SettlementTarget) {
        if let Err(e) = self.ledger.release_transfer(target).await {
            error!(?target, error = %e, "Failed to release transfer claim; unit stays IN_PROGRESS");
        }
    }

    pub async fn settle_booking(&self, booking_id: Uuid) -> Result<SettlementOutcome, SettlementError> {
        self.settle(SettlementTarget::Booking(booking_id)).await
    }

    pub async fn settle_installment(&self, installment_id: Uuid) -> Result<SettlementOutcome, SettlementError> {
        self.settle(SettlementTarget::Installment(installment_id)).await
    }

    /// Reads the unit and works out its payout. `eligible_at: None` skips the
    /// eligibility check, for a unit this caller already holds IN_PROGRESS.
    async fn plan(
        &self,
        target: SettlementTarget,
        eligible_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Result<TransferPlan, IneligibleReason>, SettlementError> {
        match target {
            SettlementTarget::Booking(id) => {
                let booking = self
                    .ledger
                    .get_booking(id)
                    .await?
                    .ok_or(SettlementError::NotFound { kind: "booking", id })?;

                if let Some(Err(reason)) = eligible_at.map(|now| booking.transfer_eligibility(now)) {
                    return Ok(Err(reason));
                }

                // A refund taken before the payout shrinks what the provider is owed.
                let amount_minor = if booking.refunded_minor > 0 {
                    self.commission
                        .compute(booking.retained_gross_minor(), BookingKind::SingleSession)
                        .map_err(|e| LedgerError::Corrupt(e.to_string()))?
                        .provider_net_minor
                } else {
                    booking.provider_net_minor
                };

                let source_reference = booking
                    .payment_reference
                    .clone()
                    .ok_or_else(|| LedgerError::Corrupt(format!("paid booking {} has no payment reference", id)))?;
                let destination = booking.payout_destination().unwrap_or_default().to_string();

                let mut metadata = BTreeMap::new();
                metadata.insert("booking_id".to_string(), id.to_string());
                metadata.insert("provider_id".to_string(), booking.provider_id.to_string());

                Ok(Ok(TransferPlan {
                    amount_minor,
                    destination,
                    source_reference,
                    provider_id: booking.provider_id,
                    unit_kind: UnitKind::Booking,
                    metadata,
                }))
            }
            SettlementTarget::Installment(id) => {
                let package = self
                    .ledger
                    .find_package_by_installment(id)
                    .await?
                    .ok_or(SettlementError::NotFound { kind: "installment", id })?;
                let installment = package
                    .installment(id)
                    .ok_or(SettlementError::NotFound { kind: "installment", id })?;

                if let Some(Err(reason)) = eligible_at.map(|now| package.installment_eligibility(installment, now)) {
                    return Ok(Err(reason));
                }

                let source_reference = package
                    .payment_reference
                    .clone()
                    .ok_or_else(|| LedgerError::Corrupt(format!("paid package {} has no payment reference", package.id)))?;
                let destination = package.payout_destination().unwrap_or_default().to_string();

                let mut metadata = BTreeMap::new();
                metadata.insert("package_id".to_string(), package.id.to_string());
                metadata.insert("installment_id".to_string(), id.to_string());
                metadata.insert("sequence".to_string(), installment.sequence.to_string());
                metadata.insert("provider_id".to_string(), package.provider_id.to_string());

                Ok(Ok(TransferPlan {
                    amount_minor: installment.payout_minor,
                    destination,
                    source_reference,
                    provider_id: package.provider_id,
                    unit_kind: UnitKind::Installment,
                    metadata,
                }))
            }
        }
    }
}
