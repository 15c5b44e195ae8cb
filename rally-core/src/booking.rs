use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::str::FromStr;

use crate::commission::Commission;
use crate::eligibility::IneligibleReason;
use crate::CoreError;

/// Whether the buyer's money has entered escrow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
}

/// Whether the provider's share has left escrow.
///
/// `InProgress` is the claim a settlement holds while the external payout
/// call is outstanding; it never survives a completed `settle`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    Pending,
    InProgress,
    Transferred,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundStatus {
    None,
    Partial,
    Full,
}

/// Drives which commission rate applies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingKind {
    SingleSession,
    PackageInstallment,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Paid => "PAID",
            PaymentStatus::Failed => "FAILED",
        }
    }

    /// PAID and FAILED are never left once entered.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

impl FromStr for PaymentStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(PaymentStatus::Pending),
            "PAID" => Ok(PaymentStatus::Paid),
            "FAILED" => Ok(PaymentStatus::Failed),
            other => Err(CoreError::UnknownStatus { kind: "payment status", value: other.to_string() }),
        }
    }
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "PENDING",
            TransferStatus::InProgress => "IN_PROGRESS",
            TransferStatus::Transferred => "TRANSFERRED",
            TransferStatus::Cancelled => "CANCELLED",
        }
    }
}

impl FromStr for TransferStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TransferStatus::Pending),
            "IN_PROGRESS" => Ok(TransferStatus::InProgress),
            "TRANSFERRED" => Ok(TransferStatus::Transferred),
            "CANCELLED" => Ok(TransferStatus::Cancelled),
            other => Err(CoreError::UnknownStatus { kind: "transfer status", value: other.to_string() }),
        }
    }
}

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::None => "NONE",
            RefundStatus::Partial => "PARTIAL",
            RefundStatus::Full => "FULL",
        }
    }

    /// Status implied by a cumulative refunded amount.
    pub fn for_amounts(refunded_minor: i64, gross_minor: i64) -> Self {
        if refunded_minor <= 0 {
            RefundStatus::None
        } else if refunded_minor >= gross_minor {
            RefundStatus::Full
        } else {
            RefundStatus::Partial
        }
    }
}

impl FromStr for RefundStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NONE" => Ok(RefundStatus::None),
            "PARTIAL" => Ok(RefundStatus::Partial),
            "FULL" => Ok(RefundStatus::Full),
            other => Err(CoreError::UnknownStatus { kind: "refund status", value: other.to_string() }),
        }
    }
}

impl BookingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingKind::SingleSession => "SINGLE_SESSION",
            BookingKind::PackageInstallment => "PACKAGE_INSTALLMENT",
        }
    }
}

/// A single purchased session between a buyer and a provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Booking {
    pub id: Uuid,
    pub buyer_id: Uuid,
    pub provider_id: Uuid,
    pub gross_minor: i64,
    pub commission_minor: i64,
    pub provider_net_minor: i64,
    pub payment_status: PaymentStatus,
    pub transfer_status: TransferStatus,
    pub refund_status: RefundStatus,
    pub service_start: DateTime<Utc>,
    pub service_end: DateTime<Utc>,
    /// Checkout session created when the buyer started paying.
    pub checkout_reference: Option<String>,
    /// The charge the escrowed funds came from; set on PAID.
    pub payment_reference: Option<String>,
    pub transfer_reference: Option<String>,
    pub transferred_minor: Option<i64>,
    pub refund_references: Vec<String>,
    pub refunded_minor: i64,
    /// Refund amount currently out at the processor, not yet committed.
    pub refund_reserved_minor: i64,
    pub payout_destination: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub transferred_at: Option<DateTime<Utc>>,
    /// The sweeper leaves the booking alone until then.
    pub transfer_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    /// A booking as created at checkout initiation.
    pub fn new(
        buyer_id: Uuid,
        provider_id: Uuid,
        split: Commission,
        service_start: DateTime<Utc>,
        service_end: DateTime<Utc>,
        payout_destination: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            buyer_id,
            provider_id,
            gross_minor: split.gross_minor(),
            commission_minor: split.commission_minor,
            provider_net_minor: split.provider_net_minor,
            payment_status: PaymentStatus::Pending,
            transfer_status: TransferStatus::Pending,
            refund_status: RefundStatus::None,
            service_start,
            service_end,
            checkout_reference: None,
            payment_reference: None,
            transfer_reference: None,
            transferred_minor: None,
            refund_references: Vec::new(),
            refunded_minor: 0,
            refund_reserved_minor: 0,
            payout_destination,
            paid_at: None,
            transferred_at: None,
            transfer_retry_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_checkout_reference(mut self, reference: impl Into<String>) -> Self {
        self.checkout_reference = Some(reference.into());
        self
    }

    /// Amount still refundable, net of refunds already out at the processor.
    pub fn refundable_minor(&self) -> i64 {
        self.gross_minor - self.refunded_minor - self.refund_reserved_minor
    }

    /// Gross still held after refunds that happened before the payout.
    pub fn retained_gross_minor(&self) -> i64 {
        self.gross_minor - self.refunded_minor
    }

    pub fn payout_destination(&self) -> Option<&str> {
        crate::configured_destination(self.payout_destination.as_deref())
    }

    /// Evaluates every settlement precondition against `now`.
    pub fn transfer_eligibility(&self, now: DateTime<Utc>) -> Result<(), IneligibleReason> {
        if self.payment_status != PaymentStatus::Paid {
            return Err(IneligibleReason::NotPaid);
        }

        match self.transfer_status {
            TransferStatus::Transferred => return Err(IneligibleReason::AlreadyTransferred),
            TransferStatus::InProgress => return Err(IneligibleReason::TransferInProgress),
            TransferStatus::Cancelled => return Err(IneligibleReason::Cancelled),
            TransferStatus::Pending => {}
        }

        if self.refund_status == RefundStatus::Full {
            return Err(IneligibleReason::FullyRefunded);
        }
        if self.refund_reserved_minor > 0 {
            return Err(IneligibleReason::RefundInProgress);
        }
        if self.service_end > now {
            return Err(IneligibleReason::NotYetCompleted { ends_at: self.service_end });
        }
        if self.payout_destination().is_none() {
            return Err(IneligibleReason::NoPayoutDestination);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn paid_booking(end: DateTime<Utc>) -> Booking {
        let mut booking = Booking::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Commission { commission_minor: 1800, provider_net_minor: 10200 },
            end - Duration::hours(1),
            end,
            Some("acct_coach".to_string()),
        );
        booking.payment_status = PaymentStatus::Paid;
        booking
    }

    #[test]
    fn test_status_strings_round_trip() {
        for status in [TransferStatus::Pending, TransferStatus::InProgress, TransferStatus::Transferred, TransferStatus::Cancelled] {
            assert_eq!(status.as_str().parse::<TransferStatus>().unwrap(), status);
        }
        assert!("SETTLED".parse::<PaymentStatus>().is_err());
    }

    #[test]
    fn test_refund_status_for_amounts() {
        assert_eq!(RefundStatus::for_amounts(0, 1000), RefundStatus::None);
        assert_eq!(RefundStatus::for_amounts(400, 1000), RefundStatus::Partial);
        assert_eq!(RefundStatus::for_amounts(1000, 1000), RefundStatus::Full);
    }

    #[test]
    fn test_eligibility_order() {
        let now = Utc::now();

        let mut booking = paid_booking(now + Duration::hours(2));
        assert_eq!(
            booking.transfer_eligibility(now),
            Err(IneligibleReason::NotYetCompleted { ends_at: booking.service_end })
        );

        booking.service_end = now - Duration::minutes(5);
        booking.payout_destination = Some(crate::UNCONFIGURED_PAYOUT_DESTINATION.to_string());
        assert_eq!(booking.transfer_eligibility(now), Err(IneligibleReason::NoPayoutDestination));

        booking.payout_destination = Some("acct_coach".to_string());
        assert_eq!(booking.transfer_eligibility(now), Ok(()));

        booking.transfer_status = TransferStatus::Transferred;
        assert_eq!(booking.transfer_eligibility(now), Err(IneligibleReason::AlreadyTransferred));

        booking.payment_status = PaymentStatus::Failed;
        assert_eq!(booking.transfer_eligibility(now), Err(IneligibleReason::NotPaid));
    }
}
