use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::str::FromStr;

use crate::booking::{PaymentStatus, RefundStatus, TransferStatus};
use crate::commission::{split_evenly, Commission};
use crate::eligibility::IneligibleReason;
use crate::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PackageStatus {
    Active,
    Cancelled,
}

impl PackageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageStatus::Active => "ACTIVE",
            PackageStatus::Cancelled => "CANCELLED",
        }
    }
}

impl FromStr for PackageStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(PackageStatus::Active),
            "CANCELLED" => Ok(PackageStatus::Cancelled),
            other => Err(CoreError::UnknownStatus { kind: "package status", value: other.to_string() }),
        }
    }
}

/// One scheduled session of a package, as produced by the scheduling system.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSlot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub hours: i32,
}

/// Settlement unit for one session of a package. Shares the package's charge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Installment {
    pub id: Uuid,
    pub package_id: Uuid,
    pub sequence: i32,
    /// This session's slice of the package provider net.
    pub payout_minor: i64,
    pub hours: i32,
    pub service_start: DateTime<Utc>,
    pub service_end: DateTime<Utc>,
    pub transfer_status: TransferStatus,
    pub transfer_reference: Option<String>,
    pub transferred_at: Option<DateTime<Utc>>,
    pub transfer_retry_at: Option<DateTime<Utc>>,
}

/// A prepaid bundle of sessions paid with a single charge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Package {
    pub id: Uuid,
    pub buyer_id: Uuid,
    pub provider_id: Uuid,
    pub gross_minor: i64,
    pub commission_minor: i64,
    pub provider_net_minor: i64,
    pub total_sessions: i32,
    pub sessions_completed: i32,
    pub remaining_hours: i32,
    pub status: PackageStatus,
    pub payment_status: PaymentStatus,
    pub refund_status: RefundStatus,
    pub refunded_minor: i64,
    pub refund_reserved_minor: i64,
    pub checkout_reference: Option<String>,
    pub payment_reference: Option<String>,
    pub refund_references: Vec<String>,
    pub payout_destination: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub installments: Vec<Installment>,
}

impl Package {
    pub fn new(
        buyer_id: Uuid,
        provider_id: Uuid,
        split: Commission,
        sessions: &[SessionSlot],
        payout_destination: Option<String>,
    ) -> CoreResult<Self> {
        if sessions.is_empty() {
            return Err(CoreError::ValidationError("package needs at least one session".to_string()));
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        let payouts = split_evenly(split.provider_net_minor, sessions.len());

        let installments = sessions
            .iter()
            .zip(payouts)
            .enumerate()
            .map(|(i, (slot, payout))| Installment {
                id: Uuid::new_v4(),
                package_id: id,
                sequence: i as i32 + 1,
                payout_minor: payout,
                hours: slot.hours,
                service_start: slot.start,
                service_end: slot.end,
                transfer_status: TransferStatus::Pending,
                transfer_reference: None,
                transferred_at: None,
                transfer_retry_at: None,
            })
            .collect();

        Ok(Self {
            id,
            buyer_id,
            provider_id,
            gross_minor: split.gross_minor(),
            commission_minor: split.commission_minor,
            provider_net_minor: split.provider_net_minor,
            total_sessions: sessions.len() as i32,
            sessions_completed: 0,
            remaining_hours: sessions.iter().map(|s| s.hours).sum(),
            status: PackageStatus::Active,
            payment_status: PaymentStatus::Pending,
            refund_status: RefundStatus::None,
            refunded_minor: 0,
            refund_reserved_minor: 0,
            checkout_reference: None,
            payment_reference: None,
            refund_references: Vec::new(),
            payout_destination,
            paid_at: None,
            created_at: now,
            updated_at: now,
            installments,
        })
    }

    pub fn with_checkout_reference(mut self, reference: impl Into<String>) -> Self {
        self.checkout_reference = Some(reference.into());
        self
    }

    pub fn installment(&self, installment_id: Uuid) -> Option<&Installment> {
        self.installments.iter().find(|i| i.id == installment_id)
    }

    /// Per-session payout slices for a given provider net, in sequence order.
    pub fn installment_payouts(&self, provider_net_minor: i64) -> Vec<i64> {
        split_evenly(provider_net_minor, self.total_sessions.max(0) as usize)
    }

    pub fn remaining_sessions(&self) -> i32 {
        (self.total_sessions - self.sessions_completed).max(0)
    }

    pub fn refundable_minor(&self) -> i64 {
        self.gross_minor - self.refunded_minor - self.refund_reserved_minor
    }

    pub fn payout_destination(&self) -> Option<&str> {
        crate::configured_destination(self.payout_destination.as_deref())
    }

    /// Sessions whose payout has already been released to the provider.
    pub fn sessions_paid_out(&self) -> i32 {
        self.installments
            .iter()
            .filter(|i| i.transfer_status == TransferStatus::Transferred)
            .count() as i32
    }

    /// Settlement preconditions for one installment of this package.
    pub fn installment_eligibility(
        &self,
        installment: &Installment,
        now: DateTime<Utc>,
    ) -> Result<(), IneligibleReason> {
        if self.payment_status != PaymentStatus::Paid {
            return Err(IneligibleReason::NotPaid);
        }

        match installment.transfer_status {
            TransferStatus::Transferred => return Err(IneligibleReason::AlreadyTransferred),
            TransferStatus::InProgress => return Err(IneligibleReason::TransferInProgress),
            TransferStatus::Cancelled => return Err(IneligibleReason::Cancelled),
            TransferStatus::Pending => {}
        }

        if self.status == PackageStatus::Cancelled {
            return Err(IneligibleReason::Cancelled);
        }
        if self.refund_status == RefundStatus::Full {
            return Err(IneligibleReason::FullyRefunded);
        }
        if self.refund_reserved_minor > 0 {
            return Err(IneligibleReason::RefundInProgress);
        }
        if installment.service_end > now {
            return Err(IneligibleReason::NotYetCompleted { ends_at: installment.service_end });
        }
        if self.payout_destination().is_none() {
            return Err(IneligibleReason::NoPayoutDestination);
        }

        Ok(())
    }
}
