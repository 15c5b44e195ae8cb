use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a unit cannot be settled right now. Every variant is user-displayable
/// and none of them changes ledger state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum IneligibleReason {
    NotPaid,
    NotYetCompleted { ends_at: DateTime<Utc> },
    AlreadyTransferred,
    TransferInProgress,
    Cancelled,
    FullyRefunded,
    RefundInProgress,
    NoPayoutDestination,
}

impl IneligibleReason {
    pub fn code(&self) -> &'static str {
        match self {
            IneligibleReason::NotPaid => "not_paid",
            IneligibleReason::NotYetCompleted { .. } => "not_yet_completed",
            IneligibleReason::AlreadyTransferred => "already_transferred",
            IneligibleReason::TransferInProgress => "transfer_in_progress",
            IneligibleReason::Cancelled => "cancelled",
            IneligibleReason::FullyRefunded => "fully_refunded",
            IneligibleReason::RefundInProgress => "refund_in_progress",
            IneligibleReason::NoPayoutDestination => "no_payout_destination",
        }
    }

    /// Whether the blocking condition can clear on its own (time passing,
    /// an in-flight operation finishing, the provider finishing onboarding).
    pub fn may_clear(&self) -> bool {
        matches!(
            self,
            IneligibleReason::NotPaid
                | IneligibleReason::NotYetCompleted { .. }
                | IneligibleReason::TransferInProgress
                | IneligibleReason::RefundInProgress
                | IneligibleReason::NoPayoutDestination
        )
    }
}

impl fmt::Display for IneligibleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IneligibleReason::NotPaid => write!(f, "Payment has not been received for this session"),
            IneligibleReason::NotYetCompleted { ends_at } => {
                write!(f, "Session is not yet completed (ends {})", ends_at.to_rfc3339())
            }
            IneligibleReason::AlreadyTransferred => write!(f, "Payout was already released for this session"),
            IneligibleReason::TransferInProgress => write!(f, "A payout for this session is already in progress"),
            IneligibleReason::Cancelled => write!(f, "Payout for this session was cancelled"),
            IneligibleReason::FullyRefunded => write!(f, "Session was fully refunded"),
            IneligibleReason::RefundInProgress => write!(f, "A refund for this session is in progress"),
            IneligibleReason::NoPayoutDestination => {
                write!(f, "Coach has not connected a payout account")
            }
        }
    }
}
