pub mod booking;
pub mod clock;
pub mod commission;
pub mod eligibility;
pub mod notify;
pub mod package;
pub mod payment;
pub mod repository;

pub use booking::{Booking, BookingKind, PaymentStatus, RefundStatus, TransferStatus};
pub use clock::{Clock, FixedClock, SystemClock};
pub use commission::{Commission, CommissionPolicy, CommissionRate};
pub use eligibility::IneligibleReason;
pub use package::{Installment, Package, PackageStatus, SessionSlot};
pub use repository::{LedgerError, LedgerResult, PaymentTarget, SettlementLedger, SettlementTarget};

/// Sentinel some onboarding flows store before a provider finishes
/// connecting a payout account.
pub const UNCONFIGURED_PAYOUT_DESTINATION: &str = "unconfigured";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    ValidationError(String),
    #[error("Unknown {kind} value: {value}")]
    UnknownStatus { kind: &'static str, value: String },
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Returns the destination only when it can actually receive a payout.
pub fn configured_destination(destination: Option<&str>) -> Option<&str> {
    destination
        .map(str::trim)
        .filter(|d| !d.is_empty() && !d.eq_ignore_ascii_case(UNCONFIGURED_PAYOUT_DESTINATION))
}
