use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Request to move a provider's share out of escrow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferRequest {
    pub amount_minor: i64,
    pub destination: String,
    /// The original charge the funds are drawn against.
    pub source_reference: String,
    /// Stable per unit and amount so a replayed call cannot pay twice.
    pub idempotency_key: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RefundReason {
    RequestedByCustomer,
    Duplicate,
    Fraudulent,
}

impl RefundReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundReason::RequestedByCustomer => "requested_by_customer",
            RefundReason::Duplicate => "duplicate",
            RefundReason::Fraudulent => "fraudulent",
        }
    }
}

/// Request to reverse part or all of a charge back to the buyer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefundRequest {
    pub payment_reference: String,
    pub amount_minor: i64,
    pub reason: RefundReason,
    pub idempotency_key: String,
    pub metadata: BTreeMap<String, String>,
}

/// Capability flags of a connected payout account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountCapabilities {
    pub transfers_active: bool,
    pub payouts_enabled: bool,
    pub disabled_reason: Option<String>,
}

impl AccountCapabilities {
    /// `Some(reason)` when the account cannot receive a transfer until the
    /// provider acts.
    pub fn unusable_reason(&self) -> Option<String> {
        if let Some(reason) = &self.disabled_reason {
            return Some(format!("account disabled: {}", reason));
        }
        if !self.transfers_active {
            return Some("transfers capability is not active".to_string());
        }
        if !self.payouts_enabled {
            return Some("payouts are not enabled".to_string());
        }
        None
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("payment processor did not answer within the timeout")]
    Timeout,
    #[error("network error talking to payment processor: {0}")]
    Network(String),
    #[error("payment processor rejected the request: {message}")]
    Rejected { code: Option<String>, message: String },
    #[error("payment processor unavailable: {0}")]
    Unavailable(String),
}

/// The slice of the payment processor the settlement engine consumes.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Route funds to a connected account; returns the transfer id.
    async fn create_transfer(&self, request: &TransferRequest) -> Result<String, GatewayError>;

    /// Look up capability flags of a payout destination.
    async fn retrieve_account(&self, destination: &str) -> Result<AccountCapabilities, GatewayError>;

    /// Reverse funds of a charge; returns the refund id.
    async fn create_refund(&self, request: &RefundRequest) -> Result<String, GatewayError>;
}
