use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rally_core::payment::{AccountCapabilities, GatewayError, PaymentGateway, RefundRequest, TransferRequest};

#[derive(Default)]
struct MockState {
    transfers: Vec<TransferRequest>,
    refunds: Vec<RefundRequest>,
    issued: HashMap<String, String>,
    account: Option<AccountCapabilities>,
    transfer_failure: Option<GatewayError>,
    refund_failure: Option<GatewayError>,
    delay: Duration,
}

/// In-process stand-in for the payment processor. Replays the same id for a
/// repeated idempotency key the way the real API does.
#[derive(Default)]
pub struct MockPaymentGateway {
    state: Mutex<MockState>,
    transfer_calls: AtomicUsize,
    refund_calls: AtomicUsize,
}

impl MockPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every call sleeps this long first; widens race windows in tests.
    pub fn set_delay(&self, delay: Duration) {
        self.state().delay = delay;
    }

    pub fn fail_transfers_with(&self, error: Option<GatewayError>) {
        self.state().transfer_failure = error;
    }

    pub fn fail_refunds_with(&self, error: Option<GatewayError>) {
        self.state().refund_failure = error;
    }

    pub fn set_account(&self, account: AccountCapabilities) {
        self.state().account = Some(account);
    }

    pub fn transfer_calls(&self) -> usize {
        self.transfer_calls.load(Ordering::SeqCst)
    }

    pub fn refund_calls(&self) -> usize {
        self.refund_calls.load(Ordering::SeqCst)
    }

    /// Transfers that actually moved money.
    pub fn transfers(&self) -> Vec<TransferRequest> {
        self.state().transfers.clone()
    }

    pub fn refunds(&self) -> Vec<RefundRequest> {
        self.state().refunds.clone()
    }

    async fn pause(&self) {
        let delay = self.state().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    async fn create_transfer(&self, request: &TransferRequest) -> Result<String, GatewayError> {
        self.transfer_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;

        let mut state = self.state();
        if let Some(error) = state.transfer_failure.clone() {
            return Err(error);
        }
        if let Some(existing) = state.issued.get(&request.idempotency_key) {
            return Ok(existing.clone());
        }

        let id = format!("tr_mock_{}", state.transfers.len() + 1);
        state.issued.insert(request.idempotency_key.clone(), id.clone());
        state.transfers.push(request.clone());
        Ok(id)
    }

    async fn retrieve_account(&self, _destination: &str) -> Result<AccountCapabilities, GatewayError> {
        Ok(self.state().account.clone().unwrap_or(AccountCapabilities {
            transfers_active: true,
            payouts_enabled: true,
            disabled_reason: None,
        }))
    }

    async fn create_refund(&self, request: &RefundRequest) -> Result<String, GatewayError> {
        self.refund_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;

        let mut state = self.state();
        if let Some(error) = state.refund_failure.clone() {
            return Err(error);
        }
        if let Some(existing) = state.issued.get(&request.idempotency_key) {
            return Ok(existing.clone());
        }

        let id = format!("re_mock_{}", state.refunds.len() + 1);
        state.issued.insert(request.idempotency_key.clone(), id.clone());
        state.refunds.push(request.clone());
        Ok(id)
    }
}
