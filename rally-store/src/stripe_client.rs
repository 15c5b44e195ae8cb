use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use rally_core::payment::{AccountCapabilities, GatewayError, PaymentGateway, RefundRequest, TransferRequest};

use crate::app_config::PaymentsConfig;

const CURRENCY: &str = "usd";

/// Stripe Connect adapter: separate charges and transfers out of the
/// platform balance, refunds against the original charge.
#[derive(Clone)]
pub struct StripeGateway {
    http: Client,
    api_base: String,
    api_key: String,
}

#[derive(Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Deserialize, Default)]
struct ErrorEnvelope {
    #[serde(default)]
    error: ErrorBody,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    code: Option<String>,
    message: Option<String>,
}

#[derive(Deserialize)]
struct AccountResponse {
    #[serde(default)]
    payouts_enabled: bool,
    #[serde(default)]
    capabilities: Option<AccountCapabilityFlags>,
    #[serde(default)]
    requirements: Option<AccountRequirements>,
}

#[derive(Deserialize)]
struct AccountCapabilityFlags {
    transfers: Option<String>,
}

#[derive(Deserialize)]
struct AccountRequirements {
    disabled_reason: Option<String>,
}

impl StripeGateway {
    pub fn new(config: &PaymentsConfig) -> Result<Self, GatewayError> {
        let http = Client::builder()
            .use_rustls_tls()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.expose().clone(),
        })
    }

    fn post(&self, path: &str, idempotency_key: &str) -> RequestBuilder {
        self.http
            .post(format!("{}{}", self.api_base, path))
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", idempotency_key)
    }

    async fn send<T: for<'de> Deserialize<'de>>(&self, request: RequestBuilder) -> Result<T, GatewayError> {
        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();

        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| GatewayError::Network(format!("unreadable processor response: {}", e)));
        }

        let body: ErrorEnvelope = response.json().await.unwrap_or_default();
        let message = body.error.message.unwrap_or_else(|| status.to_string());

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            warn!(%status, %message, "Payment processor unavailable");
            return Err(GatewayError::Unavailable(message));
        }
        Err(GatewayError::Rejected { code: body.error.code, message })
    }
}

fn map_transport_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout
    } else {
        GatewayError::Network(err.to_string())
    }
}

fn with_metadata(mut form: Vec<(String, String)>, metadata: &std::collections::BTreeMap<String, String>) -> Vec<(String, String)> {
    for (key, value) in metadata {
        form.push((format!("metadata[{}]", key), value.clone()));
    }
    form
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_transfer(&self, request: &TransferRequest) -> Result<String, GatewayError> {
        let mut form = vec![
            ("amount".to_string(), request.amount_minor.to_string()),
            ("currency".to_string(), CURRENCY.to_string()),
            ("destination".to_string(), request.destination.clone()),
        ];
        // Only charges can fund a transfer directly; other references draw on the balance.
        if request.source_reference.starts_with("ch_") {
            form.push(("source_transaction".to_string(), request.source_reference.clone()));
        }
        let form = with_metadata(form, &request.metadata);

        let created: IdResponse = self
            .send(self.post("/v1/transfers", &request.idempotency_key).form(&form))
            .await?;

        debug!(transfer_id = %created.id, destination = %request.destination, "Transfer created");
        Ok(created.id)
    }

    async fn retrieve_account(&self, destination: &str) -> Result<AccountCapabilities, GatewayError> {
        let request = self
            .http
            .get(format!("{}/v1/accounts/{}", self.api_base, destination))
            .bearer_auth(&self.api_key);

        let account: AccountResponse = self.send(request).await?;

        Ok(AccountCapabilities {
            transfers_active: account
                .capabilities
                .and_then(|c| c.transfers)
                .is_some_and(|t| t == "active"),
            payouts_enabled: account.payouts_enabled,
            disabled_reason: account.requirements.and_then(|r| r.disabled_reason),
        })
    }

    async fn create_refund(&self, request: &RefundRequest) -> Result<String, GatewayError> {
        let charge_field = if request.payment_reference.starts_with("pi_") {
            "payment_intent"
        } else {
            "charge"
        };
        let form = with_metadata(
            vec![
                (charge_field.to_string(), request.payment_reference.clone()),
                ("amount".to_string(), request.amount_minor.to_string()),
                ("reason".to_string(), request.reason.as_str().to_string()),
            ],
            &request.metadata,
        );

        let created: IdResponse = self
            .send(self.post("/v1/refunds", &request.idempotency_key).form(&form))
            .await?;

        debug!(refund_id = %created.id, payment_reference = %request.payment_reference, "Refund created");
        Ok(created.id)
    }
}
