use serde::Deserialize;
use std::env;
use std::time::Duration;

use rally_core::CommissionPolicy;
use rally_shared::Masked;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
    #[serde(default)]
    pub kafka: Option<KafkaConfig>,
    pub auth: AuthConfig,
    pub payments: PaymentsConfig,
    #[serde(default)]
    pub commission: CommissionPolicy,
    pub sweeper: SweeperConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: Masked<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: Masked<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 { 5 }

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: i64,
}

fn default_rate_limit() -> i64 { 100 }

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    #[serde(default = "default_topic")]
    pub topic: String,
}

fn default_topic() -> String { "settlement.events".to_string() }

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PaymentProviderKind {
    Stripe,
    Mock,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PaymentsConfig {
    pub provider: PaymentProviderKind,
    #[serde(default)]
    pub api_key: Masked<String>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    pub webhook_secret: Masked<String>,
    #[serde(default = "default_webhook_tolerance")]
    pub webhook_tolerance_seconds: i64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

fn default_api_base() -> String { "https://api.stripe.com".to_string() }
fn default_webhook_tolerance() -> i64 { 300 }
fn default_request_timeout() -> u64 { 10_000 }

impl PaymentsConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SweeperConfig {
    #[serde(default = "default_sweep_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_batch_limit")]
    pub batch_limit: i64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// How long a unit that failed permanently sits out of the sweep.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_seconds: u64,
    /// Bearer token for the on-demand sweep trigger; distinct from user auth.
    pub trigger_secret: Masked<String>,
}

fn default_sweep_interval() -> u64 { 3600 }
fn default_batch_limit() -> i64 { 500 }
fn default_concurrency() -> usize { 4 }
fn default_retry_backoff() -> u64 { 21_600 }

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Per-environment overrides are optional
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Untracked local overrides
            .add_source(config::File::with_name("config/local").required(false))
            // Eg.. `RALLY__PAYMENTS__WEBHOOK_SECRET=whsec_...`
            .add_source(config::Environment::with_prefix("RALLY").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_optional_sections() {
        let raw = r#"
            [server]
            port = 8080

            [database]
            url = "postgres://localhost/rally"

            [auth]
            jwt_secret = "dev-secret"

            [payments]
            provider = "mock"
            webhook_secret = "whsec_dev"

            [sweeper]
            trigger_secret = "sweep-dev"
        "#;

        let cfg: Config = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(cfg.payments.provider, PaymentProviderKind::Mock);
        assert_eq!(cfg.payments.webhook_tolerance_seconds, 300);
        assert_eq!(cfg.sweeper.interval_seconds, 3600);
        assert_eq!(cfg.sweeper.retry_backoff_seconds, 21_600);
        assert_eq!(cfg.commission, CommissionPolicy::default());
        assert!(cfg.redis.is_none());
        assert_eq!(format!("{:?}", cfg.payments.webhook_secret), "********");
    }
}
