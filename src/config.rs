use crate::application::accounts::AccountService;
use crate::application::consumer::ConsumerConfig;
use crate::application::idempotency::IdempotencyGate;
use crate::application::invoices::InvoiceService;
use crate::application::rate_limit::{RateLimitConfig, RateLimiter};
use crate::application::relay::RelayConfig;
use crate::domain::credentials::ApiKeyHasher;
use crate::domain::idempotency::DEFAULT_IDEMPOTENCY_TTL_HOURS;
use crate::domain::invoice::REVIEW_THRESHOLD_CENTS;
use crate::error::Result;
use crate::infrastructure::Stores;
use crate::interfaces::http::InvoiceEndpoint;
use std::sync::Arc;

pub const DEFAULT_API_KEY_VERSION: &str = "v1";
/// Development-only secret used when none is configured.
pub const DEFAULT_API_KEY_SECRETS: &str = "v1:local-development-secret";

/// Runtime configuration for the whole pipeline. Every field has a
/// compiled default; binaries override them from flags and environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub relay: RelayConfig,
    pub consumer: ConsumerConfig,
    pub rate_limit: RateLimitConfig,
    pub idempotency_ttl: chrono::Duration,
    pub review_threshold_cents: i64,
    /// `version:secret` pairs, comma separated.
    pub api_key_secrets: String,
    pub api_key_active_version: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            relay: RelayConfig::default(),
            consumer: ConsumerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            idempotency_ttl: chrono::Duration::hours(DEFAULT_IDEMPOTENCY_TTL_HOURS),
            review_threshold_cents: REVIEW_THRESHOLD_CENTS,
            api_key_secrets: DEFAULT_API_KEY_SECRETS.to_string(),
            api_key_active_version: DEFAULT_API_KEY_VERSION.to_string(),
        }
    }
}

impl Settings {
    pub fn api_key_hasher(&self) -> Result<ApiKeyHasher> {
        ApiKeyHasher::parse(&self.api_key_secrets, &self.api_key_active_version)
    }

    /// The invoice write path over `stores`, with this configuration's
    /// limits, idempotency TTL, review threshold and API key secrets.
    pub fn invoice_endpoint(&self, stores: &Stores) -> Result<InvoiceEndpoint> {
        let accounts = AccountService::new(stores.ledger.clone(), Arc::new(self.api_key_hasher()?));
        let invoices = InvoiceService::new(stores.ledger.clone(), accounts)
            .with_review_threshold(self.review_threshold_cents);
        let gate = IdempotencyGate::new(stores.idempotency.clone()).with_ttl(self.idempotency_ttl);
        Ok(InvoiceEndpoint::new(
            Arc::new(RateLimiter::new(self.rate_limit)),
            gate,
            invoices,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_deployed_service() {
        let settings = Settings::default();
        assert_eq!(settings.relay.topic, "pending_transactions");
        assert_eq!(settings.consumer.topic, "transactions_result");
        assert_eq!(settings.consumer.dlq_topic, "transactions_result_dlq");
        assert_eq!(settings.consumer.retry.max_attempts, 3);
        assert_eq!(settings.rate_limit.requests_per_minute, 60);
        assert_eq!(settings.review_threshold_cents, 1_000_000);
        assert_eq!(settings.api_key_hasher().unwrap().active_version(), "v1");
    }

    #[test]
    fn test_active_version_must_have_secret() {
        let settings = Settings {
            api_key_active_version: "v9".into(),
            ..Settings::default()
        };
        assert!(settings.api_key_hasher().is_err());
    }
}
