//! Stripe client wrapper

use stripe::Client;

use crate::error::{BillingError, BillingResult};

/// Stripe configuration
#[derive(Clone)]
pub struct StripeConfig {
    pub secret_key: String,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;

        if secret_key.trim().is_empty() {
            return Err(BillingError::Config(
                "STRIPE_SECRET_KEY is empty".to_string(),
            ));
        }

        Ok(Self { secret_key })
    }

    /// Test-mode keys start with `sk_test_` or `rk_test_`
    pub fn is_test_mode(&self) -> bool {
        self.secret_key.starts_with("sk_test_") || self.secret_key.starts_with("rk_test_")
    }
}

// Debug implementation that doesn't expose the secret key
impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("is_test_mode", &self.is_test_mode())
            .finish_non_exhaustive()
    }
}

/// Shared Stripe API client
#[derive(Clone)]
pub struct StripeClient {
    inner: Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = Client::new(config.secret_key.clone());
        Self { inner, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &Client {
        &self.inner
    }

    /// Client whose requests carry the given idempotency key
    pub fn idempotent(&self, key: impl Into<String>) -> Client {
        self.inner
            .clone()
            .with_strategy(stripe::RequestStrategy::Idempotent(key.into()))
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
