//! Card payment gateway
//!
//! Off-session charges against a customer's saved payment method. The Stripe
//! implementation sends every charge with an idempotency key so a replayed
//! billing attempt returns the original payment intent instead of charging twice.

use std::collections::HashMap;

use async_trait::async_trait;
use stripe::{
    CreatePaymentIntent, CreatePaymentIntentAutomaticPaymentMethods,
    CreatePaymentIntentAutomaticPaymentMethodsAllowRedirects, Currency, CustomerId,
    ListPaymentMethods, PaymentIntent, PaymentIntentOffSession, PaymentMethod, PaymentMethodId,
};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// A saved payment method on the customer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPaymentMethod {
    pub id: String,
    pub kind: String,
}

/// An off-session charge to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeRequest {
    /// Amount in the currency's minor unit
    pub amount_cents: i64,
    pub currency: String,
    pub customer_id: Option<String>,
    pub payment_method_id: Option<String>,
    pub metadata: HashMap<String, String>,
    pub idempotency_key: String,
}

/// A charge the gateway accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedCharge {
    pub id: String,
    pub status: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Saved payment methods, default first
    async fn list_payment_methods(
        &self,
        customer_id: Option<&str>,
    ) -> BillingResult<Vec<StoredPaymentMethod>>;

    /// Create and confirm a charge synchronously
    async fn create_charge(&self, request: &ChargeRequest) -> BillingResult<CreatedCharge>;
}

/// Stripe payment intents
#[derive(Clone)]
pub struct StripeGateway {
    stripe: StripeClient,
}

impl StripeGateway {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }
}

fn parse_customer_id(customer_id: Option<&str>) -> BillingResult<CustomerId> {
    customer_id
        .ok_or(BillingError::NoCustomer)?
        .parse()
        .map_err(|e| BillingError::InvalidInput(format!("Invalid customer ID: {}", e)))
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn list_payment_methods(
        &self,
        customer_id: Option<&str>,
    ) -> BillingResult<Vec<StoredPaymentMethod>> {
        let customer = parse_customer_id(customer_id)?;

        let mut params = ListPaymentMethods::new();
        params.customer = Some(customer);

        let methods = PaymentMethod::list(self.stripe.inner(), &params).await?;

        Ok(methods
            .data
            .into_iter()
            .map(|pm| StoredPaymentMethod {
                id: pm.id.to_string(),
                kind: format!("{:?}", pm.type_).to_lowercase(),
            })
            .collect())
    }

    async fn create_charge(&self, request: &ChargeRequest) -> BillingResult<CreatedCharge> {
        let customer = parse_customer_id(request.customer_id.as_deref())?;
        let currency: Currency = request.currency.parse().map_err(|_| {
            BillingError::InvalidInput(format!("Unsupported currency '{}'", request.currency))
        })?;
        let payment_method = request
            .payment_method_id
            .as_deref()
            .map(|id| id.parse::<PaymentMethodId>())
            .transpose()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid payment method ID: {}", e)))?;

        let mut params = CreatePaymentIntent::new(request.amount_cents, currency);
        params.customer = Some(customer);
        params.payment_method = payment_method;
        params.off_session = Some(PaymentIntentOffSession::Exists(true));
        params.confirm = Some(true);
        params.automatic_payment_methods = Some(CreatePaymentIntentAutomaticPaymentMethods {
            allow_redirects: Some(CreatePaymentIntentAutomaticPaymentMethodsAllowRedirects::Never),
            enabled: true,
        });
        params.metadata = Some(request.metadata.clone());

        let client = self.stripe.idempotent(request.idempotency_key.clone());
        let intent = PaymentIntent::create(&client, params).await?;

        tracing::info!(
            payment_intent_id = %intent.id,
            amount_cents = request.amount_cents,
            currency = %request.currency,
            status = %intent.status.as_str(),
            "Created off-session payment intent"
        );

        Ok(CreatedCharge {
            id: intent.id.to_string(),
            status: intent.status.as_str().to_string(),
        })
    }
}
