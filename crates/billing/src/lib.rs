// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Clubhouse Billing Module
//!
//! Recurring billing for paid club memberships.
//!
//! ## Features
//!
//! - **Ledger Renewals**: Pay the club from the member's buzz balance and move
//!   the billing date forward a month, atomically
//! - **Card Top-ups**: Buy the shortfall with an off-session Stripe charge
//! - **Pending Downgrades**: Charge and apply a requested lower tier at renewal
//! - **Revocation**: Expire memberships whose renewal fails
//! - **Job Events**: Structured, persisted events for every notable outcome
//! - **Invariants**: Read-only checks for state the job cannot repair itself

pub mod client;
pub mod error;
pub mod events;
pub mod gateway;
pub mod invariants;
pub mod ledger;
pub mod models;
pub mod recurring;
pub mod store;

#[cfg(test)]
mod test_support;

// Client
pub use client::{StripeClient, StripeConfig};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{
    EventSink, JobEvent, JobEventBuilder, JobEventLogger, JobEventType, RECURRING_BILLING_JOB,
};

// Gateway
pub use gateway::{ChargeRequest, CreatedCharge, PaymentGateway, StoredPaymentMethod, StripeGateway};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{HttpLedgerClient, Ledger, LedgerAccount, LedgerConfig, TransferRequest};

// Models
pub use models::{BillingUser, ClubMembership, DueMembership, NewMembershipCharge};

// Recurring
pub use recurring::{
    MembershipOutcome, RecurringBillingConfig, RecurringBillingProcessor, RecurringBillingReport,
};

// Store
pub use store::{MembershipStore, PgMembershipStore};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub recurring: Arc<RecurringBillingProcessor>,
    pub invariants: Arc<InvariantChecker>,
}

impl BillingService {
    /// Create a new billing service from environment variables
    ///
    /// `read_pool` may point at a replica; mutations and events always go
    /// through `write_pool`.
    pub fn from_env(read_pool: PgPool, write_pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let ledger = HttpLedgerClient::from_env()?;

        Ok(Self::new(
            stripe,
            ledger,
            read_pool,
            write_pool,
            RecurringBillingConfig::from_env(),
        ))
    }

    /// Create a new billing service with explicit collaborators
    pub fn new(
        stripe: StripeClient,
        ledger: HttpLedgerClient,
        read_pool: PgPool,
        write_pool: PgPool,
        config: RecurringBillingConfig,
    ) -> Self {
        let store = PgMembershipStore::new(read_pool.clone(), write_pool.clone());
        let recurring = RecurringBillingProcessor::new(
            Arc::new(store),
            Arc::new(ledger),
            Arc::new(StripeGateway::new(stripe)),
            Arc::new(JobEventLogger::new(write_pool)),
            config,
        );

        Self {
            recurring: Arc::new(recurring),
            invariants: Arc::new(InvariantChecker::new(read_pool)),
        }
    }
}
