//! Recurring club membership billing
//!
//! Runs on a schedule. Every membership whose billing date has passed is renewed
//! from the member's buzz balance when it covers the charge; otherwise the job
//! buys the shortfall (at least [`MIN_PURCHASE_UNITS`]) with an off-session card
//! charge and records it.
//!
//! The card path only writes the charge record. It does not move
//! `next_billing_at` or apply a pending downgrade; the invariant checker reports
//! memberships left in that state.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::events::{EventSink, JobEventBuilder, JobEventType, RECURRING_BILLING_JOB};
use crate::gateway::{ChargeRequest, PaymentGateway};
use crate::ledger::{Ledger, LedgerAccount};
use crate::models::{
    add_one_month, charge_idempotency_key, purchase_amount, units_to_cents, BillingUser,
    ChargePlan, DueMembership, NewMembershipCharge, MIN_PURCHASE_UNITS,
};
use crate::store::{LedgerRenewal, LedgerSettlement, MembershipStore};

/// Default cap on memberships processed at once
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Recurring billing settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurringBillingConfig {
    /// Memberships billed concurrently; never below 1
    pub max_concurrency: usize,
    /// Currency for card charges (ISO code, lowercase)
    pub currency: String,
}

impl Default for RecurringBillingConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            currency: "usd".to_string(),
        }
    }
}

impl RecurringBillingConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let max_concurrency = std::env::var("BILLING_MAX_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults.max_concurrency)
            .max(1);
        let currency = std::env::var("BILLING_CURRENCY")
            .ok()
            .map(|v| v.trim().to_lowercase())
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.currency);

        Self {
            max_concurrency,
            currency,
        }
    }
}

/// What happened to a single due membership
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipOutcome {
    /// No such user; retried next run
    UserNotFound,
    /// The ledger has no account for the user; retried next run
    LedgerAccountNotFound,
    /// Nothing to charge this cycle
    Free,
    /// Renewed from the buzz balance
    PaidWithLedger {
        transaction_id: String,
        next_billing_at: OffsetDateTime,
    },
    /// A concurrent run renewed it first
    AlreadyRenewed,
    /// The ledger renewal failed and access was revoked
    Revoked { reason: String },
    /// Shortfall bought with a card charge
    ChargedExternally {
        invoice_id: String,
        unit_amount_purchased: i64,
        recorded: bool,
    },
}

/// Result of processing one membership
#[derive(Debug)]
pub struct MembershipResult {
    pub membership_id: i32,
    pub user_id: i32,
    pub outcome: BillingResult<MembershipOutcome>,
}

/// A membership whose processing failed outright
#[derive(Debug, Clone, Serialize)]
pub struct FailedMembership {
    pub membership_id: i32,
    pub user_id: i32,
    pub error: String,
}

/// Summary of one recurring billing run
#[derive(Debug, Clone, Serialize)]
pub struct RecurringBillingReport {
    #[serde(with = "time::serde::rfc3339")]
    pub run_at: OffsetDateTime,
    pub selected: usize,
    pub paid_with_ledger: usize,
    pub charged_externally: usize,
    pub revoked: usize,
    pub already_renewed: usize,
    pub free: usize,
    pub skipped: usize,
    pub failures: Vec<FailedMembership>,
}

impl RecurringBillingReport {
    pub fn from_results(run_at: OffsetDateTime, results: &[MembershipResult]) -> Self {
        let mut report = Self {
            run_at,
            selected: results.len(),
            paid_with_ledger: 0,
            charged_externally: 0,
            revoked: 0,
            already_renewed: 0,
            free: 0,
            skipped: 0,
            failures: Vec::new(),
        };

        for result in results {
            match &result.outcome {
                Ok(MembershipOutcome::PaidWithLedger { .. }) => report.paid_with_ledger += 1,
                Ok(MembershipOutcome::ChargedExternally { .. }) => report.charged_externally += 1,
                Ok(MembershipOutcome::Revoked { .. }) => report.revoked += 1,
                Ok(MembershipOutcome::AlreadyRenewed) => report.already_renewed += 1,
                Ok(MembershipOutcome::Free) => report.free += 1,
                Ok(MembershipOutcome::UserNotFound)
                | Ok(MembershipOutcome::LedgerAccountNotFound) => report.skipped += 1,
                Err(e) => report.failures.push(FailedMembership {
                    membership_id: result.membership_id,
                    user_id: result.user_id,
                    error: e.to_string(),
                }),
            }
        }

        report
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    /// Log the run summary, then each failure
    pub fn log(&self) {
        tracing::info!(
            selected = self.selected,
            paid_with_ledger = self.paid_with_ledger,
            charged_externally = self.charged_externally,
            revoked = self.revoked,
            already_renewed = self.already_renewed,
            free = self.free,
            skipped = self.skipped,
            failed = self.failed(),
            "Recurring club billing cycle complete"
        );

        for failure in &self.failures {
            tracing::error!(
                membership_id = failure.membership_id,
                user_id = failure.user_id,
                error = %failure.error,
                "Failed to bill club membership"
            );
        }
    }
}

/// Bills due club memberships
pub struct RecurringBillingProcessor {
    store: Arc<dyn MembershipStore>,
    ledger: Arc<dyn Ledger>,
    gateway: Arc<dyn PaymentGateway>,
    events: Arc<dyn EventSink>,
    config: RecurringBillingConfig,
}

impl RecurringBillingProcessor {
    pub fn new(
        store: Arc<dyn MembershipStore>,
        ledger: Arc<dyn Ledger>,
        gateway: Arc<dyn PaymentGateway>,
        events: Arc<dyn EventSink>,
        config: RecurringBillingConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            gateway,
            events,
            config,
        }
    }

    pub fn config(&self) -> &RecurringBillingConfig {
        &self.config
    }

    /// Bill every membership due at `now`
    ///
    /// Memberships are processed concurrently, at most `max_concurrency` at a
    /// time. A failure in one never affects the others; it is reported in the
    /// returned summary. Only a failure to select memberships fails the run.
    pub async fn run(&self, now: OffsetDateTime) -> BillingResult<RecurringBillingReport> {
        let memberships = self.store.due_memberships(now).await?;

        tracing::info!(
            count = memberships.len(),
            max_concurrency = self.config.max_concurrency,
            "Processing due club memberships"
        );

        let tasks: Vec<_> = memberships
            .iter()
            .map(|membership| async move {
                MembershipResult {
                    membership_id: membership.id,
                    user_id: membership.user_id,
                    outcome: self.process_membership(membership, now).await,
                }
            })
            .collect();
        let results: Vec<MembershipResult> = stream::iter(tasks)
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        Ok(RecurringBillingReport::from_results(now, &results))
    }

    /// Bill a single membership
    pub async fn process_membership(
        &self,
        membership: &DueMembership,
        now: OffsetDateTime,
    ) -> BillingResult<MembershipOutcome> {
        let Some(user) = self.store.find_user(membership.user_id).await? else {
            self.log_event(JobEventType::Warning, "User not found", membership, None)
                .await;
            return Ok(MembershipOutcome::UserNotFound);
        };

        let Some(account) = self.ledger.get_account(membership.user_id).await? else {
            self.log_event(
                JobEventType::Warning,
                "Unable to get user's buzz account",
                membership,
                None,
            )
            .await;
            return Ok(MembershipOutcome::LedgerAccountNotFound);
        };

        let plan = membership.charge_plan();
        if plan.amount <= 0 {
            tracing::debug!(membership_id = membership.id, "Nothing to charge this cycle");
            return Ok(MembershipOutcome::Free);
        }

        if account.balance >= plan.amount {
            return self.pay_with_ledger(membership, &plan, now).await;
        }

        self.charge_externally(membership, &user, &account, &plan, now)
            .await
    }

    async fn pay_with_ledger(
        &self,
        membership: &DueMembership,
        plan: &ChargePlan,
        now: OffsetDateTime,
    ) -> BillingResult<MembershipOutcome> {
        let renewal = LedgerRenewal {
            membership_id: membership.id,
            user_id: membership.user_id,
            club_id: membership.club_id,
            amount: plan.amount,
            billed_at: membership.next_billing_at,
            next_billing_at: add_one_month(membership.next_billing_at),
            downgrade_tier_id: plan.downgrade_tier_id,
        };

        match self
            .store
            .renew_with_ledger(&renewal, self.ledger.as_ref(), now)
            .await?
        {
            LedgerSettlement::Renewed { transaction_id } => {
                tracing::info!(
                    membership_id = membership.id,
                    user_id = membership.user_id,
                    club_id = membership.club_id,
                    amount = plan.amount,
                    next_billing_at = %renewal.next_billing_at,
                    "Renewed club membership with buzz"
                );
                Ok(MembershipOutcome::PaidWithLedger {
                    transaction_id,
                    next_billing_at: renewal.next_billing_at,
                })
            }
            LedgerSettlement::AlreadyRenewed => {
                tracing::info!(
                    membership_id = membership.id,
                    "Club membership already renewed by another run"
                );
                Ok(MembershipOutcome::AlreadyRenewed)
            }
            LedgerSettlement::Revoked { error } => {
                self.log_event(
                    JobEventType::Error,
                    "Error paying with buzz",
                    membership,
                    Some(&error),
                )
                .await;
                Ok(MembershipOutcome::Revoked {
                    reason: error.to_string(),
                })
            }
        }
    }

    async fn charge_externally(
        &self,
        membership: &DueMembership,
        user: &BillingUser,
        account: &LedgerAccount,
        plan: &ChargePlan,
        now: OffsetDateTime,
    ) -> BillingResult<MembershipOutcome> {
        if user.customer_id.is_none() {
            self.log_event(
                JobEventType::Warning,
                "User is not a stripe customer",
                membership,
                None,
            )
            .await;
            self.store.expire_membership(membership.id, now).await?;
        }

        // Still attempted without a customer; the gateway rejects it and the
        // failure is reported for this membership only.
        let payment_methods = self
            .gateway
            .list_payment_methods(user.customer_id.as_deref())
            .await?;
        let default_method = payment_methods.into_iter().next();
        if default_method.is_none() {
            self.log_event(
                JobEventType::Warning,
                "User does not have a default payment method",
                membership,
                None,
            )
            .await;
        }

        let purchased = purchase_amount(plan.amount, account.balance);
        let amount_cents = units_to_cents(purchased);

        let metadata = HashMap::from([
            ("type".to_string(), "clubMembershipPayment".to_string()),
            ("unitAmount".to_string(), amount_cents.to_string()),
            ("buzzAmount".to_string(), purchased.to_string()),
            ("userId".to_string(), membership.user_id.to_string()),
            ("clubMembershipId".to_string(), membership.id.to_string()),
        ]);

        let charge = self
            .gateway
            .create_charge(&ChargeRequest {
                amount_cents,
                currency: self.config.currency.clone(),
                customer_id: user.customer_id.clone(),
                payment_method_id: default_method.map(|pm| pm.id),
                metadata,
                idempotency_key: charge_idempotency_key(
                    membership.id,
                    membership.next_billing_at,
                    purchased,
                ),
            })
            .await?;

        let recorded = self
            .store
            .record_charge(&NewMembershipCharge {
                user_id: membership.user_id,
                club_id: membership.club_id,
                club_tier_id: plan.charged_tier_id,
                invoice_id: charge.id.clone(),
                unit_amount: plan.amount,
                unit_amount_purchased: purchased,
                charged_at: now,
            })
            .await?;

        tracing::info!(
            membership_id = membership.id,
            user_id = membership.user_id,
            invoice_id = %charge.id,
            unit_amount = plan.amount,
            unit_amount_purchased = purchased,
            amount_cents = amount_cents,
            minimum_purchase = MIN_PURCHASE_UNITS,
            "Charged club membership shortfall to card"
        );

        Ok(MembershipOutcome::ChargedExternally {
            invoice_id: charge.id,
            unit_amount_purchased: purchased,
            recorded,
        })
    }

    /// Best-effort event with the membership as payload
    async fn log_event(
        &self,
        event_type: JobEventType,
        message: &str,
        membership: &DueMembership,
        error: Option<&BillingError>,
    ) {
        let mut builder = JobEventBuilder::new(RECURRING_BILLING_JOB, event_type)
            .message(message)
            .data(serde_json::to_value(membership).unwrap_or_default());
        if let Some(error) = error {
            builder = builder.field("error", error.to_string());
        }

        if let Err(e) = self.events.log_event(builder.build()).await {
            tracing::warn!(
                membership_id = membership.id,
                error = %e,
                "Failed to log recurring billing event"
            );
        }
    }
}
