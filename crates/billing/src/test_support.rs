//! In-memory collaborators for billing tests

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::events::{EventSink, JobEvent, JobEventType};
use crate::gateway::{ChargeRequest, CreatedCharge, PaymentGateway, StoredPaymentMethod};
use crate::ledger::{Ledger, LedgerAccount, TransferReceipt, TransferRequest};
use crate::models::{BillingUser, ClubMembership, DowngradeTier, DueMembership, NewMembershipCharge};
use crate::recurring::{RecurringBillingConfig, RecurringBillingProcessor};
use crate::store::{LedgerRenewal, LedgerSettlement, MembershipStore};

// ============================================================================
// InMemoryStore
// ============================================================================

#[derive(Default)]
pub struct InMemoryStore {
    pub memberships: Mutex<HashMap<i32, ClubMembership>>,
    /// club id -> billing enabled
    pub clubs: Mutex<HashMap<i32, bool>>,
    pub tiers: Mutex<HashMap<i32, DowngradeTier>>,
    pub users: Mutex<HashMap<i32, BillingUser>>,
    pub charges: Mutex<Vec<NewMembershipCharge>>,
    /// Every user id passed to `find_user`
    pub user_lookups: Mutex<Vec<i32>>,
}

impl InMemoryStore {
    pub fn add_club(&self, club_id: i32, billing: bool) {
        self.clubs.lock().unwrap().insert(club_id, billing);
    }

    pub fn add_tier(&self, tier: DowngradeTier) {
        self.tiers.lock().unwrap().insert(tier.id, tier);
    }

    pub fn add_user(&self, user_id: i32, customer_id: Option<&str>) {
        self.users.lock().unwrap().insert(
            user_id,
            BillingUser {
                id: user_id,
                email: Some(format!("user{}@example.com", user_id)),
                customer_id: customer_id.map(str::to_string),
            },
        );
    }

    pub fn add_membership(&self, membership: ClubMembership) {
        self.memberships
            .lock()
            .unwrap()
            .insert(membership.id, membership);
    }

    pub fn membership(&self, id: i32) -> ClubMembership {
        self.memberships.lock().unwrap()[&id].clone()
    }

    pub fn charges(&self) -> Vec<NewMembershipCharge> {
        self.charges.lock().unwrap().clone()
    }

    pub fn user_lookups(&self) -> Vec<i32> {
        self.user_lookups.lock().unwrap().clone()
    }
}

#[async_trait]
impl MembershipStore for InMemoryStore {
    async fn due_memberships(&self, now: OffsetDateTime) -> BillingResult<Vec<DueMembership>> {
        let clubs = self.clubs.lock().unwrap();
        let tiers = self.tiers.lock().unwrap();
        let mut due: Vec<DueMembership> = self
            .memberships
            .lock()
            .unwrap()
            .values()
            .filter(|m| m.is_due(now, clubs.get(&m.club_id).copied().unwrap_or(false)))
            .map(|m| DueMembership {
                id: m.id,
                user_id: m.user_id,
                club_id: m.club_id,
                club_tier_id: m.club_tier_id,
                unit_amount: m.unit_amount,
                next_billing_at: m.next_billing_at,
                downgrade_tier: m
                    .downgrade_club_tier_id
                    .and_then(|id| tiers.get(&id).copied()),
            })
            .collect();
        due.sort_by_key(|m| m.id);
        Ok(due)
    }

    async fn find_user(&self, user_id: i32) -> BillingResult<Option<BillingUser>> {
        self.user_lookups.lock().unwrap().push(user_id);
        Ok(self.users.lock().unwrap().get(&user_id).cloned())
    }

    async fn renew_with_ledger(
        &self,
        renewal: &LedgerRenewal,
        ledger: &dyn Ledger,
        now: OffsetDateTime,
    ) -> BillingResult<LedgerSettlement> {
        let renewed = {
            let memberships = self.memberships.lock().unwrap();
            let Some(current) = memberships.get(&renewal.membership_id) else {
                return Ok(LedgerSettlement::AlreadyRenewed);
            };
            if current.next_billing_at != renewal.billed_at
                || current.cancelled_at.is_some()
                || current.expires_at.is_some()
                || current.billing_paused_at.is_some()
            {
                return Ok(LedgerSettlement::AlreadyRenewed);
            }

            let mut renewed = current.clone();
            renewed.next_billing_at = renewal.next_billing_at;
            if let Some(tier_id) = renewal.downgrade_tier_id {
                renewed.club_tier_id = tier_id;
            }
            renewed.downgrade_club_tier_id = None;
            renewed
        };

        // Staged changes only land if the transfer succeeds
        match ledger.create_transfer(&renewal.transfer()).await {
            Ok(receipt) => {
                self.add_membership(renewed);
                Ok(LedgerSettlement::Renewed {
                    transaction_id: receipt.transaction_id,
                })
            }
            Err(error) => {
                if let Some(m) = self
                    .memberships
                    .lock()
                    .unwrap()
                    .get_mut(&renewal.membership_id)
                {
                    m.expires_at = Some(now);
                }
                Ok(LedgerSettlement::Revoked { error })
            }
        }
    }

    async fn expire_membership(
        &self,
        membership_id: i32,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let mut memberships = self.memberships.lock().unwrap();
        let membership = memberships
            .get_mut(&membership_id)
            .ok_or_else(|| BillingError::NotFound(format!("Membership {}", membership_id)))?;
        membership.expires_at = Some(now);
        Ok(())
    }

    async fn record_charge(&self, charge: &NewMembershipCharge) -> BillingResult<bool> {
        let mut charges = self.charges.lock().unwrap();
        if charges.iter().any(|c| c.invoice_id == charge.invoice_id) {
            return Ok(false);
        }
        charges.push(charge.clone());
        Ok(true)
    }
}

// ============================================================================
// FakeLedger
// ============================================================================

#[derive(Default)]
pub struct FakeLedger {
    pub balances: Mutex<HashMap<i32, i64>>,
    pub transfers: Mutex<Vec<TransferRequest>>,
    /// Users whose transfers are rejected
    pub failing_users: Mutex<HashSet<i32>>,
    /// Artificial latency for account reads
    pub delay: Option<Duration>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeLedger {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn set_balance(&self, user_id: i32, balance: i64) {
        self.balances.lock().unwrap().insert(user_id, balance);
    }

    pub fn fail_transfers_for(&self, user_id: i32) {
        self.failing_users.lock().unwrap().insert(user_id);
    }

    pub fn transfers(&self) -> Vec<TransferRequest> {
        self.transfers.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Ledger for FakeLedger {
    async fn get_account(&self, user_id: i32) -> BillingResult<Option<LedgerAccount>> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let account = self
            .balances
            .lock()
            .unwrap()
            .get(&user_id)
            .map(|&balance| LedgerAccount {
                id: user_id,
                balance,
            });

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(account)
    }

    async fn create_transfer(&self, transfer: &TransferRequest) -> BillingResult<TransferReceipt> {
        if self
            .failing_users
            .lock()
            .unwrap()
            .contains(&transfer.from_account_id)
        {
            return Err(BillingError::InsufficientFunds);
        }

        let mut balances = self.balances.lock().unwrap();
        let balance = balances.entry(transfer.from_account_id).or_insert(0);
        *balance -= transfer.amount;

        let mut transfers = self.transfers.lock().unwrap();
        transfers.push(transfer.clone());
        Ok(TransferReceipt {
            transaction_id: format!("tx_{}", transfers.len()),
        })
    }
}

// ============================================================================
// FakeGateway
// ============================================================================

#[derive(Default)]
pub struct FakeGateway {
    pub payment_methods: Mutex<HashMap<String, Vec<StoredPaymentMethod>>>,
    pub charges: Mutex<Vec<ChargeRequest>>,
    /// Customers whose charges are declined
    pub declined_customers: Mutex<HashSet<String>>,
    /// idempotency key -> (payment intent id, amount in cents)
    intents: Mutex<HashMap<String, (String, i64)>>,
}

impl FakeGateway {
    pub fn add_card(&self, customer_id: &str, payment_method_id: &str) {
        self.payment_methods
            .lock()
            .unwrap()
            .entry(customer_id.to_string())
            .or_default()
            .push(StoredPaymentMethod {
                id: payment_method_id.to_string(),
                kind: "card".to_string(),
            });
    }

    pub fn decline(&self, customer_id: &str) {
        self.declined_customers
            .lock()
            .unwrap()
            .insert(customer_id.to_string());
    }

    pub fn charges(&self) -> Vec<ChargeRequest> {
        self.charges.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn list_payment_methods(
        &self,
        customer_id: Option<&str>,
    ) -> BillingResult<Vec<StoredPaymentMethod>> {
        let customer_id = customer_id.ok_or(BillingError::NoCustomer)?;
        Ok(self
            .payment_methods
            .lock()
            .unwrap()
            .get(customer_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_charge(&self, request: &ChargeRequest) -> BillingResult<CreatedCharge> {
        let customer_id = request
            .customer_id
            .as_deref()
            .ok_or(BillingError::NoCustomer)?;
        if self.declined_customers.lock().unwrap().contains(customer_id) {
            return Err(BillingError::StripeApi("Your card was declined.".to_string()));
        }

        self.charges.lock().unwrap().push(request.clone());

        // Replays with the same key return the original intent, unless the
        // parameters changed
        let mut intents = self.intents.lock().unwrap();
        let next_id = format!("pi_{}", intents.len() + 1);
        let (id, amount_cents) = intents
            .entry(request.idempotency_key.clone())
            .or_insert((next_id, request.amount_cents))
            .clone();
        if amount_cents != request.amount_cents {
            return Err(BillingError::StripeApi(
                "Keys for idempotent requests can only be used with the same parameters they were first used with.".to_string(),
            ));
        }

        Ok(CreatedCharge {
            id,
            status: "succeeded".to_string(),
        })
    }
}

// ============================================================================
// CapturingSink
// ============================================================================

#[derive(Default)]
pub struct CapturingSink {
    pub events: Mutex<Vec<JobEvent>>,
    /// Reject every event after capturing it
    pub fail: bool,
}

impl CapturingSink {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn messages(&self, event_type: JobEventType) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .filter_map(|e| e.message().map(str::to_string))
            .collect()
    }

    pub fn events(&self) -> Vec<JobEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for CapturingSink {
    async fn log_event(&self, event: JobEvent) -> BillingResult<()> {
        self.events.lock().unwrap().push(event);
        if self.fail {
            return Err(BillingError::Database("job_events unavailable".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

/// A processor wired to in-memory collaborators
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub ledger: Arc<FakeLedger>,
    pub gateway: Arc<FakeGateway>,
    pub events: Arc<CapturingSink>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::with_parts(FakeLedger::default(), CapturingSink::default())
    }
}

impl Harness {
    pub fn with_parts(ledger: FakeLedger, events: CapturingSink) -> Self {
        Self {
            store: Arc::new(InMemoryStore::default()),
            ledger: Arc::new(ledger),
            gateway: Arc::new(FakeGateway::default()),
            events: Arc::new(events),
        }
    }

    pub fn processor(&self) -> RecurringBillingProcessor {
        self.processor_with(RecurringBillingConfig::default())
    }

    pub fn processor_with(&self, config: RecurringBillingConfig) -> RecurringBillingProcessor {
        RecurringBillingProcessor::new(
            self.store.clone(),
            self.ledger.clone(),
            self.gateway.clone(),
            self.events.clone(),
            config,
        )
    }

    /// Seed a billable club, a user, and a due membership in one go
    pub fn seed_due_membership(
        &self,
        membership_id: i32,
        user_id: i32,
        unit_amount: i64,
        next_billing_at: OffsetDateTime,
    ) -> ClubMembership {
        let club_id = 100 + membership_id;
        self.store.add_club(club_id, true);
        let membership = ClubMembership {
            id: membership_id,
            user_id,
            club_id,
            club_tier_id: 1000 + membership_id,
            downgrade_club_tier_id: None,
            unit_amount,
            next_billing_at,
            cancelled_at: None,
            expires_at: None,
            billing_paused_at: None,
        };
        self.store.add_membership(membership.clone());
        membership
    }
}
