//! Club membership billing model
//!
//! Amounts are integer ledger units ("buzz"). One cent of the card currency buys
//! ten units.

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

/// Smallest top-up bought through the card gateway, in ledger units
pub const MIN_PURCHASE_UNITS: i64 = 5000;

/// Ledger units per minor currency unit (cent)
pub const UNITS_PER_CENT: i64 = 10;

/// A tier the member has asked to move to at the next renewal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DowngradeTier {
    pub id: i32,
    pub unit_amount: i64,
}

/// Full membership row, as stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ClubMembership {
    pub id: i32,
    pub user_id: i32,
    pub club_id: i32,
    pub club_tier_id: i32,
    pub downgrade_club_tier_id: Option<i32>,
    pub unit_amount: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub next_billing_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancelled_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub billing_paused_at: Option<OffsetDateTime>,
}

impl ClubMembership {
    /// Whether the membership should be billed at `now`
    ///
    /// `club_billing` is the owning club's billing flag.
    pub fn is_due(&self, now: OffsetDateTime, club_billing: bool) -> bool {
        club_billing
            && self.next_billing_at <= now
            && self.cancelled_at.is_none()
            && self.expires_at.is_none()
            && self.billing_paused_at.is_none()
            && self.unit_amount > 0
    }
}

/// A membership selected for billing, joined with its pending downgrade tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DueMembership {
    pub id: i32,
    pub user_id: i32,
    pub club_id: i32,
    pub club_tier_id: i32,
    pub unit_amount: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub next_billing_at: OffsetDateTime,
    pub downgrade_tier: Option<DowngradeTier>,
}

impl DueMembership {
    /// What this renewal costs and which tier it pays for
    pub fn charge_plan(&self) -> ChargePlan {
        match self.downgrade_tier {
            Some(tier) => ChargePlan {
                amount: tier.unit_amount,
                downgrade_tier_id: Some(tier.id),
                charged_tier_id: tier.id,
            },
            None => ChargePlan {
                amount: self.unit_amount,
                downgrade_tier_id: None,
                charged_tier_id: self.club_tier_id,
            },
        }
    }
}

/// Effective charge for one billing cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargePlan {
    pub amount: i64,
    pub downgrade_tier_id: Option<i32>,
    pub charged_tier_id: i32,
}

/// The parts of a user the billing job reads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct BillingUser {
    pub id: i32,
    pub email: Option<String>,
    pub customer_id: Option<String>,
}

/// Audit record for a card charge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMembershipCharge {
    pub user_id: i32,
    pub club_id: i32,
    pub club_tier_id: i32,
    pub invoice_id: String,
    pub unit_amount: i64,
    pub unit_amount_purchased: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub charged_at: OffsetDateTime,
}

/// Units to buy through the card gateway when the ledger balance falls short
pub fn purchase_amount(charge_amount: i64, balance: i64) -> i64 {
    (charge_amount - balance).max(MIN_PURCHASE_UNITS)
}

/// Convert ledger units to cents, rounding up to a whole cent
pub fn units_to_cents(units: i64) -> i64 {
    if units <= 0 {
        return 0;
    }
    (units + UNITS_PER_CENT - 1) / UNITS_PER_CENT
}

/// Idempotency key for one membership's billing period
///
/// Stable across retries until `next_billing_at` moves, so both the ledger
/// transfer and the card charge can be replayed safely.
pub fn billing_period_key(membership_id: i32, billed_at: OffsetDateTime) -> String {
    format!(
        "club-membership-{}-{}",
        membership_id,
        billed_at.unix_timestamp()
    )
}

/// Idempotency key for a card top-up in one billing period
///
/// Carries the purchased amount so a retry after the balance moves is a new
/// request rather than a reused key with different parameters.
pub fn charge_idempotency_key(
    membership_id: i32,
    billed_at: OffsetDateTime,
    purchased: i64,
) -> String {
    format!("{}-{}", billing_period_key(membership_id, billed_at), purchased)
}

/// Same wall-clock time one calendar month later
///
/// The day of month is clamped to the length of the target month.
pub fn add_one_month(at: OffsetDateTime) -> OffsetDateTime {
    let date = at.date();
    let (year, month) = match date.month() {
        time::Month::December => (date.year() + 1, time::Month::January),
        month => (date.year(), month.next()),
    };

    (1..=date.day())
        .rev()
        .find_map(|day| Date::from_calendar_date(year, month, day).ok())
        .map(|next| at.replace_date(next))
        .unwrap_or(at)
}
