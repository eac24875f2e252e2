//! Membership persistence
//!
//! Reads go to the read pool (a replica when one is configured); every mutation
//! runs in its own transaction on the write pool.

use async_trait::async_trait;
use sqlx::{Acquire, PgConnection, PgPool};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::ledger::{AccountType, Ledger, TransactionType, TransferReceipt, TransferRequest};
use crate::models::{
    billing_period_key, BillingUser, DowngradeTier, DueMembership, NewMembershipCharge,
};

/// A ledger-funded renewal of one membership
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRenewal {
    pub membership_id: i32,
    pub user_id: i32,
    pub club_id: i32,
    pub amount: i64,
    /// `next_billing_at` before this renewal
    pub billed_at: OffsetDateTime,
    pub next_billing_at: OffsetDateTime,
    pub downgrade_tier_id: Option<i32>,
}

impl LedgerRenewal {
    /// Transfer of the renewal amount from the member to the club
    pub fn transfer(&self) -> TransferRequest {
        TransferRequest {
            from_account_id: self.user_id,
            to_account_id: self.club_id,
            to_account_type: AccountType::Club,
            amount: self.amount,
            transaction_type: TransactionType::ClubMembership,
            details: serde_json::json!({ "clubMembershipId": self.membership_id }),
            external_transaction_id: Some(billing_period_key(
                self.membership_id,
                self.billed_at,
            )),
        }
    }
}

/// How a ledger renewal ended
#[derive(Debug)]
pub enum LedgerSettlement {
    /// Billing date advanced and the transfer went through
    Renewed { transaction_id: String },
    /// Another run already moved this membership on; nothing was written
    AlreadyRenewed,
    /// The renewal failed and the membership was expired instead
    Revoked { error: BillingError },
}

#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Memberships due for billing at `now`, with their pending downgrade tier
    async fn due_memberships(&self, now: OffsetDateTime) -> BillingResult<Vec<DueMembership>>;

    async fn find_user(&self, user_id: i32) -> BillingResult<Option<BillingUser>>;

    /// Advance the membership and pay the club from the ledger, atomically
    ///
    /// Any failure while advancing or transferring rolls the renewal back and
    /// expires the membership at `now` in the same transaction.
    async fn renew_with_ledger(
        &self,
        renewal: &LedgerRenewal,
        ledger: &dyn Ledger,
        now: OffsetDateTime,
    ) -> BillingResult<LedgerSettlement>;

    /// Revoke access by expiring the membership at `now`
    async fn expire_membership(&self, membership_id: i32, now: OffsetDateTime)
        -> BillingResult<()>;

    /// Write a charge audit record; `false` if one already exists for the invoice
    async fn record_charge(&self, charge: &NewMembershipCharge) -> BillingResult<bool>;
}

/// Row type for the due membership query
#[derive(Debug, sqlx::FromRow)]
struct DueMembershipRow {
    id: i32,
    user_id: i32,
    club_id: i32,
    club_tier_id: i32,
    unit_amount: i64,
    next_billing_at: OffsetDateTime,
    downgrade_tier_id: Option<i32>,
    downgrade_unit_amount: Option<i64>,
}

impl From<DueMembershipRow> for DueMembership {
    fn from(row: DueMembershipRow) -> Self {
        let downgrade_tier = match (row.downgrade_tier_id, row.downgrade_unit_amount) {
            (Some(id), Some(unit_amount)) => Some(DowngradeTier { id, unit_amount }),
            _ => None,
        };

        DueMembership {
            id: row.id,
            user_id: row.user_id,
            club_id: row.club_id,
            club_tier_id: row.club_tier_id,
            unit_amount: row.unit_amount,
            next_billing_at: row.next_billing_at,
            downgrade_tier,
        }
    }
}

/// Postgres-backed membership store
#[derive(Clone)]
pub struct PgMembershipStore {
    read: PgPool,
    write: PgPool,
}

impl PgMembershipStore {
    pub fn new(read: PgPool, write: PgPool) -> Self {
        Self { read, write }
    }

    /// Store that reads and writes through the same pool
    pub fn single(pool: PgPool) -> Self {
        Self::new(pool.clone(), pool)
    }

    async fn expire(
        conn: &mut PgConnection,
        membership_id: i32,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        sqlx::query("UPDATE club_memberships SET expires_at = $2 WHERE id = $1")
            .bind(membership_id)
            .bind(now)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// `None` when the membership was no longer in the state this run selected
    async fn advance_and_transfer(
        conn: &mut PgConnection,
        renewal: &LedgerRenewal,
        ledger: &dyn Ledger,
    ) -> BillingResult<Option<TransferReceipt>> {
        let updated = sqlx::query(
            r#"
            UPDATE club_memberships SET
                next_billing_at = $2,
                club_tier_id = COALESCE($3, club_tier_id),
                downgrade_club_tier_id = NULL
            WHERE id = $1
              AND next_billing_at = $4
              AND cancelled_at IS NULL
              AND expires_at IS NULL
              AND billing_paused_at IS NULL
            "#,
        )
        .bind(renewal.membership_id)
        .bind(renewal.next_billing_at)
        .bind(renewal.downgrade_tier_id)
        .bind(renewal.billed_at)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if updated == 0 {
            return Ok(None);
        }

        let receipt = ledger.create_transfer(&renewal.transfer()).await?;
        Ok(Some(receipt))
    }
}

#[async_trait]
impl MembershipStore for PgMembershipStore {
    async fn due_memberships(&self, now: OffsetDateTime) -> BillingResult<Vec<DueMembership>> {
        let rows: Vec<DueMembershipRow> = sqlx::query_as(
            r#"
            SELECT
                m.id,
                m.user_id,
                m.club_id,
                m.club_tier_id,
                m.unit_amount,
                m.next_billing_at,
                d.id AS downgrade_tier_id,
                d.unit_amount AS downgrade_unit_amount
            FROM club_memberships m
            JOIN clubs c ON c.id = m.club_id
            LEFT JOIN club_tiers d ON d.id = m.downgrade_club_tier_id
            WHERE m.next_billing_at <= $1
              AND m.cancelled_at IS NULL
              AND m.expires_at IS NULL
              AND m.billing_paused_at IS NULL
              AND m.unit_amount > 0
              AND c.billing = TRUE
            "#,
        )
        .bind(now)
        .fetch_all(&self.read)
        .await?;

        Ok(rows.into_iter().map(DueMembership::from).collect())
    }

    async fn find_user(&self, user_id: i32) -> BillingResult<Option<BillingUser>> {
        let user = sqlx::query_as::<_, BillingUser>(
            "SELECT id, email, customer_id FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.read)
        .await?;

        Ok(user)
    }

    async fn renew_with_ledger(
        &self,
        renewal: &LedgerRenewal,
        ledger: &dyn Ledger,
        now: OffsetDateTime,
    ) -> BillingResult<LedgerSettlement> {
        let mut tx = self.write.begin().await?;

        // The renewal runs in a savepoint so a failed transfer can be undone
        // without giving up the transaction that records the expiry.
        let mut savepoint = tx.begin().await?;
        let attempt = Self::advance_and_transfer(&mut savepoint, renewal, ledger).await;

        match attempt {
            Ok(Some(receipt)) => {
                savepoint.commit().await?;
                tx.commit().await?;
                Ok(LedgerSettlement::Renewed {
                    transaction_id: receipt.transaction_id,
                })
            }
            Ok(None) => {
                savepoint.rollback().await?;
                tx.commit().await?;
                Ok(LedgerSettlement::AlreadyRenewed)
            }
            Err(error) => {
                savepoint.rollback().await?;
                Self::expire(&mut tx, renewal.membership_id, now).await?;
                tx.commit().await?;
                Ok(LedgerSettlement::Revoked { error })
            }
        }
    }

    async fn expire_membership(
        &self,
        membership_id: i32,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let mut tx = self.write.begin().await?;
        Self::expire(&mut tx, membership_id, now).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn record_charge(&self, charge: &NewMembershipCharge) -> BillingResult<bool> {
        let mut tx = self.write.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO club_membership_charges (
                user_id,
                club_id,
                club_tier_id,
                invoice_id,
                unit_amount,
                unit_amount_purchased,
                charged_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (invoice_id) DO NOTHING
            "#,
        )
        .bind(charge.user_id)
        .bind(charge.club_id)
        .bind(charge.club_tier_id)
        .bind(&charge.invoice_id)
        .bind(charge.unit_amount)
        .bind(charge.unit_amount_purchased)
        .bind(charge.charged_at)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        tx.commit().await?;

        if !inserted {
            tracing::warn!(
                invoice_id = %charge.invoice_id,
                user_id = charge.user_id,
                club_id = charge.club_id,
                "Charge already recorded for invoice"
            );
        }

        Ok(inserted)
    }
}
