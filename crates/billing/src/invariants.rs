//! Club billing invariants
//!
//! Read-only consistency checks over memberships and their charge records.
//! The recurring job can leave state that needs a human (a card charge that
//! did not advance the billing date, for example); these checks find it.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Memberships affected
    pub membership_ids: Vec<i32>,
    pub description: String,
    /// Extra context for whoever picks this up
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Members may be billed twice or not at all
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    pub fn from_violations(
        checked_at: OffsetDateTime,
        checks_run: usize,
        violations: Vec<InvariantViolation>,
    ) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }

    pub fn log(&self) {
        if self.healthy {
            tracing::info!(checks_run = self.checks_run, "Club billing invariants hold");
            return;
        }

        for violation in &self.violations {
            tracing::error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                membership_ids = ?violation.membership_ids,
                context = %violation.context,
                "{}",
                violation.description
            );
        }
        tracing::warn!(
            checks_run = self.checks_run,
            checks_failed = self.checks_failed,
            violations = self.violations.len(),
            "Club billing invariant violations found"
        );
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ChargedNotAdvancedRow {
    membership_id: i32,
    user_id: i32,
    club_id: i32,
    invoice_id: String,
    charged_at: OffsetDateTime,
    next_billing_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct ExpiredWithDowngradeRow {
    membership_id: i32,
    downgrade_club_tier_id: i32,
    expires_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct TierClubMismatchRow {
    charge_id: i32,
    invoice_id: String,
    club_id: i32,
    club_tier_id: i32,
    tier_club_id: i32,
    membership_id: Option<i32>,
}

/// Runs club billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_charged_not_advanced().await?);
        violations.extend(self.check_expired_with_pending_downgrade().await?);
        violations.extend(self.check_charge_tier_matches_club().await?);

        Ok(InvariantCheckSummary::from_violations(
            now,
            Self::available_checks().len(),
            violations,
        ))
    }

    /// An active membership was charged by card at or after its billing date,
    /// yet the billing date never moved. The next run will charge it again.
    async fn check_charged_not_advanced(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ChargedNotAdvancedRow> = sqlx::query_as(
            r#"
            SELECT
                m.id AS membership_id,
                m.user_id,
                m.club_id,
                ch.invoice_id,
                ch.charged_at,
                m.next_billing_at
            FROM club_memberships m
            JOIN club_membership_charges ch
              ON ch.user_id = m.user_id AND ch.club_id = m.club_id
            WHERE ch.charged_at >= m.next_billing_at
              AND m.cancelled_at IS NULL
              AND m.expires_at IS NULL
            ORDER BY m.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "charged_not_advanced".to_string(),
                membership_ids: vec![row.membership_id],
                description: format!(
                    "Membership {} was charged ({}) but next billing is still {}",
                    row.membership_id, row.invoice_id, row.next_billing_at
                ),
                context: serde_json::json!({
                    "user_id": row.user_id,
                    "club_id": row.club_id,
                    "invoice_id": row.invoice_id,
                    "charged_at": row.charged_at.unix_timestamp(),
                    "next_billing_at": row.next_billing_at.unix_timestamp(),
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// A revoked membership still carries a downgrade that will never apply
    async fn check_expired_with_pending_downgrade(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ExpiredWithDowngradeRow> = sqlx::query_as(
            r#"
            SELECT
                id AS membership_id,
                downgrade_club_tier_id,
                expires_at
            FROM club_memberships
            WHERE expires_at IS NOT NULL
              AND downgrade_club_tier_id IS NOT NULL
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "expired_with_pending_downgrade".to_string(),
                membership_ids: vec![row.membership_id],
                description: format!(
                    "Expired membership {} still has a pending downgrade to tier {}",
                    row.membership_id, row.downgrade_club_tier_id
                ),
                context: serde_json::json!({
                    "downgrade_club_tier_id": row.downgrade_club_tier_id,
                    "expires_at": row.expires_at.unix_timestamp(),
                }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    async fn check_charge_tier_matches_club(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<TierClubMismatchRow> = sqlx::query_as(
            r#"
            SELECT
                ch.id AS charge_id,
                ch.invoice_id,
                ch.club_id,
                ch.club_tier_id,
                t.club_id AS tier_club_id,
                m.id AS membership_id
            FROM club_membership_charges ch
            JOIN club_tiers t ON t.id = ch.club_tier_id
            LEFT JOIN club_memberships m
              ON m.user_id = ch.user_id AND m.club_id = ch.club_id
            WHERE t.club_id <> ch.club_id
            ORDER BY ch.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "charge_tier_matches_club".to_string(),
                membership_ids: row.membership_id.into_iter().collect(),
                description: format!(
                    "Charge {} is for tier {} of club {} but was recorded against club {}",
                    row.invoice_id, row.club_tier_id, row.tier_club_id, row.club_id
                ),
                context: serde_json::json!({
                    "charge_id": row.charge_id,
                    "invoice_id": row.invoice_id,
                    "club_tier_id": row.club_tier_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "charged_not_advanced" => self.check_charged_not_advanced().await,
            "expired_with_pending_downgrade" => self.check_expired_with_pending_downgrade().await,
            "charge_tier_matches_club" => self.check_charge_tier_matches_club().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "charged_not_advanced",
            "expired_with_pending_downgrade",
            "charge_tier_matches_club",
        ]
    }
}
