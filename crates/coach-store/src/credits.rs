use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info, instrument};

use coach_core::credits::{ConsumeReason, ConsumeResult, CreditStatus, Feature};
use coach_core::ids::UserId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::format_time;
use crate::stores::CreditsRpc;

/// Credit accounts with an append-only deduction ledger.
///
/// Every read or consume first rolls an account over to the current month,
/// restoring `remaining` to the monthly quota.
pub struct CreditRepo {
    db: Database,
    costs: HashMap<Feature, u32>,
}

impl CreditRepo {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            costs: HashMap::new(),
        }
    }

    /// Override the charge for one feature.
    pub fn with_cost(mut self, feature: Feature, cost: u32) -> Self {
        self.costs.insert(feature, cost);
        self
    }

    pub fn cost_of(&self, feature: Feature) -> u32 {
        self.costs
            .get(&feature)
            .copied()
            .unwrap_or_else(|| feature.default_cost())
    }

    /// Create the account if missing. Existing accounts are left untouched.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn ensure_account(&self, user_id: &UserId, monthly_quota: u32) -> Result<CreditStatus, StoreError> {
        let month = current_month();
        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO credit_accounts (user_id, remaining, monthly_quota, reset_month, updated_at)
                 VALUES (?1, ?2, ?2, ?3, ?4)",
                rusqlite::params![user_id.as_str(), monthly_quota, month, format_time(&Utc::now())],
            )?;
            if inserted > 0 {
                info!(monthly_quota, "credit account created");
            }
            read_status(conn, user_id, &month)?
                .ok_or_else(|| StoreError::NotFound(format!("credit account {user_id}")))
        })
    }

    pub fn status(&self, user_id: &UserId) -> Result<CreditStatus, StoreError> {
        let month = current_month();
        self.db.with_conn(|conn| {
            read_status(conn, user_id, &month)?
                .ok_or_else(|| StoreError::NotFound(format!("credit account {user_id}")))
        })
    }

    /// Check-then-deduct inside one transaction, so concurrent consumers can
    /// never push `remaining` below zero.
    #[instrument(skip(self), fields(user_id = %user_id, feature = %feature))]
    pub fn consume(
        &self,
        user_id: &UserId,
        feature: Feature,
        deduct: bool,
    ) -> Result<ConsumeResult, StoreError> {
        let cost = self.cost_of(feature);
        let month = current_month();
        self.db.with_tx(|tx| {
            let Some(status) = read_status(tx, user_id, &month)? else {
                return Ok(ConsumeResult::denied(ConsumeReason::NoAccount, cost, 0));
            };

            if status.remaining < cost {
                debug!(remaining = status.remaining, cost, "insufficient credits");
                return Ok(ConsumeResult::denied(
                    ConsumeReason::InsufficientCredits,
                    cost,
                    status.remaining,
                ));
            }
            if !deduct {
                return Ok(ConsumeResult::granted(cost, status.remaining));
            }

            let remaining = status.remaining - cost;
            let now = format_time(&Utc::now());
            tx.execute(
                "UPDATE credit_accounts SET remaining = ?2, updated_at = ?3 WHERE user_id = ?1",
                rusqlite::params![user_id.as_str(), remaining, now],
            )?;
            tx.execute(
                "INSERT INTO credit_ledger (user_id, feature, cost, remaining_after, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![user_id.as_str(), feature.to_string(), cost, remaining, now],
            )?;
            Ok(ConsumeResult::granted(cost, remaining))
        })
    }

    /// Number of ledger rows for a user.
    pub fn ledger_len(&self, user_id: &UserId) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM credit_ledger WHERE user_id = ?1",
                [user_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(n.max(0) as u64)
        })
    }
}

fn current_month() -> String {
    Utc::now().format("%Y-%m").to_string()
}

/// Read an account, resetting it first if its quota month is not `month`.
fn read_status(
    conn: &Connection,
    user_id: &UserId,
    month: &str,
) -> Result<Option<CreditStatus>, StoreError> {
    let row: Option<(i64, i64, String)> = conn
        .query_row(
            "SELECT remaining, monthly_quota, reset_month FROM credit_accounts WHERE user_id = ?1",
            [user_id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let Some((mut remaining, monthly_quota, reset_month)) = row else {
        return Ok(None);
    };

    if reset_month != month {
        conn.execute(
            "UPDATE credit_accounts SET remaining = monthly_quota, reset_month = ?2, updated_at = ?3
             WHERE user_id = ?1",
            rusqlite::params![user_id.as_str(), month, format_time(&Utc::now())],
        )?;
        info!(user_id = %user_id, from = %reset_month, to = %month, "monthly credit reset");
        remaining = monthly_quota;
    }

    Ok(Some(CreditStatus {
        user_id: user_id.clone(),
        remaining: u32::try_from(remaining.max(0)).unwrap_or(u32::MAX),
        monthly_quota: u32::try_from(monthly_quota.max(0)).unwrap_or(u32::MAX),
        reset_month: month.to_string(),
    }))
}

#[async_trait]
impl CreditsRpc for CreditRepo {
    async fn get_status(&self, user_id: &UserId) -> Result<CreditStatus, StoreError> {
        self.status(user_id)
    }

    async fn consume_for_feature(
        &self,
        user_id: &UserId,
        feature: Feature,
        deduct: bool,
    ) -> Result<ConsumeResult, StoreError> {
        self.consume(user_id, feature, deduct)
    }
}
