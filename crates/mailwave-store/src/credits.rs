//! The credit ledger.
//!
//! `total_credits` is the spendable balance. It is only ever decremented by a
//! single conditional `UPDATE`, so concurrent sends for the same user cannot
//! lose updates or push it below zero.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use mailwave_shared::UserId;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::CreditBalance;
use crate::rows;

impl Database {
    /// Overwrite the free/paid breakdown and recompute `total`. This is what
    /// the billing sync calls; the send pipeline never does.
    pub fn set_credit_balance(&self, user_id: UserId, free: i64, paid: i64) -> Result<()> {
        self.conn().execute(
            "INSERT INTO email_credits (user_id, free_credits, paid_credits, total_credits, updated_at)
             VALUES (?1, ?2, ?3, ?2 + ?3, ?4)
             ON CONFLICT(user_id) DO UPDATE SET
                 free_credits  = excluded.free_credits,
                 paid_credits  = excluded.paid_credits,
                 total_credits = excluded.total_credits,
                 updated_at    = excluded.updated_at",
            params![user_id.to_string(), free, paid, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Add purchased credits on top of whatever the user has.
    pub fn add_paid_credits(&self, user_id: UserId, amount: i64) -> Result<CreditBalance> {
        self.conn().execute(
            "INSERT INTO email_credits (user_id, paid_credits, total_credits, updated_at)
             VALUES (?1, ?2, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                 paid_credits  = paid_credits + excluded.paid_credits,
                 total_credits = total_credits + excluded.paid_credits,
                 updated_at    = excluded.updated_at",
            params![user_id.to_string(), amount, Utc::now().to_rfc3339()],
        )?;
        self.get_credit_balance(user_id)?.ok_or(StoreError::NotFound)
    }

    pub fn get_credit_balance(&self, user_id: UserId) -> Result<Option<CreditBalance>> {
        self.conn()
            .query_row(
                "SELECT user_id, free_credits, paid_credits, total_credits, used_this_month, updated_at
                 FROM email_credits WHERE user_id = ?1",
                params![user_id.to_string()],
                |row| {
                    Ok(CreditBalance {
                        user_id: rows::parsed(row, 0)?,
                        free: row.get(1)?,
                        paid: row.get(2)?,
                        total: row.get(3)?,
                        used_this_month: row.get(4)?,
                        updated_at: rows::timestamp(row, 5)?,
                    })
                },
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    /// Spendable credits; a user without a ledger row has none.
    pub fn available_credits(&self, user_id: UserId) -> Result<i64> {
        Ok(self
            .get_credit_balance(user_id)?
            .map(|b| b.total.max(0))
            .unwrap_or(0))
    }

    pub fn has_sufficient_credits(&self, user_id: UserId, required: i64) -> Result<bool> {
        Ok(self.available_credits(user_id)? >= required)
    }
}

/// Atomically spend one credit. Returns `false` (and changes nothing) when
/// the balance is already zero. Called inside the settle transaction.
pub(crate) fn deduct_one(conn: &Connection, user_id: UserId) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE email_credits
         SET total_credits   = total_credits - 1,
             used_this_month = used_this_month + 1,
             updated_at      = ?2
         WHERE user_id = ?1 AND total_credits > 0",
        params![user_id.to_string(), Utc::now().to_rfc3339()],
    )?;
    Ok(affected == 1)
}
