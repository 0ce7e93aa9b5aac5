//! Users, plan tiers and API tokens.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use mailwave_shared::{PlanTier, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::User;
use crate::rows;

impl Database {
    pub fn create_user(&self, user: &User) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (id, email, plan, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                user.id.to_string(),
                user.email,
                user.plan.as_str(),
                user.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: UserId) -> Result<User> {
        self.conn()
            .query_row(
                "SELECT id, email, plan, created_at FROM users WHERE id = ?1",
                params![id.to_string()],
                row_to_user,
            )
            .map_err(StoreError::from_query)
    }

    /// Billing webhooks call this when a subscription changes.
    pub fn set_user_plan(&self, id: UserId, plan: PlanTier) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE users SET plan = ?1 WHERE id = ?2",
            params![plan.as_str(), id.to_string()],
        )?;
        Ok(affected > 0)
    }

    // ------------------------------------------------------------------
    // API tokens
    // ------------------------------------------------------------------

    /// Register a token digest for `user_id`. The clear token is never stored.
    pub fn insert_api_token(&self, token_hash: &str, user_id: UserId) -> Result<()> {
        self.conn().execute(
            "INSERT INTO api_tokens (token_hash, user_id, created_at) VALUES (?1, ?2, ?3)",
            params![token_hash, user_id.to_string(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Resolve a token digest to its owner.
    pub fn user_for_token_hash(&self, token_hash: &str) -> Result<Option<UserId>> {
        self.conn()
            .query_row(
                "SELECT user_id FROM api_tokens WHERE token_hash = ?1",
                params![token_hash],
                |row| rows::parsed::<UserId>(row, 0),
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: rows::parsed(row, 0)?,
        email: row.get(1)?,
        plan: rows::parsed(row, 2)?,
        created_at: rows::timestamp(row, 3)?,
    })
}
