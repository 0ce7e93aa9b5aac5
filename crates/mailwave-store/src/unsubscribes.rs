//! The opt-out registry.

use std::collections::HashSet;

use chrono::Utc;
use rusqlite::params_from_iter;
use rusqlite::types::Value;

use mailwave_shared::unsubscribe::normalize_email;
use mailwave_shared::CampaignId;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Unsubscribe;
use crate::rows;

/// Emails per membership query; keeps well under SQLite's variable limit.
const LOOKUP_CHUNK: usize = 500;

impl Database {
    /// Record an opt-out. Returns `false` if an identical entry (same email
    /// and campaign scope) already exists.
    pub fn add_unsubscribe(
        &self,
        email: &str,
        campaign_id: Option<CampaignId>,
        reason: Option<&str>,
    ) -> Result<bool> {
        let email = normalize_email(email);
        let campaign = campaign_id.map(|c| c.to_string());

        let affected = self.conn().execute(
            "INSERT INTO unsubscribes (id, email, campaign_id, reason, created_at)
             SELECT ?1, ?2, ?3, ?4, ?5
             WHERE NOT EXISTS (
                 SELECT 1 FROM unsubscribes WHERE email = ?2 AND campaign_id IS ?3
             )",
            rusqlite::params![
                uuid::Uuid::new_v4().to_string(),
                email,
                campaign,
                reason,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(affected > 0)
    }

    /// Which of `emails` are suppressed for `campaign_id`: entries scoped to
    /// that campaign plus global entries. Result is normalized.
    pub fn unsubscribed_among(
        &self,
        campaign_id: CampaignId,
        emails: &[&str],
    ) -> Result<HashSet<String>> {
        let mut found = HashSet::new();
        let normalized: Vec<String> = emails.iter().map(|e| normalize_email(e)).collect();

        for chunk in normalized.chunks(LOOKUP_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT DISTINCT email FROM unsubscribes
                 WHERE (campaign_id IS NULL OR campaign_id = ?1)
                   AND email IN ({placeholders})"
            );
            let mut stmt = self.conn().prepare(&sql)?;

            let mut bind: Vec<Value> = Vec::with_capacity(chunk.len() + 1);
            bind.push(Value::Text(campaign_id.to_string()));
            bind.extend(chunk.iter().cloned().map(Value::Text));

            let rows = stmt.query_map(params_from_iter(bind), |row| row.get::<_, String>(0))?;
            for row in rows {
                found.insert(row?);
            }
        }

        Ok(found)
    }

    pub fn list_unsubscribes(&self, email: &str) -> Result<Vec<Unsubscribe>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, email, campaign_id, reason, created_at
             FROM unsubscribes WHERE email = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([normalize_email(email)], |row| {
            Ok(Unsubscribe {
                id: rows::parsed(row, 0)?,
                email: row.get(1)?,
                campaign_id: rows::parsed_opt(row, 2)?,
                reason: row.get(3)?,
                created_at: rows::timestamp(row, 4)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }
}
