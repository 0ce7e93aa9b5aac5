//! CRUD operations for [`Campaign`] and [`SequenceItem`] records.

use rusqlite::params;

use mailwave_shared::CampaignId;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Campaign, SequenceItem};
use crate::rows;

impl Database {
    // ------------------------------------------------------------------
    // Campaigns
    // ------------------------------------------------------------------

    pub fn create_campaign(&self, campaign: &Campaign) -> Result<()> {
        self.conn().execute(
            "INSERT INTO campaigns (id, user_id, product_url, name, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                campaign.id.to_string(),
                campaign.user_id.map(|u| u.to_string()),
                campaign.product_url,
                campaign.name,
                campaign.status.as_str(),
                campaign.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_campaign(&self, id: CampaignId) -> Result<Campaign> {
        self.conn()
            .query_row(
                "SELECT id, user_id, product_url, name, status, created_at
                 FROM campaigns
                 WHERE id = ?1",
                params![id.to_string()],
                row_to_campaign,
            )
            .map_err(StoreError::from_query)
    }

    // ------------------------------------------------------------------
    // Sequence items
    // ------------------------------------------------------------------

    pub fn insert_sequence_item(&self, item: &SequenceItem) -> Result<()> {
        self.conn().execute(
            "INSERT INTO email_sequences
                 (id, campaign_id, position, subject, body_text, body_html, email_type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                item.id.to_string(),
                item.campaign_id.to_string(),
                item.position,
                item.subject,
                item.body_text,
                item.body_html,
                item.email_type,
            ],
        )?;
        Ok(())
    }

    /// Sequence items of a campaign in position order.
    pub fn get_sequence_items(&self, campaign_id: CampaignId) -> Result<Vec<SequenceItem>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, campaign_id, position, subject, body_text, body_html, email_type
             FROM email_sequences
             WHERE campaign_id = ?1
             ORDER BY position ASC",
        )?;

        let rows = stmt.query_map(params![campaign_id.to_string()], row_to_sequence_item)?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn row_to_campaign(row: &rusqlite::Row<'_>) -> rusqlite::Result<Campaign> {
    Ok(Campaign {
        id: rows::parsed(row, 0)?,
        user_id: rows::parsed_opt(row, 1)?,
        product_url: row.get(2)?,
        name: row.get(3)?,
        status: rows::parsed(row, 4)?,
        created_at: rows::timestamp(row, 5)?,
    })
}

fn row_to_sequence_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<SequenceItem> {
    Ok(SequenceItem {
        id: rows::parsed(row, 0)?,
        campaign_id: rows::parsed(row, 1)?,
        position: row.get(2)?,
        subject: row.get(3)?,
        body_text: row.get(4)?,
        body_html: row.get(5)?,
        email_type: row.get(6)?,
    })
}
