//! Send queue persistence.
//!
//! Status changes are conditional on the current state so a queue never moves
//! backwards, and counters are bumped in place so concurrent workers never
//! overwrite each other.

use chrono::Utc;
use rusqlite::{params, Connection};

use mailwave_shared::{CampaignId, Outcome, QueueId, QueueStatus};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::SendQueue;
use crate::rows;

const QUEUE_COLUMNS: &str = "id, campaign_id, user_id, total_emails, emails_sent, emails_failed,
                             status, created_at, started_at, completed_at";

impl Database {
    pub fn create_send_queue(&self, queue: &SendQueue) -> Result<()> {
        self.conn().execute(
            "INSERT INTO send_queues
                 (id, campaign_id, user_id, total_emails, emails_sent, emails_failed,
                  status, created_at, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                queue.id.to_string(),
                queue.campaign_id.to_string(),
                queue.user_id.to_string(),
                queue.total_emails,
                queue.emails_sent,
                queue.emails_failed,
                queue.status.as_str(),
                queue.created_at.to_rfc3339(),
                queue.started_at.map(|t| t.to_rfc3339()),
                queue.completed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn get_send_queue(&self, id: QueueId) -> Result<SendQueue> {
        self.conn()
            .query_row(
                &format!("SELECT {QUEUE_COLUMNS} FROM send_queues WHERE id = ?1"),
                params![id.to_string()],
                row_to_queue,
            )
            .map_err(StoreError::from_query)
    }

    /// `pending -> processing`. Returns `false` if the queue was not pending.
    pub fn mark_queue_processing(&self, id: QueueId) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE send_queues
             SET status = ?1, started_at = COALESCE(started_at, ?2)
             WHERE id = ?3 AND status = ?4",
            params![
                QueueStatus::Processing.as_str(),
                Utc::now().to_rfc3339(),
                id.to_string(),
                QueueStatus::Pending.as_str(),
            ],
        )?;
        Ok(affected > 0)
    }

    /// Move a queue to `completed` or `failed`. Counters only ever grow: the
    /// stored value wins if it is already larger than the one passed in.
    /// Returns `false` if the queue was already terminal.
    pub fn mark_queue_terminal(
        &self,
        id: QueueId,
        status: QueueStatus,
        sent: i64,
        failed: i64,
    ) -> Result<bool> {
        debug_assert!(status.is_terminal());

        let allowed = QueueStatus::predecessors(status);
        let placeholders: Vec<String> = (0..allowed.len()).map(|i| format!("?{}", i + 6)).collect();
        let sql = format!(
            "UPDATE send_queues
             SET status = ?1,
                 completed_at = ?2,
                 emails_sent = MIN(total_emails, MAX(emails_sent, ?3)),
                 emails_failed = MIN(total_emails - MIN(total_emails, MAX(emails_sent, ?3)),
                                     MAX(emails_failed, ?4))
             WHERE id = ?5 AND status IN ({})",
            placeholders.join(", ")
        );

        let mut bind: Vec<rusqlite::types::Value> = vec![
            status.as_str().to_string().into(),
            Utc::now().to_rfc3339().into(),
            sent.into(),
            failed.into(),
            id.to_string().into(),
        ];
        bind.extend(allowed.iter().map(|s| s.as_str().to_string().into()));

        let affected = self
            .conn()
            .execute(&sql, rusqlite::params_from_iter(bind))?;
        Ok(affected > 0)
    }

    /// Queues that have not reached a terminal state, oldest first.
    pub fn list_unfinished_queues(&self) -> Result<Vec<SendQueue>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {QUEUE_COLUMNS} FROM send_queues
             WHERE status IN (?1, ?2)
             ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map(
            params![QueueStatus::Pending.as_str(), QueueStatus::Processing.as_str()],
            row_to_queue,
        )?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn list_send_queues_for_campaign(&self, campaign_id: CampaignId) -> Result<Vec<SendQueue>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {QUEUE_COLUMNS} FROM send_queues
             WHERE campaign_id = ?1
             ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map(params![campaign_id.to_string()], row_to_queue)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }
}

/// Bump `emails_sent` or `emails_failed` by one. Refuses (returns `false`)
/// once `sent + failed` has reached `total_emails`.
pub(crate) fn bump_outcome(conn: &Connection, id: QueueId, outcome: Outcome) -> Result<bool> {
    let column = match outcome {
        Outcome::Sent => "emails_sent",
        Outcome::Failed => "emails_failed",
    };
    let affected = conn.execute(
        &format!(
            "UPDATE send_queues SET {column} = {column} + 1
             WHERE id = ?1 AND emails_sent + emails_failed < total_emails"
        ),
        params![id.to_string()],
    )?;
    Ok(affected > 0)
}

fn row_to_queue(row: &rusqlite::Row<'_>) -> rusqlite::Result<SendQueue> {
    Ok(SendQueue {
        id: rows::parsed(row, 0)?,
        campaign_id: rows::parsed(row, 1)?,
        user_id: rows::parsed(row, 2)?,
        total_emails: row.get(3)?,
        emails_sent: row.get(4)?,
        emails_failed: row.get(5)?,
        status: rows::parsed(row, 6)?,
        created_at: rows::timestamp(row, 7)?,
        started_at: rows::timestamp_opt(row, 8)?,
        completed_at: rows::timestamp_opt(row, 9)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::database::tests::open_temp;
    use crate::models::{Campaign, User};
    use mailwave_shared::{CampaignStatus, PlanTier, UserId};

    /// A user, a campaign and a pending queue of `total` emails.
    pub(crate) fn seed_queue(db: &Database, total: i64) -> SendQueue {
        let user = User {
            id: UserId::new(),
            email: "q@example.com".into(),
            plan: PlanTier::Pro,
            created_at: Utc::now(),
        };
        db.create_user(&user).unwrap();
        let campaign = Campaign {
            id: CampaignId::new(),
            user_id: Some(user.id),
            product_url: "https://example.com".into(),
            name: None,
            status: CampaignStatus::Completed,
            created_at: Utc::now(),
        };
        db.create_campaign(&campaign).unwrap();
        let queue = SendQueue {
            id: QueueId::new(),
            campaign_id: campaign.id,
            user_id: user.id,
            total_emails: total,
            emails_sent: 0,
            emails_failed: 0,
            status: QueueStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        db.create_send_queue(&queue).unwrap();
        queue
    }

    #[test]
    fn lifecycle_moves_forward_only() {
        let (_dir, db) = open_temp();
        let queue = seed_queue(&db, 2);

        assert!(db.mark_queue_processing(queue.id).unwrap());
        assert!(!db.mark_queue_processing(queue.id).unwrap());
        let loaded = db.get_send_queue(queue.id).unwrap();
        assert_eq!(loaded.status, QueueStatus::Processing);
        assert!(loaded.started_at.is_some());

        assert!(db
            .mark_queue_terminal(queue.id, QueueStatus::Completed, 0, 0)
            .unwrap());
        assert!(!db
            .mark_queue_terminal(queue.id, QueueStatus::Failed, 0, 0)
            .unwrap());
        assert!(!db.mark_queue_processing(queue.id).unwrap());
        assert_eq!(
            db.get_send_queue(queue.id).unwrap().status,
            QueueStatus::Completed
        );
    }

    #[test]
    fn counters_never_exceed_total() {
        let (_dir, db) = open_temp();
        let queue = seed_queue(&db, 3);

        assert!(bump_outcome(db.conn(), queue.id, Outcome::Sent).unwrap());
        assert!(bump_outcome(db.conn(), queue.id, Outcome::Failed).unwrap());
        assert!(bump_outcome(db.conn(), queue.id, Outcome::Sent).unwrap());
        assert!(!bump_outcome(db.conn(), queue.id, Outcome::Sent).unwrap());

        let loaded = db.get_send_queue(queue.id).unwrap();
        assert_eq!((loaded.emails_sent, loaded.emails_failed), (2, 1));
    }

    #[test]
    fn terminal_counts_do_not_shrink() {
        let (_dir, db) = open_temp();
        let queue = seed_queue(&db, 10);
        for _ in 0..4 {
            bump_outcome(db.conn(), queue.id, Outcome::Sent).unwrap();
        }

        db.mark_queue_terminal(queue.id, QueueStatus::Failed, 1, 2)
            .unwrap();
        let loaded = db.get_send_queue(queue.id).unwrap();
        assert_eq!((loaded.emails_sent, loaded.emails_failed), (4, 2));
        assert!(loaded.completed_at.is_some());
    }

    #[test]
    fn unfinished_queues_exclude_terminal() {
        let (_dir, db) = open_temp();
        let a = seed_queue(&db, 1);
        let b = seed_queue(&db, 1);
        db.mark_queue_terminal(b.id, QueueStatus::Completed, 1, 0)
            .unwrap();

        let ids: Vec<QueueId> = db
            .list_unfinished_queues()
            .unwrap()
            .into_iter()
            .map(|q| q.id)
            .collect();
        assert_eq!(ids, vec![a.id]);
    }
}
