//! Email send records.
//!
//! Records are created in bulk inside a single transaction and then move
//! `queued -> sending -> sent | failed`, one conditional `UPDATE` per step.
//! Resolved records are never written again. Settling a record also touches
//! the credit ledger and the queue counters inside the same transaction.

use chrono::Utc;
use rusqlite::{params, Connection};

use mailwave_shared::{Outcome, QueueId, SendId, SendStatus};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{EmailSend, NewEmailSend, SendQueue, Settlement};
use crate::{credits, rows, send_queues};

const SEND_COLUMNS: &str = "id, queue_id, ordinal, campaign_id, contact_id, sequence_id,
                            recipient_email, subject, personalization, status,
                            esp_message_id, error_message, scheduled_at, sent_at,
                            delivered_at, opened_at, clicked_at, bounced_at";

impl Database {
    /// Insert every record of a send in one transaction. Either all rows land
    /// or none do. `ordinal` follows the slice order.
    pub fn insert_email_sends(&mut self, queue: &SendQueue, records: &[NewEmailSend]) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn_mut().transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO email_sends
                     (id, queue_id, ordinal, campaign_id, contact_id, sequence_id,
                      recipient_email, subject, personalization, status, scheduled_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for (ordinal, record) in records.iter().enumerate() {
                stmt.execute(params![
                    record.id.to_string(),
                    queue.id.to_string(),
                    ordinal as i64,
                    queue.campaign_id.to_string(),
                    record.contact_id.to_string(),
                    record.sequence_id.to_string(),
                    record.recipient_email,
                    record.subject,
                    serde_json::to_string(&record.personalization)?,
                    SendStatus::Queued.as_str(),
                    record.scheduled_at.to_rfc3339(),
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Every record of a queue in materialization order.
    pub fn list_email_sends(&self, queue_id: QueueId) -> Result<Vec<EmailSend>> {
        self.query_sends(
            &format!(
                "SELECT {SEND_COLUMNS} FROM email_sends
                 WHERE queue_id = ?1 ORDER BY ordinal ASC"
            ),
            params![queue_id.to_string()],
        )
    }

    /// Records still `queued` or `sending`, in materialization order.
    pub fn list_unresolved_sends(&self, queue_id: QueueId) -> Result<Vec<EmailSend>> {
        self.query_sends(
            &format!(
                "SELECT {SEND_COLUMNS} FROM email_sends
                 WHERE queue_id = ?1 AND status IN (?2, ?3)
                 ORDER BY ordinal ASC"
            ),
            params![
                queue_id.to_string(),
                SendStatus::Queued.as_str(),
                SendStatus::Sending.as_str(),
            ],
        )
    }

    pub fn count_email_sends(&self, queue_id: QueueId) -> Result<i64> {
        Ok(self.conn().query_row(
            "SELECT COUNT(*) FROM email_sends WHERE queue_id = ?1",
            params![queue_id.to_string()],
            |row| row.get(0),
        )?)
    }

    /// `queued -> sending`. A record already in `sending` (left there by an
    /// interrupted pass) may be claimed again. Returns `false` if the record
    /// is resolved.
    pub fn claim_send(&self, id: SendId) -> Result<bool> {
        transition(
            self.conn(),
            id,
            &[SendStatus::Queued, SendStatus::Sending],
            "status = ?1, updated_at = ?2",
            SendStatus::Sending,
            None,
        )
    }

    /// Mark a delivered record `sent`, spend one credit from the queue
    /// owner's ledger and bump `emails_sent`, as one transaction.
    pub fn settle_sent(
        &mut self,
        queue: &SendQueue,
        id: SendId,
        esp_message_id: &str,
    ) -> Result<Settlement> {
        let tx = self.conn_mut().transaction()?;
        if !mark_sent(&tx, id, esp_message_id)? {
            return Ok(Settlement::Stale);
        }
        let charged = credits::deduct_one(&tx, queue.user_id)?;
        send_queues::bump_outcome(&tx, queue.id, Outcome::Sent)?;
        tx.commit()?;

        Ok(if charged {
            Settlement::Charged
        } else {
            Settlement::Uncharged
        })
    }

    /// Mark a record `failed` and bump `emails_failed`, as one transaction.
    /// Returns `false` if the record was already resolved.
    pub fn settle_failed(&mut self, queue_id: QueueId, id: SendId, error: &str) -> Result<bool> {
        let tx = self.conn_mut().transaction()?;
        if !mark_failed(&tx, id, error)? {
            return Ok(false);
        }
        send_queues::bump_outcome(&tx, queue_id, Outcome::Failed)?;
        tx.commit()?;
        Ok(true)
    }

    fn query_sends<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<EmailSend>> {
        let mut stmt = self.conn().prepare(sql)?;
        let rows = stmt.query_map(params, row_to_send)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }
}

/// `sending -> sent`, storing the provider's message id.
fn mark_sent(conn: &Connection, id: SendId, esp_message_id: &str) -> Result<bool> {
    transition(
        conn,
        id,
        &[SendStatus::Sending],
        "status = ?1, updated_at = ?2, sent_at = ?2, esp_message_id = ?3",
        SendStatus::Sent,
        Some(esp_message_id),
    )
}

/// `queued | sending -> failed`, storing the error text.
fn mark_failed(conn: &Connection, id: SendId, error: &str) -> Result<bool> {
    transition(
        conn,
        id,
        &[SendStatus::Queued, SendStatus::Sending],
        "status = ?1, updated_at = ?2, error_message = ?3",
        SendStatus::Failed,
        Some(error),
    )
}

fn transition(
    conn: &Connection,
    id: SendId,
    from: &[SendStatus],
    set: &str,
    to: SendStatus,
    detail: Option<&str>,
) -> Result<bool> {
    let from_list: Vec<String> = from.iter().map(|s| format!("'{}'", s.as_str())).collect();
    let sql = format!(
        "UPDATE email_sends SET {set} WHERE id = ?4 AND status IN ({})",
        from_list.join(", ")
    );
    let affected = conn.execute(
        &sql,
        params![to.as_str(), Utc::now().to_rfc3339(), detail, id.to_string()],
    )?;
    Ok(affected > 0)
}

fn row_to_send(row: &rusqlite::Row<'_>) -> rusqlite::Result<EmailSend> {
    Ok(EmailSend {
        id: rows::parsed(row, 0)?,
        queue_id: rows::parsed(row, 1)?,
        ordinal: row.get(2)?,
        campaign_id: rows::parsed(row, 3)?,
        contact_id: rows::parsed(row, 4)?,
        sequence_id: rows::parsed(row, 5)?,
        recipient_email: row.get(6)?,
        subject: row.get(7)?,
        personalization: rows::json(row, 8)?,
        status: rows::parsed(row, 9)?,
        esp_message_id: row.get(10)?,
        error_message: row.get(11)?,
        scheduled_at: rows::timestamp(row, 12)?,
        sent_at: rows::timestamp_opt(row, 13)?,
        delivered_at: rows::timestamp_opt(row, 14)?,
        opened_at: rows::timestamp_opt(row, 15)?,
        clicked_at: rows::timestamp_opt(row, 16)?,
        bounced_at: rows::timestamp_opt(row, 17)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tests::open_temp;
    use crate::models::SequenceItem;
    use crate::send_queues::tests::seed_queue;
    use mailwave_shared::personalize::Personalization;
    use mailwave_shared::{ContactId, SequenceItemId};

    fn records(db: &Database, queue: &SendQueue, n: usize) -> Vec<NewEmailSend> {
        let item = SequenceItem {
            id: SequenceItemId::new(),
            campaign_id: queue.campaign_id,
            position: 1,
            subject: "Hi".into(),
            body_text: "t".into(),
            body_html: "h".into(),
            email_type: "welcome".into(),
        };
        db.insert_sequence_item(&item).unwrap();
        (0..n)
            .map(|i| NewEmailSend {
                id: SendId::new(),
                contact_id: ContactId::new(),
                sequence_id: item.id,
                recipient_email: format!("r{i}@x.io"),
                subject: format!("Hi r{i}"),
                personalization: Personalization {
                    email: format!("r{i}@x.io"),
                    first_name: Some(format!("R{i}")),
                    last_name: None,
                },
                scheduled_at: Utc::now(),
            })
            .collect()
    }

    #[test]
    fn bulk_insert_keeps_order() {
        let (_dir, mut db) = open_temp();
        let queue = seed_queue(&db, 3);
        let recs = records(&db, &queue, 3);
        db.insert_email_sends(&queue, &recs).unwrap();

        let stored = db.list_email_sends(queue.id).unwrap();
        let emails: Vec<&str> = stored.iter().map(|s| s.recipient_email.as_str()).collect();
        assert_eq!(emails, vec!["r0@x.io", "r1@x.io", "r2@x.io"]);
        assert!(stored.iter().all(|s| s.status == SendStatus::Queued));
        assert_eq!(stored[1].personalization.first_name.as_deref(), Some("R1"));
        assert_eq!(db.count_email_sends(queue.id).unwrap(), 3);
    }

    #[test]
    fn bulk_insert_is_all_or_nothing() {
        let (_dir, mut db) = open_temp();
        let queue = seed_queue(&db, 2);
        let mut recs = records(&db, &queue, 2);
        recs[1].id = recs[0].id;

        assert!(db.insert_email_sends(&queue, &recs).is_err());
        assert_eq!(db.count_email_sends(queue.id).unwrap(), 0);
    }

    #[test]
    fn resolved_records_are_final() {
        let (_dir, mut db) = open_temp();
        let queue = seed_queue(&db, 2);
        let recs = records(&db, &queue, 2);
        db.insert_email_sends(&queue, &recs).unwrap();
        let (a, b) = (recs[0].id, recs[1].id);

        assert!(!mark_sent(db.conn(), a, "esp-1").unwrap(), "must be claimed first");
        assert!(db.claim_send(a).unwrap());
        assert!(db.claim_send(a).unwrap(), "sending may be reclaimed");
        assert!(mark_sent(db.conn(), a, "esp-1").unwrap());
        assert!(!db.claim_send(a).unwrap());
        assert!(!mark_failed(db.conn(), a, "late").unwrap());

        assert!(mark_failed(db.conn(), b, "rejected").unwrap());
        assert!(!db.claim_send(b).unwrap());

        let stored = db.list_email_sends(queue.id).unwrap();
        let sent = &stored[0];
        assert_eq!(sent.status, SendStatus::Sent);
        assert_eq!(sent.esp_message_id.as_deref(), Some("esp-1"));
        assert!(sent.sent_at.is_some());
        let failed = &stored[1];
        assert_eq!(failed.error_message.as_deref(), Some("rejected"));

        assert!(db.list_unresolved_sends(queue.id).unwrap().is_empty());
    }

    #[test]
    fn settling_charges_once() {
        let (_dir, mut db) = open_temp();
        let queue = seed_queue(&db, 3);
        db.set_credit_balance(queue.user_id, 0, 1).unwrap();
        let recs = records(&db, &queue, 3);
        db.insert_email_sends(&queue, &recs).unwrap();

        db.claim_send(recs[0].id).unwrap();
        assert_eq!(
            db.settle_sent(&queue, recs[0].id, "esp-a").unwrap(),
            Settlement::Charged
        );
        assert_eq!(
            db.settle_sent(&queue, recs[0].id, "esp-a").unwrap(),
            Settlement::Stale
        );

        db.claim_send(recs[1].id).unwrap();
        assert_eq!(
            db.settle_sent(&queue, recs[1].id, "esp-b").unwrap(),
            Settlement::Uncharged
        );

        assert!(db.settle_failed(queue.id, recs[2].id, "boom").unwrap());
        assert!(!db.settle_failed(queue.id, recs[2].id, "boom").unwrap());

        let loaded = db.get_send_queue(queue.id).unwrap();
        assert_eq!((loaded.emails_sent, loaded.emails_failed), (2, 1));
        assert_eq!(db.available_credits(queue.user_id).unwrap(), 0);
    }
}
