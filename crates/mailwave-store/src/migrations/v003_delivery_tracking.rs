use rusqlite::Connection;

// Populated by provider webhooks, which live outside this service.
const UP_SQL: &str = r#"
ALTER TABLE email_sends ADD COLUMN delivered_at TEXT;
ALTER TABLE email_sends ADD COLUMN opened_at TEXT;
ALTER TABLE email_sends ADD COLUMN clicked_at TEXT;
ALTER TABLE email_sends ADD COLUMN bounced_at TEXT;

CREATE INDEX IF NOT EXISTS idx_email_sends_esp ON email_sends(esp_message_id);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
