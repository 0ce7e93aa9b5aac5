use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Send queues: one row per "send campaign to list" action, kept forever
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS send_queues (
    id            TEXT PRIMARY KEY NOT NULL,
    campaign_id   TEXT NOT NULL,
    user_id       TEXT NOT NULL,
    total_emails  INTEGER NOT NULL,
    emails_sent   INTEGER NOT NULL DEFAULT 0,
    emails_failed INTEGER NOT NULL DEFAULT 0,
    status        TEXT NOT NULL DEFAULT 'pending',
    created_at    TEXT NOT NULL,
    started_at    TEXT,
    completed_at  TEXT,

    CHECK (emails_sent + emails_failed <= total_emails),
    FOREIGN KEY (campaign_id) REFERENCES campaigns(id),
    FOREIGN KEY (user_id) REFERENCES users(id)
);

CREATE INDEX IF NOT EXISTS idx_send_queues_status ON send_queues(status);

-- ----------------------------------------------------------------
-- Email sends: one row per (contact x sequence item)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS email_sends (
    id              TEXT PRIMARY KEY NOT NULL,
    queue_id        TEXT NOT NULL,
    ordinal         INTEGER NOT NULL,          -- materialization order
    campaign_id     TEXT NOT NULL,
    contact_id      TEXT NOT NULL,
    sequence_id     TEXT NOT NULL,
    recipient_email TEXT NOT NULL,
    subject         TEXT NOT NULL,             -- already personalized
    personalization TEXT NOT NULL,             -- JSON snapshot of contact fields
    status          TEXT NOT NULL DEFAULT 'queued',
    esp_message_id  TEXT,
    error_message   TEXT,
    scheduled_at    TEXT NOT NULL,
    sent_at         TEXT,
    updated_at      TEXT NOT NULL,

    FOREIGN KEY (queue_id) REFERENCES send_queues(id),
    FOREIGN KEY (sequence_id) REFERENCES email_sequences(id)
);

CREATE INDEX IF NOT EXISTS idx_email_sends_queue ON email_sends(queue_id, status, ordinal);
CREATE INDEX IF NOT EXISTS idx_email_sends_campaign ON email_sends(campaign_id);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
