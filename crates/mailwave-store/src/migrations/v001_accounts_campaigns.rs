//! v001 -- Accounts, campaigns and contacts.
//!
//! Creates `users`, `api_tokens`, `email_credits`, `campaigns`,
//! `email_sequences`, `contact_lists`, `contacts` and `unsubscribes`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id         TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    email      TEXT NOT NULL,
    plan       TEXT NOT NULL DEFAULT 'trial',
    created_at TEXT NOT NULL                -- ISO-8601 / RFC-3339
);

-- ----------------------------------------------------------------
-- API tokens (stored as BLAKE3 hex digests, never in clear)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS api_tokens (
    token_hash TEXT PRIMARY KEY NOT NULL,
    user_id    TEXT NOT NULL,
    created_at TEXT NOT NULL,

    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Credit ledger (total is kept equal to free + paid by the billing sync)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS email_credits (
    user_id         TEXT PRIMARY KEY NOT NULL,
    free_credits    INTEGER NOT NULL DEFAULT 0,
    paid_credits    INTEGER NOT NULL DEFAULT 0,
    total_credits   INTEGER NOT NULL DEFAULT 0 CHECK (total_credits >= 0),
    used_this_month INTEGER NOT NULL DEFAULT 0,
    updated_at      TEXT NOT NULL,

    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Campaigns (user_id is NULL for guest campaigns not yet claimed)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS campaigns (
    id          TEXT PRIMARY KEY NOT NULL,
    user_id     TEXT,
    product_url TEXT NOT NULL,
    name        TEXT,
    status      TEXT NOT NULL DEFAULT 'analyzing',
    created_at  TEXT NOT NULL,

    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_campaigns_user ON campaigns(user_id);

-- ----------------------------------------------------------------
-- Email sequence items (dense, unique positions per campaign)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS email_sequences (
    id          TEXT PRIMARY KEY NOT NULL,
    campaign_id TEXT NOT NULL,
    position    INTEGER NOT NULL,
    subject     TEXT NOT NULL,
    body_text   TEXT NOT NULL,
    body_html   TEXT NOT NULL,
    email_type  TEXT NOT NULL,

    FOREIGN KEY (campaign_id) REFERENCES campaigns(id) ON DELETE CASCADE
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_sequences_position
    ON email_sequences(campaign_id, position);

-- ----------------------------------------------------------------
-- Contact lists and contacts
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS contact_lists (
    id             TEXT PRIMARY KEY NOT NULL,
    user_id        TEXT NOT NULL,
    name           TEXT NOT NULL,
    total_contacts INTEGER NOT NULL DEFAULT 0,
    created_at     TEXT NOT NULL,

    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS contacts (
    id         TEXT PRIMARY KEY NOT NULL,
    list_id    TEXT NOT NULL,
    email      TEXT NOT NULL,               -- duplicates tolerated
    first_name TEXT,
    last_name  TEXT,
    status     TEXT NOT NULL DEFAULT 'active',
    created_at TEXT NOT NULL,

    FOREIGN KEY (list_id) REFERENCES contact_lists(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_contacts_list_status ON contacts(list_id, status);
CREATE INDEX IF NOT EXISTS idx_contacts_email ON contacts(email COLLATE NOCASE);

-- ----------------------------------------------------------------
-- Unsubscribes (campaign_id NULL = every campaign)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS unsubscribes (
    id          TEXT PRIMARY KEY NOT NULL,
    email       TEXT NOT NULL,              -- normalized: trimmed, lowercase
    campaign_id TEXT,
    reason      TEXT,
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_unsubscribes_email ON unsubscribes(email);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
