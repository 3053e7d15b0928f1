//! v001 -- Initial schema creation.
//!
//! Creates the four core tables: `chats`, `participants`, `messages`, and
//! `mailbox`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Chats
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chats (
    id         TEXT PRIMARY KEY NOT NULL,   -- "chat-" + 12 hex chars
    name       TEXT NOT NULL,
    metadata   TEXT NOT NULL DEFAULT '{}',  -- free-form JSON object
    created_at TEXT NOT NULL                -- ISO-8601 / RFC-3339
);

-- ----------------------------------------------------------------
-- Participants (chat membership edges)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS participants (
    chat_id   TEXT NOT NULL,
    user_id   TEXT NOT NULL,
    joined_at TEXT NOT NULL,

    PRIMARY KEY (chat_id, user_id),
    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
);

-- Secondary lookup path: all chats for one user.
CREATE INDEX IF NOT EXISTS idx_participants_user ON participants(user_id);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    message_id    TEXT PRIMARY KEY NOT NULL,  -- "msg-" + 12 hex chars
    chat_id       TEXT NOT NULL,
    sender_id     TEXT NOT NULL,
    content       TEXT NOT NULL,
    created_at    INTEGER NOT NULL,           -- epoch millis, sort key within a chat
    upload_status TEXT,                       -- PENDING / COMPLETED / FAILED, NULL for plain text
    blob_bucket   TEXT,
    blob_key      TEXT,

    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_chat_ts
    ON messages(chat_id, created_at DESC);

-- ----------------------------------------------------------------
-- Mailbox (undelivered pointers, one row per recipient x message)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS mailbox (
    recipient_id TEXT NOT NULL,
    message_id   TEXT NOT NULL,
    chat_id      TEXT NOT NULL,
    created_at   INTEGER NOT NULL,            -- epoch millis of the message

    PRIMARY KEY (recipient_id, message_id),
    FOREIGN KEY (message_id) REFERENCES messages(message_id) ON DELETE CASCADE
);

-- Reverse-chronological sync scans.
CREATE INDEX IF NOT EXISTS idx_mailbox_recipient_ts
    ON mailbox(recipient_id, created_at DESC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
