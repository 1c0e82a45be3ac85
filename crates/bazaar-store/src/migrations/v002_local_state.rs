//! v002 -- Device-local state.
//!
//! Adds the reader-side `unread` flag and recipient column to `messages`,
//! and the conflict log.

use rusqlite::Connection;

const UP_SQL: &str = r#"
ALTER TABLE messages ADD COLUMN unread INTEGER NOT NULL DEFAULT 0;
ALTER TABLE messages ADD COLUMN recipient TEXT NOT NULL DEFAULT '';
CREATE INDEX IF NOT EXISTS idx_messages_unread ON messages(recipient, unread);

CREATE TABLE IF NOT EXISTS conflicts (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    kind        TEXT NOT NULL,
    entity_id   TEXT NOT NULL,
    reason      TEXT NOT NULL,
    local       TEXT NOT NULL,              -- JSON record kept
    remote      TEXT NOT NULL,              -- JSON record refused
    peer        TEXT,
    detected_at INTEGER NOT NULL,
    resolved    INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_conflicts_open ON conflicts(resolved, id);
"#;

/// Apply the migration.
pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
