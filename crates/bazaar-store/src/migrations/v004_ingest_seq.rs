//! v004 -- Ingest sequence.
//!
//! Every collection gets a `seq` column stamped from a single device-wide
//! counter on each write, so peers can ask for "everything stored since"
//! regardless of the records' own timestamps. Rows already present share
//! seq 1. Checkpoints from earlier versions counted timestamps, not seqs,
//! and are dropped so the next cycle with each peer starts from scratch.

use rusqlite::Connection;

use bazaar_shared::constants::META_CHECKPOINT_PREFIX;
use bazaar_shared::EntityKind;

fn up_sql() -> String {
    let mut sql = String::from(
        "
CREATE TABLE IF NOT EXISTS ingest_counter (
    id    INTEGER PRIMARY KEY CHECK (id = 1),
    value INTEGER NOT NULL
);
INSERT OR IGNORE INTO ingest_counter (id, value) VALUES (1, 1);
",
    );
    for kind in EntityKind::ALL {
        let table = kind.table();
        sql.push_str(&format!(
            "
ALTER TABLE {table} ADD COLUMN seq INTEGER NOT NULL DEFAULT 0;
UPDATE {table} SET seq = 1;
CREATE INDEX IF NOT EXISTS idx_{table}_seq ON {table}(seq);
"
        ));
    }
    sql.push_str(&format!(
        "DELETE FROM meta WHERE id LIKE '{META_CHECKPOINT_PREFIX}%';\n"
    ));
    sql
}

/// Apply the migration.
pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(&up_sql())
}
