//! v001 -- Initial schema creation.
//!
//! Creates the six keyed collections. Every collection stores the camelCase
//! JSON document in `body` next to its key and logical timestamp.

use rusqlite::Connection;

use bazaar_shared::EntityKind;

/// Build the SQL executed when upgrading from version 0 to version 1.
fn up_sql() -> String {
    let mut sql = String::new();
    for kind in EntityKind::ALL {
        let table = kind.table();
        sql.push_str(&format!(
            "
CREATE TABLE IF NOT EXISTS {table} (
    id      TEXT PRIMARY KEY NOT NULL,
    updated INTEGER NOT NULL,             -- logical timestamp, ms since epoch
    body    TEXT NOT NULL                 -- camelCase JSON document
);
CREATE INDEX IF NOT EXISTS idx_{table}_updated ON {table}(updated, id);
"
        ));
    }
    sql
}

/// Apply the migration.
pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(&up_sql())
}
