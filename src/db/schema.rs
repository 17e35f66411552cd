//! Database schema migrations

use rusqlite::Connection;

use crate::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cost_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sn TEXT NOT NULL,
    model_name TEXT NOT NULL,
    prompt_tokens INTEGER NOT NULL,
    completion_tokens INTEGER NOT NULL,
    total_tokens INTEGER NOT NULL,
    cost TEXT NOT NULL,
    currency TEXT NOT NULL DEFAULT 'CNY',
    duration_ms INTEGER NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cost_records_sn ON cost_records(sn);
CREATE INDEX IF NOT EXISTS idx_cost_records_model_name ON cost_records(model_name);

CREATE TABLE IF NOT EXISTS devices (
    sn TEXT PRIMARY KEY,
    vendor TEXT NOT NULL,
    device_type TEXT NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'inactivated',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

/// Apply migrations to a fresh or existing database
///
/// # Errors
///
/// Returns an error if a statement fails.
pub fn init(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}
