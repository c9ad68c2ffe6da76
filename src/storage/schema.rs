//! Database schema definitions
//!
//! This module contains the SQL schema for the relational task and record store.

/// SQL schema for the database
///
/// `records.identity` carries a unique constraint: the store itself has the
/// final word on duplicates, the application pre-check is only a fast path.
pub const SCHEMA_SQL: &str = r#"
-- One row per listing page to crawl
CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    page_number INTEGER NOT NULL UNIQUE,
    in_work INTEGER NOT NULL DEFAULT 0,
    completed INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_tasks_claimable ON tasks(completed, in_work, page_number);

-- Extracted listings, insert-only
CREATE TABLE IF NOT EXISTS records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    identity TEXT NOT NULL UNIQUE,
    url TEXT NOT NULL,
    title TEXT,
    price_usd REAL,
    odometer REAL,
    seller_name TEXT,
    phone_number TEXT,
    image_url TEXT,
    images_count INTEGER NOT NULL DEFAULT 0,
    plate_number TEXT,
    found_at TEXT NOT NULL
);
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
