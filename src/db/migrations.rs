// Database migrations
// Migrations are forward-only. Never edit or delete a migration after it
// ships. Column additions go through add_column_if_missing so a migration
// re-run after a mid-deployment restart is a no-op.

use rusqlite::Connection;
use anyhow::Result;

use crate::constants::*;

/// All migrations in order. Each migration is a SQL string.
const MIGRATIONS: &[&str] = &[
    // Migration 1: Initial schema
    r#"
    -- Packing events, one row per detected On/Off interval
    CREATE TABLE events (
        event_id INTEGER PRIMARY KEY AUTOINCREMENT,
        video_file TEXT NOT NULL,
        camera_name TEXT NOT NULL,
        ts REAL,
        te REAL,
        tracking_codes TEXT NOT NULL DEFAULT '[]',
        packing_time_start INTEGER,
        packing_time_end INTEGER,
        is_processed INTEGER NOT NULL DEFAULT 0,
        output_file TEXT,
        retry_needed INTEGER NOT NULL DEFAULT 0,
        retry_count INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'completed', 'completed_retry', 'retry_failed')),
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );

    -- Trigger-transition log segments written by the scanner
    CREATE TABLE processed_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        path TEXT NOT NULL UNIQUE,
        video_file TEXT NOT NULL,
        camera_name TEXT NOT NULL,
        segment_start REAL NOT NULL,
        segment_end REAL NOT NULL,
        wall_start_ms INTEGER NOT NULL,
        is_processed INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );

    -- Singleton configuration row (id is always 1)
    CREATE TABLE processing_config (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        video_buffer REAL NOT NULL,
        max_packing_time REAL NOT NULL,
        batch_size_min INTEGER NOT NULL,
        batch_size_max INTEGER NOT NULL,
        batch_size_default INTEGER NOT NULL,
        cpu_threshold_low REAL NOT NULL,
        cpu_threshold_high REAL NOT NULL,
        memory_threshold REAL NOT NULL,
        segment_length_seconds REAL NOT NULL,
        frame_sample_stride INTEGER NOT NULL
    );

    -- Cameras with their packing-area crop rectangles
    CREATE TABLE cameras (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        roi_x INTEGER NOT NULL DEFAULT 0,
        roi_y INTEGER NOT NULL DEFAULT 0,
        roi_w INTEGER NOT NULL,
        roi_h INTEGER NOT NULL,
        decoder_cmd TEXT,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );

    CREATE INDEX idx_events_processed ON events(is_processed);
    CREATE INDEX idx_events_retry ON events(retry_needed, retry_count);
    CREATE INDEX idx_events_video ON events(video_file);
    CREATE INDEX idx_processed_logs_pending ON processed_logs(is_processed);
    "#,
];

/// Get current schema version from database
fn get_schema_version(conn: &Connection) -> Result<u32> {
    let version: u32 = conn.query_row(
        "PRAGMA user_version",
        [],
        |row| row.get(0)
    )?;
    Ok(version)
}

/// Add a column only if it does not already exist. Safe to re-run after a
/// restart that interrupted a deployment.
pub fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    decl: &str,
) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let existing: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    if !existing.iter().any(|c| c == column) {
        conn.execute_batch(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl))?;
    }
    Ok(())
}

/// Run all pending migrations (crash-safe)
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    let target_version = MIGRATIONS.len() as u32;

    // Refuse to open a DB created by a newer PackCam build
    if current_version > target_version {
        anyhow::bail!(
            "Database schema version {} is newer than this build supports (max {}). Please upgrade PackCam.",
            current_version,
            target_version
        );
    }

    if current_version < target_version {
        for (i, migration) in MIGRATIONS.iter().enumerate() {
            let migration_version = (i + 1) as u32;
            if migration_version <= current_version {
                continue;
            }

            conn.execute_batch(migration)?;
            conn.execute_batch(&format!("PRAGMA user_version = {}", migration_version))?;

            log::info!("Applied migration {}", migration_version);
        }
    }

    seed_default_config(conn)?;

    Ok(())
}

/// Insert the default processing_config row if none exists.
fn seed_default_config(conn: &Connection) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO processing_config
         (id, video_buffer, max_packing_time, batch_size_min, batch_size_max,
          batch_size_default, cpu_threshold_low, cpu_threshold_high,
          memory_threshold, segment_length_seconds, frame_sample_stride)
         VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        rusqlite::params![
            DEFAULT_VIDEO_BUFFER_SECONDS,
            DEFAULT_MAX_PACKING_TIME_SECONDS,
            DEFAULT_BATCH_SIZE_MIN,
            DEFAULT_BATCH_SIZE_MAX,
            DEFAULT_BATCH_SIZE,
            DEFAULT_CPU_THRESHOLD_LOW,
            DEFAULT_CPU_THRESHOLD_HIGH,
            DEFAULT_MEMORY_THRESHOLD,
            DEFAULT_SEGMENT_LENGTH_SECONDS,
            DEFAULT_FRAME_SAMPLE_STRIDE,
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        // A second run (restart mid-deployment) must be a clean no-op
        run_migrations(&conn).unwrap();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, MIGRATIONS.len() as u32);
    }

    #[test]
    fn test_add_column_if_missing_twice() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        add_column_if_missing(&conn, "events", "notes", "TEXT").unwrap();
        add_column_if_missing(&conn, "events", "notes", "TEXT").unwrap();

        conn.execute("UPDATE events SET notes = NULL", []).ok();
    }

    #[test]
    fn test_default_config_seeded() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let buffer: f64 = conn
            .query_row("SELECT video_buffer FROM processing_config WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(buffer, DEFAULT_VIDEO_BUFFER_SECONDS);
    }
}
