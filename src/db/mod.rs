// Database module

pub mod gate;
pub mod migrations;
pub mod schema;

use rusqlite::Connection;
use std::path::Path;
use anyhow::Result;

use crate::constants::{PACKCAM_FOLDER, DB_FILENAME};

/// Open or create a database at the given path
pub fn open_db(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;

    // Enable foreign keys (must be done per connection)
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;

    // Enable WAL mode for better concurrency
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;

    // Run migrations
    migrations::run_migrations(&conn)?;

    Ok(conn)
}

/// Get the database path for a data root
pub fn get_db_path(data_root: &Path) -> std::path::PathBuf {
    data_root.join(PACKCAM_FOLDER).join(DB_FILENAME)
}

/// Get the .packcam folder path for a data root
pub fn get_packcam_path(data_root: &Path) -> std::path::PathBuf {
    data_root.join(PACKCAM_FOLDER)
}

/// Initialize data root folder structure
pub fn init_data_folders(data_root: &Path) -> Result<()> {
    use crate::constants::*;

    let packcam = data_root.join(PACKCAM_FOLDER);
    std::fs::create_dir_all(&packcam)?;
    std::fs::create_dir_all(packcam.join(LOGS_FOLDER))?;
    std::fs::create_dir_all(packcam.join(TMP_FOLDER))?;
    std::fs::create_dir_all(data_root.join(CLIPS_FOLDER))?;

    Ok(())
}
