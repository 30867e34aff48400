pub mod links;
pub mod nicknames;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// SQLite store for Discord channel links and per-chat nicknames
#[derive(Clone)]
pub struct BridgeStore {
    conn: Arc<Mutex<Connection>>,
}

impl BridgeStore {
    /// Open or create the SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // journal_mode PRAGMA always returns the resulting mode, so use query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        // Tables are created on the raw connection before it is wrapped in the Mutex
        Self::create_tables(&conn)?;

        info!("Bridge store initialized at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::create_tables(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn create_tables(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS discord_link_v2 (
                chat_id TEXT PRIMARY KEY,
                discord_channel_id TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS discord_nick (
                chat_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                nickname TEXT NOT NULL,
                PRIMARY KEY (chat_id, user_id)
            );
            ",
        )
        .context("Failed to create bridge tables")?;
        Ok(())
    }
}
