use anyhow::{Context, Result};

use super::BridgeStore;

impl BridgeStore {
    /// Store or update a user's nickname within one chat
    pub async fn set_discord_nickname(
        &self,
        chat_id: &str,
        user_id: &str,
        nickname: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO discord_nick (chat_id, user_id, nickname)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(chat_id, user_id) DO UPDATE SET
                nickname = excluded.nickname",
            rusqlite::params![chat_id, user_id, nickname],
        )
        .context("Failed to store nickname")?;
        Ok(())
    }

    pub async fn get_discord_nickname(
        &self,
        chat_id: &str,
        user_id: &str,
    ) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT nickname FROM discord_nick WHERE chat_id = ?1 AND user_id = ?2")?;
        let mut rows = stmt.query_map(rusqlite::params![chat_id, user_id], |row| row.get(0))?;
        match rows.next() {
            Some(Ok(nick)) => Ok(Some(nick)),
            Some(Err(e)) => Err(e).context("Failed to read nickname"),
            None => Ok(None),
        }
    }
}
