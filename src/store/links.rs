use anyhow::{Context, Result};

use super::BridgeStore;

/// A Telegram chat linked to a Discord channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscordLink {
    pub chat_id: String,
    pub discord_channel_id: String,
}

impl BridgeStore {
    /// All chat -> channel links
    pub async fn get_discord_links(&self) -> Result<Vec<DiscordLink>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT chat_id, discord_channel_id FROM discord_link_v2")
            .context("Failed to prepare link query")?;
        let links = stmt
            .query_map([], |row| {
                Ok(DiscordLink {
                    chat_id: row.get(0)?,
                    discord_channel_id: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load discord links")?;
        Ok(links)
    }

    /// Link a chat to a Discord channel, replacing any previous link for the chat.
    pub async fn set_discord_link(&self, chat_id: &str, discord_channel_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;

        let exists: bool = conn.query_row(
            "SELECT count(*) > 0 FROM discord_link_v2 WHERE chat_id = ?1",
            rusqlite::params![chat_id],
            |row| row.get(0),
        )?;

        if exists {
            conn.execute(
                "UPDATE discord_link_v2 SET discord_channel_id = ?1 WHERE chat_id = ?2",
                rusqlite::params![discord_channel_id, chat_id],
            )
            .context("Failed to update discord link")?;
        } else {
            conn.execute(
                "INSERT INTO discord_link_v2 (chat_id, discord_channel_id) VALUES (?1, ?2)",
                rusqlite::params![chat_id, discord_channel_id],
            )
            .context("Failed to insert discord link")?;
        }

        Ok(())
    }

    pub async fn get_discord_link(&self, chat_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT discord_channel_id FROM discord_link_v2 WHERE chat_id = ?1")?;
        let mut rows = stmt.query_map(rusqlite::params![chat_id], |row| row.get(0))?;
        match rows.next() {
            Some(Ok(channel)) => Ok(Some(channel)),
            Some(Err(e)) => Err(e).context("Failed to read discord link"),
            None => Ok(None),
        }
    }

    /// Reverse lookup used when relaying Discord messages back to their chat.
    /// Several chats may point at one channel; the first one wins.
    pub async fn get_chat_for_discord_channel(
        &self,
        discord_channel_id: &str,
    ) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT chat_id FROM discord_link_v2 WHERE discord_channel_id = ?1
             ORDER BY rowid ASC LIMIT 1",
        )?;
        let mut rows = stmt.query_map(rusqlite::params![discord_channel_id], |row| row.get(0))?;
        match rows.next() {
            Some(Ok(chat)) => Ok(Some(chat)),
            Some(Err(e)) => Err(e).context("Failed to read discord link"),
            None => Ok(None),
        }
    }

    /// Returns whether a link was removed.
    pub async fn remove_discord_link(&self, chat_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "DELETE FROM discord_link_v2 WHERE chat_id = ?1",
                rusqlite::params![chat_id],
            )
            .context("Failed to remove discord link")?;
        Ok(rows > 0)
    }
}
