pub mod discord;
pub mod events;
pub mod fetch;
pub mod matrix;
pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::commands::{BotCommandSpec, CommandInvocation};
pub use events::{EventHandler, EventHub, EventKind};

/// Suffix appended to edited text unless the edit asks to hide it
pub const EDIT_MARK: &str = " (edited)";

/// Which adapter produced (or must consume) a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientName {
    Telegram,
    Discord,
    Matrix,
}

impl ClientName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientName::Telegram => "telegram",
            ClientName::Discord => "discord",
            ClientName::Matrix => "matrix",
        }
    }
}

impl std::fmt::Display for ClientName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Sticker,
    Photo,
    Video,
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Media {
    pub kind: MediaKind,
    pub url: String,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
}

/// A message received from, or already sent to, any platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenericMessage {
    pub client_name: ClientName,
    pub text: String,
    pub user_id: String,
    pub user_name: String,
    pub chat_id: String,
    pub message_id: String,
    /// Unix seconds
    pub date: i64,
    pub media: Option<Media>,
    pub reply_to_id: Option<String>,
    /// Native payloads, kept only as an escape hatch
    pub raw_message: Option<serde_json::Value>,
    pub raw_user: Option<serde_json::Value>,
    pub raw_reply: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct MessageToSend {
    pub client_name: ClientName,
    pub chat_id: String,
    pub text: String,
    pub media: Option<Media>,
    pub reply_to_id: Option<String>,
}

impl MessageToSend {
    pub fn text(
        client_name: ClientName,
        chat_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            client_name,
            chat_id: chat_id.into(),
            text: text.into(),
            media: None,
            reply_to_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessageToEdit {
    pub client_name: ClientName,
    pub chat_id: String,
    pub message_id: String,
    pub text: String,
    pub hide_edit_mark: bool,
}

impl MessageToEdit {
    /// Text as it should appear on the platform after the edit
    pub fn rendered_text(&self) -> String {
        if self.hide_edit_mark {
            self.text.clone()
        } else {
            format!("{}{}", self.text, EDIT_MARK)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("message for {actual} cannot be handled by the {expected} client")]
    ClientMismatch {
        expected: ClientName,
        actual: ClientName,
    },

    #[error("invalid {what} id: {value}")]
    InvalidId { what: &'static str, value: String },
}

/// Split text into chunks of at most `max_len` bytes for platforms with a
/// message size limit. Chunks end on a line or word break when one falls in
/// the second half of the window, and always on a UTF-8 char boundary.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        // Walk back to a valid UTF-8 char boundary so slicing doesn't panic
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        let actual_end = if end < text.len() {
            let window = &text[start..end];
            let floor = max_len / 2;
            window
                .rfind('\n')
                .filter(|&pos| pos >= floor)
                .or_else(|| window.rfind(' ').filter(|&pos| pos >= floor))
                .map(|pos| start + pos + 1)
                .unwrap_or(end)
        } else {
            end
        };

        chunks.push(text[start..actual_end].to_string());
        start = actual_end;
    }

    chunks
}

/// Leading part of `text` that fits in `max_len` bytes
pub fn first_chunk(text: &str, max_len: usize) -> String {
    split_message(text, max_len)
        .into_iter()
        .next()
        .unwrap_or_default()
}

/// Reject outbound messages addressed to another platform
pub fn ensure_client(expected: ClientName, actual: ClientName) -> Result<(), PlatformError> {
    if expected == actual {
        Ok(())
    } else {
        Err(PlatformError::ClientMismatch { expected, actual })
    }
}

/// Common surface every platform adapter exposes to the bridge
#[async_trait]
pub trait ChatClient: Send + Sync {
    fn name(&self) -> ClientName;

    /// The bot's own account id, known once `start` has succeeded
    fn own_user_id(&self) -> Option<String>;

    /// Connect and begin emitting events. Calling it twice is a no-op.
    async fn start(&self) -> Result<()>;

    /// Disconnect. Calling it on a stopped client is a no-op.
    async fn stop(&self) -> Result<()>;

    fn on(&self, kind: EventKind, handler: EventHandler);

    async fn send_message(&self, message: MessageToSend) -> Result<GenericMessage>;

    async fn edit_message(&self, message: MessageToEdit) -> Result<()>;

    /// Bot command support, for platforms that have it
    fn commands(&self) -> Option<&dyn CommandClient> {
        None
    }
}

#[async_trait]
pub trait CommandClient: Send + Sync {
    async fn set_command_list(&self, commands: &[BotCommandSpec]) -> Result<()>;

    /// Parse `message` as a command addressed to this bot
    fn try_execute_command(&self, message: &GenericMessage) -> Option<CommandInvocation>;
}
