//! One-line textual descriptions of chat messages.
//!
//! A message is reduced to a [`DescribedMessage`]: sender, optional forward,
//! reply and via-bot context, at most one [`MessageContent`] kind, and the
//! text or caption. [`describe`] renders it as
//! `"<sender>: [context] [media] text"`.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;

use crate::platform::{fetch, GenericMessage, MediaKind};

const UNKNOWN_FILE: &str = "未知文件";
const NO_STICKER_SET: &str = "无贴纸包";
const UNKNOWN_USER: &str = "未知用户";
const SEPARATOR: &str = ": ";

#[derive(Debug, Clone, PartialEq)]
pub struct Sender {
    pub id: String,
    /// Profile name, e.g. first + last name
    pub name: String,
    pub is_bot: bool,
}

impl Sender {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_bot: false,
        }
    }
}

/// Where a forwarded message came from
#[derive(Debug, Clone, PartialEq)]
pub enum ForwardOrigin {
    User(Sender),
    /// User who hides their account; only a display name is known
    HiddenUser(String),
    /// Channel or group posting under its own name
    Chat(String),
}

/// The message being replied to
#[derive(Debug, Clone, PartialEq)]
pub struct ReferencedMessage {
    pub sender: Option<Sender>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum MessageContent {
    #[default]
    None,
    Audio,
    Document {
        file_name: Option<String>,
    },
    Animation,
    Photo,
    Sticker {
        set_name: Option<String>,
    },
    Video,
    VideoNote,
    Voice {
        duration_secs: u32,
    },
    Contact {
        first_name: String,
        last_name: Option<String>,
    },
    Dice {
        emoji: String,
        value: u8,
    },
    Game {
        title: String,
    },
    Poll {
        question: String,
    },
    Location {
        latitude: f64,
        longitude: f64,
    },
    Venue {
        title: String,
    },
}

impl MessageContent {
    /// Bracketed fragment for this kind, without the trailing space
    fn label(&self) -> Option<String> {
        let label = match self {
            MessageContent::None => return None,
            MessageContent::Audio => "[音频]".to_string(),
            MessageContent::Document { file_name } => {
                format!("[文件：{}]", file_name.as_deref().unwrap_or(UNKNOWN_FILE))
            }
            MessageContent::Animation => "[GIF]".to_string(),
            MessageContent::Photo => "[图片]".to_string(),
            MessageContent::Sticker { set_name } => {
                format!("[贴纸：{}]", set_name.as_deref().unwrap_or(NO_STICKER_SET))
            }
            MessageContent::Video => "[视频]".to_string(),
            MessageContent::VideoNote => "[视频消息]".to_string(),
            MessageContent::Voice { duration_secs } => format!("[语音：{}秒]", duration_secs),
            MessageContent::Contact {
                first_name,
                last_name,
            } => {
                let name = format!("{} {}", first_name, last_name.as_deref().unwrap_or(""));
                format!("[联系人：{}]", name.trim())
            }
            MessageContent::Dice { emoji, value } => format!("[骰子：{} {}]", emoji, value),
            MessageContent::Game { title } => format!("[游戏：{}]", title),
            MessageContent::Poll { question } => format!("[投票：{}]", question),
            MessageContent::Location {
                latitude,
                longitude,
            } => format!("[位置：{},{}]", latitude, longitude),
            MessageContent::Venue { title } => format!("[地点：{}]", title),
        };
        Some(label)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DescribedMessage {
    pub sender: Sender,
    pub forward: Option<ForwardOrigin>,
    pub reply_to: Option<ReferencedMessage>,
    pub via_bot: Option<Sender>,
    pub content: MessageContent,
    /// Text or caption
    pub text: Option<String>,
}

impl DescribedMessage {
    #[cfg(test)]
    pub fn plain(sender: Sender, text: impl Into<String>) -> Self {
        Self {
            sender,
            forward: None,
            reply_to: None,
            via_bot: None,
            content: MessageContent::None,
            text: Some(text.into()),
        }
    }

    /// Build from a generic message. Only the sender, text and media kind
    /// survive the generic shape.
    pub fn from_generic(msg: &GenericMessage) -> Self {
        let content = match &msg.media {
            None => MessageContent::None,
            Some(media) => match media.kind {
                MediaKind::Sticker => MessageContent::Sticker { set_name: None },
                MediaKind::Photo => MessageContent::Photo,
                MediaKind::Video => MessageContent::Video,
                MediaKind::File => MessageContent::Document {
                    file_name: fetch::file_name(&media.url),
                },
            },
        };
        Self {
            sender: Sender::new(msg.user_id.clone(), msg.user_name.clone()),
            forward: None,
            reply_to: None,
            via_bot: None,
            content,
            text: Some(msg.text.clone()).filter(|t| !t.is_empty()),
        }
    }
}

/// Turns a user into the name shown in descriptions
#[async_trait]
pub trait UserFormatter: Send + Sync {
    async fn format_user(&self, user: &Sender) -> String;
}

/// Formats users by their profile name
pub struct ProfileNameFormatter;

#[async_trait]
impl UserFormatter for ProfileNameFormatter {
    async fn format_user(&self, user: &Sender) -> String {
        user.name.clone()
    }
}

/// Facts about the running bot needed while describing
#[derive(Debug, Clone, Default)]
pub struct DescribeContext {
    pub bot_user_id: Option<String>,
}

impl DescribeContext {
    fn is_self(&self, user: &Sender) -> bool {
        user.is_bot && self.bot_user_id.as_deref() == Some(user.id.as_str())
    }
}

/// Display name for the author of a referenced message.
///
/// Our own relayed messages look like `"Alice: hello"`; for those the
/// original author is recovered from the text instead of naming the bot.
async fn referenced_name(
    sender: &Sender,
    text: Option<&str>,
    ctx: &DescribeContext,
    formatter: &dyn UserFormatter,
) -> String {
    if ctx.is_self(sender) {
        if let Some((name, _)) = text.and_then(|t| t.split_once(SEPARATOR)) {
            return name.to_string();
        }
    }
    formatter.format_user(sender).await
}

pub async fn describe(
    msg: &DescribedMessage,
    ctx: &DescribeContext,
    formatter: &dyn UserFormatter,
) -> String {
    let mut out = formatter.format_user(&msg.sender).await;
    out.push_str(SEPARATOR);

    if let Some(origin) = &msg.forward {
        let name = match origin {
            ForwardOrigin::User(user) => {
                referenced_name(user, msg.text.as_deref(), ctx, formatter).await
            }
            ForwardOrigin::HiddenUser(name) | ForwardOrigin::Chat(name) => name.clone(),
        };
        out.push_str(&format!("[转发自：{}] ", name));
    }

    if let Some(reply) = &msg.reply_to {
        let name = match &reply.sender {
            Some(user) => referenced_name(user, reply.text.as_deref(), ctx, formatter).await,
            None => UNKNOWN_USER.to_string(),
        };
        out.push_str(&format!("[回复给：{}] ", name));
    }

    if let Some(bot) = &msg.via_bot {
        let name = formatter.format_user(bot).await;
        out.push_str(&format!("[经由：{}] ", name));
    }

    if let Some(label) = msg.content.label() {
        out.push_str(&label);
        out.push(' ');
    }

    if let Some(text) = &msg.text {
        out.push_str(text);
    }

    out.trim().to_string()
}

/// Escape Discord markdown control characters
pub fn escape_markdown(text: &str) -> String {
    static MARKDOWN: OnceLock<Regex> = OnceLock::new();
    let re = MARKDOWN.get_or_init(|| Regex::new(r"([\\*_~`|>])").expect("static pattern"));
    re.replace_all(text, r"\$1").into_owned()
}
