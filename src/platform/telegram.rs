use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use teloxide::dispatching::ShutdownToken;
use teloxide::prelude::*;
use teloxide::types::{
    BotCommand, Chat, DiceEmoji, FileMeta, InputFile, MessageId, MessageOrigin, ReplyParameters,
    User,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::fetch;
use super::{
    ensure_client, first_chunk, split_message, ChatClient, ClientName, CommandClient,
    EventHandler, EventHub, EventKind, GenericMessage, Media, MediaKind, MessageToEdit,
    MessageToSend, PlatformError,
};
use crate::commands::{parse_command, BotCommandSpec, CommandInvocation};
use crate::describe::{DescribedMessage, ForwardOrigin, MessageContent, ReferencedMessage, Sender};

/// Telegram's limit for message text
const TEXT_LIMIT: usize = 4096;

/// Telegram's limit for media captions
const CAPTION_LIMIT: usize = 1024;

/// The bot's own account, learned from getMe on start
#[derive(Debug, Clone, Default)]
pub struct BotIdentity {
    pub user_id: String,
    pub username: Option<String>,
}

struct Running {
    shutdown: ShutdownToken,
    task: JoinHandle<()>,
}

pub struct TelegramClient {
    bot: Bot,
    hub: Arc<EventHub>,
    identity: RwLock<Option<BotIdentity>>,
    running: Mutex<Option<Running>>,
}

impl TelegramClient {
    pub fn new(bot_token: &str) -> Self {
        Self {
            bot: Bot::new(bot_token),
            hub: Arc::new(EventHub::new()),
            identity: RwLock::new(None),
            running: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> Option<BotIdentity> {
        self.identity
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn chat_id(chat_id: &str) -> Result<ChatId, PlatformError> {
        chat_id
            .parse::<i64>()
            .map(ChatId)
            .map_err(|_| PlatformError::InvalidId {
                what: "telegram chat",
                value: chat_id.to_string(),
            })
    }

    /// Remaining chunks of a long message, sent as plain messages
    async fn send_followups(
        &self,
        chat_id: ChatId,
        chunks: impl IntoIterator<Item = String>,
    ) -> Result<()> {
        for chunk in chunks {
            self.bot
                .send_message(chat_id, chunk)
                .await
                .context("Failed to send telegram follow-up chunk")?;
        }
        Ok(())
    }

    fn message_id(message_id: &str) -> Result<MessageId, PlatformError> {
        message_id
            .parse::<i32>()
            .map(MessageId)
            .map_err(|_| PlatformError::InvalidId {
                what: "telegram message",
                value: message_id.to_string(),
            })
    }
}

#[async_trait]
impl ChatClient for TelegramClient {
    fn name(&self) -> ClientName {
        ClientName::Telegram
    }

    fn own_user_id(&self) -> Option<String> {
        self.identity().map(|i| i.user_id)
    }

    async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!("Telegram client already running");
            return Ok(());
        }

        let me = self.bot.get_me().await.context("Telegram getMe failed")?;
        let identity = BotIdentity {
            user_id: me.user.id.0.to_string(),
            username: me.user.username.clone(),
        };
        info!(
            "Telegram bot identified as {} ({})",
            identity.username.as_deref().unwrap_or("?"),
            identity.user_id
        );
        *self.identity.write().unwrap_or_else(|e| e.into_inner()) = Some(identity);

        let handler = dptree::entry()
            .branch(Update::filter_message().endpoint(handle_message))
            .branch(Update::filter_edited_message().endpoint(handle_edited_message));

        let mut dispatcher = Dispatcher::builder(self.bot.clone(), handler)
            .dependencies(dptree::deps![Arc::clone(&self.hub)])
            .default_handler(|upd| async move {
                trace!("Unhandled update: {:?}", upd.id);
            })
            .error_handler(LoggingErrorHandler::with_custom_text("telegram"))
            .build();

        let shutdown = dispatcher.shutdown_token();
        let task = tokio::spawn(async move {
            dispatcher.dispatch().await;
        });

        *running = Some(Running { shutdown, task });
        info!("Telegram client started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        match running.shutdown.shutdown() {
            Ok(done) => done.await,
            Err(_) => running.task.abort(),
        }
        info!("Telegram client stopped");
        Ok(())
    }

    fn on(&self, kind: EventKind, handler: EventHandler) {
        self.hub.on(kind, handler);
    }

    async fn send_message(&self, message: MessageToSend) -> Result<GenericMessage> {
        ensure_client(ClientName::Telegram, message.client_name)?;
        let chat_id = Self::chat_id(&message.chat_id)?;
        let reply = message
            .reply_to_id
            .as_deref()
            .map(Self::message_id)
            .transpose()?
            .map(ReplyParameters::new);

        let sent = match &message.media {
            None => {
                let mut chunks = text_chunks(&message.text).into_iter();
                let first = chunks.next().unwrap_or_default();
                let mut req = self.bot.send_message(chat_id, first);
                if let Some(reply) = reply {
                    req = req.reply_parameters(reply);
                }
                let sent = req.await?;
                self.send_followups(chat_id, chunks).await?;
                sent
            }
            Some(media) => {
                let url = reqwest::Url::parse(&media.url)
                    .with_context(|| format!("Invalid media URL: {}", media.url))?;
                let file = InputFile::url(url);
                let as_sticker = sends_as_sticker(media);
                let (caption, followups) = if as_sticker {
                    // Stickers carry no caption
                    (None, text_chunks(&message.text))
                } else {
                    caption_chunks(&message.text)
                };

                let sent = if as_sticker {
                    let mut req = self.bot.send_sticker(chat_id, file);
                    if let Some(reply) = reply {
                        req = req.reply_parameters(reply);
                    }
                    req.await?
                } else {
                    match media.kind {
                        MediaKind::Sticker | MediaKind::Photo => {
                            let mut req = self.bot.send_photo(chat_id, file);
                            if let Some(text) = caption {
                                req = req.caption(text);
                            }
                            if let Some(reply) = reply {
                                req = req.reply_parameters(reply);
                            }
                            req.await?
                        }
                        MediaKind::Video => {
                            let mut req = self.bot.send_video(chat_id, file);
                            if let Some(text) = caption {
                                req = req.caption(text);
                            }
                            if let Some(reply) = reply {
                                req = req.reply_parameters(reply);
                            }
                            req.await?
                        }
                        MediaKind::File => {
                            let mut req = self.bot.send_document(chat_id, file);
                            if let Some(text) = caption {
                                req = req.caption(text);
                            }
                            if let Some(reply) = reply {
                                req = req.reply_parameters(reply);
                            }
                            req.await?
                        }
                    }
                };
                self.send_followups(chat_id, followups).await?;
                sent
            }
        };

        debug!("Sent telegram message {} to {}", sent.id.0, chat_id.0);
        Ok(to_generic(&sent, message.media))
    }

    async fn edit_message(&self, message: MessageToEdit) -> Result<()> {
        ensure_client(ClientName::Telegram, message.client_name)?;
        let chat_id = Self::chat_id(&message.chat_id)?;
        let message_id = Self::message_id(&message.message_id)?;
        let text = message.rendered_text();

        if let Err(e) = self
            .bot
            .edit_message_text(chat_id, message_id, first_chunk(&text, TEXT_LIMIT))
            .await
        {
            // Media messages only have a caption to edit
            debug!("Text edit failed ({}), retrying as caption edit", e);
            self.bot
                .edit_message_caption(chat_id, message_id)
                .caption(first_chunk(&text, CAPTION_LIMIT))
                .await
                .context("Failed to edit telegram message")?;
        }
        Ok(())
    }

    fn commands(&self) -> Option<&dyn CommandClient> {
        Some(self)
    }
}

#[async_trait]
impl CommandClient for TelegramClient {
    async fn set_command_list(&self, commands: &[BotCommandSpec]) -> Result<()> {
        let commands = commands
            .iter()
            .map(|c| BotCommand::new(c.command.clone(), c.description.clone()));
        self.bot
            .set_my_commands(commands)
            .await
            .context("Failed to register telegram commands")?;
        Ok(())
    }

    fn try_execute_command(&self, message: &GenericMessage) -> Option<CommandInvocation> {
        if message.client_name != ClientName::Telegram {
            return None;
        }
        let username = self.identity().and_then(|i| i.username);
        parse_command(&message.text, username.as_deref())
    }
}

async fn handle_message(bot: Bot, msg: Message, hub: Arc<EventHub>) -> ResponseResult<()> {
    let media = resolve_media(&bot, &msg).await;
    let generic = to_generic(&msg, media);
    debug!(
        "Telegram message from {} ({}) in {}",
        generic.user_name, generic.user_id, generic.chat_id
    );
    hub.emit(EventKind::Message, generic).await;
    Ok(())
}

async fn handle_edited_message(bot: Bot, msg: Message, hub: Arc<EventHub>) -> ResponseResult<()> {
    let media = resolve_media(&bot, &msg).await;
    hub.emit(EventKind::EditMessage, to_generic(&msg, media))
        .await;
    Ok(())
}

/// Text that must go out as separate messages, in Telegram-sized chunks
pub fn text_chunks(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    split_message(text, TEXT_LIMIT)
}

/// Caption for a media message plus whatever does not fit in it
pub fn caption_chunks(text: &str) -> (Option<String>, Vec<String>) {
    if text.is_empty() {
        return (None, Vec::new());
    }
    let caption = first_chunk(text, CAPTION_LIMIT);
    let rest = text_chunks(&text[caption.len()..]);
    (Some(caption), rest)
}

/// Telegram only accepts WEBP, TGS and WEBM files as stickers
fn sends_as_sticker(media: &Media) -> bool {
    if media.kind != MediaKind::Sticker {
        return false;
    }
    if media.mime_type.as_deref() == Some("image/webp") {
        return true;
    }
    fetch::file_name(&media.url).is_some_and(|name| {
        let name = name.to_ascii_lowercase();
        name.ends_with(".webp") || name.ends_with(".tgs") || name.ends_with(".webm")
    })
}

/// The file behind a message's media, with the kind it should be relayed as
fn media_file(msg: &Message) -> Option<(MediaKind, &FileMeta, Option<String>)> {
    if let Some(photo) = msg.photo().and_then(|sizes| sizes.last()) {
        return Some((MediaKind::Photo, &photo.file, None));
    }
    if let Some(sticker) = msg.sticker() {
        return Some((MediaKind::Sticker, &sticker.file, None));
    }
    if let Some(video) = msg.video() {
        let mime = video.mime_type.as_ref().map(|m| m.to_string());
        return Some((MediaKind::Video, &video.file, mime));
    }
    if let Some(animation) = msg.animation() {
        let mime = animation.mime_type.as_ref().map(|m| m.to_string());
        return Some((MediaKind::Video, &animation.file, mime));
    }
    if let Some(document) = msg.document() {
        let mime = document.mime_type.as_ref().map(|m| m.to_string());
        return Some((MediaKind::File, &document.file, mime));
    }
    None
}

/// Resolve a downloadable URL for the message's media. Failures only drop the media.
async fn resolve_media(bot: &Bot, msg: &Message) -> Option<Media> {
    let (kind, meta, mime_type) = media_file(msg)?;
    match bot.get_file(meta.id.clone()).await {
        Ok(file) => Some(Media {
            kind,
            url: format!("https://api.telegram.org/file/bot{}/{}", bot.token(), file.path),
            mime_type,
            size: Some(u64::from(meta.size)),
        }),
        Err(e) => {
            warn!("Failed to resolve telegram file {:?}: {}", meta.id, e);
            None
        }
    }
}

fn full_name(user: &User) -> String {
    user.full_name()
}

fn chat_name(chat: &Chat) -> String {
    chat.title()
        .or_else(|| chat.username())
        .or_else(|| chat.first_name())
        .map(str::to_string)
        .unwrap_or_else(|| chat.id.0.to_string())
}

fn message_text(msg: &Message) -> Option<&str> {
    msg.text().or_else(|| msg.caption())
}

pub fn to_generic(msg: &Message, media: Option<Media>) -> GenericMessage {
    let (user_id, user_name) = match (&msg.from, &msg.sender_chat) {
        (_, Some(chat)) => (chat.id.0.to_string(), chat_name(chat)),
        (Some(user), None) => (user.id.0.to_string(), full_name(user)),
        (None, None) => (msg.chat.id.0.to_string(), chat_name(&msg.chat)),
    };

    GenericMessage {
        client_name: ClientName::Telegram,
        text: message_text(msg).unwrap_or_default().to_string(),
        user_id,
        user_name,
        chat_id: msg.chat.id.0.to_string(),
        message_id: msg.id.0.to_string(),
        date: msg.date.timestamp(),
        media,
        reply_to_id: msg.reply_to_message().map(|r| r.id.0.to_string()),
        raw_message: serde_json::to_value(msg).ok(),
        raw_user: msg.from.as_ref().and_then(|u| serde_json::to_value(u).ok()),
        raw_reply: msg
            .reply_to_message()
            .and_then(|r| serde_json::to_value(r).ok()),
    }
}

fn sender_from_user(user: &User) -> Sender {
    Sender {
        id: user.id.0.to_string(),
        name: full_name(user),
        is_bot: user.is_bot,
    }
}

fn message_sender(msg: &Message) -> Sender {
    if let Some(chat) = &msg.sender_chat {
        return Sender::new(chat.id.0.to_string(), chat_name(chat));
    }
    match &msg.from {
        Some(user) => sender_from_user(user),
        None => Sender::new(msg.chat.id.0.to_string(), chat_name(&msg.chat)),
    }
}

fn dice_emoji(emoji: &DiceEmoji) -> &'static str {
    #[allow(unreachable_patterns)]
    match emoji {
        DiceEmoji::Dice => "🎲",
        DiceEmoji::Darts => "🎯",
        DiceEmoji::Basketball => "🏀",
        DiceEmoji::Football => "⚽",
        DiceEmoji::Bowling => "🎳",
        DiceEmoji::SlotMachine => "🎰",
        _ => "🎲",
    }
}

fn content_of(msg: &Message) -> MessageContent {
    if msg.audio().is_some() {
        MessageContent::Audio
    } else if let Some(doc) = msg.document() {
        MessageContent::Document {
            file_name: doc.file_name.clone(),
        }
    } else if msg.animation().is_some() {
        MessageContent::Animation
    } else if msg.photo().is_some() {
        MessageContent::Photo
    } else if let Some(sticker) = msg.sticker() {
        MessageContent::Sticker {
            set_name: sticker.set_name.clone(),
        }
    } else if msg.video().is_some() {
        MessageContent::Video
    } else if msg.video_note().is_some() {
        MessageContent::VideoNote
    } else if let Some(voice) = msg.voice() {
        MessageContent::Voice {
            duration_secs: voice.duration.seconds(),
        }
    } else if let Some(contact) = msg.contact() {
        MessageContent::Contact {
            first_name: contact.first_name.clone(),
            last_name: contact.last_name.clone(),
        }
    } else if let Some(dice) = msg.dice() {
        MessageContent::Dice {
            emoji: dice_emoji(&dice.emoji).to_string(),
            value: dice.value,
        }
    } else if let Some(game) = msg.game() {
        MessageContent::Game {
            title: game.title.clone(),
        }
    } else if let Some(poll) = msg.poll() {
        MessageContent::Poll {
            question: poll.question.clone(),
        }
    } else if let Some(venue) = msg.venue() {
        // A venue also carries a location, so it is checked first
        MessageContent::Venue {
            title: venue.title.clone(),
        }
    } else if let Some(location) = msg.location() {
        MessageContent::Location {
            latitude: location.latitude,
            longitude: location.longitude,
        }
    } else {
        MessageContent::None
    }
}

/// Full description input for a native telegram message
pub fn described_from_telegram(msg: &Message) -> DescribedMessage {
    let forward = msg.forward_origin().map(|origin| match origin {
        MessageOrigin::User { sender_user, .. } => {
            ForwardOrigin::User(sender_from_user(sender_user))
        }
        MessageOrigin::HiddenUser {
            sender_user_name, ..
        } => ForwardOrigin::HiddenUser(sender_user_name.clone()),
        MessageOrigin::Chat { sender_chat, .. } => ForwardOrigin::Chat(chat_name(sender_chat)),
        MessageOrigin::Channel { chat, .. } => ForwardOrigin::Chat(chat_name(chat)),
    });

    let reply_to = msg.reply_to_message().map(|reply| ReferencedMessage {
        sender: Some(message_sender(reply)),
        text: message_text(reply).map(str::to_string),
    });

    DescribedMessage {
        sender: message_sender(msg),
        forward,
        reply_to,
        via_bot: msg.via_bot.as_ref().map(sender_from_user),
        content: content_of(msg),
        text: message_text(msg).map(str::to_string),
    }
}

/// Describe input for a telegram-produced generic message, recovering the
/// native payload when it is attached.
pub fn described_from_generic(msg: &GenericMessage) -> DescribedMessage {
    msg.raw_message
        .clone()
        .and_then(|raw| serde_json::from_value::<Message>(raw).ok())
        .map(|native| described_from_telegram(&native))
        .unwrap_or_else(|| DescribedMessage::from_generic(msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::describe::{describe, DescribeContext, ProfileNameFormatter};
    use serde_json::json;

    fn parse(value: serde_json::Value) -> Message {
        serde_json::from_value(value).unwrap()
    }

    fn group() -> serde_json::Value {
        json!({"id": -1001234, "type": "supergroup", "title": "Bridge"})
    }

    fn alice() -> serde_json::Value {
        json!({"id": 42, "is_bot": false, "first_name": "Alice", "last_name": "Liddell"})
    }

    #[test]
    fn test_text_message_to_generic() {
        let msg = parse(json!({
            "message_id": 7,
            "date": 1700000000,
            "chat": group(),
            "from": alice(),
            "text": "hello"
        }));
        let generic = to_generic(&msg, None);
        assert_eq!(generic.client_name, ClientName::Telegram);
        assert_eq!(generic.text, "hello");
        assert_eq!(generic.user_id, "42");
        assert_eq!(generic.user_name, "Alice Liddell");
        assert_eq!(generic.chat_id, "-1001234");
        assert_eq!(generic.message_id, "7");
        assert_eq!(generic.date, 1700000000);
        assert!(generic.reply_to_id.is_none());
        assert!(generic.raw_message.is_some());
    }

    #[test]
    fn test_document_with_caption_is_described() {
        let msg = parse(json!({
            "message_id": 8,
            "date": 1700000000,
            "chat": group(),
            "from": alice(),
            "caption": "see attached",
            "document": {"file_id": "f", "file_unique_id": "u", "file_name": "report.pdf"}
        }));
        let described = described_from_telegram(&msg);
        assert_eq!(
            described.content,
            MessageContent::Document {
                file_name: Some("report.pdf".to_string())
            }
        );
        assert_eq!(described.text.as_deref(), Some("see attached"));
        assert_eq!(to_generic(&msg, None).text, "see attached");
    }

    #[test]
    fn test_reply_keeps_referenced_sender_and_text() {
        let msg = parse(json!({
            "message_id": 9,
            "date": 1700000000,
            "chat": group(),
            "from": {"id": 7, "is_bot": false, "first_name": "Carol"},
            "text": "agreed",
            "reply_to_message": {
                "message_id": 3,
                "date": 1699999999,
                "chat": group(),
                "from": {
                    "id": 999,
                    "is_bot": true,
                    "first_name": "Bridge",
                    "username": "bridge_bot"
                },
                "text": "Alice: hello"
            }
        }));
        let generic = to_generic(&msg, None);
        assert_eq!(generic.reply_to_id.as_deref(), Some("3"));

        let described = described_from_generic(&generic);
        let reply = described.reply_to.unwrap();
        assert_eq!(reply.sender.unwrap().id, "999");
        assert_eq!(reply.text.as_deref(), Some("Alice: hello"));
    }

    #[test]
    fn test_generic_without_raw_falls_back() {
        let msg = parse(json!({
            "message_id": 7,
            "date": 1700000000,
            "chat": group(),
            "from": alice(),
            "text": "hello"
        }));
        let mut generic = to_generic(&msg, None);
        generic.raw_message = None;
        let described = described_from_generic(&generic);
        assert_eq!(described.sender.name, "Alice Liddell");
        assert_eq!(described.text.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_reply_to_channel_post_names_the_channel() {
        let msg = parse(json!({
            "message_id": 10,
            "date": 1700000000,
            "chat": group(),
            "from": {"id": 7, "is_bot": false, "first_name": "Carol"},
            "text": "agreed",
            "reply_to_message": {
                "message_id": 4,
                "date": 1699999999,
                "chat": group(),
                "sender_chat": {"id": -100777, "type": "channel", "title": "News"},
                "text": "announcement"
            }
        }));
        let described = described_from_telegram(&msg);
        let reply = described.reply_to.as_ref().unwrap();
        assert_eq!(reply.sender.as_ref().unwrap().name, "News");

        let text = describe(&described, &DescribeContext::default(), &ProfileNameFormatter).await;
        assert_eq!(text, "Carol: [回复给：News] agreed");
    }

    #[test]
    fn test_long_text_is_split_at_telegram_limit() {
        let chunks = text_chunks(&"a".repeat(5000));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), TEXT_LIMIT);
        assert_eq!(chunks[1].len(), 5000 - TEXT_LIMIT);
        assert!(text_chunks("").is_empty());
    }

    #[test]
    fn test_long_caption_overflows_into_followups() {
        let (caption, rest) = caption_chunks(&"b".repeat(1500));
        assert_eq!(caption.map(|c| c.len()), Some(CAPTION_LIMIT));
        assert_eq!(rest, vec!["b".repeat(1500 - CAPTION_LIMIT)]);

        let (caption, rest) = caption_chunks("short");
        assert_eq!(caption.as_deref(), Some("short"));
        assert!(rest.is_empty());
        assert_eq!(caption_chunks(""), (None, Vec::new()));
    }

    #[test]
    fn test_only_webp_stickers_are_sent_as_stickers() {
        let sticker = |url: &str, mime: Option<&str>| Media {
            kind: MediaKind::Sticker,
            url: url.to_string(),
            mime_type: mime.map(str::to_string),
            size: None,
        };
        assert!(sends_as_sticker(&sticker(
            "https://api.telegram.org/file/botT/stickers/file_1.webp",
            None
        )));
        assert!(sends_as_sticker(&sticker("https://cdn.example/s", Some("image/webp"))));
        assert!(!sends_as_sticker(&sticker(
            "https://media.discordapp.net/stickers/123.png",
            Some("image/png")
        )));

        let mut photo = sticker("https://cdn.example/a.webp", None);
        photo.kind = MediaKind::Photo;
        assert!(!sends_as_sticker(&photo));
    }

    #[test]
    fn test_invalid_ids_are_rejected() {
        assert!(TelegramClient::chat_id("abc").is_err());
        assert_eq!(TelegramClient::chat_id("-100").unwrap(), ChatId(-100));
        assert!(TelegramClient::message_id("1.5").is_err());
    }
}
