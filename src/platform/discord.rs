use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use twilight_gateway::{
    self as gateway, CloseFrame, Config, Event, EventTypeFlags, Intents, MessageSender, Shard,
    StreamExt,
};
use twilight_http::client::ClientBuilder;
use twilight_http::Client as HttpClient;
use twilight_model::channel::message::sticker::StickerFormatType;
use twilight_model::channel::Message;
use twilight_model::http::attachment::Attachment;
use twilight_model::id::marker::{ChannelMarker, MessageMarker, UserMarker};
use twilight_model::id::Id;

use super::fetch::{self, fetch_limited};
use super::{
    ensure_client, first_chunk, split_message, ChatClient, ClientName, EventHandler, EventHub,
    EventKind, GenericMessage, Media, MediaKind, MessageToEdit, MessageToSend, PlatformError,
};

/// Discord's limit for message content
const CONTENT_LIMIT: usize = 2000;

/// Largest file the bot re-uploads as an attachment
const MAX_ATTACHMENT_BYTES: usize = 8 * 1024 * 1024;

type SelfId = Arc<RwLock<Option<Id<UserMarker>>>>;

struct Running {
    senders: Vec<MessageSender>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct DiscordClient {
    token: String,
    http: Arc<HttpClient>,
    fetcher: reqwest::Client,
    hub: Arc<EventHub>,
    self_id: SelfId,
    running: Mutex<Option<Running>>,
}

impl DiscordClient {
    pub fn new(token: &str) -> Self {
        let http = ClientBuilder::new()
            .token(token.to_string())
            .timeout(Duration::from_secs(30))
            .build();
        Self {
            token: token.to_string(),
            http: Arc::new(http),
            fetcher: reqwest::Client::new(),
            hub: Arc::new(EventHub::new()),
            self_id: Arc::new(RwLock::new(None)),
            running: Mutex::new(None),
        }
    }

    fn channel_id(value: &str) -> Result<Id<ChannelMarker>, PlatformError> {
        value
            .parse::<Id<ChannelMarker>>()
            .map_err(|_| PlatformError::InvalidId {
                what: "discord channel",
                value: value.to_string(),
            })
    }

    fn message_id(value: &str) -> Result<Id<MessageMarker>, PlatformError> {
        value
            .parse::<Id<MessageMarker>>()
            .map_err(|_| PlatformError::InvalidId {
                what: "discord message",
                value: value.to_string(),
            })
    }

    /// Download media so it can be attached. Oversized or unreachable media is skipped.
    async fn attachment_for(&self, media: &Media) -> Option<Attachment> {
        match fetch_limited(&self.fetcher, &media.url, MAX_ATTACHMENT_BYTES).await {
            Ok(Some(fetched)) => {
                let name = fetch::file_name(&media.url)
                    .unwrap_or_else(|| default_file_name(media.kind).to_string());
                Some(Attachment::from_bytes(name, fetched.bytes, 1))
            }
            Ok(None) => {
                warn!("Media {} too large to attach", media.url);
                None
            }
            Err(e) => {
                warn!("Failed to fetch media for discord: {:#}", e);
                None
            }
        }
    }
}

/// Message content split to fit Discord's limit. Empty text yields no chunks.
pub fn content_chunks(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    split_message(text, CONTENT_LIMIT)
}

fn default_file_name(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Sticker => "sticker.png",
        MediaKind::Photo => "photo.jpg",
        MediaKind::Video => "video.mp4",
        MediaKind::File => "file",
    }
}

async fn shard_runner(mut shard: Shard, hub: Arc<EventHub>, self_id: SelfId) {
    let shard_id = shard.id().number();
    info!("Discord shard {shard_id} started");

    let wanted =
        EventTypeFlags::READY | EventTypeFlags::MESSAGE_CREATE | EventTypeFlags::MESSAGE_UPDATE;
    while let Some(item) = shard.next_event(wanted).await {
        let event = match item {
            Ok(event) => event,
            Err(err) => {
                error!("Shard {shard_id} => error receiving event: {err:?}");
                continue;
            }
        };

        let me = *self_id.read().unwrap_or_else(|e| e.into_inner());
        match event {
            Event::Ready(ready) => {
                info!("Shard {shard_id} => READY as {} (ID={})", ready.user.name, ready.user.id);
                *self_id.write().unwrap_or_else(|e| e.into_inner()) = Some(ready.user.id);
            }
            Event::MessageCreate(created) => {
                if Some(created.0.author.id) == me {
                    continue;
                }
                let generic = to_generic(&created.0);
                let hub = Arc::clone(&hub);
                tokio::spawn(async move { hub.emit(EventKind::Message, generic).await });
            }
            Event::MessageUpdate(updated) => {
                // Embed unfurls also arrive as updates; only real edits carry a timestamp
                if updated.0.edited_timestamp.is_none() || Some(updated.0.author.id) == me {
                    continue;
                }
                let generic = to_generic(&updated.0);
                let hub = Arc::clone(&hub);
                tokio::spawn(async move { hub.emit(EventKind::EditMessage, generic).await });
            }
            other => {
                trace!("Shard {shard_id} => unhandled event: {:?}", other.kind());
            }
        }
    }

    warn!("Discord shard {shard_id} event loop ended");
}

#[async_trait]
impl ChatClient for DiscordClient {
    fn name(&self) -> ClientName {
        ClientName::Discord
    }

    fn own_user_id(&self) -> Option<String> {
        self.self_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .map(|id| id.to_string())
    }

    async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!("Discord client already running");
            return Ok(());
        }

        let config = Config::new(
            self.token.clone(),
            Intents::GUILDS
                | Intents::GUILD_MESSAGES
                | Intents::DIRECT_MESSAGES
                | Intents::MESSAGE_CONTENT,
        );

        let shards = gateway::create_recommended(&self.http, config, |_, b| b.build())
            .await
            .context("Failed to create discord shards")?;

        let mut state = Running {
            senders: Vec::new(),
            tasks: Vec::new(),
        };
        for shard in shards {
            state.senders.push(shard.sender());
            let hub = Arc::clone(&self.hub);
            let self_id = Arc::clone(&self.self_id);
            state
                .tasks
                .push(tokio::spawn(shard_runner(shard, hub, self_id)));
        }

        info!("Discord client started with {} shard(s)", state.tasks.len());
        *running = Some(state);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(state) = self.running.lock().await.take() else {
            return Ok(());
        };
        for sender in &state.senders {
            let _ = sender.close(CloseFrame::NORMAL);
        }
        for task in state.tasks {
            let _ = task.await;
        }
        info!("Discord client stopped");
        Ok(())
    }

    fn on(&self, kind: EventKind, handler: EventHandler) {
        self.hub.on(kind, handler);
    }

    async fn send_message(&self, message: MessageToSend) -> Result<GenericMessage> {
        ensure_client(ClientName::Discord, message.client_name)?;
        let channel_id = Self::channel_id(&message.chat_id)?;
        let reply = message
            .reply_to_id
            .as_deref()
            .map(Self::message_id)
            .transpose()?;

        let attachments: Vec<Attachment> = match &message.media {
            Some(media) => self.attachment_for(media).await.into_iter().collect(),
            None => Vec::new(),
        };

        let mut chunks = content_chunks(&message.text).into_iter();
        let first = chunks.next();

        let mut req = self.http.create_message(channel_id);
        if let Some(content) = &first {
            req = req.content(content);
        }
        if !attachments.is_empty() {
            req = req.attachments(&attachments);
        }
        if let Some(reply) = reply {
            req = req.reply(reply);
        }

        let sent = req
            .await
            .context("Failed to send discord message")?
            .model()
            .await
            .context("Failed to parse sent discord message")?;

        for chunk in chunks {
            self.http
                .create_message(channel_id)
                .content(&chunk)
                .await
                .context("Failed to send discord follow-up chunk")?;
        }

        debug!("Sent discord message {} to {}", sent.id, channel_id);
        Ok(to_generic(&sent))
    }

    async fn edit_message(&self, message: MessageToEdit) -> Result<()> {
        ensure_client(ClientName::Discord, message.client_name)?;
        let channel_id = Self::channel_id(&message.chat_id)?;
        let message_id = Self::message_id(&message.message_id)?;
        let text = first_chunk(&message.rendered_text(), CONTENT_LIMIT);

        self.http
            .update_message(channel_id, message_id)
            .content(Some(text.as_str()))
            .await
            .context("Failed to edit discord message")?;
        Ok(())
    }
}

fn display_name(msg: &Message) -> String {
    msg.member
        .as_ref()
        .and_then(|m| m.nick.clone())
        .or_else(|| msg.author.global_name.clone())
        .unwrap_or_else(|| msg.author.name.clone())
}

fn media_of(msg: &Message) -> Option<Media> {
    if let Some(sticker) = msg.sticker_items.first() {
        let ext = match sticker.format_type {
            StickerFormatType::Gif => "gif",
            _ => "png",
        };
        return Some(Media {
            kind: MediaKind::Sticker,
            url: format!("https://media.discordapp.net/stickers/{}.{}", sticker.id, ext),
            mime_type: Some(format!("image/{}", ext)),
            size: None,
        });
    }

    let attachment = msg.attachments.first()?;
    let content_type = attachment.content_type.clone();
    let kind = match content_type.as_deref() {
        Some(ct) if ct.starts_with("image/") => MediaKind::Photo,
        Some(ct) if ct.starts_with("video/") => MediaKind::Video,
        _ => MediaKind::File,
    };
    Some(Media {
        kind,
        url: attachment.url.clone(),
        mime_type: content_type,
        size: Some(attachment.size),
    })
}

pub fn to_generic(msg: &Message) -> GenericMessage {
    let reply_to_id = msg
        .reference
        .as_ref()
        .and_then(|r| r.message_id)
        .map(|id| id.to_string());

    GenericMessage {
        client_name: ClientName::Discord,
        text: msg.content.clone(),
        user_id: msg.author.id.to_string(),
        user_name: display_name(msg),
        chat_id: msg.channel_id.to_string(),
        message_id: msg.id.to_string(),
        date: msg.timestamp.as_secs(),
        media: media_of(msg),
        reply_to_id,
        raw_message: serde_json::to_value(msg).ok(),
        raw_user: serde_json::to_value(&msg.author).ok(),
        raw_reply: msg
            .referenced_message
            .as_ref()
            .and_then(|r| serde_json::to_value(r).ok()),
    }
}
