pub mod media;
pub mod sync;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use self::media::{
    parse_mxc, Reservation, UploadCache, UploadState, MAX_MEDIA_BYTES, UPLOAD_TIMEOUT,
};
use self::sync::{localpart, SyncResponse};
use super::fetch::{self, fetch_limited};
use super::{
    ensure_client, ChatClient, ClientName, EventHandler, EventHub, EventKind, GenericMessage,
    Media, MediaKind, MessageToEdit, MessageToSend,
};
use crate::config::MatrixConfig;

const WHOAMI_RETRY: Duration = Duration::from_secs(5);
const SYNC_RETRY: Duration = Duration::from_secs(5);
const SYNC_TIMEOUT_MS: u64 = 30_000;

#[derive(Deserialize)]
struct WhoAmI {
    user_id: String,
}

#[derive(Deserialize)]
struct SendResponse {
    event_id: String,
}

#[derive(Deserialize)]
struct CreateContentResponse {
    content_uri: String,
}

/// Shared between the client handle, the sync loop and upload tasks
struct Inner {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
    hub: EventHub,
    user_id: RwLock<Option<String>>,
    uploads: UploadCache,
}

impl Inner {
    fn url(&self, segments: &[&str]) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .with_context(|| format!("Invalid home server URL: {}", self.base_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("Home server URL cannot be a base: {}", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Matrix {} failed ({}): {}", what, status, body);
        }
        Ok(response)
    }

    fn own_user_id(&self) -> String {
        self.user_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_default()
    }

    async fn whoami(&self) -> Result<String> {
        let url = self.url(&["_matrix", "client", "v3", "account", "whoami"])?;
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .context("Failed to call whoami")?;
        let who: WhoAmI = Self::check(response, "whoami")
            .await?
            .json()
            .await
            .context("Failed to parse whoami response")?;
        Ok(who.user_id)
    }

    async fn sync(&self, since: Option<&str>, timeout_ms: u64) -> Result<SyncResponse> {
        let url = self.url(&["_matrix", "client", "v3", "sync"])?;
        let mut query = vec![("timeout", timeout_ms.to_string())];
        if let Some(since) = since {
            query.push(("since", since.to_string()));
        }
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.access_token)
            .query(&query)
            .timeout(Duration::from_millis(timeout_ms) + Duration::from_secs(30))
            .send()
            .await
            .context("Failed to call sync")?;
        Self::check(response, "sync")
            .await?
            .json()
            .await
            .context("Failed to parse sync response")
    }

    async fn send_event(&self, room_id: &str, event_type: &str, content: &Value) -> Result<String> {
        let txn = Uuid::new_v4().to_string();
        let url = self.url(&[
            "_matrix", "client", "v3", "rooms", room_id, "send", event_type, &txn,
        ])?;
        let response = self
            .http
            .put(url)
            .bearer_auth(&self.access_token)
            .json(content)
            .send()
            .await
            .context("Failed to send matrix event")?;
        let sent: SendResponse = Self::check(response, "send")
            .await?
            .json()
            .await
            .context("Failed to parse send response")?;
        Ok(sent.event_id)
    }

    /// Reserve an `mxc://` URI whose bytes are uploaded later
    async fn create_content(&self) -> Result<String> {
        let url = self.url(&["_matrix", "media", "v1", "create"])?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .context("Failed to reserve matrix media")?;
        let created: CreateContentResponse = Self::check(response, "media create")
            .await?
            .json()
            .await
            .context("Failed to parse media create response")?;
        Ok(created.content_uri)
    }

    async fn upload_content(&self, mxc: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let (server, media_id) =
            parse_mxc(mxc).with_context(|| format!("Malformed content URI: {}", mxc))?;
        let url = self.url(&["_matrix", "media", "v3", "upload", server, media_id])?;
        let response = self
            .http
            .put(url)
            .bearer_auth(&self.access_token)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .timeout(UPLOAD_TIMEOUT)
            .body(bytes)
            .send()
            .await
            .context("Failed to upload matrix media")?;
        Self::check(response, "upload").await?;
        Ok(())
    }

    /// Fetch `media.url` and upload it into the reserved URI. Oversized
    /// resources are dropped quietly.
    async fn upload_in_background(self: Arc<Self>, media: Media, mxc: String) {
        let fetched = match fetch_limited(&self.http, &media.url, MAX_MEDIA_BYTES).await {
            Ok(Some(fetched)) => fetched,
            Ok(None) => {
                debug!("Not uploading {}: larger than {} bytes", media.url, MAX_MEDIA_BYTES);
                self.uploads.forget(&media.url);
                return;
            }
            Err(e) => {
                warn!("Failed to fetch media for matrix: {:#}", e);
                self.uploads.forget(&media.url);
                return;
            }
        };

        let content_type = media
            .mime_type
            .clone()
            .or(fetched.content_type)
            .unwrap_or_else(|| "application/octet-stream".to_string());

        match self.upload_content(&mxc, fetched.bytes, &content_type).await {
            Ok(()) => {
                debug!("Uploaded {} as {}", media.url, mxc);
                self.uploads.complete(&media.url);
            }
            Err(e) => {
                warn!("Matrix upload of {} failed: {:#}", media.url, e);
                self.uploads.forget(&media.url);
            }
        }
    }

    /// `mxc://` URI for `media`, starting an upload if this URL was never seen.
    /// Returns before the upload finishes.
    async fn content_uri(self: &Arc<Self>, media: &Media) -> Result<String> {
        if let Some((mxc, state)) = self.uploads.lookup(&media.url) {
            if state == UploadState::Pending {
                debug!("Reusing in-flight upload {} for {}", mxc, media.url);
            }
            return Ok(mxc);
        }
        let reserved = self.create_content().await?;
        match self.uploads.reserve(&media.url, reserved) {
            Reservation::Existing(mxc) => Ok(mxc),
            Reservation::Claimed(mxc) => {
                tokio::spawn(Arc::clone(self).upload_in_background(media.clone(), mxc.clone()));
                Ok(mxc)
            }
        }
    }

    async fn sync_loop(self: Arc<Self>) {
        // Initial sync only establishes the position; backlog is not relayed
        let mut since = loop {
            match self.sync(None, 0).await {
                Ok(resp) => break resp.next_batch,
                Err(e) => {
                    warn!("Initial matrix sync failed: {:#}", e);
                    tokio::time::sleep(SYNC_RETRY).await;
                }
            }
        };
        info!("Matrix sync started");

        loop {
            match self.sync(Some(&since), SYNC_TIMEOUT_MS).await {
                Ok(resp) => {
                    let own = self.own_user_id();
                    for (kind, message) in resp.messages(&own, &self.base_url) {
                        self.hub.emit(kind, message).await;
                    }
                    since = resp.next_batch;
                }
                Err(e) => {
                    error!("Matrix sync failed: {:#}", e);
                    tokio::time::sleep(SYNC_RETRY).await;
                }
            }
        }
    }
}

pub struct MatrixClient {
    inner: Arc<Inner>,
    running: Mutex<Option<JoinHandle<()>>>,
}

impl MatrixClient {
    pub fn new(config: &MatrixConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                http: reqwest::Client::new(),
                base_url: config.base_url(),
                access_token: config.access_token.clone(),
                hub: EventHub::new(),
                user_id: RwLock::new(None),
                uploads: UploadCache::new(),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn user_id(&self) -> Option<String> {
        self.inner
            .user_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn own_generic(
        &self,
        room_id: &str,
        event_id: String,
        text: String,
        media: Option<Media>,
        reply_to_id: Option<String>,
    ) -> GenericMessage {
        let user_id = self.inner.own_user_id();
        GenericMessage {
            client_name: ClientName::Matrix,
            text,
            user_name: localpart(&user_id).to_string(),
            user_id,
            chat_id: room_id.to_string(),
            message_id: event_id,
            date: chrono::Utc::now().timestamp(),
            media,
            reply_to_id,
            raw_message: None,
            raw_user: None,
            raw_reply: None,
        }
    }
}

/// Event type and content for an outbound message
pub fn message_content(message: &MessageToSend, mxc: Option<&str>) -> (&'static str, Value) {
    let mut content = match (&message.media, mxc) {
        (Some(media), Some(mxc)) => {
            let file_name = fetch::file_name(&media.url).unwrap_or_else(|| "file".to_string());
            let body = if message.text.is_empty() {
                file_name.clone()
            } else {
                message.text.clone()
            };
            let mut info = serde_json::Map::new();
            if let Some(mime) = &media.mime_type {
                info.insert("mimetype".to_string(), json!(mime));
            }
            if let Some(size) = media.size {
                info.insert("size".to_string(), json!(size));
            }
            let mut content = json!({
                "body": body,
                "filename": file_name,
                "url": mxc,
                "info": info,
            });
            let msgtype = match media.kind {
                MediaKind::Sticker => None,
                MediaKind::Photo => Some("m.image"),
                MediaKind::Video => Some("m.video"),
                MediaKind::File => Some("m.file"),
            };
            if let Some(msgtype) = msgtype {
                content["msgtype"] = json!(msgtype);
            }
            content
        }
        _ => json!({"msgtype": "m.text", "body": message.text}),
    };

    if let Some(reply) = &message.reply_to_id {
        content["m.relates_to"] = json!({"m.in_reply_to": {"event_id": reply}});
    }

    let event_type = match (&message.media, mxc) {
        (Some(media), Some(_)) if media.kind == MediaKind::Sticker => "m.sticker",
        _ => "m.room.message",
    };
    (event_type, content)
}

/// Replacement content for an edit
pub fn edit_content(message: &MessageToEdit) -> Value {
    let text = message.rendered_text();
    json!({
        "msgtype": "m.text",
        "body": format!("* {}", text),
        "m.new_content": {"msgtype": "m.text", "body": text},
        "m.relates_to": {"rel_type": "m.replace", "event_id": message.message_id},
    })
}

#[async_trait]
impl ChatClient for MatrixClient {
    fn name(&self) -> ClientName {
        ClientName::Matrix
    }

    fn own_user_id(&self) -> Option<String> {
        self.user_id()
    }

    async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!("Matrix client already running");
            return Ok(());
        }

        let user_id = loop {
            match self.inner.whoami().await {
                Ok(id) => break id,
                Err(e) => {
                    warn!("Matrix whoami failed, retrying in {:?}: {:#}", WHOAMI_RETRY, e);
                    tokio::time::sleep(WHOAMI_RETRY).await;
                }
            }
        };
        info!("Matrix bot identified as {}", user_id);
        *self.inner.user_id.write().unwrap_or_else(|e| e.into_inner()) = Some(user_id);

        *running = Some(tokio::spawn(Arc::clone(&self.inner).sync_loop()));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(task) = self.running.lock().await.take() {
            task.abort();
            info!("Matrix client stopped");
        }
        Ok(())
    }

    fn on(&self, kind: EventKind, handler: EventHandler) {
        self.inner.hub.on(kind, handler);
    }

    async fn send_message(&self, message: MessageToSend) -> Result<GenericMessage> {
        ensure_client(ClientName::Matrix, message.client_name)?;

        let mxc = match &message.media {
            Some(media) => Some(self.inner.content_uri(media).await?),
            None => None,
        };
        let (event_type, content) = message_content(&message, mxc.as_deref());
        let event_id = self
            .inner
            .send_event(&message.chat_id, event_type, &content)
            .await?;

        debug!("Sent matrix event {} to {}", event_id, message.chat_id);
        Ok(self.own_generic(
            &message.chat_id,
            event_id,
            message.text,
            message.media,
            message.reply_to_id,
        ))
    }

    async fn edit_message(&self, message: MessageToEdit) -> Result<()> {
        ensure_client(ClientName::Matrix, message.client_name)?;
        let content = edit_content(&message);
        self.inner
            .send_event(&message.chat_id, "m.room.message", &content)
            .await?;
        Ok(())
    }
}
