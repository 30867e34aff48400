use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use super::media::mxc_to_http;
use crate::platform::{ClientName, EventKind, GenericMessage, Media, MediaKind};

#[derive(Debug, Deserialize)]
pub struct SyncResponse {
    pub next_batch: String,
    #[serde(default)]
    pub rooms: Rooms,
}

#[derive(Debug, Deserialize, Default)]
pub struct Rooms {
    #[serde(default)]
    pub join: HashMap<String, JoinedRoom>,
}

#[derive(Debug, Deserialize, Default)]
pub struct JoinedRoom {
    #[serde(default)]
    pub timeline: Timeline,
}

#[derive(Debug, Deserialize, Default)]
pub struct Timeline {
    #[serde(default)]
    pub events: Vec<Value>,
}

impl SyncResponse {
    /// Every message or edit in this batch, in timeline order per room
    pub fn messages(&self, own_user_id: &str, base_url: &str) -> Vec<(EventKind, GenericMessage)> {
        self.rooms
            .join
            .iter()
            .flat_map(|(room_id, room)| {
                room.timeline
                    .events
                    .iter()
                    .filter_map(move |ev| classify_event(room_id, ev, own_user_id, base_url))
            })
            .collect()
    }
}

/// `@alice:example.org` -> `alice`
pub fn localpart(user_id: &str) -> &str {
    let trimmed = user_id.strip_prefix('@').unwrap_or(user_id);
    trimmed.split(':').next().unwrap_or(trimmed)
}

/// Drop the `> quoted` fallback block clients prepend to reply bodies
fn strip_reply_fallback(body: &str) -> &str {
    if !body.starts_with("> ") {
        return body;
    }
    match body.find("\n\n") {
        Some(idx) => &body[idx + 2..],
        None => body,
    }
}

fn media_from_content(event_type: &str, content: &Value, base_url: &str) -> Option<Media> {
    let kind = if event_type == "m.sticker" {
        MediaKind::Sticker
    } else {
        match content["msgtype"].as_str()? {
            "m.image" => MediaKind::Photo,
            "m.video" => MediaKind::Video,
            "m.file" | "m.audio" => MediaKind::File,
            _ => return None,
        }
    };
    let mxc = content["url"].as_str()?;
    Some(Media {
        kind,
        url: mxc_to_http(base_url, mxc).unwrap_or_else(|| mxc.to_string()),
        mime_type: content["info"]["mimetype"].as_str().map(str::to_string),
        size: content["info"]["size"].as_u64(),
    })
}

/// Map one timeline event to at most one message or edit event.
///
/// Our own events and non-message events yield `None`.
pub fn classify_event(
    room_id: &str,
    event: &Value,
    own_user_id: &str,
    base_url: &str,
) -> Option<(EventKind, GenericMessage)> {
    let event_type = event["type"].as_str()?;
    if event_type != "m.room.message" && event_type != "m.sticker" {
        return None;
    }
    let sender = event["sender"].as_str()?;
    if sender == own_user_id {
        return None;
    }
    let event_id = event["event_id"].as_str()?;
    let content = &event["content"];
    let relates_to = &content["m.relates_to"];

    let date = event["origin_server_ts"].as_i64().unwrap_or_default() / 1000;

    let base = |message_id: &str, text: String| GenericMessage {
        client_name: ClientName::Matrix,
        text,
        user_id: sender.to_string(),
        user_name: localpart(sender).to_string(),
        chat_id: room_id.to_string(),
        message_id: message_id.to_string(),
        date,
        media: None,
        reply_to_id: None,
        raw_message: Some(event.clone()),
        raw_user: None,
        raw_reply: None,
    };

    if relates_to["rel_type"].as_str() == Some("m.replace") {
        let original = relates_to["event_id"].as_str()?;
        let new_content = &content["m.new_content"];
        let text = new_content["body"]
            .as_str()
            .or_else(|| content["body"].as_str().map(|b| b.trim_start_matches("* ")))
            .unwrap_or_default();
        let mut edit = base(original, text.to_string());
        edit.media = media_from_content(event_type, new_content, base_url);
        return Some((EventKind::EditMessage, edit));
    }

    let reply_to_id = relates_to["m.in_reply_to"]["event_id"]
        .as_str()
        .map(str::to_string);
    let media = media_from_content(event_type, content, base_url);
    let body = content["body"].as_str().unwrap_or_default();
    let text = if media.is_some() {
        // For media the body is the file name unless a separate filename makes it a caption
        match content["filename"].as_str() {
            Some(name) if name != body => body.to_string(),
            _ => String::new(),
        }
    } else if reply_to_id.is_some() {
        strip_reply_fallback(body).to_string()
    } else {
        body.to_string()
    };

    let mut message = base(event_id, text);
    message.media = media;
    message.reply_to_id = reply_to_id;
    Some((EventKind::Message, message))
}
