use std::collections::{HashMap, VecDeque};

use crate::platform::ClientName;

/// One side of a bridged conversation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub client: ClientName,
    pub chat_id: String,
}

impl Endpoint {
    pub fn new(client: ClientName, chat_id: impl Into<String>) -> Self {
        Self {
            client,
            chat_id: chat_id.into(),
        }
    }
}

/// Where a message arriving from `source` should be relayed.
///
/// The Telegram chat is the hub of every bridge: Discord channels and Matrix
/// rooms are attached to it, and a message fans out to every other side.
pub fn fan_out(
    source: ClientName,
    hub_chat: &str,
    discord_channel: Option<&str>,
    matrix_room: Option<&str>,
) -> Vec<Endpoint> {
    let mut targets = vec![Endpoint::new(ClientName::Telegram, hub_chat)];
    if let Some(channel) = discord_channel {
        targets.push(Endpoint::new(ClientName::Discord, channel));
    }
    if let Some(room) = matrix_room {
        targets.push(Endpoint::new(ClientName::Matrix, room));
    }
    targets.retain(|t| t.client != source);
    targets
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub endpoint: Endpoint,
    pub message_id: String,
}

impl MessageKey {
    pub fn new(client: ClientName, chat_id: &str, message_id: &str) -> Self {
        Self {
            endpoint: Endpoint::new(client, chat_id),
            message_id: message_id.to_string(),
        }
    }
}

/// Bounded record of which messages are relayed copies of each other.
///
/// Links are stored in both directions so replies to a copy can be mapped
/// back, and edits of the original reach every copy.
pub struct RelayLog {
    capacity: usize,
    links: HashMap<MessageKey, Vec<MessageKey>>,
    order: VecDeque<MessageKey>,
}

impl RelayLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            links: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn touch(&mut self, key: &MessageKey) {
        if !self.links.contains_key(key) {
            self.links.insert(key.clone(), Vec::new());
            self.order.push_back(key.clone());
        }
    }

    fn evict(&mut self) {
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                if let Some(peers) = self.links.remove(&old) {
                    for peer in peers {
                        if let Some(back) = self.links.get_mut(&peer) {
                            back.retain(|k| k != &old);
                        }
                    }
                }
            }
        }
    }

    pub fn record(&mut self, original: MessageKey, copy: MessageKey) {
        self.touch(&original);
        self.touch(&copy);
        if let Some(peers) = self.links.get_mut(&original) {
            peers.push(copy.clone());
        }
        if let Some(peers) = self.links.get_mut(&copy) {
            peers.push(original);
        }
        self.evict();
    }

    /// Every message linked to `key`
    pub fn peers(&self, key: &MessageKey) -> Vec<MessageKey> {
        self.links.get(key).cloned().unwrap_or_default()
    }

    /// The counterpart of `key` on `target`, if one was relayed.
    ///
    /// A copy only links to its original, so sibling copies are found one hop further.
    pub fn counterpart(&self, key: &MessageKey, target: &Endpoint) -> Option<String> {
        if &key.endpoint == target {
            return Some(key.message_id.clone());
        }
        let peers = self.links.get(key)?;
        if let Some(direct) = peers.iter().find(|k| &k.endpoint == target) {
            return Some(direct.message_id.clone());
        }
        peers
            .iter()
            .filter_map(|peer| self.links.get(peer))
            .flatten()
            .find(|k| &k.endpoint == target)
            .map(|k| k.message_id.clone())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.links.len()
    }
}
