pub mod routes;

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::commands::{bridge_commands, CommandInvocation};
use crate::config::BridgeConfig;
use crate::describe::{
    describe, escape_markdown, DescribeContext, DescribedMessage, ProfileNameFormatter, Sender,
    UserFormatter,
};
use crate::platform::events::handler;
use crate::platform::{
    telegram, ChatClient, ClientName, EventKind, GenericMessage, MessageToEdit, MessageToSend,
};
use crate::store::BridgeStore;
use routes::{fan_out, Endpoint, MessageKey, RelayLog};

/// Relayed message pairs remembered for edits and replies
const RELAY_LOG_CAPACITY: usize = 10_000;

/// Names Telegram users by their per-chat nickname, falling back to their profile name
pub struct NicknameFormatter {
    store: BridgeStore,
    chat_id: String,
}

impl NicknameFormatter {
    pub fn new(store: BridgeStore, chat_id: impl Into<String>) -> Self {
        Self {
            store,
            chat_id: chat_id.into(),
        }
    }
}

#[async_trait]
impl UserFormatter for NicknameFormatter {
    async fn format_user(&self, user: &Sender) -> String {
        match self.store.get_discord_nickname(&self.chat_id, &user.id).await {
            Ok(Some(nick)) => nick,
            Ok(None) => user.name.clone(),
            Err(e) => {
                warn!("Nickname lookup failed for {}: {:#}", user.id, e);
                user.name.clone()
            }
        }
    }
}

/// Routes messages between Telegram and its linked Discord channels and Matrix rooms
pub struct Bridge {
    store: BridgeStore,
    config: BridgeConfig,
    telegram: Arc<dyn ChatClient>,
    discord: Option<Arc<dyn ChatClient>>,
    matrix: Option<Arc<dyn ChatClient>>,
    relayed: Mutex<RelayLog>,
}

impl Bridge {
    pub fn new(
        store: BridgeStore,
        config: BridgeConfig,
        telegram: Arc<dyn ChatClient>,
        discord: Option<Arc<dyn ChatClient>>,
        matrix: Option<Arc<dyn ChatClient>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            telegram,
            discord,
            matrix,
            relayed: Mutex::new(RelayLog::new(RELAY_LOG_CAPACITY)),
        })
    }

    fn clients(&self) -> impl Iterator<Item = &Arc<dyn ChatClient>> {
        std::iter::once(&self.telegram)
            .chain(self.discord.iter())
            .chain(self.matrix.iter())
    }

    fn client(&self, name: ClientName) -> Option<&Arc<dyn ChatClient>> {
        match name {
            ClientName::Telegram => Some(&self.telegram),
            ClientName::Discord => self.discord.as_ref(),
            ClientName::Matrix => self.matrix.as_ref(),
        }
    }

    /// Register message and edit handlers on every client
    pub fn attach(self: &Arc<Self>) {
        for client in self.clients() {
            let bridge = Arc::clone(self);
            client.on(
                EventKind::Message,
                handler(move |msg| {
                    let bridge = Arc::clone(&bridge);
                    async move {
                        if let Err(e) = bridge.on_message(msg).await {
                            error!("Error relaying message: {:#}", e);
                        }
                    }
                }),
            );

            let bridge = Arc::clone(self);
            client.on(
                EventKind::EditMessage,
                handler(move |msg| {
                    let bridge = Arc::clone(&bridge);
                    async move {
                        if let Err(e) = bridge.on_edit(msg).await {
                            error!("Error relaying edit: {:#}", e);
                        }
                    }
                }),
            );
        }
    }

    /// Start every client, then advertise the bridge commands where supported
    pub async fn start(&self) -> Result<()> {
        for client in self.clients() {
            client.start().await?;
        }

        if let Some(commands) = self.telegram.commands() {
            if let Err(e) = commands.set_command_list(&bridge_commands()).await {
                warn!("Failed to register bot commands: {:#}", e);
            }
        }

        info!("Bridge started");
        Ok(())
    }

    pub async fn stop(&self) {
        for client in self.clients() {
            if let Err(e) = client.stop().await {
                warn!("Failed to stop {} client: {:#}", client.name(), e);
            }
        }
        info!("Bridge stopped");
    }

    /// Telegram chat a message belongs to, if its conversation is bridged
    async fn hub_chat(&self, msg: &GenericMessage) -> Result<Option<String>> {
        Ok(match msg.client_name {
            ClientName::Telegram => Some(msg.chat_id.clone()),
            ClientName::Discord => self.store.get_chat_for_discord_channel(&msg.chat_id).await?,
            ClientName::Matrix => self
                .config
                .chat_for_matrix_room(&msg.chat_id)
                .map(str::to_string),
        })
    }

    async fn targets(&self, source: ClientName, hub_chat: &str) -> Result<Vec<Endpoint>> {
        let discord_channel = match self.discord {
            Some(_) => self.store.get_discord_link(hub_chat).await?,
            None => None,
        };
        let matrix_room = self
            .matrix
            .as_ref()
            .and(self.config.matrix_room_for_chat(hub_chat));
        Ok(fan_out(
            source,
            hub_chat,
            discord_channel.as_deref(),
            matrix_room,
        ))
    }

    /// Describe `msg` the way it should read on `target`
    async fn render(&self, msg: &GenericMessage, hub_chat: &str, target: ClientName) -> String {
        let ctx = DescribeContext {
            bot_user_id: self
                .client(msg.client_name)
                .and_then(|c| c.own_user_id()),
        };

        let text = match msg.client_name {
            ClientName::Telegram => {
                let described = telegram::described_from_generic(msg);
                let formatter = NicknameFormatter::new(self.store.clone(), hub_chat);
                describe(&described, &ctx, &formatter).await
            }
            _ => {
                let described = DescribedMessage::from_generic(msg);
                describe(&described, &ctx, &ProfileNameFormatter).await
            }
        };

        if target == ClientName::Discord {
            escape_markdown(&text)
        } else {
            text
        }
    }

    pub async fn on_message(&self, msg: GenericMessage) -> Result<()> {
        let commands = match msg.client_name {
            ClientName::Telegram => self.telegram.commands(),
            _ => None,
        };
        if let Some(commands) = commands {
            if let Some(invocation) = commands.try_execute_command(&msg) {
                if self.execute_command(&msg, &invocation).await? {
                    return Ok(());
                }
            }
        }

        let Some(hub_chat) = self.hub_chat(&msg).await? else {
            debug!("No bridge for {} chat {}", msg.client_name, msg.chat_id);
            return Ok(());
        };

        let source = MessageKey::new(msg.client_name, &msg.chat_id, &msg.message_id);
        for target in self.targets(msg.client_name, &hub_chat).await? {
            let Some(client) = self.client(target.client) else {
                continue;
            };

            let reply_to_id = msg.reply_to_id.as_deref().and_then(|id| {
                let key = MessageKey::new(msg.client_name, &msg.chat_id, id);
                self.relay_log().counterpart(&key, &target)
            });
            let outgoing = MessageToSend {
                client_name: target.client,
                chat_id: target.chat_id.clone(),
                text: self.render(&msg, &hub_chat, target.client).await,
                media: msg.media.clone(),
                reply_to_id,
            };

            match client.send_message(outgoing).await {
                Ok(sent) => {
                    debug!(
                        "Relayed {} {} to {} {}",
                        msg.client_name, msg.message_id, target.client, sent.message_id
                    );
                    let copy = MessageKey::new(target.client, &target.chat_id, &sent.message_id);
                    self.relay_log().record(source.clone(), copy);
                }
                Err(e) => {
                    error!(
                        "Failed to relay {} message to {} {}: {:#}",
                        msg.client_name, target.client, target.chat_id, e
                    );
                }
            }
        }
        Ok(())
    }

    pub async fn on_edit(&self, msg: GenericMessage) -> Result<()> {
        let Some(hub_chat) = self.hub_chat(&msg).await? else {
            return Ok(());
        };

        let source = MessageKey::new(msg.client_name, &msg.chat_id, &msg.message_id);
        let copies = self.relay_log().peers(&source);
        if copies.is_empty() {
            debug!("Edit of unrelayed {} message {}", msg.client_name, msg.message_id);
            return Ok(());
        }

        for copy in copies {
            let Some(client) = self.client(copy.endpoint.client) else {
                continue;
            };
            let edit = MessageToEdit {
                client_name: copy.endpoint.client,
                chat_id: copy.endpoint.chat_id.clone(),
                message_id: copy.message_id.clone(),
                text: self.render(&msg, &hub_chat, copy.endpoint.client).await,
                hide_edit_mark: false,
            };
            if let Err(e) = client.edit_message(edit).await {
                error!(
                    "Failed to relay edit to {} {}: {:#}",
                    copy.endpoint.client, copy.message_id, e
                );
            }
        }
        Ok(())
    }

    fn relay_log(&self) -> std::sync::MutexGuard<'_, RelayLog> {
        self.relayed.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Handle a bridge command. Returns false for commands the bridge doesn't own.
    async fn execute_command(
        &self,
        msg: &GenericMessage,
        invocation: &CommandInvocation,
    ) -> Result<bool> {
        let reply = match invocation.command.as_str() {
            "link" => {
                let channel = invocation.args.trim();
                if channel.is_empty() || !channel.chars().all(|c| c.is_ascii_digit()) {
                    "Usage: /link <discord channel id>".to_string()
                } else {
                    self.store.set_discord_link(&msg.chat_id, channel).await?;
                    info!("Linked chat {} to discord channel {}", msg.chat_id, channel);
                    format!("Linked to Discord channel {}.", channel)
                }
            }
            "unlink" => {
                if self.store.remove_discord_link(&msg.chat_id).await? {
                    info!("Unlinked chat {}", msg.chat_id);
                    "Discord link removed.".to_string()
                } else {
                    "This chat is not linked.".to_string()
                }
            }
            "nick" => {
                let nick = invocation.args.trim();
                if nick.is_empty() {
                    match self
                        .store
                        .get_discord_nickname(&msg.chat_id, &msg.user_id)
                        .await?
                    {
                        Some(current) => format!("Your nickname is {}.", current),
                        None => "Usage: /nick <nickname>".to_string(),
                    }
                } else {
                    self.store
                        .set_discord_nickname(&msg.chat_id, &msg.user_id, nick)
                        .await?;
                    format!("Nickname set to {}.", nick)
                }
            }
            _ => return Ok(false),
        };

        let mut answer = MessageToSend::text(msg.client_name, &msg.chat_id, reply);
        answer.reply_to_id = Some(msg.message_id.clone());
        self.telegram.send_message(answer).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{parse_command, BotCommandSpec};
    use crate::config::MatrixRoomLink;
    use crate::platform::{CommandClient, EventHandler, EventHub, Media, MediaKind};

    /// In-memory client recording everything the bridge sends
    struct FakeClient {
        name: ClientName,
        hub: EventHub,
        sent: Mutex<Vec<MessageToSend>>,
        edits: Mutex<Vec<MessageToEdit>>,
    }

    impl FakeClient {
        fn new(name: ClientName) -> Arc<Self> {
            Arc::new(Self {
                name,
                hub: EventHub::new(),
                sent: Mutex::new(Vec::new()),
                edits: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<MessageToSend> {
            self.sent.lock().unwrap().clone()
        }

        fn edits(&self) -> Vec<MessageToEdit> {
            self.edits.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatClient for FakeClient {
        fn name(&self) -> ClientName {
            self.name
        }

        fn own_user_id(&self) -> Option<String> {
            Some("bot".to_string())
        }

        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            Ok(())
        }

        fn on(&self, kind: EventKind, handler: EventHandler) {
            self.hub.on(kind, handler);
        }

        async fn send_message(&self, message: MessageToSend) -> Result<GenericMessage> {
            let mut sent = self.sent.lock().unwrap();
            sent.push(message.clone());
            Ok(GenericMessage {
                client_name: self.name,
                text: message.text,
                user_id: "bot".to_string(),
                user_name: "bot".to_string(),
                chat_id: message.chat_id,
                message_id: format!("sent-{}", sent.len()),
                date: 0,
                media: message.media,
                reply_to_id: message.reply_to_id,
                raw_message: None,
                raw_user: None,
                raw_reply: None,
            })
        }

        async fn edit_message(&self, message: MessageToEdit) -> Result<()> {
            self.edits.lock().unwrap().push(message);
            Ok(())
        }

        fn commands(&self) -> Option<&dyn CommandClient> {
            if self.name == ClientName::Telegram {
                Some(self)
            } else {
                None
            }
        }
    }

    #[async_trait]
    impl CommandClient for FakeClient {
        async fn set_command_list(&self, _commands: &[BotCommandSpec]) -> Result<()> {
            Ok(())
        }

        fn try_execute_command(&self, message: &GenericMessage) -> Option<CommandInvocation> {
            parse_command(&message.text, Some("bridgebot"))
        }
    }

    fn incoming(
        client: ClientName,
        chat: &str,
        id: &str,
        user: (&str, &str),
        text: &str,
    ) -> GenericMessage {
        GenericMessage {
            client_name: client,
            text: text.to_string(),
            user_id: user.0.to_string(),
            user_name: user.1.to_string(),
            chat_id: chat.to_string(),
            message_id: id.to_string(),
            date: 1700000000,
            media: None,
            reply_to_id: None,
            raw_message: None,
            raw_user: None,
            raw_reply: None,
        }
    }

    struct Harness {
        bridge: Arc<Bridge>,
        store: BridgeStore,
        telegram: Arc<FakeClient>,
        discord: Arc<FakeClient>,
        matrix: Arc<FakeClient>,
    }

    fn harness() -> Harness {
        let store = BridgeStore::open_in_memory().unwrap();
        let telegram = FakeClient::new(ClientName::Telegram);
        let discord = FakeClient::new(ClientName::Discord);
        let matrix = FakeClient::new(ClientName::Matrix);
        let config = BridgeConfig {
            matrix_rooms: vec![MatrixRoomLink {
                chat_id: "-100".to_string(),
                room_id: "!room:x".to_string(),
            }],
        };
        let bridge = Bridge::new(
            store.clone(),
            config,
            telegram.clone(),
            Some(discord.clone()),
            Some(matrix.clone()),
        );
        bridge.attach();
        Harness {
            bridge,
            store,
            telegram,
            discord,
            matrix,
        }
    }

    #[tokio::test]
    async fn test_link_command_stores_and_replies() {
        let h = harness();
        h.telegram
            .hub
            .emit(
                EventKind::Message,
                incoming(ClientName::Telegram, "-100", "1", ("42", "Alice"), "/link 555"),
            )
            .await;

        assert_eq!(h.store.get_discord_link("-100").await.unwrap().as_deref(), Some("555"));
        let replies = h.telegram.sent();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].text, "Linked to Discord channel 555.");
        assert_eq!(replies[0].reply_to_id.as_deref(), Some("1"));
        // Commands are not relayed
        assert!(h.discord.sent().is_empty());
        assert!(h.matrix.sent().is_empty());
    }

    #[tokio::test]
    async fn test_link_rejects_non_numeric_channel() {
        let h = harness();
        let command = incoming(ClientName::Telegram, "-100", "1", ("42", "Alice"), "/link general");
        h.bridge.on_message(command).await.unwrap();
        assert_eq!(h.store.get_discord_link("-100").await.unwrap(), None);
        assert_eq!(h.telegram.sent()[0].text, "Usage: /link <discord channel id>");
    }

    #[tokio::test]
    async fn test_unlink_command() {
        let h = harness();
        h.store.set_discord_link("-100", "555").await.unwrap();
        h.bridge
            .on_message(incoming(ClientName::Telegram, "-100", "1", ("42", "Alice"), "/unlink"))
            .await
            .unwrap();
        assert_eq!(h.store.get_discord_link("-100").await.unwrap(), None);
        assert_eq!(h.telegram.sent()[0].text, "Discord link removed.");
    }

    #[tokio::test]
    async fn test_telegram_message_fans_out_with_nickname() {
        let h = harness();
        h.store.set_discord_link("-100", "555").await.unwrap();
        h.store.set_discord_nickname("-100", "42", "Ally_Cat").await.unwrap();

        h.bridge
            .on_message(incoming(ClientName::Telegram, "-100", "7", ("42", "Alice"), "hi *all*"))
            .await
            .unwrap();

        let to_discord = h.discord.sent();
        assert_eq!(to_discord.len(), 1);
        assert_eq!(to_discord[0].chat_id, "555");
        assert_eq!(to_discord[0].text, r"Ally\_Cat: hi \*all\*");

        let to_matrix = h.matrix.sent();
        assert_eq!(to_matrix.len(), 1);
        assert_eq!(to_matrix[0].chat_id, "!room:x");
        assert_eq!(to_matrix[0].text, "Ally_Cat: hi *all*");
    }

    #[tokio::test]
    async fn test_nick_command_changes_relayed_name() {
        let h = harness();
        h.store.set_discord_link("-100", "555").await.unwrap();
        h.bridge
            .on_message(incoming(ClientName::Telegram, "-100", "1", ("42", "Alice"), "/nick Bob"))
            .await
            .unwrap();
        assert_eq!(h.telegram.sent()[0].text, "Nickname set to Bob.");

        h.bridge
            .on_message(incoming(ClientName::Telegram, "-100", "2", ("42", "Alice"), "hello"))
            .await
            .unwrap();
        assert_eq!(h.discord.sent()[0].text, "Bob: hello");
    }

    #[tokio::test]
    async fn test_unknown_command_is_relayed() {
        let h = harness();
        h.bridge
            .on_message(incoming(ClientName::Telegram, "-100", "3", ("42", "Alice"), "/roll"))
            .await
            .unwrap();
        assert!(h.telegram.sent().is_empty());
        assert_eq!(h.matrix.sent()[0].text, "Alice: /roll");
    }

    #[tokio::test]
    async fn test_discord_message_reaches_telegram_and_matrix() {
        let h = harness();
        h.store.set_discord_link("-100", "555").await.unwrap();

        let mut msg = incoming(ClientName::Discord, "555", "900", ("7", "Bob"), "look");
        msg.media = Some(Media {
            kind: MediaKind::Photo,
            url: "https://cdn.example/cat.png".to_string(),
            mime_type: Some("image/png".to_string()),
            size: Some(10),
        });
        h.bridge.on_message(msg).await.unwrap();

        let to_telegram = h.telegram.sent();
        assert_eq!(to_telegram.len(), 1);
        assert_eq!(to_telegram[0].chat_id, "-100");
        assert_eq!(to_telegram[0].text, "Bob: [图片] look");
        assert_eq!(
            to_telegram[0].media.as_ref().map(|m| m.url.as_str()),
            Some("https://cdn.example/cat.png")
        );
        assert_eq!(h.matrix.sent().len(), 1);
        assert!(h.discord.sent().is_empty());
    }

    #[tokio::test]
    async fn test_unbridged_chats_are_ignored() {
        let h = harness();
        h.bridge
            .on_message(incoming(ClientName::Discord, "999", "1", ("7", "Bob"), "hi"))
            .await
            .unwrap();
        h.bridge
            .on_message(incoming(ClientName::Telegram, "-200", "1", ("42", "Alice"), "hi"))
            .await
            .unwrap();
        assert!(h.telegram.sent().is_empty());
        assert!(h.discord.sent().is_empty());
        assert!(h.matrix.sent().is_empty());
    }

    #[tokio::test]
    async fn test_edit_reaches_relayed_copies() {
        let h = harness();
        h.store.set_discord_link("-100", "555").await.unwrap();
        h.bridge
            .on_message(incoming(ClientName::Telegram, "-100", "7", ("42", "Alice"), "helo"))
            .await
            .unwrap();

        h.telegram
            .hub
            .emit(
                EventKind::EditMessage,
                incoming(ClientName::Telegram, "-100", "7", ("42", "Alice"), "hello"),
            )
            .await;

        let edits = h.discord.edits();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].chat_id, "555");
        assert_eq!(edits[0].message_id, "sent-1");
        assert_eq!(edits[0].rendered_text(), "Alice: hello (edited)");
        assert_eq!(h.matrix.edits().len(), 1);
    }

    #[tokio::test]
    async fn test_long_telegram_message_fits_discord_limit() {
        let h = harness();
        h.store.set_discord_link("-100", "555").await.unwrap();
        let long = "a".repeat(4000);
        h.bridge
            .on_message(incoming(ClientName::Telegram, "-100", "7", ("42", "Alice"), &long))
            .await
            .unwrap();

        let to_discord = h.discord.sent();
        assert_eq!(to_discord.len(), 1);
        let text = &to_discord[0].text;
        assert_eq!(text.len(), 4007);

        let chunks = crate::platform::discord::content_chunks(text);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= 2000));
        assert_eq!(chunks.concat(), *text);

        h.bridge
            .on_edit(incoming(ClientName::Telegram, "-100", "7", ("42", "Alice"), "short"))
            .await
            .unwrap();
        let edits = h.discord.edits();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].message_id, "sent-1");
    }

    #[tokio::test]
    async fn test_edit_of_unknown_message_is_ignored() {
        let h = harness();
        h.bridge
            .on_edit(incoming(ClientName::Telegram, "-100", "77", ("42", "Alice"), "x"))
            .await
            .unwrap();
        assert!(h.discord.edits().is_empty());
        assert!(h.matrix.edits().is_empty());
    }

    #[tokio::test]
    async fn test_reply_maps_to_relayed_copy() {
        let h = harness();
        h.store.set_discord_link("-100", "555").await.unwrap();
        h.bridge
            .on_message(incoming(ClientName::Discord, "555", "900", ("7", "Bob"), "question"))
            .await
            .unwrap();

        let mut answer = incoming(ClientName::Telegram, "-100", "8", ("42", "Alice"), "answer");
        answer.reply_to_id = Some("sent-1".to_string());
        h.bridge.on_message(answer).await.unwrap();

        let to_discord = h.discord.sent();
        assert_eq!(to_discord.len(), 1);
        assert_eq!(to_discord[0].reply_to_id.as_deref(), Some("900"));
    }

    #[tokio::test]
    async fn test_nickname_formatter_falls_back_to_profile_name() {
        let store = BridgeStore::open_in_memory().unwrap();
        store.set_discord_nickname("c1", "u1", "Bobby").await.unwrap();
        let formatter = NicknameFormatter::new(store, "c1");

        assert_eq!(formatter.format_user(&Sender::new("u1", "Robert")).await, "Bobby");
        assert_eq!(formatter.format_user(&Sender::new("u2", "Carol")).await, "Carol");
    }
}
