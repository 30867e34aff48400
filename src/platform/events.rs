use std::future::Future;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use tracing::trace;

use super::GenericMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Message,
    EditMessage,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Message => "message",
            EventKind::EditMessage => "edit-message",
        }
    }
}

pub type EventHandler = Arc<dyn Fn(GenericMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as an [`EventHandler`]
pub fn handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(GenericMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |msg| Box::pin(f(msg)))
}

/// Registered handlers for one adapter
#[derive(Default)]
pub struct EventHub {
    handlers: RwLock<Vec<(EventKind, EventHandler)>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, kind: EventKind, handler: EventHandler) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.push((kind, handler));
    }

    fn matching(&self, kind: EventKind) -> Vec<EventHandler> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, h)| Arc::clone(h))
            .collect()
    }

    /// Run every handler for `kind` to completion, in registration order
    pub async fn emit(&self, kind: EventKind, message: GenericMessage) {
        let handlers = self.matching(kind);
        trace!(
            "Emitting {} to {} handler(s)",
            kind.as_str(),
            handlers.len()
        );
        for h in handlers {
            h(message.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::ClientName;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample() -> GenericMessage {
        GenericMessage {
            client_name: ClientName::Telegram,
            text: "hi".to_string(),
            user_id: "1".to_string(),
            user_name: "A".to_string(),
            chat_id: "c".to_string(),
            message_id: "m".to_string(),
            date: 0,
            media: None,
            reply_to_id: None,
            raw_message: None,
            raw_user: None,
            raw_reply: None,
        }
    }

    #[tokio::test]
    async fn test_emit_only_reaches_matching_kind() {
        let hub = EventHub::new();
        let messages = Arc::new(AtomicUsize::new(0));
        let edits = Arc::new(AtomicUsize::new(0));

        let m = Arc::clone(&messages);
        hub.on(
            EventKind::Message,
            handler(move |_| {
                let m = Arc::clone(&m);
                async move {
                    m.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );
        let e = Arc::clone(&edits);
        hub.on(
            EventKind::EditMessage,
            handler(move |_| {
                let e = Arc::clone(&e);
                async move {
                    e.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );

        hub.emit(EventKind::Message, sample()).await;

        assert_eq!(messages.load(Ordering::SeqCst), 1);
        assert_eq!(edits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_emit_without_handlers_is_noop() {
        let hub = EventHub::new();
        hub.emit(EventKind::EditMessage, sample()).await;
    }
}
