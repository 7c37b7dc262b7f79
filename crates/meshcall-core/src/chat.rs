use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;

use crate::events::{EventEmitter, MeshEvent};
use crate::protocol::{ChatMessage, Envelope, MAX_CHAT_BODY_LEN};
use crate::signaling::SignalSender;

/// Shared message store between the room dispatcher and ChatService.
pub type MessageStore = Arc<Mutex<Vec<ChatMessage>>>;

/// Relay link usable for chat. Set while a room is joined, `None` otherwise.
pub type ChatLink = Arc<RwLock<Option<SignalSender>>>;

/// Chat over the signaling relay.
///
/// The relay stamps and stores each message and echoes it back to every
/// member, the sender included, so outgoing text is not added locally.
#[derive(Clone)]
pub struct ChatService {
    link: ChatLink,
    emitter: EventEmitter,
    messages: MessageStore,
}

impl ChatService {
    pub fn new(link: ChatLink, emitter: EventEmitter, messages: MessageStore) -> Self {
        Self {
            link,
            emitter,
            messages,
        }
    }

    /// Whether [`send`](Self::send) would currently reach the relay.
    pub fn is_available(&self) -> bool {
        self.link
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(SignalSender::is_open)
    }

    /// Send `text` to the room. Returns false when nothing was sent: blank
    /// text, text over the relay's size limit, or no joined room.
    pub fn send(&self, text: &str) -> bool {
        let body = text.trim();
        if body.is_empty() {
            return false;
        }
        if body.len() > MAX_CHAT_BODY_LEN {
            tracing::warn!("chat message of {} bytes exceeds the {MAX_CHAT_BODY_LEN} byte limit", body.len());
            return false;
        }
        let link = self.link.read().unwrap_or_else(|p| p.into_inner());
        match link.as_ref() {
            Some(sender) => sender.send(&Envelope::chat(body)),
            None => {
                tracing::debug!("not in a room, chat message dropped");
                false
            }
        }
    }

    /// Get all messages in the current session.
    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.messages.lock().await.clone()
    }

    /// Store the join-time backlog and hand it over as one batch.
    pub(crate) async fn deliver_history(&self, history: Vec<ChatMessage>) {
        tracing::debug!("chat history: {} messages", history.len());
        self.messages.lock().await.extend(history.iter().cloned());
        self.emitter.emit(MeshEvent::ChatHistoryReceived(history));
    }

    pub(crate) async fn deliver(&self, msg: ChatMessage) {
        self.messages.lock().await.push(msg.clone());
        self.emitter.emit(MeshEvent::ChatMessageReceived(msg));
    }

    /// Clear all messages (on leave).
    pub async fn clear(&self) {
        self.messages.lock().await.clear();
    }
}
