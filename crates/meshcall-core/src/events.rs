use std::sync::{Arc, RwLock};

use crate::peer::PeerState;
use crate::protocol::ChatMessage;
use crate::transport::RemoteTrack;

/// Events emitted by the core to the display layer.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    ConnectionStateChanged(ConnectionState),
    /// The relay confirmed our identity; the room is joined.
    Joined { client_id: String },
    PeerAdded(ParticipantInfo),
    PeerStateChanged { peer_id: String, state: PeerState },
    /// The peer's tile and any renderer bound to it should be dropped.
    PeerRemoved(String),
    RemoteTrackAdded { peer_id: String, track: RemoteTrack },
    CandidateRejected { peer_id: String, reason: String },
    ChatHistoryReceived(Vec<ChatMessage>),
    ChatMessageReceived(ChatMessage),
    ChatAvailabilityChanged(bool),
    MediaControlsChanged(MediaControlsState),
}

/// State of the signaling channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub id: String,
    pub name: Option<String>,
}

impl ParticipantInfo {
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Identity the relay assigned to this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub id: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// What the mute/camera buttons should show.
///
/// `None` means no track of that kind was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MediaControlsState {
    pub available: bool,
    pub audio_enabled: Option<bool>,
    pub video_enabled: Option<bool>,
}

/// Trait for receiving events from the core.
/// Implementations must be Send + Sync (called from tokio tasks).
pub trait MeshEventListener: Send + Sync {
    fn on_event(&self, event: MeshEvent);
}

/// Internal event emitter that dispatches to registered listeners.
#[derive(Clone)]
pub struct EventEmitter {
    listeners: Arc<RwLock<Vec<Arc<dyn MeshEventListener>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn MeshEventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    pub fn emit(&self, event: MeshEvent) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for listener in listeners.iter() {
            listener.on_event(event.clone());
        }
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}
