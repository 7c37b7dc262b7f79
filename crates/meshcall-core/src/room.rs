use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::chat::{ChatLink, ChatService, MessageStore};
use crate::controls::{LocalMedia, MediaControls, MediaSource};
use crate::errors::MeshError;
use crate::events::{
    ClientIdentity, ConnectionState, EventEmitter, MediaControlsState, MeshEvent, MeshEventListener, ParticipantInfo,
};
use crate::participants::RoomMembership;
use crate::peer::{PeerContext, PeerEnded, PeerHandle, Role};
use crate::protocol::{Envelope, PeerInfo, SignalPayload};
use crate::settings::Settings;
use crate::signaling::{ChannelEvent, RelayConnector, SignalSender, SignalingChannel, relay_url};
use crate::transport::TransportFactory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Channel open, waiting for `welcome`.
    Connecting,
    Joined,
    /// The relay went away; peers linger until `leave`.
    Lost,
}

/// One session per remote id.
#[derive(Default)]
pub(crate) struct PeerRegistry {
    peers: HashMap<String, Arc<PeerHandle>>,
}

impl PeerRegistry {
    pub fn get(&self, peer_id: &str) -> Option<Arc<PeerHandle>> {
        self.peers.get(peer_id).cloned()
    }

    /// Return the session for `peer_id`, creating it with `create` only when
    /// none exists. The flag tells whether a new one was made.
    pub fn get_or_create(
        &mut self,
        peer_id: &str,
        create: impl FnOnce() -> Arc<PeerHandle>,
    ) -> (Arc<PeerHandle>, bool) {
        if let Some(existing) = self.peers.get(peer_id) {
            return (existing.clone(), false);
        }
        let handle = create();
        self.peers.insert(peer_id.to_string(), handle.clone());
        (handle, true)
    }

    pub fn remove(&mut self, peer_id: &str) -> Option<Arc<PeerHandle>> {
        self.peers.remove(peer_id)
    }

    /// Remove `peer_id` only if it is still the given session.
    pub fn remove_session(&mut self, peer_id: &str, session_id: Uuid) -> Option<Arc<PeerHandle>> {
        match self.peers.get(peer_id) {
            Some(handle) if handle.session_id() == session_id => self.peers.remove(peer_id),
            _ => None,
        }
    }

    pub fn drain(&mut self) -> Vec<Arc<PeerHandle>> {
        self.peers.drain().map(|(_, handle)| handle).collect()
    }

    pub fn all(&self) -> Vec<Arc<PeerHandle>> {
        self.peers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }
}

/// What peer sessions of the current join share.
struct JoinContext {
    media: LocalMedia,
    display_name: Option<String>,
    ended: mpsc::UnboundedSender<PeerEnded>,
}

struct RoomState {
    phase: Phase,
    connection: ConnectionState,
    room: Option<String>,
    channel: Option<SignalingChannel>,
    sender: SignalSender,
    join: Option<JoinContext>,
    membership: RoomMembership,
    peers: PeerRegistry,
    dispatch: Option<JoinHandle<()>>,
}

impl Default for RoomState {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            connection: ConnectionState::Disconnected,
            room: None,
            channel: None,
            sender: SignalSender::detached(),
            join: None,
            membership: RoomMembership::new(),
            peers: PeerRegistry::default(),
            dispatch: None,
        }
    }
}

/// State shared by the public API and the dispatch loop. The lock is never
/// held across an await or while listeners run.
struct Shared {
    settings: Settings,
    transports: Arc<dyn TransportFactory>,
    emitter: EventEmitter,
    chat: ChatService,
    chat_link: ChatLink,
    state: Mutex<RoomState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn emit_all(&self, events: Vec<MeshEvent>) {
        for event in events {
            self.emitter.emit(event);
        }
    }

    fn set_chat_link(&self, sender: Option<SignalSender>) {
        *self.chat_link.write().unwrap_or_else(|p| p.into_inner()) = sender;
    }

    fn set_connection_state(&self, state: ConnectionState) {
        self.lock().connection = state;
        self.emitter.emit(MeshEvent::ConnectionStateChanged(state));
    }

    async fn handle_envelope(&self, envelope: Envelope) {
        tracing::debug!("dispatching {}", envelope.kind());
        match envelope {
            Envelope::Welcome { from } => self.on_welcome(from),
            Envelope::Peers { peers } => self.on_roster(peers),
            Envelope::PeerJoined { from } => self.on_peer_joined(from),
            Envelope::PeerLeft { from } => self.on_peer_left(&from),
            Envelope::Signal { from, data, .. } => match from {
                Some(from) => self.on_signal(from, &data),
                None => tracing::warn!("discarding signal without sender"),
            },
            Envelope::Chat { msg: Some(msg), .. } => self.chat.deliver(msg).await,
            Envelope::Chat { msg: None, .. } => tracing::warn!("discarding chat frame without message"),
            Envelope::ChatHistory { messages } => self.chat.deliver_history(messages).await,
        }
    }

    fn on_welcome(&self, client_id: String) {
        let sender = {
            let mut state = self.lock();
            if state.phase != Phase::Connecting {
                tracing::warn!("ignoring repeated welcome ({client_id})");
                return;
            }
            let name = state.join.as_ref().and_then(|j| j.display_name.clone());
            state.membership.set_local(ClientIdentity {
                id: client_id.clone(),
                name,
            });
            state.phase = Phase::Joined;
            state.sender.clone()
        };
        tracing::info!("joined as {client_id}");
        self.set_chat_link(Some(sender));
        self.emit_all(vec![
            MeshEvent::Joined { client_id },
            MeshEvent::ChatAvailabilityChanged(true),
        ]);
    }

    fn on_roster(&self, roster: Vec<PeerInfo>) {
        let events = {
            let mut state = self.lock();
            if state.phase != Phase::Joined {
                tracing::warn!("ignoring roster received before welcome");
                return;
            }
            let roster = roster
                .into_iter()
                .map(|p| ParticipantInfo {
                    name: p.display_name().map(str::to_string),
                    id: p.id,
                })
                .collect();
            let kept = state.membership.replace_roster(roster);
            tracing::info!("roster: {} peers", kept.len());
            let mut events = Vec::new();
            for info in kept {
                self.ensure_peer(&mut state, info, Role::Initiator, &mut events);
            }
            events
        };
        self.emit_all(events);
    }

    fn on_peer_joined(&self, peer_id: String) {
        let events = {
            let mut state = self.lock();
            if state.phase != Phase::Joined || state.membership.is_local(&peer_id) {
                return;
            }
            let info = ParticipantInfo { id: peer_id, name: None };
            state.membership.add(info.clone());
            let mut events = Vec::new();
            self.ensure_peer(&mut state, info, Role::Initiator, &mut events);
            events
        };
        self.emit_all(events);
    }

    fn on_peer_left(&self, peer_id: &str) {
        let handle = {
            let mut state = self.lock();
            state.membership.remove(peer_id);
            state.peers.remove(peer_id)
        };
        match handle {
            Some(handle) => {
                tracing::info!("{peer_id} left, closing its session");
                handle.close();
            }
            None => tracing::debug!("{peer_id} left without a session"),
        }
    }

    fn on_signal(&self, from: String, data: &str) {
        let payload = match SignalPayload::parse(data) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("discarding signal from {from}: {e}");
                return;
            }
        };
        let mut events = Vec::new();
        let handle = {
            let mut state = self.lock();
            if state.phase != Phase::Joined || state.membership.is_local(&from) {
                tracing::debug!("dropping signal from {from}");
                return;
            }
            match state.peers.get(&from) {
                Some(handle) => Some(handle),
                None if matches!(&payload, SignalPayload::Description { sdp } if sdp.is_offer()) => {
                    let info = ParticipantInfo { id: from.clone(), name: None };
                    state.membership.add(info.clone());
                    self.ensure_peer(&mut state, info, Role::Responder, &mut events)
                }
                None => None,
            }
        };
        self.emit_all(events);
        match handle {
            Some(handle) => {
                if !handle.deliver(payload) {
                    tracing::debug!("session for {from} already ended, signal dropped");
                }
            }
            None => tracing::debug!("no session for {from}, signal dropped"),
        }
    }

    /// Create-or-get under the state lock. Events are queued for emission
    /// once the lock is released.
    fn ensure_peer(
        &self,
        state: &mut RoomState,
        info: ParticipantInfo,
        role: Role,
        events: &mut Vec<MeshEvent>,
    ) -> Option<Arc<PeerHandle>> {
        let local_id = state.membership.local()?.id.clone();
        let join = state.join.as_ref()?;
        let ctx = PeerContext {
            transports: self.transports.clone(),
            media: join.media.clone(),
            signal: state.sender.clone(),
            emitter: self.emitter.clone(),
            local_id,
            glare: self.settings.glare_policy,
            negotiation_timeout: self.settings.negotiation_timeout(),
            ended: join.ended.clone(),
        };
        let (handle, created) = state
            .peers
            .get_or_create(&info.id, || PeerHandle::spawn(ctx, &info.id, info.name.clone(), role));
        if created {
            events.push(MeshEvent::PeerAdded(info));
        }
        Some(handle)
    }

    fn on_peer_ended(&self, ended: PeerEnded) {
        let mut state = self.lock();
        if state.peers.remove_session(&ended.peer_id, ended.session_id).is_some() {
            state.membership.remove(&ended.peer_id);
            tracing::info!("removed {} after {:?}", ended.peer_id, ended.state);
        }
    }

    fn on_channel_closed(&self) {
        {
            let mut state = self.lock();
            if matches!(state.phase, Phase::Idle | Phase::Lost) {
                return;
            }
            state.phase = Phase::Lost;
        }
        tracing::warn!("lost the relay connection; leave and join again to continue");
        self.set_chat_link(None);
        self.set_connection_state(ConnectionState::Disconnected);
        self.emitter.emit(MeshEvent::ChatAvailabilityChanged(false));
    }
}

async fn dispatch_loop(
    shared: Arc<Shared>,
    mut channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    mut ended: mpsc::UnboundedReceiver<PeerEnded>,
) {
    let mut channel_open = true;
    loop {
        tokio::select! {
            event = channel_events.recv(), if channel_open => match event {
                Some(ChannelEvent::Envelope(envelope)) => shared.handle_envelope(envelope).await,
                Some(ChannelEvent::Closed) | None => {
                    channel_open = false;
                    shared.on_channel_closed();
                }
            },
            Some(notice) = ended.recv() => shared.on_peer_ended(notice),
            else => break,
        }
    }
    tracing::debug!("dispatch loop finished");
}

/// A full-mesh call in one room.
///
/// Owns local media, the relay channel and one negotiation session per
/// remote participant. Relay traffic is handled by a single dispatch task
/// in arrival order; each peer negotiates on its own task.
pub struct RoomSession {
    connector: Arc<dyn RelayConnector>,
    media: MediaControls,
    shared: Arc<Shared>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl RoomSession {
    pub fn new(
        settings: Settings,
        connector: Arc<dyn RelayConnector>,
        transports: Arc<dyn TransportFactory>,
        media_source: Arc<dyn MediaSource>,
    ) -> Self {
        let emitter = EventEmitter::new();
        let messages: MessageStore = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let chat_link: ChatLink = Arc::new(RwLock::new(None));
        let chat = ChatService::new(chat_link.clone(), emitter.clone(), messages);
        let media = MediaControls::new(media_source, settings.media_constraints());
        Self {
            connector,
            media,
            shared: Arc::new(Shared {
                settings,
                transports,
                emitter,
                chat,
                chat_link,
                state: Mutex::new(RoomState::default()),
            }),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Register a listener for room events.
    pub fn add_listener(&self, listener: Arc<dyn MeshEventListener>) {
        self.shared.emitter.add_listener(listener);
    }

    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    pub fn chat(&self) -> ChatService {
        self.shared.chat.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.lock().connection
    }

    /// True once the relay has welcomed us and until leave or connection loss.
    pub fn is_joined(&self) -> bool {
        self.shared.lock().phase == Phase::Joined
    }

    pub fn room(&self) -> Option<String> {
        self.shared.lock().room.clone()
    }

    pub fn identity(&self) -> Option<ClientIdentity> {
        self.shared.lock().membership.local().cloned()
    }

    pub fn members(&self) -> Vec<ParticipantInfo> {
        self.shared.lock().membership.members().to_vec()
    }

    pub fn peer(&self, peer_id: &str) -> Option<Arc<PeerHandle>> {
        self.shared.lock().peers.get(peer_id)
    }

    pub fn peers(&self) -> Vec<Arc<PeerHandle>> {
        self.shared.lock().peers.all()
    }

    pub fn peer_count(&self) -> usize {
        self.shared.lock().peers.len()
    }

    /// Join `room`. Local media is acquired on first use and reused after.
    ///
    /// Returns once the relay channel is open; the room counts as joined
    /// when the relay's `welcome` arrives ([`MeshEvent::Joined`]).
    pub async fn join(&self, room: &str, display_name: Option<&str>) -> Result<(), MeshError> {
        let _lifecycle = self.lifecycle.lock().await;
        let room = room.trim();
        if room.is_empty() {
            return Err(MeshError::Room("room id is empty".into()));
        }
        match self.shared.lock().phase {
            Phase::Idle => {}
            Phase::Lost => {}
            Phase::Connecting | Phase::Joined => return Err(MeshError::Room("already in a room".into())),
        }
        self.teardown().await;

        let display_name = display_name.map(str::trim).filter(|n| !n.is_empty());
        let url = relay_url(&self.shared.settings.relay_url, room, display_name)?;

        let media = self.media.acquire().await?;
        self.shared
            .emitter
            .emit(MeshEvent::MediaControlsChanged(media.controls_state()));

        self.shared.set_connection_state(ConnectionState::Connecting);
        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        let channel = match SignalingChannel::connect(self.connector.as_ref(), &url, channel_tx).await {
            Ok(channel) => channel,
            Err(e) => {
                tracing::error!("cannot reach relay: {e}");
                self.shared.set_connection_state(ConnectionState::Disconnected);
                self.shared.emitter.emit(MeshEvent::ChatAvailabilityChanged(false));
                self.shared
                    .emitter
                    .emit(MeshEvent::MediaControlsChanged(MediaControlsState::default()));
                return Err(e);
            }
        };

        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        {
            let mut state = self.shared.lock();
            state.phase = Phase::Connecting;
            state.room = Some(room.to_string());
            state.sender = channel.sender();
            state.channel = Some(channel);
            state.join = Some(JoinContext {
                media,
                display_name: display_name.map(str::to_string),
                ended: ended_tx,
            });
            state.dispatch = Some(tokio::spawn(dispatch_loop(self.shared.clone(), channel_rx, ended_rx)));
        }
        tracing::info!("joining room {room}");
        self.shared.set_connection_state(ConnectionState::Connected);
        Ok(())
    }

    /// Leave the room: close the channel and every peer session and reset
    /// room state. Calling it again is a no-op.
    pub async fn leave(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.teardown().await;
    }

    async fn teardown(&self) {
        let (channel, dispatch, peers) = {
            let mut state = self.shared.lock();
            if state.phase == Phase::Idle {
                return;
            }
            let peers = state.peers.drain();
            state.membership.clear();
            state.phase = Phase::Idle;
            state.room = None;
            state.join = None;
            state.sender = SignalSender::detached();
            (state.channel.take(), state.dispatch.take(), peers)
        };
        tracing::info!("leaving room ({} peers)", peers.len());

        self.shared.set_chat_link(None);
        if let Some(dispatch) = dispatch {
            dispatch.abort();
        }
        if let Some(channel) = channel {
            channel.close();
        }

        for peer in &peers {
            peer.close();
        }
        let timeout = self.shared.settings.teardown_timeout();
        for peer in &peers {
            peer.join(timeout).await;
        }

        self.shared.chat.clear().await;
        self.shared.set_connection_state(ConnectionState::Disconnected);
        self.shared.emitter.emit(MeshEvent::ChatAvailabilityChanged(false));
        self.shared
            .emitter
            .emit(MeshEvent::MediaControlsChanged(MediaControlsState::default()));
    }

    /// Flip the microphone on every peer at once. `None` outside a room or
    /// without an audio track.
    pub async fn toggle_audio(&self) -> Option<bool> {
        if self.shared.lock().phase == Phase::Idle {
            return None;
        }
        let enabled = self.media.toggle_audio().await?;
        self.emit_controls().await;
        Some(enabled)
    }

    /// Flip the camera on every peer at once. `None` outside a room or
    /// without a video track.
    pub async fn toggle_video(&self) -> Option<bool> {
        if self.shared.lock().phase == Phase::Idle {
            return None;
        }
        let enabled = self.media.toggle_video().await?;
        self.emit_controls().await;
        Some(enabled)
    }

    pub async fn media_controls_state(&self) -> MediaControlsState {
        if self.shared.lock().phase == Phase::Idle {
            return MediaControlsState::default();
        }
        self.media.state().await
    }

    /// The captured media, once acquired.
    pub async fn local_media(&self) -> Option<LocalMedia> {
        self.media.current().await
    }

    async fn emit_controls(&self) {
        let state = self.media.state().await;
        self.shared.emitter.emit(MeshEvent::MediaControlsChanged(state));
    }
}
