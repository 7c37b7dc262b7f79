//! Per-peer negotiation.
//!
//! Every remote participant gets one task that owns its transport and runs
//! the negotiation state machine. The task reads two ordered queues: the
//! signaling inbox fed by the room dispatcher and the transport's own event
//! queue. Nothing else touches the transport, so signals for one peer are
//! applied strictly in the order they were received while other peers make
//! progress independently.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::controls::LocalMedia;
use crate::errors::MeshError;
use crate::events::{EventEmitter, MeshEvent};
use crate::protocol::{Envelope, IceCandidate, SdpKind, SessionDescription, SignalPayload};
use crate::settings::GlarePolicy;
use crate::signaling::SignalSender;
use crate::transport::{PeerTransport, RemoteTrack, TransportEvent, TransportFactory, TransportState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends the first offer as soon as the session exists.
    Initiator,
    /// Waits for the remote offer.
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    #[default]
    New,
    Negotiating,
    Connected,
    Closed,
    Failed,
}

impl PeerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PeerState::Closed | PeerState::Failed)
    }
}

/// Result of handing one remote candidate to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateOutcome {
    Applied,
    /// Held until a remote description is in place.
    Queued,
    /// The transport refused it. The session carries on.
    Rejected(String),
}

/// Observable snapshot of one session.
#[derive(Debug, Clone, Default)]
pub struct PeerStatus {
    pub state: PeerState,
    pub remote_description_applied: bool,
    pub pending_candidates: usize,
    pub applied_candidates: usize,
    pub rejected_candidates: usize,
    pub remote_tracks: Vec<RemoteTrack>,
    pub data_channel_open: bool,
}

#[derive(Debug)]
pub(crate) enum PeerCommand {
    Signal(SignalPayload),
    Close,
}

/// Sent to the room dispatcher once a session task has torn down.
#[derive(Debug, Clone)]
pub(crate) struct PeerEnded {
    pub peer_id: String,
    pub session_id: Uuid,
    pub state: PeerState,
}

/// Everything a session task needs from its room.
#[derive(Clone)]
pub(crate) struct PeerContext {
    pub transports: Arc<dyn TransportFactory>,
    pub media: LocalMedia,
    pub signal: SignalSender,
    pub emitter: EventEmitter,
    pub local_id: String,
    pub glare: GlarePolicy,
    pub negotiation_timeout: Option<Duration>,
    pub ended: mpsc::UnboundedSender<PeerEnded>,
}

impl PeerContext {
    /// Both ends of a pair usually start as initiators. Under
    /// [`GlarePolicy::Polite`] the greater id answers instead, so exactly one
    /// offer is made.
    pub(crate) fn resolve_role(&self, peer_id: &str, requested: Role) -> Role {
        if requested == Role::Initiator && self.glare == GlarePolicy::Polite && self.local_id.as_str() > peer_id {
            tracing::debug!("{peer_id} has the smaller id and offers first");
            return Role::Responder;
        }
        requested
    }
}

/// Room-side handle to a running session.
pub struct PeerHandle {
    peer_id: String,
    session_id: Uuid,
    role: Role,
    name: Option<String>,
    commands: mpsc::UnboundedSender<PeerCommand>,
    status: watch::Receiver<PeerStatus>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerHandle {
    /// Start the session task. An initiator's offer goes out before the
    /// task reads anything from its inbox.
    pub(crate) fn spawn(ctx: PeerContext, peer_id: &str, name: Option<String>, role: Role) -> Arc<Self> {
        let session_id = Uuid::new_v4();
        let role = ctx.resolve_role(peer_id, role);
        let (commands, inbox) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(PeerStatus::default());

        tracing::debug!("spawning {role:?} session {session_id} for {peer_id}");
        let task = tokio::spawn(run_session(ctx, peer_id.to_string(), session_id, role, inbox, status_tx));

        Arc::new(Self {
            peer_id: peer_id.to_string(),
            session_id,
            role,
            name,
            commands,
            status,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn status(&self) -> PeerStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> PeerState {
        self.status.borrow().state
    }

    /// Wait until the session reaches `state` or a terminal state.
    pub async fn wait_for_state(&self, state: PeerState, timeout: Duration) -> PeerState {
        let mut rx = self.status.clone();
        let reached = tokio::time::timeout(timeout, rx.wait_for(|s| s.state == state || s.state.is_terminal())).await;
        match reached {
            Ok(Ok(status)) => status.state,
            _ => self.state(),
        }
    }

    /// Queue a signal for the session. Returns false once the session has
    /// ended.
    pub(crate) fn deliver(&self, payload: SignalPayload) -> bool {
        self.commands.send(PeerCommand::Signal(payload)).is_ok()
    }

    pub(crate) fn close(&self) {
        let _ = self.commands.send(PeerCommand::Close);
    }

    /// Wait for the task to finish its teardown, aborting it after `timeout`.
    pub(crate) async fn join(&self, timeout: Duration) {
        let task = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        let Some(mut task) = task else { return };
        if tokio::time::timeout(timeout, &mut task).await.is_err() {
            tracing::warn!("session for {} did not stop in {timeout:?}, aborting", self.peer_id);
            task.abort();
        }
    }
}

async fn run_session(
    ctx: PeerContext,
    peer_id: String,
    session_id: Uuid,
    role: Role,
    inbox: mpsc::UnboundedReceiver<PeerCommand>,
    status: watch::Sender<PeerStatus>,
) {
    advance(&ctx.emitter, &status, &peer_id, PeerState::Negotiating);
    let (events_tx, events) = mpsc::unbounded_channel();
    let transport = match ctx.transports.create(&peer_id, &ctx.media, events_tx).await {
        Ok(transport) => transport,
        Err(e) => {
            tracing::warn!("cannot open transport to {peer_id}: {e}");
            advance(&ctx.emitter, &status, &peer_id, PeerState::Failed);
            ctx.emitter.emit(MeshEvent::PeerRemoved(peer_id.clone()));
            let _ = ctx.ended.send(PeerEnded {
                peer_id,
                session_id,
                state: PeerState::Failed,
            });
            return;
        }
    };

    let mut session = PeerSession::new(ctx, peer_id, role, transport, status);
    let end = session.drive(inbox, events).await;
    session.teardown(end).await;

    let _ = session.ctx.ended.send(PeerEnded {
        peer_id: session.peer_id.clone(),
        session_id,
        state: end,
    });
}

fn advance(emitter: &EventEmitter, status: &watch::Sender<PeerStatus>, peer_id: &str, state: PeerState) {
    let previous = status.borrow().state;
    if previous == state {
        return;
    }
    status.send_modify(|s| s.state = state);
    tracing::info!("peer {peer_id}: {previous:?} -> {state:?}");
    emitter.emit(MeshEvent::PeerStateChanged {
        peer_id: peer_id.to_string(),
        state,
    });
}

/// Negotiation state machine for one remote peer.
pub(crate) struct PeerSession {
    peer_id: String,
    role: Role,
    ctx: PeerContext,
    transport: Arc<dyn PeerTransport>,
    status: watch::Sender<PeerStatus>,
    pending: VecDeque<IceCandidate>,
    /// A local offer is outstanding.
    making_offer: bool,
}

impl PeerSession {
    pub(crate) fn new(
        ctx: PeerContext,
        peer_id: String,
        role: Role,
        transport: Arc<dyn PeerTransport>,
        status: watch::Sender<PeerStatus>,
    ) -> Self {
        Self {
            peer_id,
            role,
            ctx,
            transport,
            status,
            pending: VecDeque::new(),
            making_offer: false,
        }
    }

    pub(crate) fn state(&self) -> PeerState {
        self.status.borrow().state
    }

    async fn drive(
        &mut self,
        mut inbox: mpsc::UnboundedReceiver<PeerCommand>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> PeerState {
        if let Err(e) = self.start().await {
            tracing::warn!("negotiation with {} failed to start: {e}", self.peer_id);
            return PeerState::Failed;
        }
        let deadline = self
            .ctx
            .negotiation_timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);

        loop {
            let negotiating = self.state() == PeerState::Negotiating;
            let expired = async {
                match deadline {
                    Some(at) if negotiating => tokio::time::sleep_until(at).await,
                    _ => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                command = inbox.recv() => match command {
                    Some(PeerCommand::Signal(payload)) => {
                        if let Err(e) = self.handle_signal(payload).await {
                            tracing::warn!("negotiation with {} failed: {e}", self.peer_id);
                            return PeerState::Failed;
                        }
                    }
                    Some(PeerCommand::Close) | None => return PeerState::Closed,
                },
                Some(event) = events.recv() => {
                    if let Some(end) = self.handle_transport_event(event) {
                        return end;
                    }
                }
                _ = expired => {
                    tracing::warn!("negotiation with {} timed out", self.peer_id);
                    return PeerState::Failed;
                }
            }
        }
    }

    pub(crate) async fn start(&mut self) -> Result<(), MeshError> {
        self.set_state(PeerState::Negotiating);
        if self.role == Role::Initiator {
            let offer = self.transport.create_offer().await?;
            self.making_offer = true;
            self.send(SignalPayload::Description { sdp: offer });
        }
        Ok(())
    }

    /// Apply one signal from the remote peer. An error means negotiation
    /// cannot continue; a refused candidate is not an error.
    pub(crate) async fn handle_signal(&mut self, payload: SignalPayload) -> Result<(), MeshError> {
        match payload {
            SignalPayload::Description { sdp } => self.handle_description(sdp).await,
            SignalPayload::Candidate { candidate } => {
                self.handle_candidate(candidate).await;
                Ok(())
            }
        }
    }

    async fn handle_description(&mut self, description: SessionDescription) -> Result<(), MeshError> {
        match description.kind {
            SdpKind::Offer => {
                if self.making_offer && self.ctx.glare == GlarePolicy::Polite {
                    tracing::info!("offer collision with {}, keeping ours", self.peer_id);
                    return Ok(());
                }
                self.transport.set_remote_description(&description).await?;
                self.remote_applied().await;
                let answer = self.transport.create_answer().await?;
                self.send(SignalPayload::Description { sdp: answer });
            }
            SdpKind::Answer | SdpKind::Pranswer => {
                if !self.making_offer {
                    tracing::warn!("ignoring {:?} from {} with no offer outstanding", description.kind, self.peer_id);
                    return Ok(());
                }
                self.transport.set_remote_description(&description).await?;
                if description.kind == SdpKind::Answer {
                    self.making_offer = false;
                }
                self.remote_applied().await;
            }
            SdpKind::Rollback => {
                tracing::warn!("ignoring remote rollback from {}", self.peer_id);
            }
        }
        Ok(())
    }

    pub(crate) async fn handle_candidate(&mut self, candidate: IceCandidate) -> CandidateOutcome {
        if !self.status.borrow().remote_description_applied {
            self.pending.push_back(candidate);
            let queued = self.pending.len();
            self.status.send_modify(|s| s.pending_candidates = queued);
            tracing::debug!("queued candidate from {} ({queued} pending)", self.peer_id);
            return CandidateOutcome::Queued;
        }
        self.apply_candidate(candidate).await
    }

    async fn apply_candidate(&mut self, candidate: IceCandidate) -> CandidateOutcome {
        match self.transport.add_ice_candidate(&candidate).await {
            Ok(()) => {
                self.status.send_modify(|s| s.applied_candidates += 1);
                CandidateOutcome::Applied
            }
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!("candidate from {} rejected: {reason}", self.peer_id);
                self.status.send_modify(|s| s.rejected_candidates += 1);
                self.ctx.emitter.emit(MeshEvent::CandidateRejected {
                    peer_id: self.peer_id.clone(),
                    reason: reason.clone(),
                });
                CandidateOutcome::Rejected(reason)
            }
        }
    }

    /// Mark the remote description as set and flush queued candidates in
    /// arrival order.
    async fn remote_applied(&mut self) {
        self.status.send_modify(|s| s.remote_description_applied = true);
        if self.pending.is_empty() {
            return;
        }
        tracing::debug!("applying {} queued candidates from {}", self.pending.len(), self.peer_id);
        while let Some(candidate) = self.pending.pop_front() {
            self.status.send_modify(|s| s.pending_candidates -= 1);
            self.apply_candidate(candidate).await;
        }
    }

    /// Returns the terminal state when the event ends the session.
    pub(crate) fn handle_transport_event(&mut self, event: TransportEvent) -> Option<PeerState> {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.send(SignalPayload::Candidate { candidate });
            }
            TransportEvent::StateChanged(state) => {
                tracing::debug!("transport to {} is {state:?}", self.peer_id);
                match state {
                    TransportState::Connected => {
                        if self.state() == PeerState::Negotiating {
                            self.set_state(PeerState::Connected);
                        }
                    }
                    TransportState::Failed => return Some(PeerState::Failed),
                    TransportState::Disconnected | TransportState::Closed => return Some(PeerState::Closed),
                    TransportState::Connecting => {}
                }
            }
            TransportEvent::TrackAdded(track) => {
                tracing::info!("{:?} track {} from {}", track.kind, track.id, self.peer_id);
                self.status.send_modify(|s| s.remote_tracks.push(track.clone()));
                self.ctx.emitter.emit(MeshEvent::RemoteTrackAdded {
                    peer_id: self.peer_id.clone(),
                    track,
                });
            }
            TransportEvent::DataChannelOpen => self.status.send_modify(|s| s.data_channel_open = true),
            TransportEvent::DataChannelClosed => self.status.send_modify(|s| s.data_channel_open = false),
        }
        None
    }

    /// Release the transport and the remote tracks, then publish `end`.
    pub(crate) async fn teardown(&mut self, end: PeerState) {
        self.transport.close().await;
        self.pending.clear();
        self.status.send_modify(|s| {
            s.remote_tracks.clear();
            s.data_channel_open = false;
            s.pending_candidates = 0;
        });
        self.set_state(end);
        self.ctx.emitter.emit(MeshEvent::PeerRemoved(self.peer_id.clone()));
        tracing::info!("session with {} ended: {end:?}", self.peer_id);
    }

    fn set_state(&self, state: PeerState) {
        advance(&self.ctx.emitter, &self.status, &self.peer_id, state);
    }

    fn send(&self, payload: SignalPayload) {
        match Envelope::signal(&self.peer_id, &payload) {
            Ok(envelope) => {
                self.ctx.signal.send(&envelope);
            }
            Err(e) => tracing::warn!("cannot encode signal for {}: {e}", self.peer_id),
        }
    }
}
