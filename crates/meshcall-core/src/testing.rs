//! In-memory collaborators for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use crate::controls::{LocalMedia, MediaConstraints, MediaSource, SampleSource};
use crate::errors::MeshError;
use crate::events::{MeshEvent, MeshEventListener};
use crate::protocol::{IceCandidate, SessionDescription};
use crate::signaling::{RelayConnector, RelayFrame, RelayLink};
use crate::transport::{PeerTransport, TransportEvent, TransportFactory};

const WAIT: Duration = Duration::from_secs(2);

#[derive(Default)]
pub struct CountingSource {
    count: AtomicUsize,
}

impl CountingSource {
    pub fn acquisitions(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for CountingSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MeshError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        SampleSource.acquire(constraints).await
    }
}

/// Server end of an in-memory relay link.
pub struct RelayEnd {
    to_client: Option<mpsc::UnboundedSender<String>>,
    from_client: mpsc::UnboundedReceiver<RelayFrame>,
}

impl RelayEnd {
    pub fn push(&self, text: &str) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(text.to_string());
        }
    }

    pub fn push_json(&self, value: serde_json::Value) {
        self.push(&value.to_string());
    }

    /// Drop the server side, as if the relay went away.
    pub fn hang_up(&mut self) {
        self.to_client = None;
    }

    pub async fn next_frame(&mut self) -> Option<RelayFrame> {
        tokio::time::timeout(WAIT, self.from_client.recv()).await.ok().flatten()
    }

    pub fn try_next_frame(&mut self) -> Option<RelayFrame> {
        self.from_client.try_recv().ok()
    }

    pub async fn next_text(&mut self) -> Option<String> {
        match self.next_frame().await? {
            RelayFrame::Text(text) => Some(text),
            RelayFrame::Close => None,
        }
    }

    pub async fn next_json(&mut self) -> Option<serde_json::Value> {
        serde_json::from_str(&self.next_text().await?).ok()
    }

    /// Skip frames until one of the given `type` shows up.
    pub async fn next_of_type(&mut self, kind: &str) -> Option<serde_json::Value> {
        loop {
            let json = self.next_json().await?;
            if json["type"] == kind {
                return Some(json);
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryConnector {
    urls: Mutex<Vec<Url>>,
    relays: Mutex<VecDeque<RelayEnd>>,
    fail_next: AtomicBool,
}

impl MemoryConnector {
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn urls(&self) -> Vec<Url> {
        self.urls.lock().unwrap().clone()
    }

    pub fn take_relay(&self) -> Option<RelayEnd> {
        self.relays.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl RelayConnector for MemoryConnector {
    async fn open(&self, url: &Url) -> Result<RelayLink, MeshError> {
        self.urls.lock().unwrap().push(url.clone());
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(MeshError::Connection("connection refused".into()));
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.relays.lock().unwrap().push_back(RelayEnd {
            to_client: Some(in_tx),
            from_client: out_rx,
        });
        Ok(RelayLink {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeCall {
    CreateOffer,
    CreateAnswer,
    SetRemote(SessionDescription),
    AddCandidate(String),
    Close,
}

#[derive(Default)]
struct FakeState {
    calls: Vec<FakeCall>,
    local_offer: bool,
    remote_set: bool,
    closed: bool,
}

/// Scripted transport: records calls and lets the test inject events.
pub struct FakeTransport {
    peer_id: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<FakeState>,
}

impl FakeTransport {
    pub fn new(peer_id: &str, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            events,
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                FakeCall::AddCandidate(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    fn record(&self, call: FakeCall) {
        self.state.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn create_offer(&self) -> Result<SessionDescription, MeshError> {
        self.record(FakeCall::CreateOffer);
        self.state.lock().unwrap().local_offer = true;
        Ok(SessionDescription::offer(format!("fake-offer-{}", self.peer_id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MeshError> {
        self.record(FakeCall::CreateAnswer);
        Ok(SessionDescription::answer(format!("fake-answer-{}", self.peer_id)))
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<(), MeshError> {
        self.record(FakeCall::SetRemote(description.clone()));
        let mut state = self.state.lock().unwrap();
        if description.is_offer() && state.local_offer {
            return Err(MeshError::Transport("offer received in have-local-offer".into()));
        }
        if !description.is_offer() {
            state.local_offer = false;
        }
        state.remote_set = true;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MeshError> {
        if !self.state.lock().unwrap().remote_set {
            return Err(MeshError::Transport("no remote description".into()));
        }
        if candidate.candidate.contains("bad") {
            return Err(MeshError::Transport(format!("cannot parse {}", candidate.candidate)));
        }
        self.record(FakeCall::AddCandidate(candidate.candidate.clone()));
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.closed {
            state.closed = true;
            state.calls.push(FakeCall::Close);
        }
    }
}

#[derive(Default)]
pub struct FakeTransportFactory {
    created: Mutex<Vec<String>>,
    transports: Mutex<HashMap<String, Arc<FakeTransport>>>,
    fail_for: Mutex<Vec<String>>,
}

impl FakeTransportFactory {
    /// Ids in creation order, repeats included.
    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    pub fn fail_for(&self, peer_id: &str) {
        self.fail_for.lock().unwrap().push(peer_id.to_string());
    }

    pub fn transport(&self, peer_id: &str) -> Option<Arc<FakeTransport>> {
        self.transports.lock().unwrap().get(peer_id).cloned()
    }

    /// Wait until a transport for `peer_id` exists.
    pub async fn wait_transport(&self, peer_id: &str) -> Arc<FakeTransport> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if let Some(t) = self.transport(peer_id) {
                return t;
            }
            assert!(tokio::time::Instant::now() < deadline, "no transport for {peer_id}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn create(
        &self,
        peer_id: &str,
        _media: &LocalMedia,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, MeshError> {
        self.created.lock().unwrap().push(peer_id.to_string());
        if self.fail_for.lock().unwrap().iter().any(|p| p == peer_id) {
            return Err(MeshError::Transport("no transport for you".into()));
        }
        let transport = Arc::new(FakeTransport::new(peer_id, events));
        self.transports
            .lock()
            .unwrap()
            .insert(peer_id.to_string(), transport.clone());
        Ok(transport)
    }
}

/// Listener that records every event and lets tests wait on them.
pub struct EventProbe {
    tx: mpsc::UnboundedSender<MeshEvent>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MeshEvent>>,
    seen: Mutex<Vec<MeshEvent>>,
}

impl EventProbe {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            seen: Mutex::new(Vec::new()),
        })
    }

    /// Consume events until one matches; panics after a timeout.
    pub async fn wait_for(&self, what: &str, mut pred: impl FnMut(&MeshEvent) -> bool) -> MeshEvent {
        let mut rx = self.rx.lock().await;
        let found = tokio::time::timeout(WAIT, async {
            while let Some(event) = rx.recv().await {
                if pred(&event) {
                    return Some(event);
                }
            }
            None
        })
        .await;
        match found {
            Ok(Some(event)) => event,
            _ => panic!("timed out waiting for {what}; saw {:?}", self.seen()),
        }
    }

    /// Everything received so far, consumed or not.
    pub fn seen(&self) -> Vec<MeshEvent> {
        self.seen.lock().unwrap().clone()
    }
}

impl MeshEventListener for EventProbe {
    fn on_event(&self, event: MeshEvent) {
        self.seen.lock().unwrap().push(event.clone());
        let _ = self.tx.send(event);
    }
}
