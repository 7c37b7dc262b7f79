//! Seam between the negotiation state machine and the media stack.
//!
//! A [`PeerTransport`] is one direct connection to one remote participant.
//! Asynchronous notifications (gathered candidates, connectivity changes,
//! incoming tracks) are pushed as [`TransportEvent`]s onto the queue handed
//! to [`TransportFactory::create`], and the owning peer task drains it in
//! order alongside its signaling inbox.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::track::track_remote::TrackRemote;

use crate::controls::LocalMedia;
use crate::errors::MeshError;
use crate::events::TrackKind;
use crate::protocol::{IceCandidate, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    StateChanged(TransportState),
    TrackAdded(RemoteTrack),
    DataChannelOpen,
    DataChannelClosed,
}

/// Inbound media track. The handle is `None` for transports that do not
/// carry real media.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
    pub handle: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .field("has_handle", &self.handle.is_some())
            .finish()
    }
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Generate an offer and install it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, MeshError>;

    /// Generate an answer to the applied remote offer and install it.
    async fn create_answer(&self) -> Result<SessionDescription, MeshError>;

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<(), MeshError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MeshError>;

    /// Close the connection and its data channel. Idempotent.
    async fn close(&self);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Open a transport toward `peer_id` that sends the shared local tracks.
    async fn create(
        &self,
        peer_id: &str,
        media: &LocalMedia,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, MeshError>;
}
