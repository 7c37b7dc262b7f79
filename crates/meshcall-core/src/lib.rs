//! Meshcall core: full-mesh call orchestration.
//!
//! Joins a room through a signaling relay, negotiates one direct WebRTC
//! connection per remote participant and carries room chat over the relay.
//! Native shells drive it through [`RoomSession`] and observe it through
//! [`MeshEventListener`].

pub mod chat;
pub mod controls;
pub mod errors;
pub mod events;
pub mod participants;
pub mod peer;
pub mod protocol;
pub mod room;
pub mod rtc;
pub mod settings;
pub mod signaling;
pub mod transport;

#[cfg(test)]
mod testing;

pub use chat::ChatService;
pub use controls::{LocalMedia, LocalTrack, MediaConstraints, MediaControls, MediaSource, SampleSource};
pub use errors::MeshError;
pub use events::{
    ClientIdentity, ConnectionState, MediaControlsState, MeshEvent, MeshEventListener, ParticipantInfo, TrackKind,
};
pub use peer::{CandidateOutcome, PeerHandle, PeerState, PeerStatus, Role};
pub use protocol::ChatMessage;
pub use room::RoomSession;
pub use rtc::RtcTransportFactory;
pub use settings::{GlarePolicy, IceServer, Settings, SettingsStore};
pub use signaling::{RelayConnector, WsConnector};
pub use transport::{PeerTransport, RemoteTrack, TransportFactory};
