//! [`PeerTransport`] backed by a `webrtc` peer connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::controls::LocalMedia;
use crate::errors::MeshError;
use crate::events::TrackKind;
use crate::protocol::{IceCandidate, SessionDescription};
use crate::settings::{IceServer, Settings};
use crate::transport::{PeerTransport, RemoteTrack, TransportEvent, TransportFactory, TransportState};

fn rtc_err(context: &str) -> impl Fn(webrtc::Error) -> MeshError + '_ {
    move |e| MeshError::Transport(format!("{context}: {e}"))
}

/// Builds one `RTCPeerConnection` per remote peer from a shared API
/// instance (default codecs and interceptors).
pub struct RtcTransportFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    data_channel_label: Option<String>,
}

impl RtcTransportFactory {
    pub fn new(settings: &Settings) -> Result<Self, MeshError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(rtc_err("register codecs"))?;
        let interceptors = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(rtc_err("register interceptors"))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptors)
            .build();

        Ok(Self {
            api,
            ice_servers: settings.ice_servers.iter().map(ice_server).collect(),
            data_channel_label: settings.data_channel_label.clone(),
        })
    }
}

fn ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        peer_id: &str,
        media: &LocalMedia,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, MeshError> {
        let transport: Arc<dyn PeerTransport> = self.open(peer_id, media, events).await?;
        Ok(transport)
    }
}

impl RtcTransportFactory {
    async fn open(
        &self,
        peer_id: &str,
        media: &LocalMedia,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<RtcTransport>, MeshError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(rtc_err("new peer connection"))?,
        );

        for track in media.tracks() {
            let local: Arc<dyn TrackLocal + Send + Sync> = track.rtp_track();
            let sender = pc.add_track(local).await.map_err(rtc_err("add track"))?;
            // Incoming RTCP must be read for the interceptors to run.
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(TransportEvent::LocalCandidate(from_rtc_candidate(init)));
                    }
                    Err(e) => tracing::warn!("cannot serialize local candidate: {e}"),
                }
            })
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let mapped = match state {
                RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
                RTCPeerConnectionState::Connected => Some(TransportState::Connected),
                RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
                RTCPeerConnectionState::Failed => Some(TransportState::Failed),
                RTCPeerConnectionState::Closed => Some(TransportState::Closed),
                _ => None,
            };
            if let Some(state) = mapped {
                let _ = tx.send(TransportEvent::StateChanged(state));
            }
            Box::pin(async {})
        }));

        let tx = events.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let kind = match track.kind() {
                RTPCodecType::Audio => Some(TrackKind::Audio),
                RTPCodecType::Video => Some(TrackKind::Video),
                _ => None,
            };
            if let Some(kind) = kind {
                let _ = tx.send(TransportEvent::TrackAdded(RemoteTrack {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind,
                    handle: Some(track),
                }));
            }
            Box::pin(async {})
        }));

        let data_channel = match &self.data_channel_label {
            Some(label) => {
                let dc = pc
                    .create_data_channel(label, None)
                    .await
                    .map_err(rtc_err("create data channel"))?;
                let tx = events.clone();
                dc.on_open(Box::new(move || {
                    let _ = tx.send(TransportEvent::DataChannelOpen);
                    Box::pin(async {})
                }));
                let tx = events;
                dc.on_close(Box::new(move || {
                    let _ = tx.send(TransportEvent::DataChannelClosed);
                    Box::pin(async {})
                }));
                Some(dc)
            }
            None => None,
        };

        tracing::debug!("peer connection to {peer_id} created with {} local tracks", media.tracks().len());
        Ok(Arc::new(RtcTransport {
            pc,
            data_channel,
            closed: AtomicBool::new(false),
        }))
    }
}

/// One direct connection. `webrtc` cannot roll a local offer back, so a
/// pair must agree on a single offerer before negotiating.
pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    data_channel: Option<Arc<RTCDataChannel>>,
    closed: AtomicBool,
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, MeshError> {
        let offer = self.pc.create_offer(None).await.map_err(rtc_err("create offer"))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(rtc_err("set local offer"))?;
        from_rtc_description(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, MeshError> {
        let answer = self.pc.create_answer(None).await.map_err(rtc_err("create answer"))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(rtc_err("set local answer"))?;
        from_rtc_description(&answer)
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<(), MeshError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(rtc_err("set remote description"))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MeshError> {
        self.pc
            .add_ice_candidate(to_rtc_candidate(candidate))
            .await
            .map_err(rtc_err("add candidate"))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(dc) = &self.data_channel {
            if let Err(e) = dc.close().await {
                tracing::debug!("data channel close: {e}");
            }
        }
        if let Err(e) = self.pc.close().await {
            tracing::warn!("peer connection close: {e}");
        }
    }
}

// Both description types share the `{"type", "sdp"}` JSON shape.
fn to_rtc_description(description: &SessionDescription) -> Result<RTCSessionDescription, MeshError> {
    serde_json::to_value(description)
        .and_then(serde_json::from_value)
        .map_err(|e| MeshError::Protocol(format!("session description: {e}")))
}

fn from_rtc_description(description: &RTCSessionDescription) -> Result<SessionDescription, MeshError> {
    serde_json::to_value(description)
        .and_then(serde_json::from_value)
        .map_err(|e| MeshError::Protocol(format!("session description: {e}")))
}

fn to_rtc_candidate(candidate: &IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate.clone(),
        sdp_mid: candidate.sdp_mid.clone(),
        sdp_mline_index: candidate.sdp_m_line_index,
        username_fragment: candidate.username_fragment.clone(),
    }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::{MediaConstraints, MediaSource, SampleSource};
    use crate::protocol::SdpKind;
    use std::time::Duration;
    use webrtc::peer_connection::signaling_state::RTCSignalingState;

    #[test]
    fn descriptions_convert_both_ways() {
        let ours = SessionDescription::answer("v=0\r\n");
        let rtc = to_rtc_description(&ours).unwrap();
        assert_eq!(rtc.sdp, "v=0\r\n");
        assert_eq!(from_rtc_description(&rtc).unwrap(), ours);

        let rollback = to_rtc_description(&SessionDescription { kind: SdpKind::Rollback, sdp: String::new() }).unwrap();
        assert_eq!(from_rtc_description(&rollback).unwrap().kind, SdpKind::Rollback);
    }

    #[test]
    fn candidates_keep_every_field() {
        let ours = IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: Some("ufrag".into()),
        };
        assert_eq!(from_rtc_candidate(to_rtc_candidate(&ours)), ours);
    }

    #[test]
    fn ice_servers_follow_settings() {
        let server = ice_server(&IceServer {
            urls: vec!["turn:turn.example:3478".into()],
            username: Some("u".into()),
            credential: None,
        });
        assert_eq!(server.urls, ["turn:turn.example:3478"]);
        assert_eq!(server.username, "u");
        assert_eq!(server.credential, "");
    }

    #[tokio::test]
    async fn crossing_offers_need_a_single_offerer() {
        let settings = Settings {
            ice_servers: Vec::new(),
            ..Settings::default()
        };
        let factory = RtcTransportFactory::new(&settings).unwrap();
        let media = SampleSource.acquire(&MediaConstraints::default()).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let smaller = factory.open("c9", &media, tx.clone()).await.unwrap();
        let greater = factory.open("c2", &media, tx).await.unwrap();

        // An offer cannot be applied on top of our own.
        let offer = smaller.create_offer().await.unwrap();
        greater.create_offer().await.unwrap();
        assert!(greater.set_remote_description(&offer).await.is_err());
        assert_eq!(greater.pc.signaling_state(), RTCSignalingState::HaveLocalOffer);

        // With the greater id answering instead, both ends settle.
        let fresh = factory.open("c9", &media, mpsc::unbounded_channel().0).await.unwrap();
        fresh.set_remote_description(&offer).await.unwrap();
        let answer = fresh.create_answer().await.unwrap();
        smaller.set_remote_description(&answer).await.unwrap();
        assert_eq!(smaller.pc.signaling_state(), RTCSignalingState::Stable);
        assert_eq!(fresh.pc.signaling_state(), RTCSignalingState::Stable);

        for transport in [smaller, greater, fresh] {
            transport.close().await;
        }
    }

    #[tokio::test]
    async fn two_transports_negotiate_locally() {
        let settings = Settings {
            ice_servers: Vec::new(),
            ..Settings::default()
        };
        let factory = RtcTransportFactory::new(&settings).unwrap();
        let media = SampleSource.acquire(&MediaConstraints::default()).await.unwrap();

        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = factory.create("b", &media, a_tx).await.unwrap();
        let b = factory.create("a", &media, b_tx).await.unwrap();

        let offer = a.create_offer().await.unwrap();
        assert!(offer.is_offer());
        assert!(offer.sdp.contains("m=audio"));
        b.set_remote_description(&offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);
        a.set_remote_description(&answer).await.unwrap();

        // A garbage candidate is refused without breaking the transport.
        assert!(a.add_ice_candidate(&IceCandidate::new("garbage")).await.is_err());

        let forward = |rx: &mut mpsc::UnboundedReceiver<TransportEvent>| {
            let mut found = Vec::new();
            while let Ok(event) = rx.try_recv() {
                if let TransportEvent::LocalCandidate(c) = event {
                    found.push(c);
                }
            }
            found
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        for c in forward(&mut a_rx) {
            let _ = b.add_ice_candidate(&c).await;
        }
        for c in forward(&mut b_rx) {
            let _ = a.add_ice_candidate(&c).await;
        }

        a.close().await;
        a.close().await;
        b.close().await;
    }
}
