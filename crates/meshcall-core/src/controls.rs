use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::errors::MeshError;
use crate::events::{MediaControlsState, TrackKind};

const AUDIO_CLOCK_RATE: u32 = 48_000;
const AUDIO_CHANNELS: u16 = 2;
const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Capture parameters handed to the media source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    pub noise_suppression: bool,
    pub echo_cancellation: bool,
    pub auto_gain_control: bool,
    pub width: u32,
    pub height: u32,
    pub audio_enabled_initially: bool,
    pub video_enabled_initially: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            noise_suppression: true,
            echo_cancellation: true,
            auto_gain_control: true,
            width: 1280,
            height: 720,
            audio_enabled_initially: true,
            video_enabled_initially: true,
        }
    }
}

/// A captured track shared by every peer connection.
///
/// The enabled flag is read on every write, so flipping it takes effect on
/// all peers at once without renegotiation.
#[derive(Clone)]
pub struct LocalTrack {
    kind: TrackKind,
    enabled: Arc<AtomicBool>,
    rtp: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, stream_id: &str) -> Self {
        let codec = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: AUDIO_CLOCK_RATE,
                channels: AUDIO_CHANNELS,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: VIDEO_CLOCK_RATE,
                ..Default::default()
            },
        };
        let id = match kind {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        };
        Self {
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
            rtp: Arc::new(TrackLocalStaticSample::new(
                codec,
                id.to_owned(),
                stream_id.to_owned(),
            )),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Flip the enabled flag and return the new value.
    pub fn toggle(&self) -> bool {
        !self.enabled.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        self.rtp.clone()
    }

    /// Feed one encoded frame from the capture device. Frames written while
    /// the track is disabled are dropped.
    pub async fn write_sample(&self, sample: &Sample) -> Result<(), MeshError> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.rtp
            .write_sample(sample)
            .await
            .map_err(|e| MeshError::Media(format!("write {:?} sample: {e}", self.kind)))
    }
}

/// Local capture, acquired once and shared read-only by all peers.
#[derive(Clone)]
pub struct LocalMedia {
    stream_id: String,
    tracks: Arc<Vec<LocalTrack>>,
}

impl LocalMedia {
    pub fn new(stream_id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            stream_id: stream_id.into(),
            tracks: Arc::new(tracks),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    pub fn controls_state(&self) -> MediaControlsState {
        MediaControlsState {
            available: true,
            audio_enabled: self.track(TrackKind::Audio).map(LocalTrack::is_enabled),
            video_enabled: self.track(TrackKind::Video).map(LocalTrack::is_enabled),
        }
    }
}

/// Device capture collaborator.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MeshError>;
}

/// Creates Opus/VP8 sample tracks that the native shell feeds with encoded
/// frames through [`LocalTrack::write_sample`].
pub struct SampleSource;

#[async_trait]
impl MediaSource for SampleSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MeshError> {
        if !constraints.audio && !constraints.video {
            return Err(MeshError::Media("neither audio nor video requested".into()));
        }
        let stream_id = uuid::Uuid::new_v4().to_string();
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack::new(TrackKind::Audio, &stream_id));
        }
        if constraints.video {
            tracks.push(LocalTrack::new(TrackKind::Video, &stream_id));
        }
        tracing::info!(
            "local media created: stream={stream_id} audio={} video={} ({}x{})",
            constraints.audio,
            constraints.video,
            constraints.width,
            constraints.height
        );
        Ok(LocalMedia::new(stream_id, tracks))
    }
}

/// Controls for local media (microphone, camera).
///
/// Acquisition is lazy and happens at most once; later calls reuse the same
/// tracks. Toggles act on the shared tracks.
#[derive(Clone)]
pub struct MediaControls {
    source: Arc<dyn MediaSource>,
    constraints: MediaConstraints,
    local: Arc<Mutex<Option<LocalMedia>>>,
}

impl MediaControls {
    pub fn new(source: Arc<dyn MediaSource>, constraints: MediaConstraints) -> Self {
        Self {
            source,
            constraints,
            local: Arc::new(Mutex::new(None)),
        }
    }

    /// Acquire local media, or return what was acquired before.
    pub async fn acquire(&self) -> Result<LocalMedia, MeshError> {
        let mut local = self.local.lock().await;
        if let Some(media) = local.as_ref() {
            return Ok(media.clone());
        }
        let media = self.source.acquire(&self.constraints).await?;
        if let Some(track) = media.track(TrackKind::Audio) {
            track.set_enabled(self.constraints.audio_enabled_initially);
        }
        if let Some(track) = media.track(TrackKind::Video) {
            track.set_enabled(self.constraints.video_enabled_initially);
        }
        *local = Some(media.clone());
        Ok(media)
    }

    pub async fn current(&self) -> Option<LocalMedia> {
        self.local.lock().await.clone()
    }

    /// Toggle the microphone. Returns the new state, or `None` when no audio
    /// track was captured.
    pub async fn toggle_audio(&self) -> Option<bool> {
        self.toggle(TrackKind::Audio).await
    }

    /// Toggle the camera. Returns the new state, or `None` when no video
    /// track was captured.
    pub async fn toggle_video(&self) -> Option<bool> {
        self.toggle(TrackKind::Video).await
    }

    async fn toggle(&self, kind: TrackKind) -> Option<bool> {
        let local = self.local.lock().await;
        let enabled = local.as_ref()?.track(kind)?.toggle();
        tracing::info!("{kind:?} enabled: {enabled}");
        Some(enabled)
    }

    pub async fn state(&self) -> MediaControlsState {
        match self.local.lock().await.as_ref() {
            Some(media) => media.controls_state(),
            None => MediaControlsState::default(),
        }
    }
}
