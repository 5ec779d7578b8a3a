use crate::config::{
    AUDIO_CHANNELS, AUDIO_CLOCK_RATE, AUDIO_FRAME_DURATION, MediaConfig, VIDEO_CLOCK_RATE,
    VIDEO_FRAME_DURATION, WEBRTC_AUDIO_TRACK_ID, WEBRTC_STREAM_ID, WEBRTC_VIDEO_TRACK_ID,
};
use crate::error::WebrtcError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::instrument;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// An encoded media frame (Opus packet or VP8 frame) produced by the capture layer.
pub type EncodedFrame = Bytes;

/// RTP payload received from the remote peer, tagged with the track it arrived on.
#[derive(Debug, Clone)]
pub struct RemoteFrame {
    pub kind: TrackKind,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub(crate) fn from_codec_type(codec_type: RTPCodecType) -> Option<Self> {
        match codec_type {
            RTPCodecType::Audio => Some(TrackKind::Audio),
            RTPCodecType::Video => Some(TrackKind::Video),
            _ => None,
        }
    }

    fn frame_duration(self) -> Duration {
        match self {
            TrackKind::Audio => AUDIO_FRAME_DURATION,
            TrackKind::Video => VIDEO_FRAME_DURATION,
        }
    }
}

impl Display for TrackKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// A locally captured track. Clones share the underlying track and its enabled flag.
#[derive(Clone)]
pub struct LocalTrack {
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
}

impl Debug for LocalTrack {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl LocalTrack {
    fn new(kind: TrackKind) -> Self {
        let (codec, id) = match kind {
            TrackKind::Audio => (
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: AUDIO_CLOCK_RATE,
                    channels: AUDIO_CHANNELS,
                    ..Default::default()
                },
                WEBRTC_AUDIO_TRACK_ID,
            ),
            TrackKind::Video => (
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: VIDEO_CLOCK_RATE,
                    ..Default::default()
                },
                WEBRTC_VIDEO_TRACK_ID,
            ),
        };

        Self {
            kind,
            track: Arc::new(TrackLocalStaticSample::new(
                codec,
                id.to_owned(),
                WEBRTC_STREAM_ID.to_owned(),
            )),
            enabled: Arc::new(AtomicBool::new(true)),
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

    pub(crate) fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }

    pub(crate) fn enabled_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.enabled)
    }
}

/// Owns the locally captured audio/video tracks attached to every call.
///
/// Device capture itself happens outside of this crate; encoded frames are fed in via
/// [`MediaSource::start_sender`]. Muting a track keeps it negotiated but stops forwarding frames.
#[derive(Debug, Clone)]
pub struct MediaSource {
    tracks: Vec<LocalTrack>,
}

impl MediaSource {
    #[instrument(level = "debug", err)]
    pub fn acquire(config: &MediaConfig) -> Result<Self, WebrtcError> {
        let mut tracks = Vec::with_capacity(2);
        if config.audio {
            tracks.push(LocalTrack::new(TrackKind::Audio));
        }
        if config.video {
            tracks.push(LocalTrack::new(TrackKind::Video));
        }

        if tracks.is_empty() {
            return Err(WebrtcError::MediaUnavailable(
                "neither audio nor video capture is enabled".to_string(),
            ));
        }

        tracing::debug!(count = tracks.len(), "Acquired local tracks");
        Ok(Self { tracks })
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|track| track.kind == kind)
    }

    /// Flips the enabled flag of the track of the given kind, returning the new value.
    pub fn toggle(&self, kind: TrackKind) -> Result<bool, WebrtcError> {
        let track = self
            .track(kind)
            .ok_or_else(|| WebrtcError::MediaUnavailable(format!("no local {kind} track")))?;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        tracing::debug!(%kind, ?enabled, "Toggled local track");
        Ok(enabled)
    }

    /// Starts forwarding encoded frames from the capture layer to the track of the given kind.
    pub fn start_sender(
        &self,
        kind: TrackKind,
        input_rx: mpsc::Receiver<EncodedFrame>,
    ) -> Result<crate::Sender, WebrtcError> {
        let track = self
            .track(kind)
            .ok_or_else(|| WebrtcError::MediaUnavailable(format!("no local {kind} track")))?;
        Ok(crate::Sender::new(
            track.rtc_track(),
            track.enabled_flag(),
            kind.frame_duration(),
            input_rx,
        ))
    }
}
