//! Binds the call session seams to the real WebRTC peer, local media and signaling client.

use crate::call::{CallPeer, EnvelopeSink, LocalMedia, PeerConnector};
use crate::error::CallError;
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use vidcall_protocol::ws::{IceCandidate, SessionDescription, SignalingMessage};
use vidcall_signaling::client::SignalingClient;
use vidcall_signaling::transport::SignalingTransport;
use vidcall_webrtc::config::IceConfig;
use vidcall_webrtc::{MediaSource, Peer, PeerEvent, RemoteFrame, TrackKind};

/// Allocates [`Peer`]s with every local track attached.
///
/// Without local media every allocation fails with [`CallError::MediaUnavailable`], before
/// anything is sent to the remote peer.
#[derive(Debug, Clone)]
pub struct WebrtcConnector {
    ice: IceConfig,
    media: Option<MediaSource>,
    remote_tx: Option<mpsc::Sender<RemoteFrame>>,
}

impl WebrtcConnector {
    pub fn new(
        ice: IceConfig,
        media: Option<MediaSource>,
        remote_tx: Option<mpsc::Sender<RemoteFrame>>,
    ) -> Self {
        Self {
            ice,
            media,
            remote_tx,
        }
    }
}

#[async_trait]
impl PeerConnector for WebrtcConnector {
    type Peer = Peer;

    async fn connect(&self) -> Result<(Peer, broadcast::Receiver<PeerEvent>), CallError> {
        let media = self.media.as_ref().ok_or_else(|| {
            CallError::MediaUnavailable("no local tracks were acquired".to_string())
        })?;
        Ok(Peer::new(self.ice.clone(), media, self.remote_tx.clone()).await?)
    }
}

#[async_trait]
impl CallPeer for Peer {
    async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        Ok(Peer::create_offer(self).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        Ok(Peer::create_answer(self).await?)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), CallError> {
        Ok(Peer::set_remote_description(self, description).await?)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        Ok(self.add_remote_ice_candidate(candidate).await?)
    }

    async fn close(&self) -> Result<(), CallError> {
        Ok(Peer::close(self).await?)
    }
}

impl LocalMedia for Option<MediaSource> {
    fn toggle(&self, kind: TrackKind) -> Result<bool, CallError> {
        match self {
            Some(media) => LocalMedia::toggle(media, kind),
            None => Err(CallError::MediaUnavailable(format!("no local {kind} track"))),
        }
    }

    fn is_enabled(&self, kind: TrackKind) -> Option<bool> {
        LocalMedia::is_enabled(self.as_ref()?, kind)
    }
}

impl LocalMedia for MediaSource {
    fn toggle(&self, kind: TrackKind) -> Result<bool, CallError> {
        Ok(MediaSource::toggle(self, kind)?)
    }

    fn is_enabled(&self, kind: TrackKind) -> Option<bool> {
        self.track(kind).map(|track| track.is_enabled())
    }
}

impl<ST: SignalingTransport> EnvelopeSink for SignalingClient<ST> {
    fn send(&self, msg: SignalingMessage) -> Result<(), CallError> {
        self.try_send(msg).map_err(|err| {
            tracing::warn!(?err, "Failed to queue envelope");
            CallError::from(err)
        })
    }
}
