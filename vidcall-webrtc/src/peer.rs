use crate::config::{IceConfig, IntoRtc, PEER_EVENTS_CAPACITY};
use crate::error::WebrtcError;
use crate::media::{MediaSource, RemoteFrame, TrackKind};
use anyhow::Context;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::instrument;
use vidcall_protocol::ws::{IceCandidate, SdpType, SessionDescription};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::track::track_local::TrackLocal;

pub type PeerConnectionState = RTCPeerConnectionState;

#[derive(Debug, Clone)]
pub enum PeerEvent {
    ConnectionState(PeerConnectionState),
    /// A local ICE candidate was gathered and should be trickled to the remote peer.
    IceCandidate(IceCandidate),
    /// The remote peer started sending a track of the given kind.
    Track(TrackKind),
    Error(String),
}

/// A single peer connection with all local tracks of a [`MediaSource`] attached.
pub struct Peer {
    peer_connection: RTCPeerConnection,
    receiver: crate::Receiver,
}

impl Peer {
    #[instrument(level = "debug", skip(media, remote_tx), err)]
    pub async fn new(
        config: IceConfig,
        media: &MediaSource,
        remote_tx: Option<mpsc::Sender<RemoteFrame>>,
    ) -> Result<(Self, broadcast::Receiver<PeerEvent>), WebrtcError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .context("Failed to register default codecs")?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .context("Failed to register default interceptors")?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer_connection = api
            .new_peer_connection(config.into_rtc())
            .await
            .context("Failed to create peer connection")?;

        for track in media.tracks() {
            tracing::trace!(kind = %track.kind(), "Adding local track");
            peer_connection
                .add_track(track.rtc_track() as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .with_context(|| format!("Failed to add {} track to peer connection", track.kind()))?;
        }

        let (events_tx, events_rx) = broadcast::channel(PEER_EVENTS_CAPACITY);

        {
            let events_tx = events_tx.clone();
            peer_connection.on_peer_connection_state_change(Box::new(
                move |state: RTCPeerConnectionState| {
                    tracing::trace!(?state, "Peer connection state changed");
                    if let Err(err) = events_tx.send(PeerEvent::ConnectionState(state)) {
                        tracing::warn!(?err, "Failed to send peer connection state event");
                    }
                    Box::pin(async {})
                },
            ));
        }

        {
            let events_tx = events_tx.clone();
            peer_connection.on_ice_candidate(Box::new(
                move |candidate: Option<RTCIceCandidate>| {
                    tracing::trace!(?candidate, "Local ICE candidate gathered");
                    if let Some(candidate) = candidate {
                        match candidate.to_json() {
                            Ok(init) => {
                                let candidate = IceCandidate {
                                    candidate: init.candidate,
                                    sdp_mid: init.sdp_mid,
                                    sdp_mline_index: init.sdp_mline_index,
                                    username_fragment: init.username_fragment,
                                };
                                if let Err(err) = events_tx.send(PeerEvent::IceCandidate(candidate))
                                {
                                    tracing::warn!(?err, "Failed to send ICE candidate event");
                                }
                            }
                            Err(err) => {
                                tracing::warn!(?err, "Failed to serialize ICE candidate");
                                let _ = events_tx.send(PeerEvent::Error(err.to_string()));
                            }
                        }
                    }
                    Box::pin(async {})
                },
            ));
        }

        let receiver = crate::Receiver::new(&peer_connection, events_tx, remote_tx);

        Ok((
            Self {
                peer_connection,
                receiver,
            },
            events_rx,
        ))
    }

    /// Creates an offer and installs it as local description.
    #[instrument(level = "trace", skip(self), err)]
    pub async fn create_offer(&self) -> Result<SessionDescription, WebrtcError> {
        tracing::trace!("Creating SDP offer");

        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .context("Failed to create offer")?;

        self.peer_connection
            .set_local_description(offer)
            .await
            .context("Failed to set offer as local description")?;

        let local_description = self.local_description().await?;
        tracing::trace!("Created SDP offer");
        Ok(local_description)
    }

    /// Creates an answer to the installed remote offer and installs it as local description.
    #[instrument(level = "trace", skip(self), err)]
    pub async fn create_answer(&self) -> Result<SessionDescription, WebrtcError> {
        tracing::trace!("Creating SDP answer");

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .context("Failed to create answer")?;

        self.peer_connection
            .set_local_description(answer)
            .await
            .context("Failed to set answer as local description")?;

        let local_description = self.local_description().await?;
        tracing::trace!("Created SDP answer");
        Ok(local_description)
    }

    #[instrument(level = "trace", skip(self, description), fields(sdp_type = ?description.sdp_type), err)]
    pub async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), WebrtcError> {
        tracing::trace!("Setting remote description");

        let description = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
            SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
            SdpType::Rollback => {
                return Err(WebrtcError::InvalidDescription(
                    "rollback is not supported".to_string(),
                ));
            }
        }
        .map_err(|err| WebrtcError::InvalidDescription(err.to_string()))?;

        self.peer_connection
            .set_remote_description(description)
            .await
            .context("Failed to set remote description")?;

        tracing::trace!("Remote description set");
        Ok(())
    }

    #[instrument(level = "trace", skip(self, candidate), err)]
    pub async fn add_remote_ice_candidate(
        &self,
        candidate: IceCandidate,
    ) -> Result<(), WebrtcError> {
        tracing::trace!("Adding remote ICE candidate");

        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .context("Failed to add remote ICE candidate")?;

        tracing::trace!("Added remote ICE candidate");
        Ok(())
    }

    /// Stops receiving remote media and closes the peer connection.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn close(&self) -> Result<(), WebrtcError> {
        tracing::debug!("Closing peer");
        self.receiver.shutdown();

        self.peer_connection
            .close()
            .await
            .context("Failed to close peer connection")?;

        tracing::trace!("Successfully closed peer connection");
        Ok(())
    }

    async fn local_description(&self) -> Result<SessionDescription, WebrtcError> {
        let description = self
            .peer_connection
            .local_description()
            .await
            .context("Peer connection has no local description")?;

        let sdp_type = match description.sdp_type {
            RTCSdpType::Offer => SdpType::Offer,
            RTCSdpType::Answer => SdpType::Answer,
            RTCSdpType::Pranswer => SdpType::Pranswer,
            RTCSdpType::Rollback => SdpType::Rollback,
            RTCSdpType::Unspecified => {
                return Err(WebrtcError::InvalidDescription(
                    "local description has no type".to_string(),
                ));
            }
        };

        Ok(SessionDescription {
            sdp_type,
            sdp: description.sdp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediaConfig;
    use pretty_assertions::assert_eq;
    use test_log::test;

    fn local_only() -> IceConfig {
        IceConfig {
            ice_servers: Vec::new(),
        }
    }

    #[test(tokio::test)]
    async fn offer_answer_exchange() {
        let media = MediaSource::acquire(&MediaConfig::default()).unwrap();
        let (caller, _caller_events) = Peer::new(local_only(), &media, None).await.unwrap();
        let (callee, _callee_events) = Peer::new(local_only(), &media, None).await.unwrap();

        let offer = caller.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));

        callee.set_remote_description(offer).await.unwrap();
        let answer = callee.create_answer().await.unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);

        caller.set_remote_description(answer).await.unwrap();

        caller.close().await.unwrap();
        callee.close().await.unwrap();
    }

    #[test(tokio::test)]
    async fn rollback_is_rejected() {
        let media = MediaSource::acquire(&MediaConfig::default()).unwrap();
        let (peer, _events) = Peer::new(local_only(), &media, None).await.unwrap();

        let result = peer
            .set_remote_description(SessionDescription {
                sdp_type: SdpType::Rollback,
                sdp: String::new(),
            })
            .await;
        assert!(matches!(result, Err(WebrtcError::InvalidDescription(_))));
    }

    #[test(tokio::test)]
    async fn answer_without_offer_fails() {
        let media = MediaSource::acquire(&MediaConfig::default()).unwrap();
        let (peer, _events) = Peer::new(local_only(), &media, None).await.unwrap();

        assert!(peer.create_answer().await.is_err());
    }
}
