use crate::media::{RemoteFrame, TrackKind};
use crate::peer::PeerEvent;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::instrument;
use webrtc::peer_connection::RTCPeerConnection;

/// Surfaces remote tracks as [`PeerEvent::Track`] and pipes their payloads to an optional sink.
pub struct Receiver {
    shutdown_tx: watch::Sender<()>,
}

impl Receiver {
    #[instrument(level = "trace", skip_all)]
    pub(crate) fn new(
        peer_connection: &RTCPeerConnection,
        events_tx: broadcast::Sender<PeerEvent>,
        output_tx: Option<mpsc::Sender<RemoteFrame>>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(());

        peer_connection.on_track(Box::new(move |track, _, _| {
            let kind = TrackKind::from_codec_type(track.kind());
            let events_tx = events_tx.clone();
            let output_tx = output_tx.clone();
            let mut shutdown_rx = shutdown_rx.clone();

            Box::pin(async move {
                let Some(kind) = kind else {
                    tracing::warn!(kind = ?track.kind(), "Ignoring remote track of unknown kind");
                    return;
                };

                tracing::debug!(%kind, id = %track.id(), "Remote track arrived");
                if let Err(err) = events_tx.send(PeerEvent::Track(kind)) {
                    tracing::warn!(?err, "Failed to send remote track event");
                }

                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => {
                            tracing::trace!(%kind, "Shutdown signalled, stopping receiver");
                            break;
                        }
                        rtp = track.read_rtp() => {
                            match rtp {
                                Ok((packet, _)) => {
                                    let Some(output_tx) = output_tx.as_ref() else {
                                        continue;
                                    };
                                    let frame = RemoteFrame { kind, payload: packet.payload };
                                    if output_tx.send(frame).await.is_err() {
                                        tracing::warn!(%kind, "Remote frame output closed");
                                        break;
                                    }
                                }
                                Err(err) => {
                                    tracing::debug!(?err, %kind, "Stopped reading remote track");
                                    break;
                                }
                            }
                        }
                    }
                }
            })
        }));

        Self { shutdown_tx }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.shutdown();
    }
}
