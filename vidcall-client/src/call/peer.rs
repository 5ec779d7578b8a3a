use crate::call::session::SessionEvent;
use crate::error::CallError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, instrument};
use vidcall_protocol::ws::{IceCandidate, SessionDescription, SignalingMessage};
use vidcall_webrtc::{PeerEvent, TrackKind};

/// Allocates a peer connection with the local tracks attached.
#[async_trait]
pub trait PeerConnector: Send + Sync + 'static {
    type Peer: CallPeer;

    async fn connect(&self) -> Result<(Self::Peer, broadcast::Receiver<PeerEvent>), CallError>;
}

/// The operations the call session performs on a peer connection.
#[async_trait]
pub trait CallPeer: Send + Sync + 'static {
    /// Creates an offer and installs it as local description.
    async fn create_offer(&self) -> Result<SessionDescription, CallError>;
    /// Creates an answer and installs it as local description.
    async fn create_answer(&self) -> Result<SessionDescription, CallError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), CallError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError>;
    async fn close(&self) -> Result<(), CallError>;
}

/// Outgoing half of the signaling channel as seen by the call session.
///
/// Sending must not wait for the relay. Failures are reported, not retried.
pub trait EnvelopeSink: Send + Sync + 'static {
    fn send(&self, msg: SignalingMessage) -> Result<(), CallError>;
}

/// Mute control over the locally captured tracks.
pub trait LocalMedia: Send + Sync + 'static {
    /// Flips the enabled flag of the track of the given kind and returns the new flag.
    fn toggle(&self, kind: TrackKind) -> Result<bool, CallError>;
    fn is_enabled(&self, kind: TrackKind) -> Option<bool>;
}

#[derive(Debug, Clone)]
pub(crate) enum PeerOp {
    CreateOffer,
    ApplyOffer(SessionDescription),
    CreateAnswer,
    ApplyAnswer(SessionDescription),
    AddCandidate(IceCandidate),
}

#[derive(Debug, Clone)]
pub(crate) enum PeerOutcome {
    OfferCreated(SessionDescription),
    OfferApplied,
    AnswerCreated(SessionDescription),
    AnswerApplied,
    Failed(CallError),
}

/// Runs all operations of one call against its peer connection, strictly in submission order.
///
/// Outcomes and peer events are reported back into the session queue tagged with the generation
/// the worker was started for. Dropping the worker cancels it and closes the peer connection.
pub(crate) struct PeerWorker {
    ops_tx: mpsc::UnboundedSender<PeerOp>,
    cancel: CancellationToken,
}

impl PeerWorker {
    pub(crate) fn spawn<C: PeerConnector>(
        connector: Arc<C>,
        generation: u64,
        queue_tx: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tokio::spawn(
            run(connector, generation, ops_rx, queue_tx, cancel.clone())
                .instrument(tracing::Span::current()),
        );

        Self { ops_tx, cancel }
    }

    pub(crate) fn submit(&self, op: PeerOp) {
        if let Err(err) = self.ops_tx.send(op) {
            tracing::warn!(op = ?err.0, "Peer worker is gone, dropping operation");
        }
    }
}

impl Drop for PeerWorker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[instrument(level = "debug", skip(connector, ops_rx, queue_tx, cancel))]
async fn run<C: PeerConnector>(
    connector: Arc<C>,
    generation: u64,
    mut ops_rx: mpsc::UnboundedReceiver<PeerOp>,
    queue_tx: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
) {
    tracing::trace!("Allocating peer connection");
    let connected = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::trace!("Cancelled before the peer connection was allocated");
            return;
        }
        connected = connector.connect() => connected,
    };

    let (peer, mut events_rx) = match connected {
        Ok(connected) => connected,
        Err(err) => {
            tracing::warn!(?err, "Failed to allocate peer connection");
            let _ = queue_tx
                .send(SessionEvent::Completed {
                    generation,
                    outcome: PeerOutcome::Failed(err),
                })
                .await;
            return;
        }
    };

    let mut events_open = true;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            op = ops_rx.recv() => {
                let Some(op) = op else { break; };
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    outcome = execute(&peer, op) => outcome,
                };
                if let Some(outcome) = outcome
                    && queue_tx.send(SessionEvent::Completed { generation, outcome }).await.is_err()
                {
                    break;
                }
            }
            event = events_rx.recv(), if events_open => {
                match event {
                    Ok(event) => {
                        if queue_tx.send(SessionEvent::Peer { generation, event }).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(?skipped, "Peer events lagged");
                    }
                    Err(RecvError::Closed) => {
                        tracing::trace!("Peer events closed");
                        events_open = false;
                    }
                }
            }
        }
    }

    if let Err(err) = peer.close().await {
        tracing::warn!(?err, "Failed to close peer connection");
    }
    tracing::trace!("Peer worker finished");
}

async fn execute<P: CallPeer>(peer: &P, op: PeerOp) -> Option<PeerOutcome> {
    let outcome = match op {
        PeerOp::CreateOffer => peer.create_offer().await.map(PeerOutcome::OfferCreated),
        PeerOp::ApplyOffer(offer) => peer
            .set_remote_description(offer)
            .await
            .map(|_| PeerOutcome::OfferApplied),
        PeerOp::CreateAnswer => peer.create_answer().await.map(PeerOutcome::AnswerCreated),
        PeerOp::ApplyAnswer(answer) => peer
            .set_remote_description(answer)
            .await
            .map(|_| PeerOutcome::AnswerApplied),
        PeerOp::AddCandidate(candidate) => {
            // A single bad candidate does not fail the call.
            if let Err(err) = peer.add_ice_candidate(candidate).await {
                tracing::warn!(?err, "Failed to apply remote ICE candidate");
            }
            return None;
        }
    };

    Some(outcome.unwrap_or_else(PeerOutcome::Failed))
}
