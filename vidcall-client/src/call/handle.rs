use crate::call::event::CallEvent;
use crate::call::session::{CallStatus, Command, Reply, SessionEvent};
use crate::call::state::CallState;
use crate::error::CallError;
use crate::presence::PresenceRoster;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::instrument;
use vidcall_protocol::ws::SignalingMessage;
use vidcall_webrtc::TrackKind;

/// Local command surface of a running [`crate::call::CallSession`].
///
/// Cheap to clone. Commands are queued behind everything the session already received and
/// resolve once the session handled them.
#[derive(Clone)]
pub struct CallHandle {
    queue_tx: mpsc::Sender<SessionEvent>,
    events_tx: broadcast::Sender<CallEvent>,
    state_rx: watch::Receiver<CallState>,
    roster_rx: watch::Receiver<PresenceRoster>,
}

impl CallHandle {
    pub(crate) fn new(
        queue_tx: mpsc::Sender<SessionEvent>,
        events_tx: broadcast::Sender<CallEvent>,
        state_rx: watch::Receiver<CallState>,
        roster_rx: watch::Receiver<PresenceRoster>,
    ) -> Self {
        Self {
            queue_tx,
            events_tx,
            state_rx,
            roster_rx,
        }
    }

    /// Calls `target`. Resolves once the offer has been sent.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn call(&self, target: &str) -> Result<(), CallError> {
        let target = target.to_string();
        self.request(|reply| Command::Call { target, reply }).await
    }

    /// Answers the offered call. Resolves once the answer has been sent.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn answer(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Answer { reply }).await
    }

    #[instrument(level = "debug", skip(self), err)]
    pub async fn reject(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Reject { reply }).await
    }

    /// Hangs up. Does nothing if there is no call.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::EndCall { reply }).await
    }

    /// Mutes or unmutes the local audio track, returning whether it is muted now.
    pub async fn toggle_audio(&self) -> Result<bool, CallError> {
        self.toggle(TrackKind::Audio).await
    }

    /// Mutes or unmutes the local video track, returning whether it is muted now.
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        self.toggle(TrackKind::Video).await
    }

    pub async fn toggle(&self, kind: TrackKind) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleMute { kind, reply }).await
    }

    pub async fn status(&self) -> Result<CallStatus, CallError> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Hands a message received from the relay to the session.
    pub async fn deliver(&self, msg: SignalingMessage) -> Result<(), CallError> {
        self.queue_tx
            .send(SessionEvent::Signaling(msg))
            .await
            .map_err(|_| CallError::Shutdown)
    }

    pub fn state(&self) -> CallState {
        *self.state_rx.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events_tx.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CallState> {
        self.state_rx.clone()
    }

    pub fn roster(&self) -> PresenceRoster {
        self.roster_rx.borrow().clone()
    }

    pub fn subscribe_roster(&self) -> watch::Receiver<PresenceRoster> {
        self.roster_rx.clone()
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, CallError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.queue_tx
            .send(SessionEvent::Command(command(reply_tx)))
            .await
            .map_err(|_| CallError::Shutdown)?;
        reply_rx.await.map_err(|_| CallError::Shutdown)?
    }
}
