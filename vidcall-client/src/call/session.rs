use crate::call::candidates::{CandidateBuffer, EarlyCandidates, Push, ice_ufrag};
use crate::call::event::CallEvent;
use crate::call::handle::CallHandle;
use crate::call::peer::{EnvelopeSink, LocalMedia, PeerConnector, PeerOp, PeerOutcome, PeerWorker};
use crate::call::state::{CallState, Role};
use crate::config::EVENT_QUEUE_CAPACITY;
use crate::error::{CallError, EndReason};
use crate::presence::PresenceRoster;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use vidcall_protocol::ws::{IceCandidate, RejectReason, SessionDescription, SignalingMessage};
use vidcall_webrtc::{PeerConnectionState, PeerEvent, TrackKind};

pub(crate) type Reply<T = ()> = oneshot::Sender<Result<T, CallError>>;

/// Everything the session reacts to, processed strictly one at a time.
pub(crate) enum SessionEvent {
    Command(Command),
    Signaling(SignalingMessage),
    Peer { generation: u64, event: PeerEvent },
    Completed { generation: u64, outcome: PeerOutcome },
    RingTimeout { generation: u64 },
}

pub(crate) enum Command {
    Call { target: String, reply: Reply },
    Answer { reply: Reply },
    Reject { reply: Reply },
    EndCall { reply: Reply },
    ToggleMute { kind: TrackKind, reply: Reply<bool> },
    Status { reply: Reply<CallStatus> },
}

impl Command {
    fn fail(self, err: CallError) {
        match self {
            Command::Call { reply, .. }
            | Command::Answer { reply }
            | Command::Reject { reply }
            | Command::EndCall { reply } => {
                let _ = reply.send(Err(err));
            }
            Command::ToggleMute { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Command::Status { reply } => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

/// Point-in-time view of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStatus {
    pub state: CallState,
    pub role: Option<Role>,
    pub peer_id: Option<String>,
    pub audio_muted: Option<bool>,
    pub video_muted: Option<bool>,
    pub remote_tracks: Vec<TrackKind>,
    /// Remote candidates held until the remote description is in place.
    pub buffered_candidates: usize,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub identity: String,
    pub ring_timeout: Option<Duration>,
    pub event_channel_size: usize,
}

struct Call {
    role: Role,
    peer_id: String,
    worker: PeerWorker,
    candidates: CandidateBuffer,
    /// Our offer or answer went out, the peer can route candidates and hang-ups to us.
    announced: bool,
    outgoing_candidates: Vec<IceCandidate>,
    remote_tracks: Vec<TrackKind>,
    ring_timer: Option<AbortHandle>,
    pending_reply: Option<Reply>,
}

impl Call {
    fn new(role: Role, peer_id: String, worker: PeerWorker) -> Self {
        Self {
            role,
            peer_id,
            worker,
            candidates: CandidateBuffer::new(),
            announced: false,
            outgoing_candidates: Vec::new(),
            remote_tracks: Vec::new(),
            ring_timer: None,
            pending_reply: None,
        }
    }

    /// Whether hanging up has to be announced to the peer.
    fn peer_knows(&self) -> bool {
        self.role == Role::Callee || self.announced
    }

    fn stop_ring_timer(&mut self) {
        if let Some(timer) = self.ring_timer.take() {
            timer.abort();
        }
    }

    fn resolve(&mut self, result: Result<(), CallError>) {
        if let Some(reply) = self.pending_reply.take() {
            let _ = reply.send(result);
        }
    }
}

/// The call-negotiation state machine.
///
/// A session owns at most one call and its peer connection. Signaling messages, local commands,
/// peer callbacks and timers all arrive on one queue and each is handled to completion before the
/// next one is looked at. Peer connection work runs on a [`PeerWorker`]; its results come back
/// through the same queue and are dropped if the call they belong to was torn down meanwhile.
pub struct CallSession<C: PeerConnector, S: EnvelopeSink, M: LocalMedia> {
    config: SessionConfig,
    connector: Arc<C>,
    sink: S,
    media: M,

    state: CallState,
    call: Option<Call>,
    generation: u64,
    early_candidates: EarlyCandidates,
    /// Peer of the call torn down last. Its candidates are stale until it sends a new offer.
    ended_peer: Option<String>,
    roster: PresenceRoster,

    queue_tx: mpsc::WeakSender<SessionEvent>,
    events_tx: broadcast::Sender<CallEvent>,
    state_tx: watch::Sender<CallState>,
    roster_tx: watch::Sender<PresenceRoster>,
}

impl<C: PeerConnector, S: EnvelopeSink, M: LocalMedia> CallSession<C, S, M> {
    /// Starts the session task and returns the handle used to drive it.
    ///
    /// The task runs until `shutdown_token` is cancelled or every handle is dropped.
    pub fn spawn(
        config: SessionConfig,
        connector: C,
        sink: S,
        media: M,
        shutdown_token: CancellationToken,
        handle: &tokio::runtime::Handle,
    ) -> CallHandle {
        let (queue_tx, queue_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (events_tx, _) = broadcast::channel(config.event_channel_size.max(1));
        let (state_tx, state_rx) = watch::channel(CallState::Idle);
        let (roster_tx, roster_rx) = watch::channel(PresenceRoster::default());

        let span = tracing::info_span!("call_session", identity = %config.identity);
        let session = Self {
            config,
            connector: Arc::new(connector),
            sink,
            media,
            state: CallState::Idle,
            call: None,
            generation: 0,
            early_candidates: EarlyCandidates::default(),
            ended_peer: None,
            roster: PresenceRoster::default(),
            queue_tx: queue_tx.downgrade(),
            events_tx: events_tx.clone(),
            state_tx,
            roster_tx,
        };

        handle.spawn(session.run(queue_rx, shutdown_token).instrument(span));

        CallHandle::new(queue_tx, events_tx, state_rx, roster_rx)
    }

    async fn run(
        mut self,
        mut queue_rx: mpsc::Receiver<SessionEvent>,
        shutdown_token: CancellationToken,
    ) {
        tracing::debug!("Call session started");
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown_token.cancelled() => {
                    tracing::debug!("Shutdown requested");
                    break;
                }
                event = queue_rx.recv() => match event {
                    Some(event) => event,
                    None => {
                        tracing::debug!("All handles dropped");
                        break;
                    }
                },
            };
            self.handle_event(event);
        }

        if let Err(err) = self.hang_up(EndReason::Shutdown) {
            tracing::debug!(?err, "Failed to announce hang-up during shutdown");
        }

        queue_rx.close();
        while let Ok(event) = queue_rx.try_recv() {
            if let SessionEvent::Command(command) = event {
                command.fail(CallError::Shutdown);
            }
        }
        tracing::debug!("Call session finished");
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Command(command) => self.handle_command(command),
            SessionEvent::Signaling(msg) => self.handle_message(msg),
            SessionEvent::Peer { generation, event } => {
                if generation == self.generation {
                    self.handle_peer_event(event);
                } else {
                    tracing::trace!(?generation, ?event, "Discarding stale peer event");
                }
            }
            SessionEvent::Completed {
                generation,
                outcome,
            } => {
                if generation == self.generation {
                    self.handle_outcome(outcome);
                } else {
                    tracing::debug!(?generation, ?outcome, "Discarding stale completion");
                }
            }
            SessionEvent::RingTimeout { generation } => {
                if generation == self.generation && self.state.is_ringing() {
                    tracing::info!(state = %self.state, "Call was not answered in time");
                    if let Err(err) = self.hang_up(EndReason::Timeout) {
                        tracing::warn!(?err, "Failed to announce ringing timeout");
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Call { target, reply } => self.call(target, reply),
            Command::Answer { reply } => self.answer(reply),
            Command::Reject { reply } => {
                let _ = reply.send(self.reject());
            }
            Command::EndCall { reply } => {
                let _ = reply.send(self.hang_up(EndReason::LocalHangup));
            }
            Command::ToggleMute { kind, reply } => {
                let _ = reply.send(self.toggle_mute(kind));
            }
            Command::Status { reply } => {
                let _ = reply.send(Ok(self.status()));
            }
        }
    }

    fn call(&mut self, target: String, reply: Reply) {
        if !self.state.is_idle() {
            tracing::debug!(%target, state = %self.state, "Already in a call");
            let _ = reply.send(Err(CallError::BusyLocally));
            return;
        }
        if self.config.identity.is_empty() {
            let _ = reply.send(Err(CallError::SignalingUnavailable(
                "no local identity".to_string(),
            )));
            return;
        }
        if target == self.config.identity || !self.roster.is_reachable(&target) {
            tracing::debug!(%target, "Target is not reachable");
            let _ = reply.send(Err(CallError::Unreachable(target)));
            return;
        }
        let Some(worker) = self.spawn_worker() else {
            let _ = reply.send(Err(CallError::Shutdown));
            return;
        };

        tracing::info!(peer_id = %target, "Calling");
        self.early_candidates.clear();
        self.ended_peer = None;
        worker.submit(PeerOp::CreateOffer);

        let mut call = Call::new(Role::Caller, target, worker);
        call.pending_reply = Some(reply);
        self.call = Some(call);
        self.set_state(CallState::Calling);
    }

    fn answer(&mut self, reply: Reply) {
        let state = self.state;
        let Some(call) = self.call.as_mut().filter(|_| state == CallState::Offered) else {
            let _ = reply.send(Err(CallError::InvalidState(state.to_string())));
            return;
        };

        tracing::info!(peer_id = %call.peer_id, "Answering call");
        call.stop_ring_timer();
        call.pending_reply = Some(reply);
        call.worker.submit(PeerOp::CreateAnswer);
        self.set_state(CallState::Negotiating);
    }

    fn reject(&mut self) -> Result<(), CallError> {
        let Some(call) = self.call.as_ref().filter(|_| self.state == CallState::Offered) else {
            return Err(CallError::InvalidState(self.state.to_string()));
        };

        tracing::info!(peer_id = %call.peer_id, "Rejecting call");
        let result = self.send_envelope(SignalingMessage::Reject {
            to: call.peer_id.clone(),
            from: self.config.identity.clone(),
            reason: RejectReason::Declined,
        });
        self.teardown(EndReason::LocalHangup);
        result
    }

    /// Ends the current call, telling the peer if it knows about it. A no-op while idle.
    fn hang_up(&mut self, reason: EndReason) -> Result<(), CallError> {
        let Some(call) = self.call.as_ref() else {
            tracing::trace!("No call to hang up");
            return Ok(());
        };

        let result = if call.peer_knows() {
            self.send_envelope(SignalingMessage::End {
                to: call.peer_id.clone(),
                from: self.config.identity.clone(),
            })
        } else {
            Ok(())
        };
        self.teardown(reason);
        result
    }

    fn toggle_mute(&mut self, kind: TrackKind) -> Result<bool, CallError> {
        let muted = !self.media.toggle(kind)?;
        tracing::debug!(%kind, ?muted, "Toggled mute");
        self.emit(CallEvent::MuteChanged { kind, muted });
        Ok(muted)
    }

    fn status(&self) -> CallStatus {
        CallStatus {
            state: self.state,
            role: self.call.as_ref().map(|call| call.role),
            peer_id: self.call.as_ref().map(|call| call.peer_id.clone()),
            audio_muted: self.media.is_enabled(TrackKind::Audio).map(|enabled| !enabled),
            video_muted: self.media.is_enabled(TrackKind::Video).map(|enabled| !enabled),
            remote_tracks: self
                .call
                .as_ref()
                .map(|call| call.remote_tracks.clone())
                .unwrap_or_default(),
            buffered_candidates: self
                .call
                .as_ref()
                .map(|call| call.candidates.len())
                .unwrap_or_default(),
        }
    }

    fn handle_message(&mut self, msg: SignalingMessage) {
        if let Some(to) = msg.to()
            && to != self.config.identity
        {
            tracing::debug!(kind = msg.kind(), %to, "Ignoring message addressed to someone else");
            return;
        }

        match msg {
            SignalingMessage::UserList { ids } => {
                self.roster.replace(ids, &self.config.identity);
                tracing::debug!(reachable = self.roster.len(), "Updated presence roster");
                self.roster_tx.send_replace(self.roster.clone());
            }
            SignalingMessage::Offer { offer, from, .. } => self.on_offer(from, offer),
            SignalingMessage::Answer { answer, from, .. } => self.on_answer(&from, answer),
            SignalingMessage::IceCandidate {
                candidate, from, ..
            } => self.on_remote_candidate(&from, candidate),
            SignalingMessage::IncomingCall { from, .. } => self.on_incoming_call(from),
            SignalingMessage::Reject { from, reason, .. } => self.on_reject(&from, reason),
            SignalingMessage::End { from, .. } => self.on_end(&from),
            SignalingMessage::JoinRoom { id } => {
                tracing::debug!(%id, "Ignoring unexpected join-room");
            }
        }
    }

    fn on_offer(&mut self, from: String, offer: SessionDescription) {
        if let Some(call) = &self.call {
            if call.peer_id == from && call.role == Role::Callee {
                tracing::debug!(peer_id = %from, "Ignoring duplicate offer");
            } else {
                tracing::info!(peer_id = %from, busy_with = %call.peer_id, "Rejecting offer while busy");
                self.reject_busy(from);
            }
            return;
        }

        let Some(worker) = self.spawn_worker() else {
            return;
        };

        tracing::info!(peer_id = %from, "Incoming call");
        self.ended_peer = None;
        let early = self.early_candidates.adopt(&from, ice_ufrag(&offer.sdp));
        worker.submit(PeerOp::ApplyOffer(offer));

        let mut call = Call::new(Role::Callee, from.clone(), worker);
        for candidate in early {
            call.candidates.push(candidate);
        }
        self.call = Some(call);

        self.set_state(CallState::Offered);
        self.emit(CallEvent::IncomingCall { peer_id: from });
        self.start_ring_timer();
    }

    fn on_answer(&mut self, from: &str, answer: SessionDescription) {
        let state = self.state;
        let Some(call) = self.call.as_mut().filter(|call| call.peer_id == from) else {
            tracing::debug!(peer_id = %from, "Ignoring answer from unrelated peer");
            return;
        };
        if call.role != Role::Caller || state != CallState::Ringing {
            tracing::debug!(peer_id = %from, %state, "Ignoring unexpected answer");
            return;
        }

        tracing::debug!(peer_id = %from, "Call answered");
        call.stop_ring_timer();
        call.worker.submit(PeerOp::ApplyAnswer(answer));
        self.set_state(CallState::Negotiating);
    }

    fn on_remote_candidate(&mut self, from: &str, candidate: IceCandidate) {
        match self.call.as_mut() {
            Some(call) if call.peer_id == from => match call.candidates.push(candidate) {
                Push::Apply(candidate) => call.worker.submit(PeerOp::AddCandidate(candidate)),
                Push::Buffered => {
                    tracing::trace!(pending = call.candidates.len(), "Buffered remote candidate");
                }
            },
            Some(_) => {
                tracing::debug!(peer_id = %from, "Ignoring candidate from unrelated peer");
            }
            None if self.ended_peer.as_deref() == Some(from) => {
                tracing::debug!(peer_id = %from, "Dropping late candidate of ended call");
            }
            None => {
                if !self.early_candidates.stash(from, candidate) {
                    tracing::debug!(peer_id = %from, "Dropping early candidate");
                }
            }
        }
    }

    fn on_incoming_call(&mut self, from: String) {
        match &self.call {
            Some(call) if call.peer_id == from => {
                tracing::trace!(peer_id = %from, "Ignoring repeated call announcement");
            }
            Some(_) => self.reject_busy(from),
            None => self.emit(CallEvent::CallAnnounced { peer_id: from }),
        }
    }

    fn on_reject(&mut self, from: &str, reason: RejectReason) {
        match &self.call {
            Some(call) if call.peer_id == from && call.role == Role::Caller => {}
            _ => {
                tracing::debug!(peer_id = %from, "Ignoring reject for unrelated call");
                return;
            }
        }

        tracing::info!(peer_id = %from, ?reason, "Call rejected");
        self.teardown(match reason {
            RejectReason::Busy => EndReason::Busy,
            RejectReason::Declined => EndReason::Declined,
        });
    }

    fn on_end(&mut self, from: &str) {
        if self.call.as_ref().is_some_and(|call| call.peer_id == from) {
            tracing::info!(peer_id = %from, "Remote hung up");
            self.teardown(EndReason::RemoteHangup);
        } else {
            tracing::debug!(peer_id = %from, "Ignoring end for unrelated call");
        }
    }

    fn handle_outcome(&mut self, outcome: PeerOutcome) {
        let state = self.state;
        let identity = self.config.identity.clone();
        let Some(call) = self.call.as_mut() else {
            return;
        };

        match outcome {
            PeerOutcome::OfferCreated(offer) => {
                if state != CallState::Calling {
                    tracing::debug!(%state, "Ignoring offer created outside of calling");
                    return;
                }
                let msg = SignalingMessage::Offer {
                    offer,
                    to: call.peer_id.clone(),
                    from: identity,
                };
                if let Err(err) = self.send_envelope(msg) {
                    self.fail(err);
                    return;
                }
                self.announce();
                if let Some(call) = self.call.as_mut() {
                    call.resolve(Ok(()));
                }
                self.set_state(CallState::Ringing);
                self.start_ring_timer();
            }
            PeerOutcome::OfferApplied => {
                tracing::trace!(peer_id = %call.peer_id, "Remote offer applied");
            }
            PeerOutcome::AnswerCreated(answer) => {
                if state != CallState::Negotiating || call.role != Role::Callee {
                    tracing::debug!(%state, "Ignoring answer created outside of negotiation");
                    return;
                }
                let msg = SignalingMessage::Answer {
                    answer,
                    to: call.peer_id.clone(),
                    from: identity,
                };
                if let Err(err) = self.send_envelope(msg) {
                    self.fail(err);
                    return;
                }
                self.announce();
                self.flush_candidates();
                if let Some(call) = self.call.as_mut() {
                    call.resolve(Ok(()));
                }
                self.set_state(CallState::Active);
            }
            PeerOutcome::AnswerApplied => {
                if state != CallState::Negotiating || call.role != Role::Caller {
                    tracing::debug!(%state, "Ignoring answer applied outside of negotiation");
                    return;
                }
                self.flush_candidates();
                self.set_state(CallState::Active);
            }
            PeerOutcome::Failed(err) => self.fail(err),
        }
    }

    fn handle_peer_event(&mut self, event: PeerEvent) {
        let state = self.state;
        let Some(call) = self.call.as_mut() else {
            return;
        };

        match event {
            PeerEvent::IceCandidate(candidate) => {
                if !call.announced {
                    call.outgoing_candidates.push(candidate);
                    return;
                }
                let msg = SignalingMessage::IceCandidate {
                    candidate,
                    to: call.peer_id.clone(),
                    from: self.config.identity.clone(),
                };
                if let Err(err) = self.send_envelope(msg) {
                    tracing::warn!(?err, "Failed to send local ICE candidate");
                }
            }
            PeerEvent::ConnectionState(connection_state) => match connection_state {
                PeerConnectionState::Connected => {
                    tracing::info!(peer_id = %call.peer_id, "Media connected");
                }
                PeerConnectionState::Disconnected | PeerConnectionState::Failed
                    if state == CallState::Active =>
                {
                    tracing::info!(peer_id = %call.peer_id, ?connection_state, "Lost connection to peer");
                    self.teardown(EndReason::PeerDisconnected);
                }
                PeerConnectionState::Failed => {
                    self.fail(CallError::NegotiationFailed(
                        "peer connection failed".to_string(),
                    ));
                }
                connection_state => {
                    tracing::trace!(?connection_state, "Peer connection state changed");
                }
            },
            PeerEvent::Track(kind) => {
                if !call.remote_tracks.contains(&kind) {
                    call.remote_tracks.push(kind);
                }
                let peer_id = call.peer_id.clone();
                self.emit(CallEvent::RemoteTrack { peer_id, kind });
            }
            PeerEvent::Error(err) => {
                tracing::warn!(%err, "Peer connection reported an error");
            }
        }
    }

    /// Marks our description as sent and trickles candidates gathered before that.
    fn announce(&mut self) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        call.announced = true;

        let peer_id = call.peer_id.clone();
        for candidate in std::mem::take(&mut call.outgoing_candidates) {
            let msg = SignalingMessage::IceCandidate {
                candidate,
                to: peer_id.clone(),
                from: self.config.identity.clone(),
            };
            if let Err(err) = self.send_envelope(msg) {
                tracing::warn!(?err, "Failed to send local ICE candidate");
                break;
            }
        }
    }

    fn flush_candidates(&mut self) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        let flushed = call.candidates.flush();
        tracing::debug!(count = flushed.len(), "Applying buffered remote candidates");
        for candidate in flushed {
            call.worker.submit(PeerOp::AddCandidate(candidate));
        }
    }

    fn fail(&mut self, err: CallError) {
        tracing::warn!(?err, "Call failed");
        if let Some(call) = &self.call
            && call.peer_knows()
        {
            let msg = SignalingMessage::End {
                to: call.peer_id.clone(),
                from: self.config.identity.clone(),
            };
            if let Err(err) = self.send_envelope(msg) {
                tracing::debug!(?err, "Failed to tell peer about the failure");
            }
        }
        self.emit(CallEvent::Error(err.clone()));
        self.teardown(EndReason::from(err));
    }

    fn reject_busy(&self, peer_id: String) {
        let msg = SignalingMessage::Reject {
            to: peer_id,
            from: self.config.identity.clone(),
            reason: RejectReason::Busy,
        };
        if let Err(err) = self.send_envelope(msg) {
            tracing::warn!(?err, "Failed to reject call while busy");
        }
    }

    /// Releases everything belonging to the current call and returns to idle.
    ///
    /// Safe to call any number of times; only the first call after a call was set up does
    /// anything. Work still in flight for the old call is invalidated by bumping the generation.
    fn teardown(&mut self, reason: EndReason) {
        let Some(mut call) = self.call.take() else {
            tracing::trace!("Nothing to tear down");
            return;
        };

        tracing::info!(peer_id = %call.peer_id, %reason, "Call ended");
        self.generation = self.generation.wrapping_add(1);

        call.stop_ring_timer();
        call.candidates.clear();
        call.outgoing_candidates.clear();
        call.remote_tracks.clear();
        call.resolve(Err(pending_error(&reason)));
        let peer_id = std::mem::take(&mut call.peer_id);
        self.ended_peer = Some(peer_id.clone());
        // Dropping the worker cancels it and closes the peer connection.
        drop(call);

        self.set_state(CallState::Idle);
        self.emit(CallEvent::Ended { peer_id, reason });
    }

    fn spawn_worker(&self) -> Option<PeerWorker> {
        let queue_tx = self.queue_tx.upgrade()?;
        Some(PeerWorker::spawn(
            self.connector.clone(),
            self.generation,
            queue_tx,
        ))
    }

    fn start_ring_timer(&mut self) {
        let Some(timeout) = self.config.ring_timeout else {
            return;
        };
        let Some(queue_tx) = self.queue_tx.upgrade() else {
            return;
        };
        let Some(call) = self.call.as_mut() else {
            return;
        };

        let generation = self.generation;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = queue_tx.send(SessionEvent::RingTimeout { generation }).await;
        });
        if let Some(previous) = call.ring_timer.replace(timer.abort_handle()) {
            previous.abort();
        }
    }

    fn send_envelope(&self, msg: SignalingMessage) -> Result<(), CallError> {
        if self.config.identity.is_empty() {
            return Err(CallError::SignalingUnavailable(
                "no local identity".to_string(),
            ));
        }
        tracing::trace!(kind = msg.kind(), to = ?msg.to(), "Sending envelope");
        self.sink.send(msg)
    }

    fn set_state(&mut self, state: CallState) {
        if self.state == state {
            return;
        }
        tracing::debug!(from = %self.state, to = %state, "Call state changed");
        self.state = state;
        self.state_tx.send_replace(state);
        self.emit(CallEvent::StateChanged {
            state,
            role: self.call.as_ref().map(|call| call.role),
            peer_id: self.call.as_ref().map(|call| call.peer_id.clone()),
        });
    }

    fn emit(&self, event: CallEvent) {
        // Nobody listening is fine.
        let _ = self.events_tx.send(event);
    }
}

/// The error handed to a command still waiting when its call ends.
fn pending_error(reason: &EndReason) -> CallError {
    match reason {
        EndReason::Failed(err) => err.clone(),
        EndReason::Busy => CallError::BusyRemotely,
        EndReason::PeerDisconnected => CallError::PeerDisconnected,
        EndReason::Shutdown => CallError::Shutdown,
        _ => CallError::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        FAKE_ANSWER_SDP, FAKE_OFFER_SDP, FakeConnector, PeerCall, RecordingSink, eventually,
    };
    use pretty_assertions::assert_eq;
    use test_log::test;
    use vidcall_protocol::ws::SdpType;
    use vidcall_webrtc::MediaSource;
    use vidcall_webrtc::config::MediaConfig;

    struct Harness {
        handle: CallHandle,
        connector: FakeConnector,
        sink: RecordingSink,
        events: broadcast::Receiver<CallEvent>,
        shutdown_token: CancellationToken,
    }

    impl Harness {
        fn drain_events(&mut self) -> Vec<CallEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }

        fn ended(&mut self) -> Vec<EndReason> {
            self.drain_events()
                .into_iter()
                .filter_map(|event| match event {
                    CallEvent::Ended { reason, .. } => Some(reason),
                    _ => None,
                })
                .collect()
        }

        async fn deliver(&self, msg: SignalingMessage) {
            self.handle.deliver(msg).await.unwrap();
        }

        /// Waits until everything queued so far has been handled.
        async fn settle(&self) -> CallStatus {
            self.handle.status().await.unwrap()
        }

        /// Alice as callee of `peer`, answered and active.
        async fn active_with(&self, peer: &str) {
            self.deliver(offer_from(peer)).await;
            self.handle.answer().await.unwrap();
            assert_eq!(self.settle().await.state, CallState::Active);
        }
    }

    fn setup(ring_timeout: Option<Duration>) -> Harness {
        let connector = FakeConnector::default();
        let sink = RecordingSink::default();
        let shutdown_token = CancellationToken::new();
        let media = Some(MediaSource::acquire(&MediaConfig::default()).unwrap());

        let handle = CallSession::spawn(
            SessionConfig {
                identity: "alice".to_string(),
                ring_timeout,
                event_channel_size: 64,
            },
            connector.clone(),
            sink.clone(),
            media,
            shutdown_token.clone(),
            &tokio::runtime::Handle::current(),
        );
        let events = handle.subscribe();

        Harness {
            handle,
            connector,
            sink,
            events,
            shutdown_token,
        }
    }

    async fn setup_with_roster() -> Harness {
        let harness = setup(None);
        harness
            .deliver(SignalingMessage::UserList {
                ids: vec!["alice".to_string(), "bob".to_string(), "carol".to_string()],
            })
            .await;
        harness
    }

    fn candidate(n: u16) -> IceCandidate {
        let mut candidate = IceCandidate::new(format!(
            "candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000 typ host"
        ));
        candidate.sdp_mid = Some("0".to_string());
        candidate
    }

    fn offer_from(from: &str) -> SignalingMessage {
        SignalingMessage::Offer {
            offer: SessionDescription::offer("v=0 remote-offer"),
            to: "alice".to_string(),
            from: from.to_string(),
        }
    }

    fn answer_from(from: &str) -> SignalingMessage {
        SignalingMessage::Answer {
            answer: SessionDescription::answer("v=0 remote-answer"),
            to: "alice".to_string(),
            from: from.to_string(),
        }
    }

    fn candidate_from(from: &str, n: u16) -> SignalingMessage {
        SignalingMessage::IceCandidate {
            candidate: candidate(n),
            to: "alice".to_string(),
            from: from.to_string(),
        }
    }

    fn end_from(from: &str) -> SignalingMessage {
        SignalingMessage::End {
            to: "alice".to_string(),
            from: from.to_string(),
        }
    }

    fn end_to(to: &str) -> SignalingMessage {
        SignalingMessage::End {
            to: to.to_string(),
            from: "alice".to_string(),
        }
    }

    #[test(tokio::test)]
    async fn caller_sends_offer_and_rings() {
        let mut harness = setup_with_roster().await;

        harness.handle.call("bob").await.unwrap();

        assert_eq!(
            harness.sink.sent(),
            vec![SignalingMessage::Offer {
                offer: SessionDescription::offer(FAKE_OFFER_SDP),
                to: "bob".to_string(),
                from: "alice".to_string(),
            }]
        );
        let status = harness.settle().await;
        assert_eq!(status.state, CallState::Ringing);
        assert_eq!(status.role, Some(Role::Caller));
        assert_eq!(status.peer_id.as_deref(), Some("bob"));

        let states: Vec<CallState> = harness
            .drain_events()
            .into_iter()
            .filter_map(|event| match event {
                CallEvent::StateChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![CallState::Calling, CallState::Ringing]);
    }

    #[test(tokio::test)]
    async fn caller_applies_candidates_after_answer() {
        let harness = setup_with_roster().await;
        harness.handle.call("bob").await.unwrap();

        harness.deliver(answer_from("bob")).await;
        harness.deliver(candidate_from("bob", 1)).await;
        harness.deliver(candidate_from("bob", 2)).await;

        assert!(eventually(|| harness.connector.candidates().len() == 2).await);
        assert_eq!(harness.connector.candidates(), vec![candidate(1), candidate(2)]);
        assert_eq!(
            &harness.connector.calls()[..2],
            &[
                PeerCall::CreateOffer,
                PeerCall::SetRemoteDescription(SdpType::Answer)
            ]
        );

        let status = harness.settle().await;
        assert_eq!(status.state, CallState::Active);
        assert_eq!(status.buffered_candidates, 0);
    }

    #[test(tokio::test)]
    async fn callee_buffers_candidates_until_answered() {
        let harness = setup_with_roster().await;

        harness.deliver(offer_from("bob")).await;
        harness.deliver(candidate_from("bob", 1)).await;
        harness.deliver(candidate_from("bob", 2)).await;

        let status = harness.settle().await;
        assert_eq!(status.state, CallState::Offered);
        assert_eq!(status.role, Some(Role::Callee));
        assert_eq!(status.buffered_candidates, 2);
        assert!(
            eventually(|| harness.connector.calls()
                == vec![PeerCall::SetRemoteDescription(SdpType::Offer)])
            .await
        );

        harness.handle.answer().await.unwrap();
        assert_eq!(
            harness.sink.sent(),
            vec![SignalingMessage::Answer {
                answer: SessionDescription::answer(FAKE_ANSWER_SDP),
                to: "bob".to_string(),
                from: "alice".to_string(),
            }]
        );

        assert!(eventually(|| harness.connector.candidates().len() == 2).await);
        assert_eq!(harness.connector.candidates(), vec![candidate(1), candidate(2)]);

        let status = harness.settle().await;
        assert_eq!(status.state, CallState::Active);
        assert_eq!(status.buffered_candidates, 0);

        harness.deliver(candidate_from("bob", 3)).await;
        assert!(eventually(|| harness.connector.candidates().len() == 3).await);
        assert_eq!(
            harness.connector.candidates(),
            vec![candidate(1), candidate(2), candidate(3)]
        );
    }

    #[test(tokio::test)]
    async fn call_while_busy_leaves_call_untouched() {
        let harness = setup_with_roster().await;
        harness.handle.call("bob").await.unwrap();
        let before = harness.settle().await;

        let result = harness.handle.call("carol").await;

        assert_eq!(result, Err(CallError::BusyLocally));
        assert_eq!(harness.settle().await, before);
        assert_eq!(harness.sink.kinds(), vec!["offer"]);
        assert_eq!(harness.connector.connects(), 1);
    }

    #[test(tokio::test)]
    async fn call_unreachable_target() {
        let harness = setup_with_roster().await;

        assert_eq!(
            harness.handle.call("zoe").await,
            Err(CallError::Unreachable("zoe".to_string()))
        );
        assert_eq!(
            harness.handle.call("alice").await,
            Err(CallError::Unreachable("alice".to_string()))
        );
        assert_eq!(harness.handle.state(), CallState::Idle);
        assert!(harness.sink.sent().is_empty());
        assert_eq!(harness.connector.connects(), 0);
    }

    #[test(tokio::test)]
    async fn end_call_twice_sends_one_end() {
        let mut harness = setup_with_roster().await;
        harness.active_with("bob").await;
        harness.drain_events();

        assert_eq!(harness.handle.end_call().await, Ok(()));
        assert_eq!(harness.handle.end_call().await, Ok(()));

        assert_eq!(harness.sink.kinds(), vec!["answer", "end"]);
        assert_eq!(harness.sink.sent().last(), Some(&end_to("bob")));
        assert_eq!(harness.handle.state(), CallState::Idle);
        assert_eq!(harness.ended(), vec![EndReason::LocalHangup]);
        assert!(eventually(|| harness.connector.calls().contains(&PeerCall::Close)).await);
    }

    #[test(tokio::test)]
    async fn competing_teardowns_close_peer_once() {
        let mut harness = setup_with_roster().await;
        harness.active_with("bob").await;
        harness.drain_events();

        harness
            .connector
            .emit(PeerEvent::ConnectionState(PeerConnectionState::Failed));
        let ((), hung_up) = tokio::join!(harness.deliver(end_from("bob")), harness.handle.end_call());
        assert_eq!(hung_up, Ok(()));

        assert!(eventually(|| harness.connector.calls().contains(&PeerCall::Close)).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        harness.settle().await;

        let closes = harness
            .connector
            .calls()
            .iter()
            .filter(|call| **call == PeerCall::Close)
            .count();
        assert_eq!(closes, 1);
        assert_eq!(harness.ended().len(), 1);
        assert_eq!(harness.handle.state(), CallState::Idle);
    }

    #[test(tokio::test)]
    async fn end_call_while_idle_is_noop() {
        let mut harness = setup_with_roster().await;

        assert_eq!(harness.handle.end_call().await, Ok(()));

        assert!(harness.sink.sent().is_empty());
        assert!(harness.ended().is_empty());
    }

    #[test(tokio::test)]
    async fn remote_end_while_active() {
        let mut harness = setup_with_roster().await;
        harness.active_with("carol").await;
        harness.drain_events();

        harness.deliver(end_from("carol")).await;

        let status = harness.settle().await;
        assert_eq!(status.state, CallState::Idle);
        assert_eq!(status.peer_id, None);
        assert_eq!(harness.sink.kinds(), vec!["answer"]);
        assert_eq!(harness.ended(), vec![EndReason::RemoteHangup]);
    }

    #[test(tokio::test)]
    async fn end_from_unrelated_peer_is_ignored() {
        let harness = setup_with_roster().await;
        harness.active_with("bob").await;

        harness.deliver(end_from("carol")).await;

        assert_eq!(harness.settle().await.state, CallState::Active);
    }

    #[test(tokio::test)]
    async fn offer_while_busy_is_rejected() {
        let harness = setup_with_roster().await;
        harness.handle.call("bob").await.unwrap();

        harness.deliver(offer_from("carol")).await;

        let status = harness.settle().await;
        assert_eq!(status.peer_id.as_deref(), Some("bob"));
        assert_eq!(status.state, CallState::Ringing);
        assert_eq!(
            harness.sink.sent().last(),
            Some(&SignalingMessage::Reject {
                to: "carol".to_string(),
                from: "alice".to_string(),
                reason: RejectReason::Busy,
            })
        );
    }

    #[test(tokio::test)]
    async fn simultaneous_calls_reject_each_other() {
        let harness = setup_with_roster().await;
        harness.handle.call("bob").await.unwrap();

        harness.deliver(offer_from("bob")).await;

        assert_eq!(harness.settle().await.role, Some(Role::Caller));
        assert_eq!(harness.sink.kinds(), vec!["offer", "reject"]);
    }

    #[test(tokio::test)]
    async fn duplicate_offer_is_ignored() {
        let harness = setup_with_roster().await;
        harness.deliver(offer_from("bob")).await;

        harness.deliver(offer_from("bob")).await;

        assert_eq!(harness.settle().await.state, CallState::Offered);
        assert!(harness.sink.sent().is_empty());
        assert_eq!(harness.connector.connects(), 1);
    }

    #[test(tokio::test)]
    async fn remote_busy_ends_call() {
        let mut harness = setup_with_roster().await;
        harness.handle.call("bob").await.unwrap();
        harness.drain_events();

        harness
            .deliver(SignalingMessage::Reject {
                to: "alice".to_string(),
                from: "bob".to_string(),
                reason: RejectReason::Busy,
            })
            .await;

        assert_eq!(harness.settle().await.state, CallState::Idle);
        assert_eq!(harness.ended(), vec![EndReason::Busy]);
        assert_eq!(harness.sink.kinds(), vec!["offer"]);
    }

    #[test(tokio::test)]
    async fn reject_incoming_call() {
        let mut harness = setup_with_roster().await;
        harness.deliver(offer_from("bob")).await;

        harness.handle.reject().await.unwrap();

        assert_eq!(
            harness.sink.sent(),
            vec![SignalingMessage::Reject {
                to: "bob".to_string(),
                from: "alice".to_string(),
                reason: RejectReason::Declined,
            }]
        );
        assert_eq!(harness.handle.state(), CallState::Idle);
        assert!(harness.ended().contains(&EndReason::LocalHangup));
    }

    #[test(tokio::test)]
    async fn answer_without_offer() {
        let harness = setup_with_roster().await;

        assert_eq!(
            harness.handle.answer().await,
            Err(CallError::InvalidState("idle".to_string()))
        );
        assert_eq!(
            harness.handle.reject().await,
            Err(CallError::InvalidState("idle".to_string()))
        );
    }

    #[test(tokio::test)]
    async fn early_candidates_are_adopted_by_offer() {
        let harness = setup_with_roster().await;

        harness.deliver(candidate_from("bob", 1)).await;
        harness.deliver(candidate_from("carol", 2)).await;
        harness.deliver(offer_from("bob")).await;

        assert_eq!(harness.settle().await.buffered_candidates, 1);

        harness.handle.answer().await.unwrap();
        assert!(eventually(|| harness.connector.candidates() == vec![candidate(1)]).await);
    }

    #[test(tokio::test)]
    async fn late_candidate_of_ended_call_is_not_adopted() {
        let harness = setup_with_roster().await;
        harness.active_with("bob").await;
        harness.deliver(end_from("bob")).await;

        harness.deliver(candidate_from("bob", 9)).await;
        harness.deliver(offer_from("bob")).await;
        assert_eq!(harness.settle().await.buffered_candidates, 0);

        harness.deliver(candidate_from("bob", 2)).await;
        harness.handle.answer().await.unwrap();

        assert!(eventually(|| harness.connector.candidates() == vec![candidate(2)]).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(harness.connector.candidates(), vec![candidate(2)]);
    }

    #[test(tokio::test)]
    async fn toggle_audio_twice_restores_state() {
        let mut harness = setup_with_roster().await;

        assert_eq!(harness.handle.toggle_audio().await, Ok(true));
        assert_eq!(harness.settle().await.audio_muted, Some(true));
        assert_eq!(harness.handle.toggle_audio().await, Ok(false));

        let status = harness.settle().await;
        assert_eq!(status.audio_muted, Some(false));
        assert_eq!(status.video_muted, Some(false));
        assert_eq!(
            harness.drain_events(),
            vec![
                CallEvent::MuteChanged {
                    kind: TrackKind::Audio,
                    muted: true
                },
                CallEvent::MuteChanged {
                    kind: TrackKind::Audio,
                    muted: false
                },
            ]
        );
    }

    #[test(tokio::test)]
    async fn stale_work_after_remote_end_is_discarded() {
        let harness = setup_with_roster().await;
        harness.connector.hold();
        harness.deliver(offer_from("bob")).await;

        let handle = harness.handle.clone();
        let answering = tokio::spawn(async move { handle.answer().await });
        assert!(
            eventually(|| harness.handle.state() == CallState::Negotiating).await,
            "answer was not accepted"
        );

        harness.deliver(end_from("bob")).await;
        assert_eq!(answering.await.unwrap(), Err(CallError::Cancelled));

        harness.connector.release();
        harness.deliver(offer_from("carol")).await;

        let status = harness.settle().await;
        assert_eq!(status.state, CallState::Offered);
        assert_eq!(status.peer_id.as_deref(), Some("carol"));
        assert!(harness.sink.sent().is_empty());
    }

    #[test(tokio::test)]
    async fn missing_media_fails_call() {
        let mut harness = setup_with_roster().await;
        harness
            .connector
            .fail_connect_with(CallError::MediaUnavailable("no camera".to_string()));

        let result = harness.handle.call("bob").await;

        assert_eq!(result, Err(CallError::MediaUnavailable("no camera".to_string())));
        assert_eq!(harness.settle().await.state, CallState::Idle);
        assert!(harness.sink.sent().is_empty());
        assert!(
            harness
                .drain_events()
                .contains(&CallEvent::Error(CallError::MediaUnavailable(
                    "no camera".to_string()
                )))
        );
    }

    #[test(tokio::test)]
    async fn failed_description_ends_announced_call() {
        let harness = setup_with_roster().await;
        harness.handle.call("bob").await.unwrap();
        harness
            .connector
            .fail_descriptions_with(CallError::NegotiationFailed("bad sdp".to_string()));

        harness.deliver(answer_from("bob")).await;

        assert!(eventually(|| harness.handle.state() == CallState::Idle).await);
        assert_eq!(harness.sink.kinds(), vec!["offer", "end"]);
    }

    #[test(tokio::test)]
    async fn unavailable_signaling_fails_call() {
        let harness = setup_with_roster().await;
        harness.sink.set_failing(true);

        let result = harness.handle.call("bob").await;

        assert!(matches!(result, Err(CallError::SignalingUnavailable(_))));
        assert_eq!(harness.settle().await.state, CallState::Idle);
    }

    #[test(tokio::test(start_paused = true))]
    async fn unanswered_call_times_out() {
        let mut harness = setup(Some(Duration::from_secs(10)));
        harness
            .deliver(SignalingMessage::UserList {
                ids: vec!["bob".to_string()],
            })
            .await;
        harness.handle.call("bob").await.unwrap();
        harness.drain_events();

        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(harness.settle().await.state, CallState::Idle);
        assert_eq!(harness.sink.kinds(), vec!["offer", "end"]);
        assert_eq!(harness.ended(), vec![EndReason::Timeout]);
    }

    #[test(tokio::test(start_paused = true))]
    async fn answered_call_does_not_time_out() {
        let harness = setup(Some(Duration::from_secs(10)));
        harness.active_with("bob").await;

        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(harness.settle().await.state, CallState::Active);
    }

    #[test(tokio::test)]
    async fn lost_connection_ends_active_call() {
        let mut harness = setup_with_roster().await;
        harness.active_with("bob").await;
        harness.drain_events();

        assert!(
            harness
                .connector
                .emit(PeerEvent::ConnectionState(PeerConnectionState::Disconnected))
        );

        assert!(eventually(|| harness.handle.state() == CallState::Idle).await);
        assert_eq!(harness.sink.kinds(), vec!["answer"]);
        assert_eq!(harness.ended(), vec![EndReason::PeerDisconnected]);
    }

    #[test(tokio::test)]
    async fn local_candidates_wait_for_answer() {
        let harness = setup_with_roster().await;
        harness.deliver(offer_from("bob")).await;
        assert!(eventually(|| harness.connector.connects() == 1).await);

        assert!(
            harness
                .connector
                .emit(PeerEvent::IceCandidate(candidate(7)))
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(harness.sink.sent().is_empty());

        harness.handle.answer().await.unwrap();

        assert!(eventually(|| harness.sink.kinds() == vec!["answer", "ice-candidate"]).await);
        assert_eq!(
            harness.sink.sent()[1],
            SignalingMessage::IceCandidate {
                candidate: candidate(7),
                to: "bob".to_string(),
                from: "alice".to_string(),
            }
        );
    }

    #[test(tokio::test)]
    async fn remote_track_is_reported() {
        let mut harness = setup_with_roster().await;
        harness.active_with("bob").await;
        harness.drain_events();

        assert!(harness.connector.emit(PeerEvent::Track(TrackKind::Video)));

        assert!(
            eventually(|| harness.events.try_recv()
                == Ok(CallEvent::RemoteTrack {
                    peer_id: "bob".to_string(),
                    kind: TrackKind::Video,
                }))
            .await
        );
        assert_eq!(harness.settle().await.remote_tracks, vec![TrackKind::Video]);
    }

    #[test(tokio::test)]
    async fn messages_for_other_endpoints_are_ignored() {
        let harness = setup_with_roster().await;

        harness
            .deliver(SignalingMessage::Offer {
                offer: SessionDescription::offer("v=0"),
                to: "carol".to_string(),
                from: "bob".to_string(),
            })
            .await;

        assert_eq!(harness.settle().await.state, CallState::Idle);
    }

    #[test(tokio::test)]
    async fn roster_excludes_local_identity() {
        let harness = setup_with_roster().await;
        harness.settle().await;

        let roster = harness.handle.roster();
        assert_eq!(roster.ids().collect::<Vec<_>>(), vec!["bob", "carol"]);
    }

    #[test(tokio::test)]
    async fn shutdown_hangs_up() {
        let harness = setup_with_roster().await;
        harness.active_with("bob").await;

        harness.shutdown_token.cancel();

        assert!(eventually(|| harness.sink.kinds() == vec!["answer", "end"]).await);
        assert_eq!(harness.handle.status().await, Err(CallError::Shutdown));
    }
}
