use crate::call::{CallPeer, EnvelopeSink, PeerConnector};
use crate::error::CallError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use vidcall_protocol::ws::{IceCandidate, SdpType, SessionDescription, SignalingMessage};
use vidcall_webrtc::PeerEvent;
use vidcall_webrtc::config::PEER_EVENTS_CAPACITY;

pub const FAKE_OFFER_SDP: &str = "v=0 fake-offer";
pub const FAKE_ANSWER_SDP: &str = "v=0 fake-answer";

/// An operation a [`FakePeer`] was asked to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCall {
    CreateOffer,
    CreateAnswer,
    SetRemoteDescription(SdpType),
    AddIceCandidate(IceCandidate),
    Close,
}

struct FakeState {
    calls: Mutex<Vec<PeerCall>>,
    events_tx: Mutex<Option<broadcast::Sender<PeerEvent>>>,
    connect_error: Mutex<Option<CallError>>,
    description_error: Mutex<Option<CallError>>,
    /// `false` holds every peer operation until released.
    gate: watch::Sender<bool>,
    connects: AtomicUsize,
}

/// In-memory [`PeerConnector`] recording everything done to the peers it hands out.
///
/// Clones share their state, so a test keeps one clone and gives the other to the session.
#[derive(Clone)]
pub struct FakeConnector {
    state: Arc<FakeState>,
}

impl Default for FakeConnector {
    fn default() -> Self {
        Self {
            state: Arc::new(FakeState {
                calls: Mutex::new(Vec::new()),
                events_tx: Mutex::new(None),
                connect_error: Mutex::new(None),
                description_error: Mutex::new(None),
                gate: watch::channel(true).0,
                connects: AtomicUsize::new(0),
            }),
        }
    }
}

impl FakeConnector {
    pub fn calls(&self) -> Vec<PeerCall> {
        self.state.calls.lock().clone()
    }

    /// Remote candidates applied so far, in application order.
    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.state
            .calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                PeerCall::AddIceCandidate(candidate) => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Emits a peer event on the most recently allocated peer. Returns `false` if nobody listens.
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.state
            .events_tx
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    pub fn fail_connect_with(&self, err: CallError) {
        *self.state.connect_error.lock() = Some(err);
    }

    /// Makes creating and applying descriptions fail.
    pub fn fail_descriptions_with(&self, err: CallError) {
        *self.state.description_error.lock() = Some(err);
    }

    /// Holds all peer operations until [`FakeConnector::release`].
    pub fn hold(&self) {
        self.state.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.state.gate.send_replace(true);
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    type Peer = FakePeer;

    async fn connect(&self) -> Result<(FakePeer, broadcast::Receiver<PeerEvent>), CallError> {
        if let Some(err) = self.state.connect_error.lock().clone() {
            return Err(err);
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        let (events_tx, events_rx) = broadcast::channel(PEER_EVENTS_CAPACITY);
        *self.state.events_tx.lock() = Some(events_tx);
        Ok((
            FakePeer {
                state: self.state.clone(),
            },
            events_rx,
        ))
    }
}

pub struct FakePeer {
    state: Arc<FakeState>,
}

impl FakePeer {
    async fn record(&self, call: PeerCall) {
        let mut gate = self.state.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        self.state.calls.lock().push(call);
    }

    fn description_error(&self) -> Result<(), CallError> {
        match self.state.description_error.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CallPeer for FakePeer {
    async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        self.record(PeerCall::CreateOffer).await;
        self.description_error()?;
        Ok(SessionDescription::offer(FAKE_OFFER_SDP))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        self.record(PeerCall::CreateAnswer).await;
        self.description_error()?;
        Ok(SessionDescription::answer(FAKE_ANSWER_SDP))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), CallError> {
        self.record(PeerCall::SetRemoteDescription(description.sdp_type))
            .await;
        self.description_error()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        self.record(PeerCall::AddIceCandidate(candidate)).await;
        Ok(())
    }

    async fn close(&self) -> Result<(), CallError> {
        self.state.calls.lock().push(PeerCall::Close);
        Ok(())
    }
}

/// [`EnvelopeSink`] keeping every sent message.
#[derive(Clone, Default)]
pub struct RecordingSink {
    sent: Arc<Mutex<Vec<SignalingMessage>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingSink {
    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.sent.lock().clone()
    }

    /// Returns and forgets everything sent so far.
    pub fn take(&self) -> Vec<SignalingMessage> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(SignalingMessage::kind).collect()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl EnvelopeSink for RecordingSink {
    fn send(&self, msg: SignalingMessage) -> Result<(), CallError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CallError::SignalingUnavailable(
                "relay connection closed".to_string(),
            ));
        }
        self.sent.lock().push(msg);
        Ok(())
    }
}

/// Polls `check` until it holds or a second has passed.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
