use crate::call::state::{CallState, Role};
use crate::error::{CallError, EndReason};
use vidcall_webrtc::TrackKind;

/// Notifications emitted by the call session for the rendering layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    StateChanged {
        state: CallState,
        role: Option<Role>,
        peer_id: Option<String>,
    },
    /// A remote offer arrived and is waiting for [`crate::call::CallHandle::answer`].
    IncomingCall { peer_id: String },
    /// The relay announced an incoming call before its offer.
    CallAnnounced { peer_id: String },
    RemoteTrack { peer_id: String, kind: TrackKind },
    MuteChanged { kind: TrackKind, muted: bool },
    Ended { peer_id: String, reason: EndReason },
    Error(CallError),
}
