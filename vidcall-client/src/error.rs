use std::fmt::{Display, Formatter};
use thiserror::Error;
use vidcall_signaling::error::{SignalingError, SignalingRuntimeError};
use vidcall_webrtc::error::WebrtcError;

/// Everything that can go wrong while setting up, running or ending a call.
///
/// Errors are cloneable so they can be broadcast on the call event stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("local media unavailable: {0}")]
    MediaUnavailable(String),
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),
    #[error("signaling unavailable: {0}")]
    SignalingUnavailable(String),
    #[error("already in a call")]
    BusyLocally,
    #[error("remote peer is busy")]
    BusyRemotely,
    #[error("connection to peer lost")]
    PeerDisconnected,
    #[error("peer {0} is not reachable")]
    Unreachable(String),
    #[error("not possible while {0}")]
    InvalidState(String),
    #[error("call ended before the action completed")]
    Cancelled,
    #[error("call session shut down")]
    Shutdown,
}

impl CallError {
    /// Whether the session can be used for another call after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, CallError::Shutdown)
    }
}

impl From<WebrtcError> for CallError {
    fn from(err: WebrtcError) -> Self {
        match err {
            WebrtcError::MediaUnavailable(reason) => CallError::MediaUnavailable(reason),
            err => CallError::NegotiationFailed(format!("{err:#}")),
        }
    }
}

impl From<SignalingError> for CallError {
    fn from(err: SignalingError) -> Self {
        CallError::SignalingUnavailable(err.to_string())
    }
}

impl From<SignalingRuntimeError> for CallError {
    fn from(err: SignalingRuntimeError) -> Self {
        CallError::SignalingUnavailable(err.to_string())
    }
}

/// Why a call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// Hung up or rejected locally.
    LocalHangup,
    /// The remote peer sent `end`.
    RemoteHangup,
    /// The remote peer declined the call.
    Declined,
    /// The remote peer was already in another call.
    Busy,
    /// Nobody answered before the ringing timeout.
    Timeout,
    PeerDisconnected,
    Shutdown,
    Failed(CallError),
}

impl From<CallError> for EndReason {
    fn from(err: CallError) -> Self {
        match err {
            CallError::BusyRemotely => EndReason::Busy,
            CallError::PeerDisconnected => EndReason::PeerDisconnected,
            CallError::Shutdown => EndReason::Shutdown,
            err => EndReason::Failed(err),
        }
    }
}

impl Display for EndReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EndReason::LocalHangup => f.write_str("hung up"),
            EndReason::RemoteHangup => f.write_str("remote hung up"),
            EndReason::Declined => f.write_str("declined"),
            EndReason::Busy => f.write_str("busy"),
            EndReason::Timeout => f.write_str("not answered"),
            EndReason::PeerDisconnected => f.write_str("connection lost"),
            EndReason::Shutdown => f.write_str("shut down"),
            EndReason::Failed(err) => write!(f, "failed: {err}"),
        }
    }
}
