use serde::{Deserialize, Serialize};

/// Kind of a session description, mirroring the values used by WebRTC implementations.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// A session description exchanged during offer/answer negotiation.
///
/// The relay never inspects it, the SDP is only interpreted by the peer connections on both ends.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    /// Whether this description is an offer or an answer.
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// Raw SDP.
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled ICE candidate, serialized the same way browsers serialize `RTCIceCandidateInit`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate attribute line.
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Possible reasons for rejecting a call.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RejectReason {
    /// The callee actively declined the call.
    #[default]
    Declined,
    /// The callee is already in another call or has a call pending.
    Busy,
}

/// Represents a message exchanged between the relay and clients.
///
/// Except for [`SignalingMessage::JoinRoom`] and [`SignalingMessage::UserList`], all messages are envelopes
/// addressed to a single endpoint. The relay forwards them to `to` without interpreting their payload.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// Sent by a client after connecting to announce its endpoint identity.
    ///
    /// The relay answers by broadcasting a fresh [`SignalingMessage::UserList`] to every client.
    JoinRoom {
        /// Identity of the joining endpoint.
        id: String,
    },
    /// Broadcast by the relay whenever the set of connected endpoints changes.
    ///
    /// The list contains every connected endpoint, including the receiving client itself.
    UserList {
        /// Identities of all connected endpoints.
        ids: Vec<String>,
    },
    /// A call offer sent by the caller, containing the caller's local session description.
    ///
    /// The callee will prompt its user and reply with either [`SignalingMessage::Answer`]
    /// or [`SignalingMessage::Reject`].
    Offer {
        /// Session description created by the caller.
        offer: SessionDescription,
        /// Identity of the callee.
        to: String,
        /// Identity of the caller.
        from: String,
    },
    /// A call answer sent by the callee after accepting an offer.
    ///
    /// After the answer has been applied, both clients exchange [`SignalingMessage::IceCandidate`]s
    /// until a transport path has been established.
    Answer {
        /// Session description created by the callee.
        answer: SessionDescription,
        /// Identity of the caller.
        to: String,
        /// Identity of the callee.
        from: String,
    },
    /// An ICE candidate trickled to the other peer of a call.
    IceCandidate {
        candidate: IceCandidate,
        to: String,
        from: String,
    },
    /// Call-control signal announcing an incoming call before its offer.
    IncomingCall { to: String, from: String },
    /// Sent by the callee to decline an incoming call, or automatically when it is busy.
    Reject {
        to: String,
        from: String,
        /// Reason for the rejection, defaults to [`RejectReason::Declined`] if omitted.
        #[serde(default)]
        reason: RejectReason,
    },
    /// Sent by either peer to indicate the graceful end of a call, or to cancel an unanswered one.
    End { to: String, from: String },
}

impl SignalingMessage {
    /// Serializes a [`SignalingMessage`] into a JSON string.
    pub fn serialize(message: &Self) -> serde_json::error::Result<String> {
        serde_json::to_string(message)
    }

    /// Deserializes a JSON string into a [`SignalingMessage`].
    pub fn deserialize(message: &str) -> serde_json::error::Result<Self> {
        serde_json::from_str(message)
    }

    /// Sender of an addressed envelope. `None` for relay-level messages.
    pub fn from(&self) -> Option<&str> {
        match self {
            SignalingMessage::Offer { from, .. }
            | SignalingMessage::Answer { from, .. }
            | SignalingMessage::IceCandidate { from, .. }
            | SignalingMessage::IncomingCall { from, .. }
            | SignalingMessage::Reject { from, .. }
            | SignalingMessage::End { from, .. } => Some(from),
            SignalingMessage::JoinRoom { .. } | SignalingMessage::UserList { .. } => None,
        }
    }

    /// Recipient of an addressed envelope. `None` for relay-level messages.
    pub fn to(&self) -> Option<&str> {
        match self {
            SignalingMessage::Offer { to, .. }
            | SignalingMessage::Answer { to, .. }
            | SignalingMessage::IceCandidate { to, .. }
            | SignalingMessage::IncomingCall { to, .. }
            | SignalingMessage::Reject { to, .. }
            | SignalingMessage::End { to, .. } => Some(to),
            SignalingMessage::JoinRoom { .. } | SignalingMessage::UserList { .. } => None,
        }
    }

    /// Wire name of the message type, used for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::JoinRoom { .. } => "join-room",
            SignalingMessage::UserList { .. } => "user-list",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice-candidate",
            SignalingMessage::IncomingCall { .. } => "incoming-call",
            SignalingMessage::Reject { .. } => "reject",
            SignalingMessage::End { .. } => "end",
        }
    }
}
