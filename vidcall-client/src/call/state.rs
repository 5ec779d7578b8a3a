use std::fmt::{Display, Formatter};

/// Observable lifecycle of the call session.
///
/// `Calling` and `Ringing` are the outgoing side before the answer arrives, `Offered` the
/// incoming side before the user answers. Rejections and failures resolve straight to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallState {
    #[default]
    Idle,
    /// Allocating the peer connection and creating the offer.
    Calling,
    /// Offer sent, waiting for the callee.
    Ringing,
    /// Remote offer received, waiting for the local user.
    Offered,
    /// Creating or applying the answer.
    Negotiating,
    Active,
}

impl CallState {
    pub fn is_idle(self) -> bool {
        self == CallState::Idle
    }

    /// States in which the ringing timeout applies.
    pub(crate) fn is_ringing(self) -> bool {
        matches!(self, CallState::Ringing | CallState::Offered)
    }
}

impl Display for CallState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CallState::Idle => "idle",
            CallState::Calling => "calling",
            CallState::Ringing => "ringing",
            CallState::Offered => "offered",
            CallState::Negotiating => "negotiating",
            CallState::Active => "active",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}
