use crate::config::{EARLY_CANDIDATES_LIMIT, EARLY_CANDIDATE_SENDERS_LIMIT};
use std::collections::{HashMap, VecDeque};
use vidcall_protocol::ws::IceCandidate;

/// What to do with a candidate handed to [`CandidateBuffer::push`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Push {
    /// The remote description is set, apply the candidate right away.
    Apply(IceCandidate),
    /// Held until the next [`CandidateBuffer::flush`].
    Buffered,
}

/// Remote ICE candidates that arrived before they could be applied.
///
/// The buffer starts closed. [`CandidateBuffer::flush`] opens it and hands out everything held so
/// far in arrival order, exactly once. After that every push is applied immediately until the
/// buffer is cleared.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: VecDeque<IceCandidate>,
    open: bool,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: IceCandidate) -> Push {
        if self.open {
            Push::Apply(candidate)
        } else {
            self.pending.push_back(candidate);
            Push::Buffered
        }
    }

    /// Opens the buffer and drains the held candidates. Subsequent calls return nothing.
    pub fn flush(&mut self) -> Vec<IceCandidate> {
        self.open = true;
        self.pending.drain(..).collect()
    }

    /// Discards everything without applying it and closes the buffer again.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.open = false;
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Candidates received while idle, held per sender until the offer they belong to arrives.
#[derive(Debug, Default)]
pub(crate) struct EarlyCandidates {
    by_sender: HashMap<String, Vec<IceCandidate>>,
}

impl EarlyCandidates {
    /// Returns `false` if the candidate was dropped because a limit was reached.
    pub(crate) fn stash(&mut self, from: &str, candidate: IceCandidate) -> bool {
        if !self.by_sender.contains_key(from)
            && self.by_sender.len() >= EARLY_CANDIDATE_SENDERS_LIMIT
        {
            return false;
        }

        let pending = self.by_sender.entry(from.to_string()).or_default();
        if pending.len() >= EARLY_CANDIDATES_LIMIT {
            return false;
        }
        pending.push(candidate);
        true
    }

    /// Takes the candidates of one sender and forgets all others.
    ///
    /// With the ICE username fragment of the offer known, candidates tagged with a different
    /// fragment belong to an earlier session and are dropped.
    pub(crate) fn adopt(&mut self, from: &str, ice_ufrag: Option<&str>) -> Vec<IceCandidate> {
        let mut adopted = self.by_sender.remove(from).unwrap_or_default();
        self.by_sender.clear();
        if let Some(ice_ufrag) = ice_ufrag {
            adopted.retain(|candidate| {
                candidate
                    .username_fragment
                    .as_deref()
                    .is_none_or(|fragment| fragment == ice_ufrag)
            });
        }
        adopted
    }

    pub(crate) fn clear(&mut self) {
        self.by_sender.clear();
    }
}

/// The first `a=ice-ufrag` attribute of an SDP blob.
pub(crate) fn ice_ufrag(sdp: &str) -> Option<&str> {
    sdp.lines()
        .find_map(|line| line.trim_end().strip_prefix("a=ice-ufrag:"))
}
