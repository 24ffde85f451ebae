use crate::link::PeerLink;
use crate::observer::CallSnapshot;
use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use vidlink_signaling::gateway::SessionListener;
use vidlink_webrtc::{LocalMedia, MediaPreview, RemoteTrackInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallPhase {
    /// No session exists.
    Idle,
    /// Local party rang the remote party and waits for an answer.
    Outgoing,
    /// Remote party accepted the outgoing call, media and offer are being prepared.
    OutgoingAccepted,
    /// Remote party rings the local party.
    Incoming,
    /// Local party accepted the incoming call and waits for the offer.
    IncomingAccepted,
    /// Peer link is connected.
    Active,
}

impl CallPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallPhase::Idle => "idle",
            CallPhase::Outgoing => "outgoing",
            CallPhase::OutgoingAccepted => "outgoing-accepted",
            CallPhase::Incoming => "incoming",
            CallPhase::IncomingAccepted => "incoming-accepted",
            CallPhase::Active => "active",
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, CallPhase::OutgoingAccepted | CallPhase::IncomingAccepted)
    }

    /// Phases in which a peer link may exist.
    pub fn is_linked(&self) -> bool {
        self.is_accepted() || *self == CallPhase::Active
    }
}

impl Display for CallPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote ICE candidates received before the remote description was applied.
#[derive(Debug)]
pub(crate) struct CandidateBuffer {
    limit: usize,
    candidates: VecDeque<String>,
}

impl CandidateBuffer {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            candidates: VecDeque::new(),
        }
    }

    pub(crate) fn push(&mut self, candidate: String) {
        if self.candidates.len() >= self.limit {
            tracing::warn!(limit = self.limit, "Candidate buffer full, dropping oldest candidate");
            self.candidates.pop_front();
        }
        self.candidates.push_back(candidate);
    }

    pub(crate) fn drain(&mut self) -> Vec<String> {
        self.candidates.drain(..).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.candidates.len()
    }
}

/// The one and only call session, owned by the controller. `Idle` is the absence of a session.
pub(crate) struct CallSession {
    pub(crate) epoch: u64,
    pub(crate) remote_party_id: String,
    pub(crate) phase: CallPhase,
    pub(crate) local_media: Option<LocalMedia>,
    pub(crate) preview: Option<MediaPreview>,
    pub(crate) peer_link: Option<Arc<dyn PeerLink>>,
    /// Offer received while the peer link was still being prepared.
    pub(crate) pending_offer: Option<String>,
    pub(crate) offer_handled: bool,
    pub(crate) answer_handled: bool,
    pub(crate) remote_description_applied: bool,
    pub(crate) candidates: CandidateBuffer,
    pub(crate) listener: SessionListener,
    pub(crate) remote_tracks: Vec<RemoteTrackInfo>,
}

impl CallSession {
    pub(crate) fn new(
        epoch: u64,
        remote_party_id: String,
        phase: CallPhase,
        listener: SessionListener,
        candidate_buffer_limit: usize,
    ) -> Self {
        Self {
            epoch,
            remote_party_id,
            phase,
            local_media: None,
            preview: None,
            peer_link: None,
            pending_offer: None,
            offer_handled: false,
            answer_handled: false,
            remote_description_applied: false,
            candidates: CandidateBuffer::new(candidate_buffer_limit),
            listener,
            remote_tracks: Vec::new(),
        }
    }

    /// Moves to `phase`. The peer link may only exist in linked phases.
    pub(crate) fn transition(&mut self, phase: CallPhase) {
        tracing::debug!(epoch = self.epoch, remote_party_id = ?self.remote_party_id, from = %self.phase, to = %phase, "Call phase transition");
        self.phase = phase;
        self.check_invariants();
    }

    pub(crate) fn check_invariants(&self) {
        debug_assert!(
            self.phase != CallPhase::Idle,
            "idle is represented by the absence of a session"
        );
        debug_assert!(
            self.peer_link.is_none() || self.phase.is_linked(),
            "peer link present in phase {}",
            self.phase
        );
    }

    pub(crate) fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            phase: self.phase,
            remote_party_id: Some(self.remote_party_id.clone()),
            local_media: self.preview.clone(),
            remote_tracks: self.remote_tracks.clone(),
            has_peer_link: self.peer_link.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn linked_phases() {
        assert!(!CallPhase::Idle.is_linked());
        assert!(!CallPhase::Outgoing.is_linked());
        assert!(!CallPhase::Incoming.is_linked());
        assert!(CallPhase::OutgoingAccepted.is_linked());
        assert!(CallPhase::IncomingAccepted.is_linked());
        assert!(CallPhase::Active.is_linked());
        assert!(!CallPhase::Active.is_accepted());
    }

    #[test]
    fn candidate_buffer_keeps_order() {
        let mut buffer = CandidateBuffer::new(8);
        buffer.push("a".to_string());
        buffer.push("b".to_string());
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.drain(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn candidate_buffer_drops_oldest() {
        let mut buffer = CandidateBuffer::new(2);
        buffer.push("a".to_string());
        buffer.push("b".to_string());
        buffer.push("c".to_string());
        assert_eq!(buffer.drain(), vec!["b".to_string(), "c".to_string()]);
    }
}
