use crate::error::CallError;
use crate::session::CallPhase;
use std::fmt::{Display, Formatter};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::instrument;
use vidlink_webrtc::{MediaPreview, RemoteTrackInfo};

/// Read-only view of the current call, published after every processed event.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    pub phase: CallPhase,
    pub remote_party_id: Option<String>,
    /// Local preview, bound as soon as media was acquired.
    pub local_media: Option<MediaPreview>,
    pub remote_tracks: Vec<RemoteTrackInfo>,
    pub has_peer_link: bool,
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self {
            phase: CallPhase::Idle,
            remote_party_id: None,
            local_media: None,
            remote_tracks: Vec::new(),
            has_peer_link: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Local user hung up.
    HungUp,
    /// Local user rejected the incoming call.
    Rejected,
    /// Remote party rejected the outgoing call.
    RemoteRejected,
    /// Remote party ended the call.
    RemoteEnded,
    /// Peer link disconnected, failed or closed.
    ConnectionLost,
    /// Local camera or microphone could not be acquired.
    MediaUnavailable,
    /// Session descriptions could not be created or applied.
    NegotiationFailed,
    /// Call controller shut down.
    Shutdown,
}

impl EndReason {
    /// Failures the user should be notified about, as opposed to ordinary call endings.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            EndReason::MediaUnavailable | EndReason::NegotiationFailed
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    IncomingCall {
        from: String,
    },
    Established {
        remote_party_id: String,
    },
    RemoteTrack {
        remote_party_id: String,
        track: RemoteTrackInfo,
    },
    CallEnded {
        remote_party_id: String,
        reason: EndReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallIntent {
    PlaceCall,
    AcceptIncoming,
    RejectIncoming,
    HangUp,
}

impl Display for CallIntent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CallIntent::PlaceCall => "place call",
            CallIntent::AcceptIncoming => "accept incoming call",
            CallIntent::RejectIncoming => "reject incoming call",
            CallIntent::HangUp => "hang up",
        })
    }
}

pub(crate) type Reply = oneshot::Sender<Result<(), CallError>>;

#[derive(Debug)]
pub(crate) enum Command {
    PlaceCall { target: String, reply: Reply },
    AcceptIncoming { reply: Reply },
    RejectIncoming { reply: Reply },
    HangUp { reply: Reply },
}

/// Handle used by the UI to observe the call and issue user intents.
#[derive(Clone)]
pub struct CallHandle {
    commands_tx: mpsc::Sender<Command>,
    snapshot_rx: watch::Receiver<CallSnapshot>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl CallHandle {
    pub(crate) fn new(
        commands_tx: mpsc::Sender<Command>,
        snapshot_rx: watch::Receiver<CallSnapshot>,
        events_tx: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            commands_tx,
            snapshot_rx,
            events_tx,
        }
    }

    /// Rings `target`. Only valid while idle.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn place_call(&self, target: &str) -> Result<(), CallError> {
        let target = target.to_string();
        self.request(|reply| Command::PlaceCall { target, reply })
            .await
    }

    /// Accepts the ringing incoming call.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn accept_incoming(&self) -> Result<(), CallError> {
        self.request(|reply| Command::AcceptIncoming { reply }).await
    }

    /// Rejects the ringing incoming call.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn reject_incoming(&self) -> Result<(), CallError> {
        self.request(|reply| Command::RejectIncoming { reply }).await
    }

    /// Ends the current call. Hanging up while idle is a no-op.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn hang_up(&self) -> Result<(), CallError> {
        self.request(|reply| Command::HangUp { reply }).await
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn subscribe_snapshot(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    async fn request<F>(&self, command: F) -> Result<(), CallError>
    where
        F: FnOnce(Reply) -> Command,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands_tx
            .send(command(reply_tx))
            .await
            .map_err(|_| CallError::ControllerClosed)?;
        reply_rx.await.map_err(|_| CallError::ControllerClosed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_log::test;

    #[test]
    fn default_snapshot_is_idle() {
        let snapshot = CallSnapshot::default();
        assert_eq!(snapshot.phase, CallPhase::Idle);
        assert_eq!(snapshot.remote_party_id, None);
        assert!(!snapshot.has_peer_link);
    }

    #[test]
    fn failure_reasons() {
        assert!(EndReason::MediaUnavailable.is_failure());
        assert!(EndReason::NegotiationFailed.is_failure());
        assert!(!EndReason::ConnectionLost.is_failure());
        assert!(!EndReason::HungUp.is_failure());
    }

    #[test(tokio::test)]
    async fn closed_controller() {
        let (commands_tx, commands_rx) = mpsc::channel(1);
        let (_snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::default());
        let (events_tx, _) = broadcast::channel(1);
        let handle = CallHandle::new(commands_tx, snapshot_rx, events_tx);
        drop(commands_rx);

        assert!(matches!(
            handle.hang_up().await,
            Err(CallError::ControllerClosed)
        ));
    }
}
