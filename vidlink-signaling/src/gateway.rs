use crate::client::{SignalingClient, SignalingEvent, State};
use crate::error::SignalingError;
use crate::transport::SignalingTransport;
use tokio::sync::{broadcast, watch};
use tracing::instrument;
use vidlink_protocol::{Envelope, MessageKind, SignalingMessage};

/// Call-oriented view of a [`SignalingClient`].
///
/// Outbound messages are addressed to a single recipient, inbound envelopes are split into the
/// always-on invitation stream and per-session streams bound to one remote party.
pub struct SignalingGateway<ST: SignalingTransport> {
    client: SignalingClient<ST>,
}

impl<ST: SignalingTransport> SignalingGateway<ST> {
    pub fn new(client: SignalingClient<ST>) -> Self {
        Self { client }
    }

    pub fn local_id(&self) -> &str {
        self.client.local_id()
    }

    pub fn state(&self) -> State {
        self.client.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<State> {
        self.client.subscribe_state()
    }

    pub async fn connect(&self) -> Result<(), SignalingError> {
        self.client.connect().await
    }

    /// Emits `message` to `recipient`. Delivery is not acknowledged, errors only cover the local
    /// side (not connected, serialization).
    #[instrument(level = "debug", skip(self, message), fields(kind = %message.kind()), err)]
    pub async fn send(
        &self,
        recipient: &str,
        message: SignalingMessage,
    ) -> Result<(), SignalingError> {
        self.client.send(recipient, message).await
    }

    /// Listens for `call-initiated` envelopes from any other party, for as long as the listener
    /// lives.
    pub fn listen_invitations(&self) -> InvitationListener {
        InvitationListener {
            local_id: self.local_id().to_string(),
            events: self.client.subscribe(),
        }
    }

    /// Binds a listener to the session with `remote_party_id`. Only session-scoped kinds sent by
    /// that party are delivered, everything else is discarded.
    #[instrument(level = "debug", skip(self))]
    pub fn attach(&self, remote_party_id: &str) -> SessionListener {
        SessionListener {
            local_id: self.local_id().to_string(),
            remote_party_id: remote_party_id.to_string(),
            events: self.client.subscribe(),
        }
    }
}

/// Receives incoming call invitations addressed to the local party.
pub struct InvitationListener {
    local_id: String,
    events: broadcast::Receiver<SignalingEvent>,
}

impl InvitationListener {
    /// Waits for the next invitation. Returns `None` once the signaling client is gone.
    pub async fn recv(&mut self) -> Option<Invitation> {
        let local_id = self.local_id.clone();
        let envelope = next_envelope(&mut self.events, |envelope| {
            envelope.to == local_id
                && envelope.kind() == MessageKind::CallInitiated
                && !envelope.from.is_empty()
                && envelope.from != local_id
        })
        .await?;

        // The receiver is positioned right behind the invitation, the session continues from it.
        let fresh = self.events.resubscribe();
        let events = std::mem::replace(&mut self.events, fresh);
        Some(Invitation {
            session: SessionListener {
                local_id: self.local_id.clone(),
                remote_party_id: envelope.from.clone(),
                events,
            },
            envelope,
        })
    }
}

/// A `call-initiated` envelope together with the session stream of its sender.
pub struct Invitation {
    pub envelope: Envelope,
    session: SessionListener,
}

impl Invitation {
    pub fn sender(&self) -> &str {
        &self.envelope.from
    }

    /// Binds the invitation's session. Every envelope the inviting party sent after the invitation
    /// is delivered, even if it arrived before this call.
    pub fn into_session(self) -> SessionListener {
        self.session
    }
}

/// Receives the envelopes belonging to one call session.
pub struct SessionListener {
    local_id: String,
    remote_party_id: String,
    events: broadcast::Receiver<SignalingEvent>,
}

impl SessionListener {
    pub fn remote_party_id(&self) -> &str {
        &self.remote_party_id
    }

    /// Waits for the next envelope of this session. Returns `None` once the signaling client is
    /// gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        let local_id = self.local_id.clone();
        let remote_party_id = self.remote_party_id.clone();
        next_envelope(&mut self.events, |envelope| {
            if envelope.to != local_id || !envelope.kind().is_session_scoped() {
                return false;
            }
            if envelope.from != remote_party_id {
                tracing::debug!(from = ?envelope.from, remote_party_id = ?remote_party_id, kind = %envelope.kind(), "Ignoring envelope from stale sender");
                return false;
            }
            true
        })
        .await
    }
}

async fn next_envelope<F>(
    events: &mut broadcast::Receiver<SignalingEvent>,
    accept: F,
) -> Option<Envelope>
where
    F: Fn(&Envelope) -> bool,
{
    loop {
        match events.recv().await {
            Ok(SignalingEvent::Message(envelope)) => {
                if accept(&envelope) {
                    return Some(envelope);
                }
            }
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(?skipped, "Signaling listener lagged behind, envelopes were lost");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
