use crate::transport::mock::MockTransport;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite;
use vidlink_protocol::Envelope;

/// In-memory stand-in for the signaling server.
///
/// Every transport handed out by [`MockRelay::transport`] is registered under its party ID.
/// Envelopes sent through one transport are forwarded to the transport registered for the
/// envelope's recipient. Envelopes addressed to unknown parties are dropped.
pub struct MockRelay {
    parties: Arc<Mutex<HashMap<String, MockTransport>>>,
    tasks: Mutex<JoinSet<()>>,
}

impl Default for MockRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRelay {
    pub fn new() -> Self {
        Self {
            parties: Arc::new(Mutex::new(HashMap::new())),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Returns the transport registered for `party_id`, creating and wiring it up on first use.
    pub fn transport(&self, party_id: &str) -> MockTransport {
        if let Some(transport) = self.parties.lock().get(party_id) {
            return transport.clone();
        }

        let transport = MockTransport::default();
        self.parties
            .lock()
            .insert(party_id.to_string(), transport.clone());

        let outgoing_rx = transport.subscribe_outgoing();
        let parties = self.parties.clone();
        let sender_id = party_id.to_string();
        self.tasks
            .lock()
            .spawn(Self::forward(sender_id, outgoing_rx, parties));

        transport
    }

    async fn forward(
        sender_id: String,
        mut outgoing_rx: broadcast::Receiver<tungstenite::Message>,
        parties: Arc<Mutex<HashMap<String, MockTransport>>>,
    ) {
        loop {
            let msg = match outgoing_rx.recv().await {
                Ok(msg) => msg,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(?sender_id, ?skipped, "Relay lagged behind sender");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let tungstenite::Message::Text(text) = msg else {
                continue;
            };
            let envelope = match Envelope::deserialize(&text) {
                Ok(envelope) => envelope,
                Err(err) => {
                    tracing::warn!(?sender_id, ?err, "Relay dropping malformed envelope");
                    continue;
                }
            };

            let recipient = parties.lock().get(&envelope.to).cloned();
            match recipient {
                Some(recipient) => recipient.deliver(&envelope),
                None => {
                    tracing::debug!(?sender_id, to = ?envelope.to, "Relay dropping envelope for unknown party");
                }
            }
        }
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.tasks.get_mut().abort_all();
    }
}
