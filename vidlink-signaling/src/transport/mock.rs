use crate::error::{SignalingError, SignalingRuntimeError};
use crate::transport::{SignalingReceiver, SignalingSender, SignalingTransport};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use vidlink_protocol::Envelope;

const MOCK_CHANNEL_CAPACITY: usize = 64;

/// In-memory transport. Everything the client sends shows up on `outgoing_tx`, everything pushed
/// to `incoming_tx` is received by the client.
#[derive(Clone)]
pub struct MockTransport {
    pub outgoing_tx: broadcast::Sender<tungstenite::Message>,
    pub incoming_tx: broadcast::Sender<tungstenite::Message>,
    /// Notified once a client connected and subscribed to `incoming_tx`.
    pub ready: Arc<Notify>,
    disconnect_token: CancellationToken,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            outgoing_tx: broadcast::channel(MOCK_CHANNEL_CAPACITY).0,
            incoming_tx: broadcast::channel(MOCK_CHANNEL_CAPACITY).0,
            ready: Arc::new(Notify::new()),
            disconnect_token: CancellationToken::new(),
        }
    }
}

impl MockTransport {
    /// Cancelling the returned token simulates the remote end dropping the connection.
    pub fn disconnect_token(&self) -> CancellationToken {
        self.disconnect_token.clone()
    }

    /// Delivers an envelope to the connected client as if it came from the signaling server.
    pub fn deliver(&self, envelope: &Envelope) {
        let serialized = Envelope::serialize(envelope).expect("Failed to serialize envelope");
        if self
            .incoming_tx
            .send(tungstenite::Message::from(serialized))
            .is_err()
        {
            tracing::warn!(?envelope, "No mock receiver connected, dropping envelope");
        }
    }

    pub fn subscribe_outgoing(&self) -> broadcast::Receiver<tungstenite::Message> {
        self.outgoing_tx.subscribe()
    }
}

#[async_trait]
impl SignalingTransport for MockTransport {
    type Sender = MockSender;
    type Receiver = MockReceiver;

    #[tracing::instrument(level = "debug", skip(self))]
    async fn connect(&self) -> Result<(Self::Sender, Self::Receiver), SignalingError> {
        if self.disconnect_token.is_cancelled() {
            return Err(SignalingError::Other("Mock transport disconnected".to_string()));
        }

        let receiver = MockReceiver {
            incoming_rx: self.incoming_tx.subscribe(),
            disconnect_token: self.disconnect_token.clone(),
        };
        let sender = MockSender {
            outgoing_tx: Some(self.outgoing_tx.clone()),
        };

        self.ready.notify_one();
        Ok((sender, receiver))
    }
}

pub struct MockSender {
    outgoing_tx: Option<broadcast::Sender<tungstenite::Message>>,
}

#[async_trait]
impl SignalingSender for MockSender {
    #[tracing::instrument(level = "trace", skip_all)]
    async fn send(&mut self, msg: tungstenite::Message) -> Result<(), SignalingRuntimeError> {
        match &self.outgoing_tx {
            Some(tx) => {
                // Nobody listening is not an error, the message is simply lost like on a real wire.
                let _ = tx.send(msg);
                Ok(())
            }
            None => Err(SignalingRuntimeError::Disconnected),
        }
    }

    async fn close(&mut self) -> Result<(), SignalingRuntimeError> {
        tracing::debug!("Closing mock sender");
        self.outgoing_tx = None;
        Ok(())
    }
}

pub struct MockReceiver {
    incoming_rx: broadcast::Receiver<tungstenite::Message>,
    disconnect_token: CancellationToken,
}

#[async_trait]
impl SignalingReceiver for MockReceiver {
    #[tracing::instrument(level = "trace", skip_all, err)]
    async fn recv(
        &mut self,
        send_tx: &mpsc::Sender<tungstenite::Message>,
    ) -> Result<Envelope, SignalingRuntimeError> {
        loop {
            let msg = tokio::select! {
                biased;
                _ = self.disconnect_token.cancelled() => {
                    return Err(SignalingRuntimeError::Disconnected);
                }
                msg = self.incoming_rx.recv() => msg,
            };

            match msg {
                Ok(tungstenite::Message::Text(text)) => {
                    return Envelope::deserialize(&text).map_err(|err| {
                        tracing::warn!(?err, "Failed to deserialize envelope");
                        SignalingRuntimeError::SerializationError(err.to_string())
                    });
                }
                Ok(tungstenite::Message::Close(_)) => {
                    return Err(SignalingRuntimeError::Disconnected);
                }
                Ok(tungstenite::Message::Ping(data)) => {
                    if send_tx.send(tungstenite::Message::Pong(data)).await.is_err() {
                        return Err(SignalingRuntimeError::Disconnected);
                    }
                }
                Ok(other) => {
                    tracing::debug!(?other, "Skipping non-text mock frame");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(?skipped, "Mock receiver lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(SignalingRuntimeError::Disconnected);
                }
            }
        }
    }
}
