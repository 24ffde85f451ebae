use crate::client::SignalingEvent;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite;
use vidlink_protocol::Envelope;

#[async_trait]
pub trait AwaitSignalingEventExt {
    async fn recv_with_timeout<F>(
        &mut self,
        timeout: Duration,
        predicate: F,
    ) -> anyhow::Result<SignalingEvent>
    where
        F: Fn(&SignalingEvent) -> bool + Send;
}

#[async_trait]
impl AwaitSignalingEventExt for broadcast::Receiver<SignalingEvent> {
    async fn recv_with_timeout<F>(
        &mut self,
        timeout: Duration,
        predicate: F,
    ) -> anyhow::Result<SignalingEvent>
    where
        F: Fn(&SignalingEvent) -> bool + Send,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.recv()).await {
                Ok(Ok(event)) if predicate(&event) => return Ok(event),
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => return Err(anyhow::anyhow!("Timeout")),
                _ => continue,
            }
        }
    }
}

#[async_trait]
pub trait AwaitTungsteniteMessageExt {
    async fn recv_with_timeout<F>(
        &mut self,
        timeout: Duration,
        predicate: F,
    ) -> anyhow::Result<tungstenite::Message>
    where
        F: Fn(&tungstenite::Message) -> bool + Send;

    /// Waits for the next text frame that parses as an [`Envelope`] matching `predicate`. `timeout`
    /// bounds the whole wait, not each frame.
    async fn recv_envelope_with_timeout<F>(
        &mut self,
        timeout: Duration,
        predicate: F,
    ) -> anyhow::Result<Envelope>
    where
        F: Fn(&Envelope) -> bool + Send;
}

#[async_trait]
impl AwaitTungsteniteMessageExt for broadcast::Receiver<tungstenite::Message> {
    async fn recv_with_timeout<F>(
        &mut self,
        timeout: Duration,
        predicate: F,
    ) -> anyhow::Result<tungstenite::Message>
    where
        F: Fn(&tungstenite::Message) -> bool + Send,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.recv()).await {
                Ok(Ok(event)) if predicate(&event) => return Ok(event),
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => return Err(anyhow::anyhow!("Timeout")),
                _ => continue,
            }
        }
    }

    async fn recv_envelope_with_timeout<F>(
        &mut self,
        timeout: Duration,
        predicate: F,
    ) -> anyhow::Result<Envelope>
    where
        F: Fn(&Envelope) -> bool + Send,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.recv()).await {
                Ok(Ok(tungstenite::Message::Text(text))) => {
                    if let Ok(envelope) = Envelope::deserialize(&text)
                        && predicate(&envelope)
                    {
                        return Ok(envelope);
                    }
                }
                Ok(Ok(_)) => continue,
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => return Err(anyhow::anyhow!("Timeout")),
            }
        }
    }
}
