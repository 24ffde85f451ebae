use crate::error::{SignalingError, SignalingRuntimeError, TransportFailureReason};
use crate::transport::{SignalingReceiver, SignalingSender, SignalingTransport};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite};
use tokio_util::sync::CancellationToken;
use url::Url;
use vidlink_protocol::Envelope;

const HEARTBEAT_PING_INTERVAL: Duration = Duration::from_secs(15);
const HEARTBEAT_PONG_TIMEOUT: Duration = Duration::from_secs(5);
pub const PARTY_ID_QUERY_PARAM: &str = "partyId";

type WebSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct TokioTransport {
    url: String,
}

impl TokioTransport {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }

    /// Builds a transport for the given local party, announcing its ID via the `partyId` query
    /// parameter so the signaling server can route envelopes addressed to it.
    pub fn for_party(base_url: &str, party_id: &str) -> Result<Self, SignalingError> {
        let mut url = Url::parse(base_url)
            .map_err(|err| SignalingError::InvalidEndpoint(format!("{base_url}: {err}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(SignalingError::InvalidEndpoint(format!(
                "{base_url}: unsupported scheme {}",
                url.scheme()
            )));
        }
        url.query_pairs_mut()
            .append_pair(PARTY_ID_QUERY_PARAM, party_id);

        Ok(Self {
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl SignalingTransport for TokioTransport {
    type Sender = TokioSender;
    type Receiver = TokioReceiver;

    #[tracing::instrument(level = "info", err)]
    async fn connect(&self) -> Result<(Self::Sender, Self::Receiver), SignalingError> {
        tracing::info!("Connecting to signaling server");
        let (websocket_stream, response) = tokio_tungstenite::connect_async(&self.url)
            .await
            .map_err(|err| {
                tracing::error!(?err, "Failed to connect to signaling server");
                SignalingError::from(anyhow::Error::from(err))
            })?;
        tracing::debug!(?response, "WebSocket handshake response");

        let (websocket_tx, websocket_rx) = websocket_stream.split();

        tracing::info!("Successfully established connection to signaling server");
        Ok((
            TokioSender { websocket_tx },
            TokioReceiver::new(websocket_rx),
        ))
    }
}

pub struct TokioSender {
    websocket_tx: SplitSink<WebSocket, tungstenite::Message>,
}

#[async_trait]
impl SignalingSender for TokioSender {
    #[tracing::instrument(level = "debug", skip(self, msg), err)]
    async fn send(&mut self, msg: tungstenite::Message) -> Result<(), SignalingRuntimeError> {
        self.websocket_tx.send(msg).await.map_err(|err| {
            tracing::warn!(?err, "Failed to send message");
            SignalingRuntimeError::Transport(TransportFailureReason::Send(err.to_string()))
        })
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn close(&mut self) -> Result<(), SignalingRuntimeError> {
        let _ = self
            .websocket_tx
            .send(tungstenite::Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            })))
            .await
            .inspect_err(|err| {
                tracing::warn!(?err, "Failed to send Close frame");
            });

        self.websocket_tx.close().await.map_err(|err| {
            tracing::warn!(?err, "Failed to close WebSocket connection");
            SignalingRuntimeError::Transport(TransportFailureReason::Close(err.to_string()))
        })
    }
}

pub struct TokioReceiver {
    websocket_rx: SplitStream<WebSocket>,
    cancel: CancellationToken,
    heartbeat: Arc<Heartbeat>,
    heartbeat_handle: Option<JoinHandle<()>>,
}

impl TokioReceiver {
    fn new(websocket_rx: SplitStream<WebSocket>) -> Self {
        Self {
            websocket_rx,
            cancel: CancellationToken::new(),
            heartbeat: Arc::new(Heartbeat::new()),
            heartbeat_handle: None,
        }
    }

    fn spawn_heartbeat(&mut self, send_tx: &mpsc::Sender<tungstenite::Message>) {
        let heartbeat = self.heartbeat.clone();
        let send_tx = send_tx.clone();
        let cancel = self.cancel.clone();

        self.heartbeat_handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_PING_INTERVAL);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if heartbeat.last_rx().elapsed() < HEARTBEAT_PING_INTERVAL / 2 {
                            continue;
                        }

                        let ping_sent = Instant::now();
                        if let Err(err) = send_tx.send(tungstenite::Message::Ping(tungstenite::Bytes::new())).await {
                            tracing::warn!(?err, "Failed to send heartbeat ping");
                            heartbeat.timed_out.notify_one();
                            break;
                        }

                        tokio::time::sleep(HEARTBEAT_PONG_TIMEOUT).await;
                        if heartbeat.last_rx() < ping_sent {
                            tracing::warn!("Heartbeat timeout");
                            heartbeat.timed_out.notify_one();
                            break;
                        }
                    }
                }
            }
            tracing::trace!("Heartbeat task finished");
        }));
    }
}

#[async_trait]
impl SignalingReceiver for TokioReceiver {
    #[tracing::instrument(level = "debug", skip(self, send_tx), err)]
    async fn recv(
        &mut self,
        send_tx: &mpsc::Sender<tungstenite::Message>,
    ) -> Result<Envelope, SignalingRuntimeError> {
        if self.heartbeat_handle.is_none() {
            self.spawn_heartbeat(send_tx);
        }

        loop {
            tokio::select! {
                _ = self.heartbeat.timed_out.notified() => {
                    tracing::warn!("Disconnecting due to heartbeat timeout");
                    return Err(SignalingRuntimeError::Disconnected);
                }
                msg = self.websocket_rx.next() => {
                    let Some(msg) = msg else { break; };
                    match msg {
                        Ok(tungstenite::Message::Text(text)) => {
                            self.heartbeat.mark_rx();
                            return Envelope::deserialize(&text).map_err(|err| {
                                tracing::warn!(?err, "Failed to deserialize envelope");
                                SignalingRuntimeError::SerializationError(err.to_string())
                            });
                        }
                        Ok(tungstenite::Message::Close(reason)) => {
                            tracing::warn!(?reason, "Received Close WebSocket frame");
                            return Err(SignalingRuntimeError::Disconnected);
                        }
                        Ok(tungstenite::Message::Ping(data)) => {
                            self.heartbeat.mark_rx();
                            if let Err(err) = send_tx.send(tungstenite::Message::Pong(data)).await {
                                tracing::warn!(?err, "Failed to send Pong");
                                return Err(SignalingRuntimeError::Disconnected);
                            }
                        }
                        Ok(tungstenite::Message::Pong(_)) => self.heartbeat.mark_rx(),
                        Ok(other) => {
                            tracing::debug!(?other, "Skipping non-text WebSocket frame");
                        }
                        Err(err) => {
                            tracing::warn!(?err, "Failed to receive message");
                            return Err(SignalingRuntimeError::Transport(
                                TransportFailureReason::Receive(err.to_string()),
                            ));
                        }
                    }
                }
            }
        }

        tracing::warn!("WebSocket stream closed");
        Err(SignalingRuntimeError::Disconnected)
    }
}

impl Drop for TokioReceiver {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.heartbeat_handle.take() {
            handle.abort();
        }
    }
}

struct Heartbeat {
    last_rx: RwLock<Instant>,
    timed_out: Notify,
}

impl Heartbeat {
    fn new() -> Self {
        Self {
            last_rx: RwLock::new(Instant::now()),
            timed_out: Notify::new(),
        }
    }

    fn mark_rx(&self) {
        *self.last_rx.write() = Instant::now();
    }

    fn last_rx(&self) -> Instant {
        *self.last_rx.read()
    }
}
