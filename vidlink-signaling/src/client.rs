use crate::error::{SignalingError, SignalingRuntimeError};
use crate::transport::{SignalingReceiver, SignalingSender, SignalingTransport};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, instrument};
use vidlink_protocol::{Envelope, SignalingMessage};

const BROADCAST_CHANNEL_SIZE: usize = 100;
const SEND_CHANNEL_SIZE: usize = 100;
const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Default state, no connection to the server, messages cannot be sent or received.
    /// This state will also be set when a disconnect is requested, a websocket timeout/error is received,
    /// or one of the processing tasks encounters an error.
    Disconnected,
    /// Connected to the server. The server identified the local party by the ID announced while
    /// connecting, so envelopes can be sent and received.
    Connected,
}

#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Emitted after the [`SignalingClient`] successfully connected to the server.
    Connected,
    /// Emitted for every [`Envelope`] received by a connected [`SignalingClient`].
    Message(Envelope),
    /// Emitted for every [`SignalingRuntimeError`] encountered by the worker tasks.
    Error(SignalingRuntimeError),
}

/// Connection to the signaling server on behalf of a single local party.
///
/// Received envelopes are fanned out to every subscriber, outgoing messages are queued on a
/// bounded channel drained by a dedicated writer task.
#[derive(Clone)]
pub struct SignalingClient<ST: SignalingTransport> {
    inner: Arc<SignalingClientInner<ST>>,
    supervisor_task: Arc<JoinHandle<()>>,
}

impl<ST: SignalingTransport> SignalingClient<ST> {
    pub fn new(
        transport: ST,
        local_id: impl Into<String>,
        shutdown_token: CancellationToken,
        handle: &tokio::runtime::Handle,
    ) -> Self {
        let inner = Arc::new(SignalingClientInner::new(
            transport,
            local_id.into(),
            shutdown_token,
        ));

        let inner_clone = inner.clone();
        let supervisor_task = Arc::new(handle.spawn(async move {
            inner_clone.supervisor_task().await;
        }));

        Self {
            inner,
            supervisor_task,
        }
    }

    /// ID of the party this client is connected as. Used as the `from` field of all sent envelopes.
    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    /// Subscribes to a broadcast channel emitting [`SignalingEvent`]s.
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.inner.subscribe()
    }

    /// Subscribes to a watch containing the current [`SignalingClient`]'s [`State`].
    pub fn subscribe_state(&self) -> watch::Receiver<State> {
        self.inner.subscribe_state()
    }

    pub fn state(&self) -> State {
        self.inner.state()
    }

    pub async fn connect(&self) -> Result<(), SignalingError> {
        self.inner.connect().await
    }

    pub async fn disconnect(&self) {
        self.inner.disconnect().await;
    }

    /// Wraps `message` in an [`Envelope`] addressed to `to` and queues it for transmission.
    pub async fn send(
        &self,
        to: impl Into<String>,
        message: SignalingMessage,
    ) -> Result<(), SignalingError> {
        let envelope = Envelope::new(self.inner.local_id.clone(), to, message);
        self.inner.send(envelope).await
    }
}

impl<ST: SignalingTransport> Drop for SignalingClient<ST> {
    fn drop(&mut self) {
        // The supervisor holds another reference to inner, only tear down once the last handle is gone.
        // It flushes queued messages and exits on its own once cancelled.
        if Arc::strong_count(&self.supervisor_task) == 1 {
            self.inner.shutdown_token.cancel();
        }
    }
}

struct SignalingClientInner<ST: SignalingTransport> {
    transport: ST,
    local_id: String,

    state_tx: watch::Sender<State>,
    state_rx: watch::Receiver<State>,

    disconnect_token: Mutex<CancellationToken>,
    shutdown_token: CancellationToken,

    broadcast_tx: broadcast::Sender<SignalingEvent>,

    send_tx: Mutex<Option<mpsc::Sender<tungstenite::Message>>>,

    worker_tasks: Mutex<JoinSet<()>>,
}

impl<ST: SignalingTransport> SignalingClientInner<ST> {
    #[instrument(level = "debug", skip(transport, shutdown_token))]
    fn new(transport: ST, local_id: String, shutdown_token: CancellationToken) -> Self {
        let (state_tx, state_rx) = watch::channel(State::Disconnected);
        Self {
            transport,
            local_id,

            state_tx,
            state_rx,

            disconnect_token: Mutex::new(shutdown_token.child_token()),
            shutdown_token,

            broadcast_tx: broadcast::channel(BROADCAST_CHANNEL_SIZE).0,

            send_tx: Mutex::new(None),

            worker_tasks: Mutex::new(JoinSet::new()),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.broadcast_tx.subscribe()
    }

    fn subscribe_state(&self) -> watch::Receiver<State> {
        self.state_tx.subscribe()
    }

    fn state(&self) -> State {
        *self.state_rx.borrow()
    }

    #[instrument(level = "debug", skip(self), fields(local_id = %self.local_id))]
    async fn disconnect(&self) {
        self.disconnect_token.lock().cancel();
        self.set_state(State::Disconnected);
        self.cleanup().await;
    }

    #[instrument(level = "debug", skip(self), fields(kind = %envelope.kind(), to = %envelope.to), err)]
    async fn send(&self, envelope: Envelope) -> Result<(), SignalingError> {
        if self.state() == State::Disconnected {
            tracing::warn!("Tried to send message while signaling client is disconnected");
            return Err(SignalingError::Runtime(SignalingRuntimeError::Disconnected));
        }

        let send_tx = {
            self.send_tx.lock().as_ref().cloned().ok_or_else(|| {
                tracing::error!("Client is connected, but send_tx is not initialized");
                SignalingError::Runtime(SignalingRuntimeError::Disconnected)
            })?
        };

        let serialized = Envelope::serialize(&envelope).map_err(|err| {
            tracing::warn!(?err, "Failed to serialize envelope");
            SignalingError::Runtime(SignalingRuntimeError::SerializationError(err.to_string()))
        })?;

        tracing::trace!("Sending envelope to send channel");
        send_tx
            .send(tungstenite::Message::from(serialized))
            .await
            .map_err(|_| SignalingError::Runtime(SignalingRuntimeError::Disconnected))
    }

    #[instrument(level = "debug", skip(self), fields(local_id = %self.local_id), err)]
    async fn connect(&self) -> Result<(), SignalingError> {
        if self.state() == State::Connected {
            tracing::debug!("Already connected, skipping connect");
            return Ok(());
        }

        tracing::trace!("Connecting to signaling server");
        let (sender, receiver) = self.transport.connect().await?;

        let (send_tx, send_rx) = mpsc::channel::<tungstenite::Message>(SEND_CHANNEL_SIZE);
        tracing::trace!("Successfully connected to signaling server, starting worker tasks");
        {
            let mut tasks = self.worker_tasks.lock();
            let rt_handle = tokio::runtime::Handle::current();
            let disconnect_token = self.disconnect_token.lock().clone();

            tasks.spawn_on(
                Self::reader_task(
                    receiver,
                    send_tx.clone(),
                    self.broadcast_tx.clone(),
                    disconnect_token.clone(),
                    self.subscribe_state(),
                ),
                &rt_handle,
            );

            tasks.spawn_on(
                Self::writer_task(
                    sender,
                    send_rx,
                    self.broadcast_tx.clone(),
                    disconnect_token,
                    self.subscribe_state(),
                ),
                &rt_handle,
            );
        }

        *self.send_tx.lock() = Some(send_tx);
        self.set_state(State::Connected);

        if let Err(err) = self.broadcast_tx.send(SignalingEvent::Connected) {
            tracing::trace!(?err, "No subscribers for connected event");
        }

        tracing::info!("Signaling client connected");
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn cleanup(&self) {
        tracing::debug!("Cleaning up after disconnect");

        let mut worker_tasks = {
            let mut worker_tasks = self.worker_tasks.lock();
            std::mem::replace(&mut *worker_tasks, JoinSet::new())
        };

        tracing::trace!("Waiting for worker tasks to finish");
        let joined = tokio::time::timeout(WORKER_SHUTDOWN_TIMEOUT, async {
            while let Some(res) = worker_tasks.join_next().await {
                if let Err(err) = res
                    && !err.is_cancelled()
                {
                    tracing::warn!(?err, "Failed to join worker task");
                }
            }
        })
        .await;
        if joined.is_err() {
            tracing::warn!("Worker tasks did not finish in time, aborting");
            worker_tasks.abort_all();
            while worker_tasks.join_next().await.is_some() {}
        }

        *self.disconnect_token.lock() = self.shutdown_token.child_token();
        self.send_tx.lock().take();

        tracing::debug!("Finished cleaning up after disconnect");
    }

    #[instrument(level = "debug", skip(self), fields(local_id = %self.local_id))]
    async fn supervisor_task(self: Arc<Self>) {
        tracing::debug!("Starting supervisor task");

        let mut broadcast_rx = self.subscribe();

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_token.cancelled() => {
                    tracing::debug!("Shutdown signal received, exiting supervisor task");
                    self.disconnect().await;
                    break;
                }

                event = broadcast_rx.recv() => {
                    match event {
                        Ok(SignalingEvent::Error(err)) if err.is_fatal() => {
                            tracing::warn!(?err, "Received fatal error event, disconnecting");
                            self.disconnect().await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(?skipped, "Supervisor lagged behind signaling events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            tracing::warn!("Signaling event channel closed, exiting supervisor task");
                            self.disconnect().await;
                            break;
                        }
                    }
                }
            }
        }

        tracing::debug!("Supervisor task finished");
    }

    fn set_state(&self, state: State) {
        if let Err(err) = self.state_tx.send(state) {
            tracing::warn!(?err, "Failed to update client state");
        }
    }

    #[instrument(level = "debug", skip(state_rx, broadcast_tx))]
    fn emit_task_error(
        state_rx: &watch::Receiver<State>,
        broadcast_tx: &broadcast::Sender<SignalingEvent>,
        err: SignalingRuntimeError,
    ) {
        let state = *state_rx.borrow();
        tracing::warn!(?state, "Received error from task");
        if state == State::Connected
            && broadcast_tx
                .send(SignalingEvent::Error(err.clone()))
                .is_err()
        {
            tracing::warn!("Failed to broadcast task error signaling event");
        }
    }

    #[instrument(level = "debug", skip_all)]
    fn reader_task<R: SignalingReceiver>(
        mut receiver: R,
        send_tx: mpsc::Sender<tungstenite::Message>,
        broadcast_tx: broadcast::Sender<SignalingEvent>,
        disconnect_token: CancellationToken,
        state_rx: watch::Receiver<State>,
    ) -> impl Future<Output = ()> + Send {
        async move {
            tracing::debug!("Starting transport reader task");
            let _guard = TaskDropLogger::new("reader");

            loop {
                tokio::select! {
                    biased;

                    _ = disconnect_token.cancelled() => {
                        tracing::debug!("Disconnect signal received, exiting transport reader task");
                        break;
                    }

                    msg = receiver.recv(&send_tx) => {
                        match msg {
                            Ok(envelope) => {
                                if broadcast_tx.receiver_count() > 0 {
                                    tracing::trace!(kind = %envelope.kind(), from = %envelope.from, "Broadcasting envelope");
                                    if let Err(err) = broadcast_tx.send(SignalingEvent::Message(envelope)) {
                                        tracing::warn!(?err, "Failed to broadcast envelope");
                                    }
                                } else {
                                    tracing::trace!(?envelope, "No receivers subscribed, not broadcasting envelope");
                                }
                            }
                            Err(err @ SignalingRuntimeError::SerializationError(_)) => {
                                Self::emit_task_error(&state_rx, &broadcast_tx, err);
                            }
                            Err(err) => {
                                Self::emit_task_error(&state_rx, &broadcast_tx, err);
                                break;
                            }
                        }
                    }
                }
            }
        }
        .instrument(tracing::Span::current())
    }

    #[instrument(level = "debug", skip_all)]
    fn writer_task<S: SignalingSender>(
        mut sender: S,
        mut send_rx: mpsc::Receiver<tungstenite::Message>,
        broadcast_tx: broadcast::Sender<SignalingEvent>,
        disconnect_token: CancellationToken,
        state_rx: watch::Receiver<State>,
    ) -> impl Future<Output = ()> + Send {
        async move {
            tracing::debug!("Starting transport writer task");
            let _guard = TaskDropLogger::new("writer");

            loop {
                tokio::select! {
                    biased;

                    _ = disconnect_token.cancelled() => {
                        tracing::debug!("Disconnect signal received, flushing queued messages");
                        while let Ok(msg) = send_rx.try_recv() {
                            if let Err(err) = sender.send(msg).await {
                                tracing::debug!(?err, "Failed to flush queued message");
                                break;
                            }
                        }

                        tracing::debug!("Closing sender");
                        if let Err(err) = sender.close().await {
                            tracing::warn!(?err, "Failed to close transport");
                        }
                        break;
                    }

                    msg = send_rx.recv() => {
                        match msg {
                            Some(msg) => {
                                if !matches!(msg, tungstenite::Message::Pong(_) | tungstenite::Message::Ping(_)) {
                                    tracing::trace!(?msg, "Sending message to transport");
                                }

                                if let Err(err) = sender.send(msg).await {
                                    Self::emit_task_error(&state_rx, &broadcast_tx, err);
                                    break;
                                }
                            },
                            None => {
                                Self::emit_task_error(&state_rx, &broadcast_tx, SignalingRuntimeError::Disconnected);
                                break;
                            }
                        }
                    }
                }
            }
        }
        .instrument(tracing::Span::current())
    }
}

struct TaskDropLogger {
    name: &'static str,
}

impl TaskDropLogger {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl Drop for TaskDropLogger {
    fn drop(&mut self) {
        tracing::trace!(task_name = ?self.name, "Task dropped");
    }
}
