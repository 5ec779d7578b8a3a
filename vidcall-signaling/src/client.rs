use crate::error::{SignalingError, SignalingRuntimeError};
use crate::transport::{SignalingReceiver, SignalingSender, SignalingTransport};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, instrument};
use vidcall_protocol::ws::SignalingMessage;

const BROADCAST_CHANNEL_SIZE: usize = 100;
pub const DEFAULT_SEND_CHANNEL_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No connection to the relay, messages cannot be sent or received.
    /// Also set after a requested disconnect, a transport error or a failed reconnect.
    Disconnected,
    /// Connected to the relay but the endpoint identity has not been announced yet.
    /// The only message that can be sent is [`SignalingMessage::JoinRoom`].
    Connected,
    /// Connected and announced via [`SignalingMessage::JoinRoom`]. Envelopes can be sent and received.
    Joined,
}

#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Emitted after the [`SignalingClient`] connected and announced its identity.
    Joined { id: String },
    /// Emitted for every [`SignalingMessage`] received while connected.
    Message(SignalingMessage),
    /// Emitted for every [`SignalingRuntimeError`] encountered by the worker tasks.
    Error(SignalingRuntimeError),
}

/// Duplex connection to a relay forwarding [`SignalingMessage`]s between named endpoints.
///
/// Delivery is best-effort. Sending while disconnected fails with
/// [`SignalingRuntimeError::Disconnected`] instead of queueing the message.
pub struct SignalingClient<ST: SignalingTransport> {
    inner: Arc<SignalingClientInner<ST>>,
    supervisor_task: Arc<JoinHandle<()>>,
}

impl<ST: SignalingTransport> SignalingClient<ST> {
    pub fn new(
        transport: ST,
        identity: impl Into<String>,
        shutdown_token: CancellationToken,
        reconnect_max_tries: u8,
        handle: &tokio::runtime::Handle,
    ) -> Self {
        let inner = Arc::new(SignalingClientInner::new(
            transport,
            identity.into(),
            shutdown_token,
            reconnect_max_tries,
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

    /// Subscribes to a broadcast channel emitting [`SignalingEvent`]s.
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.inner.subscribe()
    }

    /// Subscribes to a watch containing the current [`State`].
    pub fn subscribe_state(&self) -> watch::Receiver<State> {
        self.inner.state_tx.subscribe()
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

    pub async fn send(&self, msg: SignalingMessage) -> Result<(), SignalingError> {
        self.inner.send(msg).await
    }

    /// Queues a message without waiting for room in the send channel.
    pub fn try_send(&self, msg: SignalingMessage) -> Result<(), SignalingError> {
        self.inner.try_send(msg)
    }
}

// Manual impl, a derive would require the transport itself to be `Clone`.
impl<ST: SignalingTransport> Clone for SignalingClient<ST> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            supervisor_task: self.supervisor_task.clone(),
        }
    }
}

impl<ST: SignalingTransport> Drop for SignalingClient<ST> {
    fn drop(&mut self) {
        // Clones share the supervisor, only the last one tears it down.
        if Arc::strong_count(&self.supervisor_task) == 1 {
            self.inner.shutdown_token.cancel();
            self.supervisor_task.abort();
        }
    }
}

struct SignalingClientInner<ST: SignalingTransport> {
    transport: ST,
    identity: String,

    state_tx: watch::Sender<State>,
    state_rx: watch::Receiver<State>,

    disconnect_token: Mutex<CancellationToken>,
    shutdown_token: CancellationToken,

    broadcast_tx: broadcast::Sender<SignalingEvent>,
    send_tx: Mutex<Option<mpsc::Sender<tungstenite::Message>>>,

    reconnect_max_tries: u8,

    worker_tasks: Mutex<JoinSet<()>>,
}

impl<ST: SignalingTransport> SignalingClientInner<ST> {
    fn new(
        transport: ST,
        identity: String,
        shutdown_token: CancellationToken,
        reconnect_max_tries: u8,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(State::Disconnected);
        Self {
            transport,
            identity,

            state_tx,
            state_rx,

            disconnect_token: Mutex::new(shutdown_token.child_token()),
            shutdown_token,

            broadcast_tx: broadcast::channel(BROADCAST_CHANNEL_SIZE).0,
            send_tx: Mutex::new(None),

            reconnect_max_tries,

            worker_tasks: Mutex::new(JoinSet::new()),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.broadcast_tx.subscribe()
    }

    fn state(&self) -> State {
        *self.state_rx.borrow()
    }

    fn set_state(&self, state: State) {
        if let Err(err) = self.state_tx.send(state) {
            tracing::warn!(?err, "Failed to update client state");
        }
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn connect(&self) -> Result<(), SignalingError> {
        if self.identity.is_empty() {
            return Err(SignalingError::ProtocolError(
                "Cannot join without an endpoint identity".to_string(),
            ));
        }
        if self.state() != State::Disconnected {
            return Err(SignalingError::Other("Already connected".to_string()));
        }

        let (sender, receiver) = self.transport.connect().await?;

        let (send_tx, send_rx) = mpsc::channel::<tungstenite::Message>(DEFAULT_SEND_CHANNEL_SIZE);
        tracing::trace!("Connected to relay, starting worker tasks");
        {
            let disconnect_token = self.disconnect_token.lock().clone();
            let mut tasks = self.worker_tasks.lock();
            let rt_handle = tokio::runtime::Handle::current();

            tasks.spawn_on(
                Self::reader_task(
                    receiver,
                    send_tx.clone(),
                    self.broadcast_tx.clone(),
                    disconnect_token.clone(),
                ),
                &rt_handle,
            );
            tasks.spawn_on(
                Self::writer_task(
                    sender,
                    send_rx,
                    self.broadcast_tx.clone(),
                    disconnect_token,
                ),
                &rt_handle,
            );
        }

        *self.send_tx.lock() = Some(send_tx);
        self.set_state(State::Connected);

        if let Err(err) = self
            .send(SignalingMessage::JoinRoom {
                id: self.identity.clone(),
            })
            .await
        {
            tracing::warn!(?err, "Failed to announce identity");
            self.shutdown_connection().await;
            return Err(err);
        }

        self.set_state(State::Joined);
        tracing::info!(id = %self.identity, "Joined relay");
        if let Err(err) = self.broadcast_tx.send(SignalingEvent::Joined {
            id: self.identity.clone(),
        }) {
            tracing::debug!(?err, "No subscribers for joined event");
        }

        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn disconnect(&self) {
        self.shutdown_connection().await;
    }

    async fn shutdown_connection(&self) {
        self.disconnect_token.lock().cancel();
        self.set_state(State::Disconnected);
        self.cleanup().await;
    }

    fn check_sendable(&self, msg: &SignalingMessage) -> Result<(), SignalingError> {
        match self.state() {
            State::Disconnected => {
                tracing::warn!(kind = msg.kind(), "Tried to send message while disconnected");
                Err(SignalingRuntimeError::Disconnected.into())
            }
            State::Connected if !matches!(msg, SignalingMessage::JoinRoom { .. }) => {
                tracing::warn!(kind = msg.kind(), "Tried to send message before joining");
                Err(SignalingRuntimeError::Disconnected.into())
            }
            _ => Ok(()),
        }
    }

    fn encode(msg: &SignalingMessage) -> Result<tungstenite::Message, SignalingError> {
        SignalingMessage::serialize(msg)
            .map(tungstenite::Message::from)
            .map_err(|err| {
                tracing::warn!(?err, "Failed to serialize message");
                SignalingRuntimeError::SerializationError(err.to_string()).into()
            })
    }

    fn sender(&self) -> Result<mpsc::Sender<tungstenite::Message>, SignalingError> {
        self.send_tx.lock().as_ref().cloned().ok_or_else(|| {
            tracing::warn!("Send channel is not initialized");
            SignalingRuntimeError::Disconnected.into()
        })
    }

    #[instrument(level = "debug", skip(self, msg), fields(kind = msg.kind()), err)]
    async fn send(&self, msg: SignalingMessage) -> Result<(), SignalingError> {
        self.check_sendable(&msg)?;
        let send_tx = self.sender()?;
        let encoded = Self::encode(&msg)?;

        send_tx
            .send(encoded)
            .await
            .map_err(|_| SignalingRuntimeError::Disconnected.into())
    }

    fn try_send(&self, msg: SignalingMessage) -> Result<(), SignalingError> {
        self.check_sendable(&msg)?;
        let send_tx = self.sender()?;
        let encoded = Self::encode(&msg)?;

        send_tx.try_send(encoded).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => {
                tracing::warn!(kind = msg.kind(), "Send queue full, dropping message");
                SignalingRuntimeError::SendQueueFull.into()
            }
            mpsc::error::TrySendError::Closed(_) => SignalingRuntimeError::Disconnected.into(),
        })
    }

    async fn cleanup(&self) {
        let mut worker_tasks = {
            let mut worker_tasks = self.worker_tasks.lock();
            std::mem::replace(&mut *worker_tasks, JoinSet::new())
        };

        worker_tasks.abort_all();
        while let Some(res) = worker_tasks.join_next().await {
            if let Err(err) = res
                && !err.is_cancelled()
            {
                tracing::warn!(?err, "Failed to join worker task");
            }
        }

        *self.disconnect_token.lock() = self.shutdown_token.child_token();
        self.send_tx.lock().take();

        tracing::debug!("Finished cleaning up after disconnect");
    }

    #[instrument(level = "debug", skip(self))]
    async fn supervisor_task(self: Arc<Self>) {
        let mut broadcast_rx = self.subscribe();

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_token.cancelled() => {
                    tracing::debug!("Shutdown signal received, exiting supervisor task");
                    self.shutdown_connection().await;
                    break;
                }

                event = broadcast_rx.recv() => {
                    match event {
                        Ok(SignalingEvent::Error(err)) if err.is_fatal() => {
                            tracing::debug!(?err, "Received fatal error, disconnecting");
                            self.shutdown_connection().await;

                            if err.can_reconnect()
                                && let Err(err) = self.reconnect().await
                            {
                                tracing::warn!(?err, "Giving up reconnecting");
                                Self::emit_task_error(&self.broadcast_tx, err);
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(?skipped, "Supervisor lagged behind, events were dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        tracing::debug!("Supervisor task finished");
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn reconnect(&self) -> Result<(), SignalingRuntimeError> {
        if self.reconnect_max_tries == 0 {
            tracing::debug!("Reconnecting disabled");
            return Ok(());
        }

        let mut retry_strategy = RetryStrategy::default();
        let mut last_error = SignalingError::Other("no attempt made".to_string());
        for attempt in 1..=self.reconnect_max_tries {
            if self.shutdown_token.is_cancelled() {
                break;
            }
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    let timeout = retry_strategy.timeout(attempt as u32);
                    tracing::warn!(?err, ?attempt, ?timeout, "Failed to reconnect");
                    tokio::time::sleep(timeout).await;
                    last_error = err;
                }
            }
        }

        Err(SignalingRuntimeError::ReconnectFailed(last_error.to_string()))
    }

    fn emit_task_error(broadcast_tx: &broadcast::Sender<SignalingEvent>, err: SignalingRuntimeError) {
        tracing::warn!(?err, "Received error from worker task");
        if broadcast_tx.send(SignalingEvent::Error(err)).is_err() {
            tracing::warn!("Failed to broadcast task error");
        }
    }

    fn reader_task<R: SignalingReceiver>(
        mut receiver: R,
        send_tx: mpsc::Sender<tungstenite::Message>,
        broadcast_tx: broadcast::Sender<SignalingEvent>,
        disconnect_token: CancellationToken,
    ) -> impl Future<Output = ()> + Send {
        async move {
            let _guard = TaskDropLogger::new("reader");

            loop {
                tokio::select! {
                    biased;

                    _ = disconnect_token.cancelled() => break,

                    msg = receiver.recv(&send_tx) => {
                        match msg {
                            Ok(message) => {
                                tracing::trace!(kind = message.kind(), "Received message from transport");
                                if broadcast_tx.send(SignalingEvent::Message(message)).is_err() {
                                    tracing::trace!("No receivers subscribed, dropping message");
                                }
                            }
                            Err(err) if !err.is_fatal() => {
                                // A single undecodable message does not kill the connection.
                                Self::emit_task_error(&broadcast_tx, err);
                            }
                            Err(err) => {
                                Self::emit_task_error(&broadcast_tx, err);
                                break;
                            }
                        }
                    }
                }
            }
        }
        .instrument(tracing::Span::current())
    }

    fn writer_task<S: SignalingSender>(
        mut sender: S,
        mut send_rx: mpsc::Receiver<tungstenite::Message>,
        broadcast_tx: broadcast::Sender<SignalingEvent>,
        disconnect_token: CancellationToken,
    ) -> impl Future<Output = ()> + Send {
        async move {
            let _guard = TaskDropLogger::new("writer");

            loop {
                tokio::select! {
                    biased;

                    _ = disconnect_token.cancelled() => {
                        if let Err(err) = sender.close().await {
                            tracing::warn!(?err, "Failed to close transport");
                        }
                        break;
                    }

                    msg = send_rx.recv() => {
                        match msg {
                            Some(msg) => {
                                if let Err(err) = sender.send(msg).await {
                                    Self::emit_task_error(&broadcast_tx, err);
                                    break;
                                }
                            }
                            None => {
                                Self::emit_task_error(&broadcast_tx, SignalingRuntimeError::Disconnected);
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
    fn new(name: &'static str) -> Self {
        tracing::debug!(task_name = ?name, "Task started");
        Self { name }
    }
}

impl Drop for TaskDropLogger {
    fn drop(&mut self) {
        tracing::trace!(task_name = ?self.name, "Task dropped");
    }
}

/// Exponential backoff with full jitter.
struct RetryStrategy {
    base: Duration,
    cap: Duration,
    rng: rand::rngs::StdRng,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(5),
            rng: rand::rngs::StdRng::from_os_rng(),
        }
    }
}

impl RetryStrategy {
    fn timeout(&mut self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exp_nanos = self
            .base
            .as_nanos()
            .saturating_mul(1u128 << attempt.saturating_sub(1).min(63));
        let max_delay_nanos = exp_nanos.min(self.cap.as_nanos());

        let jitter_nanos = if max_delay_nanos == 0 {
            0
        } else {
            self.rng.random_range(0..=max_delay_nanos)
        };

        Duration::from_nanos(jitter_nanos.min(u128::from(u64::MAX)) as u64)
    }
}
