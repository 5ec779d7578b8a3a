use crate::error::{SignalingError, SignalingRuntimeError, TransportFailureReason};
use crate::transport::{SignalingReceiver, SignalingSender, SignalingTransport};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Notify, broadcast, mpsc};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use vidcall_protocol::ws::SignalingMessage;

const MOCK_CHANNEL_CAPACITY: usize = 64;

/// In-memory transport for tests.
///
/// Everything the client writes shows up on [`MockTransport::outgoing_tx`] (subscribe to it),
/// everything sent on [`MockTransport::incoming_tx`] is delivered to the client.
#[derive(Clone)]
pub struct MockTransport {
    pub outgoing_tx: broadcast::Sender<tungstenite::Message>,
    pub incoming_tx: broadcast::Sender<tungstenite::Message>,
    /// Notified every time a connection has been established.
    pub ready: Arc<Notify>,
    connection_token: Arc<Mutex<CancellationToken>>,
    refuse_connect: Arc<AtomicBool>,
    connects: Arc<AtomicUsize>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            outgoing_tx: broadcast::channel(MOCK_CHANNEL_CAPACITY).0,
            incoming_tx: broadcast::channel(MOCK_CHANNEL_CAPACITY).0,
            ready: Arc::new(Notify::new()),
            connection_token: Arc::new(Mutex::new(CancellationToken::new())),
            refuse_connect: Arc::new(AtomicBool::new(false)),
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl MockTransport {
    /// Token of the currently established connection. Cancelling it simulates the relay going away.
    pub fn disconnect_token(&self) -> CancellationToken {
        self.connection_token.lock().clone()
    }

    /// Drops the current connection while still accepting new ones.
    pub fn drop_connection(&self) {
        let mut token = self.connection_token.lock();
        token.cancel();
        *token = CancellationToken::new();
    }

    pub fn set_refuse_connect(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    /// Number of successful connects so far.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Delivers a [`SignalingMessage`] to the connected client.
    pub fn deliver(&self, msg: &SignalingMessage) {
        match SignalingMessage::serialize(msg) {
            Ok(text) => {
                let _ = self.incoming_tx.send(tungstenite::Message::from(text));
            }
            Err(err) => tracing::warn!(?err, "Failed to serialize mock message"),
        }
    }
}

#[async_trait]
impl SignalingTransport for MockTransport {
    type Sender = MockSender;
    type Receiver = MockReceiver;

    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn connect(&self) -> Result<(Self::Sender, Self::Receiver), SignalingError> {
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Err(SignalingRuntimeError::Transport(TransportFailureReason::Connect(
                "connection refused".to_string(),
            ))
            .into());
        }

        let token = self.connection_token.lock().clone();
        let sender = MockSender {
            tx: Some(self.outgoing_tx.clone()),
            token: token.clone(),
        };
        let receiver = MockReceiver {
            rx: self.incoming_tx.subscribe(),
            token,
        };

        self.connects.fetch_add(1, Ordering::SeqCst);
        self.ready.notify_one();
        Ok((sender, receiver))
    }
}

pub struct MockSender {
    tx: Option<broadcast::Sender<tungstenite::Message>>,
    token: CancellationToken,
}

#[async_trait]
impl SignalingSender for MockSender {
    async fn send(&mut self, msg: tungstenite::Message) -> Result<(), SignalingRuntimeError> {
        if self.token.is_cancelled() {
            return Err(SignalingRuntimeError::Transport(TransportFailureReason::Send(
                "connection dropped".to_string(),
            )));
        }
        match &self.tx {
            Some(tx) => {
                // Nobody listening is fine, the relay would not complain either.
                let _ = tx.send(msg);
                Ok(())
            }
            None => Err(SignalingRuntimeError::Transport(TransportFailureReason::Send(
                "sender closed".to_string(),
            ))),
        }
    }

    async fn close(&mut self) -> Result<(), SignalingRuntimeError> {
        self.tx = None;
        Ok(())
    }
}

pub struct MockReceiver {
    rx: broadcast::Receiver<tungstenite::Message>,
    token: CancellationToken,
}

#[async_trait]
impl SignalingReceiver for MockReceiver {
    async fn recv(
        &mut self,
        send_tx: &mpsc::Sender<tungstenite::Message>,
    ) -> Result<SignalingMessage, SignalingRuntimeError> {
        loop {
            let msg = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Err(SignalingRuntimeError::Disconnected),
                msg = self.rx.recv() => msg,
            };

            match msg {
                Ok(tungstenite::Message::Text(text)) => {
                    return SignalingMessage::deserialize(&text).map_err(|err| {
                        SignalingRuntimeError::SerializationError(err.to_string())
                    });
                }
                Ok(tungstenite::Message::Close(_)) => return Err(SignalingRuntimeError::Disconnected),
                Ok(tungstenite::Message::Ping(data)) => {
                    if send_tx.send(tungstenite::Message::Pong(data)).await.is_err() {
                        return Err(SignalingRuntimeError::Disconnected);
                    }
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(?skipped, "Mock receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(SignalingRuntimeError::Disconnected);
                }
            }
        }
    }
}
