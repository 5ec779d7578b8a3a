use crate::error::{SignalingError, SignalingRuntimeError, TransportFailureReason};
use crate::transport::{SignalingReceiver, SignalingSender, SignalingTransport};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite};
use vidcall_protocol::ws::SignalingMessage;

pub const DEFAULT_HEARTBEAT_PING_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_HEARTBEAT_PONG_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport to a relay.
///
/// A quiet connection is pinged; if nothing at all comes back within the pong
/// timeout the connection is reported as [`SignalingRuntimeError::Disconnected`].
#[derive(Debug, Clone)]
pub struct TokioTransport {
    url: String,
    ping_interval: Duration,
    pong_timeout: Duration,
}

impl TokioTransport {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ping_interval: DEFAULT_HEARTBEAT_PING_INTERVAL,
            pong_timeout: DEFAULT_HEARTBEAT_PONG_TIMEOUT,
        }
    }

    pub fn with_heartbeat(mut self, ping_interval: Duration, pong_timeout: Duration) -> Self {
        self.ping_interval = ping_interval;
        self.pong_timeout = pong_timeout;
        self
    }
}

#[async_trait]
impl SignalingTransport for TokioTransport {
    type Sender = TokioSender;
    type Receiver = TokioReceiver;

    #[tracing::instrument(level = "info", skip(self), fields(url = %self.url), err)]
    async fn connect(&self) -> Result<(Self::Sender, Self::Receiver), SignalingError> {
        tracing::info!("Connecting to relay");
        let (websocket_stream, response) = tokio_tungstenite::connect_async(&self.url)
            .await
            .map_err(|err| {
                tracing::error!(?err, "Failed to connect to relay");
                SignalingRuntimeError::Transport(TransportFailureReason::Connect(err.to_string()))
            })?;
        tracing::debug!(status = ?response.status(), "WebSocket handshake completed");

        let (websocket_tx, websocket_rx) = websocket_stream.split();
        Ok((
            TokioSender { websocket_tx },
            TokioReceiver::new(websocket_rx, self.ping_interval, self.pong_timeout),
        ))
    }
}

pub struct TokioSender {
    websocket_tx: SplitSink<WsStream, tungstenite::Message>,
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
        let goodbye = tungstenite::Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "leaving".into(),
        }));
        if let Err(err) = self.websocket_tx.send(goodbye).await {
            tracing::debug!(?err, "Relay did not take the close frame");
        }

        self.websocket_tx.close().await.map_err(|err| {
            tracing::warn!(?err, "Failed to close WebSocket connection");
            SignalingRuntimeError::Transport(TransportFailureReason::Close(err.to_string()))
        })
    }
}

pub struct TokioReceiver {
    websocket_rx: SplitStream<WsStream>,
    heartbeat: Heartbeat,
    ticker: Interval,
}

impl TokioReceiver {
    fn new(
        websocket_rx: SplitStream<WsStream>,
        ping_interval: Duration,
        pong_timeout: Duration,
    ) -> Self {
        // Tick often enough to notice both a quiet connection and a missing pong in time.
        let period = (ping_interval.min(pong_timeout) / 2).max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            websocket_rx,
            heartbeat: Heartbeat::new(ping_interval, pong_timeout, Instant::now()),
            ticker,
        }
    }

    /// Turns one WebSocket frame into an envelope, or `None` for frames carrying no envelope.
    async fn decode(
        frame: tungstenite::Message,
        send_tx: &mpsc::Sender<tungstenite::Message>,
    ) -> Result<Option<SignalingMessage>, SignalingRuntimeError> {
        let text = match frame {
            tungstenite::Message::Text(text) => text.as_str().to_string(),
            // Envelopes are JSON; some relays forward them as binary frames.
            tungstenite::Message::Binary(data) => String::from_utf8(data.to_vec()).map_err(|err| {
                SignalingRuntimeError::SerializationError(err.to_string())
            })?,
            tungstenite::Message::Ping(data) => {
                send_tx
                    .send(tungstenite::Message::Pong(data))
                    .await
                    .map_err(|_| SignalingRuntimeError::Disconnected)?;
                return Ok(None);
            }
            tungstenite::Message::Pong(_) | tungstenite::Message::Frame(_) => return Ok(None),
            tungstenite::Message::Close(frame) => {
                tracing::info!(?frame, "Relay closed the connection");
                return Err(SignalingRuntimeError::Disconnected);
            }
        };

        SignalingMessage::deserialize(&text)
            .map(Some)
            .map_err(|err| {
                tracing::warn!(?err, "Received malformed envelope");
                SignalingRuntimeError::SerializationError(err.to_string())
            })
    }
}

#[async_trait]
impl SignalingReceiver for TokioReceiver {
    #[tracing::instrument(level = "trace", skip_all, err)]
    async fn recv(
        &mut self,
        send_tx: &mpsc::Sender<tungstenite::Message>,
    ) -> Result<SignalingMessage, SignalingRuntimeError> {
        loop {
            tokio::select! {
                frame = self.websocket_rx.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(err)) => {
                            tracing::warn!(?err, "Failed to read from relay");
                            return Err(SignalingRuntimeError::Transport(
                                TransportFailureReason::Receive(err.to_string()),
                            ));
                        }
                        None => {
                            tracing::warn!("Relay connection ended");
                            return Err(SignalingRuntimeError::Disconnected);
                        }
                    };

                    self.heartbeat.alive(Instant::now());
                    if let Some(msg) = Self::decode(frame, send_tx).await? {
                        return Ok(msg);
                    }
                }
                _ = self.ticker.tick() => match self.heartbeat.check(Instant::now()) {
                    Beat::Quiet => {}
                    Beat::Ping => {
                        tracing::trace!("Pinging quiet relay connection");
                        let ping = tungstenite::Message::Ping(tungstenite::Bytes::new());
                        if send_tx.send(ping).await.is_err() {
                            return Err(SignalingRuntimeError::Disconnected);
                        }
                    }
                    Beat::Dead => {
                        tracing::warn!("Relay did not answer heartbeat");
                        return Err(SignalingRuntimeError::Disconnected);
                    }
                },
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Beat {
    Quiet,
    Ping,
    Dead,
}

/// Liveness bookkeeping of one relay connection. Any inbound frame counts as a sign of life.
#[derive(Debug)]
struct Heartbeat {
    ping_interval: Duration,
    pong_timeout: Duration,
    last_seen: Instant,
    ping_sent: Option<Instant>,
}

impl Heartbeat {
    fn new(ping_interval: Duration, pong_timeout: Duration, now: Instant) -> Self {
        Self {
            ping_interval,
            pong_timeout,
            last_seen: now,
            ping_sent: None,
        }
    }

    fn alive(&mut self, now: Instant) {
        self.last_seen = now;
        self.ping_sent = None;
    }

    fn check(&mut self, now: Instant) -> Beat {
        match self.ping_sent {
            Some(sent) if now.duration_since(sent) >= self.pong_timeout => Beat::Dead,
            Some(_) => Beat::Quiet,
            None if now.duration_since(self.last_seen) >= self.ping_interval => {
                self.ping_sent = Some(now);
                Beat::Ping
            }
            None => Beat::Quiet,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const INTERVAL: Duration = Duration::from_secs(15);
    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn busy_connection_is_not_pinged() {
        let start = Instant::now();
        let mut heartbeat = Heartbeat::new(INTERVAL, TIMEOUT, start);

        heartbeat.alive(start + Duration::from_secs(10));
        assert_eq!(heartbeat.check(start + Duration::from_secs(20)), Beat::Quiet);
    }

    #[test]
    fn quiet_connection_is_pinged_once() {
        let start = Instant::now();
        let mut heartbeat = Heartbeat::new(INTERVAL, TIMEOUT, start);

        assert_eq!(heartbeat.check(start + INTERVAL), Beat::Ping);
        assert_eq!(heartbeat.check(start + INTERVAL + Duration::from_secs(1)), Beat::Quiet);
    }

    #[test]
    fn missing_pong_is_fatal() {
        let start = Instant::now();
        let mut heartbeat = Heartbeat::new(INTERVAL, TIMEOUT, start);

        assert_eq!(heartbeat.check(start + INTERVAL), Beat::Ping);
        assert_eq!(heartbeat.check(start + INTERVAL + TIMEOUT), Beat::Dead);
    }

    #[test]
    fn traffic_after_ping_keeps_connection() {
        let start = Instant::now();
        let mut heartbeat = Heartbeat::new(INTERVAL, TIMEOUT, start);

        assert_eq!(heartbeat.check(start + INTERVAL), Beat::Ping);
        heartbeat.alive(start + INTERVAL + Duration::from_secs(1));
        assert_eq!(heartbeat.check(start + INTERVAL + TIMEOUT), Beat::Quiet);
    }
}
