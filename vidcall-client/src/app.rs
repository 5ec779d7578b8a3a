use crate::adapters::WebrtcConnector;
use crate::call::{CallHandle, CallSession, SessionConfig};
use crate::config::{AppConfig, REMOTE_FRAME_BUFFER_SIZE};
use anyhow::Context;
use std::collections::HashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use vidcall_signaling::client::{SignalingClient, SignalingEvent};
use vidcall_signaling::transport::SignalingTransport;
use vidcall_webrtc::{MediaSource, RemoteFrame, TrackKind};

/// A running endpoint: relay connection, call session and the tasks gluing them together.
pub struct App<ST: SignalingTransport> {
    handle: CallHandle,
    signaling: SignalingClient<ST>,
    shutdown_token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl<ST: SignalingTransport> App<ST> {
    /// Acquires local media, starts the call session and connects to the relay.
    ///
    /// Missing media is not fatal here; calls will fail with `MediaUnavailable` instead.
    pub async fn start(
        config: &AppConfig,
        transport: ST,
        shutdown_token: CancellationToken,
    ) -> anyhow::Result<Self> {
        let media = match MediaSource::acquire(&config.media) {
            Ok(media) => Some(media),
            Err(err) => {
                tracing::warn!(?err, "Failed to acquire local media, calls will not be possible");
                None
            }
        };

        let (remote_tx, remote_rx) = mpsc::channel(REMOTE_FRAME_BUFFER_SIZE);
        let mut tasks = vec![spawn_remote_sink(remote_rx, shutdown_token.clone())];

        let signaling = SignalingClient::new(
            transport,
            config.identity.clone(),
            shutdown_token.clone(),
            config.signaling.reconnect_max_tries,
            &tokio::runtime::Handle::current(),
        );

        let connector = WebrtcConnector::new(config.ice.clone(), media.clone(), Some(remote_tx));
        let handle = CallSession::spawn(
            SessionConfig {
                identity: config.identity.clone(),
                ring_timeout: config.call.ring_timeout(),
                event_channel_size: config.call.event_channel_size,
            },
            connector,
            signaling.clone(),
            media,
            shutdown_token.clone(),
            &tokio::runtime::Handle::current(),
        );

        // Subscribe before connecting, the first roster arrives right after joining.
        tasks.push(spawn_signaling_bridge(
            &signaling,
            handle.clone(),
            shutdown_token.clone(),
        ));

        signaling
            .connect()
            .await
            .with_context(|| format!("Failed to connect to relay as {}", config.identity))?;
        tracing::info!(identity = %config.identity, "Connected to relay");

        Ok(Self {
            handle,
            signaling,
            shutdown_token,
            tasks,
        })
    }

    pub fn handle(&self) -> &CallHandle {
        &self.handle
    }

    /// Hangs up, leaves the relay and waits for the background tasks.
    pub async fn shutdown(self) {
        if let Err(err) = self.handle.end_call().await {
            tracing::debug!(?err, "Failed to hang up during shutdown");
        }
        self.signaling.disconnect().await;
        self.shutdown_token.cancel();

        for task in self.tasks {
            if let Err(err) = task.await {
                tracing::warn!(?err, "Background task failed");
            }
        }
        tracing::debug!("App shut down");
    }
}

/// Forwards every message received from the relay to the call session.
pub fn spawn_signaling_bridge<ST: SignalingTransport>(
    client: &SignalingClient<ST>,
    handle: CallHandle,
    shutdown_token: CancellationToken,
) -> JoinHandle<()> {
    let mut events_rx = client.subscribe();

    tokio::spawn(
        async move {
            tracing::trace!("Signaling bridge started");
            loop {
                let event = tokio::select! {
                    biased;
                    _ = shutdown_token.cancelled() => break,
                    event = events_rx.recv() => event,
                };

                match event {
                    Ok(SignalingEvent::Message(msg)) => {
                        if handle.deliver(msg).await.is_err() {
                            tracing::debug!("Call session is gone");
                            break;
                        }
                    }
                    Ok(SignalingEvent::Joined { id }) => {
                        tracing::info!(%id, "Joined relay");
                    }
                    Ok(SignalingEvent::Error(err)) => {
                        tracing::warn!(?err, "Signaling error");
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(?skipped, "Signaling bridge lagged, messages were lost");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            tracing::trace!("Signaling bridge finished");
        }
        .instrument(tracing::info_span!("signaling_bridge")),
    )
}

/// Drains remote media. Rendering and playback live outside this crate, so frames are only counted.
fn spawn_remote_sink(
    mut remote_rx: mpsc::Receiver<RemoteFrame>,
    shutdown_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut received: HashMap<TrackKind, u64> = HashMap::new();
        loop {
            let frame = tokio::select! {
                biased;
                _ = shutdown_token.cancelled() => break,
                frame = remote_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            let count = received.entry(frame.kind).or_default();
            *count += 1;
            if *count == 1 {
                tracing::debug!(kind = %frame.kind, "Receiving remote media");
            }
        }
        tracing::trace!(?received, "Remote media sink finished");
    })
}
