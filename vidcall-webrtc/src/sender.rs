use crate::media::EncodedFrame;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, instrument};
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Forwards encoded frames from the capture layer to a local track.
///
/// Frames arriving while the track is disabled are dropped, so a muted track stays negotiated
/// but carries no media.
pub struct Sender {
    shutdown_tx: watch::Sender<()>,
    task: JoinHandle<()>,
}

impl Sender {
    #[instrument(level = "trace", skip_all)]
    pub(crate) fn new(
        track: Arc<TrackLocalStaticSample>,
        enabled: Arc<AtomicBool>,
        frame_duration: Duration,
        mut input_rx: mpsc::Receiver<EncodedFrame>,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(());

        let task = tokio::runtime::Handle::current().spawn(
            async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => {
                            tracing::trace!("Shutdown signalled, stopping sending");
                            break;
                        }
                        frame = input_rx.recv() => {
                            let Some(frame) = frame else {
                                tracing::trace!("Input closed, stopping sending");
                                break;
                            };

                            if !enabled.load(Ordering::SeqCst) {
                                continue;
                            }

                            let sample = Sample {
                                data: frame,
                                duration: frame_duration,
                                ..Default::default()
                            };
                            if let Err(err) = track.write_sample(&sample).await {
                                tracing::warn!(?err, "Failed to write sample to track");
                            }
                        }
                    }
                }
            }
            .instrument(tracing::Span::current()),
        );

        Self { shutdown_tx, task }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    #[instrument(level = "trace", skip(self), err)]
    pub async fn stop(self) -> Result<()> {
        self.shutdown();
        tracing::trace!("Waiting for sender task to finish");
        self.task.await.context("Failed to join sender task")
    }
}
