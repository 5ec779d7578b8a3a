use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::broadcast;

/// Waits on a broadcast receiver for the first item matching a predicate.
#[async_trait]
pub trait RecvWithTimeoutExt<T> {
    async fn recv_with_timeout<F>(&mut self, timeout: Duration, predicate: F) -> anyhow::Result<T>
    where
        F: Fn(&T) -> bool + Send;
}

#[async_trait]
impl<T: Clone + Send + 'static> RecvWithTimeoutExt<T> for broadcast::Receiver<T> {
    async fn recv_with_timeout<F>(&mut self, timeout: Duration, predicate: F) -> anyhow::Result<T>
    where
        F: Fn(&T) -> bool + Send,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.recv()).await {
                Ok(Ok(item)) if predicate(&item) => return Ok(item),
                Ok(Ok(_)) => continue,
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => return Err(anyhow::anyhow!("Timeout")),
            }
        }
    }
}
