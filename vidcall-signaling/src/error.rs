use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error(transparent)]
    Runtime(#[from] SignalingRuntimeError),
    #[error("signaling protocol error: {0}")]
    ProtocolError(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportFailureReason {
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("failed to send: {0}")]
    Send(String),
    #[error("failed to receive: {0}")]
    Receive(String),
    #[error("failed to close: {0}")]
    Close(String),
}

/// Errors occurring while a connection to the relay is (or should be) established.
///
/// These are cloneable so they can be broadcast as [`crate::client::SignalingEvent::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingRuntimeError {
    #[error("disconnected")]
    Disconnected,
    #[error("transport error: {0}")]
    Transport(TransportFailureReason),
    #[error("serialization error: {0}")]
    SerializationError(String),
    #[error("send queue full")]
    SendQueueFull,
    #[error("reconnect failed: {0}")]
    ReconnectFailed(String),
}

impl SignalingRuntimeError {
    /// Whether the connection to the relay is gone after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SignalingRuntimeError::Disconnected
                | SignalingRuntimeError::Transport(_)
                | SignalingRuntimeError::ReconnectFailed(_)
        )
    }

    /// Whether a fresh connection attempt makes sense after this error.
    pub fn can_reconnect(&self) -> bool {
        matches!(
            self,
            SignalingRuntimeError::Disconnected
                | SignalingRuntimeError::Transport(
                    TransportFailureReason::Send(_) | TransportFailureReason::Receive(_)
                )
        )
    }
}
