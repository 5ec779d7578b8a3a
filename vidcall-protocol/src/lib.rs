#[cfg(feature = "ws")]
pub mod ws;

#[cfg(feature = "ws")]
pub use ws::SignalingMessage;
