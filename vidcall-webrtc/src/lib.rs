pub mod config;
pub mod error;
mod media;
mod peer;
mod receiver;
mod sender;

pub use media::{EncodedFrame, LocalTrack, MediaSource, RemoteFrame, TrackKind};
pub use peer::Peer;
pub use peer::PeerConnectionState;
pub use peer::PeerEvent;
pub use receiver::Receiver;
pub use sender::Sender;
