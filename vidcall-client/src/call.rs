pub mod candidates;
pub mod event;
mod handle;
pub mod peer;
mod session;
pub mod state;

pub use event::CallEvent;
pub use handle::CallHandle;
pub use peer::{CallPeer, EnvelopeSink, LocalMedia, PeerConnector};
pub use session::{CallSession, CallStatus, SessionConfig};
pub use state::{CallState, Role};
