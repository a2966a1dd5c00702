//! The WebSocket signaling surface: wire protocol and session lifecycle.

pub mod protocol;
pub mod session;

pub use protocol::{
    ClientCommand, ServerEvent, DEFAULT_CHANNEL, FROM_CHANNEL, FROM_SERVER, TARGET_ALL,
};
pub use session::ws_handler;
