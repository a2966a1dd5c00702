//! Channel/connection registry: the authoritative live state mutated by
//! every subscribe/publish/unpublish/disconnect event.

mod channel;
mod connections;

pub use channel::{Channel, ChannelStatus, StreamParams};
pub use connections::{
    ConnectionRecord, ConnectionRegistry, PeerInfo, PeerRole, PeerSender,
};
