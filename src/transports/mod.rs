//! Upstream transport implementations

pub mod channel;
pub mod replay;
pub mod websocket;

pub use channel::{ChannelConnection, ChannelConnector, ChannelHandle};
pub use replay::{ReplayConnection, ReplayConnector};
pub use websocket::{WebSocketConnection, WebSocketConnector};
